//! Structural equality over expressions.
//!
//! Type slots are compared by a caller-supplied oracle and binders by a
//! [`VarOracle`], so the same walk serves syntactic comparison and
//! comparison up to renaming of bound variables. Names and locations of
//! nodes are ignored.

use liquidity_types::{eq_signature, eq_types};

use crate::{Constructor, ContractCode, Exp, ExpDesc, LoopAcc, MatchCase, Pattern};

/// Decides when two variable names denote the same variable.
pub trait VarOracle {
    /// Enter a scope binding `left` on one side and `right` on the other.
    /// Returns `false` (and binds nothing) if the pair is not acceptable.
    fn bind(&mut self, left: &str, right: &str) -> bool;

    /// Leave the innermost scope entered with a successful [`bind`](Self::bind).
    fn unbind(&mut self);

    fn same(&self, left: &str, right: &str) -> bool;
}

/// Binders and variables must be spelled identically.
#[derive(Debug, Clone, Copy, Default)]
pub struct Literal;

impl VarOracle for Literal {
    fn bind(&mut self, left: &str, right: &str) -> bool {
        left == right
    }

    fn unbind(&mut self) {}

    fn same(&self, left: &str, right: &str) -> bool {
        left == right
    }
}

/// Bound variables may be renamed consistently; free variables must match.
#[derive(Debug, Clone, Default)]
pub struct Renaming {
    scopes: Vec<(String, String)>,
}

impl Renaming {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VarOracle for Renaming {
    fn bind(&mut self, left: &str, right: &str) -> bool {
        self.scopes.push((left.to_string(), right.to_string()));
        true
    }

    fn unbind(&mut self) {
        self.scopes.pop();
    }

    fn same(&self, left: &str, right: &str) -> bool {
        match self
            .scopes
            .iter()
            .rev()
            .find(|(l, r)| l == left || r == right)
        {
            Some((l, r)) => l == left && r == right,
            None => left == right,
        }
    }
}

/// Compare ignoring type slots, up to renaming of bound variables.
pub fn eq_exp_modulo_renaming<T, S>(e1: &Exp<T, S>, e2: &Exp<T, S>) -> bool {
    eq_exp(e1, e2, &|_: &T, _: &T| true, &mut Renaming::new())
}

/// Structural equality. Every pair of node kinds is handled explicitly.
pub fn eq_exp<T, S, V: VarOracle>(
    e1: &Exp<T, S>,
    e2: &Exp<T, S>,
    eq_ty: &impl Fn(&T, &T) -> bool,
    vars: &mut V,
) -> bool {
    eq_ty(&e1.ty, &e2.ty) && Cmp { eq_ty, vars }.desc(e1.desc(), e2.desc())
}

struct Cmp<'o, F, V> {
    eq_ty: &'o F,
    vars: &'o mut V,
}

impl<F, V: VarOracle> Cmp<'_, F, V> {
    fn exp<T, S>(&mut self, e1: &Exp<T, S>, e2: &Exp<T, S>) -> bool
    where
        F: Fn(&T, &T) -> bool,
    {
        (self.eq_ty)(&e1.ty, &e2.ty) && self.desc(e1.desc(), e2.desc())
    }

    fn exps<T, S>(&mut self, l1: &[Exp<T, S>], l2: &[Exp<T, S>]) -> bool
    where
        F: Fn(&T, &T) -> bool,
    {
        l1.len() == l2.len() && l1.iter().zip(l2).all(|(a, b)| self.exp(a, b))
    }

    /// Compare `b1` and `b2` with the binder pairs in scope.
    fn under<T, S>(&mut self, binders: &[(&str, &str)], b1: &Exp<T, S>, b2: &Exp<T, S>) -> bool
    where
        F: Fn(&T, &T) -> bool,
    {
        let mut entered = 0;
        let mut ok = true;
        for (l, r) in binders {
            if self.vars.bind(l, r) {
                entered += 1;
            } else {
                ok = false;
                break;
            }
        }
        let result = ok && self.exp(b1, b2);
        for _ in 0..entered {
            self.vars.unbind();
        }
        result
    }

    fn case<T, S>(&mut self, c1: &MatchCase<T, S>, c2: &MatchCase<T, S>) -> bool
    where
        F: Fn(&T, &T) -> bool,
    {
        match (&c1.pattern, &c2.pattern) {
            (Pattern::Any, Pattern::Any) => self.exp(&c1.body, &c2.body),
            (Pattern::Constr(k1, vs1), Pattern::Constr(k2, vs2)) => {
                k1 == k2 && vs1.len() == vs2.len() && {
                    let binders: Vec<(&str, &str)> = vs1
                        .iter()
                        .zip(vs2)
                        .map(|(a, b)| (a.as_str(), b.as_str()))
                        .collect();
                    self.under(&binders, &c1.body, &c2.body)
                }
            }
            (Pattern::Any | Pattern::Constr(_, _), _) => false,
        }
    }

    fn acc<T, S>(&mut self, a1: &Option<LoopAcc<T, S>>, a2: &Option<LoopAcc<T, S>>) -> bool
    where
        F: Fn(&T, &T) -> bool,
    {
        match (a1, a2) {
            (None, None) => true,
            (Some(a1), Some(a2)) => self.exp(&a1.init, &a2.init),
            (None | Some(_), _) => false,
        }
    }

    fn contract<T, S>(&mut self, c1: &ContractCode<T, S>, c2: &ContractCode<T, S>) -> bool
    where
        F: Fn(&T, &T) -> bool,
    {
        eq_types(&c1.parameter, &c2.parameter)
            && eq_types(&c1.storage, &c2.storage)
            && self.under(
                &[("parameter", "parameter"), ("storage", "storage")],
                &c1.code,
                &c2.code,
            )
    }

    fn desc<T, S>(&mut self, d1: &ExpDesc<T, S>, d2: &ExpDesc<T, S>) -> bool
    where
        F: Fn(&T, &T) -> bool,
    {
        use ExpDesc as D;
        match (d1, d2) {
            (
                D::Let {
                    bnd_var: x1,
                    bnd_val: v1,
                    body: b1,
                    ..
                },
                D::Let {
                    bnd_var: x2,
                    bnd_val: v2,
                    body: b2,
                    ..
                },
            ) => self.exp(v1, v2) && self.under(&[(x1.as_str(), x2.as_str())], b1, b2),
            (D::Var(x1), D::Var(x2)) => self.vars.same(x1, x2),
            (
                D::SetField {
                    record: r1,
                    field: f1,
                    set_val: v1,
                },
                D::SetField {
                    record: r2,
                    field: f2,
                    set_val: v2,
                },
            ) => f1 == f2 && self.exp(r1, r2) && self.exp(v1, v2),
            (
                D::Project {
                    field: f1,
                    record: r1,
                },
                D::Project {
                    field: f2,
                    record: r2,
                },
            ) => f1 == f2 && self.exp(r1, r2),
            (D::Const { ty: t1, value: c1 }, D::Const { ty: t2, value: c2 }) => {
                eq_types(t1, t2) && c1 == c2
            }
            (D::Apply { prim: p1, args: a1 }, D::Apply { prim: p2, args: a2 }) => {
                p1 == p2 && self.exps(a1, a2)
            }
            (
                D::If {
                    cond: c1,
                    ifthen: t1,
                    ifelse: e1,
                },
                D::If {
                    cond: c2,
                    ifthen: t2,
                    ifelse: e2,
                },
            ) => self.exp(c1, c2) && self.exp(t1, t2) && self.exp(e1, e2),
            (D::Seq(a1, b1), D::Seq(a2, b2)) => self.exp(a1, a2) && self.exp(b1, b2),
            (
                D::Transfer {
                    dest: d1,
                    amount: m1,
                    entry: n1,
                    arg: a1,
                },
                D::Transfer {
                    dest: d2,
                    amount: m2,
                    entry: n2,
                    arg: a2,
                },
            ) => n1 == n2 && self.exp(d1, d2) && self.exp(m1, m2) && self.exp(a1, a2),
            (D::Failwith(a1), D::Failwith(a2)) => self.exp(a1, a2),
            (
                D::MatchOption {
                    arg: a1,
                    ifnone: n1,
                    some_name: s1,
                    ifsome: b1,
                },
                D::MatchOption {
                    arg: a2,
                    ifnone: n2,
                    some_name: s2,
                    ifsome: b2,
                },
            ) => self.exp(a1, a2) && self.exp(n1, n2) && self.under(&[(s1.as_str(), s2.as_str())], b1, b2),
            (
                D::MatchNat {
                    arg: a1,
                    plus_name: p1,
                    ifplus: bp1,
                    minus_name: m1,
                    ifminus: bm1,
                },
                D::MatchNat {
                    arg: a2,
                    plus_name: p2,
                    ifplus: bp2,
                    minus_name: m2,
                    ifminus: bm2,
                },
            ) => {
                self.exp(a1, a2)
                    && self.under(&[(p1.as_str(), p2.as_str())], bp1, bp2)
                    && self.under(&[(m1.as_str(), m2.as_str())], bm1, bm2)
            }
            (
                D::MatchList {
                    arg: a1,
                    head_name: h1,
                    tail_name: t1,
                    ifcons: c1,
                    ifnil: n1,
                },
                D::MatchList {
                    arg: a2,
                    head_name: h2,
                    tail_name: t2,
                    ifcons: c2,
                    ifnil: n2,
                },
            ) => {
                self.exp(a1, a2)
                    && self.under(&[(h1.as_str(), h2.as_str()), (t1.as_str(), t2.as_str())], c1, c2)
                    && self.exp(n1, n2)
            }
            (D::MatchVariant { arg: a1, cases: c1 }, D::MatchVariant { arg: a2, cases: c2 }) => {
                self.exp(a1, a2)
                    && c1.len() == c2.len()
                    && c1.iter().zip(c2).all(|(x, y)| self.case(x, y))
            }
            (
                D::Loop {
                    arg_name: x1,
                    body: b1,
                    arg: a1,
                },
                D::Loop {
                    arg_name: x2,
                    body: b2,
                    arg: a2,
                },
            ) => self.exp(a1, a2) && self.under(&[(x1.as_str(), x2.as_str())], b1, b2),
            (
                D::LoopLeft {
                    arg_name: x1,
                    body: b1,
                    arg: a1,
                    acc: acc1,
                },
                D::LoopLeft {
                    arg_name: x2,
                    body: b2,
                    arg: a2,
                    acc: acc2,
                },
            ) => {
                self.exp(a1, a2) && self.acc(acc1, acc2) && {
                    let mut binders = vec![(x1.as_str(), x2.as_str())];
                    if let (Some(n1), Some(n2)) = (acc1, acc2) {
                        binders.push((n1.name.as_str(), n2.name.as_str()));
                    }
                    self.under(&binders, b1, b2)
                }
            }
            (
                D::Fold {
                    prim: p1,
                    elt_name: x1,
                    acc_name: y1,
                    body: b1,
                    arg: a1,
                    acc: c1,
                },
                D::Fold {
                    prim: p2,
                    elt_name: x2,
                    acc_name: y2,
                    body: b2,
                    arg: a2,
                    acc: c2,
                },
            ) => {
                p1 == p2
                    && self.exp(a1, a2)
                    && self.exp(c1, c2)
                    && self.under(&[(x1.as_str(), x2.as_str()), (y1.as_str(), y2.as_str())], b1, b2)
            }
            (
                D::Map {
                    prim: p1,
                    elt_name: x1,
                    body: b1,
                    arg: a1,
                },
                D::Map {
                    prim: p2,
                    elt_name: x2,
                    body: b2,
                    arg: a2,
                },
            ) => p1 == p2 && self.exp(a1, a2) && self.under(&[(x1.as_str(), x2.as_str())], b1, b2),
            (
                D::MapFold {
                    prim: p1,
                    elt_name: x1,
                    acc_name: y1,
                    body: b1,
                    arg: a1,
                    acc: c1,
                },
                D::MapFold {
                    prim: p2,
                    elt_name: x2,
                    acc_name: y2,
                    body: b2,
                    arg: a2,
                    acc: c2,
                },
            ) => {
                p1 == p2
                    && self.exp(a1, a2)
                    && self.exp(c1, c2)
                    && self.under(&[(x1.as_str(), x2.as_str()), (y1.as_str(), y2.as_str())], b1, b2)
            }
            (
                D::Lambda {
                    arg_name: x1,
                    arg_ty: t1,
                    body: b1,
                    ret_ty: r1,
                },
                D::Lambda {
                    arg_name: x2,
                    arg_ty: t2,
                    body: b2,
                    ret_ty: r2,
                },
            ) => eq_types(t1, t2) && eq_types(r1, r2) && self.under(&[(x1.as_str(), x2.as_str())], b1, b2),
            (
                D::Closure {
                    arg_name: x1,
                    arg_ty: t1,
                    call_env: env1,
                    body: b1,
                    ret_ty: r1,
                },
                D::Closure {
                    arg_name: x2,
                    arg_ty: t2,
                    call_env: env2,
                    body: b2,
                    ret_ty: r2,
                },
            ) => {
                eq_types(t1, t2)
                    && eq_types(r1, r2)
                    && env1.len() == env2.len()
                    && env1.iter().zip(env2).all(|((_, v1), (_, v2))| self.exp(v1, v2))
                    && {
                        let mut binders: Vec<(&str, &str)> = env1
                            .iter()
                            .zip(env2)
                            .map(|((n1, _), (n2, _))| (n1.as_str(), n2.as_str()))
                            .collect();
                        binders.push((x1.as_str(), x2.as_str()));
                        self.under(&binders, b1, b2)
                    }
            }
            (D::Record(f1), D::Record(f2)) => {
                f1.len() == f2.len()
                    && f1
                        .iter()
                        .zip(f2)
                        .all(|((l1, v1), (l2, v2))| l1 == l2 && self.exp(v1, v2))
            }
            (
                D::Constructor {
                    constr: k1,
                    arg: a1,
                },
                D::Constructor {
                    constr: k2,
                    arg: a2,
                },
            ) => eq_constructor(k1, k2) && self.exp(a1, a2),
            (
                D::CreateContract {
                    args: a1,
                    contract: c1,
                },
                D::CreateContract {
                    args: a2,
                    contract: c2,
                },
            ) => self.exps(a1, a2) && self.contract(c1, c2),
            (D::ContractAt { arg: a1, c_sig: s1 }, D::ContractAt { arg: a2, c_sig: s2 }) => {
                eq_signature(s1, s2) && self.exp(a1, a2)
            }
            (D::Unpack { arg: a1, ty: t1 }, D::Unpack { arg: a2, ty: t2 }) => {
                eq_types(t1, t2) && self.exp(a1, a2)
            }
            (
                D::Let { .. }
                | D::Var(_)
                | D::SetField { .. }
                | D::Project { .. }
                | D::Const { .. }
                | D::Apply { .. }
                | D::If { .. }
                | D::Seq(_, _)
                | D::Transfer { .. }
                | D::Failwith(_)
                | D::MatchOption { .. }
                | D::MatchNat { .. }
                | D::MatchList { .. }
                | D::MatchVariant { .. }
                | D::Loop { .. }
                | D::LoopLeft { .. }
                | D::Fold { .. }
                | D::Map { .. }
                | D::MapFold { .. }
                | D::Lambda { .. }
                | D::Closure { .. }
                | D::Record(_)
                | D::Constructor { .. }
                | D::CreateContract { .. }
                | D::ContractAt { .. }
                | D::Unpack { .. },
                _,
            ) => false,
        }
    }
}

fn eq_constructor(k1: &Constructor, k2: &Constructor) -> bool {
    match (k1, k2) {
        (Constructor::Constr(a), Constructor::Constr(b)) => a == b,
        (Constructor::Left(a), Constructor::Left(b)) | (Constructor::Right(a), Constructor::Right(b)) => {
            eq_types(a, b)
        }
        (Constructor::Constr(_) | Constructor::Left(_) | Constructor::Right(_), _) => false,
    }
}

#[cfg(test)]
mod tests {
    use liquidity_prims::Primitive;
    use liquidity_types::{Const, Datatype};

    use super::*;
    use crate::{Inline, SyntaxExp};

    type E = SyntaxExp;

    fn var(x: &str) -> E {
        E::var(x, ())
    }

    fn let_(x: &str, v: E, body: E) -> E {
        E::mk(
            ExpDesc::Let {
                bnd_var: x.to_string(),
                inline: Inline::Auto,
                bnd_val: Box::new(v),
                body: Box::new(body),
            },
            (),
        )
    }

    fn add(a: E, b: E) -> E {
        E::apply(Primitive::Add, vec![a, b], ())
    }

    fn one() -> E {
        E::constant(Datatype::Int, Const::int(1), ())
    }

    #[test]
    fn renamed_binders_are_equal_only_modulo_renaming() {
        let a = let_("x", one(), add(var("x"), var("z")));
        let b = let_("y", one(), add(var("y"), var("z")));
        assert!(eq_exp_modulo_renaming(&a, &b));
        assert!(!eq_exp(&a, &b, &|_: &(), _: &()| true, &mut Literal));
        assert!(eq_exp(&a, &a.clone(), &|_: &(), _: &()| true, &mut Literal));
    }

    #[test]
    fn free_variables_must_match() {
        let a = let_("x", one(), add(var("x"), var("z")));
        let b = let_("x", one(), add(var("x"), var("w")));
        assert!(!eq_exp_modulo_renaming(&a, &b));
    }

    #[test]
    fn renaming_is_a_bijection() {
        // `let x = 1 in let y = 1 in x + y` vs `let a = 1 in let b = 1 in b + a`
        let a = let_("x", one(), let_("y", one(), add(var("x"), var("y"))));
        let b = let_("a", one(), let_("b", one(), add(var("b"), var("a"))));
        assert!(!eq_exp_modulo_renaming(&a, &b));

        // Shadowing: the inner binder captures the reference.
        let c = let_("x", one(), let_("x", one(), var("x")));
        let d = let_("p", one(), let_("q", one(), var("q")));
        let e = let_("p", one(), let_("q", one(), var("p")));
        assert!(eq_exp_modulo_renaming(&c, &d));
        assert!(!eq_exp_modulo_renaming(&c, &e));
    }

    #[test]
    fn type_oracle_is_consulted() {
        let a = crate::TypedExp::var("x", Datatype::Int);
        let b = crate::TypedExp::var("x", Datatype::Nat);
        assert!(!eq_exp(&a, &b, &eq_types, &mut Literal));
        assert!(eq_exp(&a, &b, &|_: &Datatype, _: &Datatype| true, &mut Literal));
    }

    #[test]
    fn different_kinds_are_unequal() {
        assert!(!eq_exp_modulo_renaming(&var("x"), &one()));
        let seq = E::mk(ExpDesc::Seq(Box::new(one()), Box::new(one())), ());
        assert!(!eq_exp_modulo_renaming(&seq, &add(one(), one())));
    }
}
