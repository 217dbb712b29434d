//! Expression trees for Liquidity contracts.
//!
//! An [`Exp`] is parameterized by its type slot `T` (`()` before type
//! checking, [`Datatype`] after) and a stage marker `S`. Every node carries
//! two effect flags, `fails` and `transfers`. They are computed by
//! [`Exp::mk`] from the node's operator and its children and are never
//! written anywhere else; the node body is only reachable through
//! accessors, so rewriting a child means rebuilding the parent.

use std::collections::BTreeSet;
use std::marker::PhantomData;

use liquidity_diag::Location;
use liquidity_prims::{FoldPrimitive, MapFoldPrimitive, MapPrimitive, Primitive};
use liquidity_types::{Const, ContractSig, Datatype};
use serde::{Deserialize, Serialize};

mod eq;
mod print;

#[cfg(test)]
mod prop_tests;

pub use eq::{Literal, Renaming, VarOracle, eq_exp, eq_exp_modulo_renaming};

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

/// Marker for the evaluation stage of an expression tree.
pub trait Stage: std::fmt::Debug + Clone + Copy + PartialEq + Eq + Default + 'static {}

/// Trees as produced by a parser or the decompiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Syntax;

/// Trees that went through type checking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Typed;

impl Stage for Syntax {}
impl Stage for Typed {}

pub type SyntaxExp = Exp<(), Syntax>;
pub type TypedExp = Exp<Datatype, Typed>;

// ---------------------------------------------------------------------------
// Expression bodies
// ---------------------------------------------------------------------------

/// Inlining hint attached to a let-binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Inline {
    Never,
    #[default]
    Auto,
    Always,
}

/// Variant constructors. `Left` and `Right` carry the type of the other side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Constructor {
    Constr(String),
    Left(Datatype),
    Right(Datatype),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    /// Constructor applied to its bound variables.
    Constr(String, Vec<String>),
    Any,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchCase<T, S> {
    pub pattern: Pattern,
    pub body: Exp<T, S>,
}

/// Accumulator threaded through a loop-left.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopAcc<T, S> {
    pub name: String,
    pub init: Box<Exp<T, S>>,
}

/// Code of an originated contract: a body over `parameter` and `storage`
/// returning `(operation list, storage)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ContractCode<T, S> {
    pub parameter: Datatype,
    pub storage: Datatype,
    pub code: Exp<T, S>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExpDesc<T, S> {
    Let {
        bnd_var: String,
        inline: Inline,
        bnd_val: Box<Exp<T, S>>,
        body: Box<Exp<T, S>>,
    },
    Var(String),
    SetField {
        record: Box<Exp<T, S>>,
        field: String,
        set_val: Box<Exp<T, S>>,
    },
    Project {
        field: String,
        record: Box<Exp<T, S>>,
    },
    Const {
        ty: Datatype,
        value: Const,
    },
    Apply {
        prim: Primitive,
        args: Vec<Exp<T, S>>,
    },
    If {
        cond: Box<Exp<T, S>>,
        ifthen: Box<Exp<T, S>>,
        ifelse: Box<Exp<T, S>>,
    },
    Seq(Box<Exp<T, S>>, Box<Exp<T, S>>),
    Transfer {
        dest: Box<Exp<T, S>>,
        amount: Box<Exp<T, S>>,
        entry: Option<String>,
        arg: Box<Exp<T, S>>,
    },
    Failwith(Box<Exp<T, S>>),
    MatchOption {
        arg: Box<Exp<T, S>>,
        ifnone: Box<Exp<T, S>>,
        some_name: String,
        ifsome: Box<Exp<T, S>>,
    },
    /// Match on the sign of an integer: `Plus` binds it as a nat, `Minus`
    /// binds its absolute value.
    MatchNat {
        arg: Box<Exp<T, S>>,
        plus_name: String,
        ifplus: Box<Exp<T, S>>,
        minus_name: String,
        ifminus: Box<Exp<T, S>>,
    },
    MatchList {
        arg: Box<Exp<T, S>>,
        head_name: String,
        tail_name: String,
        ifcons: Box<Exp<T, S>>,
        ifnil: Box<Exp<T, S>>,
    },
    MatchVariant {
        arg: Box<Exp<T, S>>,
        cases: Vec<MatchCase<T, S>>,
    },
    /// `body` returns `(continue, state)`.
    Loop {
        arg_name: String,
        body: Box<Exp<T, S>>,
        arg: Box<Exp<T, S>>,
    },
    /// `body` returns `Left state` to continue or `Right result` to stop,
    /// paired with the accumulator when there is one.
    LoopLeft {
        arg_name: String,
        body: Box<Exp<T, S>>,
        arg: Box<Exp<T, S>>,
        acc: Option<LoopAcc<T, S>>,
    },
    Fold {
        prim: FoldPrimitive,
        elt_name: String,
        acc_name: String,
        body: Box<Exp<T, S>>,
        arg: Box<Exp<T, S>>,
        acc: Box<Exp<T, S>>,
    },
    Map {
        prim: MapPrimitive,
        elt_name: String,
        body: Box<Exp<T, S>>,
        arg: Box<Exp<T, S>>,
    },
    /// `body` returns `(new element, accumulator)`.
    MapFold {
        prim: MapFoldPrimitive,
        elt_name: String,
        acc_name: String,
        body: Box<Exp<T, S>>,
        arg: Box<Exp<T, S>>,
        acc: Box<Exp<T, S>>,
    },
    Lambda {
        arg_name: String,
        arg_ty: Datatype,
        body: Box<Exp<T, S>>,
        ret_ty: Datatype,
    },
    /// A lambda whose free variables are bound by `call_env`.
    Closure {
        arg_name: String,
        arg_ty: Datatype,
        call_env: Vec<(String, Exp<T, S>)>,
        body: Box<Exp<T, S>>,
        ret_ty: Datatype,
    },
    Record(Vec<(String, Exp<T, S>)>),
    Constructor {
        constr: Constructor,
        arg: Box<Exp<T, S>>,
    },
    CreateContract {
        args: Vec<Exp<T, S>>,
        contract: Box<ContractCode<T, S>>,
    },
    ContractAt {
        arg: Box<Exp<T, S>>,
        c_sig: ContractSig,
    },
    Unpack {
        arg: Box<Exp<T, S>>,
        ty: Datatype,
    },
}

// ---------------------------------------------------------------------------
// Expressions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Exp<T, S = Typed> {
    desc: ExpDesc<T, S>,
    pub name: Option<String>,
    pub loc: Location,
    pub ty: T,
    bv: BTreeSet<String>,
    fails: bool,
    transfers: bool,
    stage: PhantomData<S>,
}

impl<T, S> Exp<T, S> {
    /// Build a node, deriving its effect flags and bound variables.
    pub fn mk(desc: ExpDesc<T, S>, ty: T) -> Self {
        Self::mk_at(Location::unknown(), desc, ty)
    }

    pub fn mk_at(loc: Location, desc: ExpDesc<T, S>, ty: T) -> Self {
        let fails = desc_fails(&desc);
        let transfers = desc_transfers(&desc);
        let bv = desc_bound_vars(&desc);
        Self {
            desc,
            name: None,
            loc,
            ty,
            bv,
            fails,
            transfers,
            stage: PhantomData,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn desc(&self) -> &ExpDesc<T, S> {
        &self.desc
    }

    pub fn into_desc(self) -> ExpDesc<T, S> {
        self.desc
    }

    /// Evaluation can abort the whole computation.
    pub fn fails(&self) -> bool {
        self.fails
    }

    /// This very node emits a chain operation.
    pub fn transfers(&self) -> bool {
        self.transfers
    }

    /// Names bound anywhere inside this expression.
    pub fn bound_vars(&self) -> &BTreeSet<String> {
        &self.bv
    }

    // -- Shorthands --

    pub fn var(name: impl Into<String>, ty: T) -> Self {
        Self::mk(ExpDesc::Var(name.into()), ty)
    }

    pub fn constant(const_ty: Datatype, value: Const, ty: T) -> Self {
        Self::mk(
            ExpDesc::Const {
                ty: const_ty,
                value,
            },
            ty,
        )
    }

    pub fn apply(prim: Primitive, args: Vec<Exp<T, S>>, ty: T) -> Self {
        Self::mk(ExpDesc::Apply { prim, args }, ty)
    }

    /// Variables referenced but not bound inside this expression.
    pub fn free_vars(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        let mut bound = Vec::new();
        collect_free(self, &mut bound, &mut out);
        out
    }

    /// Rebuild the tree with new type slots. Flags are recomputed.
    pub fn map_ty<U, S2>(&self, f: &mut impl FnMut(&T) -> U) -> Exp<U, S2> {
        let desc = map_desc(&self.desc, f);
        let mut e = Exp::mk_at(self.loc.clone(), desc, f(&self.ty));
        e.name = self.name.clone();
        e
    }

    /// Drop type information.
    pub fn untype(&self) -> SyntaxExp {
        self.map_ty(&mut |_| ())
    }
}

impl<T: Default, S> Exp<T, S> {
    pub fn unit() -> Self {
        Self::constant(Datatype::Unit, Const::Unit, T::default())
    }
}

// ---------------------------------------------------------------------------
// Flag rules
// ---------------------------------------------------------------------------

fn any_fails<'a, T: 'a, S: 'a>(es: impl IntoIterator<Item = &'a Exp<T, S>>) -> bool {
    es.into_iter().any(|e| e.fails)
}

/// A node fails when a child it evaluates fails, or when it is a failure
/// itself. Lambda bodies and originated code are not evaluated.
fn desc_fails<T, S>(desc: &ExpDesc<T, S>) -> bool {
    match desc {
        ExpDesc::Var(_) | ExpDesc::Const { .. } | ExpDesc::Lambda { .. } => false,
        ExpDesc::Failwith(_) => true,
        ExpDesc::Let { bnd_val, body, .. } => bnd_val.fails || body.fails,
        ExpDesc::SetField {
            record, set_val, ..
        } => record.fails || set_val.fails,
        ExpDesc::Project { record, .. } => record.fails,
        ExpDesc::Apply { prim, args } => prim.can_fail() || any_fails(args),
        ExpDesc::If {
            cond,
            ifthen,
            ifelse,
        } => cond.fails || ifthen.fails || ifelse.fails,
        ExpDesc::Seq(a, b) => a.fails || b.fails,
        ExpDesc::Transfer {
            dest, amount, arg, ..
        } => dest.fails || amount.fails || arg.fails,
        ExpDesc::MatchOption {
            arg,
            ifnone,
            ifsome,
            ..
        } => arg.fails || ifnone.fails || ifsome.fails,
        ExpDesc::MatchNat {
            arg,
            ifplus,
            ifminus,
            ..
        } => arg.fails || ifplus.fails || ifminus.fails,
        ExpDesc::MatchList {
            arg, ifcons, ifnil, ..
        } => arg.fails || ifcons.fails || ifnil.fails,
        ExpDesc::MatchVariant { arg, cases } => arg.fails || any_fails(cases.iter().map(|c| &c.body)),
        ExpDesc::Loop { body, arg, .. } | ExpDesc::Map { body, arg, .. } => {
            arg.fails || body.fails
        }
        ExpDesc::LoopLeft { body, arg, acc, .. } => {
            arg.fails || body.fails || acc.as_ref().is_some_and(|a| a.init.fails)
        }
        ExpDesc::Fold { body, arg, acc, .. } | ExpDesc::MapFold { body, arg, acc, .. } => {
            arg.fails || acc.fails || body.fails
        }
        ExpDesc::Closure { call_env, .. } => any_fails(call_env.iter().map(|(_, e)| e)),
        ExpDesc::Record(fields) => any_fails(fields.iter().map(|(_, e)| e)),
        ExpDesc::Constructor { arg, .. }
        | ExpDesc::ContractAt { arg, .. }
        | ExpDesc::Unpack { arg, .. } => arg.fails,
        ExpDesc::CreateContract { args, .. } => any_fails(args),
    }
}

/// Only the emitting node itself is marked; the flag is not propagated to
/// enclosing nodes.
fn desc_transfers<T, S>(desc: &ExpDesc<T, S>) -> bool {
    match desc {
        ExpDesc::Transfer { .. } | ExpDesc::CreateContract { .. } => true,
        ExpDesc::Apply { prim, .. } => prim.transfers(),
        ExpDesc::Let { .. }
        | ExpDesc::Var(_)
        | ExpDesc::SetField { .. }
        | ExpDesc::Project { .. }
        | ExpDesc::Const { .. }
        | ExpDesc::If { .. }
        | ExpDesc::Seq(_, _)
        | ExpDesc::Failwith(_)
        | ExpDesc::MatchOption { .. }
        | ExpDesc::MatchNat { .. }
        | ExpDesc::MatchList { .. }
        | ExpDesc::MatchVariant { .. }
        | ExpDesc::Loop { .. }
        | ExpDesc::LoopLeft { .. }
        | ExpDesc::Fold { .. }
        | ExpDesc::Map { .. }
        | ExpDesc::MapFold { .. }
        | ExpDesc::Lambda { .. }
        | ExpDesc::Closure { .. }
        | ExpDesc::Record(_)
        | ExpDesc::Constructor { .. }
        | ExpDesc::ContractAt { .. }
        | ExpDesc::Unpack { .. } => false,
    }
}

fn desc_bound_vars<T, S>(desc: &ExpDesc<T, S>) -> BTreeSet<String> {
    let mut bv = BTreeSet::new();
    let mut binders: Vec<&str> = Vec::new();
    for child in children(desc) {
        bv.extend(child.bv.iter().cloned());
    }
    match desc {
        ExpDesc::Let { bnd_var, .. } => binders.push(bnd_var),
        ExpDesc::MatchOption { some_name, .. } => binders.push(some_name),
        ExpDesc::MatchNat {
            plus_name,
            minus_name,
            ..
        } => binders.extend([plus_name.as_str(), minus_name.as_str()]),
        ExpDesc::MatchList {
            head_name,
            tail_name,
            ..
        } => binders.extend([head_name.as_str(), tail_name.as_str()]),
        ExpDesc::MatchVariant { cases, .. } => {
            for case in cases {
                if let Pattern::Constr(_, vars) = &case.pattern {
                    binders.extend(vars.iter().map(String::as_str));
                }
            }
        }
        ExpDesc::Loop { arg_name, .. }
        | ExpDesc::Map {
            elt_name: arg_name,
            ..
        }
        | ExpDesc::Lambda { arg_name, .. } => binders.push(arg_name),
        ExpDesc::LoopLeft { arg_name, acc, .. } => {
            binders.push(arg_name);
            if let Some(acc) = acc {
                binders.push(&acc.name);
            }
        }
        ExpDesc::Fold {
            elt_name, acc_name, ..
        }
        | ExpDesc::MapFold {
            elt_name, acc_name, ..
        } => binders.extend([elt_name.as_str(), acc_name.as_str()]),
        ExpDesc::Closure {
            arg_name, call_env, ..
        } => {
            binders.push(arg_name);
            binders.extend(call_env.iter().map(|(n, _)| n.as_str()));
        }
        _ => {}
    }
    bv.extend(binders.into_iter().map(str::to_string));
    bv
}

/// Direct sub-expressions in evaluation order. Includes lambda bodies and
/// originated contract code.
pub fn children<T, S>(desc: &ExpDesc<T, S>) -> Vec<&Exp<T, S>> {
    match desc {
        ExpDesc::Var(_) | ExpDesc::Const { .. } => vec![],
        ExpDesc::Let { bnd_val, body, .. } => vec![&**bnd_val, &**body],
        ExpDesc::SetField {
            record, set_val, ..
        } => vec![&**record, &**set_val],
        ExpDesc::Project { record, .. } => vec![&**record],
        ExpDesc::Apply { args, .. } => args.iter().collect(),
        ExpDesc::If {
            cond,
            ifthen,
            ifelse,
        } => vec![&**cond, &**ifthen, &**ifelse],
        ExpDesc::Seq(a, b) => vec![&**a, &**b],
        ExpDesc::Transfer {
            dest, amount, arg, ..
        } => vec![&**dest, &**amount, &**arg],
        ExpDesc::Failwith(e) => vec![&**e],
        ExpDesc::MatchOption {
            arg,
            ifnone,
            ifsome,
            ..
        } => vec![&**arg, &**ifnone, &**ifsome],
        ExpDesc::MatchNat {
            arg,
            ifplus,
            ifminus,
            ..
        } => vec![&**arg, &**ifplus, &**ifminus],
        ExpDesc::MatchList {
            arg, ifcons, ifnil, ..
        } => vec![&**arg, &**ifcons, &**ifnil],
        ExpDesc::MatchVariant { arg, cases } => std::iter::once(&**arg)
            .chain(cases.iter().map(|c| &c.body))
            .collect(),
        ExpDesc::Loop { body, arg, .. } | ExpDesc::Map { body, arg, .. } => vec![&**arg, &**body],
        ExpDesc::LoopLeft { body, arg, acc, .. } => {
            let mut v: Vec<&Exp<T, S>> = vec![&**arg];
            if let Some(acc) = acc {
                v.push(&acc.init);
            }
            v.push(body);
            v
        }
        ExpDesc::Fold { body, arg, acc, .. } | ExpDesc::MapFold { body, arg, acc, .. } => {
            vec![&**arg, &**acc, &**body]
        }
        ExpDesc::Lambda { body, .. } => vec![&**body],
        ExpDesc::Closure { call_env, body, .. } => call_env
            .iter()
            .map(|(_, e)| e)
            .chain(std::iter::once(&**body))
            .collect(),
        ExpDesc::Record(fields) => fields.iter().map(|(_, e)| e).collect(),
        ExpDesc::Constructor { arg, .. }
        | ExpDesc::ContractAt { arg, .. }
        | ExpDesc::Unpack { arg, .. } => vec![&**arg],
        ExpDesc::CreateContract { args, contract } => args
            .iter()
            .chain(std::iter::once(&contract.code))
            .collect(),
    }
}

// ---------------------------------------------------------------------------
// Free variables
// ---------------------------------------------------------------------------

fn under<'a, T, S>(
    names: &[&'a str],
    body: &'a Exp<T, S>,
    bound: &mut Vec<&'a str>,
    out: &mut BTreeSet<String>,
) {
    let depth = bound.len();
    bound.extend_from_slice(names);
    collect_free(body, bound, out);
    bound.truncate(depth);
}

fn collect_free<'a, T, S>(e: &'a Exp<T, S>, bound: &mut Vec<&'a str>, out: &mut BTreeSet<String>) {
    match &e.desc {
        ExpDesc::Var(name) => {
            if !bound.contains(&name.as_str()) {
                out.insert(name.clone());
            }
        }
        ExpDesc::Let {
            bnd_var,
            bnd_val,
            body,
            ..
        } => {
            collect_free(bnd_val, bound, out);
            under(&[bnd_var.as_str()], body, bound, out);
        }
        ExpDesc::MatchOption {
            arg,
            ifnone,
            some_name,
            ifsome,
        } => {
            collect_free(arg, bound, out);
            collect_free(ifnone, bound, out);
            under(&[some_name.as_str()], ifsome, bound, out);
        }
        ExpDesc::MatchNat {
            arg,
            plus_name,
            ifplus,
            minus_name,
            ifminus,
        } => {
            collect_free(arg, bound, out);
            under(&[plus_name.as_str()], ifplus, bound, out);
            under(&[minus_name.as_str()], ifminus, bound, out);
        }
        ExpDesc::MatchList {
            arg,
            head_name,
            tail_name,
            ifcons,
            ifnil,
        } => {
            collect_free(arg, bound, out);
            under(&[head_name.as_str(), tail_name.as_str()], ifcons, bound, out);
            collect_free(ifnil, bound, out);
        }
        ExpDesc::MatchVariant { arg, cases } => {
            collect_free(arg, bound, out);
            for case in cases {
                let names: Vec<&str> = match &case.pattern {
                    Pattern::Constr(_, vars) => vars.iter().map(String::as_str).collect(),
                    Pattern::Any => vec![],
                };
                under(&names, &case.body, bound, out);
            }
        }
        ExpDesc::Loop {
            arg_name,
            body,
            arg,
        }
        | ExpDesc::Map {
            elt_name: arg_name,
            body,
            arg,
            ..
        } => {
            collect_free(arg, bound, out);
            under(&[arg_name.as_str()], body, bound, out);
        }
        ExpDesc::LoopLeft {
            arg_name,
            body,
            arg,
            acc,
        } => {
            collect_free(arg, bound, out);
            match acc {
                Some(acc) => {
                    collect_free(&acc.init, bound, out);
                    under(&[arg_name.as_str(), acc.name.as_str()], body, bound, out);
                }
                None => under(&[arg_name.as_str()], body, bound, out),
            }
        }
        ExpDesc::Fold {
            elt_name,
            acc_name,
            body,
            arg,
            acc,
            ..
        }
        | ExpDesc::MapFold {
            elt_name,
            acc_name,
            body,
            arg,
            acc,
            ..
        } => {
            collect_free(arg, bound, out);
            collect_free(acc, bound, out);
            under(&[elt_name.as_str(), acc_name.as_str()], body, bound, out);
        }
        ExpDesc::Lambda { arg_name, body, .. } => under(&[arg_name.as_str()], body, bound, out),
        ExpDesc::Closure {
            arg_name,
            call_env,
            body,
            ..
        } => {
            let mut names: Vec<&str> = vec![arg_name.as_str()];
            for (name, value) in call_env {
                collect_free(value, bound, out);
                names.push(name);
            }
            under(&names, body, bound, out);
        }
        ExpDesc::CreateContract { args, contract } => {
            for arg in args {
                collect_free(arg, bound, out);
            }
            under(&["parameter", "storage"], &contract.code, bound, out);
        }
        ExpDesc::SetField { .. }
        | ExpDesc::Project { .. }
        | ExpDesc::Const { .. }
        | ExpDesc::Apply { .. }
        | ExpDesc::If { .. }
        | ExpDesc::Seq(_, _)
        | ExpDesc::Transfer { .. }
        | ExpDesc::Failwith(_)
        | ExpDesc::Record(_)
        | ExpDesc::Constructor { .. }
        | ExpDesc::ContractAt { .. }
        | ExpDesc::Unpack { .. } => {
            for child in children(&e.desc) {
                collect_free(child, bound, out);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Retyping
// ---------------------------------------------------------------------------

fn map_box<T, S, U, S2>(e: &Exp<T, S>, f: &mut impl FnMut(&T) -> U) -> Box<Exp<U, S2>> {
    Box::new(e.map_ty(f))
}

fn map_desc<T, S, U, S2>(desc: &ExpDesc<T, S>, f: &mut impl FnMut(&T) -> U) -> ExpDesc<U, S2> {
    match desc {
        ExpDesc::Let {
            bnd_var,
            inline,
            bnd_val,
            body,
        } => ExpDesc::Let {
            bnd_var: bnd_var.clone(),
            inline: *inline,
            bnd_val: map_box(bnd_val, f),
            body: map_box(body, f),
        },
        ExpDesc::Var(name) => ExpDesc::Var(name.clone()),
        ExpDesc::SetField {
            record,
            field,
            set_val,
        } => ExpDesc::SetField {
            record: map_box(record, f),
            field: field.clone(),
            set_val: map_box(set_val, f),
        },
        ExpDesc::Project { field, record } => ExpDesc::Project {
            field: field.clone(),
            record: map_box(record, f),
        },
        ExpDesc::Const { ty, value } => ExpDesc::Const {
            ty: ty.clone(),
            value: value.clone(),
        },
        ExpDesc::Apply { prim, args } => ExpDesc::Apply {
            prim: *prim,
            args: args.iter().map(|a| a.map_ty(f)).collect(),
        },
        ExpDesc::If {
            cond,
            ifthen,
            ifelse,
        } => ExpDesc::If {
            cond: map_box(cond, f),
            ifthen: map_box(ifthen, f),
            ifelse: map_box(ifelse, f),
        },
        ExpDesc::Seq(a, b) => ExpDesc::Seq(map_box(a, f), map_box(b, f)),
        ExpDesc::Transfer {
            dest,
            amount,
            entry,
            arg,
        } => ExpDesc::Transfer {
            dest: map_box(dest, f),
            amount: map_box(amount, f),
            entry: entry.clone(),
            arg: map_box(arg, f),
        },
        ExpDesc::Failwith(e) => ExpDesc::Failwith(map_box(e, f)),
        ExpDesc::MatchOption {
            arg,
            ifnone,
            some_name,
            ifsome,
        } => ExpDesc::MatchOption {
            arg: map_box(arg, f),
            ifnone: map_box(ifnone, f),
            some_name: some_name.clone(),
            ifsome: map_box(ifsome, f),
        },
        ExpDesc::MatchNat {
            arg,
            plus_name,
            ifplus,
            minus_name,
            ifminus,
        } => ExpDesc::MatchNat {
            arg: map_box(arg, f),
            plus_name: plus_name.clone(),
            ifplus: map_box(ifplus, f),
            minus_name: minus_name.clone(),
            ifminus: map_box(ifminus, f),
        },
        ExpDesc::MatchList {
            arg,
            head_name,
            tail_name,
            ifcons,
            ifnil,
        } => ExpDesc::MatchList {
            arg: map_box(arg, f),
            head_name: head_name.clone(),
            tail_name: tail_name.clone(),
            ifcons: map_box(ifcons, f),
            ifnil: map_box(ifnil, f),
        },
        ExpDesc::MatchVariant { arg, cases } => ExpDesc::MatchVariant {
            arg: map_box(arg, f),
            cases: cases
                .iter()
                .map(|c| MatchCase {
                    pattern: c.pattern.clone(),
                    body: c.body.map_ty(f),
                })
                .collect(),
        },
        ExpDesc::Loop {
            arg_name,
            body,
            arg,
        } => ExpDesc::Loop {
            arg_name: arg_name.clone(),
            body: map_box(body, f),
            arg: map_box(arg, f),
        },
        ExpDesc::LoopLeft {
            arg_name,
            body,
            arg,
            acc,
        } => ExpDesc::LoopLeft {
            arg_name: arg_name.clone(),
            body: map_box(body, f),
            arg: map_box(arg, f),
            acc: acc.as_ref().map(|acc| LoopAcc {
                name: acc.name.clone(),
                init: map_box(&acc.init, f),
            }),
        },
        ExpDesc::Fold {
            prim,
            elt_name,
            acc_name,
            body,
            arg,
            acc,
        } => ExpDesc::Fold {
            prim: *prim,
            elt_name: elt_name.clone(),
            acc_name: acc_name.clone(),
            body: map_box(body, f),
            arg: map_box(arg, f),
            acc: map_box(acc, f),
        },
        ExpDesc::Map {
            prim,
            elt_name,
            body,
            arg,
        } => ExpDesc::Map {
            prim: *prim,
            elt_name: elt_name.clone(),
            body: map_box(body, f),
            arg: map_box(arg, f),
        },
        ExpDesc::MapFold {
            prim,
            elt_name,
            acc_name,
            body,
            arg,
            acc,
        } => ExpDesc::MapFold {
            prim: *prim,
            elt_name: elt_name.clone(),
            acc_name: acc_name.clone(),
            body: map_box(body, f),
            arg: map_box(arg, f),
            acc: map_box(acc, f),
        },
        ExpDesc::Lambda {
            arg_name,
            arg_ty,
            body,
            ret_ty,
        } => ExpDesc::Lambda {
            arg_name: arg_name.clone(),
            arg_ty: arg_ty.clone(),
            body: map_box(body, f),
            ret_ty: ret_ty.clone(),
        },
        ExpDesc::Closure {
            arg_name,
            arg_ty,
            call_env,
            body,
            ret_ty,
        } => ExpDesc::Closure {
            arg_name: arg_name.clone(),
            arg_ty: arg_ty.clone(),
            call_env: call_env
                .iter()
                .map(|(n, e)| (n.clone(), e.map_ty(f)))
                .collect(),
            body: map_box(body, f),
            ret_ty: ret_ty.clone(),
        },
        ExpDesc::Record(fields) => {
            ExpDesc::Record(fields.iter().map(|(n, e)| (n.clone(), e.map_ty(f))).collect())
        }
        ExpDesc::Constructor { constr, arg } => ExpDesc::Constructor {
            constr: constr.clone(),
            arg: map_box(arg, f),
        },
        ExpDesc::CreateContract { args, contract } => ExpDesc::CreateContract {
            args: args.iter().map(|a| a.map_ty(f)).collect(),
            contract: Box::new(ContractCode {
                parameter: contract.parameter.clone(),
                storage: contract.storage.clone(),
                code: contract.code.map_ty(f),
            }),
        },
        ExpDesc::ContractAt { arg, c_sig } => ExpDesc::ContractAt {
            arg: map_box(arg, f),
            c_sig: c_sig.clone(),
        },
        ExpDesc::Unpack { arg, ty } => ExpDesc::Unpack {
            arg: map_box(arg, f),
            ty: ty.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type E = SyntaxExp;

    fn int(n: i64) -> E {
        E::constant(Datatype::Int, Const::int(n), ())
    }

    fn var(x: &str) -> E {
        E::var(x, ())
    }

    fn failwith(e: E) -> E {
        E::mk(ExpDesc::Failwith(Box::new(e)), ())
    }

    fn transfer() -> E {
        E::mk(
            ExpDesc::Transfer {
                dest: Box::new(var("dest")),
                amount: Box::new(var("amount")),
                entry: None,
                arg: Box::new(E::unit()),
            },
            (),
        )
    }

    fn if_(c: E, t: E, e: E) -> E {
        E::mk(
            ExpDesc::If {
                cond: Box::new(c),
                ifthen: Box::new(t),
                ifelse: Box::new(e),
            },
            (),
        )
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

    fn lambda(x: &str, body: E) -> E {
        E::mk(
            ExpDesc::Lambda {
                arg_name: x.to_string(),
                arg_ty: Datatype::Int,
                body: Box::new(body),
                ret_ty: Datatype::Int,
            },
            (),
        )
    }

    #[test]
    fn leaves_have_no_effects() {
        for e in [int(1), var("x")] {
            assert!(!e.fails());
            assert!(!e.transfers());
        }
    }

    #[test]
    fn failwith_fails_and_propagates() {
        let f = failwith(int(0));
        assert!(f.fails());
        assert!(!f.transfers());
        assert!(if_(var("c"), f.clone(), int(1)).fails());
        assert!(let_("x", f.clone(), var("x")).fails());
        assert!(let_("x", int(1), f.clone()).fails());
        assert!(!if_(var("c"), int(2), int(1)).fails());
    }

    #[test]
    fn transfer_flag_is_local() {
        let t = transfer();
        assert!(t.transfers());
        let wrapped = let_("op", t.clone(), var("op"));
        assert!(!wrapped.transfers());
        assert!(!if_(var("c"), t.clone(), t).transfers());
        let create = E::apply(Primitive::CreateAccount, vec![var("k")], ());
        assert!(create.transfers());
        let delegate = E::apply(Primitive::SetDelegate, vec![var("k")], ());
        assert!(delegate.transfers());
    }

    #[test]
    fn lambda_body_does_not_fail_at_definition() {
        let l = lambda("x", failwith(var("x")));
        assert!(!l.fails());
        let exec = E::apply(Primitive::Exec, vec![int(1), l], ());
        assert!(exec.fails());
    }

    #[test]
    fn closure_fails_only_through_its_environment() {
        let closure = |env_val: E| {
            E::mk(
                ExpDesc::Closure {
                    arg_name: "x".to_string(),
                    arg_ty: Datatype::Int,
                    call_env: vec![("y".to_string(), env_val)],
                    body: Box::new(failwith(var("y"))),
                    ret_ty: Datatype::Int,
                },
                (),
            )
        };
        assert!(!closure(var("y")).fails());
        assert!(closure(failwith(int(3))).fails());
    }

    #[test]
    fn rebuild_recomputes_flags() {
        let e = if_(var("c"), failwith(int(1)), transfer());
        let typed: TypedExp = e.map_ty(&mut |_| Datatype::Int);
        assert!(typed.fails());
        assert!(!typed.transfers());
        assert_eq!(typed.ty, Datatype::Int);
        assert_eq!(typed.untype(), e);
    }

    #[test]
    fn bound_and_free_variables() {
        let e = let_(
            "x",
            var("a"),
            lambda("y", E::apply(Primitive::Add, vec![var("x"), var("y"), var("b")], ())),
        );
        let bv: Vec<_> = e.bound_vars().iter().cloned().collect();
        assert_eq!(bv, vec!["x".to_string(), "y".to_string()]);
        let fv: Vec<_> = e.free_vars().into_iter().collect();
        assert_eq!(fv, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn let_value_is_outside_binder_scope() {
        let e = let_("x", var("x"), var("x"));
        assert!(e.free_vars().contains("x"));
    }
}
