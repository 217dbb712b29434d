//! Compilation of typed expressions to stack instructions.
//!
//! The compiler tracks a symbolic stack of optional variable names, top
//! last. Compiling an expression always leaves exactly one new slot on
//! top: its value. Binders are cleaned up with `DIP 1 { DROP n }` once the
//! scope that uses them has produced its value.
//!
//! Records, named sums and origination need the encoding pass that lowers
//! them to pairs and `or`s; they are rejected here.

use liquidity_ast::{ContractCode, ExpDesc, MatchCase, Pattern, Typed, TypedExp};
use liquidity_diag::Location;
use liquidity_prims::Primitive;
use liquidity_types::{Const, Datatype};
use tracing::{debug, trace};

use crate::{CompileError, Instr, MicContract, Michelson};

type Code = Vec<Michelson>;

/// Compile `exp` run on a stack holding the `inputs`, `inputs[0]` on top.
/// The resulting block consumes the inputs and leaves the value alone.
pub fn compile_exp(exp: &TypedExp, inputs: &[String]) -> Result<Michelson, CompileError> {
    debug!(inputs = inputs.len(), "compiling expression");
    let mut compiler = Compiler {
        env: inputs.iter().rev().map(|name| Some(name.clone())).collect(),
    };
    let mut code = Vec::new();
    compiler.exp(exp, &mut code)?;
    if !inputs.is_empty() {
        code.push(drop_below(inputs.len()));
    }
    Ok(Michelson::seq(code))
}

/// Package a contract body over `parameter` and `storage`.
pub fn compile_contract(
    contract: &ContractCode<Datatype, Typed>,
) -> Result<MicContract<Michelson>, CompileError> {
    debug!(
        parameter = %contract.parameter,
        storage = %contract.storage,
        "compiling contract"
    );
    let mut compiler = Compiler {
        env: vec![Some("storage".to_string()), Some("parameter".to_string())],
    };
    let mut code = vec![Michelson::new(Instr::Unpair)];
    compiler.exp(&contract.code, &mut code)?;
    code.push(drop_below(2));
    Ok(MicContract {
        parameter: contract.parameter.clone(),
        storage: contract.storage.clone(),
        code: Michelson::seq(code),
    })
}

/// `DIP 1 { DROP n }`: discard `n` slots under the top.
fn drop_below(n: usize) -> Michelson {
    Michelson::dip(1, vec![Instr::Drop(n as u32).into()])
}

fn unsupported(what: impl Into<String>, loc: &Location) -> CompileError {
    CompileError::Unsupported {
        what: what.into(),
        loc: loc.clone(),
    }
}

fn missing_type(what: impl Into<String>, loc: &Location) -> CompileError {
    CompileError::MissingType {
        what: what.into(),
        loc: loc.clone(),
    }
}

fn needs_encoding(c: &Const) -> bool {
    match c {
        Const::Record(_) | Const::Constr(_, _) | Const::BigMap(_) => true,
        Const::Unit
        | Const::Bool(_)
        | Const::Int(_)
        | Const::Nat(_)
        | Const::Tez(_)
        | Const::Timestamp(_)
        | Const::String(_)
        | Const::Bytes(_)
        | Const::Key(_)
        | Const::KeyHash(_)
        | Const::Signature(_)
        | Const::Address(_)
        | Const::None => false,
        Const::Some(c) | Const::Left(c) | Const::Right(c) => needs_encoding(c),
        Const::Tuple(cs) | Const::List(cs) | Const::Set(cs) => cs.iter().any(needs_encoding),
        Const::Map(kvs) => kvs.iter().any(|(k, v)| needs_encoding(k) || needs_encoding(v)),
    }
}

/// Body of a two-armed match on an `or`: the binder of `side` and its code.
fn or_case<'e>(
    cases: &'e [MatchCase<Datatype, Typed>],
    side: &str,
) -> Option<(Option<&'e str>, &'e TypedExp)> {
    cases.iter().find_map(|case| match &case.pattern {
        Pattern::Constr(k, vars) if k == side && vars.len() <= 1 => {
            Some((vars.first().map(String::as_str), &case.body))
        }
        Pattern::Any => Some((None, &case.body)),
        Pattern::Constr(_, _) => None,
    })
}

fn simple_instr(prim: Primitive) -> Option<Instr<Michelson>> {
    use Primitive as P;
    let ins = match prim {
        P::Balance => Instr::Balance,
        P::Now => Instr::Now,
        P::Amount => Instr::Amount,
        P::Gas => Instr::StepsToQuota,
        P::Source => Instr::Source,
        P::Sender => Instr::Sender,
        P::SelfContract => Instr::SelfContract,
        P::Add => Instr::Add,
        P::Sub => Instr::Sub,
        P::Mul => Instr::Mul,
        P::Ediv => Instr::Ediv,
        P::Abs => Instr::Abs,
        P::IsNat => Instr::IsNat,
        P::Int => Instr::Int,
        P::Neg => Instr::Neg,
        P::Lsl => Instr::Lsl,
        P::Lsr => Instr::Lsr,
        P::And => Instr::And,
        P::Or => Instr::Or,
        P::Xor => Instr::Xor,
        P::Not => Instr::Not,
        P::MapFind | P::CollFind => Instr::Get,
        P::MapUpdate | P::SetUpdate | P::CollUpdate => Instr::Update,
        P::MapMem | P::SetMem | P::CollMem => Instr::Mem,
        P::MapSize | P::SetSize | P::ListSize | P::CollSize | P::StringSize | P::BytesSize => {
            Instr::Size
        }
        P::Cons => Instr::Cons,
        P::Some => Instr::Some,
        P::Concat | P::ConcatTwo | P::BytesConcat => Instr::Concat,
        P::StringSub | P::BytesSub => Instr::Slice,
        P::Pack => Instr::Pack,
        P::Blake2b => Instr::Blake2b,
        P::Sha256 => Instr::Sha256,
        P::Sha512 => Instr::Sha512,
        P::HashKey => Instr::HashKey,
        P::Check => Instr::CheckSignature,
        P::Address => Instr::Address,
        P::DefaultAccount => Instr::ImplicitAccount,
        P::SetDelegate => Instr::SetDelegate,
        P::Exec => Instr::Exec,
        _ => return None,
    };
    Some(ins)
}

fn comparison_instr(prim: Primitive) -> Option<Instr<Michelson>> {
    let ins = match prim {
        Primitive::Eq => Instr::Eq,
        Primitive::Neq => Instr::Neq,
        Primitive::Lt => Instr::Lt,
        Primitive::Le => Instr::Le,
        Primitive::Gt => Instr::Gt,
        Primitive::Ge => Instr::Ge,
        _ => return None,
    };
    Some(ins)
}

struct Compiler {
    /// Names of the stack slots, top last. `None` for temporaries.
    env: Vec<Option<String>>,
}

impl Compiler {
    fn depth(&self, name: &str, loc: &Location) -> Result<u32, CompileError> {
        self.env
            .iter()
            .rev()
            .position(|slot| slot.as_deref() == Some(name))
            .map(|d| d as u32 + 1)
            .ok_or_else(|| CompileError::UnboundVariable {
                name: name.to_string(),
                loc: loc.clone(),
            })
    }

    fn push(&mut self) {
        self.env.push(None);
    }

    /// Replace the top `n` slots with one temporary.
    fn reduce(&mut self, n: usize) {
        self.env.truncate(self.env.len().saturating_sub(n));
        self.env.push(None);
    }

    fn name_slot(&mut self, depth: usize, name: &str) {
        let len = self.env.len();
        if let Some(slot) = len.checked_sub(depth + 1).and_then(|i| self.env.get_mut(i)) {
            *slot = Some(name.to_string());
        }
    }

    /// Compile one arm of a control construct. The symbolic stack is
    /// restored afterwards so that sibling arms start from the same state.
    fn arm(
        &mut self,
        build: impl FnOnce(&mut Self, &mut Code) -> Result<(), CompileError>,
    ) -> Result<Box<Michelson>, CompileError> {
        let saved = self.env.clone();
        let mut code = Vec::new();
        build(self, &mut code)?;
        self.env = saved;
        Ok(Box::new(Michelson::seq(code)))
    }

    /// Compile `body` in a scope where `binders` were just pushed, then drop them.
    fn scoped(
        &mut self,
        binders: &[&str],
        body: &TypedExp,
        code: &mut Code,
    ) -> Result<(), CompileError> {
        for name in binders {
            self.env.push(Some(name.to_string()));
        }
        self.exp(body, code)?;
        code.push(drop_below(binders.len()));
        self.reduce(binders.len() + 1);
        Ok(())
    }

    fn exp(&mut self, e: &TypedExp, code: &mut Code) -> Result<(), CompileError> {
        let loc = &e.loc;
        let emit = |code: &mut Code, ins: Instr<Michelson>| code.push(Michelson::at(loc.clone(), ins));
        match e.desc() {
            ExpDesc::Var(x) => {
                let d = self.depth(x, loc)?;
                emit(code, Instr::Dup(d));
                self.push();
            }
            ExpDesc::Const { ty, value } => {
                self.constant(ty, value, loc, code)?;
                self.push();
            }
            ExpDesc::Let {
                bnd_var,
                bnd_val,
                body,
                ..
            } => {
                self.exp(bnd_val, code)?;
                emit(code, Instr::Rename(Some(bnd_var.clone())));
                self.name_slot(0, bnd_var);
                self.exp(body, code)?;
                code.push(drop_below(1));
                self.reduce(2);
            }
            ExpDesc::Seq(first, second) => {
                self.exp(first, code)?;
                emit(code, Instr::Drop(1));
                self.env.pop();
                self.exp(second, code)?;
            }
            ExpDesc::If {
                cond,
                ifthen,
                ifelse,
            } => {
                self.exp(cond, code)?;
                self.env.pop();
                let t = self.arm(|c, code| c.exp(ifthen, code))?;
                let f = self.arm(|c, code| c.exp(ifelse, code))?;
                emit(code, Instr::If(t, f));
                self.push();
            }
            ExpDesc::MatchOption {
                arg,
                ifnone,
                some_name,
                ifsome,
            } => {
                self.exp(arg, code)?;
                self.env.pop();
                let none = self.arm(|c, code| c.exp(ifnone, code))?;
                let some = self.arm(|c, code| c.scoped(&[some_name.as_str()], ifsome, code))?;
                emit(code, Instr::IfNone(none, some));
                self.push();
            }
            ExpDesc::MatchNat {
                arg,
                plus_name,
                ifplus,
                minus_name,
                ifminus,
            } => {
                self.exp(arg, code)?;
                emit(code, Instr::Dup(1));
                emit(code, Instr::IsNat);
                let minus = self.arm(|c, code| {
                    code.push(Michelson::at(loc.clone(), Instr::Abs));
                    c.env.pop();
                    c.scoped(&[minus_name.as_str()], ifminus, code)
                })?;
                let plus = self.arm(|c, code| {
                    code.push(drop_below(1));
                    c.env.pop();
                    c.scoped(&[plus_name.as_str()], ifplus, code)
                })?;
                emit(code, Instr::IfNone(minus, plus));
                self.reduce(1);
            }
            ExpDesc::MatchList {
                arg,
                head_name,
                tail_name,
                ifcons,
                ifnil,
            } => {
                self.exp(arg, code)?;
                self.env.pop();
                let cons = self.arm(|c, code| c.scoped(&[tail_name.as_str(), head_name.as_str()], ifcons, code))?;
                let nil = self.arm(|c, code| c.exp(ifnil, code))?;
                emit(code, Instr::IfCons(cons, nil));
                self.push();
            }
            ExpDesc::MatchVariant { arg, cases } => {
                if !matches!(arg.ty, Datatype::Or(_, _)) {
                    return Err(unsupported(format!("a match on `{}`", arg.ty), loc));
                }
                let (left, right) = match (or_case(cases, "Left"), or_case(cases, "Right")) {
                    (Some(l), Some(r)) => (l, r),
                    _ => return Err(unsupported("a partial match on `or`", loc)),
                };
                self.exp(arg, code)?;
                self.env.pop();
                let arm_for = |c: &mut Self, (name, body): (Option<&str>, &TypedExp)| {
                    c.arm(|c, code| c.scoped(&[name.unwrap_or("_")], body, code))
                };
                let l = arm_for(self, left)?;
                let r = arm_for(self, right)?;
                emit(code, Instr::IfLeft(l, r));
                self.push();
            }
            ExpDesc::Loop {
                arg_name,
                body,
                arg,
            } => {
                self.exp(arg, code)?;
                emit(code, Instr::Push(Datatype::Bool, Const::Bool(true)));
                let body = self.arm(|c, code| {
                    c.env.pop();
                    c.scoped(&[arg_name.as_str()], body, code)?;
                    code.push(Instr::Unpair.into());
                    Ok(())
                })?;
                emit(code, Instr::Loop(body));
            }
            ExpDesc::LoopLeft {
                arg_name,
                body,
                arg,
                acc: None,
            } => {
                self.exp(arg, code)?;
                emit(code, Instr::Left(e.ty.clone()));
                let body = self.arm(|c, code| {
                    c.env.pop();
                    c.scoped(&[arg_name.as_str()], body, code)
                })?;
                emit(code, Instr::LoopLeft(body));
            }
            ExpDesc::LoopLeft {
                arg_name,
                body,
                arg,
                acc: Some(acc),
            } => {
                let result_ty = e
                    .ty
                    .tuple_components()
                    .and_then(|ts| ts.first())
                    .cloned()
                    .ok_or_else(|| missing_type("the result of a loop with accumulator", loc))?;
                self.exp(&acc.init, code)?;
                self.exp(arg, code)?;
                emit(code, Instr::Left(result_ty));
                let body = self.arm(|c, code| {
                    c.env.truncate(c.env.len() - 2);
                    c.scoped(&[acc.name.as_str(), arg_name.as_str()], body, code)?;
                    code.push(Instr::Unpair.into());
                    Ok(())
                })?;
                emit(code, Instr::LoopLeft(body));
                emit(code, Instr::Pair);
                self.reduce(2);
            }
            ExpDesc::Fold {
                elt_name,
                acc_name,
                body,
                arg,
                acc,
                ..
            } => {
                self.exp(acc, code)?;
                self.exp(arg, code)?;
                self.env.pop();
                let body = self.arm(|c, code| {
                    c.env.pop();
                    c.scoped(&[acc_name.as_str(), elt_name.as_str()], body, code)
                })?;
                emit(code, Instr::Iter(body));
            }
            ExpDesc::Map {
                elt_name,
                body,
                arg,
                ..
            } => {
                self.exp(arg, code)?;
                let body = self.arm(|c, code| {
                    c.env.pop();
                    c.scoped(&[elt_name.as_str()], body, code)
                })?;
                emit(code, Instr::Map(body));
            }
            ExpDesc::MapFold {
                elt_name,
                acc_name,
                body,
                arg,
                acc,
                ..
            } => {
                self.exp(acc, code)?;
                self.exp(arg, code)?;
                let body = self.arm(|c, code| {
                    c.env.truncate(c.env.len() - 2);
                    c.scoped(&[acc_name.as_str(), elt_name.as_str()], body, code)?;
                    code.push(Instr::Unpair.into());
                    Ok(())
                })?;
                emit(code, Instr::Map(body));
                emit(code, Instr::Pair);
                self.reduce(2);
            }
            ExpDesc::Lambda {
                arg_name,
                arg_ty,
                body,
                ret_ty,
            } => {
                if let Some(x) = body.free_vars().into_iter().find(|x| x != arg_name) {
                    return Err(unsupported(format!("a lambda capturing `{x}`"), loc));
                }
                let mut inner = Compiler { env: Vec::new() };
                let mut block = Vec::new();
                inner.scoped(&[arg_name.as_str()], body, &mut block)?;
                emit(
                    code,
                    Instr::Lambda(
                        arg_ty.clone(),
                        ret_ty.clone(),
                        Box::new(Michelson::seq(block)),
                    ),
                );
                self.push();
            }
            ExpDesc::Closure {
                arg_name,
                arg_ty,
                call_env,
                body,
                ret_ty,
            } => self.closure(e, arg_name, arg_ty, call_env, body, ret_ty, code)?,
            ExpDesc::Apply { prim, args } => self.apply(e, *prim, args, code)?,
            ExpDesc::Failwith(arg) => {
                self.exp(arg, code)?;
                emit(code, Instr::Failwith);
            }
            ExpDesc::Transfer {
                dest,
                amount,
                entry,
                arg,
            } => {
                if let Some(entry) = entry.as_deref().filter(|entry| *entry != "default") {
                    return Err(unsupported(format!("a call to entry point `{entry}`"), loc));
                }
                self.exp(dest, code)?;
                self.exp(amount, code)?;
                self.exp(arg, code)?;
                emit(code, Instr::TransferTokens);
                self.reduce(3);
            }
            ExpDesc::Unpack { arg, ty } => {
                self.exp(arg, code)?;
                emit(code, Instr::Unpack(ty.clone()));
            }
            ExpDesc::ContractAt { arg, c_sig } => {
                let [entry] = c_sig.entries_sig.as_slice() else {
                    return Err(unsupported("a multi-entry contract lookup", loc));
                };
                self.exp(arg, code)?;
                emit(code, Instr::Contract(entry.parameter.clone()));
            }
            ExpDesc::Constructor { constr, arg } => {
                let ins = match constr {
                    liquidity_ast::Constructor::Left(right) => Instr::Left(right.clone()),
                    liquidity_ast::Constructor::Right(left) => Instr::Right(left.clone()),
                    liquidity_ast::Constructor::Constr(k) => {
                        return Err(unsupported(format!("constructor `{k}`"), loc));
                    }
                };
                self.exp(arg, code)?;
                emit(code, ins);
            }
            ExpDesc::Record(_) => return Err(unsupported("a record", loc)),
            ExpDesc::Project { field, .. } => {
                return Err(unsupported(format!("access to field `{field}`"), loc));
            }
            ExpDesc::SetField { field, .. } => {
                return Err(unsupported(format!("update of field `{field}`"), loc));
            }
            ExpDesc::CreateContract { .. } => {
                return Err(unsupported("contract origination", loc));
            }
        }
        Ok(())
    }

    fn constant(
        &mut self,
        ty: &Datatype,
        value: &Const,
        loc: &Location,
        code: &mut Code,
    ) -> Result<(), CompileError> {
        if needs_encoding(value) {
            return Err(unsupported(format!("a constant of type `{ty}`"), loc));
        }
        let ins = match (value, ty) {
            (Const::Unit, _) => Instr::Unit,
            (Const::List(items), Datatype::List(t)) if items.is_empty() => Instr::Nil((**t).clone()),
            (Const::Set(items), Datatype::Set(t)) if items.is_empty() => {
                Instr::EmptySet((**t).clone())
            }
            (Const::Map(items), Datatype::Map(k, v)) if items.is_empty() => {
                Instr::EmptyMap((**k).clone(), (**v).clone())
            }
            (Const::None, Datatype::Option(t)) => Instr::None((**t).clone()),
            (Const::List(_) | Const::Set(_) | Const::Map(_) | Const::None, _) => {
                return Err(missing_type(format!("constant `{value}`"), loc));
            }
            _ => Instr::Push(ty.clone(), value.clone()),
        };
        code.push(Michelson::at(loc.clone(), ins));
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn closure(
        &mut self,
        e: &TypedExp,
        arg_name: &str,
        arg_ty: &Datatype,
        call_env: &[(String, TypedExp)],
        body: &TypedExp,
        ret_ty: &Datatype,
        code: &mut Code,
    ) -> Result<(), CompileError> {
        let loc = &e.loc;
        let n = call_env.len();
        if let Some(x) = body
            .free_vars()
            .into_iter()
            .find(|x| x != arg_name && !call_env.iter().any(|(name, _)| name == x))
        {
            return Err(unsupported(format!("a closure missing `{x}` in its environment"), loc));
        }
        let env_ty = match call_env {
            [] => Datatype::Unit,
            [(_, v)] => v.ty.clone(),
            _ => Datatype::Tuple(call_env.iter().map(|(_, v)| v.ty.clone()).collect()),
        };
        trace!(captured = n, "compiling closure");

        // The lambda receives `(env, arg)` and unfolds the environment comb
        // so that the first captured value ends on top.
        let mut inner = Compiler { env: Vec::new() };
        let mut block = vec![Michelson::new(Instr::Unpair)];
        for k in 0..n.saturating_sub(1) {
            block.push(if k == 0 {
                Instr::Unpair.into()
            } else {
                Michelson::dip(k as u32, vec![Instr::Unpair.into()])
            });
        }
        let mut binders: Vec<&str> = vec![arg_name];
        binders.extend(call_env.iter().rev().map(|(name, _)| name.as_str()));
        if n == 0 {
            // `UNPAIR` left a unit environment on top of the argument.
            block.push(Instr::Drop(1).into());
            binders.truncate(1);
        }
        inner.scoped(&binders, body, &mut block)?;
        code.push(Michelson::at(
            loc.clone(),
            Instr::Lambda(
                Datatype::pair(env_ty, arg_ty.clone()),
                ret_ty.clone(),
                Box::new(Michelson::seq(block)),
            ),
        ));
        self.push();

        match call_env.split_last() {
            None => {
                code.push(Michelson::at(loc.clone(), Instr::Unit));
                self.push();
            }
            Some(((_, last), init)) => {
                self.exp(last, code)?;
                for (_, value) in init.iter().rev() {
                    self.exp(value, code)?;
                    code.push(Michelson::at(loc.clone(), Instr::Pair));
                    self.reduce(2);
                }
            }
        }
        code.push(Michelson::at(loc.clone(), Instr::Apply));
        self.reduce(2);
        Ok(())
    }

    fn apply(
        &mut self,
        e: &TypedExp,
        prim: Primitive,
        args: &[TypedExp],
        code: &mut Code,
    ) -> Result<(), CompileError> {
        let loc = &e.loc;
        let emit = |code: &mut Code, ins: Instr<Michelson>| code.push(Michelson::at(loc.clone(), ins));
        if let Some(ins) = simple_instr(prim) {
            self.args_reversed(args, code)?;
            emit(code, ins);
            self.reduce(args.len());
            return Ok(());
        }
        if let Some(ins) = comparison_instr(prim) {
            self.args_reversed(args, code)?;
            emit(code, Instr::Compare);
            emit(code, ins);
            self.reduce(args.len());
            return Ok(());
        }
        match (prim, args) {
            (Primitive::Compare, _) => {
                self.args_reversed(args, code)?;
                emit(code, Instr::Compare);
                self.reduce(args.len());
            }
            (Primitive::Tuple, []) => {
                emit(code, Instr::Unit);
                self.push();
            }
            (Primitive::Tuple, [single]) => self.exp(single, code)?,
            (Primitive::Tuple, _) => {
                let Some((last, init)) = args.split_last() else {
                    return Ok(());
                };
                self.exp(last, code)?;
                for a in init.iter().rev() {
                    self.exp(a, code)?;
                    emit(code, Instr::Pair);
                    self.reduce(2);
                }
            }
            (Primitive::TupleGet, [t, idx]) => {
                let n = t
                    .ty
                    .tuple_components()
                    .map(<[Datatype]>::len)
                    .ok_or_else(|| missing_type("a tuple projection", loc))?;
                let i = match idx.desc() {
                    ExpDesc::Const { value, .. } => value.as_index(),
                    _ => None,
                }
                .filter(|i| *i < n)
                .ok_or_else(|| CompileError::BadTupleIndex { loc: loc.clone() })?;
                self.exp(t, code)?;
                for _ in 0..i {
                    emit(code, Instr::Cdr);
                }
                if i + 1 < n {
                    emit(code, Instr::Car);
                }
            }
            (Primitive::MapAdd, [key, value, map]) => {
                self.exp(map, code)?;
                self.exp(value, code)?;
                emit(code, Instr::Some);
                self.exp(key, code)?;
                emit(code, Instr::Update);
                self.reduce(3);
            }
            (Primitive::MapRemove, [key, map]) => {
                let value_ty = match &map.ty {
                    Datatype::Map(_, v) | Datatype::BigMap(_, v) => (**v).clone(),
                    _ => return Err(missing_type("the value type of `Map.remove`", loc)),
                };
                self.exp(map, code)?;
                emit(code, Instr::None(value_ty));
                self.push();
                self.exp(key, code)?;
                emit(code, Instr::Update);
                self.reduce(3);
            }
            (Primitive::SetAdd | Primitive::SetRemove, [key, set]) => {
                self.exp(set, code)?;
                emit(
                    code,
                    Instr::Push(Datatype::Bool, Const::Bool(prim == Primitive::SetAdd)),
                );
                self.push();
                self.exp(key, code)?;
                emit(code, Instr::Update);
                self.reduce(3);
            }
            (Primitive::ListRev, [list]) => {
                let elt = match &list.ty {
                    Datatype::List(t) => (**t).clone(),
                    _ => return Err(missing_type("the element type of `List.rev`", loc)),
                };
                self.exp(list, code)?;
                emit(code, Instr::Nil(elt));
                emit(code, Instr::Swap);
                emit(
                    code,
                    Instr::Iter(Box::new(Michelson::seq(vec![Instr::Cons.into()]))),
                );
            }
            (Primitive::CreateAccount, _) => {
                self.args_reversed(args, code)?;
                emit(code, Instr::CreateAccount);
                emit(code, Instr::Pair);
                self.reduce(args.len());
            }
            (Primitive::PartialApply, [f, x]) => {
                self.exp(f, code)?;
                self.exp(x, code)?;
                emit(code, Instr::Apply);
                self.reduce(2);
            }
            (Primitive::TupleSet, _) => return Err(unsupported("tuple update", loc)),
            _ => {
                return Err(unsupported(
                    format!("`{prim}` applied to {} arguments", args.len()),
                    loc,
                ));
            }
        }
        Ok(())
    }

    /// Last argument first, so that the first ends on top.
    fn args_reversed(&mut self, args: &[TypedExp], code: &mut Code) -> Result<(), CompileError> {
        for a in args.iter().rev() {
            self.exp(a, code)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use liquidity_ast::Inline;

    use super::*;

    fn int(n: i64) -> TypedExp {
        TypedExp::constant(Datatype::Int, Const::int(n), Datatype::Int)
    }

    fn var(x: &str, ty: Datatype) -> TypedExp {
        TypedExp::var(x, ty)
    }

    fn ops(m: &Michelson) -> Vec<String> {
        m.flatten().iter().map(|i| i.to_string()).collect()
    }

    #[test]
    fn variables_are_duplicated_from_their_depth() {
        let e = TypedExp::apply(
            Primitive::Sub,
            vec![var("a", Datatype::Int), var("b", Datatype::Int)],
            Datatype::Int,
        );
        let code = compile_exp(&e, &["a".to_string(), "b".to_string()]).unwrap();
        // `b` is pushed first, then `a` sits two slots above the original top.
        assert_eq!(ops(&code), vec!["DUP 2", "DUP 2", "SUB", "DIP { DROP 2 }"]);
    }

    #[test]
    fn let_names_and_drops_its_binder() {
        let e = TypedExp::mk(
            ExpDesc::Let {
                bnd_var: "x".to_string(),
                inline: Inline::Auto,
                bnd_val: Box::new(int(3)),
                body: Box::new(TypedExp::apply(
                    Primitive::Add,
                    vec![var("x", Datatype::Int), var("x", Datatype::Int)],
                    Datatype::Int,
                )),
            },
            Datatype::Int,
        );
        let code = compile_exp(&e, &[]).unwrap();
        assert_eq!(
            ops(&code),
            vec!["PUSH int 3", "RENAME @x", "DUP", "DUP 2", "ADD", "DIP { DROP }"]
        );
    }

    #[test]
    fn comparisons_compare_first_argument_on_top() {
        let e = TypedExp::apply(
            Primitive::Ge,
            vec![var("n", Datatype::Int), int(10)],
            Datatype::Bool,
        );
        let code = compile_exp(&e, &["n".to_string()]).unwrap();
        assert_eq!(
            ops(&code),
            vec!["PUSH int 10", "DUP 2", "COMPARE", "GE", "DIP { DROP }"]
        );
    }

    #[test]
    fn tuples_are_right_combs() {
        let t = Datatype::Tuple(vec![Datatype::Int, Datatype::Int, Datatype::Int]);
        let e = TypedExp::apply(Primitive::Tuple, vec![int(1), int(2), int(3)], t.clone());
        let code = compile_exp(&e, &[]).unwrap();
        assert_eq!(
            ops(&code),
            vec!["PUSH int 3", "PUSH int 2", "PAIR", "PUSH int 1", "PAIR"]
        );

        let get = |i: u64| {
            TypedExp::apply(
                Primitive::TupleGet,
                vec![
                    var("t", t.clone()),
                    TypedExp::constant(Datatype::Nat, Const::nat(i), Datatype::Nat),
                ],
                Datatype::Int,
            )
        };
        let inputs = ["t".to_string()];
        assert_eq!(
            ops(&compile_exp(&get(1), &inputs).unwrap()),
            vec!["DUP", "CDR", "CAR", "DIP { DROP }"]
        );
        assert_eq!(
            ops(&compile_exp(&get(2), &inputs).unwrap()),
            vec!["DUP", "CDR", "CDR", "DIP { DROP }"]
        );
        assert!(matches!(
            compile_exp(&get(3), &inputs),
            Err(CompileError::BadTupleIndex { .. })
        ));
    }

    #[test]
    fn unbound_and_unsupported_are_reported() {
        let err = compile_exp(&var("ghost", Datatype::Int), &[]).unwrap_err();
        assert_eq!(
            err,
            CompileError::UnboundVariable {
                name: "ghost".to_string(),
                loc: Location::unknown(),
            }
        );
        let record = TypedExp::mk(
            ExpDesc::Record(vec![("owner".to_string(), int(1))]),
            Datatype::Unit,
        );
        assert!(matches!(
            compile_exp(&record, &[]),
            Err(CompileError::Unsupported { .. })
        ));
    }

    #[test]
    fn empty_collections_use_dedicated_instructions() {
        let nil = TypedExp::constant(
            Datatype::list(Datatype::Operation),
            Const::List(vec![]),
            Datatype::list(Datatype::Operation),
        );
        assert_eq!(ops(&compile_exp(&nil, &[]).unwrap()), vec!["NIL operation"]);
        let none = TypedExp::constant(
            Datatype::option(Datatype::Nat),
            Const::None,
            Datatype::option(Datatype::Nat),
        );
        assert_eq!(ops(&compile_exp(&none, &[]).unwrap()), vec!["NONE nat"]);
    }

    #[test]
    fn lambdas_must_be_closed() {
        let open = TypedExp::mk(
            ExpDesc::Lambda {
                arg_name: "x".to_string(),
                arg_ty: Datatype::Int,
                body: Box::new(var("y", Datatype::Int)),
                ret_ty: Datatype::Int,
            },
            Datatype::lambda(Datatype::Int, Datatype::Int),
        );
        assert!(matches!(
            compile_exp(&open, &["y".to_string()]),
            Err(CompileError::Unsupported { .. })
        ));
    }

    #[test]
    fn closures_pair_their_environment() {
        let closure = TypedExp::mk(
            ExpDesc::Closure {
                arg_name: "x".to_string(),
                arg_ty: Datatype::Int,
                call_env: vec![("y".to_string(), var("y", Datatype::Int))],
                body: Box::new(TypedExp::apply(
                    Primitive::Add,
                    vec![var("x", Datatype::Int), var("y", Datatype::Int)],
                    Datatype::Int,
                )),
                ret_ty: Datatype::Int,
            },
            Datatype::Closure {
                arg: Box::new(Datatype::Int),
                env: Box::new(Datatype::Int),
                ret: Box::new(Datatype::Int),
            },
        );
        let code = compile_exp(&closure, &["y".to_string()]).unwrap();
        let printed = ops(&code);
        assert_eq!(printed.len(), 4);
        assert_eq!(
            printed[0],
            "LAMBDA (pair int int) int { UNPAIR ;\n  DUP ;\n  DUP 3 ;\n  ADD ;\n  DIP { DROP 2 } }"
        );
        assert_eq!(&printed[1..], &["DUP 2", "APPLY", "DIP { DROP }"]);
    }

    #[test]
    fn contract_body_sees_parameter_and_storage() {
        let ops_ty = Datatype::list(Datatype::Operation);
        let body = TypedExp::apply(
            Primitive::Tuple,
            vec![
                TypedExp::constant(ops_ty.clone(), Const::List(vec![]), ops_ty.clone()),
                TypedExp::apply(
                    Primitive::Add,
                    vec![var("storage", Datatype::Int), var("parameter", Datatype::Int)],
                    Datatype::Int,
                ),
            ],
            Datatype::pair(ops_ty, Datatype::Int),
        );
        let contract = compile_contract(&ContractCode {
            parameter: Datatype::Int,
            storage: Datatype::Int,
            code: body,
        })
        .unwrap();
        assert_eq!(
            ops(&contract.code),
            vec![
                "UNPAIR",
                "DUP",
                "DUP 3",
                "ADD",
                "NIL operation",
                "PAIR",
                "DIP { DROP 2 }"
            ]
        );
    }
}
