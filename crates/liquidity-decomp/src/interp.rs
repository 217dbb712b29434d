//! Symbolic interpretation of stack code into a [`Graph`].
//!
//! The stack holds node ids with the top last. Duplication aliases a node
//! instead of copying it, so sharing in the produced graph mirrors sharing
//! on the stack.

use liquidity_ast::Constructor;
use liquidity_diag::Location;
use liquidity_michelson::{Instr, MicContract, Michelson};
use liquidity_prims::{CollKind, Primitive};
use liquidity_types::{Const, ContractSig, Datatype};
use tracing::trace;

use crate::graph::{
    CarriedSlot, Exit, Graph, GraphBuilder, IfForm, LoopForm, NodeId, NodeKind,
};
use crate::{DecompileError, DecompileOptions};

type Stack = Vec<NodeId>;

pub(crate) struct Interp<'o> {
    g: GraphBuilder,
    opts: &'o DecompileOptions,
    start: NodeId,
    /// Last node of the chain being extended.
    cursor: NodeId,
    /// Fewest values the input stack has been reduced to. Slots below it
    /// were never popped or overwritten.
    low_water: usize,
}

impl<'o> Interp<'o> {
    pub(crate) fn new(opts: &'o DecompileOptions) -> Self {
        let mut g = GraphBuilder::new();
        let start = g.add(NodeKind::Start, vec![], None, Location::unknown());
        Self {
            g,
            opts,
            start,
            cursor: start,
            low_water: usize::MAX,
        }
    }

    pub(crate) fn input(&mut self, name: &str, ty: &Datatype) -> NodeId {
        let id = self
            .g
            .add(NodeKind::Input, vec![], Some(ty.clone()), Location::unknown());
        self.g.node_mut(id).name = Some(name.to_string());
        id
    }

    /// A pair of two existing nodes, outside of any chain.
    pub(crate) fn pair(&mut self, car: NodeId, cdr: NodeId) -> NodeId {
        let kind = NodeKind::Prim(Primitive::Tuple);
        let ty = self.infer(&kind, &[car, cdr]);
        self.g.add(kind, vec![car, cdr], ty, Location::unknown())
    }

    pub(crate) fn finish(self, inputs: Vec<NodeId>, exit: Exit) -> Graph {
        let untouched = self.low_water.min(inputs.len());
        self.g.build(self.start, inputs, untouched, exit)
    }

    fn lower(&mut self, depth: usize) {
        self.low_water = self.low_water.min(depth);
    }

    // -- Chains --

    fn append(
        &mut self,
        kind: NodeKind,
        args: Vec<NodeId>,
        ty: Option<Datatype>,
        loc: &Location,
    ) -> NodeId {
        let id = self.g.add(kind, args, ty, loc.clone());
        self.g.link(self.cursor, id);
        self.cursor = id;
        id
    }

    /// Append a value node, inferring its type, and push it.
    fn value(&mut self, stack: &mut Stack, m: &Michelson, kind: NodeKind, args: Vec<NodeId>) {
        let ty = self.infer(&kind, &args);
        let id = self.append(kind, args, ty, &m.loc);
        stack.push(id);
    }

    fn prim(&mut self, stack: &mut Stack, m: &Michelson, prim: Primitive, args: Vec<NodeId>) {
        self.value(stack, m, NodeKind::Prim(prim), args);
    }

    fn constant(&mut self, ty: Datatype, value: Const, loc: &Location) -> NodeId {
        let node_ty = Some(ty.clone());
        self.append(NodeKind::Const { ty, value }, vec![], node_ty, loc)
    }

    fn pop(&mut self, stack: &mut Stack, m: &Michelson) -> Result<NodeId, DecompileError> {
        Ok(self.pop_n(stack, 1, m)?[0])
    }

    /// Pop `n` values, top first.
    fn pop_n(&mut self, stack: &mut Stack, n: usize, m: &Michelson) -> Result<Vec<NodeId>, DecompileError> {
        self.need(stack, n, m)?;
        self.lower(stack.len() - n);
        let mut out = stack.split_off(stack.len() - n);
        out.reverse();
        Ok(out)
    }

    fn need(&self, stack: &Stack, n: usize, m: &Michelson) -> Result<(), DecompileError> {
        if stack.len() < n {
            return Err(DecompileError::StackUnderflow {
                instr: m.ins.opcode(),
                needed: n,
                found: stack.len(),
                loc: m.loc.clone(),
            });
        }
        Ok(())
    }

    fn name_top(&mut self, stack: &Stack, name: &str) {
        if let Some(&top) = stack.last() {
            let node = self.g.node_mut(top);
            if node.name.is_none() {
                node.name = Some(name.to_string());
            }
        }
    }

    // -- Blocks --

    /// Interpret a block on `stack`.
    pub(crate) fn block(&mut self, code: &Michelson, mut stack: Stack) -> Result<Exit, DecompileError> {
        let mut instrs = code.flatten().into_iter();
        while let Some(m) = instrs.next() {
            if let Some(failed) = self.instr(m, &mut stack)? {
                if let Some(dead) = instrs.next() {
                    return Err(DecompileError::UnreachableCode {
                        instr: dead.ins.opcode(),
                        loc: dead.loc.clone(),
                    });
                }
                return Ok(Exit::Failed(failed));
            }
            if self.opts.use_annotations
                && let Some(name) = &m.name
            {
                self.name_top(&stack, name);
            }
        }
        Ok(Exit::Values(stack))
    }

    /// Interpret one instruction. Returns the failing node when the
    /// instruction never returns.
    fn instr(&mut self, m: &Michelson, stack: &mut Stack) -> Result<Option<NodeId>, DecompileError> {
        use Primitive as P;
        let loc = &m.loc;
        match &m.ins {
            Instr::Seq(_) => match self.block(m, std::mem::take(stack))? {
                Exit::Values(values) => *stack = values,
                Exit::Failed(node) => return Ok(Some(node)),
            },

            // -- Stack manipulation --
            Instr::Drop(n) => {
                self.pop_n(stack, *n as usize, m)?;
            }
            Instr::Dup(n) => {
                let n = *n as usize;
                if n == 0 {
                    return Err(unsupported("`DUP 0`", loc));
                }
                self.need(stack, n, m)?;
                stack.push(stack[stack.len() - n]);
            }
            Instr::Dig(n) => {
                let n = *n as usize;
                self.need(stack, n + 1, m)?;
                self.lower(stack.len() - 1 - n);
                let v = stack.remove(stack.len() - 1 - n);
                stack.push(v);
            }
            Instr::Dug(n) => {
                let n = *n as usize;
                self.need(stack, n + 1, m)?;
                let v = self.pop(stack, m)?;
                self.lower(stack.len() - n);
                stack.insert(stack.len() - n, v);
            }
            Instr::Swap => {
                self.need(stack, 2, m)?;
                let len = stack.len();
                self.lower(len - 2);
                stack.swap(len - 1, len - 2);
            }
            Instr::Dip(n, body) => {
                let n = *n as usize;
                self.need(stack, n, m)?;
                let saved = stack.split_off(stack.len() - n);
                match self.block(body, std::mem::take(stack))? {
                    Exit::Values(values) => {
                        *stack = values;
                        stack.extend(saved);
                    }
                    Exit::Failed(node) => return Ok(Some(node)),
                }
            }
            Instr::Rename(name) => {
                self.need(stack, 1, m)?;
                if self.opts.use_annotations
                    && let Some(name) = name
                {
                    self.name_top(stack, name);
                }
            }

            // -- Constants and constructors --
            Instr::Push(ty, value) => {
                let id = self.constant(ty.clone(), value.clone(), loc);
                stack.push(id);
            }
            Instr::Unit => {
                let id = self.constant(Datatype::Unit, Const::Unit, loc);
                stack.push(id);
            }
            Instr::Nil(t) => {
                let id = self.constant(Datatype::list(t.clone()), Const::List(vec![]), loc);
                stack.push(id);
            }
            Instr::EmptySet(t) => {
                let id = self.constant(Datatype::set(t.clone()), Const::Set(vec![]), loc);
                stack.push(id);
            }
            Instr::EmptyMap(k, v) => {
                let ty = Datatype::map(k.clone(), v.clone());
                let id = self.constant(ty, Const::Map(vec![]), loc);
                stack.push(id);
            }
            Instr::EmptyBigMap(k, v) => {
                let ty = Datatype::big_map(k.clone(), v.clone());
                let id = self.constant(ty, Const::BigMap(vec![]), loc);
                stack.push(id);
            }
            Instr::None(t) => {
                let id = self.constant(Datatype::option(t.clone()), Const::None, loc);
                stack.push(id);
            }
            Instr::Some => {
                let x = self.pop(stack, m)?;
                self.prim(stack, m, P::Some, vec![x]);
            }
            Instr::Left(right) => {
                let x = self.pop(stack, m)?;
                self.value(stack, m, NodeKind::Constr(Constructor::Left(right.clone())), vec![x]);
            }
            Instr::Right(left) => {
                let x = self.pop(stack, m)?;
                self.value(stack, m, NodeKind::Constr(Constructor::Right(left.clone())), vec![x]);
            }
            Instr::Cons => {
                let args = self.pop_n(stack, 2, m)?;
                self.prim(stack, m, P::Cons, args);
            }
            Instr::Pair => {
                let args = self.pop_n(stack, 2, m)?;
                match self.whole_outputs(&args) {
                    Some(head) => stack.push(head),
                    None => self.prim(stack, m, P::Tuple, args),
                }
            }
            Instr::Car | Instr::Cdr => {
                let x = self.pop(stack, m)?;
                let index = usize::from(matches!(m.ins, Instr::Cdr));
                let id = self.project(x, index, loc);
                stack.push(id);
            }
            Instr::Unpair => {
                let x = self.pop(stack, m)?;
                let car = self.project(x, 0, loc);
                let cdr = self.project(x, 1, loc);
                stack.push(cdr);
                stack.push(car);
            }

            // -- Control --
            Instr::If(a, b) => return self.branch(m, IfForm::Bool, a, b, stack),
            Instr::IfNone(a, b) => return self.branch(m, IfForm::Option, a, b, stack),
            Instr::IfCons(a, b) => return self.branch(m, IfForm::List, a, b, stack),
            Instr::IfLeft(a, b) => return self.branch(m, IfForm::Or, a, b, stack),
            Instr::Loop(body) => self.repeat(m, LoopForm::Loop, body, stack)?,
            Instr::LoopLeft(body) => self.repeat(m, LoopForm::LoopLeft, body, stack)?,
            Instr::Iter(body) => self.repeat(m, LoopForm::Fold, body, stack)?,
            Instr::Map(body) => self.repeat(m, LoopForm::Map, body, stack)?,
            Instr::Lambda(arg_ty, ret_ty, body) => {
                self.lambda(m, arg_ty, ret_ty, body, stack)?;
            }
            Instr::Exec => {
                let args = self.pop_n(stack, 2, m)?;
                self.prim(stack, m, P::Exec, args);
            }
            Instr::Apply => {
                let [x, f] = self.pop_pair(stack, m)?;
                self.prim(stack, m, P::PartialApply, vec![f, x]);
            }
            Instr::Failwith => {
                let x = self.pop(stack, m)?;
                let id = self.append(NodeKind::Failwith, vec![x], Some(Datatype::Fail), loc);
                return Ok(Some(id));
            }

            // -- Comparison and arithmetic --
            Instr::Compare => {
                let args = self.pop_n(stack, 2, m)?;
                self.prim(stack, m, P::Compare, args);
            }
            Instr::Eq | Instr::Neq | Instr::Lt | Instr::Gt | Instr::Le | Instr::Ge => {
                let prim = comparison(&m.ins);
                let x = self.pop(stack, m)?;
                let node = self.g.node(x);
                let args = if self.opts.fold_comparisons
                    && node.kind == NodeKind::Prim(P::Compare)
                {
                    node.args.clone()
                } else {
                    let zero = self.constant(Datatype::Int, Const::int(0), loc);
                    vec![x, zero]
                };
                self.prim(stack, m, prim, args);
            }
            Instr::Add
            | Instr::Sub
            | Instr::Mul
            | Instr::Ediv
            | Instr::Lsl
            | Instr::Lsr
            | Instr::And
            | Instr::Or
            | Instr::Xor => {
                let args = self.pop_n(stack, 2, m)?;
                self.prim(stack, m, binary(&m.ins), args);
            }
            Instr::Abs | Instr::IsNat | Instr::Int | Instr::Neg | Instr::Not => {
                let x = self.pop(stack, m)?;
                self.prim(stack, m, unary(&m.ins), vec![x]);
            }

            // -- Collections, strings and bytes --
            Instr::Size => {
                let x = self.pop(stack, m)?;
                let prim = match self.g.node(x).ty {
                    Some(Datatype::String) => P::StringSize,
                    Some(Datatype::Bytes) => P::BytesSize,
                    _ => match self.coll_kind(x) {
                        CollKind::List => P::ListSize,
                        CollKind::Set => P::SetSize,
                        CollKind::Map => P::MapSize,
                        CollKind::Coll => P::CollSize,
                    },
                };
                self.prim(stack, m, prim, vec![x]);
            }
            Instr::Mem => {
                let args = self.pop_n(stack, 2, m)?;
                let prim = match self.coll_kind(args[1]) {
                    CollKind::Set => P::SetMem,
                    CollKind::Map => P::MapMem,
                    CollKind::List | CollKind::Coll => P::CollMem,
                };
                self.prim(stack, m, prim, args);
            }
            Instr::Get => {
                let args = self.pop_n(stack, 2, m)?;
                let prim = match self.coll_kind(args[1]) {
                    CollKind::Map => P::MapFind,
                    _ => P::CollFind,
                };
                self.prim(stack, m, prim, args);
            }
            Instr::Update => {
                let args = self.pop_n(stack, 3, m)?;
                let (prim, args) = self.update(args);
                self.prim(stack, m, prim, args);
            }
            Instr::Concat => {
                self.need(stack, 1, m)?;
                let top = stack[stack.len() - 1];
                match self.g.node(top).ty {
                    Some(Datatype::List(_)) => {
                        let x = self.pop(stack, m)?;
                        self.prim(stack, m, P::Concat, vec![x]);
                    }
                    Some(Datatype::Bytes) => {
                        let args = self.pop_n(stack, 2, m)?;
                        self.prim(stack, m, P::BytesConcat, args);
                    }
                    _ => {
                        let args = self.pop_n(stack, 2, m)?;
                        self.prim(stack, m, P::ConcatTwo, args);
                    }
                }
            }
            Instr::Slice => {
                let args = self.pop_n(stack, 3, m)?;
                let prim = match self.g.node(args[2]).ty {
                    Some(Datatype::Bytes) => P::BytesSub,
                    _ => P::StringSub,
                };
                self.prim(stack, m, prim, args);
            }
            Instr::Pack => {
                let x = self.pop(stack, m)?;
                self.prim(stack, m, P::Pack, vec![x]);
            }
            Instr::Unpack(ty) => {
                let x = self.pop(stack, m)?;
                self.value(stack, m, NodeKind::Unpack(ty.clone()), vec![x]);
            }

            // -- Context --
            Instr::Balance => self.prim(stack, m, P::Balance, vec![]),
            Instr::Now => self.prim(stack, m, P::Now, vec![]),
            Instr::Amount => self.prim(stack, m, P::Amount, vec![]),
            Instr::Source => self.prim(stack, m, P::Source, vec![]),
            Instr::Sender => self.prim(stack, m, P::Sender, vec![]),
            Instr::SelfContract => self.prim(stack, m, P::SelfContract, vec![]),
            Instr::StepsToQuota => self.prim(stack, m, P::Gas, vec![]),

            // -- Cryptography --
            Instr::Blake2b | Instr::Sha256 | Instr::Sha512 | Instr::HashKey => {
                let x = self.pop(stack, m)?;
                self.prim(stack, m, unary(&m.ins), vec![x]);
            }
            Instr::CheckSignature => {
                let args = self.pop_n(stack, 3, m)?;
                self.prim(stack, m, P::Check, args);
            }

            // -- Contracts and operations --
            Instr::Address => {
                let x = self.pop(stack, m)?;
                self.prim(stack, m, P::Address, vec![x]);
            }
            Instr::Contract(ty) => {
                let x = self.pop(stack, m)?;
                self.value(stack, m, NodeKind::ContractAt(ty.clone()), vec![x]);
            }
            Instr::TransferTokens => {
                let args = self.pop_n(stack, 3, m)?;
                self.value(stack, m, NodeKind::Transfer, args);
            }
            Instr::SetDelegate => {
                let x = self.pop(stack, m)?;
                self.prim(stack, m, P::SetDelegate, vec![x]);
            }
            Instr::ImplicitAccount => {
                let x = self.pop(stack, m)?;
                self.prim(stack, m, P::DefaultAccount, vec![x]);
            }
            Instr::CreateAccount => {
                let args = self.pop_n(stack, 4, m)?;
                self.originate(m, NodeKind::Prim(P::CreateAccount), args, stack);
            }
            Instr::CreateContract(contract) => {
                let args = self.pop_n(stack, 3, m)?;
                let code = self.nested_contract(contract)?;
                self.originate(m, NodeKind::CreateContract(Box::new(code)), args, stack);
            }
        }
        Ok(None)
    }

    fn pop_pair(&mut self, stack: &mut Stack, m: &Michelson) -> Result<[NodeId; 2], DecompileError> {
        let args = self.pop_n(stack, 2, m)?;
        Ok([args[0], args[1]])
    }

    fn nested_contract(
        &self,
        contract: &MicContract<Michelson>,
    ) -> Result<liquidity_ast::ContractCode<(), liquidity_ast::Syntax>, DecompileError> {
        crate::decompile_contract_with(contract, self.opts)
    }

    /// Push the operation and address produced by an origination.
    fn originate(&mut self, m: &Michelson, kind: NodeKind, args: Vec<NodeId>, stack: &mut Stack) {
        let ty = Some(Datatype::Tuple(vec![Datatype::Operation, Datatype::Address]));
        let head = self.append(kind, args, ty, &m.loc);
        let address = self.append(NodeKind::Output(1), vec![head], Some(Datatype::Address), &m.loc);
        let op = self.append(NodeKind::Output(0), vec![head], Some(Datatype::Operation), &m.loc);
        stack.push(address);
        stack.push(op);
    }

    /// `PAIR` of both outputs of one origination rebuilds its value.
    fn whole_outputs(&self, args: &[NodeId]) -> Option<NodeId> {
        if !self.opts.fold_pairs {
            return None;
        }
        let (car, cdr) = (self.g.node(args[0]), self.g.node(args[1]));
        match (&car.kind, &cdr.kind) {
            (NodeKind::Output(0), NodeKind::Output(1)) if car.args == cdr.args => Some(car.args[0]),
            _ => None,
        }
    }

    fn project(&mut self, x: NodeId, index: usize, loc: &Location) -> NodeId {
        let node = self.g.node(x);
        if self.opts.fold_pairs && node.kind == NodeKind::Prim(Primitive::Tuple) && node.args.len() == 2 {
            return node.args[index];
        }
        let i = self.constant(Datatype::Nat, Const::nat(index as u64), loc);
        let kind = NodeKind::Prim(Primitive::TupleGet);
        let ty = self.infer(&kind, &[x, i]);
        self.append(kind, vec![x, i], ty, loc)
    }

    /// Pick the update primitive from the collection and value shapes.
    fn update(&self, args: Vec<NodeId>) -> (Primitive, Vec<NodeId>) {
        let (key, value, coll) = (args[0], args[1], args[2]);
        let v = self.g.node(value);
        match self.coll_kind(coll) {
            CollKind::Map => match &v.kind {
                NodeKind::Prim(Primitive::Some) => (Primitive::MapAdd, vec![key, v.args[0], coll]),
                NodeKind::Const {
                    value: Const::None, ..
                } => (Primitive::MapRemove, vec![key, coll]),
                _ => (Primitive::MapUpdate, args),
            },
            CollKind::Set => match &v.kind {
                NodeKind::Const {
                    value: Const::Bool(true),
                    ..
                } => (Primitive::SetAdd, vec![key, coll]),
                NodeKind::Const {
                    value: Const::Bool(false),
                    ..
                } => (Primitive::SetRemove, vec![key, coll]),
                _ => (Primitive::SetUpdate, args),
            },
            CollKind::List | CollKind::Coll => (Primitive::CollUpdate, args),
        }
    }

    fn coll_kind(&self, id: NodeId) -> CollKind {
        match self.g.node(id).ty {
            Some(Datatype::List(_)) => CollKind::List,
            Some(Datatype::Set(_)) => CollKind::Set,
            Some(Datatype::Map(_, _) | Datatype::BigMap(_, _)) => CollKind::Map,
            _ => CollKind::Coll,
        }
    }

    // -- Conditionals --

    fn branch(
        &mut self,
        m: &Michelson,
        form: IfForm,
        ifthen: &Michelson,
        ifelse: &Michelson,
        stack: &mut Stack,
    ) -> Result<Option<NodeId>, DecompileError> {
        let scrutinee = self.pop(stack, m)?;
        let loc = &m.loc;
        let then_marker = self.g.add(NodeKind::IfThen, vec![], None, loc.clone());
        let else_marker = self.g.add(NodeKind::IfElse, vec![], None, loc.clone());
        let head = self.append(
            NodeKind::If {
                form,
                then_marker,
                else_marker,
                end: None,
            },
            vec![scrutinee],
            None,
            loc,
        );
        let scrutinee_ty = self.g.node(scrutinee).ty.clone();
        let (then_binds, else_binds) = branch_binds(form, scrutinee_ty.as_ref());

        let (then_exit, then_tail) = self.arm(then_marker, head, then_binds, ifthen, stack.clone())?;
        let (else_exit, else_tail) = self.arm(else_marker, head, else_binds, ifelse, stack.clone())?;
        self.cursor = head;

        let end = self.g.add(
            NodeKind::IfEnd {
                then_exit: Exit::Values(vec![]),
                else_exit: Exit::Values(vec![]),
                results: vec![],
            },
            vec![head],
            None,
            loc.clone(),
        );
        if matches!(then_exit, Exit::Values(_)) {
            self.g.link(then_tail, end);
        }
        if matches!(else_exit, Exit::Values(_)) {
            self.g.link(else_tail, end);
        }

        let (joined, results, then_exit, else_exit) = match (then_exit, else_exit) {
            (Exit::Failed(t), Exit::Failed(e)) => {
                self.close_if(head, end, Exit::Failed(t), Exit::Failed(e), vec![]);
                return Ok(Some(head));
            }
            (then_exit, else_exit) => {
                let then_vals = exit_values(&then_exit);
                let else_vals = exit_values(&else_exit);
                if let (Some(t), Some(e)) = (then_vals, else_vals)
                    && t.len() != e.len()
                {
                    return Err(DecompileError::BranchArity {
                        instr: m.ins.opcode(),
                        then_depth: t.len(),
                        else_depth: e.len(),
                        loc: loc.clone(),
                    });
                }
                let depth = then_vals.or(else_vals).map_or(0, Vec::len);
                let mut joined = Vec::with_capacity(depth);
                let mut results = Vec::new();
                let mut then_res = Vec::new();
                let mut else_res = Vec::new();
                for slot in 0..depth {
                    let t = then_vals.map(|v| v[slot]);
                    let e = else_vals.map(|v| v[slot]);
                    let same = match (t, e) {
                        (Some(t), Some(e)) => (t == e).then_some(t),
                        (Some(v), None) | (None, Some(v)) => Some(v),
                        (None, None) => None,
                    };
                    match same {
                        Some(v) if v < head => joined.push(v),
                        _ => {
                            let ty = [t, e]
                                .into_iter()
                                .flatten()
                                .find_map(|v| self.g.node(v).ty.clone());
                            let r = self.append(NodeKind::IfResult(results.len()), vec![head], ty, loc);
                            then_res.extend(t);
                            else_res.extend(e);
                            results.push(r);
                            joined.push(r);
                        }
                    }
                }
                let then_exit = match then_exit {
                    Exit::Values(_) => Exit::Values(then_res),
                    failed => failed,
                };
                let else_exit = match else_exit {
                    Exit::Values(_) => Exit::Values(else_res),
                    failed => failed,
                };
                (joined, results, then_exit, else_exit)
            }
        };
        trace!(head = %head, results = results.len(), "joined branches");
        self.close_if(head, end, then_exit, else_exit, results);
        *stack = joined;
        Ok(None)
    }

    fn close_if(&mut self, head: NodeId, end: NodeId, then_exit: Exit, else_exit: Exit, results: Vec<NodeId>) {
        self.g.node_mut(end).kind = NodeKind::IfEnd {
            then_exit,
            else_exit,
            results,
        };
        if let NodeKind::If { end: slot, .. } = &mut self.g.node_mut(head).kind {
            *slot = Some(end);
        }
    }

    /// Run one branch from its marker. Returns how it ends and the last node
    /// of its chain.
    fn arm(
        &mut self,
        marker: NodeId,
        head: NodeId,
        binds: Vec<Option<Datatype>>,
        code: &Michelson,
        mut stack: Stack,
    ) -> Result<(Exit, NodeId), DecompileError> {
        self.cursor = marker;
        let loc = self.g.node(marker).loc.clone();
        let mut bound = Vec::with_capacity(binds.len());
        for ty in binds {
            bound.push(self.append(NodeKind::BranchValue, vec![head], ty, &loc));
        }
        // Values are bound in pushing order, except for lists whose head ends
        // up on top of the tail.
        if let NodeKind::If {
            form: IfForm::List, ..
        } = self.g.node(head).kind
            && bound.len() == 2
        {
            bound.swap(0, 1);
        }
        stack.extend(bound);
        let exit = self.block(code, stack)?;
        Ok((exit, self.cursor))
    }

    // -- Loops --

    fn repeat(
        &mut self,
        m: &Michelson,
        form: LoopForm,
        body: &Michelson,
        stack: &mut Stack,
    ) -> Result<(), DecompileError> {
        let input = self.pop(stack, m)?;
        let loc = &m.loc;
        let input_ty = self.g.node(input).ty.clone();
        let begin_ty = match (form, &input_ty) {
            (LoopForm::LoopLeft, Some(Datatype::Or(l, _))) => Some((**l).clone()),
            (LoopForm::Fold | LoopForm::Map, Some(t)) => element_type(t),
            _ => None,
        };
        let begin = self.g.add(NodeKind::LoopBegin(form), vec![], begin_ty, loc.clone());
        let head = self.append(
            NodeKind::Loop {
                form,
                begin,
                end: None,
                carried: vec![],
                result: None,
            },
            vec![input],
            None,
            loc,
        );
        self.g.node_mut(begin).args = vec![head];

        self.cursor = begin;
        let mut placeholders = Vec::with_capacity(stack.len());
        for (slot, &init) in stack.iter().enumerate() {
            let (ty, name) = {
                let n = self.g.node(init);
                (n.ty.clone(), n.name.clone())
            };
            let p = self.append(NodeKind::Carried { slot }, vec![head], ty, loc);
            self.g.node_mut(p).name = name;
            placeholders.push(p);
        }
        let mut body_stack = placeholders.clone();
        if form != LoopForm::Loop {
            body_stack.push(begin);
        }

        let outer_water = self.low_water;
        let values = match self.block(body, body_stack)? {
            Exit::Values(values) => values,
            Exit::Failed(_) => return Err(unsupported("a loop body that always fails", loc)),
        };
        let expected = placeholders.len() + usize::from(form != LoopForm::Fold);
        if values.len() != expected {
            return Err(DecompileError::LoopArity {
                instr: m.ins.opcode(),
                expected,
                found: values.len(),
                loc: loc.clone(),
            });
        }
        self.low_water = outer_water;
        if let Some(slot) = (0..placeholders.len()).find(|&i| values[i] != placeholders[i]) {
            self.lower(slot);
        }
        let value = (form != LoopForm::Fold).then(|| values[values.len() - 1]);
        let end = self.g.add(NodeKind::LoopEnd { form, value }, vec![head], None, loc.clone());
        self.g.link(self.cursor, end);
        self.g.link(end, begin);
        self.cursor = head;

        let mut carried = Vec::with_capacity(placeholders.len());
        for (slot, (&placeholder, &init)) in placeholders.iter().zip(stack.iter()).enumerate() {
            let update = (values[slot] != placeholder).then_some(values[slot]);
            let result = match update {
                Some(_) => {
                    let ty = self.g.node(init).ty.clone();
                    let r = self.append(NodeKind::LoopResult(Some(slot)), vec![head], ty, loc);
                    Some(r)
                }
                None => None,
            };
            carried.push(CarriedSlot {
                placeholder,
                init,
                update,
                result,
            });
        }
        *stack = carried
            .iter()
            .map(|c| c.result.unwrap_or(c.init))
            .collect();
        let own = match form {
            LoopForm::LoopLeft => {
                let ty = match &input_ty {
                    Some(Datatype::Or(_, r)) => Some((**r).clone()),
                    _ => None,
                };
                Some(self.append(NodeKind::LoopResult(None), vec![head], ty, loc))
            }
            LoopForm::Map => {
                let elt = value.and_then(|v| self.g.node(v).ty.clone());
                let ty = match (&input_ty, elt) {
                    (Some(Datatype::List(_)), Some(t)) => Some(Datatype::list(t)),
                    (Some(Datatype::Map(k, _)), Some(t)) => Some(Datatype::map((**k).clone(), t)),
                    _ => None,
                };
                Some(self.append(NodeKind::LoopResult(None), vec![head], ty, loc))
            }
            LoopForm::Loop | LoopForm::Fold => None,
        };
        stack.extend(own);
        trace!(head = %head, form = ?form, "closed loop");
        if let NodeKind::Loop {
            end: end_slot,
            carried: carried_slot,
            result,
            ..
        } = &mut self.g.node_mut(head).kind
        {
            *end_slot = Some(end);
            *carried_slot = carried;
            *result = own;
        }
        Ok(())
    }

    // -- Functions --

    fn lambda(
        &mut self,
        m: &Michelson,
        arg_ty: &Datatype,
        ret_ty: &Datatype,
        body: &Michelson,
        stack: &mut Stack,
    ) -> Result<(), DecompileError> {
        let loc = &m.loc;
        let begin = self
            .g
            .add(NodeKind::LambdaBegin, vec![], Some(arg_ty.clone()), loc.clone());
        let head = self.append(
            NodeKind::Lambda {
                arg_ty: arg_ty.clone(),
                ret_ty: ret_ty.clone(),
                begin,
                end: None,
            },
            vec![],
            Some(Datatype::lambda(arg_ty.clone(), ret_ty.clone())),
            loc,
        );
        self.g.node_mut(begin).args = vec![head];
        self.cursor = begin;
        let outer_water = self.low_water;
        let exit = self.block(body, vec![begin]);
        self.low_water = outer_water;
        let exit = match exit? {
            Exit::Values(values) if values.len() == 1 => Exit::Values(values),
            Exit::Values(values) => {
                return Err(DecompileError::LambdaArity {
                    found: values.len(),
                    loc: loc.clone(),
                });
            }
            failed => failed,
        };
        let succeeded = matches!(exit, Exit::Values(_));
        let end = self.g.add(NodeKind::LambdaEnd(exit), vec![head], None, loc.clone());
        if succeeded {
            self.g.link(self.cursor, end);
        }
        self.cursor = head;
        if let NodeKind::Lambda { end: slot, .. } = &mut self.g.node_mut(head).kind {
            *slot = Some(end);
        }
        stack.push(head);
        Ok(())
    }

    // -- Types --

    /// Best-effort result type of a node. Only used to pick primitive
    /// families and loop element types.
    fn infer(&self, kind: &NodeKind, args: &[NodeId]) -> Option<Datatype> {
        use Primitive as P;
        let ty = |i: usize| args.get(i).and_then(|a| self.g.node(*a).ty.clone());
        match kind {
            NodeKind::Const { ty, .. } => Some(ty.clone()),
            NodeKind::Constr(Constructor::Left(right)) => Some(Datatype::or(ty(0)?, right.clone())),
            NodeKind::Constr(Constructor::Right(left)) => Some(Datatype::or(left.clone(), ty(0)?)),
            NodeKind::ContractAt(param) => Some(Datatype::option(Datatype::Contract(
                ContractSig::single_entry(param.clone()),
            ))),
            NodeKind::Unpack(t) => Some(Datatype::option(t.clone())),
            NodeKind::Transfer => Some(Datatype::Operation),
            NodeKind::Prim(prim) => match prim {
                P::Tuple => Some(Datatype::pair(ty(0)?, ty(1)?)),
                P::TupleGet => {
                    let index = match &self.g.node(*args.get(1)?).kind {
                        NodeKind::Const { value, .. } => value.as_index()?,
                        _ => return None,
                    };
                    ty(0)?.tuple_components()?.get(index).cloned()
                }
                P::Some => Some(Datatype::option(ty(0)?)),
                P::Cons => ty(1).or_else(|| ty(0).map(Datatype::list)),
                P::Compare => Some(Datatype::Int),
                P::Eq | P::Neq | P::Lt | P::Le | P::Gt | P::Ge => Some(Datatype::Bool),
                P::MapMem | P::SetMem | P::CollMem | P::Check => Some(Datatype::Bool),
                P::Add | P::Mul | P::Ediv => match (ty(0)?, ty(1)?) {
                    (a, b) if a == b && *prim != P::Ediv => Some(a),
                    (Datatype::Timestamp, _) | (_, Datatype::Timestamp) => Some(Datatype::Timestamp),
                    (Datatype::Tez, _) | (_, Datatype::Tez) => Some(Datatype::Tez),
                    _ => Some(Datatype::Int),
                },
                P::Sub => match (ty(0)?, ty(1)?) {
                    (Datatype::Tez, Datatype::Tez) => Some(Datatype::Tez),
                    (Datatype::Timestamp, Datatype::Int) => Some(Datatype::Timestamp),
                    _ => Some(Datatype::Int),
                },
                P::Abs => Some(Datatype::Nat),
                P::IsNat => Some(Datatype::option(Datatype::Nat)),
                P::Int | P::Neg => Some(Datatype::Int),
                P::Not | P::And | P::Or | P::Xor => ty(0),
                P::Lsl | P::Lsr => Some(Datatype::Nat),
                P::MapSize
                | P::SetSize
                | P::ListSize
                | P::CollSize
                | P::StringSize
                | P::BytesSize
                | P::Gas => Some(Datatype::Nat),
                P::MapFind | P::CollFind => match ty(1)? {
                    Datatype::Map(_, v) | Datatype::BigMap(_, v) => Some(Datatype::Option(v)),
                    _ => None,
                },
                P::MapAdd | P::MapUpdate => ty(2),
                P::MapRemove | P::SetAdd | P::SetRemove => ty(1),
                P::SetUpdate | P::CollUpdate => ty(2),
                P::ListRev => ty(0),
                P::Concat | P::ConcatTwo => Some(Datatype::String),
                P::BytesConcat | P::Pack | P::Blake2b | P::Sha256 | P::Sha512 => Some(Datatype::Bytes),
                P::StringSub => Some(Datatype::option(Datatype::String)),
                P::BytesSub => Some(Datatype::option(Datatype::Bytes)),
                P::HashKey => Some(Datatype::KeyHash),
                P::Balance | P::Amount => Some(Datatype::Tez),
                P::Now => Some(Datatype::Timestamp),
                P::Source | P::Sender | P::Address => Some(Datatype::Address),
                P::SetDelegate => Some(Datatype::Operation),
                P::DefaultAccount => Some(Datatype::Contract(ContractSig::single_entry(Datatype::Unit))),
                P::Exec => match ty(1)? {
                    Datatype::Lambda(_, ret) => Some(*ret),
                    Datatype::Closure { ret, .. } => Some(*ret),
                    _ => None,
                },
                P::PartialApply => match ty(0)? {
                    Datatype::Lambda(arg, ret) => {
                        let rest = arg.tuple_components()?.get(1)?.clone();
                        Some(Datatype::Lambda(Box::new(rest), ret))
                    }
                    _ => None,
                },
                _ => None,
            },
            _ => None,
        }
    }
}

fn exit_values(exit: &Exit) -> Option<&Vec<NodeId>> {
    match exit {
        Exit::Values(values) => Some(values),
        Exit::Failed(_) => None,
    }
}

/// Types of the values each arm binds, in pushing order.
fn branch_binds(form: IfForm, ty: Option<&Datatype>) -> (Vec<Option<Datatype>>, Vec<Option<Datatype>>) {
    match (form, ty) {
        (IfForm::Bool, _) => (vec![], vec![]),
        (IfForm::Option, Some(Datatype::Option(t))) => (vec![], vec![Some((**t).clone())]),
        (IfForm::Option, _) => (vec![], vec![None]),
        (IfForm::List, Some(list @ Datatype::List(t))) => {
            (vec![Some((**t).clone()), Some(list.clone())], vec![])
        }
        (IfForm::List, _) => (vec![None, None], vec![]),
        (IfForm::Or, Some(Datatype::Or(l, r))) => {
            (vec![Some((**l).clone())], vec![Some((**r).clone())])
        }
        (IfForm::Or, _) => (vec![None], vec![None]),
    }
}

fn element_type(coll: &Datatype) -> Option<Datatype> {
    match coll {
        Datatype::List(t) | Datatype::Set(t) => Some((**t).clone()),
        Datatype::Map(k, v) | Datatype::BigMap(k, v) => Some(Datatype::pair((**k).clone(), (**v).clone())),
        _ => None,
    }
}

fn comparison(ins: &Instr<Michelson>) -> Primitive {
    match ins {
        Instr::Eq => Primitive::Eq,
        Instr::Neq => Primitive::Neq,
        Instr::Lt => Primitive::Lt,
        Instr::Gt => Primitive::Gt,
        Instr::Le => Primitive::Le,
        _ => Primitive::Ge,
    }
}

fn binary(ins: &Instr<Michelson>) -> Primitive {
    match ins {
        Instr::Add => Primitive::Add,
        Instr::Sub => Primitive::Sub,
        Instr::Mul => Primitive::Mul,
        Instr::Ediv => Primitive::Ediv,
        Instr::Lsl => Primitive::Lsl,
        Instr::Lsr => Primitive::Lsr,
        Instr::And => Primitive::And,
        Instr::Or => Primitive::Or,
        _ => Primitive::Xor,
    }
}

fn unary(ins: &Instr<Michelson>) -> Primitive {
    match ins {
        Instr::Abs => Primitive::Abs,
        Instr::IsNat => Primitive::IsNat,
        Instr::Int => Primitive::Int,
        Instr::Neg => Primitive::Neg,
        Instr::Not => Primitive::Not,
        Instr::Blake2b => Primitive::Blake2b,
        Instr::Sha256 => Primitive::Sha256,
        Instr::Sha512 => Primitive::Sha512,
        _ => Primitive::HashKey,
    }
}

fn unsupported(what: &str, loc: &Location) -> DecompileError {
    DecompileError::Unsupported {
        what: what.to_string(),
        loc: loc.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(code: Vec<Michelson>, inputs: &[(&str, Datatype)]) -> (Graph, Result<Exit, DecompileError>) {
        let opts = DecompileOptions::default();
        let mut interp = Interp::new(&opts);
        let stack: Vec<NodeId> = inputs.iter().rev().map(|(n, t)| interp.input(n, t)).collect();
        let exit = interp.block(&Michelson::seq(code), stack.clone());
        let graph = interp.finish(stack, exit.clone().unwrap_or(Exit::Values(vec![])));
        (graph, exit)
    }

    fn ins(i: Instr<Michelson>) -> Michelson {
        Michelson::new(i)
    }

    #[test]
    fn dup_aliases_the_node() {
        let (_, exit) = run(vec![ins(Instr::Dup(1))], &[("x", Datatype::Int)]);
        let Exit::Values(stack) = exit.unwrap() else {
            panic!("expected values")
        };
        assert_eq!(stack.len(), 2);
        assert_eq!(stack[0], stack[1]);
    }

    #[test]
    fn popped_slots_are_not_untouched() {
        let code = vec![ins(Instr::Dup(1)), Michelson::dip(1, vec![ins(Instr::Drop(1))])];
        let (graph, _) = run(code, &[("x", Datatype::Int)]);
        assert_eq!(graph.untouched, 0);

        let (graph, _) = run(vec![ins(Instr::Unit)], &[("x", Datatype::Int), ("y", Datatype::Int)]);
        assert_eq!(graph.untouched, 2);

        let (graph, _) = run(vec![ins(Instr::Swap)], &[("x", Datatype::Int), ("y", Datatype::Int)]);
        assert_eq!(graph.untouched, 0);
    }

    #[test]
    fn lambda_bodies_do_not_lower_the_mark() {
        let code = vec![ins(Instr::Lambda(
            Datatype::Int,
            Datatype::Int,
            Box::new(Michelson::seq(vec![ins(Instr::Drop(1)), ins(Instr::Push(Datatype::Int, Const::int(1)))])),
        ))];
        let (graph, _) = run(code, &[("x", Datatype::Int)]);
        assert_eq!(graph.untouched, 1);
    }

    #[test]
    fn comparisons_fold_into_one_node() {
        let code = vec![ins(Instr::Dup(2)), ins(Instr::Dup(2)), ins(Instr::Compare), ins(Instr::Lt)];
        let (graph, exit) = run(code, &[("a", Datatype::Int), ("b", Datatype::Int)]);
        let Exit::Values(stack) = exit.unwrap() else {
            panic!("expected values")
        };
        let top = graph.node(*stack.last().unwrap());
        assert_eq!(top.kind, NodeKind::Prim(Primitive::Lt));
        let names: Vec<_> = top.args.iter().map(|a| graph.node(*a).name.clone().unwrap()).collect();
        assert_eq!(names, ["a", "b"]);
    }

    #[test]
    fn underflow_reports_the_instruction() {
        let (_, exit) = run(vec![ins(Instr::Add)], &[("x", Datatype::Int)]);
        assert!(matches!(
            exit,
            Err(DecompileError::StackUnderflow {
                instr: "ADD",
                needed: 2,
                found: 1,
                ..
            })
        ));
    }

    #[test]
    fn code_after_failwith_is_rejected() {
        let code = vec![ins(Instr::Failwith), ins(Instr::Unit)];
        let (_, exit) = run(code, &[("x", Datatype::Int)]);
        assert!(matches!(exit, Err(DecompileError::UnreachableCode { instr: "UNIT", .. })));
    }

    #[test]
    fn branches_must_agree_on_depth() {
        let code = vec![ins(Instr::If(
            Box::new(Michelson::seq(vec![ins(Instr::Unit)])),
            Box::new(Michelson::seq(vec![])),
        ))];
        let (_, exit) = run(code, &[("b", Datatype::Bool)]);
        assert!(matches!(
            exit,
            Err(DecompileError::BranchArity {
                then_depth: 1,
                else_depth: 0,
                ..
            })
        ));
    }

    #[test]
    fn failing_branch_adopts_the_other_stack() {
        let code = vec![
            ins(Instr::Dup(1)),
            ins(Instr::If(
                Box::new(Michelson::seq(vec![ins(Instr::Unit), ins(Instr::Failwith)])),
                Box::new(Michelson::seq(vec![ins(Instr::Push(Datatype::Int, Const::int(1)))])),
            )),
        ];
        let (graph, exit) = run(code, &[("b", Datatype::Bool)]);
        let Exit::Values(stack) = exit.unwrap() else {
            panic!("expected values")
        };
        assert_eq!(stack.len(), 2);
        let result = graph.node(stack[1]);
        assert_eq!(result.kind, NodeKind::IfResult(0));
        assert_eq!(result.ty, Some(Datatype::Int));
    }

    #[test]
    fn untouched_loop_slots_are_invariant() {
        // Sum a list into the accumulator below it; the list input is kept.
        let code = vec![
            ins(Instr::Push(Datatype::Int, Const::int(0))),
            ins(Instr::Dup(2)),
            ins(Instr::Iter(Box::new(Michelson::seq(vec![ins(Instr::Add)])))),
        ];
        let (graph, exit) = run(code, &[("l", Datatype::list(Datatype::Int))]);
        let Exit::Values(stack) = exit.unwrap() else {
            panic!("expected values")
        };
        assert_eq!(graph.node(stack[0]).name.as_deref(), Some("l"));
        assert_eq!(graph.node(stack[1]).kind, NodeKind::LoopResult(Some(1)));
        let head = graph.node(stack[1]).args[0];
        let NodeKind::Loop { carried, .. } = &graph.node(head).kind else {
            panic!("expected a loop head")
        };
        assert!(carried[0].update.is_none());
        assert!(carried[1].update.is_some());
    }

    #[test]
    fn lambda_body_must_leave_one_value() {
        let code = vec![ins(Instr::Lambda(
            Datatype::Int,
            Datatype::Int,
            Box::new(Michelson::seq(vec![ins(Instr::Dup(1))])),
        ))];
        let (_, exit) = run(code, &[]);
        assert!(matches!(exit, Err(DecompileError::LambdaArity { found: 2, .. })));
    }
}
