//! Rebuild expressions from a decompiled graph.
//!
//! A first pass marks the live nodes and counts how often each one is read.
//! Emission then walks each chain in order: effectful nodes are bound or
//! sequenced where they occur, pure nodes read several times are let-bound,
//! and everything else is inlined at its single use.

use std::collections::{HashMap, HashSet};

use index_vec::IndexVec;
use liquidity_ast::{
    Constructor, ExpDesc, Inline, LoopAcc, MatchCase, Pattern, SyntaxExp,
};
use liquidity_prims::{CollKind, FoldPrimitive, MapFoldPrimitive, MapPrimitive, Primitive};
use liquidity_types::{Const, ContractSig, Datatype};
use tracing::trace;

use crate::DecompileOptions;
use crate::graph::{Exit, Graph, IfForm, LoopForm, NodeId, NodeKind};

pub(crate) fn reconstruct(graph: &Graph, opts: &DecompileOptions) -> SyntaxExp {
    let mut r = Reconstructor::new(graph, opts);
    let roots = r.top_roots();
    r.visit_block(graph.start, &roots);
    r.fuse_tuples();
    r.block(graph.start, |r| r.results(&roots))
}

fn mk(desc: ExpDesc<(), liquidity_ast::Syntax>) -> SyntaxExp {
    SyntaxExp::mk(desc, ())
}

fn var(name: &str) -> SyntaxExp {
    SyntaxExp::var(name, ())
}

fn unit() -> SyntaxExp {
    SyntaxExp::constant(Datatype::Unit, Const::Unit, ())
}

fn tuple(items: Vec<SyntaxExp>) -> SyntaxExp {
    match items.len() {
        0 => unit(),
        1 => items.into_iter().next().unwrap_or_else(unit),
        _ => SyntaxExp::apply(Primitive::Tuple, items, ()),
    }
}

fn tuple_get(e: SyntaxExp, index: usize) -> SyntaxExp {
    let i = SyntaxExp::constant(Datatype::Nat, Const::nat(index as u64), ());
    SyntaxExp::apply(Primitive::TupleGet, vec![e, i], ())
}

fn project(mut e: SyntaxExp, path: &[usize]) -> SyntaxExp {
    for &i in path {
        e = tuple_get(e, i);
    }
    e
}

/// Paths of the components of a right comb of `n` values.
fn comb_paths(n: usize) -> Vec<Vec<usize>> {
    (0..n)
        .map(|i| {
            let mut path = vec![1; i];
            if i + 1 < n {
                path.push(0);
            }
            path
        })
        .collect()
}

fn coll_kind(ty: Option<&Datatype>) -> CollKind {
    match ty {
        Some(Datatype::List(_)) => CollKind::List,
        Some(Datatype::Set(_)) => CollKind::Set,
        Some(Datatype::Map(_, _) | Datatype::BigMap(_, _)) => CollKind::Map,
        _ => CollKind::Coll,
    }
}

enum Binding {
    Let(NodeId),
    Seq(NodeId),
}

struct Reconstructor<'g> {
    g: &'g Graph,
    opts: &'g DecompileOptions,
    visited: IndexVec<NodeId, bool>,
    uses: IndexVec<NodeId, u32>,
    effectful: IndexVec<NodeId, bool>,
    /// Nodes read through a variable.
    names: HashMap<NodeId, String>,
    taken: HashSet<String>,
    /// Nodes replaced by a fixed expression.
    aliases: HashMap<NodeId, SyntaxExp>,
    /// Effectful node that may still be inlined into the current block's
    /// result, and whether that happened.
    pending: Option<NodeId>,
    consumed: bool,
    /// Tuples rebuilt from the parts of one value, keyed by their items.
    fused: HashMap<Vec<NodeId>, NodeId>,
    /// Constructs whose results are only read together, in order.
    fused_heads: HashSet<NodeId>,
}

impl<'g> Reconstructor<'g> {
    fn new(g: &'g Graph, opts: &'g DecompileOptions) -> Self {
        let n = g.len();
        let mut r = Self {
            g,
            opts,
            visited: IndexVec::from_vec(vec![false; n]),
            uses: IndexVec::from_vec(vec![0; n]),
            effectful: IndexVec::from_vec(vec![false; n]),
            names: HashMap::new(),
            taken: HashSet::new(),
            aliases: HashMap::new(),
            pending: None,
            consumed: false,
            fused: HashMap::new(),
            fused_heads: HashSet::new(),
        };
        for &input in &g.inputs {
            if let Some(name) = &g.node(input).name {
                r.taken.insert(name.clone());
            }
        }
        r.compute_effects();
        r
    }

    // -- Analysis --

    /// Nodes inside a construct are numbered after its head, so a reverse
    /// sweep sees every body before the construct that owns it.
    fn compute_effects(&mut self) {
        for raw in (0..self.g.len()).rev() {
            let id = NodeId::new(raw);
            let effectful = match &self.g.node(id).kind {
                NodeKind::Failwith | NodeKind::Transfer | NodeKind::CreateContract(_) => true,
                NodeKind::Prim(p) => p.can_fail() || p.transfers(),
                NodeKind::If { .. } | NodeKind::Loop { .. } => self
                    .blocks(id)
                    .iter()
                    .any(|(marker, _)| self.g.chain(*marker).iter().any(|n| self.effectful[*n])),
                _ => false,
            };
            self.effectful[id] = effectful;
        }
    }

    fn resolve(&self, mut id: NodeId) -> NodeId {
        loop {
            let node = self.g.node(id);
            if let NodeKind::Carried { slot } = node.kind
                && let NodeKind::Loop { carried, .. } = &self.g.node(node.args[0]).kind
                && let Some(c) = carried.get(slot)
                && c.update.is_none()
            {
                id = c.init;
                continue;
            }
            return id;
        }
    }

    /// Payload of the initial or-value of a loop-left, when it is a literal
    /// `Left`.
    fn peeled(&self, input: NodeId) -> Option<NodeId> {
        let node = self.g.node(self.resolve(input));
        match node.kind {
            NodeKind::Constr(Constructor::Left(_)) => Some(node.args[0]),
            _ => None,
        }
    }

    /// Nodes read directly by the expression of `id`.
    fn deps(&self, id: NodeId) -> Vec<NodeId> {
        let node = self.g.node(id);
        match &node.kind {
            NodeKind::Loop { form, carried, .. } => {
                let input = match form {
                    LoopForm::LoopLeft => self.peeled(node.args[0]).unwrap_or(node.args[0]),
                    _ => node.args[0],
                };
                let mut deps = vec![input];
                deps.extend(carried.iter().filter(|c| c.update.is_some()).map(|c| c.init));
                deps
            }
            NodeKind::Lambda { .. } => vec![],
            NodeKind::Start
            | NodeKind::Input
            | NodeKind::Const { .. }
            | NodeKind::IfThen
            | NodeKind::IfElse
            | NodeKind::BranchValue
            | NodeKind::LoopBegin(_)
            | NodeKind::Carried { .. }
            | NodeKind::LambdaBegin
            | NodeKind::IfEnd { .. }
            | NodeKind::LoopEnd { .. }
            | NodeKind::LambdaEnd(_) => vec![],
            _ => node.args.clone(),
        }
    }

    /// Sub-chains of a construct with the values each one must produce.
    fn blocks(&self, id: NodeId) -> Vec<(NodeId, Vec<NodeId>)> {
        match &self.g.node(id).kind {
            NodeKind::If {
                then_marker,
                else_marker,
                end: Some(end),
                ..
            } => match &self.g.node(*end).kind {
                NodeKind::IfEnd {
                    then_exit,
                    else_exit,
                    ..
                } => vec![
                    (*then_marker, exit_roots(then_exit)),
                    (*else_marker, exit_roots(else_exit)),
                ],
                _ => vec![],
            },
            NodeKind::Loop {
                begin,
                end: Some(end),
                carried,
                ..
            } => {
                let mut roots = Vec::new();
                if let NodeKind::LoopEnd { value: Some(v), .. } = &self.g.node(*end).kind {
                    roots.push(*v);
                }
                roots.extend(carried.iter().filter_map(|c| c.update));
                vec![(*begin, roots)]
            }
            NodeKind::Lambda {
                begin,
                end: Some(end),
                ..
            } => match &self.g.node(*end).kind {
                NodeKind::LambdaEnd(exit) => vec![(*begin, exit_roots(exit))],
                _ => vec![],
            },
            _ => vec![],
        }
    }

    fn visit(&mut self, id: NodeId) {
        let id = self.resolve(id);
        if self.visited[id] {
            return;
        }
        self.visited[id] = true;
        for dep in self.deps(id) {
            let dep = self.resolve(dep);
            self.uses[dep] += 1;
            self.visit(dep);
        }
        for (marker, roots) in self.blocks(id) {
            self.visit_block(marker, &roots);
        }
    }

    fn visit_block(&mut self, marker: NodeId, roots: &[NodeId]) {
        for &root in roots {
            let root = self.resolve(root);
            self.uses[root] += 1;
            self.visit(root);
        }
        for id in self.g.chain(marker) {
            if self.effectful[id] {
                self.visit(id);
            }
        }
    }

    /// Find tuples that only reassemble a value taken apart on the stack:
    /// `(x.0, x.1)` after an `UNPAIR`, or all results of a construct in slot
    /// order. Such a tuple is emitted as the value itself.
    fn fuse_tuples(&mut self) {
        let mut sites = Vec::new();
        for raw in 0..self.g.len() {
            let id = NodeId::new(raw);
            if !self.visited[id] {
                continue;
            }
            let node = self.g.node(id);
            match &node.kind {
                NodeKind::Prim(Primitive::Tuple) if node.args.len() >= 2 => sites.push(node.args.clone()),
                NodeKind::Loop {
                    form,
                    end: Some(end),
                    carried,
                    ..
                } if *form != LoopForm::Fold => {
                    let updates: Vec<NodeId> = carried.iter().filter_map(|c| c.update).collect();
                    if let (NodeKind::LoopEnd { value: Some(v), .. }, [u]) =
                        (&self.g.node(*end).kind, updates.as_slice())
                    {
                        sites.push(vec![*v, *u]);
                    }
                }
                NodeKind::If { .. } => {
                    for (_, roots) in self.blocks(id) {
                        if roots.len() >= 2 {
                            sites.push(roots);
                        }
                    }
                }
                _ => {}
            }
        }
        for site in sites {
            let site: Vec<NodeId> = site.iter().map(|&id| self.resolve(id)).collect();
            if self.fused.contains_key(&site) {
                continue;
            }
            let Some(whole) = self.fusable(&site) else {
                continue;
            };
            trace!(whole = %whole, parts = site.len(), "fused tuple");
            if self.is_construct(whole) {
                self.fused_heads.insert(whole);
            } else {
                self.uses[whole] = 1;
            }
            self.fused.insert(site, whole);
        }
    }

    fn fusable(&self, site: &[NodeId]) -> Option<NodeId> {
        if site.iter().any(|&id| self.uses[id] != 1) {
            return None;
        }
        if let [a, b] = site
            && let (Some((x, 0)), Some((y, 1))) = (self.projection(*a), self.projection(*b))
            && x == y
            && self.uses[x] == 2
        {
            return Some(x);
        }
        let head = match self.g.node(site[0]).kind {
            NodeKind::IfResult(_) | NodeKind::LoopResult(_) => self.g.node(site[0]).args[0],
            _ => return None,
        };
        let results = self.construct_results(head);
        let in_order = results.len() == site.len()
            && results
                .iter()
                .zip(site)
                .enumerate()
                .all(|(i, ((r, path), s))| r == s && path.as_slice() == [i]);
        in_order.then_some(head)
    }

    /// `(x, i)` when `id` reads the `i`-th component of `x`.
    fn projection(&self, id: NodeId) -> Option<(NodeId, usize)> {
        let node = self.g.node(id);
        if node.kind != NodeKind::Prim(Primitive::TupleGet) {
            return None;
        }
        match &self.g.node(node.args[1]).kind {
            NodeKind::Const { value, .. } => Some((self.resolve(node.args[0]), value.as_index()?)),
            _ => None,
        }
    }

    /// Values the whole code produces: the final stack minus the bottom
    /// part it never popped.
    fn top_roots(&self) -> Vec<NodeId> {
        match &self.g.exit {
            Exit::Failed(node) => vec![*node],
            Exit::Values(stack) => {
                let kept = stack
                    .iter()
                    .zip(&self.g.inputs)
                    .take(self.g.untouched)
                    .take_while(|(a, b)| a == b)
                    .count();
                stack[kept..].to_vec()
            }
        }
    }

    fn results(&mut self, roots: &[NodeId]) -> SyntaxExp {
        if let Exit::Failed(node) = self.g.exit {
            return self.expr(node);
        }
        let items = roots.iter().rev().map(|&id| self.expr(id)).collect();
        tuple(items)
    }

    // -- Constructs --

    /// Result nodes of a construct with their path inside its value.
    fn construct_results(&self, head: NodeId) -> Vec<(NodeId, Vec<usize>)> {
        match &self.g.node(head).kind {
            NodeKind::If { end: Some(end), .. } => match &self.g.node(*end).kind {
                NodeKind::IfEnd { results, .. } if results.len() == 1 => vec![(results[0], vec![])],
                NodeKind::IfEnd { results, .. } => results
                    .iter()
                    .enumerate()
                    .map(|(i, r)| (*r, vec![i]))
                    .collect(),
                _ => vec![],
            },
            NodeKind::Loop {
                carried, result, ..
            } => {
                let own = *result;
                let state: Vec<NodeId> = carried.iter().filter_map(|c| c.result).collect();
                let state_paths: Vec<Vec<usize>> = if state.len() == 1 {
                    vec![vec![]]
                } else {
                    (0..state.len()).map(|i| vec![i]).collect()
                };
                match own {
                    None => state.into_iter().zip(state_paths).collect(),
                    Some(own) if state.is_empty() => vec![(own, vec![])],
                    Some(own) => std::iter::once((own, vec![0]))
                        .chain(state.into_iter().zip(state_paths).map(|(s, mut p)| {
                            p.insert(0, 1);
                            (s, p)
                        }))
                        .collect(),
                }
            }
            _ => vec![],
        }
    }

    fn is_construct(&self, id: NodeId) -> bool {
        matches!(self.g.node(id).kind, NodeKind::If { .. } | NodeKind::Loop { .. })
    }

    /// A construct whose only result is read once can sit at that read.
    fn single_use(&self, id: NodeId) -> bool {
        if !self.is_construct(id) {
            return self.uses[id] == 1;
        }
        if self.fused_heads.contains(&id) {
            return true;
        }
        let results = self.construct_results(id);
        self.uses[id] == 1
            && match results.as_slice() {
                [] => true,
                [(r, _)] => self.uses[*r] == 1,
                _ => false,
            }
    }

    // -- Names --

    fn fresh(&mut self, base: &str, id: NodeId) -> String {
        let mut name = base.to_string();
        let mut k = 0;
        while self.taken.contains(&name) {
            name = if k == 0 {
                format!("{base}_{id}")
            } else {
                format!("{base}_{id}_{k}")
            };
            k += 1;
        }
        self.taken.insert(name.clone());
        name
    }

    /// The variable reading `id`, allocating it on first request.
    fn binder(&mut self, id: NodeId) -> String {
        if let Some(name) = self.names.get(&id) {
            return name.clone();
        }
        let node = self.g.node(id);
        let base = match &node.name {
            Some(name) if self.opts.use_annotations => name.clone(),
            _ => format!("{}_{}", node.kind.binder_prefix(), id),
        };
        let name = self.fresh(&base, id);
        self.names.insert(id, name.clone());
        name
    }

    // -- Emission --

    /// Bindings the chain opened by `marker` needs, in order.
    fn plan(&self, marker: NodeId) -> Vec<Binding> {
        let mut out = Vec::new();
        for id in self.g.chain(marker) {
            if !self.visited[id] || self.aliases.contains_key(&id) {
                continue;
            }
            let kind = &self.g.node(id).kind;
            if self.effectful[id] {
                if self.uses[id] == 0 {
                    out.push(Binding::Seq(id));
                } else {
                    out.push(Binding::Let(id));
                }
            } else if self.is_construct(id) {
                let inline = self.fused_heads.contains(&id)
                    || matches!(self.construct_results(id).as_slice(), [(r, _)] if self.uses[*r] == 1);
                if !inline && self.uses[id] > 0 {
                    out.push(Binding::Let(id));
                }
            } else if !kind.is_trivial()
                && !matches!(
                    kind,
                    NodeKind::IfResult(_) | NodeKind::LoopResult(_) | NodeKind::Output(_)
                )
                && self.uses[id] >= 2
            {
                out.push(Binding::Let(id));
            }
        }
        out
    }

    /// Emit the chain opened by `marker` around the value built by `result`.
    fn block(&mut self, marker: NodeId, result: impl FnOnce(&mut Self) -> SyntaxExp) -> SyntaxExp {
        let saved = (self.pending.take(), self.consumed);
        let mut bindings = self.plan(marker);
        for binding in &bindings {
            if let Binding::Let(id) = binding {
                self.binder(*id);
            }
        }
        let candidate = match bindings.last() {
            Some(Binding::Let(id)) if self.effectful[*id] && self.single_use(*id) => Some(*id),
            _ => None,
        };
        self.pending = candidate;
        self.consumed = false;
        let body = result(self);
        if candidate.is_some() && self.consumed {
            bindings.pop();
        }
        self.pending = None;

        let mut exp = body;
        for binding in bindings.into_iter().rev() {
            exp = match binding {
                Binding::Let(id) => {
                    let bnd_var = self.binder(id);
                    let bnd_val = self.node_expr(id);
                    mk(ExpDesc::Let {
                        bnd_var,
                        inline: Inline::Auto,
                        bnd_val: Box::new(bnd_val),
                        body: Box::new(exp),
                    })
                }
                Binding::Seq(id) => {
                    let first = self.node_expr(id);
                    mk(ExpDesc::Seq(Box::new(first), Box::new(exp)))
                }
            };
        }
        (self.pending, self.consumed) = saved;
        exp
    }

    fn expr(&mut self, id: NodeId) -> SyntaxExp {
        let id = self.resolve(id);
        if let Some(e) = self.aliases.get(&id) {
            return e.clone();
        }
        if self.pending == Some(id) {
            self.pending = None;
            self.consumed = true;
            return self.node_expr(id);
        }
        if let Some(name) = self.names.get(&id) {
            return var(name);
        }
        self.node_expr(id)
    }

    fn exprs(&mut self, ids: &[NodeId]) -> Vec<SyntaxExp> {
        ids.iter().map(|&id| self.expr(id)).collect()
    }

    /// The tuple of `ids`, or the value it reassembles.
    fn tuple_of(&mut self, ids: &[NodeId]) -> SyntaxExp {
        let key: Vec<NodeId> = ids.iter().map(|&id| self.resolve(id)).collect();
        match self.fused.get(&key) {
            Some(&whole) => self.expr(whole),
            None => {
                let items = self.exprs(ids);
                tuple(items)
            }
        }
    }

    fn arg(&mut self, id: NodeId, i: usize) -> Box<SyntaxExp> {
        let arg = self.g.node(id).args[i];
        Box::new(self.expr(arg))
    }

    /// The expression computing `id` itself, ignoring any binding of it.
    fn node_expr(&mut self, id: NodeId) -> SyntaxExp {
        let node = self.g.node(id);
        match &node.kind {
            NodeKind::Input => var(node.name.as_deref().unwrap_or("input")),
            NodeKind::Const { ty, value } => SyntaxExp::constant(ty.clone(), value.clone(), ()),
            NodeKind::Prim(Primitive::PartialApply) => self.partial_apply(id),
            NodeKind::Prim(Primitive::Tuple) if node.args.len() >= 2 => self.tuple_of(&node.args),
            NodeKind::Prim(prim) => {
                let prim = *prim;
                let args = self.exprs(&node.args);
                SyntaxExp::apply(prim, args, ())
            }
            NodeKind::Constr(constr) => {
                let constr = constr.clone();
                mk(ExpDesc::Constructor {
                    constr,
                    arg: self.arg(id, 0),
                })
            }
            NodeKind::Failwith => mk(ExpDesc::Failwith(self.arg(id, 0))),
            NodeKind::Transfer => {
                let arg = self.arg(id, 0);
                let amount = self.arg(id, 1);
                let dest = self.arg(id, 2);
                mk(ExpDesc::Transfer {
                    dest,
                    amount,
                    entry: None,
                    arg,
                })
            }
            NodeKind::ContractAt(param) => {
                let c_sig = ContractSig::single_entry(param.clone());
                mk(ExpDesc::ContractAt {
                    arg: self.arg(id, 0),
                    c_sig,
                })
            }
            NodeKind::Unpack(ty) => {
                let ty = ty.clone();
                mk(ExpDesc::Unpack {
                    arg: self.arg(id, 0),
                    ty,
                })
            }
            NodeKind::CreateContract(contract) => {
                let contract = contract.clone();
                let args = self.exprs(&node.args);
                mk(ExpDesc::CreateContract { args, contract })
            }
            NodeKind::Output(index) => {
                let index = *index;
                tuple_get(self.expr(node.args[0]), index)
            }
            NodeKind::IfResult(_) | NodeKind::LoopResult(_) => self.result_expr(id),
            NodeKind::If { .. } => self.if_expr(id),
            NodeKind::Loop { .. } => self.loop_expr(id),
            NodeKind::Lambda { .. } => self.lambda_expr(id),
            NodeKind::BranchValue
            | NodeKind::LoopBegin(_)
            | NodeKind::Carried { .. }
            | NodeKind::LambdaBegin => var(&self.binder(id)),
            NodeKind::Start
            | NodeKind::IfThen
            | NodeKind::IfElse
            | NodeKind::IfEnd { .. }
            | NodeKind::LoopEnd { .. }
            | NodeKind::LambdaEnd(_) => unit(),
        }
    }

    fn result_expr(&mut self, id: NodeId) -> SyntaxExp {
        let head = self.g.node(id).args[0];
        let results = self.construct_results(head);
        let path = results
            .iter()
            .find(|(r, _)| *r == id)
            .map(|(_, p)| p.clone())
            .unwrap_or_default();
        if let [(r, _)] = results.as_slice()
            && self.uses[*r] == 1
        {
            if self.pending == Some(head) {
                return self.expr(head);
            }
            if !self.effectful[head] && !self.names.contains_key(&head) {
                return self.node_expr(head);
            }
        }
        let value = var(&self.binder(head));
        project(value, &path)
    }

    // -- Conditionals --

    fn arm_binds(&self, marker: NodeId) -> Vec<NodeId> {
        self.g
            .chain(marker)
            .into_iter()
            .take_while(|id| self.g.node(*id).kind == NodeKind::BranchValue)
            .collect()
    }

    fn arm(&mut self, marker: NodeId, exit: &Exit) -> SyntaxExp {
        let exit = exit.clone();
        self.block(marker, move |r| match exit {
            Exit::Failed(node) => r.expr(node),
            Exit::Values(values) => r.tuple_of(&values),
        })
    }

    fn if_expr(&mut self, head: NodeId) -> SyntaxExp {
        let node = self.g.node(head);
        let NodeKind::If {
            form,
            then_marker,
            else_marker,
            end: Some(end),
        } = &node.kind
        else {
            return unit();
        };
        let NodeKind::IfEnd {
            then_exit,
            else_exit,
            ..
        } = &self.g.node(*end).kind
        else {
            return unit();
        };
        let (form, then_marker, else_marker) = (*form, *then_marker, *else_marker);
        let scrutinee = self.resolve(node.args[0]);
        trace!(head = %head, form = ?form, "rebuilding conditional");

        match form {
            IfForm::Bool => {
                let cond = Box::new(self.expr(scrutinee));
                let ifthen = Box::new(self.arm(then_marker, then_exit));
                let ifelse = Box::new(self.arm(else_marker, else_exit));
                mk(ExpDesc::If {
                    cond,
                    ifthen,
                    ifelse,
                })
            }
            IfForm::Option => {
                let some = self.arm_binds(else_marker);
                let some_name = match some.first() {
                    Some(v) => self.binder(*v),
                    None => self.fresh("v", head),
                };
                let checked = self.g.node(scrutinee);
                if self.opts.match_nat
                    && checked.kind == NodeKind::Prim(Primitive::IsNat)
                    && self.uses[scrutinee] == 1
                    && !self.names.contains_key(&scrutinee)
                {
                    let x = self.resolve(checked.args[0]);
                    let minus_name = self.fresh("m", head);
                    for id in self.g.chain(then_marker) {
                        let n = self.g.node(id);
                        if n.kind == NodeKind::Prim(Primitive::Abs) && self.resolve(n.args[0]) == x {
                            self.aliases.insert(id, var(&minus_name));
                        }
                    }
                    let arg = Box::new(self.expr(x));
                    let ifplus = Box::new(self.arm(else_marker, else_exit));
                    let ifminus = Box::new(self.arm(then_marker, then_exit));
                    return mk(ExpDesc::MatchNat {
                        arg,
                        plus_name: some_name,
                        ifplus,
                        minus_name,
                        ifminus,
                    });
                }
                let arg = Box::new(self.expr(scrutinee));
                let ifnone = Box::new(self.arm(then_marker, then_exit));
                let ifsome = Box::new(self.arm(else_marker, else_exit));
                mk(ExpDesc::MatchOption {
                    arg,
                    ifnone,
                    some_name,
                    ifsome,
                })
            }
            IfForm::List => {
                let binds = self.arm_binds(then_marker);
                let head_name = match binds.first() {
                    Some(v) => self.binder(*v),
                    None => self.fresh("hd", head),
                };
                let tail_name = match binds.get(1) {
                    Some(v) => self.binder(*v),
                    None => self.fresh("tl", head),
                };
                let arg = Box::new(self.expr(scrutinee));
                let ifcons = Box::new(self.arm(then_marker, then_exit));
                let ifnil = Box::new(self.arm(else_marker, else_exit));
                mk(ExpDesc::MatchList {
                    arg,
                    head_name,
                    tail_name,
                    ifcons,
                    ifnil,
                })
            }
            IfForm::Or => {
                let arg = Box::new(self.expr(scrutinee));
                let mut cases = Vec::with_capacity(2);
                for (side, marker, exit) in [("Left", then_marker, then_exit), ("Right", else_marker, else_exit)] {
                    let name = match self.arm_binds(marker).first() {
                        Some(v) => self.binder(*v),
                        None => self.fresh("v", head),
                    };
                    let body = self.arm(marker, exit);
                    cases.push(MatchCase {
                        pattern: Pattern::Constr(side.to_string(), vec![name]),
                        body,
                    });
                }
                mk(ExpDesc::MatchVariant { arg, cases })
            }
        }
    }

    // -- Loops --

    fn loop_expr(&mut self, head: NodeId) -> SyntaxExp {
        let node = self.g.node(head);
        let NodeKind::Loop {
            form,
            begin,
            end: Some(end),
            carried,
            ..
        } = &node.kind
        else {
            return unit();
        };
        let NodeKind::LoopEnd { value, .. } = &self.g.node(*end).kind else {
            return unit();
        };
        let (form, begin, value) = (*form, *begin, *value);
        let input = node.args[0];
        let input_ty = self.g.node(self.resolve(input)).ty.clone();
        let kind = coll_kind(input_ty.as_ref());
        trace!(head = %head, form = ?form, "rebuilding loop");

        // Updated slots travel as one state value: the slot itself when
        // there is one, a tuple otherwise.
        let updated: Vec<_> = carried.iter().filter(|c| c.update.is_some()).collect();
        let state_name = match updated.as_slice() {
            [single] => self.binder(single.placeholder),
            _ => self.fresh("acc", head),
        };
        if updated.len() > 1 {
            for (i, c) in updated.iter().enumerate() {
                self.aliases.insert(c.placeholder, tuple_get(var(&state_name), i));
            }
        }
        let inits: Vec<NodeId> = updated.iter().map(|c| c.init).collect();
        let updates: Vec<NodeId> = updated.iter().filter_map(|c| c.update).collect();
        let has_state = !updates.is_empty();

        match form {
            LoopForm::Fold => {
                let elt_name = self.binder(begin);
                let arg = Box::new(self.expr(input));
                let acc = Box::new(tuple(self.exprs(&inits)));
                let body = Box::new(self.block(begin, |r| {
                    let items = r.exprs(&updates);
                    tuple(items)
                }));
                mk(ExpDesc::Fold {
                    prim: FoldPrimitive::new(kind, has_state),
                    elt_name,
                    acc_name: state_name,
                    body,
                    arg,
                    acc,
                })
            }
            LoopForm::Map => {
                let elt_name = self.binder(begin);
                let arg = Box::new(self.expr(input));
                if !has_state {
                    let body = Box::new(self.block(begin, |r| match value {
                        Some(v) => r.expr(v),
                        None => unit(),
                    }));
                    return mk(ExpDesc::Map {
                        prim: MapPrimitive::new(kind),
                        elt_name,
                        body,
                        arg,
                    });
                }
                let acc = Box::new(tuple(self.exprs(&inits)));
                let body = Box::new(self.block(begin, |r| r.step(value, &updates)));
                mk(ExpDesc::MapFold {
                    prim: MapFoldPrimitive::new(kind),
                    elt_name,
                    acc_name: state_name,
                    body,
                    arg,
                    acc,
                })
            }
            LoopForm::Loop => {
                // The initial state is read twice when the first test is not
                // a literal `True`, so it must not absorb a pending effect.
                let pending = self.pending.take();
                let init = tuple(self.exprs(&inits));
                let first = self.resolve(input);
                let always = matches!(
                    self.g.node(first).kind,
                    NodeKind::Const {
                        value: Const::Bool(true),
                        ..
                    }
                );
                let cond = (!always).then(|| self.expr(first));
                self.pending = pending;
                let body = Box::new(self.block(begin, |r| r.step(value, &updates)));
                let looped = mk(ExpDesc::Loop {
                    arg_name: state_name,
                    body,
                    arg: Box::new(init.clone()),
                });
                match cond {
                    None => looped,
                    Some(cond) => mk(ExpDesc::If {
                        cond: Box::new(cond),
                        ifthen: Box::new(looped),
                        ifelse: Box::new(init),
                    }),
                }
            }
            LoopForm::LoopLeft => {
                let arg_name = self.binder(begin);
                let pending = self.pending.take();
                let init = has_state.then(|| tuple(self.exprs(&inits)));
                let (arg, unpeeled) = match self.peeled(input) {
                    Some(payload) => (self.expr(payload), None),
                    None => {
                        let left = self.fresh("l", head);
                        let right = self.fresh("r", head);
                        (var(&left), Some((self.expr(input), left, right)))
                    }
                };
                self.pending = pending;
                let body = Box::new(self.block(begin, |r| {
                    if has_state {
                        r.step(value, &updates)
                    } else {
                        value.map_or_else(unit, |v| r.expr(v))
                    }
                }));
                let acc = init.clone().map(|init| LoopAcc {
                    name: state_name,
                    init: Box::new(init),
                });
                let looped = mk(ExpDesc::LoopLeft {
                    arg_name,
                    body,
                    arg: Box::new(arg),
                    acc,
                });
                match unpeeled {
                    None => looped,
                    Some((scrutinee, left, right)) => {
                        let done = match init {
                            Some(init) => tuple(vec![var(&right), init]),
                            None => var(&right),
                        };
                        mk(ExpDesc::MatchVariant {
                            arg: Box::new(scrutinee),
                            cases: vec![
                                MatchCase {
                                    pattern: Pattern::Constr("Left".to_string(), vec![left]),
                                    body: looped,
                                },
                                MatchCase {
                                    pattern: Pattern::Constr("Right".to_string(), vec![right]),
                                    body: done,
                                },
                            ],
                        })
                    }
                }
            }
        }
    }

    /// Result of one round of a loop body: the value left on top paired
    /// with the new state.
    fn step(&mut self, value: Option<NodeId>, updates: &[NodeId]) -> SyntaxExp {
        if let (Some(v), [u]) = (value, updates) {
            return self.tuple_of(&[v, *u]);
        }
        let first = value.map_or_else(unit, |v| self.expr(v));
        let state = tuple(self.exprs(updates));
        tuple(vec![first, state])
    }

    // -- Functions --

    fn lambda_expr(&mut self, head: NodeId) -> SyntaxExp {
        let node = self.g.node(head);
        let NodeKind::Lambda {
            arg_ty,
            ret_ty,
            begin,
            end: Some(end),
        } = &node.kind
        else {
            return unit();
        };
        let NodeKind::LambdaEnd(exit) = &self.g.node(*end).kind else {
            return unit();
        };
        let (arg_ty, ret_ty, begin) = (arg_ty.clone(), ret_ty.clone(), *begin);
        let arg_name = self.binder(begin);
        let body = Box::new(self.arm(begin, exit));
        mk(ExpDesc::Lambda {
            arg_name,
            arg_ty,
            body,
            ret_ty,
        })
    }

    /// `APPLY` of a lambda read once is a closure over the applied values.
    fn partial_apply(&mut self, id: NodeId) -> SyntaxExp {
        let node = self.g.node(id);
        let (f, env) = (self.resolve(node.args[0]), self.resolve(node.args[1]));
        if self.uses[f] == 1
            && !self.names.contains_key(&f)
            && let Some(closure) = self.closure(f, env)
        {
            return closure;
        }
        let args = self.exprs(&[f, env]);
        SyntaxExp::apply(Primitive::PartialApply, args, ())
    }

    fn closure(&mut self, f: NodeId, env: NodeId) -> Option<SyntaxExp> {
        let NodeKind::Lambda {
            arg_ty,
            ret_ty,
            begin,
            end: Some(end),
        } = &self.g.node(f).kind
        else {
            return None;
        };
        let NodeKind::LambdaEnd(exit) = &self.g.node(*end).kind else {
            return None;
        };
        let (begin, end) = (*begin, *end);
        let [_, real_arg_ty] = arg_ty.tuple_components()? else {
            return None;
        };

        // Captured values, split along the pair nodes that built them.
        let mut comps = Vec::new();
        let mut cursor = env;
        loop {
            let n = self.g.node(cursor);
            if n.kind == NodeKind::Prim(Primitive::Tuple) && n.args.len() == 2 {
                comps.push(self.resolve(n.args[0]));
                cursor = self.resolve(n.args[1]);
            } else {
                comps.push(cursor);
                break;
            }
        }
        let unit_env = matches!(
            self.g.node(env).kind,
            NodeKind::Const {
                value: Const::Unit,
                ..
            }
        );
        let candidates: Vec<usize> = if unit_env {
            vec![0]
        } else {
            (1..=comps.len()).rev().collect()
        };
        let body_roots = exit_roots(exit);
        let count = candidates
            .into_iter()
            .find(|&n| self.closure_shape_ok(f, begin, end, n, &body_roots))?;

        let mut values = comps[..count.saturating_sub(1)].to_vec();
        if count > 0 {
            // The last captured value is the rest of the comb.
            let mut last = env;
            for _ in 0..count - 1 {
                last = self.resolve(self.g.node(last).args[1]);
            }
            values.push(last);
        }

        let mut env_paths: Vec<Vec<usize>> = comb_paths(count);
        for p in &mut env_paths {
            p.insert(0, 0);
        }
        let mut call_env = Vec::with_capacity(count);
        let mut env_names = Vec::with_capacity(count);
        for (i, &v) in values.iter().enumerate() {
            let base = match &self.g.node(v).name {
                Some(name) if self.opts.use_annotations => name.clone(),
                _ => format!("env{i}"),
            };
            let name = self.fresh(&base, v);
            call_env.push((name.clone(), self.expr(v)));
            env_names.push(name);
        }
        let arg_name = self.binder(begin);
        for raw in (f.index() + 1)..end.index() {
            let id = NodeId::new(raw);
            let Some(path) = self.projection_path(id, begin) else {
                continue;
            };
            if path == [1] {
                self.aliases.insert(id, var(&arg_name));
            } else if let Some(i) = env_paths.iter().position(|p| *p == path) {
                self.aliases.insert(id, var(&env_names[i]));
            } else if path.first() == Some(&0)
                && env_paths.iter().any(|p| p.len() > path.len() && p.starts_with(&path))
            {
                // A partial walk down the environment comb stands for the
                // captured values it still holds.
                let rest = env_names[path.len() - 1..].iter().map(|n| var(n)).collect();
                self.aliases.insert(id, tuple(rest));
            }
        }
        let (real_arg_ty, ret_ty) = (real_arg_ty.clone(), ret_ty.clone());
        let exit = exit.clone();
        let body = Box::new(self.arm(begin, &exit));
        trace!(lambda = %f, captured = count, "rebuilt closure");
        Some(mk(ExpDesc::Closure {
            arg_name,
            arg_ty: real_arg_ty,
            call_env,
            body,
            ret_ty,
        }))
    }

    /// The lambda body reads its argument only through complete projections
    /// onto the argument or one of `n` captured values.
    fn closure_shape_ok(&self, f: NodeId, begin: NodeId, end: NodeId, n: usize, roots: &[NodeId]) -> bool {
        let mut allowed: Vec<Vec<usize>> = comb_paths(n)
            .into_iter()
            .map(|mut p| {
                p.insert(0, 0);
                p
            })
            .collect();
        allowed.push(vec![1]);
        let complete = |path: &[usize]| allowed.iter().any(|p| p == path);
        let prefix = |path: &[usize]| allowed.iter().any(|p| p.starts_with(path));
        let incomplete = |id: NodeId| {
            self.projection_path(id, begin)
                .is_some_and(|path| !complete(&path))
        };

        if roots.iter().any(|r| incomplete(self.resolve(*r))) {
            return false;
        }
        for raw in (f.index() + 1)..end.index() {
            let id = NodeId::new(raw);
            if !self.visited[id] {
                continue;
            }
            if let Some(path) = self.projection_path(id, begin) {
                if !prefix(&path) {
                    return false;
                }
                continue;
            }
            let reads = self
                .deps(id)
                .into_iter()
                .chain(self.blocks(id).into_iter().flat_map(|(_, roots)| roots));
            for dep in reads {
                if incomplete(self.resolve(dep)) {
                    return false;
                }
            }
        }
        true
    }

    /// Indices of the `TupleGet` chain leading from `root` to `id`.
    fn projection_path(&self, id: NodeId, root: NodeId) -> Option<Vec<usize>> {
        let id = self.resolve(id);
        if id == root {
            return Some(vec![]);
        }
        let node = self.g.node(id);
        if node.kind != NodeKind::Prim(Primitive::TupleGet) {
            return None;
        }
        let index = match &self.g.node(node.args[1]).kind {
            NodeKind::Const { value, .. } => value.as_index()?,
            _ => return None,
        };
        let mut path = self.projection_path(node.args[0], root)?;
        path.push(index);
        Some(path)
    }
}

fn exit_roots(exit: &Exit) -> Vec<NodeId> {
    match exit {
        Exit::Values(values) => values.clone(),
        Exit::Failed(node) => vec![*node],
    }
}
