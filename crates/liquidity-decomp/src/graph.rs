//! Symbolic dataflow graph built while interpreting stack code.
//!
//! Every value the interpreter manipulates is a [`Node`]. Nodes are also
//! threaded into sequences through `next`/`prevs`: the top-level code, each
//! branch, each loop body and each lambda body is one chain that starts at a
//! marker node and stops at the matching end node. Loop ends link back to
//! their begin marker. Node numbers grow monotonically, so a node created
//! before a construct's head is known to be defined outside of it.

use index_vec::IndexVec;
use liquidity_ast::{Constructor, ContractCode, Syntax};
use liquidity_diag::Location;
use liquidity_prims::Primitive;
use liquidity_types::{Const, Datatype};

index_vec::define_index_type! {
    pub struct NodeId = u32;
    DEBUG_FORMAT = "n{}";
    DISPLAY_FORMAT = "{}";
}

/// Which conditional instruction a branch node came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IfForm {
    Bool,
    /// Then is the `None` arm, else binds the payload.
    Option,
    /// Then binds head and tail, else is the empty arm.
    List,
    /// Then binds the left payload, else the right one.
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopForm {
    /// `LOOP`: the body leaves the next condition on top.
    Loop,
    /// `LOOP_LEFT`: the begin marker is the left payload of each round.
    LoopLeft,
    /// `ITER`: the begin marker is the current element.
    Fold,
    /// `MAP`: the begin marker is the current element and the body leaves
    /// its replacement on top.
    Map,
}

/// How a branch or body ends.
#[derive(Debug, Clone, PartialEq)]
pub enum Exit {
    /// Values left in the result slots, in slot order.
    Values(Vec<NodeId>),
    /// The node whose evaluation never returns.
    Failed(NodeId),
}

/// A loop-carried stack slot.
#[derive(Debug, Clone, PartialEq)]
pub struct CarriedSlot {
    /// Placeholder read by the body.
    pub placeholder: NodeId,
    /// Value before the first round.
    pub init: NodeId,
    /// Value at the end of a round, `None` when the body leaves it alone.
    pub update: Option<NodeId>,
    /// Value read after the loop.
    pub result: Option<NodeId>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// First node of the top-level chain.
    Start,
    /// A value present on the stack before the code runs.
    Input,
    Const {
        ty: Datatype,
        value: Const,
    },
    Prim(Primitive),
    Constr(Constructor),
    Failwith,
    /// Args are `[parameter, amount, destination]`.
    Transfer,
    ContractAt(Datatype),
    Unpack(Datatype),
    CreateContract(Box<ContractCode<(), Syntax>>),
    /// The `n`-th value pushed by a multi-output head (`args[0]`).
    Output(usize),

    // -- Conditionals --
    /// Args are `[scrutinee]`.
    If {
        form: IfForm,
        then_marker: NodeId,
        else_marker: NodeId,
        end: Option<NodeId>,
    },
    IfThen,
    IfElse,
    /// A value bound by a branch: the option payload, list head or tail, or
    /// or-side payload.
    BranchValue,
    IfEnd {
        then_exit: Exit,
        else_exit: Exit,
        /// Result nodes, in slot order.
        results: Vec<NodeId>,
    },
    /// The `n`-th result of the conditional whose head is `args[0]`.
    IfResult(usize),

    // -- Loops --
    /// Args are `[input]`: the initial condition, the initial or-value, or
    /// the collection.
    Loop {
        form: LoopForm,
        begin: NodeId,
        end: Option<NodeId>,
        carried: Vec<CarriedSlot>,
        /// The loop's own result: the right payload of a loop-left or the
        /// mapped collection.
        result: Option<NodeId>,
    },
    LoopBegin(LoopForm),
    /// Placeholder for a stack slot the body may update. Args are `[head]`.
    Carried {
        slot: usize,
    },
    LoopEnd {
        form: LoopForm,
        /// Condition, or-value or mapped element left on top.
        value: Option<NodeId>,
    },
    /// The loop's own result (`None`) or the final value of a carried slot.
    /// Args are `[head]`.
    LoopResult(Option<usize>),

    // -- Functions --
    Lambda {
        arg_ty: Datatype,
        ret_ty: Datatype,
        begin: NodeId,
        end: Option<NodeId>,
    },
    LambdaBegin,
    LambdaEnd(Exit),
}

impl NodeKind {
    /// Whether the node closes a chain.
    pub fn is_end(&self) -> bool {
        matches!(
            self,
            NodeKind::IfEnd { .. } | NodeKind::LoopEnd { .. } | NodeKind::LambdaEnd(_)
        )
    }

    /// Nodes whose expression is a name or literal and never needs a binding.
    pub fn is_trivial(&self) -> bool {
        matches!(
            self,
            NodeKind::Input
                | NodeKind::Const { .. }
                | NodeKind::BranchValue
                | NodeKind::LoopBegin(_)
                | NodeKind::LambdaBegin
                | NodeKind::Carried { .. }
        )
    }

    /// Prefix of generated binder names.
    pub fn binder_prefix(&self) -> &'static str {
        match self {
            NodeKind::BranchValue => "v",
            NodeKind::LoopBegin(LoopForm::Fold | LoopForm::Map) => "elt",
            NodeKind::LoopBegin(_) => "arg",
            NodeKind::LambdaBegin => "arg",
            NodeKind::Carried { .. } => "acc",
            NodeKind::Transfer => "op",
            NodeKind::CreateContract(_) => "origination",
            NodeKind::If { .. } => "r",
            NodeKind::Loop { .. } => "loop",
            NodeKind::Lambda { .. } => "f",
            _ => "x",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub num: NodeId,
    pub loc: Location,
    pub name: Option<String>,
    pub kind: NodeKind,
    pub args: Vec<NodeId>,
    pub ty: Option<Datatype>,
    pub next: Option<NodeId>,
    pub prevs: Vec<NodeId>,
}

/// Mutable graph under construction. Consumed by [`GraphBuilder::build`].
#[derive(Debug, Default)]
pub struct GraphBuilder {
    nodes: IndexVec<NodeId, Node>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a node outside of any chain.
    pub fn add(
        &mut self,
        kind: NodeKind,
        args: Vec<NodeId>,
        ty: Option<Datatype>,
        loc: Location,
    ) -> NodeId {
        let num = self.nodes.next_idx();
        self.nodes.push(Node {
            num,
            loc,
            name: None,
            kind,
            args,
            ty,
            next: None,
            prevs: Vec::new(),
        })
    }

    pub fn link(&mut self, from: NodeId, to: NodeId) {
        self.nodes[from].next = Some(to);
        self.nodes[to].prevs.push(from);
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id]
    }

    pub fn build(self, start: NodeId, inputs: Vec<NodeId>, untouched: usize, exit: Exit) -> Graph {
        Graph {
            nodes: self.nodes,
            start,
            inputs,
            untouched,
            exit,
        }
    }
}

/// A finished graph: the top-level chain starts at `start` and ends with
/// `exit`.
#[derive(Debug, Clone)]
pub struct Graph {
    nodes: IndexVec<NodeId, Node>,
    pub start: NodeId,
    /// Input stack, bottom first.
    pub inputs: Vec<NodeId>,
    /// How many bottom input slots the code never popped.
    pub untouched: usize,
    pub exit: Exit,
}

impl Graph {
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes of the chain opened by `marker`, excluding the marker and the
    /// end node.
    pub fn chain(&self, marker: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut cursor = self.nodes[marker].next;
        while let Some(id) = cursor {
            if self.nodes[id].kind.is_end() {
                break;
            }
            out.push(id);
            cursor = self.nodes[id].next;
        }
        out
    }
}
