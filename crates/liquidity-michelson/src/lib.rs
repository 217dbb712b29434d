//! Stack-machine instructions and contract packaging.
//!
//! [`Instr`] is generic over the representation of nested blocks so that
//! passes can attach their own data to blocks. [`Michelson`] is the plain
//! located form used for exchange: a packaged [`MicContract`] serializes to
//! JSON and nests further contracts through `CREATE_CONTRACT`.

use liquidity_diag::{Category, Diagnostic, DiagnosticError, LocatedError, Location};
use liquidity_types::{Const, Datatype};
use serde::{Deserialize, Serialize};

pub mod compile;
mod print;

pub use compile::{compile_contract, compile_exp};
pub use print::MichelsonType;

// ---------------------------------------------------------------------------
// Instructions
// ---------------------------------------------------------------------------

/// One instruction. Stack depths are 1-based where the opcode takes one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Instr<B> {
    // -- Stack manipulation --
    Seq(Vec<B>),
    Drop(u32),
    Dup(u32),
    Dig(u32),
    Dug(u32),
    Swap,
    Dip(u32, Box<B>),
    /// Names the top of the stack.
    Rename(Option<String>),

    // -- Constants and constructors --
    Push(Datatype, Const),
    Unit,
    Nil(Datatype),
    EmptySet(Datatype),
    EmptyMap(Datatype, Datatype),
    EmptyBigMap(Datatype, Datatype),
    None(Datatype),
    Some,
    /// Carries the type of the right side.
    Left(Datatype),
    /// Carries the type of the left side.
    Right(Datatype),
    Cons,
    Pair,
    Car,
    Cdr,
    Unpair,

    // -- Control --
    If(Box<B>, Box<B>),
    IfNone(Box<B>, Box<B>),
    IfCons(Box<B>, Box<B>),
    IfLeft(Box<B>, Box<B>),
    Loop(Box<B>),
    LoopLeft(Box<B>),
    Iter(Box<B>),
    Map(Box<B>),
    Lambda(Datatype, Datatype, Box<B>),
    Exec,
    Apply,
    Failwith,

    // -- Comparison and arithmetic --
    Compare,
    Eq,
    Neq,
    Lt,
    Gt,
    Le,
    Ge,
    Add,
    Sub,
    Mul,
    Ediv,
    Abs,
    IsNat,
    Int,
    Neg,
    Lsl,
    Lsr,
    And,
    Or,
    Xor,
    Not,

    // -- Collections, strings and bytes --
    Size,
    Mem,
    Get,
    Update,
    Concat,
    Slice,
    Pack,
    Unpack(Datatype),

    // -- Context --
    Balance,
    Now,
    Amount,
    Source,
    Sender,
    SelfContract,
    StepsToQuota,

    // -- Cryptography --
    Blake2b,
    Sha256,
    Sha512,
    HashKey,
    CheckSignature,

    // -- Contracts and operations --
    Address,
    Contract(Datatype),
    TransferTokens,
    SetDelegate,
    CreateAccount,
    ImplicitAccount,
    CreateContract(Box<MicContract<B>>),
}

impl<B> Instr<B> {
    /// Canonical opcode mnemonic.
    pub fn opcode(&self) -> &'static str {
        match self {
            Instr::Seq(_) => "{}",
            Instr::Drop(_) => "DROP",
            Instr::Dup(_) => "DUP",
            Instr::Dig(_) => "DIG",
            Instr::Dug(_) => "DUG",
            Instr::Swap => "SWAP",
            Instr::Dip(_, _) => "DIP",
            Instr::Rename(_) => "RENAME",
            Instr::Push(_, _) => "PUSH",
            Instr::Unit => "UNIT",
            Instr::Nil(_) => "NIL",
            Instr::EmptySet(_) => "EMPTY_SET",
            Instr::EmptyMap(_, _) => "EMPTY_MAP",
            Instr::EmptyBigMap(_, _) => "EMPTY_BIG_MAP",
            Instr::None(_) => "NONE",
            Instr::Some => "SOME",
            Instr::Left(_) => "LEFT",
            Instr::Right(_) => "RIGHT",
            Instr::Cons => "CONS",
            Instr::Pair => "PAIR",
            Instr::Car => "CAR",
            Instr::Cdr => "CDR",
            Instr::Unpair => "UNPAIR",
            Instr::If(_, _) => "IF",
            Instr::IfNone(_, _) => "IF_NONE",
            Instr::IfCons(_, _) => "IF_CONS",
            Instr::IfLeft(_, _) => "IF_LEFT",
            Instr::Loop(_) => "LOOP",
            Instr::LoopLeft(_) => "LOOP_LEFT",
            Instr::Iter(_) => "ITER",
            Instr::Map(_) => "MAP",
            Instr::Lambda(_, _, _) => "LAMBDA",
            Instr::Exec => "EXEC",
            Instr::Apply => "APPLY",
            Instr::Failwith => "FAILWITH",
            Instr::Compare => "COMPARE",
            Instr::Eq => "EQ",
            Instr::Neq => "NEQ",
            Instr::Lt => "LT",
            Instr::Gt => "GT",
            Instr::Le => "LE",
            Instr::Ge => "GE",
            Instr::Add => "ADD",
            Instr::Sub => "SUB",
            Instr::Mul => "MUL",
            Instr::Ediv => "EDIV",
            Instr::Abs => "ABS",
            Instr::IsNat => "ISNAT",
            Instr::Int => "INT",
            Instr::Neg => "NEG",
            Instr::Lsl => "LSL",
            Instr::Lsr => "LSR",
            Instr::And => "AND",
            Instr::Or => "OR",
            Instr::Xor => "XOR",
            Instr::Not => "NOT",
            Instr::Size => "SIZE",
            Instr::Mem => "MEM",
            Instr::Get => "GET",
            Instr::Update => "UPDATE",
            Instr::Concat => "CONCAT",
            Instr::Slice => "SLICE",
            Instr::Pack => "PACK",
            Instr::Unpack(_) => "UNPACK",
            Instr::Balance => "BALANCE",
            Instr::Now => "NOW",
            Instr::Amount => "AMOUNT",
            Instr::Source => "SOURCE",
            Instr::Sender => "SENDER",
            Instr::SelfContract => "SELF",
            Instr::StepsToQuota => "STEPS_TO_QUOTA",
            Instr::Blake2b => "BLAKE2B",
            Instr::Sha256 => "SHA256",
            Instr::Sha512 => "SHA512",
            Instr::HashKey => "HASH_KEY",
            Instr::CheckSignature => "CHECK_SIGNATURE",
            Instr::Address => "ADDRESS",
            Instr::Contract(_) => "CONTRACT",
            Instr::TransferTokens => "TRANSFER_TOKENS",
            Instr::SetDelegate => "SET_DELEGATE",
            Instr::CreateAccount => "CREATE_ACCOUNT",
            Instr::ImplicitAccount => "IMPLICIT_ACCOUNT",
            Instr::CreateContract(_) => "CREATE_CONTRACT",
        }
    }
}

// ---------------------------------------------------------------------------
// Located blocks and packaged contracts
// ---------------------------------------------------------------------------

/// An instruction with its source location and an optional variable
/// annotation naming the value it pushes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Michelson {
    pub ins: Instr<Michelson>,
    pub loc: Location,
    pub name: Option<String>,
}

impl Michelson {
    pub fn new(ins: Instr<Michelson>) -> Self {
        Self {
            ins,
            loc: Location::unknown(),
            name: None,
        }
    }

    pub fn at(loc: Location, ins: Instr<Michelson>) -> Self {
        Self {
            ins,
            loc,
            name: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn seq(items: Vec<Michelson>) -> Self {
        Self::new(Instr::Seq(items))
    }

    /// `DIP n { body }`, wrapping `body` in a sequence.
    pub fn dip(n: u32, body: Vec<Michelson>) -> Self {
        Self::new(Instr::Dip(n, Box::new(Self::seq(body))))
    }

    /// Instructions of this block with nested sequences spliced in.
    pub fn flatten(&self) -> Vec<&Michelson> {
        let mut out = Vec::new();
        flatten_into(self, &mut out);
        out
    }
}

fn flatten_into<'a>(m: &'a Michelson, out: &mut Vec<&'a Michelson>) {
    match &m.ins {
        Instr::Seq(items) => {
            for item in items {
                flatten_into(item, out);
            }
        }
        _ => out.push(m),
    }
}

impl From<Instr<Michelson>> for Michelson {
    fn from(ins: Instr<Michelson>) -> Self {
        Self::new(ins)
    }
}

/// A parameter type, a storage type and the code run on `(parameter, storage)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MicContract<B> {
    pub parameter: Datatype,
    pub storage: Datatype,
    pub code: B,
}

impl MicContract<Michelson> {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Parse a contract printed by [`MicContract::to_json`]. Nested
    /// originations may go arbitrarily deep.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        let mut de = serde_json::Deserializer::from_str(text);
        de.disable_recursion_limit();
        let contract = Self::deserialize(&mut de)?;
        de.end()?;
        Ok(contract)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("unbound variable `{name}`")]
    UnboundVariable { name: String, loc: Location },
    #[error("cannot compile {what} without an encoding pass")]
    Unsupported { what: String, loc: Location },
    #[error("tuple index must be a constant within the tuple's arity")]
    BadTupleIndex { loc: Location },
    #[error("missing type information for {what}")]
    MissingType { what: String, loc: Location },
}

impl CompileError {
    pub fn location(&self) -> &Location {
        match self {
            CompileError::UnboundVariable { loc, .. }
            | CompileError::Unsupported { loc, .. }
            | CompileError::BadTupleIndex { loc }
            | CompileError::MissingType { loc, .. } => loc,
        }
    }

    pub fn to_diagnostic(&self) -> Diagnostic {
        Diagnostic::error(Category::Compile, self.to_string()).at(self.location().clone())
    }
}

impl From<CompileError> for LocatedError {
    fn from(err: CompileError) -> Self {
        LocatedError::new(err.location().clone(), err.to_string())
    }
}

impl From<CompileError> for DiagnosticError {
    fn from(err: CompileError) -> Self {
        DiagnosticError::single(err.to_diagnostic())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_int(n: i64) -> Michelson {
        Michelson::new(Instr::Push(Datatype::Int, Const::int(n)))
    }

    fn sample_contract() -> MicContract<Michelson> {
        let inner = MicContract {
            parameter: Datatype::Unit,
            storage: Datatype::Int,
            code: Michelson::seq(vec![
                Instr::Cdr.into(),
                Instr::Nil(Datatype::Operation).into(),
                Instr::Pair.into(),
            ]),
        };
        MicContract {
            parameter: Datatype::option(Datatype::KeyHash),
            storage: Datatype::Unit,
            code: Michelson::seq(vec![
                Instr::Car.into(),
                Instr::Amount.into(),
                Instr::Push(Datatype::Bool, Const::Bool(true)).into(),
                Instr::Push(Datatype::Int, Const::int(0)).into(),
                Instr::Dig(3).into(),
                Instr::CreateContract(Box::new(inner)).into(),
                Michelson::dip(1, vec![Instr::Drop(1).into()]),
                Instr::Nil(Datatype::Operation).into(),
                Instr::Swap.into(),
                Instr::Cons.into(),
                Instr::Unit.into(),
                Instr::Swap.into(),
                Instr::Pair.into(),
            ]),
        }
    }

    #[test]
    fn contract_round_trips_through_json() {
        let contract = sample_contract();
        let json = contract.to_json().unwrap();
        assert!(json.contains("CreateContract"));
        let back = MicContract::from_json(&json).unwrap();
        assert_eq!(back, contract);
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(MicContract::from_json("{\"parameter\": 3}").is_err());
    }

    #[test]
    fn flatten_splices_nested_sequences() {
        let block = Michelson::seq(vec![
            push_int(1),
            Michelson::seq(vec![push_int(2), Michelson::seq(vec![push_int(3)])]),
            Instr::Add.into(),
        ]);
        let ops: Vec<_> = block.flatten().iter().map(|m| m.ins.opcode()).collect();
        assert_eq!(ops, vec!["PUSH", "PUSH", "PUSH", "ADD"]);
    }

    #[test]
    fn compile_errors_become_located_diagnostics() {
        let loc = Location::new("counter.liq");
        let err = CompileError::UnboundVariable {
            name: "total".to_string(),
            loc: loc.clone(),
        };
        let diag = err.to_diagnostic();
        assert_eq!(diag.category, Category::Compile);
        assert_eq!(diag.location, Some(loc.clone()));
        assert!(diag.message.contains("`total`"));

        let located = LocatedError::from(err.clone());
        assert_eq!(located.location, loc);
        assert_eq!(located.message, err.to_string());
        let wrapped = DiagnosticError::from(err);
        assert_eq!(wrapped.diagnostics().len(), 1);
        assert_eq!(wrapped.diagnostics()[0].category, Category::Compile);
    }

    #[test]
    fn deeply_nested_originations_reload() {
        let mut contract = MicContract {
            parameter: Datatype::Unit,
            storage: Datatype::Unit,
            code: Michelson::seq(vec![
                Instr::Cdr.into(),
                Instr::Nil(Datatype::Operation).into(),
                Instr::Pair.into(),
            ]),
        };
        for _ in 0..30 {
            contract = MicContract {
                parameter: Datatype::Unit,
                storage: Datatype::Unit,
                code: Michelson::seq(vec![
                    Instr::Drop(1).into(),
                    Instr::Unit.into(),
                    Instr::Amount.into(),
                    Instr::None(Datatype::KeyHash).into(),
                    Instr::CreateContract(Box::new(contract)).into(),
                    Michelson::dip(1, vec![Instr::Drop(1).into()]),
                    Instr::Nil(Datatype::Operation).into(),
                    Instr::Swap.into(),
                    Instr::Cons.into(),
                    Instr::Unit.into(),
                    Instr::Swap.into(),
                    Instr::Pair.into(),
                ]),
            };
        }
        let json = contract.to_json().unwrap();
        let back = MicContract::from_json(&json).unwrap();
        assert_eq!(back, contract);
    }

    #[test]
    fn trailing_json_is_rejected() {
        let json = sample_contract().to_json().unwrap();
        assert!(MicContract::from_json(&format!("{json} 3")).is_err());
    }
}
