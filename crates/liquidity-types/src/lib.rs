//! Type representations for Liquidity contracts.
//!
//! This crate defines the structural type grammar shared by the type
//! checker, the stack-machine compiler and the decompiler, the literal
//! constants that inhabit those types, and contract signatures. The
//! scoped symbol tables used while checking a contract live in [`env`].

use std::fmt;

use num_bigint::BigInt;
use serde::{Deserialize, Serialize};

pub mod env;

#[cfg(test)]
mod prop_tests;

pub use env::{ConstrInfo, Env, EnvError, FieldInfo, ScopeId};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A semantic type.
///
/// Records and sums are identified by name. Two records with the same name
/// are expected to carry identical field lists; [`eq_types`] still compares
/// the fields so that a clash is reported as a mismatch rather than hidden.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Datatype {
    // -- Scalars --
    Unit,
    Bool,
    Int,
    Nat,
    Tez,
    String,
    Bytes,
    Timestamp,
    Key,
    KeyHash,
    Signature,
    Operation,
    Address,

    // -- Composites --
    Tuple(Vec<Datatype>),
    Option(Box<Datatype>),
    List(Box<Datatype>),
    Set(Box<Datatype>),
    Map(Box<Datatype>, Box<Datatype>),
    /// Lazily deserialized map. Not interchangeable with [`Datatype::Map`].
    BigMap(Box<Datatype>, Box<Datatype>),
    Contract(ContractSig),
    Or(Box<Datatype>, Box<Datatype>),
    Lambda(Box<Datatype>, Box<Datatype>),
    Record {
        name: String,
        fields: Vec<(String, Datatype)>,
    },
    Sum {
        name: String,
        constrs: Vec<(String, Datatype)>,
    },
    /// A lambda over `arg` that has captured a value of type `env`.
    Closure {
        arg: Box<Datatype>,
        env: Box<Datatype>,
        ret: Box<Datatype>,
    },
    /// The type of expressions that always fail.
    Fail,
}

impl Datatype {
    pub fn pair(a: Datatype, b: Datatype) -> Self {
        Datatype::Tuple(vec![a, b])
    }

    pub fn option(t: Datatype) -> Self {
        Datatype::Option(Box::new(t))
    }

    pub fn list(t: Datatype) -> Self {
        Datatype::List(Box::new(t))
    }

    pub fn set(t: Datatype) -> Self {
        Datatype::Set(Box::new(t))
    }

    pub fn map(k: Datatype, v: Datatype) -> Self {
        Datatype::Map(Box::new(k), Box::new(v))
    }

    pub fn big_map(k: Datatype, v: Datatype) -> Self {
        Datatype::BigMap(Box::new(k), Box::new(v))
    }

    pub fn or(l: Datatype, r: Datatype) -> Self {
        Datatype::Or(Box::new(l), Box::new(r))
    }

    pub fn lambda(arg: Datatype, ret: Datatype) -> Self {
        Datatype::Lambda(Box::new(arg), Box::new(ret))
    }

    /// Component types of a tuple, or `None` for any other type.
    pub fn tuple_components(&self) -> Option<&[Datatype]> {
        match self {
            Datatype::Tuple(ts) => Some(ts),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Contract signatures
// ---------------------------------------------------------------------------

/// Signature of one entry point.
///
/// `parm_name` and `storage_name` document how the entry binds its
/// arguments; they never take part in signature equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntrySig {
    pub entry_name: String,
    pub parameter: Datatype,
    pub parm_name: String,
    pub storage_name: String,
}

/// Ordered entry points of a contract, optionally under a signature name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContractSig {
    pub sig_name: Option<String>,
    pub entries_sig: Vec<EntrySig>,
}

impl ContractSig {
    /// Anonymous signature with a single `default` entry.
    pub fn single_entry(parameter: Datatype) -> Self {
        Self {
            sig_name: None,
            entries_sig: vec![EntrySig {
                entry_name: "default".to_string(),
                parameter,
                parm_name: "parameter".to_string(),
                storage_name: "storage".to_string(),
            }],
        }
    }

    pub fn entry(&self, name: &str) -> Option<&EntrySig> {
        self.entries_sig.iter().find(|e| e.entry_name == name)
    }
}

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// A tez amount written as decimal digits.
///
/// `mutez` holds the fractional digits (at most six) when the literal had a
/// fractional part.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tez {
    pub tezzies: String,
    pub mutez: Option<String>,
}

impl Tez {
    pub fn from_mutez(amount: &BigInt) -> Self {
        let million = BigInt::from(1_000_000u32);
        let tezzies = amount / &million;
        let rest = amount % &million;
        let mutez = if num_traits::Zero::is_zero(&rest) {
            None
        } else {
            let digits = format!("{rest:0>6}");
            Some(digits.trim_end_matches('0').to_string())
        };
        Self {
            tezzies: tezzies.to_string(),
            mutez,
        }
    }

    /// Amount in mutez, or `None` when the digits are malformed.
    pub fn to_mutez(&self) -> Option<BigInt> {
        let whole: BigInt = self.tezzies.replace('_', "").parse().ok()?;
        let frac = match &self.mutez {
            None => BigInt::from(0u32),
            Some(digits) if digits.len() <= 6 => format!("{digits:0<6}").parse().ok()?,
            Some(_) => return None,
        };
        Some(whole * BigInt::from(1_000_000u32) + frac)
    }
}

impl fmt::Display for Tez {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.mutez {
            Some(m) => write!(f, "{}.{m}tz", self.tezzies),
            None => write!(f, "{}tz", self.tezzies),
        }
    }
}

/// A literal value. Mirrors [`Datatype`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Const {
    Unit,
    Bool(bool),
    Int(BigInt),
    Nat(BigInt),
    Tez(Tez),
    /// RFC 3339 date or a number of seconds, as written.
    Timestamp(String),
    String(String),
    Bytes(Vec<u8>),
    Key(String),
    KeyHash(String),
    Signature(String),
    Address(String),
    Tuple(Vec<Const>),
    None,
    Some(Box<Const>),
    Left(Box<Const>),
    Right(Box<Const>),
    List(Vec<Const>),
    Set(Vec<Const>),
    Map(Vec<(Const, Const)>),
    BigMap(Vec<(Const, Const)>),
    Record(Vec<(String, Const)>),
    Constr(String, Box<Const>),
}

impl Const {
    pub fn int(n: i64) -> Self {
        Const::Int(BigInt::from(n))
    }

    pub fn nat(n: u64) -> Self {
        Const::Nat(BigInt::from(n))
    }

    /// Small non-negative integer payload of an `Int` or `Nat` literal.
    pub fn as_index(&self) -> Option<usize> {
        match self {
            Const::Int(n) | Const::Nat(n) => usize::try_from(n).ok(),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Predicates
// ---------------------------------------------------------------------------

/// Whether values of `ty` can be ordered and used as map or set keys.
pub fn comparable_type(ty: &Datatype) -> bool {
    match ty {
        Datatype::Bool
        | Datatype::Int
        | Datatype::Nat
        | Datatype::Tez
        | Datatype::String
        | Datatype::Bytes
        | Datatype::Timestamp
        | Datatype::KeyHash
        | Datatype::Address => true,
        Datatype::Unit
        | Datatype::Key
        | Datatype::Signature
        | Datatype::Operation
        | Datatype::Tuple(_)
        | Datatype::Option(_)
        | Datatype::List(_)
        | Datatype::Set(_)
        | Datatype::Map(_, _)
        | Datatype::BigMap(_, _)
        | Datatype::Contract(_)
        | Datatype::Or(_, _)
        | Datatype::Lambda(_, _)
        | Datatype::Record { .. }
        | Datatype::Sum { .. }
        | Datatype::Closure { .. }
        | Datatype::Fail => false,
    }
}

/// Structural type equality.
///
/// Total over the grammar: arity mismatches and shape mismatches give
/// `false`, never an error. Contract types compare with [`eq_signature`].
pub fn eq_types(t1: &Datatype, t2: &Datatype) -> bool {
    use Datatype as T;
    match (t1, t2) {
        (T::Unit, T::Unit)
        | (T::Bool, T::Bool)
        | (T::Int, T::Int)
        | (T::Nat, T::Nat)
        | (T::Tez, T::Tez)
        | (T::String, T::String)
        | (T::Bytes, T::Bytes)
        | (T::Timestamp, T::Timestamp)
        | (T::Key, T::Key)
        | (T::KeyHash, T::KeyHash)
        | (T::Signature, T::Signature)
        | (T::Operation, T::Operation)
        | (T::Address, T::Address)
        | (T::Fail, T::Fail) => true,
        (T::Tuple(l1), T::Tuple(l2)) => {
            l1.len() == l2.len() && l1.iter().zip(l2).all(|(a, b)| eq_types(a, b))
        }
        (T::Option(a), T::Option(b)) | (T::List(a), T::List(b)) | (T::Set(a), T::Set(b)) => {
            eq_types(a, b)
        }
        (T::Map(k1, v1), T::Map(k2, v2))
        | (T::BigMap(k1, v1), T::BigMap(k2, v2))
        | (T::Or(k1, v1), T::Or(k2, v2))
        | (T::Lambda(k1, v1), T::Lambda(k2, v2)) => eq_types(k1, k2) && eq_types(v1, v2),
        (T::Contract(s1), T::Contract(s2)) => eq_signature(s1, s2),
        (
            T::Record {
                name: n1,
                fields: f1,
            },
            T::Record {
                name: n2,
                fields: f2,
            },
        )
        | (
            T::Sum {
                name: n1,
                constrs: f1,
            },
            T::Sum {
                name: n2,
                constrs: f2,
            },
        ) => {
            n1 == n2
                && f1.len() == f2.len()
                && f1
                    .iter()
                    .zip(f2)
                    .all(|((l1, a), (l2, b))| l1 == l2 && eq_types(a, b))
        }
        (
            T::Closure {
                arg: a1,
                env: e1,
                ret: r1,
            },
            T::Closure {
                arg: a2,
                env: e2,
                ret: r2,
            },
        ) => eq_types(a1, a2) && eq_types(e1, e2) && eq_types(r1, r2),
        (
            T::Unit
            | T::Bool
            | T::Int
            | T::Nat
            | T::Tez
            | T::String
            | T::Bytes
            | T::Timestamp
            | T::Key
            | T::KeyHash
            | T::Signature
            | T::Operation
            | T::Address
            | T::Fail
            | T::Tuple(_)
            | T::Option(_)
            | T::List(_)
            | T::Set(_)
            | T::Map(_, _)
            | T::BigMap(_, _)
            | T::Or(_, _)
            | T::Lambda(_, _)
            | T::Contract(_)
            | T::Record { .. }
            | T::Sum { .. }
            | T::Closure { .. },
            _,
        ) => false,
    }
}

/// Signature equality: same entry names and parameter types, in order.
///
/// The signature's own name and the entries' argument names are ignored.
pub fn eq_signature(s1: &ContractSig, s2: &ContractSig) -> bool {
    s1.entries_sig.len() == s2.entries_sig.len()
        && s1
            .entries_sig
            .iter()
            .zip(&s2.entries_sig)
            .all(|(e1, e2)| e1.entry_name == e2.entry_name && eq_types(&e1.parameter, &e2.parameter))
}

/// Whether `ty` holds an `operation` outside of any function boundary.
///
/// Lambdas and closures are not executed when built, so an operation in
/// their signature does not count. Contract handles only describe entry
/// points and never hold an operation value either.
pub fn type_contains_nonlambda_operation(ty: &Datatype) -> bool {
    match ty {
        Datatype::Operation => true,
        Datatype::Unit
        | Datatype::Bool
        | Datatype::Int
        | Datatype::Nat
        | Datatype::Tez
        | Datatype::String
        | Datatype::Bytes
        | Datatype::Timestamp
        | Datatype::Key
        | Datatype::KeyHash
        | Datatype::Signature
        | Datatype::Address
        | Datatype::Fail => false,
        Datatype::Lambda(_, _) | Datatype::Closure { .. } | Datatype::Contract(_) => false,
        Datatype::Tuple(ts) => ts.iter().any(type_contains_nonlambda_operation),
        Datatype::Option(t) | Datatype::List(t) | Datatype::Set(t) => {
            type_contains_nonlambda_operation(t)
        }
        Datatype::Map(k, v) | Datatype::BigMap(k, v) | Datatype::Or(k, v) => {
            type_contains_nonlambda_operation(k) || type_contains_nonlambda_operation(v)
        }
        Datatype::Record { fields: items, .. } | Datatype::Sum { constrs: items, .. } => items
            .iter()
            .any(|(_, t)| type_contains_nonlambda_operation(t)),
    }
}

// ---------------------------------------------------------------------------
// Display
// ---------------------------------------------------------------------------

impl fmt::Display for Datatype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datatype::Unit => write!(f, "unit"),
            Datatype::Bool => write!(f, "bool"),
            Datatype::Int => write!(f, "int"),
            Datatype::Nat => write!(f, "nat"),
            Datatype::Tez => write!(f, "tez"),
            Datatype::String => write!(f, "string"),
            Datatype::Bytes => write!(f, "bytes"),
            Datatype::Timestamp => write!(f, "timestamp"),
            Datatype::Key => write!(f, "key"),
            Datatype::KeyHash => write!(f, "key_hash"),
            Datatype::Signature => write!(f, "signature"),
            Datatype::Operation => write!(f, "operation"),
            Datatype::Address => write!(f, "address"),
            Datatype::Tuple(ts) => {
                write!(f, "(")?;
                for (i, t) in ts.iter().enumerate() {
                    if i > 0 {
                        write!(f, " * ")?;
                    }
                    write!(f, "{t}")?;
                }
                write!(f, ")")
            }
            Datatype::Option(t) => write!(f, "{t} option"),
            Datatype::List(t) => write!(f, "{t} list"),
            Datatype::Set(t) => write!(f, "{t} set"),
            Datatype::Map(k, v) => write!(f, "({k}, {v}) map"),
            Datatype::BigMap(k, v) => write!(f, "({k}, {v}) big_map"),
            Datatype::Contract(sig) => write!(f, "{sig}"),
            Datatype::Or(l, r) => write!(f, "({l}, {r}) variant"),
            Datatype::Lambda(a, r) => write!(f, "({a} -> {r})"),
            Datatype::Record { name, .. } | Datatype::Sum { name, .. } => write!(f, "{name}"),
            Datatype::Closure { arg, env, ret } => write!(f, "({arg} -> {ret})[{env}]"),
            Datatype::Fail => write!(f, "failure"),
        }
    }
}

impl fmt::Display for ContractSig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.sig_name {
            return write!(f, "{name}.instance");
        }
        write!(f, "sig")?;
        for entry in &self.entries_sig {
            write!(f, " entry {} : {};", entry.entry_name, entry.parameter)?;
        }
        write!(f, " end")
    }
}

impl fmt::Display for Const {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Const::Unit => write!(f, "()"),
            Const::Bool(b) => write!(f, "{b}"),
            Const::Int(n) => write!(f, "{n}"),
            Const::Nat(n) => write!(f, "{n}p"),
            Const::Tez(t) => write!(f, "{t}"),
            Const::Timestamp(s)
            | Const::Key(s)
            | Const::KeyHash(s)
            | Const::Signature(s)
            | Const::Address(s) => write!(f, "{s}"),
            Const::String(s) => write!(f, "{s:?}"),
            Const::Bytes(b) => write!(f, "0x{}", hex::encode(b)),
            Const::Tuple(cs) => {
                write!(f, "(")?;
                write_sep(f, cs, ", ")?;
                write!(f, ")")
            }
            Const::None => write!(f, "None"),
            Const::Some(c) => write!(f, "Some {c}"),
            Const::Left(c) => write!(f, "Left {c}"),
            Const::Right(c) => write!(f, "Right {c}"),
            Const::List(cs) => {
                write!(f, "[")?;
                write_sep(f, cs, "; ")?;
                write!(f, "]")
            }
            Const::Set(cs) => {
                write!(f, "Set [")?;
                write_sep(f, cs, "; ")?;
                write!(f, "]")
            }
            Const::Map(kvs) | Const::BigMap(kvs) => {
                let kw = if matches!(self, Const::Map(_)) { "Map" } else { "BigMap" };
                write!(f, "{kw} [")?;
                for (i, (k, v)) in kvs.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{k}, {v}")?;
                }
                write!(f, "]")
            }
            Const::Record(fields) => {
                write!(f, "{{")?;
                for (i, (l, c)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ";")?;
                    }
                    write!(f, " {l} = {c}")?;
                }
                write!(f, " }}")
            }
            Const::Constr(c, arg) => write!(f, "{c} {arg}"),
        }
    }
}

fn write_sep(f: &mut fmt::Formatter<'_>, items: &[Const], sep: &str) -> fmt::Result {
    for (i, c) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(sep)?;
        }
        write!(f, "{c}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, fields: Vec<(&str, Datatype)>) -> Datatype {
        Datatype::Record {
            name: name.to_string(),
            fields: fields
                .into_iter()
                .map(|(l, t)| (l.to_string(), t))
                .collect(),
        }
    }

    fn entry(name: &str, parameter: Datatype) -> EntrySig {
        EntrySig {
            entry_name: name.to_string(),
            parameter,
            parm_name: "p".to_string(),
            storage_name: "s".to_string(),
        }
    }

    #[test]
    fn comparable_scalars_only() {
        assert!(comparable_type(&Datatype::KeyHash));
        assert!(comparable_type(&Datatype::Timestamp));
        assert!(!comparable_type(&Datatype::list(Datatype::Int)));
        assert!(!comparable_type(&Datatype::pair(Datatype::Int, Datatype::Int)));
        assert!(!comparable_type(&Datatype::Key));
    }

    #[test]
    fn tuple_arity_mismatch_is_not_equal() {
        let a = Datatype::Tuple(vec![Datatype::Int, Datatype::Nat]);
        let b = Datatype::Tuple(vec![Datatype::Int, Datatype::Nat, Datatype::Nat]);
        assert!(!eq_types(&a, &b));
        assert!(eq_types(&a, &a.clone()));
    }

    #[test]
    fn map_and_big_map_are_distinct() {
        let m = Datatype::map(Datatype::String, Datatype::Int);
        let bm = Datatype::big_map(Datatype::String, Datatype::Int);
        assert!(!eq_types(&m, &bm));
    }

    #[test]
    fn fail_equals_only_fail() {
        assert!(eq_types(&Datatype::Fail, &Datatype::Fail));
        assert!(!eq_types(&Datatype::Fail, &Datatype::Unit));
        assert!(!eq_types(&Datatype::Unit, &Datatype::Fail));
    }

    #[test]
    fn records_compare_by_name_and_fields() {
        let a = record("account", vec![("owner", Datatype::Address), ("balance", Datatype::Tez)]);
        let b = record("account", vec![("owner", Datatype::Address), ("balance", Datatype::Tez)]);
        let renamed = record("wallet", vec![("owner", Datatype::Address), ("balance", Datatype::Tez)]);
        let clash = record("account", vec![("owner", Datatype::Address)]);
        assert!(eq_types(&a, &b));
        assert!(!eq_types(&a, &renamed));
        assert!(!eq_types(&a, &clash));
    }

    #[test]
    fn contract_types_ignore_signature_names() {
        let mut s1 = ContractSig {
            sig_name: Some("Token".to_string()),
            entries_sig: vec![entry("transfer", Datatype::Nat), entry("burn", Datatype::Unit)],
        };
        let mut s2 = s1.clone();
        s2.sig_name = None;
        s2.entries_sig[0].parm_name = "amount".to_string();
        assert!(eq_types(&Datatype::Contract(s1.clone()), &Datatype::Contract(s2.clone())));

        s1.entries_sig.reverse();
        assert!(!eq_signature(&s1, &s2));
        s1.entries_sig.pop();
        assert!(!eq_signature(&s1, &s2));
    }

    #[test]
    fn operations_inside_lambdas_are_allowed() {
        let ops = Datatype::list(Datatype::Operation);
        assert!(type_contains_nonlambda_operation(&ops));
        assert!(type_contains_nonlambda_operation(&Datatype::pair(Datatype::Int, ops.clone())));
        assert!(!type_contains_nonlambda_operation(&Datatype::lambda(
            Datatype::Unit,
            ops.clone()
        )));
        assert!(!type_contains_nonlambda_operation(&Datatype::Closure {
            arg: Box::new(Datatype::Unit),
            env: Box::new(ops.clone()),
            ret: Box::new(Datatype::Unit),
        }));
        let storage = record("storage", vec![("pending", ops)]);
        assert!(type_contains_nonlambda_operation(&storage));
    }

    #[test]
    fn tez_mutez_conversion() {
        let t = Tez {
            tezzies: "1".to_string(),
            mutez: Some("5".to_string()),
        };
        assert_eq!(t.to_mutez(), Some(BigInt::from(1_500_000)));
        assert_eq!(Tez::from_mutez(&BigInt::from(1_500_000)), t);
        assert_eq!(Tez::from_mutez(&BigInt::from(3_000_000)).to_string(), "3tz");
        let bad = Tez {
            tezzies: "1".to_string(),
            mutez: Some("1234567".to_string()),
        };
        assert_eq!(bad.to_mutez(), None);
    }

    #[test]
    fn display_types_and_constants() {
        let t = Datatype::map(Datatype::String, Datatype::option(Datatype::Nat));
        assert_eq!(t.to_string(), "(string, nat option) map");
        assert_eq!(
            Datatype::lambda(Datatype::pair(Datatype::Int, Datatype::Bool), Datatype::Unit)
                .to_string(),
            "((int * bool) -> unit)"
        );
        let c = Const::Tuple(vec![Const::nat(3), Const::Some(Box::new(Const::Bytes(vec![0xab])))]);
        assert_eq!(c.to_string(), "(3p, Some 0xab)");
        assert_eq!(Const::List(vec![Const::int(1), Const::int(2)]).to_string(), "[1; 2]");
    }

    #[test]
    fn datatype_json_exchange() {
        let t = Datatype::Contract(ContractSig::single_entry(Datatype::pair(
            Datatype::Nat,
            Datatype::Address,
        )));
        let json = serde_json::to_string(&t).unwrap();
        let back: Datatype = serde_json::from_str(&json).unwrap();
        assert_eq!(back, t);
    }
}
