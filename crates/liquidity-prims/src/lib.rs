//! The built-in primitive vocabulary.
//!
//! Four opcode families share one mechanism: a [`NameTable`] seeded from a
//! static list of `(surface name, opcode)` pairs. Several names may map to
//! one opcode; the first name listed for an opcode is its canonical name.
//! Tables are built once on first use and never change afterwards.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::str::FromStr;
use std::sync::LazyLock;

use liquidity_diag::{NotFound, SymbolKind};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Name tables
// ---------------------------------------------------------------------------

/// Bidirectional mapping between surface names and opcodes.
#[derive(Debug)]
pub struct NameTable<P: 'static> {
    kind: SymbolKind,
    seeds: &'static [(&'static str, P)],
    by_name: HashMap<&'static str, P>,
    canonical: HashMap<P, &'static str>,
}

impl<P: Copy + Eq + Hash> NameTable<P> {
    pub fn new(kind: SymbolKind, seeds: &'static [(&'static str, P)]) -> Self {
        let mut by_name = HashMap::with_capacity(seeds.len());
        let mut canonical = HashMap::new();
        for &(name, op) in seeds {
            by_name.insert(name, op);
            canonical.entry(op).or_insert(name);
        }
        Self {
            kind,
            seeds,
            by_name,
            canonical,
        }
    }

    pub fn of_string(&self, name: &str) -> Result<P, NotFound> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| NotFound::new(self.kind, name))
    }

    /// Canonical name of `op`, or `None` if the table was not seeded with it.
    pub fn to_string(&self, op: P) -> Option<&'static str> {
        self.canonical.get(&op).copied()
    }

    /// The literal seed list, aliases included.
    pub fn seeds(&self) -> &'static [(&'static str, P)] {
        self.seeds
    }
}

/// Shared surface of the four opcode families.
pub trait Named: Copy + Eq + Hash + 'static {
    fn table() -> &'static NameTable<Self>;

    /// Every opcode of the family.
    fn all() -> &'static [Self];

    fn from_name(name: &str) -> Result<Self, NotFound> {
        Self::table().of_string(name)
    }

    /// Canonical name of the opcode.
    ///
    /// # Panics
    ///
    /// If the opcode is missing from its family's seed list. Every variant
    /// listed in [`Named::all`] is seeded, which the family tests check.
    fn name(self) -> &'static str {
        Self::table()
            .to_string(self)
            .expect("every opcode is seeded in its name table")
    }
}

macro_rules! named_family {
    ($ty:ident, $table:ident, $seeds:ident, $kind:expr) => {
        static $table: LazyLock<NameTable<$ty>> = LazyLock::new(|| NameTable::new($kind, $seeds));

        impl Named for $ty {
            fn table() -> &'static NameTable<Self> {
                &$table
            }

            fn all() -> &'static [Self] {
                &$ty::ALL
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.name())
            }
        }

        impl FromStr for $ty {
            type Err = NotFound;

            fn from_str(s: &str) -> Result<Self, NotFound> {
                Self::from_name(s)
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Plain primitives
// ---------------------------------------------------------------------------

/// Built-in operations applied to already evaluated arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Primitive {
    // -- Tuples --
    TupleGet,
    TupleSet,
    Tuple,

    // -- Context --
    Balance,
    Now,
    Amount,
    Gas,
    Source,
    Sender,
    SelfContract,

    // -- Comparison --
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
    Compare,

    // -- Arithmetic and logic --
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

    // -- Collections --
    MapFind,
    MapUpdate,
    MapAdd,
    MapRemove,
    MapMem,
    MapSize,
    SetUpdate,
    SetAdd,
    SetRemove,
    SetMem,
    SetSize,
    ListSize,
    ListRev,
    Cons,
    CollFind,
    CollUpdate,
    CollMem,
    CollSize,
    Some,

    // -- Strings and bytes --
    Concat,
    ConcatTwo,
    StringSize,
    StringSub,
    BytesSize,
    BytesSub,
    BytesConcat,
    Pack,

    // -- Crypto --
    Blake2b,
    Sha256,
    Sha512,
    HashKey,
    HmacSha256,
    Check,

    // -- Contracts and accounts --
    Address,
    DefaultAccount,
    SetDelegate,
    CreateAccount,

    // -- Functions --
    Exec,
    PartialApply,
}

impl Primitive {
    pub const ALL: [Primitive; 70] = [
        Primitive::TupleGet,
        Primitive::TupleSet,
        Primitive::Tuple,
        Primitive::Balance,
        Primitive::Now,
        Primitive::Amount,
        Primitive::Gas,
        Primitive::Source,
        Primitive::Sender,
        Primitive::SelfContract,
        Primitive::Eq,
        Primitive::Neq,
        Primitive::Lt,
        Primitive::Le,
        Primitive::Gt,
        Primitive::Ge,
        Primitive::Compare,
        Primitive::Add,
        Primitive::Sub,
        Primitive::Mul,
        Primitive::Ediv,
        Primitive::Abs,
        Primitive::IsNat,
        Primitive::Int,
        Primitive::Neg,
        Primitive::Lsl,
        Primitive::Lsr,
        Primitive::And,
        Primitive::Or,
        Primitive::Xor,
        Primitive::Not,
        Primitive::MapFind,
        Primitive::MapUpdate,
        Primitive::MapAdd,
        Primitive::MapRemove,
        Primitive::MapMem,
        Primitive::MapSize,
        Primitive::SetUpdate,
        Primitive::SetAdd,
        Primitive::SetRemove,
        Primitive::SetMem,
        Primitive::SetSize,
        Primitive::ListSize,
        Primitive::ListRev,
        Primitive::Cons,
        Primitive::CollFind,
        Primitive::CollUpdate,
        Primitive::CollMem,
        Primitive::CollSize,
        Primitive::Some,
        Primitive::Concat,
        Primitive::ConcatTwo,
        Primitive::StringSize,
        Primitive::StringSub,
        Primitive::BytesSize,
        Primitive::BytesSub,
        Primitive::BytesConcat,
        Primitive::Pack,
        Primitive::Blake2b,
        Primitive::Sha256,
        Primitive::Sha512,
        Primitive::HashKey,
        Primitive::HmacSha256,
        Primitive::Check,
        Primitive::Address,
        Primitive::DefaultAccount,
        Primitive::SetDelegate,
        Primitive::CreateAccount,
        Primitive::Exec,
        Primitive::PartialApply,
    ];

    /// Whether applying the primitive can abort evaluation on its own.
    pub fn can_fail(self) -> bool {
        matches!(self, Primitive::Exec)
    }

    /// Whether applying the primitive emits a chain operation.
    pub fn transfers(self) -> bool {
        matches!(self, Primitive::CreateAccount | Primitive::SetDelegate)
    }

    /// Comparison primitives that consume the result of `compare`.
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            Primitive::Eq
                | Primitive::Neq
                | Primitive::Lt
                | Primitive::Le
                | Primitive::Gt
                | Primitive::Ge
        )
    }

    pub fn hash_algorithm(self) -> Option<HashAlgorithm> {
        match self {
            Primitive::Blake2b => Some(HashAlgorithm::Blake2b),
            Primitive::Sha256 => Some(HashAlgorithm::Sha256),
            Primitive::Sha512 => Some(HashAlgorithm::Sha512),
            Primitive::HashKey => Some(HashAlgorithm::HashKey),
            Primitive::HmacSha256 => Some(HashAlgorithm::HmacSha256),
            _ => None,
        }
    }
}

static PRIMITIVE_SEEDS: &[(&str, Primitive)] = &[
    ("get", Primitive::TupleGet),
    ("set", Primitive::TupleSet),
    ("tuple", Primitive::Tuple),
    ("Current.balance", Primitive::Balance),
    ("Current.time", Primitive::Now),
    ("Current.amount", Primitive::Amount),
    ("Current.gas", Primitive::Gas),
    ("Current.source", Primitive::Source),
    ("Current.sender", Primitive::Sender),
    ("Contract.self", Primitive::SelfContract),
    ("=", Primitive::Eq),
    ("<>", Primitive::Neq),
    ("<", Primitive::Lt),
    ("<=", Primitive::Le),
    (">", Primitive::Gt),
    (">=", Primitive::Ge),
    ("compare", Primitive::Compare),
    ("+", Primitive::Add),
    ("-", Primitive::Sub),
    ("*", Primitive::Mul),
    ("/", Primitive::Ediv),
    ("abs", Primitive::Abs),
    ("is_nat", Primitive::IsNat),
    ("int", Primitive::Int),
    ("~-", Primitive::Neg),
    ("lsl", Primitive::Lsl),
    ("<<", Primitive::Lsl),
    ("lsr", Primitive::Lsr),
    (">>", Primitive::Lsr),
    ("&", Primitive::And),
    ("land", Primitive::And),
    ("&&", Primitive::And),
    ("or", Primitive::Or),
    ("lor", Primitive::Or),
    ("||", Primitive::Or),
    ("xor", Primitive::Xor),
    ("lxor", Primitive::Xor),
    ("not", Primitive::Not),
    ("lnot", Primitive::Not),
    ("Map.find", Primitive::MapFind),
    ("Map.update", Primitive::MapUpdate),
    ("Map.add", Primitive::MapAdd),
    ("Map.remove", Primitive::MapRemove),
    ("Map.mem", Primitive::MapMem),
    ("Map.size", Primitive::MapSize),
    ("Set.update", Primitive::SetUpdate),
    ("Set.add", Primitive::SetAdd),
    ("Set.remove", Primitive::SetRemove),
    ("Set.mem", Primitive::SetMem),
    ("Set.size", Primitive::SetSize),
    ("List.size", Primitive::ListSize),
    ("List.length", Primitive::ListSize),
    ("List.rev", Primitive::ListRev),
    ("::", Primitive::Cons),
    ("Coll.find", Primitive::CollFind),
    ("Coll.update", Primitive::CollUpdate),
    ("Coll.mem", Primitive::CollMem),
    ("Coll.size", Primitive::CollSize),
    ("Some", Primitive::Some),
    ("String.concat", Primitive::Concat),
    ("@", Primitive::ConcatTwo),
    ("String.length", Primitive::StringSize),
    ("String.size", Primitive::StringSize),
    ("String.sub", Primitive::StringSub),
    ("String.slice", Primitive::StringSub),
    ("Bytes.length", Primitive::BytesSize),
    ("Bytes.size", Primitive::BytesSize),
    ("Bytes.sub", Primitive::BytesSub),
    ("Bytes.slice", Primitive::BytesSub),
    ("Bytes.concat", Primitive::BytesConcat),
    ("Bytes.pack", Primitive::Pack),
    ("Crypto.blake2b", Primitive::Blake2b),
    ("Crypto.sha256", Primitive::Sha256),
    ("Crypto.sha512", Primitive::Sha512),
    ("Crypto.hash_key", Primitive::HashKey),
    ("Crypto.hmac_sha256", Primitive::HmacSha256),
    ("Crypto.check", Primitive::Check),
    ("Contract.address", Primitive::Address),
    ("Account.default", Primitive::DefaultAccount),
    ("Contract.set_delegate", Primitive::SetDelegate),
    ("Account.create", Primitive::CreateAccount),
    ("Lambda.pipe", Primitive::Exec),
    ("|>", Primitive::Exec),
    ("Lambda.apply", Primitive::PartialApply),
];

named_family!(Primitive, PRIMITIVES, PRIMITIVE_SEEDS, SymbolKind::Primitive);

// ---------------------------------------------------------------------------
// Hash algorithms
// ---------------------------------------------------------------------------

/// Digest algorithms behind the hash primitives. The transforms themselves
/// are provided by the execution backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HashAlgorithm {
    Blake2b,
    Sha256,
    Sha512,
    /// Key hashing (BLAKE2b truncated to a key hash).
    HashKey,
    /// SHA-256 keyed by a secret. Takes the key and the message.
    HmacSha256,
}

impl HashAlgorithm {
    /// Output size in bytes.
    pub fn digest_size(self) -> usize {
        match self {
            HashAlgorithm::Blake2b | HashAlgorithm::Sha256 | HashAlgorithm::HmacSha256 => 32,
            HashAlgorithm::Sha512 => 64,
            HashAlgorithm::HashKey => 20,
        }
    }

    pub fn is_keyed(self) -> bool {
        matches!(self, HashAlgorithm::HmacSha256)
    }
}

// ---------------------------------------------------------------------------
// Traversal primitives
// ---------------------------------------------------------------------------

/// Collection family a traversal runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CollKind {
    Map,
    Set,
    List,
    /// Any collection; resolved once the argument type is known.
    Coll,
}

/// Folds and iterations. `*Iter` forms carry no accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FoldPrimitive {
    MapIter,
    SetIter,
    ListIter,
    MapFold,
    SetFold,
    ListFold,
    CollIter,
    CollFold,
}

impl FoldPrimitive {
    pub const ALL: [FoldPrimitive; 8] = [
        FoldPrimitive::MapIter,
        FoldPrimitive::SetIter,
        FoldPrimitive::ListIter,
        FoldPrimitive::MapFold,
        FoldPrimitive::SetFold,
        FoldPrimitive::ListFold,
        FoldPrimitive::CollIter,
        FoldPrimitive::CollFold,
    ];

    pub fn new(kind: CollKind, with_acc: bool) -> Self {
        match (kind, with_acc) {
            (CollKind::Map, false) => FoldPrimitive::MapIter,
            (CollKind::Set, false) => FoldPrimitive::SetIter,
            (CollKind::List, false) => FoldPrimitive::ListIter,
            (CollKind::Coll, false) => FoldPrimitive::CollIter,
            (CollKind::Map, true) => FoldPrimitive::MapFold,
            (CollKind::Set, true) => FoldPrimitive::SetFold,
            (CollKind::List, true) => FoldPrimitive::ListFold,
            (CollKind::Coll, true) => FoldPrimitive::CollFold,
        }
    }

    pub fn coll_kind(self) -> CollKind {
        match self {
            FoldPrimitive::MapIter | FoldPrimitive::MapFold => CollKind::Map,
            FoldPrimitive::SetIter | FoldPrimitive::SetFold => CollKind::Set,
            FoldPrimitive::ListIter | FoldPrimitive::ListFold => CollKind::List,
            FoldPrimitive::CollIter | FoldPrimitive::CollFold => CollKind::Coll,
        }
    }

    pub fn has_acc(self) -> bool {
        matches!(
            self,
            FoldPrimitive::MapFold
                | FoldPrimitive::SetFold
                | FoldPrimitive::ListFold
                | FoldPrimitive::CollFold
        )
    }
}

static FOLD_SEEDS: &[(&str, FoldPrimitive)] = &[
    ("Map.iter", FoldPrimitive::MapIter),
    ("Set.iter", FoldPrimitive::SetIter),
    ("List.iter", FoldPrimitive::ListIter),
    ("Map.fold", FoldPrimitive::MapFold),
    ("Set.fold", FoldPrimitive::SetFold),
    ("List.fold", FoldPrimitive::ListFold),
    ("Coll.iter", FoldPrimitive::CollIter),
    ("Coll.fold", FoldPrimitive::CollFold),
];

named_family!(FoldPrimitive, FOLD_PRIMITIVES, FOLD_SEEDS, SymbolKind::FoldPrimitive);

/// Element-wise maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MapPrimitive {
    MapMap,
    SetMap,
    ListMap,
    CollMap,
}

impl MapPrimitive {
    pub const ALL: [MapPrimitive; 4] = [
        MapPrimitive::MapMap,
        MapPrimitive::SetMap,
        MapPrimitive::ListMap,
        MapPrimitive::CollMap,
    ];

    pub fn new(kind: CollKind) -> Self {
        match kind {
            CollKind::Map => MapPrimitive::MapMap,
            CollKind::Set => MapPrimitive::SetMap,
            CollKind::List => MapPrimitive::ListMap,
            CollKind::Coll => MapPrimitive::CollMap,
        }
    }
}

static MAP_SEEDS: &[(&str, MapPrimitive)] = &[
    ("Map.map", MapPrimitive::MapMap),
    ("Set.map", MapPrimitive::SetMap),
    ("List.map", MapPrimitive::ListMap),
    ("Coll.map", MapPrimitive::CollMap),
];

named_family!(MapPrimitive, MAP_PRIMITIVES, MAP_SEEDS, SymbolKind::MapPrimitive);

/// Element-wise maps that also thread an accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MapFoldPrimitive {
    MapMapFold,
    SetMapFold,
    ListMapFold,
    CollMapFold,
}

impl MapFoldPrimitive {
    pub const ALL: [MapFoldPrimitive; 4] = [
        MapFoldPrimitive::MapMapFold,
        MapFoldPrimitive::SetMapFold,
        MapFoldPrimitive::ListMapFold,
        MapFoldPrimitive::CollMapFold,
    ];

    pub fn new(kind: CollKind) -> Self {
        match kind {
            CollKind::Map => MapFoldPrimitive::MapMapFold,
            CollKind::Set => MapFoldPrimitive::SetMapFold,
            CollKind::List => MapFoldPrimitive::ListMapFold,
            CollKind::Coll => MapFoldPrimitive::CollMapFold,
        }
    }
}

static MAP_FOLD_SEEDS: &[(&str, MapFoldPrimitive)] = &[
    ("Map.map_fold", MapFoldPrimitive::MapMapFold),
    ("Set.map_fold", MapFoldPrimitive::SetMapFold),
    ("List.map_fold", MapFoldPrimitive::ListMapFold),
    ("Coll.map_fold", MapFoldPrimitive::CollMapFold),
];

named_family!(
    MapFoldPrimitive,
    MAP_FOLD_PRIMITIVES,
    MAP_FOLD_SEEDS,
    SymbolKind::MapFoldPrimitive
);

#[cfg(test)]
mod tests {
    use super::*;

    fn check_family<P: Named + fmt::Debug>() {
        for &(name, op) in P::table().seeds() {
            assert_eq!(P::from_name(name).unwrap(), op, "seed `{name}`");
            let canonical = P::table().to_string(op).unwrap();
            assert_eq!(P::from_name(canonical).unwrap(), op);
        }
        for &op in P::all() {
            assert_eq!(P::from_name(op.name()).unwrap(), op, "{op:?} has no name");
        }
    }

    #[test]
    fn every_family_round_trips_through_canonical_names() {
        check_family::<Primitive>();
        check_family::<FoldPrimitive>();
        check_family::<MapPrimitive>();
        check_family::<MapFoldPrimitive>();
    }

    #[test]
    fn map_add_has_no_alias() {
        let op = Primitive::from_name("Map.add").unwrap();
        assert_eq!(op, Primitive::MapAdd);
        assert_eq!(op.name(), "Map.add");
        assert_eq!(op.to_string(), "Map.add");
    }

    #[test]
    fn aliases_share_an_opcode_and_first_name_is_canonical() {
        for alias in ["or", "lor", "||"] {
            assert_eq!(Primitive::from_name(alias).unwrap(), Primitive::Or);
        }
        assert_eq!(Primitive::Or.name(), "or");
        assert_eq!(Primitive::Exec.name(), "Lambda.pipe");
        assert_eq!("|>".parse::<Primitive>().unwrap(), Primitive::Exec);
    }

    #[test]
    fn unknown_names_are_not_found() {
        let err = Primitive::from_name("Map.frobnicate").unwrap_err();
        assert_eq!(err.kind, SymbolKind::Primitive);
        assert_eq!(err.name, "Map.frobnicate");
        // Families are independent tables.
        assert!(FoldPrimitive::from_name("Map.add").is_err());
        assert_eq!(
            MapFoldPrimitive::from_name("List.fold").unwrap_err().kind,
            SymbolKind::MapFoldPrimitive
        );
    }

    #[test]
    fn effect_metadata() {
        assert!(Primitive::Exec.can_fail());
        assert!(!Primitive::Add.can_fail());
        assert!(Primitive::CreateAccount.transfers());
        assert!(Primitive::SetDelegate.transfers());
        assert!(!Primitive::DefaultAccount.transfers());
    }

    #[test]
    fn fold_primitive_selection() {
        assert_eq!(FoldPrimitive::new(CollKind::List, true), FoldPrimitive::ListFold);
        assert_eq!(FoldPrimitive::new(CollKind::Coll, false), FoldPrimitive::CollIter);
        assert!(FoldPrimitive::MapFold.has_acc());
        assert_eq!(FoldPrimitive::SetIter.coll_kind(), CollKind::Set);
        assert_eq!(MapPrimitive::new(CollKind::Map).name(), "Map.map");
        assert_eq!(MapFoldPrimitive::new(CollKind::List).name(), "List.map_fold");
    }

    #[test]
    fn digest_sizes_are_fixed() {
        assert_eq!(Primitive::Sha512.hash_algorithm().map(HashAlgorithm::digest_size), Some(64));
        assert_eq!(HashAlgorithm::HashKey.digest_size(), 20);
        assert_eq!(Primitive::Add.hash_algorithm(), None);
    }

    #[test]
    fn hmac_is_a_keyed_digest() {
        let op = Primitive::from_name("Crypto.hmac_sha256").unwrap();
        assert_eq!(op, Primitive::HmacSha256);
        let algo = op.hash_algorithm().unwrap();
        assert!(algo.is_keyed());
        assert_eq!(algo.digest_size(), 32);
        assert!(!HashAlgorithm::Sha256.is_keyed());
        assert!(Primitive::ALL.contains(&op));
    }
}
