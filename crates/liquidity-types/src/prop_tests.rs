//! Property tests for type equality and qualified lifting.
//!
//! Properties checked for arbitrary types:
//!
//! 1. `eq_types` is reflexive and symmetric
//! 2. `eq_signature` ignores the signature name
//! 3. lifting leaves types without local names untouched
//! 4. lifting qualifies every local record and sum name, and is idempotent

use proptest::prelude::*;

use crate::*;

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

const LOCAL_NAMES: &[&str] = &["storage", "action", "account"];
const OUTER_NAMES: &[&str] = &["Outer.ledger", "Outer.status"];
const LABELS: &[&str] = &["owner", "amount", "Incr", "Reset", "next"];

fn arb_scalar() -> impl Strategy<Value = Datatype> {
    prop_oneof![
        Just(Datatype::Unit),
        Just(Datatype::Bool),
        Just(Datatype::Int),
        Just(Datatype::Nat),
        Just(Datatype::Tez),
        Just(Datatype::String),
        Just(Datatype::Bytes),
        Just(Datatype::Timestamp),
        Just(Datatype::Key),
        Just(Datatype::KeyHash),
        Just(Datatype::Signature),
        Just(Datatype::Operation),
        Just(Datatype::Address),
        Just(Datatype::Fail),
    ]
}

fn arb_items(inner: BoxedStrategy<Datatype>) -> impl Strategy<Value = Vec<(String, Datatype)>> {
    prop::collection::vec(
        (prop::sample::select(LABELS).prop_map(str::to_string), inner),
        1..=3,
    )
}

/// Types of bounded depth whose record and sum names come from `names`.
fn arb_type(depth: u32, names: &'static [&'static str]) -> BoxedStrategy<Datatype> {
    if depth == 0 {
        return arb_scalar().boxed();
    }
    let inner = arb_type(depth - 1, names);
    let name = prop::sample::select(names).prop_map(str::to_string);
    prop_oneof![
        4 => arb_scalar(),
        1 => prop::collection::vec(inner.clone(), 2..=3).prop_map(Datatype::Tuple),
        1 => inner.clone().prop_map(Datatype::option),
        1 => inner.clone().prop_map(Datatype::list),
        1 => inner.clone().prop_map(Datatype::set),
        1 => (inner.clone(), inner.clone()).prop_map(|(k, v)| Datatype::map(k, v)),
        1 => (inner.clone(), inner.clone()).prop_map(|(k, v)| Datatype::big_map(k, v)),
        1 => (inner.clone(), inner.clone()).prop_map(|(l, r)| Datatype::or(l, r)),
        1 => (inner.clone(), inner.clone()).prop_map(|(a, r)| Datatype::lambda(a, r)),
        1 => inner.clone().prop_map(|p| Datatype::Contract(ContractSig::single_entry(p))),
        1 => (name.clone(), arb_items(inner.clone()))
            .prop_map(|(name, fields)| Datatype::Record { name, fields }),
        1 => (name, arb_items(inner.clone()))
            .prop_map(|(name, constrs)| Datatype::Sum { name, constrs }),
        1 => (inner.clone(), inner.clone(), inner).prop_map(|(arg, env, ret)| Datatype::Closure {
            arg: Box::new(arg),
            env: Box::new(env),
            ret: Box::new(ret),
        }),
    ]
    .boxed()
}

fn arb_entries() -> impl Strategy<Value = Vec<EntrySig>> {
    prop::collection::vec(
        (
            prop::sample::select(&["main", "transfer", "burn"][..]),
            arb_type(2, LOCAL_NAMES),
        ),
        0..=3,
    )
    .prop_map(|entries| {
        entries
            .into_iter()
            .map(|(name, parameter)| EntrySig {
                entry_name: name.to_string(),
                parameter,
                parm_name: "parameter".to_string(),
                storage_name: "storage".to_string(),
            })
            .collect()
    })
}

/// Record and sum names occurring anywhere in `ty`.
fn named_types(ty: &Datatype, out: &mut Vec<String>) {
    match ty {
        Datatype::Record { name, fields: items } | Datatype::Sum { name, constrs: items } => {
            out.push(name.clone());
            for (_, t) in items {
                named_types(t, out);
            }
        }
        Datatype::Tuple(ts) => ts.iter().for_each(|t| named_types(t, out)),
        Datatype::Option(t) | Datatype::List(t) | Datatype::Set(t) => named_types(t, out),
        Datatype::Map(a, b) | Datatype::BigMap(a, b) | Datatype::Or(a, b) | Datatype::Lambda(a, b) => {
            named_types(a, out);
            named_types(b, out);
        }
        Datatype::Closure { arg, env, ret } => {
            named_types(arg, out);
            named_types(env, out);
            named_types(ret, out);
        }
        Datatype::Contract(sig) => {
            for entry in &sig.entries_sig {
                named_types(&entry.parameter, out);
            }
        }
        _ => {}
    }
}

fn env_declaring_locals() -> (Env, ScopeId) {
    let mut env = Env::new("Main");
    let root = env.root();
    for name in LOCAL_NAMES {
        env.declare_type(root, name, Datatype::Unit)
            .expect("fresh scope accepts each local name once");
    }
    (env, root)
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn eq_types_is_reflexive(ty in arb_type(3, LOCAL_NAMES)) {
        prop_assert!(eq_types(&ty, &ty));
    }

    #[test]
    fn eq_types_is_symmetric(a in arb_type(2, LOCAL_NAMES), b in arb_type(2, LOCAL_NAMES)) {
        prop_assert_eq!(eq_types(&a, &b), eq_types(&b, &a));
    }

    /// Structurally identical types are always equal, and `eq_types` never
    /// claims equality where the derived comparison sees a difference
    /// outside contract signatures.
    #[test]
    fn eq_types_agrees_with_structural_equality(a in arb_type(2, LOCAL_NAMES), b in arb_type(2, LOCAL_NAMES)) {
        if a == b {
            prop_assert!(eq_types(&a, &b));
        }
    }

    #[test]
    fn composite_types_are_not_comparable(ty in arb_type(2, LOCAL_NAMES)) {
        let composite = Datatype::list(ty);
        prop_assert!(!comparable_type(&composite));
    }

    #[test]
    fn eq_signature_ignores_sig_name(entries in arb_entries(), n1 in "[A-Z][a-z]{0,5}", n2 in "[A-Z][a-z]{0,5}") {
        let s1 = ContractSig { sig_name: Some(n1), entries_sig: entries.clone() };
        let mut renamed = entries;
        for entry in &mut renamed {
            entry.parm_name = "p".to_string();
            entry.storage_name = "s".to_string();
        }
        let s2 = ContractSig { sig_name: Some(n2), entries_sig: renamed };
        prop_assert!(eq_signature(&s1, &s2));
        let anonymous = ContractSig { sig_name: None, ..s2 };
        prop_assert!(eq_signature(&s1, &anonymous));
    }

    #[test]
    fn lift_is_identity_without_local_names(ty in arb_type(3, OUTER_NAMES)) {
        let (env, root) = env_declaring_locals();
        prop_assert_eq!(env.lift_type(root, &ty), ty);
    }

    #[test]
    fn lift_qualifies_every_local_name(ty in arb_type(3, LOCAL_NAMES)) {
        let (env, root) = env_declaring_locals();
        let lifted = env.lift_type(root, &ty);

        let mut before = Vec::new();
        named_types(&ty, &mut before);
        let mut after = Vec::new();
        named_types(&lifted, &mut after);

        prop_assert_eq!(before.len(), after.len());
        for (orig, new) in before.iter().zip(&after) {
            prop_assert_eq!(new, &format!("Main.{orig}"));
        }
        prop_assert_eq!(env.lift_type(root, &lifted), lifted);
    }
}
