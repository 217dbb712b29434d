//! Property tests for effect flags.
//!
//! 1. `fails` holds exactly when a failure is reachable without entering a
//!    lambda body
//! 2. `transfers` is set on emitting nodes only
//! 3. flags and structure survive a retyping rebuild
//! 4. `eq_exp_modulo_renaming` is reflexive

use proptest::prelude::*;

use liquidity_prims::Primitive;
use liquidity_types::{Const, Datatype};

use crate::*;

type E = SyntaxExp;

const VARS: &[&str] = &["x", "y", "storage"];

fn arb_leaf() -> impl Strategy<Value = E> {
    prop_oneof![
        prop::sample::select(VARS).prop_map(|x| E::var(x, ())),
        any::<i64>().prop_map(|n| E::constant(Datatype::Int, Const::int(n), ())),
        Just(E::unit()),
        Just(E::apply(Primitive::Now, vec![], ())),
    ]
}

fn arb_exp() -> impl Strategy<Value = E> {
    arb_leaf().prop_recursive(4, 32, 3, |inner| {
        let name = prop::sample::select(VARS).prop_map(str::to_string);
        prop_oneof![
            inner
                .clone()
                .prop_map(|e| E::mk(ExpDesc::Failwith(Box::new(e)), ())),
            (inner.clone(), inner.clone())
                .prop_map(|(a, b)| E::apply(Primitive::Add, vec![a, b], ())),
            (inner.clone(), inner.clone())
                .prop_map(|(a, f)| E::apply(Primitive::Exec, vec![a, f], ())),
            inner
                .clone()
                .prop_map(|k| E::apply(Primitive::CreateAccount, vec![k], ())),
            (inner.clone(), inner.clone(), inner.clone()).prop_map(|(c, t, e)| E::mk(
                ExpDesc::If {
                    cond: Box::new(c),
                    ifthen: Box::new(t),
                    ifelse: Box::new(e),
                },
                ()
            )),
            (name.clone(), inner.clone(), inner.clone()).prop_map(|(x, v, b)| E::mk(
                ExpDesc::Let {
                    bnd_var: x,
                    inline: Inline::Auto,
                    bnd_val: Box::new(v),
                    body: Box::new(b),
                },
                ()
            )),
            (inner.clone(), inner.clone())
                .prop_map(|(a, b)| E::mk(ExpDesc::Seq(Box::new(a), Box::new(b)), ())),
            (inner.clone(), inner.clone()).prop_map(|(amount, arg)| E::mk(
                ExpDesc::Transfer {
                    dest: Box::new(E::var("dest", ())),
                    amount: Box::new(amount),
                    entry: None,
                    arg: Box::new(arg),
                },
                ()
            )),
            (name, inner).prop_map(|(x, body)| E::mk(
                ExpDesc::Lambda {
                    arg_name: x,
                    arg_ty: Datatype::Int,
                    body: Box::new(body),
                    ret_ty: Datatype::Int,
                },
                ()
            )),
        ]
    })
}

fn reaches_failure(e: &E) -> bool {
    match e.desc() {
        ExpDesc::Failwith(_) => true,
        ExpDesc::Lambda { .. } => false,
        ExpDesc::Apply {
            prim: Primitive::Exec,
            ..
        } => true,
        desc => children(desc).into_iter().any(reaches_failure),
    }
}

fn emits(e: &E) -> bool {
    matches!(
        e.desc(),
        ExpDesc::Transfer { .. }
            | ExpDesc::Apply {
                prim: Primitive::CreateAccount,
                ..
            }
    )
}

fn all_nodes<'a>(e: &'a E, out: &mut Vec<&'a E>) {
    out.push(e);
    for c in children(e.desc()) {
        all_nodes(c, out);
    }
}

proptest! {
    #[test]
    fn fails_matches_reachable_failure(e in arb_exp()) {
        let mut nodes = Vec::new();
        all_nodes(&e, &mut nodes);
        for n in nodes {
            prop_assert_eq!(n.fails(), reaches_failure(n), "{}", n);
        }
    }

    #[test]
    fn transfers_marks_emitting_nodes_only(e in arb_exp()) {
        let mut nodes = Vec::new();
        all_nodes(&e, &mut nodes);
        for n in nodes {
            prop_assert_eq!(n.transfers(), emits(n));
        }
    }

    #[test]
    fn rebuild_preserves_flags(e in arb_exp()) {
        let typed: TypedExp = e.map_ty(&mut |_| Datatype::Unit);
        prop_assert_eq!(typed.fails(), e.fails());
        prop_assert_eq!(typed.transfers(), e.transfers());
        prop_assert_eq!(typed.bound_vars(), e.bound_vars());
        prop_assert_eq!(typed.untype(), e);
    }

    #[test]
    fn renaming_equality_is_reflexive(e in arb_exp()) {
        prop_assert!(eq_exp_modulo_renaming(&e, &e));
        prop_assert!(eq_exp(&e, &e, &|_: &(), _: &()| true, &mut Literal));
    }
}
