//! Compile typed expressions, decompile the result and compare the trees up
//! to renaming of bound variables.

use liquidity_ast::{
    Constructor, ContractCode, ExpDesc, LoopAcc, SyntaxExp, TypedExp, eq_exp_modulo_renaming,
};
use liquidity_decomp::{DecompileError, DecompileOptions, decompile_code, decompile_contract};
use liquidity_michelson::{Instr, MicContract, Michelson, compile_contract, compile_exp};
use liquidity_prims::{FoldPrimitive, Primitive};
use liquidity_types::{Const, Datatype};

fn int(n: i64) -> TypedExp {
    TypedExp::constant(Datatype::Int, Const::int(n), Datatype::Int)
}

fn var(x: &str, ty: Datatype) -> TypedExp {
    TypedExp::var(x, ty)
}

fn round_trip(e: &TypedExp, inputs: &[(&str, Datatype)]) -> SyntaxExp {
    let names: Vec<String> = inputs.iter().map(|(n, _)| n.to_string()).collect();
    let code = compile_exp(e, &names).unwrap();
    let typed: Vec<(String, Datatype)> = inputs
        .iter()
        .map(|(n, t)| (n.to_string(), t.clone()))
        .collect();
    decompile_code(&code, &typed, &DecompileOptions::default()).unwrap()
}

fn assert_round_trip(e: &TypedExp, inputs: &[(&str, Datatype)]) {
    let back = round_trip(e, inputs);
    assert!(
        eq_exp_modulo_renaming(&e.untype(), &back),
        "expected {:?}\n     got {:?}",
        e.untype(),
        back
    );
}

#[test]
fn conditional() {
    let e = TypedExp::mk(
        ExpDesc::If {
            cond: Box::new(var("b", Datatype::Bool)),
            ifthen: Box::new(int(1)),
            ifelse: Box::new(int(2)),
        },
        Datatype::Int,
    );
    assert_round_trip(&e, &[("b", Datatype::Bool)]);
}

#[test]
fn bare_variable() {
    assert_round_trip(&var("x", Datatype::Int), &[("x", Datatype::Int)]);
}

#[test]
fn second_input_is_not_dropped() {
    let inputs = [("x", Datatype::Int), ("y", Datatype::Nat)];
    assert_round_trip(&var("y", Datatype::Nat), &inputs);
}

#[test]
fn arithmetic_on_two_inputs() {
    let e = TypedExp::apply(
        Primitive::Mul,
        vec![
            TypedExp::apply(
                Primitive::Add,
                vec![var("x", Datatype::Int), int(1)],
                Datatype::Int,
            ),
            var("y", Datatype::Int),
        ],
        Datatype::Int,
    );
    assert_round_trip(&e, &[("x", Datatype::Int), ("y", Datatype::Int)]);
}

#[test]
fn loop_left_counts_up() {
    let acc = || var("acc", Datatype::Int);
    let or_ty = Datatype::or(Datatype::Int, Datatype::Int);
    let body = TypedExp::mk(
        ExpDesc::If {
            cond: Box::new(TypedExp::apply(
                Primitive::Ge,
                vec![acc(), int(10)],
                Datatype::Bool,
            )),
            ifthen: Box::new(TypedExp::mk(
                ExpDesc::Constructor {
                    constr: Constructor::Right(Datatype::Int),
                    arg: Box::new(acc()),
                },
                or_ty.clone(),
            )),
            ifelse: Box::new(TypedExp::mk(
                ExpDesc::Constructor {
                    constr: Constructor::Left(Datatype::Int),
                    arg: Box::new(TypedExp::apply(
                        Primitive::Add,
                        vec![acc(), int(1)],
                        Datatype::Int,
                    )),
                },
                or_ty.clone(),
            )),
        },
        or_ty,
    );
    let e = TypedExp::mk(
        ExpDesc::LoopLeft {
            arg_name: "acc".to_string(),
            body: Box::new(body),
            arg: Box::new(var("x", Datatype::Int)),
            acc: None,
        },
        Datatype::Int,
    );
    assert_round_trip(&e, &[("x", Datatype::Int)]);
}

#[test]
fn loop_left_with_accumulator() {
    let n = || var("n", Datatype::Int);
    let s = || var("s", Datatype::Int);
    let or_ty = Datatype::or(Datatype::Int, Datatype::Int);
    let step_ty = Datatype::pair(or_ty.clone(), Datatype::Int);
    let body = TypedExp::mk(
        ExpDesc::If {
            cond: Box::new(TypedExp::apply(
                Primitive::Ge,
                vec![n(), int(10)],
                Datatype::Bool,
            )),
            ifthen: Box::new(TypedExp::apply(
                Primitive::Tuple,
                vec![
                    TypedExp::mk(
                        ExpDesc::Constructor {
                            constr: Constructor::Right(Datatype::Int),
                            arg: Box::new(n()),
                        },
                        or_ty.clone(),
                    ),
                    s(),
                ],
                step_ty.clone(),
            )),
            ifelse: Box::new(TypedExp::apply(
                Primitive::Tuple,
                vec![
                    TypedExp::mk(
                        ExpDesc::Constructor {
                            constr: Constructor::Left(Datatype::Int),
                            arg: Box::new(TypedExp::apply(
                                Primitive::Add,
                                vec![n(), int(1)],
                                Datatype::Int,
                            )),
                        },
                        or_ty,
                    ),
                    TypedExp::apply(Primitive::Add, vec![s(), n()], Datatype::Int),
                ],
                step_ty.clone(),
            )),
        },
        step_ty,
    );
    let e = TypedExp::mk(
        ExpDesc::LoopLeft {
            arg_name: "n".to_string(),
            body: Box::new(body),
            arg: Box::new(var("x", Datatype::Int)),
            acc: Some(LoopAcc {
                name: "s".to_string(),
                init: Box::new(int(0)),
            }),
        },
        Datatype::pair(Datatype::Int, Datatype::Int),
    );
    assert_round_trip(&e, &[("x", Datatype::Int)]);
}

#[test]
fn list_fold_sums() {
    let list_ty = Datatype::list(Datatype::Int);
    let e = TypedExp::mk(
        ExpDesc::Fold {
            prim: FoldPrimitive::ListFold,
            elt_name: "e".to_string(),
            acc_name: "s".to_string(),
            body: Box::new(TypedExp::apply(
                Primitive::Add,
                vec![var("e", Datatype::Int), var("s", Datatype::Int)],
                Datatype::Int,
            )),
            arg: Box::new(var("l", list_ty.clone())),
            acc: Box::new(int(0)),
        },
        Datatype::Int,
    );
    assert_round_trip(&e, &[("l", list_ty)]);
}

#[test]
fn match_nat_splits_on_sign() {
    let e = TypedExp::mk(
        ExpDesc::MatchNat {
            arg: Box::new(var("x", Datatype::Int)),
            plus_name: "p".to_string(),
            ifplus: Box::new(var("p", Datatype::Nat)),
            minus_name: "m".to_string(),
            ifminus: Box::new(var("m", Datatype::Nat)),
        },
        Datatype::Nat,
    );
    assert_round_trip(&e, &[("x", Datatype::Int)]);
}

#[test]
fn match_nat_can_be_left_as_an_option_match() {
    let e = TypedExp::mk(
        ExpDesc::MatchNat {
            arg: Box::new(var("x", Datatype::Int)),
            plus_name: "p".to_string(),
            ifplus: Box::new(var("p", Datatype::Nat)),
            minus_name: "m".to_string(),
            ifminus: Box::new(var("m", Datatype::Nat)),
        },
        Datatype::Nat,
    );
    let code = compile_exp(&e, &["x".to_string()]).unwrap();
    let options = DecompileOptions {
        match_nat: false,
        ..DecompileOptions::default()
    };
    let back = decompile_code(&code, &[("x".to_string(), Datatype::Int)], &options).unwrap();
    assert!(matches!(back.desc(), ExpDesc::MatchOption { .. }), "{back:?}");
}

#[test]
fn closure_applied_to_a_constant() {
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
        Datatype::Lambda(Box::new(Datatype::Int), Box::new(Datatype::Int)),
    );
    let e = TypedExp::apply(Primitive::Exec, vec![int(3), closure], Datatype::Int);
    assert_round_trip(&e, &[("y", Datatype::Int)]);
}

#[test]
fn closure_over_two_values() {
    let closure = TypedExp::mk(
        ExpDesc::Closure {
            arg_name: "x".to_string(),
            arg_ty: Datatype::Int,
            call_env: vec![
                ("y".to_string(), var("y", Datatype::Int)),
                ("z".to_string(), var("z", Datatype::Int)),
            ],
            body: Box::new(TypedExp::apply(
                Primitive::Add,
                vec![
                    var("x", Datatype::Int),
                    TypedExp::apply(
                        Primitive::Mul,
                        vec![var("y", Datatype::Int), var("z", Datatype::Int)],
                        Datatype::Int,
                    ),
                ],
                Datatype::Int,
            )),
            ret_ty: Datatype::Int,
        },
        Datatype::Lambda(Box::new(Datatype::Int), Box::new(Datatype::Int)),
    );
    let e = TypedExp::apply(Primitive::Exec, vec![int(3), closure], Datatype::Int);
    assert_round_trip(&e, &[("y", Datatype::Int), ("z", Datatype::Int)]);
}

#[test]
fn failing_branch() {
    let e = TypedExp::mk(
        ExpDesc::If {
            cond: Box::new(var("b", Datatype::Bool)),
            ifthen: Box::new(TypedExp::mk(
                ExpDesc::Failwith(Box::new(int(7))),
                Datatype::Int,
            )),
            ifelse: Box::new(int(2)),
        },
        Datatype::Int,
    );
    assert_round_trip(&e, &[("b", Datatype::Bool)]);
}

#[test]
fn contract_survives_json() {
    let ops = Datatype::list(Datatype::Operation);
    let body = TypedExp::apply(
        Primitive::Tuple,
        vec![
            TypedExp::constant(ops.clone(), Const::List(vec![]), ops.clone()),
            TypedExp::apply(
                Primitive::Add,
                vec![var("storage", Datatype::Int), var("parameter", Datatype::Int)],
                Datatype::Int,
            ),
        ],
        Datatype::pair(ops, Datatype::Int),
    );
    let contract = ContractCode {
        parameter: Datatype::Int,
        storage: Datatype::Int,
        code: body,
    };
    let packaged = compile_contract(&contract).unwrap();
    let json = packaged.to_json().unwrap();
    let reloaded = MicContract::<Michelson>::from_json(&json).unwrap();
    let back = decompile_contract(&reloaded).unwrap();
    assert_eq!(back.parameter, Datatype::Int);
    assert_eq!(back.storage, Datatype::Int);
    assert!(eq_exp_modulo_renaming(&contract.code.untype(), &back.code), "{:?}", back.code);
}

#[test]
fn mismatched_branches_are_rejected() {
    let code = Michelson::seq(vec![
        Instr::If(
            Box::new(Michelson::seq(vec![Instr::Unit.into()])),
            Box::new(Michelson::seq(vec![])),
        )
        .into(),
    ]);
    let err = decompile_code(
        &code,
        &[("b".to_string(), Datatype::Bool)],
        &DecompileOptions::default(),
    )
    .unwrap_err();
    assert!(
        matches!(
            err,
            DecompileError::BranchArity {
                then_depth: 1,
                else_depth: 0,
                ..
            }
        ),
        "{err:?}"
    );
}
