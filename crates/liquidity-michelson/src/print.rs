//! Concrete Michelson syntax.

use std::fmt::{self, Write};

use liquidity_types::{Const, ContractSig, Datatype};

use crate::{Instr, MicContract, Michelson};

/// Displays a [`Datatype`] in Michelson syntax.
///
/// Tuples and records print as right-combed pairs, sums as right-combed
/// `or`, closures as the lambda over `(pair env arg)` they compile to.
pub struct MichelsonType<'a>(pub &'a Datatype);

impl fmt::Display for MichelsonType<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_type(f, self.0)
    }
}

fn write_comb<'a>(
    f: &mut dyn Write,
    keyword: &str,
    items: impl ExactSizeIterator<Item = &'a Datatype>,
) -> fmt::Result {
    let n = items.len();
    for (k, ty) in items.enumerate() {
        if k + 1 < n {
            write!(f, "({keyword} ")?;
            write_type(f, ty)?;
            f.write_char(' ')?;
        } else {
            write_type(f, ty)?;
        }
    }
    for _ in 1..n {
        f.write_char(')')?;
    }
    Ok(())
}

fn write_sig(f: &mut dyn Write, sig: &ContractSig) -> fmt::Result {
    if sig.entries_sig.is_empty() {
        return f.write_str("unit");
    }
    write_comb(f, "or", sig.entries_sig.iter().map(|e| &e.parameter))
}

fn write_type(f: &mut dyn Write, ty: &Datatype) -> fmt::Result {
    match ty {
        Datatype::Unit => f.write_str("unit"),
        Datatype::Bool => f.write_str("bool"),
        Datatype::Int => f.write_str("int"),
        Datatype::Nat => f.write_str("nat"),
        Datatype::Tez => f.write_str("mutez"),
        Datatype::String => f.write_str("string"),
        Datatype::Bytes => f.write_str("bytes"),
        Datatype::Timestamp => f.write_str("timestamp"),
        Datatype::Key => f.write_str("key"),
        Datatype::KeyHash => f.write_str("key_hash"),
        Datatype::Signature => f.write_str("signature"),
        Datatype::Operation => f.write_str("operation"),
        Datatype::Address => f.write_str("address"),
        Datatype::Fail => f.write_str("never"),
        Datatype::Tuple(ts) if ts.is_empty() => f.write_str("unit"),
        Datatype::Tuple(ts) => write_comb(f, "pair", ts.iter()),
        Datatype::Record { fields, .. } => write_comb(f, "pair", fields.iter().map(|(_, t)| t)),
        Datatype::Sum { constrs, .. } => write_comb(f, "or", constrs.iter().map(|(_, t)| t)),
        Datatype::Option(t) => unary(f, "option", t),
        Datatype::List(t) => unary(f, "list", t),
        Datatype::Set(t) => unary(f, "set", t),
        Datatype::Contract(sig) => {
            f.write_str("(contract ")?;
            write_sig(f, sig)?;
            f.write_char(')')
        }
        Datatype::Map(k, v) => binary(f, "map", k, v),
        Datatype::BigMap(k, v) => binary(f, "big_map", k, v),
        Datatype::Or(l, r) => binary(f, "or", l, r),
        Datatype::Lambda(a, r) => binary(f, "lambda", a, r),
        Datatype::Closure { arg, env, ret } => {
            f.write_str("(lambda (pair ")?;
            write_type(f, env)?;
            f.write_char(' ')?;
            write_type(f, arg)?;
            f.write_str(") ")?;
            write_type(f, ret)?;
            f.write_char(')')
        }
    }
}

fn unary(f: &mut dyn Write, keyword: &str, t: &Datatype) -> fmt::Result {
    write!(f, "({keyword} ")?;
    write_type(f, t)?;
    f.write_char(')')
}

fn binary(f: &mut dyn Write, keyword: &str, a: &Datatype, b: &Datatype) -> fmt::Result {
    write!(f, "({keyword} ")?;
    write_type(f, a)?;
    f.write_char(' ')?;
    write_type(f, b)?;
    f.write_char(')')
}

fn write_const(f: &mut dyn Write, c: &Const) -> fmt::Result {
    match c {
        Const::Unit => f.write_str("Unit"),
        Const::Bool(true) => f.write_str("True"),
        Const::Bool(false) => f.write_str("False"),
        Const::Int(n) | Const::Nat(n) => write!(f, "{n}"),
        Const::Tez(t) => match t.to_mutez() {
            Some(m) => write!(f, "{m}"),
            None => write!(f, "{t}"),
        },
        Const::Timestamp(s)
        | Const::String(s)
        | Const::Key(s)
        | Const::KeyHash(s)
        | Const::Signature(s)
        | Const::Address(s) => write!(f, "{s:?}"),
        Const::Bytes(b) => {
            f.write_str("0x")?;
            for byte in b {
                write!(f, "{byte:02x}")?;
            }
            Ok(())
        }
        Const::Tuple(cs) => write_pair_comb(f, cs.iter()),
        Const::Record(fields) => write_pair_comb(f, fields.iter().map(|(_, c)| c)),
        Const::None => f.write_str("None"),
        Const::Some(c) => wrap(f, "Some", c),
        Const::Left(c) => wrap(f, "Left", c),
        Const::Right(c) => wrap(f, "Right", c),
        Const::Constr(name, c) => wrap(f, name, c),
        Const::List(cs) | Const::Set(cs) => {
            f.write_char('{')?;
            for (k, c) in cs.iter().enumerate() {
                f.write_str(if k == 0 { " " } else { " ; " })?;
                write_const(f, c)?;
            }
            f.write_str(if cs.is_empty() { "}" } else { " }" })
        }
        Const::Map(kvs) | Const::BigMap(kvs) => {
            f.write_char('{')?;
            for (k, (key, value)) in kvs.iter().enumerate() {
                f.write_str(if k == 0 { " Elt " } else { " ; Elt " })?;
                write_const(f, key)?;
                f.write_char(' ')?;
                write_const(f, value)?;
            }
            f.write_str(if kvs.is_empty() { "}" } else { " }" })
        }
    }
}

fn wrap(f: &mut dyn Write, keyword: &str, c: &Const) -> fmt::Result {
    write!(f, "({keyword} ")?;
    write_const(f, c)?;
    f.write_char(')')
}

fn write_pair_comb<'a>(
    f: &mut dyn Write,
    items: impl ExactSizeIterator<Item = &'a Const>,
) -> fmt::Result {
    let n = items.len();
    if n == 0 {
        return f.write_str("Unit");
    }
    for (k, c) in items.enumerate() {
        if k + 1 < n {
            f.write_str("(Pair ")?;
            write_const(f, c)?;
            f.write_char(' ')?;
        } else {
            write_const(f, c)?;
        }
    }
    for _ in 1..n {
        f.write_char(')')?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Instructions
// ---------------------------------------------------------------------------

struct Printer<'w> {
    out: &'w mut dyn Write,
    indent: usize,
}

impl Printer<'_> {
    fn newline(&mut self) -> fmt::Result {
        self.out.write_char('\n')?;
        for _ in 0..self.indent {
            self.out.write_str("  ")?;
        }
        Ok(())
    }

    fn block(&mut self, m: &Michelson) -> fmt::Result {
        let items = m.flatten();
        if items.is_empty() {
            return self.out.write_str("{}");
        }
        self.out.write_str("{ ")?;
        self.indent += 1;
        for (k, item) in items.iter().enumerate() {
            if k > 0 {
                self.out.write_str(" ;")?;
                self.newline()?;
            }
            self.instr(item)?;
        }
        self.indent -= 1;
        self.out.write_str(" }")
    }

    fn count(&mut self, op: &str, n: u32) -> fmt::Result {
        if n == 1 {
            self.out.write_str(op)
        } else {
            write!(self.out, "{op} {n}")
        }
    }

    fn ty(&mut self, ty: &Datatype) -> fmt::Result {
        self.out.write_char(' ')?;
        write_type(self.out, ty)
    }

    fn instr(&mut self, m: &Michelson) -> fmt::Result {
        let op = m.ins.opcode();
        match &m.ins {
            Instr::Seq(_) => return self.block(m),
            Instr::Drop(n) | Instr::Dup(n) => self.count(op, *n)?,
            Instr::Dig(n) | Instr::Dug(n) => write!(self.out, "{op} {n}")?,
            Instr::Dip(n, body) => {
                self.count(op, *n)?;
                self.out.write_char(' ')?;
                self.block(body)?;
            }
            Instr::Rename(name) => {
                self.out.write_str(op)?;
                if let Some(name) = name {
                    write!(self.out, " @{name}")?;
                }
            }
            Instr::Push(ty, c) => {
                self.out.write_str(op)?;
                self.ty(ty)?;
                self.out.write_char(' ')?;
                write_const(self.out, c)?;
            }
            Instr::Nil(t)
            | Instr::EmptySet(t)
            | Instr::None(t)
            | Instr::Left(t)
            | Instr::Right(t)
            | Instr::Unpack(t)
            | Instr::Contract(t) => {
                self.out.write_str(op)?;
                self.ty(t)?;
            }
            Instr::EmptyMap(k, v) | Instr::EmptyBigMap(k, v) => {
                self.out.write_str(op)?;
                self.ty(k)?;
                self.ty(v)?;
            }
            Instr::If(a, b) | Instr::IfNone(a, b) | Instr::IfCons(a, b) | Instr::IfLeft(a, b) => {
                write!(self.out, "{op} ")?;
                self.block(a)?;
                self.newline()?;
                self.out.write_str("   ")?;
                self.block(b)?;
            }
            Instr::Loop(body) | Instr::LoopLeft(body) | Instr::Iter(body) | Instr::Map(body) => {
                write!(self.out, "{op} ")?;
                self.block(body)?;
            }
            Instr::Lambda(arg, ret, body) => {
                self.out.write_str(op)?;
                self.ty(arg)?;
                self.ty(ret)?;
                self.out.write_char(' ')?;
                self.block(body)?;
            }
            Instr::CreateContract(contract) => {
                write!(self.out, "{op} {{")?;
                self.indent += 1;
                self.contract(contract)?;
                self.indent -= 1;
                self.out.write_str(" }")?;
            }
            _ => self.out.write_str(op)?,
        }
        match (&m.name, &m.ins) {
            (Some(_), Instr::Rename(_)) | (None, _) => {}
            (Some(name), _) => write!(self.out, " @{name}")?,
        }
        Ok(())
    }

    fn contract(&mut self, c: &MicContract<Michelson>) -> fmt::Result {
        self.newline()?;
        self.out.write_str("parameter ")?;
        write_type(self.out, &c.parameter)?;
        self.out.write_str(" ;")?;
        self.newline()?;
        self.out.write_str("storage ")?;
        write_type(self.out, &c.storage)?;
        self.out.write_str(" ;")?;
        self.newline()?;
        self.out.write_str("code ")?;
        self.block(&c.code)?;
        self.out.write_str(" ;")
    }
}

impl fmt::Display for Michelson {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Printer { out: f, indent: 0 }.instr(self)
    }
}

impl fmt::Display for MicContract<Michelson> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut p = Printer { out: f, indent: 0 };
        write!(p.out, "parameter ")?;
        write_type(p.out, &self.parameter)?;
        p.out.write_str(" ;\nstorage ")?;
        write_type(p.out, &self.storage)?;
        p.out.write_str(" ;\ncode ")?;
        p.block(&self.code)?;
        p.out.write_str(" ;")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn types_print_as_combs() {
        let t = Datatype::Tuple(vec![Datatype::Int, Datatype::Tez, Datatype::list(Datatype::Bool)]);
        assert_eq!(MichelsonType(&t).to_string(), "(pair int (pair mutez (list bool)))");
        let sum = Datatype::Sum {
            name: "action".to_string(),
            constrs: vec![
                ("Incr".to_string(), Datatype::Int),
                ("Reset".to_string(), Datatype::Unit),
            ],
        };
        assert_eq!(MichelsonType(&sum).to_string(), "(or int unit)");
        let closure = Datatype::Closure {
            arg: Box::new(Datatype::Int),
            env: Box::new(Datatype::Nat),
            ret: Box::new(Datatype::Bool),
        };
        assert_eq!(MichelsonType(&closure).to_string(), "(lambda (pair nat int) bool)");
        assert_eq!(MichelsonType(&Datatype::Fail).to_string(), "never");
    }

    #[test]
    fn constants_print_in_michelson_syntax() {
        let c = Const::Tuple(vec![Const::int(1), Const::Bool(true), Const::String("a".into())]);
        let m = Michelson::new(Instr::Push(
            Datatype::Tuple(vec![Datatype::Int, Datatype::Bool, Datatype::String]),
            c,
        ));
        assert_eq!(
            m.to_string(),
            "PUSH (pair int (pair bool string)) (Pair 1 (Pair True \"a\"))"
        );
        let tez = Const::Tez(liquidity_types::Tez {
            tezzies: "1".to_string(),
            mutez: Some("5".to_string()),
        });
        let m = Michelson::new(Instr::Push(Datatype::Tez, tez));
        assert_eq!(m.to_string(), "PUSH mutez 1500000");
        let list = Const::List(vec![Const::int(1), Const::int(2)]);
        let m = Michelson::new(Instr::Push(Datatype::list(Datatype::Int), list));
        assert_eq!(m.to_string(), "PUSH (list int) { 1 ; 2 }");
    }

    #[test]
    fn blocks_are_flattened_and_indented() {
        let code = Michelson::seq(vec![
            Instr::Dup(2).into(),
            Michelson::new(Instr::If(
                Box::new(Michelson::seq(vec![Instr::Drop(1).into()])),
                Box::new(Michelson::seq(vec![])),
            )),
            Michelson::dip(1, vec![Instr::Drop(2).into()]),
        ]);
        assert_eq!(
            code.to_string(),
            "{ DUP 2 ;\n  IF { DROP }\n     {} ;\n  DIP { DROP 2 } }"
        );
    }

    #[test]
    fn contract_header() {
        let c = MicContract {
            parameter: Datatype::Unit,
            storage: Datatype::Int,
            code: Michelson::seq(vec![
                Instr::Cdr.into(),
                Instr::Nil(Datatype::Operation).into(),
                Instr::Pair.into(),
            ]),
        };
        assert_eq!(
            c.to_string(),
            "parameter unit ;\nstorage int ;\ncode { CDR ;\n  NIL operation ;\n  PAIR } ;"
        );
    }
}
