//! ML-style surface rendering of expression trees.

use std::fmt::{self, Write};

use liquidity_prims::{Named, Primitive};
use liquidity_types::{Const, Datatype};

use crate::{Constructor, Exp, ExpDesc, Inline, Pattern};

impl<T, S> fmt::Display for Exp<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut p = Printer {
            out: String::new(),
            indent: 0,
        };
        p.exp(self, false)?;
        f.write_str(&p.out)
    }
}

struct Printer {
    out: String,
    indent: usize,
}

fn is_operator(name: &str) -> bool {
    name.chars()
        .next()
        .is_some_and(|c| !c.is_ascii_alphabetic() && c != '_')
}

impl Printer {
    fn newline(&mut self) -> fmt::Result {
        self.out.push('\n');
        for _ in 0..self.indent {
            self.out.push_str("  ");
        }
        Ok(())
    }

    fn nested<T, S>(&mut self, e: &Exp<T, S>) -> fmt::Result {
        self.indent += 1;
        self.newline()?;
        self.exp(e, false)?;
        self.indent -= 1;
        Ok(())
    }

    /// `atomic` asks for parentheses around anything that is not a leaf.
    fn exp<T, S>(&mut self, e: &Exp<T, S>, atomic: bool) -> fmt::Result {
        let leaf = matches!(e.desc(), ExpDesc::Var(_) | ExpDesc::Const { .. })
            || matches!(e.desc(), ExpDesc::Apply { args, .. } if args.is_empty());
        let paren = atomic && !leaf;
        if paren {
            self.out.push('(');
        }
        self.desc(e.desc())?;
        if paren {
            self.out.push(')');
        }
        Ok(())
    }

    fn args<T, S>(&mut self, args: &[Exp<T, S>]) -> fmt::Result {
        for a in args {
            self.out.push(' ');
            self.exp(a, true)?;
        }
        Ok(())
    }

    fn apply<T, S>(&mut self, prim: Primitive, args: &[Exp<T, S>]) -> fmt::Result {
        match (prim, args) {
            (Primitive::TupleGet, [t, i]) => {
                self.exp(t, true)?;
                self.out.push_str(".(");
                self.exp(i, false)?;
                self.out.push(')');
            }
            (Primitive::Tuple, _) => {
                self.out.push('(');
                for (k, a) in args.iter().enumerate() {
                    if k > 0 {
                        self.out.push_str(", ");
                    }
                    self.exp(a, false)?;
                }
                self.out.push(')');
            }
            (_, [a, b]) if is_operator(prim.name()) => {
                self.exp(a, true)?;
                write!(self.out, " {} ", prim.name())?;
                self.exp(b, true)?;
            }
            (_, []) => self.out.push_str(prim.name()),
            _ => {
                self.out.push_str(prim.name());
                self.args(args)?;
            }
        }
        Ok(())
    }

    fn binder(&mut self, name: &str, ty: &Datatype) -> fmt::Result {
        write!(self.out, "({name} : {ty})")
    }

    fn desc<T, S>(&mut self, desc: &ExpDesc<T, S>) -> fmt::Result {
        match desc {
            ExpDesc::Let {
                bnd_var,
                inline,
                bnd_val,
                body,
            } => {
                let attr = match inline {
                    Inline::Always => "[@inline] ",
                    Inline::Never => "[@noinline] ",
                    Inline::Auto => "",
                };
                write!(self.out, "let {attr}{bnd_var} =")?;
                self.nested(bnd_val)?;
                self.out.push_str(" in");
                self.newline()?;
                self.exp(body, false)?;
            }
            ExpDesc::Var(name) => self.out.push_str(name),
            ExpDesc::SetField {
                record,
                field,
                set_val,
            } => {
                self.out.push_str("{ ");
                self.exp(record, true)?;
                write!(self.out, " with {field} = ")?;
                self.exp(set_val, false)?;
                self.out.push_str(" }");
            }
            ExpDesc::Project { field, record } => {
                self.exp(record, true)?;
                write!(self.out, ".{field}")?;
            }
            ExpDesc::Const { ty, value } => match (ty, value) {
                (Datatype::List(_) | Datatype::Set(_) | Datatype::Map(..), _)
                | (_, Const::None) => write!(self.out, "({value} : {ty})")?,
                _ => write!(self.out, "{value}")?,
            },
            ExpDesc::Apply { prim, args } => self.apply(*prim, args)?,
            ExpDesc::If {
                cond,
                ifthen,
                ifelse,
            } => {
                self.out.push_str("if ");
                self.exp(cond, false)?;
                self.out.push_str(" then");
                self.nested(ifthen)?;
                self.newline()?;
                self.out.push_str("else");
                self.nested(ifelse)?;
            }
            ExpDesc::Seq(a, b) => {
                self.exp(a, false)?;
                self.out.push(';');
                self.newline()?;
                self.exp(b, false)?;
            }
            ExpDesc::Transfer {
                dest,
                amount,
                entry,
                arg,
            } => {
                self.out.push_str("Contract.call ");
                self.exp(dest, true)?;
                self.out.push(' ');
                self.exp(amount, true)?;
                if let Some(entry) = entry {
                    write!(self.out, " {entry}")?;
                }
                self.out.push(' ');
                self.exp(arg, true)?;
            }
            ExpDesc::Failwith(arg) => {
                self.out.push_str("failwith ");
                self.exp(arg, true)?;
            }
            ExpDesc::MatchOption {
                arg,
                ifnone,
                some_name,
                ifsome,
            } => {
                self.out.push_str("match ");
                self.exp(arg, false)?;
                self.out.push_str(" with");
                self.newline()?;
                self.out.push_str("| None ->");
                self.nested(ifnone)?;
                self.newline()?;
                write!(self.out, "| Some {some_name} ->")?;
                self.nested(ifsome)?;
            }
            ExpDesc::MatchNat {
                arg,
                plus_name,
                ifplus,
                minus_name,
                ifminus,
            } => {
                self.out.push_str("match%nat ");
                self.exp(arg, false)?;
                self.out.push_str(" with");
                self.newline()?;
                write!(self.out, "| Plus {plus_name} ->")?;
                self.nested(ifplus)?;
                self.newline()?;
                write!(self.out, "| Minus {minus_name} ->")?;
                self.nested(ifminus)?;
            }
            ExpDesc::MatchList {
                arg,
                head_name,
                tail_name,
                ifcons,
                ifnil,
            } => {
                self.out.push_str("match ");
                self.exp(arg, false)?;
                self.out.push_str(" with");
                self.newline()?;
                self.out.push_str("| [] ->");
                self.nested(ifnil)?;
                self.newline()?;
                write!(self.out, "| {head_name} :: {tail_name} ->")?;
                self.nested(ifcons)?;
            }
            ExpDesc::MatchVariant { arg, cases } => {
                self.out.push_str("match ");
                self.exp(arg, false)?;
                self.out.push_str(" with");
                for case in cases {
                    self.newline()?;
                    match &case.pattern {
                        Pattern::Any => self.out.push_str("| _ ->"),
                        Pattern::Constr(k, vars) if vars.is_empty() => {
                            write!(self.out, "| {k} ->")?
                        }
                        Pattern::Constr(k, vars) if vars.len() == 1 => {
                            write!(self.out, "| {k} {} ->", vars[0])?
                        }
                        Pattern::Constr(k, vars) => {
                            write!(self.out, "| {k} ({}) ->", vars.join(", "))?
                        }
                    }
                    self.nested(&case.body)?;
                }
            }
            ExpDesc::Loop {
                arg_name,
                body,
                arg,
            } => {
                write!(self.out, "Loop.loop (fun {arg_name} ->")?;
                self.nested(body)?;
                self.out.push_str(") ");
                self.exp(arg, true)?;
            }
            ExpDesc::LoopLeft {
                arg_name,
                body,
                arg,
                acc,
            } => {
                self.out.push_str("Loop.left (fun ");
                match acc {
                    Some(acc) => write!(self.out, "({arg_name}, {}) ->", acc.name)?,
                    None => write!(self.out, "{arg_name} ->")?,
                }
                self.nested(body)?;
                self.out.push_str(") ");
                self.exp(arg, true)?;
                if let Some(acc) = acc {
                    self.out.push(' ');
                    self.exp(&acc.init, true)?;
                }
            }
            ExpDesc::Fold {
                prim,
                elt_name,
                acc_name,
                body,
                arg,
                acc,
            } => {
                write!(self.out, "{prim} (fun ({elt_name}, {acc_name}) ->")?;
                self.nested(body)?;
                self.out.push_str(") ");
                self.exp(arg, true)?;
                self.out.push(' ');
                self.exp(acc, true)?;
            }
            ExpDesc::MapFold {
                prim,
                elt_name,
                acc_name,
                body,
                arg,
                acc,
            } => {
                write!(self.out, "{prim} (fun ({elt_name}, {acc_name}) ->")?;
                self.nested(body)?;
                self.out.push_str(") ");
                self.exp(arg, true)?;
                self.out.push(' ');
                self.exp(acc, true)?;
            }
            ExpDesc::Map {
                prim,
                elt_name,
                body,
                arg,
            } => {
                write!(self.out, "{prim} (fun {elt_name} ->")?;
                self.nested(body)?;
                self.out.push_str(") ");
                self.exp(arg, true)?;
            }
            ExpDesc::Lambda {
                arg_name,
                arg_ty,
                body,
                ret_ty,
            } => {
                self.out.push_str("fun ");
                self.binder(arg_name, arg_ty)?;
                write!(self.out, " : {ret_ty} ->")?;
                self.nested(body)?;
            }
            ExpDesc::Closure {
                arg_name,
                arg_ty,
                call_env,
                body,
                ret_ty,
            } => {
                self.out.push_str("fun ");
                self.binder(arg_name, arg_ty)?;
                write!(self.out, " : {ret_ty} ->")?;
                self.out.push_str(" [");
                for (k, (name, value)) in call_env.iter().enumerate() {
                    if k > 0 {
                        self.out.push_str("; ");
                    }
                    write!(self.out, "{name} = ")?;
                    self.exp(value, false)?;
                }
                self.out.push(']');
                self.nested(body)?;
            }
            ExpDesc::Record(fields) => {
                self.out.push_str("{ ");
                for (k, (label, value)) in fields.iter().enumerate() {
                    if k > 0 {
                        self.out.push_str("; ");
                    }
                    write!(self.out, "{label} = ")?;
                    self.exp(value, false)?;
                }
                self.out.push_str(" }");
            }
            ExpDesc::Constructor { constr, arg } => {
                match constr {
                    Constructor::Constr(k) => self.out.push_str(k),
                    Constructor::Left(other) => write!(self.out, "(Left : (_, {other}) variant)")?,
                    Constructor::Right(other) => {
                        write!(self.out, "(Right : ({other}, _) variant)")?
                    }
                }
                self.out.push(' ');
                self.exp(arg, true)?;
            }
            ExpDesc::CreateContract { args, contract } => {
                write!(
                    self.out,
                    "Contract.create (contract (parameter : {}) (storage : {}) ->",
                    contract.parameter, contract.storage
                )?;
                self.nested(&contract.code)?;
                self.out.push(')');
                self.args(args)?;
            }
            ExpDesc::ContractAt { arg, c_sig } => {
                write!(self.out, "(Contract.at ")?;
                self.exp(arg, true)?;
                write!(self.out, " : {c_sig} option)")?;
            }
            ExpDesc::Unpack { arg, ty } => {
                write!(self.out, "(Bytes.unpack ")?;
                self.exp(arg, true)?;
                write!(self.out, " : {ty} option)")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SyntaxExp;

    type E = SyntaxExp;

    fn int(n: i64) -> E {
        E::constant(Datatype::Int, Const::int(n), ())
    }

    #[test]
    fn operators_print_infix() {
        let e = E::apply(
            Primitive::Add,
            vec![E::var("x", ()), E::apply(Primitive::Mul, vec![int(2), int(3)], ())],
            (),
        );
        assert_eq!(e.to_string(), "x + (2 * 3)");
    }

    #[test]
    fn named_primitives_print_prefix() {
        let e = E::apply(Primitive::ListRev, vec![E::var("l", ())], ());
        assert_eq!(e.to_string(), "List.rev l");
        assert_eq!(E::apply(Primitive::Now, vec![], ()).to_string(), "Current.time");
    }

    #[test]
    fn tuples_and_projections() {
        let t = E::apply(Primitive::Tuple, vec![int(1), E::var("y", ())], ());
        assert_eq!(t.to_string(), "(1, y)");
        let get = E::apply(
            Primitive::TupleGet,
            vec![E::var("p", ()), E::constant(Datatype::Nat, Const::nat(1), ())],
            (),
        );
        assert_eq!(get.to_string(), "p.(1p)");
    }

    #[test]
    fn let_and_if_are_laid_out_on_lines() {
        let e = E::mk(
            ExpDesc::Let {
                bnd_var: "x".to_string(),
                inline: Inline::Auto,
                bnd_val: Box::new(int(1)),
                body: Box::new(E::mk(
                    ExpDesc::If {
                        cond: Box::new(E::var("b", ())),
                        ifthen: Box::new(E::var("x", ())),
                        ifelse: Box::new(int(2)),
                    },
                    (),
                )),
            },
            (),
        );
        assert_eq!(e.to_string(), "let x =\n  1 in\nif b then\n  x\nelse\n  2");
    }
}
