//! JavaScript emission from A-normal form.

use std::fmt::{self, Write};

use tracing::debug;
use ustr::Ustr;

use super::anf::{AnfAtom, AnfTerm};
use crate::{Error, Result};

const RUNTIME: &str = include_str!("runtime.js");

#[derive(Debug, Clone)]
pub struct GenerateResult {
    pub code: String,
}

struct Generator {
    out: String,
    indent: usize,
}

impl Generator {
    fn pad(&mut self) {
        for _ in 0..self.indent {
            self.out.push('\t');
        }
    }

    fn block(&mut self, term: &AnfTerm) -> fmt::Result {
        self.indent += 1;
        let result = self.term(term);
        self.indent -= 1;
        result
    }

    fn term(&mut self, mut term: &AnfTerm) -> fmt::Result {
        loop {
            self.pad();
            match term {
                AnfTerm::Let { binder, init, next } => {
                    write!(self.out, "const {binder} = ")?;
                    self.atom(init)?;
                    self.out.push_str(";\n");
                    term = &**next;
                }
                AnfTerm::LetFun {
                    name,
                    binders,
                    body,
                    next,
                } => {
                    write!(self.out, "const {name} = ")?;
                    self.lambda(binders, body)?;
                    self.out.push_str(";\n");
                    term = &**next;
                }
                AnfTerm::Def { name, next } => {
                    writeln!(self.out, "let {name};")?;
                    term = &**next;
                }
                AnfTerm::If {
                    cond,
                    then_branch,
                    else_branch,
                    next,
                } => {
                    self.out.push_str("if (");
                    self.atom(cond)?;
                    self.out.push_str(") {\n");
                    self.block(then_branch)?;
                    self.pad();
                    self.out.push_str("} else {\n");
                    self.block(else_branch)?;
                    self.pad();
                    self.out.push_str("}\n");
                    term = &**next;
                }
                AnfTerm::Set { name, source } => {
                    write!(self.out, "{name} = ")?;
                    self.atom(source)?;
                    self.out.push_str(";\n");
                    return Ok(());
                }
                AnfTerm::Ret(atom) => {
                    self.out.push_str("return ");
                    self.atom(atom)?;
                    self.out.push_str(";\n");
                    return Ok(());
                }
                AnfTerm::Atom(atom) => {
                    self.out.push_str("console.log(");
                    self.atom(atom)?;
                    self.out.push_str(");\n");
                    return Ok(());
                }
            }
        }
    }

    fn lambda(&mut self, binders: &[Ustr], body: &AnfTerm) -> fmt::Result {
        self.out.push('(');
        for (i, binder) in binders.iter().enumerate() {
            if i > 0 {
                self.out.push_str(", ");
            }
            self.out.push_str(binder);
        }
        self.out.push_str(") => {\n");
        self.block(body)?;
        self.pad();
        self.out.push('}');
        Ok(())
    }

    fn atoms<'a>(&mut self, atoms: impl IntoIterator<Item = &'a AnfAtom>) -> fmt::Result {
        for (i, atom) in atoms.into_iter().enumerate() {
            if i > 0 {
                self.out.push_str(", ");
            }
            self.atom(atom)?;
        }
        Ok(())
    }

    fn fields(&mut self, fields: &[(Ustr, AnfAtom)]) -> fmt::Result {
        if fields.is_empty() {
            self.out.push_str("{}");
            return Ok(());
        }
        self.out.push_str("{ ");
        for (i, (name, value)) in fields.iter().enumerate() {
            if i > 0 {
                self.out.push_str(", ");
            }
            string(&mut self.out, name)?;
            self.out.push_str(": ");
            self.atom(value)?;
        }
        self.out.push_str(" }");
        Ok(())
    }

    fn atom(&mut self, atom: &AnfAtom) -> fmt::Result {
        stacker::maybe_grow(32 * 1024, 1024 * 1024, || match atom {
            AnfAtom::Type => self.out.write_str("type"),
            AnfAtom::Bool => self.out.write_str("bool"),
            AnfAtom::BoolOf(value) => write!(self.out, "{value}"),
            AnfAtom::Int64 => self.out.write_str("int64"),
            AnfAtom::Int64Of(value) => write!(self.out, "{value}n"),
            AnfAtom::Float64 => self.out.write_str("float64"),
            AnfAtom::Float64Of(value) => number(&mut self.out, *value),
            AnfAtom::Str => self.out.write_str("str"),
            AnfAtom::StrOf(value) => string(&mut self.out, value),
            AnfAtom::Fun { binders, result } => {
                self.out.push_str("fun([");
                for (i, binder) in binders.iter().enumerate() {
                    if i > 0 {
                        self.out.push_str(", ");
                    }
                    string(&mut self.out, binder)?;
                }
                self.out.push_str("], ");
                self.lambda(binders, result)?;
                self.out.push(')');
                Ok(())
            }
            AnfAtom::FunOf { binders, body } => self.lambda(binders, body),
            AnfAtom::Call { func, args } => {
                let wrap = matches!(**func, AnfAtom::FunOf { .. });
                if wrap {
                    self.out.push('(');
                }
                self.atom(func)?;
                if wrap {
                    self.out.push(')');
                }
                self.out.push('(');
                self.atoms(args)?;
                self.out.push(')');
                Ok(())
            }
            AnfAtom::Record { fields } => {
                self.out.push_str("record(");
                self.fields(fields)?;
                self.out.push(')');
                Ok(())
            }
            AnfAtom::RecordOf { fields } => self.fields(fields),
            AnfAtom::Access { record, field } => {
                self.atom(record)?;
                self.out.push('[');
                string(&mut self.out, field)?;
                self.out.push(']');
                Ok(())
            }
            AnfAtom::Refine {
                binder,
                base,
                predicate,
            } => {
                self.out.push_str("refine(");
                self.atom(base)?;
                self.out.push_str(", ");
                self.lambda(std::slice::from_ref(binder), predicate)?;
                self.out.push(')');
                Ok(())
            }
            AnfAtom::Check { target, ty } => {
                self.out.push_str("checkType(");
                self.atoms([&**target, &**ty])?;
                self.out.push(')');
                Ok(())
            }
            AnfAtom::Var(name) => self.out.write_str(name),
        })
    }
}

fn number(out: &mut String, value: f64) -> fmt::Result {
    if value.is_nan() {
        out.push_str("NaN");
        Ok(())
    } else if value.is_infinite() {
        out.push_str(if value > 0.0 { "Infinity" } else { "-Infinity" });
        Ok(())
    } else {
        write!(out, "{value:?}")
    }
}

/// Double-quoted JavaScript string literal.
fn string(out: &mut String, value: &str) -> fmt::Result {
    out.push('"');
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{2028}' | '\u{2029}' => write!(out, "\\u{:04x}", c as u32)?,
            c if c.is_control() => write!(out, "\\u{:04x}", c as u32)?,
            c => out.push(c),
        }
    }
    out.push('"');
    Ok(())
}

/// Emits an ES module that prints the value of the program.
pub fn generate(input: &AnfTerm) -> Result<GenerateResult> {
    let mut generator = Generator {
        out: String::from(RUNTIME),
        indent: 0,
    };
    generator.out.push('\n');
    generator
        .term(input)
        .map_err(|_| Error::internal("failed to format generated code"))?;
    debug!(bytes = generator.out.len(), "generated module");
    Ok(GenerateResult {
        code: generator.out,
    })
}
