use std::{
    fmt::{self, Display, Formatter},
    sync::Arc,
};

use ustr::Ustr;

use super::meta::MetaVar;
use crate::syntax::prec;

pub type TermPtr = Arc<Term>;

/// Binder syntax. Destructuring is not supported.
#[derive(Debug, Clone, PartialEq)]
pub enum Pattern {
    Var(Ustr),
    Err,
}

impl Pattern {
    pub fn name(&self) -> Option<Ustr> {
        match self {
            Pattern::Var(name) => Some(*name),
            Pattern::Err => None,
        }
    }
}

impl Display for Pattern {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Var(name) => write!(f, "{name}"),
            Pattern::Err => write!(f, "_"),
        }
    }
}

/// Core syntax, with variables as de Bruijn indices.
#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    Type,
    Bool,
    BoolOf(bool),
    If {
        cond: TermPtr,
        then_branch: TermPtr,
        else_branch: TermPtr,
    },
    Int64,
    Int64Of(i64),
    Float64,
    Float64Of(f64),
    Str,
    StrOf(Arc<str>),
    Let {
        binder: Pattern,
        init: TermPtr,
        body: TermPtr,
    },
    /// Recursive function definition. `body` sees the function at index
    /// `binders.len()` followed by its parameters; `next` sees the function.
    LetFun {
        name: Ustr,
        binders: Arc<[Pattern]>,
        body: TermPtr,
        next: TermPtr,
    },
    /// Function type; `params[i]` sees the first `i` parameters.
    Fun {
        binders: Arc<[Pattern]>,
        params: Arc<[TermPtr]>,
        result: TermPtr,
    },
    FunOf {
        binders: Arc<[Pattern]>,
        body: TermPtr,
    },
    Call {
        func: TermPtr,
        args: Arc<[TermPtr]>,
    },
    Record {
        fields: Arc<[(Ustr, TermPtr)]>,
    },
    RecordOf {
        fields: Arc<[(Ustr, TermPtr)]>,
    },
    Access {
        record: TermPtr,
        field: Ustr,
    },
    Refine {
        binder: Pattern,
        base: TermPtr,
        predicate: TermPtr,
    },
    /// Runtime obligation that `target` inhabits `ty`
    Check {
        target: TermPtr,
        ty: TermPtr,
    },
    Var {
        name: Ustr,
        index: usize,
    },
    Meta(MetaVar),
    Err,
}

impl Term {
    /// Whether `meta` appears anywhere in the term.
    pub fn mentions(&self, meta: MetaVar) -> bool {
        stacker::maybe_grow(32 * 1024, 1024 * 1024, || match self {
            Term::Meta(other) => *other == meta,
            Term::If {
                cond,
                then_branch,
                else_branch,
            } => cond.mentions(meta) || then_branch.mentions(meta) || else_branch.mentions(meta),
            Term::Let { init, body, .. } => init.mentions(meta) || body.mentions(meta),
            Term::LetFun { body, next, .. } => body.mentions(meta) || next.mentions(meta),
            Term::Fun { params, result, .. } => {
                params.iter().any(|param| param.mentions(meta)) || result.mentions(meta)
            }
            Term::FunOf { body, .. } => body.mentions(meta),
            Term::Call { func, args } => {
                func.mentions(meta) || args.iter().any(|arg| arg.mentions(meta))
            }
            Term::Record { fields } | Term::RecordOf { fields } => {
                fields.iter().any(|(_, field)| field.mentions(meta))
            }
            Term::Access { record, .. } => record.mentions(meta),
            Term::Refine {
                base, predicate, ..
            } => base.mentions(meta) || predicate.mentions(meta),
            Term::Check { target, ty } => target.mentions(meta) || ty.mentions(meta),
            _ => false,
        })
    }

    fn prec(&self) -> u16 {
        match self {
            Term::Let { .. } | Term::LetFun { .. } | Term::If { .. } | Term::FunOf { .. } => {
                prec::PREFIX
            }
            Term::Refine { .. } => prec::ANNO,
            Term::Fun { .. } => prec::FUN,
            Term::Access { .. } => prec::ACCESS,
            Term::Call { .. } => prec::CALL,
            Term::Check { target, .. } => target.prec(),
            _ => u16::MAX,
        }
    }

    fn fmt_prec(&self, f: &mut Formatter<'_>, min: u16) -> fmt::Result {
        if self.prec() < min {
            write!(f, "(")?;
            self.fmt_term(f)?;
            write!(f, ")")
        } else {
            self.fmt_term(f)
        }
    }

    fn fmt_term(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Term::Type => write!(f, "type"),
            Term::Bool => write!(f, "bool"),
            Term::BoolOf(value) => write!(f, "{value}"),
            Term::If {
                cond,
                then_branch,
                else_branch,
            } => {
                write!(f, "if ")?;
                cond.fmt_prec(f, prec::PREFIX)?;
                write!(f, " then ")?;
                then_branch.fmt_prec(f, prec::PREFIX)?;
                write!(f, " else ")?;
                else_branch.fmt_prec(f, prec::PREFIX)
            }
            Term::Int64 => write!(f, "int64"),
            Term::Int64Of(value) => write!(f, "{value}"),
            Term::Float64 => write!(f, "float64"),
            Term::Float64Of(value) => write!(f, "{value:?}"),
            Term::Str => write!(f, "str"),
            Term::StrOf(value) => write!(f, "{value:?}"),
            Term::Let { binder, init, body } => {
                write!(f, "let {binder} = ")?;
                init.fmt_prec(f, prec::PREFIX)?;
                write!(f, " ")?;
                body.fmt_prec(f, prec::PREFIX)
            }
            Term::LetFun {
                name,
                binders,
                body,
                next,
            } => {
                write!(f, "fun {name}(")?;
                comma_separated(f, binders.iter(), |f, binder| write!(f, "{binder}"))?;
                write!(f, ") = ")?;
                body.fmt_prec(f, prec::PREFIX)?;
                write!(f, " ")?;
                next.fmt_prec(f, prec::PREFIX)
            }
            Term::Fun {
                binders,
                params,
                result,
            } => {
                write!(f, "fun(")?;
                comma_separated(f, binders.iter().zip(params.iter()), |f, (binder, ty)| {
                    write!(f, "{binder} : ")?;
                    ty.fmt_prec(f, prec::ANNO + 1)
                })?;
                write!(f, ") -> ")?;
                result.fmt_prec(f, prec::FUN)
            }
            Term::FunOf { binders, body } => {
                write!(f, "fun(")?;
                comma_separated(f, binders.iter(), |f, binder| write!(f, "{binder}"))?;
                write!(f, ") = ")?;
                body.fmt_prec(f, prec::FUN)
            }
            Term::Call { func, args } => {
                func.fmt_prec(f, prec::ACCESS)?;
                write!(f, "(")?;
                comma_separated(f, args.iter(), |f, arg| arg.fmt_prec(f, prec::PREFIX))?;
                write!(f, ")")
            }
            Term::Record { fields } => fmt_fields(f, fields, " : ", prec::ANNO + 1),
            Term::RecordOf { fields } => fmt_fields(f, fields, " = ", prec::PREFIX),
            Term::Access { record, field } => {
                record.fmt_prec(f, prec::ACCESS)?;
                write!(f, ".{field}")
            }
            Term::Refine {
                binder,
                base,
                predicate,
            } => {
                write!(f, "{binder} : ")?;
                base.fmt_prec(f, prec::ANNO + 1)?;
                write!(f, " @ ")?;
                predicate.fmt_prec(f, prec::ANNO + 1)
            }
            Term::Check { target, .. } => target.fmt_term(f),
            Term::Var { name, .. } => write!(f, "{name}"),
            Term::Meta(_) => write!(f, "?"),
            Term::Err => write!(f, "error"),
        }
    }
}

fn comma_separated<I, F>(f: &mut Formatter<'_>, items: I, mut each: F) -> fmt::Result
where
    I: Iterator,
    F: FnMut(&mut Formatter<'_>, I::Item) -> fmt::Result,
{
    for (i, item) in items.enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        each(f, item)?;
    }
    Ok(())
}

fn fmt_fields(
    f: &mut Formatter<'_>,
    fields: &[(Ustr, TermPtr)],
    separator: &str,
    min: u16,
) -> fmt::Result {
    if fields.is_empty() {
        return write!(f, "{{}}");
    }
    write!(f, "{{ ")?;
    comma_separated(f, fields.iter(), |f, (name, value)| {
        write!(f, "{name}{separator}")?;
        value.fmt_prec(f, min)
    })?;
    write!(f, " }}")
}

impl Display for Term {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.fmt_prec(f, prec::PREFIX)
    }
}

#[cfg(test)]
mod test {
    use ustr::ustr;

    use super::*;

    fn var(name: &str, index: usize) -> TermPtr {
        Arc::new(Term::Var {
            name: ustr(name),
            index,
        })
    }

    #[test]
    fn it_prints_function_types_and_values() {
        let ty = Term::Fun {
            binders: Arc::from([Pattern::Var(ustr("x"))]),
            params: Arc::from([Arc::new(Term::Int64)]),
            result: Arc::new(Term::Int64),
        };
        assert_eq!(ty.to_string(), "fun(x : int64) -> int64");
        let value = Term::FunOf {
            binders: Arc::from([Pattern::Var(ustr("x"))]),
            body: var("x", 0),
        };
        assert_eq!(value.to_string(), "fun(x) = x");
    }

    #[test]
    fn it_parenthesizes_by_binding_power() {
        let callee = Arc::new(Term::FunOf {
            binders: Arc::from([Pattern::Var(ustr("x"))]),
            body: var("x", 0),
        });
        let call = Term::Call {
            func: callee,
            args: Arc::from([Arc::new(Term::Int64Of(1)), Arc::new(Term::Float64Of(2.0))]),
        };
        assert_eq!(call.to_string(), "(fun(x) = x)(1, 2.0)");
        let refine = Arc::new(Term::Refine {
            binder: Pattern::Var(ustr("b")),
            base: Arc::new(Term::Bool),
            predicate: var("b", 0),
        });
        let record = Term::Record {
            fields: Arc::from([(ustr("a"), refine)]),
        };
        assert_eq!(record.to_string(), "{ a : (b : bool @ b) }");
    }

    #[test]
    fn it_prints_records_and_sentinels() {
        let record = Arc::new(Term::RecordOf {
            fields: Arc::from([(ustr("a"), Arc::new(Term::StrOf("q\"".into())))]),
        });
        assert_eq!(record.to_string(), r#"{ a = "q\"" }"#);
        let access = Term::Access {
            record,
            field: ustr("a"),
        };
        assert_eq!(access.to_string(), r#"{ a = "q\"" }.a"#);
        assert_eq!(Term::RecordOf { fields: Arc::from([]) }.to_string(), "{}");
        assert_eq!(Term::Err.to_string(), "error");
        assert_eq!(Term::Meta(MetaVar::new(0)).to_string(), "?");
    }

    #[test]
    fn it_prints_prefix_forms() {
        let term = Term::Let {
            binder: Pattern::Var(ustr("x")),
            init: Arc::new(Term::BoolOf(true)),
            body: Arc::new(Term::If {
                cond: var("x", 0),
                then_branch: Arc::new(Term::Int64Of(-1)),
                else_branch: Arc::new(Term::Int64Of(2)),
            }),
        };
        assert_eq!(term.to_string(), "let x = true if x then -1 else 2");
    }
}
