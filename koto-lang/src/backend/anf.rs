//! A-normal form: every intermediate result of a compound expression is
//! bound to a name, so that code generation only deals with atoms.

use std::sync::Arc;

use archery::RcK;
use rpds::Vector;
use rustc_hash::{FxHashMapRand, FxHashSetRand};
use ustr::{Ustr, ustr};

use crate::{
    Error, Result,
    sema::{
        eval::binder_name,
        term::{Pattern, Term, TermPtr},
    },
};

#[derive(Debug, Clone, PartialEq)]
pub enum AnfTerm {
    Let {
        binder: Ustr,
        init: AnfAtom,
        next: Box<AnfTerm>,
    },
    /// `body` sees `name` and then `binders`.
    LetFun {
        name: Ustr,
        binders: Vec<Ustr>,
        body: Box<AnfTerm>,
        next: Box<AnfTerm>,
    },
    /// Declares a variable assigned later by [`AnfTerm::Set`].
    Def {
        name: Ustr,
        next: Box<AnfTerm>,
    },
    If {
        cond: AnfAtom,
        then_branch: Box<AnfTerm>,
        else_branch: Box<AnfTerm>,
        next: Box<AnfTerm>,
    },
    Set {
        name: Ustr,
        source: AnfAtom,
    },
    Ret(AnfAtom),
    /// Result of the whole program
    Atom(AnfAtom),
}

#[derive(Debug, Clone, PartialEq)]
pub enum AnfAtom {
    Type,
    Bool,
    BoolOf(bool),
    Int64,
    Int64Of(i64),
    Float64,
    Float64Of(f64),
    Str,
    StrOf(Arc<str>),
    /// Parameter types are erased; the result is kept for refinement checks.
    Fun {
        binders: Vec<Ustr>,
        result: Box<AnfTerm>,
    },
    FunOf {
        binders: Vec<Ustr>,
        body: Box<AnfTerm>,
    },
    Call {
        func: Box<AnfAtom>,
        args: Vec<AnfAtom>,
    },
    Record {
        fields: Vec<(Ustr, AnfAtom)>,
    },
    RecordOf {
        fields: Vec<(Ustr, AnfAtom)>,
    },
    Access {
        record: Box<AnfAtom>,
        field: Ustr,
    },
    Refine {
        binder: Ustr,
        base: Box<AnfAtom>,
        predicate: Box<AnfTerm>,
    },
    Check {
        target: Box<AnfAtom>,
        ty: Box<AnfAtom>,
    },
    Var(Ustr),
}

/// Names taken by JavaScript or by the runtime prelude.
const RESERVED: &[&str] = &[
    "await", "break", "case", "catch", "class", "const", "continue", "debugger", "default",
    "delete", "do", "else", "enum", "export", "extends", "false", "finally", "for", "function",
    "if", "implements", "import", "in", "instanceof", "interface", "let", "new", "null",
    "package", "private", "protected", "public", "return", "static", "super", "switch", "this",
    "throw", "true", "try", "typeof", "var", "void", "while", "with", "yield", "arguments",
    "eval", "undefined", "NaN", "Infinity", "console", "type", "bool", "int64", "float64", "str",
    "fun", "funSymbol", "record", "recordSymbol", "refine", "refineSymbol", "checkType",
];

struct Fresh {
    used: FxHashSetRand<Ustr>,
    next: FxHashMapRand<Ustr, usize>,
}

impl Fresh {
    fn new() -> Self {
        let mut used = FxHashSetRand::default();
        used.extend(RESERVED.iter().map(|name| ustr(name)));
        Self {
            used,
            next: FxHashMapRand::default(),
        }
    }

    /// A name never handed out before, derived from `base`.
    fn name(&mut self, base: &str) -> Ustr {
        let base = sanitize(base);
        let counter = self.next.entry(base).or_insert(0);
        loop {
            let candidate = match *counter {
                0 => base,
                n => ustr(&format!("{base}_{n}")),
            };
            *counter += 1;
            if self.used.insert(candidate) {
                return candidate;
            }
        }
    }
}

fn sanitize(name: &str) -> Ustr {
    let mut out = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '$' {
                c
            } else {
                '_'
            }
        })
        .collect::<String>();
    if out.is_empty() || out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    ustr(&out)
}

type Names = Vector<Ustr, RcK>;
type Cont<'a> = Box<dyn FnOnce(&mut Fresh, AnfAtom) -> Result<AnfTerm> + 'a>;
type ListCont<'a> = Box<dyn FnOnce(&mut Fresh, Vec<AnfAtom>) -> Result<AnfTerm> + 'a>;

fn cont<'a>(f: impl FnOnce(&mut Fresh, AnfAtom) -> Result<AnfTerm> + 'a) -> Cont<'a> {
    Box::new(f)
}

fn list_cont<'a>(f: impl FnOnce(&mut Fresh, Vec<AnfAtom>) -> Result<AnfTerm> + 'a) -> ListCont<'a> {
    Box::new(f)
}

fn ret<'a>() -> Cont<'a> {
    cont(|_, atom| Ok(AnfTerm::Ret(atom)))
}

fn lookup(names: &Names, name: Ustr, index: usize) -> Result<Ustr> {
    names
        .len()
        .checked_sub(index + 1)
        .and_then(|level| names.get(level))
        .copied()
        .ok_or_else(|| Error::internal(format!("variable {name} (index {index}) escapes its scope")))
}

fn bind(names: &Names, fresh: &mut Fresh, binders: &[Pattern]) -> (Vec<Ustr>, Names) {
    let mut names = names.clone();
    let binders: Vec<Ustr> = binders
        .iter()
        .map(|binder| {
            let name = fresh.name(&binder_name(binder));
            names.push_back_mut(name);
            name
        })
        .collect();
    (binders, names)
}

fn convert<'a>(names: &Names, fresh: &mut Fresh, term: &'a Term, k: Cont<'a>) -> Result<AnfTerm> {
    stacker::maybe_grow(32 * 1024, 1024 * 1024, || match term {
        Term::Type => k(fresh, AnfAtom::Type),
        Term::Bool => k(fresh, AnfAtom::Bool),
        Term::BoolOf(value) => k(fresh, AnfAtom::BoolOf(*value)),
        Term::Int64 => k(fresh, AnfAtom::Int64),
        Term::Int64Of(value) => k(fresh, AnfAtom::Int64Of(*value)),
        Term::Float64 => k(fresh, AnfAtom::Float64),
        Term::Float64Of(value) => k(fresh, AnfAtom::Float64Of(*value)),
        Term::Str => k(fresh, AnfAtom::Str),
        Term::StrOf(value) => k(fresh, AnfAtom::StrOf(value.clone())),
        Term::If {
            cond,
            then_branch,
            else_branch,
        } => {
            let scope = names.clone();
            convert(
                names,
                fresh,
                cond,
                cont(move |fresh, cond| {
                    let result = fresh.name("result");
                    let assign = move || cont(move |_, source| Ok(AnfTerm::Set { name: result, source }));
                    let then_branch = convert(&scope, fresh, then_branch, assign())?;
                    let else_branch = convert(&scope, fresh, else_branch, assign())?;
                    let next = k(fresh, AnfAtom::Var(result))?;
                    Ok(AnfTerm::Def {
                        name: result,
                        next: Box::new(AnfTerm::If {
                            cond,
                            then_branch: Box::new(then_branch),
                            else_branch: Box::new(else_branch),
                            next: Box::new(next),
                        }),
                    })
                }),
            )
        }
        Term::Let { binder, init, body } => {
            let scope = names.clone();
            convert(
                names,
                fresh,
                init,
                cont(move |fresh, init| {
                    let binder = fresh.name(&binder_name(binder));
                    let next = convert(&scope.push_back(binder), fresh, body, k)?;
                    Ok(AnfTerm::Let {
                        binder,
                        init,
                        next: Box::new(next),
                    })
                }),
            )
        }
        Term::LetFun {
            name,
            binders,
            body,
            next,
        } => {
            let name = fresh.name(name);
            let names = names.push_back(name);
            let (binders, inner) = bind(&names, fresh, binders);
            let body = convert(&inner, fresh, body, ret())?;
            let next = convert(&names, fresh, next, k)?;
            Ok(AnfTerm::LetFun {
                name,
                binders,
                body: Box::new(body),
                next: Box::new(next),
            })
        }
        Term::Fun {
            binders, result, ..
        } => {
            let (binders, inner) = bind(names, fresh, binders);
            let result = convert(&inner, fresh, result, ret())?;
            k(
                fresh,
                AnfAtom::Fun {
                    binders,
                    result: Box::new(result),
                },
            )
        }
        Term::FunOf { binders, body } => {
            let (binders, inner) = bind(names, fresh, binders);
            let body = convert(&inner, fresh, body, ret())?;
            k(
                fresh,
                AnfAtom::FunOf {
                    binders,
                    body: Box::new(body),
                },
            )
        }
        Term::Call { func, args } => {
            let scope = names.clone();
            convert(
                names,
                fresh,
                func,
                cont(move |fresh, func| {
                    let rest = list_cont(move |fresh, args| {
                        let func = Box::new(func);
                        k(fresh, AnfAtom::Call { func, args })
                    });
                    convert_all(&scope, fresh, args.iter(), Vec::new(), rest)
                }),
            )
        }
        Term::Record { fields } => convert_fields(names, fresh, fields, move |fresh, fields| {
            k(fresh, AnfAtom::Record { fields })
        }),
        Term::RecordOf { fields } => convert_fields(names, fresh, fields, move |fresh, fields| {
            k(fresh, AnfAtom::RecordOf { fields })
        }),
        Term::Access { record, field } => convert(
            names,
            fresh,
            record,
            cont(move |fresh, record| {
                let record = Box::new(record);
                k(fresh, AnfAtom::Access { record, field: *field })
            }),
        ),
        Term::Refine {
            binder,
            base,
            predicate,
        } => {
            let scope = names.clone();
            convert(
                names,
                fresh,
                base,
                cont(move |fresh, base| {
                    let binder = fresh.name(&binder_name(binder));
                    let predicate = convert(&scope.push_back(binder), fresh, predicate, ret())?;
                    let refine = AnfAtom::Refine {
                        binder,
                        base: Box::new(base),
                        predicate: Box::new(predicate),
                    };
                    k(fresh, refine)
                }),
            )
        }
        Term::Check { target, ty } => {
            let scope = names.clone();
            convert(
                names,
                fresh,
                target,
                cont(move |fresh, target| {
                    convert(
                        &scope,
                        fresh,
                        ty,
                        cont(move |fresh, ty| {
                            let check = AnfAtom::Check {
                                target: Box::new(target),
                                ty: Box::new(ty),
                            };
                            k(fresh, check)
                        }),
                    )
                }),
            )
        }
        Term::Var { name, index } => {
            let name = lookup(names, *name, *index)?;
            k(fresh, AnfAtom::Var(name))
        }
        Term::Meta(_) | Term::Err => Err(Error::internal(format!("unexpected term: {term}"))),
    })
}

/// Converts `terms` left to right and hands all atoms to `k`.
fn convert_all<'a, I>(
    names: &Names,
    fresh: &mut Fresh,
    mut terms: I,
    mut atoms: Vec<AnfAtom>,
    k: ListCont<'a>,
) -> Result<AnfTerm>
where
    I: Iterator<Item = &'a TermPtr> + 'a,
{
    let Some(term) = terms.next() else {
        return k(fresh, atoms);
    };
    let scope = names.clone();
    convert(
        names,
        fresh,
        term,
        cont(move |fresh, atom| {
            atoms.push(atom);
            convert_all(&scope, fresh, terms, atoms, k)
        }),
    )
}

fn convert_fields<'a>(
    names: &Names,
    fresh: &mut Fresh,
    fields: &'a [(Ustr, TermPtr)],
    k: impl FnOnce(&mut Fresh, Vec<(Ustr, AnfAtom)>) -> Result<AnfTerm> + 'a,
) -> Result<AnfTerm> {
    let values = fields.iter().map(|(_, term)| term);
    let rest = list_cont(move |fresh, atoms| {
        let fields = fields.iter().map(|(name, _)| *name).zip(atoms).collect();
        k(fresh, fields)
    });
    convert_all(names, fresh, values, Vec::new(), rest)
}

/// Converts a closed, error-free term.
pub fn anf(term: &Term) -> Result<AnfTerm> {
    let mut fresh = Fresh::new();
    let names = Names::new_with_ptr_kind();
    convert(&names, &mut fresh, term, cont(|_, atom| Ok(AnfTerm::Atom(atom))))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{elaborate, parse};

    fn lower(src: &str) -> AnfTerm {
        _ = tracing_subscriber::fmt::try_init();
        let result = elaborate(&parse(src)).unwrap();
        assert!(
            result.diagnostics.iter().all(|d| !d.is_error()),
            "{:?}",
            result.diagnostics
        );
        anf(&result.term).unwrap()
    }

    #[test]
    fn if_assigns_a_fresh_result() {
        let AnfTerm::Let { binder, next, .. } = lower("let b = true if b then 1 else 2") else {
            panic!("expected let");
        };
        assert_eq!(binder, ustr("b"));
        let AnfTerm::Def { name, next } = *next else {
            panic!("expected def");
        };
        let AnfTerm::If {
            cond,
            then_branch,
            else_branch,
            next,
        } = *next
        else {
            panic!("expected if");
        };
        assert_eq!(cond, AnfAtom::Var(binder));
        assert_eq!(
            *then_branch,
            AnfTerm::Set {
                name,
                source: AnfAtom::Int64Of(1)
            }
        );
        assert_eq!(
            *else_branch,
            AnfTerm::Set {
                name,
                source: AnfAtom::Int64Of(2)
            }
        );
        assert_eq!(*next, AnfTerm::Atom(AnfAtom::Var(name)));
    }

    #[test]
    fn shadowed_and_reserved_names_are_renamed() {
        let AnfTerm::Let { binder, next, .. } = lower("let x = 1 let x = 2 x") else {
            panic!("expected let");
        };
        assert_eq!(binder, ustr("x"));
        assert_eq!(
            *next,
            AnfTerm::Let {
                binder: ustr("x_1"),
                init: AnfAtom::Int64Of(2),
                next: Box::new(AnfTerm::Atom(AnfAtom::Var(ustr("x_1")))),
            }
        );
        let AnfTerm::Let { binder, .. } = lower("let class = 1 class") else {
            panic!("expected let");
        };
        assert_eq!(binder, ustr("class_1"));
    }

    #[test]
    fn nested_calls_are_flattened_into_atoms() {
        let term = lower("let f = fun(x : int64) -> int64 = x f(f(1))");
        let AnfTerm::Let { init, next, .. } = term else {
            panic!("expected let");
        };
        assert!(matches!(init, AnfAtom::FunOf { .. }));
        let f = AnfAtom::Var(ustr("f"));
        assert_eq!(
            *next,
            AnfTerm::Atom(AnfAtom::Call {
                func: Box::new(f.clone()),
                args: vec![AnfAtom::Call {
                    func: Box::new(f),
                    args: vec![AnfAtom::Int64Of(1)],
                }],
            })
        );
    }

    #[test]
    fn errors_do_not_reach_the_backend() {
        assert!(anf(&Term::Err).is_err());
    }
}
