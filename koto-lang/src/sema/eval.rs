//! Normalization by evaluation.

use std::sync::Arc;

use ustr::{Ustr, ustr};

use super::{
    meta::Metas,
    term::{Pattern, Term, TermPtr},
    value::{Closure, Env, Telescope, Thunk, Value, ValuePtr},
};

fn grow<R>(f: impl FnOnce() -> R) -> R {
    stacker::maybe_grow(32 * 1024, 1024 * 1024, f)
}

pub fn eval(env: &Env, term: &TermPtr, metas: &Metas) -> ValuePtr {
    grow(|| match &**term {
        Term::Type => Arc::new(Value::Type),
        Term::Bool => Arc::new(Value::Bool),
        Term::BoolOf(value) => Arc::new(Value::BoolOf(*value)),
        Term::If {
            cond,
            then_branch,
            else_branch,
        } => {
            let cond = force(eval(env, cond, metas), metas);
            match &*cond {
                Value::BoolOf(true) => eval(env, then_branch, metas),
                Value::BoolOf(false) => eval(env, else_branch, metas),
                Value::Err => cond,
                _ => Arc::new(Value::If {
                    cond: cond.clone(),
                    then_branch: Closure::new(env.clone(), then_branch.clone()),
                    else_branch: Closure::new(env.clone(), else_branch.clone()),
                }),
            }
        }
        Term::Int64 => Arc::new(Value::Int64),
        Term::Int64Of(value) => Arc::new(Value::Int64Of(*value)),
        Term::Float64 => Arc::new(Value::Float64),
        Term::Float64Of(value) => Arc::new(Value::Float64Of(*value)),
        Term::Str => Arc::new(Value::Str),
        Term::StrOf(value) => Arc::new(Value::StrOf(value.clone())),
        Term::Let { init, body, .. } => {
            let env = env.push_back(Thunk::deferred(env.clone(), init.clone()));
            eval(&env, body, metas)
        }
        Term::LetFun {
            name,
            binders,
            body,
            next,
        } => {
            let func = Arc::new(Value::FunOf {
                binders: binders.clone(),
                closure: Closure::new(env.clone(), body.clone()),
                recursive: Some(*name),
            });
            eval(&env.push_back(Thunk::ready(func)), next, metas)
        }
        Term::Fun {
            binders,
            params,
            result,
        } => Arc::new(Value::Fun {
            binders: binders.clone(),
            telescope: Telescope {
                env: env.clone(),
                params: params.clone(),
                result: result.clone(),
            },
        }),
        Term::FunOf { binders, body } => Arc::new(Value::FunOf {
            binders: binders.clone(),
            closure: Closure::new(env.clone(), body.clone()),
            recursive: None,
        }),
        Term::Call { func, args } => {
            let func = eval(env, func, metas);
            let args = args
                .iter()
                .map(|arg| Thunk::deferred(env.clone(), arg.clone()))
                .collect();
            apply(func, args, metas)
        }
        Term::Record { fields } => Arc::new(Value::Record {
            fields: eval_fields(env, fields, metas),
        }),
        Term::RecordOf { fields } => Arc::new(Value::RecordOf {
            fields: eval_fields(env, fields, metas),
        }),
        Term::Access { record, field } => access(eval(env, record, metas), *field, metas),
        Term::Refine {
            binder,
            base,
            predicate,
        } => Arc::new(Value::Refine {
            binder: binder.clone(),
            base: eval(env, base, metas),
            predicate: Closure::new(env.clone(), predicate.clone()),
        }),
        Term::Check { target, .. } => eval(env, target, metas),
        Term::Var { name, index } => {
            let thunk = env
                .len()
                .checked_sub(index + 1)
                .and_then(|level| env.get(level));
            match thunk {
                Some(thunk) => thunk.force(metas),
                None => {
                    tracing::error!("variable {name} (index {index}) escapes its scope");
                    Arc::new(Value::Err)
                }
            }
        }
        Term::Meta(meta) => force(Arc::new(Value::Meta(*meta)), metas),
        Term::Err => Arc::new(Value::Err),
    })
}

fn eval_fields(env: &Env, fields: &[(Ustr, TermPtr)], metas: &Metas) -> Arc<[(Ustr, ValuePtr)]> {
    fields
        .iter()
        .map(|(name, term)| (*name, eval(env, term, metas)))
        .collect()
}

/// Applies `func` to `args`, staying neutral when `func` is not a function.
pub fn apply(func: ValuePtr, args: Vec<Thunk>, metas: &Metas) -> ValuePtr {
    let func = force(func, metas);
    match &*func {
        Value::FunOf {
            closure, recursive, ..
        } => {
            let this = recursive.map(|_| Thunk::ready(func.clone()));
            closure.apply(this.into_iter().chain(args), metas)
        }
        Value::Err => func,
        _ => Arc::new(Value::Call {
            func: func.clone(),
            args: args.into(),
        }),
    }
}

pub fn access(record: ValuePtr, field: Ustr, metas: &Metas) -> ValuePtr {
    let record = force(record, metas);
    match &*record {
        Value::RecordOf { fields } => fields
            .iter()
            .find(|(name, _)| *name == field)
            .map(|(_, value)| value.clone())
            .unwrap_or_else(|| Arc::new(Value::Err)),
        Value::Err => record,
        _ => Arc::new(Value::Access {
            record: record.clone(),
            field,
        }),
    }
}

/// Follows solved metavariables until reaching something else.
pub fn force(mut value: ValuePtr, metas: &Metas) -> ValuePtr {
    while let Value::Meta(meta) = &*value {
        match metas.solution(*meta) {
            Some(solution) => value = solution,
            None => break,
        }
    }
    value
}

pub(crate) fn binder_name(binder: &Pattern) -> Ustr {
    binder.name().unwrap_or_else(|| ustr("_"))
}

/// Fresh variables for `binders`, starting at `level`.
pub(crate) fn fresh_vars(binders: &[Pattern], level: usize) -> Vec<Thunk> {
    binders
        .iter()
        .enumerate()
        .map(|(i, binder)| Thunk::ready(Value::var(binder_name(binder), level + i)))
        .collect()
}

/// Reads `value` back into a term valid under `level` binders.
pub fn quote(level: usize, value: &ValuePtr, metas: &Metas) -> TermPtr {
    grow(|| {
        let value = force(value.clone(), metas);
        let term = match &*value {
            Value::Type => Term::Type,
            Value::Bool => Term::Bool,
            Value::BoolOf(value) => Term::BoolOf(*value),
            Value::If {
                cond,
                then_branch,
                else_branch,
            } => Term::If {
                cond: quote(level, cond, metas),
                then_branch: quote(level, &then_branch.eval(metas), metas),
                else_branch: quote(level, &else_branch.eval(metas), metas),
            },
            Value::Int64 => Term::Int64,
            Value::Int64Of(value) => Term::Int64Of(*value),
            Value::Float64 => Term::Float64,
            Value::Float64Of(value) => Term::Float64Of(*value),
            Value::Str => Term::Str,
            Value::StrOf(value) => Term::StrOf(value.clone()),
            Value::Fun { binders, telescope } => {
                let args = fresh_vars(binders, level);
                let params = (0..telescope.len())
                    .map(|i| quote(level + i, &telescope.param(i, &args, metas), metas))
                    .collect();
                let result = telescope.result(&args, metas);
                Term::Fun {
                    binders: binders.clone(),
                    params,
                    result: quote(level + args.len(), &result, metas),
                }
            }
            Value::FunOf {
                binders,
                closure,
                recursive: None,
            } => {
                let args = fresh_vars(binders, level);
                let body = closure.apply(args, metas);
                Term::FunOf {
                    binders: binders.clone(),
                    body: quote(level + binders.len(), &body, metas),
                }
            }
            Value::FunOf {
                binders,
                closure,
                recursive: Some(name),
            } => {
                // Self reference stays a variable so quoting terminates.
                let this = Thunk::ready(Value::var(*name, level));
                let args = fresh_vars(binders, level + 1);
                let body = closure.apply(std::iter::once(this).chain(args), metas);
                Term::LetFun {
                    name: *name,
                    binders: binders.clone(),
                    body: quote(level + 1 + binders.len(), &body, metas),
                    next: Arc::new(Term::Var {
                        name: *name,
                        index: 0,
                    }),
                }
            }
            Value::Call { func, args } => Term::Call {
                func: quote(level, func, metas),
                args: args
                    .iter()
                    .map(|arg| quote(level, &arg.force(metas), metas))
                    .collect(),
            },
            Value::Record { fields } => Term::Record {
                fields: quote_fields(level, fields, metas),
            },
            Value::RecordOf { fields } => Term::RecordOf {
                fields: quote_fields(level, fields, metas),
            },
            Value::Access { record, field } => Term::Access {
                record: quote(level, record, metas),
                field: *field,
            },
            Value::Refine {
                binder,
                base,
                predicate,
            } => {
                let var = Thunk::ready(Value::var(binder_name(binder), level));
                Term::Refine {
                    binder: binder.clone(),
                    base: quote(level, base, metas),
                    predicate: quote(level + 1, &predicate.apply([var], metas), metas),
                }
            }
            Value::Var { name, level: var } => match level.checked_sub(var + 1) {
                Some(index) => Term::Var { name: *name, index },
                None => {
                    tracing::error!("variable {name} (level {var}) is quoted at {level}");
                    Term::Err
                }
            },
            Value::Meta(meta) => Term::Meta(*meta),
            Value::Err => Term::Err,
        };
        Arc::new(term)
    })
}

fn quote_fields(
    level: usize,
    fields: &[(Ustr, ValuePtr)],
    metas: &Metas,
) -> Arc<[(Ustr, TermPtr)]> {
    fields
        .iter()
        .map(|(name, value)| (*name, quote(level, value, metas)))
        .collect()
}

/// Replaces solved metavariables in `term` by their solutions.
pub fn zonk(level: usize, term: &TermPtr, metas: &Metas) -> TermPtr {
    grow(|| {
        let zonked = match &**term {
            Term::Meta(meta) => {
                return match metas.solution(*meta) {
                    Some(solution) => quote(level, &solution, metas),
                    None => term.clone(),
                };
            }
            Term::If {
                cond,
                then_branch,
                else_branch,
            } => Term::If {
                cond: zonk(level, cond, metas),
                then_branch: zonk(level, then_branch, metas),
                else_branch: zonk(level, else_branch, metas),
            },
            Term::Let { binder, init, body } => Term::Let {
                binder: binder.clone(),
                init: zonk(level, init, metas),
                body: zonk(level + 1, body, metas),
            },
            Term::LetFun {
                name,
                binders,
                body,
                next,
            } => Term::LetFun {
                name: *name,
                binders: binders.clone(),
                body: zonk(level + 1 + binders.len(), body, metas),
                next: zonk(level + 1, next, metas),
            },
            Term::Fun {
                binders,
                params,
                result,
            } => Term::Fun {
                binders: binders.clone(),
                params: params
                    .iter()
                    .enumerate()
                    .map(|(i, param)| zonk(level + i, param, metas))
                    .collect(),
                result: zonk(level + params.len(), result, metas),
            },
            Term::FunOf { binders, body } => Term::FunOf {
                binders: binders.clone(),
                body: zonk(level + binders.len(), body, metas),
            },
            Term::Call { func, args } => Term::Call {
                func: zonk(level, func, metas),
                args: args.iter().map(|arg| zonk(level, arg, metas)).collect(),
            },
            Term::Record { fields } => Term::Record {
                fields: zonk_fields(level, fields, metas),
            },
            Term::RecordOf { fields } => Term::RecordOf {
                fields: zonk_fields(level, fields, metas),
            },
            Term::Access { record, field } => Term::Access {
                record: zonk(level, record, metas),
                field: *field,
            },
            Term::Refine {
                binder,
                base,
                predicate,
            } => Term::Refine {
                binder: binder.clone(),
                base: zonk(level, base, metas),
                predicate: zonk(level + 1, predicate, metas),
            },
            Term::Check { target, ty } => Term::Check {
                target: zonk(level, target, metas),
                ty: zonk(level, ty, metas),
            },
            _ => return term.clone(),
        };
        Arc::new(zonked)
    })
}

fn zonk_fields(level: usize, fields: &[(Ustr, TermPtr)], metas: &Metas) -> Arc<[(Ustr, TermPtr)]> {
    fields
        .iter()
        .map(|(name, term)| (*name, zonk(level, term, metas)))
        .collect()
}
