//! Three-valued definitional equality.
//!
//! Comparing may solve metavariables as a side effect, so asking the same
//! question twice can be answered differently once the table has changed.

use tracing::debug;

use super::{
    eval::{apply, force, fresh_vars, quote},
    meta::{MetaVar, Metas},
    value::{Thunk, Value, ValuePtr},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvResult {
    Yes,
    No,
    /// Not decidable without further reduction
    Unknown,
}

impl ConvResult {
    /// Sequences two answers: `No` dominates, then `Unknown`.
    pub fn then(self, next: impl FnOnce() -> ConvResult) -> ConvResult {
        match self {
            ConvResult::No => ConvResult::No,
            ConvResult::Yes => next(),
            ConvResult::Unknown => match next() {
                ConvResult::No => ConvResult::No,
                _ => ConvResult::Unknown,
            },
        }
    }
}

impl From<bool> for ConvResult {
    fn from(value: bool) -> Self {
        if value {
            ConvResult::Yes
        } else {
            ConvResult::No
        }
    }
}

fn all<I>(pairs: I, mut each: impl FnMut(ValuePtr, ValuePtr) -> ConvResult) -> ConvResult
where
    I: IntoIterator<Item = (ValuePtr, ValuePtr)>,
{
    pairs
        .into_iter()
        .fold(ConvResult::Yes, |acc, (lhs, rhs)| acc.then(|| each(lhs, rhs)))
}

pub fn conv(level: usize, lhs: &ValuePtr, rhs: &ValuePtr, metas: &Metas) -> ConvResult {
    stacker::maybe_grow(32 * 1024, 1024 * 1024, || conv_forced(level, lhs, rhs, metas))
}

fn conv_forced(level: usize, lhs: &ValuePtr, rhs: &ValuePtr, metas: &Metas) -> ConvResult {
    let lhs = force(lhs.clone(), metas);
    let rhs = force(rhs.clone(), metas);
    match (&*lhs, &*rhs) {
        (Value::Meta(a), Value::Meta(b)) if a == b => ConvResult::Yes,
        (Value::Meta(meta), _) => solve(level, *meta, &rhs, metas),
        (_, Value::Meta(meta)) => solve(level, *meta, &lhs, metas),

        (Value::Err, _) | (_, Value::Err) => ConvResult::Yes,

        (
            Value::Refine {
                binder,
                base: lhs_base,
                predicate: lhs_predicate,
            },
            Value::Refine {
                base: rhs_base,
                predicate: rhs_predicate,
                ..
            },
        ) => conv(level, lhs_base, rhs_base, metas).then(|| {
            let var = fresh_vars(std::slice::from_ref(binder), level);
            let lhs = lhs_predicate.apply(var.clone(), metas);
            let rhs = rhs_predicate.apply(var, metas);
            match conv(level + 1, &lhs, &rhs, metas) {
                ConvResult::Yes => ConvResult::Yes,
                _ => ConvResult::Unknown,
            }
        }),
        (_, Value::Refine {
            base, predicate, ..
        }) => conv(level, &lhs, base, metas).then(|| {
            let holds = force(predicate.apply([Thunk::ready(lhs.clone())], metas), metas);
            match &*holds {
                Value::BoolOf(true) | Value::Err => ConvResult::Yes,
                Value::BoolOf(false) => ConvResult::No,
                _ => ConvResult::Unknown,
            }
        }),
        (Value::Refine { base, .. }, _) => conv(level, base, &rhs, metas),

        (Value::Type, Value::Type)
        | (Value::Bool, Value::Bool)
        | (Value::Int64, Value::Int64)
        | (Value::Float64, Value::Float64)
        | (Value::Str, Value::Str) => ConvResult::Yes,
        (Value::BoolOf(a), Value::BoolOf(b)) => (a == b).into(),
        (Value::Int64Of(a), Value::Int64Of(b)) => (a == b).into(),
        (Value::Float64Of(a), Value::Float64Of(b)) => (a.to_bits() == b.to_bits()).into(),
        (Value::StrOf(a), Value::StrOf(b)) => (a == b).into(),

        (
            Value::Fun {
                binders,
                telescope: lhs,
            },
            Value::Fun { telescope: rhs, .. },
        ) => {
            if lhs.len() != rhs.len() {
                return ConvResult::No;
            }
            let args = fresh_vars(binders, level);
            (0..lhs.len())
                .fold(ConvResult::Yes, |acc, i| {
                    acc.then(|| {
                        conv(
                            level + i,
                            &lhs.param(i, &args, metas),
                            &rhs.param(i, &args, metas),
                            metas,
                        )
                    })
                })
                .then(|| {
                    conv(
                        level + args.len(),
                        &lhs.result(&args, metas),
                        &rhs.result(&args, metas),
                        metas,
                    )
                })
        }
        (
            Value::FunOf {
                binders: lhs_binders,
                closure: lhs_closure,
                recursive: Some(_),
            },
            Value::FunOf {
                binders: rhs_binders,
                closure: rhs_closure,
                recursive: Some(name),
            },
        ) => {
            if lhs_binders.len() != rhs_binders.len() {
                return ConvResult::No;
            }
            // Both sides refer to themselves through one shared variable.
            let this = Thunk::ready(Value::var(*name, level));
            let args = fresh_vars(lhs_binders, level + 1);
            let lhs = lhs_closure.apply(std::iter::once(this.clone()).chain(args.clone()), metas);
            let rhs = rhs_closure.apply(std::iter::once(this).chain(args), metas);
            conv(level + 1 + lhs_binders.len(), &lhs, &rhs, metas)
        }
        (Value::FunOf { binders, .. }, Value::FunOf { binders: other, .. }) => {
            if binders.len() != other.len() {
                return ConvResult::No;
            }
            eta(level, binders.len(), &lhs, &rhs, metas)
        }
        (Value::FunOf { binders, .. }, other) | (other, Value::FunOf { binders, .. })
            if other.is_neutral() =>
        {
            eta(level, binders.len(), &lhs, &rhs, metas)
        }

        (Value::Record { fields: lhs }, Value::Record { fields: rhs })
        | (Value::RecordOf { fields: lhs }, Value::RecordOf { fields: rhs }) => {
            if lhs.len() != rhs.len() {
                return ConvResult::No;
            }
            let mut pairs = Vec::with_capacity(lhs.len());
            for (name, value) in lhs.iter() {
                let Some((_, other)) = rhs.iter().find(|(other, _)| other == name) else {
                    return ConvResult::No;
                };
                pairs.push((value.clone(), other.clone()));
            }
            all(pairs, |lhs, rhs| conv(level, &lhs, &rhs, metas))
        }

        (Value::Var { level: a, .. }, Value::Var { level: b, .. }) => (a == b).into(),
        (
            Value::Call {
                func: lhs_func,
                args: lhs_args,
            },
            Value::Call {
                func: rhs_func,
                args: rhs_args,
            },
        ) => {
            if lhs_args.len() != rhs_args.len() {
                return ConvResult::No;
            }
            conv(level, lhs_func, rhs_func, metas).then(|| {
                all(
                    lhs_args
                        .iter()
                        .zip(rhs_args.iter())
                        .map(|(lhs, rhs)| (lhs.force(metas), rhs.force(metas))),
                    |lhs, rhs| conv(level, &lhs, &rhs, metas),
                )
            })
        }
        (
            Value::If {
                cond: lhs_cond,
                then_branch: lhs_then,
                else_branch: lhs_else,
            },
            Value::If {
                cond: rhs_cond,
                then_branch: rhs_then,
                else_branch: rhs_else,
            },
        ) => conv(level, lhs_cond, rhs_cond, metas)
            .then(|| conv(level, &lhs_then.eval(metas), &rhs_then.eval(metas), metas))
            .then(|| conv(level, &lhs_else.eval(metas), &rhs_else.eval(metas), metas)),
        (
            Value::Access {
                record: lhs_record,
                field: lhs_field,
            },
            Value::Access {
                record: rhs_record,
                field: rhs_field,
            },
        ) => ConvResult::from(lhs_field == rhs_field)
            .then(|| conv(level, lhs_record, rhs_record, metas)),

        (lhs, rhs) if lhs.is_neutral() || rhs.is_neutral() => ConvResult::Unknown,
        _ => ConvResult::No,
    }
}

/// Solves `meta` unless the solution would refer back to it.
fn solve(level: usize, meta: MetaVar, value: &ValuePtr, metas: &Metas) -> ConvResult {
    if quote(level, value, metas).mentions(meta) {
        debug!("{meta} occurs in its own solution");
        return ConvResult::No;
    }
    metas.solve(meta, value.clone());
    ConvResult::Yes
}

/// Compares two functions by applying both to the same fresh variables.
fn eta(level: usize, arity: usize, lhs: &ValuePtr, rhs: &ValuePtr, metas: &Metas) -> ConvResult {
    let binders = match (&**lhs, &**rhs) {
        (Value::FunOf { binders, .. }, _) | (_, Value::FunOf { binders, .. }) => binders.clone(),
        _ => return ConvResult::Unknown,
    };
    let args = fresh_vars(&binders, level);
    let lhs = apply(lhs.clone(), args.clone(), metas);
    let rhs = apply(rhs.clone(), args, metas);
    conv(level + arity, &lhs, &rhs, metas)
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use ustr::ustr;

    use super::*;
    use crate::{
        sema::{
            eval::{eval, quote, test::*},
            term::{Pattern, Term, TermPtr},
            value::{Closure, Telescope, empty_env},
        },
        util::Span,
    };

    fn refine(base: ValuePtr, predicate: TermPtr) -> ValuePtr {
        Arc::new(Value::Refine {
            binder: Pattern::Var(ustr("x")),
            base,
            predicate: Closure::new(empty_env(), predicate),
        })
    }

    #[test]
    fn it_is_reflexive_on_ground_values() {
        let metas = Metas::new();
        let terms: Vec<TermPtr> = vec![
            Arc::new(Term::Int64Of(3)),
            Arc::new(Term::StrOf("s".into())),
            Arc::new(Term::Fun {
                binders: Arc::from([Pattern::Var(ustr("t")), Pattern::Var(ustr("x"))]),
                params: Arc::from([Arc::new(Term::Type), var("t", 0)]),
                result: var("t", 1),
            }),
            fun_of(["x"], var("x", 0)),
            Arc::new(Term::RecordOf {
                fields: Arc::from([(ustr("a"), Arc::new(Term::BoolOf(true)))]),
            }),
        ];
        for term in terms {
            let value = eval(&empty_env(), &term, &metas);
            assert_eq!(conv(0, &value, &value, &metas), ConvResult::Yes, "{term}");
        }
    }

    #[test]
    fn it_distinguishes_ground_constructors() {
        let metas = Metas::new();
        let lhs = Arc::new(Value::Int64Of(1));
        let rhs = Arc::new(Value::Int64Of(2));
        assert_eq!(conv(0, &lhs, &rhs, &metas), ConvResult::No);
        let ty = Arc::new(Value::Int64);
        assert_eq!(conv(0, &lhs, &ty, &metas), ConvResult::No);
    }

    #[test]
    fn it_compares_functions_up_to_eta() {
        let metas = Metas::new();
        let env = empty_env().push_back(Thunk::ready(Value::var(ustr("f"), 0)));
        let eta_expanded = eval(&env, &fun_of(["x"], call(var("f", 1), [var("x", 0)])), &metas);
        let f = Value::var(ustr("f"), 0);
        assert_eq!(conv(1, &eta_expanded, &f, &metas), ConvResult::Yes);
        assert_eq!(conv(1, &f, &eta_expanded, &metas), ConvResult::Yes);
    }

    #[test]
    fn it_solves_metas_on_either_side() {
        let metas = Metas::new();
        let meta = metas.fresh(Span::ZERO);
        let hole = Arc::new(Value::Meta(meta));
        assert_eq!(conv(0, &hole, &hole, &metas), ConvResult::Yes);
        assert!(metas.solution(meta).is_none());
        assert_eq!(conv(0, &Arc::new(Value::Bool), &hole, &metas), ConvResult::Yes);
        assert!(matches!(metas.solution(meta).as_deref(), Some(Value::Bool)));
        assert_eq!(conv(0, &hole, &Arc::new(Value::Int64), &metas), ConvResult::No);
    }

    #[test]
    fn it_refuses_cyclic_solutions() {
        let metas = Metas::new();
        let meta = metas.fresh(Span::ZERO);
        let hole = Arc::new(Value::Meta(meta));
        let cyclic = Arc::new(Value::Fun {
            binders: Arc::from([Pattern::Var(ustr("x"))]),
            telescope: Telescope {
                env: empty_env(),
                params: Arc::from([Arc::new(Term::Meta(meta))]),
                result: Arc::new(Term::Int64),
            },
        });
        assert_eq!(conv(0, &hole, &cyclic, &metas), ConvResult::No);
        assert_eq!(conv(0, &cyclic, &hole, &metas), ConvResult::No);
        assert!(metas.solution(meta).is_none());
    }

    #[test]
    fn it_absorbs_errors() {
        let metas = Metas::new();
        let err = Arc::new(Value::Err);
        assert_eq!(conv(0, &err, &Arc::new(Value::Str), &metas), ConvResult::Yes);
        assert_eq!(conv(0, &Arc::new(Value::Type), &err, &metas), ConvResult::Yes);
    }

    #[test]
    fn it_reports_unknown_for_stuck_values() {
        let metas = Metas::new();
        let var = Value::var(ustr("x"), 0);
        assert_eq!(conv(1, &var, &Arc::new(Value::Int64Of(1)), &metas), ConvResult::Unknown);
        assert_eq!(
            conv(1, &var, &Value::var(ustr("y"), 0), &metas),
            ConvResult::Yes
        );
    }

    #[test]
    fn it_evaluates_refinement_predicates() {
        let metas = Metas::new();
        let always = refine(Arc::new(Value::Bool), Arc::new(Term::BoolOf(true)));
        let never = refine(Arc::new(Value::Bool), Arc::new(Term::BoolOf(false)));
        let itself = refine(Arc::new(Value::Bool), var("x", 0));
        assert_eq!(conv(0, &Arc::new(Value::Bool), &always, &metas), ConvResult::Yes);
        assert_eq!(conv(0, &Arc::new(Value::Bool), &never, &metas), ConvResult::No);
        // The predicate sees the left-hand side, here a type.
        assert_eq!(conv(0, &Arc::new(Value::Bool), &itself, &metas), ConvResult::Unknown);
        let stuck = Value::var(ustr("b"), 0);
        assert_eq!(conv(1, &stuck, &itself, &metas), ConvResult::Unknown);
    }

    #[test]
    fn refinement_subsumption_is_asymmetric() {
        let metas = Metas::new();
        let base = Arc::new(Value::Int64);
        let never = refine(base.clone(), Arc::new(Term::BoolOf(false)));
        assert_eq!(conv(0, &never, &base, &metas), ConvResult::Yes);
        assert_eq!(conv(0, &base, &never, &metas), ConvResult::No);
    }

    #[test]
    fn it_compares_refinements_by_predicate() {
        let metas = Metas::new();
        let lhs = refine(Arc::new(Value::Bool), var("x", 0));
        let rhs = refine(Arc::new(Value::Bool), var("x", 0));
        assert_eq!(conv(0, &lhs, &rhs, &metas), ConvResult::Yes);
        let other = refine(Arc::new(Value::Bool), Arc::new(Term::BoolOf(true)));
        assert_eq!(conv(0, &lhs, &other, &metas), ConvResult::Unknown);
        let wider = refine(Arc::new(Value::Int64), var("x", 0));
        assert_eq!(conv(0, &lhs, &wider, &metas), ConvResult::No);
    }

    #[test]
    fn eval_quote_round_trips_up_to_conversion() {
        let metas = Metas::new();
        let terms = [
            call(fun_of(["x"], var("x", 0)), [Arc::new(Term::Int64Of(1))]),
            fun_of(["x", "y"], call(var("x", 1), [var("y", 0)])),
            Arc::new(Term::Let {
                binder: Pattern::Var(ustr("r")),
                init: Arc::new(Term::RecordOf {
                    fields: Arc::from([(ustr("a"), Arc::new(Term::Float64Of(0.5)))]),
                }),
                body: Arc::new(Term::Access {
                    record: var("r", 0),
                    field: ustr("a"),
                }),
            }),
        ];
        for term in terms {
            let value = eval(&empty_env(), &term, &metas);
            let round_trip = eval(&empty_env(), &quote(0, &value, &metas), &metas);
            assert_eq!(conv(0, &round_trip, &value, &metas), ConvResult::Yes, "{term}");
        }
    }
}
