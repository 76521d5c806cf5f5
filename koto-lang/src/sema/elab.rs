//!
//! Bidirectional elaboration from concrete syntax into core terms

use std::{
    fmt,
    sync::{Arc, OnceLock},
};

use rustc_hash::FxHashSetRand;
use thiserror::Error;
use tracing::{debug, trace};
use ustr::Ustr;

use super::{
    conv::{ConvResult, conv},
    eval::{binder_name, eval, force, quote, zonk},
    meta::Metas,
    term::{Pattern, Term, TermPtr},
    value::{Closure, Env, Telescope, Thunk, Value, ValuePtr, empty_env},
};
use crate::{
    Result,
    syntax::{Concrete, ConcretePtr, Field, Param, ParseResult},
    util::{Diagnostic, IntervalTree, Span, WithSpan},
};

/// Problems reported to the user. The message is the diagnostic text.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("Unknown identifier `{0}`")]
    UnknownIdentifier(Ustr),
    #[error("Type mismatch: expected `{expected}`, but found `{actual}`")]
    TypeMismatch { expected: TermPtr, actual: TermPtr },
    #[error("Refinement not satisfied: `{value}` is not in `{ty}`")]
    RefinementNotSatisfied { value: TermPtr, ty: TermPtr },
    #[error("Unsupported pattern")]
    UnsupportedPattern,
    #[error("Unknown field `{field}` in `{ty}`")]
    UnknownField { field: Ustr, ty: TermPtr },
    #[error("Unexpected field `{0}`")]
    UnexpectedField(Ustr),
    #[error("Missing field `{0}`")]
    MissingField(Ustr),
    #[error("Duplicate field `{0}`")]
    DuplicateField(Ustr),
    #[error("Expected function type, but found `{0}`")]
    ExpectedFunctionType(TermPtr),
    #[error("Expected record type, but found `{0}`")]
    ExpectedRecordType(TermPtr),
    #[error("Expected {expected} argument(s), but found {actual}")]
    ArityError { expected: usize, actual: usize },
    #[error("Unsolved metavariable")]
    UnsolvedMetavariable,
}

/// A type recorded during elaboration, read back only when asked for. The
/// meta table is complete by then, so concurrent readers quote the same term.
#[derive(Clone)]
pub struct LazyType {
    level: usize,
    value: ValuePtr,
    metas: Arc<Metas>,
    quoted: OnceLock<TermPtr>,
}

impl LazyType {
    pub fn value(&self) -> &ValuePtr {
        &self.value
    }

    pub fn term(&self) -> TermPtr {
        self.quoted
            .get_or_init(|| quote(self.level, &self.value, &self.metas))
            .clone()
    }
}

impl fmt::Display for LazyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.term())
    }
}

impl fmt::Debug for LazyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LazyType({})", self.term())
    }
}

#[derive(Debug, Clone)]
pub struct CompletionEntry {
    pub name: Ustr,
    pub ty: LazyType,
}

#[derive(Debug)]
pub struct ElaborateResult {
    pub term: TermPtr,
    pub expected_types: IntervalTree<LazyType>,
    pub actual_types: IntervalTree<LazyType>,
    pub scopes: IntervalTree<CompletionEntry>,
    pub diagnostics: Vec<Diagnostic>,
}

type Typed = (TermPtr, ValuePtr);

fn universe() -> ValuePtr {
    Arc::new(Value::Type)
}

fn boolean() -> ValuePtr {
    Arc::new(Value::Bool)
}

fn term(term: Term) -> TermPtr {
    Arc::new(term)
}

fn error_pair() -> Typed {
    (term(Term::Err), Arc::new(Value::Err))
}

fn is_numeric(text: &str) -> bool {
    let digits = text.strip_prefix('-').unwrap_or(text);
    digits.starts_with(|c: char| c.is_ascii_digit())
}

struct Entry {
    name: Option<Ustr>,
    ty: ValuePtr,
}

/// A recursive function whose body has been checked.
struct FunDefinition {
    name: Ustr,
    binders: Arc<[Pattern]>,
    body: TermPtr,
    ty: ValuePtr,
    pending: Vec<(ValuePtr, Span)>,
}

struct Elaborator {
    entries: Vec<Entry>,
    env: Env,
    metas: Arc<Metas>,
    expected_types: Vec<(Span, LazyType)>,
    actual_types: Vec<(Span, LazyType)>,
    scopes: Vec<(Span, CompletionEntry)>,
    diagnostics: Vec<Diagnostic>,
}

impl Elaborator {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            env: empty_env(),
            metas: Arc::new(Metas::new()),
            expected_types: Vec::new(),
            actual_types: Vec::new(),
            scopes: Vec::new(),
            diagnostics: Vec::new(),
        }
    }

    fn level(&self) -> usize {
        self.entries.len()
    }

    /// Runs `f` and drops every binding it introduced.
    fn scoped<F, R>(&mut self, f: F) -> R
    where
        F: FnOnce(&mut Self) -> R,
    {
        let level = self.level();
        let result = f(self);
        self.entries.truncate(level);
        while self.env.len() > level {
            self.env.drop_last_mut();
        }
        result
    }

    fn extend(
        &mut self,
        binder: &Pattern,
        ty: ValuePtr,
        value: Option<Thunk>,
        scope: Option<Span>,
    ) -> Thunk {
        let value = value
            .unwrap_or_else(|| Thunk::ready(Value::var(binder_name(binder), self.level())));
        if let (Some(name), Some(scope)) = (binder.name(), scope) {
            let ty = self.lazy(&ty);
            self.scopes.push((scope, CompletionEntry { name, ty }));
        }
        self.entries.push(Entry {
            name: binder.name(),
            ty,
        });
        self.env.push_back_mut(value.clone());
        value
    }

    fn lookup(&self, name: Ustr) -> Option<(usize, ValuePtr)> {
        self.entries
            .iter()
            .rev()
            .enumerate()
            .find(|(_, entry)| entry.name == Some(name))
            .map(|(index, entry)| (index, entry.ty.clone()))
    }

    fn lazy(&self, ty: &ValuePtr) -> LazyType {
        LazyType {
            level: self.level(),
            value: ty.clone(),
            metas: self.metas.clone(),
            quoted: OnceLock::new(),
        }
    }

    fn eval(&self, term: &TermPtr) -> ValuePtr {
        eval(&self.env, term, &self.metas)
    }

    fn quote(&self, value: &ValuePtr) -> TermPtr {
        quote(self.level(), value, &self.metas)
    }

    fn force(&self, value: &ValuePtr) -> ValuePtr {
        force(value.clone(), &self.metas)
    }

    fn conv(&self, actual: &ValuePtr, expected: &ValuePtr) -> ConvResult {
        conv(self.level(), actual, expected, &self.metas)
    }

    /// Looks through refinements to the underlying type.
    fn unrefine(&self, ty: &ValuePtr) -> ValuePtr {
        let mut ty = self.force(ty);
        while let Value::Refine { base, .. } = &*ty {
            ty = self.force(base);
        }
        ty
    }

    fn error(&mut self, error: Error, span: Span) {
        debug!("error at {span}: {error}");
        self.diagnostics
            .push(Diagnostic::error(error.to_string(), span));
    }

    fn warning(&mut self, error: Error, span: Span) {
        debug!("warning at {span}: {error}");
        self.diagnostics
            .push(Diagnostic::warning(error.to_string(), span));
    }

    fn fail(&mut self, error: Error, span: Span) -> Typed {
        self.error(error, span);
        error_pair()
    }

    fn mismatch(&mut self, result: ConvResult, expected: &ValuePtr, actual: &ValuePtr, span: Span) {
        if result == ConvResult::Yes {
            return;
        }
        let error = Error::TypeMismatch {
            expected: self.quote(expected),
            actual: self.quote(actual),
        };
        if result == ConvResult::No {
            self.error(error, span);
        } else {
            self.warning(error, span);
        }
    }

    fn fresh_meta(&self, span: Span) -> Typed {
        let meta = self.metas.fresh(span);
        (term(Term::Meta(meta)), Arc::new(Value::Meta(meta)))
    }

    fn ensure_solved(&mut self, pending: Vec<(ValuePtr, Span)>) {
        for (ty, span) in pending {
            if let Value::Meta(meta) = &*self.force(&ty) {
                debug!("{meta} is unsolved when its scope closes");
                self.error(Error::UnsolvedMetavariable, span);
            }
        }
    }

    /// Elaborates a binder, recording its type for hover.
    fn pattern(&mut self, concrete: &ConcretePtr, ty: &ValuePtr) -> Pattern {
        let pattern = match &***concrete {
            Concrete::Ident(name) if !is_numeric(name) => Pattern::Var(*name),
            Concrete::Err(_) => Pattern::Err,
            _ => {
                self.error(Error::UnsupportedPattern, concrete.span());
                Pattern::Err
            }
        };
        let ty = self.lazy(ty);
        self.actual_types.push((concrete.span(), ty));
        pattern
    }

    /// Annotated parameter type, or a fresh meta that must be solved later.
    fn param_type(&mut self, param: &Param, pending: &mut Vec<(ValuePtr, Span)>) -> Typed {
        match &param.ty {
            Some(ty) => {
                let ty = self.check(ty, &universe());
                let value = self.eval(&ty);
                (ty, value)
            }
            None => {
                let (ty, value) = self.fresh_meta(param.binder.span());
                pending.push((value.clone(), param.binder.span()));
                (ty, value)
            }
        }
    }

    fn synth_or_check(&mut self, concrete: &ConcretePtr, expected: Option<&ValuePtr>) -> Typed {
        match expected {
            Some(expected) => (self.check(concrete, expected), expected.clone()),
            None => self.synth(concrete),
        }
    }

    fn synth(&mut self, concrete: &ConcretePtr) -> Typed {
        let (term, ty) = stacker::maybe_grow(32 * 1024, 1024 * 1024, || {
            self.synth_inner(concrete)
        });
        trace!("synthesized {} : {}", term, self.quote(&ty));
        let lazy = self.lazy(&ty);
        self.actual_types.push((concrete.span(), lazy));
        (term, ty)
    }

    fn synth_inner(&mut self, concrete: &ConcretePtr) -> Typed {
        let span = concrete.span();
        match &***concrete {
            Concrete::Ident(name) => self.ident(*name, span),
            Concrete::Str(text) => (term(Term::StrOf(text.as_str().into())), Arc::new(Value::Str)),
            Concrete::Let {
                binder,
                anno,
                init,
                body,
                scope,
            } => self.elab_let(binder, anno.as_ref(), init, body, *scope, None),
            Concrete::LetFun {
                name,
                params,
                result,
                body,
                next,
                scope,
            } => {
                let definition = self.define_fun(name, params, result.as_ref(), body, *scope);
                self.let_fun_next(definition, next, None)
            }
            Concrete::Fun {
                params,
                result,
                body,
            } => self.synth_fun(params, result.as_ref(), body.as_ref()),
            Concrete::Call { func, args } => self.synth_call(span, func, args),
            Concrete::Record { fields } => {
                let fields = self.fields(fields, |this, field| {
                    Some(this.check(&field.value, &universe()))
                });
                (term(Term::Record { fields: fields.into() }), universe())
            }
            Concrete::RecordOf { fields } => {
                let fields = self.fields(fields, |this, field| Some(this.synth(&field.value)));
                let terms = fields
                    .iter()
                    .map(|(name, (term, _))| (*name, term.clone()))
                    .collect();
                let types = fields
                    .into_iter()
                    .map(|(name, (_, ty))| (name, ty))
                    .collect();
                (
                    term(Term::RecordOf { fields: terms }),
                    Arc::new(Value::Record { fields: types }),
                )
            }
            Concrete::Access { record, field } => self.synth_access(record, field),
            Concrete::Refine {
                binder,
                base,
                predicate,
                scope,
            } => {
                let base = self.check(base, &universe());
                let base_ty = self.eval(&base);
                let binder = self.pattern(binder, &base_ty);
                let predicate = self.scoped(|this| {
                    this.extend(&binder, base_ty, None, Some(*scope));
                    this.check(predicate, &boolean())
                });
                (
                    term(Term::Refine {
                        binder,
                        base,
                        predicate,
                    }),
                    universe(),
                )
            }
            Concrete::If {
                cond,
                then_branch,
                else_branch,
            } => {
                let cond = self.check(cond, &boolean());
                let (then_branch, ty) = self.synth(then_branch);
                let else_branch = self.check(else_branch, &ty);
                (
                    term(Term::If {
                        cond,
                        then_branch,
                        else_branch,
                    }),
                    ty,
                )
            }
            Concrete::Anno { target, ty } => {
                let ty = self.check(ty, &universe());
                let ty = self.eval(&ty);
                (self.check(target, &ty), ty)
            }
            Concrete::Err(_) => error_pair(),
        }
    }

    fn ident(&mut self, name: Ustr, span: Span) -> Typed {
        let (term, ty) = match name.as_str() {
            "type" => (Term::Type, Value::Type),
            "bool" => (Term::Bool, Value::Type),
            "true" => (Term::BoolOf(true), Value::Bool),
            "false" => (Term::BoolOf(false), Value::Bool),
            "int64" => (Term::Int64, Value::Type),
            "float64" => (Term::Float64, Value::Type),
            "str" => (Term::Str, Value::Type),
            text => {
                if let Some((index, ty)) = self.lookup(name) {
                    return (term(Term::Var { name, index }), ty);
                }
                match (text.parse::<i64>(), text.parse::<f64>()) {
                    (Ok(value), _) => (Term::Int64Of(value), Value::Int64),
                    (_, Ok(value)) if is_numeric(text) => (Term::Float64Of(value), Value::Float64),
                    _ => return self.fail(Error::UnknownIdentifier(name), span),
                }
            }
        };
        (Arc::new(term), Arc::new(ty))
    }

    fn elab_let(
        &mut self,
        binder: &ConcretePtr,
        anno: Option<&ConcretePtr>,
        init: &ConcretePtr,
        body: &ConcretePtr,
        scope: Span,
        expected: Option<&ValuePtr>,
    ) -> Typed {
        let mut pending = Vec::new();
        let ty = match anno {
            Some(anno) => {
                let anno = self.check(anno, &universe());
                self.eval(&anno)
            }
            None => {
                let (_, ty) = self.fresh_meta(binder.span());
                pending.push((ty.clone(), binder.span()));
                ty
            }
        };
        let init = self.check(init, &ty);
        let binder = self.pattern(binder, &ty);
        let value = Thunk::deferred(self.env.clone(), init.clone());
        let (body, body_ty) = self.scoped(|this| {
            this.extend(&binder, ty, Some(value), Some(scope));
            this.synth_or_check(body, expected)
        });
        self.ensure_solved(pending);
        (term(Term::Let { binder, init, body }), body_ty)
    }

    /// Checks a recursive function body with the function itself in scope.
    ///
    /// The function holds a slot below its parameters while they are
    /// elaborated, so types solved in the body are read back at the levels
    /// the telescope is evaluated at.
    fn define_fun(
        &mut self,
        name: &WithSpan<Ustr>,
        params: &[Param],
        result: Option<&ConcretePtr>,
        body: &ConcretePtr,
        scope: Span,
    ) -> FunDefinition {
        let mut pending = Vec::new();
        let (binders, body, ty) = self.scoped(|this| {
            let slot = this.level();
            this.extend(&Pattern::Err, Arc::new(Value::Err), None, None);
            let env = this.env.clone();
            let mut binders = Vec::with_capacity(params.len());
            let mut param_types = Vec::with_capacity(params.len());
            for param in params {
                let (ty, value) = this.param_type(param, &mut pending);
                let binder = this.pattern(&param.binder, &value);
                this.extend(&binder, value, None, Some(param.scope));
                binders.push(binder);
                param_types.push(ty);
            }
            let result_type = match result {
                Some(result) => this.check(result, &universe()),
                None => {
                    let (ty, value) = this.fresh_meta(name.span());
                    pending.push((value, name.span()));
                    ty
                }
            };
            let binders = Arc::<[Pattern]>::from(binders);
            let ty = Arc::new(Value::Fun {
                binders: binders.clone(),
                telescope: Telescope {
                    env: env.clone(),
                    params: param_types.iter().cloned().collect(),
                    result: result_type.clone(),
                },
            });
            this.entries[slot] = Entry {
                name: Some(**name),
                ty,
            };
            let result_ty = this.eval(&result_type);
            let body = this.check(body, &result_ty);

            let telescope = this.close_telescope(env, slot + 1, &param_types, &result_type);
            let ty = Arc::new(Value::Fun {
                binders: binders.clone(),
                telescope,
            });
            let lazy = this.lazy(&ty);
            this.actual_types.push((name.span(), lazy.clone()));
            this.scopes.push((
                scope,
                CompletionEntry {
                    name: **name,
                    ty: lazy,
                },
            ));
            (binders, body, ty)
        });
        FunDefinition {
            name: **name,
            binders,
            body,
            ty,
            pending,
        }
    }

    /// Builds a telescope from parameter types elaborated from `depth` on,
    /// replacing solved metas so they follow the arguments.
    fn close_telescope(
        &self,
        env: Env,
        depth: usize,
        params: &[TermPtr],
        result: &TermPtr,
    ) -> Telescope {
        Telescope {
            env,
            params: params
                .iter()
                .enumerate()
                .map(|(i, param)| zonk(depth + i, param, &self.metas))
                .collect(),
            result: zonk(depth + params.len(), result, &self.metas),
        }
    }

    fn let_fun_next(
        &mut self,
        definition: FunDefinition,
        next: &ConcretePtr,
        expected: Option<&ValuePtr>,
    ) -> Typed {
        let FunDefinition {
            name,
            binders,
            body,
            ty,
            pending,
        } = definition;
        let func = Arc::new(Value::FunOf {
            binders: binders.clone(),
            closure: Closure::new(self.env.clone(), body.clone()),
            recursive: Some(name),
        });
        let (next, next_ty) = self.scoped(|this| {
            this.extend(&Pattern::Var(name), ty, Some(Thunk::ready(func)), None);
            this.synth_or_check(next, expected)
        });
        self.ensure_solved(pending);
        (
            term(Term::LetFun {
                name,
                binders,
                body,
                next,
            }),
            next_ty,
        )
    }

    fn synth_fun(
        &mut self,
        params: &[Param],
        result: Option<&ConcretePtr>,
        body: Option<&ConcretePtr>,
    ) -> Typed {
        if result.is_none() && body.is_none() {
            // Already reported by the parser.
            return error_pair();
        }
        let mut pending = Vec::new();
        let depth = self.level();
        let env = self.env.clone();
        let (binders, telescope, body) = self.scoped(|this| {
            let mut binders = Vec::with_capacity(params.len());
            let mut param_types = Vec::with_capacity(params.len());
            for param in params {
                let (ty, value) = this.param_type(param, &mut pending);
                let binder = this.pattern(&param.binder, &value);
                this.extend(&binder, value, None, Some(param.scope));
                binders.push(binder);
                param_types.push(ty);
            }
            let (result, body) = match (result, body) {
                (Some(result), None) => (this.check(result, &universe()), None),
                (Some(result), Some(body)) => {
                    let result = this.check(result, &universe());
                    let result_ty = this.eval(&result);
                    let body = this.check(body, &result_ty);
                    (result, Some(body))
                }
                (None, Some(body)) => {
                    let (body, body_ty) = this.synth(body);
                    (this.quote(&body_ty), Some(body))
                }
                (None, None) => (term(Term::Err), None),
            };
            let telescope = this.close_telescope(env, depth, &param_types, &result);
            (Arc::<[Pattern]>::from(binders), telescope, body)
        });
        self.ensure_solved(pending);
        match body {
            None => (
                term(Term::Fun {
                    binders,
                    params: telescope.params,
                    result: telescope.result,
                }),
                universe(),
            ),
            Some(body) => {
                let ty = Value::Fun {
                    binders: binders.clone(),
                    telescope,
                };
                (term(Term::FunOf { binders, body }), Arc::new(ty))
            }
        }
    }

    fn check_fun(
        &mut self,
        params: &[Param],
        result: Option<&ConcretePtr>,
        body: &ConcretePtr,
        telescope: &Telescope,
    ) -> TermPtr {
        self.scoped(|this| {
            let mut args = Vec::with_capacity(params.len());
            let mut binders = Vec::with_capacity(params.len());
            for (index, param) in params.iter().enumerate() {
                let expected = telescope.param(index, &args, &this.metas);
                if let Some(ty) = &param.ty {
                    let ty_term = this.check(ty, &universe());
                    let actual = this.eval(&ty_term);
                    let answer = this.conv(&actual, &expected);
                    this.mismatch(answer, &expected, &actual, ty.span());
                }
                let binder = this.pattern(&param.binder, &expected);
                args.push(this.extend(&binder, expected, None, Some(param.scope)));
                binders.push(binder);
            }
            let result_ty = telescope.result(&args, &this.metas);
            if let Some(result) = result {
                let ty_term = this.check(result, &universe());
                let actual = this.eval(&ty_term);
                let answer = this.conv(&actual, &result_ty);
                this.mismatch(answer, &result_ty, &actual, result.span());
            }
            let body = this.check(body, &result_ty);
            term(Term::FunOf {
                binders: binders.into(),
                body,
            })
        })
    }

    fn synth_call(&mut self, span: Span, func: &ConcretePtr, args: &[ConcretePtr]) -> Typed {
        let (func_term, func_ty) = self.synth(func);
        let func_ty = self.unrefine(&func_ty);
        match &*func_ty {
            Value::Fun { telescope, .. } => {
                let arity = telescope.len();
                let mut arg_terms = Vec::with_capacity(arity);
                let mut arg_values = Vec::with_capacity(arity);
                for (index, arg) in args.iter().enumerate() {
                    if index < arity {
                        let expected = telescope.param(index, &arg_values, &self.metas);
                        let arg = self.check(arg, &expected);
                        arg_values.push(Thunk::deferred(self.env.clone(), arg.clone()));
                        arg_terms.push(arg);
                    } else {
                        self.synth(arg);
                    }
                }
                if args.len() != arity {
                    self.error(
                        Error::ArityError {
                            expected: arity,
                            actual: args.len(),
                        },
                        span,
                    );
                    while arg_terms.len() < arity {
                        arg_terms.push(term(Term::Err));
                        arg_values.push(Thunk::ready(Arc::new(Value::Err)));
                    }
                }
                let result = telescope.result(&arg_values, &self.metas);
                (
                    term(Term::Call {
                        func: func_term,
                        args: arg_terms.into(),
                    }),
                    result,
                )
            }
            Value::Err => {
                for arg in args {
                    self.synth(arg);
                }
                error_pair()
            }
            _ => {
                for arg in args {
                    self.synth(arg);
                }
                let ty = self.quote(&func_ty);
                self.fail(Error::ExpectedFunctionType(ty), func.span())
            }
        }
    }

    fn synth_access(&mut self, record: &ConcretePtr, field: &WithSpan<Ustr>) -> Typed {
        let (record_term, record_ty) = self.synth(record);
        let record_ty = self.unrefine(&record_ty);
        match &*record_ty {
            Value::Record { fields } => match fields.iter().find(|(name, _)| *name == **field) {
                Some((_, ty)) => (
                    term(Term::Access {
                        record: record_term,
                        field: **field,
                    }),
                    ty.clone(),
                ),
                None => {
                    let ty = self.quote(&record_ty);
                    self.fail(Error::UnknownField { field: **field, ty }, field.span())
                }
            },
            Value::Err => error_pair(),
            _ => {
                let ty = self.quote(&record_ty);
                self.fail(Error::ExpectedRecordType(ty), record.span())
            }
        }
    }

    /// Elaborates each field once, reporting repeated names.
    fn fields<T, F>(&mut self, fields: &[Field], mut each: F) -> Vec<(Ustr, T)>
    where
        F: FnMut(&mut Self, &Field) -> Option<T>,
    {
        let mut seen = FxHashSetRand::default();
        let mut out = Vec::with_capacity(fields.len());
        for field in fields {
            if !seen.insert(*field.name) {
                self.error(Error::DuplicateField(*field.name), field.name.span());
                continue;
            }
            if let Some(value) = each(self, field) {
                out.push((*field.name, value));
            }
        }
        out
    }

    fn check_record_of(
        &mut self,
        span: Span,
        fields: &[Field],
        expected: &[(Ustr, ValuePtr)],
    ) -> TermPtr {
        let checked = self.fields(fields, |this, field| {
            match expected.iter().find(|(name, _)| *name == *field.name) {
                Some((_, ty)) => Some(this.check(&field.value, ty)),
                None => {
                    this.error(Error::UnexpectedField(*field.name), field.name.span());
                    this.synth(&field.value);
                    None
                }
            }
        });
        for (name, _) in expected {
            if !fields.iter().any(|field| *field.name == *name) {
                self.error(Error::MissingField(*name), span);
            }
        }
        term(Term::RecordOf {
            fields: checked.into(),
        })
    }

    fn check(&mut self, concrete: &ConcretePtr, expected: &ValuePtr) -> TermPtr {
        let term = stacker::maybe_grow(32 * 1024, 1024 * 1024, || {
            self.check_inner(concrete, expected)
        });
        trace!("checked {} against {}", term, self.quote(expected));
        let lazy = self.lazy(expected);
        self.expected_types.push((concrete.span(), lazy));
        term
    }

    fn check_inner(&mut self, concrete: &ConcretePtr, expected: &ValuePtr) -> TermPtr {
        let expected = self.force(expected);
        match (&***concrete, &*expected) {
            (
                Concrete::Let {
                    binder,
                    anno,
                    init,
                    body,
                    scope,
                },
                _,
            ) => {
                self.elab_let(binder, anno.as_ref(), init, body, *scope, Some(&expected))
                    .0
            }
            (
                Concrete::LetFun {
                    name,
                    params,
                    result,
                    body,
                    next,
                    scope,
                },
                _,
            ) => {
                let definition = self.define_fun(name, params, result.as_ref(), body, *scope);
                self.let_fun_next(definition, next, Some(&expected)).0
            }
            (
                Concrete::If {
                    cond,
                    then_branch,
                    else_branch,
                },
                _,
            ) => {
                let cond = self.check(cond, &boolean());
                let then_branch = self.check(then_branch, &expected);
                let else_branch = self.check(else_branch, &expected);
                term(Term::If {
                    cond,
                    then_branch,
                    else_branch,
                })
            }
            (
                Concrete::Fun {
                    params,
                    result,
                    body: Some(body),
                },
                Value::Fun { telescope, .. },
            ) if params.len() == telescope.len() => {
                self.check_fun(params, result.as_ref(), body, telescope)
            }
            (Concrete::RecordOf { fields }, Value::Record { fields: expected }) => {
                self.check_record_of(concrete.span(), fields, expected)
            }
            (Concrete::RecordOf { fields }, Value::Type) if fields.is_empty() => {
                term(Term::Record {
                    fields: Arc::from([]),
                })
            }
            (_, Value::Refine { base, predicate, .. }) => {
                self.check_refinement(concrete, &expected, base, predicate)
            }
            _ => self.check_by_synth(concrete, &expected),
        }
    }

    fn check_by_synth(&mut self, concrete: &ConcretePtr, expected: &ValuePtr) -> TermPtr {
        let (target, actual) = self.synth(concrete);
        let result = self.conv(&actual, expected);
        self.mismatch(result, expected, &actual, concrete.span());
        match result {
            ConvResult::Yes => target,
            ConvResult::No => term(Term::Err),
            ConvResult::Unknown => self.residual(target, expected),
        }
    }

    /// Membership is decided on the value of the term, not on its type.
    fn check_refinement(
        &mut self,
        concrete: &ConcretePtr,
        expected: &ValuePtr,
        base: &ValuePtr,
        predicate: &Closure,
    ) -> TermPtr {
        let span = concrete.span();
        let (target, actual) = self.synth(concrete);
        if self.conv(&actual, expected) == ConvResult::Yes {
            return target;
        }
        match self.conv(&actual, base) {
            ConvResult::No => {
                self.mismatch(ConvResult::No, expected, &actual, span);
                term(Term::Err)
            }
            ConvResult::Unknown => {
                self.mismatch(ConvResult::Unknown, expected, &actual, span);
                self.residual(target, expected)
            }
            ConvResult::Yes => {
                let value = self.eval(&target);
                let holds = predicate.apply([Thunk::ready(value.clone())], &self.metas);
                match &*self.force(&holds) {
                    Value::BoolOf(true) | Value::Err => target,
                    Value::BoolOf(false) => {
                        let error = Error::RefinementNotSatisfied {
                            value: self.quote(&value),
                            ty: self.quote(expected),
                        };
                        self.error(error, span);
                        term(Term::Err)
                    }
                    _ => {
                        self.mismatch(ConvResult::Unknown, expected, &actual, span);
                        self.residual(target, expected)
                    }
                }
            }
        }
    }

    fn residual(&self, target: TermPtr, expected: &ValuePtr) -> TermPtr {
        term(Term::Check {
            target,
            ty: self.quote(expected),
        })
    }
}

/// Type checks a parsed document, collecting types and scopes by position.
pub fn elaborate(input: &ParseResult) -> Result<ElaborateResult> {
    let mut elaborator = Elaborator::new();
    let (term, _) = elaborator.synth(&input.term);
    let term = zonk(0, &term, &elaborator.metas);
    debug!(
        diagnostics = elaborator.diagnostics.len(),
        metas = elaborator.metas.len(),
        "elaborated document"
    );
    let Elaborator {
        expected_types,
        actual_types,
        scopes,
        diagnostics,
        ..
    } = elaborator;
    Ok(ElaborateResult {
        term,
        expected_types: IntervalTree::of(expected_types)?,
        actual_types: IntervalTree::of(actual_types)?,
        scopes: IntervalTree::of(scopes)?,
        diagnostics,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{syntax::parse, util::Severity};

    fn run(src: &str) -> ElaborateResult {
        _ = tracing_subscriber::fmt::try_init();
        let parsed = parse(src);
        assert!(parsed.diagnostics.is_empty(), "{:?}", parsed.diagnostics);
        elaborate(&parsed).unwrap()
    }

    fn messages(result: &ElaborateResult) -> Vec<&str> {
        result
            .diagnostics
            .iter()
            .map(|diagnostic| diagnostic.message.as_str())
            .collect()
    }

    fn run_value(src: &str) -> ValuePtr {
        let result = run(src);
        assert!(result.diagnostics.is_empty(), "{:?}", result.diagnostics);
        let metas = Metas::new();
        force(eval(&empty_env(), &result.term, &metas), &metas)
    }

    fn root_type(result: &ElaborateResult) -> String {
        result
            .actual_types
            .get_leaf(0)
            .map(|(_, ty)| ty.to_string())
            .unwrap_or_default()
    }

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn results_are_shared_across_threads() {
        assert_send_sync::<ElaborateResult>();
        assert_send_sync::<ParseResult>();
        let result = Arc::new(run("let id = fun(t : type, x : t) -> t = x id(int64, 3)"));
        let handles = (0..4)
            .map(|_| {
                let result = result.clone();
                std::thread::spawn(move || root_type(&result))
            })
            .collect::<Vec<_>>();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), "int64");
        }
    }

    #[test]
    fn let_binding_evaluates_to_its_value() {
        assert!(matches!(*run_value("let x = 1 x"), Value::Int64Of(1)));
    }

    #[test]
    fn call_site_reports_result_type() {
        let src = "let f = fun(x : int64) -> int64 = x f(1)";
        let result = run(src);
        assert!(result.diagnostics.is_empty(), "{:?}", result.diagnostics);
        let call = src.rfind('(').unwrap();
        let (span, ty) = result.actual_types.get_leaf(call).unwrap();
        assert_eq!(span, Span::new(call - 1, src.len()));
        assert_eq!(ty.to_string(), "int64");
    }

    #[test]
    fn calling_a_non_function_reports_once() {
        let result = run("1(2)");
        assert_eq!(messages(&result), vec!["Expected function type, but found `int64`"]);
        assert_eq!(result.diagnostics[0].severity, Severity::Error);
        assert_eq!(result.diagnostics[0].span, Span::new(0, 1));
        assert_eq!(*result.term, Term::Err);

        let result = run("let y = 1(2) y(3)");
        assert_eq!(messages(&result), vec!["Expected function type, but found `int64`"]);
    }

    #[test]
    fn unknown_identifiers_are_reported() {
        let result = run("xyz");
        assert_eq!(messages(&result), vec!["Unknown identifier `xyz`"]);
        let result = run("inf");
        assert_eq!(messages(&result), vec!["Unknown identifier `inf`"]);
    }

    #[test]
    fn literals_have_builtin_types() {
        assert_eq!(root_type(&run("1.5")), "float64");
        assert_eq!(root_type(&run("-2")), "int64");
        assert_eq!(root_type(&run("\"s\"")), "str");
        assert_eq!(root_type(&run("true")), "bool");
        assert_eq!(root_type(&run("int64")), "type");
    }

    #[test]
    fn later_bindings_shadow_earlier_ones() {
        assert_eq!(root_type(&run("let x = 1 let x = true x")), "bool");
        assert!(matches!(*run_value("let x = 1 let x = true x"), Value::BoolOf(true)));
    }

    #[test]
    fn annotations_are_checked() {
        let result = run("let x : bool = 1 x");
        assert_eq!(
            messages(&result),
            vec!["Type mismatch: expected `bool`, but found `int64`"]
        );
        assert!(run("(1 : int64)").diagnostics.is_empty());
    }

    #[test]
    fn dependent_functions_instantiate_their_telescope() {
        let result = run("let id = fun(t : type, x : t) -> t = x id(int64, 3)");
        assert!(result.diagnostics.is_empty(), "{:?}", result.diagnostics);
        assert_eq!(root_type(&result), "int64");
        let result = run("let id = fun(t : type, x : t) -> t = x id(bool, 3)");
        assert_eq!(
            messages(&result),
            vec!["Type mismatch: expected `bool`, but found `int64`"]
        );
    }

    #[test]
    fn solved_parameter_types_follow_their_arguments() {
        let result = run("(fun(t : type, x) -> t = x)(int64, 3)");
        assert!(result.diagnostics.is_empty(), "{:?}", result.diagnostics);
        let result = run("let r = (fun(t : type, x) -> t = x)(int64, 3) r");
        assert_eq!(root_type(&result), "int64");
        let result = run("let id = fun(t : type, x) -> t = x id(int64, 3)");
        assert!(result.diagnostics.is_empty(), "{:?}", result.diagnostics);
        assert_eq!(root_type(&result), "int64");

        let result = run("let id = fun(t : type, x) -> t = x id(bool, 3)");
        assert_eq!(
            messages(&result),
            vec!["Type mismatch: expected `bool`, but found `int64`"]
        );
        assert_eq!(result.diagnostics[0].severity, Severity::Error);
        let result = run("fun g(t : type, x) -> t = x g(bool, 3)");
        assert_eq!(
            messages(&result),
            vec!["Type mismatch: expected `bool`, but found `int64`"]
        );
        let result = run("fun g(t : type, x) -> t = x g(str, \"s\")");
        assert!(result.diagnostics.is_empty(), "{:?}", result.diagnostics);
        assert_eq!(root_type(&result), "str");
    }

    #[test]
    fn missing_arguments_are_padded() {
        let result = run("let f = fun(x : int64, y : int64) -> int64 = x f(1)");
        assert_eq!(messages(&result), vec!["Expected 2 argument(s), but found 1"]);
        assert_eq!(root_type(&result), "int64");
    }

    #[test]
    fn unannotated_parameters_must_be_solved() {
        let result = run("fun(x) = x");
        assert_eq!(messages(&result), vec!["Unsolved metavariable"]);
        assert_eq!(result.diagnostics[0].span, Span::new(4, 5));
        let result = run("let f : fun(x : int64) -> int64 = fun(y) = y f(2)");
        assert!(result.diagnostics.is_empty(), "{:?}", result.diagnostics);
    }

    #[test]
    fn recursive_functions_see_themselves() {
        let src = "fun f(b : bool) -> bool = if b then f(false) else true f(true)";
        assert!(matches!(*run_value(src), Value::BoolOf(true)));
        let result = run("fun g(n : int64) = n g(1)");
        assert!(result.diagnostics.is_empty(), "{:?}", result.diagnostics);
        assert_eq!(root_type(&result), "int64");
    }

    #[test]
    fn self_referential_result_types_are_rejected() {
        let src = "fun f(x : int64) = f f";
        let result = run(src);
        let messages = messages(&result);
        assert!(
            messages[0].starts_with("Type mismatch: expected `?`"),
            "{messages:?}"
        );
        assert!(messages.contains(&"Unsolved metavariable"), "{messages:?}");
        for offset in 0..src.len() {
            if let Some((_, ty)) = result.actual_types.get_leaf(offset) {
                assert!(!ty.to_string().is_empty());
            }
        }
    }

    #[test]
    fn records_project_fields() {
        let result = run("let r = { a = 1, b = \"s\" } r.b");
        assert!(result.diagnostics.is_empty(), "{:?}", result.diagnostics);
        assert_eq!(root_type(&result), "str");
        let result = run("let r = { a = 1, b = \"s\" } r.c");
        assert_eq!(
            messages(&result),
            vec!["Unknown field `c` in `{ a : int64, b : str }`"]
        );
        let result = run("1.a");
        assert_eq!(messages(&result), vec!["Expected record type, but found `int64`"]);
    }

    #[test]
    fn record_literals_match_record_types() {
        let result = run("let r : { a : int64 } = { b = 1 } r");
        assert_eq!(
            messages(&result),
            vec!["Unexpected field `b`", "Missing field `a`"]
        );
        let result = run("{ a = 1, a = 2 }");
        assert_eq!(messages(&result), vec!["Duplicate field `a`"]);
        let result = run("let r : { a : int64, b : bool } = { b = true, a = 1 } r.a");
        assert!(result.diagnostics.is_empty(), "{:?}", result.diagnostics);
        assert!(run("let unit : type = {} unit").diagnostics.is_empty());
    }

    #[test]
    fn unsupported_patterns_are_reported() {
        let result = run("let f(x) = 1 2");
        assert_eq!(messages(&result), vec!["Unsupported pattern"]);
    }

    #[test]
    fn satisfied_refinements_are_accepted() {
        let src = "let p = fun(x : int64) -> bool = true let n : (x : int64 @ p(x)) = 1 n";
        let result = run(src);
        assert!(result.diagnostics.is_empty(), "{:?}", result.diagnostics);
    }

    #[test]
    fn violated_refinements_are_errors() {
        let result = run("let n : (x : int64 @ false) = 1 n");
        assert_eq!(
            messages(&result),
            vec!["Refinement not satisfied: `1` is not in `x : int64 @ false`"]
        );
        assert_eq!(result.diagnostics[0].severity, Severity::Error);
    }

    #[test]
    fn undecided_refinements_leave_a_runtime_check() {
        let result = run("let f = fun(y : int64, b : bool) -> (x : int64 @ b) = y f");
        assert_eq!(
            messages(&result),
            vec!["Type mismatch: expected `x : int64 @ b`, but found `int64`"]
        );
        assert_eq!(result.diagnostics[0].severity, Severity::Warning);
        let Term::Let { init, .. } = &*result.term else {
            panic!("expected let, got {}", result.term);
        };
        let Term::FunOf { body, .. } = &**init else {
            panic!("expected function, got {init}");
        };
        assert!(matches!(&**body, Term::Check { .. }));
    }

    #[test]
    fn if_branches_agree() {
        assert_eq!(root_type(&run("if true then 1 else 2")), "int64");
        let result = run("if 1 then 1 else 2");
        assert_eq!(
            messages(&result),
            vec!["Type mismatch: expected `bool`, but found `int64`"]
        );
        let result = run("if true then 1 else false");
        assert_eq!(
            messages(&result),
            vec!["Type mismatch: expected `int64`, but found `bool`"]
        );
    }

    #[test]
    fn scopes_list_visible_bindings() {
        let src = "let a = 1 let b = true fun(c : int64) -> int64";
        let result = run(src);
        let offset = src.len() - 1;
        let names = result
            .scopes
            .get_all(offset)
            .into_iter()
            .map(|entry| format!("{} : {}", entry.name, entry.ty))
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["a : int64", "b : bool", "c : int64"]);
    }

    #[test]
    fn printed_terms_parse_back() {
        for src in [
            "let x = 1 let r = { a = x, b = \"s\" } if true then r.a else 2",
            "let t = fun(y : int64, z : str) -> { a : int64, b : float64 } t",
            "let p = fun(x : int64) -> (x : int64 @ true) p",
            "let u = 1.5 {}",
        ] {
            let first = run(src);
            assert!(first.diagnostics.is_empty(), "{:?}", first.diagnostics);
            let printed = first.term.to_string();
            let second = run(&printed);
            assert!(second.diagnostics.is_empty(), "{printed}: {:?}", second.diagnostics);
            assert_eq!(first.term, second.term, "{printed}");
        }
    }

    #[test]
    fn every_prefix_of_a_document_elaborates() {
        _ = tracing_subscriber::fmt::try_init();
        for src in [
            "fun f(x : int64) = x f(1)",
            "fun type bool = 1",
            "fun f , int64 -> x",
            "let r : { a : int64 } = { a = 1 } r.a",
            "let p = fun(x : int64) -> (y : int64 @ true) = x if true then p(1) else 2",
            "fun g(t : type, x) -> t = x g(bool, \"s\")",
        ] {
            for end in (0..=src.len()).filter(|end| src.is_char_boundary(*end)) {
                let prefix = &src[..end];
                let result = elaborate(&parse(prefix));
                assert!(result.is_ok(), "{prefix:?}: {:?}", result.err());
            }
        }
    }
}
