use std::{
    fmt,
    sync::{Arc, Mutex, OnceLock, PoisonError},
};

use archery::ArcK;
use rpds::Vector;
use ustr::Ustr;

use super::{
    eval::eval,
    meta::{MetaVar, Metas},
    term::{Pattern, TermPtr},
};

pub type ValuePtr = Arc<Value>;
pub type Env = Vector<Thunk, ArcK>;

pub fn empty_env() -> Env {
    Env::new_with_ptr_kind()
}

/// Semantic domain, with variables as de Bruijn levels.
#[derive(Debug, Clone)]
pub enum Value {
    Type,
    Bool,
    BoolOf(bool),
    /// Stuck on a neutral condition
    If {
        cond: ValuePtr,
        then_branch: Closure,
        else_branch: Closure,
    },
    Int64,
    Int64Of(i64),
    Float64,
    Float64Of(f64),
    Str,
    StrOf(Arc<str>),
    Fun {
        binders: Arc<[Pattern]>,
        telescope: Telescope,
    },
    /// `recursive` names the function when its body refers to itself.
    FunOf {
        binders: Arc<[Pattern]>,
        closure: Closure,
        recursive: Option<Ustr>,
    },
    /// Stuck application
    Call {
        func: ValuePtr,
        args: Arc<[Thunk]>,
    },
    Record {
        fields: Arc<[(Ustr, ValuePtr)]>,
    },
    RecordOf {
        fields: Arc<[(Ustr, ValuePtr)]>,
    },
    /// Stuck projection
    Access {
        record: ValuePtr,
        field: Ustr,
    },
    Refine {
        binder: Pattern,
        base: ValuePtr,
        predicate: Closure,
    },
    Var {
        name: Ustr,
        level: usize,
    },
    Meta(MetaVar),
    Err,
}

impl Value {
    pub fn var(name: Ustr, level: usize) -> ValuePtr {
        Arc::new(Value::Var { name, level })
    }

    pub fn is_neutral(&self) -> bool {
        matches!(
            self,
            Value::If { .. } | Value::Call { .. } | Value::Access { .. } | Value::Var { .. }
        )
    }
}

/// A term waiting for the values of its free binders.
#[derive(Clone)]
pub struct Closure {
    pub env: Env,
    pub body: TermPtr,
}

impl Closure {
    pub fn new(env: Env, body: TermPtr) -> Self {
        Self { env, body }
    }

    /// Evaluates a closure that binds nothing.
    pub fn eval(&self, metas: &Metas) -> ValuePtr {
        eval(&self.env, &self.body, metas)
    }

    pub fn apply<I>(&self, args: I, metas: &Metas) -> ValuePtr
    where
        I: IntoIterator<Item = Thunk>,
    {
        let mut env = self.env.clone();
        for arg in args {
            env.push_back_mut(arg);
        }
        eval(&env, &self.body, metas)
    }
}

impl fmt::Debug for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Closure(|{}| {})", self.env.len(), self.body)
    }
}

/// Parameter types of a function type, each depending on the ones before.
#[derive(Clone)]
pub struct Telescope {
    pub env: Env,
    pub params: Arc<[TermPtr]>,
    pub result: TermPtr,
}

impl Telescope {
    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Type of parameter `index`, given the arguments bound before it.
    pub fn param(&self, index: usize, args: &[Thunk], metas: &Metas) -> ValuePtr {
        let mut env = self.env.clone();
        for arg in args.iter().take(index) {
            env.push_back_mut(arg.clone());
        }
        eval(&env, &self.params[index], metas)
    }

    pub fn result(&self, args: &[Thunk], metas: &Metas) -> ValuePtr {
        let mut env = self.env.clone();
        for arg in args {
            env.push_back_mut(arg.clone());
        }
        eval(&env, &self.result, metas)
    }
}

impl fmt::Debug for Telescope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Telescope(|{}| [", self.env.len())?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{param}")?;
        }
        write!(f, "] -> {})", self.result)
    }
}

struct ThunkCell {
    value: OnceLock<ValuePtr>,
    pending: Mutex<Option<(Env, TermPtr)>>,
}

/// Call-by-need binding: evaluated on first use, at most once. Readers on
/// other threads wait for the evaluation in progress.
#[derive(Clone)]
pub struct Thunk(Arc<ThunkCell>);

impl Thunk {
    pub fn ready(value: ValuePtr) -> Self {
        Self(Arc::new(ThunkCell {
            value: OnceLock::from(value),
            pending: Mutex::new(None),
        }))
    }

    pub fn deferred(env: Env, term: TermPtr) -> Self {
        Self(Arc::new(ThunkCell {
            value: OnceLock::new(),
            pending: Mutex::new(Some((env, term))),
        }))
    }

    pub fn force(&self, metas: &Metas) -> ValuePtr {
        self.0
            .value
            .get_or_init(|| {
                let pending = self
                    .0
                    .pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                match pending {
                    Some((env, term)) => eval(&env, &term, metas),
                    None => {
                        tracing::error!("thunk has neither a value nor a pending term");
                        Arc::new(Value::Err)
                    }
                }
            })
            .clone()
    }
}

impl fmt::Debug for Thunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.value.get() {
            Some(value) => value.fmt(f),
            None => write!(f, "<pending>"),
        }
    }
}
