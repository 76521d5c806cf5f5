use std::{
    fmt,
    sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use super::value::ValuePtr;
use crate::util::Span;

/// Handle into [`Metas`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MetaVar(usize);

impl MetaVar {
    pub fn new(id: usize) -> Self {
        Self(id)
    }
}

impl fmt::Display for MetaVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "?{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub enum MetaEntry {
    Unsolved(Span),
    Solved(ValuePtr),
}

/// Side table of metavariables. Each entry is written at most once, during
/// elaboration; afterwards the table is only read.
#[derive(Debug, Default)]
pub struct Metas {
    entries: RwLock<Vec<MetaEntry>>,
}

impl Metas {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<MetaEntry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<MetaEntry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn fresh(&self, span: Span) -> MetaVar {
        let mut entries = self.write();
        let meta = MetaVar(entries.len());
        entries.push(MetaEntry::Unsolved(span));
        meta
    }

    pub fn solution(&self, meta: MetaVar) -> Option<ValuePtr> {
        match self.read().get(meta.0) {
            Some(MetaEntry::Solved(value)) => Some(value.clone()),
            Some(MetaEntry::Unsolved(_)) => None,
            None => {
                tracing::error!("{meta} is not found in the meta table");
                None
            }
        }
    }

    pub fn solve(&self, meta: MetaVar, value: ValuePtr) {
        let mut entries = self.write();
        let Some(entry) = entries.get_mut(meta.0) else {
            tracing::error!("attempt to solve unknown {meta}");
            return;
        };
        debug_assert!(
            matches!(entry, MetaEntry::Unsolved(_)),
            "{meta} is solved twice"
        );
        tracing::debug!("solved {meta}");
        *entry = MetaEntry::Solved(value);
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
