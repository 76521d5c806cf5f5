use std::{backtrace::Backtrace, borrow::Cow};

use thiserror::Error;

pub mod backend;
pub mod sema;
pub mod syntax;
pub mod tooling;
pub mod util;

pub use sema::elab::{ElaborateResult, elaborate};
pub use syntax::{ParseResult, parse};

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Internal(Cow<'static, str>, Box<Backtrace>),
    #[error(
        "crossing intervals detected: [{}, {}) crosses [{}, {})",
        child.start, child.end, parent.start, parent.end
    )]
    CrossingIntervals { child: util::Span, parent: util::Span },
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

impl Error {
    pub fn internal<E: Into<Cow<'static, str>>>(error: E) -> Self {
        Self::Internal(error.into(), Box::new(Backtrace::capture()))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
