use std::sync::Arc;

use ustr::Ustr;

use crate::util::{Diagnostic, Span, WithSpan};

pub mod lexer;
mod parser;

pub use parser::parse;

pub type ConcretePtr = Arc<WithSpan<Concrete>>;

/// Surface syntax as written, before name resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum Concrete {
    /// Identifiers, builtin names and numeric literals
    Ident(Ustr),
    /// String literal, already unescaped
    Str(String),
    /// `let pat [: anno] = init body`
    Let {
        binder: ConcretePtr,
        anno: Option<ConcretePtr>,
        init: ConcretePtr,
        body: ConcretePtr,
        scope: Span,
    },
    /// `fun name(params) [-> result] = body next`
    LetFun {
        name: WithSpan<Ustr>,
        params: Box<[Param]>,
        result: Option<ConcretePtr>,
        body: ConcretePtr,
        next: ConcretePtr,
        scope: Span,
    },
    /// `fun(params) -> result` without a body, or a function literal with one
    Fun {
        params: Box<[Param]>,
        result: Option<ConcretePtr>,
        body: Option<ConcretePtr>,
    },
    Call {
        func: ConcretePtr,
        args: Box<[ConcretePtr]>,
    },
    /// `{ a : A, ... }`
    Record { fields: Box<[Field]> },
    /// `{ a = e, ... }`, and `{}`
    RecordOf { fields: Box<[Field]> },
    Access {
        record: ConcretePtr,
        field: WithSpan<Ustr>,
    },
    /// `x : A @ P`
    Refine {
        binder: ConcretePtr,
        base: ConcretePtr,
        predicate: ConcretePtr,
        scope: Span,
    },
    If {
        cond: ConcretePtr,
        then_branch: ConcretePtr,
        else_branch: ConcretePtr,
    },
    /// `e : T`
    Anno {
        target: ConcretePtr,
        ty: ConcretePtr,
    },
    /// Placeholder for unparsable input; already diagnosed
    Err(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub binder: ConcretePtr,
    pub ty: Option<ConcretePtr>,
    /// Where the parameter name is visible.
    pub scope: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: WithSpan<Ustr>,
    pub value: ConcretePtr,
}

#[derive(Debug, Clone)]
pub struct ParseResult {
    pub term: ConcretePtr,
    pub line_starts: Vec<usize>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Binding powers shared by the parser and the pretty printer.
pub mod prec {
    pub const PREFIX: u16 = 0;
    pub const ANNO: u16 = 10;
    pub const FUN: u16 = 50;
    pub const ACCESS: u16 = 300;
    pub const CALL: u16 = 500;
}
