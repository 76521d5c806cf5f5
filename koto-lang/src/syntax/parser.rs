//! Parser combinators over the token stream.
//!
//! Every required position recovers, so a document always produces a tree.
//! Nodes made up of no tokens sit right after the token before them, which
//! keeps every span inside the span of its parent.

use std::sync::Arc;

use chumsky::{
    error::{RichPattern, RichReason},
    prelude::*,
};
use ustr::{Ustr, ustr};

use super::{
    Concrete, ConcretePtr, Field, Param, ParseResult,
    lexer::{Token, lex, line_starts},
    prec,
};
use crate::util::{Diagnostic, Span, WithSpan};

type Tokens<'a> = &'a [Token];

type Extra<'a> = extra::Err<Rich<'a, Token>>;

/// Binder, optional type, and where the declaration ends.
type ParamSyntax = (ConcretePtr, Option<ConcretePtr>, usize);

/// Separator kind (`:` for types) and position of a record field.
type Separator = Option<(bool, SimpleSpan)>;

fn node(concrete: Concrete, span: Span) -> ConcretePtr {
    Arc::new(WithSpan(concrete, span))
}

#[derive(Clone, Copy)]
struct Source<'a> {
    text: &'a str,
    tokens: &'a [Token],
    spans: &'a [Span],
}

impl<'a> Source<'a> {
    /// Byte range covered by a range of tokens.
    fn span(self, range: SimpleSpan) -> Span {
        let start = range.start.min(self.spans.len());
        let end = range.end.min(self.spans.len());
        if end > start {
            Span::new(self.spans[start].start, self.spans[end - 1].end)
        } else {
            let offset = start.checked_sub(1).map_or(0, |before| self.spans[before].end);
            Span::empty(offset)
        }
    }

    /// Where a diagnostic points: the tokens it covers, the token found at
    /// an empty range, or the end of input.
    fn error_span(self, range: SimpleSpan) -> Span {
        match self.spans.get(range.start) {
            Some(_) if range.end > range.start => self.span(range),
            Some(span) => *span,
            None => Span::empty(self.text.len()),
        }
    }

    fn text(self, range: SimpleSpan) -> &'a str {
        let span = self.span(range);
        &self.text[span.start..span.end]
    }

    fn name(self, range: SimpleSpan) -> WithSpan<Ustr> {
        WithSpan(ustr(self.text(range)), self.span(range))
    }

    fn found(self, index: usize) -> &'static str {
        self.tokens
            .get(index)
            .map_or("end of input", |token| token.describe())
    }

    fn diagnostic(self, error: &Rich<'_, Token>) -> Diagnostic {
        let message = match error.reason() {
            RichReason::Custom(message) => message.clone(),
            _ => {
                let mut expected = Vec::new();
                for pattern in error.expected() {
                    let pattern = describe(pattern);
                    if !expected.contains(&pattern) {
                        expected.push(pattern);
                    }
                }
                let found = error
                    .found()
                    .map_or("end of input", |token| token.describe());
                format!("Expected {}, found {found}", alternatives(&expected))
            }
        };
        Diagnostic::error(message, self.error_span(*error.span()))
    }
}

fn describe(pattern: &RichPattern<'_, Token>) -> String {
    match pattern {
        RichPattern::Token(token) => token.describe().to_string(),
        RichPattern::Label(label) => label.to_string(),
        RichPattern::EndOfInput => "end of input".to_string(),
        _ => "something else".to_string(),
    }
}

fn alternatives(items: &[String]) -> String {
    match items {
        [] => "something else".to_string(),
        [only] => only.clone(),
        [init @ .., last] => format!("{} or {last}", init.join(", ")),
    }
}

fn close_params(params: Vec<ParamSyntax>, end: usize) -> Box<[Param]> {
    params
        .into_iter()
        .map(|(binder, ty, decl_end)| Param {
            binder,
            ty,
            scope: Span::new(decl_end.min(end), end),
        })
        .collect()
}

/// A token that may be missing; its absence is reported and skipped.
fn expect<'a>(token: Token) -> impl Parser<'a, Tokens<'a>, (), Extra<'a>> + Clone {
    just(token).ignored().recover_with(via_parser(empty()))
}

/// Error node standing in for a missing term. A stray token is consumed
/// unless it can close or continue an enclosing form.
fn missing<'a>(src: Source<'a>) -> impl Parser<'a, Tokens<'a>, ConcretePtr, Extra<'a>> + Clone {
    any()
        .filter(|token: &Token| {
            !matches!(
                token,
                Token::RParen | Token::RBrace | Token::Comma | Token::Then | Token::Else | Token::Eq
            )
        })
        .ignored()
        .or(empty())
        .map_with(move |(), e| node(Concrete::Err("missing term".to_string()), src.span(e.span())))
}

fn required<'a, P>(
    src: Source<'a>,
    parser: P,
) -> impl Parser<'a, Tokens<'a>, ConcretePtr, Extra<'a>> + Clone
where
    P: Parser<'a, Tokens<'a>, ConcretePtr, Extra<'a>> + Clone,
{
    parser
        .labelled("term")
        .recover_with(via_parser(missing(src)))
}

/// `fun(params) [-> result] [= body]`; one of the two tails must be present.
fn function<'a, P, R, B>(
    src: Source<'a>,
    params: P,
    result: R,
    body: B,
) -> impl Parser<'a, Tokens<'a>, ConcretePtr, Extra<'a>> + Clone
where
    P: Parser<'a, Tokens<'a>, Vec<ParamSyntax>, Extra<'a>> + Clone,
    R: Parser<'a, Tokens<'a>, ConcretePtr, Extra<'a>> + Clone,
    B: Parser<'a, Tokens<'a>, Option<ConcretePtr>, Extra<'a>> + Clone,
{
    just(Token::Fun)
        .ignore_then(params)
        .then(
            just(Token::RArrow)
                .ignore_then(required(src, result))
                .or_not(),
        )
        .then(body)
        .map_with(|parts, e| (parts, e.span()))
        .validate(move |(((params, result), body), range), _, emitter| {
            if result.is_none() && body.is_none() {
                let message = format!("Expected `->` or `=`, found {}", src.found(range.end));
                emitter.emit(Rich::custom(SimpleSpan::from(range.end..range.end), message));
            }
            let span = src.span(range);
            node(
                Concrete::Fun {
                    params: close_params(params, span.end),
                    result,
                    body,
                },
                span,
            )
        })
}

fn document<'a>(src: Source<'a>) -> impl Parser<'a, Tokens<'a>, ConcretePtr, Extra<'a>> {
    use chumsky::pratt::*;

    let mut term = Recursive::declare();
    // No annotation at the top level.
    let mut tight = Recursive::declare();
    // Like `tight`, but a function type leaves a following `=` alone.
    let mut bodyless = Recursive::declare();

    let name = just(Token::Ident)
        .to_span()
        .map(move |range| src.name(range));

    let ident = select! {
        Token::Ident = e => e.span(),
        Token::Number = e => e.span()
    }
    .map(move |range| node(Concrete::Ident(ustr(src.text(range))), src.span(range)));

    let string = select! { Token::Str = e => e.span() }.validate(move |range, _, emitter| {
        let span = src.span(range);
        let raw = &src.text[span.start + 1..span.end - 1];
        match unescaper::unescape(raw) {
            Ok(text) => node(Concrete::Str(text), span),
            Err(error) => {
                emitter.emit(Rich::custom(range, format!("Invalid string literal: {error}")));
                node(Concrete::Str(raw.to_string()), span)
            }
        }
    });

    let parenthesized = just(Token::LParen)
        .ignore_then(required(src, term.clone()))
        .then_ignore(expect(Token::RParen));

    // The first separator decides between a record type and a literal.
    let field_value = choice((
        just(Token::Colon)
            .to_span()
            .then(required(src, tight.clone()))
            .map(|(at, value)| (Some((true, at)), value)),
        just(Token::Eq)
            .to_span()
            .then(required(src, term.clone()))
            .map(|(at, value)| (Some((false, at)), value)),
    ))
    .recover_with(via_parser(missing(src).map(|value| (None, value))));
    let record = just(Token::LBrace)
        .ignore_then(
            name.clone()
                .then(field_value)
                .separated_by(just(Token::Comma))
                .allow_trailing()
                .collect::<Vec<(WithSpan<Ustr>, (Separator, ConcretePtr))>>(),
        )
        .then_ignore(expect(Token::RBrace))
        .map_with(|fields, e| (fields, e.span()))
        .validate(move |(fields, range), _, emitter| {
            let is_type = fields
                .first()
                .and_then(|(_, (separator, _))| *separator)
                .is_some_and(|(is_type, _)| is_type);
            let (expected, unexpected) = if is_type {
                (Token::Colon, Token::Eq)
            } else {
                (Token::Eq, Token::Colon)
            };
            let mut checked = Vec::with_capacity(fields.len());
            for (name, (separator, value)) in fields {
                match separator {
                    Some((field_is_type, at)) if field_is_type != is_type => {
                        let message = format!(
                            "Expected {}, found {}",
                            expected.describe(),
                            unexpected.describe()
                        );
                        emitter.emit(Rich::custom(at, message));
                    }
                    _ => (),
                }
                checked.push(Field { name, value });
            }
            let fields = checked.into_boxed_slice();
            let span = src.span(range);
            if is_type {
                node(Concrete::Record { fields }, span)
            } else {
                node(Concrete::RecordOf { fields }, span)
            }
        });

    let atom = choice((ident, string, parenthesized, record));

    let call = {
        let term = term.clone();
        move || {
            postfix(
                prec::CALL,
                just(Token::LParen)
                    .ignore_then(
                        term.clone()
                            .separated_by(just(Token::Comma))
                            .allow_trailing()
                            .collect::<Vec<_>>(),
                    )
                    .then_ignore(expect(Token::RParen)),
                move |func, args: Vec<ConcretePtr>, e| {
                    let args = args.into_boxed_slice();
                    node(Concrete::Call { func, args }, src.span(e.span()))
                },
            )
        }
    };
    let access = {
        let name = name.clone();
        move || {
            postfix(
                prec::ACCESS,
                just(Token::Dot).ignore_then(
                    name.clone()
                        .map(Some)
                        .recover_with(via_parser(empty().to(None))),
                ),
                move |record, field: Option<WithSpan<Ustr>>, e| match field {
                    Some(field) => node(Concrete::Access { record, field }, src.span(e.span())),
                    None => record,
                },
            )
        }
    };
    let annotation = postfix(
        prec::ANNO,
        just(Token::Colon)
            .ignore_then(required(src, tight.clone()))
            .then(
                just(Token::At)
                    .ignore_then(required(src, tight.clone()))
                    .or_not(),
            ),
        move |target, (ty, predicate): (ConcretePtr, Option<ConcretePtr>), e| {
            let span = src.span(e.span());
            match predicate {
                Some(predicate) => {
                    let scope = predicate.span();
                    node(
                        Concrete::Refine {
                            binder: target,
                            base: ty,
                            predicate,
                            scope,
                        },
                        span,
                    )
                }
                None => node(Concrete::Anno { target, ty }, span),
            }
        },
    );

    let operand = atom.clone().pratt((call(), access()));
    let annotated = atom.pratt((call(), access(), annotation));

    let let_form = just(Token::Let)
        .ignore_then(required(src, operand.clone()))
        .then(
            just(Token::Colon)
                .ignore_then(required(src, bodyless.clone()))
                .or_not(),
        )
        .then_ignore(expect(Token::Eq))
        .then(required(src, term.clone()))
        .then(required(src, term.clone()))
        .map_with(move |(((binder, anno), init), body), e| {
            let scope = body.span();
            node(
                Concrete::Let {
                    binder,
                    anno,
                    init,
                    body,
                    scope,
                },
                src.span(e.span()),
            )
        });

    let if_form = just(Token::If)
        .ignore_then(required(src, term.clone()))
        .then_ignore(expect(Token::Then))
        .then(required(src, term.clone()))
        .then_ignore(expect(Token::Else))
        .then(required(src, term.clone()))
        .map_with(move |((cond, then_branch), else_branch), e| {
            node(
                Concrete::If {
                    cond,
                    then_branch,
                    else_branch,
                },
                src.span(e.span()),
            )
        });

    let params = expect(Token::LParen)
        .ignore_then(
            operand
                .clone()
                .then(
                    just(Token::Colon)
                        .ignore_then(required(src, tight.clone()))
                        .or_not(),
                )
                .map_with(move |(binder, ty), e| (binder, ty, src.span(e.span()).end))
                .separated_by(just(Token::Comma))
                .allow_trailing()
                .collect::<Vec<_>>(),
        )
        .then_ignore(expect(Token::RParen));

    // Every span below is closed at one end offset, so scopes never leave
    // the definition.
    let let_fun = just(Token::Fun)
        .ignore_then(name)
        .then(params.clone())
        .then(
            just(Token::RArrow)
                .ignore_then(required(src, bodyless.clone()))
                .or_not(),
        )
        .then_ignore(expect(Token::Eq))
        .then(required(src, term.clone()))
        .then(required(src, term.clone()))
        .map_with(move |((((name, params), result), body), next), e| {
            let span = src.span(e.span());
            let end = span.end.max(body.span().end).max(next.span().end);
            node(
                Concrete::LetFun {
                    params: close_params(params, body.span().end.min(end)),
                    scope: Span::new(name.span().end.min(end), end),
                    name,
                    result,
                    body,
                    next,
                },
                Span::new(span.start, end),
            )
        });

    let with_body = choice((
        let_fun.clone(),
        function(
            src,
            params.clone(),
            tight.clone(),
            just(Token::Eq)
                .ignore_then(required(src, tight.clone()))
                .or_not(),
        ),
    ));
    let without_body = choice((let_fun, function(src, params, bodyless.clone(), empty().to(None))));

    term.define(choice((
        let_form.clone(),
        if_form.clone(),
        with_body.clone(),
        annotated,
    )));
    tight.define(choice((
        let_form.clone(),
        if_form.clone(),
        with_body,
        operand.clone(),
    )));
    bodyless.define(choice((let_form, if_form, without_body, operand)));

    required(src, term)
        .then(any().to_span().repeated().collect::<Vec<_>>())
        .validate(|(term, trailing), _, emitter| {
            if let Some(first) = trailing.first() {
                emitter.emit(Rich::custom(*first, "Expected end of input"));
            }
            term
        })
}

/// Parses a whole document. Never fails: problems become diagnostics and
/// [`Concrete::Err`] nodes.
pub fn parse(text: &str) -> ParseResult {
    let (lexed, mut diagnostics) = lex(text);
    let (tokens, spans): (Vec<Token>, Vec<Span>) = lexed.into_iter().unzip();
    let src = Source {
        text,
        tokens: &tokens,
        spans: &spans,
    };
    let (term, errors) = document(src).parse(&tokens[..]).into_output_errors();
    diagnostics.extend(errors.iter().map(|error| src.diagnostic(error)));
    diagnostics.sort_by_key(|diagnostic| diagnostic.span.start);
    let term = term.unwrap_or_else(|| {
        node(
            Concrete::Err("missing term".to_string()),
            Span::empty(text.len()),
        )
    });
    tracing::debug!(
        tokens = tokens.len(),
        diagnostics = diagnostics.len(),
        "parsed document"
    );
    ParseResult {
        term,
        line_starts: line_starts(text),
        diagnostics,
    }
}
