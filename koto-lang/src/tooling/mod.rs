//! Editor-facing queries over an elaborated document.

use std::sync::Arc;

use rustc_hash::FxHashMapRand;
use tracing::{debug, trace};
use ustr::Ustr;

use crate::{
    ElaborateResult, Error, ParseResult, Result, elaborate, parse,
    util::{Diagnostic, IntervalMap, Severity, Span},
};

/// Zero-based line and byte column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Position {
    pub line: usize,
    pub character: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

pub fn offset_to_position(line_starts: &[usize], offset: usize) -> Position {
    let line = line_starts
        .partition_point(|&start| start <= offset)
        .saturating_sub(1);
    let start = line_starts.get(line).copied().unwrap_or(0);
    Position {
        line,
        character: offset - start.min(offset),
    }
}

pub fn span_to_range(line_starts: &[usize], span: Span) -> Range {
    Range {
        start: offset_to_position(line_starts, span.start),
        end: offset_to_position(line_starts, span.end),
    }
}

/// Positions past the last line map to the end of `text`.
pub fn position_to_offset(line_starts: &[usize], text: &str, position: Position) -> usize {
    match line_starts.get(position.line) {
        Some(start) => (start + position.character).min(text.len()),
        None => text.len(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentDiagnostic {
    pub range: Range,
    pub message: String,
    pub severity: Severity,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionItem {
    pub label: Ustr,
    /// ` : T`
    pub detail: String,
}

#[derive(Debug)]
pub struct Document {
    text: String,
    parsed: ParseResult,
    elaborated: ElaborateResult,
    /// Index into the combined diagnostics, later ones on top.
    covering: IntervalMap<usize, usize>,
}

impl Document {
    pub fn new(text: String) -> Result<Self> {
        let parsed = parse(&text);
        let elaborated = elaborate(&parsed)?;
        let mut covering = IntervalMap::new();
        for (index, diagnostic) in parsed
            .diagnostics
            .iter()
            .chain(&elaborated.diagnostics)
            .enumerate()
        {
            covering.set(diagnostic.span.start..diagnostic.span.end, index);
        }
        Ok(Self {
            text,
            parsed,
            elaborated,
            covering,
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn parse_result(&self) -> &ParseResult {
        &self.parsed
    }

    pub fn elaborate_result(&self) -> &ElaborateResult {
        &self.elaborated
    }

    fn raw_diagnostics(&self) -> impl Iterator<Item = &Diagnostic> {
        self.parsed
            .diagnostics
            .iter()
            .chain(&self.elaborated.diagnostics)
    }

    pub fn offset(&self, position: Position) -> usize {
        position_to_offset(&self.parsed.line_starts, &self.text, position)
    }

    pub fn diagnostics(&self) -> Vec<DocumentDiagnostic> {
        self.raw_diagnostics()
            .map(|diagnostic| DocumentDiagnostic {
                range: span_to_range(&self.parsed.line_starts, diagnostic.span),
                message: diagnostic.message.clone(),
                severity: diagnostic.severity,
            })
            .collect()
    }

    /// Types at `offset`: `⇐` for the expected type, `⇒` for the synthesized
    /// one, `⇔` when both agree on the same span.
    pub fn hover(&self, offset: usize) -> Option<String> {
        let expected = self.elaborated.expected_types.get_leaf(offset);
        let actual = self.elaborated.actual_types.get_leaf(offset);
        let mut lines = match (expected, actual) {
            (None, None) => Vec::new(),
            (Some((_, expected)), None) => vec![format!("⇐ {expected}")],
            (None, Some((_, actual))) => vec![format!("⇒ {actual}")],
            (Some((outer, expected)), Some((inner, actual))) if outer == inner => {
                let (expected, actual) = (expected.to_string(), actual.to_string());
                if expected == actual {
                    vec![format!("⇔ {expected}")]
                } else {
                    vec![format!("⇐ {expected}"), format!("⇒ {actual}")]
                }
            }
            (Some((expected_span, expected)), Some((actual_span, actual))) => {
                if actual_span.contains_span(expected_span) {
                    vec![format!("⇐ {expected}")]
                } else if expected_span.contains_span(actual_span) {
                    vec![format!("⇒ {actual}")]
                } else {
                    vec![format!("⇐ {expected}"), format!("⇒ {actual}")]
                }
            }
        };
        if let Some(diagnostic) = self
            .covering
            .get(offset)
            .and_then(|&index| self.raw_diagnostics().nth(index))
        {
            lines.push(diagnostic.message.clone());
        }
        trace!("hover at {offset}: {lines:?}");
        (!lines.is_empty()).then(|| lines.join("\n"))
    }

    /// Bindings visible at `offset`. A shadowed name keeps its first
    /// position but shows the innermost type.
    pub fn completion(&self, offset: usize) -> Vec<CompletionItem> {
        let mut items: Vec<CompletionItem> = Vec::new();
        let mut positions = FxHashMapRand::default();
        for entry in self.elaborated.scopes.get_all(offset) {
            let item = CompletionItem {
                label: entry.name,
                detail: format!(" : {}", entry.ty),
            };
            match positions.get(&entry.name) {
                Some(&index) => items[index] = item,
                None => {
                    positions.insert(entry.name, items.len());
                    items.push(item);
                }
            }
        }
        items
    }
}

/// Documents by URI, elaborated when they change.
#[derive(Debug, Default)]
pub struct Cache {
    documents: FxHashMapRand<String, Arc<Document>>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, uri: &str, text: String) -> Result<Arc<Document>> {
        debug!("updating {uri}");
        let document = Arc::new(Document::new(text)?);
        self.documents.insert(uri.to_string(), document.clone());
        Ok(document)
    }

    pub fn remove(&mut self, uri: &str) {
        self.documents.remove(uri);
    }

    /// The cached document, or the file behind `uri` read from disk.
    pub fn fetch(&mut self, uri: &str) -> Result<Arc<Document>> {
        if let Some(document) = self.documents.get(uri) {
            return Ok(document.clone());
        }
        let path = uri.strip_prefix("file://").unwrap_or(uri);
        let text = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_string(),
            source,
        })?;
        self.update(uri, text)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn document(text: &str) -> Document {
        _ = tracing_subscriber::fmt::try_init();
        Document::new(text.to_string()).unwrap()
    }

    #[test]
    fn it_maps_offsets_to_positions() {
        let text = "let x = 1\nlet y = 2\r\nx";
        let doc = document(text);
        let starts = &doc.parse_result().line_starts;
        assert_eq!(
            offset_to_position(starts, 14),
            Position {
                line: 1,
                character: 4
            }
        );
        let end = Position {
            line: 2,
            character: 0,
        };
        assert_eq!(doc.offset(end), text.len() - 1);
        assert_eq!(
            span_to_range(starts, Span::new(4, 5)),
            Range {
                start: Position {
                    line: 0,
                    character: 4
                },
                end: Position {
                    line: 0,
                    character: 5
                },
            }
        );
        assert_eq!(
            doc.offset(Position {
                line: 9,
                character: 0
            }),
            text.len()
        );
    }

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn documents_are_shared_across_threads() {
        assert_send_sync::<Document>();
        assert_send_sync::<Cache>();
        let mut cache = Cache::new();
        let text = "let id = fun(t : type, x) -> t = x id(int64, 3)";
        let doc = cache.update("file:///shared.koto", text.to_string()).unwrap();
        let hovers = std::thread::scope(|scope| {
            let handles = (0..4)
                .map(|_| scope.spawn(|| doc.hover(4)))
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .collect::<Vec<_>>()
        });
        assert!(hovers.iter().all(|hover| *hover == hovers[0]), "{hovers:?}");
        let hover = hovers[0].as_deref().unwrap_or_default();
        assert!(hover.contains("fun(t : type, x : t) -> t"), "{hover}");
    }

    #[test]
    fn it_reports_parse_then_elaboration_diagnostics() {
        let doc = document("let x = y x )");
        let diagnostics = doc.diagnostics();
        assert_eq!(diagnostics.len(), 2);
        assert!(diagnostics[0].message.starts_with("Expected end of input"));
        assert_eq!(diagnostics[1].message, "Unknown identifier `y`");
        assert_eq!(diagnostics[1].severity, Severity::Error);
        assert_eq!(diagnostics[1].range.start.character, 8);
    }

    #[test]
    fn it_hovers_over_types() {
        let doc = document("let x : int64 = 1 x");
        assert_eq!(doc.hover(16).as_deref(), Some("⇔ int64"));
        assert_eq!(doc.hover(18).as_deref(), Some("⇒ int64"));
        assert_eq!(doc.hover(8).as_deref(), Some("⇔ type"));
        assert_eq!(doc.hover(4).as_deref(), Some("⇒ int64"));
        assert_eq!(doc.hover(1000), None);
    }

    #[test]
    fn it_hovers_over_mismatches() {
        let doc = document("let x : bool = 1 x");
        assert_eq!(
            doc.hover(15).as_deref(),
            Some("⇐ bool\n⇒ int64\nType mismatch: expected `bool`, but found `int64`")
        );
    }

    #[test]
    fn it_completes_visible_bindings() {
        let text = "let a = 1 let b = true fun(c : int64) -> int64";
        let doc = document(text);
        let items = doc.completion(text.len() - 1);
        let labels = items
            .iter()
            .map(|item| format!("{}{}", item.label, item.detail))
            .collect::<Vec<_>>();
        assert_eq!(labels, vec!["a : int64", "b : bool", "c : int64"]);
    }

    #[test]
    fn inner_bindings_win_completion() {
        let text = "let x = 1 let y = 2 let x = true x";
        let items = document(text).completion(text.len() - 1);
        let labels = items
            .iter()
            .map(|item| format!("{}{}", item.label, item.detail))
            .collect::<Vec<_>>();
        assert_eq!(labels, vec!["x : bool", "y : int64"]);
    }

    #[test]
    fn it_caches_documents() {
        let mut cache = Cache::new();
        let first = cache.update("file:///virtual.koto", "1".to_string()).unwrap();
        let again = cache.fetch("file:///virtual.koto").unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        cache.remove("file:///virtual.koto");
        assert!(matches!(
            cache.fetch("file:///virtual.koto"),
            Err(Error::Io { .. })
        ));
    }

    #[test]
    fn it_loads_missing_documents_from_disk() {
        let path = std::env::temp_dir().join(format!("koto-cache-{}.koto", std::process::id()));
        std::fs::write(&path, "let x = 1 x").unwrap();
        let uri = format!("file://{}", path.display());
        let document = Cache::new().fetch(&uri).unwrap();
        assert_eq!(document.text(), "let x = 1 x");
        assert!(document.diagnostics().is_empty());
        std::fs::remove_file(&path).unwrap();
    }
}
