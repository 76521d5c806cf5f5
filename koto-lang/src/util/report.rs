//! Terminal rendering of diagnostics.

use ariadne::{Color, Config, Label, Report, ReportKind, Source};

use super::{Diagnostic, Severity};

/// Renders `diagnostics` against `text`, errors before warnings.
pub fn render(text: &str, diagnostics: &[Diagnostic], color: bool) -> String {
    let mut buffer = Vec::new();
    let ordered = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .chain(diagnostics.iter().filter(|d| d.severity == Severity::Warning));
    for diagnostic in ordered {
        let (kind, label_color) = match diagnostic.severity {
            Severity::Error => (ReportKind::Error, Color::Red),
            Severity::Warning => (ReportKind::Warning, Color::Yellow),
        };
        // ariadne needs a span inside the source to place the label.
        let start = diagnostic.span.start.min(text.len());
        let end = diagnostic.span.end.clamp(start, text.len());
        let report = Report::build(kind, start..end)
            .with_config(Config::default().with_color(color))
            .with_message(&diagnostic.message)
            .with_label(
                Label::new(start..end)
                    .with_message(&diagnostic.message)
                    .with_color(label_color),
            )
            .finish();
        if let Err(error) = report.write(Source::from(text), &mut buffer) {
            tracing::error!("failed to render diagnostic: {error}");
        }
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
