//! Structured compile diagnostics. Every user-facing failure carries a stable
//! kind tag, a source span, and a rendered message; internal invariant
//! violations are reported separately from user errors so defects in the
//! compiler are never blamed on the input program.

use colored::Colorize;
use strum::IntoStaticStr;

use crate::frontend::{SourceMap, Span};

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "kebab-case")]
pub enum DiagnosticKind {
    /// The source failed to tokenize or parse
    Syntax,
    /// The source uses a construct the compiler rejects outright
    UnsupportedConstruct,
    /// A non-scalar read with other than exactly one reaching definition
    AmbiguousDefinition,
    /// Non-concrete type in a layout position, failed generic inference,
    /// illegal instance relationships, rejected recursion
    TypeResolution,
    /// A stream or persisted layout changed incompatibly
    LayoutCompatibility,
    /// A storage class was accessed from a callback not permitted to do so
    InvalidAccess,
    /// The compiler's own invariants were violated; a defect, not a user error
    InternalInvariant,
    Warning,
}

impl DiagnosticKind {
    pub fn tag(self) -> &'static str {
        self.into()
    }

    pub fn is_fatal(self) -> bool {
        !matches!(self, DiagnosticKind::Warning)
    }
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub message: String,
    pub span: Option<Span>,
    /// Secondary locations, e.g. the conflicting definition sites of an
    /// ambiguous variable
    pub related: Vec<(String, Span)>,
    #[cfg(feature = "error-backtrace")]
    pub backtrace: Option<String>,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, span: Option<Span>, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            span,
            related: Vec::new(),
            #[cfg(feature = "error-backtrace")]
            backtrace: match kind {
                DiagnosticKind::InternalInvariant => {
                    Some(std::backtrace::Backtrace::force_capture().to_string())
                }
                _ => None,
            },
        }
    }

    pub fn spanned(kind: DiagnosticKind, span: Span, message: impl Into<String>) -> Self {
        Self::new(kind, Some(span), message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(DiagnosticKind::InternalInvariant, None, message)
    }

    pub fn with_related(mut self, message: impl Into<String>, span: Span) -> Self {
        self.related.push((message.into(), span));
        self
    }

    pub fn render(&self, sources: &SourceMap) -> String {
        use core::fmt::Write;

        let mut out = String::new();

        let heading = match self.kind {
            DiagnosticKind::Warning => format!("warning[{}]", self.kind.tag()).yellow().bold(),
            DiagnosticKind::InternalInvariant => {
                format!("internal compiler error[{}]", self.kind.tag())
                    .red()
                    .bold()
            }
            _ => format!("error[{}]", self.kind.tag()).red().bold(),
        };

        let _ = writeln!(out, "{heading}: {}", self.message.bold());

        if let Some(span) = self.span {
            render_span(&mut out, sources, span);
        }

        for (message, span) in &self.related {
            let _ = writeln!(out, "  {}: {message}", "note".cyan().bold());
            render_span(&mut out, sources, *span);
        }

        #[cfg(feature = "error-backtrace")]
        if let Some(backtrace) = &self.backtrace {
            let _ = writeln!(out, "{}", "compiler backtrace:".dimmed());
            let _ = writeln!(out, "{}", backtrace.dimmed());
        }

        out
    }
}

fn render_span(out: &mut String, sources: &SourceMap, span: Span) {
    use core::fmt::Write;

    let file = sources.file(span.source);
    let row = file.row_for_position(span.start);
    let column = file.column_for_position(span.start);
    let line = file.line_text_for_position(span.start);

    let _ = writeln!(
        out,
        "  {} {}:{row}:{column}",
        "-->".cyan().bold(),
        file.origin
    );
    let _ = writeln!(out, "   {}", "|".cyan().bold());
    let _ = writeln!(out, "   {} {line}", "|".cyan().bold());

    let remaining = line.len().saturating_sub(column - 1).max(1);
    let caret_width = (span.end - span.start).max(1).min(remaining);
    let _ = writeln!(
        out,
        "   {} {}{}",
        "|".cyan().bold(),
        " ".repeat(column - 1),
        "^".repeat(caret_width).red().bold()
    );
}

/// Accumulates diagnostics across every unit of one compiler run. A fatal
/// diagnostic aborts its own unit; the driver keeps collecting from the rest.
#[derive(Debug, Default)]
pub struct Diagnostics {
    diagnostics: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic);
    }

    pub fn extend(&mut self, other: Diagnostics) {
        self.diagnostics.extend(other.diagnostics);
    }

    pub fn warn(&mut self, span: Option<Span>, message: impl Into<String>) {
        self.push(Diagnostic::new(DiagnosticKind::Warning, span, message));
    }

    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(|d| d.kind.is_fatal())
    }

    pub fn error_count(&self) -> usize {
        self.diagnostics.iter().filter(|d| d.kind.is_fatal()).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter()
    }

    pub fn into_vec(self) -> Vec<Diagnostic> {
        self.diagnostics
    }
}

/// The result type threaded through every stage of a single compilation unit
pub type CompileResult<T> = Result<T, Diagnostic>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags_are_stable() {
        assert_eq!(DiagnosticKind::AmbiguousDefinition.tag(), "ambiguous-definition");
        assert_eq!(DiagnosticKind::UnsupportedConstruct.tag(), "unsupported-construct");
        assert_eq!(DiagnosticKind::LayoutCompatibility.tag(), "layout-compatibility");
        assert_eq!(DiagnosticKind::InternalInvariant.tag(), "internal-invariant");
    }

    #[test]
    fn warnings_are_not_fatal() {
        let mut diagnostics = Diagnostics::new();
        diagnostics.warn(None, "unused archetype");

        assert!(!diagnostics.has_errors());
        assert_eq!(diagnostics.error_count(), 0);
    }
}
