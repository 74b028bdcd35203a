//! Compiler diagnostics.
//!
//! Front-end errors never unwind through the host: every pass appends
//! `CompilerError`s to the `ErrorList` owned by the compilation unit and
//! keeps going where it can, so one compile surfaces as many diagnostics as
//! possible. The caller checks `has_fatal_errors()` between passes;
//! code generation only runs on a unit with no fatal entries.

use codespan_reporting::diagnostic::{Diagnostic, Label, Severity};
use codespan_reporting::files::SimpleFile;
use codespan_reporting::term;
use codespan_reporting::term::termcolor::{ColorChoice, StandardStream};
use thiserror::Error;

use crate::parser::token::Span;

/// Severity of a diagnostic entry.
///
/// Only `Fatal` entries abort compilation; everything else is reported and
/// compilation continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorLevel {
    Info,
    Warning,
    Error,
    Fatal,
}

/// Every diagnostic the compiler can produce.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ErrorMessage {
    // Lexical
    #[error("Unexpected character '{ch}'")]
    UnexpectedCharacter { ch: char },

    #[error("Unterminated string literal")]
    UnterminatedString,

    // Syntax
    #[error("Expected {expected}, found '{found}'")]
    UnexpectedToken { expected: String, found: String },

    #[error("Expected an expression, found '{found}'")]
    ExpectedExpression { found: String },

    // Semantic
    #[error("'{name}' is not declared in this scope")]
    UndeclaredIdentifier { name: String },

    #[error("'{name}' is already declared in this scope")]
    AlreadyDeclared { name: String },

    #[error("'{name}' is not a data member of type '{ty}'")]
    NotADataMember { name: String, ty: String },

    #[error("Type '{ty}' is not callable")]
    NotCallable { ty: String },

    #[error("Wrong number of arguments: expected {expected}, got {got}")]
    InvalidArgsCount { expected: usize, got: usize },

    #[error("Type mismatch: expected '{expected}', got '{got}'")]
    MismatchedTypes { expected: String, got: String },

    #[error("Return type '{got}' does not match declared return type '{expected}'")]
    MismatchedReturnType { expected: String, got: String },

    #[error("Function returns incompatible types '{first}' and '{second}'; \
             add an explicit return type annotation")]
    MultipleReturnTypes { first: String, second: String },

    #[error("'{name}' is not a type")]
    NotAType { name: String },

    #[error("Type '{name}' expects {expected} generic argument(s), got {got}")]
    GenericArgCount {
        name: String,
        expected: usize,
        got: usize,
    },

    #[error("Cannot cast from '{from}' to '{to}'")]
    InvalidCast { from: String, to: String },

    #[error("Array size must be a constant integer")]
    ArraySizeNotConstant,

    #[error("Type '{name}' cannot be instantiated with 'new'")]
    NotInstantiable { name: String },

    #[error("'class' declarations are only allowed at module scope")]
    IllegalClassDeclaration,

    #[error("Cannot assign to constant '{name}'")]
    CannotAssignConst { name: String },

    #[error("Invalid assignment target")]
    InvalidAssignTarget,

    #[error("'break' outside of a loop")]
    IllegalBreak,

    #[error("'continue' outside of a loop")]
    IllegalContinue,

    #[error("'yield' outside of a generator function")]
    IllegalYield,

    #[error("Internal compiler error: {detail}")]
    InternalError { detail: String },
}

/// A single diagnostic with its severity and source location.
#[derive(Debug, Clone, PartialEq)]
pub struct CompilerError {
    pub level: ErrorLevel,
    pub message: ErrorMessage,
    pub span: Span,
}

/// Ordered collection of diagnostics for one compilation unit.
#[derive(Debug, Default, Clone)]
pub struct ErrorList {
    errors: Vec<CompilerError>,
}

impl ErrorList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, level: ErrorLevel, message: ErrorMessage, span: Span) {
        self.errors.push(CompilerError {
            level,
            message,
            span,
        });
    }

    /// Convenience for the common fatal case.
    pub fn add_fatal(&mut self, message: ErrorMessage, span: Span) {
        self.add(ErrorLevel::Fatal, message, span);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn has_fatal_errors(&self) -> bool {
        self.errors.iter().any(|e| e.level == ErrorLevel::Fatal)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CompilerError> {
        self.errors.iter()
    }

    /// Sort diagnostics by source position for stable reporting.
    pub fn sort(&mut self) {
        self.errors
            .sort_by_key(|e| (e.span.start, e.span.end, e.level));
    }

    /// Render every diagnostic to stderr with source labels.
    pub fn report(&self, file_name: &str, source: &str) {
        let file = SimpleFile::new(file_name, source);
        let writer = StandardStream::stderr(ColorChoice::Auto);
        let config = term::Config::default();

        for error in &self.errors {
            let severity = match error.level {
                ErrorLevel::Info => Severity::Note,
                ErrorLevel::Warning => Severity::Warning,
                ErrorLevel::Error | ErrorLevel::Fatal => Severity::Error,
            };
            let diagnostic = Diagnostic::new(severity)
                .with_message(error.message.to_string())
                .with_labels(vec![Label::primary((), error.span.start..error.span.end)]);
            // Reporting failures (e.g. closed stderr) are not compile errors.
            let _ = term::emit(&mut writer.lock(), &config, &file, &diagnostic);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_detection() {
        let mut list = ErrorList::new();
        assert!(!list.has_fatal_errors());

        list.add(
            ErrorLevel::Warning,
            ErrorMessage::IllegalYield,
            Span::synthetic(),
        );
        assert!(!list.has_fatal_errors());

        list.add_fatal(
            ErrorMessage::UndeclaredIdentifier { name: "x".into() },
            Span::synthetic(),
        );
        assert!(list.has_fatal_errors());
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_sort_orders_by_position() {
        let mut list = ErrorList::new();
        list.add_fatal(ErrorMessage::IllegalBreak, Span::new(10, 12, 2, 1));
        list.add_fatal(ErrorMessage::IllegalContinue, Span::new(0, 4, 1, 1));
        list.sort();
        let spans: Vec<usize> = list.iter().map(|e| e.span.start).collect();
        assert_eq!(spans, vec![0, 10]);
    }

    #[test]
    fn test_message_formatting() {
        let msg = ErrorMessage::MismatchedTypes {
            expected: "int".into(),
            got: "string".into(),
        };
        assert_eq!(
            msg.to_string(),
            "Type mismatch: expected 'int', got 'string'"
        );
    }
}
