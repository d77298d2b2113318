//! Diagnostics raised while assembling.
//!
//! A diagnostic is data, not control flow: it is attached to a source
//! location and collected. Only a `Fatal` diagnostic stops an assembly.
use serde::Serialize;
use std::fmt;

/// A position in the source, one-based on both axes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Default, Serialize)]
pub struct Locale {
    pub line: usize,
    pub column: usize,
}

impl Locale {
    pub fn new(line: usize, column: usize) -> Self {
        Locale { line, column }
    }

    /// The same line, `offset` columns further right.
    pub fn offset(&self, offset: usize) -> Self {
        Locale { line: self.line, column: self.column + offset }
    }
}

impl fmt::Display for Locale {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize)]
pub enum Level {
    Fatal,
    Error,
    Duplicate,
    Form,
    Quote,
    Relocation,
    Truncation,
    Value,
}

impl Level {
    /// One-letter tag used in listings.
    pub fn indicator(&self) -> char {
        match self {
            Level::Fatal => 'F',
            Level::Error => 'E',
            Level::Duplicate => 'D',
            Level::Form => 'O',
            Level::Quote => 'Q',
            Level::Relocation => 'R',
            Level::Truncation => 'T',
            Level::Value => 'V',
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize)]
pub struct Diagnostic {
    pub level: Level,
    pub locale: Locale,
    pub message: String,
}

impl Diagnostic {
    pub fn new<S: Into<String>>(level: Level, locale: Locale, message: S) -> Self {
        Diagnostic { level, locale, message: message.into() }
    }

    pub fn fatal<S: Into<String>>(locale: Locale, message: S) -> Self {
        Diagnostic::new(Level::Fatal, locale, message)
    }

    pub fn error<S: Into<String>>(locale: Locale, message: S) -> Self {
        Diagnostic::new(Level::Error, locale, message)
    }

    pub fn duplicate(locale: Locale, label: &str) -> Self {
        Diagnostic::new(Level::Duplicate, locale, format!("Duplicate label {}", label))
    }

    pub fn form(locale: Locale) -> Self {
        Diagnostic::new(Level::Form, locale, "Form mismatch")
    }

    pub fn quote<S: Into<String>>(locale: Locale, message: S) -> Self {
        Diagnostic::new(Level::Quote, locale, message)
    }

    pub fn relocation(locale: Locale) -> Self {
        Diagnostic::new(Level::Relocation, locale, "Relocation incompatibility")
    }

    pub fn truncation<S: Into<String>>(locale: Locale, message: S) -> Self {
        Diagnostic::new(Level::Truncation, locale, message)
    }

    pub fn value<S: Into<String>>(locale: Locale, message: S) -> Self {
        Diagnostic::new(Level::Value, locale, message)
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}: {}", self.level.indicator(), self.locale, self.message)
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize)]
pub struct Diagnostics {
    list: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Diagnostics { list: Vec::new() }
    }

    pub fn append(&mut self, diagnostic: Diagnostic) {
        self.list.push(diagnostic);
    }

    pub fn extend(&mut self, other: Diagnostics) {
        self.list.extend(other.list);
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn has_fatal(&self) -> bool {
        self.list.iter().any(|d| d.level == Level::Fatal)
    }

    pub fn count(&self, level: Level) -> usize {
        self.list.iter().filter(|d| d.level == level).count()
    }

    pub fn iter(&self) -> std::slice::Iter<Diagnostic> {
        self.list.iter()
    }

    /// Diagnostics attached to one source line, in the order they were raised.
    pub fn for_line(&self, line: usize) -> Vec<&Diagnostic> {
        self.list.iter().filter(|d| d.locale.line == line).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts() {
        let mut diags = Diagnostics::new();
        diags.append(Diagnostic::error(Locale::new(1, 1), "bad"));
        diags.append(Diagnostic::truncation(Locale::new(2, 5), "cut"));
        diags.append(Diagnostic::error(Locale::new(2, 9), "worse"));
        assert_eq!(diags.len(), 3);
        assert_eq!(diags.count(Level::Error), 2);
        assert!(!diags.has_fatal());
        assert_eq!(diags.for_line(2).len(), 2);

        diags.append(Diagnostic::fatal(Locale::new(3, 1), "stop"));
        assert!(diags.has_fatal());
    }

    #[test]
    fn test_display() {
        let diag = Diagnostic::quote(Locale::new(4, 12), "Unterminated string");
        assert_eq!(diag.to_string(), "Q 4:12: Unterminated string");
    }
}
