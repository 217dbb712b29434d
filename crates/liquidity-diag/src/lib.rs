//! Error reporting and diagnostics for the Liquidity toolchain.
//!
//! Every error that leaves a pass carries a [`Location`] and a human
//! readable message. Passes raise their own `thiserror` types and convert
//! them into [`Diagnostic`]s for rendering.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Diagnostic severity and categories
// ---------------------------------------------------------------------------

/// How severe a diagnostic is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    Error,
    Warning,
}

/// Broad category for diagnostics. Used for filtering and grouping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    /// Malformed or ill-typed construct found while checking a contract.
    TypeError,
    /// A type, contract type, field or constructor is not in scope.
    UndefinedName,
    /// A primitive name is not part of the built-in vocabulary.
    UnknownPrimitive,
    /// Qualified lifting of a nested contract's types failed.
    Lift,
    /// The expression compiler cannot translate a construct.
    Compile,
    /// The instruction stream does not balance under symbolic execution.
    Decompile,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::TypeError,
        Category::UndefinedName,
        Category::UnknownPrimitive,
        Category::Lift,
        Category::Compile,
        Category::Decompile,
    ];

    pub fn all() -> &'static [Category] {
        &Self::ALL
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Category::TypeError => "type_error",
            Category::UndefinedName => "undefined_name",
            Category::UnknownPrimitive => "unknown_primitive",
            Category::Lift => "lift",
            Category::Compile => "compile",
            Category::Decompile => "decompile",
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            Category::TypeError => "L0001",
            Category::UndefinedName => "L0002",
            Category::UnknownPrimitive => "L0003",
            Category::Lift => "L0004",
            Category::Compile => "L0101",
            Category::Decompile => "L0201",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Category::TypeError => "A construct is malformed or does not have the expected type.",
            Category::UndefinedName => "A referenced type, contract, field or constructor is undefined.",
            Category::UnknownPrimitive => "A primitive name is not part of the built-in vocabulary.",
            Category::Lift => "A nested contract's types could not be qualified.",
            Category::Compile => "An expression cannot be translated to stack instructions.",
            Category::Decompile => {
                "An instruction stream does not balance under symbolic execution."
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Source locations
// ---------------------------------------------------------------------------

/// A line/column position. Lines and columns are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub column: u32,
}

impl Position {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

/// A file identifier plus an optional start/end range.
///
/// Locations never affect semantics: two expressions that differ only in
/// location compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub file: String,
    pub range: Option<(Position, Position)>,
}

impl Location {
    pub fn new(file: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            range: None,
        }
    }

    pub fn at(file: impl Into<String>, start: Position, end: Position) -> Self {
        Self {
            file: file.into(),
            range: Some((start, end)),
        }
    }

    /// Location for values synthesized by a pass rather than read from a file.
    pub fn unknown() -> Self {
        Self::new("<unknown>")
    }

    pub fn is_unknown(&self) -> bool {
        self.range.is_none() && self.file == "<unknown>"
    }
}

impl Default for Location {
    fn default() -> Self {
        Self::unknown()
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.range {
            None => write!(f, "{}", self.file),
            Some((start, end)) if start.line == end.line => write!(
                f,
                "{}:{}.{}-{}",
                self.file, start.line, start.column, end.column
            ),
            Some((start, end)) => write!(
                f,
                "{}:{}.{}-{}.{}",
                self.file, start.line, start.column, end.line, end.column
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Diagnostic
// ---------------------------------------------------------------------------

/// A structured diagnostic message.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    /// Stable diagnostic code (e.g. L0001).
    pub code: Option<String>,
    pub severity: Severity,
    pub category: Category,
    /// Primary message: what went wrong.
    pub message: String,
    /// Where it went wrong.
    pub location: Option<Location>,
    /// Suggested fix, if any.
    pub help: Option<String>,
}

impl Diagnostic {
    pub fn error(category: Category, message: impl Into<String>) -> Self {
        Self {
            code: Some(category.code().to_string()),
            severity: Severity::Error,
            category,
            message: message.into(),
            location: None,
            help: None,
        }
    }

    pub fn warning(category: Category, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::error(category, message)
        }
    }

    pub fn at(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        if let Some(location) = &self.location {
            write!(f, "{location}: ")?;
        }
        if let Some(code) = &self.code {
            write!(f, "{prefix}[{code}]: {}", self.message)?;
        } else {
            write!(f, "{prefix}: {}", self.message)?;
        }
        if let Some(help) = &self.help {
            write!(f, "\n  help: {help}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Error types shared by the passes
// ---------------------------------------------------------------------------

/// Error type wrapping one or more diagnostics.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{}", .0.first().map(|d| d.to_string()).unwrap_or_default())]
pub struct DiagnosticError(pub Vec<Diagnostic>);

impl DiagnosticError {
    pub fn single(diag: Diagnostic) -> Self {
        Self(vec![diag])
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.0
    }
}

/// A malformed or ill-typed construct, reported at its location.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{location}: {message}")]
pub struct LocatedError {
    pub location: Location,
    pub message: String,
}

impl LocatedError {
    pub fn new(location: Location, message: impl Into<String>) -> Self {
        Self {
            location,
            message: message.into(),
        }
    }

    pub fn to_diagnostic(&self) -> Diagnostic {
        Diagnostic::error(Category::TypeError, self.message.clone()).at(self.location.clone())
    }
}

/// The namespace a failed lookup was performed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolKind {
    Type,
    ContractType,
    Field,
    Constructor,
    Primitive,
    FoldPrimitive,
    MapPrimitive,
    MapFoldPrimitive,
}

impl fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SymbolKind::Type => "type",
            SymbolKind::ContractType => "contract type",
            SymbolKind::Field => "record field",
            SymbolKind::Constructor => "constructor",
            SymbolKind::Primitive => "primitive",
            SymbolKind::FoldPrimitive => "fold primitive",
            SymbolKind::MapPrimitive => "map primitive",
            SymbolKind::MapFoldPrimitive => "map-fold primitive",
        };
        f.write_str(s)
    }
}

/// An unresolved name, either in the environment chain or in one of the
/// primitive tables.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} `{name}` not found")]
pub struct NotFound {
    pub kind: SymbolKind,
    pub name: String,
}

impl NotFound {
    pub fn new(kind: SymbolKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    /// Attach the location of the construct that performed the lookup.
    pub fn at(&self, location: Location) -> Diagnostic {
        let category = match self.kind {
            SymbolKind::Primitive
            | SymbolKind::FoldPrimitive
            | SymbolKind::MapPrimitive
            | SymbolKind::MapFoldPrimitive => Category::UnknownPrimitive,
            SymbolKind::Type
            | SymbolKind::ContractType
            | SymbolKind::Field
            | SymbolKind::Constructor => Category::UndefinedName,
        };
        Diagnostic::error(category, self.to_string()).at(location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc() -> Location {
        Location::at("token.liq", Position::new(3, 5), Position::new(3, 12))
    }

    #[test]
    fn diagnostic_builder() {
        let diag = Diagnostic::error(Category::TypeError, "Expected int, got nat")
            .at(loc())
            .with_help("Use `int x` to convert");

        assert_eq!(diag.severity, Severity::Error);
        assert_eq!(diag.code.as_deref(), Some("L0001"));
        assert_eq!(diag.category, Category::TypeError);
        assert!(diag.message.contains("Expected int"));
        assert!(diag.help.unwrap().contains("int x"));
    }

    #[test]
    fn diagnostic_display_includes_location() {
        let diag = Diagnostic::error(Category::Decompile, "stack underflow").at(loc());
        assert_eq!(
            diag.to_string(),
            "token.liq:3.5-12: error[L0201]: stack underflow"
        );
    }

    #[test]
    fn location_display_forms() {
        assert_eq!(Location::new("a.liq").to_string(), "a.liq");
        let multi = Location::at("a.liq", Position::new(1, 2), Position::new(4, 1));
        assert_eq!(multi.to_string(), "a.liq:1.2-4.1");
        assert!(Location::unknown().is_unknown());
        assert!(!loc().is_unknown());
    }

    #[test]
    fn not_found_maps_to_category() {
        let err = NotFound::new(SymbolKind::Primitive, "Map.frob");
        assert_eq!(err.to_string(), "primitive `Map.frob` not found");
        assert_eq!(err.at(loc()).category, Category::UnknownPrimitive);

        let err = NotFound::new(SymbolKind::Field, "owner");
        assert_eq!(err.at(loc()).category, Category::UndefinedName);
    }

    #[test]
    fn located_error_display() {
        let err = LocatedError::new(loc(), "bad storage type");
        assert_eq!(err.to_string(), "token.liq:3.5-12: bad storage type");
        assert_eq!(err.to_diagnostic().location, Some(loc()));
    }

    #[test]
    fn category_metadata_is_stable_and_unique() {
        let mut codes = std::collections::BTreeSet::new();
        for cat in Category::all() {
            assert!(!cat.as_str().is_empty());
            assert!(!cat.description().is_empty());
            assert!(
                codes.insert(cat.code()),
                "duplicate diagnostic code detected: {}",
                cat.code()
            );
        }
    }
}
