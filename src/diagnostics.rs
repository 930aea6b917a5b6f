//! Diagnostics produced by the checker.
//!
//! Every error is a rejection found before execution. Components return a
//! bare `BorrowError`; the driver attaches the function and line.

use miette::Diagnostic;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::analysis::borrows::BorrowKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    DuplicateBinding,
    UnknownName,
    UnknownType,
    UseOfMovedValue,
    UseOfUninitialized,
    ConflictingBorrow,
    MovedWhileBorrowed,
    MutabilityViolation,
    DanglingReference,
    AmbiguousLifetime,
    UndeclaredLifetime,
    LifetimeMismatch,
    ThreadBorrowEscapes,
    NotThreadSafe,
    UnsynchronizedMutation,
    ScopeMismatch,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Diagnostic)]
pub enum BorrowError {
    #[error("`{name}` is already declared in this scope")]
    #[diagnostic(
        code(borrowck::duplicate_binding),
        help("shadowing is disabled; pick a different name")
    )]
    DuplicateBinding { name: String },

    #[error("cannot find `{name}` in this scope")]
    #[diagnostic(code(borrowck::unknown_name))]
    UnknownName { name: String },

    #[error("unknown type `{name}`{detail}")]
    #[diagnostic(code(borrowck::unknown_type))]
    UnknownType { name: String, detail: String },

    #[error("use of moved value `{name}`")]
    #[diagnostic(
        code(borrowck::use_of_moved_value),
        help("the value was moved at point {moved_at}; clone it first or redeclare the name with `let`")
    )]
    UseOfMovedValue { name: String, moved_at: usize },

    #[error("use of `{name}` after it was dropped")]
    #[diagnostic(
        code(borrowck::use_of_moved_value),
        help("the value was released at point {dropped_at}")
    )]
    UseOfDroppedValue { name: String, dropped_at: usize },

    #[error("use of possibly uninitialized `{name}`")]
    #[diagnostic(code(borrowck::use_of_uninitialized))]
    UseOfUninitialized { name: String },

    #[error("cannot borrow `{name}` as {requested} because it is also borrowed as {existing}")]
    #[diagnostic(
        code(borrowck::conflicting_borrow),
        help("a value may have one exclusive borrow or any number of shared borrows, never both")
    )]
    ConflictingBorrow {
        name: String,
        requested: BorrowKind,
        existing: BorrowKind,
    },

    #[error("cannot move out of `{name}` because it is borrowed ({borrows} active borrow(s))")]
    #[diagnostic(code(borrowck::moved_while_borrowed))]
    MovedWhileBorrowed { name: String, borrows: usize },

    #[error("cannot {action} `{name}`: it is not declared mutable")]
    #[diagnostic(code(borrowck::mutability_violation), help("declare it with `let mut`"))]
    MutabilityViolation { name: String, action: String },

    #[error("`{reference}` refers to `{target}`, which does not live long enough")]
    #[diagnostic(
        code(borrowck::dangling_reference),
        help("the referenced value is released before this use")
    )]
    DanglingReference { reference: String, target: String },

    #[error("cannot determine the lifetime of the reference returned by `{function}`")]
    #[diagnostic(
        code(borrowck::ambiguous_lifetime),
        help("{detail}; add an explicit lifetime parameter to the signature")
    )]
    AmbiguousLifetime { function: String, detail: String },

    #[error("lifetime `'{lifetime}` in the signature of `{function}` is not declared by any parameter")]
    #[diagnostic(code(borrowck::undeclared_lifetime))]
    UndeclaredLifetime { function: String, lifetime: String },

    #[error("returned reference has lifetime `'{found}`, which does not outlive `'{expected}`")]
    #[diagnostic(
        code(borrowck::lifetime_mismatch),
        help("add a bound `'{found}: '{expected}` or return a reference with lifetime `'{expected}`")
    )]
    LifetimeMismatch { found: String, expected: String },

    #[error("thread borrows `{name}`, which may be released while the thread still runs")]
    #[diagnostic(
        code(borrowck::thread_borrow_escapes),
        help("join the thread before `{name}` goes out of scope, or move the value into the thread")
    )]
    ThreadBorrowEscapes { name: String },

    #[error("`{name}` of type `{ty}` cannot be sent to another thread safely")]
    #[diagnostic(
        code(borrowck::not_thread_safe),
        help("use `Arc` instead of `Rc` for values shared across threads")
    )]
    NotThreadSafe { name: String, ty: String },

    #[error("cannot mutate `{name}` without holding its lock{detail}")]
    #[diagnostic(
        code(borrowck::unsynchronized_mutation),
        help("wrap the payload in a `Mutex` and mutate it through the guard returned by `lock`")
    )]
    UnsynchronizedMutation { name: String, detail: String },

    #[error("internal error: {detail}")]
    #[diagnostic(code(borrowck::scope_mismatch))]
    ScopeMismatch { detail: String },
}

impl BorrowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BorrowError::DuplicateBinding { .. } => ErrorKind::DuplicateBinding,
            BorrowError::UnknownName { .. } => ErrorKind::UnknownName,
            BorrowError::UnknownType { .. } => ErrorKind::UnknownType,
            BorrowError::UseOfMovedValue { .. } | BorrowError::UseOfDroppedValue { .. } => {
                ErrorKind::UseOfMovedValue
            }
            BorrowError::UseOfUninitialized { .. } => ErrorKind::UseOfUninitialized,
            BorrowError::ConflictingBorrow { .. } => ErrorKind::ConflictingBorrow,
            BorrowError::MovedWhileBorrowed { .. } => ErrorKind::MovedWhileBorrowed,
            BorrowError::MutabilityViolation { .. } => ErrorKind::MutabilityViolation,
            BorrowError::DanglingReference { .. } => ErrorKind::DanglingReference,
            BorrowError::AmbiguousLifetime { .. } => ErrorKind::AmbiguousLifetime,
            BorrowError::UndeclaredLifetime { .. } => ErrorKind::UndeclaredLifetime,
            BorrowError::LifetimeMismatch { .. } => ErrorKind::LifetimeMismatch,
            BorrowError::ThreadBorrowEscapes { .. } => ErrorKind::ThreadBorrowEscapes,
            BorrowError::NotThreadSafe { .. } => ErrorKind::NotThreadSafe,
            BorrowError::UnsynchronizedMutation { .. } => ErrorKind::UnsynchronizedMutation,
            BorrowError::ScopeMismatch { .. } => ErrorKind::ScopeMismatch,
        }
    }

    /// The binding, type, function or lifetime the error is about.
    pub fn subject(&self) -> &str {
        match self {
            BorrowError::DuplicateBinding { name }
            | BorrowError::UnknownName { name }
            | BorrowError::UnknownType { name, .. }
            | BorrowError::UseOfMovedValue { name, .. }
            | BorrowError::UseOfDroppedValue { name, .. }
            | BorrowError::UseOfUninitialized { name }
            | BorrowError::ConflictingBorrow { name, .. }
            | BorrowError::MovedWhileBorrowed { name, .. }
            | BorrowError::MutabilityViolation { name, .. }
            | BorrowError::ThreadBorrowEscapes { name }
            | BorrowError::NotThreadSafe { name, .. }
            | BorrowError::UnsynchronizedMutation { name, .. } => name,
            BorrowError::DanglingReference { reference, .. } => reference,
            BorrowError::AmbiguousLifetime { function, .. } | BorrowError::UndeclaredLifetime { function, .. } => {
                function
            }
            BorrowError::LifetimeMismatch { found, .. } => found,
            BorrowError::ScopeMismatch { detail } => detail,
        }
    }

    pub fn unknown_type(name: &str) -> Self {
        BorrowError::UnknownType {
            name: name.to_string(),
            detail: String::new(),
        }
    }
}

/// A `BorrowError` located in a function.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{function}:{line}: {error}")]
pub struct CheckDiagnostic {
    pub function: String,
    pub line: usize,
    /// Program point (pre-order statement index) where the error was found
    pub point: usize,
    #[source]
    pub error: BorrowError,
}

impl CheckDiagnostic {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

impl Diagnostic for CheckDiagnostic {
    fn code<'a>(&'a self) -> Option<Box<dyn fmt::Display + 'a>> {
        self.error.code()
    }

    fn help<'a>(&'a self) -> Option<Box<dyn fmt::Display + 'a>> {
        self.error.help()
    }
}

#[derive(Serialize)]
struct DiagnosticRecord<'a> {
    function: &'a str,
    line: usize,
    point: usize,
    kind: ErrorKind,
    code: Option<String>,
    message: String,
}

impl Serialize for CheckDiagnostic {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        DiagnosticRecord {
            function: &self.function,
            line: self.line,
            point: self.point,
            kind: self.kind(),
            code: self.error.code().map(|c| c.to_string()),
            message: self.error.to_string(),
        }
        .serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_follow_kinds() {
        let err = BorrowError::UseOfMovedValue {
            name: "a".to_string(),
            moved_at: 2,
        };
        assert_eq!(err.kind(), ErrorKind::UseOfMovedValue);
        assert_eq!(err.code().unwrap().to_string(), "borrowck::use_of_moved_value");
        assert_eq!(err.to_string(), "use of moved value `a`");
    }

    #[test]
    fn test_located_display_and_json() {
        let diag = CheckDiagnostic {
            function: "main".to_string(),
            line: 7,
            point: 3,
            error: BorrowError::UnknownName { name: "q".to_string() },
        };
        assert_eq!(diag.to_string(), "main:7: cannot find `q` in this scope");
        let json = serde_json::to_value(&diag).unwrap();
        assert_eq!(json["kind"], "UnknownName");
        assert_eq!(json["code"], "borrowck::unknown_name");
    }
}
