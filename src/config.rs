//! Checker configuration.
//!
//! Values come from three layers, lowest priority first: `Default`, the
//! optional `config` object of an IR file, and command-line flags.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShadowingPolicy {
    /// `let x` may always introduce a new binding over an existing `x`
    #[default]
    Allow,
    /// Redeclaring a name in the scope that already declares it is an error;
    /// shadowing from an inner scope is still allowed
    DenySameScope,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BorrowScoping {
    /// A borrow stored in a binding lasts until that binding's scope ends
    #[default]
    Lexical,
    /// A borrow stored in a binding also ends after the binding's last use
    NonLexical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorMode {
    /// Stop checking a function at its first error
    #[default]
    First,
    /// Report every error found in a function
    Batch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckerConfig {
    pub shadowing: ShadowingPolicy,
    pub allow_parameter_shadowing: bool,
    pub borrow_scoping: BorrowScoping,
    pub error_mode: ErrorMode,
    /// Include the drop schedule of each function in the report output
    pub trace_drops: bool,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            shadowing: ShadowingPolicy::Allow,
            allow_parameter_shadowing: true,
            borrow_scoping: BorrowScoping::Lexical,
            error_mode: ErrorMode::First,
            trace_drops: false,
        }
    }
}

impl CheckerConfig {
    pub fn batch(mut self) -> Self {
        self.error_mode = ErrorMode::Batch;
        self
    }

    pub fn non_lexical(mut self) -> Self {
        self.borrow_scoping = BorrowScoping::NonLexical;
        self
    }

    pub fn is_batch(&self) -> bool {
        self.error_mode == ErrorMode::Batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: CheckerConfig = serde_json::from_str(r#"{"borrow_scoping": "non_lexical"}"#).unwrap();
        assert_eq!(config.borrow_scoping, BorrowScoping::NonLexical);
        assert!(config.allow_parameter_shadowing);
        assert_eq!(config.error_mode, ErrorMode::First);
    }

    #[test]
    fn test_unknown_policy_is_rejected() {
        let result: Result<CheckerConfig, _> = serde_json::from_str(r#"{"shadowing": "never"}"#);
        assert!(result.is_err());
    }
}
