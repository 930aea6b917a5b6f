// Library crate for rusty-borrowck
// Exposes the checker for the command-line front end and integration tests

#[macro_use]
pub mod debug_macros;

pub mod analysis;
pub mod config;
pub mod diagnostics;
pub mod ir;
pub mod parser;

pub use analysis::{check_function, check_program, CheckReport, FunctionReport, Signatures};
pub use config::CheckerConfig;
pub use diagnostics::{BorrowError, CheckDiagnostic, ErrorKind};
pub use ir::IrProgram;
