// Loading of serialized IR programs.
//
// The checker never sees surface syntax: a host front end lowers its program
// to `IrProgram` and hands it over either in memory or as JSON.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use crate::debug_println;
use crate::ir::IrProgram;

pub mod type_annotations;

pub use type_annotations::{parse_bound, parse_type};

pub fn load_program(path: &Path) -> Result<IrProgram, String> {
    let content = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
    parse_program(&content).map_err(|e| format!("{}: {}", path.display(), e))
}

pub fn parse_program(json: &str) -> Result<IrProgram, String> {
    let program: IrProgram =
        serde_json::from_str(json).map_err(|e| format!("Failed to parse IR: {}", e))?;
    validate_program(&program)?;
    debug_println!(
        "PARSER: Loaded {} type(s) and {} function(s)",
        program.types.len(),
        program.functions.len()
    );
    Ok(program)
}

/// Rejects programs whose item names collide. Everything else is left to the
/// checker so that it is reported as a diagnostic.
fn validate_program(program: &IrProgram) -> Result<(), String> {
    let mut seen = HashSet::new();
    for function in &program.functions {
        if !seen.insert(function.name.as_str()) {
            return Err(format!("function '{}' is defined more than once", function.name));
        }
    }
    let mut seen = HashSet::new();
    for decl in &program.types {
        if !seen.insert(decl.name.as_str()) {
            return Err(format!("type '{}' is defined more than once", decl.name));
        }
    }
    Ok(())
}
