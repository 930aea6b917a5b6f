use clap::Parser;
use colored::*;
use miette::Diagnostic;
use serde::Serialize;
use std::path::{Path, PathBuf};

use rusty_borrowck::analysis::{check_program, CheckReport, FunctionReport};
use rusty_borrowck::analysis::lifetimes::ReferenceLifetime;
use rusty_borrowck::analysis::ownership::{DropAction, DropEvent};
use rusty_borrowck::config::{BorrowScoping, CheckerConfig, ErrorMode, ShadowingPolicy};
use rusty_borrowck::diagnostics::CheckDiagnostic;
use rusty_borrowck::parser;

#[derive(clap::Parser, Debug)]
#[command(name = "rusty-borrowck-checker")]
#[command(about = "Checks ownership, borrowing and lifetime rules over a structured IR program")]
#[command(version)]
#[command(long_about = "Rusty Borrowck Checker - checks ownership, borrowing and lifetime rules over a \
structured IR program given as JSON\n\n\
Configuration is read from the `config` object of the input file and overridden by flags.\n\n\
Environment variables:\n  \
RUSTY_BORROWCK_DEBUG : Print analysis traces to stderr (debug builds only)")]
struct Args {
    /// IR program (JSON) to check
    #[arg(value_name = "FILE")]
    input: PathBuf,

    /// Output format (text, json)
    #[arg(long, default_value = "text")]
    format: String,

    /// Report every error of a function instead of stopping at the first
    #[arg(long)]
    batch: bool,

    /// End stored borrows after their holder's last use
    #[arg(long)]
    non_lexical: bool,

    /// Reject redeclaring a name in the scope that already declares it
    #[arg(long)]
    deny_shadowing: bool,

    /// Reject bindings that shadow a function parameter
    #[arg(long)]
    deny_parameter_shadowing: bool,

    /// Print the drop schedule of every function
    #[arg(long)]
    trace_drops: bool,

    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Args {
    /// Flags override whatever the file configured.
    fn apply(&self, config: &mut CheckerConfig) {
        if self.batch {
            config.error_mode = ErrorMode::Batch;
        }
        if self.non_lexical {
            config.borrow_scoping = BorrowScoping::NonLexical;
        }
        if self.deny_shadowing {
            config.shadowing = ShadowingPolicy::DenySameScope;
        }
        if self.deny_parameter_shadowing {
            config.allow_parameter_shadowing = false;
        }
        if self.trace_drops {
            config.trace_drops = true;
        }
    }
}

fn main() {
    let args = Args::parse();
    if args.format != "text" && args.format != "json" {
        eprintln!("{}: unknown output format '{}' (expected text or json)", "Error".red().bold(), args.format);
        std::process::exit(2);
    }

    match run(&args) {
        Ok(report) => {
            if !report.is_ok() {
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("{}: {}", "Error".red().bold(), e);
            std::process::exit(1);
        }
    }
}

fn run(args: &Args) -> Result<CheckReport, String> {
    let program = parser::load_program(&args.input)?;
    let mut config = program.config.clone().unwrap_or_default();
    args.apply(&mut config);

    let report = check_program(&program, &config);
    if args.format == "json" {
        let json = serde_json::to_string_pretty(&JsonReport::new(&args.input, &report, &config))
            .map_err(|e| format!("Failed to serialize report: {}", e))?;
        println!("{}", json);
    } else {
        print_text(&args.input, &report, &config, args.verbose);
    }
    Ok(report)
}

#[derive(Serialize)]
struct JsonReport<'a> {
    file: String,
    ok: bool,
    error_count: usize,
    config: &'a CheckerConfig,
    errors: &'a [CheckDiagnostic],
    functions: Vec<JsonFunction<'a>>,
}

#[derive(Serialize)]
struct JsonFunction<'a> {
    name: &'a str,
    ok: bool,
    diagnostics: &'a [CheckDiagnostic],
    #[serde(skip_serializing_if = "Option::is_none")]
    drops: Option<&'a [DropEvent]>,
    lifetimes: &'a [ReferenceLifetime],
}

impl<'a> JsonReport<'a> {
    fn new(path: &Path, report: &'a CheckReport, config: &'a CheckerConfig) -> Self {
        Self {
            file: path.display().to_string(),
            ok: report.is_ok(),
            error_count: report.error_count(),
            config,
            errors: &report.errors,
            functions: report
                .functions
                .iter()
                .map(|f| JsonFunction {
                    name: &f.name,
                    ok: f.is_ok(),
                    diagnostics: &f.diagnostics,
                    drops: config.trace_drops.then_some(f.drops.as_slice()),
                    lifetimes: &f.lifetimes,
                })
                .collect(),
        }
    }
}

fn print_text(path: &Path, report: &CheckReport, config: &CheckerConfig, verbose: u8) {
    println!("{}", "Rusty Borrowck Checker".bold().blue());
    println!("Checking: {}", path.display());

    for diagnostic in report.diagnostics() {
        print_diagnostic(diagnostic);
    }
    for function in &report.functions {
        if config.trace_drops {
            print_drops(function);
        }
        if verbose > 0 {
            print_lifetimes(function);
        }
    }

    let count = report.error_count();
    if count == 0 {
        println!("{}", format!("✓ no violations found in {} function(s)", report.functions.len()).green());
    } else {
        println!("{}", format!("✗ Found {} violation(s) in {}", count, path.display()).red());
    }
}

fn print_diagnostic(diagnostic: &CheckDiagnostic) {
    let code = diagnostic.code().map(|c| c.to_string()).unwrap_or_default();
    println!("{}{}: {}", "error".red().bold(), format!("[{}]", code).red(), diagnostic.error.to_string().bold());
    println!(
        "  {} {}:{} (point {})",
        "-->".blue(),
        diagnostic.function,
        diagnostic.line,
        diagnostic.point
    );
    if let Some(help) = diagnostic.help() {
        println!("  {} {}", "help:".cyan(), help);
    }
}

fn print_drops(function: &FunctionReport) {
    println!("{} {}", "drops:".bold(), function.name);
    for event in &function.drops {
        let actions: Vec<String> = event.actions.iter().map(describe_action).collect();
        println!(
            "  @{:<4} {:<12} {} ({}) {}",
            event.point,
            format!("{:?}", event.cause),
            event.name,
            event.ty,
            actions.join(", ").dimmed()
        );
    }
}

fn describe_action(action: &DropAction) -> String {
    match action {
        DropAction::Release => "release".to_string(),
        DropAction::Unlock => "unlock".to_string(),
        DropAction::DecrementStrong { cell, remaining } => format!("strong #{} -> {}", cell.0, remaining),
        DropAction::ReleaseShared { cell } => format!("release shared #{}", cell.0),
        DropAction::DecrementWeak { cell, remaining } => format!("weak #{} -> {}", cell.0, remaining),
    }
}

fn print_lifetimes(function: &FunctionReport) {
    if function.lifetimes.is_empty() {
        return;
    }
    println!("{} {}", "lifetimes:".bold(), function.name);
    for lifetime in &function.lifetimes {
        let last_use = lifetime.last_use.map_or("-".to_string(), |p| p.to_string());
        let bound = lifetime.bounded_by.as_deref().unwrap_or("-");
        println!(
            "  {:<10} from {} last use {} -> [{}] bounded by {}",
            lifetime.name,
            lifetime.start,
            last_use,
            lifetime.targets.join(", "),
            bound
        );
    }
}
