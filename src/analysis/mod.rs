//! Ownership, borrowing and lifetime checking.
//!
//! `check_program` classifies the program's types, resolves every signature
//! once, then checks each function body independently (in parallel) by
//! walking its statements in program order.

use rayon::prelude::*;
use serde::Serialize;
use std::collections::HashMap;

use crate::config::{BorrowScoping, CheckerConfig};
use crate::debug_println;
use crate::diagnostics::{BorrowError, CheckDiagnostic};
use crate::ir::{block_span, Capture, CaptureMode, IrExpression, IrFunction, IrProgram, IrStatement, Param, TypeExpr};

pub mod borrows;
pub mod context;
pub mod lifetimes;
pub mod liveness;
pub mod ownership;
pub mod scope;
pub mod threads;
pub mod types;

use borrows::{Access, BorrowId, BorrowKind};
use context::{AnalysisContext, FlowState};
use lifetimes::{resolve_signature, LoanTarget, OutputSource, PointsTo, ReferenceLifetime, SignatureLifetimes};
use liveness::{LastUse, LastUses};
use ownership::{DropCause, DropEngine, DropEvent, Holding};
use scope::{BindingId, BindingState, NewBinding, ScopeKind};
use threads::ThreadTracker;
use types::{TypeRegistry, ValueKind};

/// Result of checking one function body.
#[derive(Debug, Clone, Serialize)]
pub struct FunctionReport {
    pub name: String,
    pub diagnostics: Vec<CheckDiagnostic>,
    /// Release schedule, in program order
    pub drops: Vec<DropEvent>,
    pub lifetimes: Vec<ReferenceLifetime>,
}

impl FunctionReport {
    pub fn is_ok(&self) -> bool {
        self.diagnostics.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CheckReport {
    /// Errors not tied to a function body, such as invalid type declarations
    pub errors: Vec<CheckDiagnostic>,
    pub functions: Vec<FunctionReport>,
}

impl CheckReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty() && self.functions.iter().all(FunctionReport::is_ok)
    }

    pub fn function(&self, name: &str) -> Option<&FunctionReport> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn diagnostics(&self) -> impl Iterator<Item = &CheckDiagnostic> + '_ {
        self.errors
            .iter()
            .chain(self.functions.iter().flat_map(|f| f.diagnostics.iter()))
    }

    pub fn error_count(&self) -> usize {
        self.diagnostics().count()
    }
}

pub struct Signature<'p> {
    pub function: &'p IrFunction,
    pub lifetimes: SignatureLifetimes,
    /// Elision failure, reported on the defining function. Callers use a
    /// conservative signature instead.
    pub error: Option<BorrowError>,
}

/// Every callable signature of a program, resolved once.
pub struct Signatures<'p> {
    entries: HashMap<&'p str, Signature<'p>>,
}

impl<'p> Signatures<'p> {
    pub fn resolve(program: &'p IrProgram, registry: &TypeRegistry) -> Self {
        let entries = program
            .functions
            .iter()
            .map(|function| {
                let signature = match resolve_signature(function, registry) {
                    Ok(lifetimes) => Signature {
                        function,
                        lifetimes,
                        error: None,
                    },
                    Err(error) => Signature {
                        function,
                        lifetimes: SignatureLifetimes::conservative(function, registry),
                        error: Some(error),
                    },
                };
                (function.name.as_str(), signature)
            })
            .collect();
        Self { entries }
    }

    pub fn get(&self, name: &str) -> Option<&Signature<'p>> {
        self.entries.get(name)
    }
}

pub fn check_program(program: &IrProgram, config: &CheckerConfig) -> CheckReport {
    let mut registry = TypeRegistry::new();
    let mut errors = Vec::new();
    if let Err(error) = registry.register_all(&program.types) {
        errors.push(CheckDiagnostic {
            function: "<types>".to_string(),
            line: 0,
            point: 0,
            error,
        });
    }

    let signatures = Signatures::resolve(program, &registry);
    let functions = program
        .functions
        .par_iter()
        .filter(|f| !f.external)
        .map(|f| check_function(f, &signatures, &registry, config))
        .collect();

    CheckReport { errors, functions }
}

pub fn check_function(
    function: &IrFunction,
    signatures: &Signatures,
    registry: &TypeRegistry,
    config: &CheckerConfig,
) -> FunctionReport {
    debug_println!("CHECK: Function '{}'", function.name);
    let mut checker = FunctionChecker::new(function, signatures, registry, config);
    // A halt only stops the walk; everything found so far is reported
    let _ = checker.run();
    checker.finish()
}

/// The first error stopped a function in `ErrorMode::First`.
struct Halt;

struct LoopFrame {
    /// Scope depth outside the loop
    depth: usize,
    breaks: Vec<FlowState>,
}

/// A value produced by an expression, before it is bound.
#[derive(Debug, Clone)]
struct Value {
    ty: TypeExpr,
    kind: ValueKind,
    targets: PointsTo,
    /// Borrows the value keeps alive; held by whatever binding receives it
    borrows: Vec<BorrowId>,
    holding: Holding,
    guard: bool,
    moved_from: Option<BindingId>,
}

impl Value {
    fn fresh(ty: TypeExpr, kind: ValueKind) -> Self {
        Self {
            ty,
            kind,
            targets: PointsTo::new(),
            borrows: Vec::new(),
            holding: Holding::default(),
            guard: false,
            moved_from: None,
        }
    }

    fn absorb(&mut self, other: Value) {
        self.targets.extend(other.targets);
        self.borrows.extend(other.borrows);
        self.holding.merge(other.holding);
        self.guard |= other.guard;
    }
}

struct FunctionChecker<'a> {
    function: &'a IrFunction,
    signatures: &'a Signatures<'a>,
    config: &'a CheckerConfig,
    ctx: AnalysisContext<'a>,
    last_uses: Option<LastUses>,
    diagnostics: Vec<CheckDiagnostic>,
    next_point: usize,
    loops: Vec<LoopFrame>,
    /// Depth that `return` unwinds to: 0 for the function, the depth outside
    /// the thread body inside a spawn
    body_depth: usize,
    in_thread: bool,
}

impl<'a> FunctionChecker<'a> {
    fn new(
        function: &'a IrFunction,
        signatures: &'a Signatures<'a>,
        registry: &'a TypeRegistry,
        config: &'a CheckerConfig,
    ) -> Self {
        let last_uses = match config.borrow_scoping {
            BorrowScoping::NonLexical => Some(liveness::last_uses(function)),
            BorrowScoping::Lexical => None,
        };
        Self {
            function,
            signatures,
            config,
            ctx: AnalysisContext::new(registry, config),
            last_uses,
            diagnostics: Vec::new(),
            next_point: 1,
            loops: Vec::new(),
            body_depth: 0,
            in_thread: false,
        }
    }

    fn finish(self) -> FunctionReport {
        FunctionReport {
            name: self.function.name.clone(),
            diagnostics: self.diagnostics,
            drops: self.ctx.drops.log().to_vec(),
            lifetimes: self.ctx.lifetimes.report(&self.ctx.scopes),
        }
    }

    fn report(&mut self, error: BorrowError, line: usize, point: usize) -> Result<(), Halt> {
        let kind = error.kind();
        // Loop bodies are walked twice; report each error once
        let seen = self
            .diagnostics
            .iter()
            .any(|d| d.point == point && d.kind() == kind && d.error.subject() == error.subject());
        if !seen {
            debug_println!("CHECK: {} at point {}: {}", kind, point, error);
            self.diagnostics.push(CheckDiagnostic {
                function: self.function.name.clone(),
                line,
                point,
                error,
            });
        }
        if self.config.is_batch() { Ok(()) } else { Err(Halt) }
    }

    fn check(&mut self, result: Result<(), BorrowError>, line: usize, point: usize) -> Result<(), Halt> {
        match result {
            Ok(()) => Ok(()),
            Err(error) => self.report(error, line, point),
        }
    }

    fn signature(&self) -> Option<&'a Signature<'a>> {
        self.signatures.get(&self.function.name)
    }

    fn run(&mut self) -> Result<(), Halt> {
        let function = self.function;
        let line = function.line;
        let signature = self.signature();
        if let Some(error) = signature.and_then(|s| s.error.clone()) {
            self.report(error, line, 0)?;
        }

        let scope = self.ctx.push_scope(ScopeKind::Function, 0);
        if let Some(signature) = signature {
            self.ctx.lifetimes.declare_signature(&signature.lifetimes, scope);
        }
        for (index, param) in function.params.iter().enumerate() {
            let declared = self.declare_param(index, param, signature);
            self.check(declared, line, 0)?;
        }

        self.walk(&function.body)?;

        let end = self.next_point;
        let popped = self.ctx.pop_scope(scope, end);
        self.check(popped, line, end)
    }

    fn declare_param(
        &mut self,
        index: usize,
        param: &Param,
        signature: Option<&Signature>,
    ) -> Result<(), BorrowError> {
        let kind = self.ctx.registry.kind_of(&param.ty)?;
        let id = self.ctx.scopes.declare(
            NewBinding {
                is_parameter: true,
                ..NewBinding::live(&param.name, param.ty.clone(), kind, param.mutable)
            },
            0,
        )?;
        if let Some(signature) = signature {
            self.ctx.lifetimes.set_points_to(id, signature.lifetimes.param_targets(index));
        }
        if self.ctx.registry.shared_kind(&param.ty).is_some() {
            // The caller's handles are unknown, so a parameter handle never
            // releases the payload itself
            self.ctx.drops.attach(
                id,
                Holding {
                    is_handle: true,
                    ..Holding::default()
                },
                false,
            );
        }
        Ok(())
    }

    fn walk(&mut self, body: &[IrStatement]) -> Result<(), Halt> {
        for (i, stmt) in body.iter().enumerate() {
            if self.ctx.diverged {
                // Unreachable; skip its points so numbering stays aligned
                self.next_point += block_span(&body[i..]);
                break;
            }
            self.statement(stmt)?;
        }
        Ok(())
    }

    fn statement(&mut self, stmt: &IrStatement) -> Result<(), Halt> {
        let point = self.next_point;
        self.next_point += 1;
        let line = stmt.line();
        // A restored branch entry may bring back borrows whose holder was
        // last used on the other branch
        self.release_dead_borrows(point - 1);

        match stmt {
            IrStatement::Block { body } => {
                let scope = self.ctx.push_scope(ScopeKind::Block, point);
                self.walk(body)?;
                let end = self.next_point;
                let popped = self.ctx.pop_scope(scope, end);
                self.check(popped, line, end)?;
            }
            IrStatement::If {
                then_branch,
                else_branch,
                ..
            } => self.if_statement(then_branch, else_branch.as_deref(), point, line)?,
            IrStatement::Loop { body, .. } => self.loop_statement(body, point, line)?,
            IrStatement::Spawn {
                handle,
                captures,
                body,
                ..
            } => self.spawn(handle.as_deref(), captures, body, point, line)?,
            _ => {
                let result = self.simple_statement(stmt, point);
                self.check(result, line, point)?;
            }
        }

        self.release_dead_borrows(self.next_point - 1);
        Ok(())
    }

    fn simple_statement(&mut self, stmt: &IrStatement, point: usize) -> Result<(), BorrowError> {
        match stmt {
            IrStatement::Let {
                name,
                ty,
                mutable,
                init,
                ..
            } => self.let_statement(name, ty.as_ref(), *mutable, init.as_ref(), point),
            IrStatement::Assign { target, value, .. } => self.assign(target, value, point),
            IrStatement::Use { name, .. } => self.use_binding(name, point),
            IrStatement::Write { name, .. } => self.write_binding(name, point),
            IrStatement::Eval { expr, .. } => {
                let value = self.eval(expr, point)?;
                self.discard(value, DropCause::Temporary, point)
            }
            IrStatement::Break { .. } => self.break_statement(point),
            IrStatement::Return { value, .. } => {
                let checked = match value {
                    Some(expr) => self.return_value(expr, point),
                    None => Ok(()),
                };
                let unwound = self.ctx.unwind_to(self.body_depth, DropCause::EarlyReturn, point);
                checked.and(unwound)
            }
            IrStatement::Panic { .. } => self.ctx.unwind_to(self.body_depth, DropCause::Unwind, point),
            IrStatement::Join { handle, .. } => self.join(handle, point),
            IrStatement::Block { .. } | IrStatement::If { .. } | IrStatement::Loop { .. } | IrStatement::Spawn { .. } => {
                Err(BorrowError::ScopeMismatch {
                    detail: "compound statement in simple position".to_string(),
                })
            }
        }
    }

    fn if_statement(
        &mut self,
        then_branch: &[IrStatement],
        else_branch: Option<&[IrStatement]>,
        point: usize,
        line: usize,
    ) -> Result<(), Halt> {
        let entry = self.ctx.snapshot();
        let then_flow = self.branch(then_branch, point, line)?;
        self.ctx.restore(&entry);
        let else_flow = match else_branch {
            Some(body) => {
                let start = self.next_point;
                self.branch(body, start, line)?
            }
            None => entry,
        };
        self.ctx.join_flows(vec![then_flow, else_flow]);
        Ok(())
    }

    fn branch(&mut self, body: &[IrStatement], point: usize, line: usize) -> Result<FlowState, Halt> {
        let scope = self.ctx.push_scope(ScopeKind::Branch, point);
        self.walk(body)?;
        let end = self.next_point;
        let popped = self.ctx.pop_scope(scope, end);
        self.check(popped, line, end)?;
        Ok(self.ctx.snapshot())
    }

    /// Zero or more iterations. The body is walked a second time from the
    /// state after the first, so values moved by one iteration are caught on
    /// the next. Drops of the second walk are not part of the schedule.
    fn loop_statement(&mut self, body: &[IrStatement], point: usize, line: usize) -> Result<(), Halt> {
        let entry = self.ctx.snapshot();
        let body_start = self.next_point;
        let depth = self.ctx.scopes.depth();

        let first = self.loop_pass(body, depth, point, line);
        let mut breaks = self.loops.pop().map(|frame| frame.breaks).unwrap_or_default();
        let after_first = first?;

        if !after_first.diverged {
            let body_end = self.next_point;
            let log_len = self.ctx.drops.log_len();
            self.next_point = body_start;
            let second = self.loop_pass(body, depth, point, line);
            self.loops.pop();
            second?;
            self.next_point = body_end;
            self.ctx.drops.truncate_log(log_len);
        }

        let mut exits = vec![entry, after_first];
        exits.append(&mut breaks);
        self.ctx.join_flows(exits);
        Ok(())
    }

    fn loop_pass(&mut self, body: &[IrStatement], depth: usize, point: usize, line: usize) -> Result<FlowState, Halt> {
        self.loops.push(LoopFrame {
            depth,
            breaks: Vec::new(),
        });
        let scope = self.ctx.push_scope(ScopeKind::Loop, point);
        self.walk(body)?;
        let end = self.next_point;
        let popped = self.ctx.pop_scope(scope, end);
        self.check(popped, line, end)?;
        Ok(self.ctx.snapshot())
    }

    fn break_statement(&mut self, point: usize) -> Result<(), BorrowError> {
        let depth = self
            .loops
            .last()
            .map(|frame| frame.depth)
            .ok_or_else(|| BorrowError::ScopeMismatch {
                detail: "`break` outside of a loop".to_string(),
            })?;
        let unwound = self.ctx.unwind_to(depth, DropCause::Break, point);
        let mut exit = self.ctx.snapshot();
        exit.diverged = false;
        if let Some(frame) = self.loops.last_mut() {
            frame.breaks.push(exit);
        }
        unwound
    }

    fn return_value(&mut self, expr: &IrExpression, point: usize) -> Result<(), BorrowError> {
        let value = self.eval(expr, point)?;
        for borrow in &value.borrows {
            self.ctx.borrows.release(*borrow, point);
        }
        if self.in_thread {
            return Ok(());
        }
        match self.signature() {
            Some(signature) => self
                .ctx
                .lifetimes
                .check_return(&value.targets, &signature.lifetimes, &self.ctx.scopes),
            None => Ok(()),
        }
    }

    fn release_dead_borrows(&mut self, point: usize) {
        let Some(last_uses) = &self.last_uses else {
            return;
        };
        let dead: Vec<BorrowId> = self
            .ctx
            .borrows
            .all_active()
            .filter_map(|borrow| {
                let holder = borrow.holder?;
                if self.ctx.threads.is_handle(holder) {
                    return None;
                }
                let binding = self.ctx.scopes.binding(holder);
                match last_uses.get(&(binding.name.clone(), binding.declared_at)) {
                    Some(LastUse::At(last)) if *last <= point => Some(borrow.id),
                    _ => None,
                }
            })
            .collect();
        for id in dead {
            debug_println!("CHECK: Borrow #{} is dead after point {}", id.0, point);
            self.ctx.borrows.release(id, point);
        }
    }

    // ---- bindings ----

    fn kind_of(&self, ty: &TypeExpr) -> Result<ValueKind, BorrowError> {
        self.ctx.registry.kind_of(ty)
    }

    /// Hands a value to the binding that receives it.
    fn bind(&mut self, id: BindingId, value: Value) {
        for borrow in &value.borrows {
            self.ctx.borrows.set_holder(*borrow, id);
        }
        self.ctx.lifetimes.set_points_to(id, value.targets);
        self.ctx.drops.attach(id, value.holding, value.guard);
        if let Some(from) = value.moved_from {
            self.ctx.threads.transfer(from, id);
        }
    }

    /// Ends a value that no binding receives.
    fn discard(&mut self, value: Value, cause: DropCause, point: usize) -> Result<(), BorrowError> {
        let escaping = value
            .moved_from
            .and_then(|handle| self.ctx.threads.unjoined_target(handle, &self.ctx.borrows));
        for borrow in &value.borrows {
            self.ctx.borrows.release(*borrow, point);
        }
        self.ctx
            .drops
            .release_value(&value.ty, value.kind.owns_resource(), value.holding, value.guard, cause, point);
        match escaping {
            Some(target) => Err(BorrowError::ThreadBorrowEscapes {
                name: self.ctx.scopes.binding(target).name.clone(),
            }),
            None => Ok(()),
        }
    }

    fn let_statement(
        &mut self,
        name: &str,
        declared: Option<&TypeExpr>,
        mutable: bool,
        init: Option<&IrExpression>,
        point: usize,
    ) -> Result<(), BorrowError> {
        if let Some(ty) = declared {
            self.kind_of(ty)?;
        }
        let Some(expr) = init else {
            let ty = declared.cloned().unwrap_or_else(TypeExpr::inferred);
            let kind = self.kind_of(&ty)?;
            self.ctx.scopes.declare(
                NewBinding {
                    state: BindingState::Uninitialized,
                    ..NewBinding::live(name, ty, kind, mutable)
                },
                point,
            )?;
            return Ok(());
        };

        let value = self.eval(expr, point)?;
        let ty = declared.cloned().unwrap_or_else(|| value.ty.clone());
        let declared_binding = self
            .kind_of(&ty)
            .and_then(|kind| self.ctx.scopes.declare(NewBinding::live(name, ty, kind, mutable), point));
        match declared_binding {
            Ok(id) => {
                self.bind(id, value);
                Ok(())
            }
            Err(error) => self.discard(value, DropCause::Temporary, point).and(Err(error)),
        }
    }

    fn assign(&mut self, target: &str, expr: &IrExpression, point: usize) -> Result<(), BorrowError> {
        let value = self.eval(expr, point)?;
        match self.prepare_assignment(target, &value, point) {
            Ok(id) => {
                self.bind(id, value);
                self.ctx.lifetimes.record_use(id, point);
                Ok(())
            }
            Err(error) => self.discard(value, DropCause::Temporary, point).and(Err(error)),
        }
    }

    /// Makes `target` ready to receive a new value, dropping its old one.
    fn prepare_assignment(&mut self, target: &str, value: &Value, point: usize) -> Result<BindingId, BorrowError> {
        let id = self.ctx.scopes.lookup(target)?;
        let binding = self.ctx.scopes.binding(id).clone();
        match binding.state {
            BindingState::MaybeInitialized => {
                if !binding.mutable {
                    return Err(BorrowError::MutabilityViolation {
                        name: binding.name,
                        action: "assign twice to".to_string(),
                    });
                }
                self.ctx.borrows.check_access(&binding, Access::Write)?;
                self.ctx.drops.release_flag(&binding, point);
                self.ctx.borrows.release_held_by(id, point);
                self.ctx.lifetimes.clear(id);
            }
            BindingState::Uninitialized => {
                if binding.ty.is_inferred() {
                    let kind = self.kind_of(&value.ty)?;
                    let slot = self.ctx.scopes.binding_mut(id);
                    slot.ty = value.ty.clone();
                    slot.kind = kind;
                }
            }
            BindingState::Live => {
                if !binding.mutable {
                    return Err(BorrowError::MutabilityViolation {
                        name: binding.name,
                        action: "assign twice to".to_string(),
                    });
                }
                self.ctx.borrows.check_access(&binding, Access::Write)?;
                self.ctx
                    .drops
                    .finalize(self.ctx.scopes.binding_mut(id), DropCause::Reassigned, point);
                self.ctx.borrows.release_held_by(id, point);
                self.ctx.lifetimes.clear(id);
            }
            BindingState::Moved { at } => {
                return Err(BorrowError::UseOfMovedValue {
                    name: binding.name,
                    moved_at: at,
                });
            }
            BindingState::Dropped { .. } => DropEngine::check_usable(&binding)?,
        }
        self.ctx.scopes.binding_mut(id).state = BindingState::Live;
        Ok(id)
    }

    fn use_binding(&mut self, name: &str, point: usize) -> Result<(), BorrowError> {
        let id = self.ctx.scopes.lookup(name)?;
        let binding = self.ctx.scopes.binding(id);
        DropEngine::check_usable(binding)?;
        self.ctx.borrows.check_access(binding, Access::Read)?;
        self.ctx.lifetimes.check(id, &self.ctx.scopes)?;
        self.ctx.lifetimes.record_use(id, point);
        Ok(())
    }

    fn write_binding(&mut self, name: &str, point: usize) -> Result<(), BorrowError> {
        let id = self.ctx.scopes.lookup(name)?;
        let binding = self.ctx.scopes.binding(id);
        DropEngine::check_usable(binding)?;
        let registry = self.ctx.registry;
        if binding.ty.is_reference() {
            if !binding.ty.is_mutable_reference() {
                return Err(BorrowError::MutabilityViolation {
                    name: binding.name.clone(),
                    action: "write through shared reference".to_string(),
                });
            }
        } else {
            if !registry.is_guard(&binding.ty) {
                ThreadTracker::check_mutation(registry, binding)?;
            }
            if !binding.mutable {
                return Err(BorrowError::MutabilityViolation {
                    name: binding.name.clone(),
                    action: "mutate".to_string(),
                });
            }
            self.ctx.borrows.check_access(binding, Access::Write)?;
        }
        self.ctx.lifetimes.check(id, &self.ctx.scopes)?;
        self.ctx.lifetimes.record_use(id, point);
        Ok(())
    }

    // ---- threads ----

    fn spawn(
        &mut self,
        handle: Option<&str>,
        captures: &[Capture],
        body: &[IrStatement],
        point: usize,
        line: usize,
    ) -> Result<(), Halt> {
        let captured = match self.prepare_captures(captures, handle.is_none(), point) {
            Ok(captured) => captured,
            Err(error) => {
                self.next_point += block_span(body);
                return self.report(error, line, point);
            }
        };
        debug_println!("THREAD: Spawn at point {} with {} capture(s)", point, captured.len());

        let loops = std::mem::take(&mut self.loops);
        let body_depth = std::mem::replace(&mut self.body_depth, self.ctx.scopes.depth());
        let in_thread = std::mem::replace(&mut self.in_thread, true);

        let scope = self.ctx.push_scope(ScopeKind::Thread, point);
        let mut handle_borrows = Vec::new();
        for (name, mutable, mut value) in captured {
            handle_borrows.append(&mut value.borrows);
            let declared = self
                .kind_of(&value.ty)
                .and_then(|kind| self.ctx.scopes.declare(NewBinding::live(&name, value.ty.clone(), kind, mutable), point));
            match declared {
                Ok(id) => self.bind(id, value),
                Err(error) => self.report(error, line, point)?,
            }
        }
        let walked = self.walk(body);
        let end = self.next_point;
        let popped = if walked.is_ok() {
            self.ctx.pop_scope(scope, end)
        } else {
            Ok(())
        };

        self.loops = loops;
        self.body_depth = body_depth;
        self.in_thread = in_thread;
        self.ctx.diverged = false;
        walked?;
        self.check(popped, line, end)?;

        match handle {
            Some(name) => {
                let ty = TypeExpr::generic("JoinHandle", vec![TypeExpr::unit()]);
                let declared = self
                    .ctx
                    .scopes
                    .declare(NewBinding::live(name, ty, ValueKind::Owning, false), point);
                match declared {
                    Ok(id) => {
                        for borrow in &handle_borrows {
                            self.ctx.borrows.set_holder(*borrow, id);
                        }
                        self.ctx.threads.register(id, handle_borrows, point);
                    }
                    Err(error) => {
                        for borrow in &handle_borrows {
                            self.ctx.borrows.release(*borrow, point);
                        }
                        self.report(error, line, point)?;
                    }
                }
            }
            None => {
                for borrow in &handle_borrows {
                    self.ctx.borrows.release(*borrow, point);
                }
            }
        }
        Ok(())
    }

    /// Evaluates captures in the spawning scope. Returns `(name, mutable,
    /// value)` per capture.
    fn prepare_captures(
        &mut self,
        captures: &[Capture],
        detached: bool,
        point: usize,
    ) -> Result<Vec<(String, bool, Value)>, BorrowError> {
        let mut captured: Vec<(String, bool, Value)> = Vec::new();
        for capture in captures {
            match self.capture(capture, detached, point) {
                Ok(entry) => captured.push(entry),
                Err(error) => {
                    for (_, _, value) in &captured {
                        for borrow in &value.borrows {
                            self.ctx.borrows.release(*borrow, point);
                        }
                    }
                    return Err(error);
                }
            }
        }
        Ok(captured)
    }

    fn capture(&mut self, capture: &Capture, detached: bool, point: usize) -> Result<(String, bool, Value), BorrowError> {
        let id = self.ctx.scopes.lookup(&capture.name)?;
        let binding = self.ctx.scopes.binding(id);
        ThreadTracker::check_capture(self.ctx.registry, binding)?;
        let mutable = binding.mutable;
        let escapes = || BorrowError::ThreadBorrowEscapes {
            name: capture.name.clone(),
        };
        let value = match capture.mode {
            CaptureMode::Move => {
                let value = self.var_value(id, point)?;
                if detached && value.targets.iter().any(|t| matches!(t, LoanTarget::Local(_))) {
                    for borrow in &value.borrows {
                        self.ctx.borrows.release(*borrow, point);
                    }
                    return Err(escapes());
                }
                value
            }
            CaptureMode::Ref | CaptureMode::MutRef => {
                if detached {
                    return Err(escapes());
                }
                self.borrow_value(id, capture.mode == CaptureMode::MutRef, point)?
            }
        };
        Ok((capture.name.clone(), mutable, value))
    }

    fn join(&mut self, handle: &str, point: usize) -> Result<(), BorrowError> {
        let id = self.ctx.scopes.lookup(handle)?;
        DropEngine::check_usable(self.ctx.scopes.binding(id))?;
        let borrows = self.ctx.threads.join(id).ok_or_else(|| BorrowError::UnknownName {
            name: handle.to_string(),
        })?;
        for borrow in borrows {
            self.ctx.borrows.release(borrow, point);
        }
        self.ctx.lifetimes.record_use(id, point);
        // Joining consumes the handle
        self.ctx.scopes.binding_mut(id).state = BindingState::Moved { at: point };
        Ok(())
    }

    // ---- expressions ----

    fn eval(&mut self, expr: &IrExpression, point: usize) -> Result<Value, BorrowError> {
        match expr {
            IrExpression::Var(name) => {
                let id = self.ctx.scopes.lookup(name)?;
                self.var_value(id, point)
            }
            IrExpression::Ref { name, mutable } => {
                let id = self.ctx.scopes.lookup(name)?;
                self.borrow_value(id, *mutable, point)
            }
            IrExpression::New(ty) => self.new_value(ty, point),
            IrExpression::Clone(name) => self.clone_value(name, point),
            IrExpression::Call { func, args } => self.call(func, args, point),
            IrExpression::Cond(candidates) => {
                let mut result: Option<Value> = None;
                for candidate in candidates {
                    let value = self.eval(candidate, point)?;
                    result = Some(match result.take() {
                        Some(mut merged) => {
                            merged.absorb(value);
                            merged
                        }
                        None => value,
                    });
                }
                Ok(result.unwrap_or_else(|| Value::fresh(TypeExpr::unit(), ValueKind::Copy)))
            }
            IrExpression::Struct { ty, fields } => {
                let mut value = Value::fresh(ty.clone(), self.kind_of(ty)?);
                for field in fields {
                    let part = self.eval(&field.value, point)?;
                    value.absorb(part);
                }
                Ok(value)
            }
            IrExpression::Lock(name) => self.lock(name, point),
            IrExpression::Downgrade(name) => self.downgrade(name, point),
        }
    }

    /// By-value use: a copy for `Copy` values, otherwise a move.
    fn var_value(&mut self, id: BindingId, point: usize) -> Result<Value, BorrowError> {
        let binding = self.ctx.scopes.binding(id).clone();
        DropEngine::check_usable(&binding)?;
        self.ctx.lifetimes.check(id, &self.ctx.scopes)?;
        let targets = self.ctx.lifetimes.targets_of(id);
        self.ctx.lifetimes.record_use(id, point);

        if binding.kind.is_copy() {
            self.ctx.borrows.check_access(&binding, Access::Read)?;
            let borrows = self.reborrow_shared(&targets, point)?;
            return Ok(Value {
                targets,
                borrows,
                ..Value::fresh(binding.ty, binding.kind)
            });
        }

        let moved = self
            .ctx
            .drops
            .move_out(self.ctx.scopes.binding_mut(id), &self.ctx.borrows, point)?;
        let borrows = self.ctx.borrows.held_by(id);
        self.ctx.lifetimes.clear(id);
        Ok(Value {
            ty: binding.ty,
            kind: binding.kind,
            targets,
            borrows,
            holding: moved.holding,
            guard: moved.guard,
            moved_from: Some(moved.from),
        })
    }

    /// Copying a shared reference shares the loan: the copy holds its own
    /// shared borrow of every local target.
    fn reborrow_shared(&mut self, targets: &PointsTo, point: usize) -> Result<Vec<BorrowId>, BorrowError> {
        let scope = self.current_scope()?;
        let mut borrows = Vec::new();
        for target in targets {
            if let LoanTarget::Local(id) = target {
                let binding = self.ctx.scopes.binding(*id);
                match self.ctx.borrows.borrow(binding, BorrowKind::Shared, scope, point) {
                    Ok(borrow) => borrows.push(borrow),
                    Err(error) => {
                        for borrow in &borrows {
                            self.ctx.borrows.release(*borrow, point);
                        }
                        return Err(error);
                    }
                }
            }
        }
        Ok(borrows)
    }

    fn current_scope(&self) -> Result<scope::ScopeId, BorrowError> {
        self.ctx.scopes.current().ok_or_else(|| BorrowError::ScopeMismatch {
            detail: "expression outside any scope".to_string(),
        })
    }

    fn borrow_value(&mut self, id: BindingId, mutable: bool, point: usize) -> Result<Value, BorrowError> {
        let binding = self.ctx.scopes.binding(id);
        DropEngine::check_usable(binding)?;
        if mutable && !binding.mutable {
            return Err(BorrowError::MutabilityViolation {
                name: binding.name.clone(),
                action: "borrow as mutable".to_string(),
            });
        }
        self.ctx.lifetimes.check(id, &self.ctx.scopes)?;
        let kind = if mutable { BorrowKind::Exclusive } else { BorrowKind::Shared };
        let scope = self.current_scope()?;
        let binding = self.ctx.scopes.binding(id);
        let borrow = self.ctx.borrows.borrow(binding, kind, scope, point)?;
        let ty = TypeExpr::reference(binding.ty.clone(), mutable, None);
        self.ctx.lifetimes.record_use(id, point);
        let value_kind = if mutable { ValueKind::Move } else { ValueKind::Copy };
        Ok(Value {
            targets: [LoanTarget::Local(id)].into_iter().collect(),
            borrows: vec![borrow],
            ..Value::fresh(ty, value_kind)
        })
    }

    fn new_value(&mut self, ty: &TypeExpr, point: usize) -> Result<Value, BorrowError> {
        let mut value = Value::fresh(ty.clone(), self.kind_of(ty)?);
        if let Some(shared) = self.ctx.registry.shared_kind(ty) {
            let payload = ty.args().first().cloned().unwrap_or_else(TypeExpr::unit);
            let cell = self.ctx.drops.allocate_shared(shared, &payload, point);
            value.holding = Holding {
                cells: vec![cell],
                weak: Vec::new(),
                is_handle: true,
            };
        }
        if ty.is_reference() {
            // Only constants can be created as references out of nothing
            value.targets.insert(LoanTarget::Static);
        }
        Ok(value)
    }

    fn clone_value(&mut self, name: &str, point: usize) -> Result<Value, BorrowError> {
        let id = self.ctx.scopes.lookup(name)?;
        let binding = self.ctx.scopes.binding(id).clone();
        DropEngine::check_usable(&binding)?;
        self.ctx.borrows.check_access(&binding, Access::Read)?;
        self.ctx.lifetimes.check(id, &self.ctx.scopes)?;

        if binding.ty.is_reference() {
            // Method resolution clones the referent, not the reference
            self.ctx.lifetimes.record_use(id, point);
            let referent = binding.ty.referent().clone();
            let mut value = Value::fresh(referent.clone(), self.kind_of(&referent)?);
            let locals: Vec<BindingId> = self
                .ctx
                .lifetimes
                .targets_of(id)
                .into_iter()
                .filter_map(|t| match t {
                    LoanTarget::Local(target) => Some(target),
                    _ => None,
                })
                .collect();
            if let [source] = locals.as_slice() {
                value.holding = self.ctx.drops.clone_holding(*source);
            } else if self.ctx.registry.shared_kind(&referent).is_some() {
                value.holding.is_handle = true;
            }
            return Ok(value);
        }
        if binding.kind.is_copy() {
            return self.var_value(id, point);
        }

        self.ctx.lifetimes.record_use(id, point);
        let targets = self.ctx.lifetimes.targets_of(id);
        let borrows = self.reborrow_shared(&targets, point)?;
        Ok(Value {
            targets,
            borrows,
            holding: self.ctx.drops.clone_holding(id),
            ..Value::fresh(binding.ty, binding.kind)
        })
    }

    fn call(&mut self, func: &str, args: &[IrExpression], point: usize) -> Result<Value, BorrowError> {
        let signatures = self.signatures;
        let signature = signatures.get(func).ok_or_else(|| BorrowError::UnknownName {
            name: func.to_string(),
        })?;

        let mut values: Vec<Value> = Vec::with_capacity(args.len());
        for arg in args {
            match self.eval(arg, point) {
                Ok(value) => values.push(value),
                Err(error) => {
                    for borrow in values.iter().flat_map(|v| v.borrows.iter()) {
                        self.ctx.borrows.release(*borrow, point);
                    }
                    return Err(error);
                }
            }
        }

        let ret = signature.function.ret.clone().unwrap_or_else(TypeExpr::unit);
        let mut result = self.new_value(&ret, point)?;
        result.targets.clear();
        let captured: &[usize] = match &signature.lifetimes.output {
            OutputSource::NotReference => &[],
            OutputSource::Static => {
                result.targets.insert(LoanTarget::Static);
                &[]
            }
            OutputSource::Params { params, .. } => params,
        };

        let mut consumed = Ok(());
        for (index, mut value) in values.into_iter().enumerate() {
            if captured.contains(&index) {
                result.targets.append(&mut value.targets);
                result.borrows.append(&mut value.borrows);
            }
            if value.kind.is_copy() {
                for borrow in &value.borrows {
                    self.ctx.borrows.release(*borrow, point);
                }
            } else {
                let discarded = self.discard(value, DropCause::Consumed, point);
                consumed = consumed.and(discarded);
            }
        }
        debug_println!("CHECK: Call to '{}' may borrow from {:?}", func, result.targets);
        consumed.map(|()| result)
    }

    fn lock(&mut self, name: &str, point: usize) -> Result<Value, BorrowError> {
        let id = self.ctx.scopes.lookup(name)?;
        let binding = self.ctx.scopes.binding(id);
        DropEngine::check_usable(binding)?;
        let Some(payload) = self.ctx.registry.mutex_payload(&binding.ty).cloned() else {
            return Err(BorrowError::UnsynchronizedMutation {
                name: binding.name.clone(),
                detail: format!(" (`{}` is not a Mutex)", binding.ty),
            });
        };
        self.ctx.lifetimes.check(id, &self.ctx.scopes)?;
        let scope = self.current_scope()?;
        let binding = self.ctx.scopes.binding(id);
        let borrow = self.ctx.borrows.borrow(binding, BorrowKind::Shared, scope, point)?;
        self.ctx.lifetimes.record_use(id, point);
        Ok(Value {
            targets: [LoanTarget::Local(id)].into_iter().collect(),
            borrows: vec![borrow],
            guard: true,
            ..Value::fresh(TypeExpr::generic("MutexGuard", vec![payload]), ValueKind::Owning)
        })
    }

    fn downgrade(&mut self, name: &str, point: usize) -> Result<Value, BorrowError> {
        let id = self.ctx.scopes.lookup(name)?;
        let binding = self.ctx.scopes.binding(id).clone();
        DropEngine::check_usable(&binding)?;
        if self.ctx.registry.shared_kind(&binding.ty).is_none() {
            return Err(BorrowError::UnknownType {
                name: binding.ty.to_string(),
                detail: " (only Rc and Arc can be downgraded)".to_string(),
            });
        }
        self.ctx.lifetimes.record_use(id, point);
        let ty = TypeExpr::generic("Weak", binding.ty.args().to_vec());
        let kind = self.kind_of(&ty)?;
        Ok(Value {
            holding: self.ctx.drops.downgrade(id),
            ..Value::fresh(ty, kind)
        })
    }
}
