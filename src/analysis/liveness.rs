// Liveness analysis for non-lexical borrow release
//
// Determines the last use of each binding so that the borrows it holds can be
// released before its scope ends.
//
// Conservative rules:
// - Bindings used in loops -> live until scope exit
// - Bindings that escape (returned) -> live until scope exit
// - Writes to a binding are not uses of its current value
// - When uncertain -> assume live

use crate::debug_println;
use crate::ir::{IrExpression, IrFunction, IrStatement};
use std::collections::HashMap;

/// A binding is identified by its name and the point that declared it.
/// Parameters are declared at point 0.
pub type BindingKey = (String, usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UseType {
    Read,
    Write,
    Escape,
    InLoop,
}

#[derive(Debug, Clone, Copy)]
pub struct UseInfo {
    pub point: usize,
    pub use_type: UseType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LastUse {
    /// No use after this point
    At(usize),
    /// Must be kept until the binding's scope ends
    ScopeEnd,
}

pub type LastUses = HashMap<BindingKey, LastUse>;

struct LexicalScope {
    names: HashMap<String, usize>,
    /// Thread bodies see only their captures
    barrier: bool,
}

pub struct LivenessAnalyzer {
    uses: HashMap<BindingKey, Vec<UseInfo>>,
    declared: Vec<BindingKey>,
    scopes: Vec<LexicalScope>,
    next_point: usize,
    in_loop_depth: usize,
    in_return: bool,
}

impl Default for LivenessAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl LivenessAnalyzer {
    pub fn new() -> Self {
        Self {
            uses: HashMap::new(),
            declared: Vec::new(),
            scopes: Vec::new(),
            next_point: 1,
            in_loop_depth: 0,
            in_return: false,
        }
    }

    /// Map of binding -> last use. Program points are the pre-order statement
    /// indices the checker uses, starting at 1.
    pub fn analyze(&mut self, function: &IrFunction) -> LastUses {
        debug_println!("LIVENESS: Analyzing '{}'", function.name);
        self.push_scope(false);
        for param in &function.params {
            self.declare(&param.name, 0);
        }
        self.collect_uses(&function.body);
        self.scopes.pop();

        let last_uses = self.compute_last_uses();
        for ((name, declared_at), last) in &last_uses {
            debug_println!("LIVENESS:   '{}'@{} -> {:?}", name, declared_at, last);
        }
        last_uses
    }

    fn push_scope(&mut self, barrier: bool) {
        self.scopes.push(LexicalScope {
            names: HashMap::new(),
            barrier,
        });
    }

    fn declare(&mut self, name: &str, point: usize) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.names.insert(name.to_string(), point);
        }
        self.declared.push((name.to_string(), point));
    }

    fn resolve(&self, name: &str) -> Option<BindingKey> {
        for scope in self.scopes.iter().rev() {
            if let Some(point) = scope.names.get(name) {
                return Some((name.to_string(), *point));
            }
            if scope.barrier {
                break;
            }
        }
        None
    }

    fn collect_uses(&mut self, statements: &[IrStatement]) {
        for stmt in statements {
            let point = self.next_point;
            self.next_point += 1;
            self.collect_uses_from_statement(stmt, point);
        }
    }

    fn scoped(&mut self, body: &[IrStatement], barrier: bool) {
        self.push_scope(barrier);
        self.collect_uses(body);
        self.scopes.pop();
    }

    fn collect_uses_from_statement(&mut self, stmt: &IrStatement, point: usize) {
        match stmt {
            IrStatement::Let { name, init, .. } => {
                if let Some(expr) = init {
                    self.collect_from_expression(expr, point);
                }
                self.declare(name, point);
            }
            IrStatement::Assign { target, value, .. } => {
                self.collect_from_expression(value, point);
                self.record_use(target, point, UseType::Write);
            }
            IrStatement::Use { name, .. } | IrStatement::Write { name, .. } => {
                self.record_read(name, point);
            }
            IrStatement::Eval { expr, .. } => self.collect_from_expression(expr, point),
            IrStatement::Block { body } => self.scoped(body, false),
            IrStatement::If { then_branch, else_branch, .. } => {
                self.scoped(then_branch, false);
                if let Some(else_branch) = else_branch {
                    self.scoped(else_branch, false);
                }
            }
            IrStatement::Loop { body, .. } => {
                self.in_loop_depth += 1;
                self.scoped(body, false);
                self.in_loop_depth -= 1;
            }
            IrStatement::Return { value, .. } => {
                if let Some(expr) = value {
                    // Returned bindings escape
                    self.in_return = true;
                    self.collect_from_expression(expr, point);
                    self.in_return = false;
                }
            }
            IrStatement::Spawn { handle, captures, body, .. } => {
                for capture in captures {
                    self.record_read(&capture.name, point);
                }
                // The thread body runs on its own; loop context does not carry in
                let loop_depth = std::mem::take(&mut self.in_loop_depth);
                self.push_scope(true);
                for capture in captures {
                    self.declare(&capture.name, point);
                }
                self.collect_uses(body);
                self.scopes.pop();
                self.in_loop_depth = loop_depth;
                if let Some(handle) = handle {
                    self.declare(handle, point);
                }
            }
            IrStatement::Join { handle, .. } => self.record_read(handle, point),
            IrStatement::Break { .. } | IrStatement::Panic { .. } => {}
        }
    }

    fn collect_from_expression(&mut self, expr: &IrExpression, point: usize) {
        match expr {
            IrExpression::Var(name)
            | IrExpression::Ref { name, .. }
            | IrExpression::Clone(name)
            | IrExpression::Lock(name)
            | IrExpression::Downgrade(name) => self.record_read(name, point),
            IrExpression::Call { args, .. } | IrExpression::Cond(args) => {
                for arg in args {
                    self.collect_from_expression(arg, point);
                }
            }
            IrExpression::Struct { fields, .. } => {
                for field in fields {
                    self.collect_from_expression(&field.value, point);
                }
            }
            IrExpression::New(_) => {}
        }
    }

    fn record_read(&mut self, name: &str, point: usize) {
        let use_type = if self.in_return {
            UseType::Escape
        } else if self.in_loop_depth > 0 {
            UseType::InLoop
        } else {
            UseType::Read
        };
        self.record_use(name, point, use_type);
    }

    fn record_use(&mut self, name: &str, point: usize, use_type: UseType) {
        let Some(key) = self.resolve(name) else {
            return;
        };
        debug_println!("LIVENESS: Recording use of '{}' at point {} ({:?})", name, point, use_type);
        self.uses.entry(key).or_default().push(UseInfo { point, use_type });
    }

    fn compute_last_uses(&self) -> LastUses {
        let mut last_uses = HashMap::new();

        for key in &self.declared {
            let uses = self.uses.get(key).map(Vec::as_slice).unwrap_or_default();

            if uses.iter().any(|u| u.use_type == UseType::Escape) {
                debug_println!("LIVENESS: '{}' escapes - keeping until scope end", key.0);
                last_uses.insert(key.clone(), LastUse::ScopeEnd);
                continue;
            }
            if uses.iter().any(|u| u.use_type == UseType::InLoop) {
                debug_println!("LIVENESS: '{}' used in loop - keeping until scope end", key.0);
                last_uses.insert(key.clone(), LastUse::ScopeEnd);
                continue;
            }

            // Never read: dead right after its declaration
            let last = uses
                .iter()
                .filter(|u| u.use_type == UseType::Read)
                .map(|u| u.point)
                .max()
                .unwrap_or(key.1);
            last_uses.insert(key.clone(), LastUse::At(last));
        }

        last_uses
    }
}

/// Convenience wrapper around `LivenessAnalyzer`.
pub fn last_uses(function: &IrFunction) -> LastUses {
    LivenessAnalyzer::new().analyze(function)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::build::*;

    fn key(name: &str, point: usize) -> BindingKey {
        (name.to_string(), point)
    }

    #[test]
    fn test_simple_read_sequence() {
        let f = function(
            "f",
            vec![
                let_("v", new("String")), // 1
                let_("r", borrow("v")),   // 2
                use_("r"),                // 3
                use_("r"),                // 4
                eval(new("i32")),         // 5
            ],
        );
        let last = last_uses(&f);
        assert_eq!(last[&key("r", 2)], LastUse::At(4));
    }

    #[test]
    fn test_unused_binding_dies_at_declaration() {
        let f = function("f", vec![let_mut("v", new("Vec<i32>")), let_("r", borrow_mut("v"))]);
        assert_eq!(last_uses(&f)[&key("r", 2)], LastUse::At(2));
    }

    #[test]
    fn test_conservative_loop() {
        let f = function("f", vec![let_("v", new("String")), let_("r", borrow("v")), loop_(vec![use_("r")])]);
        assert_eq!(last_uses(&f)[&key("r", 2)], LastUse::ScopeEnd);
    }

    #[test]
    fn test_escaped_binding() {
        let mut f = function("f", vec![let_("r", var("x")), ret(Some(var("r")))]);
        f.params = vec![param("x", "&String")];
        let last = last_uses(&f);
        assert_eq!(last[&key("r", 1)], LastUse::ScopeEnd);
        assert_eq!(last[&key("x", 0)], LastUse::At(1));
    }

    #[test]
    fn test_shadowed_names_are_separate() {
        let f = function(
            "f",
            vec![
                let_("a", new("String")), // 1
                let_("r", borrow("a")),   // 2
                use_("r"),                // 3
                let_("r", borrow("a")),   // 4
                block(vec![use_("r")]),   // 5, 6
            ],
        );
        let last = last_uses(&f);
        assert_eq!(last[&key("r", 2)], LastUse::At(3));
        assert_eq!(last[&key("r", 4)], LastUse::At(6));
    }

    #[test]
    fn test_points_follow_statement_spans() {
        let body = vec![
            if_(vec![use_("a"), use_("a")], Some(vec![use_("a")])), // 2..5
            use_("a"),                                              // 6
        ];
        let mut stmts = vec![let_("a", new("i32"))];
        stmts.extend(body);
        let f = function("f", stmts);
        assert_eq!(crate::ir::block_span(&f.body), 6);
        assert_eq!(last_uses(&f)[&key("a", 1)], LastUse::At(6));
    }
}
