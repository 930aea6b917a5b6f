//! Binding table and scope stack.
//!
//! Bindings and scopes live in arenas that only grow; shadowing adds a new
//! arena entry rather than replacing the old one. The lexical stack holds the
//! currently open scopes.

use serde::Serialize;
use std::collections::HashMap;

use crate::analysis::ownership::{DropCause, DropEngine};
use crate::analysis::types::ValueKind;
use crate::config::{CheckerConfig, ShadowingPolicy};
use crate::debug_println;
use crate::diagnostics::BorrowError;
use crate::ir::TypeExpr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct BindingId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ScopeId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BindingState {
    Uninitialized,
    /// Assigned on some paths only
    MaybeInitialized,
    Live,
    Moved { at: usize },
    Dropped { at: usize },
}

#[derive(Debug, Clone, Serialize)]
pub struct Binding {
    pub id: BindingId,
    pub name: String,
    pub ty: TypeExpr,
    pub kind: ValueKind,
    pub mutable: bool,
    pub state: BindingState,
    pub scope: ScopeId,
    pub declared_at: usize,
    pub is_parameter: bool,
}

impl Binding {
    pub fn is_live(&self) -> bool {
        self.state == BindingState::Live
    }

    pub fn owns_resource(&self) -> bool {
        self.kind.owns_resource()
    }

    pub fn is_dropped(&self) -> bool {
        matches!(self.state, BindingState::Dropped { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScopeKind {
    Function,
    Block,
    Branch,
    Loop,
    /// Body of a spawned thread. Name lookup does not see past it.
    Thread,
}

#[derive(Debug, Clone, Serialize)]
pub struct Scope {
    pub id: ScopeId,
    pub parent: Option<ScopeId>,
    pub depth: usize,
    pub kind: ScopeKind,
    pub opened_at: usize,
    pub closed_at: Option<usize>,
    /// Declaration order
    pub bindings: Vec<BindingId>,
    #[serde(skip)]
    names: HashMap<String, BindingId>,
}

/// Values a new binding starts with.
#[derive(Debug, Clone)]
pub struct NewBinding {
    pub name: String,
    pub ty: TypeExpr,
    pub kind: ValueKind,
    pub mutable: bool,
    pub state: BindingState,
    pub is_parameter: bool,
}

impl NewBinding {
    pub fn live(name: &str, ty: TypeExpr, kind: ValueKind, mutable: bool) -> Self {
        Self {
            name: name.to_string(),
            ty,
            kind,
            mutable,
            state: BindingState::Live,
            is_parameter: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScopeStack {
    bindings: Vec<Binding>,
    scopes: Vec<Scope>,
    stack: Vec<ScopeId>,
    shadowing: ShadowingPolicy,
    allow_parameter_shadowing: bool,
}

impl ScopeStack {
    pub fn new(config: &CheckerConfig) -> Self {
        Self {
            bindings: Vec::new(),
            scopes: Vec::new(),
            stack: Vec::new(),
            shadowing: config.shadowing,
            allow_parameter_shadowing: config.allow_parameter_shadowing,
        }
    }

    pub fn push_scope(&mut self, kind: ScopeKind, point: usize) -> ScopeId {
        let id = ScopeId(self.scopes.len());
        let parent = self.stack.last().copied();
        self.scopes.push(Scope {
            id,
            parent,
            depth: self.stack.len(),
            kind,
            opened_at: point,
            closed_at: None,
            bindings: Vec::new(),
            names: HashMap::new(),
        });
        self.stack.push(id);
        debug_println!("SCOPE: Push {:?} scope #{} at depth {}", kind, id.0, self.stack.len() - 1);
        id
    }

    pub fn current(&self) -> Option<ScopeId> {
        self.stack.last().copied()
    }

    /// Number of open scopes.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn scope(&self, id: ScopeId) -> &Scope {
        &self.scopes[id.0]
    }

    pub fn scopes(&self) -> &[Scope] {
        &self.scopes
    }

    pub fn is_open(&self, id: ScopeId) -> bool {
        self.stack.contains(&id)
    }

    pub fn binding(&self, id: BindingId) -> &Binding {
        &self.bindings[id.0]
    }

    pub fn binding_mut(&mut self, id: BindingId) -> &mut Binding {
        &mut self.bindings[id.0]
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    pub fn declare(&mut self, new: NewBinding, point: usize) -> Result<BindingId, BorrowError> {
        let scope_id = self.current().ok_or_else(|| BorrowError::ScopeMismatch {
            detail: format!("declaration of '{}' outside any scope", new.name),
        })?;

        if !self.allow_parameter_shadowing {
            if let Ok(existing) = self.lookup(&new.name) {
                if self.bindings[existing.0].is_parameter {
                    return Err(BorrowError::DuplicateBinding { name: new.name });
                }
            }
        }
        if self.shadowing == ShadowingPolicy::DenySameScope
            && self.scopes[scope_id.0].names.contains_key(&new.name)
        {
            return Err(BorrowError::DuplicateBinding { name: new.name });
        }

        let id = BindingId(self.bindings.len());
        debug_println!(
            "SCOPE: Declare '{}' #{} ({}, {:?}) in scope #{}",
            new.name, id.0, new.ty, new.kind, scope_id.0
        );
        let scope = &mut self.scopes[scope_id.0];
        scope.bindings.push(id);
        scope.names.insert(new.name.clone(), id);
        self.bindings.push(Binding {
            id,
            name: new.name,
            ty: new.ty,
            kind: new.kind,
            mutable: new.mutable,
            state: new.state,
            scope: scope_id,
            declared_at: point,
            is_parameter: new.is_parameter,
        });
        Ok(id)
    }

    /// Innermost-to-outermost resolution. Stops after a thread body scope:
    /// a thread sees only what it captured.
    pub fn lookup(&self, name: &str) -> Result<BindingId, BorrowError> {
        for scope_id in self.stack.iter().rev() {
            let scope = &self.scopes[scope_id.0];
            if let Some(id) = scope.names.get(name) {
                return Ok(*id);
            }
            if scope.kind == ScopeKind::Thread {
                break;
            }
        }
        Err(BorrowError::UnknownName {
            name: name.to_string(),
        })
    }

    /// Closes the innermost scope, finalizing its bindings in reverse
    /// declaration order. Returns them in that order.
    pub fn pop_scope(
        &mut self,
        id: ScopeId,
        engine: &mut DropEngine,
        point: usize,
    ) -> Result<Vec<BindingId>, BorrowError> {
        if self.current() != Some(id) {
            return Err(BorrowError::ScopeMismatch {
                detail: format!("pop of scope #{} which is not the innermost open scope", id.0),
            });
        }
        self.stack.pop();
        let cause = match self.scopes[id.0].kind {
            ScopeKind::Thread => DropCause::ThreadExit,
            _ => DropCause::ScopeExit,
        };
        let order: Vec<BindingId> = self.scopes[id.0].bindings.iter().rev().copied().collect();
        for binding_id in &order {
            engine.finalize(&mut self.bindings[binding_id.0], cause, point);
        }
        self.scopes[id.0].closed_at = Some(point);
        debug_println!("SCOPE: Pop scope #{} at point {}", id.0, point);
        Ok(order)
    }

    /// Finalizes every scope above `depth`, innermost first, without closing
    /// them lexically. Used for `return`, `break` and unwinding; the walk that
    /// follows is on a diverged path.
    pub fn unwind_to(
        &mut self,
        depth: usize,
        engine: &mut DropEngine,
        cause: DropCause,
        point: usize,
    ) -> Vec<BindingId> {
        let mut finalized = Vec::new();
        let open: Vec<ScopeId> = self.stack.iter().skip(depth).rev().copied().collect();
        for scope_id in open {
            let order: Vec<BindingId> = self.scopes[scope_id.0].bindings.iter().rev().copied().collect();
            for binding_id in order {
                let binding = &mut self.bindings[binding_id.0];
                let was_live = binding.is_live();
                engine.finalize(binding, cause, point);
                if was_live {
                    finalized.push(binding_id);
                }
            }
        }
        debug_println!("SCOPE: Unwound to depth {} ({:?}) at point {}", depth, cause, point);
        finalized
    }

    pub fn states(&self) -> Vec<BindingState> {
        self.bindings.iter().map(|b| b.state).collect()
    }

    /// Restores states saved by `states`. Bindings declared after the snapshot
    /// keep their current state.
    pub fn restore_states(&mut self, states: &[BindingState]) {
        for (binding, state) in self.bindings.iter_mut().zip(states) {
            binding.state = *state;
        }
    }

    /// Currently open scopes, outermost first.
    pub fn open_scopes(&self) -> &[ScopeId] {
        &self.stack
    }
}
