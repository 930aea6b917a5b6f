//! Per-function analysis state.
//!
//! Everything the checker mutates lives here and is passed explicitly; there
//! is no global state, so functions can be checked independently.

use std::collections::HashMap;

use crate::analysis::borrows::{ActiveBorrows, BorrowTracker};
use crate::analysis::lifetimes::{LifetimeSolver, PointsTo};
use crate::analysis::ownership::{DropCause, DropEngine, DropSnapshot};
use crate::analysis::scope::{BindingId, BindingState, ScopeId, ScopeKind, ScopeStack};
use crate::analysis::threads::ThreadTracker;
use crate::analysis::types::TypeRegistry;
use crate::config::CheckerConfig;
use crate::debug_println;
use crate::diagnostics::BorrowError;

pub struct AnalysisContext<'r> {
    pub registry: &'r TypeRegistry,
    pub scopes: ScopeStack,
    pub borrows: BorrowTracker,
    pub lifetimes: LifetimeSolver,
    pub drops: DropEngine,
    pub threads: ThreadTracker,
    /// The current path has returned, broken out or panicked
    pub diverged: bool,
}

/// Mutable state of one control-flow path.
#[derive(Debug, Clone)]
pub struct FlowState {
    states: Vec<BindingState>,
    active: ActiveBorrows,
    points_to: HashMap<BindingId, PointsTo>,
    drops: DropSnapshot,
    threads: ThreadTracker,
    pub diverged: bool,
}

impl<'r> AnalysisContext<'r> {
    pub fn new(registry: &'r TypeRegistry, config: &CheckerConfig) -> Self {
        Self {
            registry,
            scopes: ScopeStack::new(config),
            borrows: BorrowTracker::new(),
            lifetimes: LifetimeSolver::new(),
            drops: DropEngine::new(),
            threads: ThreadTracker::new(),
            diverged: false,
        }
    }

    pub fn push_scope(&mut self, kind: ScopeKind, point: usize) -> ScopeId {
        let parent = self.scopes.current();
        let id = self.scopes.push_scope(kind, point);
        self.lifetimes.add_scope(id, parent);
        id
    }

    /// Closes a scope: finalizes its bindings and ends every borrow they hold
    /// or are the target of. The scope is popped even when the thread check
    /// fails, so the lexical stack stays balanced.
    pub fn pop_scope(&mut self, id: ScopeId, point: usize) -> Result<(), BorrowError> {
        let bindings = self.scopes.scope(id).bindings.clone();
        let escape = self.threads.check_release(&bindings, &self.borrows, &self.scopes);
        for binding in &bindings {
            self.borrows.release_held_by(*binding, point);
        }
        self.scopes.pop_scope(id, &mut self.drops, point)?;
        for binding in &bindings {
            self.borrows.release_targeting(*binding, point);
        }
        escape
    }

    /// Early exit to `depth`: finalizes every binding above it and marks the
    /// path diverged.
    pub fn unwind_to(&mut self, depth: usize, cause: DropCause, point: usize) -> Result<(), BorrowError> {
        let pending: Vec<BindingId> = self
            .scopes
            .open_scopes()
            .iter()
            .skip(depth)
            .flat_map(|scope| self.scopes.scope(*scope).bindings.clone())
            .collect();
        let escape = self.threads.check_release(&pending, &self.borrows, &self.scopes);
        let finalized = self.scopes.unwind_to(depth, &mut self.drops, cause, point);
        for binding in &pending {
            self.borrows.release_held_by(*binding, point);
        }
        for binding in &finalized {
            self.borrows.release_targeting(*binding, point);
        }
        self.diverged = true;
        escape
    }

    pub fn snapshot(&self) -> FlowState {
        FlowState {
            states: self.scopes.states(),
            active: self.borrows.active_set(),
            points_to: self.lifetimes.snapshot(),
            drops: self.drops.snapshot(),
            threads: self.threads.snapshot(),
            diverged: self.diverged,
        }
    }

    pub fn restore(&mut self, state: &FlowState) {
        self.scopes.restore_states(&state.states);
        self.borrows.restore_active(state.active.clone());
        self.lifetimes.restore(state.points_to.clone());
        self.drops.restore(&state.drops);
        self.threads.restore(state.threads.clone());
        self.diverged = state.diverged;
    }

    /// Merges the paths that reach a join point and makes the result the
    /// current state. A binding moved on some paths but live on others is
    /// moved afterwards and gets a drop flag, released when its scope ends.
    pub fn join_flows(&mut self, flows: Vec<FlowState>) {
        let mut live: Vec<FlowState> = flows.iter().filter(|f| !f.diverged).cloned().collect();
        if live.is_empty() {
            if let Some(first) = flows.into_iter().next() {
                self.restore(&first);
            }
            self.diverged = true;
            return;
        }

        let mut merged = live.remove(0);
        for other in live {
            merged = self.join_pair(merged, other);
        }
        self.restore(&merged);
    }

    fn join_pair(&self, a: FlowState, b: FlowState) -> FlowState {
        let len = a.states.len().max(b.states.len());
        let mut states = Vec::with_capacity(len);
        let mut flagged = Vec::new();
        for i in 0..len {
            let state = match (a.states.get(i), b.states.get(i)) {
                (Some(x), Some(y)) => {
                    let live_side = match (x, y) {
                        (BindingState::Live, other) if is_unavailable(*other) => Some(&a),
                        (other, BindingState::Live) if is_unavailable(*other) => Some(&b),
                        _ => None,
                    };
                    if let Some(side) = live_side {
                        let id = BindingId(i);
                        let binding = self.scopes.binding(id);
                        let guard = side.drops.is_guard(id);
                        let holds = side.drops.holding(id).is_some_and(|h| !h.is_empty());
                        if binding.owns_resource() || guard || holds {
                            debug_println!("DROP: '{}' needs a drop flag at this join", binding.name);
                            flagged.push((id, guard));
                        }
                    }
                    join_state(*x, *y)
                }
                (Some(x), None) | (None, Some(x)) => *x,
                (None, None) => BindingState::Uninitialized,
            };
            states.push(state);
        }
        let mut drops = DropSnapshot::join(&a.drops, &b.drops);
        for (id, guard) in flagged {
            drops.set_flag(id, guard);
        }
        FlowState {
            states,
            active: BorrowTracker::join_active(&a.active, &b.active),
            points_to: LifetimeSolver::join(&a.points_to, &b.points_to),
            drops,
            threads: ThreadTracker::join_flows(&a.threads, &b.threads),
            diverged: false,
        }
    }
}

fn is_unavailable(state: BindingState) -> bool {
    matches!(
        state,
        BindingState::Moved { .. } | BindingState::Uninitialized | BindingState::MaybeInitialized
    )
}

/// A value is available after a join only if it is available on every path.
fn join_state(a: BindingState, b: BindingState) -> BindingState {
    use BindingState::*;
    match (a, b) {
        (Live, Live) => Live,
        (Moved { at: x }, Moved { at: y }) => Moved { at: x.min(y) },
        (Moved { at }, _) | (_, Moved { at }) => Moved { at },
        (Uninitialized, Uninitialized) => Uninitialized,
        (Uninitialized | MaybeInitialized, Live | Uninitialized | MaybeInitialized)
        | (Live, Uninitialized | MaybeInitialized) => MaybeInitialized,
        (Dropped { at: x }, Dropped { at: y }) => Dropped { at: x.min(y) },
        (Dropped { at }, _) | (_, Dropped { at }) => Dropped { at },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::borrows::BorrowKind;
    use crate::analysis::scope::NewBinding;
    use crate::analysis::types::ValueKind;
    use crate::ir::build::ty;

    #[test]
    fn test_join_state_prefers_unavailable() {
        assert_eq!(join_state(BindingState::Live, BindingState::Live), BindingState::Live);
        assert_eq!(
            join_state(BindingState::Live, BindingState::Moved { at: 3 }),
            BindingState::Moved { at: 3 }
        );
        assert_eq!(
            join_state(BindingState::Uninitialized, BindingState::Live),
            BindingState::MaybeInitialized
        );
        assert_eq!(
            join_state(BindingState::Uninitialized, BindingState::Uninitialized),
            BindingState::Uninitialized
        );
        assert_eq!(
            join_state(BindingState::MaybeInitialized, BindingState::Moved { at: 4 }),
            BindingState::Moved { at: 4 }
        );
    }

    #[test]
    fn test_conditional_move_gets_drop_flag() {
        let registry = TypeRegistry::new();
        let mut ctx = AnalysisContext::new(&registry, &CheckerConfig::default());
        let scope = ctx.push_scope(ScopeKind::Function, 0);
        let s = ctx
            .scopes
            .declare(NewBinding::live("s", ty("String"), ValueKind::Owning, false), 1)
            .unwrap();

        let entry = ctx.snapshot();
        let moved = ctx.drops.move_out(ctx.scopes.binding_mut(s), &ctx.borrows, 2).unwrap();
        assert!(!moved.copied);
        let then_state = ctx.snapshot();
        ctx.restore(&entry);
        assert!(ctx.scopes.binding(s).is_live());

        ctx.join_flows(vec![then_state, entry]);
        assert_eq!(ctx.scopes.binding(s).state, BindingState::Moved { at: 2 });
        assert!(ctx.drops.has_flag(s));
        assert!(ctx.drops.log().is_empty());

        let t = ctx
            .scopes
            .declare(NewBinding::live("t", ty("String"), ValueKind::Owning, false), 3)
            .unwrap();
        ctx.pop_scope(scope, 4).unwrap();
        let order: Vec<_> = ctx.drops.log().iter().map(|e| (e.binding, e.cause)).collect();
        assert_eq!(
            order,
            vec![(Some(t), DropCause::ScopeExit), (Some(s), DropCause::ConditionalDrop)]
        );
    }

    #[test]
    fn test_pop_scope_releases_borrows() {
        let registry = TypeRegistry::new();
        let mut ctx = AnalysisContext::new(&registry, &CheckerConfig::default());
        let outer = ctx.push_scope(ScopeKind::Function, 0);
        let v = ctx
            .scopes
            .declare(NewBinding::live("v", ty("Vec<i32>"), ValueKind::Owning, true), 1)
            .unwrap();
        let inner = ctx.push_scope(ScopeKind::Block, 2);
        let r = ctx
            .scopes
            .declare(NewBinding::live("r", ty("&mut Vec<i32>"), ValueKind::Move, false), 3)
            .unwrap();
        let borrow = ctx
            .borrows
            .borrow(ctx.scopes.binding(v), BorrowKind::Exclusive, outer, 3)
            .unwrap();
        ctx.borrows.set_holder(borrow, r);
        assert!(!ctx.borrows.can_move(v));

        ctx.pop_scope(inner, 4).unwrap();
        assert!(ctx.borrows.can_move(v));
    }

    #[test]
    fn test_unwind_marks_path_diverged() {
        let registry = TypeRegistry::new();
        let mut ctx = AnalysisContext::new(&registry, &CheckerConfig::default());
        ctx.push_scope(ScopeKind::Function, 0);
        ctx.scopes
            .declare(NewBinding::live("s", ty("String"), ValueKind::Owning, false), 1)
            .unwrap();
        ctx.unwind_to(0, DropCause::EarlyReturn, 2).unwrap();
        assert!(ctx.diverged);
        assert_eq!(ctx.drops.log().len(), 1);

        let diverged = ctx.snapshot();
        ctx.join_flows(vec![diverged]);
        assert!(ctx.diverged);
    }
}
