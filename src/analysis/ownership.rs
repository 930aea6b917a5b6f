//! Move/drop engine.
//!
//! Per binding: `Live -> Moved` on a by-value use of a non-`Copy` value, or
//! `Live -> Dropped` when its scope ends. Scope exit (`finalize`) releases a
//! binding at most once: either it is still `Live`, or it carries a drop flag
//! because it was moved on some paths only.
//!
//! `Rc`/`Arc` allocations are tracked as cells with a strong count; the
//! payload is released when the last owning handle is finalized.

use serde::Serialize;
use std::collections::{HashMap, HashSet};

use crate::analysis::borrows::BorrowTracker;
use crate::analysis::scope::{Binding, BindingId, BindingState};
use crate::analysis::types::SharedKind;
use crate::debug_println;
use crate::diagnostics::BorrowError;
use crate::ir::TypeExpr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DropCause {
    ScopeExit,
    EarlyReturn,
    Break,
    Unwind,
    ThreadExit,
    /// Old value of a binding that is assigned a new one
    Reassigned,
    /// Drop on the paths where a conditionally-moved value is still live
    ConditionalDrop,
    /// Unbound result of an expression statement
    Temporary,
    /// Passed by value to a function, which releases it
    Consumed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DropAction {
    Release,
    Unlock,
    DecrementStrong { cell: CellId, remaining: usize },
    ReleaseShared { cell: CellId },
    DecrementWeak { cell: CellId, remaining: usize },
}

impl DropAction {
    /// Whether this action frees a resource (as opposed to adjusting a count).
    pub fn is_release(&self) -> bool {
        matches!(self, DropAction::Release | DropAction::ReleaseShared { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DropEvent {
    /// `None` for temporaries
    pub binding: Option<BindingId>,
    pub name: String,
    pub ty: String,
    pub point: usize,
    pub cause: DropCause,
    pub actions: Vec<DropAction>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CellId(pub usize);

#[derive(Debug, Clone, Serialize)]
pub struct SharedCell {
    pub id: CellId,
    pub kind: SharedKind,
    pub payload: String,
    pub allocated_at: usize,
    pub counts: CellCounts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CellCounts {
    pub strong: usize,
    pub weak: usize,
    pub released_at: Option<usize>,
}

/// Reference-count cells a value keeps alive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Holding {
    /// Strong references to these cells
    pub cells: Vec<CellId>,
    /// Weak references to these cells
    pub weak: Vec<CellId>,
    /// The value is itself an `Rc`/`Arc` handle rather than an aggregate
    pub is_handle: bool,
}

impl Holding {
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty() && self.weak.is_empty()
    }

    pub fn merge(&mut self, other: Holding) {
        self.cells.extend(other.cells);
        self.weak.extend(other.weak);
    }
}

/// What a by-value use hands to its destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MovedValue {
    pub from: BindingId,
    pub copied: bool,
    pub holding: Holding,
    pub guard: bool,
}

/// Value a binding may or may not still hold after a join. It is released
/// when the binding's scope ends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DropFlag {
    pub holding: Holding,
    pub guard: bool,
}

/// Flow-sensitive part of the engine, saved and restored around branches.
#[derive(Debug, Clone, Default)]
pub struct DropSnapshot {
    counts: Vec<CellCounts>,
    holdings: HashMap<BindingId, Holding>,
    guards: HashSet<BindingId>,
    flags: HashMap<BindingId, DropFlag>,
}

impl DropSnapshot {
    pub fn holding(&self, id: BindingId) -> Option<&Holding> {
        self.holdings.get(&id)
    }

    pub fn is_guard(&self, id: BindingId) -> bool {
        self.guards.contains(&id)
    }

    pub fn has_flag(&self, id: BindingId) -> bool {
        self.flags.contains_key(&id)
    }

    /// Moves the value `id` holds on this path into a drop flag.
    pub fn set_flag(&mut self, id: BindingId, guard: bool) {
        let holding = self.holdings.remove(&id).unwrap_or_default();
        self.guards.remove(&id);
        debug_println!("DROP: Binding #{} gets a drop flag", id.0);
        self.flags.entry(id).or_insert(DropFlag { holding, guard });
    }

    /// A cell stays alive if it is alive on either path.
    pub fn join(a: &DropSnapshot, b: &DropSnapshot) -> DropSnapshot {
        let len = a.counts.len().max(b.counts.len());
        let counts = (0..len)
            .map(|i| match (a.counts.get(i), b.counts.get(i)) {
                (Some(x), Some(y)) => CellCounts {
                    strong: x.strong.max(y.strong),
                    weak: x.weak.max(y.weak),
                    released_at: match (x.released_at, y.released_at) {
                        (Some(p), Some(q)) => Some(p.min(q)),
                        _ => None,
                    },
                },
                (Some(x), None) | (None, Some(x)) => *x,
                (None, None) => unreachable!("index below the longer length"),
            })
            .collect();
        let mut holdings = a.holdings.clone();
        for (id, holding) in &b.holdings {
            holdings.entry(*id).or_insert_with(|| holding.clone());
        }
        let guards = a.guards.union(&b.guards).copied().collect();
        let mut flags = a.flags.clone();
        for (id, flag) in &b.flags {
            flags.entry(*id).or_insert_with(|| flag.clone());
        }
        DropSnapshot {
            counts,
            holdings,
            guards,
            flags,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DropEngine {
    log: Vec<DropEvent>,
    cells: Vec<SharedCell>,
    holdings: HashMap<BindingId, Holding>,
    guards: HashSet<BindingId>,
    flags: HashMap<BindingId, DropFlag>,
}

impl DropEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self) -> &[DropEvent] {
        &self.log
    }

    pub fn log_len(&self) -> usize {
        self.log.len()
    }

    /// Forgets events recorded since `len`. Used when a loop body is walked a
    /// second time only to find errors.
    pub fn truncate_log(&mut self, len: usize) {
        self.log.truncate(len);
    }

    pub fn cells(&self) -> &[SharedCell] {
        &self.cells
    }

    pub fn holding(&self, id: BindingId) -> Option<&Holding> {
        self.holdings.get(&id)
    }

    pub fn is_guard(&self, id: BindingId) -> bool {
        self.guards.contains(&id)
    }

    pub fn has_flag(&self, id: BindingId) -> bool {
        self.flags.contains_key(&id)
    }

    /// Fails unless the binding currently holds a value.
    pub fn check_usable(binding: &Binding) -> Result<(), BorrowError> {
        match binding.state {
            BindingState::Live => Ok(()),
            BindingState::Uninitialized => Err(BorrowError::UseOfUninitialized {
                name: binding.name.clone(),
            }),
            BindingState::Moved { at } => Err(BorrowError::UseOfMovedValue {
                name: binding.name.clone(),
                moved_at: at,
            }),
            BindingState::MaybeInitialized => Err(BorrowError::UseOfUninitialized {
                name: binding.name.clone(),
            }),
            BindingState::Dropped { at } => Err(BorrowError::UseOfDroppedValue {
                name: binding.name.clone(),
                dropped_at: at,
            }),
        }
    }

    pub fn move_out(
        &mut self,
        binding: &mut Binding,
        tracker: &BorrowTracker,
        point: usize,
    ) -> Result<MovedValue, BorrowError> {
        Self::check_usable(binding)?;
        if binding.kind.is_copy() {
            return Ok(MovedValue {
                from: binding.id,
                copied: true,
                holding: Holding::default(),
                guard: false,
            });
        }
        if !tracker.can_move(binding.id) {
            return Err(BorrowError::MovedWhileBorrowed {
                name: binding.name.clone(),
                borrows: tracker.active_count(binding.id),
            });
        }
        binding.state = BindingState::Moved { at: point };
        debug_println!("DROP: Moved out of '{}' at point {}", binding.name, point);
        Ok(MovedValue {
            from: binding.id,
            copied: false,
            holding: self.holdings.remove(&binding.id).unwrap_or_default(),
            guard: self.guards.remove(&binding.id),
        })
    }

    /// Gives a freshly declared binding the cells and guard role of its value.
    pub fn attach(&mut self, to: BindingId, holding: Holding, guard: bool) {
        if !holding.is_empty() || holding.is_handle {
            self.holdings.insert(to, holding);
        }
        if guard {
            self.guards.insert(to);
        }
    }

    pub fn allocate_shared(&mut self, kind: SharedKind, payload: &TypeExpr, point: usize) -> CellId {
        let id = CellId(self.cells.len());
        self.cells.push(SharedCell {
            id,
            kind,
            payload: payload.to_string(),
            allocated_at: point,
            counts: CellCounts {
                strong: 1,
                weak: 0,
                released_at: None,
            },
        });
        debug_println!("DROP: Allocated {:?} cell #{} for {}", kind, id.0, payload);
        id
    }

    /// Deep duplication: a clone holds one more strong reference to every
    /// cell the source holds, and owns its own release otherwise.
    pub fn clone_holding(&mut self, from: BindingId) -> Holding {
        let holding = self.holdings.get(&from).cloned().unwrap_or_default();
        for cell in &holding.cells {
            self.cells[cell.0].counts.strong += 1;
        }
        for cell in &holding.weak {
            self.cells[cell.0].counts.weak += 1;
        }
        holding
    }

    /// A weak (non-owning) reference to every cell held by `from`.
    pub fn downgrade(&mut self, from: BindingId) -> Holding {
        let cells = self
            .holdings
            .get(&from)
            .map(|h| h.cells.clone())
            .unwrap_or_default();
        for cell in &cells {
            self.cells[cell.0].counts.weak += 1;
        }
        Holding {
            cells: Vec::new(),
            weak: cells,
            is_handle: true,
        }
    }

    /// Scope-exit processing for one binding. A live binding always ends up
    /// `Dropped`, but only values that own something produce an event. A
    /// binding that is not live releases its drop flag, if any.
    pub fn finalize(&mut self, binding: &mut Binding, cause: DropCause, point: usize) -> Option<DropEvent> {
        if !binding.is_live() {
            return self.release_flag(binding, point);
        }
        binding.state = BindingState::Dropped { at: point };
        let holding = self.holdings.remove(&binding.id).unwrap_or_default();
        let guard = self.guards.remove(&binding.id);
        self.emit(Some(binding.id), &binding.name, &binding.ty, binding.owns_resource(), holding, guard, cause, point)
    }

    /// Releases what a conditionally-moved or conditionally-initialized
    /// binding may still hold.
    pub fn release_flag(&mut self, binding: &Binding, point: usize) -> Option<DropEvent> {
        let flag = self.flags.remove(&binding.id)?;
        self.emit(
            Some(binding.id),
            &binding.name,
            &binding.ty,
            binding.owns_resource(),
            flag.holding,
            flag.guard,
            DropCause::ConditionalDrop,
            point,
        )
    }

    /// Drop of a value that was never bound to a name.
    pub fn release_value(
        &mut self,
        ty: &TypeExpr,
        owns_resource: bool,
        holding: Holding,
        guard: bool,
        cause: DropCause,
        point: usize,
    ) -> Option<DropEvent> {
        let name = match cause {
            DropCause::Consumed => "<argument>",
            _ => "<temporary>",
        };
        self.emit(None, name, ty, owns_resource, holding, guard, cause, point)
    }

    #[allow(clippy::too_many_arguments)]
    fn emit(
        &mut self,
        binding: Option<BindingId>,
        name: &str,
        ty: &TypeExpr,
        owns_resource: bool,
        holding: Holding,
        guard: bool,
        cause: DropCause,
        point: usize,
    ) -> Option<DropEvent> {
        let mut actions = Vec::new();
        if guard {
            actions.push(DropAction::Unlock);
        } else if owns_resource && !holding.is_handle {
            actions.push(DropAction::Release);
        }
        for cell in &holding.cells {
            actions.push(self.decrement_strong(*cell, point));
        }
        for cell in &holding.weak {
            let counts = &mut self.cells[cell.0].counts;
            counts.weak = counts.weak.saturating_sub(1);
            actions.push(DropAction::DecrementWeak {
                cell: *cell,
                remaining: counts.weak,
            });
        }
        if actions.is_empty() {
            return None;
        }
        let event = DropEvent {
            binding,
            name: name.to_string(),
            ty: ty.to_string(),
            point,
            cause,
            actions,
        };
        debug_println!("DROP: {:?} '{}' at point {}: {:?}", cause, name, point, event.actions);
        self.log.push(event.clone());
        Some(event)
    }

    fn decrement_strong(&mut self, cell: CellId, point: usize) -> DropAction {
        let counts = &mut self.cells[cell.0].counts;
        counts.strong = counts.strong.saturating_sub(1);
        if counts.strong == 0 && counts.released_at.is_none() {
            counts.released_at = Some(point);
            DropAction::ReleaseShared { cell }
        } else {
            DropAction::DecrementStrong {
                cell,
                remaining: counts.strong,
            }
        }
    }

    pub fn snapshot(&self) -> DropSnapshot {
        DropSnapshot {
            counts: self.cells.iter().map(|c| c.counts).collect(),
            holdings: self.holdings.clone(),
            guards: self.guards.clone(),
            flags: self.flags.clone(),
        }
    }

    /// Cells allocated after the snapshot keep their current counts.
    pub fn restore(&mut self, snapshot: &DropSnapshot) {
        for (cell, counts) in self.cells.iter_mut().zip(&snapshot.counts) {
            cell.counts = *counts;
        }
        self.holdings = snapshot.holdings.clone();
        self.guards = snapshot.guards.clone();
        self.flags = snapshot.flags.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::borrows::BorrowKind;
    use crate::analysis::scope::ScopeId;
    use crate::analysis::types::ValueKind;
    use crate::diagnostics::ErrorKind;

    fn binding(id: usize, name: &str, ty: &str, kind: ValueKind) -> Binding {
        Binding {
            id: BindingId(id),
            name: name.to_string(),
            ty: crate::ir::build::ty(ty),
            kind,
            mutable: false,
            state: BindingState::Live,
            scope: ScopeId(0),
            declared_at: 0,
            is_parameter: false,
        }
    }

    #[test]
    fn test_move_then_use_is_rejected() {
        let mut engine = DropEngine::new();
        let tracker = BorrowTracker::new();
        let mut a = binding(0, "a", "String", ValueKind::Owning);
        let moved = engine.move_out(&mut a, &tracker, 1).unwrap();
        assert!(!moved.copied);
        assert_eq!(a.state, BindingState::Moved { at: 1 });
        let err = engine.move_out(&mut a, &tracker, 2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UseOfMovedValue);
    }

    #[test]
    fn test_copy_leaves_source_live() {
        let mut engine = DropEngine::new();
        let tracker = BorrowTracker::new();
        let mut n = binding(0, "n", "i32", ValueKind::Copy);
        assert!(engine.move_out(&mut n, &tracker, 1).unwrap().copied);
        assert!(n.is_live());
    }

    #[test]
    fn test_move_while_borrowed() {
        let mut engine = DropEngine::new();
        let mut tracker = BorrowTracker::new();
        let mut a = binding(0, "a", "Vec<i32>", ValueKind::Owning);
        tracker.borrow(&a, BorrowKind::Shared, ScopeId(0), 0).unwrap();
        let err = engine.move_out(&mut a, &tracker, 1).unwrap_err();
        assert_eq!(err, BorrowError::MovedWhileBorrowed { name: "a".to_string(), borrows: 1 });
        assert!(a.is_live());
    }

    #[test]
    fn test_finalize_runs_once() {
        let mut engine = DropEngine::new();
        let mut a = binding(0, "a", "String", ValueKind::Owning);
        assert!(engine.finalize(&mut a, DropCause::ScopeExit, 3).is_some());
        assert!(engine.finalize(&mut a, DropCause::ScopeExit, 4).is_none());
        assert_eq!(engine.log().len(), 1);
        assert_eq!(engine.log()[0].actions, vec![DropAction::Release]);
    }

    #[test]
    fn test_finalize_skips_moved_and_non_owning() {
        let mut engine = DropEngine::new();
        let tracker = BorrowTracker::new();
        let mut a = binding(0, "a", "String", ValueKind::Owning);
        engine.move_out(&mut a, &tracker, 1).unwrap();
        assert!(engine.finalize(&mut a, DropCause::ScopeExit, 2).is_none());

        let mut n = binding(1, "n", "i32", ValueKind::Copy);
        assert!(engine.finalize(&mut n, DropCause::ScopeExit, 2).is_none());
        assert!(n.is_dropped());
        assert!(engine.log().is_empty());
    }

    #[test]
    fn test_shared_payload_released_by_last_handle() {
        let mut engine = DropEngine::new();
        let mut first = binding(0, "a", "Arc<String>", ValueKind::Owning);
        let mut second = binding(1, "b", "Arc<String>", ValueKind::Owning);
        let cell = engine.allocate_shared(SharedKind::Arc, &first.ty, 0);
        engine.attach(first.id, Holding { cells: vec![cell], weak: vec![], is_handle: true }, false);
        let cloned = engine.clone_holding(first.id);
        engine.attach(second.id, cloned, false);
        assert_eq!(engine.cells()[0].counts.strong, 2);

        let e1 = engine.finalize(&mut second, DropCause::ScopeExit, 5).unwrap();
        assert_eq!(e1.actions, vec![DropAction::DecrementStrong { cell, remaining: 1 }]);
        let e2 = engine.finalize(&mut first, DropCause::ScopeExit, 6).unwrap();
        assert_eq!(e2.actions, vec![DropAction::ReleaseShared { cell }]);
        assert_eq!(engine.cells()[0].counts.released_at, Some(6));
    }

    #[test]
    fn test_weak_handle_never_releases() {
        let mut engine = DropEngine::new();
        let mut strong = binding(0, "s", "Rc<String>", ValueKind::Owning);
        let mut weak = binding(1, "w", "Weak<String>", ValueKind::Move);
        let cell = engine.allocate_shared(SharedKind::Rc, &strong.ty, 0);
        engine.attach(strong.id, Holding { cells: vec![cell], weak: vec![], is_handle: true }, false);
        let back = engine.downgrade(strong.id);
        engine.attach(weak.id, back, false);

        let event = engine.finalize(&mut weak, DropCause::ScopeExit, 2).unwrap();
        assert!(event.actions.iter().all(|a| !a.is_release()));
        let event = engine.finalize(&mut strong, DropCause::ScopeExit, 3).unwrap();
        assert_eq!(event.actions, vec![DropAction::ReleaseShared { cell }]);
    }

    #[test]
    fn test_guard_unlocks() {
        let mut engine = DropEngine::new();
        let mut guard = binding(0, "g", "MutexGuard<i32>", ValueKind::Owning);
        engine.attach(guard.id, Holding::default(), true);
        let event = engine.finalize(&mut guard, DropCause::ScopeExit, 1).unwrap();
        assert_eq!(event.actions, vec![DropAction::Unlock]);
    }

    #[test]
    fn test_snapshot_join_keeps_cell_alive_on_either_path() {
        let mut engine = DropEngine::new();
        let cell = engine.allocate_shared(SharedKind::Rc, &TypeExpr::named("i32"), 0);
        let before = engine.snapshot();
        engine.cells[cell.0].counts.strong = 0;
        engine.cells[cell.0].counts.released_at = Some(4);
        let after = engine.snapshot();
        let joined = DropSnapshot::join(&before, &after);
        engine.restore(&joined);
        assert_eq!(engine.cells()[0].counts.strong, 1);
        assert_eq!(engine.cells()[0].counts.released_at, None);
    }

    #[test]
    fn test_drop_flag_released_at_scope_exit() {
        let mut engine = DropEngine::new();
        let tracker = BorrowTracker::new();
        let mut s = binding(0, "s", "String", ValueKind::Owning);
        let mut snapshot = engine.snapshot();
        snapshot.set_flag(s.id, false);
        engine.restore(&snapshot);
        engine.move_out(&mut s, &tracker, 2).unwrap();
        assert!(engine.has_flag(s.id));
        assert!(engine.log().is_empty());

        let event = engine.finalize(&mut s, DropCause::ScopeExit, 7).unwrap();
        assert_eq!(event.cause, DropCause::ConditionalDrop);
        assert_eq!(event.point, 7);
        assert_eq!(event.actions, vec![DropAction::Release]);
        assert!(engine.finalize(&mut s, DropCause::ScopeExit, 8).is_none());
    }

    #[test]
    fn test_use_after_drop_names_the_binding() {
        let mut engine = DropEngine::new();
        let mut a = binding(0, "a", "String", ValueKind::Owning);
        engine.finalize(&mut a, DropCause::ScopeExit, 3);
        let err = DropEngine::check_usable(&a).unwrap_err();
        assert_eq!(
            err,
            BorrowError::UseOfDroppedValue {
                name: "a".to_string(),
                dropped_at: 3,
            }
        );
        assert_eq!(err.kind(), ErrorKind::UseOfMovedValue);
    }
}
