//! Borrow tracker: the "one exclusive or many shared" rule.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

use crate::analysis::scope::{Binding, BindingId, ScopeId};
use crate::debug_println;
use crate::diagnostics::BorrowError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BorrowKind {
    Shared,
    Exclusive,
}

impl fmt::Display for BorrowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BorrowKind::Shared => write!(f, "shared"),
            BorrowKind::Exclusive => write!(f, "exclusive"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct BorrowId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

#[derive(Debug, Clone, Serialize)]
pub struct Borrow {
    pub id: BorrowId,
    pub kind: BorrowKind,
    pub target: BindingId,
    /// Binding that stores the reference; `None` for a temporary
    pub holder: Option<BindingId>,
    pub scope: ScopeId,
    pub created_at: usize,
    pub released_at: Option<usize>,
}

/// Active borrows per target, in creation order.
pub type ActiveBorrows = BTreeMap<BindingId, Vec<BorrowId>>;

#[derive(Debug, Clone, Default)]
pub struct BorrowTracker {
    borrows: Vec<Borrow>,
    active: ActiveBorrows,
}

impl BorrowTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: BorrowId) -> &Borrow {
        &self.borrows[id.0]
    }

    pub fn borrow(
        &mut self,
        target: &Binding,
        kind: BorrowKind,
        scope: ScopeId,
        point: usize,
    ) -> Result<BorrowId, BorrowError> {
        if let Some(existing) = self.conflicting(target.id, kind) {
            debug_println!(
                "BORROW: Rejecting {} borrow of '{}' (already {} borrowed)",
                kind, target.name, existing
            );
            return Err(BorrowError::ConflictingBorrow {
                name: target.name.clone(),
                requested: kind,
                existing,
            });
        }
        let id = BorrowId(self.borrows.len());
        self.borrows.push(Borrow {
            id,
            kind,
            target: target.id,
            holder: None,
            scope,
            created_at: point,
            released_at: None,
        });
        self.active.entry(target.id).or_default().push(id);
        debug_println!("BORROW: {} borrow #{} of '{}' at point {}", kind, id.0, target.name, point);
        Ok(id)
    }

    /// The kind of an active borrow that `kind` would conflict with.
    fn conflicting(&self, target: BindingId, kind: BorrowKind) -> Option<BorrowKind> {
        let active = self.active.get(&target)?;
        let mut found = None;
        for id in active {
            let existing = self.borrows[id.0].kind;
            if existing == BorrowKind::Exclusive {
                return Some(BorrowKind::Exclusive);
            }
            if kind == BorrowKind::Exclusive {
                found = Some(existing);
            }
        }
        found
    }

    pub fn set_holder(&mut self, id: BorrowId, holder: BindingId) {
        self.borrows[id.0].holder = Some(holder);
    }

    pub fn release(&mut self, id: BorrowId, point: usize) {
        // Membership in the active set is authoritative: after a flow restore a
        // borrow may be active again even though another path released it.
        let target = self.borrows[id.0].target;
        let Some(list) = self.active.get_mut(&target) else {
            return;
        };
        if !list.contains(&id) {
            return;
        }
        list.retain(|b| *b != id);
        if list.is_empty() {
            self.active.remove(&target);
        }
        self.borrows[id.0].released_at = Some(point);
        debug_println!("BORROW: Released borrow #{} at point {}", id.0, point);
    }

    /// Releases every active borrow stored in `holder`.
    pub fn release_held_by(&mut self, holder: BindingId, point: usize) -> Vec<BorrowId> {
        let held = self.held_by(holder);
        for id in &held {
            self.release(*id, point);
        }
        held
    }

    /// Releases every active borrow of `target`.
    pub fn release_targeting(&mut self, target: BindingId, point: usize) {
        let ids = self.active.get(&target).cloned().unwrap_or_default();
        for id in ids {
            self.release(id, point);
        }
    }

    pub fn held_by(&self, holder: BindingId) -> Vec<BorrowId> {
        self.active
            .values()
            .flatten()
            .copied()
            .filter(|id| self.borrows[id.0].holder == Some(holder))
            .collect()
    }

    pub fn active_on(&self, target: BindingId) -> impl Iterator<Item = &Borrow> + '_ {
        self.active
            .get(&target)
            .into_iter()
            .flatten()
            .map(move |id| &self.borrows[id.0])
    }

    pub fn is_active(&self, id: BorrowId) -> bool {
        let target = self.borrows[id.0].target;
        self.active.get(&target).is_some_and(|ids| ids.contains(&id))
    }

    pub fn active_count(&self, target: BindingId) -> usize {
        self.active.get(&target).map_or(0, Vec::len)
    }

    pub fn all_active(&self) -> impl Iterator<Item = &Borrow> + '_ {
        self.active.values().flatten().map(move |id| &self.borrows[id.0])
    }

    /// A binding may be moved only while nothing borrows it.
    pub fn can_move(&self, target: BindingId) -> bool {
        self.active_count(target) == 0
    }

    /// Direct access to an owner. Reads conflict with an exclusive borrow,
    /// writes with any borrow.
    pub fn check_access(&self, target: &Binding, access: Access) -> Result<(), BorrowError> {
        let requested = match access {
            Access::Read => BorrowKind::Shared,
            Access::Write => BorrowKind::Exclusive,
        };
        match self.conflicting(target.id, requested) {
            Some(existing) => Err(BorrowError::ConflictingBorrow {
                name: target.name.clone(),
                requested,
                existing,
            }),
            None => Ok(()),
        }
    }

    pub fn active_set(&self) -> ActiveBorrows {
        self.active.clone()
    }

    pub fn restore_active(&mut self, active: ActiveBorrows) {
        self.active = active;
    }

    /// Union of two active sets; a borrow alive on either path stays alive.
    /// Borrows from different paths may then coexist on one target, e.g. an
    /// exclusive one from one branch and a shared one from the other. Later
    /// conflicts are reported against the strongest of them.
    pub fn join_active(a: &ActiveBorrows, b: &ActiveBorrows) -> ActiveBorrows {
        let mut out = a.clone();
        for (target, ids) in b {
            let entry = out.entry(*target).or_default();
            for id in ids {
                if !entry.contains(id) {
                    entry.push(*id);
                }
            }
            entry.sort();
        }
        out
    }
}
