//! Thread-boundary extension of the ownership model.
//!
//! A spawn moves `move` captures into the thread body and turns reference
//! captures into borrows held by the join handle. Those borrows must end
//! (by joining) before any captured value goes out of scope.

use std::collections::BTreeMap;

use crate::analysis::borrows::{BorrowId, BorrowTracker};
use crate::analysis::scope::{Binding, BindingId, ScopeStack};
use crate::analysis::types::TypeRegistry;
use crate::debug_println;
use crate::diagnostics::BorrowError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadHandle {
    pub borrows: Vec<BorrowId>,
    pub spawned_at: usize,
    pub joined: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ThreadTracker {
    handles: BTreeMap<BindingId, ThreadHandle>,
}

impl ThreadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Rc`, or anything containing one, must not cross a thread boundary.
    pub fn check_capture(registry: &TypeRegistry, binding: &Binding) -> Result<(), BorrowError> {
        if registry.is_thread_safe(&binding.ty) {
            Ok(())
        } else {
            Err(BorrowError::NotThreadSafe {
                name: binding.name.clone(),
                ty: binding.ty.to_string(),
            })
        }
    }

    /// In-place mutation of a reference-counted payload needs a lock.
    pub fn check_mutation(registry: &TypeRegistry, binding: &Binding) -> Result<(), BorrowError> {
        match registry.shared_kind(binding.ty.referent()) {
            Some(kind) => Err(BorrowError::UnsynchronizedMutation {
                name: binding.name.clone(),
                detail: format!(" (the payload is shared through `{:?}`)", kind),
            }),
            None => Ok(()),
        }
    }

    pub fn register(&mut self, handle: BindingId, borrows: Vec<BorrowId>, point: usize) {
        debug_println!("THREAD: Spawned handle #{} holding {} borrow(s)", handle.0, borrows.len());
        self.handles.insert(
            handle,
            ThreadHandle {
                borrows,
                spawned_at: point,
                joined: false,
            },
        );
    }

    pub fn is_handle(&self, id: BindingId) -> bool {
        self.handles.contains_key(&id)
    }

    /// Marks the thread joined and returns the borrows that end with it.
    pub fn join(&mut self, handle: BindingId) -> Option<Vec<BorrowId>> {
        let info = self.handles.get_mut(&handle)?;
        info.joined = true;
        debug_println!("THREAD: Joined handle #{}", handle.0);
        Some(std::mem::take(&mut info.borrows))
    }

    /// The handle was moved into another binding.
    pub fn transfer(&mut self, from: BindingId, to: BindingId) {
        if let Some(info) = self.handles.remove(&from) {
            self.handles.insert(to, info);
        }
    }

    /// Checks an upcoming release of `released` bindings: an unjoined thread
    /// may neither lose its handle nor outlive a value it borrows.
    pub fn check_release(
        &self,
        released: &[BindingId],
        tracker: &BorrowTracker,
        scopes: &ScopeStack,
    ) -> Result<(), BorrowError> {
        for (handle, info) in &self.handles {
            if info.joined {
                continue;
            }
            let active: Vec<BindingId> = info
                .borrows
                .iter()
                .filter(|id| tracker.is_active(**id))
                .map(|id| tracker.get(*id).target)
                .collect();
            let Some(first) = active.first() else {
                continue;
            };
            if released.contains(handle) && scopes.binding(*handle).is_live() {
                return Err(BorrowError::ThreadBorrowEscapes {
                    name: scopes.binding(*first).name.clone(),
                });
            }
            if let Some(target) = active.iter().find(|t| released.contains(t)) {
                return Err(BorrowError::ThreadBorrowEscapes {
                    name: scopes.binding(*target).name.clone(),
                });
            }
        }
        Ok(())
    }

    /// First value still borrowed by `handle` if it is an unjoined thread.
    pub fn unjoined_target(&self, handle: BindingId, tracker: &BorrowTracker) -> Option<BindingId> {
        let info = self.handles.get(&handle).filter(|info| !info.joined)?;
        info.borrows
            .iter()
            .find(|id| tracker.is_active(**id))
            .map(|id| tracker.get(*id).target)
    }

    pub fn snapshot(&self) -> ThreadTracker {
        self.clone()
    }

    pub fn restore(&mut self, snapshot: ThreadTracker) {
        *self = snapshot;
    }

    /// A thread counts as joined only if it was joined on both paths.
    pub fn join_flows(a: &ThreadTracker, b: &ThreadTracker) -> ThreadTracker {
        let mut handles = a.handles.clone();
        for (id, info) in &b.handles {
            handles
                .entry(*id)
                .and_modify(|existing| {
                    existing.joined &= info.joined;
                    for borrow in &info.borrows {
                        if !existing.borrows.contains(borrow) {
                            existing.borrows.push(*borrow);
                        }
                    }
                })
                .or_insert_with(|| info.clone());
        }
        ThreadTracker { handles }
    }
}
