///
/// Generic Handle Table
///
/// `HandleTable<V>` keeps `Handle -> Option<V>` behind a single mutex. An entry
/// is empty between `create` and the first `put`. Removing or overwriting an
/// entry drops the old value while the lock is still held, so a concurrent
/// `get` can never observe a value that is being disposed, and of several
/// racing `remove` calls exactly one disposes.
///
/// Ids start at the configured first id (1 by default) and grow by one per
/// allocation. They are never reused; after `i32::MAX` has been handed out the
/// table refuses to allocate instead of wrapping.
///

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use crate::error::HandleError;
use crate::handle::Handle;

struct TableState<V> {
    entries: HashMap<Handle, Option<V>>,
    reserved: HashSet<Handle>,
    /// None once the id space is used up
    next_id: Option<i32>,
}

pub struct HandleTable<V> {
    name: &'static str,
    state: Mutex<TableState<V>>,
}

impl<V> HandleTable<V> {
    pub fn new(name: &'static str) -> Self {
        Self::with_first_id(name, 1)
    }

    pub fn with_first_id(name: &'static str, first_id: i32) -> Self {
        Self {
            name,
            state: Mutex::new(TableState {
                entries: HashMap::new(),
                reserved: HashSet::new(),
                next_id: Some(first_id),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    // A panic while holding the lock cannot leave the map half-updated, so a
    // poisoned lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, TableState<V>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn allocate(&self, state: &mut TableState<V>) -> Result<Handle, HandleError> {
        let id = state.next_id.ok_or(HandleError::Exhausted { table: self.name })?;
        state.next_id = id.checked_add(1);
        Ok(Handle::new(id))
    }

    fn not_found(&self, handle: Handle) -> HandleError {
        HandleError::NotFound {
            table: self.name,
            handle,
        }
    }

    /// Allocate a fresh handle with an empty entry.
    pub fn create(&self) -> Result<Handle, HandleError> {
        let mut state = self.lock();
        let handle = self.allocate(&mut state)?;
        state.entries.insert(handle, None);
        tracing::debug!(table = self.name, %handle, "handle created");
        Ok(handle)
    }

    /// Allocate a fresh handle holding `value`.
    pub fn insert(&self, value: V) -> Result<Handle, HandleError> {
        let mut state = self.lock();
        let handle = self.allocate(&mut state)?;
        state.entries.insert(handle, Some(value));
        tracing::debug!(table = self.name, %handle, "handle created");
        Ok(handle)
    }

    /// Allocate a handle without creating its entry. The caller builds the
    /// value knowing its id, then calls `install` (or `upsert`). A
    /// reservation that is never used stays recorded until `release` or
    /// `clear`.
    pub fn reserve(&self) -> Result<Handle, HandleError> {
        let mut state = self.lock();
        let handle = self.allocate(&mut state)?;
        state.reserved.insert(handle);
        Ok(handle)
    }

    /// Give up an unused reservation. The id is not handed out again.
    pub fn release(&self, handle: Handle) -> bool {
        self.lock().reserved.remove(&handle)
    }

    pub fn reserved_len(&self) -> usize {
        self.lock().reserved.len()
    }

    pub fn install(&self, handle: Handle, value: V) -> Result<(), HandleError> {
        let mut state = self.lock();
        if state.entries.contains_key(&handle) {
            return Err(HandleError::AlreadyInstalled {
                table: self.name,
                handle,
            });
        }
        if !state.reserved.remove(&handle) {
            return Err(HandleError::NotReserved {
                table: self.name,
                handle,
            });
        }
        state.entries.insert(handle, Some(value));
        tracing::debug!(table = self.name, %handle, "handle installed");
        Ok(())
    }

    /// Overwrite the value at `handle`, disposing the previous one.
    pub fn put(&self, handle: Handle, value: V) -> Result<(), HandleError> {
        let mut state = self.lock();
        let slot = state.entries.get_mut(&handle).ok_or_else(|| self.not_found(handle))?;
        let previous = slot.replace(value);
        drop(previous);
        Ok(())
    }

    /// Store `value` under an id chosen outside this table (a callback id).
    /// Creates the entry if needed and disposes any value it replaces.
    pub fn upsert(&self, handle: Handle, value: Option<V>) {
        let mut state = self.lock();
        state.reserved.remove(&handle);
        let previous = state.entries.insert(handle, value);
        drop(previous);
        tracing::debug!(table = self.name, %handle, "handle stored");
    }

    /// Clear the value at `handle` but keep the entry.
    pub fn clear_value(&self, handle: Handle) -> Result<(), HandleError> {
        let mut state = self.lock();
        let slot = state.entries.get_mut(&handle).ok_or_else(|| self.not_found(handle))?;
        let previous = slot.take();
        drop(previous);
        Ok(())
    }

    /// Run `f` on the entry under the lock. `None` means created but empty.
    pub fn with<R>(&self, handle: Handle, f: impl FnOnce(Option<&V>) -> R) -> Result<R, HandleError> {
        let state = self.lock();
        let slot = state.entries.get(&handle).ok_or_else(|| self.not_found(handle))?;
        Ok(f(slot.as_ref()))
    }

    /// Run `f` with mutable access to the entry under the lock.
    pub fn with_mut<R>(
        &self,
        handle: Handle,
        f: impl FnOnce(&mut Option<V>) -> R,
    ) -> Result<R, HandleError> {
        let mut state = self.lock();
        let slot = state.entries.get_mut(&handle).ok_or_else(|| self.not_found(handle))?;
        Ok(f(slot))
    }

    /// One-shot destructive read: erase the entry and hand its value out.
    pub fn take(&self, handle: Handle) -> Result<Option<V>, HandleError> {
        let mut state = self.lock();
        let value = state.entries.remove(&handle).ok_or_else(|| self.not_found(handle))?;
        tracing::debug!(table = self.name, %handle, "handle taken");
        Ok(value)
    }

    /// Erase the entry and dispose its value under the lock.
    pub fn remove(&self, handle: Handle) -> Result<(), HandleError> {
        let mut state = self.lock();
        let removed = state.entries.remove(&handle).ok_or_else(|| self.not_found(handle))?;
        drop(removed);
        tracing::debug!(table = self.name, %handle, "handle removed");
        Ok(())
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.lock().entries.contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn handles(&self) -> Vec<Handle> {
        let mut handles: Vec<Handle> = self.lock().entries.keys().copied().collect();
        handles.sort();
        handles
    }

    /// Dispose every entry. Ids keep increasing afterwards.
    pub fn clear(&self) -> usize {
        let mut state = self.lock();
        let count = state.entries.len();
        state.entries.clear();
        state.reserved.clear();
        count
    }
}

impl<V: Clone> HandleTable<V> {
    /// Non-destructive lookup; `None` for both empty and missing entries.
    pub fn get(&self, handle: Handle) -> Option<V> {
        self.lock().entries.get(&handle).and_then(|slot| slot.clone())
    }

    /// Like `get`, but a missing entry is an error rather than empty.
    pub fn lookup(&self, handle: Handle) -> Result<Option<V>, HandleError> {
        let state = self.lock();
        let slot = state.entries.get(&handle).ok_or_else(|| self.not_found(handle))?;
        Ok(slot.clone())
    }
}
