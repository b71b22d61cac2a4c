//!
//! AtomicData Access Stores
//!
//! Each store owns one transferred object. Opening a store adopts the object
//! out of it and marks the store open; the holder hands a value back with
//! `close_access`, which transfers it in again (CHECKED) and wakes waiters.
//! While a store is open, other openers block.
//!
//! Removal marks the store as removing (new and waiting openers fail with
//! `Removed`), waits for the current holder to close, then unlinks the store
//! and disposes its object.
//!

use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use kite_core::{transfer, ManagedRef, StablePtr, TransferMode};
use kite_handles::{Handle, HandleError, HandleTable};

use crate::error::AccessError;

struct StoreState {
    token: Option<StablePtr>,
    open: bool,
    removing: bool,
}

pub struct DataStore {
    state: Mutex<StoreState>,
    released: Condvar,
}

impl DataStore {
    fn new(token: StablePtr) -> Self {
        Self {
            state: Mutex::new(StoreState {
                token: Some(token),
                open: false,
                removing: false,
            }),
            released: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, StoreState>) -> MutexGuard<'a, StoreState> {
        self.released.wait(guard).unwrap_or_else(|e| e.into_inner())
    }

    fn open(&self, handle: Handle) -> Result<Option<ManagedRef>, AccessError> {
        let mut state = self.lock();
        while state.open && !state.removing {
            state = self.wait(state);
        }
        if state.removing {
            return Err(AccessError::Removed { handle });
        }
        state.open = true;
        Ok(state.token.take().map(StablePtr::adopt))
    }

    fn close(&self, handle: Handle, value: Option<ManagedRef>) -> Result<(), AccessError> {
        let mut state = self.lock();
        if !state.open {
            return Err(AccessError::NotOpen { handle });
        }
        let result = match value {
            Some(value) => match transfer(value, TransferMode::Checked).into_result() {
                Ok(token) => {
                    state.token = Some(token);
                    Ok(())
                }
                Err(e) => Err(AccessError::from(e)),
            },
            None => Ok(()),
        };
        state.open = false;
        self.released.notify_all();
        result
    }

    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    pub fn is_empty(&self) -> bool {
        self.lock().token.is_none()
    }
}

pub struct AtomicDataTable {
    stores: HandleTable<Arc<DataStore>>,
}

impl Default for AtomicDataTable {
    fn default() -> Self {
        Self::new()
    }
}

impl AtomicDataTable {
    pub fn new() -> Self {
        Self::with_first_id(1)
    }

    pub fn with_first_id(first_id: i32) -> Self {
        Self {
            stores: HandleTable::with_first_id("atomic data", first_id),
        }
    }

    fn store(&self, handle: Handle) -> Result<Arc<DataStore>, AccessError> {
        self.stores.lookup(handle)?.ok_or_else(|| {
            AccessError::Handle(HandleError::NotFound {
                table: self.stores.name(),
                handle,
            })
        })
    }

    /// Build an object with `producer`, transfer it in, and store it under a
    /// fresh handle.
    pub fn create<P>(&self, producer: P, mode: TransferMode) -> Result<Handle, AccessError>
    where
        P: FnOnce() -> ManagedRef,
    {
        let token = transfer(producer(), mode).into_result()?;
        let handle = self.stores.insert(Arc::new(DataStore::new(token)))?;
        Ok(handle)
    }

    /// Take the stored object out, blocking while another holder has it.
    /// `None` when the store was left empty by an earlier close.
    pub fn open_access(&self, handle: Handle) -> Result<Option<ManagedRef>, AccessError> {
        let store = self.store(handle)?;
        let value = store.open(handle)?;
        tracing::trace!(%handle, "data store opened");
        Ok(value)
    }

    /// Put a value back and release the store. A value that is still shared
    /// is rejected; the store is released empty in that case.
    pub fn close_access(&self, handle: Handle, value: Option<ManagedRef>) -> Result<(), AccessError> {
        let store = self.store(handle)?;
        store.close(handle, value)?;
        tracing::trace!(%handle, "data store closed");
        Ok(())
    }

    /// Open the store and return a guard that closes it when dropped.
    pub fn guard(&self, handle: Handle) -> Result<AccessGuard, AccessError> {
        let store = self.store(handle)?;
        let value = store.open(handle)?;
        Ok(AccessGuard {
            store,
            handle,
            value,
            closed: false,
        })
    }

    /// Scoped access: `f` receives the stored object and returns what to put
    /// back. The store is closed on every exit path, including a panic in `f`.
    pub fn access<F>(&self, handle: Handle, f: F) -> Result<(), AccessError>
    where
        F: FnOnce(Option<ManagedRef>) -> Option<ManagedRef>,
    {
        let mut guard = self.guard(handle)?;
        let current = guard.take();
        guard.replace(f(current));
        guard.close()
    }

    /// Dispose the store once its current holder (if any) has closed it.
    pub fn remove(&self, handle: Handle) -> Result<(), AccessError> {
        let store = self.store(handle)?;
        {
            let mut state = store.lock();
            if state.removing {
                return Err(AccessError::Removed { handle });
            }
            state.removing = true;
            store.released.notify_all();
            while state.open {
                state = store.wait(state);
            }
            if let Some(token) = state.token.take() {
                token.dispose();
            }
        }
        self.stores.remove(handle)?;
        tracing::debug!(%handle, "data store removed");
        Ok(())
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.stores.contains(handle)
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }

    pub fn clear(&self) -> usize {
        self.stores.clear()
    }
}

/// An open store. Dropping the guard closes the store with whatever value
/// the guard still holds.
pub struct AccessGuard {
    store: Arc<DataStore>,
    handle: Handle,
    value: Option<ManagedRef>,
    closed: bool,
}

impl AccessGuard {
    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn value(&self) -> Option<&ManagedRef> {
        self.value.as_ref()
    }

    pub fn take(&mut self) -> Option<ManagedRef> {
        self.value.take()
    }

    pub fn replace(&mut self, value: Option<ManagedRef>) -> Option<ManagedRef> {
        std::mem::replace(&mut self.value, value)
    }

    pub fn close(mut self) -> Result<(), AccessError> {
        self.closed = true;
        let value = self.value.take();
        self.store.close(self.handle, value)
    }
}

impl Drop for AccessGuard {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.store.close(self.handle, self.value.take()) {
            tracing::warn!(handle = %self.handle, error = %e, "closing data store on drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    use kite_core::CoreError;

    #[test]
    fn test_open_close_round_trip() {
        let table = AtomicDataTable::new();
        let handle = table.create(|| ManagedRef::int(1), TransferMode::Checked).unwrap();

        let value = table.open_access(handle).unwrap().unwrap();
        assert_eq!(value.as_int(), Some(1));
        table.close_access(handle, Some(ManagedRef::int(2))).unwrap();

        table
            .access(handle, |v| {
                assert_eq!(v.as_ref().and_then(ManagedRef::as_int), Some(2));
                v
            })
            .unwrap();
    }

    #[test]
    fn test_close_without_open() {
        let table = AtomicDataTable::new();
        let handle = table.create(ManagedRef::unit, TransferMode::Checked).unwrap();
        assert!(matches!(
            table.close_access(handle, None),
            Err(AccessError::NotOpen { .. })
        ));
    }

    #[test]
    fn test_create_rejects_shared_object() {
        let table = AtomicDataTable::new();
        let shared = ManagedRef::string("x");
        let keep = shared.clone();
        let err = table.create(move || shared, TransferMode::Checked).unwrap_err();
        assert!(matches!(err, AccessError::Core(CoreError::InvalidState(_))));
        assert!(table.is_empty());
        assert_eq!(keep.ref_count(), 1);
    }

    #[test]
    fn test_rejected_close_leaves_store_empty_and_released() {
        let table = AtomicDataTable::new();
        let handle = table.create(|| ManagedRef::int(5), TransferMode::Checked).unwrap();
        let value = table.open_access(handle).unwrap().unwrap();
        let keep = value.clone();

        let err = table.close_access(handle, Some(value)).unwrap_err();
        assert!(matches!(err, AccessError::Core(CoreError::InvalidState(_))));
        assert_eq!(keep.ref_count(), 1);
        assert!(table.open_access(handle).unwrap().is_none());
    }

    #[test]
    fn test_second_opener_blocks_until_close() {
        let table = Arc::new(AtomicDataTable::new());
        let handle = table.create(|| ManagedRef::int(1), TransferMode::Checked).unwrap();
        let first = table.open_access(handle).unwrap().unwrap();

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                let value = table.open_access(handle).unwrap();
                tx.send(value.and_then(|v| v.as_int())).unwrap();
                table.close_access(handle, None).unwrap();
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        drop(first);
        table.close_access(handle, Some(ManagedRef::int(2))).unwrap();
        assert_eq!(rx.recv().unwrap(), Some(2));
        waiter.join().unwrap();
    }

    #[test]
    fn test_remove_waits_for_holder() {
        let table = Arc::new(AtomicDataTable::new());
        let object = ManagedRef::int(1);
        let weak = object.downgrade();
        let handle = table.create(move || object, TransferMode::Checked).unwrap();
        let guard = table.guard(handle).unwrap();

        let remover = {
            let table = Arc::clone(&table);
            thread::spawn(move || table.remove(handle))
        };
        thread::sleep(Duration::from_millis(50));
        assert!(table.contains(handle));
        assert!(matches!(table.open_access(handle), Err(AccessError::Removed { .. })));

        drop(guard);
        remover.join().unwrap().unwrap();
        assert!(!table.contains(handle));
        assert!(weak.upgrade().is_none());
        assert!(matches!(
            table.open_access(handle),
            Err(AccessError::Handle(HandleError::NotFound { .. }))
        ));
    }

    #[test]
    fn test_guard_closes_on_panic() {
        let table = AtomicDataTable::new();
        let handle = table.create(|| ManagedRef::int(1), TransferMode::Checked).unwrap();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            table.access(handle, |_| panic!("access body failed")).unwrap();
        }));
        assert!(result.is_err());
        assert!(table.open_access(handle).unwrap().is_none());
    }
}
