///
/// Host statement finalizer.
///
/// Statement objects compiled through `SqliteConnection` carry their native
/// statement and are finalized in place. Objects the host put into a cache
/// through the boundary are finalized by calling back into the host, which
/// owns the native statement behind them.
///

use std::ffi::c_void;
use std::sync::RwLock;

use kite_core::{HeapObject, ManagedRef};
use kite_handles::NativePtr;
use kite_sqlite3::{FinalizeStatement, StatementFinalizer, StatementSlot};

/// Called with the connection pointer and a borrowed statement object. The
/// object pointer is only valid for the duration of the call.
pub type HostFinalizeFn = unsafe extern "C" fn(connection: *mut c_void, statement: *const HeapObject);

#[derive(Default)]
pub struct HostFinalizer {
    callback: RwLock<Option<HostFinalizeFn>>,
}

impl HostFinalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_callback(&self, callback: Option<HostFinalizeFn>) {
        *self.callback.write().unwrap_or_else(|e| e.into_inner()) = callback;
    }

    pub fn has_callback(&self) -> bool {
        self.callback.read().unwrap_or_else(|e| e.into_inner()).is_some()
    }
}

impl StatementFinalizer for HostFinalizer {
    fn finalize(&self, connection: NativePtr, statement: &ManagedRef) {
        if statement.meta::<StatementSlot>().is_some() {
            FinalizeStatement.finalize(connection, statement);
            return;
        }
        let callback = *self.callback.read().unwrap_or_else(|e| e.into_inner());
        let Some(callback) = callback else {
            tracing::warn!(object = statement.id(), "no host finalizer installed, statement leaked");
            return;
        };
        let lent = statement.clone().into_raw();
        unsafe {
            callback(connection.as_ptr(), lent);
            drop(ManagedRef::from_raw(lent));
        }
    }
}
