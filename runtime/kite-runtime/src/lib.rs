///
/// kite Runtime Library
///
/// The `Runtime` owns one instance of every table a host needs:
/// - raw pointer table (`Handle -> NativePtr`)
/// - managed object table (`Handle -> StablePtr`), filled through ownership transfer
/// - access-locked data stores
/// - the dispatch broker and its completion thread
/// - the database registry with per-connection statement caches
///
/// Hosts talking C go through the functions in `ffi`, which operate on a
/// single process-wide runtime created by `kite_runtime_init`. Rust callers
/// construct and own a `Runtime` directly.
///

pub mod config;
pub mod error;
pub mod ffi;
pub mod host;

use std::sync::Arc;

use kite_core::{FaultReporter, ManagedRef, StablePtr, TracingReporter, TransferMode, transfer};
use kite_handles::{Handle, HandleTable, NativePtr};
use kite_sqlite3::{CursorWindow, DatabaseRegistry, SqliteConnection};
use kite_threads::{AtomicDataTable, DispatchBroker};

pub use config::*;
pub use error::RuntimeError;
pub use host::{HostFinalizeFn, HostFinalizer};

pub use kite_core;
pub use kite_handles;
pub use kite_sqlite3;
pub use kite_threads;

pub struct Runtime {
    config: RuntimeConfig,
    pointers: HandleTable<NativePtr>,
    objects: HandleTable<StablePtr>,
    data: AtomicDataTable,
    broker: DispatchBroker,
    databases: Arc<DatabaseRegistry>,
    finalizer: Arc<HostFinalizer>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        Self::with_reporter(config, Arc::new(TracingReporter))
    }

    /// Runtime whose dispatch faults go to `reporter`.
    pub fn with_reporter(config: RuntimeConfig, reporter: Arc<dyn FaultReporter>) -> Result<Self, RuntimeError> {
        config.validate()?;
        let first_id = config.handles.first_id;
        let finalizer = Arc::new(HostFinalizer::new());
        let databases = Arc::new(DatabaseRegistry::with_first_id(finalizer.clone(), first_id));
        tracing::debug!(first_id, mode = ?config.dispatch.default_transfer_mode, "runtime created");
        Ok(Self {
            pointers: HandleTable::with_first_id("pointer", first_id),
            objects: HandleTable::with_first_id("object", first_id),
            data: AtomicDataTable::with_first_id(first_id),
            broker: DispatchBroker::with_reporter(reporter)?,
            databases,
            finalizer,
            config,
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn default_mode(&self) -> TransferMode {
        self.config.dispatch.default_transfer_mode
    }

    pub fn pointers(&self) -> &HandleTable<NativePtr> {
        &self.pointers
    }

    pub fn objects(&self) -> &HandleTable<StablePtr> {
        &self.objects
    }

    pub fn data(&self) -> &AtomicDataTable {
        &self.data
    }

    pub fn broker(&self) -> &DispatchBroker {
        &self.broker
    }

    pub fn databases(&self) -> &Arc<DatabaseRegistry> {
        &self.databases
    }

    pub fn host_finalizer(&self) -> &HostFinalizer {
        &self.finalizer
    }

    /// Transfer `object` in with `mode` and store it at `handle`, disposing
    /// whatever was stored there before.
    pub fn put_object(&self, handle: Handle, object: ManagedRef, mode: TransferMode) -> Result<(), RuntimeError> {
        let token = transfer(object, mode).into_result()?;
        self.objects.put(handle, token)?;
        Ok(())
    }

    /// Non-destructive read; the table keeps its reference.
    pub fn get_object(&self, handle: Handle) -> Option<ManagedRef> {
        self.objects
            .with(handle, |slot| slot.map(StablePtr::peek))
            .ok()
            .flatten()
    }

    /// Remove the entry and hand its object to the caller.
    pub fn take_object(&self, handle: Handle) -> Result<Option<ManagedRef>, RuntimeError> {
        Ok(self.objects.take(handle)?.map(StablePtr::adopt))
    }

    /// Open a database registered in this runtime's registry, using the
    /// configured busy timeout and cache size.
    pub fn open_database(&self, path: &str, flags: i32, label: &str) -> Result<SqliteConnection, RuntimeError> {
        Ok(SqliteConnection::open(
            Arc::clone(&self.databases),
            path,
            flags,
            label,
            self.config.connection_options(),
        )?)
    }

    pub fn new_cursor_window(&self, name: &str) -> CursorWindow {
        CursorWindow::new(name, self.config.sqlite.cursor_window_bytes)
    }

    /// Dispose everything the runtime still holds. Safe to call more than once.
    pub fn shutdown(&self) {
        self.broker.shutdown();
        let data = self.data.clear();
        let objects = self.objects.clear();
        let pointers = self.pointers.clear();
        self.databases.clear();
        tracing::debug!(data, objects, pointers, "runtime shut down");
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}
