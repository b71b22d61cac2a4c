//!
//! Foreign Boundary
//!
//! C-ABI entry points over the process-wide runtime. Every failure records a
//! fault in the calling thread's fault slot (`kite_fault_check` and friends)
//! and returns a sentinel: `-1` for integer results, null for pointers.
//!
//! Object pointers follow two rules:
//! - arguments that are stored (`kite_object_put`, `kite_sqlite_put_stmt`,
//!   `kite_atomic_data_close_access`, producer results) pass ownership of one
//!   reference to the runtime
//! - returned object pointers are owned by the caller, who gives them back
//!   with `kite_object_release`
//!
//! SQL text crosses as UTF-16 code units plus a length.
//!

use std::ffi::{c_char, c_void};
use std::path::Path;
use std::ptr;
use std::sync::{Arc, PoisonError, RwLock};

use kite_core::{Fault, HeapObject, ManagedRef, TransferMode, fault_set, string_from_c, string_from_utf16};
use kite_handles::{Handle, NativePtr};
use kite_threads::{ForeignJobFn, Job};

use crate::config::RuntimeConfig;
use crate::error::RuntimeError;
use crate::host::HostFinalizeFn;
use crate::Runtime;

/// Builds the argument object for a dispatched job; returns an owned reference.
pub type ProducerFn = unsafe extern "C" fn() -> *const HeapObject;

static RUNTIME: RwLock<Option<Arc<Runtime>>> = RwLock::new(None);

fn current() -> Result<Arc<Runtime>, RuntimeError> {
    RUNTIME
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
        .ok_or(RuntimeError::NotInitialized)
}

fn raise(err: RuntimeError) {
    tracing::debug!(error = %err, "fault raised at boundary");
    fault_set(Fault::new(err.fault_type(), err.to_string()));
}

/// Run `f` against the current runtime, turning an error into a fault plus
/// `sentinel`.
fn boundary<T>(sentinel: T, f: impl FnOnce(&Runtime) -> Result<T, RuntimeError>) -> T {
    match current().and_then(|rt| f(&rt)) {
        Ok(value) => value,
        Err(err) => {
            raise(err);
            sentinel
        }
    }
}

fn status(result: Result<(), RuntimeError>) -> Result<i32, RuntimeError> {
    result.map(|()| 0)
}

fn owned_out(object: Option<ManagedRef>) -> *const HeapObject {
    object.map_or(ptr::null(), ManagedRef::into_raw)
}

/// # Safety
///
/// `object` must be null or an owned reference handed over by the caller.
unsafe fn owned_in(object: *const HeapObject) -> Option<ManagedRef> {
    if object.is_null() {
        None
    } else {
        Some(unsafe { ManagedRef::from_raw(object) })
    }
}

fn mode_from(mode: i32) -> Result<TransferMode, RuntimeError> {
    Ok(TransferMode::try_from(mode)?)
}

// ========================================
// Lifecycle
// ========================================

/// Create the process-wide runtime from the TOML file at `config_path`, or
/// from defaults when the path is null. Returns 0, or -1 with a fault set.
///
/// # Safety
///
/// `config_path` must be null or a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kite_runtime_init(config_path: *const c_char) -> i32 {
    let path = unsafe { string_from_c(config_path) };
    let result = (|| {
        let mut slot = RUNTIME.write().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Err(RuntimeError::AlreadyInitialized);
        }
        let config = match path {
            Some(path) => RuntimeConfig::load(Path::new(&path))?,
            None => RuntimeConfig::default(),
        };
        *slot = Some(Arc::new(Runtime::new(config)?));
        Ok(())
    })();
    match result {
        Ok(()) => 0,
        Err(err) => {
            raise(err);
            -1
        }
    }
}

/// Dispose everything and drop the runtime. Returns 0, or -1 with a fault
/// set when no runtime exists.
#[unsafe(no_mangle)]
pub extern "C" fn kite_runtime_shutdown() -> i32 {
    let runtime = RUNTIME.write().unwrap_or_else(PoisonError::into_inner).take();
    match runtime {
        Some(runtime) => {
            runtime.shutdown();
            0
        }
        None => {
            raise(RuntimeError::NotInitialized);
            -1
        }
    }
}

/// Give back an object reference the runtime returned.
///
/// # Safety
///
/// `object` must be null or an owned reference returned by this library.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kite_object_release(object: *const HeapObject) {
    drop(unsafe { owned_in(object) });
}

// ========================================
// Raw pointer table
// ========================================

#[unsafe(no_mangle)]
pub extern "C" fn kite_atomic_create_store() -> i32 {
    boundary(-1, |rt| Ok(rt.pointers().create()?.raw()))
}

#[unsafe(no_mangle)]
pub extern "C" fn kite_atomic_put_pointer(handle: i32, pointer: *mut c_void) -> i32 {
    boundary(-1, |rt| {
        status(
            rt.pointers()
                .put(Handle::new(handle), NativePtr::from_ptr(pointer))
                .map_err(RuntimeError::from),
        )
    })
}

/// Null when the handle is unknown or nothing was stored yet.
#[unsafe(no_mangle)]
pub extern "C" fn kite_atomic_get_pointer(handle: i32) -> *mut c_void {
    boundary(ptr::null_mut(), |rt| {
        Ok(rt
            .pointers()
            .get(Handle::new(handle))
            .map_or(ptr::null_mut(), NativePtr::as_ptr))
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn kite_atomic_remove_pointer(handle: i32) -> i32 {
    boundary(-1, |rt| {
        status(rt.pointers().remove(Handle::new(handle)).map_err(RuntimeError::from))
    })
}

// ========================================
// Managed object table
// ========================================

#[unsafe(no_mangle)]
pub extern "C" fn kite_object_create_store() -> i32 {
    boundary(-1, |rt| Ok(rt.objects().create()?.raw()))
}

/// Transfer `object` in with the configured default mode and store it.
///
/// # Safety
///
/// `object` must be an owned reference; it is consumed even on failure.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kite_object_put(handle: i32, object: *const HeapObject) -> i32 {
    let object = unsafe { owned_in(object) };
    boundary(-1, |rt| {
        let handle = Handle::new(handle);
        match object {
            Some(object) => status(rt.put_object(handle, object, rt.default_mode())),
            None => status(rt.objects().clear_value(handle).map_err(RuntimeError::from)),
        }
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn kite_object_get(handle: i32) -> *const HeapObject {
    boundary(ptr::null(), |rt| Ok(owned_out(rt.get_object(Handle::new(handle)))))
}

/// One-shot read: removes the entry and returns its object.
#[unsafe(no_mangle)]
pub extern "C" fn kite_object_take(handle: i32) -> *const HeapObject {
    boundary(ptr::null(), |rt| Ok(owned_out(rt.take_object(Handle::new(handle))?)))
}

#[unsafe(no_mangle)]
pub extern "C" fn kite_object_remove(handle: i32) -> i32 {
    boundary(-1, |rt| {
        status(rt.objects().remove(Handle::new(handle)).map_err(RuntimeError::from))
    })
}

// ========================================
// Dispatch
// ========================================

#[unsafe(no_mangle)]
pub extern "C" fn kite_next_callback_id() -> i32 {
    boundary(-1, |rt| Ok(rt.broker().next_callback_id()?.raw()))
}

/// Run `job` on the object `producer` returns and store the result under
/// `callback_id`. A null producer result runs the job on a unit object.
///
/// # Safety
///
/// `producer` must return null or an owned reference; `job` must follow the
/// `ForeignJobFn` contract.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kite_dispatch(
    mode: i32,
    producer: ProducerFn,
    job: ForeignJobFn,
    callback_id: i32,
) -> i32 {
    boundary(-1, |rt| {
        let mode = mode_from(mode)?;
        let argument = unsafe { owned_in(producer()) }.unwrap_or_else(ManagedRef::unit);
        rt.broker()
            .dispatch(mode, move || argument, Job::from_foreign(job), Handle::new(callback_id))?;
        Ok(0)
    })
}

/// Collect a dispatched job's result. Null with no fault when the job left
/// no result; null with a lookup-miss fault when the id is unknown or was
/// already pulled.
#[unsafe(no_mangle)]
pub extern "C" fn kite_pull_result(callback_id: i32) -> *const HeapObject {
    boundary(ptr::null(), |rt| {
        Ok(owned_out(rt.broker().pull_result(Handle::new(callback_id))?))
    })
}

// ========================================
// Atomic data
// ========================================

/// # Safety
///
/// `producer` must return null or an owned reference.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kite_atomic_data_init(mode: i32, producer: ProducerFn) -> i32 {
    boundary(-1, |rt| {
        let mode = mode_from(mode)?;
        let initial = unsafe { owned_in(producer()) }.unwrap_or_else(ManagedRef::unit);
        Ok(rt.data().create(move || initial, mode)?.raw())
    })
}

/// Blocks while another thread holds the store. Null (without a fault) for
/// a store left empty.
#[unsafe(no_mangle)]
pub extern "C" fn kite_atomic_data_open_access(handle: i32) -> *const HeapObject {
    boundary(ptr::null(), |rt| Ok(owned_out(rt.data().open_access(Handle::new(handle))?)))
}

/// # Safety
///
/// `object` must be null or an owned reference; it is consumed.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kite_atomic_data_close_access(handle: i32, object: *const HeapObject) -> i32 {
    let object = unsafe { owned_in(object) };
    boundary(-1, |rt| {
        status(rt.data().close_access(Handle::new(handle), object).map_err(RuntimeError::from))
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn kite_atomic_data_remove_data_store(handle: i32) -> i32 {
    boundary(-1, |rt| {
        status(rt.data().remove(Handle::new(handle)).map_err(RuntimeError::from))
    })
}

// ========================================
// Statement caches
// ========================================

#[unsafe(no_mangle)]
pub extern "C" fn kite_sqlite_next_data_id() -> i32 {
    boundary(-1, |rt| Ok(rt.databases().next_data_id()?.raw()))
}

#[unsafe(no_mangle)]
pub extern "C" fn kite_sqlite_create_data_store(data_id: i32, max_cache_size: i64) -> i32 {
    boundary(-1, |rt| {
        status(
            rt.databases()
                .create_data_store(Handle::new(data_id), max_cache_size)
                .map_err(RuntimeError::from),
        )
    })
}

/// Finalizes every cached statement, then drops the store.
#[unsafe(no_mangle)]
pub extern "C" fn kite_sqlite_remove_data_store(data_id: i32) -> i32 {
    boundary(-1, |rt| {
        status(
            rt.databases()
                .remove_data_store(Handle::new(data_id))
                .map_err(RuntimeError::from),
        )
    })
}

/// Install the callback that finalizes statements the host put into a
/// cache. Null uninstalls it.
#[unsafe(no_mangle)]
pub extern "C" fn kite_sqlite_set_finalizer(callback: Option<HostFinalizeFn>) -> i32 {
    boundary(-1, |rt| {
        rt.host_finalizer().set_callback(callback);
        Ok(0)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn kite_sqlite_put_connection_ptr(data_id: i32, connection: *mut c_void) -> i32 {
    boundary(-1, |rt| {
        status(
            rt.databases()
                .put_connection_ptr(Handle::new(data_id), NativePtr::from_ptr(connection))
                .map_err(RuntimeError::from),
        )
    })
}

/// # Safety
///
/// `sql` must be valid for `sql_len` UTF-16 units; `statement` must be an
/// owned reference and is consumed.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kite_sqlite_put_stmt(
    data_id: i32,
    connection: *mut c_void,
    sql: *const u16,
    sql_len: usize,
    statement: *const HeapObject,
) -> i32 {
    let sql = unsafe { string_from_utf16(sql, sql_len) };
    let statement = unsafe { owned_in(statement) };
    boundary(-1, |rt| {
        let statement = statement.ok_or(RuntimeError::NullObject("statement"))?;
        status(
            rt.databases()
                .put_stmt(Handle::new(data_id), NativePtr::from_ptr(connection), &sql, statement)
                .map_err(RuntimeError::from),
        )
    })
}

/// A hit promotes the statement to most recently used.
///
/// # Safety
///
/// `sql` must be valid for `sql_len` UTF-16 units.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kite_sqlite_get_stmt(data_id: i32, sql: *const u16, sql_len: usize) -> *const HeapObject {
    let sql = unsafe { string_from_utf16(sql, sql_len) };
    boundary(ptr::null(), |rt| {
        Ok(owned_out(rt.databases().get_stmt(Handle::new(data_id), &sql)?))
    })
}

/// 1 if cached, 0 if not. Does not change the LRU order.
///
/// # Safety
///
/// `sql` must be valid for `sql_len` UTF-16 units.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kite_sqlite_has_stmt(data_id: i32, sql: *const u16, sql_len: usize) -> i32 {
    let sql = unsafe { string_from_utf16(sql, sql_len) };
    boundary(-1, |rt| Ok(rt.databases().has_stmt(Handle::new(data_id), &sql)? as i32))
}

/// Returns the number of statements finalized.
#[unsafe(no_mangle)]
pub extern "C" fn kite_sqlite_evict_all(data_id: i32, connection: *mut c_void) -> i64 {
    boundary(-1, |rt| {
        let evicted = rt
            .databases()
            .evict_all(Handle::new(data_id), NativePtr::from_ptr(connection))?;
        Ok(evicted as i64)
    })
}

/// 1 if an entry was finalized and removed, 0 if there was none.
///
/// # Safety
///
/// `sql` must be valid for `sql_len` UTF-16 units.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kite_sqlite_remove(
    data_id: i32,
    connection: *mut c_void,
    sql: *const u16,
    sql_len: usize,
) -> i32 {
    let sql = unsafe { string_from_utf16(sql, sql_len) };
    boundary(-1, |rt| {
        let removed = rt
            .databases()
            .remove(Handle::new(data_id), NativePtr::from_ptr(connection), &sql)?;
        Ok(removed as i32)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn kite_sqlite_next_helper_info_id() -> i32 {
    boundary(-1, |rt| Ok(rt.databases().next_helper_info_id()?.raw()))
}

/// Store a helper object (consumed), or clear the id when `helper` is null.
///
/// # Safety
///
/// `helper` must be null or an owned reference.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kite_sqlite_put_helper_info(helper_id: i32, helper: *const HeapObject) -> i32 {
    let helper = unsafe { owned_in(helper) };
    boundary(-1, |rt| {
        rt.databases().put_helper_info(Handle::new(helper_id), helper);
        Ok(0)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn kite_sqlite_get_helper_info(helper_id: i32) -> *const HeapObject {
    boundary(ptr::null(), |rt| {
        Ok(owned_out(rt.databases().get_helper_info(Handle::new(helper_id))))
    })
}
