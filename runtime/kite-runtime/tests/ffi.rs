///
/// # Foreign Boundary Tests
///
/// Drives the exported C functions the way a host would. The boundary
/// operates on one process-wide runtime, so everything runs as a single
/// ordered scenario inside one test.
///

use std::ffi::{CString, c_void};
use std::sync::atomic::{AtomicUsize, Ordering};

use tempfile::TempDir;

use kite_core::{
    FAULT_TYPE_ACCESS, FAULT_TYPE_CONFIG, FAULT_TYPE_INVALID_STATE, FAULT_TYPE_LOOKUP_MISS,
    FAULT_TYPE_UNHANDLED, Fault, HeapObject, ManagedRef, fault_set, kite_fault_check, kite_fault_clear,
    kite_fault_type_id,
};
use kite_runtime::ffi::*;
use kite_threads::{kite_atomic_get_counter, kite_counter_increment, kite_counter_release};

static FINALIZED: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn make_twenty() -> *const HeapObject {
    ManagedRef::int(20).into_raw()
}

unsafe extern "C" fn double_it(argument: *const HeapObject) -> *const HeapObject {
    let argument = unsafe { ManagedRef::clone_from_raw(argument) };
    ManagedRef::int(argument.as_int().unwrap_or(0) * 2).into_raw()
}

unsafe extern "C" fn throw_fault(_argument: *const HeapObject) -> *const HeapObject {
    fault_set(Fault::new(FAULT_TYPE_UNHANDLED, "job threw"));
    std::ptr::null()
}

unsafe extern "C" fn count_finalized(_connection: *mut c_void, _statement: *const HeapObject) {
    FINALIZED.fetch_add(1, Ordering::SeqCst);
}

/// Assert a fault of `type_id` is pending, then clear it.
fn expect_fault(type_id: i64) {
    assert_eq!(kite_fault_check(), 1, "expected a pending fault");
    assert_eq!(kite_fault_type_id(), type_id);
    kite_fault_clear();
}

fn expect_no_fault() {
    assert_eq!(kite_fault_check(), 0, "unexpected fault");
}

/// Take ownership of a returned object pointer.
fn adopt(object: *const HeapObject) -> ManagedRef {
    assert!(!object.is_null());
    unsafe { ManagedRef::from_raw(object) }
}

fn utf16(text: &str) -> Vec<u16> {
    text.encode_utf16().collect()
}

fn put_stmt(data_id: i32, sql: &str) -> i32 {
    let units = utf16(sql);
    unsafe {
        kite_sqlite_put_stmt(
            data_id,
            0x1 as *mut c_void,
            units.as_ptr(),
            units.len(),
            ManagedRef::string(sql).into_raw(),
        )
    }
}

fn has_stmt(data_id: i32, sql: &str) -> i32 {
    let units = utf16(sql);
    unsafe { kite_sqlite_has_stmt(data_id, units.as_ptr(), units.len()) }
}

fn lifecycle(dir: &TempDir) {
    assert_eq!(kite_atomic_create_store(), -1);
    expect_fault(FAULT_TYPE_INVALID_STATE);

    let missing = CString::new(dir.path().join("absent.toml").to_str().unwrap()).unwrap();
    assert_eq!(unsafe { kite_runtime_init(missing.as_ptr()) }, -1);
    expect_fault(FAULT_TYPE_CONFIG);

    let path = dir.path().join("kite.toml");
    std::fs::write(&path, "[statements]\nmax_cache_size = 2\n").unwrap();
    let path = CString::new(path.to_str().unwrap()).unwrap();
    assert_eq!(unsafe { kite_runtime_init(path.as_ptr()) }, 0);
    expect_no_fault();

    assert_eq!(unsafe { kite_runtime_init(std::ptr::null()) }, -1);
    expect_fault(FAULT_TYPE_INVALID_STATE);
}

fn pointer_table() {
    let handle = kite_atomic_create_store();
    assert!(handle > 0);
    assert!(kite_atomic_get_pointer(handle).is_null());
    expect_no_fault();

    assert_eq!(kite_atomic_put_pointer(handle, 0x1234 as *mut c_void), 0);
    assert_eq!(kite_atomic_get_pointer(handle) as usize, 0x1234);
    assert_eq!(kite_atomic_put_pointer(handle, 0x5678 as *mut c_void), 0);
    assert_eq!(kite_atomic_get_pointer(handle) as usize, 0x5678);

    assert_eq!(kite_atomic_remove_pointer(handle), 0);
    assert!(kite_atomic_get_pointer(handle).is_null());
    assert_eq!(kite_atomic_remove_pointer(handle), -1);
    expect_fault(FAULT_TYPE_LOOKUP_MISS);

    assert_eq!(kite_atomic_put_pointer(9999, 0x1 as *mut c_void), -1);
    expect_fault(FAULT_TYPE_LOOKUP_MISS);
}

fn object_table() {
    let handle = kite_object_create_store();
    assert!(kite_object_get(handle).is_null());
    expect_no_fault();

    assert_eq!(unsafe { kite_object_put(handle, ManagedRef::int(7).into_raw()) }, 0);
    let first = adopt(kite_object_get(handle));
    let second = adopt(kite_object_get(handle));
    assert_eq!(first.as_int(), Some(7));
    assert!(first.ptr_eq(&second));
    drop(second);

    let taken = adopt(kite_object_take(handle));
    assert!(taken.ptr_eq(&first));
    assert!(kite_object_take(handle).is_null());
    expect_fault(FAULT_TYPE_LOOKUP_MISS);

    let handle = kite_object_create_store();
    let shared = ManagedRef::string("shared");
    assert_eq!(unsafe { kite_object_put(handle, shared.clone().into_raw()) }, -1);
    expect_fault(FAULT_TYPE_INVALID_STATE);
    assert_eq!(shared.ref_count(), 1);
    assert!(kite_object_get(handle).is_null());

    assert_eq!(kite_object_remove(handle), 0);
    assert_eq!(kite_object_remove(handle), -1);
    expect_fault(FAULT_TYPE_LOOKUP_MISS);
}

fn dispatch() {
    let callback_id = kite_next_callback_id();
    assert_eq!(unsafe { kite_dispatch(0, make_twenty, double_it, callback_id) }, 0);
    assert_eq!(adopt(kite_pull_result(callback_id)).as_int(), Some(40));
    assert!(kite_pull_result(callback_id).is_null());
    expect_fault(FAULT_TYPE_LOOKUP_MISS);

    let faulted = kite_next_callback_id();
    assert_eq!(unsafe { kite_dispatch(0, make_twenty, throw_fault, faulted) }, 0);
    expect_no_fault();
    assert!(kite_pull_result(faulted).is_null());
    expect_no_fault();

    assert_eq!(unsafe { kite_dispatch(9, make_twenty, double_it, kite_next_callback_id()) }, -1);
    expect_fault(0);
}

fn atomic_data() {
    let handle = unsafe { kite_atomic_data_init(0, make_twenty) };
    assert!(handle > 0);

    let value = adopt(kite_atomic_data_open_access(handle));
    assert_eq!(value.as_int(), Some(20));
    drop(value);
    assert_eq!(unsafe { kite_atomic_data_close_access(handle, ManagedRef::int(21).into_raw()) }, 0);

    let value = adopt(kite_atomic_data_open_access(handle));
    assert_eq!(value.as_int(), Some(21));
    drop(value);
    assert_eq!(unsafe { kite_atomic_data_close_access(handle, std::ptr::null()) }, 0);

    assert!(kite_atomic_data_open_access(handle).is_null());
    expect_no_fault();
    assert_eq!(unsafe { kite_atomic_data_close_access(handle, std::ptr::null()) }, 0);
    assert_eq!(unsafe { kite_atomic_data_close_access(handle, std::ptr::null()) }, -1);
    expect_fault(FAULT_TYPE_ACCESS);

    assert_eq!(kite_atomic_data_remove_data_store(handle), 0);
    assert!(kite_atomic_data_open_access(handle).is_null());
    expect_fault(FAULT_TYPE_LOOKUP_MISS);
}

fn statement_cache() {
    assert_eq!(kite_sqlite_set_finalizer(Some(count_finalized)), 0);

    let data_id = kite_sqlite_next_data_id();
    assert_eq!(kite_sqlite_create_data_store(data_id, 2), 0);
    for sql in ["A", "B", "C"] {
        assert_eq!(put_stmt(data_id, sql), 0);
    }
    assert_eq!(FINALIZED.load(Ordering::SeqCst), 1);
    assert_eq!(has_stmt(data_id, "A"), 0);
    assert_eq!(has_stmt(data_id, "B"), 1);

    let units = utf16("B");
    let hit = adopt(unsafe { kite_sqlite_get_stmt(data_id, units.as_ptr(), units.len()) });
    assert_eq!(hit.as_str(), Some("B"));
    drop(hit);
    assert_eq!(put_stmt(data_id, "D"), 0);
    assert_eq!(has_stmt(data_id, "C"), 0);
    assert_eq!(FINALIZED.load(Ordering::SeqCst), 2);

    assert_eq!(
        unsafe { kite_sqlite_remove(data_id, 0x1 as *mut c_void, units.as_ptr(), units.len()) },
        1
    );
    assert_eq!(kite_sqlite_evict_all(data_id, 0x1 as *mut c_void), 1);
    assert_eq!(FINALIZED.load(Ordering::SeqCst), 4);

    let helper = kite_sqlite_next_helper_info_id();
    assert_eq!(unsafe { kite_sqlite_put_helper_info(helper, ManagedRef::unit().into_raw()) }, 0);
    drop(adopt(kite_sqlite_get_helper_info(helper)));
    assert_eq!(unsafe { kite_sqlite_put_helper_info(helper, std::ptr::null()) }, 0);
    assert!(kite_sqlite_get_helper_info(helper).is_null());

    assert_eq!(kite_sqlite_remove_data_store(data_id), 0);
    assert_eq!(has_stmt(data_id, "B"), -1);
    expect_fault(FAULT_TYPE_LOOKUP_MISS);

    let oversized = kite_sqlite_next_data_id();
    assert_eq!(kite_sqlite_create_data_store(oversized, 101), -1);
    expect_fault(FAULT_TYPE_CONFIG);
}

fn counter() {
    let object = ManagedRef::unit();
    let raw = object.clone().into_raw();
    let cell = unsafe { kite_atomic_get_counter(raw) };
    let again = unsafe { kite_atomic_get_counter(raw) };
    unsafe {
        assert_eq!(kite_counter_increment(cell), 1);
        assert_eq!(kite_counter_increment(again), 2);
        kite_counter_release(cell);
        kite_counter_release(again);
        drop(ManagedRef::from_raw(raw));
    }
}

fn shutdown() {
    assert_eq!(kite_runtime_shutdown(), 0);
    assert_eq!(kite_runtime_shutdown(), -1);
    expect_fault(FAULT_TYPE_INVALID_STATE);
    assert_eq!(kite_object_create_store(), -1);
    expect_fault(FAULT_TYPE_INVALID_STATE);
}

#[test]
fn test_boundary_scenario() {
    let dir = TempDir::new().expect("Failed to create temp directory");
    lifecycle(&dir);
    pointer_table();
    object_table();
    dispatch();
    atomic_data();
    statement_cache();
    counter();
    shutdown();
}
