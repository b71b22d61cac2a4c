///
/// Counter Cells
///
/// A counter cell lives in a managed object's meta slot. The object owns the
/// cell; the cell only points back weakly, so handing the cell to other
/// threads never keeps its object alive.
///
/// All operations use SeqCst ordering.
///

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use kite_core::{fault_set, Fault, HeapObject, ManagedRef, WeakManagedRef, FAULT_TYPE_INVALID_STATE};

#[derive(Debug)]
pub struct CounterCell {
    value: AtomicI64,
    target: WeakManagedRef,
}

impl CounterCell {
    fn new(target: WeakManagedRef) -> Self {
        Self {
            value: AtomicI64::new(0),
            target,
        }
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::SeqCst)
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::SeqCst)
    }

    /// Add `delta` and return the new value.
    pub fn add(&self, delta: i64) -> i64 {
        self.value.fetch_add(delta, Ordering::SeqCst).wrapping_add(delta)
    }

    pub fn increment(&self) -> i64 {
        self.add(1)
    }

    pub fn decrement(&self) -> i64 {
        self.add(-1)
    }

    /// Store `new` if the current value is `expected`.
    pub fn compare_and_set(&self, expected: i64, new: i64) -> bool {
        self.value
            .compare_exchange(expected, new, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Store `value` and return the previous one.
    pub fn swap(&self, value: i64) -> i64 {
        self.value.swap(value, Ordering::SeqCst)
    }

    /// The object this cell is attached to, if it is still alive.
    pub fn target(&self) -> Option<ManagedRef> {
        self.target.upgrade()
    }
}

/// Get the counter attached to `object`, attaching a fresh one the first time.
/// `None` if the object's meta slot is already used for something else.
pub fn counter_for(object: &ManagedRef) -> Option<Arc<CounterCell>> {
    object.attach_meta(|| {
        tracing::trace!(object = object.id(), "counter attached");
        CounterCell::new(object.downgrade())
    })
}

/// Get the counter for a host object. Returns an owned cell pointer the host
/// must release with `kite_counter_release`, or null.
///
/// # Safety
///
/// `object` must be a live object pointer handed out by this runtime.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kite_atomic_get_counter(object: *const HeapObject) -> *const CounterCell {
    if object.is_null() {
        return std::ptr::null();
    }
    let object = unsafe { ManagedRef::clone_from_raw(object) };
    match counter_for(&object) {
        Some(cell) => Arc::into_raw(cell),
        None => std::ptr::null(),
    }
}

/// # Safety
///
/// `cell` must come from `kite_atomic_get_counter` and be released once.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kite_counter_release(cell: *const CounterCell) {
    if !cell.is_null() {
        drop(unsafe { Arc::from_raw(cell) });
    }
}

/// Borrow a cell pointer, raising an invalid-state fault for null.
unsafe fn cell_ref<'a>(cell: *const CounterCell) -> Option<&'a CounterCell> {
    let cell = unsafe { cell.as_ref() };
    if cell.is_none() {
        fault_set(Fault::new(FAULT_TYPE_INVALID_STATE, "null counter cell"));
    }
    cell
}

// The value operations below return 0 (and raise a fault) for a null cell.

/// # Safety
///
/// `cell` must be null or a live pointer from `kite_atomic_get_counter`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kite_counter_get(cell: *const CounterCell) -> i64 {
    unsafe { cell_ref(cell) }.map_or(0, CounterCell::get)
}

/// # Safety
///
/// `cell` must be null or a live pointer from `kite_atomic_get_counter`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kite_counter_add(cell: *const CounterCell, delta: i64) -> i64 {
    unsafe { cell_ref(cell) }.map_or(0, |c| c.add(delta))
}

/// # Safety
///
/// `cell` must be null or a live pointer from `kite_atomic_get_counter`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kite_counter_increment(cell: *const CounterCell) -> i64 {
    unsafe { cell_ref(cell) }.map_or(0, CounterCell::increment)
}

/// # Safety
///
/// `cell` must be null or a live pointer from `kite_atomic_get_counter`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kite_counter_decrement(cell: *const CounterCell) -> i64 {
    unsafe { cell_ref(cell) }.map_or(0, CounterCell::decrement)
}

/// Returns 1 if the value was replaced, 0 otherwise.
///
/// # Safety
///
/// `cell` must be null or a live pointer from `kite_atomic_get_counter`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kite_counter_compare_and_set(
    cell: *const CounterCell,
    expected: i64,
    new: i64,
) -> i64 {
    match unsafe { cell_ref(cell) } {
        Some(c) if c.compare_and_set(expected, new) => 1,
        _ => 0,
    }
}

/// # Safety
///
/// `cell` must be null or a live pointer from `kite_atomic_get_counter`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kite_counter_swap(cell: *const CounterCell, value: i64) -> i64 {
    unsafe { cell_ref(cell) }.map_or(0, |c| c.swap(value))
}
