//!
//! Fault Handling Primitives
//!
//! Two paths exist for errors that must not unwind across the foreign
//! boundary:
//!
//! - A thread-local fault slot. Boundary functions record the fault and return
//!   a sentinel; the host checks the slot afterwards and raises it.
//! - A `FaultReporter` sink for faults that have no caller left to receive
//!   them (a job body failing inside the dispatch broker).
//!
//! Fault Type IDs:
//! - 0: Unknown
//! - 1: InvalidState (ownership transfer rejected)
//! - 2: LookupMiss (handle never created or already removed)
//! - 3: NativeLibrary (SQLite returned an error)
//! - 4: Access (data store access protocol violated)
//! - 5: Config
//! - 6: Unhandled (a job body raised)
//!

use std::cell::RefCell;
use std::fmt;
use std::sync::Mutex;

pub const FAULT_TYPE_UNKNOWN: i64 = 0;
pub const FAULT_TYPE_INVALID_STATE: i64 = 1;
pub const FAULT_TYPE_LOOKUP_MISS: i64 = 2;
pub const FAULT_TYPE_NATIVE_LIBRARY: i64 = 3;
pub const FAULT_TYPE_ACCESS: i64 = 4;
pub const FAULT_TYPE_CONFIG: i64 = 5;
pub const FAULT_TYPE_UNHANDLED: i64 = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub type_id: i64,
    pub message: String,
}

impl Fault {
    pub fn new(type_id: i64, message: impl Into<String>) -> Self {
        Self {
            type_id,
            message: message.into(),
        }
    }

    pub fn unhandled(message: impl Into<String>) -> Self {
        Self::new(FAULT_TYPE_UNHANDLED, message)
    }

    /// Build a fault from a caught panic payload.
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "job panicked".to_string()
        };
        Self::unhandled(message)
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fault {}: {}", self.type_id, self.message)
    }
}

impl std::error::Error for Fault {}

/// Sink for faults that cannot propagate back to their submitter.
pub trait FaultReporter: Send + Sync {
    fn report(&self, fault: &Fault);
}

/// Default reporter: logs the fault.
#[derive(Debug, Default)]
pub struct TracingReporter;

impl FaultReporter for TracingReporter {
    fn report(&self, fault: &Fault) {
        tracing::error!(type_id = fault.type_id, message = %fault.message, "unhandled fault");
    }
}

/// Reporter that keeps every fault it receives.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    faults: Mutex<Vec<Fault>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn faults(&self) -> Vec<Fault> {
        self.faults.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.faults.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FaultReporter for RecordingReporter {
    fn report(&self, fault: &Fault) {
        tracing::warn!(type_id = fault.type_id, message = %fault.message, "fault recorded");
        self.faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(fault.clone());
    }
}

thread_local! {
    static CURRENT_FAULT: RefCell<Option<Fault>> = const { RefCell::new(None) };
}

/// Record a fault for the current thread, replacing any earlier one.
pub fn fault_set(fault: Fault) {
    CURRENT_FAULT.with(|slot| *slot.borrow_mut() = Some(fault));
}

/// Remove and return the current thread's fault.
pub fn fault_take() -> Option<Fault> {
    CURRENT_FAULT.with(|slot| slot.borrow_mut().take())
}

pub fn fault_peek() -> Option<Fault> {
    CURRENT_FAULT.with(|slot| slot.borrow().clone())
}

/// Check if there's a pending fault
#[unsafe(no_mangle)]
pub extern "C" fn kite_fault_check() -> i64 {
    CURRENT_FAULT.with(|slot| if slot.borrow().is_some() { 1 } else { 0 })
}

/// Get the pending fault's type id (-1 if none)
#[unsafe(no_mangle)]
pub extern "C" fn kite_fault_type_id() -> i64 {
    CURRENT_FAULT.with(|slot| slot.borrow().as_ref().map_or(-1, |f| f.type_id))
}

/// Copy the pending fault's UTF-8 message into `buf`, truncating to `cap`
/// bytes. Returns the full message length, or -1 if no fault is pending.
///
/// # Safety
///
/// `buf` must be valid for `cap` bytes of writes, or null with `cap == 0`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kite_fault_message(buf: *mut u8, cap: usize) -> i64 {
    CURRENT_FAULT.with(|slot| match slot.borrow().as_ref() {
        Some(fault) => {
            let bytes = fault.message.as_bytes();
            let n = bytes.len().min(cap);
            if n > 0 && !buf.is_null() {
                unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), buf, n) };
            }
            bytes.len() as i64
        }
        None => -1,
    })
}

/// Clear the pending fault (called after the host raised it)
#[unsafe(no_mangle)]
pub extern "C" fn kite_fault_clear() {
    CURRENT_FAULT.with(|slot| *slot.borrow_mut() = None);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_slot_is_per_thread() {
        fault_set(Fault::new(FAULT_TYPE_LOOKUP_MISS, "missing handle 4"));
        assert_eq!(kite_fault_check(), 1);
        assert_eq!(kite_fault_type_id(), FAULT_TYPE_LOOKUP_MISS);

        let other = std::thread::spawn(|| kite_fault_check()).join().unwrap();
        assert_eq!(other, 0);

        let mut buf = [0u8; 7];
        let len = unsafe { kite_fault_message(buf.as_mut_ptr(), buf.len()) };
        assert_eq!(len, "missing handle 4".len() as i64);
        assert_eq!(&buf, b"missing");

        kite_fault_clear();
        assert_eq!(kite_fault_check(), 0);
        assert_eq!(kite_fault_type_id(), -1);
    }

    #[test]
    fn test_fault_from_panic_payload() {
        let payload = std::panic::catch_unwind(|| panic!("boom {}", 3)).unwrap_err();
        let fault = Fault::from_panic(payload);
        assert_eq!(fault.type_id, FAULT_TYPE_UNHANDLED);
        assert_eq!(fault.message, "boom 3");
    }

    #[test]
    fn test_recording_reporter() {
        let reporter = RecordingReporter::new();
        reporter.report(&Fault::unhandled("first"));
        assert_eq!(reporter.len(), 1);
        assert_eq!(reporter.faults()[0].message, "first");
    }
}
