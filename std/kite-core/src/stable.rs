///
/// Stable Pointers
///
/// A `StablePtr` is the native-side owner of a managed object that has been
/// handed over to native storage. It is move-only: dropping it disposes the
/// reference, `adopt` consumes it and gives the live reference back to
/// managed code. Neither can happen twice for one token.
///

use std::fmt;

use crate::value::{HeapObject, ManagedRef};

pub struct StablePtr(ManagedRef);

impl StablePtr {
    /// Wrap a reference without any exclusivity check. Use `transfer` when the
    /// object must not be shared.
    pub fn create(object: ManagedRef) -> Self {
        tracing::trace!(object = object.id(), "stable pointer created");
        StablePtr(object)
    }

    /// Give the object back to managed code, consuming the token.
    pub fn adopt(self) -> ManagedRef {
        self.0
    }

    /// A new live reference to the object; the token keeps ownership.
    pub fn peek(&self) -> ManagedRef {
        self.0.clone()
    }

    /// Borrow the object without taking an extra reference.
    pub fn object(&self) -> &ManagedRef {
        &self.0
    }

    pub fn dispose(self) {
        tracing::trace!(object = self.0.id(), "stable pointer disposed");
    }

    pub fn into_raw(self) -> *const HeapObject {
        self.0.into_raw()
    }

    /// # Safety
    ///
    /// `ptr` must come from `StablePtr::into_raw` or `ManagedRef::into_raw`
    /// and must not be reclaimed twice.
    pub unsafe fn from_raw(ptr: *const HeapObject) -> Self {
        StablePtr(unsafe { ManagedRef::from_raw(ptr) })
    }
}

impl fmt::Debug for StablePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StablePtr").field(&self.0.id()).finish()
    }
}
