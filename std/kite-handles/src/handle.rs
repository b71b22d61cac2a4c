use std::ffi::c_void;
use std::fmt;

/// Opaque identifier naming an entry in one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(i32);

impl Handle {
    pub const fn new(raw: i32) -> Self {
        Handle(raw)
    }

    pub const fn raw(self) -> i32 {
        self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for Handle {
    fn from(raw: i32) -> Self {
        Handle(raw)
    }
}

/// Native address stored verbatim. The table neither dereferences nor frees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativePtr(usize);

impl NativePtr {
    pub const NULL: NativePtr = NativePtr(0);

    pub fn from_ptr(ptr: *mut c_void) -> Self {
        NativePtr(ptr as usize)
    }

    pub fn as_ptr(self) -> *mut c_void {
        self.0 as *mut c_void
    }

    pub const fn addr(self) -> usize {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl From<usize> for NativePtr {
    fn from(addr: usize) -> Self {
        NativePtr(addr)
    }
}
