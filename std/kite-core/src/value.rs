//!
//! Managed Object Representation
//!
//! Managed values live in reference-counted `HeapObject`s. A `ManagedRef` is
//! one strong reference; cloning it is exactly what the host runtime does when
//! a second variable starts pointing at the same object.
//!
//! An object carries:
//! - a `HeapHeader` (process-unique object id and type tag)
//! - an immutable `Value` payload
//! - an immutable list of child references (its subgraph)
//! - a lazily attached meta slot for native-side auxiliary state
//!

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// Type tags for heap objects
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapTag {
    Unit = 0,
    Int = 1,
    Float = 2,
    Bool = 3,
    String = 4,
    Bytes = 5,
    Native = 6,
    Record = 7,
}

/// Header for all heap-allocated objects
#[derive(Debug)]
pub struct HeapHeader {
    pub id: u64,
    pub tag: HeapTag,
}

impl HeapHeader {
    pub fn new(tag: HeapTag) -> Self {
        Self {
            id: NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed),
            tag,
        }
    }
}

/// Payload stored in a managed object
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Unit,
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Bytes(Vec<u8>),
    /// Opaque native address owned by someone else (statement, connection)
    Native(usize),
}

impl Value {
    pub fn tag(&self) -> HeapTag {
        match self {
            Value::Unit => HeapTag::Unit,
            Value::Int(_) => HeapTag::Int,
            Value::Float(_) => HeapTag::Float,
            Value::Bool(_) => HeapTag::Bool,
            Value::Str(_) => HeapTag::String,
            Value::Bytes(_) => HeapTag::Bytes,
            Value::Native(_) => HeapTag::Native,
        }
    }
}

pub struct HeapObject {
    pub header: HeapHeader,
    value: Value,
    fields: Vec<ManagedRef>,
    meta: OnceLock<Arc<dyn Any + Send + Sync>>,
}

impl HeapObject {
    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn fields(&self) -> &[ManagedRef] {
        &self.fields
    }
}

impl fmt::Debug for HeapObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapObject")
            .field("id", &self.header.id)
            .field("tag", &self.header.tag)
            .field("value", &self.value)
            .field("fields", &self.fields.len())
            .finish()
    }
}

/// A strong reference to a managed object.
#[derive(Clone)]
pub struct ManagedRef(pub(crate) Arc<HeapObject>);

impl ManagedRef {
    pub fn new(value: Value) -> Self {
        Self::with_fields(value, Vec::new())
    }

    /// Build an object that references `fields`. The object's tag is `Record`
    /// whenever it has children.
    pub fn with_fields(value: Value, fields: Vec<ManagedRef>) -> Self {
        let tag = if fields.is_empty() { value.tag() } else { HeapTag::Record };
        ManagedRef(Arc::new(HeapObject {
            header: HeapHeader::new(tag),
            value,
            fields,
            meta: OnceLock::new(),
        }))
    }

    pub fn int(value: i64) -> Self {
        Self::new(Value::Int(value))
    }

    pub fn string(value: impl Into<String>) -> Self {
        Self::new(Value::Str(value.into()))
    }

    pub fn unit() -> Self {
        Self::new(Value::Unit)
    }

    pub fn id(&self) -> u64 {
        self.0.header.id
    }

    pub fn tag(&self) -> HeapTag {
        self.0.header.tag
    }

    pub fn value(&self) -> &Value {
        &self.0.value
    }

    pub fn fields(&self) -> &[ManagedRef] {
        &self.0.fields
    }

    pub fn as_int(&self) -> Option<i64> {
        match self.0.value {
            Value::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.0.value {
            Value::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_native(&self) -> Option<usize> {
        match self.0.value {
            Value::Native(addr) => Some(addr),
            _ => None,
        }
    }

    /// Number of strong references currently held to this object.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    pub fn ptr_eq(&self, other: &ManagedRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn downgrade(&self) -> WeakManagedRef {
        WeakManagedRef(Arc::downgrade(&self.0))
    }

    /// Attach native-side auxiliary state to this object. The initializer runs
    /// at most once per object; later calls return the attached value. Returns
    /// `None` when the slot already holds a value of another type.
    pub fn attach_meta<T, F>(&self, init: F) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        let slot = self
            .0
            .meta
            .get_or_init(|| Arc::new(init()) as Arc<dyn Any + Send + Sync>);
        Arc::clone(slot).downcast::<T>().ok()
    }

    /// The attached auxiliary state, if any was attached and it is a `T`.
    pub fn meta<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let slot = self.0.meta.get()?;
        Arc::clone(slot).downcast::<T>().ok()
    }

    pub fn has_meta(&self) -> bool {
        self.0.meta.get().is_some()
    }

    /// Leak this reference into an opaque address for the foreign boundary.
    pub fn into_raw(self) -> *const HeapObject {
        Arc::into_raw(self.0)
    }

    /// Reclaim a reference previously leaked with `into_raw`.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `ManagedRef::into_raw` (or `StablePtr::into_raw`)
    /// and must not be reclaimed twice.
    pub unsafe fn from_raw(ptr: *const HeapObject) -> Self {
        ManagedRef(unsafe { Arc::from_raw(ptr) })
    }

    /// Produce a new reference from a borrowed raw address without consuming
    /// the caller's reference.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a live object produced by `into_raw`.
    pub unsafe fn clone_from_raw(ptr: *const HeapObject) -> Self {
        unsafe {
            Arc::increment_strong_count(ptr);
            ManagedRef(Arc::from_raw(ptr))
        }
    }
}

impl fmt::Debug for ManagedRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

/// A weak reference that does not keep its target alive.
#[derive(Clone)]
pub struct WeakManagedRef(Weak<HeapObject>);

impl WeakManagedRef {
    pub fn upgrade(&self) -> Option<ManagedRef> {
        self.0.upgrade().map(ManagedRef)
    }
}

impl fmt::Debug for WeakManagedRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WeakManagedRef")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_tag_and_ids() {
        let a = ManagedRef::int(1);
        let b = ManagedRef::with_fields(Value::Unit, vec![a.clone()]);
        assert_eq!(a.tag(), HeapTag::Int);
        assert_eq!(b.tag(), HeapTag::Record);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.ref_count(), 2);
    }

    #[test]
    fn test_raw_round_trip_keeps_count() {
        let a = ManagedRef::string("hello");
        let keep = a.clone();
        let raw = a.into_raw();
        let borrowed = unsafe { ManagedRef::clone_from_raw(raw) };
        assert_eq!(keep.ref_count(), 3);
        drop(borrowed);
        let back = unsafe { ManagedRef::from_raw(raw) };
        assert_eq!(back.as_str(), Some("hello"));
        drop(back);
        assert_eq!(keep.ref_count(), 1);
    }

    #[test]
    fn test_attach_meta_once() {
        let a = ManagedRef::unit();
        let first = a.attach_meta(|| 7u32).unwrap();
        let second = a.attach_meta(|| 9u32).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(*second, 7);
        assert!(a.attach_meta(|| "other").is_none());
        assert_eq!(a.meta::<u32>().as_deref(), Some(&7));
        assert!(a.meta::<String>().is_none());
        assert!(ManagedRef::unit().meta::<u32>().is_none());
    }

    #[test]
    fn test_weak_does_not_keep_alive() {
        let a = ManagedRef::int(3);
        let weak = a.downgrade();
        assert!(weak.upgrade().is_some());
        drop(a);
        assert!(weak.upgrade().is_none());
    }
}
