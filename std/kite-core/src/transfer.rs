//!
//! Ownership Transfer
//!
//! Moves a managed object out of managed reachability into a `StablePtr`.
//!
//! Modes:
//! - `Checked` (0): every object reachable from the root must be referenced
//!   only by the caller's reference and by edges inside the subgraph. Any
//!   surplus strong count means somebody else can still reach into the
//!   subgraph, and the transfer is rejected.
//! - `Unchecked` (1): the caller vouches for exclusivity; nothing is verified.
//!
//! A rejected transfer drops the caller's reference. It is never stored.
//!

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::stable::StablePtr;
use crate::value::{HeapObject, HeapTag, ManagedRef};

#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    #[default]
    Checked = 0,
    Unchecked = 1,
}

impl TryFrom<i32> for TransferMode {
    type Error = CoreError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TransferMode::Checked),
            1 => Ok(TransferMode::Unchecked),
            other => Err(CoreError::UnknownTransferMode(other)),
        }
    }
}

/// Why a CHECKED transfer refused an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRejection {
    pub object_id: u64,
    pub tag: HeapTag,
    /// References accounted for by the caller and the subgraph itself
    pub expected: usize,
    /// References actually held
    pub observed: usize,
}

impl fmt::Display for TransferRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "object #{} ({:?}) is still referenced from outside the transferred subgraph ({} references, {} expected)",
            self.object_id, self.tag, self.observed, self.expected
        )
    }
}

#[derive(Debug)]
pub enum Transfer {
    Transferred(StablePtr),
    Rejected(TransferRejection),
}

impl Transfer {
    pub fn is_transferred(&self) -> bool {
        matches!(self, Transfer::Transferred(_))
    }

    pub fn into_result(self) -> Result<StablePtr, CoreError> {
        match self {
            Transfer::Transferred(ptr) => Ok(ptr),
            Transfer::Rejected(reason) => Err(CoreError::InvalidState(reason)),
        }
    }
}

/// Transfer `object` into native ownership.
pub fn transfer(object: ManagedRef, mode: TransferMode) -> Transfer {
    match clear_subgraph_references(&object, mode == TransferMode::Checked) {
        Ok(()) => Transfer::Transferred(StablePtr::create(object)),
        Err(reason) => {
            tracing::warn!(%reason, "ownership transfer rejected");
            drop(object);
            Transfer::Rejected(reason)
        }
    }
}

/// Verify that `root` (held once by the caller) and everything it reaches is
/// not referenced from outside. With `checked == false` this always succeeds.
pub fn clear_subgraph_references(root: &ManagedRef, checked: bool) -> Result<(), TransferRejection> {
    if !checked {
        return Ok(());
    }

    // Incoming edges from inside the subgraph, keyed by object address.
    let mut internal: HashMap<*const HeapObject, usize> = HashMap::new();
    let mut nodes: Vec<&Arc<HeapObject>> = vec![&root.0];
    let mut stack: Vec<&Arc<HeapObject>> = vec![&root.0];
    internal.insert(Arc::as_ptr(&root.0), 0);

    while let Some(node) = stack.pop() {
        for child in node.fields() {
            let key = Arc::as_ptr(&child.0);
            match internal.get_mut(&key) {
                Some(count) => *count += 1,
                None => {
                    internal.insert(key, 1);
                    nodes.push(&child.0);
                    stack.push(&child.0);
                }
            }
        }
    }

    for node in nodes {
        let key = Arc::as_ptr(node);
        let mut expected = internal.get(&key).copied().unwrap_or(0);
        if std::ptr::eq(key, Arc::as_ptr(&root.0)) {
            expected += 1;
        }
        let observed = Arc::strong_count(node);
        if observed > expected {
            return Err(TransferRejection {
                object_id: node.header.id,
                tag: node.header.tag,
                expected,
                observed,
            });
        }
    }
    Ok(())
}
