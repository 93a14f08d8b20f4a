//! Request tracker: at most one in-flight operation per (kind, epoch)
//!
//! Membership in the tracker is the only re-entrancy guard the client
//! driver has. A continuation that finds its (label, id) pair gone knows
//! it has been superseded and must do nothing.
//!
//! The tracker is not synchronized. The client driver runs on a single
//! task; wrap it in a mutex before sharing it across threads.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

use crate::epoch::{Epoch, Track};

/// Opaque id handed out by [`RequestTracker::begin`]
pub type RequestId = u64;

/// Sub-protocol kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolKind {
    Register,
    RegisterCombined,
    Lookup,
    LookupCombined,
}

impl ProtocolKind {
    pub fn track(&self) -> Track {
        match self {
            ProtocolKind::Register | ProtocolKind::Lookup => Track::Standard,
            ProtocolKind::RegisterCombined | ProtocolKind::LookupCombined => Track::Combined,
        }
    }

    pub fn is_lookup(&self) -> bool {
        matches!(self, ProtocolKind::Lookup | ProtocolKind::LookupCombined)
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolKind::Register => write!(f, "REG"),
            ProtocolKind::RegisterCombined => write!(f, "REG_COMBINED"),
            ProtocolKind::Lookup => write!(f, "LOOKUP"),
            ProtocolKind::LookupCombined => write!(f, "LOOKUP_COMBINED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestLabel {
    pub kind: ProtocolKind,
    pub epoch: Epoch,
}

impl RequestLabel {
    pub fn new(kind: ProtocolKind, epoch: Epoch) -> Self {
        Self { kind, epoch }
    }
}

impl fmt::Display for RequestLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.kind, self.epoch)
    }
}

/// De-duplication ledger keyed by label
#[derive(Debug)]
pub struct RequestTracker<L = RequestLabel> {
    active: HashMap<L, RequestId>,
    next_id: RequestId,
}

impl<L: Eq + Hash + Clone> RequestTracker<L> {
    pub fn new() -> Self {
        Self {
            active: HashMap::new(),
            next_id: 0,
        }
    }

    /// Reserve `label`. Returns `None` if it is already active.
    pub fn begin(&mut self, label: L) -> Option<RequestId> {
        if self.active.contains_key(&label) {
            return None;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.active.insert(label, id);
        Some(id)
    }

    /// Is `label` active, and if `id` is given, is it the holder?
    pub fn is_active(&self, label: &L, id: Option<RequestId>) -> bool {
        match (self.active.get(label), id) {
            (Some(held), Some(id)) => *held == id,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    /// Release `label` if `id` holds it. Returns whether anything was removed.
    pub fn end(&mut self, label: &L, id: RequestId) -> bool {
        if self.is_active(label, Some(id)) {
            self.active.remove(label);
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn labels(&self) -> impl Iterator<Item = &L> {
        self.active.keys()
    }
}

impl<L: Eq + Hash + Clone> Default for RequestTracker<L> {
    fn default() -> Self {
        Self::new()
    }
}
