//! src/broadcast.rs
//!
//! Broadcast blobs and resident-set delta planning.
//!
//! Every broadcast is an immutable `(id, payload)` pair shipped to a worker
//! at most once; pooled workers keep the payload cached across tasks. The
//! feeder only sends the symmetric difference between what the worker
//! already holds and what the next task needs. Planning is pure so the
//! delta properties are testable without a socket.
//!
//! On the wire a registration is the id (i64) followed by one data frame;
//! a deregistration is the single value `-id - 1`, so id 0 serializes as
//! -1 and stays distinguishable from a registration.

use crate::codec;
use anyhow::Result;
use std::collections::HashSet;
use std::path::Path;

/// An immutable, globally-identified payload cached per worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Broadcast {
    /// Non-negative 64-bit identifier.
    pub id: i64,
    /// Opaque payload bytes; the bridge never interprets them.
    pub payload: Vec<u8>,
}

impl Broadcast {
    pub fn new(id: i64, payload: Vec<u8>) -> Self {
        Self { id, payload }
    }

    /// Loads a broadcast whose payload was persisted as a single-frame file.
    pub fn from_file(id: i64, path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            id,
            payload: codec::read_single_frame_from_file(path)?,
        })
    }
}

/// Wire encoding of a deregistration for `id`.
pub fn encode_deregistration(id: i64) -> i64 {
    -id - 1
}

/// Id recovered from a deregistration entry.
pub fn decode_deregistration(wire: i64) -> i64 {
    -(wire + 1)
}

/// The entries a feeder must emit to move `resident` to the wanted set.
pub struct DeltaPlan<'a> {
    /// Ids resident on the worker but absent from the task.
    pub deregister: Vec<i64>,
    /// Broadcasts required by the task but not yet resident.
    pub register: Vec<&'a Broadcast>,
}

impl DeltaPlan<'_> {
    pub fn entry_count(&self) -> usize {
        self.deregister.len() + self.register.len()
    }
}

/// Computes the delta between the worker's resident set and the task's
/// broadcasts. Entry count equals the size of the symmetric difference;
/// duplicate ids in `wanted` are registered once.
pub fn plan_delta<'a>(resident: &HashSet<i64>, wanted: &'a [Broadcast]) -> DeltaPlan<'a> {
    let wanted_ids: HashSet<i64> = wanted.iter().map(|b| b.id).collect();
    let deregister: Vec<i64> = resident
        .iter()
        .copied()
        .filter(|id| !wanted_ids.contains(id))
        .collect();
    let mut seen = HashSet::new();
    let register: Vec<&Broadcast> = wanted
        .iter()
        .filter(|b| !resident.contains(&b.id) && seen.insert(b.id))
        .collect();
    DeltaPlan {
        deregister,
        register,
    }
}
