// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Buffer pools and the ownership state machine.
//!
//! Each port has its own [`BufferPool`]. A pool is keyed by the hardware
//! assigned [`BufferId`], so erasing one descriptor never invalidates the
//! identity of another. Every descriptor has exactly one [`BufferOwner`] at
//! any instant:
//!
//! ```text
//!            fill/empty              fill done (output)
//!   US ─────────────────▶ OMX ───────────────────────▶ USER
//!   ▲                      │ empty done (input)          │ render
//!   │                      ▼                             ▼
//!   └──────────────────── US ◀──── released ──────── SURFACE
//! ```

use serde::Serialize;
use std::{
    collections::BTreeMap,
    fmt,
    time::{Duration, Instant},
};
use tracing::trace;

use crate::{
    error::{DecoderError, Result},
    fence::Fence,
    omx::{BufferFlags, OmxBuffer},
    surface::{NativeBuffer, NativeHandle},
};

/// Buffer identity assigned by the hardware on use-buffer. Stable for the
/// lifetime of the descriptor.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct BufferId(pub u32);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum Port {
    Input,
    Output,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum BufferOwner {
    /// Held by the decoder, free to resubmit.
    OwnedByUs,
    /// Submitted to the hardware for filling or emptying.
    OwnedByOmx,
    /// Queued for display, waiting for the consumer to release it.
    OwnedBySurface,
    /// Handed to client code.
    OwnedByUser,
}

impl BufferOwner {
    pub const fn as_str(self) -> &'static str {
        match self {
            BufferOwner::OwnedByUs => "us",
            BufferOwner::OwnedByOmx => "omx",
            BufferOwner::OwnedBySurface => "surface",
            BufferOwner::OwnedByUser => "user",
        }
    }
}

impl fmt::Display for BufferOwner {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded output handed to client code.
#[derive(Clone, Debug)]
pub struct OutputBuffer {
    pub id: BufferId,
    pub pts: i64,
    pub filled_len: u32,
    pub flags: BufferFlags,
    /// Surface backed buffer, `None` in buffer mode.
    pub native: Option<NativeBuffer>,
}

impl OutputBuffer {
    pub fn is_eos(&self) -> bool {
        self.flags.contains(BufferFlags::EOS)
    }
}

/// Pool resident record uniting the native buffer with the hardware side
/// descriptor and ownership metadata.
#[derive(Debug)]
pub struct BufferDescriptor {
    id: BufferId,
    port: Port,
    owner: BufferOwner,
    owner_since: Instant,
    native: Option<NativeBuffer>,
    omx: OmxBuffer,
    frame: Option<OutputBuffer>,
    last_flush: Option<Instant>,
    fence: Fence,
}

impl BufferDescriptor {
    /// New descriptors start out owned by us. The native buffer is fixed for
    /// the descriptor's lifetime.
    pub fn new(port: Port, omx: OmxBuffer, native: Option<NativeBuffer>) -> Self {
        Self {
            id: omx.id,
            port,
            owner: BufferOwner::OwnedByUs,
            owner_since: Instant::now(),
            native,
            omx,
            frame: None,
            last_flush: None,
            fence: Fence::signaled(),
        }
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn owner(&self) -> BufferOwner {
        self.owner
    }

    /// Time spent with the current owner.
    pub fn owned_for(&self) -> Duration {
        self.owner_since.elapsed()
    }

    pub fn native(&self) -> Option<&NativeBuffer> {
        self.native.as_ref()
    }

    pub fn omx(&self) -> &OmxBuffer {
        &self.omx
    }

    pub fn omx_mut(&mut self) -> &mut OmxBuffer {
        &mut self.omx
    }

    pub fn last_flush(&self) -> Option<Instant> {
        self.last_flush
    }

    pub fn set_owner(&mut self, owner: BufferOwner) {
        trace!(
            "{:?} buffer id {} owner {} -> {}",
            self.port,
            self.id,
            self.owner,
            owner
        );
        self.owner = owner;
        self.owner_since = Instant::now();
    }

    pub(crate) fn set_fence(&mut self, fence: Fence) {
        self.fence = fence;
    }

    pub(crate) fn take_fence(&mut self) -> Fence {
        std::mem::take(&mut self.fence)
    }

    pub(crate) fn mark_flushed(&mut self) {
        self.last_flush = Some(Instant::now());
    }

    pub(crate) fn set_frame(&mut self, frame: OutputBuffer) {
        self.frame = Some(frame);
    }

    pub(crate) fn take_frame(&mut self) -> Option<OutputBuffer> {
        self.frame.take()
    }
}

/// Number of buffers held by each owner.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct OwnerCounts {
    pub us: usize,
    pub omx: usize,
    pub surface: usize,
    pub user: usize,
}

impl OwnerCounts {
    pub fn total(&self) -> usize {
        self.us + self.omx + self.surface + self.user
    }
}

#[derive(Debug)]
pub struct BufferPool {
    port: Port,
    buffers: BTreeMap<BufferId, BufferDescriptor>,
}

impl BufferPool {
    pub fn new(port: Port) -> Self {
        Self {
            port,
            buffers: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn contains(&self, id: BufferId) -> bool {
        self.buffers.contains_key(&id)
    }

    pub fn get(&self, id: BufferId) -> Option<&BufferDescriptor> {
        self.buffers.get(&id)
    }

    pub fn get_mut(&mut self, id: BufferId) -> Option<&mut BufferDescriptor> {
        self.buffers.get_mut(&id)
    }

    /// Adds a descriptor. The hardware must never hand out the same id twice
    /// for one port.
    pub fn insert(&mut self, desc: BufferDescriptor) -> Result<()> {
        if desc.port != self.port {
            return Err(DecoderError::InvalidValue(format!(
                "buffer id {} belongs to the {:?} port",
                desc.id, desc.port
            )));
        }
        if self.buffers.contains_key(&desc.id) {
            return Err(DecoderError::InvalidValue(format!(
                "duplicate buffer id {}",
                desc.id
            )));
        }
        self.buffers.insert(desc.id, desc);
        Ok(())
    }

    pub fn remove(&mut self, id: BufferId) -> Option<BufferDescriptor> {
        self.buffers.remove(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BufferDescriptor> {
        self.buffers.values()
    }

    /// Snapshot of the ids in the pool, for loops which mutate the pool.
    pub fn ids(&self) -> Vec<BufferId> {
        self.buffers.keys().copied().collect()
    }

    pub fn ids_owned_by(&self, owner: BufferOwner) -> Vec<BufferId> {
        self.buffers
            .values()
            .filter(|desc| desc.owner == owner)
            .map(|desc| desc.id)
            .collect()
    }

    pub fn first(&self) -> Option<&BufferDescriptor> {
        self.buffers.values().next()
    }

    pub fn owner_counts(&self) -> OwnerCounts {
        let mut counts = OwnerCounts::default();
        for desc in self.buffers.values() {
            match desc.owner {
                BufferOwner::OwnedByUs => counts.us += 1,
                BufferOwner::OwnedByOmx => counts.omx += 1,
                BufferOwner::OwnedBySurface => counts.surface += 1,
                BufferOwner::OwnedByUser => counts.user += 1,
            }
        }
        counts
    }

    /// Finds the buffer backed by `handle` and currently held by `owner`.
    ///
    /// Linear scan; pools hold a handful of buffers.
    pub fn find_by_native(&self, handle: NativeHandle, owner: BufferOwner) -> Option<BufferId> {
        self.buffers
            .values()
            .find(|desc| {
                desc.owner == owner && desc.native.as_ref().map(NativeBuffer::handle) == Some(handle)
            })
            .map(|desc| desc.id)
    }
}
