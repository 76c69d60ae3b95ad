// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Display/compositor surface interface.
//!
//! A [`Surface`] is the producer side of a buffer queue whose consumer is a
//! display or compositor. The decoder requests native buffers from it, lets
//! the hardware fill them, flushes them for display and gets them back
//! through the release listener.

use serde::{Deserialize, Serialize};
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tracing::{info, warn};

use crate::{
    error::SurfaceError,
    fence::Fence,
    format::{CropRect, FourCC, RequestTemplate},
};

/// Unique id of a surface.
pub type SurfaceId = u64;

/// Identity of the memory behind a [`NativeBuffer`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct NativeHandle(pub u64);

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

struct NativeBufferInner {
    handle: NativeHandle,
    seq_num: u32,
    width: u32,
    height: u32,
    stride: u32,
    format: FourCC,
}

/// Reference counted native buffer. Clones share the same memory and handle;
/// moving a buffer between queues keeps its handle.
#[derive(Clone)]
pub struct NativeBuffer(Arc<NativeBufferInner>);

impl NativeBuffer {
    pub fn new(seq_num: u32, width: u32, height: u32, stride: u32, format: FourCC) -> Self {
        Self(Arc::new(NativeBufferInner {
            handle: NativeHandle(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed)),
            seq_num,
            width,
            height,
            stride,
            format,
        }))
    }

    pub fn handle(&self) -> NativeHandle {
        self.0.handle
    }

    /// Sequence number of the buffer within the queue which allocated it.
    pub fn seq_num(&self) -> u32 {
        self.0.seq_num
    }

    pub fn width(&self) -> u32 {
        self.0.width
    }

    pub fn height(&self) -> u32 {
        self.0.height
    }

    pub fn stride(&self) -> u32 {
        self.0.stride
    }

    pub fn format(&self) -> FourCC {
        self.0.format
    }
}

impl PartialEq for NativeBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.handle() == other.handle()
    }
}

impl Eq for NativeBuffer {}

impl fmt::Debug for NativeBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "NativeBuffer(handle:{} seq:{} {}x{} stride:{} {})",
            self.0.handle.0,
            self.0.seq_num,
            self.0.width,
            self.0.height,
            self.0.stride,
            self.0.format
        )
    }
}

/// Display transform applied by the consumer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transform {
    None,
    Rotate90,
    Rotate180,
    Rotate270,
    FlipH,
    FlipV,
}

impl Transform {
    /// Maps a clockwise video rotation in degrees to the display transform.
    pub fn from_rotation(degrees: i32) -> Option<Self> {
        match degrees {
            0 => Some(Transform::None),
            90 => Some(Transform::Rotate270),
            180 => Some(Transform::Rotate180),
            270 => Some(Transform::Rotate90),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingMode {
    ScaleToWindow,
    ScaleCrop,
}

/// Damage region and presentation timestamp of a flushed buffer.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct FlushConfig {
    pub damage: CropRect,
    pub timestamp: i64,
}

/// Invoked by the consumer side whenever it releases a buffer. Runs on a
/// foreign thread.
pub type ReleaseListener = Box<dyn Fn() + Send + Sync>;

/// Producer side of a display buffer queue.
pub trait Surface: Send + Sync {
    fn unique_id(&self) -> SurfaceId;

    fn name(&self) -> String;

    /// Decoders can only output into producer surfaces.
    fn is_consumer(&self) -> bool;

    fn request_buffer(
        &self,
        template: &RequestTemplate,
    ) -> Result<(NativeBuffer, Fence), SurfaceError>;

    fn flush_buffer(
        &self,
        buffer: &NativeBuffer,
        fence: Fence,
        config: &FlushConfig,
    ) -> Result<(), SurfaceError>;

    fn cancel_buffer(&self, buffer: &NativeBuffer) -> Result<(), SurfaceError>;

    fn attach_buffer_to_queue(&self, buffer: &NativeBuffer) -> Result<(), SurfaceError>;

    fn detach_buffer_from_queue(&self, buffer: &NativeBuffer) -> Result<(), SurfaceError>;

    fn queue_size(&self) -> u32;

    fn set_queue_size(&self, size: u32) -> Result<(), SurfaceError>;

    fn transform(&self) -> Transform;

    fn set_transform(&self, transform: Transform) -> Result<(), SurfaceError>;

    fn set_scaling_mode(&self, seq_num: u32, mode: ScalingMode) -> Result<(), SurfaceError>;

    fn register_release_listener(&self, listener: ReleaseListener) -> Result<(), SurfaceError>;

    fn unregister_release_listener(&self);

    fn clean_cache(&self) -> Result<(), SurfaceError>;

    fn default_usage(&self) -> u64;
}

/// Raises the queue depth of `surface` to at least `target`. Never lowers it.
pub fn set_min_queue_size(surface: &dyn Surface, target: u32) -> Result<(), SurfaceError> {
    if surface.queue_size() >= target {
        return Ok(());
    }
    if let Err(err) = surface.set_queue_size(target) {
        warn!(
            "surface({}), SetQueueSize to {} failed: {}",
            surface.unique_id(),
            target,
            err
        );
        return Err(err);
    }
    info!("surface({}), SetQueueSize to {} succ", surface.unique_id(), target);
    Ok(())
}

/// The currently bound output surface together with the transform it had
/// before the decoder touched it. Releasing the binding restores it.
pub struct SurfaceBinding {
    surface: Arc<dyn Surface>,
    original_transform: Option<Transform>,
}

impl SurfaceBinding {
    pub fn new(surface: Arc<dyn Surface>) -> Self {
        let original_transform = Some(surface.transform());
        Self {
            surface,
            original_transform,
        }
    }

    pub fn surface(&self) -> &Arc<dyn Surface> {
        &self.surface
    }

    pub fn id(&self) -> SurfaceId {
        self.surface.unique_id()
    }

    /// Unregisters the release listener and restores the original transform.
    /// Safe to call more than once.
    pub fn release(&mut self) {
        let Some(transform) = self.original_transform.take() else {
            return;
        };
        info!("release surface({})", self.surface.unique_id());
        self.surface.unregister_release_listener();
        if let Err(err) = self.surface.set_transform(transform) {
            warn!(
                "surface({}), restore transform {:?} failed: {}",
                self.surface.unique_id(),
                transform,
                err
            );
        }
    }
}

impl Drop for SurfaceBinding {
    fn drop(&mut self) {
        self.release();
    }
}

/// A buffer dequeued from a surface which is canceled back to the surface
/// when dropped, unless it was committed.
pub struct RequestedBuffer<'a> {
    surface: &'a dyn Surface,
    buffer: NativeBuffer,
    fence: Fence,
    committed: bool,
}

impl<'a> RequestedBuffer<'a> {
    pub fn request(surface: &'a dyn Surface, template: &RequestTemplate) -> Result<Self, SurfaceError> {
        let (buffer, fence) = surface.request_buffer(template)?;
        Ok(Self {
            surface,
            buffer,
            fence,
            committed: false,
        })
    }

    pub fn buffer(&self) -> &NativeBuffer {
        &self.buffer
    }

    pub fn take_fence(&mut self) -> Fence {
        std::mem::take(&mut self.fence)
    }

    /// Keeps the buffer dequeued and hands it to the caller.
    pub fn commit(mut self) -> NativeBuffer {
        self.committed = true;
        self.buffer.clone()
    }
}

impl Drop for RequestedBuffer<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Err(err) = self.surface.cancel_buffer(&self.buffer) {
            warn!(
                "surface({}), CancelBuffer(seq={}) failed: {}",
                self.surface.unique_id(),
                self.buffer.seq_num(),
                err
            );
        }
    }
}
