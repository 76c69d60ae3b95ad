// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! In-process surface and hardware component.
//!
//! [`LoopbackSurface`] is a buffer queue with a display FIFO and a consumer
//! API ([`LoopbackSurface::consume`]) which fires the release listener the
//! way a compositor would. [`LoopbackComponent`] accepts buffers and holds
//! them until the caller completes them. Both support fault injection and
//! are used by the loopback binary, the benches and the tests.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};
use tracing::{debug, trace};

use crate::{
    error::{OmxError, SurfaceError},
    fence::{Fence, FenceTrigger},
    format::{BufferUsage, CropRect, FourCC, PortInfo, RequestTemplate, NV12},
    omx::{BufferFlags, ColorAspects, OmxBuffer, OmxCallbacks, OmxComponent, OmxCrop, OmxEvent, PortDefinition},
    pool::{BufferId, Port},
    surface::{
        FlushConfig, NativeBuffer, NativeHandle, ReleaseListener, ScalingMode, Surface, SurfaceId,
        Transform,
    },
};

static NEXT_SURFACE_ID: AtomicU64 = AtomicU64::new(1);

/// Default queue depth of a new surface.
pub const DEFAULT_QUEUE_SIZE: u32 = 3;

const fn align_up(value: u32, alignment: u32) -> u32 {
    if alignment <= 1 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum SlotState {
    Free,
    Dequeued,
    Queued,
    Acquired,
}

struct Slot {
    buffer: NativeBuffer,
    state: SlotState,
}

/// Call counters of a [`LoopbackSurface`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SurfaceStats {
    pub requested: usize,
    pub canceled: usize,
    pub flushed: usize,
    pub attached: usize,
    pub detached: usize,
    pub released: usize,
}

/// A frame taken off the display FIFO.
#[derive(Clone, Debug, PartialEq)]
pub struct ConsumedFrame {
    pub handle: NativeHandle,
    pub seq_num: u32,
    pub width: u32,
    pub height: u32,
    pub damage: CropRect,
    pub timestamp: i64,
}

struct SurfaceState {
    slots: Vec<Slot>,
    free: VecDeque<NativeHandle>,
    display: VecDeque<(NativeHandle, FlushConfig)>,
    queue_size: u32,
    next_seq: u32,
    transform: Transform,
    scaling: HashMap<u32, ScalingMode>,
    default_usage: u64,
    stats: SurfaceStats,
    abandoned: bool,
    fail_request_in: Option<usize>,
    attaches_left: Option<usize>,
    reject_queue_size: bool,
    hold_fences: bool,
    triggers: Vec<FenceTrigger>,
    last_usage: Option<BufferUsage>,
}

impl SurfaceState {
    fn slot(&self, handle: NativeHandle) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.buffer.handle() == handle)
    }

    fn release_to_free(&mut self, index: usize) {
        let handle = self.slots[index].buffer.handle();
        self.slots[index].state = SlotState::Free;
        self.free.push_back(handle);
    }
}

/// Buffer queue with a simulated display consumer.
pub struct LoopbackSurface {
    id: SurfaceId,
    name: String,
    consumer: bool,
    state: Mutex<SurfaceState>,
    listener: Mutex<Option<Arc<ReleaseListener>>>,
}

impl LoopbackSurface {
    pub fn new(name: &str) -> Self {
        Self {
            id: NEXT_SURFACE_ID.fetch_add(1, Ordering::Relaxed),
            name: name.to_string(),
            consumer: false,
            state: Mutex::new(SurfaceState {
                slots: Vec::new(),
                free: VecDeque::new(),
                display: VecDeque::new(),
                queue_size: DEFAULT_QUEUE_SIZE,
                next_seq: 0,
                transform: Transform::None,
                scaling: HashMap::new(),
                default_usage: 0,
                stats: SurfaceStats::default(),
                abandoned: false,
                fail_request_in: None,
                attaches_left: None,
                reject_queue_size: false,
                hold_fences: false,
                triggers: Vec::new(),
                last_usage: None,
            }),
            listener: Mutex::new(None),
        }
    }

    /// A consumer-role surface, which decoders must refuse.
    pub fn consumer(name: &str) -> Self {
        Self {
            consumer: true,
            ..Self::new(name)
        }
    }

    pub fn with_default_usage(self, usage: u64) -> Self {
        self.lock().default_usage = usage;
        self
    }

    fn lock(&self) -> MutexGuard<'_, SurfaceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fails the `n`th buffer request from now on, counting from 1.
    pub fn fail_nth_request(&self, n: usize) {
        self.lock().fail_request_in = Some(n);
    }

    /// Lets `n` more attaches succeed and fails every one after that.
    pub fn fail_attach_after(&self, n: usize) {
        self.lock().attaches_left = Some(n);
    }

    pub fn reject_queue_size(&self, reject: bool) {
        self.lock().reject_queue_size = reject;
    }

    /// Hands out unsignaled release fences with every request until `hold`
    /// is cleared. Held fences only signal through
    /// [`signal_fences`](Self::signal_fences).
    pub fn hold_fences(&self, hold: bool) {
        self.lock().hold_fences = hold;
    }

    pub fn pending_fences(&self) -> usize {
        self.lock().triggers.len()
    }

    /// Signals every held fence. Returns how many were signaled.
    pub fn signal_fences(&self) -> usize {
        let triggers = std::mem::take(&mut self.lock().triggers);
        triggers
            .iter()
            .filter(|trigger| match trigger.signal() {
                Ok(()) => true,
                Err(err) => {
                    debug!("signal {:?} failed: {}", trigger, err);
                    false
                }
            })
            .count()
    }

    /// Usage of the most recent buffer request.
    pub fn last_request_usage(&self) -> Option<BufferUsage> {
        self.lock().last_usage
    }

    /// Simulates a dead consumer: every producer call fails from now on.
    pub fn abandon(&self) {
        self.lock().abandoned = true;
    }

    /// Buffers currently dequeued by the producer.
    pub fn outstanding(&self) -> usize {
        self.lock()
            .slots
            .iter()
            .filter(|slot| slot.state == SlotState::Dequeued)
            .count()
    }

    /// Buffers waiting in the display FIFO.
    pub fn queued(&self) -> usize {
        self.lock().display.len()
    }

    pub fn slot_count(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn contains(&self, handle: NativeHandle) -> bool {
        self.lock().slot(handle).is_some()
    }

    pub fn stats(&self) -> SurfaceStats {
        self.lock().stats
    }

    pub fn scaling_mode(&self, seq_num: u32) -> Option<ScalingMode> {
        self.lock().scaling.get(&seq_num).copied()
    }

    pub fn has_release_listener(&self) -> bool {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Takes the oldest frame off the display FIFO and holds it.
    pub fn acquire(&self) -> Option<ConsumedFrame> {
        let mut st = self.lock();
        let (handle, config) = st.display.pop_front()?;
        let index = st.slot(handle)?;
        let slot = &mut st.slots[index];
        slot.state = SlotState::Acquired;
        Some(ConsumedFrame {
            handle,
            seq_num: slot.buffer.seq_num(),
            width: slot.buffer.width(),
            height: slot.buffer.height(),
            damage: config.damage,
            timestamp: config.timestamp,
        })
    }

    /// Returns an acquired buffer to the free list and notifies the
    /// producer. Unknown handles are ignored.
    pub fn release(&self, handle: NativeHandle) -> bool {
        {
            let mut st = self.lock();
            let Some(index) = st.slot(handle) else {
                return false;
            };
            if st.slots[index].state != SlotState::Acquired {
                return false;
            }
            st.release_to_free(index);
            st.stats.released += 1;
        }
        self.notify_release();
        true
    }

    /// Acquires and immediately releases the oldest queued frame.
    pub fn consume(&self) -> Option<ConsumedFrame> {
        let frame = self.acquire()?;
        self.release(frame.handle);
        Some(frame)
    }

    fn notify_release(&self) {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(listener) = listener {
            listener();
        }
    }
}

impl Surface for LoopbackSurface {
    fn unique_id(&self) -> SurfaceId {
        self.id
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn is_consumer(&self) -> bool {
        self.consumer
    }

    fn request_buffer(
        &self,
        template: &RequestTemplate,
    ) -> Result<(NativeBuffer, Fence), SurfaceError> {
        let mut st = self.lock();
        if st.abandoned {
            return Err(SurfaceError::Abandoned);
        }
        match st.fail_request_in {
            Some(1) => {
                st.fail_request_in = None;
                return Err(SurfaceError::NoBuffer);
            }
            Some(n) => st.fail_request_in = Some(n - 1),
            None => {}
        }
        let (fence, trigger) = if st.hold_fences {
            let (fence, trigger) = Fence::pending()
                .map_err(|err| SurfaceError::Other(err.raw_os_error().unwrap_or(-1)))?;
            (fence, Some(trigger))
        } else {
            (Fence::signaled(), None)
        };

        let stride = align_up(template.width, template.stride_alignment);
        let buffer = if let Some(handle) = st.free.pop_front() {
            let index = st.slot(handle).ok_or(SurfaceError::NotFound)?;
            let slot = &mut st.slots[index];
            let current = &slot.buffer;
            if current.width() != template.width
                || current.height() != template.height
                || current.format() != template.format
            {
                trace!("reallocate slot seq {}", current.seq_num());
                slot.buffer = NativeBuffer::new(
                    current.seq_num(),
                    template.width,
                    template.height,
                    stride,
                    template.format,
                );
            }
            slot.state = SlotState::Dequeued;
            slot.buffer.clone()
        } else if st.slots.len() < st.queue_size as usize {
            let seq = st.next_seq;
            st.next_seq += 1;
            let buffer = NativeBuffer::new(seq, template.width, template.height, stride, template.format);
            st.slots.push(Slot {
                buffer: buffer.clone(),
                state: SlotState::Dequeued,
            });
            buffer
        } else {
            return Err(SurfaceError::NoBuffer);
        };
        st.stats.requested += 1;
        st.last_usage = Some(template.usage);
        st.triggers.extend(trigger);
        Ok((buffer, fence))
    }

    fn flush_buffer(
        &self,
        buffer: &NativeBuffer,
        fence: Fence,
        config: &FlushConfig,
    ) -> Result<(), SurfaceError> {
        let mut st = self.lock();
        if st.abandoned {
            return Err(SurfaceError::Abandoned);
        }
        let index = st.slot(buffer.handle()).ok_or(SurfaceError::NotFound)?;
        if st.slots[index].state != SlotState::Dequeued {
            return Err(SurfaceError::WrongState);
        }
        if let Err(err) = fence.wait() {
            debug!("acquire fence wait failed: {}", err);
        }
        st.slots[index].state = SlotState::Queued;
        st.display.push_back((buffer.handle(), *config));
        st.stats.flushed += 1;
        Ok(())
    }

    fn cancel_buffer(&self, buffer: &NativeBuffer) -> Result<(), SurfaceError> {
        let mut st = self.lock();
        if st.abandoned {
            return Err(SurfaceError::Abandoned);
        }
        let index = st.slot(buffer.handle()).ok_or(SurfaceError::NotFound)?;
        if st.slots[index].state != SlotState::Dequeued {
            return Err(SurfaceError::WrongState);
        }
        st.release_to_free(index);
        st.stats.canceled += 1;
        Ok(())
    }

    fn attach_buffer_to_queue(&self, buffer: &NativeBuffer) -> Result<(), SurfaceError> {
        let mut st = self.lock();
        if st.abandoned {
            return Err(SurfaceError::Abandoned);
        }
        match st.attaches_left {
            Some(0) => return Err(SurfaceError::Other(-1)),
            Some(n) => st.attaches_left = Some(n - 1),
            None => {}
        }
        if st.slot(buffer.handle()).is_some() {
            return Err(SurfaceError::InvalidParam("buffer is already attached".into()));
        }
        if st.slots.len() >= st.queue_size as usize {
            return Err(SurfaceError::NoBuffer);
        }
        st.slots.push(Slot {
            buffer: buffer.clone(),
            state: SlotState::Dequeued,
        });
        st.stats.attached += 1;
        Ok(())
    }

    fn detach_buffer_from_queue(&self, buffer: &NativeBuffer) -> Result<(), SurfaceError> {
        let mut st = self.lock();
        let handle = buffer.handle();
        let index = st.slot(handle).ok_or(SurfaceError::NotFound)?;
        st.slots.remove(index);
        st.free.retain(|free| *free != handle);
        st.display.retain(|(queued, _)| *queued != handle);
        st.stats.detached += 1;
        Ok(())
    }

    fn queue_size(&self) -> u32 {
        self.lock().queue_size
    }

    fn set_queue_size(&self, size: u32) -> Result<(), SurfaceError> {
        let mut st = self.lock();
        if st.reject_queue_size || size == 0 {
            return Err(SurfaceError::InvalidParam(format!("queue size {size}")));
        }
        st.queue_size = size;
        Ok(())
    }

    fn transform(&self) -> Transform {
        self.lock().transform
    }

    fn set_transform(&self, transform: Transform) -> Result<(), SurfaceError> {
        self.lock().transform = transform;
        Ok(())
    }

    fn set_scaling_mode(&self, seq_num: u32, mode: ScalingMode) -> Result<(), SurfaceError> {
        self.lock().scaling.insert(seq_num, mode);
        Ok(())
    }

    fn register_release_listener(&self, listener: ReleaseListener) -> Result<(), SurfaceError> {
        if self.lock().abandoned {
            return Err(SurfaceError::Abandoned);
        }
        *self.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(listener));
        Ok(())
    }

    fn unregister_release_listener(&self) {
        *self.listener.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn clean_cache(&self) -> Result<(), SurfaceError> {
        let mut st = self.lock();
        st.slots.retain(|slot| slot.state != SlotState::Free);
        st.free.clear();
        Ok(())
    }

    fn default_usage(&self) -> u64 {
        self.lock().default_usage
    }
}

struct Registered {
    port: Port,
    alloc_len: u32,
    queued: bool,
}

struct ComponentState {
    callbacks: Option<OmxCallbacks>,
    input: PortDefinition,
    output: PortDefinition,
    crop: Option<OmxCrop>,
    color: Option<ColorAspects>,
    vendor_usage: Option<u64>,
    port_info: HashMap<Port, PortInfo>,
    next_id: u32,
    buffers: BTreeMap<BufferId, Registered>,
    fills: VecDeque<BufferId>,
    empties: VecDeque<BufferId>,
    fill_submissions: HashMap<BufferId, usize>,
    fail_use_in: Option<usize>,
    fail_fills: bool,
    reject_ports: bool,
}

/// Hardware component which completes buffers on request.
#[derive(Clone)]
pub struct LoopbackComponent {
    inner: Arc<Mutex<ComponentState>>,
}

/// Input buffers a new component asks for.
pub const DEFAULT_INPUT_BUFFERS: u32 = 4;

fn output_definition(width: u32, height: u32, format: FourCC, count: u32) -> PortDefinition {
    PortDefinition {
        width,
        height,
        stride: width,
        slice_height: height,
        color_format: format.graphic_format().unwrap_or(0),
        buffer_count: count,
        buffer_size: width * height * 3 / 2,
    }
}

impl LoopbackComponent {
    pub fn new(width: u32, height: u32, output_buffers: u32) -> Self {
        let input = PortDefinition {
            width,
            height,
            stride: 0,
            slice_height: 0,
            color_format: 0,
            buffer_count: DEFAULT_INPUT_BUFFERS,
            buffer_size: (width * height * 3 / 4).max(4096),
        };
        Self {
            inner: Arc::new(Mutex::new(ComponentState {
                callbacks: None,
                input,
                output: output_definition(width, height, NV12, output_buffers),
                crop: None,
                color: None,
                vendor_usage: None,
                port_info: HashMap::new(),
                next_id: 0,
                buffers: BTreeMap::new(),
                fills: VecDeque::new(),
                empties: VecDeque::new(),
                fill_submissions: HashMap::new(),
                fail_use_in: None,
                fail_fills: false,
                reject_ports: false,
            })),
        }
    }

    pub fn with_crop(self, crop: OmxCrop) -> Self {
        self.lock().crop = Some(crop);
        self
    }

    pub fn with_color_aspects(self, aspects: ColorAspects) -> Self {
        self.lock().color = Some(aspects);
        self
    }

    pub fn with_vendor_usage(self, usage: u64) -> Self {
        self.lock().vendor_usage = Some(usage);
        self
    }

    fn lock(&self) -> MutexGuard<'_, ComponentState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fails the `n`th use-buffer call from now on, counting from 1 across
    /// both ports.
    pub fn fail_nth_use_buffer(&self, n: usize) {
        self.lock().fail_use_in = Some(n);
    }

    pub fn set_fail_fills(&self, fail: bool) {
        self.lock().fail_fills = fail;
    }

    pub fn reject_port_settings(&self, reject: bool) {
        self.lock().reject_ports = reject;
    }

    /// Port settings written by the decoder.
    pub fn port_info(&self, port: Port) -> Option<PortInfo> {
        self.lock().port_info.get(&port).cloned()
    }

    pub fn registered(&self, port: Port) -> usize {
        self.lock()
            .buffers
            .values()
            .filter(|buf| buf.port == port)
            .count()
    }

    pub fn pending_fills(&self) -> usize {
        self.lock().fills.len()
    }

    pub fn pending_empties(&self) -> usize {
        self.lock().empties.len()
    }

    /// How many times `id` was submitted for filling.
    pub fn fill_submissions(&self, id: BufferId) -> usize {
        self.lock().fill_submissions.get(&id).copied().unwrap_or(0)
    }

    fn post(&self, event: OmxEvent) -> bool {
        let callbacks = self.lock().callbacks.clone();
        match callbacks {
            Some(callbacks) => callbacks.post(event),
            None => false,
        }
    }

    /// Posts an arbitrary event, bypassing the component's own bookkeeping.
    pub fn post_raw(&self, event: OmxEvent) -> bool {
        self.post(event)
    }

    /// Completes the oldest pending fill with a full frame.
    pub fn complete_fill(&self, pts: i64) -> Option<BufferId> {
        self.complete_fill_with(pts, BufferFlags::empty())
    }

    pub fn complete_fill_with(&self, pts: i64, flags: BufferFlags) -> Option<BufferId> {
        let (id, filled_len) = {
            let mut st = self.lock();
            let id = st.fills.pop_front()?;
            let buffer = st.buffers.get_mut(&id)?;
            buffer.queued = false;
            (id, buffer.alloc_len)
        };
        self.post(OmxEvent::FillBufferDone {
            id,
            pts,
            filled_len,
            flags,
        });
        Some(id)
    }

    /// Returns every pending fill empty, as on a port flush.
    pub fn return_all_fills(&self) -> usize {
        let ids: Vec<BufferId> = {
            let mut st = self.lock();
            let ids: Vec<BufferId> = st.fills.drain(..).collect();
            for id in &ids {
                if let Some(buffer) = st.buffers.get_mut(id) {
                    buffer.queued = false;
                }
            }
            ids
        };
        for id in &ids {
            self.post(OmxEvent::FillBufferDone {
                id: *id,
                pts: 0,
                filled_len: 0,
                flags: BufferFlags::empty(),
            });
        }
        ids.len()
    }

    pub fn complete_empty(&self) -> Option<BufferId> {
        let id = {
            let mut st = self.lock();
            let id = st.empties.pop_front()?;
            if let Some(buffer) = st.buffers.get_mut(&id) {
                buffer.queued = false;
            }
            id
        };
        self.post(OmxEvent::EmptyBufferDone { id });
        Some(id)
    }

    /// Changes the decoded geometry and announces it on the output port.
    pub fn change_output_geometry(&self, width: u32, height: u32, crop: Option<OmxCrop>) {
        {
            let mut st = self.lock();
            let format = FourCC::from_graphic_format(st.output.color_format).unwrap_or(NV12);
            let count = st.output.buffer_count;
            st.output = output_definition(width, height, format, count);
            st.crop = crop;
        }
        self.post(OmxEvent::PortSettingsChanged { port: Port::Output });
    }
}

impl OmxComponent for LoopbackComponent {
    fn set_callbacks(&mut self, callbacks: OmxCallbacks) {
        self.lock().callbacks = Some(callbacks);
    }

    fn set_video_port(&mut self, port: Port, info: &PortInfo) -> Result<(), OmxError> {
        let mut st = self.lock();
        if st.reject_ports {
            return Err(OmxError::Rejected(-22));
        }
        match port {
            Port::Input => {
                st.input.width = info.width;
                st.input.height = info.height;
                if let Some(size) = info.buffer_size {
                    st.input.buffer_size = size;
                }
            }
            Port::Output => {
                let format = info.format.unwrap_or(NV12);
                let count = st.output.buffer_count;
                st.output = output_definition(info.width, info.height, format, count);
            }
        }
        st.port_info.insert(port, info.clone());
        Ok(())
    }

    fn port_definition(&self, port: Port) -> Result<PortDefinition, OmxError> {
        let st = self.lock();
        Ok(match port {
            Port::Input => st.input.clone(),
            Port::Output => st.output.clone(),
        })
    }

    fn output_crop(&self) -> Option<OmxCrop> {
        self.lock().crop
    }

    fn color_aspects(&self) -> Option<ColorAspects> {
        self.lock().color
    }

    fn vendor_usage(&self) -> Option<u64> {
        self.lock().vendor_usage
    }

    fn use_buffer(
        &mut self,
        port: Port,
        native: Option<&NativeBuffer>,
    ) -> Result<OmxBuffer, OmxError> {
        let mut st = self.lock();
        match st.fail_use_in {
            Some(1) => {
                st.fail_use_in = None;
                return Err(OmxError::Rejected(-12));
            }
            Some(n) => st.fail_use_in = Some(n - 1),
            None => {}
        }
        let alloc_len = match (port, native) {
            (Port::Input, _) => st.input.buffer_size,
            (Port::Output, Some(native)) => native.stride() * native.height() * 3 / 2,
            (Port::Output, None) => st.output.buffer_size,
        };
        let id = BufferId(st.next_id);
        st.next_id += 1;
        st.buffers.insert(
            id,
            Registered {
                port,
                alloc_len,
                queued: false,
            },
        );
        Ok(OmxBuffer::new(id, alloc_len))
    }

    fn fill_this_buffer(&mut self, buffer: &OmxBuffer) -> Result<(), OmxError> {
        let mut st = self.lock();
        if st.fail_fills {
            return Err(OmxError::Rejected(-1));
        }
        let registered = st
            .buffers
            .get_mut(&buffer.id)
            .ok_or(OmxError::UnknownBuffer(buffer.id))?;
        if registered.queued {
            return Err(OmxError::AlreadyQueued(buffer.id));
        }
        registered.queued = true;
        st.fills.push_back(buffer.id);
        *st.fill_submissions.entry(buffer.id).or_default() += 1;
        Ok(())
    }

    fn empty_this_buffer(&mut self, buffer: &OmxBuffer) -> Result<(), OmxError> {
        let mut st = self.lock();
        let registered = st
            .buffers
            .get_mut(&buffer.id)
            .ok_or(OmxError::UnknownBuffer(buffer.id))?;
        if registered.queued {
            return Err(OmxError::AlreadyQueued(buffer.id));
        }
        registered.queued = true;
        st.empties.push_back(buffer.id);
        Ok(())
    }

    fn free_buffer(&mut self, _port: Port, buffer: &OmxBuffer) -> Result<(), OmxError> {
        let mut st = self.lock();
        st.buffers
            .remove(&buffer.id)
            .ok_or(OmxError::UnknownBuffer(buffer.id))?;
        st.fills.retain(|id| *id != buffer.id);
        st.empties.retain(|id| *id != buffer.id);
        Ok(())
    }
}
