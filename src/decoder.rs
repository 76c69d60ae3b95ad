// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Decoder core: buffer allocation, circulation and teardown.
//!
//! [`Decoder`] is owned by the decoder thread (see [`crate::handle`]) and is
//! the single writer of both buffer pools, the bound surface and the format
//! negotiator. Hardware and surface callbacks reach it only as messages.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::{
    error::{DecoderError, Result},
    fence::Fence,
    format::{
        producer_usage, BufferUsage, DecoderConfig, DecoderParameters, FormatNegotiator,
        OutputFormat,
    },
    handle::Msg,
    omx::{BufferFlags, OmxBuffer, OmxComponent, OmxEvent},
    pool::{BufferDescriptor, BufferId, BufferOwner, BufferPool, OutputBuffer, OwnerCounts, Port},
    surface::{
        set_min_queue_size, FlushConfig, NativeHandle, RequestedBuffer, Surface, SurfaceBinding,
        SurfaceId,
    },
};

/// Receives decoder notifications. Called on the decoder thread.
pub trait DecoderCallback: Send {
    fn on_input_buffer_available(&mut self, id: BufferId);

    fn on_output_buffer_available(&mut self, buffer: &OutputBuffer);

    fn on_output_format_changed(&mut self, format: &OutputFormat);

    fn on_error(&mut self, err: &DecoderError);
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub enum DecoderState {
    Uninitialized,
    Configured,
    Running,
    Released,
}

/// When an output surface is installed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SurfaceStage {
    /// Before start, while the decoder is being configured.
    Configure,
    /// While the decoder is running; buffers migrate to the new surface.
    Running,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RenderMode {
    /// The buffer returns to circulation once the surface releases it.
    #[default]
    Keep,
    /// The buffer is dropped from the pool right after the flush.
    FreeAfterRender,
}

#[derive(Clone, Debug, Serialize)]
pub struct BufferSnapshot {
    pub id: BufferId,
    pub owner: BufferOwner,
    pub native: Option<NativeHandle>,
    pub pts: i64,
    pub owned_for_ms: u128,
    pub flushed: bool,
}

impl BufferSnapshot {
    fn new(desc: &BufferDescriptor) -> Self {
        Self {
            id: desc.id(),
            owner: desc.owner(),
            native: desc.native().map(|native| native.handle()),
            pts: desc.omx().pts,
            owned_for_ms: desc.owned_for().as_millis(),
            flushed: desc.last_flush().is_some(),
        }
    }
}

/// Point in time view of the decoder for diagnostics and tests.
#[derive(Clone, Debug, Serialize)]
pub struct PoolSnapshot {
    pub state: DecoderState,
    pub surface: Option<SurfaceId>,
    pub input: Vec<BufferSnapshot>,
    pub output: Vec<BufferSnapshot>,
    pub input_counts: OwnerCounts,
    pub output_counts: OwnerCounts,
    pub circulating: bool,
    pub reconfiguring: bool,
    pub input_eos: bool,
    pub output_eos: bool,
    pub protocol_violations: u64,
    pub output_format: OutputFormat,
}

impl PoolSnapshot {
    pub fn output_buffer(&self, id: BufferId) -> Option<&BufferSnapshot> {
        self.output.iter().find(|buf| buf.id == id)
    }
}

pub(crate) struct Decoder {
    omx: Box<dyn OmxComponent>,
    callback: Box<dyn DecoderCallback>,
    inbox: kanal::Sender<Msg>,
    state: DecoderState,
    pub(crate) negotiator: FormatNegotiator,
    input: BufferPool,
    pub(crate) output: BufferPool,
    pub(crate) surface: Option<SurfaceBinding>,
    circulating: bool,
    reconfiguring: bool,
    input_eos: bool,
    output_eos: bool,
    protocol_violations: u64,
}

impl Decoder {
    pub fn new(
        omx: Box<dyn OmxComponent>,
        callback: Box<dyn DecoderCallback>,
        inbox: kanal::Sender<Msg>,
    ) -> Self {
        Self {
            omx,
            callback,
            inbox,
            state: DecoderState::Uninitialized,
            negotiator: FormatNegotiator::new(),
            input: BufferPool::new(Port::Input),
            output: BufferPool::new(Port::Output),
            surface: None,
            circulating: false,
            reconfiguring: false,
            input_eos: false,
            output_eos: false,
            protocol_violations: 0,
        }
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    /// Validates the configuration and writes both video ports.
    #[instrument(skip_all)]
    pub fn configure(&mut self, config: &DecoderConfig) -> Result<()> {
        if self.state != DecoderState::Uninitialized {
            return Err(DecoderError::InvalidOperation(format!(
                "configure in state {:?}",
                self.state
            )));
        }
        let setup = self.negotiator.setup(config)?;
        self.omx
            .set_video_port(Port::Input, &setup.input)
            .map_err(|err| DecoderError::Configuration(format!("set input port failed: {err}")))?;
        self.omx
            .set_video_port(Port::Output, &setup.output)
            .map_err(|err| DecoderError::Configuration(format!("set output port failed: {err}")))?;
        info!(
            "configured {}x{} {} @ {} fps",
            setup.output.width,
            setup.output.height,
            self.negotiator.configured_format(),
            self.negotiator.frame_rate()
        );
        self.state = DecoderState::Configured;
        Ok(())
    }

    pub fn set_output_surface(&mut self, surface: Arc<dyn Surface>, stage: SurfaceStage) -> Result<()> {
        match stage {
            SurfaceStage::Configure => self.set_output_surface_when_configuring(surface),
            SurfaceStage::Running => self.switch_output_surface(surface),
        }
    }

    fn set_output_surface_when_configuring(&mut self, surface: Arc<dyn Surface>) -> Result<()> {
        if !matches!(
            self.state,
            DecoderState::Uninitialized | DecoderState::Configured
        ) {
            return Err(DecoderError::InvalidOperation(format!(
                "set surface at configure time in state {:?}",
                self.state
            )));
        }
        if surface.is_consumer() {
            error!("expect a producer surface but got a consumer surface");
            return Err(DecoderError::InvalidValue(
                "consumer surface cannot be a decoder output".into(),
            ));
        }
        if let Some(mut old) = self.surface.take() {
            old.release();
        }
        self.register_release_listener(&surface)?;
        info!("set surface({}) {}", surface.unique_id(), surface.name());
        self.surface = Some(SurfaceBinding::new(surface));
        Ok(())
    }

    /// Installs a listener which posts a release notification for `surface`
    /// to the decoder inbox. The listener keeps no reference to the decoder.
    pub(crate) fn register_release_listener(&self, surface: &Arc<dyn Surface>) -> Result<()> {
        let surface_id = surface.unique_id();
        let inbox = self.inbox.clone();
        surface
            .register_release_listener(Box::new(move || {
                if inbox.send(Msg::BufferReleased { surface_id }).is_err() {
                    info!("decoder is gone");
                }
            }))
            .map_err(|err| {
                error!("surface({}), RegisterReleaseListener failed: {}", surface_id, err);
                DecoderError::Surface(err)
            })
    }

    pub fn set_parameters(&mut self, params: &DecoderParameters) -> Result<()> {
        if !self.negotiator.save_parameters(params)? || self.surface.is_none() {
            return Ok(());
        }
        if params.rotation.is_some() {
            self.apply_transform()?;
        }
        if params.scale_mode.is_some() {
            self.apply_scaling_mode()?;
        }
        Ok(())
    }

    fn apply_transform(&self) -> Result<()> {
        let (Some(binding), Some(transform)) = (&self.surface, self.negotiator.transform()) else {
            return Ok(());
        };
        binding.surface().set_transform(transform).map_err(|err| {
            warn!("surface({}), SetTransform({:?}) failed: {}", binding.id(), transform, err);
            DecoderError::Surface(err)
        })?;
        info!("surface({}), SetTransform({:?}) succ", binding.id(), transform);
        Ok(())
    }

    fn apply_scaling_mode(&self) -> Result<()> {
        let (Some(binding), Some(mode)) = (&self.surface, self.negotiator.scale_mode()) else {
            return Ok(());
        };
        for desc in self.output.iter() {
            let Some(native) = desc.native() else {
                continue;
            };
            binding
                .surface()
                .set_scaling_mode(native.seq_num(), mode)
                .map_err(|err| {
                    warn!(
                        "surface({}), SetScalingMode(seq={}, {:?}) failed: {}",
                        binding.id(),
                        native.seq_num(),
                        mode,
                        err
                    );
                    DecoderError::Surface(err)
                })?;
        }
        Ok(())
    }

    /// Allocates both pools and starts circulation.
    #[instrument(skip_all)]
    pub fn start(&mut self) -> Result<()> {
        if self.state != DecoderState::Configured {
            return Err(DecoderError::InvalidOperation(format!(
                "start in state {:?}",
                self.state
            )));
        }
        self.update_in_port_format()?;
        self.update_out_port_format()?;
        self.allocate_input_buffers()?;
        if let Err(err) = self.allocate_output_buffers() {
            self.clear_buffer_pool(Port::Input);
            return Err(err);
        }
        self.notify_output_format_changed();
        self.state = DecoderState::Running;
        self.submit_all_buffers_owned_by_us()
    }

    fn update_in_port_format(&mut self) -> Result<()> {
        let def = self.omx.port_definition(Port::Input)?;
        self.negotiator.on_input_port_changed(&def);
        info!(
            "input port: {}x{}, {} buffers of {} bytes",
            def.width, def.height, def.buffer_count, def.buffer_size
        );
        Ok(())
    }

    fn update_out_port_format(&mut self) -> Result<()> {
        let def = self.omx.port_definition(Port::Output)?;
        let vendor = self.omx.vendor_usage().map(BufferUsage::from_bits_retain);
        let usage = producer_usage(self.surface.is_some(), vendor);
        self.negotiator
            .on_output_port_changed(&def, self.omx.output_crop(), usage)?;
        info!(
            "output port: {}x{}, stride {}, slice height {}, {} buffers",
            def.width, def.height, def.stride, def.slice_height, def.buffer_count
        );
        Ok(())
    }

    fn allocate_input_buffers(&mut self) -> Result<()> {
        if !self.input.is_empty() {
            return Err(DecoderError::InvalidOperation(
                "input pool is not empty".into(),
            ));
        }
        let count = self.omx.port_definition(Port::Input)?.buffer_count;
        let mut staged = Vec::with_capacity(count as usize);
        for i in 0..count {
            match self.omx.use_buffer(Port::Input, None) {
                Ok(buffer) => staged.push(buffer),
                Err(err) => {
                    error!("use input buffer {} of {} failed: {}", i, count, err);
                    free_staged(self.omx.as_mut(), Port::Input, staged);
                    return Err(DecoderError::UseBuffer(err));
                }
            }
        }
        for buffer in staged {
            self.input
                .insert(BufferDescriptor::new(Port::Input, buffer, None))?;
        }
        info!("allocated {} input buffers", count);
        Ok(())
    }

    fn allocate_output_buffers(&mut self) -> Result<()> {
        if !self.output.is_empty() {
            return Err(DecoderError::InvalidOperation(
                "output pool is not empty".into(),
            ));
        }
        if self.surface.is_some() {
            self.allocate_output_buffers_from_surface()?;
            self.update_format_from_surface_buffer();
            if let Err(err) = self.apply_transform() {
                warn!("keep going without transform: {}", err);
            }
            if let Err(err) = self.apply_scaling_mode() {
                warn!("keep going without scaling mode: {}", err);
            }
            Ok(())
        } else {
            self.allocate_output_buffers_in_buffer_mode()
        }
    }

    fn allocate_output_buffers_in_buffer_mode(&mut self) -> Result<()> {
        let count = self.negotiator.out_buffer_count();
        let mut staged = Vec::with_capacity(count as usize);
        for i in 0..count {
            match self.omx.use_buffer(Port::Output, None) {
                Ok(buffer) => staged.push(buffer),
                Err(err) => {
                    error!("use output buffer {} of {} failed: {}", i, count, err);
                    free_staged(self.omx.as_mut(), Port::Output, staged);
                    return Err(DecoderError::UseBuffer(err));
                }
            }
        }
        for buffer in staged {
            self.output
                .insert(BufferDescriptor::new(Port::Output, buffer, None))?;
        }
        info!("allocated {} output buffers in buffer mode", count);
        Ok(())
    }

    /// Requests `count` buffers from the surface and registers each with the
    /// hardware. Either every buffer lands in the pool or none does: on
    /// failure staged hardware buffers are freed and every requested surface
    /// buffer is canceled.
    #[instrument(skip_all)]
    fn allocate_output_buffers_from_surface(&mut self) -> Result<()> {
        let Some(binding) = &self.surface else {
            return Err(DecoderError::InvalidOperation("no output surface".into()));
        };
        let surface = binding.surface().clone();
        let count = self.negotiator.out_buffer_count();

        if let Err(err) = surface.clean_cache() {
            warn!("surface({}), CleanCache failed: {}", surface.unique_id(), err);
        }
        set_min_queue_size(surface.as_ref(), count + 1)?;
        self.negotiator
            .combine_consumer_usage(BufferUsage::from_bits_retain(surface.default_usage()));
        let template = self.negotiator.request().clone();

        let mut staged: Vec<(RequestedBuffer<'_>, OmxBuffer)> = Vec::with_capacity(count as usize);
        for i in 0..count {
            let requested = match RequestedBuffer::request(surface.as_ref(), &template) {
                Ok(requested) => requested,
                Err(err) => {
                    error!(
                        "surface({}), RequestBuffer {} of {} failed: {}",
                        surface.unique_id(),
                        i,
                        count,
                        err
                    );
                    abort_staged(self.omx.as_mut(), staged);
                    return Err(DecoderError::SurfaceRequest(err));
                }
            };
            let result = self.omx.use_buffer(Port::Output, Some(requested.buffer()));
            match result {
                Ok(buffer) => staged.push((requested, buffer)),
                Err(err) => {
                    error!("use output buffer {} of {} failed: {}", i, count, err);
                    drop(requested);
                    abort_staged(self.omx.as_mut(), staged);
                    return Err(DecoderError::UseBuffer(err));
                }
            }
        }

        for (mut requested, buffer) in staged {
            let fence = requested.take_fence();
            let native = requested.commit();
            info!(
                "buffer id {}, seq {}, {}x{} stride {}",
                buffer.id,
                native.seq_num(),
                native.width(),
                native.height(),
                native.stride()
            );
            let mut desc = BufferDescriptor::new(Port::Output, buffer, Some(native));
            desc.set_fence(fence);
            self.output.insert(desc)?;
        }
        info!(
            "allocated {} output buffers from surface({})",
            count,
            surface.unique_id()
        );
        Ok(())
    }

    fn update_format_from_surface_buffer(&mut self) {
        let Some(native) = self.output.first().and_then(|desc| desc.native()).cloned() else {
            return;
        };
        let slice_height = match self.omx.port_definition(Port::Output) {
            Ok(def) => def.slice_height,
            Err(err) => {
                warn!("get output port definition failed: {}", err);
                0
            }
        };
        self.negotiator
            .update_from_surface_buffer(&native, slice_height);
    }

    fn notify_output_format_changed(&mut self) {
        if let Some(aspects) = self.omx.color_aspects() {
            self.negotiator.update_color_aspects(aspects);
        }
        let format = self.negotiator.output_format();
        match serde_json::to_string(format) {
            Ok(json) => info!("output format changed: {}", json),
            Err(err) => warn!("serialize output format failed: {}", err),
        }
        self.callback.on_output_format_changed(format);
    }

    /// Starts circulation once. Later calls are no-ops.
    pub(crate) fn submit_all_buffers_owned_by_us(&mut self) -> Result<()> {
        if self.circulating {
            info!("buffers are already circulating, no need to do again");
            return Ok(());
        }
        self.submit_output_buffers_to_omx()?;
        for id in self.input.ids_owned_by(BufferOwner::OwnedByUs) {
            self.notify_user_to_fill_input(id);
        }
        self.circulating = true;
        Ok(())
    }

    pub(crate) fn submit_output_buffers_to_omx(&mut self) -> Result<()> {
        for id in self.output.ids_owned_by(BufferOwner::OwnedByUs) {
            self.notify_omx_to_fill(id)?;
        }
        Ok(())
    }

    /// Waits on the buffer's release fence and hands it to the hardware.
    /// The owner only changes when the hardware accepted the buffer.
    pub(crate) fn notify_omx_to_fill(&mut self, id: BufferId) -> Result<()> {
        let Some(desc) = self.output.get_mut(id) else {
            return Err(DecoderError::InvalidValue(format!(
                "unknown output buffer id {id}"
            )));
        };
        if desc.owner() != BufferOwner::OwnedByUs {
            return Err(DecoderError::InvalidOperation(format!(
                "buffer id {} is owned by {}",
                id,
                desc.owner()
            )));
        }
        if let Err(err) = desc.take_fence().wait() {
            warn!("buffer id {} fence wait failed: {}", id, err);
        }
        let omx = desc.omx_mut();
        omx.filled_len = 0;
        omx.offset = 0;
        omx.flags = BufferFlags::empty();
        self.omx.fill_this_buffer(desc.omx()).map_err(|err| {
            error!("FillThisBuffer(id={}) failed: {}", id, err);
            DecoderError::Omx(err)
        })?;
        desc.set_owner(BufferOwner::OwnedByOmx);
        Ok(())
    }

    fn notify_user_to_fill_input(&mut self, id: BufferId) {
        if let Some(desc) = self.input.get_mut(id) {
            desc.set_owner(BufferOwner::OwnedByUser);
            self.callback.on_input_buffer_available(id);
        }
    }

    pub fn queue_input_buffer(
        &mut self,
        id: BufferId,
        pts: i64,
        filled_len: u32,
        flags: BufferFlags,
    ) -> Result<()> {
        if self.state != DecoderState::Running {
            return Err(DecoderError::InvalidOperation(format!(
                "queue input in state {:?}",
                self.state
            )));
        }
        let Some(desc) = self.input.get_mut(id) else {
            return Err(DecoderError::InvalidValue(format!(
                "unknown input buffer id {id}"
            )));
        };
        if desc.owner() != BufferOwner::OwnedByUser {
            return Err(DecoderError::InvalidValue(format!(
                "input buffer id {} is owned by {}",
                id,
                desc.owner()
            )));
        }
        if filled_len > desc.omx().alloc_len {
            return Err(DecoderError::InvalidValue(format!(
                "filled length {} exceeds buffer size {}",
                filled_len,
                desc.omx().alloc_len
            )));
        }
        let omx = desc.omx_mut();
        omx.pts = pts;
        omx.filled_len = filled_len;
        omx.offset = 0;
        omx.flags = flags;
        self.omx.empty_this_buffer(desc.omx())?;
        desc.set_owner(BufferOwner::OwnedByOmx);
        if flags.contains(BufferFlags::EOS) {
            info!("input eos, pts {}", pts);
            self.input_eos = true;
        }
        Ok(())
    }

    /// Flushes a decoded buffer to the surface. Only valid in surface mode.
    #[instrument(skip(self))]
    pub fn render_output_buffer(&mut self, id: BufferId, mode: RenderMode) -> Result<()> {
        if self.surface.is_none() {
            error!("can only render in surface mode");
            return Err(DecoderError::InvalidOperation(
                "render requires an output surface".into(),
            ));
        }
        if let Some(frame) = self.take_user_buffer(id)? {
            trace!("render buffer id {} pts {}", id, frame.pts);
        }
        self.notify_surface_to_render(id);
        if mode == RenderMode::FreeAfterRender {
            self.erase_buffer_from_pool(Port::Output, id);
        }
        Ok(())
    }

    /// Drops a decoded frame without displaying it and refills the buffer.
    pub fn release_output_buffer(&mut self, id: BufferId) -> Result<()> {
        let frame = self.take_user_buffer(id)?;
        if self.surface.is_some() {
            match frame {
                Some(frame) => debug!("discard buffer id {} pts {}", id, frame.pts),
                None => debug!("discard buffer id {}", id),
            }
        }
        self.notify_omx_to_fill(id)
    }

    fn take_user_buffer(&mut self, id: BufferId) -> Result<Option<OutputBuffer>> {
        let Some(desc) = self.output.get_mut(id) else {
            error!("unknown output buffer id {}", id);
            return Err(DecoderError::InvalidValue(format!(
                "unknown output buffer id {id}"
            )));
        };
        if desc.owner() != BufferOwner::OwnedByUser {
            error!("buffer id {} is owned by {}, not user", id, desc.owner());
            return Err(DecoderError::InvalidValue(format!(
                "buffer id {} is owned by {}",
                id,
                desc.owner()
            )));
        }
        let frame = desc.take_frame();
        desc.set_owner(BufferOwner::OwnedByUs);
        Ok(frame)
    }

    /// Flushes the buffer with the current crop as damage. A failed flush is
    /// logged and the buffer is treated as held by the surface anyway.
    fn notify_surface_to_render(&mut self, id: BufferId) {
        let (Some(binding), Some(desc)) = (&self.surface, self.output.get_mut(id)) else {
            return;
        };
        let config = FlushConfig {
            damage: self.negotiator.crop(),
            timestamp: desc.omx().pts,
        };
        if let Some(native) = desc.native() {
            match binding
                .surface()
                .flush_buffer(native, Fence::signaled(), &config)
            {
                Ok(()) => debug!(
                    "surface({}), FlushBuffer(seq={}, pts={})",
                    binding.id(),
                    native.seq_num(),
                    config.timestamp
                ),
                Err(err) => warn!(
                    "surface({}), FlushBuffer(seq={}) failed: {}",
                    binding.id(),
                    native.seq_num(),
                    err
                ),
            }
        }
        desc.mark_flushed();
        desc.set_owner(BufferOwner::OwnedBySurface);
    }

    /// Returns the buffer to the surface. The owner becomes the surface even
    /// when the cancel fails.
    fn cancel_buffer_to_surface(&mut self, id: BufferId) {
        let Some(desc) = self.output.get_mut(id) else {
            return;
        };
        if let (Some(binding), Some(native)) = (&self.surface, desc.native()) {
            match binding.surface().cancel_buffer(native) {
                Ok(()) => debug!(
                    "surface({}), CancelBuffer(seq={}) succ",
                    binding.id(),
                    native.seq_num()
                ),
                Err(err) => warn!(
                    "surface({}), CancelBuffer(seq={}) failed: {}",
                    binding.id(),
                    native.seq_num(),
                    err
                ),
            }
        }
        desc.set_owner(BufferOwner::OwnedBySurface);
    }

    /// Removes a buffer from its pool and frees it on the hardware. Buffers
    /// the hardware still owns are refused. Output buffers which are not with
    /// the surface are canceled back to it first.
    pub(crate) fn erase_buffer_from_pool(&mut self, port: Port, id: BufferId) -> bool {
        let Some(owner) = self.pool(port).get(id).map(BufferDescriptor::owner) else {
            return false;
        };
        if owner == BufferOwner::OwnedByOmx {
            warn!("{:?} buffer id {} is owned by omx, cannot erase", port, id);
            return false;
        }
        if port == Port::Output && owner != BufferOwner::OwnedBySurface {
            self.cancel_buffer_to_surface(id);
        }
        let Some(desc) = self.pool_mut(port).remove(id) else {
            return false;
        };
        if let Err(err) = self.omx.free_buffer(port, desc.omx()) {
            warn!("FreeBuffer({:?}, id={}) failed: {}", port, id, err);
        }
        debug!("{:?} buffer id {} erased", port, id);
        true
    }

    /// Erases every buffer the hardware does not hold. Returns how many
    /// buffers remain.
    pub(crate) fn clear_buffer_pool(&mut self, port: Port) -> usize {
        for id in self.pool(port).ids() {
            self.erase_buffer_from_pool(port, id);
        }
        if port == Port::Output {
            if let Some(binding) = &self.surface {
                if let Err(err) = binding.surface().clean_cache() {
                    warn!("surface({}), CleanCache failed: {}", binding.id(), err);
                }
            }
        }
        self.pool(port).len()
    }

    fn pool(&self, port: Port) -> &BufferPool {
        match port {
            Port::Input => &self.input,
            Port::Output => &self.output,
        }
    }

    fn pool_mut(&mut self, port: Port) -> &mut BufferPool {
        match port {
            Port::Input => &mut self.input,
            Port::Output => &mut self.output,
        }
    }

    fn protocol_violation(&mut self, what: std::fmt::Arguments<'_>) {
        self.protocol_violations += 1;
        error!("{}", what);
    }

    pub fn on_omx_event(&mut self, event: OmxEvent) {
        match event {
            OmxEvent::FillBufferDone {
                id,
                pts,
                filled_len,
                flags,
            } => self.on_fill_buffer_done(id, pts, filled_len, flags),
            OmxEvent::EmptyBufferDone { id } => self.on_empty_buffer_done(id),
            OmxEvent::PortSettingsChanged { port } => self.on_port_settings_changed(port),
        }
    }

    fn on_fill_buffer_done(&mut self, id: BufferId, pts: i64, filled_len: u32, flags: BufferFlags) {
        let Some(owner) = self.output.get(id).map(BufferDescriptor::owner) else {
            return self.protocol_violation(format_args!("fill done for unknown buffer id {id}"));
        };
        if owner != BufferOwner::OwnedByOmx {
            return self.protocol_violation(format_args!(
                "fill done for buffer id {id} owned by {owner}"
            ));
        }

        if self.reconfiguring || self.state == DecoderState::Released {
            if let Some(desc) = self.output.get_mut(id) {
                desc.set_owner(BufferOwner::OwnedByUs);
            }
            self.erase_buffer_from_pool(Port::Output, id);
            self.finish_reconfiguration();
            return;
        }

        let Some(desc) = self.output.get_mut(id) else {
            return;
        };
        let omx = desc.omx_mut();
        omx.pts = pts;
        omx.filled_len = filled_len;
        omx.flags = flags;
        let frame = OutputBuffer {
            id,
            pts,
            filled_len,
            flags,
            native: desc.native().cloned(),
        };
        desc.set_frame(frame.clone());
        desc.set_owner(BufferOwner::OwnedByUser);
        if frame.is_eos() {
            info!("output eos, pts {}", pts);
            self.output_eos = true;
        }
        self.callback.on_output_buffer_available(&frame);
    }

    fn on_empty_buffer_done(&mut self, id: BufferId) {
        let Some(owner) = self.input.get(id).map(BufferDescriptor::owner) else {
            return self.protocol_violation(format_args!("empty done for unknown buffer id {id}"));
        };
        if owner != BufferOwner::OwnedByOmx {
            return self.protocol_violation(format_args!(
                "empty done for buffer id {id} owned by {owner}"
            ));
        }
        if let Some(desc) = self.input.get_mut(id) {
            desc.set_owner(BufferOwner::OwnedByUs);
        }
        if self.state == DecoderState::Released {
            self.erase_buffer_from_pool(Port::Input, id);
        } else if !self.input_eos {
            self.notify_user_to_fill_input(id);
        }
    }

    /// Output port renegotiation. Buffers the hardware does not hold are
    /// erased at once; the rest are erased as they come back. Once the pool
    /// is empty it is reallocated with the new geometry.
    fn on_port_settings_changed(&mut self, port: Port) {
        if port == Port::Input {
            if let Err(err) = self.update_in_port_format() {
                warn!("update input port format failed: {}", err);
            }
            return;
        }
        info!("output port settings changed");
        if let Err(err) = self.update_out_port_format() {
            error!("update output port format failed: {}", err);
            self.callback.on_error(&err);
            return;
        }
        if self.state != DecoderState::Running {
            self.notify_output_format_changed();
            return;
        }
        self.reconfiguring = true;
        for id in self.output.ids() {
            self.erase_buffer_from_pool(Port::Output, id);
        }
        self.finish_reconfiguration();
    }

    fn finish_reconfiguration(&mut self) {
        if !self.reconfiguring || !self.output.is_empty() {
            return;
        }
        self.reconfiguring = false;
        info!("output pool drained, reallocating");
        let result = self
            .allocate_output_buffers()
            .and_then(|()| {
                self.notify_output_format_changed();
                self.submit_output_buffers_to_omx()
            });
        if let Err(err) = result {
            error!("output reallocation failed: {}", err);
            self.callback.on_error(&err);
        }
    }

    /// The bound surface released a buffer.
    pub fn on_buffer_released(&mut self, surface_id: SurfaceId) {
        match &self.surface {
            Some(binding) if binding.id() == surface_id => {
                self.get_one_buffer_from_surface();
            }
            _ => debug!("ignore buffer release from surface({})", surface_id),
        }
    }

    /// Requests one buffer from the bound surface and, if it is one of ours
    /// held by the surface, sends it back to the hardware. Anything else is
    /// canceled back to the surface.
    #[instrument(skip_all)]
    pub(crate) fn get_one_buffer_from_surface(&mut self) -> bool {
        if self.state != DecoderState::Running || self.reconfiguring {
            return false;
        }
        let Some(binding) = &self.surface else {
            return false;
        };
        let surface = binding.surface().clone();
        let template = self.negotiator.request().clone();
        let mut requested = match RequestedBuffer::request(surface.as_ref(), &template) {
            Ok(requested) => requested,
            Err(err) => {
                debug!("surface({}), RequestBuffer failed: {}", surface.unique_id(), err);
                return false;
            }
        };
        let handle = requested.buffer().handle();
        let Some(id) = self
            .output
            .find_by_native(handle, BufferOwner::OwnedBySurface)
        else {
            debug!(
                "surface({}) returned a buffer which is not ours, cancel it",
                surface.unique_id()
            );
            return false;
        };

        let fence = requested.take_fence();
        if let Some(desc) = self.output.get_mut(id) {
            desc.set_owner(BufferOwner::OwnedByUs);
            desc.set_fence(fence);
        }
        match self.notify_omx_to_fill(id) {
            Ok(()) => {
                requested.commit();
                true
            }
            Err(err) => {
                warn!("resubmit buffer id {} failed: {}", id, err);
                if let Some(desc) = self.output.get_mut(id) {
                    desc.set_owner(BufferOwner::OwnedBySurface);
                }
                false
            }
        }
    }

    /// Tears both pools down and releases the surface. Returns how many
    /// buffers the hardware still held.
    #[instrument(skip_all)]
    pub fn release(&mut self) -> usize {
        if self.state == DecoderState::Released {
            return self.input.len() + self.output.len();
        }
        self.reconfiguring = false;
        let stuck = self.clear_buffer_pool(Port::Input) + self.clear_buffer_pool(Port::Output);
        if stuck > 0 {
            warn!("{} buffers are still owned by omx", stuck);
        }
        if let Some(mut binding) = self.surface.take() {
            binding.release();
        }
        self.circulating = false;
        self.state = DecoderState::Released;
        info!("decoder released");
        stuck
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            state: self.state,
            surface: self.surface.as_ref().map(SurfaceBinding::id),
            input: self.input.iter().map(BufferSnapshot::new).collect(),
            output: self.output.iter().map(BufferSnapshot::new).collect(),
            input_counts: self.input.owner_counts(),
            output_counts: self.output.owner_counts(),
            circulating: self.circulating,
            reconfiguring: self.reconfiguring,
            input_eos: self.input_eos,
            output_eos: self.output_eos,
            protocol_violations: self.protocol_violations,
            output_format: self.negotiator.output_format().clone(),
        }
    }
}

fn free_staged(omx: &mut dyn OmxComponent, port: Port, staged: Vec<OmxBuffer>) {
    for buffer in staged {
        if let Err(err) = omx.free_buffer(port, &buffer) {
            warn!("FreeBuffer({:?}, id={}) failed: {}", port, buffer.id, err);
        }
    }
}

/// Frees the hardware side of every staged buffer, then cancels its surface
/// buffer by dropping the guard.
fn abort_staged(omx: &mut dyn OmxComponent, staged: Vec<(RequestedBuffer<'_>, OmxBuffer)>) {
    for (requested, buffer) in staged {
        if let Err(err) = omx.free_buffer(Port::Output, &buffer) {
            warn!("FreeBuffer(output, id={}) failed: {}", buffer.id, err);
        }
        drop(requested);
    }
}
