// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Decoder thread and its client handle.
//!
//! The decoder runs on a dedicated thread which owns the [`Decoder`] and
//! drains a single inbox. Client calls, hardware callbacks and surface
//! release notifications are all messages on that inbox, so they are
//! processed strictly one at a time. Client calls carry a one-shot reply
//! channel and have blocking and async variants.

use std::{
    sync::Arc,
    thread::{self, JoinHandle},
};
use tracing::{debug, error, info, info_span};

use crate::{
    decoder::{Decoder, DecoderCallback, PoolSnapshot, RenderMode, SurfaceStage},
    error::{DecoderError, Result},
    format::{DecoderConfig, DecoderParameters, OutputFormat},
    omx::{BufferFlags, OmxCallbacks, OmxComponent, OmxEvent},
    pool::{BufferId, OutputBuffer},
    surface::{Surface, SurfaceId},
};

pub(crate) type Reply<T> = kanal::Sender<Result<T>>;

pub(crate) enum Msg {
    Configure(DecoderConfig, Reply<()>),
    SetOutputSurface(Arc<dyn Surface>, SurfaceStage, Reply<()>),
    SetParameters(DecoderParameters, Reply<()>),
    Start(Reply<()>),
    QueueInputBuffer {
        id: BufferId,
        pts: i64,
        filled_len: u32,
        flags: BufferFlags,
        reply: Reply<()>,
    },
    RenderOutputBuffer {
        id: BufferId,
        mode: RenderMode,
        reply: Reply<()>,
    },
    ReleaseOutputBuffer {
        id: BufferId,
        reply: Reply<()>,
    },
    Snapshot(Reply<PoolSnapshot>),
    Release(Reply<usize>),
    Omx(OmxEvent),
    BufferReleased {
        surface_id: SurfaceId,
    },
    Shutdown,
}

/// Notifications delivered through a channel, see the [`DecoderCallback`]
/// implementation for `kanal::Sender<DecoderEvent>`.
#[derive(Clone, Debug)]
pub enum DecoderEvent {
    InputBufferAvailable(BufferId),
    OutputBufferAvailable(OutputBuffer),
    OutputFormatChanged(OutputFormat),
    Error(String),
}

impl DecoderCallback for kanal::Sender<DecoderEvent> {
    fn on_input_buffer_available(&mut self, id: BufferId) {
        if self.send(DecoderEvent::InputBufferAvailable(id)).is_err() {
            debug!("event receiver is gone");
        }
    }

    fn on_output_buffer_available(&mut self, buffer: &OutputBuffer) {
        if self
            .send(DecoderEvent::OutputBufferAvailable(buffer.clone()))
            .is_err()
        {
            debug!("event receiver is gone");
        }
    }

    fn on_output_format_changed(&mut self, format: &OutputFormat) {
        if self
            .send(DecoderEvent::OutputFormatChanged(format.clone()))
            .is_err()
        {
            debug!("event receiver is gone");
        }
    }

    fn on_error(&mut self, err: &DecoderError) {
        if self.send(DecoderEvent::Error(err.to_string())).is_err() {
            debug!("event receiver is gone");
        }
    }
}

/// Client side of a running decoder. Dropping the handle stops the decoder
/// thread and releases every buffer it still holds.
pub struct DecoderHandle {
    inbox: kanal::Sender<Msg>,
    thread: Option<JoinHandle<()>>,
}

impl DecoderHandle {
    /// Spawns the decoder thread for `component`. Notifications go to
    /// `callback` on that thread.
    pub fn spawn(
        mut component: Box<dyn OmxComponent>,
        callback: Box<dyn DecoderCallback>,
    ) -> Result<Self> {
        let (tx, rx) = kanal::unbounded();
        component.set_callbacks(OmxCallbacks::new(tx.clone()));
        let decoder = Decoder::new(component, callback, tx.clone());
        let thread = thread::Builder::new()
            .name("decoder".to_string())
            .spawn(move || run(decoder, rx))?;
        Ok(Self {
            inbox: tx,
            thread: Some(thread),
        })
    }

    fn call<T: Send + 'static>(&self, msg: impl FnOnce(Reply<T>) -> Msg) -> Result<T> {
        let (tx, rx) = kanal::bounded(1);
        self.inbox
            .send(msg(tx))
            .map_err(|_| DecoderError::Disconnected)?;
        rx.recv().map_err(|_| DecoderError::Disconnected)?
    }

    async fn call_async<T: Send + 'static>(
        &self,
        msg: impl FnOnce(Reply<T>) -> Msg,
    ) -> Result<T> {
        let (tx, rx) = kanal::bounded(1);
        // the inbox is unbounded, so this send never blocks
        self.inbox
            .send(msg(tx))
            .map_err(|_| DecoderError::Disconnected)?;
        rx.as_async()
            .recv()
            .await
            .map_err(|_| DecoderError::Disconnected)?
    }

    pub fn configure(&self, config: &DecoderConfig) -> Result<()> {
        let config = config.clone();
        self.call(|reply| Msg::Configure(config, reply))
    }

    pub fn set_output_surface(&self, surface: Arc<dyn Surface>, stage: SurfaceStage) -> Result<()> {
        self.call(|reply| Msg::SetOutputSurface(surface, stage, reply))
    }

    pub async fn set_output_surface_async(
        &self,
        surface: Arc<dyn Surface>,
        stage: SurfaceStage,
    ) -> Result<()> {
        self.call_async(|reply| Msg::SetOutputSurface(surface, stage, reply))
            .await
    }

    pub fn set_parameters(&self, params: &DecoderParameters) -> Result<()> {
        let params = params.clone();
        self.call(|reply| Msg::SetParameters(params, reply))
    }

    pub fn start(&self) -> Result<()> {
        self.call(Msg::Start)
    }

    pub fn queue_input_buffer(
        &self,
        id: BufferId,
        pts: i64,
        filled_len: u32,
        flags: BufferFlags,
    ) -> Result<()> {
        self.call(|reply| Msg::QueueInputBuffer {
            id,
            pts,
            filled_len,
            flags,
            reply,
        })
    }

    pub async fn queue_input_buffer_async(
        &self,
        id: BufferId,
        pts: i64,
        filled_len: u32,
        flags: BufferFlags,
    ) -> Result<()> {
        self.call_async(|reply| Msg::QueueInputBuffer {
            id,
            pts,
            filled_len,
            flags,
            reply,
        })
        .await
    }

    pub fn render_output_buffer(&self, id: BufferId, mode: RenderMode) -> Result<()> {
        self.call(|reply| Msg::RenderOutputBuffer { id, mode, reply })
    }

    pub async fn render_output_buffer_async(&self, id: BufferId, mode: RenderMode) -> Result<()> {
        self.call_async(|reply| Msg::RenderOutputBuffer { id, mode, reply })
            .await
    }

    pub fn release_output_buffer(&self, id: BufferId) -> Result<()> {
        self.call(|reply| Msg::ReleaseOutputBuffer { id, reply })
    }

    pub async fn release_output_buffer_async(&self, id: BufferId) -> Result<()> {
        self.call_async(|reply| Msg::ReleaseOutputBuffer { id, reply })
            .await
    }

    pub fn snapshot(&self) -> Result<PoolSnapshot> {
        self.call(Msg::Snapshot)
    }

    pub async fn snapshot_async(&self) -> Result<PoolSnapshot> {
        self.call_async(Msg::Snapshot).await
    }

    /// Tears the pools down and releases the surface. Returns how many
    /// buffers the hardware still held.
    pub fn release(&self) -> Result<usize> {
        self.call(Msg::Release)
    }
}

impl Drop for DecoderHandle {
    fn drop(&mut self) {
        if self.inbox.send(Msg::Shutdown).is_err() {
            debug!("decoder thread already stopped");
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("decoder thread panicked");
            }
        }
    }
}

fn respond<T>(reply: Reply<T>, result: Result<T>) {
    if reply.send(result).is_err() {
        debug!("caller went away before the reply");
    }
}

fn run(mut decoder: Decoder, inbox: kanal::Receiver<Msg>) {
    let _span = info_span!("decoder").entered();
    info!("decoder thread started");
    while let Ok(msg) = inbox.recv() {
        match msg {
            Msg::Configure(config, reply) => respond(reply, decoder.configure(&config)),
            Msg::SetOutputSurface(surface, stage, reply) => {
                respond(reply, decoder.set_output_surface(surface, stage))
            }
            Msg::SetParameters(params, reply) => respond(reply, decoder.set_parameters(&params)),
            Msg::Start(reply) => respond(reply, decoder.start()),
            Msg::QueueInputBuffer {
                id,
                pts,
                filled_len,
                flags,
                reply,
            } => respond(reply, decoder.queue_input_buffer(id, pts, filled_len, flags)),
            Msg::RenderOutputBuffer { id, mode, reply } => {
                respond(reply, decoder.render_output_buffer(id, mode))
            }
            Msg::ReleaseOutputBuffer { id, reply } => {
                respond(reply, decoder.release_output_buffer(id))
            }
            Msg::Snapshot(reply) => respond(reply, Ok(decoder.snapshot())),
            Msg::Release(reply) => respond(reply, Ok(decoder.release())),
            Msg::Omx(event) => decoder.on_omx_event(event),
            Msg::BufferReleased { surface_id } => decoder.on_buffer_released(surface_id),
            Msg::Shutdown => break,
        }
    }
    let stuck = decoder.release();
    info!(
        "decoder thread exited in state {:?}, {} buffers left with omx",
        decoder.state(),
        stuck
    );
}
