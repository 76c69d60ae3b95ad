// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Hardware codec component interface.
//!
//! The component exposes OpenMAX style port definitions and buffer
//! primitives. Its fill/empty-done callbacks arrive on driver threads, so
//! [`OmxCallbacks`] only posts them to the decoder's inbox.

use bitflags::bitflags;
use serde::Serialize;
use tracing::info;

use crate::{
    error::OmxError,
    format::PortInfo,
    handle::Msg,
    pool::{BufferId, Port},
    surface::NativeBuffer,
};

bitflags! {
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
    pub struct BufferFlags: u32 {
        const EOS = 1 << 0;
        const SYNC_FRAME = 1 << 5;
        const CODEC_CONFIG = 1 << 7;
    }
}

/// Hardware side buffer descriptor.
#[derive(Clone, Debug, PartialEq)]
pub struct OmxBuffer {
    pub id: BufferId,
    pub alloc_len: u32,
    pub filled_len: u32,
    pub offset: u32,
    pub pts: i64,
    pub flags: BufferFlags,
}

impl OmxBuffer {
    pub fn new(id: BufferId, alloc_len: u32) -> Self {
        Self {
            id,
            alloc_len,
            filled_len: 0,
            offset: 0,
            pts: 0,
            flags: BufferFlags::empty(),
        }
    }
}

/// Port definition as reported by the hardware.
#[derive(Clone, Debug, PartialEq)]
pub struct PortDefinition {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub slice_height: u32,
    /// Graphic pixel format code, see [`crate::format::FourCC::graphic_format`].
    pub color_format: u32,
    pub buffer_count: u32,
    pub buffer_size: u32,
}

/// Output crop as reported by the hardware. Unvalidated.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct OmxCrop {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ColorAspects {
    pub full_range: bool,
    pub primaries: u8,
    pub transfer: u8,
    pub matrix: u8,
}

/// Asynchronous notifications from the hardware.
#[derive(Clone, Debug, PartialEq)]
pub enum OmxEvent {
    FillBufferDone {
        id: BufferId,
        pts: i64,
        filled_len: u32,
        flags: BufferFlags,
    },
    EmptyBufferDone {
        id: BufferId,
    },
    PortSettingsChanged {
        port: Port,
    },
}

/// Hardware codec component. All calls are made from the decoder thread.
pub trait OmxComponent: Send {
    /// Hands the component the sink for its asynchronous callbacks.
    fn set_callbacks(&mut self, callbacks: OmxCallbacks);

    fn set_video_port(&mut self, port: Port, info: &PortInfo) -> Result<(), OmxError>;

    fn port_definition(&self, port: Port) -> Result<PortDefinition, OmxError>;

    fn output_crop(&self) -> Option<OmxCrop>;

    fn color_aspects(&self) -> Option<ColorAspects>;

    /// Usage bits the vendor needs on output buffers.
    fn vendor_usage(&self) -> Option<u64>;

    /// Registers a buffer with the component. Output buffers in surface mode
    /// carry their native buffer; the component assigns the buffer id.
    fn use_buffer(
        &mut self,
        port: Port,
        native: Option<&NativeBuffer>,
    ) -> Result<OmxBuffer, OmxError>;

    fn fill_this_buffer(&mut self, buffer: &OmxBuffer) -> Result<(), OmxError>;

    fn empty_this_buffer(&mut self, buffer: &OmxBuffer) -> Result<(), OmxError>;

    fn free_buffer(&mut self, port: Port, buffer: &OmxBuffer) -> Result<(), OmxError>;
}

/// Callback sink handed to the hardware component. Cloneable and usable from
/// any thread; each call posts one message to the decoder inbox.
#[derive(Clone)]
pub struct OmxCallbacks {
    inbox: kanal::Sender<Msg>,
}

impl OmxCallbacks {
    pub(crate) fn new(inbox: kanal::Sender<Msg>) -> Self {
        Self { inbox }
    }

    /// Returns `false` once the decoder is gone.
    pub fn post(&self, event: OmxEvent) -> bool {
        if self.inbox.send(Msg::Omx(event)).is_err() {
            info!("decoder is gone");
            return false;
        }
        true
    }

    pub fn fill_buffer_done(&self, id: BufferId, pts: i64, filled_len: u32, flags: BufferFlags) -> bool {
        self.post(OmxEvent::FillBufferDone {
            id,
            pts,
            filled_len,
            flags,
        })
    }

    pub fn empty_buffer_done(&self, id: BufferId) -> bool {
        self.post(OmxEvent::EmptyBufferDone { id })
    }

    pub fn port_settings_changed(&self, port: Port) -> bool {
        self.post(OmxEvent::PortSettingsChanged { port })
    }
}
