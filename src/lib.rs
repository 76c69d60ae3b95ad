// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! # EdgeFirst Decoder Library
//!
//! Output buffer ownership and circulation for hardware video decoders. The
//! library moves every decoded buffer between the decoder, the hardware
//! codec component, client code and the display surface, while keeping
//! buffer identities stable across reallocation and surface switches.
//!
//! ## Features
//!
//! - **Buffer Pools**: Per-port pools of buffer descriptors with a strict
//!   single-owner state machine.
//! - **Surface Mode**: Output buffers are allocated by a display surface,
//!   flushed for display and recycled through the surface release listener.
//! - **Buffer Mode**: Output buffers without a surface, returned by the
//!   client after use.
//! - **Surface Switch**: Move every output buffer to a new surface while
//!   decoding, then blank the old one.
//! - **Format Negotiation**: Port setup from user configuration, crop and
//!   stride refinement and output-format-changed notifications.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use edgefirst_decoder::{
//!     DecoderConfig, DecoderEvent, DecoderHandle, LoopbackComponent, LoopbackSurface,
//!     RenderMode, SurfaceStage,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let component = LoopbackComponent::new(1920, 1080, 8);
//! let surface = Arc::new(LoopbackSurface::new("display"));
//! let (tx, rx) = kanal::unbounded::<DecoderEvent>();
//!
//! let decoder = DecoderHandle::spawn(Box::new(component.clone()), Box::new(tx))?;
//! decoder.configure(&DecoderConfig {
//!     width: Some(1920),
//!     height: Some(1080),
//!     ..Default::default()
//! })?;
//! decoder.set_output_surface(surface.clone(), SurfaceStage::Configure)?;
//! decoder.start()?;
//!
//! component.complete_fill(0);
//! while let Ok(event) = rx.recv() {
//!     if let DecoderEvent::OutputBufferAvailable(buffer) = event {
//!         decoder.render_output_buffer(buffer.id, RenderMode::Keep)?;
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Threading
//!
//! All decoder state lives on one thread, see [`handle`]. Hardware callbacks
//! and surface release listeners may run on any thread; they only post
//! messages to that thread.

pub mod decoder;
pub mod error;
pub mod fence;
pub mod format;
pub mod handle;
pub mod loopback;
pub mod omx;
pub mod pool;
pub mod surface;
pub mod switch;

pub use decoder::{
    BufferSnapshot, DecoderCallback, DecoderState, PoolSnapshot, RenderMode, SurfaceStage,
};
pub use error::{DecoderError, ErrorKind, OmxError, Result, SurfaceError};
pub use format::{DecoderConfig, DecoderParameters, FourCC, OutputFormat};
pub use handle::{DecoderEvent, DecoderHandle};
pub use loopback::{LoopbackComponent, LoopbackSurface};
pub use omx::{BufferFlags, OmxComponent};
pub use pool::{BufferId, BufferOwner, OutputBuffer, Port};
pub use surface::{ScalingMode, Surface, Transform};
