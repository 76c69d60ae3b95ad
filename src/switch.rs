// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Switching the output surface while the decoder is running.
//!
//! Every output buffer is detached from the old surface and attached to the
//! new one, so buffer ids and native handles survive the switch. Buffers the
//! old surface was holding come back to us and go straight to the hardware.
//! The old surface is then filled with blank frames so it stops showing the
//! last decoded picture.
//!
//! There is no rollback: if attaching fails part way, the buffers moved so
//! far stay on the new surface and the old one remains bound.

use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    decoder::Decoder,
    error::{DecoderError, Result},
    format::{BufferUsage, RequestTemplate, RGBA, STRIDE_ALIGNMENT},
    pool::BufferOwner,
    surface::{set_min_queue_size, FlushConfig, Surface, SurfaceBinding},
};

impl Decoder {
    #[instrument(skip_all)]
    pub(crate) fn switch_output_surface(&mut self, surface: Arc<dyn Surface>) -> Result<()> {
        let Some(current) = &self.surface else {
            error!("can only switch surface on surface mode");
            return Err(DecoderError::InvalidOperation(
                "surface switch requires surface mode".into(),
            ));
        };
        if surface.is_consumer() {
            error!("expect a producer surface but got a consumer surface");
            return Err(DecoderError::InvalidValue(
                "consumer surface cannot be a decoder output".into(),
            ));
        }
        let old = current.surface().clone();
        info!("surface({}) -> surface({})", old.unique_id(), surface.unique_id());
        if old.unique_id() == surface.unique_id() {
            info!("same surface, no need to set again");
            return Ok(());
        }

        self.register_release_listener(&surface)?;
        if let Err(err) = set_min_queue_size(surface.as_ref(), self.negotiator.out_buffer_count() + 1) {
            surface.unregister_release_listener();
            return Err(err.into());
        }

        for id in self.output.ids() {
            let Some(native) = self.output.get(id).and_then(|desc| desc.native()).cloned() else {
                continue;
            };
            if let Err(err) = old.detach_buffer_from_queue(&native) {
                debug!(
                    "surface({}), DetachBufferFromQueue(seq={}) failed: {}",
                    old.unique_id(),
                    native.seq_num(),
                    err
                );
            }
            if let Err(err) = surface.attach_buffer_to_queue(&native) {
                error!(
                    "surface({}), AttachBufferToQueue(seq={}) failed: {}",
                    surface.unique_id(),
                    native.seq_num(),
                    err
                );
                return Err(DecoderError::Surface(err));
            }
            let Some(desc) = self.output.get_mut(id) else {
                continue;
            };
            if desc.owner() == BufferOwner::OwnedBySurface {
                desc.set_owner(BufferOwner::OwnedByUs);
            }
            if desc.owner() == BufferOwner::OwnedByUs {
                if let Err(err) = self.notify_omx_to_fill(id) {
                    warn!("submit buffer id {} after switch failed: {}", id, err);
                }
            }
        }

        if let Err(err) = push_blank_buffers(old.as_ref()) {
            warn!("surface({}), push blank buffers failed: {}", old.unique_id(), err);
        }
        if let Some(mut binding) = self.surface.take() {
            binding.release();
        }
        self.surface = Some(SurfaceBinding::new(surface));
        if let Some(transform) = self.negotiator.transform() {
            if let Some(binding) = &self.surface {
                if let Err(err) = binding.surface().set_transform(transform) {
                    warn!("surface({}), SetTransform({:?}) failed: {}", binding.id(), transform, err);
                }
            }
        }
        info!("set surface({}) succ", self.surface.as_ref().map_or(0, SurfaceBinding::id));
        Ok(())
    }
}

/// Fills the whole queue of `surface` with 1x1 blank frames so that the
/// consumer drops the last decoded picture.
pub fn push_blank_buffers(surface: &dyn Surface) -> Result<()> {
    let template = RequestTemplate {
        width: 1,
        height: 1,
        stride_alignment: STRIDE_ALIGNMENT,
        format: RGBA,
        usage: BufferUsage::CPU_READ | BufferUsage::CPU_WRITE | BufferUsage::MEM_DMA,
        timeout_ms: 0,
    };
    let count = surface.queue_size();
    for i in 0..count {
        let (buffer, fence) = surface.request_buffer(&template).map_err(|err| {
            warn!("surface({}), RequestBuffer {} of {} failed: {}", surface.unique_id(), i, count, err);
            DecoderError::SurfaceRequest(err)
        })?;
        surface
            .flush_buffer(&buffer, fence, &FlushConfig::default())
            .map_err(|err| {
                warn!("surface({}), FlushBuffer {} of {} failed: {}", surface.unique_id(), i, count, err);
                DecoderError::Surface(err)
            })?;
    }
    info!("surface({}), pushed {} blank buffers", surface.unique_id(), count);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackSurface;

    #[test]
    fn test_push_blank_buffers_fills_queue() {
        let surface = LoopbackSurface::new("blank");
        surface.set_queue_size(3).unwrap();
        push_blank_buffers(&surface).unwrap();
        assert_eq!(surface.queued(), 3);
        assert_eq!(surface.outstanding(), 0);
        let frame = surface.consume().unwrap();
        assert_eq!((frame.width, frame.height), (1, 1));
    }

    #[test]
    fn test_push_blank_buffers_abandoned() {
        let surface = LoopbackSurface::new("gone");
        surface.set_queue_size(3).unwrap();
        surface.abandon();
        let err = push_blank_buffers(&surface).unwrap_err();
        assert!(matches!(err, DecoderError::SurfaceRequest(_)));
    }
}
