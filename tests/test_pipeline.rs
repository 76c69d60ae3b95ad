// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use edgefirst_decoder::{
    format::{BufferUsage, CropRect, NV12},
    omx::{OmxCrop, OmxEvent},
    BufferFlags, BufferId, BufferOwner, DecoderConfig, DecoderError, DecoderEvent, DecoderHandle,
    DecoderParameters, DecoderState, ErrorKind, LoopbackComponent, LoopbackSurface, OutputBuffer,
    OutputFormat, Port, RenderMode, ScalingMode, Surface, SurfaceStage, Transform,
};
use serial_test::serial;
use std::{
    error::Error,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

const TIMEOUT: Duration = Duration::from_secs(2);

struct Pipeline {
    decoder: DecoderHandle,
    component: LoopbackComponent,
    surface: Arc<LoopbackSurface>,
    events: kanal::Receiver<DecoderEvent>,
}

impl Pipeline {
    fn new(component: LoopbackComponent) -> Result<Self, Box<dyn Error>> {
        let (tx, rx) = kanal::unbounded();
        let decoder = DecoderHandle::spawn(Box::new(component.clone()), Box::new(tx))?;
        Ok(Self {
            decoder,
            component,
            surface: Arc::new(LoopbackSurface::new("display")),
            events: rx,
        })
    }

    /// Configured, bound to `self.surface` and started.
    fn running(component: LoopbackComponent, config: &DecoderConfig) -> Result<Self, Box<dyn Error>> {
        let pipeline = Self::new(component)?;
        pipeline.decoder.configure(config)?;
        pipeline
            .decoder
            .set_output_surface(pipeline.surface.clone(), SurfaceStage::Configure)?;
        pipeline.decoder.start()?;
        Ok(pipeline)
    }

    fn next_output(&self) -> OutputBuffer {
        loop {
            match self.events.recv_timeout(TIMEOUT).unwrap() {
                DecoderEvent::OutputBufferAvailable(buffer) => return buffer,
                DecoderEvent::Error(err) => panic!("decoder error: {err}"),
                _ => continue,
            }
        }
    }

    fn next_format(&self) -> OutputFormat {
        loop {
            match self.events.recv_timeout(TIMEOUT).unwrap() {
                DecoderEvent::OutputFormatChanged(format) => return format,
                DecoderEvent::Error(err) => panic!("decoder error: {err}"),
                _ => continue,
            }
        }
    }

    /// Completes one fill and waits for the buffer to reach the client.
    fn decode_one(&self, pts: i64) -> OutputBuffer {
        let id = self.component.complete_fill(pts).unwrap();
        let buffer = self.next_output();
        assert_eq!(buffer.id, id);
        buffer
    }
}

/// Polls `cond` until it holds or [`TIMEOUT`] passes.
fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

fn config(width: i32, height: i32) -> DecoderConfig {
    DecoderConfig {
        width: Some(width),
        height: Some(height),
        pixel_format: Some(NV12),
        ..Default::default()
    }
}

#[test]
#[serial]
fn test_configure_defaults_frame_rate() -> Result<(), Box<dyn Error>> {
    let pipeline = Pipeline::new(LoopbackComponent::new(1920, 1080, 8))?;
    pipeline.decoder.configure(&config(1920, 1080))?;

    let output = pipeline.component.port_info(Port::Output).unwrap();
    assert_eq!(output.frame_rate, 30.0);
    assert_eq!(output.format, Some(NV12));
    assert_eq!(pipeline.component.port_info(Port::Input).unwrap().frame_rate, 30.0);
    assert_eq!(pipeline.decoder.snapshot()?.state, DecoderState::Configured);
    Ok(())
}

#[test]
#[serial]
fn test_configure_rejects_missing_geometry() -> Result<(), Box<dyn Error>> {
    let pipeline = Pipeline::new(LoopbackComponent::new(1920, 1080, 8))?;
    let err = pipeline
        .decoder
        .configure(&DecoderConfig {
            height: Some(1080),
            ..Default::default()
        })
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);

    // nothing reached the hardware
    assert!(pipeline.component.port_info(Port::Output).is_none());
    let snapshot = pipeline.decoder.snapshot()?;
    assert_eq!(snapshot.state, DecoderState::Uninitialized);
    assert!(snapshot.output.is_empty());

    // a start without configuration is refused
    let err = pipeline.decoder.start().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidOperation);
    Ok(())
}

#[test]
#[serial]
fn test_configure_rejected_by_hardware() -> Result<(), Box<dyn Error>> {
    let component = LoopbackComponent::new(1920, 1080, 8);
    component.reject_port_settings(true);
    let pipeline = Pipeline::new(component)?;
    let err = pipeline.decoder.configure(&config(1920, 1080)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    Ok(())
}

#[test]
#[serial]
fn test_consumer_surface_rejected() -> Result<(), Box<dyn Error>> {
    let pipeline = Pipeline::new(LoopbackComponent::new(640, 480, 4))?;
    pipeline.decoder.configure(&config(640, 480))?;
    let consumer = Arc::new(LoopbackSurface::consumer("consumer"));
    let err = pipeline
        .decoder
        .set_output_surface(consumer.clone(), SurfaceStage::Configure)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidValue);
    assert!(!consumer.has_release_listener());
    Ok(())
}

#[test]
#[serial]
fn test_start_allocates_from_surface() -> Result<(), Box<dyn Error>> {
    let pipeline = Pipeline::running(LoopbackComponent::new(1920, 1080, 8), &config(1920, 1080))?;
    let snapshot = pipeline.decoder.snapshot()?;

    assert_eq!(snapshot.state, DecoderState::Running);
    assert!(snapshot.circulating);
    assert_eq!(snapshot.output.len(), 8);
    assert_eq!(snapshot.output_counts.omx, 8);
    assert_eq!(snapshot.input_counts.user, 4);
    assert_eq!(snapshot.surface, Some(pipeline.surface.unique_id()));

    assert_eq!(pipeline.surface.outstanding(), 8);
    assert!(pipeline.surface.queue_size() >= 9);
    assert!(pipeline.surface.has_release_listener());

    let mut handles: Vec<_> = snapshot.output.iter().filter_map(|buf| buf.native).collect();
    handles.sort_by_key(|handle| handle.0);
    handles.dedup();
    assert_eq!(handles.len(), 8);

    let format = pipeline.next_format();
    assert_eq!((format.display_width, format.display_height), (1920, 1080));
    assert_eq!(format.stride, Some(1920));
    assert_eq!(format.frame_rate, 30.0);
    Ok(())
}

#[test]
#[serial]
fn test_allocation_request_failure_rolls_back() -> Result<(), Box<dyn Error>> {
    let pipeline = Pipeline::new(LoopbackComponent::new(1920, 1080, 8))?;
    pipeline.decoder.configure(&config(1920, 1080))?;
    pipeline
        .decoder
        .set_output_surface(pipeline.surface.clone(), SurfaceStage::Configure)?;
    pipeline.surface.fail_nth_request(3);

    let err = pipeline.decoder.start().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Resource);
    assert!(matches!(err, DecoderError::SurfaceRequest(_)));

    assert_eq!(pipeline.surface.outstanding(), 0);
    assert_eq!(pipeline.surface.stats().canceled, 2);
    assert_eq!(pipeline.component.registered(Port::Output), 0);
    assert_eq!(pipeline.component.registered(Port::Input), 0);

    let snapshot = pipeline.decoder.snapshot()?;
    assert!(snapshot.output.is_empty());
    assert!(snapshot.input.is_empty());
    assert_eq!(snapshot.state, DecoderState::Configured);
    Ok(())
}

#[test]
#[serial]
fn test_allocation_use_buffer_failure_rolls_back() -> Result<(), Box<dyn Error>> {
    let pipeline = Pipeline::new(LoopbackComponent::new(1920, 1080, 8))?;
    pipeline.decoder.configure(&config(1920, 1080))?;
    pipeline
        .decoder
        .set_output_surface(pipeline.surface.clone(), SurfaceStage::Configure)?;
    // four input buffers come first, then the fifth output buffer fails
    pipeline.component.fail_nth_use_buffer(4 + 5);

    let err = pipeline.decoder.start().unwrap_err();
    assert!(matches!(err, DecoderError::UseBuffer(_)));
    assert_eq!(pipeline.surface.outstanding(), 0);
    assert_eq!(pipeline.surface.stats().canceled, 5);
    assert_eq!(pipeline.component.registered(Port::Output), 0);
    assert!(pipeline.decoder.snapshot()?.output.is_empty());
    Ok(())
}

#[test]
#[serial]
fn test_full_cycle_keeps_identity() -> Result<(), Box<dyn Error>> {
    let component = LoopbackComponent::new(1920, 1088, 8).with_crop(OmxCrop {
        left: 0,
        top: 0,
        width: 1920,
        height: 1080,
    });
    let pipeline = Pipeline::running(component, &config(1920, 1088))?;
    let format = pipeline.next_format();
    assert_eq!((format.crop_right, format.crop_bottom), (1919, 1079));

    let buffer = pipeline.decode_one(1000);
    let handle = buffer.native.as_ref().unwrap().handle();
    assert_eq!(buffer.native.as_ref().unwrap().height(), 1080);
    let snapshot = pipeline.decoder.snapshot()?;
    assert_eq!(snapshot.output_buffer(buffer.id).unwrap().owner, BufferOwner::OwnedByUser);

    pipeline
        .decoder
        .render_output_buffer(buffer.id, RenderMode::Keep)?;
    let snapshot = pipeline.decoder.snapshot()?;
    let rendered = snapshot.output_buffer(buffer.id).unwrap();
    assert_eq!(rendered.owner, BufferOwner::OwnedBySurface);
    assert!(rendered.flushed);
    assert_eq!(pipeline.surface.queued(), 1);

    let frame = pipeline.surface.consume().unwrap();
    assert_eq!(frame.handle, handle);
    assert_eq!(frame.damage, CropRect::full(1920, 1080));
    assert_eq!(frame.timestamp, 1000);

    let snapshot = pipeline.decoder.snapshot()?;
    let back = snapshot.output_buffer(buffer.id).unwrap();
    assert_eq!(back.owner, BufferOwner::OwnedByOmx);
    assert_eq!(back.native, Some(handle));
    assert_eq!(pipeline.component.fill_submissions(buffer.id), 2);
    assert_eq!(snapshot.output_counts.total(), 8);
    Ok(())
}

#[test]
#[serial]
fn test_render_wrong_owner() -> Result<(), Box<dyn Error>> {
    let pipeline = Pipeline::running(LoopbackComponent::new(640, 480, 4), &config(640, 480))?;
    let snapshot = pipeline.decoder.snapshot()?;
    let omx_owned = snapshot.output[0].id;

    let err = pipeline
        .decoder
        .render_output_buffer(omx_owned, RenderMode::Keep)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidValue);
    let err = pipeline
        .decoder
        .render_output_buffer(BufferId(4242), RenderMode::Keep)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidValue);
    assert_eq!(pipeline.decoder.snapshot()?.output_counts.omx, 4);
    Ok(())
}

#[test]
#[serial]
fn test_render_flush_failure_still_advances() -> Result<(), Box<dyn Error>> {
    let pipeline = Pipeline::running(LoopbackComponent::new(640, 480, 4), &config(640, 480))?;
    let buffer = pipeline.decode_one(0);

    pipeline.surface.abandon();
    pipeline
        .decoder
        .render_output_buffer(buffer.id, RenderMode::Keep)?;

    let snapshot = pipeline.decoder.snapshot()?;
    assert_eq!(
        snapshot.output_buffer(buffer.id).unwrap().owner,
        BufferOwner::OwnedBySurface
    );
    assert_eq!(pipeline.surface.stats().flushed, 0);
    Ok(())
}

#[test]
#[serial]
fn test_render_free_after_render() -> Result<(), Box<dyn Error>> {
    let pipeline = Pipeline::running(LoopbackComponent::new(640, 480, 4), &config(640, 480))?;
    let buffer = pipeline.decode_one(0);

    pipeline
        .decoder
        .render_output_buffer(buffer.id, RenderMode::FreeAfterRender)?;
    let snapshot = pipeline.decoder.snapshot()?;
    assert_eq!(snapshot.output.len(), 3);
    assert!(snapshot.output_buffer(buffer.id).is_none());
    assert_eq!(pipeline.component.registered(Port::Output), 3);
    assert_eq!(pipeline.surface.queued(), 1);

    // the freed buffer comes back from the surface but is no longer ours
    assert!(pipeline.surface.consume().is_some());
    let snapshot = pipeline.decoder.snapshot()?;
    assert_eq!(snapshot.output.len(), 3);
    assert_eq!(snapshot.output_counts.omx, 3);
    assert!(pipeline.surface.stats().canceled >= 1);
    Ok(())
}

#[test]
#[serial]
fn test_release_output_buffer_refills() -> Result<(), Box<dyn Error>> {
    let pipeline = Pipeline::running(LoopbackComponent::new(640, 480, 4), &config(640, 480))?;
    let buffer = pipeline.decode_one(0);

    pipeline.decoder.release_output_buffer(buffer.id)?;
    let snapshot = pipeline.decoder.snapshot()?;
    assert_eq!(
        snapshot.output_buffer(buffer.id).unwrap().owner,
        BufferOwner::OwnedByOmx
    );
    assert_eq!(pipeline.surface.queued(), 0);
    assert_eq!(pipeline.component.fill_submissions(buffer.id), 2);
    Ok(())
}

#[test]
#[serial]
fn test_buffer_mode() -> Result<(), Box<dyn Error>> {
    let pipeline = Pipeline::new(LoopbackComponent::new(640, 480, 4))?;
    pipeline.decoder.configure(&config(640, 480))?;
    pipeline.decoder.start()?;

    let snapshot = pipeline.decoder.snapshot()?;
    assert_eq!(snapshot.output.len(), 4);
    assert!(snapshot.output.iter().all(|buf| buf.native.is_none()));
    assert_eq!(snapshot.surface, None);

    let buffer = pipeline.decode_one(0);
    assert!(buffer.native.is_none());
    assert_eq!(buffer.filled_len, 640 * 480 * 3 / 2);

    let err = pipeline
        .decoder
        .render_output_buffer(buffer.id, RenderMode::Keep)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidOperation);

    let err = pipeline
        .decoder
        .set_output_surface(pipeline.surface.clone(), SurfaceStage::Running)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidOperation);

    pipeline.decoder.release_output_buffer(buffer.id)?;
    assert_eq!(pipeline.decoder.snapshot()?.output_counts.omx, 4);
    Ok(())
}

#[test]
#[serial]
fn test_protocol_violations_are_dropped() -> Result<(), Box<dyn Error>> {
    let pipeline = Pipeline::running(LoopbackComponent::new(640, 480, 4), &config(640, 480))?;
    let before = pipeline.decoder.snapshot()?;
    let user_input = before.input[0].id;

    pipeline.component.post_raw(OmxEvent::FillBufferDone {
        id: BufferId(999),
        pts: 0,
        filled_len: 0,
        flags: BufferFlags::empty(),
    });
    pipeline
        .component
        .post_raw(OmxEvent::EmptyBufferDone { id: user_input });

    let after = pipeline.decoder.snapshot()?;
    assert_eq!(after.protocol_violations, 2);
    assert_eq!(after.output_counts, before.output_counts);
    assert_eq!(after.input_counts, before.input_counts);
    Ok(())
}

#[test]
#[serial]
fn test_input_eos_stops_offering() -> Result<(), Box<dyn Error>> {
    let pipeline = Pipeline::running(LoopbackComponent::new(640, 480, 4), &config(640, 480))?;
    let inputs: Vec<BufferId> = pipeline.decoder.snapshot()?.input.iter().map(|buf| buf.id).collect();

    pipeline
        .decoder
        .queue_input_buffer(inputs[0], 0, 128, BufferFlags::SYNC_FRAME)?;
    pipeline
        .decoder
        .queue_input_buffer(inputs[1], 33_333, 128, BufferFlags::EOS)?;
    assert_eq!(pipeline.component.pending_empties(), 2);

    pipeline.component.complete_empty();
    pipeline.component.complete_empty();
    let snapshot = pipeline.decoder.snapshot()?;
    assert!(snapshot.input_eos);
    assert_eq!(snapshot.input_counts.us, 2);
    assert_eq!(snapshot.input_counts.user, 2);

    let err = pipeline
        .decoder
        .queue_input_buffer(inputs[2], 0, u32::MAX, BufferFlags::empty())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidValue);
    Ok(())
}

#[test]
#[serial]
fn test_switch_same_surface_is_noop() -> Result<(), Box<dyn Error>> {
    let pipeline = Pipeline::running(LoopbackComponent::new(640, 480, 4), &config(640, 480))?;
    let buffer = pipeline.decode_one(0);
    pipeline
        .decoder
        .render_output_buffer(buffer.id, RenderMode::Keep)?;
    let before = pipeline.decoder.snapshot()?;

    pipeline
        .decoder
        .set_output_surface(pipeline.surface.clone(), SurfaceStage::Running)?;

    let after = pipeline.decoder.snapshot()?;
    assert_eq!(after.output_counts, before.output_counts);
    assert_eq!(after.surface, before.surface);
    let stats = pipeline.surface.stats();
    assert_eq!((stats.attached, stats.detached), (0, 0));
    assert_eq!(pipeline.surface.queued(), 1);
    Ok(())
}

#[test]
#[serial]
fn test_switch_moves_every_buffer() -> Result<(), Box<dyn Error>> {
    let pipeline = Pipeline::running(LoopbackComponent::new(640, 480, 8), &config(640, 480))?;
    let held = pipeline.decode_one(0);
    let shown = pipeline.decode_one(1);
    pipeline
        .decoder
        .render_output_buffer(shown.id, RenderMode::Keep)?;

    let old = pipeline.surface.clone();
    let new = Arc::new(LoopbackSurface::new("second"));
    pipeline
        .decoder
        .set_output_surface(new.clone(), SurfaceStage::Running)?;

    let snapshot = pipeline.decoder.snapshot()?;
    assert_eq!(snapshot.surface, Some(new.unique_id()));
    assert_eq!(snapshot.output.len(), 8);
    assert_eq!(snapshot.output_counts.surface, 0);
    assert_eq!(snapshot.output_counts.user, 1);
    assert_eq!(snapshot.output_counts.omx, 7);
    for buf in &snapshot.output {
        let handle = buf.native.unwrap();
        assert!(new.contains(handle));
        assert!(!old.contains(handle));
    }
    assert_eq!(pipeline.component.fill_submissions(shown.id), 2);

    // the old surface is left showing blank frames and is no longer bound
    assert_eq!(old.queued(), old.queue_size() as usize);
    assert_eq!(old.consume().map(|frame| (frame.width, frame.height)), Some((1, 1)));
    assert!(!old.has_release_listener());
    assert!(new.has_release_listener());
    assert!(new.queue_size() >= 9);

    // buffers held by the client render to the new surface
    pipeline
        .decoder
        .render_output_buffer(held.id, RenderMode::Keep)?;
    assert_eq!(new.queued(), 1);
    assert!(new.consume().is_some());
    let snapshot = pipeline.decoder.snapshot()?;
    assert_eq!(snapshot.output_buffer(held.id).unwrap().owner, BufferOwner::OwnedByOmx);
    Ok(())
}

#[test]
#[serial]
fn test_switch_attach_failure_has_no_rollback() -> Result<(), Box<dyn Error>> {
    let pipeline = Pipeline::running(LoopbackComponent::new(640, 480, 8), &config(640, 480))?;
    let new = Arc::new(LoopbackSurface::new("flaky"));
    new.fail_attach_after(3);

    let err = pipeline
        .decoder
        .set_output_surface(new.clone(), SurfaceStage::Running)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Resource);

    let snapshot = pipeline.decoder.snapshot()?;
    assert_eq!(snapshot.surface, Some(pipeline.surface.unique_id()));
    assert_eq!(snapshot.output.len(), 8);
    let on_new = snapshot
        .output
        .iter()
        .filter(|buf| new.contains(buf.native.unwrap()))
        .count();
    let on_old = snapshot
        .output
        .iter()
        .filter(|buf| pipeline.surface.contains(buf.native.unwrap()))
        .count();
    assert_eq!(on_new, 3);
    // the fourth buffer was detached before its attach failed
    assert_eq!(on_old, 4);
    Ok(())
}

#[test]
#[serial]
fn test_port_settings_change_reallocates() -> Result<(), Box<dyn Error>> {
    let pipeline = Pipeline::running(LoopbackComponent::new(640, 480, 4), &config(640, 480))?;
    assert_eq!(pipeline.next_format().display_width, 640);
    let held = pipeline.decode_one(0);
    let old_handles: Vec<_> = pipeline
        .decoder
        .snapshot()?
        .output
        .iter()
        .filter_map(|buf| buf.native)
        .collect();

    pipeline.component.change_output_geometry(320, 240, None);
    let snapshot = pipeline.decoder.snapshot()?;
    assert!(snapshot.reconfiguring);
    assert_eq!(snapshot.output.len(), 3);
    assert_eq!(snapshot.output_counts.omx, 3);

    assert_eq!(pipeline.component.return_all_fills(), 3);
    let snapshot = pipeline.decoder.snapshot()?;
    assert!(!snapshot.reconfiguring);
    assert_eq!(snapshot.output.len(), 4);
    assert_eq!(snapshot.output_counts.omx, 4);
    for buf in &snapshot.output {
        assert!(!old_handles.contains(&buf.native.unwrap()));
    }

    let format = pipeline.next_format();
    assert_eq!((format.width, format.height), (320, 240));
    assert_eq!((format.display_width, format.display_height), (320, 240));

    let err = pipeline
        .decoder
        .render_output_buffer(held.id, RenderMode::Keep)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidValue);

    let buffer = pipeline.decode_one(5);
    assert_eq!(buffer.native.unwrap().width(), 320);
    Ok(())
}

#[test]
#[serial]
fn test_transform_and_scaling_mode() -> Result<(), Box<dyn Error>> {
    let config = DecoderConfig {
        rotation: Some(90),
        scale_mode: Some(ScalingMode::ScaleCrop),
        ..config(640, 480)
    };
    let pipeline = Pipeline::running(LoopbackComponent::new(640, 480, 4), &config)?;
    assert_eq!(pipeline.surface.transform(), Transform::Rotate270);
    for seq in 0..4 {
        assert_eq!(pipeline.surface.scaling_mode(seq), Some(ScalingMode::ScaleCrop));
    }

    pipeline.decoder.set_parameters(&DecoderParameters {
        rotation: Some(180),
        scale_mode: None,
    })?;
    assert_eq!(pipeline.surface.transform(), Transform::Rotate180);

    let err = pipeline
        .decoder
        .set_parameters(&DecoderParameters {
            rotation: Some(45),
            scale_mode: None,
        })
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidValue);

    pipeline.decoder.release()?;
    assert_eq!(pipeline.surface.transform(), Transform::None);
    Ok(())
}

#[test]
#[serial]
fn test_release_reports_stuck_buffers() -> Result<(), Box<dyn Error>> {
    let pipeline = Pipeline::running(LoopbackComponent::new(640, 480, 8), &config(640, 480))?;
    let _held = pipeline.decode_one(0);
    let shown = pipeline.decode_one(1);
    pipeline
        .decoder
        .render_output_buffer(shown.id, RenderMode::Keep)?;

    assert_eq!(pipeline.decoder.release()?, 6);
    let snapshot = pipeline.decoder.snapshot()?;
    assert_eq!(snapshot.state, DecoderState::Released);
    assert_eq!(snapshot.surface, None);
    assert!(snapshot.input.is_empty());
    assert_eq!(snapshot.output.len(), 6);
    assert!(!pipeline.surface.has_release_listener());

    // stragglers are freed as the hardware returns them
    assert_eq!(pipeline.component.return_all_fills(), 6);
    assert!(pipeline.decoder.snapshot()?.output.is_empty());
    assert_eq!(pipeline.component.registered(Port::Output), 0);
    Ok(())
}

#[test]
#[serial]
fn test_drop_stops_decoder() -> Result<(), Box<dyn Error>> {
    let pipeline = Pipeline::running(LoopbackComponent::new(640, 480, 4), &config(640, 480))?;
    let surface = pipeline.surface.clone();
    let component = pipeline.component.clone();
    drop(pipeline);

    assert!(!surface.has_release_listener());
    // callbacks after shutdown go nowhere
    assert!(component.complete_fill(0).is_some());
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_async_render() -> Result<(), Box<dyn Error>> {
    let pipeline = Pipeline::running(LoopbackComponent::new(640, 480, 4), &config(640, 480))?;
    let buffer = pipeline.decode_one(7);

    pipeline
        .decoder
        .render_output_buffer_async(buffer.id, RenderMode::Keep)
        .await?;
    let snapshot = pipeline.decoder.snapshot_async().await?;
    assert_eq!(
        snapshot.output_buffer(buffer.id).unwrap().owner,
        BufferOwner::OwnedBySurface
    );
    let err = pipeline
        .decoder
        .release_output_buffer_async(buffer.id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidValue);
    Ok(())
}

#[test]
#[serial]
fn test_allocation_fence_delays_first_fill() -> Result<(), Box<dyn Error>> {
    let pipeline = Pipeline::new(LoopbackComponent::new(640, 480, 4))?;
    pipeline.decoder.configure(&config(640, 480))?;
    pipeline
        .decoder
        .set_output_surface(pipeline.surface.clone(), SurfaceStage::Configure)?;
    pipeline.surface.hold_fences(true);

    thread::scope(|scope| -> Result<(), Box<dyn Error>> {
        let start = scope.spawn(|| pipeline.decoder.start());

        assert!(wait_for(|| pipeline.surface.pending_fences() == 4));
        thread::sleep(Duration::from_millis(50));
        // every buffer is allocated but none reached the hardware
        assert_eq!(pipeline.surface.outstanding(), 4);
        assert_eq!(pipeline.component.pending_fills(), 0);
        assert!(!start.is_finished());

        assert_eq!(pipeline.surface.signal_fences(), 4);
        start.join().map_err(|_| "start panicked")??;
        Ok(())
    })?;

    assert_eq!(pipeline.component.pending_fills(), 4);
    let snapshot = pipeline.decoder.snapshot()?;
    assert_eq!(snapshot.state, DecoderState::Running);
    assert_eq!(snapshot.output_counts.omx, 4);
    Ok(())
}

#[test]
#[serial]
fn test_release_fence_delays_refill() -> Result<(), Box<dyn Error>> {
    let pipeline = Pipeline::running(LoopbackComponent::new(640, 480, 4), &config(640, 480))?;
    let buffer = pipeline.decode_one(0);
    pipeline
        .decoder
        .render_output_buffer(buffer.id, RenderMode::Keep)?;
    assert_eq!(pipeline.component.fill_submissions(buffer.id), 1);

    pipeline.surface.hold_fences(true);
    assert!(pipeline.surface.consume().is_some());

    // the decoder dequeued the buffer and now waits on its fence
    assert!(wait_for(|| pipeline.surface.pending_fences() == 1));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(pipeline.component.fill_submissions(buffer.id), 1);

    let surface = pipeline.surface.clone();
    let signaler = thread::spawn(move || surface.signal_fences());
    assert_eq!(signaler.join().map_err(|_| "signaler panicked")?, 1);

    let snapshot = pipeline.decoder.snapshot()?;
    assert_eq!(
        snapshot.output_buffer(buffer.id).unwrap().owner,
        BufferOwner::OwnedByOmx
    );
    assert_eq!(pipeline.component.fill_submissions(buffer.id), 2);
    assert_eq!(pipeline.surface.pending_fences(), 0);
    Ok(())
}

#[test]
#[serial]
fn test_surface_default_usage_combined() -> Result<(), Box<dyn Error>> {
    let component =
        LoopbackComponent::new(640, 480, 4).with_vendor_usage(BufferUsage::CPU_WRITE.bits());
    let mut pipeline = Pipeline::new(component)?;
    pipeline.surface = Arc::new(
        LoopbackSurface::new("composer").with_default_usage(BufferUsage::HW_COMPOSER.bits()),
    );
    pipeline.decoder.configure(&config(640, 480))?;
    pipeline
        .decoder
        .set_output_surface(pipeline.surface.clone(), SurfaceStage::Configure)?;
    pipeline.decoder.start()?;

    let usage = pipeline.surface.last_request_usage().unwrap();
    assert!(usage.contains(
        BufferUsage::MEM_DMA
            | BufferUsage::HW_RENDER
            | BufferUsage::HW_TEXTURE
            | BufferUsage::VIDEO_DECODER
    ));
    assert!(usage.contains(BufferUsage::CPU_WRITE | BufferUsage::HW_COMPOSER));
    // the vendor reported its usage, so no CPU read fallback
    assert!(!usage.contains(BufferUsage::CPU_READ));
    Ok(())
}

#[test]
#[serial]
fn test_switch_queue_size_failure_unregisters() -> Result<(), Box<dyn Error>> {
    let pipeline = Pipeline::running(LoopbackComponent::new(640, 480, 4), &config(640, 480))?;
    let new = Arc::new(LoopbackSurface::new("small"));
    new.reject_queue_size(true);

    let err = pipeline
        .decoder
        .set_output_surface(new.clone(), SurfaceStage::Running)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Resource);
    assert!(!new.has_release_listener());

    // nothing moved, the old surface stays bound
    let snapshot = pipeline.decoder.snapshot()?;
    assert_eq!(snapshot.surface, Some(pipeline.surface.unique_id()));
    assert!(pipeline.surface.has_release_listener());
    assert!(snapshot
        .output
        .iter()
        .all(|buf| pipeline.surface.contains(buf.native.unwrap())));
    assert_eq!(new.slot_count(), 0);
    Ok(())
}
