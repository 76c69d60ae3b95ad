// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

mod args;

use args::Args;
use clap::Parser;
use edgefirst_decoder::{
    format::DEFAULT_FRAME_RATE, BufferFlags, DecoderConfig, DecoderEvent, DecoderHandle,
    LoopbackComponent, LoopbackSurface, RenderMode, Surface, SurfaceStage,
};
use std::{
    error::Error,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Compressed bytes queued per input buffer.
const INPUT_CHUNK: u32 = 4096;

fn init_tracing(args: &Args) -> Result<Option<tracy_client::Client>, Box<dyn Error>> {
    let level = if args.verbose { "debug" } else { "info" };
    let stdout_log = tracing_subscriber::fmt::layer()
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)));

    let journald = if args.journald {
        Some(tracing_journald::layer()?.with_filter(EnvFilter::new(level)))
    } else {
        None
    };

    let console = args
        .tokio_console
        .then(|| console_subscriber::ConsoleLayer::builder().with_default_env().spawn());

    let (tracy, client) = if args.tracy {
        let client = tracy_client::Client::start();
        (Some(tracing_tracy::TracyLayer::default()), Some(client))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(stdout_log)
        .with(journald)
        .with(tracy)
        .with(console)
        .try_init()?;
    Ok(client)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let _tracy = init_tracing(&args)?;
    info!("EdgeFirst Decoder loopback");

    let config = DecoderConfig::from(&args);
    let component = LoopbackComponent::new(
        args.width.max(1) as u32,
        args.height.max(1) as u32,
        args.output_buffers,
    );
    let primary = Arc::new(LoopbackSurface::new("primary"));
    let (tx, rx) = kanal::unbounded::<DecoderEvent>();

    let decoder = DecoderHandle::spawn(Box::new(component.clone()), Box::new(tx))?;
    decoder.configure(&config)?;
    decoder.set_output_surface(primary.clone(), SurfaceStage::Configure)?;
    decoder.start()?;

    let frame_rate = config
        .frame_rate
        .filter(|fps| *fps > 0.0 && fps.is_finite())
        .unwrap_or(DEFAULT_FRAME_RATE);
    let frame_period = Duration::from_secs_f64(1.0 / frame_rate);
    let refresh = Duration::from_secs_f64(1.0 / args.display_hz.max(1) as f64);
    let stop = Arc::new(AtomicBool::new(false));

    let hardware = tokio::spawn(hardware(component.clone(), frame_period, stop.clone()));
    let mut displays = vec![tokio::spawn(display(primary, refresh, stop.clone()))];

    let result = client(&decoder, &rx, &args, frame_period, refresh, &stop, &mut displays).await;
    stop.store(true, Ordering::Relaxed);
    hardware.await?;
    for display in displays {
        display.await?;
    }
    result?;

    let snapshot = decoder.snapshot()?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    let stuck = decoder.release()?;
    if stuck > 0 {
        warn!("{} buffers were still owned by the hardware", stuck);
    }
    Ok(())
}

/// Plays the client: feeds input buffers, renders or discards every decoded
/// frame and optionally switches surface part way.
async fn client(
    decoder: &DecoderHandle,
    events: &kanal::Receiver<DecoderEvent>,
    args: &Args,
    frame_period: Duration,
    refresh: Duration,
    stop: &Arc<AtomicBool>,
    displays: &mut Vec<JoinHandle<()>>,
) -> Result<(), Box<dyn Error>> {
    let events = events.as_async();
    let mut queued = 0u64;
    let mut decoded = 0u64;

    while decoded < args.frames {
        match events.recv().await? {
            DecoderEvent::InputBufferAvailable(id) => {
                if queued >= args.frames {
                    continue;
                }
                queued += 1;
                let flags = if queued == args.frames {
                    BufferFlags::EOS
                } else {
                    BufferFlags::empty()
                };
                let pts = (queued - 1) as i64 * frame_period.as_micros() as i64;
                decoder
                    .queue_input_buffer_async(id, pts, INPUT_CHUNK, flags)
                    .await?;
            }
            DecoderEvent::OutputBufferAvailable(buffer) => {
                decoded += 1;
                let discard = args
                    .discard_every
                    .is_some_and(|n| n > 0 && decoded % n == 0);
                if discard {
                    trace!("discard buffer id {} pts {}", buffer.id, buffer.pts);
                    decoder.release_output_buffer_async(buffer.id).await?;
                } else {
                    decoder
                        .render_output_buffer_async(buffer.id, RenderMode::Keep)
                        .await?;
                }

                if args.switch_after == Some(decoded) {
                    let secondary = Arc::new(LoopbackSurface::new("secondary"));
                    decoder
                        .set_output_surface_async(secondary.clone(), SurfaceStage::Running)
                        .await?;
                    info!(
                        "switched to surface({}) after {} frames",
                        secondary.unique_id(),
                        decoded
                    );
                    displays.push(tokio::spawn(display(secondary, refresh, stop.clone())));
                }
            }
            DecoderEvent::OutputFormatChanged(format) => {
                info!(
                    "output format {}x{} {} display {}x{}",
                    format.width,
                    format.height,
                    format.pixel_format,
                    format.display_width,
                    format.display_height
                );
            }
            DecoderEvent::Error(err) => error!("decoder error: {}", err),
        }
    }
    info!("decoded {} frames", decoded);
    Ok(())
}

/// Completes one input and one output buffer per frame period.
async fn hardware(component: LoopbackComponent, period: Duration, stop: Arc<AtomicBool>) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut pts = 0i64;
    while !stop.load(Ordering::Relaxed) {
        ticker.tick().await;
        component.complete_empty();
        if component.complete_fill(pts).is_some() {
            pts += period.as_micros() as i64;
        } else {
            debug!("hardware starved, no output buffer queued");
        }
    }
}

/// Shows one queued frame per refresh and releases it.
async fn display(surface: Arc<LoopbackSurface>, refresh: Duration, stop: Arc<AtomicBool>) {
    let mut ticker = interval(refresh);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut shown = 0u64;
    while !stop.load(Ordering::Relaxed) {
        ticker.tick().await;
        if let Some(frame) = surface.consume() {
            trace!(
                "surface {} shows seq {} pts {}",
                surface.name(),
                frame.seq_num,
                frame.timestamp
            );
            shown += 1;
        }
    }
    info!("surface {} showed {} frames", surface.name(), shown);
}
