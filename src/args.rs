// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use clap::Parser;
use edgefirst_decoder::{DecoderConfig, FourCC, ScalingMode};

/// Display scaling options.
///
/// Determines how the consumer fits the decoded frame into its window.
#[derive(clap::ValueEnum, Clone, Debug, PartialEq, Copy)]
pub enum ScaleSetting {
    /// Stretch the frame to the window
    Window,
    /// Keep the aspect ratio and crop what does not fit
    Crop,
}

impl From<ScaleSetting> for ScalingMode {
    fn from(value: ScaleSetting) -> Self {
        match value {
            ScaleSetting::Window => ScalingMode::ScaleToWindow,
            ScaleSetting::Crop => ScalingMode::ScaleCrop,
        }
    }
}

/// Command-line arguments for the EdgeFirst Decoder loopback.
///
/// Runs the decoder against an in-process hardware component and display
/// surface, paced at the configured frame rate, and prints the final buffer
/// pool snapshot. Arguments can be specified via command line or environment
/// variables.
///
/// # Example
///
/// ```bash
/// # Via command line
/// edgefirst-decoder --width 1280 --height 720 --frames 600 --switch-after 300
///
/// # Via environment variables
/// export PIXEL_FORMAT=NV21
/// export FRAME_RATE=60
/// edgefirst-decoder
/// ```
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Coded frame width in pixels
    #[arg(long, env = "WIDTH", default_value = "1920")]
    pub width: i32,

    /// Coded frame height in pixels
    #[arg(long, env = "HEIGHT", default_value = "1080")]
    pub height: i32,

    /// Output pixel format (NV12, NV21, I420 or RGBA)
    #[arg(long, env = "PIXEL_FORMAT", default_value = "NV12")]
    pub pixel_format: FourCC,

    /// Decoding frame rate, 30 when unset or invalid
    #[arg(long, env = "FRAME_RATE")]
    pub frame_rate: Option<f64>,

    /// Clockwise display rotation in degrees (0, 90, 180 or 270)
    #[arg(long, env = "ROTATION")]
    pub rotation: Option<i32>,

    /// Display scaling mode
    #[arg(long, env = "SCALE_MODE", default_value = "window", value_enum)]
    pub scale_mode: ScaleSetting,

    /// Output buffers the hardware component asks for
    #[arg(long, env = "OUTPUT_BUFFERS", default_value = "8")]
    pub output_buffers: u32,

    /// Frames to decode before exiting
    #[arg(long, env = "FRAMES", default_value = "300")]
    pub frames: u64,

    /// Switch to a second surface after this many rendered frames
    #[arg(long, env = "SWITCH_AFTER")]
    pub switch_after: Option<u64>,

    /// Discard every Nth frame instead of rendering it
    #[arg(long, env = "DISCARD_EVERY")]
    pub discard_every: Option<u64>,

    /// Refresh rate of the simulated display in Hz
    #[arg(long, env = "DISPLAY_HZ", default_value = "60")]
    pub display_hz: u32,

    /// Enable verbose debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Send logs to the systemd journal
    #[arg(long, env = "JOURNALD")]
    pub journald: bool,

    /// Enable Tokio async runtime console for debugging
    #[arg(long, env = "TOKIO_CONSOLE")]
    pub tokio_console: bool,

    /// Enable Tracy profiler for performance analysis
    #[arg(long, env = "TRACY")]
    pub tracy: bool,
}

impl From<&Args> for DecoderConfig {
    fn from(args: &Args) -> Self {
        DecoderConfig {
            width: Some(args.width),
            height: Some(args.height),
            pixel_format: Some(args.pixel_format),
            frame_rate: args.frame_rate,
            max_input_size: None,
            rotation: args.rotation,
            scale_mode: Some(args.scale_mode.into()),
        }
    }
}
