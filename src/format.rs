// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Format negotiation between the user configuration, the hardware codec
//! ports and the output surface.
//!
//! [`FormatNegotiator`] is the only writer of the [`RequestTemplate`] used for
//! every buffer request from the surface and of the display [`CropRect`].
//! Everything else reads them through the negotiator at the point of use so
//! that an allocation never runs with geometry from before a renegotiation.

use bitflags::bitflags;
use core::fmt;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::{info, warn};

use crate::{
    error::{DecoderError, Result},
    omx::{ColorAspects, OmxCrop, PortDefinition},
    surface::{NativeBuffer, ScalingMode, Transform},
};

/// Frame rate assumed when the user does not provide a valid one.
pub const DEFAULT_FRAME_RATE: f64 = 30.0;

/// Stride alignment requested from the surface allocator.
pub const STRIDE_ALIGNMENT: u32 = 8;

/// Four character pixel format code.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FourCC(pub [u8; 4]);

/// NV12 4:2:0 YUV semi-planar, UV interleaved
pub const NV12: FourCC = FourCC(*b"NV12");

/// NV21 4:2:0 YUV semi-planar, VU interleaved
pub const NV21: FourCC = FourCC(*b"NV21");

/// I420 4:2:0 YUV planar
pub const I420: FourCC = FourCC(*b"I420");

/// RGBA 32-bit pixel format (8 bits per channel, with alpha)
pub const RGBA: FourCC = FourCC(*b"RGBA");

/// Formats the decoder output port can produce.
pub const SUPPORTED_OUTPUT_FORMATS: [FourCC; 4] = [NV12, NV21, I420, RGBA];

impl FourCC {
    /// Graphic pixel format code understood by the hardware port and the
    /// surface allocator.
    pub const fn graphic_format(self) -> Option<u32> {
        match &self.0 {
            b"RGBA" => Some(12),
            b"NV12" => Some(24),
            b"NV21" => Some(25),
            b"I420" => Some(26),
            _ => None,
        }
    }

    pub const fn from_graphic_format(code: u32) -> Option<FourCC> {
        match code {
            12 => Some(RGBA),
            24 => Some(NV12),
            25 => Some(NV21),
            26 => Some(I420),
            _ => None,
        }
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for c in self.0 {
            write!(f, "{}", c as char)?;
        }
        Ok(())
    }
}

impl fmt::Debug for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "FourCC({})", self)
    }
}

impl FromStr for FourCC {
    type Err = DecoderError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = s.as_bytes();
        if bytes.len() != 4 || !bytes.iter().all(|b| b.is_ascii_graphic()) {
            return Err(DecoderError::Configuration(format!(
                "pixel format must be four printable characters, got {s:?}"
            )));
        }
        Ok(FourCC([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

impl TryFrom<String> for FourCC {
    type Error = DecoderError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<FourCC> for String {
    fn from(value: FourCC) -> Self {
        value.to_string()
    }
}

bitflags! {
    /// Buffer usage flags passed to the surface allocator.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u64 {
        const CPU_READ = 1 << 0;
        const CPU_WRITE = 1 << 1;
        const MEM_DMA = 1 << 3;
        const HW_RENDER = 1 << 8;
        const HW_TEXTURE = 1 << 9;
        const HW_COMPOSER = 1 << 10;
        const VIDEO_DECODER = 1 << 13;
    }
}

const SURFACE_MODE_PRODUCER_USAGE: BufferUsage = BufferUsage::MEM_DMA
    .union(BufferUsage::HW_RENDER)
    .union(BufferUsage::HW_TEXTURE)
    .union(BufferUsage::VIDEO_DECODER);

const BUFFER_MODE_REQUEST_USAGE: BufferUsage = BufferUsage::MEM_DMA.union(BufferUsage::CPU_READ);

/// Usage the decoder requests as producer, before the consumer's default
/// usage is combined in.
pub fn producer_usage(surface_mode: bool, vendor: Option<BufferUsage>) -> BufferUsage {
    let base = if surface_mode {
        SURFACE_MODE_PRODUCER_USAGE
    } else {
        BUFFER_MODE_REQUEST_USAGE
    };
    let usage = match vendor {
        Some(vendor) => {
            info!("vendor producer usage = {:#x}", vendor.bits());
            base | vendor
        }
        None => {
            warn!("get vendor producer usage failed, add CPU_READ");
            base | BufferUsage::CPU_READ
        }
    };
    info!("decoder producer usage = {:#x}", usage.bits());
    usage
}

/// User supplied decoder configuration.
///
/// Every field is optional so that a missing value can be told apart from an
/// invalid one; [`FormatNegotiator::setup`] applies defaults and validation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub pixel_format: Option<FourCC>,
    pub frame_rate: Option<f64>,
    pub max_input_size: Option<u32>,
    pub rotation: Option<i32>,
    pub scale_mode: Option<ScalingMode>,
}

/// Parameters which may change while the decoder is running.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderParameters {
    pub rotation: Option<i32>,
    pub scale_mode: Option<ScalingMode>,
}

/// Video port settings written to the hardware at configuration time.
#[derive(Clone, Debug, PartialEq)]
pub struct PortInfo {
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    /// Output pixel format, `None` for the compressed input port.
    pub format: Option<FourCC>,
    /// Input buffer size override.
    pub buffer_size: Option<u32>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PortSetup {
    pub input: PortInfo,
    pub output: PortInfo,
}

/// Template for every buffer request made to the output surface.
#[derive(Clone, Debug, PartialEq)]
pub struct RequestTemplate {
    pub width: u32,
    pub height: u32,
    pub stride_alignment: u32,
    pub format: FourCC,
    pub usage: BufferUsage,
    pub timeout_ms: u32,
}

impl Default for RequestTemplate {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            stride_alignment: STRIDE_ALIGNMENT,
            format: NV12,
            usage: BufferUsage::empty(),
            timeout_ms: 0,
        }
    }
}

/// Region of the decoded frame which is valid for display.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl CropRect {
    pub const fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
        }
    }

    /// Inclusive right edge.
    pub fn right(&self) -> i64 {
        self.x as i64 + self.width as i64 - 1
    }

    /// Inclusive bottom edge.
    pub fn bottom(&self) -> i64 {
        self.y as i64 + self.height as i64 - 1
    }
}

/// Computes the display crop from the crop reported by the hardware. Any
/// crop which is missing or does not fit inside the frame falls back to the
/// full frame.
pub fn compute_crop(frame_width: u32, frame_height: u32, reported: Option<OmxCrop>) -> CropRect {
    let full = CropRect::full(frame_width, frame_height);
    let Some(rect) = reported else {
        warn!("get crop failed, use default");
        return full;
    };
    if rect.left < 0
        || rect.top < 0
        || rect.width == 0
        || rect.height == 0
        || rect.left as i64 + rect.width as i64 > frame_width as i64
        || rect.top as i64 + rect.height as i64 > frame_height as i64
    {
        warn!(
            "wrong crop rect ({}, {}, {}, {}) vs. frame ({}, {}), use default",
            rect.left, rect.top, rect.width, rect.height, frame_width, frame_height
        );
        return full;
    }
    info!(
        "crop rect ({}, {}, {}, {})",
        rect.left, rect.top, rect.width, rect.height
    );
    CropRect {
        x: rect.left as u32,
        y: rect.top as u32,
        width: rect.width,
        height: rect.height,
    }
}

/// Output format as exposed through the output-format-changed notification.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OutputFormat {
    pub width: u32,
    pub height: u32,
    pub display_width: u32,
    pub display_height: u32,
    pub crop_left: i64,
    pub crop_top: i64,
    pub crop_right: i64,
    pub crop_bottom: i64,
    pub stride: Option<u32>,
    pub slice_height: Option<u32>,
    pub pixel_format: FourCC,
    pub frame_rate: f64,
    pub color: Option<ColorAspects>,
}

impl Default for OutputFormat {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            display_width: 0,
            display_height: 0,
            crop_left: 0,
            crop_top: 0,
            crop_right: -1,
            crop_bottom: -1,
            stride: None,
            slice_height: None,
            pixel_format: NV12,
            frame_rate: DEFAULT_FRAME_RATE,
            color: None,
        }
    }
}

pub struct FormatNegotiator {
    configured: FourCC,
    frame_rate: f64,
    transform: Option<Transform>,
    scale_mode: Option<ScalingMode>,
    out_buffer_count: u32,
    input_size: (u32, u32),
    request: RequestTemplate,
    crop: CropRect,
    output: OutputFormat,
}

impl Default for FormatNegotiator {
    fn default() -> Self {
        Self::new()
    }
}

impl FormatNegotiator {
    pub fn new() -> Self {
        Self {
            configured: NV12,
            frame_rate: DEFAULT_FRAME_RATE,
            transform: None,
            scale_mode: None,
            out_buffer_count: 0,
            input_size: (0, 0),
            request: RequestTemplate::default(),
            crop: CropRect::default(),
            output: OutputFormat::default(),
        }
    }

    /// Validates the user configuration and derives the port settings to
    /// write to the hardware. Nothing is written on failure.
    pub fn setup(&mut self, config: &DecoderConfig) -> Result<PortSetup> {
        let width = match config.width {
            Some(w) if w > 0 => w as u32,
            _ => {
                return Err(DecoderError::Configuration(
                    "format should contain a positive width".into(),
                ))
            }
        };
        let height = match config.height {
            Some(h) if h > 0 => h as u32,
            _ => {
                return Err(DecoderError::Configuration(
                    "format should contain a positive height".into(),
                ))
            }
        };
        info!("user set width {}, height {}", width, height);

        let format = config.pixel_format.unwrap_or(NV12);
        if !SUPPORTED_OUTPUT_FORMATS.contains(&format) {
            return Err(DecoderError::Configuration(format!(
                "unsupported pixel format {format}"
            )));
        }

        let transform = match config.rotation {
            Some(rotate) => Some(Transform::from_rotation(rotate).ok_or_else(|| {
                DecoderError::Configuration(format!("invalid rotation angle {rotate}"))
            })?),
            None => None,
        };

        let frame_rate = match config.frame_rate {
            Some(fps) if fps > 0.0 && fps.is_finite() => fps,
            _ => {
                info!("user don't set valid frame rate, use default {DEFAULT_FRAME_RATE}");
                DEFAULT_FRAME_RATE
            }
        };

        self.configured = format;
        self.frame_rate = frame_rate;
        self.transform = transform;
        self.scale_mode = config.scale_mode;
        self.output.pixel_format = format;
        self.output.frame_rate = frame_rate;

        Ok(PortSetup {
            input: PortInfo {
                width,
                height,
                frame_rate,
                format: None,
                buffer_size: config.max_input_size.filter(|size| *size > 0),
            },
            output: PortInfo {
                width,
                height,
                frame_rate,
                format: Some(format),
                buffer_size: None,
            },
        })
    }

    /// Saves runtime parameters. Returns whether anything changed.
    pub fn save_parameters(&mut self, params: &DecoderParameters) -> Result<bool> {
        let mut changed = false;
        if let Some(rotate) = params.rotation {
            let transform = Transform::from_rotation(rotate)
                .ok_or_else(|| DecoderError::InvalidValue(format!("invalid rotation {rotate}")))?;
            info!("rotation = {}, transform = {:?}", rotate, transform);
            self.transform = Some(transform);
            changed = true;
        }
        if let Some(mode) = params.scale_mode {
            info!("user set scaling mode = {:?}", mode);
            self.scale_mode = Some(mode);
            changed = true;
        }
        Ok(changed)
    }

    pub fn configured_format(&self) -> FourCC {
        self.configured
    }

    pub fn frame_rate(&self) -> f64 {
        self.frame_rate
    }

    pub fn transform(&self) -> Option<Transform> {
        self.transform
    }

    pub fn scale_mode(&self) -> Option<ScalingMode> {
        self.scale_mode
    }

    pub fn out_buffer_count(&self) -> u32 {
        self.out_buffer_count
    }

    pub fn input_size(&self) -> (u32, u32) {
        self.input_size
    }

    pub fn request(&self) -> &RequestTemplate {
        &self.request
    }

    pub fn crop(&self) -> CropRect {
        self.crop
    }

    pub fn output_format(&self) -> &OutputFormat {
        &self.output
    }

    /// Vendor hardware may silently renegotiate the color format; follow it
    /// when it maps to a known format.
    pub fn update_configured_format(&mut self, color_format: u32) -> bool {
        if self.configured.graphic_format() == Some(color_format) {
            return true;
        }
        match FourCC::from_graphic_format(color_format) {
            Some(fmt) => {
                info!(
                    "pixel format need update: configured({}) -> port definition({})",
                    self.configured, fmt
                );
                self.configured = fmt;
                self.output.pixel_format = fmt;
                true
            }
            None => {
                warn!("port reports unknown color format {}", color_format);
                false
            }
        }
    }

    pub fn on_input_port_changed(&mut self, def: &PortDefinition) {
        self.input_size = (def.width, def.height);
    }

    /// Applies the output port definition reported by the hardware: color
    /// format, crop and buffer count, and rebuilds the request template.
    pub fn on_output_port_changed(
        &mut self,
        def: &PortDefinition,
        crop: Option<OmxCrop>,
        usage: BufferUsage,
    ) -> Result<()> {
        if def.buffer_count == 0 {
            return Err(DecoderError::InvalidValue("invalid buffer count".into()));
        }
        self.update_configured_format(def.color_format);

        self.crop = compute_crop(def.width, def.height, crop);
        self.out_buffer_count = def.buffer_count;
        self.request = RequestTemplate {
            width: self.crop.width,
            height: self.crop.height,
            stride_alignment: STRIDE_ALIGNMENT,
            format: self.configured,
            usage,
            timeout_ms: 0,
        };

        self.output.width = def.width;
        self.output.height = def.height;
        self.output.display_width = self.crop.width;
        self.output.display_height = self.crop.height;
        self.output.crop_left = self.crop.x as i64;
        self.output.crop_top = self.crop.y as i64;
        self.output.crop_right = self.crop.right();
        self.output.crop_bottom = self.crop.bottom();
        self.output.stride = (def.stride > 0).then_some(def.stride);
        self.output.slice_height = (def.slice_height > 0).then_some(def.slice_height);
        self.output.pixel_format = self.configured;
        Ok(())
    }

    pub fn combine_consumer_usage(&mut self, consumer: BufferUsage) {
        let combined = self.request.usage | consumer;
        info!(
            "producer usage {:#x} | consumer usage {:#x} -> {:#x}",
            self.request.usage.bits(),
            consumer.bits(),
            combined.bits()
        );
        self.request.usage = combined;
    }

    /// Refines the output format from an allocated surface buffer, which
    /// carries the stride the allocator actually chose.
    pub fn update_from_surface_buffer(&mut self, buffer: &NativeBuffer, slice_height: u32) {
        self.output.display_width = buffer.width();
        self.output.display_height = buffer.height();
        self.output.stride = Some(buffer.stride());
        if slice_height >= buffer.height() {
            info!(
                "[{}x{}][{}x{}]",
                buffer.width(),
                buffer.height(),
                buffer.stride(),
                slice_height
            );
            self.output.slice_height = Some(slice_height);
        }
    }

    pub fn update_color_aspects(&mut self, aspects: ColorAspects) {
        info!(
            "range:{}, primary:{}, transfer:{}, matrix:{}",
            aspects.full_range, aspects.primaries, aspects.transfer, aspects.matrix
        );
        self.output.color = Some(aspects);
    }
}
