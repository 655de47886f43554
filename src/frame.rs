//! Camera frame model.
//!
//! - `PalmImage`: one captured image of one modality. The pixel buffer is
//!   owned by the image and zeroized on drop.
//! - `PalmFrame`: up to [`MAX_FRAME_IMAGES`] co-timed images in insertion order.
//!
//! Frames handed to a session are borrowed for the duration of the call only;
//! the core never keeps pixel data beyond `process_frame`.

use anyhow::Context;
use image::GenericImageView;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::error::{PalmError, PalmResult};
use crate::model::ModalityMask;

/// Fixed image capacity of a frame. Appending beyond it is a no-op.
pub const MAX_FRAME_IMAGES: usize = 8;

/// Largest encoded image accepted by [`PalmFrame::add_image_from_file`].
const MAX_IMAGE_FILE_BYTES: usize = 32 * 1024 * 1024;

/// Modality of a captured image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PalmType {
    /// Visible-light capture of the palm print.
    Print,
    /// Infrared capture of the palm veins.
    Vein,
}

impl PalmType {
    pub fn code(self) -> u32 {
        match self {
            PalmType::Print => 0,
            PalmType::Vein => 1,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(PalmType::Print),
            1 => Some(PalmType::Vein),
            _ => None,
        }
    }

    pub fn mask(self) -> ModalityMask {
        match self {
            PalmType::Print => ModalityMask::PRINT,
            PalmType::Vein => ModalityMask::VEIN,
        }
    }
}

// ----------------------------------------------------------------------------
// PalmImage
// ----------------------------------------------------------------------------

/// One captured image. There is no `Clone`; an image has exactly one owner.
pub struct PalmImage {
    pub palm_type: PalmType,
    data: Vec<u8>,
    /// Bits per pixel: 8 (grayscale) or 24 (RGB).
    pub depth: u32,
    pub width: u32,
    pub height: u32,
    /// Bytes per row including padding.
    pub stride: u32,
    /// Bytes from the start of the buffer to the first pixel.
    pub offset: u32,
    /// Capture time in microseconds.
    pub timestamp_us: i64,
    /// The device lit the scene itself (IR LEDs, torch).
    pub active_lighting: bool,
    /// The camera faces away from the user.
    pub rear_facing_camera: bool,
}

impl std::fmt::Debug for PalmImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PalmImage")
            .field("palm_type", &self.palm_type)
            .field("depth", &self.depth)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .field("offset", &self.offset)
            .field("timestamp_us", &self.timestamp_us)
            .field("active_lighting", &self.active_lighting)
            .field("bytes", &self.data.len())
            .finish()
    }
}

impl PalmImage {
    /// Zero-filled image with a tightly packed layout.
    pub fn blank(width: u32, height: u32, depth: u32, palm_type: PalmType) -> PalmResult<Self> {
        let bpp = bytes_per_pixel(depth)?;
        let stride = width
            .checked_mul(bpp)
            .ok_or_else(|| PalmError::invalid_argument("image row size overflows"))?;
        let len = (stride as usize)
            .checked_mul(height as usize)
            .ok_or_else(|| PalmError::invalid_argument("image size overflows"))?;
        if width == 0 || height == 0 {
            return Err(PalmError::invalid_argument("image dimensions must be non-zero"));
        }
        Ok(Self {
            palm_type,
            data: vec![0u8; len],
            depth,
            width,
            height,
            stride,
            offset: 0,
            timestamp_us: crate::now_us(),
            active_lighting: false,
            rear_facing_camera: false,
        })
    }

    /// Wrap a camera buffer. The layout is validated before the image is returned.
    pub fn from_raw(
        palm_type: PalmType,
        data: Vec<u8>,
        width: u32,
        height: u32,
        depth: u32,
        stride: u32,
        offset: u32,
    ) -> PalmResult<Self> {
        let image = Self {
            palm_type,
            data,
            depth,
            width,
            height,
            stride,
            offset,
            timestamp_us: crate::now_us(),
            active_lighting: false,
            rear_facing_camera: false,
        };
        image.validate()?;
        Ok(image)
    }

    /// Decode a BMP, PNG or JPEG file held in memory.
    pub fn decode(file_data: &[u8], palm_type: PalmType) -> PalmResult<Self> {
        if file_data.is_empty() {
            return Err(PalmError::invalid_argument("image file is empty"));
        }
        if file_data.len() > MAX_IMAGE_FILE_BYTES {
            return Err(PalmError::invalid_argument(format!(
                "image file exceeds {} bytes",
                MAX_IMAGE_FILE_BYTES
            )));
        }
        let decoded = image::load_from_memory(file_data)
            .context("decode image file")
            .map_err(|e| PalmError::invalid_argument(format!("{:#}", e)))?;
        let (width, height) = decoded.dimensions();
        let (data, depth) = if decoded.color().has_color() {
            (decoded.into_rgb8().into_raw(), 24)
        } else {
            (decoded.into_luma8().into_raw(), 8)
        };
        let stride = width * (depth / 8);
        Self::from_raw(palm_type, data, width, height, depth, stride, 0)
    }

    pub fn with_timestamp(mut self, timestamp_us: i64) -> Self {
        self.timestamp_us = timestamp_us;
        self
    }

    pub fn with_active_lighting(mut self, active: bool) -> Self {
        self.active_lighting = active;
        self
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Writable pixel buffer, e.g. to fill an image created by [`PalmImage::blank`].
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn validate(&self) -> PalmResult<()> {
        let bpp = bytes_per_pixel(self.depth)?;
        if self.width == 0 || self.height == 0 {
            return Err(PalmError::invalid_argument("image dimensions must be non-zero"));
        }
        let row_bytes = (self.width as u64) * (bpp as u64);
        if (self.stride as u64) < row_bytes {
            return Err(PalmError::invalid_argument(format!(
                "stride {} shorter than row of {} bytes",
                self.stride, row_bytes
            )));
        }
        let needed = (self.offset as u64) + (self.stride as u64) * (self.height as u64);
        if needed > self.data.len() as u64 {
            return Err(PalmError::invalid_argument(format!(
                "image layout needs {} bytes, buffer has {}",
                needed,
                self.data.len()
            )));
        }
        Ok(())
    }

    /// Luminance of one pixel. Callers must stay within `width`/`height`.
    pub fn luma(&self, x: u32, y: u32) -> u8 {
        let base = self.offset as usize + y as usize * self.stride as usize;
        if self.depth == 24 {
            let i = base + x as usize * 3;
            let (r, g, b) = (
                self.data[i] as u32,
                self.data[i + 1] as u32,
                self.data[i + 2] as u32,
            );
            ((r * 299 + g * 587 + b * 114) / 1000) as u8
        } else {
            self.data[base + x as usize]
        }
    }

    /// Set one pixel to a gray level (all channels for RGB).
    pub fn set_luma(&mut self, x: u32, y: u32, value: u8) {
        let base = self.offset as usize + y as usize * self.stride as usize;
        if self.depth == 24 {
            let i = base + x as usize * 3;
            self.data[i..i + 3].fill(value);
        } else {
            self.data[base + x as usize] = value;
        }
    }
}

impl Drop for PalmImage {
    fn drop(&mut self) {
        self.data.zeroize();
    }
}

fn bytes_per_pixel(depth: u32) -> PalmResult<u32> {
    match depth {
        8 => Ok(1),
        24 => Ok(3),
        other => Err(PalmError::invalid_argument(format!(
            "image depth must be 8 or 24 bits, got {}",
            other
        ))),
    }
}

// ----------------------------------------------------------------------------
// PalmFrame
// ----------------------------------------------------------------------------

/// A time-coincident bundle of up to eight images.
#[derive(Debug, Default)]
pub struct PalmFrame {
    images: Vec<PalmImage>,
}

impl PalmFrame {
    pub fn new() -> Self {
        Self {
            images: Vec::with_capacity(MAX_FRAME_IMAGES),
        }
    }

    /// Append a zero-filled image. Returns `None` when the frame is already full.
    pub fn add_image(
        &mut self,
        width: u32,
        height: u32,
        depth: u32,
        palm_type: PalmType,
    ) -> PalmResult<Option<&mut PalmImage>> {
        if self.is_full() {
            return Ok(None);
        }
        let image = PalmImage::blank(width, height, depth, palm_type)?;
        Ok(self.push_unchecked(image))
    }

    /// Append an image decoded from a BMP/PNG/JPEG blob. Returns `None` when full.
    pub fn add_image_from_file(
        &mut self,
        file_data: &[u8],
        palm_type: PalmType,
    ) -> PalmResult<Option<&mut PalmImage>> {
        if self.is_full() {
            return Ok(None);
        }
        let image = PalmImage::decode(file_data, palm_type)?;
        Ok(self.push_unchecked(image))
    }

    /// Append an existing image. Returns false (and drops the image) when full.
    pub fn push(&mut self, image: PalmImage) -> bool {
        self.push_unchecked(image).is_some()
    }

    fn push_unchecked(&mut self, image: PalmImage) -> Option<&mut PalmImage> {
        if self.is_full() {
            return None;
        }
        self.images.push(image);
        self.images.last_mut()
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.images.len() >= MAX_FRAME_IMAGES
    }

    pub fn images(&self) -> &[PalmImage] {
        &self.images
    }

    pub fn get(&self, index: usize) -> Option<&PalmImage> {
        self.images.get(index)
    }

    /// First image of the requested modality.
    pub fn image_of(&self, palm_type: PalmType) -> Option<&PalmImage> {
        self.images.iter().find(|img| img.palm_type == palm_type)
    }

    /// Capture time of the frame: the earliest image timestamp.
    pub fn timestamp_us(&self) -> i64 {
        self.images
            .iter()
            .map(|img| img.timestamp_us)
            .min()
            .unwrap_or_default()
    }

    pub fn has_active_lighting(&self) -> bool {
        self.images.iter().any(|img| img.active_lighting)
    }

    pub fn validate(&self) -> PalmResult<()> {
        if self.images.is_empty() {
            return Err(PalmError::invalid_argument("frame contains no images"));
        }
        for (i, image) in self.images.iter().enumerate() {
            image.validate().map_err(|e| {
                PalmError::invalid_argument(format!("frame image {}: {}", i, e))
            })?;
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
