use anyhow::{anyhow, Result};

use crate::config::RotationAngle;
use crate::detect::DetectedPalm;
use crate::frame::{PalmFrame, PalmImage, PalmType};
use crate::model::ModalityFeatures;

/// Turns a captured palm into per-modality feature vectors.
///
/// The numerics are opaque to the rest of the pipeline: matching only ever
/// compares vectors produced by the same extractor.
pub trait FeatureExtractor: Send + Sync {
    fn extract(&self, frame: &PalmFrame, palm: &DetectedPalm) -> Result<Vec<ModalityFeatures>>;
}

const DEFAULT_GRID: usize = 16;

/// Samples a square luma grid over the palm region of every modality in the
/// frame, rotated upright by the configured angle, and normalises it to zero
/// mean and unit length.
#[derive(Clone, Debug)]
pub struct GridExtractor {
    rotation: RotationAngle,
    grid: usize,
}

impl GridExtractor {
    pub fn new(rotation: RotationAngle) -> Self {
        Self {
            rotation,
            grid: DEFAULT_GRID,
        }
    }

    pub fn with_grid(mut self, grid: usize) -> Self {
        self.grid = grid.max(2);
        self
    }
}

impl FeatureExtractor for GridExtractor {
    fn extract(&self, frame: &PalmFrame, palm: &DetectedPalm) -> Result<Vec<ModalityFeatures>> {
        let reference = frame
            .get(palm.image_index)
            .or_else(|| frame.get(0))
            .ok_or_else(|| anyhow!("frame has no images"))?;

        let mut features = Vec::new();
        for palm_type in [PalmType::Print, PalmType::Vein] {
            let Some(image) = frame.image_of(palm_type) else {
                continue;
            };
            let region = Region::scaled(palm, reference, image);
            let angle = match self.rotation {
                RotationAngle::Degrees(d) => d.to_radians(),
                RotationAngle::Auto => principal_axis_rotation(image, &region),
            };
            features.push(ModalityFeatures {
                palm_type,
                values: normalise(sample_grid(image, &region, angle, self.grid)),
            });
        }
        if features.is_empty() {
            return Err(anyhow!("frame has no print or vein image"));
        }
        Ok(features)
    }
}

/// Palm bounds mapped into one image's pixel space.
struct Region {
    cx: f32,
    cy: f32,
    w: f32,
    h: f32,
}

impl Region {
    fn scaled(palm: &DetectedPalm, reference: &PalmImage, image: &PalmImage) -> Self {
        let sx = image.width as f32 / reference.width as f32;
        let sy = image.height as f32 / reference.height as f32;
        let (min_x, min_y, max_x, max_y) = palm.quad.bounds();
        Self {
            cx: (min_x + max_x) / 2.0 * sx,
            cy: (min_y + max_y) / 2.0 * sy,
            w: ((max_x - min_x) * sx).max(1.0),
            h: ((max_y - min_y) * sy).max(1.0),
        }
    }
}

fn sample_grid(image: &PalmImage, region: &Region, angle: f32, grid: usize) -> Vec<f32> {
    let (sin, cos) = angle.sin_cos();
    let max_x = (image.width - 1) as f32;
    let max_y = (image.height - 1) as f32;
    let mut out = Vec::with_capacity(grid * grid);
    for j in 0..grid {
        for i in 0..grid {
            let u = ((i as f32 + 0.5) / grid as f32 - 0.5) * region.w;
            let v = ((j as f32 + 0.5) / grid as f32 - 0.5) * region.h;
            let x = (region.cx + u * cos - v * sin).clamp(0.0, max_x);
            let y = (region.cy + u * sin + v * cos).clamp(0.0, max_y);
            out.push(image.luma(x as u32, y as u32) as f32);
        }
    }
    out
}

/// Rotation that brings the palm's principal axis upright, from second-order
/// central moments of the luma inside the region.
fn principal_axis_rotation(image: &PalmImage, region: &Region) -> f32 {
    let x0 = (region.cx - region.w / 2.0).max(0.0) as u32;
    let y0 = (region.cy - region.h / 2.0).max(0.0) as u32;
    let x1 = ((region.cx + region.w / 2.0) as u32).min(image.width);
    let y1 = ((region.cy + region.h / 2.0) as u32).min(image.height);

    let (mut m, mut mx, mut my) = (0.0f64, 0.0f64, 0.0f64);
    for y in y0..y1 {
        for x in x0..x1 {
            let w = image.luma(x, y) as f64;
            m += w;
            mx += w * x as f64;
            my += w * y as f64;
        }
    }
    if m <= 0.0 {
        return 0.0;
    }
    let (cx, cy) = (mx / m, my / m);
    let (mut mu20, mut mu02, mut mu11) = (0.0f64, 0.0f64, 0.0f64);
    for y in y0..y1 {
        for x in x0..x1 {
            let w = image.luma(x, y) as f64;
            let dx = x as f64 - cx;
            let dy = y as f64 - cy;
            mu20 += w * dx * dx;
            mu02 += w * dy * dy;
            mu11 += w * dx * dy;
        }
    }
    let axis = 0.5 * (2.0 * mu11).atan2(mu20 - mu02);
    (axis - std::f64::consts::FRAC_PI_2) as f32
}

fn normalise(mut values: Vec<f32>) -> Vec<f32> {
    let n = values.len().max(1) as f32;
    let mean = values.iter().sum::<f32>() / n;
    for v in values.iter_mut() {
        *v -= mean;
    }
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in values.iter_mut() {
            *v /= norm;
        }
    }
    values
}
