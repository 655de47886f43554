use anyhow::Result;

use crate::detect::backend::{DetectorBackend, FrameDetections, PalmCandidate};
use crate::detect::result::{Point2D, Quad2D};
use crate::frame::{PalmFrame, PalmImage};

/// Longest side of the sampling grid; larger images are subsampled.
const SAMPLE_GRID: u32 = 128;
/// Below this luma spread an image is treated as empty.
const MIN_CONTRAST: u8 = 24;
/// Smallest share of samples that must be foreground to report a palm.
const MIN_FOREGROUND_SHARE: f32 = 0.01;
/// Palm-to-image area ratio at which the size score saturates.
const FULL_SIZE_RATIO: f32 = 0.25;

/// CPU backend: finds the bright, lit hand against a darker background by
/// thresholding luma at the midpoint of the observed range.
#[derive(Default)]
pub struct CpuBackend;

impl CpuBackend {
    pub fn new() -> Self {
        Self
    }
}

impl DetectorBackend for CpuBackend {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn detect(&mut self, frame: &PalmFrame) -> Result<FrameDetections> {
        let mut ambient = None;
        for (index, image) in frame.images().iter().enumerate() {
            let scan = scan_image(image);
            if let Some(mut candidate) = scan.candidate {
                candidate.image_index = index;
                return Ok(FrameDetections {
                    candidates: vec![candidate],
                    ambient_brightness: scan.ambient,
                });
            }
            ambient.get_or_insert(scan.ambient);
        }
        Ok(FrameDetections {
            candidates: Vec::new(),
            ambient_brightness: ambient.unwrap_or_default(),
        })
    }
}

struct ImageScan {
    candidate: Option<PalmCandidate>,
    ambient: f32,
}

fn scan_image(image: &PalmImage) -> ImageScan {
    let step_x = (image.width / SAMPLE_GRID).max(1);
    let step_y = (image.height / SAMPLE_GRID).max(1);

    let mut samples = Vec::new();
    let (mut lo, mut hi) = (u8::MAX, u8::MIN);
    let mut total = 0u64;
    for y in (0..image.height).step_by(step_y as usize) {
        for x in (0..image.width).step_by(step_x as usize) {
            let v = image.luma(x, y);
            lo = lo.min(v);
            hi = hi.max(v);
            total += v as u64;
            samples.push((x, y, v));
        }
    }
    if samples.is_empty() {
        return ImageScan {
            candidate: None,
            ambient: 0.0,
        };
    }
    let mean = total as f32 / samples.len() as f32 / 255.0;
    if hi - lo < MIN_CONTRAST {
        return ImageScan {
            candidate: None,
            ambient: mean,
        };
    }

    let threshold = ((lo as u16 + hi as u16) / 2) as u8;
    let (mut min_x, mut min_y, mut max_x, mut max_y) = (u32::MAX, u32::MAX, 0u32, 0u32);
    let (mut fg_count, mut fg_sum, mut bg_count, mut bg_sum) = (0u64, 0u64, 0u64, 0u64);
    for &(x, y, v) in &samples {
        if v > threshold {
            fg_count += 1;
            fg_sum += v as u64;
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        } else {
            bg_count += 1;
            bg_sum += v as u64;
        }
    }
    let ambient = if bg_count == 0 {
        0.0
    } else {
        bg_sum as f32 / bg_count as f32 / 255.0
    };
    if (fg_count as f32) < samples.len() as f32 * MIN_FOREGROUND_SHARE {
        return ImageScan {
            candidate: None,
            ambient,
        };
    }

    // Box edges are exclusive so a single sample still has an area.
    let box_x = min_x as f32;
    let box_y = min_y as f32;
    let box_w = (max_x + step_x - min_x) as f32;
    let box_h = (max_y + step_y - min_y) as f32;
    let box_samples = ((box_w / step_x as f32) * (box_h / step_y as f32)).max(1.0);
    let fill = (fg_count as f32 / box_samples).min(1.0);
    let size_ratio = (box_w * box_h) / (image.width as f32 * image.height as f32);
    let contrast = (hi - lo) as f32 / 255.0;
    let quality = (0.4 * contrast + 0.3 * fill + 0.3 * (size_ratio / FULL_SIZE_RATIO).min(1.0))
        .clamp(0.0, 1.0);

    let centre = Point2D::new(image.width as f32 / 2.0, image.height as f32 / 2.0);
    let palm_centre = Point2D::new(box_x + box_w / 2.0, box_y + box_h / 2.0);
    let half_diagonal = centre.distance(&Point2D::new(0.0, 0.0)).max(1.0);
    let centerness = (1.0 - palm_centre.distance(&centre) / half_diagonal).clamp(0.0, 1.0);

    // The thumb side of a lit palm carries more foreground mass.
    let split = palm_centre.x;
    let (mut left, mut right) = (0u64, 0u64);
    for &(x, _, v) in &samples {
        if v > threshold {
            if (x as f32) < split {
                left += 1;
            } else {
                right += 1;
            }
        }
    }
    let sidedness = if left + right == 0 {
        0.5
    } else {
        right as f32 / (left + right) as f32
    };

    ImageScan {
        candidate: Some(PalmCandidate {
            quad: Quad2D::from_rect(box_x, box_y, box_w, box_h),
            quality,
            brightness: fg_sum as f32 / fg_count as f32 / 255.0,
            centerness,
            sidedness,
            image_index: 0,
        }),
        ambient,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PalmType;

    fn frame_with_square(size: u32, from: u32, to: u32, fg: u8, bg: u8) -> PalmFrame {
        let mut frame = PalmFrame::new();
        let image = frame
            .add_image(size, size, 8, PalmType::Print)
            .unwrap()
            .unwrap();
        for y in 0..size {
            for x in 0..size {
                let inside = (from..to).contains(&x) && (from..to).contains(&y);
                image.set_luma(x, y, if inside { fg } else { bg });
            }
        }
        frame
    }

    #[test]
    fn finds_centred_bright_palm() {
        let frame = frame_with_square(64, 16, 48, 200, 20);
        let detections = CpuBackend::new().detect(&frame).unwrap();
        assert_eq!(detections.candidates.len(), 1);

        let palm = &detections.candidates[0];
        assert_eq!(palm.quad, Quad2D::from_rect(16.0, 16.0, 32.0, 32.0));
        assert!(palm.centerness > 0.99);
        assert!((palm.brightness - 200.0 / 255.0).abs() < 1e-3);
        assert!(palm.quality > 0.8);
        assert!((detections.ambient_brightness - 20.0 / 255.0).abs() < 1e-3);
    }

    #[test]
    fn uniform_image_has_no_palm() {
        let mut frame = PalmFrame::new();
        frame.add_image(32, 32, 8, PalmType::Vein).unwrap();
        let detections = CpuBackend::new().detect(&frame).unwrap();
        assert!(detections.candidates.is_empty());
        assert_eq!(detections.ambient_brightness, 0.0);
    }

    #[test]
    fn off_centre_palm_scores_lower_centerness() {
        let frame = frame_with_square(64, 0, 16, 220, 10);
        let detections = CpuBackend::new().detect(&frame).unwrap();
        let palm = &detections.candidates[0];
        assert!(palm.centerness < 0.6);
    }
}
