use serde::{Deserialize, Serialize};

/// A 2-D point in image coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Point2D {
    pub x: f32,
    pub y: f32,
}

impl Point2D {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point2D) -> f32 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// A quadrilateral described by four corners in order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Quad2D {
    pub a: Point2D,
    pub b: Point2D,
    pub c: Point2D,
    pub d: Point2D,
}

impl Quad2D {
    pub fn from_rect(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self {
            a: Point2D::new(x, y),
            b: Point2D::new(x + w, y),
            c: Point2D::new(x + w, y + h),
            d: Point2D::new(x, y + h),
        }
    }

    pub fn corners(&self) -> [Point2D; 4] {
        [self.a, self.b, self.c, self.d]
    }

    /// Shoelace area; independent of winding.
    pub fn area(&self) -> f32 {
        let p = self.corners();
        let mut twice = 0.0f32;
        for i in 0..4 {
            let j = (i + 1) % 4;
            twice += p[i].x * p[j].y - p[j].x * p[i].y;
        }
        twice.abs() / 2.0
    }

    pub fn centroid(&self) -> Point2D {
        let p = self.corners();
        Point2D::new(
            p.iter().map(|c| c.x).sum::<f32>() / 4.0,
            p.iter().map(|c| c.y).sum::<f32>() / 4.0,
        )
    }

    /// Axis-aligned bounds as (min_x, min_y, max_x, max_y).
    pub fn bounds(&self) -> (f32, f32, f32, f32) {
        let p = self.corners();
        let min_x = p.iter().map(|c| c.x).fold(f32::INFINITY, f32::min);
        let min_y = p.iter().map(|c| c.y).fold(f32::INFINITY, f32::min);
        let max_x = p.iter().map(|c| c.x).fold(f32::NEG_INFINITY, f32::max);
        let max_y = p.iter().map(|c| c.y).fold(f32::NEG_INFINITY, f32::max);
        (min_x, min_y, max_x, max_y)
    }
}

/// How strictly a palm must be positioned to be captured.
///
/// Ordered `None < Minimum < Authenticate < Medium < Enrollment < Maximum`.
/// As a readiness value `None` means the palm cannot be captured at all; as a
/// capture request it means "do not capture".
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Strictness {
    None,
    Minimum,
    Authenticate,
    Medium,
    Enrollment,
    Maximum,
}

impl Strictness {
    pub const LEVELS: [Strictness; 5] = [
        Strictness::Minimum,
        Strictness::Authenticate,
        Strictness::Medium,
        Strictness::Enrollment,
        Strictness::Maximum,
    ];

    /// Position in [`Strictness::LEVELS`], `None` for `Strictness::None`.
    pub fn index(self) -> Option<usize> {
        Self::LEVELS.iter().position(|level| *level == self)
    }

    pub fn code(self) -> i32 {
        match self.index() {
            Some(i) => i as i32,
            None => -1,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            -1 => Some(Strictness::None),
            0..=4 => Some(Self::LEVELS[code as usize]),
            _ => None,
        }
    }
}

/// One candidate palm in a processed frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectedPalm {
    pub quad: Quad2D,
    /// Capture time of the frame in microseconds.
    pub timestamp_us: i64,
    /// Highest strictness at which this palm could be captured right now.
    pub readiness: Strictness,
    pub quality: f32,
    pub brightness: f32,
    pub centerness: f32,
    /// Likelihood of a right hand: 0 is definitely left, 1 definitely right.
    pub sidedness: f32,
    /// Index of the frame image the palm was found in.
    #[serde(default)]
    pub image_index: usize,
}

impl DetectedPalm {
    pub fn qualifies_for(&self, strictness: Strictness) -> bool {
        strictness != Strictness::None && self.readiness >= strictness
    }

    pub(crate) fn metrics_are_normalized(&self) -> bool {
        [self.quality, self.brightness, self.centerness, self.sidedness]
            .iter()
            .all(|v| v.is_finite() && (0.0..=1.0).contains(v))
    }
}

/// Everything the tracker learned from one frame.
#[derive(Clone, Debug, Default)]
pub struct FrameObservation {
    pub timestamp_us: i64,
    pub palms: Vec<DetectedPalm>,
    /// Mean brightness of the scene outside any palm, in [0,1].
    pub ambient_brightness: f32,
    /// True when any image of the frame was taken under active lighting.
    pub active_lighting: bool,
}

impl FrameObservation {
    /// The palm with the highest readiness, quality breaking ties.
    pub fn best_palm(&self) -> Option<&DetectedPalm> {
        self.palms.iter().max_by(|a, b| {
            a.readiness
                .cmp(&b.readiness)
                .then(a.quality.total_cmp(&b.quality))
        })
    }

    /// Best palm that satisfies `strictness`, if any.
    pub fn qualifying_palm(&self, strictness: Strictness) -> Option<&DetectedPalm> {
        self.palms
            .iter()
            .filter(|palm| palm.qualifies_for(strictness))
            .max_by(|a, b| a.quality.total_cmp(&b.quality))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strictness_orders_from_none_to_maximum() {
        assert!(Strictness::None < Strictness::Minimum);
        assert!(Strictness::Authenticate < Strictness::Medium);
        assert!(Strictness::Enrollment < Strictness::Maximum);
        assert_eq!(Strictness::from_code(2), Some(Strictness::Medium));
        assert_eq!(Strictness::Medium.code(), 2);
        assert_eq!(Strictness::None.code(), -1);
        assert_eq!(Strictness::from_code(5), None);
    }

    #[test]
    fn quad_area_and_centroid() {
        let quad = Quad2D::from_rect(10.0, 20.0, 30.0, 40.0);
        assert_eq!(quad.area(), 1200.0);
        assert_eq!(quad.centroid(), Point2D::new(25.0, 40.0));
        assert_eq!(quad.bounds(), (10.0, 20.0, 40.0, 60.0));
    }

    #[test]
    fn none_readiness_never_qualifies() {
        let palm = DetectedPalm {
            quad: Quad2D::default(),
            timestamp_us: 0,
            readiness: Strictness::Maximum,
            quality: 1.0,
            brightness: 0.5,
            centerness: 1.0,
            sidedness: 0.5,
            image_index: 0,
        };
        assert!(palm.qualifies_for(Strictness::Maximum));
        assert!(!palm.qualifies_for(Strictness::None));
    }
}
