//! Biometric templates and their identifiers.

mod codec;

pub use codec::TemplateCodec;

use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::frame::PalmType;

pub const MODEL_ID_LEN: usize = 20;

/// Stable 20-byte template identifier. Rendered as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ModelId([u8; MODEL_ID_LEN]);

impl ModelId {
    pub const fn from_bytes(bytes: [u8; MODEL_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn random() -> Self {
        let mut bytes = [0u8; MODEL_ID_LEN];
        loop {
            rand::thread_rng().fill_bytes(&mut bytes);
            if bytes != [0u8; MODEL_ID_LEN] {
                return Self(bytes);
            }
        }
    }

    pub fn as_bytes(&self) -> &[u8; MODEL_ID_LEN] {
        &self.0
    }

    /// The all-zero id is reserved for "no model".
    pub fn is_nil(&self) -> bool {
        self.0 == [0u8; MODEL_ID_LEN]
    }
}

impl std::fmt::Display for ModelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl std::fmt::Debug for ModelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ModelId({})", self)
    }
}

impl std::str::FromStr for ModelId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let raw = hex::decode(s.trim())
            .map_err(|e| anyhow::anyhow!("model id is not hex: {}", e))?;
        let bytes: [u8; MODEL_ID_LEN] = raw.as_slice().try_into().map_err(|_| {
            anyhow::anyhow!("model id must be {} bytes, got {}", MODEL_ID_LEN, raw.len())
        })?;
        Ok(Self(bytes))
    }
}

impl Serialize for ModelId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ModelId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Left/right handedness of a template.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Sidedness {
    #[default]
    Undetermined,
    Left,
    Right,
}

impl Sidedness {
    /// Threshold a mean detector sidedness score (0 left, 1 right).
    pub fn from_score(score: f32) -> Self {
        if !score.is_finite() || score == 0.5 {
            Sidedness::Undetermined
        } else if score < 0.5 {
            Sidedness::Left
        } else {
            Sidedness::Right
        }
    }

    pub fn code(self) -> i8 {
        match self {
            Sidedness::Undetermined => -1,
            Sidedness::Left => 0,
            Sidedness::Right => 1,
        }
    }

    pub fn from_code(code: i8) -> Option<Self> {
        match code {
            -1 => Some(Sidedness::Undetermined),
            0 => Some(Sidedness::Left),
            1 => Some(Sidedness::Right),
            _ => None,
        }
    }
}

/// Bitcode of the modalities a template carries: 1 print, 2 vein.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModalityMask(u8);

impl ModalityMask {
    pub const UNKNOWN: ModalityMask = ModalityMask(0);
    pub const PRINT: ModalityMask = ModalityMask(1);
    pub const VEIN: ModalityMask = ModalityMask(2);
    pub const BOTH: ModalityMask = ModalityMask(3);

    pub fn from_bits(bits: u8) -> Option<Self> {
        (bits <= 3).then_some(ModalityMask(bits))
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, palm_type: PalmType) -> bool {
        self.0 & palm_type.mask().0 != 0
    }

    pub fn union(self, other: ModalityMask) -> Self {
        ModalityMask(self.0 | other.0)
    }
}

/// Feature vector of one modality.
#[derive(Clone, PartialEq)]
pub struct ModalityFeatures {
    pub palm_type: PalmType,
    pub values: Vec<f32>,
}

/// Decoded template. Outside the core it only ever travels as an opaque
/// blob produced by [`TemplateCodec`].
#[derive(Clone, PartialEq)]
pub struct Template {
    pub id: ModelId,
    pub sidedness: Sidedness,
    /// Quality of the capture the features came from, in [0,1].
    pub quality: f32,
    pub capture_time_us: i64,
    pub features: Vec<ModalityFeatures>,
}

impl std::fmt::Debug for Template {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Template")
            .field("id", &self.id)
            .field("sidedness", &self.sidedness)
            .field("modality", &self.modality())
            .field("quality", &self.quality)
            .field("capture_time_us", &self.capture_time_us)
            .finish_non_exhaustive()
    }
}

impl Template {
    pub fn modality(&self) -> ModalityMask {
        self.features
            .iter()
            .fold(ModalityMask::UNKNOWN, |mask, f| mask.union(f.palm_type.mask()))
    }

    pub fn features_for(&self, palm_type: PalmType) -> Option<&[f32]> {
        self.features
            .iter()
            .find(|f| f.palm_type == palm_type)
            .map(|f| f.values.as_slice())
    }
}
