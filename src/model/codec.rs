use anyhow::{anyhow, Result};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::config::EncryptionKey;
use crate::frame::PalmType;
use crate::model::{ModalityFeatures, ModelId, Sidedness, Template, MODEL_ID_LEN};

const PLAIN_MAGIC: &[u8; 4] = b"PLM1";
const SEALED_MAGIC: &[u8; 4] = b"PLME";
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const CHECKSUM_LEN: usize = 32;

/// One feature block per modality at most.
const MAX_FEATURE_BLOCKS: usize = 2;

/// Maximum values per feature block. Keeps hostile blobs from forcing
/// large allocations.
const MAX_FEATURE_VALUES: usize = 16 * 1024;

/// Serializes templates to opaque blobs and back.
///
/// Plain layout (`PLM1`):
/// magic | id[20] | sidedness i8 | quality f32 | capture_time i64 |
/// block count u8 | { palm_type u8 | len u32 | len x f32 }* | sha256[32]
///
/// Sealed layout (`PLME`): magic | nonce[12] | ChaCha20-Poly1305(plain) | tag[16],
/// with the magic as associated data. When a key is configured only sealed
/// blobs are accepted, and without a key only plain ones.
pub struct TemplateCodec {
    key: Option<[u8; 32]>,
}

impl Drop for TemplateCodec {
    fn drop(&mut self) {
        if let Some(key) = self.key.as_mut() {
            key.zeroize();
        }
    }
}

impl TemplateCodec {
    pub fn new(key: Option<&EncryptionKey>) -> Self {
        Self {
            key: key.map(|k| Sha256::digest(k.expose().as_bytes()).into()),
        }
    }

    pub fn plain() -> Self {
        Self { key: None }
    }

    pub fn is_sealing(&self) -> bool {
        self.key.is_some()
    }

    pub fn encode(&self, template: &Template) -> Result<Vec<u8>> {
        let plain = encode_plain(template)?;
        match &self.key {
            None => Ok(plain),
            Some(key) => seal(key, &plain),
        }
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Template> {
        match (&self.key, bytes.get(..4)) {
            (Some(key), Some(magic)) if magic == SEALED_MAGIC => {
                let mut plain = open(key, bytes)?;
                let template = decode_plain(&plain);
                plain.zeroize();
                template
            }
            (None, Some(magic)) if magic == PLAIN_MAGIC => decode_plain(bytes),
            (Some(_), Some(magic)) if magic == PLAIN_MAGIC => {
                Err(anyhow!("unsealed model rejected while encryption is configured"))
            }
            (None, Some(magic)) if magic == SEALED_MAGIC => {
                Err(anyhow!("sealed model cannot be opened without an encryption key"))
            }
            _ => Err(anyhow!("not a palm model")),
        }
    }
}

fn encode_plain(template: &Template) -> Result<Vec<u8>> {
    if template.features.len() > MAX_FEATURE_BLOCKS {
        return Err(anyhow!("template carries {} feature blocks", template.features.len()));
    }
    let mut out = Vec::new();
    out.extend_from_slice(PLAIN_MAGIC);
    out.extend_from_slice(template.id.as_bytes());
    out.push(template.sidedness.code() as u8);
    out.extend_from_slice(&template.quality.to_le_bytes());
    out.extend_from_slice(&template.capture_time_us.to_le_bytes());
    out.push(template.features.len() as u8);
    for block in &template.features {
        if block.values.len() > MAX_FEATURE_VALUES {
            return Err(anyhow!("feature block exceeds {} values", MAX_FEATURE_VALUES));
        }
        out.push(block.palm_type.code() as u8);
        out.extend_from_slice(&(block.values.len() as u32).to_le_bytes());
        for v in &block.values {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }
    let checksum = Sha256::digest(&out);
    out.extend_from_slice(&checksum);
    Ok(out)
}

fn decode_plain(bytes: &[u8]) -> Result<Template> {
    if bytes.len() < PLAIN_MAGIC.len() + CHECKSUM_LEN {
        return Err(anyhow!("model truncated"));
    }
    let (body, checksum) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
    let expected = Sha256::digest(body);
    if expected.as_slice() != checksum {
        return Err(anyhow!("model checksum mismatch"));
    }

    let mut cursor = PLAIN_MAGIC.len();
    let mut id = [0u8; MODEL_ID_LEN];
    id.copy_from_slice(read_slice(body, &mut cursor, MODEL_ID_LEN)?);
    let id = ModelId::from_bytes(id);
    if id.is_nil() {
        return Err(anyhow!("model id is nil"));
    }
    let sidedness = Sidedness::from_code(read_u8(body, &mut cursor)? as i8)
        .ok_or_else(|| anyhow!("invalid sidedness"))?;
    let quality = read_f32(body, &mut cursor)?;
    if !(0.0..=1.0).contains(&quality) {
        return Err(anyhow!("model quality out of range"));
    }
    let capture_time_us = i64::from_le_bytes(
        read_slice(body, &mut cursor, 8)?
            .try_into()
            .map_err(|_| anyhow!("invalid model encoding"))?,
    );

    let blocks = read_u8(body, &mut cursor)? as usize;
    if blocks > MAX_FEATURE_BLOCKS {
        return Err(anyhow!("model declares {} feature blocks", blocks));
    }
    let mut features: Vec<ModalityFeatures> = Vec::with_capacity(blocks);
    for _ in 0..blocks {
        let palm_type = PalmType::from_code(read_u8(body, &mut cursor)? as u32)
            .ok_or_else(|| anyhow!("invalid palm type"))?;
        if features.iter().any(|f| f.palm_type == palm_type) {
            return Err(anyhow!("duplicate {:?} feature block", palm_type));
        }
        let len = read_u32(body, &mut cursor)? as usize;
        if len == 0 || len > MAX_FEATURE_VALUES {
            return Err(anyhow!("feature block length {} out of range", len));
        }
        let mut values = Vec::with_capacity(len);
        for _ in 0..len {
            let v = read_f32(body, &mut cursor)?;
            if !v.is_finite() {
                return Err(anyhow!("feature value is not finite"));
            }
            values.push(v);
        }
        features.push(ModalityFeatures { palm_type, values });
    }
    if cursor != body.len() {
        return Err(anyhow!("trailing bytes after model"));
    }
    if features.is_empty() {
        return Err(anyhow!("model carries no features"));
    }

    Ok(Template {
        id,
        sidedness,
        quality,
        capture_time_us,
        features,
    })
}

fn seal(key: &[u8; 32], plain: &[u8]) -> Result<Vec<u8>> {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plain,
                aad: SEALED_MAGIC,
            },
        )
        .map_err(|_| anyhow!("model encryption failed"))?;
    let mut out = Vec::with_capacity(4 + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(SEALED_MAGIC);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn open(key: &[u8; 32], sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < SEALED_MAGIC.len() + NONCE_LEN + TAG_LEN {
        return Err(anyhow!("sealed model truncated"));
    }
    let mut cursor = SEALED_MAGIC.len();
    let nonce = read_slice(sealed, &mut cursor, NONCE_LEN)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: &sealed[cursor..],
                aad: SEALED_MAGIC,
            },
        )
        .map_err(|_| anyhow!("model decryption failed"))
}

fn read_u8(bytes: &[u8], cursor: &mut usize) -> Result<u8> {
    Ok(read_slice(bytes, cursor, 1)?[0])
}

fn read_u32(bytes: &[u8], cursor: &mut usize) -> Result<u32> {
    let slice = read_slice(bytes, cursor, 4)?;
    Ok(u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

fn read_f32(bytes: &[u8], cursor: &mut usize) -> Result<f32> {
    let slice = read_slice(bytes, cursor, 4)?;
    Ok(f32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

fn read_slice<'a>(bytes: &'a [u8], cursor: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = cursor
        .checked_add(len)
        .ok_or_else(|| anyhow!("invalid model encoding"))?;
    if end > bytes.len() {
        return Err(anyhow!("invalid model encoding"));
    }
    let out = &bytes[*cursor..end];
    *cursor = end;
    Ok(out)
}
