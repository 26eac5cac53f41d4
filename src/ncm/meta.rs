use base64::alphabet;
use base64::engine::{GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize};

use super::crypto::{aes_decode, xor_mask};
use crate::error::{NcmError, Result};

const META_MASK: u8 = 0x63;

/// Length of the literal `163 key(Don't modify):`.
const META_PREFIX_LEN: usize = 22;

/// Length of the literal `music:` in front of the JSON.
const JSON_PREFIX_LEN: usize = 6;

/// Extension of the container itself, never a valid output format.
const CONTAINER_EXTENSION: &str = "ncm";

/// Standard alphabet that also takes non-zero bits after the last full byte.
const META_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_allow_trailing_bits(true),
);

/// Identifier that shows up as either a JSON number or a JSON string.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum NcmId {
    Number(u64),
    Text(String),
}

impl Default for NcmId {
    fn default() -> Self {
        NcmId::Number(0)
    }
}

impl std::fmt::Display for NcmId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NcmId::Number(n) => write!(f, "{}", n),
            NcmId::Text(s) => f.write_str(s),
        }
    }
}

/// `[name, id]` as stored in the `artist` array.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Artist(pub String, pub NcmId);

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct TrackMetadata {
    #[serde(deserialize_with = "nullable")]
    pub music_id: NcmId,

    #[serde(deserialize_with = "nullable")]
    pub music_name: String,

    #[serde(deserialize_with = "nullable")]
    pub artist: Vec<Artist>,

    #[serde(deserialize_with = "nullable")]
    pub album_id: NcmId,

    #[serde(deserialize_with = "nullable")]
    pub album: String,

    /// Internal document id of the cover, number or string.
    pub album_pic_doc_id: Option<NcmId>,

    /// Remote URL of the cover.
    #[serde(deserialize_with = "nullable")]
    pub album_pic: String,

    #[serde(deserialize_with = "nullable")]
    pub bitrate: u64,

    #[serde(deserialize_with = "nullable")]
    pub mp3_doc_id: NcmId,

    #[serde(deserialize_with = "nullable")]
    pub duration: u64,

    #[serde(deserialize_with = "nullable")]
    pub mv_id: NcmId,

    #[serde(deserialize_with = "nullable")]
    pub alias: Vec<String>,

    #[serde(deserialize_with = "nullable")]
    pub trans_names: Vec<String>,

    /// Extension of the recovered audio, e.g. `mp3` or `flac`.
    pub format: String,
}

impl TrackMetadata {
    pub fn artist_names(&self) -> Vec<String> {
        self.artist.iter().map(|Artist(name, _)| name.clone()).collect()
    }

    fn validate(self) -> Result<Self> {
        let ok = !self.format.is_empty()
            && self.format.len() <= 8
            && self.format.bytes().all(|b| b.is_ascii_alphanumeric())
            && !self.format.eq_ignore_ascii_case(CONTAINER_EXTENSION);
        if !ok {
            return Err(NcmError::MetadataParse(format!(
                "format {:?} is not an audio extension",
                self.format
            )));
        }
        Ok(self)
    }
}

fn nullable<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// Deobfuscates, decrypts and parses the metadata block.
///
/// Every failure is reported as [`NcmError::MetadataParse`] so the caller can
/// keep recovering the audio.
pub fn decode_meta_block(raw: &[u8], modify_key: &[u8; 16]) -> Result<TrackMetadata> {
    if raw.len() < META_PREFIX_LEN {
        return Err(NcmError::MetadataParse(format!(
            "block has {} bytes, shorter than its prefix",
            raw.len()
        )));
    }

    let masked = xor_mask(raw, META_MASK);

    let decoded = META_BASE64
        .decode(&masked[META_PREFIX_LEN..])
        .map_err(|e| NcmError::MetadataParse(format!("base64: {}", e)))?;

    let decrypted = aes_decode(&decoded, modify_key)
        .map_err(|e| NcmError::MetadataParse(e.to_string()))?;

    if decrypted.len() < JSON_PREFIX_LEN {
        return Err(NcmError::MetadataParse("decrypted block is too short".into()));
    }

    let meta: TrackMetadata = serde_json::from_slice(&decrypted[JSON_PREFIX_LEN..])
        .map_err(|e| NcmError::MetadataParse(format!("json: {}", e)))?;

    meta.validate()
}

#[cfg(test)]
pub(crate) fn encode_meta_block(json: &str, modify_key: &[u8; 16]) -> Vec<u8> {
    let mut plaintext = b"music:".to_vec();
    plaintext.extend_from_slice(json.as_bytes());
    let encrypted = super::crypto::aes_encode(&plaintext, modify_key);

    let mut block = b"163 key(Don't modify):".to_vec();
    block.extend_from_slice(base64::prelude::BASE64_STANDARD.encode(encrypted).as_bytes());
    xor_mask(&block, META_MASK)
}
