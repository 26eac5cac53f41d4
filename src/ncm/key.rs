use super::crypto::{aes_decode, xor_mask};
use crate::error::{NcmError, Result};

const KEY_MASK: u8 = 0x64;

/// Length of the literal `neteasecloudmusic` in front of the key material.
const KEY_PREFIX_LEN: usize = 17;

/// Recovers the raw key material that seeds the keystream table.
pub fn decode_key_block(raw: &[u8], core_key: &[u8; 16]) -> Result<Vec<u8>> {
    let masked = xor_mask(raw, KEY_MASK);

    let decrypted = aes_decode(&masked, core_key)?;

    if decrypted.len() < KEY_PREFIX_LEN {
        return Err(NcmError::Crypto(format!(
            "key block decrypts to {} bytes, shorter than its {} byte prefix",
            decrypted.len(),
            KEY_PREFIX_LEN
        )));
    }

    Ok(decrypted[KEY_PREFIX_LEN..].to_vec())
}

#[cfg(test)]
pub(crate) fn encode_key_block(key_material: &[u8], core_key: &[u8; 16]) -> Vec<u8> {
    let mut plaintext = b"neteasecloudmusic".to_vec();
    plaintext.extend_from_slice(key_material);
    xor_mask(&super::crypto::aes_encode(&plaintext, core_key), KEY_MASK)
}
