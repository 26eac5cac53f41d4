//! AES-128-ECB, XOR masking and padding primitives shared by the key and
//! metadata decoders. Every function returns a fresh buffer.

use aes::Aes128;
use block_modes::block_padding::NoPadding;
use block_modes::{BlockMode, Ecb};

use crate::error::{NcmError, Result};

pub const BLOCK_SIZE: usize = 16;

type Aes128Ecb = Ecb<Aes128, NoPadding>;

pub fn xor_mask(data: &[u8], mask: u8) -> Vec<u8> {
    data.iter().map(|byte| byte ^ mask).collect()
}

/// Largest prefix whose length is a whole number of cipher blocks.
pub fn fix_block_size(data: &[u8]) -> &[u8] {
    &data[..data.len() / BLOCK_SIZE * BLOCK_SIZE]
}

/// Drops the trailing N bytes, N being the value of the last byte.
/// The padding bytes themselves are not checked.
pub fn pkcs7_unpad(mut data: Vec<u8>) -> Result<Vec<u8>> {
    let Some(&last) = data.last() else {
        return Ok(data);
    };

    let padding = last as usize;
    if padding > data.len() {
        return Err(NcmError::Crypto(format!(
            "padding of {} bytes exceeds the {} decrypted bytes",
            padding,
            data.len()
        )));
    }

    data.truncate(data.len() - padding);
    Ok(data)
}

/// Truncate to whole blocks, decrypt each block independently, then unpad.
pub fn aes_decode(ciphertext: &[u8], key: &[u8; 16]) -> Result<Vec<u8>> {
    let cipher = Aes128Ecb::new_from_slices(key, &[])
        .map_err(|e| NcmError::Crypto(format!("key setup: {}", e)))?;

    let plaintext = cipher
        .decrypt_vec(fix_block_size(ciphertext))
        .map_err(|e| NcmError::Crypto(format!("block decrypt: {}", e)))?;

    pkcs7_unpad(plaintext)
}

#[cfg(test)]
pub(crate) fn aes_encode(plaintext: &[u8], key: &[u8; 16]) -> Vec<u8> {
    use block_modes::block_padding::Pkcs7;

    Ecb::<Aes128, Pkcs7>::new_from_slices(key, &[])
        .unwrap()
        .encrypt_vec(plaintext)
}
