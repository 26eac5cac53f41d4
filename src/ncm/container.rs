//! Outer layout of an ncm container.
//!
//! ```text
//! magic1 u32 | magic2 u32 | reserved [2]
//! key_len u32 | key block
//! meta_len u32 | meta block
//! crc32 u32 | reserved [5]
//! image_len u32 | image
//! audio payload ...
//! ```
//!
//! All integers are little-endian. The payload is left in the reader so it
//! can be streamed.

use std::io::{self, Read};

use tracing::debug;

use crate::error::{NcmError, Result};

pub const MAGIC1: u32 = 0x4E45_5443;
pub const MAGIC2: u32 = 0x4D41_4446;

pub struct NcmContainer<R> {
    pub key_block: Vec<u8>,
    pub meta_block: Vec<u8>,
    /// Stored in the file, never validated.
    pub crc32: u32,
    pub image: Option<Vec<u8>>,
    /// Positioned at the first payload byte.
    pub audio: R,
}

pub fn read_container<R: Read>(mut source: R) -> Result<NcmContainer<R>> {
    magic_header(&mut source)?;

    skip(&mut source, 2, "header")?;

    let key_block = length_prefixed(&mut source, "key")?;
    let meta_block = length_prefixed(&mut source, "metadata")?;

    let crc32 = get_length(&mut source, "checksum")?;
    skip(&mut source, 5, "reserved")?;

    let image = length_prefixed(&mut source, "image")?;

    debug!(
        key = key_block.len(),
        meta = meta_block.len(),
        image = image.len(),
        "container blocks read"
    );

    Ok(NcmContainer {
        key_block,
        meta_block,
        crc32,
        image: (!image.is_empty()).then_some(image),
        audio: source,
    })
}

fn magic_header<R: Read>(source: &mut R) -> Result<()> {
    let mut header = [0u8; 8];
    read_full(source, &mut header, "header").map_err(|e| match e {
        NcmError::TruncatedInput { .. } => NcmError::Format("file is shorter than its signature".into()),
        e => e,
    })?;

    let magic1 = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let magic2 = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

    if magic1 != MAGIC1 {
        return Err(NcmError::Format(format!("first signature word is {:#010x}", magic1)));
    }
    if magic2 != MAGIC2 {
        return Err(NcmError::Format(format!("second signature word is {:#010x}", magic2)));
    }

    Ok(())
}

fn get_length<R: Read>(source: &mut R, block: &'static str) -> Result<u32> {
    let mut buffer = [0u8; 4];
    read_full(source, &mut buffer, block)?;
    Ok(u32::from_le_bytes(buffer))
}

fn length_prefixed<R: Read>(source: &mut R, block: &'static str) -> Result<Vec<u8>> {
    let declared = get_length(source, block)? as u64;

    // Grows with what is actually there, so a bogus length cannot force a huge allocation.
    let mut buffer = Vec::new();
    source
        .by_ref()
        .take(declared)
        .read_to_end(&mut buffer)
        .map_err(NcmError::Read)?;

    if (buffer.len() as u64) < declared {
        return Err(NcmError::TruncatedInput {
            block,
            declared,
            available: buffer.len() as u64,
        });
    }

    Ok(buffer)
}

fn skip<R: Read>(source: &mut R, count: usize, block: &'static str) -> Result<()> {
    let mut buffer = [0u8; 8];
    read_full(source, &mut buffer[..count], block)
}

fn read_full<R: Read>(source: &mut R, buffer: &mut [u8], block: &'static str) -> Result<()> {
    let mut filled = 0;
    while filled < buffer.len() {
        match source.read(&mut buffer[filled..]) {
            Ok(0) => {
                return Err(NcmError::TruncatedInput {
                    block,
                    declared: buffer.len() as u64,
                    available: filled as u64,
                })
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(NcmError::Read(e)),
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) fn write_container(key: &[u8], meta: &[u8], image: &[u8], audio: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC1.to_le_bytes());
    out.extend_from_slice(&MAGIC2.to_le_bytes());
    out.extend_from_slice(&[0x01, 0x70]);
    for block in [key, meta] {
        out.extend_from_slice(&(block.len() as u32).to_le_bytes());
        out.extend_from_slice(block);
    }
    out.extend_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
    out.extend_from_slice(&[0u8; 5]);
    out.extend_from_slice(&(image.len() as u32).to_le_bytes());
    out.extend_from_slice(image);
    out.extend_from_slice(audio);
    out
}
