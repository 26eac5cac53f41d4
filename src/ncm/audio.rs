use std::io::{self, Read, Write};

use super::keybox::KeyBox;
use crate::error::{NcmError, Result};

/// Read size for the payload. A multiple of 256, so chunk-local and
/// payload-global keystream offsets coincide.
pub const CHUNK_SIZE: usize = 0x8000;

/// Streams the scrambled payload from `input` to `output`, one chunk at a
/// time. Only the bytes each read actually returned are transformed and
/// written. Returns the number of bytes written.
///
/// On failure whatever was already written stays in `output`.
pub fn music_data<R: Read, W: Write>(key_box: &KeyBox, input: &mut R, output: &mut W) -> Result<u64> {
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut offset = 0u64;

    loop {
        let len = match input.read(&mut buffer) {
            Ok(0) => break,
            Ok(len) => len,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(NcmError::Read(e)),
        };

        let chunk = &mut buffer[..len];
        key_box.prga(chunk, offset);
        output.write_all(chunk).map_err(NcmError::Write)?;

        offset += len as u64;
    }

    output.flush().map_err(NcmError::Write)?;

    Ok(offset)
}
