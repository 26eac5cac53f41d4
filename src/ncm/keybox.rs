use crate::error::{NcmError, Result};

/// 256-entry permutation driving the audio descrambler.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyBox {
    trunk: [u8; 256],
}

impl KeyBox {
    /// RC4-style key schedule over the raw key material. Run once per file.
    pub fn ksa(key: &[u8]) -> Result<KeyBox> {
        if key.is_empty() {
            return Err(NcmError::Crypto("key material is empty".into()));
        }

        let mut trunk = [0u8; 256];
        for (i, slot) in trunk.iter_mut().enumerate() {
            *slot = i as u8;
        }

        let mut last = 0u8;
        let mut offset = 0;
        for i in 0..256 {
            let c = trunk[i].wrapping_add(last).wrapping_add(key[offset]);
            offset += 1;
            if offset == key.len() {
                offset = 0;
            }
            trunk.swap(i, c as usize);
            last = c;
        }

        Ok(KeyBox { trunk })
    }

    pub fn as_bytes(&self) -> &[u8; 256] {
        &self.trunk
    }

    /// Keystream byte for the payload byte at `offset`.
    #[inline]
    pub fn stream_byte(&self, offset: u64) -> u8 {
        let j = ((offset + 1) & 0xff) as u8;
        let a = self.trunk[j as usize];
        let b = self.trunk[a.wrapping_add(j) as usize];
        self.trunk[a.wrapping_add(b) as usize]
    }

    /// XORs `data` in place, `offset` being the position of `data[0]` in the payload.
    pub fn prga(&self, data: &mut [u8], offset: u64) {
        for (k, byte) in data.iter_mut().enumerate() {
            *byte ^= self.stream_byte(offset + k as u64);
        }
    }
}

impl std::fmt::Debug for KeyBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyBox").finish_non_exhaustive()
    }
}
