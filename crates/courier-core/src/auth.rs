use crate::error::{Error, Result};
use courier_protocol::PSK_LEN;

/// A preshared key: exactly 16 bytes of material.
///
/// Comparison trims leading and trailing ASCII whitespace on both sides
/// before the byte-for-byte check.  The original protocol compared trimmed
/// string forms, so a key padded with spaces still matches its unpadded
/// form; preserved for wire compatibility.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PskKey([u8; PSK_LEN]);

impl PskKey {
    /// Build a key from exactly 16 bytes of material.
    pub fn new(material: impl AsRef<[u8]>) -> Result<Self> {
        let material = material.as_ref();
        let bytes: [u8; PSK_LEN] = material.try_into().map_err(|_| {
            Error::Config(format!(
                "preshared key must be exactly {PSK_LEN} bytes, got {}",
                material.len()
            ))
        })?;
        Ok(PskKey(bytes))
    }

    pub fn as_bytes(&self) -> [u8; PSK_LEN] {
        self.0
    }

    /// Whether `presented` matches this key under the trimmed comparison.
    pub fn matches(&self, presented: &[u8]) -> bool {
        trim_ascii(presented) == trim_ascii(&self.0)
    }
}

// Keys never appear in logs.
impl std::fmt::Debug for PskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PskKey(..)")
    }
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}
