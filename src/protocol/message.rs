//! Handshake request framing.
//!
//! The configuration request is the radio's "want config" frame: a single
//! protobuf-style field (number 3, varint wire type) carrying the nonce.
//!
//! ```text
//! ┌──────┬──────────────────────┐
//! │ 0x18 │ nonce (LEB128, 1-5B) │
//! └──────┴──────────────────────┘
//! ```

use bytes::Bytes;
use rand::Rng;

use crate::error::{LinkError, Result};

/// Field 3, wire type 0.
pub const WANT_CONFIG_TAG: u8 = 3 << 3;

/// Outbound configuration request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeRequest {
    nonce: u32,
}

impl HandshakeRequest {
    /// Request with a fresh random nonce. Zero is reserved by the firmware.
    pub fn generate() -> Self {
        let nonce = rand::thread_rng().gen_range(1..=u32::MAX);
        Self { nonce }
    }

    /// Request with a caller-chosen nonce.
    pub fn with_nonce(nonce: u32) -> Result<Self> {
        if nonce == 0 {
            return Err(LinkError::InvalidMessage(
                "handshake nonce must be non-zero".to_string(),
            ));
        }
        Ok(Self { nonce })
    }

    /// Correlation token.
    pub fn nonce(&self) -> u32 {
        self.nonce
    }

    /// Encode as the want-config frame.
    pub fn encode(&self) -> Bytes {
        let mut buf = Vec::with_capacity(6);
        buf.push(WANT_CONFIG_TAG);
        write_varint_vec(&mut buf, u64::from(self.nonce));
        Bytes::from(buf)
    }

    /// Decode a want-config frame.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let (&tag, rest) = data
            .split_first()
            .ok_or_else(|| LinkError::InvalidMessage("empty handshake frame".to_string()))?;
        if tag != WANT_CONFIG_TAG {
            return Err(LinkError::InvalidMessage(format!(
                "unexpected field tag 0x{tag:02x}"
            )));
        }

        let (value, used) = read_varint_slice(rest)?;
        if used != rest.len() {
            return Err(LinkError::InvalidMessage(format!(
                "{} trailing bytes after nonce",
                rest.len() - used
            )));
        }
        let nonce = u32::try_from(value)
            .map_err(|_| LinkError::InvalidMessage(format!("nonce {value} exceeds u32")))?;
        Self::with_nonce(nonce)
    }
}

/// Write a variable-length integer to a Vec<u8>
fn write_varint_vec(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Read a variable-length integer from a byte slice, returning (value, bytes_consumed)
fn read_varint_slice(data: &[u8]) -> Result<(u64, usize)> {
    let mut result: u64 = 0;
    let mut shift = 0;
    let mut pos = 0;

    loop {
        let byte = *data.get(pos).ok_or_else(|| {
            LinkError::InvalidMessage("VarInt: unexpected end of data".to_string())
        })?;
        pos += 1;

        result |= u64::from(byte & 0x7F) << shift;

        if byte & 0x80 == 0 {
            break;
        }

        shift += 7;
        if shift >= 64 {
            return Err(LinkError::InvalidMessage("VarInt overflow".to_string()));
        }
    }

    Ok((result, pos))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_known_nonce() {
        let req = HandshakeRequest::with_nonce(300).unwrap();
        assert_eq!(req.encode().as_ref(), &[0x18, 0xAC, 0x02]);
    }

    #[test]
    fn test_decode_max_nonce() {
        let req = HandshakeRequest::with_nonce(u32::MAX).unwrap();
        let bytes = req.encode();
        assert_eq!(bytes.len(), 6);
        assert_eq!(HandshakeRequest::decode(&bytes).unwrap(), req);
    }

    #[test]
    fn test_generated_nonce_non_zero() {
        for _ in 0..64 {
            assert_ne!(HandshakeRequest::generate().nonce(), 0);
        }
    }

    #[test]
    fn test_zero_nonce_rejected() {
        assert!(HandshakeRequest::with_nonce(0).is_err());
        assert!(HandshakeRequest::decode(&[0x18, 0x00]).is_err());
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(HandshakeRequest::decode(&[]).is_err());
        assert!(HandshakeRequest::decode(&[0x10, 0x01]).is_err());
        // Truncated varint
        assert!(HandshakeRequest::decode(&[0x18, 0x80]).is_err());
        // Trailing garbage
        assert!(HandshakeRequest::decode(&[0x18, 0x01, 0x00]).is_err());
        // Exceeds u32
        assert!(HandshakeRequest::decode(&[0x18, 0x80, 0x80, 0x80, 0x80, 0x10]).is_err());
    }
}
