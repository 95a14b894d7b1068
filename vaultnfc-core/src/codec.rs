use anyhow::{Result, ensure};
use bytes::{Buf, BufMut, BytesMut};

use crate::error::TransferError;
use crate::record::CredentialRecord;

/// ASCII magic bytes that open every VaultNFC frame.
const MAGIC: &[u8; 4] = b"VNFC";
/// Frame version understood by this build.
const VERSION: u8 = 0x01;
/// Total header size: magic(4) + version(1) + length(4).
pub const HEADER_LEN: usize = 9;
/// Upper bound on a single frame payload.  One credential record is a few
/// hundred bytes.
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 4;
const OFF_LENGTH: usize = 5;

// ── Record payload ──────────────────────────────────────────────────

/// Encodes a record as a self-contained JSON document.
///
/// # Errors
///
/// Returns [`TransferError::Encode`] if serialization fails.
pub fn encode(record: &CredentialRecord) -> Result<Vec<u8>, TransferError> {
    serde_json::to_vec(record).map_err(|e| TransferError::Encode(e.to_string()))
}

/// Exact inverse of [`encode`].
///
/// # Errors
///
/// Returns [`TransferError::Decode`] if `bytes` is not valid JSON or does not
/// have the shape of a record.
pub fn decode(bytes: &[u8]) -> Result<CredentialRecord, TransferError> {
    serde_json::from_slice(bytes).map_err(|e| TransferError::Decode(e.to_string()))
}

// ── Framing ─────────────────────────────────────────────────────────

/// Appends the frame header followed by `payload` to `buf`.
///
/// # Errors
///
/// Returns an error if `payload` exceeds [`MAX_PAYLOAD_LEN`].
pub fn encode_frame(payload: &[u8], buf: &mut BytesMut) -> Result<()> {
    ensure!(
        payload.len() <= MAX_PAYLOAD_LEN,
        "payload too large: {} bytes (max {MAX_PAYLOAD_LEN})",
        payload.len()
    );
    buf.reserve(HEADER_LEN + payload.len());
    buf.put_slice(MAGIC);
    buf.put_u8(VERSION);
    #[allow(clippy::cast_possible_truncation)] // bounded by MAX_PAYLOAD_LEN
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    Ok(())
}

/// Convenience wrapper that allocates and returns a new `BytesMut`.
///
/// # Errors
///
/// Returns an error if `payload` exceeds [`MAX_PAYLOAD_LEN`].
pub fn encode_frame_to_bytes(payload: &[u8]) -> Result<BytesMut> {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    encode_frame(payload, &mut buf)?;
    Ok(buf)
}

/// Attempts to take one complete frame payload off the front of `buf`.
///
/// * `Ok(Some(payload))`: a full frame was present and has been consumed.
/// * `Ok(None)`: not enough bytes yet; `buf` is left untouched.
/// * `Err(..)`: bad magic, unsupported version or oversized payload.  The
///   stream cannot be resynchronised and should be closed.
///
/// # Errors
///
/// Returns an error on any of the protocol violations listed above.
///
/// # Panics
///
/// Cannot panic. The slice conversion is guarded by the `HEADER_LEN` check.
pub fn try_decode_frame(buf: &mut BytesMut) -> Result<Option<BytesMut>> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }

    ensure!(
        &buf[OFF_MAGIC..OFF_MAGIC + MAGIC.len()] == MAGIC,
        "bad magic: expected VNFC"
    );

    let version = buf[OFF_VERSION];
    ensure!(version == VERSION, "unsupported version: 0x{version:02X}");

    let payload_len = u32::from_be_bytes(
        buf[OFF_LENGTH..OFF_LENGTH + 4]
            .try_into()
            .expect("length slice is exactly 4 bytes"),
    ) as usize;

    ensure!(
        payload_len <= MAX_PAYLOAD_LEN,
        "payload too large: {payload_len} bytes (max {MAX_PAYLOAD_LEN})"
    );

    if buf.len() < HEADER_LEN + payload_len {
        return Ok(None);
    }

    buf.advance(HEADER_LEN);
    Ok(Some(buf.split_to(payload_len)))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn sample_record() -> CredentialRecord {
        CredentialRecord {
            id: "doc-17".into(),
            title: "Bank".into(),
            username: "alice@example.com".into(),
            encrypted_password: "aGVsbG8=".into(),
            uri: "https://bank.example".into(),
            notes: "PIN is on the card ✓\nsecond line".into(),
            created_at: chrono::Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap(),
            modified_at: chrono::Utc::now(),
            iv: "MTIzNDU2Nzg5MDEy".into(),
        }
    }

    /// Given a full record, when encoded and decoded, then every field survives.
    #[test]
    fn given_record_when_encoded_and_decoded_then_every_field_survives() {
        let record = sample_record();
        let bytes = encode(&record).unwrap();
        assert_eq!(decode(&bytes).unwrap(), record);
    }

    /// Given a record with no id, when encoded and decoded, then the id stays empty.
    #[test]
    fn given_unsaved_record_when_round_tripped_then_empty_id_is_kept() {
        let record = CredentialRecord::new("Wifi", "", "cGFzcw==", "");
        let decoded = decode(&encode(&record).unwrap()).unwrap();
        assert_eq!(decoded, record);
        assert!(!decoded.is_persisted());
    }

    /// Given bytes that are not JSON, when decoded, then a decode error is returned.
    #[test]
    fn given_garbage_when_decoded_then_returns_decode_error() {
        let err = decode(b"not json at all").unwrap_err();
        assert!(matches!(err, TransferError::Decode(_)));
    }

    /// Given JSON that is not a record, when decoded, then a decode error is returned.
    #[test]
    fn given_json_of_wrong_shape_when_decoded_then_returns_decode_error() {
        let err = decode(br#"{"device_name":"oops"}"#).unwrap_err();
        assert!(matches!(err, TransferError::Decode(_)));
    }

    /// Given a payload, when framed, then the header comes first.
    #[test]
    fn given_payload_when_framed_then_header_precedes_payload() {
        let framed = encode_frame_to_bytes(b"abc").unwrap();
        assert_eq!(&framed[..4], b"VNFC");
        assert_eq!(framed[4], VERSION);
        assert_eq!(&framed[5..9], &3u32.to_be_bytes());
        assert_eq!(&framed[9..], b"abc");
    }

    /// Given half a header, when decoded, then nothing is returned and the bytes are kept.
    #[test]
    fn given_partial_header_when_decoded_then_returns_none_and_keeps_bytes() {
        let full = encode_frame_to_bytes(b"{}").unwrap();
        let mut buf = BytesMut::from(&full[..6]);
        assert!(try_decode_frame(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 6);
    }

    /// Given a frame split across reads, when decoded, then the payload is reassembled.
    #[test]
    fn given_payload_split_across_reads_when_decoded_then_reassembles() {
        let record = sample_record();
        let payload = encode(&record).unwrap();
        let full = encode_frame_to_bytes(&payload).unwrap();

        let mut accum = BytesMut::new();
        let mut decoded = None;
        for chunk in full.chunks(7) {
            accum.extend_from_slice(chunk);
            if let Some(frame) = try_decode_frame(&mut accum).unwrap() {
                decoded = Some(frame);
            }
        }

        let frame = decoded.expect("frame should complete on the last chunk");
        assert_eq!(decode(&frame).unwrap(), record);
        assert!(accum.is_empty());
    }

    /// Given two frames in one read, when decoded, then both come out in order.
    #[test]
    fn given_two_coalesced_frames_when_decoded_then_both_are_returned_in_order() {
        let mut buf = encode_frame_to_bytes(b"first").unwrap();
        encode_frame(b"second", &mut buf).unwrap();

        assert_eq!(&try_decode_frame(&mut buf).unwrap().unwrap()[..], b"first");
        assert_eq!(&try_decode_frame(&mut buf).unwrap().unwrap()[..], b"second");
        assert!(try_decode_frame(&mut buf).unwrap().is_none());
    }

    /// Given a header with the wrong magic, when decoded, then an error is returned.
    #[test]
    fn given_bad_magic_when_decoded_then_returns_error() {
        let mut buf = BytesMut::from(&b"XXXX\x01\x00\x00\x00\x00"[..]);
        let err = try_decode_frame(&mut buf).unwrap_err();
        assert!(err.to_string().contains("bad magic"));
    }

    /// Given an unknown frame version, when decoded, then an error is returned.
    #[test]
    fn given_unsupported_version_when_decoded_then_returns_error() {
        let mut buf = BytesMut::from(&b"VNFC\x09\x00\x00\x00\x00"[..]);
        let err = try_decode_frame(&mut buf).unwrap_err();
        assert!(err.to_string().contains("unsupported version"));
    }

    /// Given a length above the limit, when decoded, then an error is returned.
    #[test]
    fn given_oversized_length_when_decoded_then_returns_error() {
        let mut buf = BytesMut::from(&b"VNFC\x01\xFF\xFF\xFF\xFF"[..]);
        let err = try_decode_frame(&mut buf).unwrap_err();
        assert!(err.to_string().contains("payload too large"));
    }

    /// Given a payload above the limit, when framed, then an error is returned.
    #[test]
    fn given_oversized_payload_when_framed_then_returns_error() {
        let payload = vec![0u8; MAX_PAYLOAD_LEN + 1];
        assert!(encode_frame_to_bytes(&payload).is_err());
    }
}
