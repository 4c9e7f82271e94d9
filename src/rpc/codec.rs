//! Frame layout and codec
//!
//! On the wire every frame is a `u32` big-endian length followed by the body. The body
//! starts with a `u32` big-endian header length, then the JSON header, then the raw
//! payload bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::{Metadata, Status};
use crate::error::TransportError;

/// Largest frame either side accepts.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const HEADER_LEN_PREFIX: usize = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FrameHeader {
    /// Host asks for a named service.
    Dispense { id: u64, service: String },
    /// Plugin confirms the service and lists its call capabilities.
    Dispensed {
        id: u64,
        service: String,
        capabilities: Vec<String>,
    },
    Request {
        id: u64,
        service: String,
        method: String,
        #[serde(default)]
        metadata: Metadata,
    },
    Response { id: u64, status: Status },
    /// Host abandoned the call with this id.
    Cancel { id: u64 },
}

impl FrameHeader {
    pub fn id(&self) -> u64 {
        match self {
            FrameHeader::Dispense { id, .. }
            | FrameHeader::Dispensed { id, .. }
            | FrameHeader::Request { id, .. }
            | FrameHeader::Response { id, .. }
            | FrameHeader::Cancel { id } => *id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FrameHeader::Dispense { .. } => "dispense",
            FrameHeader::Dispensed { .. } => "dispensed",
            FrameHeader::Request { .. } => "request",
            FrameHeader::Response { .. } => "response",
            FrameHeader::Cancel { .. } => "cancel",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(header: FrameHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }

    pub fn dispense(id: u64, service: &str) -> Self {
        Self::new(
            FrameHeader::Dispense {
                id,
                service: service.to_string(),
            },
            Bytes::new(),
        )
    }

    pub fn dispensed(id: u64, service: &str, capabilities: Vec<String>) -> Self {
        Self::new(
            FrameHeader::Dispensed {
                id,
                service: service.to_string(),
                capabilities,
            },
            Bytes::new(),
        )
    }

    pub fn request(id: u64, service: &str, method: &str, metadata: Metadata, payload: Bytes) -> Self {
        Self::new(
            FrameHeader::Request {
                id,
                service: service.to_string(),
                method: method.to_string(),
                metadata,
            },
            payload,
        )
    }

    pub fn response(id: u64, status: Status, payload: Bytes) -> Self {
        Self::new(FrameHeader::Response { id, status }, payload)
    }

    pub fn cancel(id: u64) -> Self {
        Self::new(FrameHeader::Cancel { id }, Bytes::new())
    }

    /// Size of the encoded body, or `FrameTooLarge` if it exceeds [`MAX_FRAME_LEN`].
    pub fn checked_len(&self) -> Result<usize, TransportError> {
        let header = encode_header(&self.header)?;
        checked_body_len(header.len(), self.payload.len())
    }
}

fn encode_header(header: &FrameHeader) -> Result<Vec<u8>, TransportError> {
    serde_json::to_vec(header)
        .map_err(|e| TransportError::InvalidFrame(format!("cannot encode header: {e}")))
}

fn checked_body_len(header_len: usize, payload_len: usize) -> Result<usize, TransportError> {
    let size = HEADER_LEN_PREFIX + header_len + payload_len;
    if size > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge {
            size,
            limit: MAX_FRAME_LEN,
        });
    }
    Ok(size)
}

/// Codec for [`Frame`]s on top of `LengthDelimitedCodec`.
#[derive(Debug)]
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_LEN)
                .new_codec(),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, TransportError> {
        let Some(mut body) = self.inner.decode(src)? else {
            return Ok(None);
        };

        if body.len() < HEADER_LEN_PREFIX {
            return Err(TransportError::InvalidFrame(
                "frame shorter than header length prefix".into(),
            ));
        }

        let header_len = body.get_u32() as usize;
        if header_len > body.len() {
            return Err(TransportError::InvalidFrame(format!(
                "header length {} exceeds frame body of {} bytes",
                header_len,
                body.len()
            )));
        }

        let header_bytes = body.split_to(header_len);
        let header: FrameHeader = serde_json::from_slice(&header_bytes)
            .map_err(|e| TransportError::InvalidFrame(format!("bad frame header: {e}")))?;

        Ok(Some(Frame {
            header,
            payload: body.freeze(),
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = TransportError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), TransportError> {
        let header = encode_header(&frame.header)?;
        let size = checked_body_len(header.len(), frame.payload.len())?;

        let mut body = BytesMut::with_capacity(size);
        body.put_u32(header.len() as u32);
        body.put_slice(&header);
        body.put_slice(&frame.payload);

        self.inner
            .encode(body.freeze(), dst)
            .map_err(|e| TransportError::InvalidFrame(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(frame: Frame) -> BytesMut {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_decode_waits_for_complete_frame() {
        let mut metadata = Metadata::new();
        metadata.append("x-tenant", "acme");
        let frame = Frame::request(7, "projects", "QueryProjects", metadata, Bytes::from_static(b"\x00\x01binary"));
        let bytes = encoded(frame.clone());

        let mut codec = FrameCodec::new();
        let mut partial = BytesMut::from(&bytes[..bytes.len() - 3]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&bytes[bytes.len() - 3..]);
        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(partial.is_empty());
    }

    #[test]
    fn test_header_is_tagged_json() {
        let bytes = encoded(Frame::cancel(3));
        // 4 bytes outer length, 4 bytes header length, then the header itself
        let header = std::str::from_utf8(&bytes[8..]).unwrap();
        assert_eq!(header, r#"{"type":"cancel","id":3}"#);
    }

    #[test]
    fn test_rejects_header_longer_than_body() {
        let mut body = BytesMut::new();
        body.put_u32(100);
        body.put_slice(b"{}");
        let mut framed = BytesMut::new();
        LengthDelimitedCodec::new()
            .encode(body.freeze(), &mut framed)
            .unwrap();

        let err = FrameCodec::new().decode(&mut framed).unwrap_err();
        assert!(matches!(err, TransportError::InvalidFrame(_)));
    }

    #[test]
    fn test_rejects_oversized_payload() {
        let payload = Bytes::from(vec![0u8; MAX_FRAME_LEN]);
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        let err = codec
            .encode(Frame::response(1, Status::ok(), payload), &mut buf)
            .unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge { .. }));
        assert!(err.is_frame_error());
    }

    #[test]
    fn test_checked_len_counts_header_and_payload() {
        let frame = Frame::cancel(3);
        let header_len = r#"{"type":"cancel","id":3}"#.len();
        assert_eq!(frame.checked_len().unwrap(), 4 + header_len);

        let fits = Frame::response(1, Status::ok(), Bytes::from(vec![0u8; MAX_FRAME_LEN - 1024]));
        assert!(fits.checked_len().is_ok());

        let over = Frame::response(1, Status::ok(), Bytes::from(vec![0u8; MAX_FRAME_LEN]));
        assert!(matches!(
            over.checked_len(),
            Err(TransportError::FrameTooLarge { limit: MAX_FRAME_LEN, .. })
        ));
    }
}
