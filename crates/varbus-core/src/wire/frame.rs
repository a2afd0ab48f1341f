//! Fixed-header frame encoding and the tokio-util codec.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{PROTOCOL_ID, PROTOCOL_VERSION, WireError};
use crate::status::StatusCode;

/// Size of the fixed frame header in bytes.
pub const HEADER_LEN: usize = 32;

/// Maximum payload size in bytes (16 MiB), enforced before allocation.
pub const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// The fixed frame header.
///
/// The `code` and `status` fields are carried raw so that unknown request
/// codes and foreign protocol ids reach the dispatcher, which rejects the
/// request without dropping the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Protocol identifier; [`PROTOCOL_ID`] for well-formed traffic.
    pub protocol_id: u32,
    /// Protocol version.
    pub version: u16,
    /// Request or push code, raw.
    pub code: u16,
    /// Client id assigned by the server at `open` (0 before registration).
    pub client_id: u32,
    /// Request correlation id, echoed in the response. Push `Signal`
    /// frames carry the server transaction id here.
    pub txn_id: u32,
    /// First generic field; meaning implied by the code.
    pub param1: u32,
    /// Second generic field; meaning implied by the code.
    pub param2: u32,
    /// Status code; 0 in requests.
    pub status: u16,
}

impl FrameHeader {
    /// Creates a request header for the given code.
    #[must_use]
    pub const fn request(code: u16, client_id: u32, txn_id: u32) -> Self {
        Self {
            protocol_id: PROTOCOL_ID,
            version: PROTOCOL_VERSION,
            code,
            client_id,
            txn_id,
            param1: 0,
            param2: 0,
            status: 0,
        }
    }

    /// Returns `true` when the protocol id and version match this
    /// implementation.
    #[must_use]
    pub const fn is_compatible(&self) -> bool {
        self.protocol_id == PROTOCOL_ID && self.version == PROTOCOL_VERSION
    }
}

/// One wire frame: header plus payload.
#[derive(Debug, Clone)]
pub struct Frame {
    /// The fixed header.
    pub header: FrameHeader,
    /// Payload bytes; shape implied by the code.
    pub payload: Bytes,
}

impl Frame {
    /// Creates a payload-less frame.
    #[must_use]
    pub const fn new(header: FrameHeader) -> Self {
        Self {
            header,
            payload: Bytes::new(),
        }
    }

    /// Creates a frame with a payload.
    #[must_use]
    pub const fn with_payload(header: FrameHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Builds a response frame mirroring a request header.
    #[must_use]
    pub fn response(request: &FrameHeader, status: StatusCode) -> Self {
        Self::new(FrameHeader {
            protocol_id: PROTOCOL_ID,
            version: PROTOCOL_VERSION,
            code: request.code,
            client_id: request.client_id,
            txn_id: request.txn_id,
            param1: 0,
            param2: 0,
            status: status.wire(),
        })
    }

    /// Total encoded length.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// Encodes the frame into `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        dst.put_u32(self.header.protocol_id);
        dst.put_u16(self.header.version);
        dst.put_u16(self.header.code);
        dst.put_u32(self.header.client_id);
        dst.put_u32(self.header.txn_id);
        dst.put_u32(self.header.param1);
        dst.put_u32(self.header.param2);
        dst.put_u16(self.header.status);
        dst.put_u16(0); // reserved
        dst.put_u32(self.payload.len() as u32);
        dst.put_slice(&self.payload);
    }

    /// Parses one frame from `src`, consuming its bytes.
    ///
    /// Returns `Ok(None)` when `src` does not yet hold a complete frame.
    /// The length field sits at a fixed offset, so framing survives a
    /// foreign protocol id; compatibility is the dispatcher's decision.
    ///
    /// # Errors
    ///
    /// [`WireError::FrameTooLarge`] when the length field exceeds
    /// [`MAX_PAYLOAD`]; this is unrecoverable stream corruption and the
    /// connection should be dropped.
    pub fn parse(src: &mut BytesMut) -> Result<Option<Self>, WireError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let payload_len = u32::from_be_bytes([src[28], src[29], src[30], src[31]]) as usize;
        if payload_len > MAX_PAYLOAD {
            return Err(WireError::FrameTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD,
            });
        }
        if src.len() < HEADER_LEN + payload_len {
            src.reserve(HEADER_LEN + payload_len - src.len());
            return Ok(None);
        }
        let header = FrameHeader {
            protocol_id: src.get_u32(),
            version: src.get_u16(),
            code: src.get_u16(),
            client_id: src.get_u32(),
            txn_id: src.get_u32(),
            param1: src.get_u32(),
            param2: src.get_u32(),
            status: src.get_u16(),
        };
        src.advance(2); // reserved
        src.advance(4); // payload length, already read
        let payload = src.split_to(payload_len).freeze();
        Ok(Some(Self { header, payload }))
    }
}

/// tokio-util codec for [`Frame`], used by the TCP transport and the
/// framed test clients.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, WireError> {
        Frame::parse(src)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = WireError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), WireError> {
        item.encode(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::RequestCode;

    fn sample_frame() -> Frame {
        let mut header = FrameHeader::request(RequestCode::Set.wire(), 3, 17);
        header.param1 = 42;
        header.param2 = 7;
        Frame::with_payload(header, Bytes::from_static(b"payload"))
    }

    #[test]
    fn parse_handles_split_delivery() {
        let mut encoded = BytesMut::new();
        sample_frame().encode(&mut encoded);

        // Deliver one byte at a time; the parser must wait for the full
        // frame, then yield it intact.
        let mut buf = BytesMut::new();
        let mut out = None;
        for byte in encoded.iter() {
            buf.put_u8(*byte);
            if let Some(frame) = Frame::parse(&mut buf).unwrap() {
                out = Some(frame);
            }
        }
        let frame = out.expect("frame after full delivery");
        assert_eq!(frame.header, sample_frame().header);
        assert_eq!(&frame.payload[..], b"payload");
        assert!(buf.is_empty());
    }

    #[test]
    fn oversize_length_is_rejected_before_allocation() {
        let mut frame = BytesMut::new();
        sample_frame().encode(&mut frame);
        // Corrupt the length field.
        let len = (MAX_PAYLOAD as u32 + 1).to_be_bytes();
        frame[28..32].copy_from_slice(&len);
        let err = Frame::parse(&mut frame).unwrap_err();
        assert!(matches!(err, WireError::FrameTooLarge { .. }));
    }

    #[test]
    fn foreign_protocol_id_still_frames() {
        let mut frame = sample_frame();
        frame.header.protocol_id = 0xdead_beef;
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        let parsed = Frame::parse(&mut buf).unwrap().unwrap();
        assert!(!parsed.header.is_compatible());
        assert_eq!(&parsed.payload[..], b"payload");
    }

    #[test]
    fn response_mirrors_request() {
        let req = FrameHeader::request(RequestCode::Get.wire(), 9, 33);
        let resp = Frame::response(&req, StatusCode::NotFound);
        assert_eq!(resp.header.code, req.code);
        assert_eq!(resp.header.client_id, 9);
        assert_eq!(resp.header.txn_id, 33);
        assert_eq!(resp.header.status, StatusCode::NotFound.wire());
    }
}
