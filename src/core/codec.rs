//! Datagram codec for [`Frame`]s.
//!
//! Link frames are self-delimiting datagrams, so one `decode` call consumes the
//! whole buffer. The buffer is taken before parsing: a malformed frame is
//! reported once and never re-read by a framed stream.
//!
//! Frames built by an endpoint are already encoded when they reach the
//! transport, so the encoder also accepts raw frame bytes.

use crate::core::packet::Frame;
use crate::error::MxError;
use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl Encoder<Frame> for FrameCodec {
    type Error = MxError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst);
        Ok(())
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = MxError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = MxError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        let datagram = src.split().freeze();
        Frame::from_bytes(datagram).map(Some)
    }
}
