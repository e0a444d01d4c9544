use std::io::{Error, ErrorKind};

use bytes::{Buf, BufMut, BytesMut};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder, Framed};

use crate::message::Message;

pub type MessageProtocol = Framed<TcpStream, MessageCodec>;

/// Frames are newline-delimited JSON objects, one message per line
#[derive(Debug, Default)]
pub struct MessageCodec;

impl MessageCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Error> {
        if let Some(end) = find_frame_end(buf) {
            let frame = buf.split_to(end + 1);
            let message = serde_json::from_slice(&frame[..end])
                .map_err(|err| Error::new(ErrorKind::InvalidData, err))?;
            Ok(Some(message))
        } else {
            Ok(None)
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = Error;

    fn encode(&mut self, message: Message, buf: &mut BytesMut) -> Result<(), Error> {
        let encoded = serde_json::to_vec(&message)?;
        buf.reserve(encoded.len() + 1);
        buf.put_slice(&encoded);
        buf.put_u8(b'\n');
        Ok(())
    }
}

/// Given a stream of bytes, find the end of the next message frame
fn find_frame_end(data: &[u8]) -> Option<usize> {
    data.iter().position(|byte| *byte == b'\n')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::KeepaliveMessage;

    #[test]
    fn test_partial_frame_waits_for_more() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::from(&br#"{"type":"KEEPALIVE""#[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 19);
    }

    #[test]
    fn test_encode_decode() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Message::Keepalive(KeepaliveMessage::new(65001)), &mut buf)
            .unwrap();
        assert_eq!(buf[buf.len() - 1], b'\n');
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.kind(), "KEEPALIVE");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Message::Keepalive(KeepaliveMessage::new(65001)), &mut buf)
            .unwrap();
        codec
            .encode(Message::Keepalive(KeepaliveMessage::new(65002)), &mut buf)
            .unwrap();
        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.sender_asn(), 65001);
        assert_eq!(second.sender_asn(), 65002);
    }

    #[test]
    fn test_garbage_frame_is_an_error() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::from(&b"not json\n"[..]);
        assert!(codec.decode(&mut buf).is_err());
    }
}
