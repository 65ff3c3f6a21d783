//! Framing: length-prefix (4 bytes LE) + bincode envelope.

use crate::protocol::Envelope;

pub const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Encode an envelope into a single frame: 4 bytes LE length + bincode payload.
pub fn encode_frame(envelope: &Envelope) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(envelope).map_err(FrameEncodeError::Encode)?;
    let len = payload.len() as u32;
    if payload.len() > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Error encoding an envelope into a frame (bincode or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`. Returns the envelope and the number of bytes consumed.
/// Call with partial buffer; returns error if not enough bytes (caller should try again after more data).
pub fn decode_frame(bytes: &[u8]) -> Result<(Envelope, usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = frame_len([bytes[0], bytes[1], bytes[2], bytes[3]])?;
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let envelope = decode_body(&bytes[LEN_SIZE..LEN_SIZE + len])?;
    Ok((envelope, LEN_SIZE + len))
}

/// Validate a length prefix read off a stream.
pub fn frame_len(prefix: [u8; LEN_SIZE]) -> Result<usize, FrameDecodeError> {
    let len = u32::from_le_bytes(prefix);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    Ok(len as usize)
}

/// Decode a frame body whose length prefix was already consumed.
pub fn decode_body(body: &[u8]) -> Result<Envelope, FrameDecodeError> {
    bincode::deserialize(body).map_err(FrameDecodeError::Decode)
}

/// Error decoding a frame (need more bytes, too large, or bincode failure).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NodeId;
    use crate::protocol::{Headers, Message, PROTOCOL_VERSION};

    fn sample_hello() -> Envelope {
        let mut headers = Headers::new();
        headers.insert("X-TEST".into(), "1".into());
        Envelope {
            sequence: 1,
            sender: NodeId::generate(),
            message: Message::Hello {
                protocol_version: PROTOCOL_VERSION,
                mailbox_port: 49152,
                name: "t1".into(),
                groups: vec!["b".into(), "a".into()],
                status: 3,
                headers,
            },
        }
    }

    #[test]
    fn roundtrip_hello() {
        let env = sample_hello();
        let frame = encode_frame(&env).unwrap();
        let (decoded, n) = decode_frame(&frame).unwrap();
        assert_eq!(n, frame.len());
        assert_eq!(decoded, env);
    }

    #[test]
    fn shout_keeps_frame_order() {
        let env = Envelope {
            sequence: 7,
            sender: NodeId::generate(),
            message: Message::Shout {
                group: "g".into(),
                content: vec![b"first".to_vec(), Vec::new(), b"third".to_vec()],
            },
        };
        let (decoded, _) = decode_frame(&encode_frame(&env).unwrap()).unwrap();
        match decoded.message {
            Message::Shout { content, .. } => {
                assert_eq!(content[0], b"first");
                assert!(content[1].is_empty());
                assert_eq!(content[2], b"third");
            }
            other => panic!("expected Shout, got {:?}", other),
        }
    }

    #[test]
    fn partial_read_need_more() {
        let frame = encode_frame(&sample_hello()).unwrap();
        assert!(matches!(
            decode_frame(&frame[..2]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&frame[..frame.len() - 1]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn oversized_prefix_rejected() {
        let prefix = (MAX_FRAME_LEN + 1).to_le_bytes();
        assert!(matches!(frame_len(prefix), Err(FrameDecodeError::TooLarge)));
    }

    #[test]
    fn garbage_body_is_decode_error() {
        let mut buf = 3u32.to_le_bytes().to_vec();
        buf.extend_from_slice(&[0xff, 0xff, 0xff]);
        assert!(matches!(decode_frame(&buf), Err(FrameDecodeError::Decode(_))));
    }

    #[test]
    fn multiple_frames() {
        let a = sample_hello();
        let b = Envelope {
            sequence: 2,
            sender: a.sender,
            message: Message::Ping,
        };
        let fa = encode_frame(&a).unwrap();
        let fb = encode_frame(&b).unwrap();
        let mut buf = Vec::new();
        buf.extend_from_slice(&fa);
        buf.extend_from_slice(&fb);
        let (m1, n1) = decode_frame(&buf).unwrap();
        assert_eq!(n1, fa.len());
        let (m2, n2) = decode_frame(&buf[n1..]).unwrap();
        assert_eq!(n2, fb.len());
        assert!(matches!(m1.message, Message::Hello { .. }));
        assert_eq!(m2.message, Message::Ping);
    }
}
