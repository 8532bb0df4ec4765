//! Stream reassembly
//!
//! TCP delivers bytes, not messages: one read may hold half a frame, exactly
//! one frame, or several frames plus the start of the next. [`FrameReader`]
//! parses directly out of each read chunk and copies only the unconsumed tail
//! into its carry-over buffer, so the buffer grows only when a message spans
//! more than one read.

use bytes::{Buf, BytesMut};
use muxwire_codec::{Decoded, FramingProtocol, ProtocolError, ProtocolResult};
use std::sync::Arc;
use tracing::trace;

/// Per-connection message reassembly over a [`FramingProtocol`]
pub struct FrameReader<P: FramingProtocol> {
    protocol: Arc<P>,
    carry: BytesMut,
}

impl<P: FramingProtocol> FrameReader<P> {
    pub fn new(protocol: Arc<P>, initial_capacity: usize) -> Self {
        Self {
            protocol,
            carry: BytesMut::with_capacity(initial_capacity),
        }
    }

    /// Bytes of an incomplete message held from earlier reads
    pub fn pending_bytes(&self) -> usize {
        self.carry.len()
    }

    /// Feed one read's worth of bytes, delivering every complete message in
    /// stream order
    ///
    /// Returns the number of messages delivered. A protocol error leaves the
    /// reader in an unspecified state; the connection must be closed.
    pub fn feed<F>(&mut self, chunk: &[u8], mut on_message: F) -> ProtocolResult<usize>
    where
        F: FnMut(P::Message),
    {
        if self.carry.is_empty() {
            let (consumed, delivered) = drain(&*self.protocol, chunk, &mut on_message)?;
            if consumed < chunk.len() {
                self.carry.extend_from_slice(&chunk[consumed..]);
                trace!(carried = self.carry.len(), "partial frame carried over");
            }
            return Ok(delivered);
        }

        self.carry.extend_from_slice(chunk);
        let (consumed, delivered) = drain(&*self.protocol, &self.carry, &mut on_message)?;
        self.carry.advance(consumed);
        Ok(delivered)
    }
}

/// Parse as many whole messages as `buf` holds; returns (consumed, delivered)
fn drain<P, F>(protocol: &P, buf: &[u8], on_message: &mut F) -> ProtocolResult<(usize, usize)>
where
    P: FramingProtocol,
    F: FnMut(P::Message),
{
    let mut offset = 0;
    let mut delivered = 0;

    while offset < buf.len() {
        match protocol.parse(&buf[offset..])? {
            Decoded::NeedMore => break,
            Decoded::Frame { consumed: 0, .. } => {
                return Err(ProtocolError::corrupt_header(
                    protocol.name(),
                    "frame consumed no bytes",
                    0,
                ));
            }
            Decoded::Frame { message, consumed } => {
                offset += consumed;
                delivered += 1;
                on_message(message);
            }
        }
    }

    Ok((offset, delivered))
}

#[cfg(test)]
mod tests {
    use super::*;
    use muxwire_codec::{BinaryMessage, BinaryProtocol, LineProtocol};
    use proptest::prelude::*;

    fn binary_reader() -> FrameReader<BinaryProtocol> {
        FrameReader::new(Arc::new(BinaryProtocol::default()), 64)
    }

    fn encode(seq_id: u32, name: &str, body: &[u8]) -> Vec<u8> {
        BinaryProtocol::default()
            .encode(seq_id, name, body)
            .unwrap()
            .to_vec()
    }

    #[test]
    fn test_exact_frame_leaves_nothing_behind() {
        let mut reader = binary_reader();
        let mut seen = Vec::new();

        let delivered = reader
            .feed(&encode(1, "get", b"k"), |m| seen.push(m.seq_id))
            .unwrap();

        assert_eq!(delivered, 1);
        assert_eq!(seen, vec![1]);
        assert_eq!(reader.pending_bytes(), 0);
    }

    #[test]
    fn test_sticky_frames_with_partial_tail() {
        let mut wire = encode(1, "a", b"one");
        wire.extend_from_slice(&encode(2, "b", b"two"));
        let third = encode(3, "c", b"three");
        wire.extend_from_slice(&third[..5]);

        let mut reader = binary_reader();
        let mut seen = Vec::new();
        reader.feed(&wire, |m| seen.push(m.seq_id)).unwrap();
        assert_eq!(seen, vec![1, 2]);
        assert_eq!(reader.pending_bytes(), 5);

        reader.feed(&third[5..], |m| seen.push(m.seq_id)).unwrap();
        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(reader.pending_bytes(), 0);
    }

    #[test]
    fn test_byte_at_a_time_line_protocol() {
        let mut reader = FrameReader::new(Arc::new(LineProtocol::default()), 8);
        let mut lines = Vec::new();

        for byte in b"echo hello\r\nquit\r\n" {
            reader
                .feed(std::slice::from_ref(byte), |m| lines.push(m.line))
                .unwrap();
        }

        assert_eq!(lines, vec!["echo hello".to_string(), "quit".to_string()]);
    }

    #[test]
    fn test_protocol_error_is_reported() {
        let mut reader = binary_reader();
        let mut wire = Vec::new();
        wire.extend_from_slice(&2i32.to_be_bytes());
        wire.extend_from_slice(&[0, 0]);

        assert!(reader.feed(&wire, |_| {}).is_err());
    }

    #[test]
    fn test_error_after_valid_frames_still_delivers_them_first() {
        let mut wire = encode(10, "ok", b"");
        wire.extend_from_slice(&(-1i32).to_be_bytes());

        let mut reader = binary_reader();
        let mut seen = Vec::new();
        assert!(reader.feed(&wire, |m| seen.push(m.seq_id)).is_err());
        assert_eq!(seen, vec![10]);
    }

    fn message_strategy() -> impl Strategy<Value = BinaryMessage> {
        (any::<u32>(), "[a-z]{0,8}", prop::collection::vec(any::<u8>(), 0..64)).prop_map(
            |(seq_id, name, body)| BinaryMessage {
                seq_id,
                name,
                body: body.into(),
            },
        )
    }

    proptest! {
        #[test]
        fn prop_chunking_does_not_change_messages(
            messages in prop::collection::vec(message_strategy(), 1..16),
            cuts in prop::collection::vec(1usize..32, 1..64),
        ) {
            let mut wire = Vec::new();
            for m in &messages {
                wire.extend_from_slice(&encode(m.seq_id, &m.name, &m.body));
            }

            let mut reader = binary_reader();
            let mut received = Vec::new();
            let mut offset = 0;
            let mut cut = cuts.iter().cycle();
            while offset < wire.len() {
                let end = (offset + *cut.next().unwrap()).min(wire.len());
                reader.feed(&wire[offset..end], |m| received.push(m)).unwrap();
                offset = end;
            }

            prop_assert_eq!(received, messages);
            prop_assert_eq!(reader.pending_bytes(), 0);
        }
    }
}
