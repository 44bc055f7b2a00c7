use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use super::packet::{Packet, PACKET_HEADER_SIZE, SEQUENCE_OFFSET};

/// MySQL packet codec for use with tokio Framed
#[derive(Debug, Default)]
pub struct PacketCodec;

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(Packet::decode(src))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst);
        Ok(())
    }
}

/// Rewrite the sequence byte of every frame in an encoded buffer, starting
/// from `first_seq`. Returns the sequence number the next frame should use.
///
/// Used by the causal-read path after the hidden GTID-wait result has been
/// stripped from the front of a reply: the remaining frames must be
/// renumbered so the client sees a contiguous response.
pub fn rewrite_sequence(buf: &mut [u8], mut first_seq: u8) -> u8 {
    let mut offset = 0;
    while offset + PACKET_HEADER_SIZE <= buf.len() {
        let len = buf[offset] as usize
            | ((buf[offset + 1] as usize) << 8)
            | ((buf[offset + 2] as usize) << 16);
        buf[offset + SEQUENCE_OFFSET] = first_seq;
        first_seq = first_seq.wrapping_add(1);
        offset += PACKET_HEADER_SIZE + len;
    }
    first_seq
}
