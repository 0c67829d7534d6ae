//! Raw Ethernet framing.
//!
//! Wire layout, all fields big-endian:
//!
//! ```text
//!  0      6      12     14  15  16        20     22     24     26        30        34
//!  | dst  | src  | type | v | t | seq     | tot  | idx  | len  | crc32   | flags   | payload..
//! ```
//!
//! The trailing `flags` word is reserved; bit 0 asks the receiver to ACK the
//! completed message. Bytes after `len` payload bytes are Ethernet padding
//! and ignored.

use std::fmt;
use std::str::FromStr;

use crosswire_shared::constants::{DEFAULT_CHUNK_SIZE, ETHER_TYPE, PROTOCOL_VERSION};
use crosswire_shared::types::FrameType;

use crate::error::{Result, TransportError};
use crate::reassembly::Reassembler;

pub const ETH_HEADER_LEN: usize = 14;
pub const FRAME_HEADER_LEN: usize = ETH_HEADER_LEN + 20;

/// Header flag: the sender waits for an ACK frame with the same sequence.
pub const FLAG_ACK_REQUESTED: u32 = 0x0000_0001;

// ---------------------------------------------------------------------------
// MAC address
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xFF; 6]);

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl FromStr for MacAddr {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        let mut out = [0u8; 6];
        let mut parts = s.trim().split(|c| c == ':' || c == '-');
        for byte in out.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| TransportError::InvalidAddress(s.to_string()))?;
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| TransportError::InvalidAddress(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(TransportError::InvalidAddress(s.to_string()));
        }
        Ok(MacAddr(out))
    }
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// One chunk of a message on the wire. The checksum is derived from the
/// payload on encode and verified on decode, so it is not stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub dst: MacAddr,
    pub src: MacAddr,
    pub frame_type: FrameType,
    pub sequence: u32,
    pub total_chunks: u16,
    pub chunk_index: u16,
    pub flags: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    /// A single-chunk frame (ACK and discovery traffic).
    pub fn single(
        dst: MacAddr,
        src: MacAddr,
        frame_type: FrameType,
        sequence: u32,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            dst,
            src,
            frame_type,
            sequence,
            total_chunks: 1,
            chunk_index: 0,
            flags: 0,
            payload,
        }
    }

    pub fn ack_requested(&self) -> bool {
        self.flags & FLAG_ACK_REQUESTED != 0
    }

    /// Reassembly key: `"<srcMAC>:<sequence>"`.
    pub fn reassembly_key(&self) -> String {
        format!("{}:{}", self.src, self.sequence)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&self.dst.0);
        buf.extend_from_slice(&self.src.0);
        buf.extend_from_slice(&ETHER_TYPE.to_be_bytes());
        buf.push(PROTOCOL_VERSION);
        buf.push(self.frame_type.as_byte());
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.extend_from_slice(&self.total_chunks.to_be_bytes());
        buf.extend_from_slice(&self.chunk_index.to_be_bytes());
        buf.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        buf.extend_from_slice(&crc32fast::hash(&self.payload).to_be_bytes());
        buf.extend_from_slice(&self.flags.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }
}

/// Split `payload` into frames of at most `chunk_size` bytes.
///
/// An empty payload still produces one (empty) frame so that the message
/// is observable on the wire.
pub fn encode(
    dst: MacAddr,
    src: MacAddr,
    frame_type: FrameType,
    sequence: u32,
    payload: &[u8],
    chunk_size: usize,
    flags: u32,
) -> Result<Vec<Frame>> {
    if chunk_size == 0 {
        return Err(TransportError::Codec("chunk size must be at least 1".into()));
    }
    if chunk_size > u16::MAX as usize {
        return Err(TransportError::Codec(format!(
            "chunk size {chunk_size} exceeds the 16-bit length field"
        )));
    }

    let chunks: Vec<&[u8]> = if payload.is_empty() {
        vec![&[][..]]
    } else {
        payload.chunks(chunk_size).collect()
    };

    let total = u16::try_from(chunks.len()).map_err(|_| {
        TransportError::Codec(format!("payload needs {} chunks", chunks.len()))
    })?;

    Ok(chunks
        .into_iter()
        .enumerate()
        .map(|(index, chunk)| Frame {
            dst,
            src,
            frame_type,
            sequence,
            total_chunks: total,
            chunk_index: index as u16,
            flags,
            payload: chunk.to_vec(),
        })
        .collect())
}

/// [`encode`] with the default 1470-byte chunk size.
pub fn encode_default(
    dst: MacAddr,
    src: MacAddr,
    frame_type: FrameType,
    sequence: u32,
    payload: &[u8],
) -> Result<Vec<Frame>> {
    encode(dst, src, frame_type, sequence, payload, DEFAULT_CHUNK_SIZE, 0)
}

fn be_u16(raw: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([raw[at], raw[at + 1]])
}

fn be_u32(raw: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]])
}

fn mac_at(raw: &[u8], at: usize) -> MacAddr {
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&raw[at..at + 6]);
    MacAddr(mac)
}

pub fn decode(raw: &[u8]) -> Result<Frame> {
    if raw.len() < FRAME_HEADER_LEN {
        return Err(TransportError::Codec(format!(
            "frame too short: {} bytes",
            raw.len()
        )));
    }

    let ether_type = be_u16(raw, 12);
    if ether_type != ETHER_TYPE {
        return Err(TransportError::Codec(format!(
            "unexpected ethertype {ether_type:#06x}"
        )));
    }

    let version = raw[14];
    if version != PROTOCOL_VERSION {
        return Err(TransportError::Codec(format!(
            "unsupported protocol version {version}"
        )));
    }

    let frame_type = FrameType::from_byte(raw[15])
        .ok_or_else(|| TransportError::Codec(format!("unknown frame type {:#04x}", raw[15])))?;

    let sequence = be_u32(raw, 16);
    let total_chunks = be_u16(raw, 20);
    let chunk_index = be_u16(raw, 22);
    let payload_len = be_u16(raw, 24) as usize;
    let checksum = be_u32(raw, 26);
    let flags = be_u32(raw, 30);

    if FRAME_HEADER_LEN + payload_len > raw.len() {
        return Err(TransportError::Codec(format!(
            "payload length {payload_len} exceeds frame"
        )));
    }
    let payload = &raw[FRAME_HEADER_LEN..FRAME_HEADER_LEN + payload_len];

    let actual = crc32fast::hash(payload);
    if actual != checksum {
        return Err(TransportError::ChecksumMismatch {
            expected: checksum,
            actual,
        });
    }

    if total_chunks > 0 && chunk_index >= total_chunks {
        return Err(TransportError::Codec(format!(
            "chunk index {chunk_index} out of range for {total_chunks} chunks"
        )));
    }

    Ok(Frame {
        dst: mac_at(raw, 0),
        src: mac_at(raw, 6),
        frame_type,
        sequence,
        total_chunks,
        chunk_index,
        flags,
        payload: payload.to_vec(),
    })
}

/// Feed a decoded frame into the frame-level reassembler.
///
/// Returns the full payload once every chunk of the message has arrived.
pub fn try_reassemble(reassembler: &Reassembler<String>, frame: Frame) -> Option<Vec<u8>> {
    let key = frame.reassembly_key();
    reassembler.insert(
        key,
        frame.chunk_index as usize,
        frame.total_chunks as usize,
        frame.payload,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    const SRC: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x01]);

    fn reassembler() -> Reassembler<String> {
        Reassembler::new(Duration::from_secs(300))
    }

    #[test]
    fn test_header_layout() {
        let frames = encode(MacAddr::BROADCAST, SRC, FrameType::Data, 7, b"hi", 1470, 0).unwrap();
        let bytes = frames[0].to_bytes();

        assert_eq!(bytes.len(), FRAME_HEADER_LEN + 2);
        assert_eq!(&bytes[0..6], &[0xFF; 6]);
        assert_eq!(&bytes[12..14], &[0x88, 0xB5]);
        assert_eq!(bytes[14], 1);
        assert_eq!(bytes[15], 0x01);
        assert_eq!(&bytes[16..20], &7u32.to_be_bytes());
        assert_eq!(&bytes[24..26], &2u16.to_be_bytes());
        assert_eq!(&bytes[30..34], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_empty_payload_is_one_chunk() {
        let frames = encode_default(MacAddr::BROADCAST, SRC, FrameType::Data, 1, b"").unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].total_chunks, 1);

        let decoded = decode(&frames[0].to_bytes()).unwrap();
        assert_eq!(try_reassemble(&reassembler(), decoded), Some(Vec::new()));
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        assert!(encode(MacAddr::BROADCAST, SRC, FrameType::Data, 1, b"x", 0, 0).is_err());
    }

    #[test]
    fn test_corrupted_checksum_rejected() {
        let frames = encode_default(MacAddr::BROADCAST, SRC, FrameType::Data, 1, b"payload").unwrap();
        let mut bytes = frames[0].to_bytes();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;

        assert!(matches!(
            decode(&bytes),
            Err(TransportError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_decode_rejections() {
        let good = encode_default(MacAddr::BROADCAST, SRC, FrameType::Control, 3, b"abc")
            .unwrap()[0]
            .to_bytes();

        assert!(decode(&good[..FRAME_HEADER_LEN - 1]).is_err());

        let mut wrong_type = good.clone();
        wrong_type[12] = 0x08;
        wrong_type[13] = 0x00;
        assert!(decode(&wrong_type).is_err());

        let mut wrong_version = good.clone();
        wrong_version[14] = 2;
        assert!(decode(&wrong_version).is_err());

        let mut unknown_kind = good.clone();
        unknown_kind[15] = 0x7F;
        assert!(decode(&unknown_kind).is_err());

        let mut overlong = good.clone();
        overlong[24..26].copy_from_slice(&100u16.to_be_bytes());
        assert!(decode(&overlong).is_err());

        let mut bad_index = good.clone();
        bad_index[22..24].copy_from_slice(&1u16.to_be_bytes());
        assert!(decode(&bad_index).is_err());
    }

    #[test]
    fn test_trailing_padding_ignored() {
        let frame = Frame::single(MacAddr::BROADCAST, SRC, FrameType::Ack, 9, vec![]);
        let mut bytes = frame.to_bytes();
        bytes.resize(60, 0);

        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_ack_flag_round_trip() {
        let frames = encode(
            MacAddr::BROADCAST,
            SRC,
            FrameType::Data,
            1,
            b"x",
            1470,
            FLAG_ACK_REQUESTED,
        )
        .unwrap();
        assert!(decode(&frames[0].to_bytes()).unwrap().ack_requested());
    }

    #[test]
    fn test_mac_parse_display() {
        let mac: MacAddr = "02:00:00:00:00:01".parse().unwrap();
        assert_eq!(mac, SRC);
        assert_eq!(mac.to_string(), "02:00:00:00:00:01");
        assert!("02:00:00".parse::<MacAddr>().is_err());
        assert!("02:00:00:00:00:01:ff".parse::<MacAddr>().is_err());
        assert!(MacAddr::BROADCAST.is_broadcast());
    }

    #[test]
    fn test_duplicate_chunk_does_not_corrupt_order() {
        let frames = encode(MacAddr::BROADCAST, SRC, FrameType::Data, 5, b"abcdef", 2, 0).unwrap();
        let r = reassembler();

        assert_eq!(try_reassemble(&r, frames[1].clone()), None);
        assert_eq!(try_reassemble(&r, frames[1].clone()), None);
        assert_eq!(try_reassemble(&r, frames[0].clone()), None);
        assert_eq!(try_reassemble(&r, frames[2].clone()), Some(b"abcdef".to_vec()));
        assert_eq!(r.pending(), 0);
    }

    proptest! {
        #[test]
        fn prop_chunk_round_trip(
            payload in proptest::collection::vec(any::<u8>(), 0..4096),
            chunk_size in 1usize..2048,
            sequence in any::<u32>(),
        ) {
            let frames = encode(MacAddr::BROADCAST, SRC, FrameType::Data, sequence, &payload, chunk_size, 0).unwrap();
            let expected_chunks = if payload.is_empty() { 1 } else { payload.len().div_ceil(chunk_size) };
            prop_assert_eq!(frames.len(), expected_chunks);

            let r = reassembler();
            let mut out = None;
            // Deliver in reverse to exercise out-of-order arrival.
            for frame in frames.iter().rev() {
                let decoded = decode(&frame.to_bytes()).unwrap();
                out = try_reassemble(&r, decoded);
            }
            prop_assert_eq!(out, Some(payload));
        }
    }
}
