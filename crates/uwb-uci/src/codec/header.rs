//! Header layouts and length rules for the three framings
//!
//! ```text
//! UCI   [MT(3)|PBF(1)|GID(4)] [EXT(1)|RFU(1)|OID(6)] [len MSB / RFU] [len / len LSB]
//! HBCI  [class] [instruction] [len MSB] [len LSB]
//! HDLL  [RFU(2)|CHUNK(1)|len(13) ...........] [msg type] [opcode]
//! ```
//!
//! Every header is four bytes. UCI carries a one-byte length at offset 3
//! unless the packet is a data packet or the extended-length bit is set,
//! in which case offsets 2..4 hold a big-endian `u16`.

use bytes::Bytes;
use uwb_core::{BootstrapFrame, EventId, Frame, FramingMode, MessageType, Packet, UCI_HEADER_LEN};

use super::CodecError;

pub const HEADER_LEN: usize = UCI_HEADER_LEN;

const MT_SHIFT: u8 = 5;
const PBF_BIT: u8 = 0x10;
const GID_MASK: u8 = 0x0F;
const EXT_LEN_BIT: u8 = 0x80;
const OID_MASK: u8 = 0x3F;

/// Largest payload a one-byte length can carry
pub const MAX_SHORT_PAYLOAD: usize = u8::MAX as usize;
/// Largest payload a two-byte length can carry
pub const MAX_EXTENDED_PAYLOAD: usize = u16::MAX as usize;

/// Chunk-follows flag in HDLL header byte 0
pub const HDLL_CHUNK_BIT: u8 = 0x20;
const HDLL_LEN_MASK: u16 = 0x1FFF;
/// Largest payload an HDLL header can carry
pub const MAX_HDLL_PAYLOAD: usize = HDLL_LEN_MASK as usize;

/// Decoded UCI header fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UciHeader {
    pub message_type: MessageType,
    pub pbf: bool,
    pub gid: u8,
    pub oid: u8,
    pub extended: bool,
    pub payload_len: usize,
}

impl UciHeader {
    /// Parse the first four bytes of a UCI frame
    pub fn parse(bytes: &[u8]) -> Result<Self, CodecError> {
        let header = header_bytes(bytes)?;
        let message_type = MessageType::from_bits(header[0] >> MT_SHIFT);
        let extended = header[1] & EXT_LEN_BIT != 0;

        Ok(Self {
            message_type,
            pbf: header[0] & PBF_BIT != 0,
            gid: header[0] & GID_MASK,
            oid: header[1] & OID_MASK,
            extended,
            payload_len: uci_payload_len(&header),
        })
    }

    /// Frame length including the header
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.payload_len
    }
}

fn header_bytes(bytes: &[u8]) -> Result<[u8; HEADER_LEN], CodecError> {
    bytes
        .get(..HEADER_LEN)
        .and_then(|h| h.try_into().ok())
        .ok_or(CodecError::HeaderTooShort(bytes.len()))
}

fn uci_payload_len(header: &[u8; HEADER_LEN]) -> usize {
    let message_type = MessageType::from_bits(header[0] >> MT_SHIFT);
    if message_type == MessageType::Data || header[1] & EXT_LEN_BIT != 0 {
        u16::from_be_bytes([header[2], header[3]]) as usize
    } else {
        header[3] as usize
    }
}

/// Payload length declared by a header in the given framing
pub fn payload_len(mode: FramingMode, header: &[u8; HEADER_LEN]) -> usize {
    match mode {
        FramingMode::Uci => uci_payload_len(header),
        FramingMode::Hbci => u16::from_be_bytes([header[2], header[3]]) as usize,
        FramingMode::Hdll => {
            (u16::from_be_bytes([header[0], header[1]]) & HDLL_LEN_MASK) as usize
        }
    }
}

/// Total frame length (header + payload) declared by the leading bytes
pub fn frame_len(mode: FramingMode, bytes: &[u8]) -> Result<usize, CodecError> {
    let header = header_bytes(bytes)?;
    Ok(HEADER_LEN + payload_len(mode, &header))
}

/// Identifier used to label a frame in logs and errors
///
/// UCI frames yield their group/opcode. Bootstrap frames have none, so
/// the two header bytes that select the operation stand in: class and
/// instruction for HBCI, message type and opcode for HDLL.
pub fn frame_event(mode: FramingMode, bytes: &[u8]) -> Result<EventId, CodecError> {
    let header = header_bytes(bytes)?;
    Ok(match mode {
        FramingMode::Uci => EventId::new(header[0] & GID_MASK, header[1] & OID_MASK),
        FramingMode::Hbci => EventId::new(header[0], header[1]),
        FramingMode::Hdll => EventId::new(header[2], header[3]),
    })
}

/// Serialize a frame to wire bytes
pub fn encode(frame: &Frame) -> Result<Vec<u8>, CodecError> {
    match frame {
        Frame::Uci(packet) => encode_packet(packet),
        Frame::Bootstrap(frame) => encode_bootstrap(frame),
    }
}

/// Serialize a UCI packet, picking the extended length form when needed
pub fn encode_packet(packet: &Packet) -> Result<Vec<u8>, CodecError> {
    let len = packet.payload.len();
    if len > MAX_EXTENDED_PAYLOAD {
        return Err(CodecError::PayloadTooLong {
            len,
            max: MAX_EXTENDED_PAYLOAD,
        });
    }

    let mut byte0 = (packet.message_type.bits() << MT_SHIFT) | (packet.gid & GID_MASK);
    if packet.pbf {
        byte0 |= PBF_BIT;
    }
    let mut byte1 = packet.oid & OID_MASK;

    let mut out = Vec::with_capacity(HEADER_LEN + len);
    out.push(byte0);
    if packet.message_type == MessageType::Data {
        out.push(byte1);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else if len > MAX_SHORT_PAYLOAD {
        byte1 |= EXT_LEN_BIT;
        out.push(byte1);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(byte1);
        out.push(0x00);
        out.push(len as u8);
    }
    out.extend_from_slice(&packet.payload);
    Ok(out)
}

/// Serialize a bootstrap frame, writing the payload length into its header
pub fn encode_bootstrap(frame: &BootstrapFrame) -> Result<Vec<u8>, CodecError> {
    let len = frame.payload.len();
    let mut header = frame.header;
    match frame.mode {
        FramingMode::Hdll => {
            if len > MAX_HDLL_PAYLOAD {
                return Err(CodecError::PayloadTooLong {
                    len,
                    max: MAX_HDLL_PAYLOAD,
                });
            }
            let [hi, lo] = (len as u16).to_be_bytes();
            header[0] = (header[0] & !(HDLL_LEN_MASK >> 8) as u8) | hi;
            header[1] = lo;
        }
        FramingMode::Hbci | FramingMode::Uci => {
            if len > MAX_EXTENDED_PAYLOAD {
                return Err(CodecError::PayloadTooLong {
                    len,
                    max: MAX_EXTENDED_PAYLOAD,
                });
            }
            header[2..4].copy_from_slice(&(len as u16).to_be_bytes());
        }
    }

    let mut out = Vec::with_capacity(HEADER_LEN + len);
    out.extend_from_slice(&header);
    out.extend_from_slice(&frame.payload);
    Ok(out)
}

/// Decode one complete frame in the given framing
///
/// `bytes` must hold exactly the header plus the declared payload.
pub fn decode(mode: FramingMode, bytes: &[u8]) -> Result<Frame, CodecError> {
    let header = header_bytes(bytes)?;
    let declared = payload_len(mode, &header);
    let actual = bytes.len() - HEADER_LEN;
    if declared != actual {
        return Err(CodecError::LengthMismatch { declared, actual });
    }
    let payload = Bytes::copy_from_slice(&bytes[HEADER_LEN..]);

    match mode {
        FramingMode::Uci => {
            let fields = UciHeader::parse(&header)?;
            Ok(Frame::Uci(Packet {
                message_type: fields.message_type,
                pbf: fields.pbf,
                gid: fields.gid,
                oid: fields.oid,
                payload,
            }))
        }
        FramingMode::Hbci | FramingMode::Hdll => Ok(Frame::Bootstrap(BootstrapFrame {
            mode,
            header,
            payload,
        })),
    }
}

/// Build an HBCI frame
pub fn hbci_frame(class: u8, instruction: u8, payload: impl Into<Bytes>) -> BootstrapFrame {
    BootstrapFrame {
        mode: FramingMode::Hbci,
        header: [class, instruction, 0, 0],
        payload: payload.into(),
    }
}

/// Build an HDLL frame; `more` sets the chunk-follows flag
pub fn hdll_frame(more: bool, msg_type: u8, opcode: u8, payload: impl Into<Bytes>) -> BootstrapFrame {
    let flags = if more { HDLL_CHUNK_BIT } else { 0 };
    BootstrapFrame {
        mode: FramingMode::Hdll,
        header: [flags, 0, msg_type, opcode],
        payload: payload.into(),
    }
}

/// True when an HDLL header announces further chunks
pub fn hdll_more_chunks(header: &[u8; HEADER_LEN]) -> bool {
    header[0] & HDLL_CHUNK_BIT != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[test]
    fn test_core_reset_command_header() {
        let header = UciHeader::parse(&[0x20, 0x00, 0x00, 0x01]).unwrap();

        assert_eq!(header.message_type, MessageType::Command);
        assert_eq!(header.gid, 0);
        assert_eq!(header.oid, 0);
        assert!(!header.pbf);
        assert_eq!(header.payload_len, 1);
        assert_eq!(header.frame_len(), 5);
    }

    #[rstest]
    #[case([0x20, 0x02, 0x7F, 0x10], 0x10)]
    #[case([0x40, 0x04, 0xFF, 0xFF], 0xFF)]
    #[case([0x61, 0x02, 0x01, 0x00], 0x00)]
    fn test_short_length_ignores_byte_two(#[case] header: [u8; 4], #[case] expected: usize) {
        assert_eq!(payload_len(FramingMode::Uci, &header), expected);
    }

    #[rstest]
    #[case::extended_bit([0x2E, 0x80, 0x01, 0x02], 0x0102)]
    #[case::data_packet([0x00, 0x00, 0x01, 0x02], 0x0102)]
    #[case::data_with_pbf([0x10, 0x00, 0x00, 0x05], 0x0005)]
    fn test_two_byte_big_endian_length(#[case] header: [u8; 4], #[case] expected: usize) {
        assert_eq!(payload_len(FramingMode::Uci, &header), expected);
    }

    #[test]
    fn test_bootstrap_length_offsets() {
        assert_eq!(payload_len(FramingMode::Hbci, &[0x50, 0x01, 0x01, 0x00]), 256);
        assert_eq!(payload_len(FramingMode::Hdll, &[0x21, 0x00, 0x00, 0x01]), 256);
        assert!(hdll_more_chunks(&[0x21, 0x00, 0x00, 0x01]));
    }

    #[test]
    fn test_long_payload_uses_extended_length() {
        let packet = Packet::command(0x0E, 0x21, vec![0xAB; 300]);
        let bytes = encode_packet(&packet).unwrap();

        assert_eq!(&bytes[..4], &[0x2E, 0xA1, 0x01, 0x2C]);
        assert_eq!(frame_len(FramingMode::Uci, &bytes).unwrap(), bytes.len());
        assert_eq!(decode(FramingMode::Uci, &bytes).unwrap(), Frame::Uci(packet));
    }

    #[test]
    fn test_decode_rejects_length_mismatch() {
        let result = decode(FramingMode::Uci, &[0x20, 0x00, 0x00, 0x02, 0x00]);
        assert_eq!(
            result,
            Err(CodecError::LengthMismatch {
                declared: 2,
                actual: 1
            })
        );
    }

    #[test]
    fn test_short_header_rejected() {
        assert_eq!(
            UciHeader::parse(&[0x20, 0x00]),
            Err(CodecError::HeaderTooShort(2))
        );
    }

    #[test]
    fn test_hdll_encode_keeps_chunk_flag() {
        let frame = hdll_frame(true, 0x00, 0x01, vec![0x11; 0x123]);
        let bytes = encode_bootstrap(&frame).unwrap();

        assert_eq!(&bytes[..4], &[0x21, 0x23, 0x00, 0x01]);
        assert_eq!(bytes.len(), 4 + 0x123);
    }

    #[test]
    fn test_hbci_frame_labels_and_round_trip() {
        let frame = hbci_frame(0x50, 0xA1, vec![0x01, 0x02, 0x03]);
        let bytes = encode_bootstrap(&frame).unwrap();

        assert_eq!(&bytes[..4], &[0x50, 0xA1, 0x00, 0x03]);
        assert_eq!(
            frame_event(FramingMode::Hbci, &bytes).unwrap(),
            EventId::new(0x50, 0xA1)
        );
        assert_eq!(
            decode(FramingMode::Hbci, &bytes).unwrap(),
            Frame::Bootstrap(BootstrapFrame {
                header: [0x50, 0xA1, 0x00, 0x03],
                ..frame
            })
        );
    }

    #[test]
    fn test_hdll_payload_limit() {
        let frame = hdll_frame(false, 0x00, 0x01, vec![0; MAX_HDLL_PAYLOAD + 1]);
        assert!(matches!(
            encode_bootstrap(&frame),
            Err(CodecError::PayloadTooLong { .. })
        ));
    }
}
