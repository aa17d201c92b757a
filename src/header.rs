use crate::error::{Result, YamuxError};
use bytes::{Buf, BufMut};

/// Protocol version carried in every frame header.
pub const VERSION: u8 = 0;

/// Size of the fixed frame header in bytes.
pub const HEADER_SIZE: usize = 12;

/// Initial per-stream flow-control window in bytes (256 KiB).
pub const INITIAL_STREAM_WINDOW: u32 = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Data,
    WindowUpdate,
    Ping,
    GoAway,
}

impl FrameType {
    pub const DATA: u8 = 0;
    pub const WINDOW_UPDATE: u8 = 1;
    pub const PING: u8 = 2;
    pub const GO_AWAY: u8 = 3;

    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            Self::DATA => Ok(FrameType::Data),
            Self::WINDOW_UPDATE => Ok(FrameType::WindowUpdate),
            Self::PING => Ok(FrameType::Ping),
            Self::GO_AWAY => Ok(FrameType::GoAway),
            other => Err(YamuxError::InvalidMsgType(other)),
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            FrameType::Data => Self::DATA,
            FrameType::WindowUpdate => Self::WINDOW_UPDATE,
            FrameType::Ping => Self::PING,
            FrameType::GoAway => Self::GO_AWAY,
        }
    }

    /// Session-level frames address the session itself and use stream ID 0.
    pub fn is_session_level(self) -> bool {
        matches!(self, FrameType::Ping | FrameType::GoAway)
    }

    pub fn can_carry_data(self) -> bool {
        matches!(self, FrameType::Data)
    }
}

/// Connection-management flags, OR-ed into the 16-bit flags field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(u16);

impl Flags {
    pub const NONE: Flags = Flags(0);
    pub const SYN: Flags = Flags(1);
    pub const ACK: Flags = Flags(2);
    pub const FIN: Flags = Flags(4);
    pub const RST: Flags = Flags(8);

    pub fn from_bits(bits: u16) -> Self {
        Flags(bits)
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        self.0 |= rhs.0;
    }
}

/// Error codes carried in the length field of a GoAway frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoAwayCode {
    Normal,
    ProtocolError,
    InternalError,
}

impl GoAwayCode {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(GoAwayCode::Normal),
            1 => Some(GoAwayCode::ProtocolError),
            2 => Some(GoAwayCode::InternalError),
            _ => None,
        }
    }

    pub fn to_code(self) -> u32 {
        match self {
            GoAwayCode::Normal => 0,
            GoAwayCode::ProtocolError => 1,
            GoAwayCode::InternalError => 2,
        }
    }
}

/// The fixed 12-byte frame header, big-endian on the wire.
///
/// The `length` field is overloaded by frame type: payload size for Data,
/// credit delta for WindowUpdate, opaque token for Ping, error code for
/// GoAway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub typ: FrameType,
    pub flags: Flags,
    pub stream_id: u32,
    pub length: u32,
}

impl Header {
    pub fn new(typ: FrameType, flags: Flags, stream_id: u32, length: u32) -> Self {
        Self {
            typ,
            flags,
            stream_id,
            length,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        let mut dst = &mut buf[..];
        dst.put_u8(VERSION);
        dst.put_u8(self.typ.to_byte());
        dst.put_u16(self.flags.bits());
        dst.put_u32(self.stream_id);
        dst.put_u32(self.length);
        buf
    }

    pub fn decode(mut src: &[u8]) -> Result<Self> {
        debug_assert!(src.len() >= HEADER_SIZE);

        let version = src.get_u8();
        if version != VERSION {
            return Err(YamuxError::InvalidVersion(version));
        }

        let typ = FrameType::from_byte(src.get_u8())?;
        let flags = Flags::from_bits(src.get_u16());
        let stream_id = src.get_u32();
        let length = src.get_u32();

        Ok(Header {
            typ,
            flags,
            stream_id,
            length,
        })
    }

    /// Stream-level frames must carry a non-zero ID, session-level frames
    /// must not. Flag combinations are the state machine's concern.
    pub fn validate(&self) -> Result<()> {
        if self.typ.is_session_level() {
            if self.stream_id != 0 {
                return Err(YamuxError::InvalidStreamId(self.stream_id));
            }
        } else if self.stream_id == 0 {
            return Err(YamuxError::InvalidStreamId(self.stream_id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type_byte_conversion() {
        let types = [
            FrameType::Data,
            FrameType::WindowUpdate,
            FrameType::Ping,
            FrameType::GoAway,
        ];

        for typ in types {
            assert_eq!(FrameType::from_byte(typ.to_byte()).unwrap(), typ);
        }
    }

    #[test]
    fn test_invalid_frame_type_byte() {
        assert!(matches!(
            FrameType::from_byte(4),
            Err(YamuxError::InvalidMsgType(4))
        ));
        assert!(FrameType::from_byte(255).is_err());
    }

    #[test]
    fn test_flags_ops() {
        let flags = Flags::SYN | Flags::ACK;
        assert!(flags.contains(Flags::SYN));
        assert!(flags.contains(Flags::ACK));
        assert!(!flags.contains(Flags::FIN));
        assert_eq!(flags.bits(), 3);

        let mut flags = Flags::NONE;
        assert!(flags.is_empty());
        flags |= Flags::RST;
        assert!(flags.contains(Flags::RST));
    }

    #[test]
    fn test_header_round_trip() {
        let headers = [
            Header::new(FrameType::Data, Flags::SYN, 1, 4096),
            Header::new(FrameType::WindowUpdate, Flags::ACK | Flags::FIN, 2, 0),
            Header::new(FrameType::Ping, Flags::SYN, 0, 0xdead_beef),
            Header::new(FrameType::GoAway, Flags::NONE, 0, 1),
        ];

        for header in headers {
            let encoded = header.encode();
            assert_eq!(Header::decode(&encoded).unwrap(), header);
        }
    }

    #[test]
    fn test_header_wire_layout() {
        let header = Header::new(FrameType::Data, Flags::SYN | Flags::FIN, 0x0102_0304, 0x0a0b);
        let buf = header.encode();

        assert_eq!(buf[0], 0); // version
        assert_eq!(buf[1], FrameType::DATA);
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), 5); // SYN | FIN
        assert_eq!(&buf[4..8], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&buf[8..12], &[0x00, 0x00, 0x0a, 0x0b]);
    }

    #[test]
    fn test_decode_rejects_bad_version() {
        let mut buf = Header::new(FrameType::Ping, Flags::SYN, 0, 1).encode();
        buf[0] = 1;
        assert!(matches!(
            Header::decode(&buf),
            Err(YamuxError::InvalidVersion(1))
        ));
    }

    #[test]
    fn test_validate_stream_id_by_type() {
        // Session-level frames use stream ID 0.
        assert!(Header::new(FrameType::Ping, Flags::SYN, 0, 7).validate().is_ok());
        assert!(Header::new(FrameType::GoAway, Flags::NONE, 0, 0).validate().is_ok());
        assert!(Header::new(FrameType::Ping, Flags::SYN, 1, 7).validate().is_err());
        assert!(Header::new(FrameType::GoAway, Flags::NONE, 3, 0).validate().is_err());

        // Stream-level frames must not.
        assert!(Header::new(FrameType::Data, Flags::NONE, 1, 0).validate().is_ok());
        assert!(Header::new(FrameType::WindowUpdate, Flags::NONE, 2, 64).validate().is_ok());
        assert!(Header::new(FrameType::Data, Flags::NONE, 0, 0).validate().is_err());
        assert!(Header::new(FrameType::WindowUpdate, Flags::NONE, 0, 64).validate().is_err());
    }

    #[test]
    fn test_go_away_codes() {
        assert_eq!(GoAwayCode::from_code(0), Some(GoAwayCode::Normal));
        assert_eq!(GoAwayCode::from_code(1), Some(GoAwayCode::ProtocolError));
        assert_eq!(GoAwayCode::from_code(2), Some(GoAwayCode::InternalError));
        assert_eq!(GoAwayCode::from_code(42), None);

        for code in [
            GoAwayCode::Normal,
            GoAwayCode::ProtocolError,
            GoAwayCode::InternalError,
        ] {
            assert_eq!(GoAwayCode::from_code(code.to_code()), Some(code));
        }
    }
}
