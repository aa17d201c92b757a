use crate::{
    error::{Result, YamuxError},
    header::{Flags, FrameType, GoAwayCode, Header, HEADER_SIZE},
};
use bytes::Bytes;

/// A single protocol frame: the fixed header plus, for Data frames only,
/// a payload body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub body: Bytes,
}

impl Frame {
    pub fn new(header: Header, body: Bytes) -> Self {
        Self { header, body }
    }

    pub fn data(stream_id: u32, flags: Flags, body: Bytes) -> Self {
        let header = Header::new(FrameType::Data, flags, stream_id, body.len() as u32);
        Self { header, body }
    }

    /// A WindowUpdate frame grants `delta` bytes of receive credit. With a
    /// zero delta it is a pure flag carrier (SYN, ACK, FIN, RST).
    pub fn window_update(stream_id: u32, flags: Flags, delta: u32) -> Self {
        let header = Header::new(FrameType::WindowUpdate, flags, stream_id, delta);
        Self {
            header,
            body: Bytes::new(),
        }
    }

    pub fn ping(flags: Flags, token: u32) -> Self {
        let header = Header::new(FrameType::Ping, flags, 0, token);
        Self {
            header,
            body: Bytes::new(),
        }
    }

    pub fn go_away(code: GoAwayCode) -> Self {
        let header = Header::new(FrameType::GoAway, Flags::NONE, 0, code.to_code());
        Self {
            header,
            body: Bytes::new(),
        }
    }

    pub fn total_size(&self) -> usize {
        HEADER_SIZE + self.body.len()
    }

    pub fn validate(&self) -> Result<()> {
        self.header.validate()?;

        if !self.header.typ.can_carry_data() && !self.body.is_empty() {
            return Err(YamuxError::UnexpectedFlag);
        }

        if self.header.typ == FrameType::Data && self.header.length as usize != self.body.len() {
            return Err(YamuxError::FrameTooLarge {
                size: self.body.len(),
                max: self.header.length as usize,
            });
        }

        Ok(())
    }
}
