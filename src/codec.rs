use crate::{
    config::Config,
    error::{Result, YamuxError},
    frame::Frame,
    header::{FrameType, Header, HEADER_SIZE},
};
use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Wire codec for the fixed-header framing.
///
/// Only Data frames carry a body; their length is bounded by the receive
/// window we could ever have advertised, so anything larger is a peer
/// violation caught before buffering.
#[derive(Debug, Clone)]
pub struct Codec {
    max_data_len: usize,
}

impl Codec {
    pub fn new(config: &Config) -> Self {
        Self {
            max_data_len: config.max_stream_window_size.max(crate::header::INITIAL_STREAM_WINDOW)
                as usize,
        }
    }
}

impl Decoder for Codec {
    type Item = Frame;
    type Error = YamuxError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        // Peek the header without consuming; partial bodies stay buffered.
        let header = Header::decode(&src[..HEADER_SIZE])?;
        header.validate()?;

        let body_len = if header.typ == FrameType::Data {
            let len = header.length as usize;
            if len > self.max_data_len {
                return Err(YamuxError::FrameTooLarge {
                    size: len,
                    max: self.max_data_len,
                });
            }
            len
        } else {
            0
        };

        let total = HEADER_SIZE + body_len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let _ = src.split_to(HEADER_SIZE);
        let body: Bytes = src.split_to(body_len).freeze();

        Ok(Some(Frame::new(header, body)))
    }
}

impl Encoder<Frame> for Codec {
    type Error = YamuxError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        frame.validate()?;

        dst.reserve(frame.total_size());
        dst.put_slice(&frame.header.encode());
        dst.put_slice(&frame.body);

        Ok(())
    }
}
