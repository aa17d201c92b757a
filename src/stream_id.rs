use crate::error::{Result, YamuxError};
use std::sync::atomic::{AtomicU32, Ordering};

/// Allocates parity-correct stream IDs: odd from 1 for the initiator, even
/// from 2 for the acceptor, strictly increasing, never reused.
#[derive(Debug)]
pub struct StreamIdGenerator {
    next_id: AtomicU32,
    is_client: bool,
}

impl StreamIdGenerator {
    pub fn new(is_client: bool) -> Self {
        let initial_id = if is_client { 1 } else { 2 };
        Self {
            next_id: AtomicU32::new(initial_id),
            is_client,
        }
    }

    pub fn next(&self) -> Result<u32> {
        let current = self.next_id.fetch_add(2, Ordering::Relaxed);
        if current > u32::MAX - 2 {
            return Err(YamuxError::StreamsExhausted);
        }
        Ok(current)
    }

    /// Remotely-initiated streams must carry the peer's parity and a
    /// non-zero ID.
    pub fn validate_peer_stream_id(&self, stream_id: u32) -> Result<()> {
        if stream_id == 0 {
            return Err(YamuxError::InvalidStreamId(stream_id));
        }

        let expected_parity = if self.is_client { 0 } else { 1 };
        if stream_id % 2 != expected_parity {
            return Err(YamuxError::InvalidStreamId(stream_id));
        }

        Ok(())
    }
}
