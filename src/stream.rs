use crate::{
    config::Config,
    error::{Result, YamuxError},
    frame::Frame,
    header::Flags,
    session::{SessionCore, SessionState},
};
use bytes::{Bytes, BytesMut};
use std::{
    pin::Pin,
    sync::{Arc, Mutex, Weak},
    task::{Context, Poll, Waker},
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Lifecycle of a single stream.
///
/// `Closed` and `Reset` are absorbing: once reached, no further transition
/// occurs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Init,
    SynSent,
    SynReceived,
    Established,
    LocalClose,
    RemoteClose,
    Closed,
    Reset,
}

impl StreamState {
    pub fn is_terminal(self) -> bool {
        matches!(self, StreamState::Closed | StreamState::Reset)
    }
}

/// Outcome of applying inbound flags, reported back to the session so it
/// can maintain its registry.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct FlagUpdate {
    /// The peer ACKed our SYN; the stream left the in-flight set.
    pub established: bool,
    /// The stream reached a terminal state and should be deregistered.
    pub terminal: bool,
}

#[derive(Debug)]
struct Inner {
    state: StreamState,
    /// Credit the peer has granted us; writers block at zero.
    send_window: u32,
    /// Credit we have granted the peer; inbound data debits it.
    recv_window: u32,
    recv_buf: BytesMut,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
}

impl Inner {
    fn wake_reader(&mut self) {
        if let Some(waker) = self.read_waker.take() {
            waker.wake();
        }
    }

    fn wake_writer(&mut self) {
        if let Some(waker) = self.write_waker.take() {
            waker.wake();
        }
    }
}

/// Stream state shared between the session's dispatch path and the
/// application-facing `Stream` handle.
#[derive(Debug)]
pub(crate) struct Shared {
    id: u32,
    config: Arc<Config>,
    session: SessionState,
    frame_tx: flume::Sender<Frame>,
    inner: Mutex<Inner>,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum CloseOutcome {
    /// Already terminal; nothing to do.
    Noop,
    /// Write side closed, read side stays open until the peer FINs.
    HalfClosed,
    /// Both sides done; deregister.
    FullyClosed,
}

impl Shared {
    pub fn new(
        id: u32,
        config: Arc<Config>,
        session: SessionState,
        frame_tx: flume::Sender<Frame>,
        state: StreamState,
    ) -> Arc<Self> {
        let window = config.initial_window();
        Arc::new(Self {
            id,
            config,
            session,
            frame_tx,
            inner: Mutex::new(Inner {
                state,
                send_window: window,
                recv_window: window,
                recv_buf: BytesMut::new(),
                read_waker: None,
                write_waker: None,
            }),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> StreamState {
        self.inner.lock().unwrap().state
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    fn send_frame(&self, frame: Frame) -> Result<()> {
        if self.session.is_closed() {
            return Err(YamuxError::SessionShutdown);
        }
        self.frame_tx
            .send(frame)
            .map_err(|_| YamuxError::SessionShutdown)
    }

    /// Flags owed to the peer by the pending open handshake. Computing them
    /// advances the handshake state.
    fn handshake_flags(inner: &mut Inner) -> Flags {
        match inner.state {
            StreamState::Init => {
                inner.state = StreamState::SynSent;
                Flags::SYN
            }
            StreamState::SynReceived => {
                inner.state = StreamState::Established;
                Flags::ACK
            }
            _ => Flags::NONE,
        }
    }

    /// Grants the peer whatever receive credit has freed up. A frame goes
    /// out when at least half the window is reclaimable or when handshake
    /// flags are pending; the flags piggyback on the credit.
    pub fn send_window_update(&self) -> Result<()> {
        let (flags, delta) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state.is_terminal() {
                return Ok(());
            }

            let flags = Self::handshake_flags(&mut inner);
            let max = self.config.max_stream_window_size;
            let buffered = inner.recv_buf.len() as u32;
            let delta = max.saturating_sub(buffered).saturating_sub(inner.recv_window);

            if delta < max / 2 && flags.is_empty() {
                return Ok(());
            }

            inner.recv_window += delta;
            (flags, delta)
        };

        self.send_frame(Frame::window_update(self.id, flags, delta))
    }

    /// Inbound Data frame: flags first, then payload against the window.
    pub fn on_data(&self, flags: Flags, body: Bytes) -> Result<FlagUpdate> {
        let update = self.process_flags(flags)?;

        let mut inner = self.inner.lock().unwrap();
        if inner.state == StreamState::Reset {
            return Ok(update);
        }

        let len = body.len() as u32;
        if len > inner.recv_window {
            return Err(YamuxError::RecvWindowExceeded(self.id));
        }

        inner.recv_window -= len;
        inner.recv_buf.extend_from_slice(&body);
        inner.wake_reader();

        Ok(update)
    }

    /// Inbound WindowUpdate frame: flags first, then credit the writer.
    pub fn on_window_update(&self, flags: Flags, delta: u32) -> Result<FlagUpdate> {
        let update = self.process_flags(flags)?;

        let mut inner = self.inner.lock().unwrap();
        inner.send_window = inner.send_window.saturating_add(delta);
        inner.wake_writer();

        Ok(update)
    }

    fn process_flags(&self, flags: Flags) -> Result<FlagUpdate> {
        let mut update = FlagUpdate::default();
        if flags.is_empty() {
            return Ok(update);
        }

        let mut inner = self.inner.lock().unwrap();

        if flags.contains(Flags::ACK) && inner.state == StreamState::SynSent {
            inner.state = StreamState::Established;
            update.established = true;
        }

        if flags.contains(Flags::FIN) {
            match inner.state {
                StreamState::SynSent | StreamState::SynReceived | StreamState::Established => {
                    inner.state = StreamState::RemoteClose;
                    inner.wake_reader();
                }
                StreamState::LocalClose => {
                    inner.state = StreamState::Closed;
                    update.terminal = true;
                    inner.wake_reader();
                    inner.wake_writer();
                }
                // Terminal states are absorbing; a straggler FIN after
                // teardown is not worth a reset.
                StreamState::Closed | StreamState::Reset => {}
                StreamState::Init | StreamState::RemoteClose => {
                    return Err(YamuxError::UnexpectedFlag);
                }
            }
        }

        if flags.contains(Flags::RST) {
            if !inner.state.is_terminal() {
                inner.state = StreamState::Reset;
            }
            update.terminal = true;
            inner.wake_reader();
            inner.wake_writer();
        }

        Ok(update)
    }

    /// Drives the close state machine; the caller sends the FIN and
    /// deregisters on `FullyClosed`.
    pub fn begin_close(&self) -> (CloseOutcome, Flags) {
        let mut inner = self.inner.lock().unwrap();

        let flags = Self::handshake_flags(&mut inner) | Flags::FIN;
        let outcome = match inner.state {
            StreamState::SynSent | StreamState::Established => {
                inner.state = StreamState::LocalClose;
                CloseOutcome::HalfClosed
            }
            StreamState::LocalClose | StreamState::RemoteClose => {
                inner.state = StreamState::Closed;
                CloseOutcome::FullyClosed
            }
            StreamState::Closed | StreamState::Reset => CloseOutcome::Noop,
            // Unreachable in practice: the opening frame leaves Init and
            // SynReceived behind before a handle ever exists.
            StreamState::Init | StreamState::SynReceived => {
                inner.state = StreamState::LocalClose;
                CloseOutcome::HalfClosed
            }
        };

        inner.wake_reader();
        inner.wake_writer();
        (outcome, flags)
    }

    /// Abrupt termination: no further transitions, all pending I/O woken.
    /// Returns false if the stream was already terminal.
    pub fn force_reset(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.state.is_terminal() {
            return false;
        }
        inner.state = StreamState::Reset;
        inner.wake_reader();
        inner.wake_writer();
        true
    }

    #[cfg(test)]
    pub fn send_window(&self) -> u32 {
        self.inner.lock().unwrap().send_window
    }

    #[cfg(test)]
    pub fn recv_window(&self) -> u32 {
        self.inner.lock().unwrap().recv_window
    }
}

/// A multiplexed stream within a yamux session.
///
/// Implements `AsyncRead` and `AsyncWrite`; reads drain the receive buffer
/// and grant the peer fresh credit, writes are chunked under the send
/// window and block (asynchronously) when it is exhausted.
#[derive(Debug)]
pub struct Stream {
    shared: Arc<Shared>,
    session: Weak<SessionCore>,
}

impl Stream {
    pub(crate) fn new(shared: Arc<Shared>, session: Weak<SessionCore>) -> Self {
        Self { shared, session }
    }

    /// Get the stream ID.
    pub fn id(&self) -> u32 {
        self.shared.id()
    }

    pub fn state(&self) -> StreamState {
        self.shared.state()
    }

    /// Check if the peer has closed its half (or the stream is terminal).
    pub fn is_read_closed(&self) -> bool {
        matches!(
            self.state(),
            StreamState::RemoteClose | StreamState::Closed | StreamState::Reset
        )
    }

    /// Check if the local half is closed for writing.
    pub fn is_write_closed(&self) -> bool {
        matches!(
            self.state(),
            StreamState::LocalClose | StreamState::Closed | StreamState::Reset
        )
    }

    /// Graceful half-close: sends FIN and stops accepting writes; the read
    /// side stays open until the peer FINs back.
    pub async fn close(&mut self) -> Result<()> {
        self.perform_close(true);
        Ok(())
    }

    /// Abrupt close: sends RST and fails all pending I/O on this stream
    /// with `ConnectionReset`.
    pub async fn reset(&mut self) -> Result<()> {
        if self.shared.force_reset() {
            let _ = self
                .shared
                .send_frame(Frame::window_update(self.id(), Flags::RST, 0));
            if let Some(core) = self.session.upgrade() {
                core.close_stream(self.id());
            }
        }
        Ok(())
    }

    fn perform_close(&self, arm_timer: bool) {
        let (outcome, flags) = self.shared.begin_close();
        match outcome {
            CloseOutcome::Noop => {}
            CloseOutcome::HalfClosed => {
                // FIN travels as a flags-only window update. Send failure
                // means the session is already down, which is fine.
                let _ = self
                    .shared
                    .send_frame(Frame::window_update(self.id(), flags, 0));
                if arm_timer {
                    self.arm_close_timer();
                }
            }
            CloseOutcome::FullyClosed => {
                let _ = self
                    .shared
                    .send_frame(Frame::window_update(self.id(), flags, 0));
                if let Some(core) = self.session.upgrade() {
                    core.close_stream(self.id());
                }
            }
        }
    }

    /// A half-closed stream whose peer never FINs back is force-reset
    /// after `stream_close_timeout`; contained to this stream.
    fn arm_close_timer(&self) {
        let timeout = self.shared.config.stream_close_timeout;
        if timeout.is_zero() {
            return;
        }

        let shared = Arc::clone(&self.shared);
        let session = self.session.clone();
        let die = shared.session().close_notifier();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    if shared.force_reset() {
                        tracing::warn!(stream_id = shared.id(), "stream close timed out, resetting");
                        let _ = shared.send_frame(Frame::window_update(shared.id(), Flags::RST, 0));
                        if let Some(core) = session.upgrade() {
                            core.close_stream(shared.id());
                        }
                    }
                }
                _ = die.notified() => {}
            }
        });
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();

        let consumed = {
            let mut inner = this.shared.inner.lock().unwrap();

            if inner.state == StreamState::Reset {
                return Poll::Ready(Err(YamuxError::ConnectionReset.into()));
            }

            if inner.recv_buf.is_empty() {
                match inner.state {
                    // EOF once the peer has FINed and the buffer drained.
                    StreamState::RemoteClose | StreamState::Closed => {
                        return Poll::Ready(Ok(()));
                    }
                    _ if this.shared.session.is_closed() => {
                        return Poll::Ready(Err(YamuxError::SessionShutdown.into()));
                    }
                    _ => {
                        inner.read_waker = Some(cx.waker().clone());
                        return Poll::Pending;
                    }
                }
            }

            let n = inner.recv_buf.len().min(buf.remaining());
            let chunk = inner.recv_buf.split_to(n);
            buf.put_slice(&chunk);
            n
        };

        // Consuming freed receive credit; grant it back when due.
        if consumed > 0 {
            let _ = this.shared.send_window_update();
        }

        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();

        let (chunk, flags) = {
            let mut inner = this.shared.inner.lock().unwrap();

            match inner.state {
                StreamState::LocalClose | StreamState::RemoteClose | StreamState::Closed => {
                    return Poll::Ready(Err(YamuxError::StreamClosed.into()));
                }
                StreamState::Reset => {
                    return Poll::Ready(Err(YamuxError::ConnectionReset.into()));
                }
                _ if this.shared.session.is_closed() => {
                    return Poll::Ready(Err(YamuxError::SessionShutdown.into()));
                }
                _ => {}
            }

            if buf.is_empty() {
                return Poll::Ready(Ok(0));
            }

            if inner.send_window == 0 {
                // Parked until a WindowUpdate credits us or the stream
                // closes.
                inner.write_waker = Some(cx.waker().clone());
                return Poll::Pending;
            }

            let k = buf.len().min(inner.send_window as usize);
            let flags = Shared::handshake_flags(&mut inner);
            inner.send_window -= k as u32;
            (Bytes::copy_from_slice(&buf[..k]), flags)
        };

        let n = chunk.len();
        match this
            .shared
            .send_frame(Frame::data(this.shared.id(), flags, chunk))
        {
            Ok(()) => Poll::Ready(Ok(n)),
            Err(e) => Poll::Ready(Err(e.into())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        // Frames are handed straight to the session writer.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        this.perform_close(true);
        Poll::Ready(Ok(()))
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        // Best-effort FIN so the peer is not left waiting; no timer here
        // since Drop may run outside a runtime. A stream that already sent
        // its FIN is left for the peer's FIN to finish off.
        if !self.is_write_closed() {
            self.perform_close(false);
        }
    }
}
