use crate::{
    backlog::Backlog,
    codec::Codec,
    config::Config,
    error::{Result, YamuxError},
    frame::Frame,
    header::{Flags, FrameType, GoAwayCode},
    stream::{Shared, Stream, StreamState},
    stream_id::StreamIdGenerator,
};
use dashmap::{DashMap, DashSet};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use std::{
    marker::PhantomData,
    pin::pin,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex, Weak,
    },
    time::{Duration, Instant},
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{oneshot, Notify, OwnedSemaphorePermit},
    time::timeout,
};
use tokio_util::codec::Framed;

/// Why the session went down; the first recorded reason wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ShutdownReason {
    LocalClose,
    PipeClosed,
    ConnectionWriteTimeout,
    KeepAliveTimeout,
    StreamOpenTimeout,
    ProtocolError,
}

impl ShutdownReason {
    fn to_error(self) -> YamuxError {
        match self {
            ShutdownReason::ConnectionWriteTimeout => YamuxError::ConnectionWriteTimeout,
            ShutdownReason::KeepAliveTimeout => YamuxError::KeepAliveTimeout,
            ShutdownReason::StreamOpenTimeout => YamuxError::StreamOpenTimeout,
            ShutdownReason::LocalClose
            | ShutdownReason::PipeClosed
            | ShutdownReason::ProtocolError => YamuxError::SessionShutdown,
        }
    }
}

/// Session liveness shared with every stream and background task.
#[derive(Debug, Clone)]
pub(crate) struct SessionState {
    die: Arc<Notify>,
    closed: Arc<AtomicBool>,
    reason: Arc<Mutex<Option<ShutdownReason>>>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            die: Arc::new(Notify::new()),
            closed: Arc::new(AtomicBool::new(false)),
            reason: Arc::new(Mutex::new(None)),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn close_notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.die)
    }

    fn shutdown(&self, reason: ShutdownReason) -> bool {
        let mut slot = self.reason.lock().unwrap();
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        *slot = Some(reason);
        drop(slot);
        self.die.notify_waiters();
        true
    }

    fn shutdown_error(&self) -> Option<YamuxError> {
        self.reason.lock().unwrap().map(ShutdownReason::to_error)
    }
}

/// A remotely-opened stream parked until the application accepts it. The
/// backlog permit rides along and frees its slot when the entry leaves the
/// queue.
#[derive(Debug)]
struct Accepted {
    stream: Stream,
    _permit: OwnedSemaphorePermit,
}

/// Clears a pending ping entry on every exit path. Callers routinely wrap
/// `ping()` in a timeout, which drops the future without running any
/// select arm; without the guard the token would leak in the table.
struct PingGuard<'a> {
    pings: &'a DashMap<u32, oneshot::Sender<()>>,
    token: u32,
}

impl Drop for PingGuard<'_> {
    fn drop(&mut self) {
        self.pings.remove(&self.token);
    }
}

/// Transport-independent session internals, shared between the public
/// handle, the background tasks and (weakly) every stream.
#[derive(Debug)]
pub(crate) struct SessionCore {
    /// Handed to streams and timers so they can reach back without keeping
    /// the session alive.
    weak_self: Weak<SessionCore>,
    pub(crate) config: Arc<Config>,
    state: SessionState,
    /// Active streams by ID.
    streams: DashMap<u32, Arc<Shared>>,
    /// Locally-opened streams still waiting for the peer's ACK.
    inflight: DashSet<u32>,
    backlog: Backlog,
    accept_tx: flume::Sender<Accepted>,
    accept_rx: flume::Receiver<Accepted>,
    /// Outbound frames; drained by the writer task.
    frame_tx: flume::Sender<Frame>,
    ids: StreamIdGenerator,
    /// Outstanding pings by token.
    pings: DashMap<u32, oneshot::Sender<()>>,
    next_ping_id: AtomicU32,
    local_go_away: AtomicBool,
    remote_go_away: AtomicBool,
}

impl SessionCore {
    pub(crate) fn new(config: Config, is_client: bool) -> (Arc<Self>, flume::Receiver<Frame>) {
        let (frame_tx, frame_rx) = flume::unbounded();
        let (accept_tx, accept_rx) = flume::unbounded();

        let core = Arc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            backlog: Backlog::new(config.accept_backlog),
            config: Arc::new(config),
            state: SessionState::new(),
            streams: DashMap::new(),
            inflight: DashSet::new(),
            accept_tx,
            accept_rx,
            frame_tx,
            ids: StreamIdGenerator::new(is_client),
            pings: DashMap::new(),
            next_ping_id: AtomicU32::new(0),
            local_go_away: AtomicBool::new(false),
            remote_go_away: AtomicBool::new(false),
        });

        (core, frame_rx)
    }

    fn send_frame(&self, frame: Frame) -> Result<()> {
        if self.state.is_closed() {
            return Err(YamuxError::SessionShutdown);
        }
        self.frame_tx
            .send(frame)
            .map_err(|_| YamuxError::SessionShutdown)
    }

    pub(crate) fn open_stream(&self) -> Result<Stream> {
        if self.state.is_closed() || self.local_go_away.load(Ordering::SeqCst) {
            return Err(YamuxError::SessionShutdown);
        }
        if self.remote_go_away.load(Ordering::SeqCst) {
            return Err(YamuxError::RemoteGoAway);
        }

        let id = self.ids.next()?;
        let shared = Shared::new(
            id,
            Arc::clone(&self.config),
            self.state.clone(),
            self.frame_tx.clone(),
            StreamState::Init,
        );
        self.streams.insert(id, Arc::clone(&shared));
        self.inflight.insert(id);

        // The opening window update carries the SYN.
        if let Err(e) = shared.send_window_update() {
            self.close_stream(id);
            return Err(e);
        }
        self.arm_open_timer(id);

        Ok(Stream::new(shared, self.weak_self.clone()))
    }

    /// A peer that never ACKs an open is broken; that tears down the whole
    /// session, not just the stream.
    fn arm_open_timer(&self, id: u32) {
        let delay = self.config.stream_open_timeout;
        if delay.is_zero() {
            return;
        }

        let weak = self.weak_self.clone();
        let die = self.state.close_notifier();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    if let Some(core) = weak.upgrade() {
                        if core.inflight.contains(&id) {
                            tracing::error!(stream_id = id, "stream open timed out waiting for peer ACK");
                            core.shutdown(ShutdownReason::StreamOpenTimeout);
                        }
                    }
                }
                _ = die.notified() => {}
            }
        });
    }

    pub(crate) async fn accept_stream(&self) -> Result<Stream> {
        let die = self.state.close_notifier();
        let mut shutdown = pin!(die.notified());
        shutdown.as_mut().enable();

        if self.state.is_closed() {
            return Err(YamuxError::SessionShutdown);
        }

        tokio::select! {
            accepted = self.accept_rx.recv_async() => match accepted {
                Ok(accepted) => Ok(accepted.stream),
                Err(_) => Err(YamuxError::SessionShutdown),
            },
            _ = &mut shutdown => Err(YamuxError::SessionShutdown),
        }
    }

    pub(crate) async fn ping(&self) -> Result<Duration> {
        let die = self.state.close_notifier();
        let mut shutdown = pin!(die.notified());
        shutdown.as_mut().enable();

        if self.state.is_closed() {
            return Err(YamuxError::SessionShutdown);
        }

        let token = self.next_ping_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pings.insert(token, tx);
        let _guard = PingGuard {
            pings: &self.pings,
            token,
        };

        let start = Instant::now();
        self.send_frame(Frame::ping(Flags::SYN, token))?;

        tokio::select! {
            res = rx => match res {
                Ok(()) => Ok(start.elapsed()),
                Err(_) => Err(YamuxError::SessionShutdown),
            },
            _ = &mut shutdown => Err(YamuxError::SessionShutdown),
        }
    }

    /// Announce shutdown to the peer. New local opens fail from here on;
    /// existing streams keep draining.
    pub(crate) fn go_away(&self, code: GoAwayCode) -> Result<()> {
        self.send_frame(Frame::go_away(code))?;
        self.local_go_away.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub(crate) fn close(&self) {
        // Best-effort GoAway ahead of teardown; the writer drains it.
        let _ = self.go_away(GoAwayCode::Normal);
        self.shutdown(ShutdownReason::LocalClose);
    }

    pub(crate) fn shutdown(&self, reason: ShutdownReason) {
        if !self.state.shutdown(reason) {
            return;
        }
        match reason {
            ShutdownReason::LocalClose => tracing::debug!("session closed locally"),
            reason => tracing::error!(?reason, "session shutdown"),
        }

        self.backlog.close();

        // Cancel every stream; pending reads and writes fail with
        // ConnectionReset.
        for entry in self.streams.iter() {
            entry.value().force_reset();
        }
        self.streams.clear();
        self.inflight.clear();

        // Outstanding pings resolve with an error when their senders drop.
        self.pings.clear();

        // Discard queued-but-unaccepted streams; their permits release.
        while self.accept_rx.try_recv().is_ok() {}
    }

    pub(crate) fn close_stream(&self, id: u32) {
        self.streams.remove(&id);
        self.inflight.remove(&id);
    }

    fn close_notifier(&self) -> Arc<Notify> {
        self.state.close_notifier()
    }

    pub(crate) fn num_streams(&self) -> usize {
        self.streams.len()
    }

    #[cfg(test)]
    fn num_pending_pings(&self) -> usize {
        self.pings.len()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    pub(crate) fn shutdown_error(&self) -> Option<YamuxError> {
        self.state.shutdown_error()
    }

    /// Routes one inbound frame. An error return is session-fatal; stream-
    /// contained failures are handled here.
    pub(crate) async fn dispatch(&self, frame: Frame) -> Result<()> {
        match frame.header.typ {
            FrameType::Data | FrameType::WindowUpdate => self.dispatch_stream(frame).await,
            FrameType::Ping => self.handle_ping(frame),
            FrameType::GoAway => {
                self.handle_go_away(frame.header.length);
                Ok(())
            }
        }
    }

    async fn dispatch_stream(&self, frame: Frame) -> Result<()> {
        let id = frame.header.stream_id;
        let flags = frame.header.flags;

        let shared = match self.streams.get(&id) {
            Some(entry) => Arc::clone(entry.value()),
            None => {
                if flags.contains(Flags::SYN) {
                    return self.incoming_stream(frame).await;
                }
                // Late frames for a dead stream. RSTing a RST or a
                // straggler FIN would ping-pong resets between the peers.
                if !flags.contains(Flags::RST) && !flags.contains(Flags::FIN) {
                    tracing::debug!(stream_id = id, "frame for unknown stream, resetting");
                    let _ = self.send_frame(Frame::window_update(id, Flags::RST, 0));
                }
                return Ok(());
            }
        };

        if flags.contains(Flags::SYN) {
            return Err(YamuxError::DuplicateStream(id));
        }

        let result = match frame.header.typ {
            FrameType::Data => shared.on_data(flags, frame.body),
            _ => shared.on_window_update(flags, frame.header.length),
        };

        match result {
            Ok(update) => {
                if update.established {
                    self.inflight.remove(&id);
                }
                if update.terminal {
                    self.close_stream(id);
                }
                Ok(())
            }
            // One classification drives containment: non-fatal stream
            // failures reset the stream, fatal ones take the session down.
            Err(e) if !e.is_session_fatal() => {
                tracing::warn!(stream_id = id, error = %e, "resetting misbehaving stream");
                let _ = self.send_frame(Frame::window_update(id, Flags::RST, 0));
                shared.force_reset();
                self.close_stream(id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn incoming_stream(&self, frame: Frame) -> Result<()> {
        let id = frame.header.stream_id;
        self.ids.validate_peer_stream_id(id)?;

        if self.local_go_away.load(Ordering::SeqCst) {
            // Draining; refuse new work.
            let _ = self.send_frame(Frame::window_update(id, Flags::RST, 0));
            return Ok(());
        }

        // Admission is gated by the accept backlog. When the gate is full
        // the read loop waits here, pushing back through the pipe instead
        // of resetting the stream.
        let permit = match self.backlog.try_acquire() {
            Some(permit) => permit,
            None => {
                tracing::warn!(stream_id = id, "accept backlog full, deferring stream admission");
                self.backlog.acquire().await?
            }
        };

        let shared = Shared::new(
            id,
            Arc::clone(&self.config),
            self.state.clone(),
            self.frame_tx.clone(),
            StreamState::SynReceived,
        );
        self.streams.insert(id, Arc::clone(&shared));

        // The ACK rides on the first window update.
        shared.send_window_update()?;

        // Payload or credit that traveled with the SYN.
        let result = match frame.header.typ {
            FrameType::Data => shared.on_data(frame.header.flags, frame.body),
            _ => shared.on_window_update(frame.header.flags, frame.header.length),
        };
        match result {
            Ok(update) if update.terminal => {
                // Opened and torn down in the same frame; nothing to
                // surface.
                self.close_stream(id);
                return Ok(());
            }
            Ok(_) => {}
            Err(e) if !e.is_session_fatal() => {
                tracing::warn!(stream_id = id, error = %e, "resetting stream rejected at admission");
                let _ = self.send_frame(Frame::window_update(id, Flags::RST, 0));
                shared.force_reset();
                self.close_stream(id);
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let accepted = Accepted {
            stream: Stream::new(shared, self.weak_self.clone()),
            _permit: permit,
        };
        if self.accept_tx.send(accepted).is_err() {
            self.close_stream(id);
            return Err(YamuxError::SessionShutdown);
        }
        Ok(())
    }

    fn handle_ping(&self, frame: Frame) -> Result<()> {
        let token = frame.header.length;
        if frame.header.flags.contains(Flags::SYN) {
            self.send_frame(Frame::ping(Flags::ACK, token))?;
        } else if frame.header.flags.contains(Flags::ACK) {
            if let Some((_, waiter)) = self.pings.remove(&token) {
                let _ = waiter.send(());
            }
        } else {
            tracing::debug!(token, "ignoring ping without SYN or ACK");
        }
        Ok(())
    }

    fn handle_go_away(&self, code: u32) {
        self.remote_go_away.store(true, Ordering::SeqCst);
        match GoAwayCode::from_code(code) {
            Some(GoAwayCode::Normal) => tracing::debug!("peer initiated graceful shutdown"),
            Some(GoAwayCode::ProtocolError) => tracing::error!("peer reported a protocol error"),
            Some(GoAwayCode::InternalError) => tracing::error!("peer reported an internal error"),
            None => tracing::warn!(code, "peer sent GoAway with unknown code"),
        }
    }
}

/// A multiplexed session over a single reliable byte pipe.
///
/// One task reads and dispatches inbound frames, a second owns the write
/// half and serializes every outbound frame, and an optional third probes
/// liveness with pings.
#[derive(Debug)]
pub struct Session<T> {
    core: Arc<SessionCore>,
    _transport: PhantomData<T>,
}

impl<T> Clone for Session<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            _transport: PhantomData,
        }
    }
}

impl<T> Session<T>
where
    T: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static,
{
    /// Create a new client session. The client allocates odd stream IDs
    /// and initiates stream opens with SYN.
    pub async fn client(transport: T, config: Config) -> Result<Self> {
        Self::new(transport, config, true).await
    }

    /// Create a new server session; even stream IDs.
    pub async fn server(transport: T, config: Config) -> Result<Self> {
        Self::new(transport, config, false).await
    }

    async fn new(transport: T, config: Config, is_client: bool) -> Result<Self> {
        config.validate()?;

        let codec = Codec::new(&config);
        let framed = Framed::new(transport, codec);
        let (sink, stream) = framed.split();

        let (core, frame_rx) = SessionCore::new(config, is_client);

        let recv_core = Arc::clone(&core);
        tokio::spawn(async move {
            recv_loop(stream, recv_core).await;
        });

        let send_core = Arc::clone(&core);
        tokio::spawn(async move {
            send_loop(sink, frame_rx, send_core).await;
        });

        if core.config.enable_keep_alive {
            let keep_alive_core = Arc::clone(&core);
            tokio::spawn(async move {
                keep_alive_loop(keep_alive_core).await;
            });
        }

        Ok(Session {
            core,
            _transport: PhantomData,
        })
    }

    /// Open a new outgoing stream. The opening frame carries SYN; the
    /// stream is usable immediately and establishes when the peer ACKs.
    pub async fn open_stream(&self) -> Result<Stream> {
        self.core.open_stream()
    }

    /// Accept an incoming stream initiated by the peer.
    pub async fn accept_stream(&self) -> Result<Stream> {
        self.core.accept_stream().await
    }

    /// Round-trip liveness probe; resolves to the observed RTT.
    pub async fn ping(&self) -> Result<Duration> {
        self.core.ping().await
    }

    /// Tell the peer to stop opening streams; existing streams drain
    /// normally.
    pub async fn go_away(&self) -> Result<()> {
        self.core.go_away(GoAwayCode::Normal)
    }

    /// Close the session: cancels all streams and closes the pipe.
    pub async fn close(&self) -> Result<()> {
        self.core.close();
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    /// The terminal error of a closed session, if any.
    pub fn shutdown_error(&self) -> Option<YamuxError> {
        self.core.shutdown_error()
    }

    /// Number of active streams in the registry.
    pub fn num_streams(&self) -> usize {
        self.core.num_streams()
    }
}

/// Background task reading frames off the pipe and dispatching them.
async fn recv_loop<T>(mut stream: SplitStream<Framed<T, Codec>>, core: Arc<SessionCore>)
where
    T: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static,
{
    let die = core.close_notifier();
    let mut shutdown = pin!(die.notified());
    shutdown.as_mut().enable();

    loop {
        if core.is_closed() {
            break;
        }
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(frame)) => {
                    if let Err(e) = core.dispatch(frame).await {
                        tracing::error!(error = %e, "protocol violation, tearing down session");
                        let _ = core.send_frame(Frame::go_away(GoAwayCode::ProtocolError));
                        core.shutdown(ShutdownReason::ProtocolError);
                        break;
                    }
                }
                Some(Err(e)) => {
                    tracing::error!(error = %e, "frame decode failed");
                    let _ = core.send_frame(Frame::go_away(GoAwayCode::ProtocolError));
                    core.shutdown(ShutdownReason::ProtocolError);
                    break;
                }
                None => {
                    tracing::debug!("pipe closed by peer");
                    core.shutdown(ShutdownReason::PipeClosed);
                    break;
                }
            },
            _ = &mut shutdown => break,
        }
    }

    core.shutdown(ShutdownReason::PipeClosed);
}

/// Background task owning the write half; every outbound frame funnels
/// through here, each write bounded by the connection write timeout.
async fn send_loop<T>(
    mut sink: SplitSink<Framed<T, Codec>, Frame>,
    frame_rx: flume::Receiver<Frame>,
    core: Arc<SessionCore>,
) where
    T: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static,
{
    let write_timeout = core.config.connection_write_timeout;
    let die = core.close_notifier();
    let mut shutdown = pin!(die.notified());
    shutdown.as_mut().enable();

    loop {
        if core.is_closed() {
            break;
        }
        tokio::select! {
            frame = frame_rx.recv_async() => match frame {
                Ok(frame) => match timeout(write_timeout, sink.send(frame)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::error!(error = %e, "frame write failed");
                        core.shutdown(ShutdownReason::PipeClosed);
                        break;
                    }
                    Err(_) => {
                        tracing::error!("connection write timeout");
                        core.shutdown(ShutdownReason::ConnectionWriteTimeout);
                        break;
                    }
                },
                Err(_) => break,
            },
            _ = &mut shutdown => break,
        }
    }

    // Flush what was queued before the shutdown (lets the GoAway out).
    while let Ok(frame) = frame_rx.try_recv() {
        match timeout(write_timeout, sink.send(frame)).await {
            Ok(Ok(())) => {}
            _ => break,
        }
    }

    core.shutdown(ShutdownReason::PipeClosed);
}

/// Periodic liveness probing; two consecutive unanswered pings kill the
/// session.
async fn keep_alive_loop(core: Arc<SessionCore>) {
    let period = core.config.keep_alive_interval;
    let die = core.close_notifier();
    let mut shutdown = pin!(die.notified());
    shutdown.as_mut().enable();

    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    let mut failures: u32 = 0;

    loop {
        if core.is_closed() {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {
                match timeout(core.config.connection_write_timeout, core.ping()).await {
                    Ok(Ok(rtt)) => {
                        failures = 0;
                        tracing::trace!(rtt_us = rtt.as_micros() as u64, "keep-alive ping");
                    }
                    Ok(Err(_)) | Err(_) => {
                        failures += 1;
                        tracing::warn!(failures, "keep-alive ping went unanswered");
                        if failures >= 2 {
                            tracing::error!("keep-alive failed twice, tearing down session");
                            core.shutdown(ShutdownReason::KeepAliveTimeout);
                            break;
                        }
                    }
                }
            }
            _ = &mut shutdown => break,
        }
    }
}
