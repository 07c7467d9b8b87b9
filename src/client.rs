//! Connection supervisor: owns one TCP session at a time, drives the
//! authenticator, decoder, assembler and watchdog, and fails over across the
//! server pool when a session dies.

use crate::assembler::{CompletedFile, FileAssembler};
use crate::bus::{EventBus, EventStream, Subscription};
use crate::config::{ByteBlasterOptions, ConfigError};
use crate::protocol::auth::{AUTH_INTERVAL, logon_message};
use crate::protocol::codec;
use crate::protocol::decoder::{DecoderEvent, ProtocolDecoder};
use crate::protocol::segment::QbtSegment;
use crate::servers::ServerEndpoint;
use crate::servers::store::ServerListStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior, interval, interval_at, timeout};

/// Grace period for cooperative shutdown before the session task is aborted.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

const WATCHDOG_TICK: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const QUICK_RETRY: Duration = Duration::from_secs(2);
/// A session that survived this long counts as healthy; its teardown resets
/// the failure accounting instead of escalating the backoff.
const HEALTHY_SESSION: Duration = Duration::from_secs(60);
const READ_CHUNK: usize = 8 * 1024;

/// Receive-only ByteBlaster client.
///
/// `start` spawns the supervisor; segments and completed files flow out
/// through the two subscription surfaces. Everything recoverable (socket
/// errors, watchdog expiry, malformed frames) is absorbed internally; only
/// configuration errors surface, at construction.
#[derive(Debug)]
pub struct ByteBlasterClient {
    options: ByteBlasterOptions,
    email: String,
    store: Arc<ServerListStore>,
    segments: EventBus<QbtSegment>,
    files: EventBus<CompletedFile>,
    state: Arc<ClientState>,
    stop_tx: watch::Sender<bool>,
    supervisor: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

#[derive(Debug, Default)]
struct ClientState {
    running: AtomicBool,
    connected: AtomicBool,
    current_server: Mutex<Option<ServerEndpoint>>,
}

impl ClientState {
    fn set_current_server(&self, server: Option<ServerEndpoint>) {
        let mut guard = match self.current_server.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = server;
    }

    fn current_server(&self) -> Option<ServerEndpoint> {
        match self.current_server.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl ByteBlasterClient {
    /// Validates the options (an unusable email is fatal) and loads the
    /// persisted server list, falling back to the built-in defaults.
    pub async fn new(options: ByteBlasterOptions) -> Result<Self, ConfigError> {
        options.validate()?;
        let email = options.email.trim().to_string();
        let store = Arc::new(
            ServerListStore::load(&options.server_list_path, options.shuffle_servers_on_load)
                .await,
        );
        let (stop_tx, _) = watch::channel(false);
        Ok(Self {
            options,
            email,
            store,
            segments: EventBus::new(),
            files: EventBus::new(),
            state: Arc::new(ClientState::default()),
            stop_tx,
            supervisor: Mutex::new(None),
        })
    }

    /// Spawn the connection supervisor. Idempotent while running.
    pub fn start(&self) {
        if self.state.running.swap(true, Ordering::SeqCst) {
            tracing::warn!("client already running");
            return;
        }
        self.stop_tx.send_replace(false);
        let ctx = SupervisorCtx {
            options: self.options.clone(),
            logon: logon_message(&self.email),
            store: Arc::clone(&self.store),
            segments: self.segments.clone(),
            files: self.files.clone(),
            state: Arc::clone(&self.state),
            stop_rx: self.stop_tx.subscribe(),
        };
        let handle = tokio::spawn(run_supervisor(ctx));
        *self.lock_supervisor() = Some(handle);
        tracing::info!(email = self.email.as_str(), "client started");
    }

    /// Request shutdown and wait for the supervisor to wind down. If it does
    /// not finish within the grace period (default 5 s) the task is aborted
    /// and the socket dies with it.
    pub async fn stop(&self, grace: Option<Duration>) {
        if !self.state.running.load(Ordering::SeqCst) {
            return;
        }
        tracing::info!("stopping client");
        self.stop_tx.send_replace(true);
        let handle = self.lock_supervisor().take();
        if let Some(mut handle) = handle {
            let grace = grace.unwrap_or(DEFAULT_STOP_TIMEOUT);
            if timeout(grace, &mut handle).await.is_err() {
                tracing::warn!(grace = ?grace, "cooperative shutdown timed out; aborting");
                handle.abort();
                let _ = handle.await;
            }
        }
        self.state.running.store(false, Ordering::SeqCst);
        self.state.connected.store(false, Ordering::SeqCst);
        self.state.set_current_server(None);
        tracing::info!("client stopped");
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    pub fn current_server(&self) -> Option<ServerEndpoint> {
        self.state.current_server()
    }

    pub fn server_count(&self) -> usize {
        self.store.len()
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    /// Backpressuring stream of every validated segment. Dropping the stream
    /// unsubscribes.
    pub fn segment_stream(&self) -> EventStream<QbtSegment> {
        self.segments.subscribe(self.options.segment_queue_capacity)
    }

    /// Backpressuring stream of completed files.
    pub fn file_stream(&self) -> EventStream<CompletedFile> {
        self.files.subscribe(self.options.file_queue_capacity)
    }

    /// Segment stream with a caller-chosen queue depth.
    pub fn segment_stream_with_capacity(&self, capacity: usize) -> EventStream<QbtSegment> {
        self.segments.subscribe(capacity)
    }

    /// File stream with a caller-chosen queue depth.
    pub fn file_stream_with_capacity(&self, capacity: usize) -> EventStream<CompletedFile> {
        self.files.subscribe(capacity)
    }

    /// Callback subscription for segments; a slow handler sheds oldest
    /// events instead of stalling the network reader.
    pub fn on_segment<F>(&self, handler: F) -> Subscription<QbtSegment>
    where
        F: FnMut(QbtSegment) -> anyhow::Result<()> + Send + 'static,
    {
        self.segments
            .subscribe_with(self.options.segment_queue_capacity, handler)
    }

    /// Callback subscription for completed files.
    pub fn on_file<F>(&self, handler: F) -> Subscription<CompletedFile>
    where
        F: FnMut(CompletedFile) -> anyhow::Result<()> + Send + 'static,
    {
        self.files
            .subscribe_with(self.options.file_queue_capacity, handler)
    }

    fn lock_supervisor(&self) -> std::sync::MutexGuard<'_, Option<tokio::task::JoinHandle<()>>> {
        match self.supervisor.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

struct SupervisorCtx {
    options: ByteBlasterOptions,
    logon: Vec<u8>,
    store: Arc<ServerListStore>,
    segments: EventBus<QbtSegment>,
    files: EventBus<CompletedFile>,
    state: Arc<ClientState>,
    stop_rx: watch::Receiver<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Stopped,
    Closed,
    SocketError,
    WatchdogExpired,
    ExceptionBudget,
}

async fn run_supervisor(mut ctx: SupervisorCtx) {
    tracing::info!(servers = ctx.store.len(), "connection supervisor started");
    let mut consecutive_failures: usize = 0;
    let mut failed_sweeps: u32 = 0;

    loop {
        if *ctx.stop_rx.borrow() {
            break;
        }
        let Some(server) = ctx.store.next() else {
            tracing::error!("no servers available");
            if !wait_or_stop(&mut ctx.stop_rx, ctx.options.reconnect_delay()).await {
                break;
            }
            continue;
        };

        tracing::info!(server = %server, attempt = consecutive_failures + 1, "connecting");
        let connect = TcpStream::connect((server.host.as_str(), server.port));
        match timeout(ctx.options.connection_timeout(), connect).await {
            Ok(Ok(stream)) => {
                ctx.state.connected.store(true, Ordering::SeqCst);
                ctx.state.set_current_server(Some(server.clone()));
                tracing::info!(server = %server, "connected");

                let started = Instant::now();
                let end = run_session(stream, &server, &mut ctx).await;

                ctx.state.connected.store(false, Ordering::SeqCst);
                ctx.state.set_current_server(None);
                tracing::info!(server = %server, reason = ?end, "session ended");
                if end == SessionEnd::Stopped {
                    break;
                }
                // A session that died right after connecting is a failure
                // like any other; only a healthy run resets the escalation.
                if started.elapsed() >= HEALTHY_SESSION {
                    consecutive_failures = 0;
                    failed_sweeps = 0;
                    if !wait_or_stop(&mut ctx.stop_rx, ctx.options.reconnect_delay()).await {
                        break;
                    }
                } else {
                    let delay = ctx.options.reconnect_delay();
                    if !failure_delay(
                        &mut ctx,
                        &mut consecutive_failures,
                        &mut failed_sweeps,
                        delay,
                    )
                    .await
                    {
                        break;
                    }
                }
            }
            Ok(Err(err)) => {
                tracing::warn!(server = %server, error = %err, "connect failed");
                let delay = ctx.options.reconnect_delay().min(QUICK_RETRY);
                if !failure_delay(&mut ctx, &mut consecutive_failures, &mut failed_sweeps, delay)
                    .await
                {
                    break;
                }
            }
            Err(_) => {
                tracing::warn!(
                    server = %server,
                    timeout = ?ctx.options.connection_timeout(),
                    "connect timed out"
                );
                let delay = ctx.options.reconnect_delay().min(QUICK_RETRY);
                if !failure_delay(&mut ctx, &mut consecutive_failures, &mut failed_sweeps, delay)
                    .await
                {
                    break;
                }
            }
        }
    }

    ctx.state.running.store(false, Ordering::SeqCst);
    ctx.state.connected.store(false, Ordering::SeqCst);
    ctx.state.set_current_server(None);
    tracing::info!("connection supervisor stopped");
}

/// Shared failure accounting for failed connects and short-lived sessions:
/// wait `delay` before the next attempt, and once the whole pool has failed
/// twice over, back off exponentially and restart the rotation from the top.
/// False when stop fired during the wait.
async fn failure_delay(
    ctx: &mut SupervisorCtx,
    consecutive_failures: &mut usize,
    failed_sweeps: &mut u32,
    delay: Duration,
) -> bool {
    *consecutive_failures += 1;
    let full_sweep = ctx.store.len().max(1) * 2;
    if *consecutive_failures >= full_sweep {
        *failed_sweeps += 1;
        let backoff = backoff_delay(ctx.options.reconnect_delay(), *failed_sweeps);
        tracing::warn!(
            failures = *consecutive_failures,
            backoff = ?backoff,
            "every server failed; backing off"
        );
        *consecutive_failures = 0;
        ctx.store.reset_cursor();
        wait_or_stop(&mut ctx.stop_rx, backoff).await
    } else {
        wait_or_stop(&mut ctx.stop_rx, delay).await
    }
}

fn backoff_delay(base: Duration, failed_sweeps: u32) -> Duration {
    let factor = 1u32 << failed_sweeps.min(4);
    base.saturating_mul(factor).min(MAX_BACKOFF)
}

/// False when the stop signal fired (or the client was dropped) mid-wait.
async fn wait_or_stop(stop_rx: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = wait_for_stop(stop_rx) => false,
    }
}

/// Resolves once the stop signal is set. Equivalent to
/// `stop_rx.wait_for(|stopped| *stopped)`, but avoids returning the
/// non-`Send` `watch::Ref` guard so this can be selected alongside branches
/// that `.await` in their own bodies.
async fn wait_for_stop(stop_rx: &mut watch::Receiver<bool>) {
    loop {
        if *stop_rx.borrow() {
            return;
        }
        if stop_rx.changed().await.is_err() {
            return;
        }
    }
}

/// One TCP session: logon, then a single select loop covering the reader,
/// the 115-second keepalive, the watchdog tick and the stop signal. Partial
/// decode and assembly state dies with the session.
async fn run_session(
    stream: TcpStream,
    server: &ServerEndpoint,
    ctx: &mut SupervisorCtx,
) -> SessionEnd {
    let (mut reader, mut writer) = stream.into_split();

    if let Err(err) = writer.write_all(&ctx.logon).await {
        tracing::warn!(error = %err, "failed to send logon");
        return SessionEnd::SocketError;
    }
    tracing::debug!("logon sent");

    let mut decoder = ProtocolDecoder::new(server.to_string());
    let mut assembler = FileAssembler::new(
        ctx.options.assembler_idle_timeout(),
        ctx.options.assembler_capacity,
    );
    let mut keepalive = interval_at(Instant::now() + AUTH_INTERVAL, AUTH_INTERVAL);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut watchdog = interval(WATCHDOG_TICK);
    watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_read = Instant::now();
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        tokio::select! {
            _ = wait_for_stop(&mut ctx.stop_rx) => {
                return SessionEnd::Stopped;
            }
            res = reader.read(&mut chunk) => match res {
                Ok(0) => {
                    tracing::info!("server closed the connection");
                    return SessionEnd::Closed;
                }
                Ok(n) => {
                    last_read = Instant::now();
                    codec::xor_mask_in_place(&mut chunk[..n]);
                    for event in decoder.feed(&chunk[..n]) {
                        match event {
                            DecoderEvent::Segment(segment) => {
                                tracing::debug!(segment = %segment, "segment received");
                                ctx.segments.publish(segment.clone()).await;
                                if let Some(file) = assembler.insert(segment) {
                                    tracing::info!(
                                        filename = file.filename.as_str(),
                                        blocks = file.block_count,
                                        bytes = file.data.len(),
                                        "file completed"
                                    );
                                    ctx.files.publish(file).await;
                                }
                            }
                            DecoderEvent::ServerList(update) => {
                                tracing::info!(
                                    servers = update.list.servers.len(),
                                    sat_servers = update.list.sat_servers.len(),
                                    "server list updated; takes effect on next reconnect"
                                );
                                ctx.store.replace(update.list).await;
                            }
                        }
                    }
                    if decoder.consecutive_failures() >= ctx.options.max_exceptions {
                        tracing::warn!(
                            failures = decoder.consecutive_failures(),
                            "decoder exception budget exceeded"
                        );
                        return SessionEnd::ExceptionBudget;
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "socket read failed");
                    return SessionEnd::SocketError;
                }
            },
            _ = keepalive.tick() => {
                if let Err(err) = writer.write_all(&ctx.logon).await {
                    tracing::warn!(error = %err, "keepalive write failed");
                    return SessionEnd::SocketError;
                }
                tracing::debug!("keepalive logon sent");
            }
            _ = watchdog.tick() => {
                assembler.sweep();
                let idle = last_read.elapsed();
                if idle > ctx.options.watchdog_timeout() {
                    tracing::warn!(idle = ?idle, "watchdog expired; closing session");
                    return SessionEnd::WatchdogExpired;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_list_path(tag: &str) -> String {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        std::env::temp_dir()
            .join(format!("byteblaster-client-{tag}-{nanos}"))
            .join("servers.json")
            .display()
            .to_string()
    }

    #[tokio::test]
    async fn empty_email_refuses_to_construct() {
        let mut options = ByteBlasterOptions::new("   ");
        options.server_list_path = temp_list_path("email");
        let err = ByteBlasterClient::new(options).await.expect_err("must fail");
        assert_eq!(err, ConfigError::EmptyEmail);
    }

    #[tokio::test]
    async fn fresh_client_exposes_defaults() {
        let mut options = ByteBlasterOptions::new("ops@example.com");
        options.server_list_path = temp_list_path("defaults");
        let client = ByteBlasterClient::new(options).await.expect("client");

        assert!(!client.is_running());
        assert!(!client.is_connected());
        assert!(client.current_server().is_none());
        assert_eq!(client.server_count(), crate::servers::DEFAULT_SERVERS.len());
        assert_eq!(client.email(), "ops@example.com");
    }

    #[tokio::test]
    async fn stop_without_start_is_a_no_op() {
        let mut options = ByteBlasterOptions::new("ops@example.com");
        options.server_list_path = temp_list_path("noop");
        let client = ByteBlasterClient::new(options).await.expect("client");
        client.stop(Some(Duration::from_millis(100))).await;
        assert!(!client.is_running());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_secs(5);
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(10));
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(20));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(40));
        assert_eq!(backoff_delay(base, 4), Duration::from_secs(60));
        assert_eq!(backoff_delay(base, 10), Duration::from_secs(60));
    }
}
