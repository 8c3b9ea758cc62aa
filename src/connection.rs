//! Connection manager: owns the current transport, walks the candidate
//! endpoint list, auto-starts a local broker on refusal, and reconnects
//! after a remote close.
//!
//! All socket I/O happens on one dedicated background thread per
//! [`ConnectionManager`] — the original's single-threaded cooperative event
//! loop runs there rather than on the caller's thread, but the
//! serialization guarantee is the same: exactly one thread ever touches the
//! transport or the codec, and [`ConnectionManager::poll`] drains its
//! outbound event queue on the caller's thread in arrival order. Writes are
//! likewise funneled through a command channel so the background thread
//! remains the sole owner of the transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::codec::{Codec, DecodedFrame, FrameDecoder};
use crate::endpoint::Endpoint;
use crate::message::Message;
use crate::spawner::Spawner;
use crate::transport::Transport;

/// Delay before retrying the same candidate after a remote close, and
/// before retrying after a local-broker spawn.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Minimum spacing between two broker spawn attempts for the *same*
/// candidate, guarding against rapid rewind-and-retry spawning the broker
/// twice in quick succession.
const SPAWN_COOLDOWN: Duration = Duration::from_secs(2);

/// How long the background thread blocks on a single read before checking
/// its command queue again — the connection manager's approximation of
/// cooperative "socket read-ready wait" scheduling.
const READ_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Events the connection manager reports upward to the session layer.
#[derive(Debug)]
pub enum ConnEvent {
    /// The transport reached `candidates[cursor]`.
    Connected(Endpoint),
    /// The transport closed, either because the peer closed it (`remote ==
    /// true`, a reconnect to the same cursor is already scheduled) or
    /// because [`ConnectionManager::disconnect`] was called (`remote ==
    /// false`, no reconnect follows).
    Closed { remote: bool },
    /// The candidate list was exhausted without a successful connection.
    UnableToConnect,
    /// One fully decoded incoming frame.
    Frame(DecodedFrame),
}

/// Commands accepted by the background thread.
#[derive(Debug)]
enum ConnCommand {
    SendTo(Vec<i32>, Message),
    Disconnect,
}

/// Mutable connection policy, shared with the background thread so
/// `set_server_command` / `set_attempt_to_start_server` / `set_server_urls`
/// take effect on the next connect cycle without restarting the manager.
#[derive(Debug, Clone)]
struct SharedConfig {
    candidates: Vec<Endpoint>,
    server_command: String,
    attempt_to_start_server: bool,
}

/// Owns the transport lifecycle for one client session.
pub struct ConnectionManager {
    shared: Arc<Mutex<SharedConfig>>,
    cmd_tx: Option<Sender<ConnCommand>>,
    evt_rx: Receiver<ConnEvent>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    local_hostname: String,
}

impl ConnectionManager {
    #[must_use]
    pub fn new(
        candidates: Vec<Endpoint>,
        server_command: String,
        attempt_to_start_server: bool,
        spawner: Arc<dyn Spawner>,
        local_hostname: String,
    ) -> Self {
        let shared = Arc::new(Mutex::new(SharedConfig {
            candidates,
            server_command,
            attempt_to_start_server,
        }));
        let (cmd_tx, cmd_rx) = mpsc::channel();
        let (evt_tx, evt_rx) = mpsc::channel();
        let running = Arc::new(AtomicBool::new(false));

        let worker = {
            let shared = Arc::clone(&shared);
            let running = Arc::clone(&running);
            let local_hostname = local_hostname.clone();
            thread::Builder::new()
                .name("coserver-connection".to_string())
                .spawn(move || run(shared, spawner, local_hostname, cmd_rx, evt_tx, running))
                .expect("spawn connection manager thread")
        };

        Self {
            shared,
            cmd_tx: Some(cmd_tx),
            evt_rx,
            running,
            worker: Some(worker),
            local_hostname,
        }
    }

    /// Starts (or restarts) the connect walk from the beginning of the
    /// candidate list.
    pub fn connect(&mut self) {
        self.running.store(true, Ordering::SeqCst);
    }

    /// Closes the transport immediately; no reconnect follows.
    pub fn disconnect(&self) {
        if let Some(tx) = &self.cmd_tx {
            let _ = tx.send(ConnCommand::Disconnect);
        }
    }

    /// Encodes and sends one message toward the broker. The caller is
    /// responsible for only calling this while connected; the background
    /// thread silently drops the command if no transport is open.
    pub fn send(&self, to_ids: Vec<i32>, message: Message) {
        if let Some(tx) = &self.cmd_tx {
            let _ = tx.send(ConnCommand::SendTo(to_ids, message));
        }
    }

    /// Replaces the candidate endpoint list. Does not interrupt an
    /// in-progress `UnableToConnect` walk — it takes effect starting with
    /// the next `connect()` call.
    pub fn set_server_urls(&self, candidates: Vec<Endpoint>) {
        self.shared.lock().unwrap_or_else(|e| e.into_inner()).candidates = candidates;
    }

    pub fn set_server_command(&self, command: String) {
        self.shared.lock().unwrap_or_else(|e| e.into_inner()).server_command = command;
    }

    pub fn set_attempt_to_start_server(&self, attempt: bool) {
        self.shared
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .attempt_to_start_server = attempt;
    }

    /// Drains every [`ConnEvent`] queued since the last call, in arrival
    /// order. Never blocks.
    pub fn poll(&self) -> Vec<ConnEvent> {
        let mut events = Vec::new();
        loop {
            match self.evt_rx.try_recv() {
                Ok(evt) => events.push(evt),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
        events
    }

    #[must_use]
    pub fn local_hostname(&self) -> &str {
        &self.local_hostname
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        // Dropping the sender disconnects the command channel; the
        // background thread's `recv`/`try_recv` calls observe this and
        // return, regardless of which state (quiescent, connecting,
        // sleeping before a reconnect) it was in.
        self.cmd_tx.take();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager").finish_non_exhaustive()
    }
}

/// The background thread body: owns the transport and the codec for the
/// life of the manager.
fn run(
    shared: Arc<Mutex<SharedConfig>>,
    spawner: Arc<dyn Spawner>,
    local_hostname: String,
    cmd_rx: Receiver<ConnCommand>,
    evt_tx: Sender<ConnEvent>,
    running: Arc<AtomicBool>,
) {
    let mut last_spawn: Option<(usize, Instant)> = None;

    'manager: loop {
        // Quiescent until connect() flips `running`.
        while !running.load(Ordering::SeqCst) {
            match cmd_rx.recv_timeout(READ_POLL_INTERVAL) {
                Ok(ConnCommand::Disconnect) => continue,
                Ok(ConnCommand::SendTo(..)) => continue,
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => return,
            }
        }

        let candidates = shared.lock().unwrap_or_else(|e| e.into_inner()).candidates.clone();
        let mut cursor = 0usize;
        let mut started_cursor: Option<usize> = None;

        loop {
            if !running.load(Ordering::SeqCst) {
                continue 'manager;
            }
            if cursor >= candidates.len() {
                let _ = evt_tx.send(ConnEvent::UnableToConnect);
                running.store(false, Ordering::SeqCst);
                continue 'manager;
            }

            let endpoint = &candidates[cursor];
            log::debug!("[connection] attempting {endpoint}");

            match Transport::connect(endpoint) {
                Ok(transport) => {
                    started_cursor = None;
                    log::info!("[connection] connected to {endpoint}");
                    let _ = evt_tx.send(ConnEvent::Connected(endpoint.clone()));

                    let reason = session_loop(transport, &cmd_rx, &evt_tx, &running);
                    match reason {
                        CloseReason::Explicit => {
                            let _ = evt_tx.send(ConnEvent::Closed { remote: false });
                            running.store(false, Ordering::SeqCst);
                            continue 'manager;
                        }
                        CloseReason::Remote => {
                            let _ = evt_tx.send(ConnEvent::Closed { remote: true });
                            if !sleep_cancellable(RECONNECT_DELAY, &cmd_rx, &running) {
                                continue 'manager;
                            }
                            // restart the same cursor, affinity to the endpoint
                            // that momentarily hiccupped.
                            continue;
                        }
                    }
                }
                Err(e) if Transport::is_refused(&e) => {
                    let server_command;
                    let attempt_to_start_server;
                    {
                        let cfg = shared.lock().unwrap_or_else(|e| e.into_inner());
                        server_command = cfg.server_command.clone();
                        attempt_to_start_server = cfg.attempt_to_start_server;
                    }

                    let cooldown_elapsed = match last_spawn {
                        Some((c, at)) => c != cursor || at.elapsed() >= SPAWN_COOLDOWN,
                        None => true,
                    };
                    let eligible = attempt_to_start_server
                        && started_cursor != Some(cursor)
                        && endpoint.is_local_ish(&local_hostname)
                        && cooldown_elapsed;

                    if eligible {
                        let args = vec!["-d".to_string(), "-u".to_string(), endpoint.to_spawn_url()];
                        match spawner.spawn(&server_command, &args) {
                            Ok(()) => {
                                started_cursor = Some(cursor);
                                last_spawn = Some((cursor, Instant::now()));
                                if !sleep_cancellable(RECONNECT_DELAY, &cmd_rx, &running) {
                                    continue 'manager;
                                }
                                continue;
                            }
                            Err(e) => {
                                log::warn!("[connection] failed to spawn broker: {e}");
                                cursor += 1;
                            }
                        }
                    } else {
                        log::warn!("[connection] {endpoint} refused connection");
                        cursor += 1;
                    }
                }
                Err(e) => {
                    log::warn!("[connection] {endpoint} failed: {e}");
                    cursor += 1;
                }
            }
        }
    }
}

enum CloseReason {
    Explicit,
    Remote,
}

/// Runs the read/write loop for one live transport. Returns once the
/// transport closes, either because the peer hung up or because an
/// explicit `Disconnect` command arrived.
fn session_loop(
    mut transport: Transport,
    cmd_rx: &Receiver<ConnCommand>,
    evt_tx: &Sender<ConnEvent>,
    running: &Arc<AtomicBool>,
) -> CloseReason {
    let _ = transport.set_read_timeout(Some(READ_POLL_INTERVAL));
    let _ = transport.set_write_timeout(Some(Duration::from_millis(250)));

    let mut codec = Codec::new(false);
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 8192];

    loop {
        if !running.load(Ordering::SeqCst) {
            transport.shutdown();
            return CloseReason::Explicit;
        }

        match cmd_rx.try_recv() {
            Ok(ConnCommand::Disconnect) => {
                transport.shutdown();
                return CloseReason::Explicit;
            }
            Ok(ConnCommand::SendTo(to_ids, message)) => {
                let bytes = codec.encode_to(&to_ids, &message);
                if let Err(e) = write_tolerating_backpressure(&mut transport, &bytes) {
                    log::warn!("[connection] write failed: {e}");
                    transport.shutdown();
                    return CloseReason::Remote;
                }
            }
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => {
                transport.shutdown();
                return CloseReason::Explicit;
            }
        }

        match std::io::Read::read(&mut transport, &mut buf) {
            Ok(0) => {
                log::info!("[connection] transport closed by peer");
                return CloseReason::Remote;
            }
            Ok(n) => {
                for body in decoder.feed(&buf[..n]) {
                    match codec.decode(&body) {
                        Ok(Some(frame)) => {
                            let _ = evt_tx.send(ConnEvent::Frame(frame));
                        }
                        Ok(None) => {}
                        Err(e) => log::warn!("[codec] failed to decode frame: {e}"),
                    }
                }
            }
            Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {}
            Err(e) => {
                log::warn!("[connection] read failed: {e}");
                return CloseReason::Remote;
            }
        }
    }
}

/// Writes `buf` in full, retrying on the bounded write-timeout's
/// `WouldBlock`/`TimedOut` rather than treating momentary back-pressure as a
/// transport failure (spec: "a short bounded wait-for-bytes-written of ≈250
/// ms is acceptable for back-pressure").
fn write_tolerating_backpressure(transport: &mut Transport, mut buf: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    while !buf.is_empty() {
        match transport.write(buf) {
            Ok(0) => {
                return Err(std::io::Error::new(std::io::ErrorKind::WriteZero, "failed to write whole buffer"));
            }
            Ok(n) => buf = &buf[n..],
            Err(e) if matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut | std::io::ErrorKind::Interrupted
            ) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Sleeps up to `duration`, waking early (and returning `false`) if the
/// manager is told to stop or an explicit disconnect arrives.
fn sleep_cancellable(duration: Duration, cmd_rx: &Receiver<ConnCommand>, running: &Arc<AtomicBool>) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if !running.load(Ordering::SeqCst) {
            return false;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return true;
        }
        match cmd_rx.recv_timeout(remaining.min(Duration::from_millis(100))) {
            Ok(ConnCommand::Disconnect) => return false,
            Ok(ConnCommand::SendTo(..)) => {}
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spawner::RecordingSpawner;
    use std::net::TcpListener;

    fn spawner() -> Arc<dyn Spawner> {
        Arc::new(RecordingSpawner::new())
    }

    #[test]
    fn unable_to_connect_when_no_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut mgr = ConnectionManager::new(
            vec![Endpoint::tcp("127.0.0.1", port)],
            "coserver4".to_string(),
            false,
            spawner(),
            "thishost".to_string(),
        );
        mgr.connect();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut saw_unable = false;
        while Instant::now() < deadline {
            for evt in mgr.poll() {
                if matches!(evt, ConnEvent::UnableToConnect) {
                    saw_unable = true;
                }
            }
            if saw_unable {
                break;
            }
            thread::sleep(Duration::from_millis(50));
        }
        assert!(saw_unable, "expected UnableToConnect");
    }

    #[test]
    fn connects_to_a_live_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept_thread = thread::spawn(move || {
            let _ = listener.accept();
            thread::sleep(Duration::from_millis(200));
        });

        let mut mgr = ConnectionManager::new(
            vec![Endpoint::tcp("127.0.0.1", port)],
            "coserver4".to_string(),
            false,
            spawner(),
            "thishost".to_string(),
        );
        mgr.connect();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut connected = false;
        while Instant::now() < deadline {
            for evt in mgr.poll() {
                if matches!(evt, ConnEvent::Connected(_)) {
                    connected = true;
                }
            }
            if connected {
                break;
            }
            thread::sleep(Duration::from_millis(50));
        }
        assert!(connected, "expected Connected");
        accept_thread.join().unwrap();
    }

    #[test]
    fn refused_local_candidate_triggers_spawn() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let recorder = RecordingSpawner::new();
        let mut mgr = ConnectionManager::new(
            vec![Endpoint::tcp("127.0.0.1", port)],
            "coserver4".to_string(),
            true,
            Arc::new(recorder.clone()),
            "thishost".to_string(),
        );
        mgr.connect();

        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline && recorder.calls().is_empty() {
            let _ = mgr.poll();
            thread::sleep(Duration::from_millis(50));
        }
        let calls = recorder.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "coserver4");
        assert_eq!(calls[0].1[0], "-d");
    }
}
