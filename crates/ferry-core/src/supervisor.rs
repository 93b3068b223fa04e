//! Host-side worker supervision.
//!
//! [`Supervisor::fork`] spawns a worker process running the fixed
//! worker-entry binary, wires a duplex channel over the child's stdio, and
//! returns a [`WorkerHandle`]. Messages sent before the worker confirms
//! startup are buffered and flushed, in order, on the worker's lifecycle
//! acknowledgment.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::channel::{self, Endpoint};
use crate::config::{SpawnOptions, SupervisorConfig};
use crate::error::{Error, Result};
use crate::protocol::{read_frame, write_frame, Frame, Message};
use crate::queue::SendQueue;

/// Name of the worker entry binary.
const WORKER_BINARY: &str = "ferry-worker";

/// Environment variable overriding worker binary discovery.
pub const WORKER_PATH_ENV: &str = "FERRY_WORKER_PATH";

/// Capacity of the inbound payload fan-out.
const EVENTS_CAPACITY: usize = 1024;

/// Spawns and supervises worker processes.
pub struct Supervisor {
    config: SupervisorConfig,
    worker_binary: Option<PathBuf>,
}

impl Supervisor {
    /// Create a supervisor. It is not ready to fork workers until
    /// [`Supervisor::initialize`] succeeds.
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            worker_binary: None,
        }
    }

    /// Resolve the worker binary and mark the supervisor ready.
    ///
    /// Resolution order:
    /// 1. `config.worker_binary`
    /// 2. `FERRY_WORKER_PATH` environment variable
    /// 3. Same directory as the current executable
    /// 4. System PATH
    /// 5. `target/{debug,release}` relative to `CARGO_MANIFEST_DIR` (development)
    pub fn initialize(&mut self) -> Result<()> {
        let path = self.find_worker_binary()?;
        info!(worker = %path.display(), "supervisor ready");
        self.worker_binary = Some(path);
        Ok(())
    }

    /// Whether [`Supervisor::initialize`] has succeeded.
    pub fn is_ready(&self) -> bool {
        self.worker_binary.is_some()
    }

    fn find_worker_binary(&self) -> Result<PathBuf> {
        if let Some(path) = &self.config.worker_binary {
            if path.exists() {
                return Ok(path.clone());
            }
            return Err(Error::Spawn(format!(
                "configured worker binary not found: {}",
                path.display()
            )));
        }

        if let Ok(path) = std::env::var(WORKER_PATH_ENV) {
            let path = PathBuf::from(path);
            if path.exists() {
                return Ok(path);
            }
        }

        let name = if cfg!(windows) {
            "ferry-worker.exe"
        } else {
            WORKER_BINARY
        };

        if let Ok(exe) = std::env::current_exe() {
            if let Some(dir) = exe.parent() {
                let candidate = dir.join(name);
                if candidate.exists() {
                    return Ok(candidate);
                }
            }
        }

        if let Ok(path) = which::which(name) {
            return Ok(path);
        }

        if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
            for profile in &["debug", "release"] {
                let candidate = PathBuf::from(&manifest_dir)
                    .join("..")
                    .join("..")
                    .join("target")
                    .join(profile)
                    .join(name);
                if candidate.exists() {
                    return Ok(candidate.canonicalize().unwrap_or(candidate));
                }
            }
        }

        Err(Error::Spawn(format!(
            "could not find {WORKER_BINARY} binary; set {WORKER_PATH_ENV} or ensure it is in PATH"
        )))
    }

    /// Spawn a worker process running the named handler module.
    ///
    /// `module_path` may be empty to reserve an idle worker for later use.
    /// `args` and `options` pass through to the spawned process unmodified.
    /// Fails with [`Error::NotReady`] unless [`Supervisor::initialize`] has
    /// run; that failure is fatal to the caller and is not retried here.
    pub fn fork(
        &self,
        module_path: impl Into<String>,
        args: &[String],
        options: &SpawnOptions,
    ) -> Result<WorkerHandle> {
        let worker_binary = self.worker_binary.as_ref().ok_or(Error::NotReady)?;

        let mut command = Command::new(worker_binary);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            // Worker logging goes to stderr; stdout carries the protocol.
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(cwd) = &options.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &options.envs {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|e| {
            Error::Spawn(format!(
                "failed to spawn worker '{}': {e}",
                worker_binary.display()
            ))
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Spawn("failed to open worker stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Spawn("failed to open worker stdout".to_string()))?;

        debug!(pid = ?child.id(), "worker spawned");
        Ok(WorkerHandle::wire(
            Some(child),
            stdout,
            stdin,
            module_path.into(),
            &self.config,
        ))
    }
}

struct Shared {
    queue: Mutex<SendQueue>,
    spawn_ready: AtomicBool,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>,
    next_token: AtomicU64,
    events: broadcast::Sender<Value>,
}

/// Handle to one spawned worker process.
///
/// Sends either write directly to the channel (once the worker is
/// spawn-ready) or buffer in the pre-ready queue. Inbound payloads fan out
/// to every subscriber; replies carrying a correlation token additionally
/// resolve the matching invocation.
pub struct WorkerHandle {
    child: Option<tokio::sync::Mutex<Child>>,
    pid: Option<u32>,
    endpoint: Endpoint,
    outbound: mpsc::UnboundedSender<Frame>,
    shared: Arc<Shared>,
    killed: AtomicBool,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("pid", &self.pid)
            .field("killed", &self.killed)
            .finish_non_exhaustive()
    }
}

impl WorkerHandle {
    /// Wire a handle over an already-spawned transport.
    ///
    /// `reader` carries frames from the worker, `writer` frames to it. The
    /// initialization frame goes out immediately; application traffic is
    /// held until the worker's `Started` acknowledgment.
    fn wire<R, W>(
        child: Option<Child>,
        reader: R,
        writer: W,
        module_path: String,
        config: &SupervisorConfig,
    ) -> WorkerHandle
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let pid = child.as_ref().and_then(|c| c.id());
        let (host_ep, wire_ep) = channel::pair();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();
        let (events_tx, _) = broadcast::channel(EVENTS_CAPACITY);

        let shared = Arc::new(Shared {
            queue: Mutex::new(SendQueue::new(config.queue_capacity, config.overflow_policy)),
            spawn_ready: AtomicBool::new(false),
            pending: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(0),
            events: events_tx,
        });

        // Writer: everything sent to the worker funnels through one queue.
        tokio::spawn(async move {
            let mut writer = writer;
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    warn!("worker stdin write failed: {e}");
                    break;
                }
            }
        });

        // Outbound bridge: messages sent on the host endpoint become frames.
        if let Some(mut wire_rx) = wire_ep.take_inbox() {
            let outbound = outbound_tx.clone();
            tokio::spawn(async move {
                while let Some(message) = wire_rx.recv().await {
                    if outbound.send(message.into()).is_err() {
                        break;
                    }
                }
            });
        }

        // Bootstrap precedes all application traffic.
        let init = Frame::Init {
            module_path: (!module_path.is_empty()).then_some(module_path),
        };
        if outbound_tx.send(init).is_err() {
            warn!("worker transport closed before initialization");
        }

        // Inbound pump: control frames are handled here; application
        // messages land in the host endpoint, held until spawn-ready.
        {
            let shared = shared.clone();
            let host_ep = host_ep.clone();
            let wire_ep = wire_ep.clone();
            tokio::spawn(async move {
                let mut reader = reader;
                loop {
                    match read_frame(&mut reader).await {
                        Ok(Some(Frame::Started)) => {
                            let Some(mut inbox) = host_ep.take_inbox() else {
                                warn!("duplicate spawn acknowledgment ignored");
                                continue;
                            };
                            // Flush under the queue lock so no send can slip
                            // between the drain and the ready flip.
                            {
                                let mut queue = shared.queue.lock().unwrap();
                                let queued = queue.len();
                                for message in queue.drain() {
                                    if host_ep.send(message).is_err() {
                                        warn!("channel closed during pre-ready flush");
                                        break;
                                    }
                                }
                                if queued > 0 {
                                    debug!(count = queued, "flushed pre-ready queue");
                                }
                                shared.spawn_ready.store(true, Ordering::SeqCst);
                            }
                            debug!("worker spawn-ready");

                            let shared = shared.clone();
                            tokio::spawn(async move {
                                while let Some(message) = inbox.recv().await {
                                    let Message { data, token } = message;
                                    if let Some(token) = token {
                                        let waiter =
                                            shared.pending.lock().unwrap().remove(&token);
                                        if let Some(tx) = waiter {
                                            let _ = tx.send(Ok(data.clone()));
                                        }
                                    }
                                    let _ = shared.events.send(data);
                                }
                            });
                        }
                        Ok(Some(Frame::Message { data, token })) => {
                            if wire_ep.send(Message { data, token }).is_err() {
                                warn!("host endpoint gone, dropping inbound message");
                            }
                        }
                        Ok(Some(Frame::Error { token, message })) => {
                            error!(?token, "worker handler error: {message}");
                            if let Some(token) = token {
                                let waiter = shared.pending.lock().unwrap().remove(&token);
                                if let Some(tx) = waiter {
                                    let _ = tx.send(Err(Error::Dispatch(message)));
                                }
                            }
                        }
                        Ok(Some(Frame::ShuttingDown)) => {
                            debug!("worker acknowledged shutdown");
                        }
                        Ok(Some(frame)) => warn!(?frame, "unexpected frame from worker"),
                        Ok(None) => {
                            debug!("worker stream closed");
                            break;
                        }
                        Err(e) => {
                            error!("worker stream read failed: {e}");
                            break;
                        }
                    }
                }
            });
        }

        WorkerHandle {
            child: child.map(tokio::sync::Mutex::new),
            pid,
            endpoint: host_ep,
            outbound: outbound_tx,
            shared,
            killed: AtomicBool::new(false),
        }
    }

    /// Whether the worker has acknowledged startup.
    pub fn is_spawn_ready(&self) -> bool {
        self.shared.spawn_ready.load(Ordering::SeqCst)
    }

    /// Process id of the worker, when spawned as a real process.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The host side of the worker's duplex channel.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Send a payload to the worker.
    ///
    /// Writes directly once the worker is spawn-ready; before that the
    /// message is buffered per the configured overflow policy.
    pub fn send(&self, data: Value) -> Result<()> {
        self.send_message(Message::new(data))
    }

    fn send_message(&self, message: Message) -> Result<()> {
        if self.shared.spawn_ready.load(Ordering::SeqCst) {
            return self.endpoint.send(message);
        }
        let mut queue = self.shared.queue.lock().unwrap();
        // Ready may have flipped while waiting on the lock; the flush runs
        // under this lock, so the re-check is authoritative.
        if self.shared.spawn_ready.load(Ordering::SeqCst) {
            drop(queue);
            return self.endpoint.send(message);
        }
        queue.try_enqueue(message)
    }

    /// Subscribe to every inbound payload (full fan-out).
    pub fn subscribe(&self) -> broadcast::Receiver<Value> {
        self.shared.events.subscribe()
    }

    /// Wait for the next inbound payload.
    pub async fn next_message(&self) -> Result<Value> {
        let mut rx = self.subscribe();
        loop {
            match rx.recv().await {
                Ok(value) => return Ok(value),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Err(Error::ChannelClosed),
            }
        }
    }

    /// Send a payload and wait for its reply.
    ///
    /// Each invocation carries a generated correlation token; the reply is
    /// matched strictly by that token, so concurrent invocations on one
    /// handle cannot cross-resolve. A worker-side dispatch failure resolves
    /// the invocation with [`Error::Dispatch`]. There is no timeout: a
    /// worker that dies with the invocation in flight never resolves it.
    pub async fn invoke(&self, data: Value) -> Result<Value> {
        let token = self.shared.next_token.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().unwrap().insert(token, tx);

        if let Err(e) = self.send_message(Message::with_token(data, token)) {
            self.shared.pending.lock().unwrap().remove(&token);
            return Err(e);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::ChannelClosed),
        }
    }

    /// Ask the worker to exit cleanly and wait for it.
    pub async fn shutdown(&self) -> Result<()> {
        if self.killed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.outbound.send(Frame::Shutdown);

        let Some(child) = &self.child else {
            return Ok(());
        };
        let status = child
            .lock()
            .await
            .wait()
            .await
            .map_err(|e| Error::Ipc(format!("failed to wait for worker: {e}")))?;
        if status.success() {
            Ok(())
        } else {
            Err(Error::Ipc(format!("worker exited with status: {status}")))
        }
    }

    /// Kill the worker process immediately.
    ///
    /// The shutdown frame is still sent first so a healthy worker can exit
    /// on its own terms before the kill lands.
    pub async fn kill(&self) -> Result<()> {
        if self.killed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.outbound.send(Frame::Shutdown);

        let Some(child) = &self.child else {
            return Ok(());
        };
        let mut child = child.lock().await;
        if let Err(e) = child.start_kill() {
            // InvalidInput means the process already exited.
            if e.kind() != std::io::ErrorKind::InvalidInput {
                warn!("failed to kill worker: {e}");
            }
        }
        let _ = child.wait().await;
        Ok(())
    }

    /// Whether the worker process is still running.
    pub async fn is_alive(&self) -> bool {
        if self.killed.load(Ordering::SeqCst) {
            return false;
        }
        match &self.child {
            Some(child) => matches!(child.lock().await.try_wait(), Ok(None)),
            None => true,
        }
    }
}
