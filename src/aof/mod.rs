//! Append-Only Command Log
//!
//! Every successful write re-serializes its command line as a RESP
//! multi-bulk array and appends it to the log. Producers enqueue
//! `{db_index, command}` payloads onto a bounded queue; a single writer
//! task drains it, interleaving `SELECT n` whenever the target database
//! changes, and fans each appended batch out to registered listeners.
//!
//! Three fsync disciplines:
//! - `always`: the producer takes the synchronous path and the file is
//!   synced after every command
//! - `everysec`: a background task syncs once per second
//! - `no`: the operating system decides
//!
//! The `state` mutex doubles as the rewrite pause: the rewriter holds it
//! only for its two short critical sections (snapshot the size + open the
//! temp file; splice the tail + swap files), so live writers keep
//! appending while the bulk of a rewrite runs.

pub mod marshal;
pub mod rewrite;
pub mod snapshot;

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::connection::ConnectionState;
use crate::database::server::Server;
use crate::protocol::{cmd_line, cmd_line_to_bytes, CmdLine, RespParser};

const AOF_QUEUE_SIZE: usize = 1 << 20;

/// When to fsync the command log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsyncPolicy {
    /// Sync after every command; writers bypass the queue.
    Always,
    /// A background task syncs once per second.
    EverySec,
    /// Never sync explicitly.
    No,
}

impl FromStr for FsyncPolicy {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.to_ascii_lowercase().as_str() {
            "always" => Ok(FsyncPolicy::Always),
            "everysec" => Ok(FsyncPolicy::EverySec),
            "no" => Ok(FsyncPolicy::No),
            other => Err(format!("invalid appendfsync value '{other}'")),
        }
    }
}

/// Observes every batch of command lines as it reaches the log. Used to
/// forward the update stream elsewhere.
pub trait Listener: Send + Sync {
    fn callback(&self, lines: &[CmdLine]);
}

struct Payload {
    db_index: usize,
    cmdline: CmdLine,
}

struct AofState {
    file: File,
    current_db: usize,
}

/// Owns the command log: the file, the writer queue, and the fsync task.
pub struct Persister {
    path: PathBuf,
    tmp_dir: PathBuf,
    policy: FsyncPolicy,
    use_preamble: bool,
    databases: usize,
    // the rewrite/pause mutex: writers take it per append, the rewriter
    // takes it for its two boundary sections
    state: Mutex<AofState>,
    tx: Mutex<Option<mpsc::Sender<Payload>>>,
    finished: Mutex<Option<oneshot::Receiver<()>>>,
    shutdown: watch::Sender<bool>,
    listeners: Mutex<Vec<Arc<dyn Listener>>>,
}

impl Persister {
    /// Opens (creating if needed) the command log. Call [`Persister::load`]
    /// to replay it, then [`Persister::start`] to begin accepting writes.
    pub fn open(config: &Config) -> std::io::Result<Arc<Self>> {
        let path = PathBuf::from(&config.appendfilename);
        let file = OpenOptions::new().append(true).create(true).read(true).open(&path)?;
        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(Self {
            path,
            tmp_dir: PathBuf::from(&config.tmp_dir),
            policy: config.appendfsync,
            use_preamble: config.aof_use_rdb_preamble,
            databases: config.databases,
            state: Mutex::new(AofState { file, current_db: 0 }),
            tx: Mutex::new(None),
            finished: Mutex::new(None),
            shutdown,
            listeners: Mutex::new(Vec::new()),
        }))
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub(crate) fn databases(&self) -> usize {
        self.databases
    }

    pub(crate) fn tmp_dir(&self) -> &PathBuf {
        &self.tmp_dir
    }

    pub(crate) fn use_preamble(&self) -> bool {
        self.use_preamble
    }

    /// Spawns the writer task (and the per-second fsync task when the
    /// policy asks for one). Must run inside the runtime.
    pub fn start(self: &Arc<Self>) {
        let (tx, mut rx) = mpsc::channel::<Payload>(AOF_QUEUE_SIZE);
        let (done_tx, done_rx) = oneshot::channel();
        *self.tx.lock().unwrap() = Some(tx);
        *self.finished.lock().unwrap() = Some(done_rx);

        let writer = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                writer.write_payload(&payload);
            }
            debug!("command log writer drained");
            let _ = done_tx.send(());
        });

        if self.policy == FsyncPolicy::EverySec {
            let syncer = Arc::clone(self);
            let mut shutdown = self.shutdown.subscribe();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
                loop {
                    tokio::select! {
                        _ = ticker.tick() => syncer.fsync(),
                        result = shutdown.changed() => {
                            if result.is_err() || *shutdown.borrow() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn Listener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn Listener>) {
        self.listeners
            .lock()
            .unwrap()
            .retain(|existing| !Arc::ptr_eq(existing, listener));
    }

    /// Hands a command to the log. Under `always` the write happens on
    /// the caller's thread; otherwise it is queued for the writer task.
    pub fn save_cmd_line(&self, db_index: usize, cmdline: CmdLine) {
        let payload = Payload { db_index, cmdline };
        if self.policy == FsyncPolicy::Always {
            self.write_payload(&payload);
            return;
        }
        if let Some(tx) = self.tx.lock().unwrap().as_ref() {
            if tx.try_send(payload).is_err() {
                warn!("command log queue full, entry dropped");
            }
        }
    }

    /// Appends one command, prefixed with SELECT when the target database
    /// differs from the file's current one.
    fn write_payload(&self, payload: &Payload) {
        let mut batch: Vec<CmdLine> = Vec::with_capacity(2);
        let mut state = self.state.lock().unwrap();

        if state.current_db != payload.db_index {
            let select = cmd_line(&["SELECT", &payload.db_index.to_string()]);
            if let Err(e) = state.file.write_all(&cmd_line_to_bytes(&select)) {
                error!(error = %e, "command log SELECT write failed");
                if self.policy == FsyncPolicy::Always {
                    // under `always` durability was promised to the client
                    panic!("command log write failed under appendfsync=always: {e}");
                }
                return;
            }
            state.current_db = payload.db_index;
            batch.push(select);
        }

        if let Err(e) = state.file.write_all(&cmd_line_to_bytes(&payload.cmdline)) {
            error!(error = %e, "command log write failed");
            if self.policy == FsyncPolicy::Always {
                panic!("command log write failed under appendfsync=always: {e}");
            }
            return;
        }
        batch.push(payload.cmdline.clone());

        if self.policy == FsyncPolicy::Always {
            if let Err(e) = state.file.sync_data() {
                error!(error = %e, "command log fsync failed");
            }
        }
        drop(state);

        for listener in self.listeners.lock().unwrap().iter() {
            listener.callback(&batch);
        }
    }

    /// Forces the log to disk.
    pub fn fsync(&self) {
        let state = self.state.lock().unwrap();
        if let Err(e) = state.file.sync_data() {
            error!(error = %e, "command log fsync failed");
        }
    }

    /// Stops the fsync task, drains the writer queue, and syncs the file.
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        let tx = self.tx.lock().unwrap().take();
        drop(tx);
        let finished = self.finished.lock().unwrap().take();
        if let Some(finished) = finished {
            let _ = finished.await;
        }
        self.fsync();
        info!("command log closed");
    }

    /// Replays the log into the given server at startup.
    pub fn load(&self, server: &Arc<Server>) -> std::io::Result<()> {
        let final_db = Self::replay_file(&self.path, server, None)?;
        self.state.lock().unwrap().current_db = final_db;
        Ok(())
    }

    /// Replays up to `max_bytes` of the log file at `path` into `server`
    /// via a synthetic connection; a snapshot preamble is restored first
    /// when present. Returns the database index selected when replay
    /// ended.
    pub(crate) fn replay_file(
        path: &PathBuf,
        server: &Arc<Server>,
        max_bytes: Option<u64>,
    ) -> std::io::Result<usize> {
        use std::io::{Read, Seek, SeekFrom};

        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        let mut consumed = 0u64;
        match snapshot::read_preamble(&mut file)? {
            Some((snap, preamble_len)) => {
                server.load_snapshot(&snap);
                consumed = preamble_len;
                info!(bytes = preamble_len, "restored snapshot preamble");
            }
            None => {
                file.seek(SeekFrom::Start(0))?;
            }
        }

        let limit = max_bytes.unwrap_or(u64::MAX);
        let mut remaining = limit.saturating_sub(consumed);
        let mut buf = BytesMut::with_capacity(64 * 1024);
        let mut chunk = [0u8; 64 * 1024];
        let mut parser = RespParser::new();
        let mut conn = ConnectionState::fake();
        let mut replayed = 0u64;

        loop {
            loop {
                if buf.is_empty() {
                    break;
                }
                match parser.parse(&buf) {
                    Ok(Some((value, used))) => {
                        let _ = buf.split_to(used);
                        let Some(cmdline) = value.into_cmd_line() else {
                            warn!("skipping non-command entry in log");
                            continue;
                        };
                        let reply = server.exec(&mut conn, &cmdline);
                        if let Some(reply) = reply {
                            if reply.is_error() {
                                warn!(reply = %reply, "error replaying log command");
                            }
                        }
                        replayed += 1;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "log parse error, stopping replay");
                        return Ok(conn.db_index());
                    }
                }
            }

            if remaining == 0 {
                break;
            }
            let want = chunk.len().min(remaining as usize);
            let n = file.read(&mut chunk[..want])?;
            if n == 0 {
                break;
            }
            remaining -= n as u64;
            buf.extend_from_slice(&chunk[..n]);
        }

        if replayed > 0 {
            info!(commands = replayed, "replayed command log");
        }
        Ok(conn.db_index())
    }
}
