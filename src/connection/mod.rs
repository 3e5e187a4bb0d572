//! Client Connections
//!
//! One task per connection. The handler accumulates socket bytes in a
//! `BytesMut` buffer, feeds them through the incremental RESP parser,
//! executes complete commands against the server, and writes replies
//! back. Pub/sub deliveries arrive on a per-connection outbound channel
//! so any task can write to a subscriber without touching its socket.
//!
//! [`ConnectionState`] carries everything the command layer needs to know
//! about a client: selected database, authentication, the MULTI queue
//! with its accumulated errors, the WATCH snapshot, and the subscription
//! set. It is owned by the connection's task; nothing else mutates it.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::database::server::Server;
use crate::protocol::{CmdLine, ParseError, RespParser, RespValue};

/// Maximum size for the read buffer (64 KB)
const MAX_BUFFER_SIZE: usize = 64 * 1024;

/// Initial buffer capacity
const INITIAL_BUFFER_SIZE: usize = 4096;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Connection-level counters, shared across all handler tasks.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    pub connections_accepted: AtomicU64,
    pub active_connections: AtomicU64,
    pub commands_processed: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn active(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }
}

/// Per-client state carried through command dispatch.
pub struct ConnectionState {
    id: u64,
    db_index: usize,
    password: Option<String>,
    multi_state: bool,
    queued: Vec<CmdLine>,
    tx_errors: Vec<String>,
    watching: HashMap<String, u32>,
    subs: HashSet<String>,
    out: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

impl ConnectionState {
    pub fn new(out: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            db_index: 0,
            password: None,
            multi_state: false,
            queued: Vec::new(),
            tx_errors: Vec::new(),
            watching: HashMap::new(),
            subs: HashSet::new(),
            out: Some(out),
        }
    }

    /// A connection with no socket behind it. The log loader uses one to
    /// carry the SELECTed database index through replay.
    pub fn fake() -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            db_index: 0,
            password: None,
            multi_state: false,
            queued: Vec::new(),
            tx_errors: Vec::new(),
            watching: HashMap::new(),
            subs: HashSet::new(),
            out: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn db_index(&self) -> usize {
        self.db_index
    }

    pub fn select_db(&mut self, index: usize) {
        self.db_index = index;
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn set_password(&mut self, password: String) {
        self.password = Some(password);
    }

    /* ---- transaction state ---- */

    pub fn in_multi_state(&self) -> bool {
        self.multi_state
    }

    pub fn set_multi_state(&mut self, on: bool) {
        self.multi_state = on;
    }

    pub fn enqueue_cmd(&mut self, cmdline: CmdLine) {
        self.queued.push(cmdline);
    }

    pub fn take_queued_cmds(&mut self) -> Vec<CmdLine> {
        std::mem::take(&mut self.queued)
    }

    pub fn clear_queued_cmds(&mut self) {
        self.queued.clear();
        self.tx_errors.clear();
    }

    pub fn add_tx_error(&mut self, reply: &RespValue) {
        if let RespValue::Error(message) = reply {
            self.tx_errors.push(message.clone());
        }
    }

    pub fn has_tx_errors(&self) -> bool {
        !self.tx_errors.is_empty()
    }

    pub fn watching_mut(&mut self) -> &mut HashMap<String, u32> {
        &mut self.watching
    }

    pub fn take_watching(&mut self) -> HashMap<String, u32> {
        std::mem::take(&mut self.watching)
    }

    /* ---- pub/sub state ---- */

    pub fn subscribe(&mut self, channel: &str) {
        self.subs.insert(channel.to_string());
    }

    pub fn unsubscribe(&mut self, channel: &str) {
        self.subs.remove(channel);
    }

    pub fn channels(&self) -> Vec<String> {
        self.subs.iter().cloned().collect()
    }

    pub fn subs_count(&self) -> usize {
        self.subs.len()
    }

    /// Handle other tasks can use to push bytes at this client.
    pub fn outbound(&self) -> Option<mpsc::UnboundedSender<Vec<u8>>> {
        self.out.clone()
    }

    /// Queues raw bytes for delivery to this client.
    pub fn push_message(&self, bytes: Vec<u8>) {
        if let Some(out) = &self.out {
            let _ = out.send(bytes);
        }
    }
}

/// Errors that end a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("client disconnected")]
    ClientDisconnected,

    #[error("unexpected end of stream")]
    UnexpectedEof,

    #[error("buffer size limit exceeded")]
    BufferFull,
}

/// Handles a single client connection to completion.
pub struct ConnectionHandler {
    stream: BufWriter<TcpStream>,
    addr: SocketAddr,
    buffer: BytesMut,
    parser: RespParser,
    server: Arc<Server>,
    state: ConnectionState,
    out_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    stats: Arc<ConnectionStats>,
}

impl ConnectionHandler {
    pub fn new(
        stream: TcpStream,
        addr: SocketAddr,
        server: Arc<Server>,
        stats: Arc<ConnectionStats>,
    ) -> Self {
        stats.connection_opened();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        Self {
            stream: BufWriter::new(stream),
            addr,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            parser: RespParser::new(),
            server,
            state: ConnectionState::new(out_tx),
            out_rx,
            stats,
        }
    }

    pub async fn run(mut self) -> Result<(), ConnectionError> {
        info!(client = %self.addr, "client connected");

        let result = self.main_loop().await;

        match &result {
            Ok(()) => debug!(client = %self.addr, "client disconnected"),
            Err(ConnectionError::ClientDisconnected) => {
                debug!(client = %self.addr, "client disconnected")
            }
            Err(ConnectionError::Io(e)) if e.kind() == std::io::ErrorKind::ConnectionReset => {
                debug!(client = %self.addr, "connection reset by client")
            }
            Err(e) => warn!(client = %self.addr, error = %e, "connection error"),
        }

        self.server.after_client_close(&mut self.state);
        self.stats.connection_closed();
        result
    }

    async fn main_loop(&mut self) -> Result<(), ConnectionError> {
        loop {
            loop {
                match self.try_parse_command() {
                    Ok(Some(cmdline)) => {
                        self.stats.commands_processed.fetch_add(1, Ordering::Relaxed);

                        let name = String::from_utf8_lossy(&cmdline[0]).to_ascii_lowercase();
                        if name == "quit" {
                            self.send_reply(&RespValue::ok()).await?;
                            return Ok(());
                        }

                        if let Some(reply) = self.server.exec(&mut self.state, &cmdline) {
                            self.send_reply(&reply).await?;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        // protocol violation: tell the client, then close
                        let reply = RespValue::error(format!("ERR protocol error: {e}"));
                        let _ = self.send_reply(&reply).await;
                        return Err(e.into());
                    }
                }
            }

            // wake on either more socket bytes or a pub/sub delivery;
            // the select only produces the event, the borrows end here
            let outbound = tokio::select! {
                read = Self::read_more(&mut self.stream, &mut self.buffer) => {
                    read?;
                    None
                }
                message = self.out_rx.recv() => message,
            };
            if let Some(bytes) = outbound {
                self.stream.write_all(&bytes).await?;
                self.stream.flush().await?;
            }
        }
    }

    /// Parses one command off the front of the buffer, if complete.
    fn try_parse_command(&mut self) -> Result<Option<CmdLine>, ParseError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }
        match self.parser.parse(&self.buffer)? {
            Some((value, consumed)) => {
                let _ = self.buffer.split_to(consumed);
                trace!(client = %self.addr, consumed, "parsed command");
                match value.into_cmd_line() {
                    Some(cmdline) => Ok(Some(cmdline)),
                    None => Err(ParseError::ProtocolError(
                        "expected an array of bulk strings".to_string(),
                    )),
                }
            }
            None => Ok(None),
        }
    }

    async fn read_more(
        stream: &mut BufWriter<TcpStream>,
        buffer: &mut BytesMut,
    ) -> Result<(), ConnectionError> {
        if buffer.len() >= MAX_BUFFER_SIZE {
            return Err(ConnectionError::BufferFull);
        }
        if buffer.capacity() - buffer.len() < 1024 {
            buffer.reserve(4096);
        }

        let n = stream.get_mut().read_buf(buffer).await?;
        if n == 0 {
            if buffer.is_empty() {
                return Err(ConnectionError::ClientDisconnected);
            }
            return Err(ConnectionError::UnexpectedEof);
        }
        Ok(())
    }

    async fn send_reply(&mut self, reply: &RespValue) -> Result<(), ConnectionError> {
        let bytes = reply.serialize();
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

/// Convenience wrapper: builds a handler and runs it, enforcing the
/// configured client limit.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    server: Arc<Server>,
    stats: Arc<ConnectionStats>,
) {
    if stats.active() >= server.config().maxclients as u64 {
        let mut stream = stream;
        let reply = RespValue::error("ERR max number of clients reached").serialize();
        let _ = stream.write_all(&reply).await;
        warn!(client = %addr, "rejected: max clients reached");
        return;
    }

    let handler = ConnectionHandler::new(stream, addr, server, stats);
    if let Err(e) = handler.run().await {
        match e {
            ConnectionError::ClientDisconnected => {}
            ConnectionError::Io(ref io_err)
                if io_err.kind() == std::io::ErrorKind::ConnectionReset => {}
            _ => debug!(client = %addr, error = %e, "connection ended with error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_defaults() {
        let state = ConnectionState::fake();
        assert_eq!(state.db_index(), 0);
        assert!(!state.in_multi_state());
        assert!(state.password().is_none());
        assert_eq!(state.subs_count(), 0);
        assert!(state.outbound().is_none());
    }

    #[test]
    fn test_queue_lifecycle() {
        let mut state = ConnectionState::fake();
        state.set_multi_state(true);
        state.enqueue_cmd(crate::protocol::cmd_line(&["SET", "a", "1"]));
        state.add_tx_error(&RespValue::unknown_command("bogus"));
        assert!(state.has_tx_errors());

        state.clear_queued_cmds();
        assert!(!state.has_tx_errors());
        assert!(state.take_queued_cmds().is_empty());
    }

    #[test]
    fn test_subscriptions() {
        let mut state = ConnectionState::fake();
        state.subscribe("news");
        state.subscribe("sports");
        state.subscribe("news");
        assert_eq!(state.subs_count(), 2);
        state.unsubscribe("news");
        assert_eq!(state.subs_count(), 1);
        assert_eq!(state.channels(), vec!["sports".to_string()]);
    }

    #[test]
    fn test_push_message_delivers_to_channel() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let state = ConnectionState::new(tx);
        state.push_message(b"+OK\r\n".to_vec());
        assert_eq!(rx.try_recv().unwrap(), b"+OK\r\n".to_vec());
    }

    #[test]
    fn test_connection_ids_are_unique() {
        let a = ConnectionState::fake();
        let b = ConnectionState::fake();
        assert_ne!(a.id(), b.id());
    }
}
