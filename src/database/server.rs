//! Server
//!
//! Owns the database slots, the persister, and the pub/sub hub. Meta
//! commands (SELECT, AUTH, pub/sub, persistence control, FLUSHALL) are
//! routed here; everything key-space is delegated to the connection's
//! selected database. A panic inside any executor is caught at this
//! dispatcher, logged, and surfaced as an unknown-error reply.

use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use bytes::Bytes;
use tracing::{error, info, warn};

use crate::aof::{snapshot, Persister};
use crate::config::Config;
use crate::connection::{ConnectionState, ConnectionStats};
use crate::database::{cmd_name, Database};
use crate::protocol::{cmd_line, RespValue};
use crate::pubsub::Hub;
use crate::timewheel::TimeWheel;

pub struct Server {
    config: Config,
    dbs: Vec<Arc<Database>>,
    hub: Hub,
    wheel: Arc<TimeWheel>,
    persister: RwLock<Option<Arc<Persister>>>,
    stats: Arc<ConnectionStats>,
    start_time: Instant,
}

impl Server {
    /// Builds a standalone server: database slots, the time wheel, and,
    /// when the command log is enabled, the persister, loading existing
    /// state from the log (or, failing that, the standalone snapshot).
    pub fn new(config: Config) -> Arc<Self> {
        let server = Self::build(config, TimeWheel::start());

        if server.config.appendonly {
            let had_log = Path::new(&server.config.appendfilename).exists();
            match Persister::open(&server.config) {
                Ok(persister) => {
                    if let Err(e) = persister.load(&server) {
                        error!(error = %e, "command log replay failed");
                    }
                    persister.start();
                    for db in &server.dbs {
                        db.bind_aof(Arc::clone(&persister));
                    }
                    *server.persister.write().unwrap() = Some(persister);
                }
                Err(e) => error!(error = %e, "cannot open command log, persistence disabled"),
            }
            if !had_log {
                server.try_load_snapshot_file();
            }
        } else {
            server.try_load_snapshot_file();
        }

        server
    }

    /// A private replay target for rewrite and snapshot generation: same
    /// slot layout, no persistence, no scheduled expiry, nothing loaded
    /// from disk.
    pub fn auxiliary(databases: usize) -> Arc<Self> {
        let config = Config {
            databases,
            appendonly: false,
            ..Config::default()
        };
        Self::build(config, TimeWheel::inert())
    }

    fn build(config: Config, wheel: Arc<TimeWheel>) -> Arc<Self> {
        let databases = config.databases.max(1);
        let dbs = (0..databases)
            .map(|index| Database::new(index, Arc::clone(&wheel)))
            .collect();

        Arc::new(Self {
            config,
            dbs,
            hub: Hub::new(),
            wheel,
            persister: RwLock::new(None),
            stats: Arc::new(ConnectionStats::new()),
            start_time: Instant::now(),
        })
    }

    fn try_load_snapshot_file(&self) {
        let path = Path::new(&self.config.dbfilename);
        if !path.exists() {
            return;
        }
        match std::fs::File::open(path) {
            Ok(mut file) => match snapshot::read_preamble(&mut file) {
                Ok(Some((snap, _))) => {
                    self.load_snapshot(&snap);
                    info!(path = %path.display(), "snapshot loaded");
                }
                Ok(None) => warn!(path = %path.display(), "snapshot file has no valid header"),
                Err(e) => error!(error = %e, "snapshot load failed"),
            },
            Err(e) => error!(error = %e, "cannot open snapshot file"),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stats(&self) -> Arc<ConnectionStats> {
        Arc::clone(&self.stats)
    }

    pub fn database_count(&self) -> usize {
        self.dbs.len()
    }

    pub fn database(&self, index: usize) -> Option<&Arc<Database>> {
        self.dbs.get(index)
    }

    pub fn persister(&self) -> Option<Arc<Persister>> {
        self.persister.read().unwrap().clone()
    }

    /// Restores entities (and their TTLs) from a decoded snapshot.
    pub fn load_snapshot(&self, snap: &snapshot::Snapshot) {
        for db_snap in &snap.dbs {
            let Some(db) = self.database(db_snap.index) else {
                warn!(index = db_snap.index, "snapshot refers to a database slot out of range");
                continue;
            };
            for entry in &db_snap.entries {
                db.put_entity(&entry.key, snapshot::snapshot_to_entity(&entry.value));
                if let Some(at_ms) = entry.expire_at_ms {
                    db.expire(&entry.key, at_ms);
                }
            }
        }
    }

    /// Executes one command for a connection. `None` means the command
    /// produced no direct reply (pub/sub pushes its acknowledgements
    /// through the outbound channel instead).
    pub fn exec(self: &Arc<Self>, conn: &mut ConnectionState, cmdline: &[Bytes]) -> Option<RespValue> {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.exec_inner(conn, cmdline)
        }));
        match result {
            Ok(reply) => reply,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(panic = %message, "executor panicked");
                Some(RespValue::unknown_error())
            }
        }
    }

    fn exec_inner(self: &Arc<Self>, conn: &mut ConnectionState, cmdline: &[Bytes]) -> Option<RespValue> {
        let name = cmd_name(cmdline);
        let args = &cmdline[1..];

        if name == "auth" {
            return Some(self.auth(conn, args));
        }
        if !self.is_authenticated(conn) {
            return Some(RespValue::error("NOAUTH Authentication required."));
        }

        match name.as_str() {
            "ping" => Some(Self::ping(args)),
            "echo" => {
                if args.len() != 1 {
                    return Some(RespValue::arg_num_error("echo"));
                }
                Some(RespValue::BulkString(args[0].clone()))
            }
            "info" => Some(self.info(args)),
            "command" => Some(Self::exec_command(args)),
            "dbsize" => {
                let Some(db) = self.database(conn.db_index()) else {
                    return Some(RespValue::db_index_out_of_range());
                };
                Some(RespValue::integer(db.sizes().0 as i64))
            }
            "select" => Some(self.exec_select(conn, args)),
            "subscribe" => {
                if args.is_empty() {
                    return Some(RespValue::arg_num_error("subscribe"));
                }
                let channels: Vec<String> = args.iter().map(crate::database::arg_str).collect();
                self.hub.subscribe(conn, &channels);
                None
            }
            "unsubscribe" => {
                let channels: Vec<String> = args.iter().map(crate::database::arg_str).collect();
                self.hub.unsubscribe(conn, &channels);
                None
            }
            "publish" => {
                if args.len() != 2 {
                    return Some(RespValue::arg_num_error("publish"));
                }
                let channel = crate::database::arg_str(&args[0]);
                Some(RespValue::integer(self.hub.publish(&channel, &args[1])))
            }
            "flushall" => Some(self.exec_flush_all()),
            "flushdb" => {
                if !args.is_empty() {
                    return Some(RespValue::arg_num_error("flushdb"));
                }
                if conn.in_multi_state() {
                    return Some(RespValue::error("ERR command 'FlushDB' cannot be used in MULTI"));
                }
                Some(self.exec_flush_db(conn.db_index()))
            }
            "bgrewriteaof" => Some(self.exec_bg_rewrite()),
            "rewriteaof" => Some(self.exec_rewrite()),
            "save" => Some(self.exec_save()),
            "bgsave" => Some(self.exec_bg_save()),
            _ => {
                let Some(db) = self.database(conn.db_index()) else {
                    return Some(RespValue::db_index_out_of_range());
                };
                Some(db.exec(conn, cmdline))
            }
        }
    }

    /// Drops all of a closing connection's subscriptions.
    pub fn after_client_close(&self, conn: &mut ConnectionState) {
        self.hub.unsubscribe_all(conn);
    }

    /// Flushes the log, stops its tasks, and stops the time wheel.
    pub async fn close(&self) {
        if let Some(persister) = self.persister() {
            persister.close().await;
        }
        self.wheel.stop();
        info!("server closed");
    }

    /* ---- meta commands ---- */

    fn ping(args: &[Bytes]) -> RespValue {
        match args.len() {
            0 => RespValue::pong(),
            1 => RespValue::simple_string(String::from_utf8_lossy(&args[0]).into_owned()),
            _ => RespValue::arg_num_error("ping"),
        }
    }

    /// COMMAND [COUNT | INFO name [name ...]]: key-space command
    /// descriptions with arity, flags, and key positions.
    fn exec_command(args: &[Bytes]) -> RespValue {
        if args.is_empty() {
            let rows = crate::database::registry::all_commands()
                .values()
                .map(|cmd| cmd.desc_reply())
                .collect();
            return RespValue::Array(rows);
        }
        let sub = String::from_utf8_lossy(&args[0]).to_ascii_lowercase();
        match sub.as_str() {
            "count" => {
                RespValue::integer(crate::database::registry::all_commands().len() as i64)
            }
            "info" => {
                let rows = args[1..]
                    .iter()
                    .map(|raw| {
                        let name = String::from_utf8_lossy(raw).to_ascii_lowercase();
                        match crate::database::registry::lookup(&name) {
                            Some(cmd) => cmd.desc_reply(),
                            None => RespValue::Null,
                        }
                    })
                    .collect();
                RespValue::Array(rows)
            }
            _ => RespValue::error(format!("ERR unknown COMMAND subcommand '{sub}'")),
        }
    }

    fn is_authenticated(&self, conn: &ConnectionState) -> bool {
        match self.config.requirepass.as_deref() {
            None => true,
            Some(required) => conn.password() == Some(required),
        }
    }

    fn auth(&self, conn: &mut ConnectionState, args: &[Bytes]) -> RespValue {
        if args.len() != 1 {
            return RespValue::arg_num_error("auth");
        }
        let Some(required) = self.config.requirepass.as_deref() else {
            return RespValue::error("ERR Client sent AUTH, but no password is set");
        };
        let offered = String::from_utf8_lossy(&args[0]).into_owned();
        conn.set_password(offered.clone());
        if offered != required {
            return RespValue::error("ERR invalid password");
        }
        RespValue::ok()
    }

    fn exec_select(&self, conn: &mut ConnectionState, args: &[Bytes]) -> RespValue {
        if conn.in_multi_state() {
            return RespValue::error("ERR cannot select database within multi");
        }
        if args.len() != 1 {
            return RespValue::arg_num_error("select");
        }
        let Ok(index) = String::from_utf8_lossy(&args[0]).parse::<usize>() else {
            return RespValue::error("ERR invalid DB index");
        };
        if index >= self.dbs.len() {
            return RespValue::db_index_out_of_range();
        }
        conn.select_db(index);
        RespValue::ok()
    }

    fn exec_flush_db(&self, index: usize) -> RespValue {
        let Some(db) = self.database(index) else {
            return RespValue::db_index_out_of_range();
        };
        if let Some(persister) = self.persister() {
            persister.save_cmd_line(index, cmd_line(&["FLUSHDB"]));
        }
        db.flush();
        RespValue::ok()
    }

    fn exec_flush_all(&self) -> RespValue {
        for db in &self.dbs {
            db.flush();
        }
        if let Some(persister) = self.persister() {
            persister.save_cmd_line(0, cmd_line(&["FLUSHALL"]));
        }
        RespValue::ok()
    }

    fn exec_rewrite(&self) -> RespValue {
        if !self.config.appendonly {
            return RespValue::error("ERR AppendOnly is false, you can't rewrite aof file");
        }
        let Some(persister) = self.persister() else {
            return RespValue::error("ERR no AOF persistence");
        };
        match persister.rewrite() {
            Ok(()) => RespValue::ok(),
            Err(e) => RespValue::error(format!("ERR {e}")),
        }
    }

    fn exec_bg_rewrite(&self) -> RespValue {
        if !self.config.appendonly {
            return RespValue::error("ERR AppendOnly is false, you can't rewrite aof file");
        }
        let Some(persister) = self.persister() else {
            return RespValue::error("ERR no AOF persistence");
        };
        tokio::task::spawn_blocking(move || {
            if let Err(e) = persister.rewrite() {
                error!(error = %e, "background rewrite failed");
            }
        });
        RespValue::simple_string("Background append only file rewriting started")
    }

    fn exec_save(&self) -> RespValue {
        let Some(persister) = self.persister() else {
            return RespValue::error("ERR no AOF persistence");
        };
        match persister.save_snapshot_file(Path::new(&self.config.dbfilename)) {
            Ok(()) => RespValue::ok(),
            Err(e) => RespValue::error(format!("ERR {e}")),
        }
    }

    fn exec_bg_save(&self) -> RespValue {
        let Some(persister) = self.persister() else {
            return RespValue::error("ERR no AOF persistence");
        };
        let dest = self.config.dbfilename.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = persister.save_snapshot_file(Path::new(&dest)) {
                error!(error = %e, "background save failed");
            }
        });
        RespValue::simple_string("Background saving started")
    }

    fn info(&self, args: &[Bytes]) -> RespValue {
        let section = args
            .first()
            .map(|raw| String::from_utf8_lossy(raw).to_ascii_lowercase());

        let mut out = String::new();
        let wanted = |name: &str| section.as_deref().map(|s| s == name).unwrap_or(true);

        if wanted("server") {
            let mode = if self.config.cluster_enable { "cluster" } else { "standalone" };
            out.push_str("# Server\r\n");
            out.push_str(&format!("version:{}\r\n", env!("CARGO_PKG_VERSION")));
            out.push_str(&format!("mode:{mode}\r\n"));
            out.push_str(&format!("os:{} {}\r\n", std::env::consts::OS, std::env::consts::ARCH));
            out.push_str(&format!("arch_bits:{}\r\n", usize::BITS));
            out.push_str(&format!("process_id:{}\r\n", std::process::id()));
            out.push_str(&format!("tcp_port:{}\r\n", self.config.port));
            out.push_str(&format!(
                "uptime_in_seconds:{}\r\n",
                self.start_time.elapsed().as_secs()
            ));
            if let Some(path) = &self.config.config_file {
                out.push_str(&format!("config_file:{}\r\n", path.display()));
            }
        }
        if wanted("clients") {
            out.push_str("# Clients\r\n");
            out.push_str(&format!("connected_clients:{}\r\n", self.stats.active()));
        }
        if wanted("keyspace") {
            out.push_str("# Keyspace\r\n");
            for db in &self.dbs {
                let (keys, expires) = db.sizes();
                if keys > 0 {
                    out.push_str(&format!("db{}:keys={keys},expires={expires}\r\n", db.index()));
                }
            }
        }

        if out.is_empty() {
            return RespValue::error("ERR Invalid section for 'info' command");
        }
        RespValue::bulk_string(out.into_bytes())
    }
}
