//! Command Log Rewrite
//!
//! Compacts the log by replaying its committed prefix into a private
//! auxiliary server and re-emitting one reconstruction command per live
//! key (or a binary snapshot preamble instead, when enabled).
//!
//! Only the two boundary steps take the log mutex:
//!
//! 1. **start**: fsync the live log, record its size S and the file's
//!    current database index, open a unique temp file
//! 2. **finish**: append `SELECT <start db>` plus the live log's bytes
//!    beyond S to the temp file, atomically rename it over the log,
//!    reopen for append, and re-emit the current SELECT
//!
//! Between the two, writers keep appending past S while the bulk of the
//! rewrite runs against the auxiliary replay. A failure anywhere leaves
//! the live log untouched; the temp file is simply dropped.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::aof::marshal::{entity_to_cmd, make_expire_cmd};
use crate::aof::snapshot::{build_snapshot, write_snapshot};
use crate::aof::Persister;
use crate::database::server::Server;
use crate::protocol::{cmd_line, cmd_line_to_bytes};

/// Context carried across one rewrite: the temp file, the committed log
/// size when the rewrite began, and the database selected at that point.
pub struct RewriteCtx {
    tmp_file: NamedTempFile,
    file_size: u64,
    db_index: usize,
}

impl Persister {
    /// Runs a full rewrite cycle. Any error discards the temp file and
    /// leaves the live log as it was.
    pub fn rewrite(&self) -> std::io::Result<()> {
        let mut ctx = self.start_rewrite()?;
        self.do_rewrite(&mut ctx)?;
        self.finish_rewrite(ctx)
    }

    /// First critical section: pin down the prefix to compact.
    fn start_rewrite(&self) -> std::io::Result<RewriteCtx> {
        let state = self.state.lock().unwrap();
        state.file.sync_data()?;
        let file_size = std::fs::metadata(self.path())?.len();

        std::fs::create_dir_all(self.tmp_dir())?;
        let tmp_file = tempfile::Builder::new()
            .suffix(".aof")
            .tempfile_in(self.tmp_dir())?;

        debug!(file_size, db_index = state.current_db, "rewrite started");
        Ok(RewriteCtx {
            tmp_file,
            file_size,
            db_index: state.current_db,
        })
    }

    /// Unlocked bulk phase: replay the committed prefix into a private
    /// server and emit its minimal reconstruction.
    fn do_rewrite(&self, ctx: &mut RewriteCtx) -> std::io::Result<()> {
        let aux = Server::auxiliary(self.databases());
        Persister::replay_file(self.path(), &aux, Some(ctx.file_size))?;

        if self.use_preamble() {
            let snapshot = build_snapshot(&aux, true);
            write_snapshot(ctx.tmp_file.as_file_mut(), &snapshot)?;
            return Ok(());
        }

        let out = ctx.tmp_file.as_file_mut();
        for index in 0..self.databases() {
            let db = aux.database(index).expect("auxiliary database exists");
            out.write_all(&cmd_line_to_bytes(&cmd_line(&["SELECT", &index.to_string()])))?;
            let mut write_error = None;
            db.for_each(|key, entity, expire_at_ms| {
                if let Some(line) = entity_to_cmd(key, entity) {
                    if let Err(e) = out.write_all(&cmd_line_to_bytes(&line)) {
                        write_error = Some(e);
                        return false;
                    }
                }
                if let Some(at_ms) = expire_at_ms {
                    if let Err(e) = out.write_all(&cmd_line_to_bytes(&make_expire_cmd(key, at_ms))) {
                        write_error = Some(e);
                        return false;
                    }
                }
                true
            });
            if let Some(e) = write_error {
                return Err(e);
            }
        }
        Ok(())
    }

    /// Second critical section: splice the tail written since `start`,
    /// swap the files, and reopen.
    fn finish_rewrite(&self, mut ctx: RewriteCtx) -> std::io::Result<()> {
        let mut state = self.state.lock().unwrap();

        let mut src = File::open(self.path())?;
        src.seek(SeekFrom::Start(ctx.file_size))?;

        // align the tail with the database that was selected when the
        // rewrite began
        let out = ctx.tmp_file.as_file_mut();
        out.write_all(&cmd_line_to_bytes(&cmd_line(&["SELECT", &ctx.db_index.to_string()])))?;
        let copied = std::io::copy(&mut src, out)?;
        out.sync_data()?;

        let file = ctx
            .tmp_file
            .persist(self.path())
            .map_err(|e| e.error)?;
        drop(file);

        let mut reopened = OpenOptions::new().append(true).create(true).read(true).open(self.path())?;
        reopened.write_all(&cmd_line_to_bytes(&cmd_line(&[
            "SELECT",
            &state.current_db.to_string(),
        ])))?;
        state.file = reopened;

        info!(tail_bytes = copied, "command log rewritten");
        Ok(())
    }

    /// Writes a standalone snapshot of the committed log prefix to
    /// `dest`, for SAVE and BGSAVE.
    pub fn save_snapshot_file(&self, dest: &Path) -> std::io::Result<()> {
        let ctx = self.start_rewrite()?;
        let aux = Server::auxiliary(self.databases());
        Persister::replay_file(self.path(), &aux, Some(ctx.file_size))?;

        let mut tmp_file = ctx.tmp_file;
        let snapshot = build_snapshot(&aux, false);
        write_snapshot(tmp_file.as_file_mut(), &snapshot)?;
        tmp_file.as_file_mut().sync_data()?;
        tmp_file.persist(dest).map_err(|e| e.error)?;
        info!(dest = %dest.display(), "snapshot saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::config::Config;
    use crate::connection::ConnectionState;
    use crate::database::server::Server;
    use crate::protocol::cmd_line as line;
    use crate::protocol::RespValue;
    use crate::aof::FsyncPolicy;
    use tempfile::TempDir;

    fn aof_config(dir: &TempDir) -> Config {
        Config {
            appendonly: true,
            appendfilename: dir.path().join("test.aof").to_string_lossy().into_owned(),
            appendfsync: FsyncPolicy::Always,
            tmp_dir: dir.path().join("tmp").to_string_lossy().into_owned(),
            databases: 4,
            ..Config::default()
        }
    }

    fn run(server: &Arc<Server>, conn: &mut ConnectionState, parts: &[&str]) -> Option<RespValue> {
        server.exec(conn, &line(parts))
    }

    #[tokio::test]
    async fn test_rewrite_compacts_dead_commands() {
        let dir = TempDir::new().unwrap();
        let config = aof_config(&dir);
        let server = Server::new(config.clone());
        let mut conn = ConnectionState::fake();

        run(&server, &mut conn, &["SET", "a", "1"]);
        run(&server, &mut conn, &["SET", "a", "2"]);
        run(&server, &mut conn, &["RPUSH", "L", "x"]);
        run(&server, &mut conn, &["DEL", "a"]);

        server.persister().unwrap().rewrite().unwrap();

        let content = String::from_utf8(std::fs::read(&config.appendfilename).unwrap()).unwrap();
        assert_eq!(content.matches("RPUSH").count(), 1);
        assert!(!content.contains("DEL"));
        assert_eq!(content.matches("SET").count(), 0);

        // a fresh server restores the same state from the compacted log
        let restored = Server::new(config.clone());
        let mut conn2 = ConnectionState::fake();
        assert_eq!(run(&restored, &mut conn2, &["GET", "a"]).unwrap(), RespValue::Null);
        assert_eq!(
            run(&restored, &mut conn2, &["LRANGE", "L", "0", "-1"]).unwrap(),
            RespValue::Array(vec![RespValue::bulk_string("x")])
        );
    }

    #[tokio::test]
    async fn test_rewrite_preserves_writes_in_window() {
        let dir = TempDir::new().unwrap();
        let config = aof_config(&dir);
        let server = Server::new(config.clone());
        let mut conn = ConnectionState::fake();

        run(&server, &mut conn, &["SET", "old", "1"]);

        let persister = server.persister().unwrap();
        let mut ctx = persister.start_rewrite().unwrap();

        // writers are not paused during the bulk phase
        run(&server, &mut conn, &["SET", "during", "2"]);

        persister.do_rewrite(&mut ctx).unwrap();
        persister.finish_rewrite(ctx).unwrap();

        let restored = Server::new(config.clone());
        let mut conn2 = ConnectionState::fake();
        assert_eq!(
            run(&restored, &mut conn2, &["GET", "old"]).unwrap(),
            RespValue::bulk_string("1")
        );
        assert_eq!(
            run(&restored, &mut conn2, &["GET", "during"]).unwrap(),
            RespValue::bulk_string("2")
        );
    }

    #[tokio::test]
    async fn test_rewrite_with_snapshot_preamble() {
        let dir = TempDir::new().unwrap();
        let mut config = aof_config(&dir);
        config.aof_use_rdb_preamble = true;
        let server = Server::new(config.clone());
        let mut conn = ConnectionState::fake();

        run(&server, &mut conn, &["SET", "a", "1"]);
        run(&server, &mut conn, &["ZADD", "z", "1", "m"]);
        server.persister().unwrap().rewrite().unwrap();

        // the log now starts with the snapshot magic
        let content = std::fs::read(&config.appendfilename).unwrap();
        assert!(content.starts_with(crate::aof::snapshot::SNAPSHOT_MAGIC));

        // commands appended after the rewrite still replay on top
        run(&server, &mut conn, &["SET", "later", "3"]);

        let restored = Server::new(config.clone());
        let mut conn2 = ConnectionState::fake();
        assert_eq!(
            run(&restored, &mut conn2, &["GET", "a"]).unwrap(),
            RespValue::bulk_string("1")
        );
        assert_eq!(
            run(&restored, &mut conn2, &["ZSCORE", "z", "m"]).unwrap(),
            RespValue::bulk_string("1")
        );
        assert_eq!(
            run(&restored, &mut conn2, &["GET", "later"]).unwrap(),
            RespValue::bulk_string("3")
        );
    }

    #[tokio::test]
    async fn test_rewrite_keeps_ttls() {
        let dir = TempDir::new().unwrap();
        let config = aof_config(&dir);
        let server = Server::new(config.clone());
        let mut conn = ConnectionState::fake();

        run(&server, &mut conn, &["SET", "k", "v"]);
        let at_ms = crate::timewheel::now_ms() + 120_000;
        run(&server, &mut conn, &["PEXPIREAT", "k", &at_ms.to_string()]);

        server.persister().unwrap().rewrite().unwrap();

        let restored = Server::new(config.clone());
        assert_eq!(restored.database(0).unwrap().expire_time("k"), Some(at_ms));
    }

    #[tokio::test]
    async fn test_rewrite_tracks_selected_db() {
        let dir = TempDir::new().unwrap();
        let config = aof_config(&dir);
        let server = Server::new(config.clone());
        let mut conn = ConnectionState::fake();

        run(&server, &mut conn, &["SET", "in-zero", "0"]);
        run(&server, &mut conn, &["SELECT", "2"]);
        run(&server, &mut conn, &["SET", "in-two", "2"]);

        server.persister().unwrap().rewrite().unwrap();

        let restored = Server::new(config.clone());
        let mut conn2 = ConnectionState::fake();
        assert_eq!(
            run(&restored, &mut conn2, &["GET", "in-zero"]).unwrap(),
            RespValue::bulk_string("0")
        );
        run(&restored, &mut conn2, &["SELECT", "2"]);
        assert_eq!(
            run(&restored, &mut conn2, &["GET", "in-two"]).unwrap(),
            RespValue::bulk_string("2")
        );
    }

    #[tokio::test]
    async fn test_save_snapshot_file() {
        let dir = TempDir::new().unwrap();
        let config = aof_config(&dir);
        let server = Server::new(config.clone());
        let mut conn = ConnectionState::fake();
        run(&server, &mut conn, &["SET", "k", "v"]);

        let dest = dir.path().join("dump.ekv");
        server.persister().unwrap().save_snapshot_file(&dest).unwrap();

        let content = std::fs::read(&dest).unwrap();
        assert!(content.starts_with(crate::aof::snapshot::SNAPSHOT_MAGIC));
    }
}
