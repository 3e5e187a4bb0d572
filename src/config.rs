//! Server Configuration
//!
//! Settings come from an optional `key value` config file (redis.conf
//! style, `#` comments) overridden by command-line flags. Everything is
//! read-only after startup.

use std::path::{Path, PathBuf};

use crate::aof::FsyncPolicy;

/// Server configuration, immutable after parsing.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Number of logical databases
    pub databases: usize,
    /// Whether the append-only command log is enabled
    pub appendonly: bool,
    /// Command log path
    pub appendfilename: String,
    /// Fsync discipline for the command log
    pub appendfsync: FsyncPolicy,
    /// Write a binary snapshot preamble during log rewrite
    pub aof_use_rdb_preamble: bool,
    /// Standalone snapshot path (SAVE/BGSAVE)
    pub dbfilename: String,
    /// Shared password; `None` disables AUTH
    pub requirepass: Option<String>,
    /// Maximum simultaneous client connections
    pub maxclients: usize,
    /// Directory for rewrite temp files
    pub tmp_dir: String,
    /// Cluster mode marker (always standalone here)
    pub cluster_enable: bool,
    /// Path of the config file actually loaded
    pub config_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 6379,
            databases: 16,
            appendonly: false,
            appendfilename: "appendonly.aof".to_string(),
            appendfsync: FsyncPolicy::EverySec,
            aof_use_rdb_preamble: false,
            dbfilename: "dump.ekv".to_string(),
            requirepass: None,
            maxclients: 10_000,
            tmp_dir: "./tmp".to_string(),
            cluster_enable: false,
            config_file: None,
        }
    }
}

fn parse_bool(raw: &str) -> bool {
    matches!(raw.to_ascii_lowercase().as_str(), "yes" | "true" | "1" | "on")
}

impl Config {
    /// Parses configuration from command-line arguments, loading a config
    /// file first when `--config` is given so flags override file keys.
    pub fn from_args(args: &[String]) -> Result<Self, String> {
        let mut config = Config::default();

        // first pass: find the config file
        let mut i = 0;
        while i < args.len() {
            if args[i] == "--config" || args[i] == "-c" {
                let path = args
                    .get(i + 1)
                    .ok_or_else(|| "--config requires a path".to_string())?;
                config = Self::from_file(Path::new(path))?;
                i += 2;
            } else {
                i += 1;
            }
        }

        // second pass: flags override the file
        let mut i = 0;
        while i < args.len() {
            match args[i].as_str() {
                "--config" | "-c" => i += 2,
                "--bind" | "-h" => {
                    config.bind = Self::flag_value(args, i)?;
                    i += 2;
                }
                "--port" | "-p" => {
                    let raw = Self::flag_value(args, i)?;
                    config.port = raw.parse().map_err(|_| format!("invalid port: {raw}"))?;
                    i += 2;
                }
                "--appendonly" => {
                    config.appendonly = true;
                    i += 1;
                }
                "--requirepass" => {
                    config.requirepass = Some(Self::flag_value(args, i)?);
                    i += 2;
                }
                other => return Err(format!("unknown argument: {other}")),
            }
        }

        Ok(config)
    }

    fn flag_value(args: &[String], i: usize) -> Result<String, String> {
        args.get(i + 1)
            .cloned()
            .ok_or_else(|| format!("{} requires a value", args[i]))
    }

    /// Parses a `key value` config file.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read config file {}: {e}", path.display()))?;
        let mut config = Self::from_str_content(&content)?;
        config.config_file = Some(path.to_path_buf());
        Ok(config)
    }

    fn from_str_content(content: &str) -> Result<Self, String> {
        let mut config = Config::default();
        for (line_no, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once(char::is_whitespace) else {
                return Err(format!("line {}: missing value for '{line}'", line_no + 1));
            };
            let value = value.trim();
            match key.to_ascii_lowercase().as_str() {
                "bind" => config.bind = value.to_string(),
                "port" => {
                    config.port = value.parse().map_err(|_| format!("invalid port: {value}"))?
                }
                "databases" => {
                    let n: usize = value
                        .parse()
                        .map_err(|_| format!("invalid databases count: {value}"))?;
                    if n == 0 {
                        return Err("databases must be at least 1".to_string());
                    }
                    config.databases = n;
                }
                "appendonly" => config.appendonly = parse_bool(value),
                "appendfilename" => config.appendfilename = value.trim_matches('"').to_string(),
                "appendfsync" => config.appendfsync = value.parse()?,
                "aof-use-rdb-preamble" => config.aof_use_rdb_preamble = parse_bool(value),
                "dbfilename" => config.dbfilename = value.trim_matches('"').to_string(),
                "requirepass" => {
                    config.requirepass = if value.is_empty() {
                        None
                    } else {
                        Some(value.to_string())
                    }
                }
                "maxclients" => {
                    config.maxclients = value
                        .parse()
                        .map_err(|_| format!("invalid maxclients: {value}"))?
                }
                "tmp-dir" => config.tmp_dir = value.to_string(),
                "cluster-enable" => config.cluster_enable = parse_bool(value),
                unknown => return Err(format!("unknown config key '{unknown}'")),
            }
        }
        Ok(config)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.port, 6379);
        assert_eq!(config.databases, 16);
        assert!(!config.appendonly);
        assert_eq!(config.appendfsync, FsyncPolicy::EverySec);
        assert_eq!(config.maxclients, 10_000);
    }

    #[test]
    fn test_file_round_trip_of_enumerated_keys() {
        let content = r#"
# server
bind 0.0.0.0
port 7000
databases 4
appendonly yes
appendfilename "my.aof"
appendfsync always
aof-use-rdb-preamble yes
dbfilename "snap.ekv"
requirepass secret
maxclients 128
tmp-dir /tmp/ember
cluster-enable no
"#;
        let config = Config::from_str_content(content).unwrap();
        assert_eq!(config.bind, "0.0.0.0");
        assert_eq!(config.port, 7000);
        assert_eq!(config.databases, 4);
        assert!(config.appendonly);
        assert_eq!(config.appendfilename, "my.aof");
        assert_eq!(config.appendfsync, FsyncPolicy::Always);
        assert!(config.aof_use_rdb_preamble);
        assert_eq!(config.dbfilename, "snap.ekv");
        assert_eq!(config.requirepass.as_deref(), Some("secret"));
        assert_eq!(config.maxclients, 128);
        assert_eq!(config.tmp_dir, "/tmp/ember");
        assert!(!config.cluster_enable);
        assert_eq!(config.bind_address(), "0.0.0.0:7000");
    }

    #[test]
    fn test_bad_keys_and_values_rejected() {
        assert!(Config::from_str_content("nonsense yes").is_err());
        assert!(Config::from_str_content("port notaport").is_err());
        assert!(Config::from_str_content("appendfsync sometimes").is_err());
        assert!(Config::from_str_content("databases 0").is_err());
    }

    #[test]
    fn test_args_override() {
        let args: Vec<String> = ["--port", "6400", "--appendonly"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let config = Config::from_args(&args).unwrap();
        assert_eq!(config.port, 6400);
        assert!(config.appendonly);
        assert!(Config::from_args(&["--bogus".to_string()]).is_err());
    }
}
