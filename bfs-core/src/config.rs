//! The configuration loader. `spec.md` §6 lists a flat namespace of
//! `section.key` options; nothing in this crate needs nested sections, so
//! the file format is the simplest one that expresses them: one
//! `section.key = value` pair per line, `#` starts a comment, blank lines
//! are ignored. This is a `(NEW)` ambient subsystem per `SPEC_FULL.md` §1 —
//! `spec.md` treats the config loader as a thin, out-of-scope contract.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    BadLine { line_no: usize, text: String },
    BadBool { key: String, value: String },
    BadInt { key: String, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "{e}"),
            ConfigError::BadLine { line_no, text } => {
                write!(f, "line {line_no}: expected `key = value`, got `{text}`")
            }
            ConfigError::BadBool { key, value } => {
                write!(f, "{key}: `{value}` is not a boolean")
            }
            ConfigError::BadInt { key, value } => {
                write!(f, "{key}: `{value}` is not an integer")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

/// The parsed, typed configuration surface named in `spec.md` §6.
#[derive(Debug, Clone)]
pub struct Config {
    pub bfs_server_port: u16,
    pub num_file_worker_threads: u64,
    pub merkle_tree: bool,
    pub journal: bool,
    pub perf_test: bool,
    pub use_lwext4_impl: bool,
    pub cache_sz_limit: u64,
    pub cache_enabled: bool,
    /// `bfsCommon.paranoid`: whether Merkle verification walks to the root
    /// on every read. Not present in the original source (a compile-time
    /// constant there); `spec.md` §9 requires it be a runtime config knob.
    /// Default `true`.
    pub paranoid: bool,
    pub log_enabled: bool,
    pub log_verbose: bool,
    pub log_to_file: bool,
    pub logfile: Option<String>,
    pub fs_sa_key: Option<[u8; 16]>,
    pub cl_serv_sa_key: Option<[u8; 16]>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bfs_server_port: 7070,
            num_file_worker_threads: 0,
            merkle_tree: true,
            journal: false,
            perf_test: false,
            use_lwext4_impl: false,
            cache_sz_limit: 1024,
            cache_enabled: true,
            paranoid: true,
            log_enabled: true,
            log_verbose: false,
            log_to_file: false,
            logfile: None,
            fs_sa_key: None,
            cl_serv_sa_key: None,
        }
    }
}

impl Config {
    /// Parses a config file at `path`, starting from [`Config::default`]
    /// and overriding whichever recognized keys appear. Unknown keys are
    /// logged at `warn` and ignored, per `SPEC_FULL.md` §6.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut cfg = Config::default();
        for (line_no, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::BadLine {
                    line_no: line_no + 1,
                    text: raw.to_string(),
                });
            };
            let key = key.trim();
            let value = value.trim();
            cfg.apply(key, value)?;
        }
        Ok(cfg)
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "bfsServer.bfs_server_port" => self.bfs_server_port = parse_int(key, value)?,
            "bfsServer.num_file_worker_threads" => {
                self.num_file_worker_threads = parse_int(key, value)?
            }
            "bfsCommon.merkle_tree" => self.merkle_tree = parse_bool(key, value)?,
            "bfsCommon.journal" => self.journal = parse_bool(key, value)?,
            "bfsCommon.perf_test" => self.perf_test = parse_bool(key, value)?,
            "bfsCommon.paranoid" => self.paranoid = parse_bool(key, value)?,
            "bfsFsLayer.use_lwext4_impl" => self.use_lwext4_impl = parse_bool(key, value)?,
            "bfsUtilLayer.cache_sz_limit" => self.cache_sz_limit = parse_int(key, value)?,
            "bfsUtilLayer.cache_enabled" => self.cache_enabled = parse_bool(key, value)?,
            k if k.ends_with(".log_enabled") => self.log_enabled = parse_bool(key, value)?,
            k if k.ends_with(".log_verbose") => self.log_verbose = parse_bool(key, value)?,
            k if k.ends_with(".log_to_file") => self.log_to_file = parse_bool(key, value)?,
            k if k.ends_with(".logfile") => self.logfile = Some(value.to_string()),
            "fs_sa.key" => self.fs_sa_key = Some(parse_hex_key(key, value)?),
            "cl_serv_sa.key" => self.cl_serv_sa_key = Some(parse_hex_key(key, value)?),
            other => {
                log::warn!("unrecognized config key `{other}`, ignoring");
            }
        }
        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(ConfigError::BadBool {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::BadInt {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_hex_key(key: &str, value: &str) -> Result<[u8; 16], ConfigError> {
    if value.len() != 32 {
        return Err(ConfigError::BadInt {
            key: key.to_string(),
            value: value.to_string(),
        });
    }
    let mut out = [0u8; 16];
    for i in 0..16 {
        out[i] = u8::from_str_radix(&value[i * 2..i * 2 + 2], 16).map_err(|_| ConfigError::BadInt {
            key: key.to_string(),
            value: value.to_string(),
        })?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_recognized_keys() {
        let text = "\
# a comment
bfsServer.bfs_server_port = 9999
bfsServer.num_file_worker_threads = 4
bfsCommon.merkle_tree = false
bfsCommon.paranoid = 0
bfsUtilLayer.cache_sz_limit = 256
fs.log_enabled = false
";
        let cfg = Config::parse(text).unwrap();
        assert_eq!(cfg.bfs_server_port, 9999);
        assert_eq!(cfg.num_file_worker_threads, 4);
        assert!(!cfg.merkle_tree);
        assert!(!cfg.paranoid);
        assert_eq!(cfg.cache_sz_limit, 256);
        assert!(!cfg.log_enabled);
    }

    #[test]
    fn unknown_keys_are_ignored_not_fatal() {
        let cfg = Config::parse("totally.unknown = yes\n").unwrap();
        assert_eq!(cfg.bfs_server_port, Config::default().bfs_server_port);
    }

    #[test]
    fn malformed_line_is_an_error() {
        let err = Config::parse("not a key value pair").unwrap_err();
        assert!(matches!(err, ConfigError::BadLine { .. }));
    }

    #[test]
    fn hex_key_parses_to_16_bytes() {
        let cfg = Config::parse("fs_sa.key = 000102030405060708090a0b0c0d0e0f\n").unwrap();
        assert_eq!(
            cfg.fs_sa_key.unwrap(),
            [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15]
        );
    }
}
