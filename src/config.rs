//! `key=value` configuration file parsing, `#`-comments and whitespace
//! trimmed, as consumed by [`crate::main`].

use std::path::{Path, PathBuf};

use crate::error::{NodeError, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub master_ip: String,
    pub master_port: u16,
    pub client_uid: String,
    pub token: String,
    pub keepalive_interval: u64,
    pub server_ip: String,
    pub server_port: u16,
    pub node_status_report_interval: u64,
    pub log_file_path: PathBuf,
}

const REQUIRED_KEYS: &[&str] = &[
    "master_ip",
    "master_port",
    "client_uid",
    "token",
    "keepalive_interval",
    "server_ip",
    "server_port",
    "node_status_report_interval",
    "log_file_path",
];

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut values = std::collections::HashMap::new();

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            values.insert(key.trim().to_string(), value.trim().to_string());
        }

        for key in REQUIRED_KEYS {
            if !values.contains_key(*key) {
                return Err(NodeError::InvalidArgument(format!(
                    "missing required config key '{key}'"
                )));
            }
        }

        let parse_u16 = |key: &str| -> Result<u16> {
            values[key]
                .parse::<u16>()
                .map_err(|_| NodeError::InvalidArgument(format!("config key '{key}' is not a valid port")))
        };
        let parse_u64 = |key: &str| -> Result<u64> {
            values[key]
                .parse::<u64>()
                .map_err(|_| NodeError::InvalidArgument(format!("config key '{key}' is not a valid number")))
        };

        Ok(Config {
            master_ip: values["master_ip"].clone(),
            master_port: parse_u16("master_port")?,
            client_uid: values["client_uid"].clone(),
            token: values["token"].clone(),
            keepalive_interval: parse_u64("keepalive_interval")?,
            server_ip: values["server_ip"].clone(),
            server_port: parse_u16("server_port")?,
            node_status_report_interval: parse_u64("node_status_report_interval")?,
            log_file_path: PathBuf::from(&values["log_file_path"]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    const VALID: &str = "
        # control plane
        master_ip = 127.0.0.1
        master_port = 9000
        client_uid = node-1
        token = secret-token
        keepalive_interval = 30

        # query server
        server_ip = 0.0.0.0
        server_port = 7000
        node_status_report_interval = 60
        log_file_path = /var/lib/jwt-blacklist
    ";

    #[test]
    fn parses_valid_config() {
        let file = write_config(VALID);
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.master_ip, "127.0.0.1");
        assert_eq!(config.master_port, 9000);
        assert_eq!(config.client_uid, "node-1");
        assert_eq!(config.keepalive_interval, 30);
        assert_eq!(config.log_file_path, PathBuf::from("/var/lib/jwt-blacklist"));
    }

    #[test]
    fn missing_key_names_it_in_the_error() {
        let file = write_config("master_ip = 127.0.0.1\n");
        let err = Config::from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("master_port"));
    }

    #[test]
    fn ignores_comments_and_blank_lines() {
        let file = write_config("\n# just a comment\n\n master_ip=1.2.3.4\n");
        let contents = std::fs::read_to_string(file.path()).unwrap();
        assert!(contents.contains("master_ip"));
    }
}
