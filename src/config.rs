use std::path::PathBuf;
use std::str::FromStr;

/// Server settings, read from `PETBOOK_*` environment variables. Unset or
/// unparseable values fall back to the defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// Compact the WAL once this many events were appended since the last compaction.
    pub compact_threshold: u64,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "petbook".into(),
            max_connections: 256,
            compact_threshold: 1000,
            tls_cert: None,
            tls_key: None,
            metrics_port: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// `lookup` maps a variable name to its value, if set.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            port: parse_or(lookup("PETBOOK_PORT"), defaults.port),
            bind: lookup("PETBOOK_BIND").unwrap_or(defaults.bind),
            data_dir: lookup("PETBOOK_DATA_DIR").map_or(defaults.data_dir, PathBuf::from),
            password: lookup("PETBOOK_PASSWORD").unwrap_or(defaults.password),
            max_connections: parse_or(lookup("PETBOOK_MAX_CONNECTIONS"), defaults.max_connections)
                .max(1),
            compact_threshold: parse_or(lookup("PETBOOK_COMPACT_THRESHOLD"), defaults.compact_threshold),
            tls_cert: lookup("PETBOOK_TLS_CERT").map(PathBuf::from),
            tls_key: lookup("PETBOOK_TLS_KEY").map(PathBuf::from),
            metrics_port: lookup("PETBOOK_METRICS_PORT").and_then(|s| s.parse().ok()),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("petbook.wal")
    }
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Config {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        assert_eq!(config_from(&[]), Config::default());
    }

    #[test]
    fn reads_overrides() {
        let config = config_from(&[
            ("PETBOOK_PORT", "6543"),
            ("PETBOOK_BIND", "127.0.0.1"),
            ("PETBOOK_DATA_DIR", "/var/lib/petbook"),
            ("PETBOOK_PASSWORD", "s3cret"),
            ("PETBOOK_MAX_CONNECTIONS", "16"),
            ("PETBOOK_COMPACT_THRESHOLD", "50"),
            ("PETBOOK_TLS_CERT", "/etc/petbook/cert.pem"),
            ("PETBOOK_TLS_KEY", "/etc/petbook/key.pem"),
            ("PETBOOK_METRICS_PORT", "9100"),
        ]);
        assert_eq!(config.listen_addr(), "127.0.0.1:6543");
        assert_eq!(config.wal_path(), PathBuf::from("/var/lib/petbook/petbook.wal"));
        assert_eq!(config.password, "s3cret");
        assert_eq!(config.max_connections, 16);
        assert_eq!(config.compact_threshold, 50);
        assert_eq!(config.tls_cert, Some(PathBuf::from("/etc/petbook/cert.pem")));
        assert_eq!(config.tls_key, Some(PathBuf::from("/etc/petbook/key.pem")));
        assert_eq!(config.metrics_port, Some(9100));
    }

    #[test]
    fn bad_numbers_fall_back() {
        let config = config_from(&[
            ("PETBOOK_PORT", "not-a-port"),
            ("PETBOOK_MAX_CONNECTIONS", "0"),
            ("PETBOOK_COMPACT_THRESHOLD", "-1"),
            ("PETBOOK_METRICS_PORT", "99999"),
        ]);
        assert_eq!(config.port, 5433);
        assert_eq!(config.max_connections, 1);
        assert_eq!(config.compact_threshold, 1000);
        assert_eq!(config.metrics_port, None);
    }
}
