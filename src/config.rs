use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use pgwire::tokio::TlsAcceptor;

/// Server settings, read once from `BOOKD_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub compact_threshold: u64,
    /// Seconds after `end` before a reservation is pruned. `None` disables pruning.
    pub prune_after_secs: Option<u64>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            max_connections: 256,
            compact_threshold: 1000,
            prune_after_secs: None,
            tls_cert: None,
            tls_key: None,
            metrics_port: None,
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|s| s.trim().parse().ok())
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable values fall back to the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            bind: lookup("BOOKD_BIND").unwrap_or(defaults.bind),
            port: parsed(&lookup, "BOOKD_PORT").unwrap_or(defaults.port),
            data_dir: lookup("BOOKD_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            max_connections: parsed(&lookup, "BOOKD_MAX_CONNECTIONS")
                .unwrap_or(defaults.max_connections),
            compact_threshold: parsed(&lookup, "BOOKD_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            prune_after_secs: parsed(&lookup, "BOOKD_PRUNE_AFTER_SECS"),
            tls_cert: lookup("BOOKD_TLS_CERT").map(PathBuf::from),
            tls_key: lookup("BOOKD_TLS_KEY").map(PathBuf::from),
            metrics_port: parsed(&lookup, "BOOKD_METRICS_PORT"),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("bookd.wal")
    }

    /// TLS acceptor for the wire listener, or `None` when neither
    /// `BOOKD_TLS_CERT` nor `BOOKD_TLS_KEY` is set. Setting only one is an error.
    pub fn tls_acceptor(&self) -> io::Result<Option<TlsAcceptor>> {
        match (&self.tls_cert, &self.tls_key) {
            (None, None) => Ok(None),
            (Some(cert), Some(key)) => {
                let server = server_tls_config(cert, key)?;
                Ok(Some(TlsAcceptor::from(Arc::new(server))))
            }
            (Some(_), None) => Err(io::Error::new(
                ErrorKind::InvalidInput,
                "BOOKD_TLS_CERT is set but BOOKD_TLS_KEY is not",
            )),
            (None, Some(_)) => Err(io::Error::new(
                ErrorKind::InvalidInput,
                "BOOKD_TLS_KEY is set but BOOKD_TLS_CERT is not",
            )),
        }
    }
}

fn server_tls_config(cert: &Path, key: &Path) -> io::Result<ServerConfig> {
    let chain = rustls_pemfile::certs(&mut BufReader::new(File::open(cert)?))
        .collect::<Result<Vec<_>, _>>()?;
    if chain.is_empty() {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!("no certificates in {}", cert.display()),
        ));
    }
    let private_key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key)?))?
        .ok_or_else(|| {
            io::Error::new(
                ErrorKind::InvalidInput,
                format!("no private key in {}", key.display()),
            )
        })?;

    let mut server = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, private_key)
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
    server.alpn_protocols = vec![b"postgresql".to_vec()];
    Ok(server)
}
