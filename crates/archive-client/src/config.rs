use std::env;
use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::connection::ConnectionOptions;
use crate::error::ConnectionError;

/// Socket used when nothing else names a server.
pub const DEFAULT_SOCKET_PATH: &str = "/run/archive/archive.socket";
pub const DEFAULT_PORT: u16 = 14232;

const ENV_URL: &str = "ARCHIVE_SERVER_URL";
const ENV_HOST: &str = "ARCHIVE_SERVER_HOST";
const ENV_PORT: &str = "ARCHIVE_SERVER_PORT";
const ENV_SOCKET: &str = "ARCHIVE_SERVER_SOCKET";
const ENV_SERVER: &str = "ARCHIVE_SERVER";
const ENV_NAME: &str = "ARCHIVE_CONNECTION_NAME";
const ENV_HEARTBEAT_SECS: &str = "ARCHIVE_HEARTBEAT_SECS";
const ENV_READ_TIMEOUT_SECS: &str = "ARCHIVE_READ_TIMEOUT_SECS";

/// Where and how to reach the archive server.
///
/// Built once at startup and passed by reference to [`crate::Connection::connect`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub url: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub unix_socket: Option<PathBuf>,
    /// Catch-all location, usually taken from `ARCHIVE_SERVER`.
    pub server: Option<String>,
    pub connection_name: String,
    pub options: ConnectionOptions,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: None,
            port: None,
            unix_socket: None,
            server: None,
            connection_name: default_connection_name(),
            options: ConnectionOptions::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerAddress {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

impl ClientConfig {
    pub fn from_env() -> Self {
        let mut options = ConnectionOptions::default();
        if let Some(secs) = env_u64(ENV_HEARTBEAT_SECS) {
            options.heartbeat_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = env_u64(ENV_READ_TIMEOUT_SECS) {
            options.read_timeout = Duration::from_secs(secs.max(1));
        }
        Self {
            url: env_nonempty(ENV_URL),
            host: env_nonempty(ENV_HOST),
            port: env_nonempty(ENV_PORT).and_then(|value| value.parse().ok()),
            unix_socket: env_nonempty(ENV_SOCKET).map(PathBuf::from),
            server: env_nonempty(ENV_SERVER),
            connection_name: env_nonempty(ENV_NAME).unwrap_or_else(default_connection_name),
            options,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = name.into();
        self
    }

    /// Picks the server location: explicit URL, then host and port, then Unix
    /// socket path, then the catch-all setting, then [`DEFAULT_SOCKET_PATH`].
    pub fn resolve(&self) -> Result<ServerAddress, ConnectionError> {
        if let Some(url) = &self.url {
            return ServerAddress::parse(url);
        }
        if let Some(host) = &self.host {
            return Ok(ServerAddress::Tcp {
                host: host.clone(),
                port: self.port.unwrap_or(DEFAULT_PORT),
            });
        }
        if let Some(path) = &self.unix_socket {
            return Ok(ServerAddress::Unix(path.clone()));
        }
        if let Some(server) = &self.server {
            return ServerAddress::parse(server);
        }
        Ok(ServerAddress::Unix(PathBuf::from(DEFAULT_SOCKET_PATH)))
    }
}

impl ServerAddress {
    /// Accepts `tcp://host:port`, `unix:///path`, a bare absolute path, or `host[:port]`.
    pub fn parse(value: &str) -> Result<Self, ConnectionError> {
        let value = value.trim();
        if value.is_empty() {
            return Err(ConnectionError::InvalidAddress("empty address".into()));
        }
        if value.starts_with('/') {
            return Ok(ServerAddress::Unix(PathBuf::from(value)));
        }
        if value.contains("://") {
            let url = Url::parse(value)
                .map_err(|err| ConnectionError::InvalidAddress(format!("{value}: {err}")))?;
            return match url.scheme() {
                "unix" => {
                    if url.path().is_empty() {
                        return Err(ConnectionError::InvalidAddress(format!(
                            "{value}: missing socket path"
                        )));
                    }
                    Ok(ServerAddress::Unix(PathBuf::from(url.path())))
                }
                "tcp" => {
                    let host = url.host_str().ok_or_else(|| {
                        ConnectionError::InvalidAddress(format!("{value}: missing host"))
                    })?;
                    Ok(ServerAddress::Tcp {
                        host: host.to_string(),
                        port: url.port().unwrap_or(DEFAULT_PORT),
                    })
                }
                other => Err(ConnectionError::InvalidAddress(format!(
                    "unsupported scheme {other}"
                ))),
            };
        }
        match value.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse()
                    .map_err(|_| ConnectionError::InvalidAddress(format!("bad port in {value}")))?;
                Ok(ServerAddress::Tcp {
                    host: host.to_string(),
                    port,
                })
            }
            None => Ok(ServerAddress::Tcp {
                host: value.to_string(),
                port: DEFAULT_PORT,
            }),
        }
    }
}

impl std::fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerAddress::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            ServerAddress::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

fn default_connection_name() -> String {
    format!("archive-client-{}", std::process::id())
}

fn env_nonempty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn env_u64(key: &str) -> Option<u64> {
    env_nonempty(key).and_then(|value| value.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn explicit_url_wins() {
        let config = ClientConfig {
            url: Some("tcp://archive.example.org:9000".into()),
            host: Some("ignored".into()),
            unix_socket: Some("/tmp/ignored".into()),
            ..ClientConfig::default()
        };
        assert_eq!(
            config.resolve().expect("resolve"),
            ServerAddress::Tcp {
                host: "archive.example.org".into(),
                port: 9000
            }
        );
    }

    #[test_timeout::timeout]
    fn host_then_socket_then_fallback() {
        let mut config = ClientConfig {
            host: Some("10.0.0.2".into()),
            unix_socket: Some("/tmp/archive.sock".into()),
            ..ClientConfig::default()
        };
        assert_eq!(
            config.resolve().expect("resolve"),
            ServerAddress::Tcp {
                host: "10.0.0.2".into(),
                port: DEFAULT_PORT
            }
        );
        config.host = None;
        assert_eq!(
            config.resolve().expect("resolve"),
            ServerAddress::Unix("/tmp/archive.sock".into())
        );
        config.unix_socket = None;
        config.server = Some("archive:7000".into());
        assert_eq!(
            config.resolve().expect("resolve"),
            ServerAddress::Tcp {
                host: "archive".into(),
                port: 7000
            }
        );
        config.server = None;
        assert_eq!(
            config.resolve().expect("resolve"),
            ServerAddress::Unix(DEFAULT_SOCKET_PATH.into())
        );
    }

    #[test_timeout::timeout]
    fn parses_address_forms() {
        assert_eq!(
            ServerAddress::parse("unix:///var/run/archive.sock").expect("unix"),
            ServerAddress::Unix("/var/run/archive.sock".into())
        );
        assert_eq!(
            ServerAddress::parse("/srv/archive.sock").expect("path"),
            ServerAddress::Unix("/srv/archive.sock".into())
        );
        assert_eq!(
            ServerAddress::parse("tcp://localhost").expect("tcp"),
            ServerAddress::Tcp {
                host: "localhost".into(),
                port: DEFAULT_PORT
            }
        );
        assert!(ServerAddress::parse("http://example.org").is_err());
        assert!(ServerAddress::parse("host:notaport").is_err());
        assert!(ServerAddress::parse("  ").is_err());
    }
}
