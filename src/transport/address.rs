use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::TransportError;

const LOOP_SUFFIX: &str = "!loop";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TcpHost {
    /// `*`, listen on every interface.
    Any,
    Named(String),
}

/// Where an endpoint reads from or writes to.
///
/// `tcp://*:<port>` listens, `tcp://<host>:<port>` connects,
/// `file://<path>[!loop]` reads or writes local media and `mem://<name>` is
/// an in-process channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Tcp { host: TcpHost, port: u16 },
    File { path: PathBuf, looping: bool },
    Memory { name: String },
}

impl Address {
    pub fn is_listener(&self) -> bool {
        matches!(
            self,
            Address::Tcp {
                host: TcpHost::Any,
                ..
            }
        )
    }

    /// Whether frames written to `self` by a producer reach a consumer reading `consumer`.
    pub fn pairs_with(&self, consumer: &Address) -> bool {
        match (self, consumer) {
            (
                Address::Tcp {
                    host: produce_host,
                    port: produce_port,
                },
                Address::Tcp {
                    host: consume_host,
                    port: consume_port,
                },
            ) => {
                // exactly one side listens
                produce_port == consume_port
                    && matches!(produce_host, TcpHost::Any) != matches!(consume_host, TcpHost::Any)
            }
            (Address::File { path: a, .. }, Address::File { path: b, .. }) => a == b,
            (Address::Memory { name: a }, Address::Memory { name: b }) => a == b,
            _ => false,
        }
    }

    /// Socket address string used to bind or connect.
    pub fn socket_addr(&self) -> Option<String> {
        match self {
            Address::Tcp {
                host: TcpHost::Any,
                port,
            } => Some(format!("0.0.0.0:{port}")),
            Address::Tcp {
                host: TcpHost::Named(host),
                port,
            } => {
                if host.contains(':') {
                    Some(format!("[{host}]:{port}"))
                } else {
                    Some(format!("{host}:{port}"))
                }
            }
            _ => None,
        }
    }
}

impl FromStr for Address {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| TransportError::InvalidAddress(s.to_string(), reason);
        let (scheme, rest) = s.split_once("://").ok_or_else(|| invalid("missing scheme"))?;
        match scheme {
            "tcp" => {
                let (host, port) = rest
                    .rsplit_once(':')
                    .ok_or_else(|| invalid("expected host:port"))?;
                let port = port.parse::<u16>().map_err(|_| invalid("bad port"))?;
                let host = match host.trim_start_matches('[').trim_end_matches(']') {
                    "" => return Err(invalid("empty host")),
                    "*" => TcpHost::Any,
                    named => TcpHost::Named(named.to_string()),
                };
                Ok(Address::Tcp { host, port })
            }
            "file" => {
                let (path, looping) = match rest.strip_suffix(LOOP_SUFFIX) {
                    Some(path) => (path, true),
                    None => (rest, false),
                };
                if path.is_empty() {
                    return Err(invalid("empty path"));
                }
                Ok(Address::File {
                    path: PathBuf::from(path),
                    looping,
                })
            }
            "mem" => {
                if rest.is_empty() {
                    return Err(invalid("empty channel name"));
                }
                Ok(Address::Memory {
                    name: rest.to_string(),
                })
            }
            _ => Err(invalid("unsupported scheme")),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Tcp {
                host: TcpHost::Any,
                port,
            } => write!(f, "tcp://*:{port}"),
            Address::Tcp {
                host: TcpHost::Named(host),
                port,
            } => {
                if host.contains(':') {
                    write!(f, "tcp://[{host}]:{port}")
                } else {
                    write!(f, "tcp://{host}:{port}")
                }
            }
            Address::File { path, looping } => {
                write!(f, "file://{}", path.display())?;
                if *looping {
                    f.write_str(LOOP_SUFFIX)?;
                }
                Ok(())
            }
            Address::Memory { name } => write!(f, "mem://{name}"),
        }
    }
}
