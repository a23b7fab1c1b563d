use std::env;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use crate::error::{QuizError, Result};

pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

pub struct StorageConfig {
    /// Directory holding one JSON file per quiz definition. In-memory when unset.
    pub quiz_json_dir: Option<PathBuf>,
    /// JSON array of users used to seed the identity directory.
    pub users_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

pub struct LoggingConfig {
    pub format: LogFormat,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let port = env::var("SERVER_PORT").unwrap_or_else(|_| "8080".to_string());
        let port = port
            .parse()
            .map_err(|_| QuizError::InvalidConfiguration(format!("SERVER_PORT={port}")))?;

        Ok(Self {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port,
            },
            storage: StorageConfig {
                quiz_json_dir: non_empty_var("QUIZ_JSONS_DIR").map(PathBuf::from),
                users_file: non_empty_var("USERS_FILE").map(PathBuf::from),
            },
            logging: LoggingConfig {
                format: match env::var("LOG_FORMAT").map(|v| v.to_lowercase()) {
                    Ok(v) if v == "json" => LogFormat::Json,
                    _ => LogFormat::Pretty,
                },
            },
        })
    }

    pub fn bind_address(&self) -> ([u8; 4], u16) {
        let ip_addr = self.parse_host_to_ipv4();
        (ip_addr.octets(), self.server.port)
    }

    /// Base URL handed to clients in `websocket_url` responses.
    pub fn public_ws_base(&self) -> String {
        format!("ws://{}:{}", self.server.host, self.server.port)
    }

    fn parse_host_to_ipv4(&self) -> Ipv4Addr {
        if let Ok(addr) = self.server.host.parse::<IpAddr>() {
            match addr {
                IpAddr::V4(ipv4) => return ipv4,
                IpAddr::V6(_) => {
                    tracing::warn!(
                        host = %self.server.host,
                        "IPv6 address provided but only IPv4 supported, using 0.0.0.0"
                    );
                    return Ipv4Addr::new(0, 0, 0, 0);
                }
            }
        }

        match self.server.host.as_str() {
            "localhost" => Ipv4Addr::new(127, 0, 0, 1),
            "" | "0.0.0.0" => Ipv4Addr::new(0, 0, 0, 0),
            _ => {
                tracing::warn!(
                    host = %self.server.host,
                    "Unable to parse host as IPv4, using 0.0.0.0"
                );
                Ipv4Addr::new(0, 0, 0, 0)
            }
        }
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}
