use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::adapter::AdapterFactory;

/// One TCP endpoint the server listens on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenEndpoint {
    pub address: IpAddr,
    pub port: u16,
    /// When set, connections accepted on this endpoint are wrapped in TLS
    /// before the POP3 greeting is sent (implicit TLS / POP3S, RFC 8314).
    /// `None` means plaintext.
    pub tls: Option<TlsEndpointConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsEndpointConfig {
    pub certificate_chain_path: PathBuf,
    pub private_key_path: PathBuf,
}

/// The user/group a root-started process drops privileges to once its
/// listening sockets are bound.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DropPrivileges {
    pub user: String,
    pub group: String,
}

/// Plain-data shape of the configuration, independent of the adapter
/// factory closure so it can be deserialized directly (e.g. from TOML).
/// Loading it from a file, environment, or CLI is left to the caller;
/// this crate only defines the shape and its defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RawConfig {
    pub listen: Vec<ListenEndpoint>,
    pub client_timeout_secs: u64,
    pub max_concurrent_clients: usize,
    /// Negative disables the limit.
    pub max_invalid_commands_per_session: i64,
    /// Negative disables the limit.
    pub max_invalid_passwords_per_session: i64,
    pub failed_login_delay_ms: u64,
    pub working_directory: Option<PathBuf>,
    /// Octal umask, e.g. `0o027`.
    pub umask: Option<u32>,
    pub drop_privileges: Option<DropPrivileges>,
    /// When set, an unexpected failure (a panic) in a connection worker is
    /// re-raised after teardown instead of being logged and swallowed.
    pub debug: bool,
}

impl Default for RawConfig {
    fn default() -> Self {
        RawConfig {
            listen: Vec::new(),
            client_timeout_secs: 600,
            max_concurrent_clients: 25,
            max_invalid_commands_per_session: -1,
            max_invalid_passwords_per_session: 3,
            failed_login_delay_ms: 500,
            working_directory: None,
            umask: None,
            drop_privileges: None,
            debug: false,
        }
    }
}

/// The server's full runtime configuration: `RawConfig`'s data plus the
/// adapter factory, which can't be expressed as serializable data.
#[derive(Clone)]
pub struct Config {
    pub listen: Vec<ListenEndpoint>,
    pub client_timeout: Duration,
    pub max_concurrent_clients: usize,
    pub max_invalid_commands_per_session: i64,
    pub max_invalid_passwords_per_session: i64,
    pub failed_login_delay: Duration,
    pub working_directory: Option<PathBuf>,
    pub umask: Option<u32>,
    pub drop_privileges: Option<DropPrivileges>,
    pub debug: bool,
    pub adapter_factory: AdapterFactory,
}

impl Config {
    pub fn new(raw: RawConfig, adapter_factory: AdapterFactory) -> Self {
        Config {
            listen: raw.listen,
            client_timeout: Duration::from_secs(raw.client_timeout_secs),
            max_concurrent_clients: raw.max_concurrent_clients,
            max_invalid_commands_per_session: raw.max_invalid_commands_per_session,
            max_invalid_passwords_per_session: raw.max_invalid_passwords_per_session,
            failed_login_delay: Duration::from_millis(raw.failed_login_delay_ms),
            working_directory: raw.working_directory,
            umask: raw.umask,
            drop_privileges: raw.drop_privileges,
            debug: raw.debug,
            adapter_factory,
        }
    }
}
