pub mod client;
pub mod config;
pub mod directory;
pub mod dn;
pub mod domain;
pub mod error;
pub mod filter;
pub mod principal;

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use client::{
    ClientBackend, Ldap3Connector, LdapClient, LdapClientEntry, LdapConnector, SearchScope,
};
pub use config::{Config, DirectoryConfig};
pub use directory::{
    ActiveDirectory, AdConfig, DirectoryGroup, DirectoryPrincipal, DirectoryUser,
    DomainSearchMode, GenericLdapDirectory, GroupSearchType, LdapDirectoryConfig, OpenLdapConfig,
    OpenLdapDirectory, PrincipalSearchType, PrincipalSummary, UserDirectory,
};
pub use domain::{CredentialedDomain, NetbiosMap};
pub use error::{DirectoryError, Result};
pub use principal::{PrincipalId, PrincipalKind, ResolvedPrincipal};

#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Bind {
    pub dn: String,
    pub pass: String,
}

impl std::fmt::Debug for Bind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bind")
            .field("dn", &self.dn)
            .field("pass", &"<redacted>")
            .finish()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TlsMode {
    #[default]
    Plain,
    Tls,
    /// TLS without certificate verification
    TlsNoVerify,
}

impl TlsMode {
    pub fn is_tls(&self) -> bool {
        !matches!(self, TlsMode::Plain)
    }

    pub fn default_port(&self) -> u16 {
        if self.is_tls() {
            636
        } else {
            389
        }
    }
}

/// Server a connection is opened against
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapTarget {
    pub host: String,
    pub port: Option<u16>,
    pub tls: TlsMode,
}

impl LdapTarget {
    pub fn new(host: impl Into<String>, port: Option<u16>, tls: TlsMode) -> Self {
        Self {
            host: host.into(),
            port,
            tls,
        }
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(self.tls.default_port())
    }

    pub fn url(&self) -> String {
        let scheme = if self.tls.is_tls() { "ldaps" } else { "ldap" };
        format!("{scheme}://{}:{}", self.host, self.port())
    }
}

pub(crate) fn default_timeout_seconds() -> u64 {
    30
}

/// Connection settings shared by every directory kind
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ConnectionConfig {
    #[serde(default)]
    pub host: Option<String>,

    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default)]
    pub tls: TlsMode,

    pub bind: Option<Bind>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: None,
            tls: TlsMode::Plain,
            bind: None,
        }
    }
}

impl ConnectionConfig {
    pub fn target_for(&self, host: &str) -> LdapTarget {
        LdapTarget::new(host, self.port, self.tls)
    }

    /// Target of the configured host, if any
    pub fn target(&self) -> Option<LdapTarget> {
        self.host.as_deref().map(|host| self.target_for(host))
    }
}

/// Per-call limits applied to every network operation
#[derive(Debug, Clone)]
pub struct CallOptions {
    pub timeout: Duration,
    pub cancel: tokio_util::sync::CancellationToken,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(default_timeout_seconds()),
            cancel: Default::default(),
        }
    }
}

impl CallOptions {
    pub fn new(timeout_seconds: u64, cancel: tokio_util::sync::CancellationToken) -> Self {
        Self {
            timeout: Duration::from_secs(timeout_seconds),
            cancel,
        }
    }
}
