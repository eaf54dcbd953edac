//! Directory connections.
//!
//! Upper layers talk to a server only through [`LdapConnector`] and
//! [`LdapClient`]; which `ldap3` API sits underneath is decided once, when
//! the connector is built.

mod async_client;
mod blocking;
mod entry;
#[cfg(test)]
pub(crate) mod testing;

use std::future::Future;

use async_trait::async_trait;
use ldap3::{LdapError, LdapResult, SearchEntry, SearchResult};
use serde::{Deserialize, Serialize};
use tokio::runtime::{Handle, RuntimeFlavor};

pub use async_client::AsyncLdapClient;
pub use blocking::BlockingLdapClient;
pub use entry::LdapClientEntry;

use crate::error::{DirectoryError, Result};
use crate::{Bind, CallOptions, LdapTarget};

const RC_SUCCESS: u32 = 0;
const RC_SIZE_LIMIT_EXCEEDED: u32 = 4;
const RC_NO_SUCH_OBJECT: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    Base,
    OneLevel,
    Subtree,
}

impl From<SearchScope> for ldap3::Scope {
    fn from(scope: SearchScope) -> Self {
        match scope {
            SearchScope::Base => ldap3::Scope::Base,
            SearchScope::OneLevel => ldap3::Scope::OneLevel,
            SearchScope::Subtree => ldap3::Scope::Subtree,
        }
    }
}

/// One open, possibly bound, directory connection
#[async_trait]
pub trait LdapClient: Send {
    /// Simple bind. A rejected bind is an [`DirectoryError::Authentication`]
    async fn bind(&mut self, dn: &str, password: &str) -> Result<()>;

    async fn bind_with(&mut self, credentials: &Bind) -> Result<()> {
        self.bind(&credentials.dn, &credentials.pass).await
    }

    /// Search returning every user attribute
    async fn search(
        &mut self,
        base: &str,
        filter: &str,
        scope: SearchScope,
    ) -> Result<Vec<SearchEntry>> {
        self.search_attrs(base, filter, scope, &["*"]).await
    }

    async fn search_attrs(
        &mut self,
        base: &str,
        filter: &str,
        scope: SearchScope,
        attrs: &[&str],
    ) -> Result<Vec<SearchEntry>>;

    /// Unbind. Calling it again is a no-op
    async fn close(&mut self);
}

#[async_trait]
pub trait LdapConnector: Send + Sync {
    async fn connect(
        &self,
        target: &LdapTarget,
        options: &CallOptions,
    ) -> Result<Box<dyn LdapClient>>;
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClientBackend {
    /// Probe the running tokio runtime
    #[default]
    Auto,
    /// `ldap3::LdapConnAsync`
    Async,
    /// `ldap3::LdapConn` on the blocking thread pool
    Blocking,
}

impl ClientBackend {
    /// Async backend on a multi-threaded runtime, blocking backend otherwise
    pub fn probe() -> Self {
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                ClientBackend::Async
            }
            _ => ClientBackend::Blocking,
        }
    }

    pub fn resolve(self) -> Self {
        match self {
            ClientBackend::Auto => Self::probe(),
            backend => backend,
        }
    }
}

/// Connector over the `ldap3` crate
#[derive(Debug, Clone, Copy)]
pub struct Ldap3Connector {
    backend: ClientBackend,
}

impl Ldap3Connector {
    pub fn new(backend: ClientBackend) -> Self {
        let backend = backend.resolve();
        tracing::debug!("Using {backend:?} LDAP client backend");
        Self { backend }
    }

    pub fn backend(&self) -> ClientBackend {
        self.backend
    }
}

#[async_trait]
impl LdapConnector for Ldap3Connector {
    async fn connect(
        &self,
        target: &LdapTarget,
        options: &CallOptions,
    ) -> Result<Box<dyn LdapClient>> {
        Ok(match self.backend {
            ClientBackend::Blocking => {
                Box::new(BlockingLdapClient::connect(target, options).await?)
            }
            ClientBackend::Async | ClientBackend::Auto => {
                Box::new(AsyncLdapClient::connect(target, options).await?)
            }
        })
    }
}

/// Connect and, when credentials are given, bind
pub async fn open(
    connector: &dyn LdapConnector,
    target: &LdapTarget,
    credentials: Option<&Bind>,
    options: &CallOptions,
) -> Result<Box<dyn LdapClient>> {
    let mut client = connector.connect(target, options).await?;
    if let Some(credentials) = credentials {
        tracing::debug!("Binding to {} as {}", target.host, credentials.dn);
        if let Err(error) = client.bind_with(credentials).await {
            client.close().await;
            return Err(error);
        }
    }
    Ok(client)
}

/// Run `fut` under the call timeout, aborting early on cancellation
pub(crate) async fn guard<T, F>(options: &CallOptions, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        _ = options.cancel.cancelled() => Err(DirectoryError::Cancelled),
        result = tokio::time::timeout(options.timeout, fut) => match result {
            Ok(result) => result,
            Err(_) => Err(DirectoryError::Timeout(format!(
                "{what} after {}s",
                options.timeout.as_secs()
            ))),
        },
    }
}

fn tls_settings(target: &LdapTarget, options: &CallOptions) -> ldap3::LdapConnSettings {
    ldap3::LdapConnSettings::new()
        .set_conn_timeout(options.timeout)
        .set_no_tls_verify(matches!(target.tls, crate::TlsMode::TlsNoVerify))
}

fn bind_outcome(result: std::result::Result<LdapResult, LdapError>, dn: &str) -> Result<()> {
    let result = result.map_err(|e| DirectoryError::Connection(e.to_string()))?;
    if result.rc == RC_SUCCESS {
        Ok(())
    } else {
        Err(DirectoryError::Authentication(format!(
            "{dn}: rc={} {}",
            result.rc, result.text
        )))
    }
}

fn search_outcome(
    result: std::result::Result<SearchResult, LdapError>,
    base: &str,
    filter: &str,
) -> Result<Vec<SearchEntry>> {
    let SearchResult(entries, result) =
        result.map_err(|e| DirectoryError::Connection(e.to_string()))?;

    match result.rc {
        RC_SUCCESS => {}
        RC_SIZE_LIMIT_EXCEEDED => {
            tracing::warn!("Size limit exceeded searching {filter} under {base}, results truncated")
        }
        RC_NO_SUCH_OBJECT => return Ok(Vec::new()),
        rc => {
            return Err(DirectoryError::Search(format!(
                "{filter} under {base}: rc={rc} {}",
                result.text
            )))
        }
    }

    Ok(entries.into_iter().map(SearchEntry::construct).collect())
}
