use async_trait::async_trait;
use ldap3::{Ldap, LdapConnAsync, SearchEntry};

use super::{bind_outcome, guard, search_outcome, tls_settings, LdapClient, SearchScope};
use crate::error::{DirectoryError, Result};
use crate::{CallOptions, LdapTarget};

/// `ldap3` async API, connection driven on the tokio runtime
pub struct AsyncLdapClient {
    ldap: Ldap,
    url: String,
    options: CallOptions,
    closed: bool,
}

impl AsyncLdapClient {
    pub async fn connect(target: &LdapTarget, options: &CallOptions) -> Result<Self> {
        let url = target.url();
        let settings = tls_settings(target, options);

        let (conn, ldap) = guard(options, "connect", async {
            LdapConnAsync::with_settings(settings, &url)
                .await
                .map_err(|e| DirectoryError::Connection(format!("{url}: {e}")))
        })
        .await?;
        ldap3::drive!(conn);

        tracing::debug!("Connected to {url}");

        Ok(Self {
            ldap,
            url,
            options: options.clone(),
            closed: false,
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(DirectoryError::Connection(format!("{} is closed", self.url)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl LdapClient for AsyncLdapClient {
    async fn bind(&mut self, dn: &str, password: &str) -> Result<()> {
        self.ensure_open()?;
        let timeout = self.options.timeout;
        let ldap = &mut self.ldap;

        guard(&self.options, "bind", async {
            bind_outcome(ldap.with_timeout(timeout).simple_bind(dn, password).await, dn)
        })
        .await
    }

    async fn search_attrs(
        &mut self,
        base: &str,
        filter: &str,
        scope: SearchScope,
        attrs: &[&str],
    ) -> Result<Vec<SearchEntry>> {
        if filter.trim().is_empty() {
            return Ok(Vec::new());
        }
        self.ensure_open()?;

        tracing::debug!("Searching {filter} under {base:?} on {}", self.url);
        let timeout = self.options.timeout;
        let ldap = &mut self.ldap;

        guard(&self.options, "search", async {
            search_outcome(
                ldap.with_timeout(timeout)
                    .search(base, scope.into(), filter, attrs)
                    .await,
                base,
                filter,
            )
        })
        .await
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.ldap.unbind().await {
            tracing::debug!("Unbind from {} failed: {e}", self.url);
        }
    }
}
