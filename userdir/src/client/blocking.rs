use async_trait::async_trait;
use ldap3::{LdapConn, SearchEntry};

use super::{bind_outcome, guard, search_outcome, tls_settings, LdapClient, SearchScope};
use crate::error::{DirectoryError, Result};
use crate::{CallOptions, LdapTarget};

/// `ldap3` synchronous API; every call runs on the blocking thread pool.
///
/// The connection moves into the blocking task and back. A call that times
/// out or is cancelled loses the connection, later calls fail as closed.
pub struct BlockingLdapClient {
    conn: Option<LdapConn>,
    url: String,
    options: CallOptions,
}

fn join_error(error: tokio::task::JoinError) -> DirectoryError {
    DirectoryError::Connection(format!("LDAP worker failed: {error}"))
}

impl BlockingLdapClient {
    pub async fn connect(target: &LdapTarget, options: &CallOptions) -> Result<Self> {
        let url = target.url();
        let settings = tls_settings(target, options);

        let worker_url = url.clone();
        let conn = guard(options, "connect", async move {
            tokio::task::spawn_blocking(move || LdapConn::with_settings(settings, &worker_url))
                .await
                .map_err(join_error)?
                .map_err(|e| DirectoryError::Connection(e.to_string()))
        })
        .await
        .map_err(|e| match e {
            DirectoryError::Connection(reason) => {
                DirectoryError::Connection(format!("{url}: {reason}"))
            }
            e => e,
        })?;

        tracing::debug!("Connected to {url}");

        Ok(Self {
            conn: Some(conn),
            url,
            options: options.clone(),
        })
    }

    async fn run<T, F>(&mut self, what: &str, call: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut LdapConn) -> Result<T> + Send + 'static,
    {
        let mut conn = self
            .conn
            .take()
            .ok_or_else(|| DirectoryError::Connection(format!("{} is closed", self.url)))?;

        let (conn, result) = guard(&self.options, what, async move {
            tokio::task::spawn_blocking(move || {
                let result = call(&mut conn);
                (conn, result)
            })
            .await
            .map_err(join_error)
        })
        .await?;

        self.conn = Some(conn);
        result
    }
}

#[async_trait]
impl LdapClient for BlockingLdapClient {
    async fn bind(&mut self, dn: &str, password: &str) -> Result<()> {
        let timeout = self.options.timeout;
        let dn = dn.to_string();
        let password = password.to_string();

        self.run("bind", move |conn| {
            bind_outcome(conn.with_timeout(timeout).simple_bind(&dn, &password), &dn)
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

        tracing::debug!("Searching {filter} under {base:?} on {}", self.url);
        let timeout = self.options.timeout;
        let base = base.to_string();
        let filter = filter.to_string();
        let attrs = attrs.iter().map(|a| a.to_string()).collect::<Vec<_>>();

        self.run("search", move |conn| {
            search_outcome(
                conn.with_timeout(timeout)
                    .search(&base, scope.into(), &filter, attrs),
                &base,
                &filter,
            )
        })
        .await
    }

    async fn close(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            let url = self.url.clone();
            let unbind = tokio::task::spawn_blocking(move || {
                if let Err(e) = conn.unbind() {
                    tracing::debug!("Unbind from {url} failed: {e}");
                }
            });
            if let Err(e) = unbind.await {
                tracing::debug!("Unbind worker failed: {e}");
            }
        }
    }
}
