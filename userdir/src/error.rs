use thiserror::Error;

pub type Result<T, E = DirectoryError> = std::result::Result<T, E>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    /// Host unreachable, TLS handshake failure, dropped connection
    #[error("LDAP connection failed: {0}")]
    Connection(String),

    /// Bind rejected by the server
    #[error("LDAP bind failed: {0}")]
    Authentication(String),

    /// Search rejected by the server. Never fatal on its own
    #[error("LDAP search failed: {0}")]
    Search(String),

    #[error("LDAP operation timed out: {0}")]
    Timeout(String),

    #[error("LDAP operation cancelled")]
    Cancelled,

    #[error("Invalid directory configuration: {0}")]
    Config(String),
}

impl DirectoryError {
    /// Fatal errors cross the directory boundary, the rest are logged and absorbed
    pub fn is_fatal(&self) -> bool {
        !matches!(self, DirectoryError::Search(_))
    }
}

/// Absorb a non-fatal error, logging it with `context`.
///
/// Fatal errors are handed back so the caller can propagate them with `?`.
pub(crate) fn absorb<T: Default>(result: Result<T>, context: &str) -> Result<T> {
    match result {
        Ok(value) => Ok(value),
        Err(error) if error.is_fatal() => Err(error),
        Err(error) => {
            tracing::warn!("{context}: {error}");
            Ok(T::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_search_errors_are_absorbed() {
        let absorbed: Result<Vec<u8>> = absorb(Err(DirectoryError::Search("rc=50".into())), "t");
        assert_eq!(absorbed, Ok(vec![]));

        let fatal: Result<Vec<u8>> = absorb(Err(DirectoryError::Connection("down".into())), "t");
        assert!(matches!(fatal, Err(DirectoryError::Connection(_))));

        let auth: Result<Vec<u8>> = absorb(Err(DirectoryError::Authentication("49".into())), "t");
        assert!(auth.is_err());
    }
}
