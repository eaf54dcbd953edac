use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::client::{ClientBackend, Ldap3Connector, LdapConnector};
use crate::directory::{
    ActiveDirectory, AdConfig, GenericLdapDirectory, LdapDirectoryConfig, OpenLdapConfig,
    OpenLdapDirectory, UserDirectory,
};
use crate::error::Result;
use crate::{default_timeout_seconds, Bind, CallOptions, ConnectionConfig};

#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum DirectoryConfig {
    ActiveDirectory(AdConfig),
    Ldap(LdapDirectoryConfig),
    OpenLdap(OpenLdapConfig),
}

impl DirectoryConfig {
    pub fn connection(&self) -> &ConnectionConfig {
        match self {
            DirectoryConfig::ActiveDirectory(config) => &config.connection,
            DirectoryConfig::Ldap(config) => &config.connection,
            DirectoryConfig::OpenLdap(config) => &config.connection,
        }
    }

    pub fn connection_mut(&mut self) -> &mut ConnectionConfig {
        match self {
            DirectoryConfig::ActiveDirectory(config) => &mut config.connection,
            DirectoryConfig::Ldap(config) => &mut config.connection,
            DirectoryConfig::OpenLdap(config) => &mut config.connection,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    #[serde(default)]
    pub backend: ClientBackend,

    /// Named credentials referenced from `domains_to_search`
    #[serde(default)]
    pub credentials: HashMap<String, Bind>,

    pub directory: DirectoryConfig,
}

impl Config {
    pub fn build(&self, cancel: CancellationToken) -> Result<Box<dyn UserDirectory>> {
        self.build_with(Arc::new(Ldap3Connector::new(self.backend)), cancel)
    }

    pub fn build_with(
        &self,
        connector: Arc<dyn LdapConnector>,
        cancel: CancellationToken,
    ) -> Result<Box<dyn UserDirectory>> {
        let options = CallOptions::new(self.timeout_seconds, cancel);

        Ok(match &self.directory {
            DirectoryConfig::ActiveDirectory(config) => Box::new(ActiveDirectory::new(
                config.clone(),
                &self.credentials,
                connector,
                options,
            )?),
            DirectoryConfig::Ldap(config) => Box::new(GenericLdapDirectory::new(
                config.clone(),
                connector,
                options,
            )?),
            DirectoryConfig::OpenLdap(config) => Box::new(OpenLdapDirectory::new(
                config.clone(),
                connector,
                options,
            )?),
        })
    }
}
