use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{
    DirectoryGroup, DirectoryPrincipal, DirectoryUser, Endpoint, EntryMapping,
    MembershipResolver, PrincipalSearchType, UserDirectory,
};
use crate::client::LdapConnector;
use crate::domain::NetbiosMap;
use crate::error::{DirectoryError, Result};
use crate::principal::{PrincipalId, PrincipalKind, ResolvedPrincipal};
use crate::{dn, filter, CallOptions, ConnectionConfig};

fn default_user_filter() -> String {
    "(&(objectClass=inetOrgPerson)(uid=%s))".to_string()
}

fn default_group_filter() -> String {
    "(&(objectClass=groupOfNames)(cn=%s))".to_string()
}

fn default_user_groups_filter() -> String {
    "(&(objectClass=groupOfNames)(member=%s))".to_string()
}

fn default_group_members_filter() -> String {
    "(&(objectClass=inetOrgPerson)(memberOf=%s))".to_string()
}

fn default_user_name_attribute() -> String {
    "uid".to_string()
}

fn default_display_name_attribute() -> String {
    "cn".to_string()
}

fn default_email_attribute() -> String {
    "mail".to_string()
}

fn default_group_name_attribute() -> String {
    "cn".to_string()
}

/// Filters are templates, every `%s` is replaced by an escaped term or DN
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct OpenLdapConfig {
    #[serde(flatten)]
    pub connection: ConnectionConfig,

    /// Domain alias of every principal, the host name when absent
    #[serde(default)]
    pub domain: Option<String>,

    #[serde(default)]
    pub users_base_dn: Option<String>,

    #[serde(default)]
    pub groups_base_dn: Option<String>,

    /// Substituted with a user name or search prefix
    #[serde(default = "default_user_filter")]
    pub user_filter: String,

    /// Substituted with a group name or search prefix
    #[serde(default = "default_group_filter")]
    pub group_filter: String,

    /// Substituted with the DN of a principal to list its groups
    #[serde(default = "default_user_groups_filter")]
    pub user_groups_filter: String,

    /// Substituted with the DN of a group to list its users
    #[serde(default = "default_group_members_filter")]
    pub group_members_filter: String,

    #[serde(default = "default_user_name_attribute")]
    pub user_name_attribute: String,

    #[serde(default = "default_display_name_attribute")]
    pub display_name_attribute: String,

    #[serde(default = "default_email_attribute")]
    pub email_attribute: String,

    #[serde(default = "default_group_name_attribute")]
    pub group_name_attribute: String,

    #[serde(default)]
    pub netbios_map: Vec<String>,
}

impl Default for OpenLdapConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            domain: None,
            users_base_dn: None,
            groups_base_dn: None,
            user_filter: default_user_filter(),
            group_filter: default_group_filter(),
            user_groups_filter: default_user_groups_filter(),
            group_members_filter: default_group_members_filter(),
            user_name_attribute: default_user_name_attribute(),
            display_name_attribute: default_display_name_attribute(),
            email_attribute: default_email_attribute(),
            group_name_attribute: default_group_name_attribute(),
            netbios_map: Vec::new(),
        }
    }
}

/// OpenLDAP style directory. Group membership is read flat, one search per
/// principal, the server is expected to expose nested membership itself.
pub struct OpenLdapDirectory {
    inner: Arc<OpenLdapInner>,
}

struct OpenLdapInner {
    config: OpenLdapConfig,
    endpoint: Endpoint,
    netbios: NetbiosMap,
    users_base_dn: String,
    groups_base_dn: String,
    domain: String,
}

impl OpenLdapDirectory {
    pub fn new(
        config: OpenLdapConfig,
        connector: Arc<dyn LdapConnector>,
        options: CallOptions,
    ) -> Result<Self> {
        let target = config
            .connection
            .target()
            .ok_or_else(|| DirectoryError::Config("openldap directory needs a host".to_string()))?;

        let host_dn = dn::from_domain(&target.host);
        let users_base_dn = config
            .users_base_dn
            .clone()
            .unwrap_or_else(|| host_dn.clone());
        let groups_base_dn = config.groups_base_dn.clone().unwrap_or(host_dn);
        let domain = config
            .domain
            .clone()
            .unwrap_or_else(|| target.host.clone());

        let endpoint = Endpoint {
            connector,
            target,
            credentials: config.connection.bind.clone(),
            options,
        };
        let netbios = NetbiosMap::parse(&config.netbios_map);

        Ok(Self {
            inner: Arc::new(OpenLdapInner {
                config,
                endpoint,
                netbios,
                users_base_dn,
                groups_base_dn,
                domain,
            }),
        })
    }

    fn resolver(&self) -> Arc<dyn MembershipResolver> {
        self.inner.clone()
    }

    async fn search_users(&self, filter: &str) -> Result<Vec<DirectoryUser>> {
        let inner = &self.inner;
        let entries = inner
            .endpoint
            .search(&inner.users_base_dn, filter, &inner.user_attrs())
            .await?;
        Ok(entries
            .iter()
            .filter_map(|entry| inner.user_mapping().user(entry, &inner.domain, self.resolver()))
            .collect())
    }

    async fn search_groups(&self, filter: &str) -> Result<Vec<DirectoryGroup>> {
        let inner = &self.inner;
        let entries = inner
            .endpoint
            .search(&inner.groups_base_dn, filter, &inner.group_attrs())
            .await?;
        Ok(entries
            .iter()
            .filter_map(|entry| inner.group_mapping().group(entry, &inner.domain, self.resolver()))
            .collect())
    }

    fn scoped(&self, kind: PrincipalKind, name: &str) -> Option<PrincipalId> {
        PrincipalId::parse(kind, name).filter(|id| self.inner.in_scope(id))
    }
}

impl OpenLdapInner {
    fn user_mapping(&self) -> EntryMapping<'_> {
        EntryMapping {
            name: &self.config.user_name_attribute,
            display_name: &self.config.display_name_attribute,
            email: &self.config.email_attribute,
        }
    }

    fn group_mapping(&self) -> EntryMapping<'_> {
        EntryMapping {
            name: &self.config.group_name_attribute,
            display_name: &self.config.group_name_attribute,
            email: &self.config.email_attribute,
        }
    }

    fn user_attrs(&self) -> [&str; 3] {
        [
            &self.config.user_name_attribute,
            &self.config.display_name_attribute,
            &self.config.email_attribute,
        ]
    }

    fn group_attrs(&self) -> [&str; 1] {
        [&self.config.group_name_attribute]
    }

    fn in_scope(&self, id: &PrincipalId) -> bool {
        !id.has_domain()
            || self
                .netbios
                .resolve(id.domain_alias())
                .eq_ignore_ascii_case(&self.domain)
    }
}

#[async_trait]
impl MembershipResolver for OpenLdapInner {
    async fn groups_of(&self, principal: &ResolvedPrincipal) -> HashSet<PrincipalId> {
        let filter = filter::substitute(
            &self.config.user_groups_filter,
            &filter::escape(principal.distinguished_name()),
        );

        match self
            .endpoint
            .search(&self.groups_base_dn, &filter, &self.group_attrs())
            .await
        {
            Ok(entries) => entries
                .iter()
                .filter_map(|entry| self.group_mapping().name_of(entry))
                .map(|name| PrincipalId::new(PrincipalKind::Group, name, self.domain.as_str()))
                .collect(),
            Err(error) => {
                tracing::warn!("Resolving groups of {} failed: {error}", principal.id());
                HashSet::new()
            }
        }
    }

    fn group_query(&self, query: PrincipalId) -> PrincipalId {
        self.netbios.canonical(query)
    }
}

#[async_trait]
impl UserDirectory for OpenLdapDirectory {
    async fn find_principals(
        &self,
        search_term: &str,
        search_type: PrincipalSearchType,
    ) -> Result<Vec<DirectoryPrincipal>> {
        let Some(id) = self.scoped(PrincipalKind::User, search_term) else {
            return Ok(Vec::new());
        };

        let config = &self.inner.config;
        let prefix = format!("{}*", filter::escape(id.principal()));
        let mut found = Vec::new();

        if search_type.includes_users() {
            let filter = filter::substitute(&config.user_filter, &prefix);
            found.extend(
                self.search_users(&filter)
                    .await?
                    .into_iter()
                    .map(DirectoryPrincipal::User),
            );
        }

        if search_type.includes_groups() {
            let filter = filter::substitute(&config.group_filter, &prefix);
            found.extend(
                self.search_groups(&filter)
                    .await?
                    .into_iter()
                    .map(DirectoryPrincipal::Group),
            );
        }

        Ok(found)
    }

    async fn try_get_user(&self, name: &str) -> Result<Option<DirectoryUser>> {
        let Some(id) = self.scoped(PrincipalKind::User, name) else {
            return Ok(None);
        };

        let filter = filter::substitute(
            &self.inner.config.user_filter,
            &filter::escape(id.principal()),
        );
        Ok(self
            .search_users(&filter)
            .await?
            .into_iter()
            .next())
    }

    async fn try_get_group(&self, name: &str) -> Result<Option<DirectoryGroup>> {
        let Some(id) = self.scoped(PrincipalKind::Group, name) else {
            return Ok(None);
        };

        let filter = filter::substitute(
            &self.inner.config.group_filter,
            &filter::escape(id.principal()),
        );
        Ok(self
            .search_groups(&filter)
            .await?
            .into_iter()
            .next())
    }

    async fn try_get_and_validate_user(
        &self,
        name: &str,
        password: &str,
    ) -> Result<Option<DirectoryUser>> {
        let Some(user) = self.try_get_user(name).await? else {
            return Ok(None);
        };

        self.inner
            .endpoint
            .validate(user.distinguished_name(), password)
            .await?;
        Ok(Some(user))
    }

    async fn get_group_members(&self, group_name: &str) -> Result<Vec<DirectoryUser>> {
        let Some(group) = self.try_get_group(group_name).await? else {
            return Ok(Vec::new());
        };

        let filter = filter::substitute(
            &self.inner.config.group_members_filter,
            &filter::escape(group.distinguished_name()),
        );
        self.search_users(&filter).await
    }

    fn parse_logon_name(&self, logon: &str) -> Option<PrincipalId> {
        self.inner.netbios.parse_logon(logon)
    }
}
