use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use ldap3::SearchEntry;
use serde::{Deserialize, Serialize};

use super::{
    DirectoryGroup, DirectoryPrincipal, DirectoryUser, Endpoint, EntryMapping,
    MembershipResolver, PrincipalSearchType, UserDirectory,
};
use crate::client::{LdapClient, LdapClientEntry, LdapConnector, SearchScope};
use crate::domain::NetbiosMap;
use crate::error::{absorb, DirectoryError, Result};
use crate::principal::{PrincipalId, PrincipalKind, ResolvedPrincipal};
use crate::{dn, filter, CallOptions, ConnectionConfig};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum GroupSearchType {
    /// Groups listed on the entry itself
    #[default]
    NoRecursion,
    /// Walk parent groups one lookup at a time
    RecursiveSearch,
    /// One query with the in-chain matching rule, AD-compatible servers only
    RecursiveSearchActiveDirectory,
}

fn default_user_filter() -> String {
    "(objectCategory=user)".to_string()
}

fn default_group_filter() -> String {
    "(objectCategory=group)".to_string()
}

fn default_user_name_attribute() -> String {
    "sAMAccountName".to_string()
}

fn default_display_name_attribute() -> String {
    "displayName".to_string()
}

fn default_email_attribute() -> String {
    "mail".to_string()
}

fn default_group_name_attribute() -> String {
    "name".to_string()
}

fn default_member_of_attribute() -> String {
    "memberOf".to_string()
}

fn default_group_member_attribute() -> String {
    "member".to_string()
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LdapDirectoryConfig {
    #[serde(flatten)]
    pub connection: ConnectionConfig,

    /// Derived from the host name when absent
    #[serde(default)]
    pub base_dn: Option<String>,

    /// Domain alias of every principal, derived from the base DN when absent
    #[serde(default)]
    pub domain: Option<String>,

    #[serde(default = "default_user_filter")]
    pub user_filter: String,

    #[serde(default = "default_group_filter")]
    pub group_filter: String,

    #[serde(default = "default_user_name_attribute")]
    pub user_name_attribute: String,

    #[serde(default = "default_display_name_attribute")]
    pub display_name_attribute: String,

    #[serde(default = "default_email_attribute")]
    pub email_attribute: String,

    #[serde(default = "default_group_name_attribute")]
    pub group_name_attribute: String,

    #[serde(default = "default_member_of_attribute")]
    pub member_of_attribute: String,

    #[serde(default = "default_group_member_attribute")]
    pub group_member_attribute: String,

    #[serde(default)]
    pub group_search_type: GroupSearchType,

    #[serde(default)]
    pub netbios_map: Vec<String>,
}

impl Default for LdapDirectoryConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            base_dn: None,
            domain: None,
            user_filter: default_user_filter(),
            group_filter: default_group_filter(),
            user_name_attribute: default_user_name_attribute(),
            display_name_attribute: default_display_name_attribute(),
            email_attribute: default_email_attribute(),
            group_name_attribute: default_group_name_attribute(),
            member_of_attribute: default_member_of_attribute(),
            group_member_attribute: default_group_member_attribute(),
            group_search_type: GroupSearchType::default(),
            netbios_map: Vec::new(),
        }
    }
}

/// Any LDAP v3 server with configurable filters and attribute names
pub struct GenericLdapDirectory {
    inner: Arc<LdapInner>,
}

struct LdapInner {
    config: LdapDirectoryConfig,
    endpoint: Endpoint,
    netbios: NetbiosMap,
    base_dn: String,
    domain: String,
}

impl GenericLdapDirectory {
    pub fn new(
        config: LdapDirectoryConfig,
        connector: Arc<dyn LdapConnector>,
        options: CallOptions,
    ) -> Result<Self> {
        let target = config
            .connection
            .target()
            .ok_or_else(|| DirectoryError::Config("ldap directory needs a host".to_string()))?;

        let base_dn = config
            .base_dn
            .clone()
            .unwrap_or_else(|| dn::from_domain(&target.host));
        let domain = config
            .domain
            .clone()
            .or_else(|| dn::domain_of(&base_dn))
            .unwrap_or_else(|| target.host.clone());

        tracing::debug!("LDAP directory {domain} rooted at {base_dn}");

        let endpoint = Endpoint {
            connector,
            target,
            credentials: config.connection.bind.clone(),
            options,
        };
        let netbios = NetbiosMap::parse(&config.netbios_map);

        Ok(Self {
            inner: Arc::new(LdapInner {
                config,
                endpoint,
                netbios,
                base_dn,
                domain,
            }),
        })
    }

    fn resolver(&self) -> Arc<dyn MembershipResolver> {
        self.inner.clone()
    }

    async fn search_users(&self, filter: &str) -> Result<Vec<DirectoryUser>> {
        let entries = self.inner.search(filter, &self.inner.user_attrs()).await?;
        Ok(entries
            .iter()
            .filter_map(|entry| self.inner.user(entry, self.resolver()))
            .collect())
    }

    async fn search_groups(&self, filter: &str) -> Result<Vec<DirectoryGroup>> {
        let entries = self.inner.search(filter, &self.inner.group_attrs()).await?;
        Ok(entries
            .iter()
            .filter_map(|entry| self.inner.group(entry, self.resolver()))
            .collect())
    }

    /// Members of `group_dn` and, through descent, of every nested group
    async fn nested_members(&self, group_dn: &str) -> Result<Vec<DirectoryUser>> {
        let mut client = self.inner.endpoint.open().await?;
        let result = self.collect_members(&mut *client, group_dn).await;
        client.close().await;
        result
    }

    async fn collect_members(
        &self,
        client: &mut dyn LdapClient,
        group_dn: &str,
    ) -> Result<Vec<DirectoryUser>> {
        let inner = &self.inner;
        let config = &inner.config;

        let mut seen_groups = HashSet::from([group_dn.to_ascii_lowercase()]);
        let mut seen_users = HashSet::new();
        let mut pending = vec![group_dn.to_string()];
        let mut members = Vec::new();

        while let Some(current) = pending.pop() {
            let users = inner
                .search_with(
                    client,
                    &filter::and([
                        config.user_filter.clone(),
                        filter::equals(&config.member_of_attribute, &current),
                    ]),
                    &inner.user_attrs(),
                )
                .await?;
            for entry in &users {
                if seen_users.insert(entry.dn().to_ascii_lowercase()) {
                    members.extend(inner.user(entry, self.resolver()));
                }
            }

            let groups = inner
                .search_with(
                    client,
                    &filter::and([
                        config.group_filter.clone(),
                        filter::equals(&config.member_of_attribute, &current),
                    ]),
                    &[config.group_name_attribute.as_str()],
                )
                .await?;
            for entry in &groups {
                if seen_groups.insert(entry.dn().to_ascii_lowercase()) {
                    pending.push(entry.dn().to_string());
                }
            }
        }

        Ok(members)
    }
}

impl LdapInner {
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
            display_name: &self.config.display_name_attribute,
            email: &self.config.email_attribute,
        }
    }

    fn user_attrs(&self) -> [&str; 4] {
        [
            &self.config.user_name_attribute,
            &self.config.display_name_attribute,
            &self.config.email_attribute,
            &self.config.member_of_attribute,
        ]
    }

    fn group_attrs(&self) -> [&str; 3] {
        [
            &self.config.group_name_attribute,
            &self.config.display_name_attribute,
            &self.config.member_of_attribute,
        ]
    }

    /// Whether `id` names this directory, either unscoped or through its domain or a NETBIOS alias
    fn in_scope(&self, id: &PrincipalId) -> bool {
        !id.has_domain()
            || self
                .netbios
                .resolve(id.domain_alias())
                .eq_ignore_ascii_case(&self.domain)
    }

    /// Groups listed on the entry itself, final when there is no recursion
    fn listed_on(&self, entry: &SearchEntry) -> Option<HashSet<PrincipalId>> {
        (self.config.group_search_type == GroupSearchType::NoRecursion).then(|| {
            entry
                .group_names(&self.config.member_of_attribute)
                .into_iter()
                .map(|name| self.group_id(name))
                .collect()
        })
    }

    fn user(
        &self,
        entry: &SearchEntry,
        resolver: Arc<dyn MembershipResolver>,
    ) -> Option<DirectoryUser> {
        let user = self.user_mapping().user(entry, &self.domain, resolver)?;
        Some(match self.listed_on(entry) {
            Some(groups) => user.with_groups(groups),
            None => user,
        })
    }

    fn group(
        &self,
        entry: &SearchEntry,
        resolver: Arc<dyn MembershipResolver>,
    ) -> Option<DirectoryGroup> {
        let group = self.group_mapping().group(entry, &self.domain, resolver)?;
        Some(match self.listed_on(entry) {
            Some(groups) => group.with_groups(groups),
            None => group,
        })
    }

    async fn search(&self, filter: &str, attrs: &[&str]) -> Result<Vec<SearchEntry>> {
        self.endpoint.search(&self.base_dn, filter, attrs).await
    }

    async fn search_with(
        &self,
        client: &mut dyn LdapClient,
        filter: &str,
        attrs: &[&str],
    ) -> Result<Vec<SearchEntry>> {
        let result = client
            .search_attrs(&self.base_dn, filter, SearchScope::Subtree, attrs)
            .await;
        absorb(result, &format!("Searching {filter}"))
    }

    fn group_id(&self, name: String) -> PrincipalId {
        PrincipalId::new(PrincipalKind::Group, name, self.domain.as_str())
    }

    /// Group names listed on the entry at `entry_dn`
    async fn listed_groups(
        &self,
        client: &mut dyn LdapClient,
        entry_dn: &str,
    ) -> Result<Vec<String>> {
        let entries = client
            .search_attrs(
                entry_dn,
                "(objectClass=*)",
                SearchScope::Base,
                &[self.config.member_of_attribute.as_str()],
            )
            .await?;
        Ok(entries
            .first()
            .map(|entry| entry.group_names(&self.config.member_of_attribute))
            .unwrap_or_default())
    }

    async fn direct_groups(&self, entry_dn: &str) -> Result<HashSet<PrincipalId>> {
        let mut client = self.endpoint.open().await?;
        let names = self.listed_groups(&mut *client, entry_dn).await;
        client.close().await;

        Ok(names?.into_iter().map(|name| self.group_id(name)).collect())
    }

    async fn walked_groups(&self, entry_dn: &str) -> Result<HashSet<PrincipalId>> {
        let mut client = self.endpoint.open().await?;
        let result = self.walk_groups(&mut *client, entry_dn).await;
        client.close().await;
        result
    }

    /// Each group is looked up by name once, so cycles end. A failed lookup
    /// only ends its own branch.
    async fn walk_groups(
        &self,
        client: &mut dyn LdapClient,
        entry_dn: &str,
    ) -> Result<HashSet<PrincipalId>> {
        let mut found = HashSet::new();
        let mut pending = self.listed_groups(client, entry_dn).await?;

        while let Some(name) = pending.pop() {
            if !found.insert(self.group_id(name.clone())) {
                continue;
            }

            let lookup = filter::and([
                self.config.group_filter.clone(),
                filter::equals(&self.config.group_name_attribute, &name),
            ]);
            match client
                .search_attrs(
                    &self.base_dn,
                    &lookup,
                    SearchScope::Subtree,
                    &[self.config.member_of_attribute.as_str()],
                )
                .await
            {
                Ok(entries) => {
                    if let Some(entry) = entries.first() {
                        pending.extend(entry.group_names(&self.config.member_of_attribute));
                    }
                }
                Err(error) => tracing::warn!("Resolving parent groups of {name} failed: {error}"),
            }
        }

        Ok(found)
    }

    async fn chained_groups(&self, entry_dn: &str) -> Result<HashSet<PrincipalId>> {
        let filter = filter::and([
            self.config.group_filter.clone(),
            filter::in_chain(&self.config.group_member_attribute, entry_dn),
        ]);
        let entries = self
            .search(&filter, &[self.config.group_name_attribute.as_str()])
            .await?;

        Ok(entries
            .iter()
            .filter_map(|entry| self.group_mapping().name_of(entry))
            .map(|name| self.group_id(name))
            .collect())
    }
}

#[async_trait]
impl MembershipResolver for LdapInner {
    async fn groups_of(&self, principal: &ResolvedPrincipal) -> HashSet<PrincipalId> {
        let entry_dn = principal.distinguished_name();
        let result = match self.config.group_search_type {
            GroupSearchType::NoRecursion => self.direct_groups(entry_dn).await,
            GroupSearchType::RecursiveSearch => self.walked_groups(entry_dn).await,
            GroupSearchType::RecursiveSearchActiveDirectory => self.chained_groups(entry_dn).await,
        };

        result.unwrap_or_else(|error| {
            tracing::warn!("Resolving groups of {} failed: {error}", principal.id());
            HashSet::new()
        })
    }

    fn group_query(&self, query: PrincipalId) -> PrincipalId {
        self.netbios.canonical(query)
    }
}

#[async_trait]
impl UserDirectory for GenericLdapDirectory {
    async fn find_principals(
        &self,
        search_term: &str,
        search_type: PrincipalSearchType,
    ) -> Result<Vec<DirectoryPrincipal>> {
        let Some(id) = PrincipalId::user(search_term) else {
            return Ok(Vec::new());
        };
        if !self.inner.in_scope(&id) {
            return Ok(Vec::new());
        }

        let config = &self.inner.config;
        let term = id.principal();
        let mut found = Vec::new();

        if search_type.includes_users() {
            let filter = filter::and([
                config.user_filter.clone(),
                filter::or([
                    filter::starts_with(&config.user_name_attribute, term),
                    filter::starts_with(&config.display_name_attribute, term),
                ]),
            ]);
            found.extend(
                self.search_users(&filter)
                    .await?
                    .into_iter()
                    .map(DirectoryPrincipal::User),
            );
        }

        if search_type.includes_groups() {
            let filter = filter::and([
                config.group_filter.clone(),
                filter::starts_with(&config.group_name_attribute, term),
            ]);
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
        let Some(id) = PrincipalId::user(name) else {
            return Ok(None);
        };
        if !self.inner.in_scope(&id) {
            return Ok(None);
        }

        let config = &self.inner.config;
        let filter = filter::and([
            config.user_filter.clone(),
            filter::equals(&config.user_name_attribute, id.principal()),
        ]);
        Ok(self
            .search_users(&filter)
            .await?
            .into_iter()
            .next())
    }

    async fn try_get_group(&self, name: &str) -> Result<Option<DirectoryGroup>> {
        let Some(id) = PrincipalId::group(name) else {
            return Ok(None);
        };
        if !self.inner.in_scope(&id) {
            return Ok(None);
        }

        let config = &self.inner.config;
        let filter = filter::and([
            config.group_filter.clone(),
            filter::equals(&config.group_name_attribute, id.principal()),
        ]);
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

        let config = &self.inner.config;
        let group_dn = group.distinguished_name();
        let member_filter = match config.group_search_type {
            GroupSearchType::NoRecursion => filter::equals(&config.member_of_attribute, group_dn),
            GroupSearchType::RecursiveSearchActiveDirectory => {
                filter::in_chain(&config.member_of_attribute, group_dn)
            }
            GroupSearchType::RecursiveSearch => return self.nested_members(group_dn).await,
        };

        let filter = filter::and([config.user_filter.clone(), member_filter]);
        self.search_users(&filter).await
    }

    fn parse_logon_name(&self, logon: &str) -> Option<PrincipalId> {
        self.inner.netbios.parse_logon(logon)
    }
}
