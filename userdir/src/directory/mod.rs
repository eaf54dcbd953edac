//! The user directory capability set and the principal objects it returns.

mod active_directory;
mod ldap;
mod openldap;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ldap3::SearchEntry;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

pub use active_directory::{ActiveDirectory, AdConfig, DomainSearchMode};
pub use ldap::{GenericLdapDirectory, GroupSearchType, LdapDirectoryConfig};
pub use openldap::{OpenLdapConfig, OpenLdapDirectory};

use crate::client::{self, LdapClient, LdapClientEntry, LdapConnector, SearchScope};
use crate::error::{absorb, DirectoryError, Result};
use crate::principal::{PrincipalId, PrincipalKind, ResolvedPrincipal};
use crate::{dn, Bind, CallOptions, LdapTarget};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PrincipalSearchType {
    Users,
    Groups,
    #[default]
    UsersAndGroups,
}

impl PrincipalSearchType {
    pub fn includes_users(&self) -> bool {
        !matches!(self, PrincipalSearchType::Groups)
    }

    pub fn includes_groups(&self) -> bool {
        !matches!(self, PrincipalSearchType::Users)
    }
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Users and/or groups whose names start with `search_term`
    async fn find_principals(
        &self,
        search_term: &str,
        search_type: PrincipalSearchType,
    ) -> Result<Vec<DirectoryPrincipal>>;

    async fn try_get_user(&self, name: &str) -> Result<Option<DirectoryUser>>;

    async fn try_get_group(&self, name: &str) -> Result<Option<DirectoryGroup>>;

    /// `Ok(None)` when the user does not exist, an
    /// [`DirectoryError::Authentication`] error when the password is wrong
    async fn try_get_and_validate_user(
        &self,
        name: &str,
        password: &str,
    ) -> Result<Option<DirectoryUser>>;

    async fn get_group_members(&self, group_name: &str) -> Result<Vec<DirectoryUser>>;

    /// `DOMAIN\user`, `user@domain` or `user`
    fn parse_logon_name(&self, logon: &str) -> Option<PrincipalId>;
}

/// Computes the group set of a principal. Failures are logged and reduce the
/// result, they never surface to the caller.
#[async_trait]
pub(crate) trait MembershipResolver: Send + Sync {
    async fn groups_of(&self, principal: &ResolvedPrincipal) -> HashSet<PrincipalId>;

    /// Bring a group name asked about into the form `groups_of` produces
    fn group_query(&self, query: PrincipalId) -> PrincipalId {
        query
    }
}

/// Group set computed on first use, then fixed for the principal's lifetime
struct GroupCache {
    resolver: Arc<dyn MembershipResolver>,
    groups: OnceCell<HashSet<PrincipalId>>,
    confirmed: Mutex<HashSet<PrincipalId>>,
}

impl GroupCache {
    fn new(resolver: Arc<dyn MembershipResolver>) -> Self {
        Self {
            resolver,
            groups: OnceCell::new(),
            confirmed: Mutex::new(HashSet::new()),
        }
    }

    /// Group set already known from the principal's own entry
    fn preloaded(resolver: Arc<dyn MembershipResolver>, groups: HashSet<PrincipalId>) -> Self {
        Self {
            resolver,
            groups: OnceCell::new_with(Some(groups)),
            confirmed: Mutex::new(HashSet::new()),
        }
    }

    async fn groups(&self, principal: &ResolvedPrincipal) -> &HashSet<PrincipalId> {
        self.groups
            .get_or_init(|| async {
                let groups = self.resolver.groups_of(principal).await;
                tracing::debug!("{} is a member of {} groups", principal.id(), groups.len());
                groups
            })
            .await
    }

    async fn is_member(&self, principal: &ResolvedPrincipal, group_name: &str) -> bool {
        let Some(query) = PrincipalId::group(group_name) else {
            return false;
        };
        let query = self.resolver.group_query(query);

        if self.confirmed_contains(&query) {
            return true;
        }

        let found = self
            .groups(principal)
            .await
            .iter()
            .any(|group| group.matches(&query));

        if found {
            if let Ok(mut confirmed) = self.confirmed.lock() {
                confirmed.insert(query);
            }
        }
        found
    }

    fn confirmed_contains(&self, query: &PrincipalId) -> bool {
        self.confirmed
            .lock()
            .map(|confirmed| confirmed.contains(query))
            .unwrap_or(false)
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct PrincipalSummary {
    pub kind: PrincipalKind,
    pub name: String,
    pub display_name: String,
    pub email: Option<String>,
    pub distinguished_name: String,
}

pub struct DirectoryUser {
    principal: ResolvedPrincipal,
    display_name: String,
    email: Option<String>,
    cache: GroupCache,
}

impl DirectoryUser {
    pub(crate) fn new(
        principal: ResolvedPrincipal,
        display_name: String,
        email: Option<String>,
        resolver: Arc<dyn MembershipResolver>,
    ) -> Self {
        Self {
            principal,
            display_name,
            email,
            cache: GroupCache::new(resolver),
        }
    }

    pub(crate) fn with_groups(self, groups: HashSet<PrincipalId>) -> Self {
        Self {
            cache: GroupCache::preloaded(self.cache.resolver.clone(), groups),
            ..self
        }
    }

    /// Fully qualified `name@domain`
    pub fn name(&self) -> String {
        self.principal.full_name()
    }

    pub fn id(&self) -> &PrincipalId {
        self.principal.id()
    }

    pub fn principal(&self) -> &ResolvedPrincipal {
        &self.principal
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn email_address(&self) -> Option<&str> {
        self.email.as_deref()
    }

    pub fn distinguished_name(&self) -> &str {
        self.principal.distinguished_name()
    }

    pub async fn groups(&self) -> &HashSet<PrincipalId> {
        self.cache.groups(&self.principal).await
    }

    pub async fn is_member_of_group(&self, group_name: &str) -> bool {
        self.cache.is_member(&self.principal, group_name).await
    }

    pub fn summary(&self) -> PrincipalSummary {
        PrincipalSummary {
            kind: PrincipalKind::User,
            name: self.name(),
            display_name: self.display_name.clone(),
            email: self.email.clone(),
            distinguished_name: self.distinguished_name().to_string(),
        }
    }
}

impl std::fmt::Debug for DirectoryUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryUser")
            .field("principal", &self.principal)
            .field("display_name", &self.display_name)
            .field("email", &self.email)
            .finish()
    }
}

pub struct DirectoryGroup {
    principal: ResolvedPrincipal,
    display_name: String,
    cache: GroupCache,
}

impl DirectoryGroup {
    pub(crate) fn new(
        principal: ResolvedPrincipal,
        display_name: String,
        resolver: Arc<dyn MembershipResolver>,
    ) -> Self {
        Self {
            principal,
            display_name,
            cache: GroupCache::new(resolver),
        }
    }

    pub(crate) fn with_groups(self, groups: HashSet<PrincipalId>) -> Self {
        Self {
            cache: GroupCache::preloaded(self.cache.resolver.clone(), groups),
            ..self
        }
    }

    pub fn name(&self) -> String {
        self.principal.full_name()
    }

    pub fn id(&self) -> &PrincipalId {
        self.principal.id()
    }

    pub fn principal(&self) -> &ResolvedPrincipal {
        &self.principal
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn distinguished_name(&self) -> &str {
        self.principal.distinguished_name()
    }

    /// Groups this group is itself a member of
    pub async fn groups(&self) -> &HashSet<PrincipalId> {
        self.cache.groups(&self.principal).await
    }

    pub async fn is_member_of_group(&self, group_name: &str) -> bool {
        self.cache.is_member(&self.principal, group_name).await
    }

    pub fn summary(&self) -> PrincipalSummary {
        PrincipalSummary {
            kind: PrincipalKind::Group,
            name: self.name(),
            display_name: self.display_name.clone(),
            email: None,
            distinguished_name: self.distinguished_name().to_string(),
        }
    }
}

impl std::fmt::Debug for DirectoryGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryGroup")
            .field("principal", &self.principal)
            .field("display_name", &self.display_name)
            .finish()
    }
}

#[derive(Debug)]
pub enum DirectoryPrincipal {
    User(DirectoryUser),
    Group(DirectoryGroup),
}

impl DirectoryPrincipal {
    pub fn name(&self) -> String {
        match self {
            DirectoryPrincipal::User(user) => user.name(),
            DirectoryPrincipal::Group(group) => group.name(),
        }
    }

    pub fn summary(&self) -> PrincipalSummary {
        match self {
            DirectoryPrincipal::User(user) => user.summary(),
            DirectoryPrincipal::Group(group) => group.summary(),
        }
    }

    pub fn into_user(self) -> Option<DirectoryUser> {
        match self {
            DirectoryPrincipal::User(user) => Some(user),
            DirectoryPrincipal::Group(_) => None,
        }
    }

    pub fn into_group(self) -> Option<DirectoryGroup> {
        match self {
            DirectoryPrincipal::Group(group) => Some(group),
            DirectoryPrincipal::User(_) => None,
        }
    }
}

/// Attribute names used to turn an entry into a principal
#[derive(Debug, Clone, Copy)]
pub(crate) struct EntryMapping<'a> {
    pub name: &'a str,
    pub display_name: &'a str,
    pub email: &'a str,
}

impl EntryMapping<'_> {
    /// Name attribute, falling back to the entry's own CN
    pub fn name_of(&self, entry: &SearchEntry) -> Option<String> {
        entry
            .attr(self.name)
            .map(str::to_string)
            .or_else(|| dn::common_name(entry.dn()))
    }

    pub fn user(
        &self,
        entry: &SearchEntry,
        domain_alias: &str,
        resolver: Arc<dyn MembershipResolver>,
    ) -> Option<DirectoryUser> {
        let Some(name) = self.name_of(entry) else {
            tracing::debug!("Skipping {}: no {} attribute", entry.dn(), self.name);
            return None;
        };
        let display_name = entry
            .attr(self.display_name)
            .map(str::to_string)
            .unwrap_or_else(|| name.clone());
        let email = entry.attr(self.email).map(str::to_string);
        let principal =
            PrincipalId::new(PrincipalKind::User, name, domain_alias).resolve(entry.dn());

        Some(DirectoryUser::new(principal, display_name, email, resolver))
    }

    pub fn group(
        &self,
        entry: &SearchEntry,
        domain_alias: &str,
        resolver: Arc<dyn MembershipResolver>,
    ) -> Option<DirectoryGroup> {
        let Some(name) = self.name_of(entry) else {
            tracing::debug!("Skipping {}: no {} attribute", entry.dn(), self.name);
            return None;
        };
        let display_name = entry
            .attr(self.display_name)
            .map(str::to_string)
            .unwrap_or_else(|| name.clone());
        let principal =
            PrincipalId::new(PrincipalKind::Group, name, domain_alias).resolve(entry.dn());

        Some(DirectoryGroup::new(principal, display_name, resolver))
    }
}

/// Bind as `dn` on a fresh connection. Rejection is an authentication error
pub(crate) async fn validate_password(
    connector: &dyn LdapConnector,
    target: &LdapTarget,
    dn: &str,
    password: &str,
    options: &CallOptions,
) -> Result<()> {
    if password.is_empty() {
        return Err(DirectoryError::Authentication(format!(
            "{dn}: empty password"
        )));
    }

    let mut client = connector.connect(target, options).await?;
    let result = client.bind(dn, password).await;
    client.close().await;

    match &result {
        Ok(()) => tracing::debug!("Validated credentials of {dn}"),
        Err(error) => tracing::debug!("Credential validation of {dn} failed: {error}"),
    }
    result
}

/// A single directory server reached with fixed service credentials
pub(crate) struct Endpoint {
    pub connector: Arc<dyn LdapConnector>,
    pub target: LdapTarget,
    pub credentials: Option<Bind>,
    pub options: CallOptions,
}

impl Endpoint {
    pub async fn open(&self) -> Result<Box<dyn LdapClient>> {
        client::open(
            &*self.connector,
            &self.target,
            self.credentials.as_ref(),
            &self.options,
        )
        .await
    }

    /// One subtree search on a fresh connection
    pub async fn search(
        &self,
        base: &str,
        filter: &str,
        attrs: &[&str],
    ) -> Result<Vec<SearchEntry>> {
        if filter.is_empty() {
            return Ok(Vec::new());
        }

        let mut client = self.open().await?;
        let result = client
            .search_attrs(base, filter, SearchScope::Subtree, attrs)
            .await;
        client.close().await;

        absorb(result, &format!("Searching {base} on {}", self.target.host))
    }

    pub async fn validate(&self, dn: &str, password: &str) -> Result<()> {
        validate_password(&*self.connector, &self.target, dn, password, &self.options).await
    }
}
