use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use ldap3::SearchEntry;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use super::{
    validate_password, DirectoryGroup, DirectoryPrincipal, DirectoryUser, EntryMapping,
    MembershipResolver, PrincipalSearchType, UserDirectory,
};
use crate::client::{self, LdapClient, LdapClientEntry, LdapConnector, SearchScope};
use crate::domain::{CredentialedDomain, DomainSet, NetbiosMap};
use crate::error::{absorb, DirectoryError, Result};
use crate::principal::{PrincipalId, PrincipalKind, ResolvedPrincipal};
use crate::{dn, filter, Bind, CallOptions, ConnectionConfig, LdapTarget};

const SAM_ACCOUNT_NAME: &str = "sAMAccountName";
const USER_PRINCIPAL_NAME: &str = "userPrincipalName";
const NAME: &str = "name";
const DISPLAY_NAME: &str = "displayName";
const MAIL: &str = "mail";
const MEMBER_OF: &str = "memberOf";
const OBJECT_CLASS: &str = "objectClass";

const DEFAULT_NAMING_CONTEXT: &str = "defaultNamingContext";
const ROOT_DOMAIN_NAMING_CONTEXT: &str = "rootDomainNamingContext";
const TRUST_PARTNER: &str = "trustPartner";
const TRUST_DIRECTION: &str = "trustDirection";
const TRUST_DIRECTION_OUTBOUND: u32 = 2;

const USER_CATEGORY: &str = "(objectCategory=user)";
const GROUP_CATEGORY: &str = "(objectCategory=group)";
const ANY_OBJECT: &str = "(objectClass=*)";

const PRINCIPAL_ATTRS: &[&str] = &[
    SAM_ACCOUNT_NAME,
    USER_PRINCIPAL_NAME,
    NAME,
    DISPLAY_NAME,
    MAIL,
    OBJECT_CLASS,
];

const MAPPING: EntryMapping<'static> = EntryMapping {
    name: SAM_ACCOUNT_NAME,
    display_name: DISPLAY_NAME,
    email: MAIL,
};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DomainSearchMode {
    #[default]
    CurrentDomain,
    /// Current domain plus every domain and forest trust that is not outbound-only
    TrustedDomains,
    /// Only the domains listed in `domains_to_search`
    SpecificDomains,
}

fn default_true() -> bool {
    true
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AdConfig {
    #[serde(flatten)]
    pub connection: ConnectionConfig,

    /// DNS name of the joined domain. Detected from the RootDSE of `host` when absent
    #[serde(default)]
    pub domain: Option<String>,

    #[serde(default)]
    pub search_mode: DomainSearchMode,

    /// `domain[,credentialName]` lines
    #[serde(default)]
    pub domains_to_search: Vec<String>,

    /// `NETBIOS=dns.domain` lines
    #[serde(default)]
    pub netbios_map: Vec<String>,

    #[serde(default = "default_true")]
    pub recursive_groups: bool,
}

impl Default for AdConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            domain: None,
            search_mode: DomainSearchMode::default(),
            domains_to_search: Vec::new(),
            netbios_map: Vec::new(),
            recursive_groups: true,
        }
    }
}

/// Active Directory, possibly spanning several trusted domains
pub struct ActiveDirectory {
    inner: Arc<AdInner>,
}

struct AdInner {
    config: AdConfig,
    connector: Arc<dyn LdapConnector>,
    netbios: NetbiosMap,
    specific_domains: DomainSet,
    detected_domain: OnceCell<String>,
    options: CallOptions,
}

type Sessions = HashMap<String, Box<dyn LdapClient>>;

impl ActiveDirectory {
    pub fn new(
        config: AdConfig,
        credentials: &HashMap<String, Bind>,
        connector: Arc<dyn LdapConnector>,
        options: CallOptions,
    ) -> Result<Self> {
        if config.search_mode != DomainSearchMode::SpecificDomains
            && config.domain.is_none()
            && config.connection.host.is_none()
        {
            return Err(DirectoryError::Config(
                "active directory needs a domain or a host".to_string(),
            ));
        }

        let specific_domains = config
            .domains_to_search
            .iter()
            .filter_map(|line| CredentialedDomain::parse(line, credentials))
            .collect::<DomainSet>();

        if config.search_mode == DomainSearchMode::SpecificDomains && specific_domains.is_empty() {
            return Err(DirectoryError::Config(
                "specific-domains search mode needs domains_to_search".to_string(),
            ));
        }

        let netbios = NetbiosMap::parse(&config.netbios_map);

        Ok(Self {
            inner: Arc::new(AdInner {
                config,
                connector,
                netbios,
                specific_domains,
                detected_domain: OnceCell::new(),
                options,
            }),
        })
    }

    fn resolver(&self) -> Arc<dyn MembershipResolver> {
        self.inner.clone()
    }

    fn principal_from_entry(&self, entry: &SearchEntry, alias: &str) -> Option<DirectoryPrincipal> {
        if entry.has_value(OBJECT_CLASS, "group") {
            MAPPING
                .group(entry, alias, self.resolver())
                .map(DirectoryPrincipal::Group)
        } else {
            MAPPING
                .user(entry, alias, self.resolver())
                .map(DirectoryPrincipal::User)
        }
    }

    /// First domain (in domain-set order) holding `name` wins
    async fn try_get_principal(
        &self,
        name: &str,
        kind: PrincipalKind,
    ) -> Result<Option<DirectoryPrincipal>> {
        let Some(id) = PrincipalId::parse(kind, name) else {
            return Ok(None);
        };

        let filter = get_filter(id.principal(), kind);
        for domain in self.inner.domains_for(&id).await?.iter() {
            let entries = self.inner.search_domain(domain, &filter).await?;
            if let Some(found) = entries
                .iter()
                .find_map(|entry| self.principal_from_entry(entry, domain.name()))
            {
                return Ok(Some(found));
            }
        }

        tracing::debug!("{id} not found");
        Ok(None)
    }
}


fn category_filter(search_type: PrincipalSearchType) -> String {
    let mut categories = Vec::new();
    if search_type.includes_users() {
        categories.push(USER_CATEGORY);
    }
    if search_type.includes_groups() {
        categories.push(GROUP_CATEGORY);
    }
    filter::or(categories)
}

fn search_filter(term: &str, search_type: PrincipalSearchType) -> String {
    filter::and([
        category_filter(search_type),
        filter::or([
            filter::starts_with(USER_PRINCIPAL_NAME, term),
            filter::starts_with(SAM_ACCOUNT_NAME, term),
            filter::starts_with(NAME, term),
            filter::starts_with(DISPLAY_NAME, term),
        ]),
    ])
}

fn get_filter(name: &str, kind: PrincipalKind) -> String {
    match kind {
        PrincipalKind::User => filter::and([
            USER_CATEGORY.to_string(),
            filter::equals(SAM_ACCOUNT_NAME, name),
        ]),
        PrincipalKind::Group => filter::and([
            GROUP_CATEGORY.to_string(),
            filter::or([
                filter::equals(SAM_ACCOUNT_NAME, name),
                filter::equals(NAME, name),
            ]),
        ]),
    }
}

impl AdInner {
    /// Configured or detected DNS name of the joined domain
    async fn current_domain(&self) -> Result<String> {
        if let Some(domain) = &self.config.domain {
            return Ok(domain.clone());
        }

        self.detected_domain
            .get_or_try_init(|| async {
                let target = self.config.connection.target().ok_or_else(|| {
                    DirectoryError::Config("no host to detect the domain from".to_string())
                })?;
                let context = self
                    .root_dse_value(&target, DEFAULT_NAMING_CONTEXT)
                    .await?
                    .ok_or_else(|| {
                        DirectoryError::Config(format!(
                            "{} does not publish {DEFAULT_NAMING_CONTEXT}",
                            target.host
                        ))
                    })?;
                let domain = dn::domain_of(&context).ok_or_else(|| {
                    DirectoryError::Config(format!("{context} is not a domain naming context"))
                })?;
                tracing::info!("Detected current domain {domain}");
                Ok::<_, DirectoryError>(domain)
            })
            .await
            .cloned()
    }

    async fn root_dse_value(&self, target: &LdapTarget, attr: &str) -> Result<Option<String>> {
        let mut client = client::open(
            &*self.connector,
            target,
            self.config.connection.bind.as_ref(),
            &self.options,
        )
        .await?;
        let result = client
            .search_attrs("", ANY_OBJECT, SearchScope::Base, &[attr])
            .await;
        client.close().await;

        let context = format!("Reading {attr} from the RootDSE of {}", target.host);
        Ok(absorb(result, &context)?
            .first()
            .and_then(|entry| entry.attr(attr))
            .map(str::to_string))
    }

    /// The configured host serves the current domain, other domains are
    /// reached through their DNS name
    async fn target_for(&self, domain: &str) -> Result<LdapTarget> {
        if let Some(host) = &self.config.connection.host {
            if self.current_domain().await?.eq_ignore_ascii_case(domain) {
                return Ok(self.config.connection.target_for(host));
            }
        }
        Ok(self.config.connection.target_for(domain))
    }

    fn credentials_for<'a>(&'a self, domain: &'a CredentialedDomain) -> Option<&'a Bind> {
        domain
            .credentials()
            .or_else(|| {
                self.specific_domains
                    .get(domain.name())
                    .and_then(CredentialedDomain::credentials)
            })
            .or(self.config.connection.bind.as_ref())
    }

    async fn open_domain(&self, domain: &CredentialedDomain) -> Result<Box<dyn LdapClient>> {
        let target = self.target_for(domain.name()).await?;
        client::open(
            &*self.connector,
            &target,
            self.credentials_for(domain),
            &self.options,
        )
        .await
    }

    async fn domains_for(&self, id: &PrincipalId) -> Result<DomainSet> {
        if !id.has_domain() {
            return self.domains_to_search().await;
        }

        let name = self.netbios.resolve(id.domain_alias());
        let domain = self
            .specific_domains
            .get(name)
            .cloned()
            .unwrap_or_else(|| CredentialedDomain::new(name, None));
        Ok([domain].into_iter().collect())
    }

    async fn domains_to_search(&self) -> Result<DomainSet> {
        if self.config.search_mode == DomainSearchMode::SpecificDomains {
            return Ok(self.specific_domains.clone());
        }

        let current = self.current_domain().await?;
        let mut domains = DomainSet::default();
        domains.insert(CredentialedDomain::new(current.as_str(), None));

        if self.config.search_mode == DomainSearchMode::TrustedDomains {
            self.add_trusted_domains(&current, &mut domains).await;
        }

        tracing::info!(
            "Searching {} domains: {}",
            domains.len(),
            domains
                .iter()
                .map(CredentialedDomain::name)
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(domains)
    }

    /// Failures only narrow the domain set
    async fn add_trusted_domains(&self, current: &str, domains: &mut DomainSet) {
        match self.trusts_of(current).await {
            Ok(trusts) => {
                for trust in trusts {
                    domains.insert(CredentialedDomain::new(trust, None));
                }
            }
            Err(error) => {
                tracing::warn!("Enumerating trusts of {current} failed: {error}");
                return;
            }
        }

        let root = match self.forest_root(current).await {
            Ok(root) => root,
            Err(error) => {
                tracing::warn!("Locating the forest root of {current} failed: {error}");
                return;
            }
        };

        if let Some(root) = root.filter(|root| !root.eq_ignore_ascii_case(current)) {
            match self.trusts_of(&root).await {
                Ok(trusts) => {
                    for trust in trusts {
                        domains.insert(CredentialedDomain::new(trust, None));
                    }
                }
                Err(error) => tracing::warn!("Enumerating forest trusts of {root} failed: {error}"),
            }
        }
    }

    /// Trust partners of `domain`, leaving out outbound-only trusts
    async fn trusts_of(&self, domain: &str) -> Result<Vec<String>> {
        let mut client = self
            .open_domain(&CredentialedDomain::new(domain, None))
            .await?;
        let base = format!("CN=System,{}", dn::from_domain(domain));
        let result = client
            .search_attrs(
                &base,
                "(objectClass=trustedDomain)",
                SearchScope::OneLevel,
                &[TRUST_PARTNER, TRUST_DIRECTION],
            )
            .await;
        client.close().await;

        Ok(result?
            .iter()
            .filter(|entry| {
                let direction = entry
                    .attr(TRUST_DIRECTION)
                    .and_then(|value| value.parse::<u32>().ok())
                    .unwrap_or_default();
                direction != TRUST_DIRECTION_OUTBOUND
            })
            .filter_map(|entry| {
                entry
                    .attr(TRUST_PARTNER)
                    .map(str::to_string)
                    .or_else(|| dn::common_name(entry.dn()))
            })
            .collect())
    }

    async fn forest_root(&self, current: &str) -> Result<Option<String>> {
        let target = self.target_for(current).await?;
        Ok(self
            .root_dse_value(&target, ROOT_DOMAIN_NAMING_CONTEXT)
            .await?
            .and_then(|context| dn::domain_of(&context)))
    }

    /// Connection failures propagate, a refused search counts as no hits
    async fn search_domain(
        &self,
        domain: &CredentialedDomain,
        filter: &str,
    ) -> Result<Vec<SearchEntry>> {
        let mut client = self.open_domain(domain).await?;
        let result = client
            .search_attrs(
                &dn::from_domain(domain.name()),
                filter,
                SearchScope::Subtree,
                PRINCIPAL_ATTRS,
            )
            .await;
        client.close().await;

        absorb(result, &format!("Searching {}", domain.name()))
    }

    async fn session<'a>(
        &self,
        sessions: &'a mut Sessions,
        domain: &str,
    ) -> Result<&'a mut Box<dyn LdapClient>> {
        let key = domain.to_ascii_lowercase();
        if !sessions.contains_key(&key) {
            let client = self.open_domain(&CredentialedDomain::new(domain, None)).await?;
            sessions.insert(key.clone(), client);
        }
        sessions
            .get_mut(&key)
            .ok_or_else(|| DirectoryError::Connection(format!("no session for {domain}")))
    }

    /// DNs in the `memberOf` attribute of the entry at `entry_dn`
    async fn member_of(&self, sessions: &mut Sessions, entry_dn: &str) -> Result<Vec<String>> {
        let domain = dn::domain_of(entry_dn)
            .ok_or_else(|| DirectoryError::Search(format!("{entry_dn} has no domain component")))?;
        let client = self.session(sessions, &domain).await?;
        let entries = client
            .search_attrs(entry_dn, ANY_OBJECT, SearchScope::Base, &[MEMBER_OF])
            .await?;

        Ok(entries
            .first()
            .map(|entry| entry.group_dns(MEMBER_OF))
            .unwrap_or_default())
    }

    /// Groups of the entry at `entry_dn`, walking parents transitively when
    /// `recurse` is set. Only groups not seen before are walked, so cycles end.
    async fn parent_groups(&self, entry_dn: &str, recurse: bool) -> HashSet<PrincipalId> {
        let mut sessions = Sessions::new();
        let mut found = HashSet::new();
        let mut pending = vec![entry_dn.to_string()];

        while let Some(current) = pending.pop() {
            let parents = match self.member_of(&mut sessions, &current).await {
                Ok(parents) => parents,
                Err(error) => {
                    tracing::warn!("Reading group membership of {current} failed: {error}");
                    continue;
                }
            };

            for parent in parents {
                let Some(id) = group_id(&parent) else {
                    continue;
                };
                if found.insert(id) && recurse {
                    pending.push(parent);
                }
            }
        }

        for client in sessions.values_mut() {
            client.close().await;
        }
        found
    }
}

/// `CN=Admins,CN=Users,DC=corp,DC=com` -> `Admins@corp.com`
fn group_id(group_dn: &str) -> Option<PrincipalId> {
    let name = dn::common_name(group_dn)?;
    Some(PrincipalId::new(
        PrincipalKind::Group,
        name,
        dn::domain_of(group_dn).unwrap_or_default(),
    ))
}

#[async_trait]
impl MembershipResolver for AdInner {
    async fn groups_of(&self, principal: &ResolvedPrincipal) -> HashSet<PrincipalId> {
        self.parent_groups(principal.distinguished_name(), self.config.recursive_groups)
            .await
    }

    fn group_query(&self, query: PrincipalId) -> PrincipalId {
        self.netbios.canonical(query)
    }
}

#[async_trait]
impl UserDirectory for ActiveDirectory {
    async fn find_principals(
        &self,
        search_term: &str,
        search_type: PrincipalSearchType,
    ) -> Result<Vec<DirectoryPrincipal>> {
        let Some(id) = PrincipalId::user(search_term) else {
            return Ok(Vec::new());
        };

        let filter = search_filter(id.principal(), search_type);
        let mut found = Vec::new();

        for domain in self.inner.domains_for(&id).await?.iter() {
            let entries = self.inner.search_domain(domain, &filter).await?;
            found.extend(
                entries
                    .iter()
                    .filter_map(|entry| self.principal_from_entry(entry, domain.name())),
            );
        }

        Ok(found)
    }

    async fn try_get_user(&self, name: &str) -> Result<Option<DirectoryUser>> {
        Ok(self
            .try_get_principal(name, PrincipalKind::User)
            .await?
            .and_then(DirectoryPrincipal::into_user))
    }

    async fn try_get_group(&self, name: &str) -> Result<Option<DirectoryGroup>> {
        Ok(self
            .try_get_principal(name, PrincipalKind::Group)
            .await?
            .and_then(DirectoryPrincipal::into_group))
    }

    async fn try_get_and_validate_user(
        &self,
        name: &str,
        password: &str,
    ) -> Result<Option<DirectoryUser>> {
        let Some(user) = self.try_get_user(name).await? else {
            return Ok(None);
        };

        let domain = dn::domain_of(user.distinguished_name())
            .unwrap_or_else(|| self.inner.netbios.resolve(user.id().domain_alias()).to_string());
        let target = self.inner.target_for(&domain).await?;

        validate_password(
            &*self.inner.connector,
            &target,
            user.distinguished_name(),
            password,
            &self.inner.options,
        )
        .await?;

        Ok(Some(user))
    }

    async fn get_group_members(&self, group_name: &str) -> Result<Vec<DirectoryUser>> {
        let Some(group) = self.try_get_group(group_name).await? else {
            return Ok(Vec::new());
        };

        let member_filter = if self.inner.config.recursive_groups {
            filter::in_chain(MEMBER_OF, group.distinguished_name())
        } else {
            filter::equals(MEMBER_OF, group.distinguished_name())
        };
        let filter = filter::and([USER_CATEGORY.to_string(), member_filter]);

        let domain_name = dn::domain_of(group.distinguished_name())
            .unwrap_or_else(|| group.id().domain_alias().to_string());
        let domain = CredentialedDomain::new(domain_name, None);
        let entries = self.inner.search_domain(&domain, &filter).await?;

        Ok(entries
            .iter()
            .filter_map(|entry| MAPPING.user(entry, group.id().domain_alias(), self.resolver()))
            .collect())
    }

    fn parse_logon_name(&self, logon: &str) -> Option<PrincipalId> {
        self.inner.netbios.parse_logon(logon)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::{entry, FakeConnector};

    const CORP_BASE: &str = "DC=corp,DC=example,DC=com";
    const JDOE_DN: &str = "CN=John Doe,OU=Staff,DC=corp,DC=example,DC=com";
    const ADMINS_DN: &str = "CN=Admins,OU=Groups,DC=corp,DC=example,DC=com";
    const OPS_DN: &str = "CN=Ops,OU=Groups,DC=corp,DC=example,DC=com";

    fn credentials() -> HashMap<String, Bind> {
        HashMap::from([(
            "CorpCred".to_string(),
            Bind {
                dn: "svc-reader@corp.example.com".into(),
                pass: "reader-pw".into(),
            },
        )])
    }

    fn jdoe() -> SearchEntry {
        entry(
            JDOE_DN,
            &[
                (SAM_ACCOUNT_NAME, &["jdoe"]),
                (OBJECT_CLASS, &["top", "person", "user"]),
                (DISPLAY_NAME, &["John Doe"]),
                (MAIL, &["jdoe@example.com"]),
            ],
        )
    }

    fn specific(fake: &FakeConnector) -> ActiveDirectory {
        let config = AdConfig {
            search_mode: DomainSearchMode::SpecificDomains,
            domains_to_search: vec!["corp.example.com,CorpCred".into()],
            netbios_map: vec!["CORP=corp.example.com".into()],
            ..Default::default()
        };
        ActiveDirectory::new(
            config,
            &credentials(),
            Arc::new(fake.clone()),
            CallOptions::default(),
        )
        .unwrap()
    }

    fn ad(fake: &FakeConnector, config: AdConfig) -> ActiveDirectory {
        let connector = Arc::new(fake.clone());
        ActiveDirectory::new(config, &credentials(), connector, CallOptions::default()).unwrap()
    }

    fn current(fake: &FakeConnector, mode: DomainSearchMode) -> ActiveDirectory {
        let config = AdConfig {
            domain: Some("corp.example.com".into()),
            search_mode: mode,
            ..Default::default()
        };
        ad(fake, config)
    }

    #[test]
    fn config_needs_somewhere_to_search() {
        let fake = Arc::new(FakeConnector::default());
        let nowhere = ActiveDirectory::new(
            AdConfig::default(),
            &credentials(),
            fake.clone(),
            CallOptions::default(),
        );
        assert!(matches!(nowhere, Err(DirectoryError::Config(_))));

        let no_domains = ActiveDirectory::new(
            AdConfig {
                search_mode: DomainSearchMode::SpecificDomains,
                ..Default::default()
            },
            &credentials(),
            fake,
            CallOptions::default(),
        );
        assert!(matches!(no_domains, Err(DirectoryError::Config(_))));
    }

    #[tokio::test]
    async fn get_user_in_specific_domain_binds_with_its_credentials() {
        let fake = FakeConnector::default();
        fake.on_search("(sAMAccountName=jdoe)", vec![jdoe()]);
        let directory = specific(&fake);

        let user = directory
            .try_get_user("jdoe@corp.example.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(user.name(), "jdoe@corp.example.com");
        assert_eq!(user.display_name(), "John Doe");
        assert_eq!(user.email_address(), Some("jdoe@example.com"));
        assert_eq!(user.distinguished_name(), JDOE_DN);

        let binds = fake.binds();
        assert_eq!(binds.len(), 1);
        assert_eq!(binds[0].host, "corp.example.com");
        assert_eq!(binds[0].dn, "svc-reader@corp.example.com");
        assert_eq!(binds[0].password, "reader-pw");

        let searches = fake.searches();
        assert_eq!(searches.len(), 1);
        assert_eq!(searches[0].host, "corp.example.com");
        assert_eq!(searches[0].base, CORP_BASE);
        assert!(searches[0].filter.contains("(sAMAccountName=jdoe)"));
    }

    #[tokio::test]
    async fn netbios_alias_scopes_the_search() {
        let fake = FakeConnector::default();
        fake.on_search("(sAMAccountName=jdoe)", vec![jdoe()]);
        let directory = specific(&fake);

        let logon = directory.parse_logon_name(r"CORP\jdoe").unwrap();
        assert_eq!(logon.full_name(), "jdoe@corp.example.com");

        let user = directory.try_get_user("jdoe@CORP").await.unwrap().unwrap();
        assert_eq!(user.name(), "jdoe@corp.example.com");
        assert_eq!(fake.connects(), vec!["corp.example.com"]);
    }

    #[tokio::test]
    async fn netbios_scoped_group_queries_match_dns_group_ids() {
        let fake = FakeConnector::default();
        fake.on_search("(sAMAccountName=jdoe)", vec![jdoe()]);
        fake.on_search_in(JDOE_DN, ANY_OBJECT, vec![entry(JDOE_DN, &[(MEMBER_OF, &[ADMINS_DN])])]);
        let directory = specific(&fake);

        let user = directory.try_get_user("jdoe@CORP").await.unwrap().unwrap();
        assert!(user.is_member_of_group("Admins@CORP").await);
        assert!(user.is_member_of_group("Admins@corp.example.com").await);
        assert!(!user.is_member_of_group("Admins@LAB").await);
    }

    #[tokio::test]
    async fn get_by_name_stops_at_first_domain_with_a_hit() {
        let fake = FakeConnector::default();
        fake.on_host_search("a.example.com", "(sAMAccountName=jd", vec![jdoe()]);
        fake.on_host_search("b.example.com", "(sAMAccountName=jd", vec![jdoe()]);
        let config = AdConfig {
            search_mode: DomainSearchMode::SpecificDomains,
            domains_to_search: vec!["a.example.com".into(), "b.example.com".into()],
            ..Default::default()
        };
        let directory = ad(&fake, config);

        let user = directory.try_get_user("jdoe").await.unwrap().unwrap();
        assert_eq!(user.name(), "jdoe@a.example.com");
        assert_eq!(fake.connects(), vec!["a.example.com"]);

        let found = directory
            .find_principals("jd", PrincipalSearchType::Users)
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
    }

    #[tokio::test]
    async fn unknown_or_malformed_names_are_not_errors() {
        let fake = FakeConnector::default();
        let directory = specific(&fake);

        assert!(directory.try_get_user("ghost").await.unwrap().is_none());
        assert!(directory.try_get_user("  ").await.unwrap().is_none());
        assert!(directory
            .find_principals("", PrincipalSearchType::UsersAndGroups)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn search_terms_are_escaped() {
        let fake = FakeConnector::default();
        let directory = specific(&fake);

        directory
            .find_principals("*)(objectClass=*", PrincipalSearchType::UsersAndGroups)
            .await
            .unwrap();

        let filter = &fake.searches()[0].filter;
        assert!(filter.contains(r"(sAMAccountName=\2a\29\28objectClass=\2a*)"));
        assert!(filter.contains("(|(objectCategory=user)(objectCategory=group))"));
    }

    #[tokio::test]
    async fn trust_enumeration_failure_keeps_found_domains() {
        let fake = FakeConnector::default();
        fake.on_search_in(
            &format!("CN=System,{CORP_BASE}"),
            "(objectClass=trustedDomain)",
            vec![
                entry(
                    "CN=child.corp.example.com,CN=System,DC=corp,DC=example,DC=com",
                    &[(TRUST_PARTNER, &["child.corp.example.com"]), (TRUST_DIRECTION, &["3"])],
                ),
                entry(
                    "CN=partner.example.net,CN=System,DC=corp,DC=example,DC=com",
                    &[(TRUST_PARTNER, &["partner.example.net"]), (TRUST_DIRECTION, &["2"])],
                ),
                entry(
                    "CN=inbound.example.org,CN=System,DC=corp,DC=example,DC=com",
                    &[(TRUST_PARTNER, &["inbound.example.org"]), (TRUST_DIRECTION, &["1"])],
                ),
            ],
        );
        fake.fail_search_in(
            "",
            ANY_OBJECT,
            DirectoryError::Connection("forest root unavailable".into()),
        );
        fake.on_host_search(
            "corp.example.com",
            "(sAMAccountName=jd*)",
            vec![jdoe()],
        );
        fake.on_host_search(
            "child.corp.example.com",
            "(sAMAccountName=jd*)",
            vec![entry(
                "CN=Jane Doe,DC=child,DC=corp,DC=example,DC=com",
                &[(SAM_ACCOUNT_NAME, &["jdoe2"]), (OBJECT_CLASS, &["user"])],
            )],
        );

        let directory = current(&fake, DomainSearchMode::TrustedDomains);
        let found = directory
            .find_principals("jd", PrincipalSearchType::Users)
            .await
            .unwrap();

        let names = found.iter().map(DirectoryPrincipal::name).collect::<Vec<_>>();
        assert_eq!(
            names,
            vec!["jdoe@corp.example.com", "jdoe2@child.corp.example.com"]
        );
        assert!(!fake.connects().contains(&"partner.example.net".to_string()));
        assert!(fake.connects().contains(&"inbound.example.org".to_string()));
    }

    #[tokio::test]
    async fn current_domain_mode_skips_trusts() {
        let fake = FakeConnector::default();
        let directory = current(&fake, DomainSearchMode::CurrentDomain);

        directory
            .find_principals("jd", PrincipalSearchType::Users)
            .await
            .unwrap();
        assert!(fake.searches_matching("trustedDomain").is_empty());
        assert_eq!(fake.connects(), vec!["corp.example.com"]);
    }

    #[tokio::test]
    async fn current_domain_is_detected_from_root_dse() {
        let fake = FakeConnector::default();
        fake.on_search_in(
            "",
            ANY_OBJECT,
            vec![entry("", &[(DEFAULT_NAMING_CONTEXT, &[CORP_BASE])])],
        );
        fake.on_search("(sAMAccountName=jdoe)", vec![jdoe()]);
        let config = AdConfig {
            connection: ConnectionConfig {
                host: Some("dc1.corp.example.com".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        let directory = ad(&fake, config);

        let user = directory.try_get_user("jdoe").await.unwrap().unwrap();
        assert_eq!(user.name(), "jdoe@corp.example.com");
        assert!(fake.connects().iter().all(|host| host == "dc1.corp.example.com"));
    }

    #[tokio::test]
    async fn refused_root_dse_is_not_a_search_error() {
        let fake = FakeConnector::default();
        fake.fail_search_in(
            "",
            ANY_OBJECT,
            DirectoryError::Search("rc=50 insufficientAccessRights".into()),
        );
        let config = AdConfig {
            connection: ConnectionConfig {
                host: Some("dc1.corp.example.com".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        let directory = ad(&fake, config);

        let found = directory
            .find_principals("jd", PrincipalSearchType::Users)
            .await;
        assert!(matches!(found, Err(DirectoryError::Config(_))));
        let user = directory.try_get_user("jdoe").await;
        assert!(matches!(user, Err(DirectoryError::Config(_))));
        assert!(fake.searches_matching("sAMAccountName").is_empty());
    }

    #[tokio::test]
    async fn recursive_groups_terminate_on_cycles() {
        let fake = FakeConnector::default();
        fake.on_search("(sAMAccountName=jdoe)", vec![jdoe()]);
        fake.on_search_in(JDOE_DN, ANY_OBJECT, vec![entry(JDOE_DN, &[(MEMBER_OF, &[ADMINS_DN])])]);
        fake.on_search_in(ADMINS_DN, ANY_OBJECT, vec![entry(ADMINS_DN, &[(MEMBER_OF, &[OPS_DN])])]);
        fake.on_search_in(OPS_DN, ANY_OBJECT, vec![entry(OPS_DN, &[(MEMBER_OF, &[ADMINS_DN])])]);
        let directory = specific(&fake);

        let user = directory.try_get_user("jdoe").await.unwrap().unwrap();
        let groups = user.groups().await;
        let expected: HashSet<PrincipalId> = [
            PrincipalId::group("Admins@corp.example.com").unwrap(),
            PrincipalId::group("Ops@corp.example.com").unwrap(),
        ]
        .into_iter()
        .collect();
        assert_eq!(groups, &expected);

        assert!(user.is_member_of_group("admins").await);
        assert!(user.is_member_of_group("Ops").await);
        assert!(user.is_member_of_group("Ops").await);
        assert_eq!(fake.searches_matching(ANY_OBJECT).len(), 3);
    }

    #[tokio::test]
    async fn failing_branch_contributes_nothing_further() {
        let fake = FakeConnector::default();
        fake.on_search("(sAMAccountName=jdoe)", vec![jdoe()]);
        fake.on_search_in(JDOE_DN, ANY_OBJECT, vec![entry(JDOE_DN, &[(MEMBER_OF, &[ADMINS_DN])])]);
        fake.fail_search_in(ADMINS_DN, ANY_OBJECT, DirectoryError::Search("rc=50".into()));
        let directory = specific(&fake);

        let user = directory.try_get_user("jdoe").await.unwrap().unwrap();
        assert_eq!(user.groups().await.len(), 1);
        assert!(user.is_member_of_group("Admins").await);
        assert!(!user.is_member_of_group("Ops").await);
    }

    #[tokio::test]
    async fn validation_distinguishes_missing_user_from_bad_password() {
        let fake = FakeConnector::default();
        fake.on_search("(sAMAccountName=jdoe)", vec![jdoe()]);
        fake.password(JDOE_DN, "correct horse");
        let directory = specific(&fake);

        let valid = directory
            .try_get_and_validate_user("jdoe", "correct horse")
            .await
            .unwrap();
        assert_eq!(valid.unwrap().name(), "jdoe@corp.example.com");

        let wrong = directory.try_get_and_validate_user("jdoe", "nope").await;
        assert!(matches!(wrong, Err(DirectoryError::Authentication(_))));

        let empty = directory.try_get_and_validate_user("jdoe", "").await;
        assert!(matches!(empty, Err(DirectoryError::Authentication(_))));

        let binds_before = fake.binds().len();
        let missing = directory.try_get_and_validate_user("ghost", "x").await.unwrap();
        assert!(missing.is_none());
        assert!(fake.binds()[binds_before..]
            .iter()
            .all(|bind| bind.dn == "svc-reader@corp.example.com"));
    }

    #[tokio::test]
    async fn unreachable_domain_is_an_error() {
        let fake = FakeConnector::default();
        fake.unreachable("corp.example.com");
        let directory = specific(&fake);

        let result = directory.try_get_user("jdoe").await;
        assert!(matches!(result, Err(DirectoryError::Connection(_))));
    }

    #[tokio::test]
    async fn group_members_use_transitive_rule() {
        let fake = FakeConnector::default();
        fake.on_search(
            "(objectCategory=group)(|(sAMAccountName=Admins)",
            vec![entry(
                ADMINS_DN,
                &[(SAM_ACCOUNT_NAME, &["Admins"]), (OBJECT_CLASS, &["top", "group"])],
            )],
        );
        fake.on_search(":1.2.840.113556.1.4.1941:=", vec![jdoe()]);
        let directory = specific(&fake);

        let members = directory.get_group_members("Admins").await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].name(), "jdoe@corp.example.com");
        assert_eq!(
            fake.searches_matching(&format!("(memberOf:1.2.840.113556.1.4.1941:={ADMINS_DN})"))
                .len(),
            1
        );
    }
}
