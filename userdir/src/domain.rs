use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use crate::principal::{PrincipalId, PrincipalKind};
use crate::Bind;

/// DNS domain name plus the credentials used to search it.
///
/// Identity is the domain name only, compared case-insensitively.
#[derive(Debug, Clone)]
pub struct CredentialedDomain {
    name: String,
    credentials: Option<Bind>,
}

impl CredentialedDomain {
    pub fn new(name: impl Into<String>, credentials: Option<Bind>) -> Self {
        Self {
            name: name.into(),
            credentials,
        }
    }

    /// Parse a `domain[,credentialName]` line, looking the credential name
    /// up in `store`. Unknown credential names fall back to no credentials.
    pub fn parse(line: &str, store: &HashMap<String, Bind>) -> Option<Self> {
        let (name, credential_name) = match line.split_once(',') {
            Some((name, credential)) => (name.trim(), Some(credential.trim())),
            None => (line.trim(), None),
        };

        if name.is_empty() {
            return None;
        }

        let credentials = credential_name
            .filter(|credential| !credential.is_empty())
            .and_then(|credential| {
                let found = store.get(credential).cloned();
                if found.is_none() {
                    tracing::warn!("Credentials {credential} for domain {name} not found");
                }
                found
            });

        Some(Self::new(name, credentials))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn credentials(&self) -> Option<&Bind> {
        self.credentials.as_ref()
    }
}

impl PartialEq for CredentialedDomain {
    fn eq(&self, other: &Self) -> bool {
        self.name.eq_ignore_ascii_case(&other.name)
    }
}

impl Eq for CredentialedDomain {}

impl Hash for CredentialedDomain {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.to_ascii_lowercase().hash(state);
    }
}

/// Ordered, de-duplicated list of domains. Iteration order is insertion order.
#[derive(Debug, Clone, Default)]
pub struct DomainSet(Vec<CredentialedDomain>);

impl DomainSet {
    /// Returns false when a domain with the same name is already present
    pub fn insert(&mut self, domain: CredentialedDomain) -> bool {
        if self.0.contains(&domain) {
            false
        } else {
            self.0.push(domain);
            true
        }
    }

    pub fn get(&self, name: &str) -> Option<&CredentialedDomain> {
        self.0.iter().find(|domain| domain.name.eq_ignore_ascii_case(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = &CredentialedDomain> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<CredentialedDomain> for DomainSet {
    fn from_iter<T: IntoIterator<Item = CredentialedDomain>>(iter: T) -> Self {
        let mut set = DomainSet::default();
        for domain in iter {
            set.insert(domain);
        }
        set
    }
}

/// NETBIOS alias -> DNS domain name
#[derive(Debug, Clone, Default)]
pub struct NetbiosMap(HashMap<String, String>);

impl NetbiosMap {
    /// Parse `NETBIOS=dns.domain` lines. Malformed lines are skipped.
    pub fn parse<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut map = HashMap::new();
        for line in lines {
            let line = line.as_ref();
            match line.split_once('=') {
                Some((netbios, dns)) if !netbios.trim().is_empty() && !dns.trim().is_empty() => {
                    map.insert(netbios.trim().to_ascii_uppercase(), dns.trim().to_string());
                }
                _ => tracing::warn!("Ignoring malformed NETBIOS mapping {line:?}"),
            }
        }
        Self(map)
    }

    pub fn get(&self, netbios: &str) -> Option<&str> {
        self.0.get(&netbios.to_ascii_uppercase()).map(String::as_str)
    }

    /// DNS name for an alias, or the alias itself when it is not mapped
    pub fn resolve<'a>(&'a self, alias: &'a str) -> &'a str {
        self.get(alias).unwrap_or(alias)
    }

    /// `id` with a mapped NETBIOS alias replaced by its DNS domain
    pub fn canonical(&self, id: PrincipalId) -> PrincipalId {
        match self.get(id.domain_alias()) {
            Some(dns) => id.with_domain(dns),
            None => id,
        }
    }

    /// Parse `DOMAIN\user`, `user@domain` or bare `user`.
    ///
    /// Mapped NETBIOS names are replaced by their DNS domain.
    pub fn parse_logon(&self, logon: &str) -> Option<PrincipalId> {
        let logon = logon.trim();
        match logon.split_once('\\') {
            Some((netbios, user)) => {
                let user = user.trim();
                if user.is_empty() {
                    return None;
                }
                let netbios = netbios.trim();
                Some(PrincipalId::new(
                    PrincipalKind::User,
                    user,
                    self.resolve(netbios),
                ))
            }
            None => PrincipalId::user(logon),
        }
    }
}
