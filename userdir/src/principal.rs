use serde::Serialize;
use std::hash::{Hash, Hasher};

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PrincipalKind {
    User,
    Group,
}

/// `name@domain` identity of a user or group.
///
/// Equality and hashing ignore case and the kind: two ids are the same
/// principal when their domain alias and name match case-insensitively.
#[derive(Debug, Clone)]
pub struct PrincipalId {
    kind: PrincipalKind,
    principal: String,
    domain_alias: String,
}

impl PrincipalId {
    pub fn new(
        kind: PrincipalKind,
        principal: impl Into<String>,
        domain_alias: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            principal: principal.into(),
            domain_alias: domain_alias.into(),
        }
    }

    /// Parse `name@domain` or bare `name`. The split happens at the last `@`
    /// so UPN-like names keep their own `@`.
    pub fn parse(kind: PrincipalKind, value: &str) -> Option<Self> {
        let value = value.trim();
        let (principal, domain) = match value.rsplit_once('@') {
            Some((principal, domain)) => (principal.trim(), domain.trim()),
            None => (value, ""),
        };

        if principal.is_empty() {
            return None;
        }

        Some(Self::new(kind, principal, domain))
    }

    pub fn user(value: &str) -> Option<Self> {
        Self::parse(PrincipalKind::User, value)
    }

    pub fn group(value: &str) -> Option<Self> {
        Self::parse(PrincipalKind::Group, value)
    }

    pub fn kind(&self) -> PrincipalKind {
        self.kind
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    /// Empty when the id is not scoped to a domain
    pub fn domain_alias(&self) -> &str {
        &self.domain_alias
    }

    pub fn has_domain(&self) -> bool {
        !self.domain_alias.is_empty()
    }

    pub fn with_domain(&self, domain_alias: impl Into<String>) -> Self {
        Self::new(self.kind, self.principal.clone(), domain_alias)
    }

    pub fn full_name(&self) -> String {
        if self.domain_alias.is_empty() {
            self.principal.clone()
        } else {
            format!("{}@{}", self.principal, self.domain_alias)
        }
    }

    /// Like `==`, but an unscoped `query` matches this id in any domain
    pub fn matches(&self, query: &PrincipalId) -> bool {
        self.principal.eq_ignore_ascii_case(&query.principal)
            && (!query.has_domain() || self.domain_alias.eq_ignore_ascii_case(&query.domain_alias))
    }

    /// Second phase: attach the DN found by a directory search
    pub fn resolve(self, distinguished_name: impl Into<String>) -> ResolvedPrincipal {
        ResolvedPrincipal {
            id: self,
            distinguished_name: distinguished_name.into(),
        }
    }
}

impl PartialEq for PrincipalId {
    fn eq(&self, other: &Self) -> bool {
        self.principal.eq_ignore_ascii_case(&other.principal)
            && self.domain_alias.eq_ignore_ascii_case(&other.domain_alias)
    }
}

impl Eq for PrincipalId {}

impl Hash for PrincipalId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.domain_alias.to_ascii_lowercase().hash(state);
        self.principal.to_ascii_lowercase().hash(state);
    }
}

impl std::fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.full_name())
    }
}

/// A principal id together with the DN it was found under
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolvedPrincipal {
    id: PrincipalId,
    distinguished_name: String,
}

impl ResolvedPrincipal {
    pub fn id(&self) -> &PrincipalId {
        &self.id
    }

    pub fn distinguished_name(&self) -> &str {
        &self.distinguished_name
    }

    pub fn full_name(&self) -> String {
        self.id.full_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;
    use std::collections::HashSet;

    fn hash_of(id: &PrincipalId) -> u64 {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn parse_and_full_name_round_trip() {
        for input in ["jsmith@corp.example.com", "JSmith@CORP", "svc.build@ad.local"] {
            let id = PrincipalId::user(input).unwrap();
            assert!(id.full_name().eq_ignore_ascii_case(input));
        }

        let bare = PrincipalId::user("jsmith").unwrap();
        assert_eq!(bare.domain_alias(), "");
        assert_eq!(bare.full_name(), "jsmith");
    }

    #[test]
    fn splits_at_last_at_sign() {
        let id = PrincipalId::user("first@last@corp.example.com").unwrap();
        assert_eq!(id.principal(), "first@last");
        assert_eq!(id.domain_alias(), "corp.example.com");
    }

    #[test]
    fn rejects_empty_principal() {
        assert!(PrincipalId::user("").is_none());
        assert!(PrincipalId::user("   ").is_none());
        assert!(PrincipalId::user("@corp").is_none());
        assert_eq!(PrincipalId::user("jdoe@").unwrap().domain_alias(), "");
    }

    #[test]
    fn case_insensitive_identity() {
        let a = PrincipalId::user("JDoe@Corp.Example.com").unwrap();
        let b = PrincipalId::user("jdoe@corp.example.COM").unwrap();
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));

        let set: HashSet<_> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);

        let other_domain = PrincipalId::user("jdoe@other").unwrap();
        assert!(!set.contains(&other_domain));
    }

    #[test]
    fn unscoped_query_matches_any_domain() {
        let group = PrincipalId::group("Admins@corp").unwrap();
        assert!(group.matches(&PrincipalId::group("admins").unwrap()));
        assert!(group.matches(&PrincipalId::group("ADMINS@CORP").unwrap()));
        assert!(!group.matches(&PrincipalId::group("admins@other").unwrap()));
    }

    #[test]
    fn resolve_attaches_dn() {
        let resolved = PrincipalId::user("jdoe@corp")
            .unwrap()
            .resolve("CN=John Doe,DC=corp");
        assert_eq!(resolved.distinguished_name(), "CN=John Doe,DC=corp");
        assert_eq!(resolved.full_name(), "jdoe@corp");
    }
}
