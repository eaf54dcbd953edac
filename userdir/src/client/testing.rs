//! Scripted in-memory directory used by the unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ldap3::SearchEntry;

use super::{LdapClient, LdapConnector, SearchScope};
use crate::error::{DirectoryError, Result};
use crate::{CallOptions, LdapTarget};

pub(crate) fn entry(dn: &str, attrs: &[(&str, &[&str])]) -> SearchEntry {
    SearchEntry {
        dn: dn.to_string(),
        attrs: attrs
            .iter()
            .map(|(name, values)| {
                (
                    name.to_string(),
                    values.iter().map(|v| v.to_string()).collect(),
                )
            })
            .collect(),
        bin_attrs: HashMap::new(),
    }
}

#[derive(Debug, Clone)]
pub(crate) struct SearchCall {
    pub host: String,
    pub base: String,
    pub filter: String,
    pub scope: SearchScope,
}

#[derive(Debug, Clone)]
pub(crate) struct BindCall {
    pub host: String,
    pub dn: String,
    pub password: String,
}

struct Rule {
    host: Option<String>,
    base: Option<String>,
    filter: String,
    response: Result<Vec<SearchEntry>>,
}

impl Rule {
    fn matches(&self, host: &str, base: &str, filter: &str) -> bool {
        self.host
            .as_deref()
            .map_or(true, |h| h.eq_ignore_ascii_case(host))
            && self
                .base
                .as_deref()
                .map_or(true, |b| b.eq_ignore_ascii_case(base))
            && filter.contains(&self.filter)
    }
}

#[derive(Default)]
struct FakeState {
    rules: Vec<Rule>,
    passwords: HashMap<String, String>,
    unreachable: HashSet<String>,
    connects: Vec<String>,
    binds: Vec<BindCall>,
    searches: Vec<SearchCall>,
}

/// Answers searches from rules, first match wins; unmatched searches are empty
#[derive(Clone, Default)]
pub(crate) struct FakeConnector(Arc<Mutex<FakeState>>);

impl FakeConnector {
    fn add(&self, rule: Rule) -> &Self {
        self.0.lock().unwrap().rules.push(rule);
        self
    }

    pub fn on_search(&self, filter: &str, entries: Vec<SearchEntry>) -> &Self {
        self.add(Rule {
            host: None,
            base: None,
            filter: filter.to_string(),
            response: Ok(entries),
        })
    }

    pub fn on_search_in(&self, base: &str, filter: &str, entries: Vec<SearchEntry>) -> &Self {
        self.add(Rule {
            host: None,
            base: Some(base.to_string()),
            filter: filter.to_string(),
            response: Ok(entries),
        })
    }

    pub fn on_host_search(&self, host: &str, filter: &str, entries: Vec<SearchEntry>) -> &Self {
        self.add(Rule {
            host: Some(host.to_string()),
            base: None,
            filter: filter.to_string(),
            response: Ok(entries),
        })
    }

    pub fn fail_search_in(&self, base: &str, filter: &str, error: DirectoryError) -> &Self {
        self.add(Rule {
            host: None,
            base: Some(base.to_string()),
            filter: filter.to_string(),
            response: Err(error),
        })
    }

    /// Binds as `dn` succeed only with `password`
    pub fn password(&self, dn: &str, password: &str) -> &Self {
        self.0
            .lock()
            .unwrap()
            .passwords
            .insert(dn.to_ascii_lowercase(), password.to_string());
        self
    }

    pub fn unreachable(&self, host: &str) -> &Self {
        self.0
            .lock()
            .unwrap()
            .unreachable
            .insert(host.to_ascii_lowercase());
        self
    }

    pub fn connects(&self) -> Vec<String> {
        self.0.lock().unwrap().connects.clone()
    }

    pub fn binds(&self) -> Vec<BindCall> {
        self.0.lock().unwrap().binds.clone()
    }

    pub fn searches(&self) -> Vec<SearchCall> {
        self.0.lock().unwrap().searches.clone()
    }

    pub fn searches_matching(&self, filter: &str) -> Vec<SearchCall> {
        self.searches()
            .into_iter()
            .filter(|call| call.filter.contains(filter))
            .collect()
    }
}

#[async_trait]
impl LdapConnector for FakeConnector {
    async fn connect(
        &self,
        target: &LdapTarget,
        _options: &CallOptions,
    ) -> Result<Box<dyn LdapClient>> {
        let mut state = self.0.lock().unwrap();
        state.connects.push(target.host.clone());
        if state.unreachable.contains(&target.host.to_ascii_lowercase()) {
            return Err(DirectoryError::Connection(format!(
                "{}: unreachable",
                target.url()
            )));
        }
        Ok(Box::new(FakeClient {
            host: target.host.clone(),
            state: self.0.clone(),
            closed: false,
        }))
    }
}

struct FakeClient {
    host: String,
    state: Arc<Mutex<FakeState>>,
    closed: bool,
}

#[async_trait]
impl LdapClient for FakeClient {
    async fn bind(&mut self, dn: &str, password: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.binds.push(BindCall {
            host: self.host.clone(),
            dn: dn.to_string(),
            password: password.to_string(),
        });
        match state.passwords.get(&dn.to_ascii_lowercase()) {
            Some(expected) if expected != password => Err(DirectoryError::Authentication(
                format!("{dn}: rc=49 invalid credentials"),
            )),
            _ => Ok(()),
        }
    }

    async fn search_attrs(
        &mut self,
        base: &str,
        filter: &str,
        scope: SearchScope,
        _attrs: &[&str],
    ) -> Result<Vec<SearchEntry>> {
        if filter.trim().is_empty() {
            return Ok(Vec::new());
        }
        if self.closed {
            return Err(DirectoryError::Connection("closed".into()));
        }

        let mut state = self.state.lock().unwrap();
        state.searches.push(SearchCall {
            host: self.host.clone(),
            base: base.to_string(),
            filter: filter.to_string(),
            scope,
        });

        state
            .rules
            .iter()
            .find(|rule| rule.matches(&self.host, base, filter))
            .map(|rule| rule.response.clone())
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}
