//! LDAP filter construction (RFC 4515).
//!
//! Every value that originates from user input goes through [`escape`]
//! before it is placed into a filter.

/// Transitive membership matching rule (`LDAP_MATCHING_RULE_IN_CHAIN`)
pub const MATCHING_RULE_IN_CHAIN: &str = "1.2.840.113556.1.4.1941";

/// Placeholder replaced in filter templates
pub const TEMPLATE_PLACEHOLDER: &str = "%s";

/// Escape `*`, `(`, `)`, `\` and NUL so the value is matched literally
pub fn escape(value: &str) -> String {
    ldap3::ldap_escape(value).into_owned()
}

/// `(attr=value)`, value escaped
pub fn equals(attr: &str, value: &str) -> String {
    format!("({attr}={})", escape(value))
}

/// `(attr=value*)`, value escaped
pub fn starts_with(attr: &str, value: &str) -> String {
    format!("({attr}={}*)", escape(value))
}

/// `(attr:1.2.840.113556.1.4.1941:=dn)`
pub fn in_chain(attr: &str, dn: &str) -> String {
    format!("({attr}:{MATCHING_RULE_IN_CHAIN}:={})", escape(dn))
}

pub fn and<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    combine('&', parts)
}

pub fn or<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    combine('|', parts)
}

fn combine<I, S>(op: char, parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let parts = parts
        .into_iter()
        .map(|part| wrap(part.as_ref()))
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>();

    match parts.len() {
        0 => String::new(),
        1 => parts.into_iter().next().unwrap_or_default(),
        _ => format!("({op}{})", parts.concat()),
    }
}

/// Configured filters are accepted with or without their outer parentheses
pub fn wrap(filter: &str) -> String {
    let filter = filter.trim();
    if filter.is_empty() || filter.starts_with('(') {
        filter.to_string()
    } else {
        format!("({filter})")
    }
}

/// Replace every `%s` in `template` with an already escaped value
pub fn substitute(template: &str, escaped_value: &str) -> String {
    wrap(&template.replace(TEMPLATE_PLACEHOLDER, escaped_value))
}
