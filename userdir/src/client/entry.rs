use ldap3::SearchEntry;

use crate::dn;

/// Read access to one search hit
pub trait LdapClientEntry {
    fn dn(&self) -> &str;

    /// All values of `name`, matched case-insensitively
    fn attr_values(&self, name: &str) -> &[String];

    /// First non-empty value of `name`
    fn attr(&self, name: &str) -> Option<&str> {
        self.attr_values(name)
            .iter()
            .map(String::as_str)
            .find(|value| !value.is_empty())
    }

    fn has_value(&self, name: &str, value: &str) -> bool {
        self.attr_values(name)
            .iter()
            .any(|v| v.eq_ignore_ascii_case(value))
    }

    /// DNs listed in a member-of style attribute
    fn group_dns(&self, member_of: &str) -> Vec<String> {
        self.attr_values(member_of)
            .iter()
            .filter(|value| !value.is_empty())
            .cloned()
            .collect()
    }

    /// `CN=` values of a member-of style attribute
    fn group_names(&self, member_of: &str) -> Vec<String> {
        self.attr_values(member_of)
            .iter()
            .filter_map(|value| dn::common_name(value))
            .collect()
    }
}

impl LdapClientEntry for SearchEntry {
    fn dn(&self) -> &str {
        &self.dn
    }

    fn attr_values(&self, name: &str) -> &[String] {
        if let Some(values) = self.attrs.get(name) {
            return values;
        }

        self.attrs
            .iter()
            .find(|(attr, _)| attr.eq_ignore_ascii_case(name))
            .map(|(_, values)| values.as_slice())
            .unwrap_or(&[])
    }
}
