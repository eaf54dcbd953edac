//! Distinguished name helpers.
//!
//! Only the small subset of RFC 4514 the directories need: splitting a DN
//! into its RDNs, pulling out `CN=` / `DC=` values and mapping DNS domain
//! names to naming contexts and back.

/// Split a DN into `(attribute, value)` pairs, honouring `\,` escapes.
pub fn rdns(dn: &str) -> Vec<(String, String)> {
    let mut parts = Vec::new();
    let mut buf = String::new();
    let mut escape = false;

    for c in dn.chars() {
        match (escape, c) {
            (true, _) => {
                buf.push(c);
                escape = false;
            }
            (false, '\\') => {
                buf.push(c);
                escape = true;
            }
            (false, ',') => {
                parts.push(std::mem::take(&mut buf));
            }
            _ => buf.push(c),
        }
    }
    parts.push(buf);

    parts
        .into_iter()
        .filter_map(|rdn| {
            let (attr, value) = rdn.split_once('=')?;
            Some((attr.trim().to_string(), unescape(value.trim())))
        })
        .collect()
}

/// Undo `\<special>` and `\XX` hex-pair escapes. Hex pairs are raw bytes,
/// a multi-byte UTF-8 character spans several of them.
fn unescape(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'\\' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }

        match bytes.get(i + 1..i + 3).and_then(hex_pair) {
            Some(byte) => {
                out.push(byte);
                i += 3;
            }
            None => {
                if let Some(&next) = bytes.get(i + 1) {
                    out.push(next);
                }
                i += 2;
            }
        }
    }

    match String::from_utf8(out) {
        Ok(value) => value,
        Err(error) => String::from_utf8_lossy(error.as_bytes()).into_owned(),
    }
}

fn hex_pair(pair: &[u8]) -> Option<u8> {
    if !pair.iter().all(u8::is_ascii_hexdigit) {
        return None;
    }
    u8::from_str_radix(std::str::from_utf8(pair).ok()?, 16).ok()
}

/// Value of the first `CN=` component
pub fn common_name(dn: &str) -> Option<String> {
    rdns(dn)
        .into_iter()
        .find(|(attr, _)| attr.eq_ignore_ascii_case("cn"))
        .map(|(_, value)| value)
        .filter(|value| !value.is_empty())
}

/// `CN=x,OU=y,DC=corp,DC=example,DC=com` -> `corp.example.com`
pub fn domain_of(dn: &str) -> Option<String> {
    let labels = rdns(dn)
        .into_iter()
        .filter(|(attr, _)| attr.eq_ignore_ascii_case("dc"))
        .map(|(_, value)| value)
        .collect::<Vec<_>>();

    if labels.is_empty() {
        None
    } else {
        Some(labels.join("."))
    }
}

/// `sub.domain.tld` -> `DC=sub,DC=domain,DC=tld`
pub fn from_domain(domain: &str) -> String {
    domain
        .split('.')
        .filter(|label| !label.is_empty())
        .map(|label| format!("DC={label}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_escaped_commas() {
        let parts = rdns(r"CN=Smith\, John,OU=People,DC=corp,DC=example,DC=com");
        assert_eq!(parts[0], ("CN".to_string(), "Smith, John".to_string()));
        assert_eq!(parts.len(), 5);
    }

    #[test]
    fn decodes_hex_pair_escapes() {
        assert_eq!(
            common_name(r"CN=Smith\2C John,OU=People,DC=corp").as_deref(),
            Some("Smith, John")
        );
        assert_eq!(
            common_name(r"CN=Lu\C4\8Di\C4\87,OU=People,DC=corp").as_deref(),
            Some("Lu\u{10d}i\u{107}")
        );
        assert_eq!(common_name(r"CN=a\+1,DC=corp").as_deref(), Some("a+1"));
        assert_eq!(common_name(r"CN=back\\slash,DC=corp").as_deref(), Some(r"back\slash"));
        assert_eq!(rdns(r"CN=x\2c y,DC=corp").len(), 2);
    }

    #[test]
    fn common_name_is_first_cn() {
        assert_eq!(
            common_name("CN=Admins,CN=Users,DC=corp,DC=com").as_deref(),
            Some("Admins")
        );
        assert_eq!(common_name("OU=Groups,DC=corp,DC=com"), None);
        assert_eq!(common_name("cn=devs,ou=groups,dc=corp").as_deref(), Some("devs"));
    }

    #[test]
    fn domain_and_naming_context() {
        assert_eq!(
            domain_of("CN=jdoe,OU=Staff,DC=corp,DC=example,DC=com").as_deref(),
            Some("corp.example.com")
        );
        assert_eq!(domain_of("CN=jdoe,O=Acme"), None);
        assert_eq!(from_domain("sub.domain.tld"), "DC=sub,DC=domain,DC=tld");
    }
}
