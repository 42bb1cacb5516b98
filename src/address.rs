use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("address must contain exactly one @")]
    MissingAt,
    #[error("address local part is empty")]
    EmptyLocalPart,
    #[error("address domain is empty")]
    EmptyDomain,
    #[error("rule condition is empty")]
    EmptyCondition,
}

/// Split an envelope address into local part and domain.
///
/// Exactly one `@` with non-empty parts on both sides; bare `postmaster`
/// (RFC 5321, 4.5.1) is the one address allowed without a domain.
pub fn split_address(addr: &str) -> Result<(&str, &str), AddressError> {
    if addr.eq_ignore_ascii_case("postmaster") {
        return Ok((addr, ""));
    }
    let mut parts = addr.splitn(2, '@');
    let local = parts.next().unwrap_or_default();
    let domain = parts.next().ok_or(AddressError::MissingAt)?;
    if local.is_empty() {
        return Err(AddressError::EmptyLocalPart);
    }
    if domain.is_empty() {
        return Err(AddressError::EmptyDomain);
    }
    if domain.contains('@') {
        return Err(AddressError::MissingAt);
    }
    Ok((local, domain))
}

/// Canonical form used for rule matching: the whole address lowercased.
pub fn for_lookup(addr: &str) -> String {
    addr.to_ascii_lowercase()
}

/// Rule table matching envelope addresses with the precedence
/// exact address > domain > default.
///
/// Keys are stored lowercased; a key containing `@` (or bare `postmaster`)
/// is a full-address rule, anything else is a domain rule.
#[derive(Debug, Clone)]
pub struct AddressTable<T> {
    exact: HashMap<String, T>,
    domains: HashMap<String, T>,
    default: Option<T>,
}

impl<T> Default for AddressTable<T> {
    fn default() -> Self {
        Self {
            exact: HashMap::new(),
            domains: HashMap::new(),
            default: None,
        }
    }
}

impl<T> AddressTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a rule for a full address or a domain, depending on the
    /// shape of `key`.
    pub fn insert(&mut self, key: &str, value: T) -> Result<(), AddressError> {
        if key.is_empty() {
            return Err(AddressError::EmptyCondition);
        }
        if key.contains('@') || key.eq_ignore_ascii_case("postmaster") {
            split_address(key)?;
            self.exact.insert(for_lookup(key), value);
        } else {
            self.domains.insert(for_lookup(key), value);
        }
        Ok(())
    }

    pub fn set_default(&mut self, value: T) {
        self.default = Some(value);
    }

    pub fn has_default(&self) -> bool {
        self.default.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.domains.is_empty() && self.default.is_none()
    }

    /// Find the most specific rule for `addr`. An address that does not
    /// split (e.g. the null sender) can only match the default.
    pub fn lookup(&self, addr: &str) -> Option<&T> {
        let key = for_lookup(addr);
        if let Some(value) = self.exact.get(&key) {
            return Some(value);
        }
        if let Ok((_, domain)) = split_address(&key)
            && !domain.is_empty()
            && let Some(value) = self.domains.get(domain)
        {
            return Some(value);
        }
        self.default.as_ref()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn split_accepts_plain_addresses() {
        assert_eq!(split_address("user@example.org").unwrap(), ("user", "example.org"));
        assert_eq!(split_address("postmaster").unwrap(), ("postmaster", ""));
        assert_eq!(split_address("POSTMASTER").unwrap(), ("POSTMASTER", ""));
    }

    #[test]
    fn split_rejects_malformed_addresses() {
        assert_eq!(split_address(""), Err(AddressError::MissingAt));
        assert_eq!(split_address("no-domain"), Err(AddressError::MissingAt));
        assert_eq!(split_address("@example.org"), Err(AddressError::EmptyLocalPart));
        assert_eq!(split_address("user@"), Err(AddressError::EmptyDomain));
        assert_eq!(split_address("a@b@c"), Err(AddressError::MissingAt));
    }

    #[test]
    fn lookup_precedence() {
        let mut table = AddressTable::new();
        table.insert("special@example.org", 1).unwrap();
        table.insert("example.org", 2).unwrap();
        table.set_default(3);

        assert_eq!(table.lookup("special@example.org"), Some(&1));
        assert_eq!(table.lookup("SPECIAL@EXAMPLE.ORG"), Some(&1));
        assert_eq!(table.lookup("other@example.org"), Some(&2));
        assert_eq!(table.lookup("other@elsewhere.net"), Some(&3));
        // the null sender can only ever hit the default
        assert_eq!(table.lookup(""), Some(&3));
    }

    #[test]
    fn lookup_without_default() {
        let mut table = AddressTable::new();
        table.insert("example.org", 1).unwrap();
        assert_eq!(table.lookup("user@elsewhere.net"), None);
    }

    #[test]
    fn insert_validates_conditions() {
        let mut table: AddressTable<u8> = AddressTable::new();
        assert_eq!(table.insert("", 0), Err(AddressError::EmptyCondition));
        assert_eq!(table.insert("user@", 0), Err(AddressError::EmptyDomain));
        table.insert("postmaster", 0).unwrap();
        assert_eq!(table.lookup("Postmaster"), Some(&0));
    }
}
