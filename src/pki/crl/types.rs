use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use time::OffsetDateTime;

/// Identifier of a CRL origin: a distribution point URL, a configured
/// resource URI or path, or an LDAP URL. Used as the cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CrlSourceId(Arc<str>);

impl CrlSourceId {
    pub fn new(source: impl AsRef<str>) -> Self {
        Self(Arc::from(source.as_ref().trim()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lowercased URL scheme, if the source looks like a URL.
    pub fn scheme(&self) -> Option<String> {
        let (scheme, _) = self.0.split_once(':')?;
        let valid = !scheme.is_empty()
            && scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
        // Single letters are Windows drive prefixes, not schemes
        (valid && scheme.len() > 1).then(|| scheme.to_ascii_lowercase())
    }

    pub fn is_ldap(&self) -> bool {
        matches!(self.scheme().as_deref(), Some("ldap" | "ldaps"))
    }
}

impl From<&str> for CrlSourceId {
    fn from(source: &str) -> Self {
        Self::new(source)
    }
}

impl From<String> for CrlSourceId {
    fn from(source: String) -> Self {
        Self::new(source)
    }
}

impl fmt::Display for CrlSourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Certificate serial number in canonical form: unsigned big-endian bytes
/// without leading zero octets (zero itself is a single `0x00`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SerialNumber(Vec<u8>);

impl SerialNumber {
    pub fn from_be_bytes(bytes: &[u8]) -> Self {
        let first = bytes.iter().position(|b| *b != 0);
        match first {
            Some(index) => Self(bytes[index..].to_vec()),
            None => Self(vec![0]),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<u64> for SerialNumber {
    fn from(value: u64) -> Self {
        Self::from_be_bytes(&value.to_be_bytes())
    }
}

impl fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

/// CRL entry reason codes (RFC 5280 §5.3.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevocationReason {
    Unspecified,
    KeyCompromise,
    CaCompromise,
    AffiliationChanged,
    Superseded,
    CessationOfOperation,
    CertificateHold,
    RemoveFromCrl,
    PrivilegeWithdrawn,
    AaCompromise,
}

impl RevocationReason {
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Unspecified),
            1 => Some(Self::KeyCompromise),
            2 => Some(Self::CaCompromise),
            3 => Some(Self::AffiliationChanged),
            4 => Some(Self::Superseded),
            5 => Some(Self::CessationOfOperation),
            6 => Some(Self::CertificateHold),
            // 7 is unused
            8 => Some(Self::RemoveFromCrl),
            9 => Some(Self::PrivilegeWithdrawn),
            10 => Some(Self::AaCompromise),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevokedEntry {
    pub serial: SerialNumber,
    pub revocation_date: OffsetDateTime,
    pub reason: Option<RevocationReason>,
}

/// A parsed Certificate Revocation List. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Crl {
    /// Issuer distinguished name
    pub issuer: String,
    pub this_update: OffsetDateTime,
    pub next_update: Option<OffsetDateTime>,
    revoked: HashMap<SerialNumber, RevokedEntry>,
}

impl Crl {
    pub fn new(
        issuer: impl Into<String>,
        this_update: OffsetDateTime,
        next_update: Option<OffsetDateTime>,
        revoked: impl IntoIterator<Item = RevokedEntry>,
    ) -> Self {
        Self {
            issuer: issuer.into(),
            this_update,
            next_update,
            revoked: revoked
                .into_iter()
                .map(|entry| (entry.serial.clone(), entry))
                .collect(),
        }
    }

    /// A CRL is expired once `now` is past its `nextUpdate`. CRLs without a
    /// `nextUpdate` never expire.
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.next_update.is_some_and(|next_update| now > next_update)
    }

    pub fn revoked_entry(&self, serial: &SerialNumber) -> Option<&RevokedEntry> {
        self.revoked.get(serial)
    }

    pub fn is_revoked(&self, serial: &SerialNumber) -> bool {
        self.revoked.contains_key(serial)
    }

    pub fn revoked_count(&self) -> usize {
        self.revoked.len()
    }
}

#[cfg(test)]
mod tests {
    use time::Duration;

    use super::*;

    #[test]
    fn test_serial_number_is_canonical() {
        assert_eq!(
            SerialNumber::from_be_bytes(&[0x00, 0x00, 0x01, 0x02]),
            SerialNumber::from_be_bytes(&[0x01, 0x02])
        );
        assert_eq!(SerialNumber::from_be_bytes(&[]).as_bytes(), &[0]);
        assert_eq!(SerialNumber::from_be_bytes(&[0, 0]).as_bytes(), &[0]);
        assert_eq!(SerialNumber::from(0x0102u64).to_string(), "0102");
    }

    #[test]
    fn test_source_scheme() {
        assert_eq!(
            CrlSourceId::from("HTTP://ca.example/ca.crl").scheme().as_deref(),
            Some("http")
        );
        assert!(CrlSourceId::from("ldaps://dir.example/cn=CA").is_ldap());
        assert_eq!(CrlSourceId::from("/etc/pki/ca.crl").scheme(), None);
        assert_eq!(CrlSourceId::from("C:\\pki\\ca.crl").scheme(), None);
        assert_eq!(
            CrlSourceId::from("  file:/etc/ca.crl ").as_str(),
            "file:/etc/ca.crl"
        );
    }

    #[test]
    fn test_crl_expiry_and_membership() {
        let now = OffsetDateTime::now_utc();
        let crl = Crl::new(
            "CN=Test CA",
            now - Duration::hours(2),
            Some(now - Duration::hours(1)),
            [RevokedEntry {
                serial: SerialNumber::from(42u64),
                revocation_date: now - Duration::hours(2),
                reason: RevocationReason::from_u8(1),
            }],
        );

        assert!(crl.is_expired(now));
        assert!(!crl.is_expired(now - Duration::hours(1)));
        assert!(crl.is_revoked(&SerialNumber::from_be_bytes(&[0, 42])));
        assert!(!crl.is_revoked(&SerialNumber::from(43u64)));
        assert_eq!(
            crl.revoked_entry(&SerialNumber::from(42u64))
                .and_then(|entry| entry.reason),
            Some(RevocationReason::KeyCompromise)
        );

        let open_ended = Crl::new("CN=Test CA", now, None, []);
        assert!(!open_ended.is_expired(now + Duration::days(365)));
    }
}
