use std::fmt;
use std::time::Duration;

use time::OffsetDateTime;

use crate::pki::crl::types::Crl;

/// How to proceed when revocation status cannot be established from a
/// fresh CRL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevocationPolicy {
    Allow,
    Deny,
    /// Accept an expired CRL for at most `max_age` past its nextUpdate.
    Threshold { max_age: Duration },
}

/// The situation a policy is asked about.
#[derive(Debug, Clone, Copy)]
pub enum PolicyContext<'a> {
    /// No CRL could be obtained
    Unavailable,
    /// A CRL was obtained but its nextUpdate has passed
    Expired { crl: &'a Crl },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyVerdict {
    Permit,
    Deny(String),
}

impl RevocationPolicy {
    pub fn decide(&self, context: &PolicyContext<'_>, now: OffsetDateTime) -> PolicyVerdict {
        match (self, context) {
            (Self::Allow, _) => PolicyVerdict::Permit,
            (Self::Deny, PolicyContext::Unavailable) => {
                PolicyVerdict::Deny("CRL unavailable".to_string())
            }
            (Self::Deny, PolicyContext::Expired { crl }) => {
                PolicyVerdict::Deny(format!("CRL from {} is expired", crl.issuer))
            }
            // Nothing to measure a grace period against
            (Self::Threshold { .. }, PolicyContext::Unavailable) => PolicyVerdict::Deny(
                "CRL unavailable and threshold policy requires an expired CRL".to_string(),
            ),
            (Self::Threshold { max_age }, PolicyContext::Expired { crl }) => {
                let Some(next_update) = crl.next_update else {
                    return PolicyVerdict::Deny(format!(
                        "CRL from {} has no nextUpdate",
                        crl.issuer
                    ));
                };
                let age = now - next_update;
                if age <= *max_age {
                    PolicyVerdict::Permit
                } else {
                    PolicyVerdict::Deny(format!(
                        "CRL from {} expired {}s ago, beyond the {}s threshold",
                        crl.issuer,
                        age.whole_seconds(),
                        max_age.as_secs()
                    ))
                }
            }
        }
    }
}

impl fmt::Display for RevocationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allow => f.write_str("allow"),
            Self::Deny => f.write_str("deny"),
            Self::Threshold { max_age } => write!(f, "threshold({}s)", max_age.as_secs()),
        }
    }
}
