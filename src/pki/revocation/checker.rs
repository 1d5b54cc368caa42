use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use time::OffsetDateTime;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, instrument, warn};

use crate::pki::certificate::ClientCertificate;
use crate::pki::crl::cache::CrlCache;
use crate::pki::crl::errors::{CheckerResult, FetchError, RevocationError};
use crate::pki::crl::parser::is_supported_crl_url;
use crate::pki::crl::types::{Crl, CrlSourceId, RevocationReason, SerialNumber};

use super::policy::{PolicyContext, PolicyVerdict, RevocationPolicy};

/// Outcome of a revocation check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevocationResult {
    Valid,
    Revoked {
        serial: SerialNumber,
        crl_issuer: String,
        reason: Option<RevocationReason>,
    },
    /// Status could not be established but a policy let the certificate through
    PolicyBypassed { reason: String },
    /// Status could not be established and a policy rejected the certificate
    PolicyDenied { reason: String },
}

impl RevocationResult {
    pub fn permits_authentication(&self) -> bool {
        matches!(self, Self::Valid | Self::PolicyBypassed { .. })
    }
}

/// Knobs shared by every CRL-backed checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckerOptions {
    pub check_all: bool,
    pub throw_on_fetch_failure: bool,
    pub unavailable_policy: RevocationPolicy,
    pub expired_policy: RevocationPolicy,
    /// Deadline for one whole check, across all sources
    pub check_timeout: Option<Duration>,
}

impl Default for CheckerOptions {
    fn default() -> Self {
        Self {
            check_all: false,
            throw_on_fetch_failure: false,
            unavailable_policy: RevocationPolicy::Deny,
            expired_policy: RevocationPolicy::Deny,
            check_timeout: None,
        }
    }
}

/// What one CRL source says about a certificate.
enum SourceVerdict {
    Revoked(RevocationResult),
    Denied(String),
    NotRevoked { bypass: Option<String> },
    /// The CRL belongs to another issuer
    NotApplicable,
}

/// Evaluates certificates against CRLs obtained through a shared cache.
#[derive(Clone)]
pub struct CrlChecker {
    cache: CrlCache,
    options: CheckerOptions,
}

impl CrlChecker {
    pub fn new(cache: CrlCache, options: CheckerOptions) -> Self {
        Self { cache, options }
    }

    pub fn cache(&self) -> &CrlCache {
        &self.cache
    }

    pub fn options(&self) -> &CheckerOptions {
        &self.options
    }

    async fn lookup(
        &self,
        source: &CrlSourceId,
        deadline: Option<Instant>,
    ) -> Result<Arc<Crl>, FetchError> {
        match deadline {
            Some(deadline) => timeout_at(deadline, self.cache.get_or_fetch(source))
                .await
                .unwrap_or_else(|_| Err(FetchError::Timeout(source.to_string()))),
            None => self.cache.get_or_fetch(source).await,
        }
    }

    /// Runs the freshness and serial checks against one CRL.
    fn judge(
        &self,
        cert: &ClientCertificate,
        source: &CrlSourceId,
        crl: &Crl,
        match_issuer: bool,
        now: OffsetDateTime,
    ) -> SourceVerdict {
        if match_issuer && crl.issuer != cert.issuer {
            debug!(
                "Skipping CRL from {} issued by {}, certificate issuer is {}",
                source, crl.issuer, cert.issuer
            );
            return SourceVerdict::NotApplicable;
        }

        let mut bypass = None;
        if crl.is_expired(now) {
            match self
                .options
                .expired_policy
                .decide(&PolicyContext::Expired { crl }, now)
            {
                PolicyVerdict::Deny(reason) => {
                    warn!("Rejecting certificate {}: {}", cert.serial, reason);
                    return SourceVerdict::Denied(reason);
                }
                PolicyVerdict::Permit => {
                    warn!(
                        "Accepting expired CRL from {} under {} policy",
                        source, self.options.expired_policy
                    );
                    bypass = Some(format!(
                        "expired CRL from {} accepted by {} policy",
                        source, self.options.expired_policy
                    ));
                }
            }
        }

        if let Some(entry) = crl.revoked_entry(&cert.serial) {
            warn!(
                "Certificate {} ({}) is revoked according to CRL from {}",
                cert.serial, cert.subject, source
            );
            return SourceVerdict::Revoked(RevocationResult::Revoked {
                serial: cert.serial.clone(),
                crl_issuer: crl.issuer.clone(),
                reason: entry.reason,
            });
        }

        debug!("Certificate {} not listed in CRL from {}", cert.serial, source);
        SourceVerdict::NotRevoked { bypass }
    }

    /// Resolves a check for which no CRL could be used.
    fn unavailable(
        &self,
        cert: &ClientCertificate,
        failures: Vec<(CrlSourceId, FetchError)>,
        cause: String,
        now: OffsetDateTime,
    ) -> CheckerResult<RevocationResult> {
        if self.options.throw_on_fetch_failure && !failures.is_empty() {
            return Err(RevocationError::FetchFailed(failures));
        }

        match self
            .options
            .unavailable_policy
            .decide(&PolicyContext::Unavailable, now)
        {
            PolicyVerdict::Permit => {
                warn!(
                    "Accepting certificate {} under {} policy: {}",
                    cert.serial, self.options.unavailable_policy, cause
                );
                Ok(RevocationResult::PolicyBypassed {
                    reason: format!(
                        "{cause}; accepted by {} policy",
                        self.options.unavailable_policy
                    ),
                })
            }
            PolicyVerdict::Deny(reason) => {
                warn!("Rejecting certificate {}: {}: {}", cert.serial, cause, reason);
                Ok(RevocationResult::PolicyDenied {
                    reason: format!("{cause}; {reason}"),
                })
            }
        }
    }

    /// Checks `cert` against `sources`. With `match_issuer`, CRLs issued by
    /// someone other than the certificate's issuer are ignored.
    async fn evaluate(
        &self,
        cert: &ClientCertificate,
        sources: &[CrlSourceId],
        match_issuer: bool,
        now: OffsetDateTime,
    ) -> CheckerResult<RevocationResult> {
        if sources.is_empty() {
            return self.unavailable(
                cert,
                Vec::new(),
                "no CRL sources for certificate".to_string(),
                now,
            );
        }

        let deadline = self.options.check_timeout.map(|limit| Instant::now() + limit);

        if self.options.check_all {
            self.evaluate_all(cert, sources, match_issuer, deadline, now)
                .await
        } else {
            self.evaluate_first(cert, sources, match_issuer, deadline, now)
                .await
        }
    }

    async fn evaluate_first(
        &self,
        cert: &ClientCertificate,
        sources: &[CrlSourceId],
        match_issuer: bool,
        deadline: Option<Instant>,
        now: OffsetDateTime,
    ) -> CheckerResult<RevocationResult> {
        let mut failures = Vec::new();

        for source in sources {
            let crl = match self.lookup(source, deadline).await {
                Ok(crl) => crl,
                Err(e) => {
                    warn!("CRL source {} failed: {}", source, e);
                    failures.push((source.clone(), e));
                    continue;
                }
            };

            match self.judge(cert, source, &crl, match_issuer, now) {
                SourceVerdict::NotApplicable => continue,
                SourceVerdict::Revoked(result) => return Ok(result),
                SourceVerdict::Denied(reason) => {
                    return Ok(RevocationResult::PolicyDenied { reason });
                }
                SourceVerdict::NotRevoked { bypass: None } => return Ok(RevocationResult::Valid),
                SourceVerdict::NotRevoked {
                    bypass: Some(reason),
                } => return Ok(RevocationResult::PolicyBypassed { reason }),
            }
        }

        let cause = if failures.is_empty() {
            "no applicable CRL for certificate issuer".to_string()
        } else {
            format!("all {} CRL source(s) failed", failures.len())
        };
        self.unavailable(cert, failures, cause, now)
    }

    async fn evaluate_all(
        &self,
        cert: &ClientCertificate,
        sources: &[CrlSourceId],
        match_issuer: bool,
        deadline: Option<Instant>,
        now: OffsetDateTime,
    ) -> CheckerResult<RevocationResult> {
        let lookups = join_all(sources.iter().map(|source| self.lookup(source, deadline))).await;

        let mut failures = Vec::new();
        let mut denied = None;
        let mut bypass = None;
        let mut applicable = 0;

        for (source, lookup) in sources.iter().zip(lookups) {
            let crl = match lookup {
                Ok(crl) => crl,
                Err(e) => {
                    warn!("CRL source {} failed: {}", source, e);
                    failures.push((source.clone(), e));
                    continue;
                }
            };

            match self.judge(cert, source, &crl, match_issuer, now) {
                SourceVerdict::Revoked(result) => return Ok(result),
                SourceVerdict::NotApplicable => {}
                SourceVerdict::Denied(reason) => {
                    applicable += 1;
                    denied.get_or_insert(reason);
                }
                SourceVerdict::NotRevoked { bypass: accepted } => {
                    applicable += 1;
                    if bypass.is_none() {
                        bypass = accepted;
                    }
                }
            }
        }

        if let Some(reason) = denied {
            return Ok(RevocationResult::PolicyDenied { reason });
        }

        if !failures.is_empty() {
            let cause = format!(
                "{} of {} CRL source(s) failed",
                failures.len(),
                sources.len()
            );
            return self.unavailable(cert, failures, cause, now);
        }

        if applicable == 0 {
            return self.unavailable(
                cert,
                failures,
                "no applicable CRL for certificate issuer".to_string(),
                now,
            );
        }

        Ok(match bypass {
            Some(reason) => RevocationResult::PolicyBypassed { reason },
            None => RevocationResult::Valid,
        })
    }
}

/// The configured revocation strategy.
#[derive(Clone)]
pub enum RevocationChecker {
    /// Revocation checking disabled
    NoOp,
    /// CRLs named by the certificate's distribution point extension
    DistributionPoint(CrlChecker),
    /// A fixed list of CRL resources, matched by issuer
    StaticResource {
        checker: CrlChecker,
        resources: Vec<CrlSourceId>,
    },
}

impl RevocationChecker {
    pub fn name(&self) -> &'static str {
        match self {
            Self::NoOp => "none",
            Self::DistributionPoint(_) => "crl",
            Self::StaticResource { .. } => "resource",
        }
    }

    pub fn cache(&self) -> Option<&CrlCache> {
        match self {
            Self::NoOp => None,
            Self::DistributionPoint(checker) | Self::StaticResource { checker, .. } => {
                Some(checker.cache())
            }
        }
    }

    pub async fn check(&self, cert: &ClientCertificate) -> CheckerResult<RevocationResult> {
        self.check_at(cert, OffsetDateTime::now_utc()).await
    }

    /// Like [`check`](Self::check) with an explicit notion of "now" for CRL
    /// freshness and threshold decisions.
    #[instrument(skip_all, fields(checker = self.name(), serial = %cert.serial, subject = %cert.subject))]
    pub async fn check_at(
        &self,
        cert: &ClientCertificate,
        now: OffsetDateTime,
    ) -> CheckerResult<RevocationResult> {
        let result = match self {
            Self::NoOp => {
                debug!("Revocation checking disabled");
                Ok(RevocationResult::Valid)
            }
            Self::DistributionPoint(checker) => {
                let sources = distribution_point_sources(cert);
                if sources.is_empty() {
                    warn!("No CRL distribution points found in certificate");
                }
                checker.evaluate(cert, &sources, false, now).await
            }
            Self::StaticResource { checker, resources } => {
                checker.evaluate(cert, resources, true, now).await
            }
        };

        if let Ok(outcome) = &result {
            info!("Revocation check result: {:?}", outcome);
        }
        result
    }

    /// Checks each certificate of a chain in order. The first result that
    /// does not permit authentication, or the first error, ends the check.
    pub async fn check_chain(
        &self,
        chain: &[ClientCertificate],
    ) -> CheckerResult<RevocationResult> {
        if chain.is_empty() {
            return Err(RevocationError::Certificate(
                "empty certificate chain".to_string(),
            ));
        }

        let now = OffsetDateTime::now_utc();
        let mut bypassed = None;
        for cert in chain {
            match self.check_at(cert, now).await? {
                RevocationResult::Valid => {}
                RevocationResult::PolicyBypassed { reason } => {
                    bypassed.get_or_insert(reason);
                }
                rejected => return Ok(rejected),
            }
        }

        Ok(match bypassed {
            Some(reason) => RevocationResult::PolicyBypassed { reason },
            None => RevocationResult::Valid,
        })
    }
}

fn distribution_point_sources(cert: &ClientCertificate) -> Vec<CrlSourceId> {
    let mut sources: Vec<CrlSourceId> = Vec::with_capacity(cert.distribution_points.len());
    for url in &cert.distribution_points {
        if !is_supported_crl_url(url) {
            debug!("Ignoring unsupported CRL distribution point: {}", url);
            continue;
        }
        let source = CrlSourceId::from(url.as_str());
        if !sources.contains(&source) {
            sources.push(source);
        }
    }
    sources
}

#[cfg(test)]
mod tests {
    use crate::pki::crl::cache::CacheSettings;
    use crate::pki::crl::fetcher::MockCrlFetcher;

    use super::*;

    fn checker(options: CheckerOptions) -> CrlChecker {
        let mut fetcher = MockCrlFetcher::new();
        fetcher.expect_fetch().never();
        CrlChecker::new(
            CrlCache::new(Arc::new(fetcher), CacheSettings::default()),
            options,
        )
    }

    fn certificate(distribution_points: &[&str]) -> ClientCertificate {
        ClientCertificate::new(
            SerialNumber::from(1u64),
            "CN=alice",
            "CN=Test CA",
            distribution_points.iter().map(|dp| dp.to_string()).collect(),
        )
    }

    #[test]
    fn test_permits_authentication() {
        assert!(RevocationResult::Valid.permits_authentication());
        assert!(
            RevocationResult::PolicyBypassed {
                reason: String::new()
            }
            .permits_authentication()
        );
        assert!(
            !RevocationResult::PolicyDenied {
                reason: String::new()
            }
            .permits_authentication()
        );
        assert!(
            !RevocationResult::Revoked {
                serial: SerialNumber::from(1u64),
                crl_issuer: "CN=Test CA".to_string(),
                reason: None,
            }
            .permits_authentication()
        );
    }

    #[tokio::test]
    async fn test_missing_distribution_points_use_unavailable_policy() {
        let deny = RevocationChecker::DistributionPoint(checker(CheckerOptions::default()));
        let allow = RevocationChecker::DistributionPoint(checker(CheckerOptions {
            unavailable_policy: RevocationPolicy::Allow,
            // Not a fetch failure, so never fatal
            throw_on_fetch_failure: true,
            ..CheckerOptions::default()
        }));
        let cert = certificate(&[]);

        assert!(matches!(
            deny.check(&cert).await.unwrap(),
            RevocationResult::PolicyDenied { .. }
        ));
        assert!(matches!(
            allow.check(&cert).await.unwrap(),
            RevocationResult::PolicyBypassed { .. }
        ));
    }

    #[test]
    fn test_distribution_points_are_filtered_and_deduplicated() {
        let cert = certificate(&[
            "file:///etc/passwd",
            "http://crl.example.com/ca.crl",
            "http://crl.example.com/ca.crl",
            "ldap://dir.example.com/cn=CA",
        ]);

        let sources = distribution_point_sources(&cert);

        assert_eq!(
            sources,
            vec![
                CrlSourceId::from("http://crl.example.com/ca.crl"),
                CrlSourceId::from("ldap://dir.example.com/cn=CA"),
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_chain_is_an_error() {
        let checker = RevocationChecker::NoOp;

        assert!(matches!(
            checker.check_chain(&[]).await,
            Err(RevocationError::Certificate(_))
        ));
    }
}
