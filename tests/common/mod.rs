#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rcgen::{
    BasicConstraints, CertificateParams, CertificateRevocationListParams, CrlDistributionPoint,
    DnType, IsCa, Issuer, KeyIdMethod, KeyPair, KeyUsagePurpose, RevokedCertParams,
};
use time::OffsetDateTime;
use x509_revocation::pki::certificate::ClientCertificate;
use x509_revocation::pki::crl::{
    CacheExpiry, CacheSettings, CrlCache, CrlFetcher, CrlSourceId, FetchError,
};
use x509_revocation::pki::revocation::{CheckerOptions, CrlChecker};

/// A throwaway certificate authority that issues leaf certificates and CRLs.
pub struct TestCa {
    issuer: Issuer<'static, KeyPair>,
}

impl TestCa {
    pub fn new(common_name: &str) -> Self {
        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, common_name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        let key_pair = KeyPair::generate().unwrap();
        Self {
            issuer: Issuer::new(params, key_pair),
        }
    }

    pub fn leaf(&self, serial: u64, distribution_points: &[&str]) -> ClientCertificate {
        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, format!("client {serial}"));
        params.serial_number = Some(rcgen::SerialNumber::from(serial));
        if !distribution_points.is_empty() {
            params.crl_distribution_points = vec![CrlDistributionPoint {
                uris: distribution_points.iter().map(|dp| dp.to_string()).collect(),
            }];
        }
        let key_pair = KeyPair::generate().unwrap();
        let cert = params.signed_by(&key_pair, &self.issuer).unwrap();
        ClientCertificate::from_der(cert.der()).unwrap()
    }

    pub fn crl(
        &self,
        revoked: &[u64],
        this_update: OffsetDateTime,
        next_update: OffsetDateTime,
    ) -> Vec<u8> {
        CertificateRevocationListParams {
            this_update,
            next_update,
            crl_number: rcgen::SerialNumber::from(1u64),
            issuing_distribution_point: None,
            revoked_certs: revoked
                .iter()
                .map(|serial| RevokedCertParams {
                    serial_number: rcgen::SerialNumber::from(*serial),
                    revocation_time: this_update,
                    reason_code: Some(rcgen::RevocationReason::KeyCompromise),
                    invalidity_date: None,
                })
                .collect(),
            key_identifier_method: KeyIdMethod::Sha256,
        }
        .signed_by(&self.issuer)
        .unwrap()
        .der()
        .to_vec()
    }

    /// A CRL valid from an hour ago until a day from now.
    pub fn fresh_crl(&self, revoked: &[u64]) -> Vec<u8> {
        let now = OffsetDateTime::now_utc();
        self.crl(
            revoked,
            now - time::Duration::hours(1),
            now + time::Duration::days(1),
        )
    }

    /// A CRL whose nextUpdate passed `hours_ago` hours ago.
    pub fn expired_crl(&self, revoked: &[u64], hours_ago: i64) -> Vec<u8> {
        let next_update = OffsetDateTime::now_utc() - time::Duration::hours(hours_ago);
        self.crl(revoked, next_update - time::Duration::days(7), next_update)
    }
}

/// Canned fetcher that counts invocations per source and can simulate a
/// slow network.
#[derive(Default)]
pub struct StubFetcher {
    responses: Mutex<HashMap<CrlSourceId, Result<Vec<u8>, FetchError>>>,
    calls: Mutex<HashMap<CrlSourceId, usize>>,
    total: AtomicUsize,
    delay: Option<Duration>,
}

impl StubFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn serve(&self, source: &str, crl: Vec<u8>) {
        self.responses
            .lock()
            .unwrap()
            .insert(CrlSourceId::from(source), Ok(crl));
    }

    pub fn fail(&self, source: &str, error: FetchError) {
        self.responses
            .lock()
            .unwrap()
            .insert(CrlSourceId::from(source), Err(error));
    }

    pub fn calls(&self, source: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(&CrlSourceId::from(source))
            .copied()
            .unwrap_or_default()
    }

    pub fn total_calls(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CrlFetcher for StubFetcher {
    async fn fetch(&self, source: &CrlSourceId) -> Result<Vec<u8>, FetchError> {
        self.total.fetch_add(1, Ordering::SeqCst);
        *self
            .calls
            .lock()
            .unwrap()
            .entry(source.clone())
            .or_default() += 1;

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        self.responses
            .lock()
            .unwrap()
            .get(source)
            .cloned()
            .unwrap_or_else(|| Err(FetchError::NotFound(source.to_string())))
    }
}

pub fn cache(fetcher: &Arc<StubFetcher>, ttl: Option<Duration>, tti: Option<Duration>) -> CrlCache {
    CrlCache::new(
        fetcher.clone(),
        CacheSettings {
            expiry: CacheExpiry {
                time_to_live: ttl,
                time_to_idle: tti,
            },
            max_entries: None,
        },
    )
}

pub fn crl_checker(fetcher: &Arc<StubFetcher>, options: CheckerOptions) -> CrlChecker {
    CrlChecker::new(cache(fetcher, Some(Duration::from_secs(3600)), None), options)
}
