use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tracing::{debug, info};

use crate::config::{CacheConfig, CheckerKind, FetcherKind, PolicyKind, RevocationConfig};
use crate::pki::certificate::ClientCertificate;
use crate::pki::crl::cache::{CacheExpiry, CacheSettings, CrlCache};
use crate::pki::crl::errors::{CheckerResult, RevocationError};
use crate::pki::crl::fetcher::{CrlFetcher, ResourceCrlFetcher};
use crate::pki::crl::ldap::LdapCrlFetcher;
use crate::pki::crl::scheduler::{CrlRefresher, RefresherHandle};
use crate::pki::crl::types::CrlSourceId;
use crate::pki::revocation::{
    CheckerOptions, CrlChecker, RevocationChecker, RevocationPolicy, RevocationResult,
};

/// Assembles a ready-to-use checker from a configuration snapshot.
///
/// The static resource checker also gets a refresher; it is returned
/// unstarted so the caller decides when background work begins.
pub fn build_checker(
    config: &RevocationConfig,
) -> CheckerResult<(RevocationChecker, Option<CrlRefresher>)> {
    config.validate()?;

    if config.checker == CheckerKind::NoOp {
        info!("Revocation checking disabled");
        return Ok((RevocationChecker::NoOp, None));
    }

    let fetcher = build_fetcher(config)?;
    let cache = CrlCache::new(fetcher, cache_settings(&config.cache));
    let options = CheckerOptions {
        check_all: config.check_all,
        throw_on_fetch_failure: config.throw_on_fetch_failure,
        unavailable_policy: policy(config.unavailable_policy, config.threshold()),
        expired_policy: policy(config.expired_policy, config.threshold()),
        check_timeout: config.check_timeout(),
    };
    debug!("Revocation checker options: {:?}", options);
    let checker = CrlChecker::new(cache.clone(), options);

    match config.checker {
        CheckerKind::StaticResource => {
            let resources: Vec<CrlSourceId> = config
                .crl_resources
                .iter()
                .map(CrlSourceId::new)
                .collect();
            info!(
                "Using static CRL resources: {}",
                config.crl_resources.join(", ")
            );
            let refresher =
                CrlRefresher::new(cache, resources.clone(), config.refresh_interval());
            Ok((
                RevocationChecker::StaticResource { checker, resources },
                Some(refresher),
            ))
        }
        _ => {
            info!("Using CRL distribution points from client certificates");
            Ok((RevocationChecker::DistributionPoint(checker), None))
        }
    }
}

fn build_fetcher(config: &RevocationConfig) -> CheckerResult<Arc<dyn CrlFetcher>> {
    match (config.fetcher, &config.ldap) {
        (FetcherKind::Ldap, Some(ldap)) => {
            info!("Fetching CRLs via LDAP with resource fallback");
            Ok(Arc::new(LdapCrlFetcher::new(
                ldap.clone(),
                config.fetch_timeout(),
                config.max_crl_size_bytes,
            )?))
        }
        (FetcherKind::Ldap, None) => Err(RevocationError::Config(
            "the ldap fetcher requires an ldap section".to_string(),
        )),
        (FetcherKind::Resource, _) => Ok(Arc::new(ResourceCrlFetcher::with_max_size(
            config.fetch_timeout(),
            config.max_crl_size_bytes,
        )?)),
    }
}

fn cache_settings(config: &CacheConfig) -> CacheSettings {
    let enabled = |seconds: u64| (seconds > 0).then(|| Duration::from_secs(seconds));
    CacheSettings {
        expiry: CacheExpiry {
            time_to_live: enabled(config.ttl_seconds),
            time_to_idle: enabled(config.tti_seconds),
        },
        max_entries: (config.max_entries > 0).then_some(config.max_entries),
    }
}

fn policy(kind: PolicyKind, threshold: Duration) -> RevocationPolicy {
    match kind {
        PolicyKind::Allow => RevocationPolicy::Allow,
        PolicyKind::Deny => RevocationPolicy::Deny,
        PolicyKind::Threshold => RevocationPolicy::Threshold { max_age: threshold },
    }
}

/// A checker together with the background work it owns.
pub struct ActiveChecker {
    pub checker: RevocationChecker,
    _refresher: Option<RefresherHandle>,
}

/// Shared entry point for revocation checks that supports swapping the whole
/// configuration at runtime.
///
/// Checks already running keep the checker they started with; the replaced
/// checker's refresher stops once the last of them finishes.
pub struct RevocationService {
    active: ArcSwap<ActiveChecker>,
}

impl RevocationService {
    /// Must be called inside a Tokio runtime when the configuration starts a
    /// refresher.
    pub fn start(config: &RevocationConfig) -> CheckerResult<Self> {
        Ok(Self {
            active: ArcSwap::from_pointee(activate(config)?),
        })
    }

    pub fn current(&self) -> Arc<ActiveChecker> {
        self.active.load_full()
    }

    pub async fn check(&self, cert: &ClientCertificate) -> CheckerResult<RevocationResult> {
        let active = self.current();
        active.checker.check(cert).await
    }

    pub async fn check_chain(
        &self,
        chain: &[ClientCertificate],
    ) -> CheckerResult<RevocationResult> {
        let active = self.current();
        active.checker.check_chain(chain).await
    }

    /// Builds a checker from `config` and makes it the active one. On error
    /// the previous checker stays active.
    pub fn reload(&self, config: &RevocationConfig) -> CheckerResult<()> {
        let next = activate(config)?;
        info!("Reloaded revocation checker: {}", next.checker.name());
        self.active.store(Arc::new(next));
        Ok(())
    }
}

fn activate(config: &RevocationConfig) -> CheckerResult<ActiveChecker> {
    let (checker, refresher) = build_checker(config)?;
    Ok(ActiveChecker {
        checker,
        _refresher: refresher.map(CrlRefresher::start),
    })
}
