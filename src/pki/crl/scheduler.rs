use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::cache::CrlCache;
use super::types::CrlSourceId;

/// Periodically re-fetches the statically configured CRL resources so checks
/// rarely pay for a fetch themselves.
#[derive(Clone)]
pub struct CrlRefresher {
    cache: CrlCache,
    resources: Vec<CrlSourceId>,
    refresh_interval: Duration,
}

impl CrlRefresher {
    pub fn new(cache: CrlCache, resources: Vec<CrlSourceId>, refresh_interval: Duration) -> Self {
        Self {
            cache,
            resources,
            refresh_interval,
        }
    }

    /// Refresh every resource once. Returns how many succeeded; failures are
    /// logged only.
    pub async fn refresh_all(&self) -> usize {
        if self.resources.is_empty() {
            warn!("No CRL resources configured");
            return 0;
        }

        let results = join_all(
            self.resources
                .iter()
                .map(|source| async move { (source, self.cache.refresh(source).await) }),
        )
        .await;

        let mut refreshed = 0;
        for (source, result) in results {
            match result {
                Ok(crl) => {
                    debug!(
                        "Refreshed CRL from {} (issuer {}, {} revoked)",
                        source,
                        crl.issuer,
                        crl.revoked_count()
                    );
                    refreshed += 1;
                }
                Err(e) => error!("Scheduled CRL refresh from {} failed: {}", source, e),
            }
        }
        refreshed
    }

    /// Spawns the refresh loop. The first refresh runs immediately.
    pub fn start(self) -> RefresherHandle {
        let token = CancellationToken::new();
        let stop = token.clone();

        info!(
            "Starting CRL refresher for {} resource(s) every {} seconds",
            self.resources.len(),
            self.refresh_interval.as_secs()
        );

        let task = tokio::spawn(async move {
            let mut ticker = interval(self.refresh_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        debug!("Running scheduled CRL refresh");
                        let refreshed = tokio::select! {
                            _ = stop.cancelled() => break,
                            refreshed = self.refresh_all() => refreshed,
                        };
                        info!(
                            "Scheduled CRL refresh: {}/{} resources refreshed",
                            refreshed,
                            self.resources.len()
                        );
                    }
                }
            }

            info!("CRL refresher stopped");
        });

        RefresherHandle { token, task }
    }
}

/// Stops the refresher when shut down or dropped.
pub struct RefresherHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl RefresherHandle {
    pub async fn shutdown(mut self) {
        self.token.cancel();
        if let Err(e) = (&mut self.task).await {
            warn!("CRL refresher task ended abnormally: {}", e);
        }
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for RefresherHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
