//! Batched cache warm-up.
//!
//! - Identities are normalized and de-duplicated; invalid ones count as failed
//! - Identities with a live cache entry are skipped
//! - The rest run `batch_size` at a time, `batch_delay` apart (no delay after
//!   the last batch)
//! - A failed fetch is logged and never stops the rest of the batch

use std::collections::HashSet;
use std::future::Future;

use tokio::task::JoinSet;

use crate::cache::ProfileCache;
use crate::error::ProfileError;
use crate::types::{CustomerProfile, PrefetchConfig};
use crate::util;

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrefetchReport {
    pub requested: usize,
    pub skipped: usize,
    pub fetched: usize,
    pub failed: usize,
}

pub async fn prefetch<F, Fut>(
    cache: &ProfileCache,
    identities: &[String],
    config: &PrefetchConfig,
    fetch: F,
) -> PrefetchReport
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<CustomerProfile, ProfileError>> + Send + 'static,
{
    let mut report = PrefetchReport {
        requested: identities.len(),
        ..PrefetchReport::default()
    };

    let mut seen = HashSet::new();
    let mut pending = Vec::new();
    for identity in identities {
        let key = match util::validate_identity(identity) {
            Ok(key) => key,
            Err(e) => {
                log::warn!("Prefetch: skipping {identity}: {e}");
                report.failed += 1;
                continue;
            }
        };
        if !seen.insert(key.clone()) {
            continue;
        }
        if cache.has(&key) {
            report.skipped += 1;
            continue;
        }
        pending.push(key);
    }

    let batch_size = config.batch_size.max(1);
    let batches: Vec<&[String]> = pending.chunks(batch_size).collect();
    let total = batches.len();

    for (index, batch) in batches.into_iter().enumerate() {
        let mut set = JoinSet::new();
        for key in batch {
            let work = fetch(key.clone());
            let key = key.clone();
            set.spawn(async move { (key, work.await) });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((key, Ok(profile))) => {
                    cache.set(&key, profile);
                    report.fetched += 1;
                }
                Ok((key, Err(e))) => {
                    log::warn!("Prefetch failed for {key}: {e}");
                    report.failed += 1;
                }
                Err(e) => {
                    log::warn!("Prefetch task ended abnormally: {e}");
                    report.failed += 1;
                }
            }
        }

        if index + 1 < total {
            tokio::time::sleep(config.batch_delay()).await;
        }
    }

    log::info!(
        "Prefetch complete: {} requested, {} fetched, {} skipped, {} failed",
        report.requested,
        report.fetched,
        report.skipped,
        report.failed
    );
    report
}
