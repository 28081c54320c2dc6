//! Speculative metadata fetching. While the engine waits for the metadata of the candidate it
//! actually chose, we warm the metadata cache for candidates it is likely to look at next. The
//! tasks spawned here only read the candidate listing and write into the metadata cache, they
//! never touch resolver state, so the resolution outcome does not depend on them.

use super::provider::DependencyProvider;
use crate::types::{ArtifactInfo, NormalizedPackageName, Version};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

pub(crate) struct Prefetcher {
    provider: Arc<dyn DependencyProvider>,
    permits: Arc<Semaphore>,
    tasks: JoinSet<()>,
    seen: HashSet<(NormalizedPackageName, Version)>,
    enabled: bool,
}

impl Prefetcher {
    pub fn new(provider: Arc<dyn DependencyProvider>, enabled: bool, concurrency: usize) -> Self {
        Self {
            provider,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            tasks: JoinSet::new(),
            seen: HashSet::new(),
            enabled,
        }
    }

    /// Starts a speculative fetch for the given candidate unless one was already started. The
    /// result lands in the metadata cache; failures are logged and otherwise ignored since the
    /// main loop will run into them again if the candidate is ever reached for real.
    pub fn spawn(
        &mut self,
        name: NormalizedPackageName,
        version: Version,
        files: Vec<ArtifactInfo>,
    ) {
        if !self.enabled || !self.seen.insert((name.clone(), version.clone())) {
            return;
        }

        let provider = self.provider.clone();
        let permits = self.permits.clone();
        self.tasks.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            tracing::debug!("speculatively fetching metadata of {name} {version}");
            if let Err(err) = provider.metadata(&name, &version, &files).await {
                tracing::debug!("speculative fetch of {name} {version} failed: {err}");
            }
        });
    }

    /// Cancels the outstanding fetches cooperatively and waits for them to finish.
    pub async fn shutdown(&mut self) {
        self.tasks.shutdown().await;
    }
}
