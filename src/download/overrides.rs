// src/download/overrides.rs

//! Per-repository download URL overrides
//!
//! Some repositories hand out archive URLs on request (paid packages,
//! signed links). Providers registered for a repository are asked in
//! registration order; the first one that does not decline decides.

use crate::catalog::Repository;
use crate::concurrent::{SafeMap, SerialQueue};
use crate::packages::Package;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;
use url::Url;

/// Answer of an override provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverrideDecision {
    /// Not handled here; ask the next provider
    Decline,
    Url(Url),
    /// Handled, but the package cannot be downloaded
    Fail(String),
}

pub trait DownloadOverrideProvider: Send + Sync {
    fn download_url(&self, package: &Package, repo: &Repository) -> OverrideDecision;
}

/// Identifies one registration, for deregistration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OverrideToken(u64);

type Registration = (OverrideToken, Arc<dyn DownloadOverrideProvider>);

pub(crate) struct OverrideRegistry {
    providers: SafeMap<String, Vec<Registration>>,
    next_token: AtomicU64,
}

impl OverrideRegistry {
    pub(crate) fn new(queue: &SerialQueue) -> Self {
        Self {
            providers: SafeMap::new(queue),
            next_token: AtomicU64::new(1),
        }
    }

    pub(crate) fn register(
        &self,
        provider: Arc<dyn DownloadOverrideProvider>,
        repo_url: &Url,
    ) -> OverrideToken {
        let token = OverrideToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let key = repo_url.to_string();
        debug!("Registering download override {:?} for {}", token, key);
        self.providers.with_mut(move |map| {
            map.entry(key).or_default().push((token, provider));
        });
        token
    }

    pub(crate) fn deregister(&self, token: OverrideToken) {
        self.providers.with_mut(move |map| {
            for registrations in map.values_mut() {
                registrations.retain(|(t, _)| *t != token);
            }
            map.retain(|_, registrations| !registrations.is_empty());
        });
    }

    /// First non-declining decision, or `Decline` if every provider declined
    pub(crate) fn decide(&self, package: &Package, repo: &Repository) -> OverrideDecision {
        let providers = self
            .providers
            .get(&repo.url.to_string())
            .unwrap_or_default();

        for (token, provider) in providers {
            match provider.download_url(package, repo) {
                OverrideDecision::Decline => continue,
                decision => {
                    debug!("Override {:?} decided for {}: {:?}", token, package.id, decision);
                    return decision;
                }
            }
        }
        OverrideDecision::Decline
    }
}
