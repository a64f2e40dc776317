//! Typed, cancellable helpers over [`ResourceStore`], including the conflict-retry loop.

use std::future::Future;

use keel_core::{Error, Resource, ResourceKey, ResourceSpec, Result};
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{ResourceStore, UpdateOptions};

/// Budget for read-modify-write rounds lost to concurrent writers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self { Self { max_attempts: 1024 } }
}

impl RetryPolicy {
    /// `KEEL_UPDATE_MAX_ATTEMPTS` overrides the default budget.
    pub fn from_env() -> Self {
        let max_attempts = std::env::var("KEEL_UPDATE_MAX_ATTEMPTS")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(Self::default().max_attempts);
        Self { max_attempts }
    }
}

/// Run a store call unless `cancel` fires first.
pub async fn guarded<T>(cancel: &CancellationToken, fut: impl Future<Output = Result<T>>) -> Result<T> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        res = fut => res,
    }
}

pub async fn get<S: ResourceSpec>(
    st: &dyn ResourceStore,
    cancel: &CancellationToken,
    key: &ResourceKey,
) -> Result<Resource<S>> {
    let raw = guarded(cancel, st.get(key)).await?;
    Resource::from_raw(raw)
}

/// Like [`get`], with NotFound mapped to `None`.
pub async fn get_opt<S: ResourceSpec>(
    st: &dyn ResourceStore,
    cancel: &CancellationToken,
    key: &ResourceKey,
) -> Result<Option<Resource<S>>> {
    match get(st, cancel, key).await {
        Ok(r) => Ok(Some(r)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Read-modify-write `key` until it commits or fails with something other than a conflict.
///
/// `mutate` may run several times and must only touch the resource it is handed. A mutation
/// that leaves spec and labels unchanged is not written, so the version does not move.
pub async fn update_with_conflicts<S, E, F>(
    st: &dyn ResourceStore,
    cancel: &CancellationToken,
    key: &ResourceKey,
    opts: &UpdateOptions,
    retry: RetryPolicy,
    mutate: F,
) -> Result<Resource<S>, E>
where
    S: ResourceSpec,
    E: From<Error>,
    F: FnMut(&mut Resource<S>) -> Result<(), E>,
{
    write_loop(st, cancel, key, opts, retry, false, mutate).await
}

/// Same as [`update_with_conflicts`], but creates the resource (owned by `opts.owner`)
/// when it does not exist yet.
pub async fn modify<S, E, F>(
    st: &dyn ResourceStore,
    cancel: &CancellationToken,
    key: &ResourceKey,
    opts: &UpdateOptions,
    retry: RetryPolicy,
    mutate: F,
) -> Result<Resource<S>, E>
where
    S: ResourceSpec,
    E: From<Error>,
    F: FnMut(&mut Resource<S>) -> Result<(), E>,
{
    write_loop(st, cancel, key, opts, retry, true, mutate).await
}

async fn write_loop<S, E, F>(
    st: &dyn ResourceStore,
    cancel: &CancellationToken,
    key: &ResourceKey,
    opts: &UpdateOptions,
    retry: RetryPolicy,
    create_missing: bool,
    mut mutate: F,
) -> Result<Resource<S>, E>
where
    S: ResourceSpec,
    E: From<Error>,
    F: FnMut(&mut Resource<S>) -> Result<(), E>,
{
    for attempt in 1..=retry.max_attempts {
        let current = if create_missing {
            get_opt::<S>(st, cancel, key).await?
        } else {
            Some(get::<S>(st, cancel, key).await?)
        };

        let res = match current {
            None => {
                let mut fresh = Resource::<S>::from_key(key.clone())?;
                mutate(&mut fresh)?;
                fresh.metadata = keel_core::Metadata { labels: fresh.metadata.labels, ..keel_core::Metadata::new(key.clone()) };
                guarded(cancel, st.create(fresh.to_raw()?, opts.owner.as_deref())).await
            }
            Some(current) => {
                let mut next = current.clone();
                mutate(&mut next)?;
                if next.spec == current.spec && next.metadata.labels == current.metadata.labels {
                    debug!(key = %key, version = %current.metadata.version, "update is a no-op; skipping write");
                    return Ok(current);
                }
                // Identity and the CAS token always come from what was read.
                next.metadata = keel_core::Metadata { labels: next.metadata.labels, ..current.metadata };
                guarded(cancel, st.update(next.to_raw()?, opts)).await
            }
        };

        match res {
            Ok(raw) => return Ok(Resource::from_raw(raw)?),
            Err(e) if e.is_conflict() => {
                counter!("store_update_conflicts", 1u64);
                debug!(key = %key, attempt, error = %e, "write lost a race; retrying");
                tokio::task::yield_now().await;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(Error::RetriesExhausted { key: key.clone(), attempts: retry.max_attempts }.into())
}
