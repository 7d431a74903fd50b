//! Ensures images are present in the local store before their history is read.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use derive_more::Debug;
use serde::Serialize;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::{
    engine::{EngineError, ImageEngine, ImageMetadata},
    DiffError, Digest, Platform, Reference,
};

/// An image known to be present in the local store.
///
/// Immutable once created; the engine's store decides how long the image itself lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedImage {
    /// The reference the image was resolved from.
    #[serde(serialize_with = "serialize_display")]
    pub reference: Reference,

    /// Content digest identifying the image in the store.
    #[serde(serialize_with = "serialize_display")]
    pub digest: Digest,

    /// When the image was created.
    pub created: Option<String>,

    /// CPU architecture the image targets.
    pub architecture: Option<String>,

    /// Operating system the image targets.
    pub os: Option<String>,
}

impl ResolvedImage {
    /// Pair a reference with the metadata the engine reported for it.
    pub fn new(reference: &Reference, metadata: ImageMetadata) -> Self {
        Self {
            reference: reference.clone(),
            digest: metadata.id,
            created: metadata.created,
            architecture: metadata.architecture,
            os: metadata.os,
        }
    }
}

fn serialize_display<T: std::fmt::Display, S: serde::Serializer>(
    value: &T,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

/// Resolves references to images in the local store, pulling them when missing.
///
/// Resolution is inspect-first: an image already present is never pulled again.
/// Pulls of the same reference are serialized, so concurrent requests for one image
/// result in a single pull.
#[derive(Debug, Clone)]
pub struct Resolver {
    #[debug(skip)]
    engine: Arc<dyn ImageEngine>,

    /// Platform requested when pulling.
    platform: Option<Platform>,

    /// How many times a transient pull failure is retried.
    retries: usize,

    /// Delay before the first retry; doubles for each retry after it.
    backoff: Duration,

    #[debug(skip)]
    locks: PullLocks,
}

impl Resolver {
    /// Retries after the first pull attempt, unless configured otherwise.
    pub const DEFAULT_RETRIES: usize = 2;

    /// Delay before the first retry, unless configured otherwise.
    pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(500);
}

#[bon::bon]
impl Resolver {
    /// Create a resolver backed by the given engine.
    #[builder]
    pub fn new(
        /// The engine that owns the local image store.
        engine: Arc<dyn ImageEngine>,

        /// Platform requested when pulling.
        platform: Option<Platform>,

        /// How many times a transient pull failure is retried.
        #[builder(default = Resolver::DEFAULT_RETRIES)]
        retries: usize,

        /// Delay before the first retry; doubles for each retry after it.
        #[builder(default = Resolver::DEFAULT_BACKOFF)]
        backoff: Duration,
    ) -> Self {
        Self {
            engine,
            platform,
            retries,
            backoff,
            locks: PullLocks::default(),
        }
    }
}

impl Resolver {
    /// Ensure the image is present locally and report its identity.
    #[tracing::instrument(skip(self, reference), fields(%reference))]
    pub async fn resolve(&self, reference: &Reference) -> Result<ResolvedImage, DiffError> {
        if let Some(metadata) = self.inspect(reference).await? {
            debug!(id = %metadata.id, "present locally");
            return Ok(ResolvedImage::new(reference, metadata));
        }

        let guard = Arc::new(self.locks.acquire(reference.to_string()).await);

        // Another request may have pulled the image while this one waited for the lock.
        if let Some(metadata) = self.inspect(reference).await? {
            debug!(id = %metadata.id, "pulled by a concurrent request");
            return Ok(ResolvedImage::new(reference, metadata));
        }

        self.pull(reference, guard).await?;
        match self.inspect(reference).await? {
            Some(metadata) => {
                info!(id = %metadata.id, "pulled");
                Ok(ResolvedImage::new(reference, metadata))
            }
            None => Err(DiffError::NotFound {
                reference: reference.to_string(),
                message: String::from("image is absent after a successful pull"),
            }),
        }
    }

    async fn inspect(&self, reference: &Reference) -> Result<Option<ImageMetadata>, DiffError> {
        self.engine
            .inspect(reference)
            .await
            .map_err(|err| DiffError::internal(format!("inspect {reference}: {err}")))
    }

    /// Pull with bounded retries for transient failures.
    async fn pull(&self, reference: &Reference, guard: Arc<PullGuard>) -> Result<(), DiffError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            info!(attempt, "pulling");

            // The pull runs detached and keeps the lock alive,
            // so a cancelled request never leaves a half-written image behind.
            let engine = Arc::clone(&self.engine);
            let target = reference.clone();
            let platform = self.platform.clone();
            let guard = Arc::clone(&guard);
            let outcome = tokio::spawn(async move {
                let result = engine.pull(&target, platform.as_ref()).await;
                drop(guard);
                result
            })
            .await
            .map_err(|err| DiffError::internal(format!("pull task for {reference}: {err}")))?;

            match outcome {
                Ok(()) => return Ok(()),
                Err(EngineError::NotFound(message)) => {
                    return Err(DiffError::NotFound {
                        reference: reference.to_string(),
                        message,
                    })
                }
                Err(err) if err.is_transient() && attempt <= self.retries => {
                    let delay = self
                        .backoff
                        .saturating_mul(2u32.saturating_pow(attempt as u32 - 1));
                    warn!(attempt, ?delay, %err, "pull failed; retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    return Err(DiffError::PullFailed {
                        reference: reference.to_string(),
                        attempts: attempt,
                        message: err.to_string(),
                    })
                }
            }
        }
    }
}

/// Fair per-reference locks; entries are reclaimed once nobody holds or awaits them.
#[derive(Clone, Default)]
struct PullLocks(Arc<Mutex<HashMap<String, LockEntry>>>);

#[derive(Default)]
struct LockEntry {
    lock: Arc<tokio::sync::Mutex<()>>,

    /// Holders and waiters, including waiters whose request is later cancelled.
    users: usize,
}

impl PullLocks {
    async fn acquire(&self, key: String) -> PullGuard {
        let user = self.register(key);
        let guard = Arc::clone(&user.lock).lock_owned().await;
        PullGuard {
            _guard: guard,
            _user: user,
        }
    }

    fn register(&self, key: String) -> LockUser {
        let mut entries = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.entry(key.clone()).or_default();
        entry.users += 1;
        LockUser {
            lock: Arc::clone(&entry.lock),
            key,
            locks: self.clone(),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Counts as a user of a key's lock from registration until dropped,
/// whether or not the lock was ever acquired.
struct LockUser {
    lock: Arc<tokio::sync::Mutex<()>>,
    key: String,
    locks: PullLocks,
}

impl Drop for LockUser {
    fn drop(&mut self) {
        let mut entries = self.locks.0.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get_mut(&self.key) {
            entry.users = entry.users.saturating_sub(1);
            if entry.users == 0 {
                entries.remove(&self.key);
            }
        }
    }
}

/// Fields drop in order: the lock is released before the entry can be reclaimed.
struct PullGuard {
    _guard: OwnedMutexGuard<()>,
    _user: LockUser,
}
