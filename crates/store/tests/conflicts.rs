#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use keel_core::{Error, RawResource, Resource, ResourceKey, ResourceSpec, Result, Version};
use keel_store::{get, modify, update_with_conflicts, MemStore, ResourceStore, RetryPolicy, UpdateOptions};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Counter {
    n: u64,
}

impl ResourceSpec for Counter {
    const KIND: &'static str = "Counter";
}

fn key(id: &str) -> ResourceKey { ResourceKey::of::<Counter>("default", id) }

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_increments_all_land() {
    let st = Arc::new(MemStore::new());
    st.create(Resource::<Counter>::new("default", "c").to_raw().unwrap(), None).await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let st = Arc::clone(&st);
        tasks.push(tokio::spawn(async move {
            let cancel = CancellationToken::new();
            for _ in 0..10 {
                update_with_conflicts::<Counter, Error, _>(
                    &*st,
                    &cancel,
                    &key("c"),
                    &UpdateOptions::default(),
                    RetryPolicy::default(),
                    |r| {
                        r.spec.n += 1;
                        Ok(())
                    },
                )
                .await
                .unwrap();
            }
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }

    let r: Resource<Counter> = get(&*st, &CancellationToken::new(), &key("c")).await.unwrap();
    assert_eq!(r.spec.n, 160);
    assert_eq!(r.metadata.version, Version::new(161));
}

#[tokio::test]
async fn unchanged_mutation_does_not_bump_version() {
    let st = MemStore::new();
    let cancel = CancellationToken::new();
    st.create(Resource::<Counter>::new("default", "c").to_raw().unwrap(), None).await.unwrap();

    let r = update_with_conflicts::<Counter, Error, _>(&st, &cancel, &key("c"), &UpdateOptions::default(), RetryPolicy::default(), |_| Ok(()))
        .await
        .unwrap();
    assert_eq!(r.metadata.version, Version::INITIAL);
}

#[tokio::test]
async fn update_of_missing_resource_is_not_found() {
    let st = MemStore::new();
    let err = update_with_conflicts::<Counter, Error, _>(
        &st,
        &CancellationToken::new(),
        &key("nope"),
        &UpdateOptions::default(),
        RetryPolicy::default(),
        |r| {
            r.spec.n = 1;
            Ok(())
        },
    )
    .await
    .unwrap_err();
    assert!(err.is_not_found(), "err={err}");
}

#[tokio::test]
async fn modify_creates_then_updates_with_owner() {
    let st = MemStore::new();
    let cancel = CancellationToken::new();
    let opts = UpdateOptions::owned_by("counter-ctrl");

    let created = modify::<Counter, Error, _>(&st, &cancel, &key("c"), &opts, RetryPolicy::default(), |r| {
        r.spec.n = 5;
        Ok(())
    })
    .await
    .unwrap();
    assert_eq!(created.metadata.owner.as_deref(), Some("counter-ctrl"));
    assert_eq!(created.spec.n, 5);

    let updated = modify::<Counter, Error, _>(&st, &cancel, &key("c"), &opts, RetryPolicy::default(), |r| {
        r.spec.n = 6;
        Ok(())
    })
    .await
    .unwrap();
    assert_eq!(updated.metadata.version, Version::new(2));

    let foreign = modify::<Counter, Error, _>(&st, &cancel, &key("c"), &UpdateOptions::default(), RetryPolicy::default(), |r| {
        r.spec.n = 7;
        Ok(())
    })
    .await
    .unwrap_err();
    assert!(matches!(foreign, Error::OwnerConflict { .. }), "err={foreign}");
}

#[tokio::test]
async fn cancelled_token_aborts_before_touching_the_store() {
    let st = MemStore::new();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = modify::<Counter, Error, _>(&st, &cancel, &key("c"), &UpdateOptions::default(), RetryPolicy::default(), |r| {
        r.spec.n = 1;
        Ok(())
    })
    .await
    .unwrap_err();
    assert!(err.is_cancelled());
    assert!(st.is_empty());
}

#[tokio::test]
async fn mutation_error_aborts_without_write() {
    let st = MemStore::new();
    let cancel = CancellationToken::new();
    st.create(Resource::<Counter>::new("default", "c").to_raw().unwrap(), None).await.unwrap();

    #[derive(Debug)]
    enum TestErr {
        Store(Error),
        Refused,
    }
    impl From<Error> for TestErr {
        fn from(e: Error) -> Self { TestErr::Store(e) }
    }

    let res = update_with_conflicts::<Counter, TestErr, _>(&st, &cancel, &key("c"), &UpdateOptions::default(), RetryPolicy::default(), |_| {
        Err(TestErr::Refused)
    })
    .await;
    assert!(matches!(res, Err(TestErr::Refused)));
    let raw = st.get(&key("c")).await.unwrap();
    assert_eq!(raw.metadata.version, Version::INITIAL);
    let _ = TestErr::Store(Error::Cancelled);
}

/// Reads from a [`MemStore`] but loses every write race.
struct AlwaysConflicts {
    inner: MemStore,
    updates: AtomicU32,
}

#[async_trait::async_trait]
impl ResourceStore for AlwaysConflicts {
    async fn get(&self, key: &ResourceKey) -> Result<RawResource> { self.inner.get(key).await }

    async fn create(&self, resource: RawResource, owner: Option<&str>) -> Result<RawResource> {
        self.inner.create(resource, owner).await
    }

    async fn update(&self, resource: RawResource, _opts: &UpdateOptions) -> Result<RawResource> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        Err(Error::Conflict { key: resource.key(), expected: resource.metadata.version })
    }

    async fn destroy(&self, key: &ResourceKey, owner: Option<&str>) -> Result<()> { self.inner.destroy(key, owner).await }
}

#[tokio::test]
async fn endless_conflicts_exhaust_the_retry_budget() {
    let st = AlwaysConflicts { inner: MemStore::new(), updates: AtomicU32::new(0) };
    let cancel = CancellationToken::new();
    st.create(Resource::<Counter>::new("default", "c").to_raw().unwrap(), None).await.unwrap();

    let err = update_with_conflicts::<Counter, Error, _>(
        &st,
        &cancel,
        &key("c"),
        &UpdateOptions::default(),
        RetryPolicy { max_attempts: 3 },
        |r| {
            r.spec.n += 1;
            Ok(())
        },
    )
    .await
    .unwrap_err();

    assert!(matches!(err, Error::RetriesExhausted { attempts: 3, .. }), "err={err}");
    assert_eq!(st.updates.load(Ordering::SeqCst), 3);
    let r: Resource<Counter> = get(&st, &cancel, &key("c")).await.unwrap();
    assert_eq!(r.spec.n, 0);
    assert_eq!(r.metadata.version, Version::INITIAL);
}
