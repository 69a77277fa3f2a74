use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use tempfile::TempDir;
use upath_core::multiplexer;
use upath_core::{BlobStore, DistributedLock, LockConfig, Multiplexer};
use upath_local::LocalStore;

fn setup() -> (Arc<dyn BlobStore>, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let store: Arc<dyn BlobStore> = Arc::new(LocalStore::new(temp_dir.path()));
    (store, temp_dir)
}

fn fast_lock() -> LockConfig {
    LockConfig {
        poll_interval: Duration::from_millis(5),
        ..LockConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_workers_share_dataset_exactly_once() {
    let (store, _temp) = setup();

    let dataset = Multiplexer::create(store.as_ref(), 0u64..30, "jobs/mux", Some("squares"))
        .await
        .unwrap();
    let session = multiplexer::create_read_session(store.as_ref(), &dataset)
        .await
        .unwrap();

    let mut handles = vec![];
    for worker in 0..5 {
        let mux = Multiplexer::<u64>::open(store.clone(), session.clone())
            .unwrap()
            .with_worker_id(format!("worker-{}", worker))
            .with_lock_config(fast_lock());
        handles.push(tokio::spawn(async move {
            mux.into_stream().try_collect::<Vec<u64>>().await
        }));
    }

    let mut seen = Vec::new();
    for handle in handles {
        seen.extend(handle.await.expect("worker panicked").unwrap());
    }

    assert_eq!(seen.len(), 30);
    let unique: HashSet<u64> = seen.iter().copied().collect();
    assert_eq!(unique.len(), 30);
    assert_eq!(seen.iter().map(|x| x * x).sum::<u64>(), 9455);

    let status = multiplexer::stat(store.as_ref(), &session).await.unwrap();
    assert_eq!(status.total, 30);
    assert_eq!(status.next, 30);
    assert!(multiplexer::done(store.as_ref(), &session).await.unwrap());
}

#[tokio::test]
async fn test_separate_stores_on_same_root() {
    let temp = TempDir::new().unwrap();
    let writer: Arc<dyn BlobStore> = Arc::new(LocalStore::new(temp.path()));
    let reader: Arc<dyn BlobStore> = Arc::new(LocalStore::new(temp.path()));

    let dataset = Multiplexer::create(writer.as_ref(), vec!["a", "b"], "ds", None)
        .await
        .unwrap();
    let session = multiplexer::create_read_session(writer.as_ref(), &dataset)
        .await
        .unwrap();

    let mut first = Multiplexer::<String>::open(writer, session.clone()).unwrap();
    let mut second = Multiplexer::<String>::open(reader.clone(), session.clone()).unwrap();
    assert_eq!(first.next().await.unwrap().as_deref(), Some("a"));
    assert_eq!(second.next().await.unwrap().as_deref(), Some("b"));
    assert_eq!(first.next().await.unwrap(), None);

    let sessions = multiplexer::list_sessions(reader.as_ref(), &dataset).await.unwrap();
    assert_eq!(sessions, vec![session.session.clone().unwrap()]);

    multiplexer::destroy(reader.as_ref(), &dataset).await.unwrap();
    assert!(reader.list("ds").await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lock_serializes_tasks() {
    let (store, _temp) = setup();
    let active = Arc::new(AtomicUsize::new(0));
    let counter = Arc::new(AtomicUsize::new(0));

    let mut handles = vec![];
    for i in 0..6 {
        let lock = DistributedLock::for_resource(store.clone(), "shared/resource")
            .with_owner(format!("task-{}", i))
            .with_config(fast_lock());
        let active = Arc::clone(&active);
        let counter = Arc::clone(&counter);
        handles.push(tokio::spawn(async move {
            for _ in 0..3 {
                let active = Arc::clone(&active);
                let counter = Arc::clone(&counter);
                lock.with_lock(Some(Duration::from_secs(30)), || async move {
                    assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    counter.fetch_add(1, Ordering::SeqCst);
                    active.fetch_sub(1, Ordering::SeqCst);
                })
                .await
                .unwrap();
            }
        }));
    }

    for handle in handles {
        handle.await.expect("task panicked");
    }
    assert_eq!(counter.load(Ordering::SeqCst), 18);
    assert!(!store.exists("shared/resource.lock").await.unwrap());
}

#[tokio::test]
async fn test_lock_times_out_while_held() {
    let (store, _temp) = setup();
    let holder = DistributedLock::for_resource(store.clone(), "res").with_config(fast_lock());
    let waiter = DistributedLock::for_resource(store.clone(), "res").with_config(fast_lock());

    let handle = holder.acquire(None).await.unwrap();
    let err = waiter
        .acquire(Some(Duration::from_millis(50)))
        .await
        .err()
        .unwrap();
    assert!(err.is_timeout());

    holder.release(handle).await.unwrap();
    let handle = waiter.acquire(Some(Duration::ZERO)).await.unwrap();
    waiter.release(handle).await.unwrap();
}
