//! Lifecycle integration tests for `ConnectionPool`.
//!
//! Connections are simulated by `NodeConn`, which records every `create`,
//! `validate` and `destroy` in a shared `Ledger` so the tests can assert
//! exact counts per connection id.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chainpool_core::{
    fetch_boundary, ChainConnection, ConnectionError, ConnectionFactory, ConnectionPool,
    DataFetchingError, PoolConfig, PoolError,
};

// ─── Helpers ──────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Ledger {
    created: AtomicU64,
    fail_next_creates: AtomicU32,
    unhealthy: Mutex<HashSet<u64>>,
    destroy_calls: Mutex<HashMap<u64, u32>>,
    validate_panics: AtomicBool,
    destroy_fails: AtomicBool,
    validate_delay_ms: AtomicU64,
    create_delay_ms: AtomicU64,
}

impl Ledger {
    fn created(&self) -> u64 {
        self.created.load(Ordering::SeqCst)
    }

    fn destroys_of(&self, id: u64) -> u32 {
        self.destroy_calls.lock().unwrap().get(&id).copied().unwrap_or(0)
    }

    fn total_destroys(&self) -> u32 {
        self.destroy_calls.lock().unwrap().values().sum()
    }

    fn mark_unhealthy(&self, id: u64) {
        self.unhealthy.lock().unwrap().insert(id);
    }

    /// Wait for destroys that run on spawned tasks.
    async fn settle_destroys(&self, expected: u32) {
        for _ in 0..100 {
            if self.total_destroys() >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

async fn pause(ms: &AtomicU64) {
    let ms = ms.load(Ordering::SeqCst);
    if ms > 0 {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

struct NodeConn {
    id: u64,
    ledger: Arc<Ledger>,
}

#[async_trait]
impl ChainConnection for NodeConn {
    async fn validate(&self) -> bool {
        pause(&self.ledger.validate_delay_ms).await;
        if self.ledger.validate_panics.load(Ordering::SeqCst) {
            panic!("node client crashed during health check");
        }
        !self.ledger.unhealthy.lock().unwrap().contains(&self.id)
    }

    async fn destroy(&mut self) -> Result<(), ConnectionError> {
        *self
            .ledger
            .destroy_calls
            .lock()
            .unwrap()
            .entry(self.id)
            .or_insert(0) += 1;
        if self.ledger.destroy_fails.load(Ordering::SeqCst) {
            return Err(ConnectionError::Destroy("socket already closed".into()));
        }
        Ok(())
    }
}

struct NodeFactory {
    ledger: Arc<Ledger>,
}

#[async_trait]
impl ConnectionFactory for NodeFactory {
    type Connection = NodeConn;

    async fn create(&self) -> Result<NodeConn, ConnectionError> {
        pause(&self.ledger.create_delay_ms).await;
        let pending = self.ledger.fail_next_creates.load(Ordering::SeqCst);
        if pending > 0 {
            self.ledger.fail_next_creates.store(pending - 1, Ordering::SeqCst);
            return Err(ConnectionError::Connect("node unreachable".into()));
        }
        let id = self.ledger.created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(NodeConn {
            id,
            ledger: Arc::clone(&self.ledger),
        })
    }

    fn name(&self) -> &str {
        "test-node"
    }
}

fn pool_with(config: PoolConfig) -> (ConnectionPool<NodeFactory>, Arc<Ledger>) {
    let ledger = Arc::new(Ledger::default());
    let pool = ConnectionPool::new(
        NodeFactory {
            ledger: Arc::clone(&ledger),
        },
        config,
    )
    .expect("valid config");
    (pool, ledger)
}

fn config(max_size: usize, timeout_ms: u64) -> PoolConfig {
    PoolConfig {
        max_size,
        borrow_timeout: Duration::from_millis(timeout_ms),
        ..Default::default()
    }
}

// ─── Exclusivity ──────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn no_connection_is_issued_twice() {
    let (pool, ledger) = pool_with(config(4, 5_000));
    let in_use = Arc::new(Mutex::new(HashSet::new()));

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let pool = pool.clone();
        let in_use = Arc::clone(&in_use);
        tasks.push(tokio::spawn(async move {
            for _ in 0..25 {
                let conn = pool.borrow().await.expect("borrow");
                assert!(
                    in_use.lock().unwrap().insert(conn.id),
                    "connection {} issued to two borrowers",
                    conn.id
                );
                tokio::time::sleep(Duration::from_millis(1)).await;
                in_use.lock().unwrap().remove(&conn.id);
                pool.release(conn).await;
            }
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }

    assert!(ledger.created() <= 4, "created {} > max_size", ledger.created());
    let stats = pool.stats();
    assert_eq!(stats.borrowed, 0);
    assert_eq!(stats.idle as u64, ledger.created());
}

// ─── Replacement ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn failed_return_validation_triggers_exact_replacements() {
    let (pool, ledger) = pool_with(config(3, 500));

    let mut held = Vec::new();
    for _ in 0..3 {
        held.push(pool.borrow().await.unwrap());
    }
    for conn in &held {
        ledger.mark_unhealthy(conn.id);
    }
    for conn in held {
        pool.release(conn).await;
    }
    assert_eq!(ledger.total_destroys(), 3);
    assert_eq!(pool.stats().idle, 0);
    assert_eq!(pool.stats().validation_failures, 3);

    let mut fresh = Vec::new();
    for _ in 0..3 {
        fresh.push(pool.borrow().await.unwrap());
    }
    assert_eq!(ledger.created(), 6, "exactly 3 replacements");
    for conn in fresh {
        assert!(conn.id > 3);
        pool.release(conn).await;
    }
}

#[tokio::test]
async fn blocked_borrow_succeeds_after_invalid_return() {
    let (pool, ledger) = pool_with(config(2, 2_000));
    let a = pool.borrow().await.unwrap();
    let b = pool.borrow().await.unwrap();
    assert_eq!(ledger.created(), 2);

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.borrow().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished(), "third borrow should wait for capacity");

    ledger.mark_unhealthy(a.id);
    let a_id = a.id;
    pool.release(a).await;

    let c = waiter.await.unwrap().expect("borrow C");
    assert_eq!(c.id, 3);
    assert_eq!(ledger.created(), 3);
    assert_eq!(ledger.destroys_of(a_id), 1);

    pool.release(b).await;
    pool.release(c).await;
}

// ─── Exhaustion ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn borrow_times_out_when_exhausted() {
    let (pool, _ledger) = pool_with(config(1, 100));
    let held = pool.borrow().await.unwrap();

    let started = Instant::now();
    let err = pool.borrow().await.unwrap_err();
    assert!(started.elapsed() >= Duration::from_millis(90));
    assert!(err.is_retryable());
    match err {
        PoolError::Exhausted { max_size, .. } => assert_eq!(max_size, 1),
        other => panic!("expected Exhausted, got {other:?}"),
    }

    pool.release(held).await;
    let again = pool.borrow().await.expect("capacity returned");
    pool.release(again).await;
}

// ─── Creation failures ────────────────────────────────────────────────────────

#[tokio::test]
async fn failed_create_leaves_pool_size_unchanged() {
    let (pool, ledger) = pool_with(config(1, 200));
    ledger.fail_next_creates.store(1, Ordering::SeqCst);

    let err = pool.borrow().await.unwrap_err();
    assert!(matches!(err, PoolError::Creation { ref factory, .. } if factory == "test-node"));
    let stats = pool.stats();
    assert_eq!(stats.borrowed, 0);
    assert_eq!(stats.idle, 0);
    assert_eq!(stats.created, 0);

    let conn = pool.borrow().await.expect("retry succeeds");
    assert_eq!(ledger.created(), 1);
    pool.release(conn).await;
}

// ─── Shutdown ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn shutdown_destroys_idle_once_and_closes() {
    let (pool, ledger) = pool_with(config(3, 200));
    let a = pool.borrow().await.unwrap();
    let b = pool.borrow().await.unwrap();
    let c = pool.borrow().await.unwrap();
    let (a_id, b_id, c_id) = (a.id, b.id, c.id);
    pool.release(a).await;
    pool.release(b).await;

    pool.shutdown().await;
    assert!(pool.is_closed());
    assert_eq!(ledger.destroys_of(a_id), 1);
    assert_eq!(ledger.destroys_of(b_id), 1);
    assert_eq!(ledger.destroys_of(c_id), 0, "borrowed connection survives until returned");

    assert!(matches!(pool.borrow().await, Err(PoolError::Closed)));

    pool.release(c).await;
    assert_eq!(ledger.destroys_of(c_id), 1);

    pool.shutdown().await;
    assert_eq!(ledger.total_destroys(), 3, "second shutdown destroys nothing");
    assert_eq!(pool.stats().destroyed, 3);
}

#[tokio::test]
async fn shutdown_wakes_waiting_borrowers() {
    let (pool, _ledger) = pool_with(config(1, 5_000));
    let held = pool.borrow().await.unwrap();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.borrow().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    pool.shutdown().await;
    let result = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("waiter released by shutdown")
        .unwrap();
    assert!(matches!(result, Err(PoolError::Closed)));
    pool.release(held).await;
}

#[tokio::test]
async fn shutdown_during_create_destroys_new_connection() {
    let (pool, ledger) = pool_with(config(1, 1_000));
    ledger.create_delay_ms.store(100, Ordering::SeqCst);

    let borrower = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.borrow().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    pool.shutdown().await;

    let result = borrower.await.unwrap();
    assert!(matches!(result, Err(PoolError::Closed)));
    assert_eq!(ledger.created(), 1);
    assert_eq!(ledger.destroys_of(1), 1);
    assert_eq!(ledger.total_destroys(), 1);

    let stats = pool.stats();
    assert_eq!(stats.borrowed, 0);
    assert_eq!(stats.idle, 0);
    assert_eq!(stats.destroyed, 1);
}

#[tokio::test]
async fn shutdown_during_borrow_validation_destroys_idle_connection() {
    let (pool, ledger) = pool_with(config(1, 1_000));
    let conn = pool.borrow().await.unwrap();
    let id = conn.id;
    pool.release(conn).await;
    ledger.validate_delay_ms.store(100, Ordering::SeqCst);

    let borrower = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.borrow().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(pool.stats().idle, 0, "borrower took the idle connection");
    pool.shutdown().await;
    assert_eq!(ledger.total_destroys(), 0, "entry under validation is not drained");

    let result = borrower.await.unwrap();
    assert!(matches!(result, Err(PoolError::Closed)));
    assert_eq!(ledger.destroys_of(id), 1);
    assert_eq!(ledger.total_destroys(), 1);

    let stats = pool.stats();
    assert_eq!(stats.borrowed, 0);
    assert_eq!(stats.destroyed, 1);
}

// ─── Cancellation ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn cancelled_borrow_during_validation_destroys_connection() {
    let (pool, ledger) = pool_with(config(1, 1_000));
    let conn = pool.borrow().await.unwrap();
    let id = conn.id;
    pool.release(conn).await;
    ledger.validate_delay_ms.store(200, Ordering::SeqCst);

    let attempt = tokio::time::timeout(Duration::from_millis(20), pool.borrow()).await;
    assert!(attempt.is_err(), "borrow should still be validating");
    assert_eq!(pool.stats().borrowed, 0, "slot freed on cancel");

    pool.shutdown().await;
    ledger.settle_destroys(1).await;
    assert_eq!(ledger.created(), 1);
    assert_eq!(ledger.destroys_of(id), 1);

    let stats = pool.stats();
    assert_eq!(stats.idle, 0);
    assert_eq!(stats.borrowed, 0);
    assert_eq!(stats.destroyed, 1);
    assert_eq!(stats.leaked, 0);
}

#[tokio::test]
async fn cancelled_release_during_validation_destroys_connection() {
    let (pool, ledger) = pool_with(config(1, 1_000));
    let conn = pool.borrow().await.unwrap();
    let id = conn.id;
    ledger.validate_delay_ms.store(200, Ordering::SeqCst);

    let attempt = tokio::time::timeout(Duration::from_millis(20), pool.release(conn)).await;
    assert!(attempt.is_err(), "release should still be validating");
    assert_eq!(pool.stats().borrowed, 0, "slot freed on cancel");

    pool.shutdown().await;
    ledger.settle_destroys(1).await;
    assert_eq!(ledger.created(), 1);
    assert_eq!(ledger.destroys_of(id), 1);

    let stats = pool.stats();
    assert_eq!(stats.idle, 0);
    assert_eq!(stats.borrowed, 0);
    assert_eq!(stats.destroyed, 1);
}

#[tokio::test]
async fn cancelled_borrow_frees_capacity_for_next_borrower() {
    let (pool, ledger) = pool_with(config(1, 1_000));
    let conn = pool.borrow().await.unwrap();
    pool.release(conn).await;
    ledger.validate_delay_ms.store(200, Ordering::SeqCst);

    let attempt = tokio::time::timeout(Duration::from_millis(20), pool.borrow()).await;
    assert!(attempt.is_err());
    ledger.validate_delay_ms.store(0, Ordering::SeqCst);

    let next = pool.borrow().await.expect("capacity returned");
    assert_eq!(next.id, 2);
    pool.release(next).await;
    ledger.settle_destroys(1).await;
    assert_eq!(ledger.destroys_of(1), 1);
}

// ─── Misbehaving connections ──────────────────────────────────────────────────

#[tokio::test]
async fn panicking_validate_evicts_without_surfacing() {
    let (pool, ledger) = pool_with(config(1, 200));
    let conn = pool.borrow().await.unwrap();
    let id = conn.id;

    ledger.validate_panics.store(true, Ordering::SeqCst);
    pool.release(conn).await;
    ledger.validate_panics.store(false, Ordering::SeqCst);

    assert_eq!(ledger.destroys_of(id), 1);
    assert_eq!(pool.stats().validation_failures, 1);
    let next = pool.borrow().await.expect("replacement");
    assert_ne!(next.id, id);
    pool.release(next).await;
}

#[tokio::test]
async fn destroy_failure_does_not_fail_release() {
    let (pool, ledger) = pool_with(config(1, 200));
    ledger.destroy_fails.store(true, Ordering::SeqCst);

    let conn = pool.borrow().await.unwrap();
    let id = conn.id;
    ledger.mark_unhealthy(id);
    pool.release(conn).await;

    assert_eq!(ledger.destroys_of(id), 1);
    assert_eq!(pool.stats().destroyed, 1);
    assert!(pool.borrow().await.is_ok());
}

#[tokio::test]
async fn skip_return_validation_when_disabled() {
    let (pool, ledger) = pool_with(PoolConfig {
        validate_on_return: false,
        validate_on_borrow: false,
        ..config(1, 200)
    });
    let conn = pool.borrow().await.unwrap();
    let id = conn.id;
    ledger.mark_unhealthy(id);
    pool.release(conn).await;

    let again = pool.borrow().await.unwrap();
    assert_eq!(again.id, id, "no validation means the same handle is reused");
    assert_eq!(ledger.total_destroys(), 0);
    pool.release(again).await;
}

// ─── Factories and boundary ───────────────────────────────────────────────────

#[tokio::test]
async fn closure_factory() {
    let ledger = Arc::new(Ledger::default());
    let factory_ledger = Arc::clone(&ledger);
    let pool = ConnectionPool::new(
        move || {
            let id = factory_ledger.created.fetch_add(1, Ordering::SeqCst) + 1;
            Ok::<_, ConnectionError>(NodeConn {
                id,
                ledger: Arc::clone(&factory_ledger),
            })
        },
        config(2, 200),
    )
    .unwrap();

    let conn = pool.borrow().await.unwrap();
    assert_eq!(conn.id, 1);
    pool.release(conn).await;
    assert_eq!(ledger.created(), 1);
}

#[tokio::test]
async fn boundary_normalizes_pool_errors() {
    let (pool, _ledger) = pool_with(config(1, 200));
    pool.shutdown().await;

    let result = fetch_boundary("BlockResolver::latest", async {
        let conn = pool.borrow().await?;
        let id = conn.id;
        pool.release(conn).await;
        Ok::<_, PoolError>(id)
    })
    .await;
    assert_eq!(result, Err(DataFetchingError::new("pool is closed")));
}
