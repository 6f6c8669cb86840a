//! Bounded connection pool with validation and safe teardown.
//!
//! Capacity is a fair semaphore with `max_size` permits; every borrowed
//! connection holds one. Pool membership lives behind a single mutex that is
//! never held across an `.await`, so factory `create()`, `validate()` and
//! `destroy()` never serialize other borrowers.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use crate::config::PoolConfig;
use crate::connection::{ChainConnection, ConnectionFactory};
use crate::entry::{EntryState, PooledEntry};
use crate::error::PoolError;

type Conn<F> = <F as ConnectionFactory>::Connection;

/// Lower bound for the background evictor's tick.
const MIN_EVICT_INTERVAL: Duration = Duration::from_millis(10);

/// Why an entry is being destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EvictReason {
    ValidationFailed,
    Invalidated,
    Dropped,
    Shutdown,
    IdleTimeout,
}

impl std::fmt::Display for EvictReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ValidationFailed => write!(f, "validation-failed"),
            Self::Invalidated => write!(f, "invalidated"),
            Self::Dropped => write!(f, "dropped"),
            Self::Shutdown => write!(f, "shutdown"),
            Self::IdleTimeout => write!(f, "idle-timeout"),
        }
    }
}

/// Point-in-time view of pool accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub max_size: usize,
    /// Connections waiting in the idle queue.
    pub idle: usize,
    /// Connections held by borrowers, including ones being created or checked.
    pub borrowed: usize,
    /// Connections ever created by the factory.
    pub created: u64,
    /// Connections on which `destroy()` has been invoked.
    pub destroyed: u64,
    /// Validations that returned `false` or panicked.
    pub validation_failures: u64,
    /// Connections dropped outside a Tokio runtime; `destroy()` never ran on them.
    pub leaked: u64,
    pub closed: bool,
}

struct PoolState<C> {
    idle: VecDeque<PooledEntry<C>>,
    /// idle + borrowed + reserved-for-creation. Never exceeds `max_size`.
    live: usize,
    closed: bool,
    next_id: u64,
    created: u64,
    destroyed: u64,
    validation_failures: u64,
    leaked: u64,
}

struct Shared<F: ConnectionFactory> {
    factory: F,
    config: PoolConfig,
    state: Mutex<PoolState<Conn<F>>>,
    permits: Arc<Semaphore>,
}

/// Releases a reserved slot unless committed. Covers cancelled borrows.
struct SlotGuard<'a, F: ConnectionFactory> {
    shared: &'a Shared<F>,
    armed: bool,
}

impl<'a, F: ConnectionFactory> SlotGuard<'a, F> {
    fn new(shared: &'a Shared<F>) -> Self {
        Self { shared, armed: true }
    }

    fn commit(mut self) {
        self.armed = false;
    }
}

impl<F: ConnectionFactory> Drop for SlotGuard<'_, F> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.shared.lock();
            state.live -= 1;
            tracing::debug!(live = state.live, "reserved slot released");
        }
    }
}

impl<F: ConnectionFactory> Shared<F> {
    fn lock(&self) -> MutexGuard<'_, PoolState<Conn<F>>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Frees the caller's slot if the pool closed while it was checking out.
    fn release_if_closed(&self) -> bool {
        let mut state = self.lock();
        if state.closed {
            state.live -= 1;
        }
        state.closed
    }

    /// Run `validate()`. A panic counts as a failed validation.
    async fn check(&self, entry: &mut PooledEntry<Conn<F>>) -> bool {
        let ok = match AssertUnwindSafe(entry.conn.validate()).catch_unwind().await {
            Ok(ok) => ok,
            Err(_) => {
                tracing::warn!(entry_id = entry.id, "validate() panicked; treating as invalid");
                false
            }
        };
        if ok {
            entry.record_validation();
        } else {
            self.lock().validation_failures += 1;
            tracing::debug!(entry_id = entry.id, "connection failed validation");
        }
        ok
    }

    /// Invoke `destroy()` on an entry whose slot has already been released.
    ///
    /// Consumes the entry, so `destroy()` runs at most once per connection.
    async fn destroy_entry(&self, mut entry: PooledEntry<Conn<F>>, reason: EvictReason) {
        if entry.state() != EntryState::Invalid {
            entry.mark_invalid();
        }
        match AssertUnwindSafe(entry.conn.destroy()).catch_unwind().await {
            Ok(Ok(())) => {
                tracing::debug!(entry_id = entry.id, %reason, "connection destroyed");
            }
            Ok(Err(e)) => {
                tracing::warn!(entry_id = entry.id, %reason, error = %e, "destroy() failed");
            }
            Err(_) => {
                tracing::error!(entry_id = entry.id, %reason, "destroy() panicked");
            }
        }
        entry.mark_destroyed();
        self.lock().destroyed += 1;
    }

    /// Destroy an entry from synchronous code: on a spawned task when a
    /// runtime is available, otherwise count it as leaked.
    fn discard(self: &Arc<Self>, entry: PooledEntry<Conn<F>>, reason: EvictReason) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let shared = Arc::clone(self);
                handle.spawn(async move {
                    shared.destroy_entry(entry, reason).await;
                });
            }
            Err(_) => {
                self.lock().leaked += 1;
                tracing::warn!(
                    entry_id = entry.id,
                    %reason,
                    "no runtime available; connection dropped without destroy()"
                );
            }
        }
    }

    /// Put a validated or unchecked connection back, or destroy it.
    ///
    /// `conn` keeps ownership of the entry while `validate()` runs, so a
    /// cancelled return still frees the slot and destroys the connection.
    async fn checkin(&self, mut conn: PooledConnection<F>, invalidate: bool) {
        let closed = self.lock().closed;
        let reason = if invalidate {
            Some(EvictReason::Invalidated)
        } else if closed {
            Some(EvictReason::Shutdown)
        } else if self.config.validate_on_return && !self.check(conn.entry_mut()).await {
            Some(EvictReason::ValidationFailed)
        } else {
            None
        };

        let (_, mut entry, permit) = conn.into_parts();
        let leftover = {
            let mut state = self.lock();
            match reason {
                None if !state.closed => {
                    entry.mark_idle();
                    state.idle.push_back(entry);
                    None
                }
                None => {
                    state.live -= 1;
                    Some((entry, EvictReason::Shutdown))
                }
                Some(reason) => {
                    state.live -= 1;
                    Some((entry, reason))
                }
            }
        };
        drop(permit);

        if let Some((entry, reason)) = leftover {
            tracing::debug!(entry_id = entry.id, %reason, "evicting returned connection");
            self.destroy_entry(entry, reason).await;
        }
    }
}

enum Checkout<C> {
    Idle(PooledEntry<C>),
    Create(u64),
}

/// A bounded pool of chain connections.
///
/// Cloning is cheap; all clones share the same connections.
///
/// ```ignore
/// let pool = ConnectionPool::new(factory, PoolConfig::with_max_size(4))?;
/// let conn = pool.borrow().await?;
/// // ... use `conn` through `Deref` ...
/// pool.release(conn).await;
/// ```
pub struct ConnectionPool<F: ConnectionFactory> {
    shared: Arc<Shared<F>>,
}

impl<F: ConnectionFactory> Clone for ConnectionPool<F> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    /// Build a pool. No connections are opened until the first borrow.
    pub fn new(factory: F, config: PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;
        let permits = Arc::new(Semaphore::new(config.max_size));
        Ok(Self {
            shared: Arc::new(Shared {
                factory,
                state: Mutex::new(PoolState {
                    idle: VecDeque::with_capacity(config.max_size),
                    live: 0,
                    closed: false,
                    next_id: 0,
                    created: 0,
                    destroyed: 0,
                    validation_failures: 0,
                    leaked: 0,
                }),
                permits,
                config,
            }),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn max_size(&self) -> usize {
        self.shared.config.max_size
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock();
        PoolStats {
            max_size: self.shared.config.max_size,
            idle: state.idle.len(),
            borrowed: state.live - state.idle.len(),
            created: state.created,
            destroyed: state.destroyed,
            validation_failures: state.validation_failures,
            leaked: state.leaked,
            closed: state.closed,
        }
    }

    /// Check out a connection.
    ///
    /// Reuses the most recently returned idle connection when one passes
    /// validation, otherwise creates a new one if capacity allows, otherwise
    /// waits up to `borrow_timeout`. Waiters are served in arrival order.
    pub async fn borrow(&self) -> Result<PooledConnection<F>, PoolError> {
        let shared = &self.shared;
        if shared.lock().closed {
            return Err(PoolError::Closed);
        }

        let started = Instant::now();
        let timeout = shared.config.borrow_timeout;
        let acquire = Arc::clone(&shared.permits).acquire_owned();
        let mut permit = match tokio::time::timeout(timeout, acquire).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PoolError::Closed),
            Err(_) => {
                let waited_ms = started.elapsed().as_millis() as u64;
                tracing::warn!(
                    waited_ms,
                    max_size = shared.config.max_size,
                    "pool exhausted"
                );
                return Err(PoolError::Exhausted {
                    waited_ms,
                    max_size: shared.config.max_size,
                });
            }
        };

        loop {
            let next = {
                let mut state = shared.lock();
                if state.closed {
                    return Err(PoolError::Closed);
                }
                match state.idle.pop_back() {
                    Some(entry) => Checkout::Idle(entry),
                    None => {
                        debug_assert!(
                            state.live < shared.config.max_size,
                            "slot accounting overflow"
                        );
                        state.live += 1;
                        state.next_id += 1;
                        Checkout::Create(state.next_id)
                    }
                }
            };

            match next {
                Checkout::Idle(entry) => {
                    // held by a guard so a cancelled borrow still destroys it
                    let mut held = PooledConnection::new(entry, permit, Arc::clone(shared));
                    if shared.config.validate_on_borrow && !shared.check(held.entry_mut()).await {
                        let (_, entry, reclaimed) = held.into_parts();
                        shared.lock().live -= 1;
                        permit = reclaimed;
                        shared.destroy_entry(entry, EvictReason::ValidationFailed).await;
                        continue;
                    }
                    if shared.release_if_closed() {
                        let (_, entry, _) = held.into_parts();
                        shared.destroy_entry(entry, EvictReason::Shutdown).await;
                        return Err(PoolError::Closed);
                    }
                    let entry = held.entry_mut();
                    entry.mark_borrowed();
                    tracing::trace!(entry_id = entry.id, "reusing idle connection");
                    return Ok(held);
                }
                Checkout::Create(id) => {
                    let slot = SlotGuard::new(shared);
                    match shared.factory.create().await {
                        Ok(conn) => {
                            shared.lock().created += 1;
                            let entry = PooledEntry::new(id, conn);
                            let closed = shared.release_if_closed();
                            slot.commit();
                            if closed {
                                shared.destroy_entry(entry, EvictReason::Shutdown).await;
                                return Err(PoolError::Closed);
                            }
                            tracing::debug!(
                                entry_id = id,
                                factory = shared.factory.name(),
                                "created connection"
                            );
                            return Ok(PooledConnection::new(entry, permit, Arc::clone(shared)));
                        }
                        Err(source) => {
                            // give the reservation back before reporting
                            drop(slot);
                            tracing::warn!(
                                factory = shared.factory.name(),
                                error = %source,
                                "connection creation failed"
                            );
                            return Err(PoolError::Creation {
                                factory: shared.factory.name().to_string(),
                                source,
                            });
                        }
                    }
                }
            }
        }
    }

    /// Return a borrowed connection.
    ///
    /// Validates it when `validate_on_return` is set; a connection that fails
    /// is destroyed and its slot freed for a replacement. After `shutdown()`
    /// returned connections are destroyed.
    pub async fn release(&self, conn: PooledConnection<F>) {
        let shared = self.origin(&conn);
        shared.checkin(conn, false).await;
    }

    /// Return a connection the caller knows is broken. It is destroyed without validation.
    pub async fn invalidate(&self, conn: PooledConnection<F>) {
        let shared = self.origin(&conn);
        shared.checkin(conn, true).await;
    }

    fn origin(&self, conn: &PooledConnection<F>) -> Arc<Shared<F>> {
        if !Arc::ptr_eq(&self.shared, &conn.shared) {
            tracing::warn!("connection returned to a different pool; routing to its origin");
        }
        Arc::clone(&conn.shared)
    }

    /// Close the pool and destroy every idle connection.
    ///
    /// Connections still borrowed are destroyed when returned. Calling this
    /// again is a no-op.
    pub async fn shutdown(&self) {
        let shared = &self.shared;
        let drained: Vec<_> = {
            let mut state = shared.lock();
            if state.closed {
                tracing::debug!("pool already closed");
                return;
            }
            state.closed = true;
            let idle = state.idle.len();
            state.live -= idle;
            tracing::info!(idle, borrowed = state.live, "shutting down connection pool");
            state.idle.drain(..).collect()
        };
        shared.permits.close();

        for entry in drained {
            shared.destroy_entry(entry, EvictReason::Shutdown).await;
        }
    }

    /// Destroy idle connections that have sat unused longer than `max_idle`.
    ///
    /// Returns the number evicted. Does nothing when `max_idle` is unset.
    pub async fn evict_idle(&self) -> usize {
        let shared = &self.shared;
        let Some(max_idle) = shared.config.max_idle else {
            return 0;
        };

        let stale: Vec<_> = {
            let mut state = shared.lock();
            if state.closed {
                return 0;
            }
            let mut kept = VecDeque::with_capacity(state.idle.len());
            let mut stale = Vec::new();
            while let Some(entry) = state.idle.pop_front() {
                if entry.idle_for() >= max_idle {
                    stale.push(entry);
                } else {
                    kept.push_back(entry);
                }
            }
            state.idle = kept;
            state.live -= stale.len();
            stale
        };

        let evicted = stale.len();
        if evicted > 0 {
            tracing::debug!(evicted, "evicting stale idle connections");
        }
        for entry in stale {
            shared.destroy_entry(entry, EvictReason::IdleTimeout).await;
        }
        evicted
    }

    /// Run [`evict_idle`](Self::evict_idle) every `interval` on a background task.
    ///
    /// The task holds only a weak reference and exits once the pool is shut
    /// down or every handle to it is dropped. Intervals shorter than 10ms are
    /// raised to 10ms. Panics when called outside a Tokio runtime.
    pub fn spawn_evictor(&self, interval: Duration) -> JoinHandle<()> {
        let period = interval.max(MIN_EVICT_INTERVAL);
        if period != interval {
            tracing::debug!(requested = ?interval, ?period, "evictor interval raised");
        }
        let weak: Weak<Shared<F>> = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else { break };
                let pool = ConnectionPool { shared };
                if pool.is_closed() {
                    break;
                }
                pool.evict_idle().await;
            }
            tracing::debug!("idle evictor stopped");
        })
    }
}

impl<F: ConnectionFactory> std::fmt::Debug for ConnectionPool<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("factory", &self.shared.factory.name())
            .field("stats", &self.stats())
            .finish()
    }
}

/// A connection checked out of a [`ConnectionPool`].
///
/// Hand it back with [`ConnectionPool::release`] or
/// [`ConnectionPool::invalidate`]. Dropping it instead frees its slot and
/// destroys the connection on a background task.
pub struct PooledConnection<F: ConnectionFactory> {
    entry: Option<PooledEntry<Conn<F>>>,
    permit: Option<OwnedSemaphorePermit>,
    shared: Arc<Shared<F>>,
}

impl<F: ConnectionFactory> PooledConnection<F> {
    fn new(
        entry: PooledEntry<Conn<F>>,
        permit: OwnedSemaphorePermit,
        shared: Arc<Shared<F>>,
    ) -> Self {
        Self {
            entry: Some(entry),
            permit: Some(permit),
            shared,
        }
    }

    fn entry(&self) -> &PooledEntry<Conn<F>> {
        self.entry.as_ref().expect("pooled connection used after release")
    }

    /// Pool-unique identifier of the underlying connection.
    pub fn id(&self) -> u64 {
        self.entry().id
    }

    /// Time since the connection was created.
    pub fn age(&self) -> Duration {
        self.entry().age()
    }

    /// Number of times this connection has been borrowed, including now.
    pub fn borrow_count(&self) -> u64 {
        self.entry().borrow_count()
    }

    /// When the connection last passed validation, if ever.
    pub fn last_validated(&self) -> Option<Instant> {
        self.entry().last_validated()
    }

    fn entry_mut(&mut self) -> &mut PooledEntry<Conn<F>> {
        self.entry.as_mut().expect("pooled connection used after release")
    }

    fn into_parts(mut self) -> (Arc<Shared<F>>, PooledEntry<Conn<F>>, OwnedSemaphorePermit) {
        let entry = self.entry.take().expect("pooled connection released twice");
        let permit = self.permit.take().expect("pooled connection released twice");
        (Arc::clone(&self.shared), entry, permit)
    }
}

impl<F: ConnectionFactory> std::ops::Deref for PooledConnection<F> {
    type Target = F::Connection;

    fn deref(&self) -> &Self::Target {
        &self.entry().conn
    }
}

impl<F: ConnectionFactory> std::ops::DerefMut for PooledConnection<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.entry_mut().conn
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        let Some(mut entry) = self.entry.take() else {
            return;
        };
        entry.mark_invalid();
        self.shared.lock().live -= 1;
        drop(self.permit.take());

        tracing::warn!(entry_id = entry.id, "pooled connection dropped without release");
        self.shared.discard(entry, EvictReason::Dropped);
    }
}

impl<F: ConnectionFactory> std::fmt::Debug for PooledConnection<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut d = f.debug_struct("PooledConnection");
        if let Some(entry) = &self.entry {
            d.field("id", &entry.id).field("state", &entry.state());
        }
        d.finish()
    }
}
