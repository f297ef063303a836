//! Single-flight resource cache.
//!
//! Resources are described by a [`LoadDescriptor`]. Concurrent requests for
//! the same resource share one in-flight load, and later requests are served
//! the cached `Arc` until it is evicted. Both [`ResourceCache::load_async`]
//! and [`ResourceCache::load_sync`] go through the same map and lock.

use crate::sync::sync_wait;
use crate::task::{Start, Task, inherited_affinity, spawn_with};
use crate::utils::ScopeGuard;
use parking_lot::{Mutex, RwLock};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll, Waker};

mod descriptor;
pub use descriptor::{LoadDescriptor, fingerprint_of};

mod errors;
pub use errors::CacheError;

type Shared = Arc<dyn Any + Send + Sync>;
type EvictionListener = Arc<dyn Fn(&str) + Send + Sync>;

/// Resources of different descriptor types never share a key, even with equal
/// fingerprints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CacheKey {
    kind: TypeId,
    fingerprint: u64,
}

impl CacheKey {
    fn of<D: LoadDescriptor>(desc: &D) -> Self {
        CacheKey {
            kind: TypeId::of::<D>(),
            fingerprint: desc.fingerprint(),
        }
    }
}

struct Entry {
    value: Shared,
    identity: Arc<str>,
    last_access: AtomicU64,
}

enum Slot {
    /// A load is running. Requests for the key wait on it.
    Loading(Arc<InFlight>),
    Ready(Entry),
}

/// Result slot of a running load, shared by every request that found it.
struct InFlight {
    identity: Arc<str>,
    state: Mutex<FlightState>,
}

#[derive(Default)]
struct FlightState {
    result: Option<Result<Shared, CacheError>>,
    waiters: Vec<Waker>,
}

impl InFlight {
    fn new(identity: Arc<str>) -> Arc<Self> {
        Arc::new(InFlight {
            identity,
            state: Mutex::new(FlightState::default()),
        })
    }

    /// Publishes the result. Only the first call has an effect.
    fn complete(&self, result: Result<Shared, CacheError>) {
        let waiters = {
            let mut state = self.state.lock();
            if state.result.is_some() {
                return;
            }
            state.result = Some(result);
            std::mem::take(&mut state.waiters)
        };

        for waker in waiters {
            waker.wake();
        }
    }

    fn wait(self: &Arc<Self>) -> WaitLoaded {
        WaitLoaded {
            flight: Arc::clone(self),
        }
    }
}

struct WaitLoaded {
    flight: Arc<InFlight>,
}

impl Future for WaitLoaded {
    type Output = Result<Shared, CacheError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.flight.state.lock();
        if let Some(result) = &state.result {
            return Poll::Ready(result.clone());
        }

        if !state.waiters.iter().any(|w| w.will_wake(cx.waker())) {
            state.waiters.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

enum Found {
    Ready(Shared),
    Loading(Arc<InFlight>),
}

enum Claim {
    Existing(Found),
    /// The caller inserted the in-flight marker and must start the load.
    Owner(Arc<InFlight>),
}

struct Inner {
    map: RwLock<HashMap<CacheKey, Slot>>,
    capacity: usize,

    // Logical clock for least-recently-used eviction.
    tick: AtomicU64,

    on_evict: RwLock<Option<EvictionListener>>,
}

/// Cache of loaded resources, shared by every clone.
///
/// At most `capacity` loaded resources are kept. Inserting one more evicts the
/// least recently used. Failed loads are never cached: every request waiting
/// on the failed load observes the same [`CacheError`], and the next request
/// starts a fresh load.
#[derive(Clone)]
pub struct ResourceCache {
    inner: Arc<Inner>,
}

impl ResourceCache {
    #[track_caller]
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "cache capacity must be greater than 0");

        ResourceCache {
            inner: Arc::new(Inner {
                map: RwLock::new(HashMap::new()),
                capacity,
                tick: AtomicU64::new(0),
                on_evict: RwLock::new(None),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Calls `listener` with the identity of every evicted resource, after the
    /// cache lock is released.
    pub fn set_eviction_listener<F>(&self, listener: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *self.inner.on_evict.write() = Some(Arc::new(listener));
    }

    /// Returns a task resolving to the resource `desc` describes.
    ///
    /// Nothing happens until the task is first polled. A cached resource is
    /// returned right away. Otherwise the first request runs the loader as its
    /// own runnable and every concurrent request for the same resource waits
    /// on that single load.
    pub fn load_async<D: LoadDescriptor>(
        &self,
        desc: D,
    ) -> Task<Result<Arc<D::Output>, CacheError>> {
        let cache = self.clone();

        Task::new(async move {
            let key = CacheKey::of(&desc);
            let identity: Arc<str> = desc.identity().into();

            let found = match cache.lookup(key, &identity)? {
                Some(found) => found,
                None => match cache.claim(key, &identity)? {
                    Claim::Existing(found) => found,
                    Claim::Owner(flight) => {
                        cache.start_load(key, desc, Arc::clone(&flight));
                        Found::Loading(flight)
                    }
                },
            };

            let shared = match found {
                Found::Ready(value) => value,
                Found::Loading(flight) => flight.wait().await?,
            };

            downcast::<D::Output>(shared, identity)
        })
    }

    /// Blocking form of [`load_async`](ResourceCache::load_async), with the
    /// same single-flight guarantee.
    ///
    /// # Panics
    ///
    /// Panics when called from inside a runtime task, like
    /// [`sync_wait`](crate::sync::sync_wait).
    #[track_caller]
    pub fn load_sync<D: LoadDescriptor>(&self, desc: D) -> Result<Arc<D::Output>, CacheError> {
        sync_wait(self.load_async(desc))
    }

    /// Number of loaded resources.
    pub fn len(&self) -> usize {
        self.inner
            .map
            .read()
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if the resource `desc` describes is loaded.
    pub fn contains<D: LoadDescriptor>(&self, desc: &D) -> bool {
        matches!(
            self.inner.map.read().get(&CacheKey::of(desc)),
            Some(Slot::Ready(_))
        )
    }

    /// Drops the cached resource `desc` describes. A load in progress is left
    /// alone. Returns whether anything was removed.
    pub fn invalidate<D: LoadDescriptor>(&self, desc: &D) -> bool {
        let key = CacheKey::of(desc);
        let mut map = self.inner.map.write();
        if matches!(map.get(&key), Some(Slot::Ready(_))) {
            map.remove(&key);
            return true;
        }
        false
    }

    /// Finds the identity of a cached resource from the `Arc` it was handed
    /// out as.
    pub fn identity_of<T: ?Sized>(&self, value: &Arc<T>) -> Option<String> {
        let ptr = Arc::as_ptr(value) as *const ();

        self.inner.map.read().values().find_map(|slot| match slot {
            Slot::Ready(entry) if Arc::as_ptr(&entry.value) as *const () == ptr => {
                Some(entry.identity.to_string())
            }
            _ => None,
        })
    }

    /// Drops every cached resource. Loads in progress still complete their
    /// waiters but are not inserted.
    pub fn clear(&self) {
        let map = std::mem::take(&mut *self.inner.map.write());
        tracing::debug!(entries = map.len(), "clearing resource cache");
    }

    fn tick(&self) -> u64 {
        self.inner.tick.fetch_add(1, Ordering::Relaxed)
    }

    fn lookup(&self, key: CacheKey, identity: &Arc<str>) -> Result<Option<Found>, CacheError> {
        let map = self.inner.map.read();
        self.find(&map, key, identity)
    }

    /// Slow path: re-checks under the write lock, so two requests racing past
    /// the read lock cannot both start a load.
    fn claim(&self, key: CacheKey, identity: &Arc<str>) -> Result<Claim, CacheError> {
        let mut map = self.inner.map.write();
        if let Some(found) = self.find(&map, key, identity)? {
            return Ok(Claim::Existing(found));
        }

        let flight = InFlight::new(Arc::clone(identity));
        map.insert(key, Slot::Loading(Arc::clone(&flight)));
        Ok(Claim::Owner(flight))
    }

    fn find(
        &self,
        map: &HashMap<CacheKey, Slot>,
        key: CacheKey,
        identity: &Arc<str>,
    ) -> Result<Option<Found>, CacheError> {
        let found = match map.get(&key) {
            None => return Ok(None),
            Some(Slot::Ready(entry)) => {
                check_identity(key, &entry.identity, identity)?;
                entry.last_access.store(self.tick(), Ordering::Relaxed);
                Found::Ready(Arc::clone(&entry.value))
            }
            Some(Slot::Loading(flight)) => {
                check_identity(key, &flight.identity, identity)?;
                Found::Loading(Arc::clone(flight))
            }
        };
        Ok(Some(found))
    }

    fn start_load<D: LoadDescriptor>(&self, key: CacheKey, desc: D, flight: Arc<InFlight>) {
        // Waiters must not hang if the loader is dropped unfinished.
        let guard = {
            let cache = self.clone();
            let flight = Arc::clone(&flight);
            ScopeGuard::new(move || {
                let identity = Arc::clone(&flight.identity);
                cache.finish(key, &flight, Err(CacheError::Cancelled { identity }));
            })
        };

        let cache = self.clone();
        let loader = async move {
            let mut guard = guard;
            let identity = Arc::clone(&flight.identity);
            tracing::debug!(%identity, fingerprint = key.fingerprint, "loading resource");

            let out = desc.load().catch_unwind().await;
            guard.disarm();

            let result = match out {
                Ok(Ok(value)) => Ok(value as Shared),
                Ok(Err(error)) => Err(CacheError::Load {
                    identity,
                    error: Arc::new(error),
                }),
                Err(err) => Err(CacheError::Panicked {
                    identity,
                    message: err.panic_message().map(str::to_owned),
                }),
            };
            cache.finish(key, &flight, result);
        };

        // Detached: the result reaches every waiter through `flight`.
        drop(spawn_with(loader, inherited_affinity(), Start::Inline));
    }

    /// Installs a finished load, unless the slot was cleared or invalidated
    /// meanwhile, then releases its waiters.
    fn finish(&self, key: CacheKey, flight: &Arc<InFlight>, result: Result<Shared, CacheError>) {
        let evicted = {
            let mut map = self.inner.map.write();
            let ours = matches!(map.get(&key), Some(Slot::Loading(f)) if Arc::ptr_eq(f, flight));

            match &result {
                Ok(value) if ours => {
                    let entry = Entry {
                        value: Arc::clone(value),
                        identity: Arc::clone(&flight.identity),
                        last_access: AtomicU64::new(self.tick()),
                    };
                    map.insert(key, Slot::Ready(entry));
                    self.evict_locked(&mut map)
                }
                Err(_) if ours => {
                    map.remove(&key);
                    Vec::new()
                }
                _ => Vec::new(),
            }
        };

        match &result {
            Ok(_) => tracing::debug!(identity = %flight.identity, "resource loaded"),
            Err(e) => tracing::debug!(identity = %flight.identity, error = %e, "resource load failed"),
        }

        flight.complete(result);
        self.notify_evicted(evicted);
    }

    /// Evicts least recently used resources until at most `capacity` are
    /// loaded. Returns their identities.
    fn evict_locked(&self, map: &mut HashMap<CacheKey, Slot>) -> Vec<Arc<str>> {
        let capacity = self.inner.capacity;
        if map.len() <= capacity {
            return Vec::new();
        }

        let mut loaded = map
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count();

        let mut evicted = Vec::new();
        while loaded > capacity {
            let victim = map
                .iter()
                .filter_map(|(key, slot)| match slot {
                    Slot::Ready(entry) => Some((*key, entry.last_access.load(Ordering::Relaxed))),
                    Slot::Loading(_) => None,
                })
                .min_by_key(|(_, last_access)| *last_access)
                .map(|(key, _)| key);

            let Some(victim) = victim else {
                break;
            };

            if let Some(Slot::Ready(entry)) = map.remove(&victim) {
                tracing::debug!(identity = %entry.identity, "evicting resource");
                evicted.push(entry.identity);
            }
            loaded -= 1;
        }
        evicted
    }

    fn notify_evicted(&self, evicted: Vec<Arc<str>>) {
        if evicted.is_empty() {
            return;
        }

        let listener = self.inner.on_evict.read().clone();
        if let Some(listener) = listener {
            for identity in &evicted {
                listener(identity);
            }
        }
    }
}

impl fmt::Debug for ResourceCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceCache")
            .field("capacity", &self.inner.capacity)
            .field("len", &self.len())
            .finish()
    }
}

fn check_identity(key: CacheKey, cached: &Arc<str>, requested: &Arc<str>) -> Result<(), CacheError> {
    if cached == requested {
        return Ok(());
    }

    tracing::warn!(
        fingerprint = key.fingerprint,
        %cached,
        %requested,
        "resource fingerprint collision"
    );
    Err(CacheError::FingerprintCollision {
        fingerprint: key.fingerprint,
        cached: Arc::clone(cached),
        requested: Arc::clone(requested),
    })
}

fn downcast<T: Send + Sync + 'static>(value: Shared, identity: Arc<str>) -> Result<Arc<T>, CacheError> {
    value.downcast::<T>().map_err(|_| CacheError::TypeMismatch {
        identity,
        expected: std::any::type_name::<T>(),
    })
}
