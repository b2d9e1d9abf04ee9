// Copyright 2024 ShaleFS Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

use crate::adaptive::AdaptiveEstimate;
use crate::config::EngineConfig;
use crate::import::ConnectCaps;
use crate::lock::{Lock, LockCallbacks};
use crate::resource::Resource;
use crate::types::{LockHandle, LockKind, LockMode, ResourceName};

/// Unused-lock LRU, oldest at the front.
#[derive(Debug, Default)]
pub(crate) struct LruState {
    pub list: VecDeque<Arc<Lock>>,
}

/// Client view of the server lock pool. `slv`/`limit` zero means the
/// server never told us; `clv` is exported for observation only.
#[derive(Debug, Clone, Copy)]
pub struct PoolState {
    pub slv: u64,
    pub limit: u32,
    pub lvf: u64,
    pub clv: u64,
}

impl Default for PoolState {
    fn default() -> Self {
        Self {
            slv: 0,
            limit: 0,
            lvf: 1,
            clv: 0,
        }
    }
}

/// Caller-supplied veto consulted by the no-wait eviction policy.
pub type CancelPredicate = Arc<dyn Fn(&Arc<Lock>) -> bool + Send + Sync>;

/// A container of resources plus the unused-lock cache covering them.
pub struct Namespace {
    name: String,
    config: Arc<EngineConfig>,
    /// Handle generation; a handle from another incarnation never resolves.
    generation: u32,
    next_cookie: AtomicU64,
    resources: RwLock<HashMap<ResourceName, Arc<Resource>>>,
    handles: RwLock<HashMap<u64, Arc<Lock>>>,
    pub(crate) lru: Mutex<LruState>,
    pool: RwLock<PoolState>,
    estimator: Mutex<AdaptiveEstimate>,
    connect: RwLock<ConnectCaps>,
    cancel_pred: RwLock<Option<CancelPredicate>>,
    weak_self: std::sync::Weak<Namespace>,
}

impl std::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespace")
            .field("name", &self.name)
            .field("resources", &self.resources.read().len())
            .field("nr_unused", &self.lru.lock().list.len())
            .field("pool", &*self.pool.read())
            .finish()
    }
}

impl Namespace {
    pub fn new(name: impl Into<String>, config: Arc<EngineConfig>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            name: name.into(),
            config,
            generation: (rand::random::<u32>() | 1).max(1),
            next_cookie: AtomicU64::new(rand::random::<u64>() | 1),
            resources: RwLock::new(HashMap::new()),
            handles: RwLock::new(HashMap::new()),
            lru: Mutex::new(LruState::default()),
            pool: RwLock::new(PoolState::default()),
            estimator: Mutex::new(AdaptiveEstimate::new()),
            connect: RwLock::new(ConnectCaps::default()),
            cancel_pred: RwLock::new(None),
            weak_self: weak.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn max_unused(&self) -> usize {
        self.config.lru.max_unused
    }

    pub fn max_age_secs(&self) -> u64 {
        self.config.lru.max_age.as_secs()
    }

    /// Coarse wall clock in whole seconds. A lock released within the
    /// current tick is held in the LRU for at least one more tick.
    pub fn coarse_now(&self) -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
    }

    fn arc_self(&self) -> Arc<Namespace> {
        self.weak_self.upgrade().expect("namespace alive while in use")
    }

    // -------- connect capabilities --------

    pub fn set_connect_caps(&self, caps: ConnectCaps) {
        *self.connect.write() = caps;
    }

    /// Server supports cancel piggybacking.
    pub fn connect_cancelset(&self) -> bool {
        self.connect.read().cancelset
    }

    /// Server drives our cache size through SLV feedback.
    pub fn connect_lru_resize(&self) -> bool {
        self.connect.read().lru_resize
    }

    pub fn set_cancel_predicate(&self, pred: Option<CancelPredicate>) {
        *self.cancel_pred.write() = pred;
    }

    pub(crate) fn cancel_predicate(&self) -> Option<CancelPredicate> {
        self.cancel_pred.read().clone()
    }

    // -------- resources --------

    /// Look a resource up by name, creating it when asked to.
    pub fn resource_get(&self, name: ResourceName, kind: LockKind, create: bool) -> Option<Arc<Resource>> {
        if let Some(res) = self.resources.read().get(&name) {
            return Some(res.clone());
        }
        if !create {
            return None;
        }
        let mut resources = self.resources.write();
        Some(
            resources
                .entry(name)
                .or_insert_with(|| Resource::new(&self.arc_self(), name, kind))
                .clone(),
        )
    }

    /// Visit every resource; the visitor must not re-enter the resource map.
    pub fn for_each_resource(&self, mut f: impl FnMut(&Arc<Resource>) -> ControlFlow<()>) {
        let snapshot: Vec<Arc<Resource>> = self.resources.read().values().cloned().collect();
        for res in snapshot {
            if f(&res).is_break() {
                break;
            }
        }
    }

    /// Visit every lock of one resource, granted before waiting.
    pub fn resource_iterate(
        &self,
        name: ResourceName,
        f: impl FnMut(&Arc<Lock>) -> ControlFlow<()>,
    ) -> ControlFlow<()> {
        match self.resource_get(name, LockKind::Plain, false) {
            Some(res) => res.foreach(f),
            None => ControlFlow::Continue(()),
        }
    }

    /// Snapshot of every lock the namespace knows about: resource lists
    /// first, then the unused cache. The sets are disjoint.
    pub fn all_locks_snapshot(&self) -> Vec<Arc<Lock>> {
        let mut out = Vec::new();
        self.for_each_resource(|res| {
            out.extend(res.locks_snapshot());
            ControlFlow::Continue(())
        });
        out.extend(self.lru.lock().list.iter().cloned());
        out
    }

    // -------- locks and handles --------

    /// Allocate a lock on `resource` and register its handle.
    pub fn new_lock(
        &self,
        resource: &Arc<Resource>,
        kind: LockKind,
        mode: LockMode,
        callbacks: LockCallbacks,
        lvb_cap: usize,
    ) -> Arc<Lock> {
        let handle = LockHandle {
            cookie: self.next_cookie.fetch_add(1, Ordering::Relaxed),
            generation: self.generation,
        };
        let lock = Lock::new(&self.arc_self(), resource, handle, kind, mode, callbacks, lvb_cap);
        self.handles.write().insert(handle.cookie, lock.clone());
        lock
    }

    /// Resolve a handle to a live lock. Destroyed locks and handles from
    /// another incarnation resolve to nothing.
    pub fn handle2lock(&self, handle: &LockHandle) -> Option<Arc<Lock>> {
        if handle.generation != self.generation {
            return None;
        }
        let lock = self.handles.read().get(&handle.cookie).cloned()?;
        if lock.is_destroyed() {
            return None;
        }
        Some(lock)
    }

    pub(crate) fn remove_handle(&self, cookie: u64) {
        self.handles.write().remove(&cookie);
    }

    /// Move a not-yet-installed lock to the resource the server granted
    /// instead, allocating it if needed.
    pub fn change_resource(&self, lock: &Arc<Lock>, name: ResourceName) {
        let res = self
            .resource_get(name, lock.kind(), true)
            .expect("resource_get with create always succeeds");
        lock.with_state(|st| {
            st.resource = Arc::downgrade(&res);
            st.res_name = name;
        });
        debug!(handle = lock.handle().cookie, %name, "lock moved to server-chosen resource");
    }

    // -------- unused-lock LRU --------

    pub fn nr_unused(&self) -> usize {
        self.lru.lock().list.len()
    }

    pub(crate) fn lru_push(&self, lock: Arc<Lock>) {
        self.lru.lock().list.push_back(lock);
    }

    pub(crate) fn lru_remove(&self, lock: &Arc<Lock>) {
        self.lru.lock().list.retain(|l| !Arc::ptr_eq(l, lock));
    }

    pub(crate) fn lru_snapshot(&self) -> Vec<Arc<Lock>> {
        self.lru.lock().list.iter().cloned().collect()
    }

    // -------- server pool view --------

    pub fn pool(&self) -> PoolState {
        *self.pool.read()
    }

    pub(crate) fn set_pool(&self, slv: u64, limit: u32) {
        let mut pool = self.pool.write();
        pool.slv = slv;
        pool.limit = limit;
    }

    pub fn set_pool_lvf(&self, lvf: u64) {
        self.pool.write().lvf = lvf;
    }

    pub(crate) fn set_pool_clv(&self, clv: u64) {
        self.pool.write().clv = clv;
    }

    // -------- adaptive timeout --------

    /// Feed one observed grant delay into the estimator.
    pub fn at_measured(&self, delay_secs: u64) {
        let now = self.coarse_now();
        self.estimator.lock().measured(now, delay_secs);
    }

    pub fn at_estimate_secs(&self) -> u64 {
        self.estimator.lock().estimate()
    }

    pub fn at_samples(&self) -> u64 {
        self.estimator.lock().samples()
    }
}
