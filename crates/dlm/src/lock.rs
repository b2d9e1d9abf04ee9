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

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tracing::debug;

use crate::error::Result;
use crate::flags::LockFlags;
use crate::import::Export;
use crate::namespace::Namespace;
use crate::resource::{Resource, ResourceLists};
use crate::rpc::LockDescriptor;
use crate::types::{LockHandle, LockKind, LockMode, PolicyData, RemoteHandle, ResourceName};

/// Which list a lock currently belongs to. A lock is on at most one list
/// at any time; the variant is the single source of truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListState {
    Detached,
    /// On its resource's granted list.
    Granted,
    /// On its resource's waiting list.
    Waiting,
    /// Cached with no users, on the namespace LRU.
    UnusedLru,
    /// Claimed by a cancel/eviction batch being assembled.
    BlAst,
    /// Claimed by the replay driver.
    PendingChain,
}

/// Phase reported to a blocking callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockingPhase {
    /// A conflicting request exists; yield when convenient.
    Blocking,
    /// The lock is being cancelled right now.
    Canceling,
}

/// Completion notification handler; the waiting and non-waiting engine
/// variants both implement this, and callers may wrap either.
#[async_trait]
pub trait CompletionAst: Send + Sync + std::fmt::Debug {
    /// Runs once per enqueue reply and once per inbound completion.
    /// `flags` are the effective flags at invocation time.
    async fn completion(&self, lock: &Arc<Lock>, flags: LockFlags) -> Result<()>;
}

pub type BlockingCallback = Arc<dyn Fn(&Arc<Lock>, BlockingPhase) + Send + Sync>;
pub type GlimpseCallback = Arc<dyn Fn(&Arc<Lock>) -> Option<Bytes> + Send + Sync>;

/// The capability set attached to a lock at creation.
#[derive(Clone)]
pub struct LockCallbacks {
    pub completion: Arc<dyn CompletionAst>,
    pub blocking: Option<BlockingCallback>,
    pub glimpse: Option<GlimpseCallback>,
}

impl std::fmt::Debug for LockCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockCallbacks")
            .field("completion", &self.completion)
            .field("blocking", &self.blocking.is_some())
            .field("glimpse", &self.glimpse.is_some())
            .finish()
    }
}

/// Mutable lock state, guarded by the per-lock mutex. Fields follow the
/// resource-lock/lock-lock discipline: take the resource lists first when
/// both are needed.
#[derive(Debug)]
pub struct LockState {
    pub(crate) resource: Weak<Resource>,
    pub(crate) res_name: ResourceName,
    pub(crate) remote_handle: Option<RemoteHandle>,
    pub(crate) req_mode: LockMode,
    pub(crate) granted_mode: Option<LockMode>,
    pub(crate) policy: Option<PolicyData>,
    pub(crate) flags: LockFlags,
    pub(crate) lvb: Option<Bytes>,
    pub(crate) lvb_cap: usize,
    pub(crate) readers: u32,
    pub(crate) writers: u32,
    /// Wall seconds of the last enqueue or cancel attempt.
    pub(crate) last_activity: u64,
    /// Start of the most recent enqueue, for grant latency measurement.
    pub(crate) enqueued_at: tokio::time::Instant,
    /// Coarse wall seconds when the user count last fell to zero.
    pub(crate) last_used: u64,
    pub(crate) list: ListState,
    pub(crate) conn: Weak<Export>,
}

/// A client-cached lock.
pub struct Lock {
    handle: LockHandle,
    kind: LockKind,
    ns: Weak<Namespace>,
    callbacks: LockCallbacks,
    /// Wake-up slot for completion waiters.
    pub(crate) waitq: Notify,
    pub(crate) state: Mutex<LockState>,
}

impl std::fmt::Debug for Lock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("Lock")
            .field("handle", &self.handle)
            .field("kind", &self.kind)
            .field("res", &st.res_name)
            .field("req_mode", &st.req_mode)
            .field("granted_mode", &st.granted_mode)
            .field("flags", &st.flags)
            .field("list", &st.list)
            .finish()
    }
}

impl Lock {
    pub(crate) fn new(
        ns: &Arc<Namespace>,
        resource: &Arc<Resource>,
        handle: LockHandle,
        kind: LockKind,
        mode: LockMode,
        callbacks: LockCallbacks,
        lvb_cap: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            handle,
            kind,
            ns: Arc::downgrade(ns),
            callbacks,
            waitq: Notify::new(),
            state: Mutex::new(LockState {
                resource: Arc::downgrade(resource),
                res_name: resource.name(),
                remote_handle: None,
                req_mode: mode,
                granted_mode: None,
                policy: None,
                flags: LockFlags::empty(),
                lvb: None,
                lvb_cap,
                readers: 0,
                writers: 0,
                last_activity: 0,
                enqueued_at: tokio::time::Instant::now(),
                last_used: 0,
                list: ListState::Detached,
                conn: Weak::new(),
            }),
        })
    }

    pub fn handle(&self) -> LockHandle {
        self.handle
    }

    pub fn kind(&self) -> LockKind {
        self.kind
    }

    pub fn callbacks(&self) -> &LockCallbacks {
        &self.callbacks
    }

    pub(crate) fn namespace(&self) -> Option<Arc<Namespace>> {
        self.ns.upgrade()
    }

    /// The connection this lock's server is reached through.
    pub fn export(&self) -> Option<Arc<Export>> {
        self.state.lock().conn.upgrade()
    }

    pub fn remote_handle(&self) -> Option<RemoteHandle> {
        self.state.lock().remote_handle
    }

    pub fn granted_mode(&self) -> Option<LockMode> {
        self.state.lock().granted_mode
    }

    pub fn req_mode(&self) -> LockMode {
        self.state.lock().req_mode
    }

    pub fn flags(&self) -> LockFlags {
        self.state.lock().flags
    }

    pub fn list_state(&self) -> ListState {
        self.state.lock().list
    }

    /// Current value block contents, if the server shipped any.
    pub fn lvb(&self) -> Option<Bytes> {
        self.state.lock().lvb.clone()
    }

    /// Run the glimpse callback to produce a value block for the server.
    pub fn glimpse_lvb(self: &Arc<Self>) -> Option<Bytes> {
        let cb = self.callbacks.glimpse.clone()?;
        cb(self)
    }

    /// Run `f` under the lock's own mutex.
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut LockState) -> R) -> R {
        f(&mut self.state.lock())
    }

    /// Run `f` under the resource lists and the lock mutex, in that order.
    /// Retries if the lock migrates to another resource mid-acquisition;
    /// passes `None` for the lists when the resource is already gone.
    pub(crate) fn with_res_and_state<R>(
        self: &Arc<Self>,
        f: impl FnOnce(Option<&mut ResourceLists>, &mut LockState) -> R,
    ) -> R {
        loop {
            let res = self.state.lock().resource.upgrade();
            match res {
                None => {
                    let mut st = self.state.lock();
                    if st.resource.upgrade().is_some() {
                        continue;
                    }
                    return f(None, &mut st);
                }
                Some(res) => {
                    let mut lists = res.lists.lock();
                    let mut st = self.state.lock();
                    match st.resource.upgrade() {
                        Some(current) if Arc::ptr_eq(&current, &res) => return f(Some(&mut lists), &mut st),
                        _ => continue,
                    }
                }
            }
        }
    }

    /// Take a user reference in the given mode.
    pub fn addref(self: &Arc<Self>, mode: LockMode) {
        self.with_state(|st| {
            if mode.is_reader() {
                st.readers += 1;
            }
            if mode.is_writer() {
                st.writers += 1;
            }
        });
    }

    /// Drop a user reference. When the count reaches zero the lock either
    /// parks on the unused LRU or, if a cancel promise is outstanding and
    /// the server must not hear about it, dies on the spot.
    pub fn decref(self: &Arc<Self>, mode: LockMode) {
        let ns = self.ns.upgrade();
        let destroyed = self.with_res_and_state(|lists, st| {
            if mode.is_reader() {
                st.readers = st.readers.saturating_sub(1);
            }
            if mode.is_writer() {
                st.writers = st.writers.saturating_sub(1);
            }
            if st.readers != 0 || st.writers != 0 {
                return false;
            }
            if st.flags.contains(LockFlags::CBPENDING) {
                if st.flags.intersects(LockFlags::LOCAL_ONLY | LockFlags::ATOMIC_CB) {
                    self.destroy_nolock(ns.as_ref(), lists, st);
                    return true;
                }
                debug!(handle = self.handle.cookie, "idle with cancel pending, leaving for the cancel path");
                return false;
            }
            if st.flags.contains(LockFlags::NO_LRU) || st.flags.contains(LockFlags::CANCELING) {
                return false;
            }
            if st.list == ListState::Granted {
                if let (Some(ns), Some(lists)) = (ns.as_ref(), lists) {
                    lists.granted.retain(|l| !Arc::ptr_eq(l, self));
                    st.list = ListState::UnusedLru;
                    st.last_used = ns.coarse_now();
                    ns.lru_push(self.clone());
                }
            }
            false
        });
        if destroyed {
            self.waitq.notify_waiters();
        }
    }

    /// Whether a completion waiter is done waiting, for good or ill.
    pub fn is_granted_or_cancelled(&self) -> bool {
        let st = self.state.lock();
        st.granted_mode == Some(st.req_mode)
            || st.flags.intersects(LockFlags::FAILED | LockFlags::CANCELING | LockFlags::DESTROYED)
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.lock().flags.contains(LockFlags::DESTROYED)
    }

    /// Snapshot this lock as a wire descriptor.
    pub fn descriptor(&self) -> LockDescriptor {
        let st = self.state.lock();
        LockDescriptor {
            resource: st.res_name,
            kind: self.kind,
            req_mode: st.req_mode,
            granted_mode: st.granted_mode,
            policy: st.policy,
        }
    }

    /// Grant under the double lock: record the mode and move the lock onto
    /// its resource's granted list.
    pub(crate) fn grant_nolock(self: &Arc<Self>, lists: Option<&mut ResourceLists>, st: &mut LockState, mode: LockMode) {
        st.granted_mode = Some(mode);
        if let Some(lists) = lists {
            match st.list {
                ListState::Waiting => {
                    lists.waiting.retain(|l| !Arc::ptr_eq(l, self));
                    lists.granted.push(self.clone());
                    st.list = ListState::Granted;
                }
                ListState::Detached => {
                    lists.granted.push(self.clone());
                    st.list = ListState::Granted;
                }
                _ => {}
            }
        }
    }

    /// Tear the lock down under the double lock: off every list, out of the
    /// handle and server-cookie tables, flagged destroyed.
    pub(crate) fn destroy_nolock(
        self: &Arc<Self>,
        ns: Option<&Arc<Namespace>>,
        lists: Option<&mut ResourceLists>,
        st: &mut LockState,
    ) {
        if st.flags.contains(LockFlags::DESTROYED) {
            return;
        }
        match st.list {
            ListState::Granted => {
                if let Some(lists) = lists {
                    lists.granted.retain(|l| !Arc::ptr_eq(l, self));
                }
            }
            ListState::Waiting => {
                if let Some(lists) = lists {
                    lists.waiting.retain(|l| !Arc::ptr_eq(l, self));
                }
            }
            ListState::UnusedLru => {
                if let Some(ns) = ns {
                    ns.lru_remove(self);
                }
            }
            // Batch and chain vectors drop their references themselves.
            ListState::BlAst | ListState::PendingChain | ListState::Detached => {}
        }
        st.list = ListState::Detached;
        st.flags.insert(LockFlags::DESTROYED);
        if let Some(ns) = ns {
            ns.remove_handle(self.handle.cookie);
        }
        if let Some(export) = st.conn.upgrade() {
            export.unhash_lock(st.remote_handle);
        }
    }

    /// Cancel the client side of the lock without telling the server:
    /// unlink, destroy, wake any waiter.
    pub(crate) fn cancel_client_side(self: &Arc<Self>) {
        let ns = self.ns.upgrade();
        self.with_res_and_state(|lists, st| {
            self.destroy_nolock(ns.as_ref(), lists, st);
        });
        self.waitq.notify_waiters();
    }

    /// Run the cancel callback exactly once.
    pub(crate) fn run_cancel_callback(self: &Arc<Self>) {
        let run = self.with_state(|st| {
            if st.flags.contains(LockFlags::CANCEL) {
                false
            } else {
                st.flags.insert(LockFlags::CANCEL);
                true
            }
        });
        if run {
            if let Some(blocking) = self.callbacks.blocking.clone() {
                blocking(self, BlockingPhase::Canceling);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enqueue::SyncCompletion;
    use crate::tests::support::{test_lock_on, test_namespace};
    use crate::types::ResourceName;

    #[tokio::test]
    async fn test_addref_decref_moves_to_lru() {
        let ns = test_namespace();
        let lock = test_lock_on(&ns, ResourceName::new([7, 0, 0, 0]), LockMode::Pr);
        lock.addref(LockMode::Pr);
        lock.with_res_and_state(|lists, st| {
            lock.grant_nolock(lists, st, LockMode::Pr);
        });
        assert_eq!(lock.list_state(), ListState::Granted);

        lock.decref(LockMode::Pr);
        assert_eq!(lock.list_state(), ListState::UnusedLru);
        assert_eq!(ns.nr_unused(), 1);
    }

    #[tokio::test]
    async fn test_decref_respects_no_lru() {
        let ns = test_namespace();
        let lock = test_lock_on(&ns, ResourceName::new([8, 0, 0, 0]), LockMode::Pw);
        lock.addref(LockMode::Pw);
        lock.with_res_and_state(|lists, st| {
            st.flags.insert(LockFlags::NO_LRU);
            lock.grant_nolock(lists, st, LockMode::Pw);
        });
        lock.decref(LockMode::Pw);
        assert_eq!(lock.list_state(), ListState::Granted);
        assert_eq!(ns.nr_unused(), 0);
    }

    #[tokio::test]
    async fn test_decref_with_local_cancel_pending_destroys() {
        let ns = test_namespace();
        let lock = test_lock_on(&ns, ResourceName::new([9, 0, 0, 0]), LockMode::Pr);
        lock.addref(LockMode::Pr);
        lock.with_state(|st| {
            st.flags.insert(LockFlags::CBPENDING | LockFlags::LOCAL_ONLY);
        });
        lock.decref(LockMode::Pr);
        assert!(lock.is_destroyed());
        assert!(ns.handle2lock(&lock.handle()).is_none());
    }

    #[tokio::test]
    async fn test_cancel_callback_runs_once() {
        use std::sync::atomic::{AtomicU32, Ordering};
        let ns = test_namespace();
        let calls = Arc::new(AtomicU32::new(0));
        let counted = calls.clone();
        let callbacks = LockCallbacks {
            completion: SyncCompletion::new(),
            blocking: Some(Arc::new(move |_lock, phase| {
                assert_eq!(phase, BlockingPhase::Canceling);
                counted.fetch_add(1, Ordering::SeqCst);
            })),
            glimpse: None,
        };
        let res = ns.resource_get(ResourceName::new([10, 0, 0, 0]), LockKind::Plain, true).unwrap();
        let lock = ns.new_lock(&res, LockKind::Plain, LockMode::Pr, callbacks, 0);
        lock.run_cancel_callback();
        lock.run_cancel_callback();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_destroyed_lock_unreachable_via_handle() {
        let ns = test_namespace();
        let lock = test_lock_on(&ns, ResourceName::new([11, 0, 0, 0]), LockMode::Cr);
        let handle = lock.handle();
        assert!(ns.handle2lock(&handle).is_some());
        lock.cancel_client_side();
        assert!(ns.handle2lock(&handle).is_none());
        // The Arc itself still answers queries on the shell.
        assert!(lock.is_destroyed());
    }
}
