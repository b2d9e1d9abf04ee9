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
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::lock::Lock;
use crate::namespace::Namespace;
use crate::rpc::{Transport, WorkQueue};
use crate::types::RemoteHandle;

/// Recovery-relevant things the import was asked to do. The reconnection
/// state machine itself lives outside the engine; it drains these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportEvent {
    /// A completion wait expired; the named connection generation is stale.
    Fail { generation: u32 },
    /// A replay reply failed; a fresh connection is needed.
    Reconnect,
    /// One replayed lock was acknowledged by the server.
    RecoveryAdvance,
}

/// Client view of one server connection.
#[derive(Debug)]
pub struct Import {
    transport: Arc<dyn Transport>,
    queue: Arc<dyn WorkQueue>,
    generation: AtomicU32,
    invalid: AtomicBool,
    /// Version-based recovery already ruled this client out.
    vbr_failed: AtomicBool,
    replay_inflight: AtomicU32,
    events: Mutex<Vec<ImportEvent>>,
}

impl Import {
    pub fn new(transport: Arc<dyn Transport>, queue: Arc<dyn WorkQueue>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            queue,
            generation: AtomicU32::new(1),
            invalid: AtomicBool::new(false),
            vbr_failed: AtomicBool::new(false),
            replay_inflight: AtomicU32::new(0),
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn queue(&self) -> &Arc<dyn WorkQueue> {
        &self.queue
    }

    /// Connection generation; bumped by every reconnect.
    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn bump_generation(&self) -> u32 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::Acquire)
    }

    pub fn invalidate(&self) {
        self.invalid.store(true, Ordering::Release);
    }

    pub fn vbr_failed(&self) -> bool {
        self.vbr_failed.load(Ordering::Acquire)
    }

    pub fn set_vbr_failed(&self) {
        self.vbr_failed.store(true, Ordering::Release);
    }

    pub fn replay_inflight(&self) -> u32 {
        self.replay_inflight.load(Ordering::Acquire)
    }

    pub(crate) fn replay_inflight_inc(&self) {
        self.replay_inflight.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn replay_inflight_dec(&self) {
        self.replay_inflight.fetch_sub(1, Ordering::AcqRel);
    }

    /// Report that the connection identified by `generation` went dark.
    /// A reconnect that already moved past that generation ignores it.
    pub fn fail(&self, generation: u32) {
        warn!(generation, "import failed, entering recovery");
        self.events.lock().push(ImportEvent::Fail { generation });
    }

    /// Ask the reconnection machinery for a new connection.
    pub fn request_reconnect(&self) {
        info!("requesting reconnect");
        self.events.lock().push(ImportEvent::Reconnect);
    }

    /// One replayed lock acknowledged; recovery may move forward.
    pub fn recovery_advance(&self) {
        self.events.lock().push(ImportEvent::RecoveryAdvance);
    }

    /// Drain recorded recovery events.
    pub fn take_events(&self) -> Vec<ImportEvent> {
        std::mem::take(&mut *self.events.lock())
    }
}

/// Capabilities the server advertised at connect time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectCaps {
    /// Cancel handles may piggyback on other lock requests.
    pub cancelset: bool,
    /// Server drives the unused-lock cache size through SLV feedback.
    pub lru_resize: bool,
}

/// The connection a lock's server is reached through.
#[derive(Debug)]
pub struct Export {
    import: Arc<Import>,
    namespace: Arc<Namespace>,
    /// Server-cookie index of live locks; rekeyed when the server issues a
    /// new handle, atomically with respect to lookups.
    lock_hash: RwLock<HashMap<u64, Arc<Lock>>>,
}

impl Export {
    pub fn new(import: Arc<Import>, namespace: Arc<Namespace>, caps: ConnectCaps) -> Arc<Self> {
        namespace.set_connect_caps(caps);
        Arc::new(Self {
            import,
            namespace,
            lock_hash: RwLock::new(HashMap::new()),
        })
    }

    pub fn import(&self) -> &Arc<Import> {
        &self.import
    }

    pub fn namespace(&self) -> &Arc<Namespace> {
        &self.namespace
    }

    /// Find a live lock by its server cookie.
    pub fn lock_by_remote(&self, remote: RemoteHandle) -> Option<Arc<Lock>> {
        self.lock_hash.read().get(&remote.0).cloned()
    }

    /// Rekey `lock` from `old` to `new` in one critical section, so no
    /// lookup ever sees both or neither.
    pub fn rehash_lock(&self, old: Option<RemoteHandle>, new: RemoteHandle, lock: &Arc<Lock>) {
        let mut hash = self.lock_hash.write();
        if let Some(old) = old {
            hash.remove(&old.0);
        }
        hash.insert(new.0, lock.clone());
    }

    /// Drop a lock from the server-cookie index.
    pub fn unhash_lock(&self, remote: Option<RemoteHandle>) {
        if let Some(remote) = remote {
            self.lock_hash.write().remove(&remote.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_import_events() {
        let import = crate::tests::support::test_import();
        assert_eq!(import.generation(), 1);
        import.fail(1);
        import.bump_generation();
        import.request_reconnect();
        let events = import.take_events();
        assert_eq!(events, vec![ImportEvent::Fail { generation: 1 }, ImportEvent::Reconnect]);
        assert!(import.take_events().is_empty());
        assert_eq!(import.generation(), 2);
    }

    #[test]
    fn test_replay_inflight_counter() {
        let import = crate::tests::support::test_import();
        import.replay_inflight_inc();
        import.replay_inflight_inc();
        import.replay_inflight_dec();
        assert_eq!(import.replay_inflight(), 1);
        import.replay_inflight_dec();
        assert_eq!(import.replay_inflight(), 0);
    }
}
