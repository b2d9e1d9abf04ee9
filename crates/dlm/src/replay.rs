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

//! Lock replay after a reconnect: reproduce every lock the client still
//! believes in to the server, in a disciplined order, skipping what the
//! server can no longer honor.

use std::sync::Arc;
use tracing::{debug, error};

use crate::error::{DlmError, Result};
use crate::flags::{CancelFlags, LockFlags, LruFlags};
use crate::import::Export;
use crate::lock::{ListState, Lock};
use crate::namespace::Namespace;
use crate::rpc::{EnqueueRequest, MsgFlags, ReplyStatus, RpcReply, RpcRequest, SendState};
use crate::types::RemoteHandle;

/// The client's view of a lock at collection time, deciding its replay
/// flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplayDisposition {
    /// Granted in the requested mode.
    Granted,
    /// Granted, but in another mode than requested.
    Converting,
    /// Still waiting for the grant.
    Waiting,
    /// No reply ever arrived; the enqueue itself triggered recovery.
    NoReply,
}

/// Where the lock sat before the replay chain claimed it, so the
/// interpreter can put it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PreviousList {
    Granted,
    Waiting,
    UnusedLru { last_used: u64 },
    Detached,
}

#[derive(Debug)]
struct ChainEntry {
    lock: Arc<Lock>,
    disposition: ReplayDisposition,
    previous: PreviousList,
}

/// Replay every qualifying lock of the namespace to the server.
///
/// Must not race another replay; the in-flight counter is bumped up front
/// so it cannot touch zero while locks are still being queued.
pub async fn replay_locks(export: &Arc<Export>) -> Result<()> {
    let import = export.import().clone();
    let ns = export.namespace().clone();

    if import.replay_inflight() != 0 {
        return Err(DlmError::internal("lock replay already in flight"));
    }
    if import.vbr_failed() {
        debug!("version recovery failed, not replaying locks");
        return Ok(());
    }

    import.replay_inflight_inc();

    if ns.config().cancel_unused_before_replay {
        cancel_unused_locks_for_replay(&ns).await;
    }

    let chain = chain_locks_for_replay(&ns);
    let mut rc = Ok(());
    for entry in chain {
        if rc.is_err() {
            restore_list(&ns, &entry);
            continue;
        }
        rc = replay_one_lock(export, entry);
    }

    import.replay_inflight_dec();
    rc
}

/// Shed as many unused cached locks as possible before replaying. This
/// runs with the local flag, so no RPC leaves the client and nothing can
/// deadlock against recovery; clients holding thousands of cached locks
/// would otherwise hammer the server at the worst possible time.
async fn cancel_unused_locks_for_replay(ns: &Arc<Namespace>) {
    debug!(
        namespace = ns.name(),
        nr_unused = ns.nr_unused(),
        "dropping as many unused locks as possible before replay"
    );
    let mut batch = Vec::new();
    crate::lru::cancel_lru_local(ns, &mut batch, ns.nr_unused(), 0, LruFlags::NO_WAIT, CancelFlags::LOCAL).await;
    debug!(namespace = ns.name(), nr_unused = ns.nr_unused(), "canceled unused locks");
}

/// Claim every lock worth replaying onto a private chain, capturing its
/// disposition and prior list so the reply path can restore it. Locks
/// left by eviction, mid-cancel locks and batch-claimed locks stay out.
fn chain_locks_for_replay(ns: &Arc<Namespace>) -> Vec<ChainEntry> {
    let mut chain = Vec::new();
    for lock in ns.all_locks_snapshot() {
        let entry = lock.with_res_and_state(|lists, st| {
            if st.flags.intersects(LockFlags::FAILED | LockFlags::BL_DONE | LockFlags::DESTROYED) {
                return None;
            }
            let disposition = if st.granted_mode == Some(st.req_mode) {
                ReplayDisposition::Granted
            } else if st.granted_mode.is_some() {
                ReplayDisposition::Converting
            } else if st.list == ListState::Waiting {
                ReplayDisposition::Waiting
            } else {
                ReplayDisposition::NoReply
            };
            let previous = match st.list {
                ListState::Granted => {
                    if let Some(lists) = lists {
                        lists.granted.retain(|l| !Arc::ptr_eq(l, &lock));
                    }
                    PreviousList::Granted
                }
                ListState::Waiting => {
                    if let Some(lists) = lists {
                        lists.waiting.retain(|l| !Arc::ptr_eq(l, &lock));
                    }
                    PreviousList::Waiting
                }
                ListState::UnusedLru => {
                    ns.lru_remove(&lock);
                    PreviousList::UnusedLru { last_used: st.last_used }
                }
                ListState::Detached => PreviousList::Detached,
                // Claimed by a cancel batch or an earlier chain.
                ListState::BlAst | ListState::PendingChain => return None,
            };
            st.list = ListState::PendingChain;
            Some(ChainEntry {
                lock: lock.clone(),
                disposition,
                previous,
            })
        });
        if let Some(entry) = entry {
            chain.push(entry);
        }
    }
    chain
}

fn restore_list(ns: &Arc<Namespace>, entry: &ChainEntry) {
    let lock = &entry.lock;
    lock.with_res_and_state(|lists, st| {
        if st.flags.contains(LockFlags::DESTROYED) || st.list != ListState::PendingChain {
            return;
        }
        match entry.previous {
            PreviousList::Granted => match lists {
                Some(lists) => {
                    lists.granted.push(lock.clone());
                    st.list = ListState::Granted;
                }
                None => st.list = ListState::Detached,
            },
            PreviousList::Waiting => match lists {
                Some(lists) => {
                    lists.waiting.push(lock.clone());
                    st.list = ListState::Waiting;
                }
                None => st.list = ListState::Detached,
            },
            PreviousList::UnusedLru { last_used } => {
                st.last_used = last_used;
                st.list = ListState::UnusedLru;
                ns.lru_push(lock.clone());
            }
            PreviousList::Detached => st.list = ListState::Detached,
        }
    });
}

/// Send one replay enqueue, tagged for the replay-locks connection state
/// and marked request-replay-done. The reply is handled asynchronously by
/// [`replay_interpret`].
fn replay_one_lock(export: &Arc<Export>, entry: ChainEntry) -> Result<()> {
    let ns = export.namespace().clone();
    let lock = entry.lock.clone();
    let flags = lock.flags();

    // The cancel completed while we were collecting: nothing to replay.
    if flags.contains(LockFlags::BL_DONE) {
        debug!(handle = lock.handle().cookie, "not replaying canceled lock");
        restore_list(&ns, &entry);
        return Ok(());
    }
    // A reply-less lock may be long gone on the server with the
    // notification lost in transit; reproducing it could contradict a
    // conflicting grant. Drop it instead.
    if flags.contains(LockFlags::CANCEL_ON_BLOCK) {
        debug!(handle = lock.handle().cookie, "not replaying reply-less lock");
        lock.cancel_client_side();
        return Ok(());
    }

    let replay_flags = LockFlags::REPLAY
        | match entry.disposition {
            ReplayDisposition::Granted => LockFlags::BLOCK_GRANTED,
            ReplayDisposition::Converting => LockFlags::BLOCK_CONV,
            ReplayDisposition::Waiting => LockFlags::BLOCK_WAIT,
            ReplayDisposition::NoReply => LockFlags::empty(),
        };

    let lvb_cap = lock.with_state(|st| st.lvb_cap);
    let mut request = RpcRequest::enqueue(EnqueueRequest {
        desc: lock.descriptor(),
        flags: replay_flags.to_wire(),
        handles: vec![lock.handle().cookie],
        lvb_cap,
    });
    request.send_state = SendState::ReplayLocks;
    request.msg_flags |= MsgFlags::REQ_REPLAY_DONE;

    debug!(handle = lock.handle().cookie, flags = ?replay_flags, "replaying lock");

    let import = export.import().clone();
    import.replay_inflight_inc();
    let export = export.clone();
    import.queue().clone().submit(
        request,
        Box::new(move |outcome| replay_interpret(export, entry, outcome)),
    );
    Ok(())
}

/// Reply side of one replayed lock: rekey under the fresh server cookie,
/// restore list membership, and advance import recovery. Any failure asks
/// for another reconnect.
fn replay_interpret(export: Arc<Export>, entry: ChainEntry, outcome: Result<RpcReply>) {
    let import = export.import().clone();
    import.replay_inflight_dec();

    let result = (|| -> Result<()> {
        let reply = outcome?;
        if reply.status != ReplyStatus::Success {
            return Err(DlmError::internal("server refused replayed lock"));
        }
        let ns = export.namespace();
        let handle = entry.lock.handle();
        let Some(lock) = ns.handle2lock(&handle) else {
            error!(
                cookie = handle.cookie,
                remote = reply.remote_handle,
                "received replay ack for unknown local cookie"
            );
            return Err(DlmError::stale("replay ack for unknown cookie"));
        };
        let remote = RemoteHandle(reply.remote_handle);
        let old = lock.with_state(|st| {
            let old = st.remote_handle;
            st.remote_handle = Some(remote);
            old
        });
        export.rehash_lock(old, remote, &lock);
        debug!(handle = handle.cookie, %remote, "replayed lock");
        restore_list(ns, &entry);
        import.recovery_advance();
        Ok(())
    })();

    if result.is_err() {
        import.request_reconnect();
    }
}
