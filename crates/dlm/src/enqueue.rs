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

//! Client-side lock enqueue and the completion notifications that resolve
//! it. A lock request is sent to the server, the caller parks until the
//! grant (or refusal) arrives, and the reply is reconciled against
//! whatever the server rewrote.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, error};

use crate::error::{DlmError, Result};
use crate::flags::LockFlags;
use crate::import::Export;
use crate::lock::{CompletionAst, ListState, Lock, LockCallbacks};
use crate::namespace::Namespace;
use crate::rpc::{EnqueueRequest, LockDescriptor, ReplyStatus, RpcReply, RpcRequest};
use crate::types::{LockHandle, LockKind, LockMode, PolicyData, RemoteHandle, ResourceName};

/// Everything a caller supplies to open a lock request.
#[derive(Debug, Clone)]
pub struct EnqueueInfo {
    pub kind: LockKind,
    pub mode: LockMode,
    pub callbacks: LockCallbacks,
}

/// An enqueue prepared but not sent; the caller owns sending the request
/// and feeding the outcome back through [`enqueue_fini`].
#[derive(Debug)]
pub struct PreparedEnqueue {
    pub handle: LockHandle,
    pub request: RpcRequest,
    pub mode: LockMode,
    pub with_policy: bool,
    pub lvb_cap: usize,
}

fn wall_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Completion wait timeout: generous, because the server may first have
/// to call the lock back from another client.
fn cp_timeout(ns: &Namespace) -> Duration {
    if !ns.config().adaptive_timeout {
        return ns.config().default_timeout;
    }
    let scaled = 3 * ns.at_estimate_secs();
    Duration::from_secs(scaled.max(ns.config().enqueue_min.as_secs()))
}

/// Post-wake bookkeeping shared by both completion variants. `waited` is
/// set when the caller actually parked, in which case the observed delay
/// feeds the adaptive estimator.
fn completion_tail(lock: &Arc<Lock>, waited: bool) -> Result<()> {
    let (flags, granted, delay) = lock.with_state(|st| {
        (
            st.flags,
            st.granted_mode == Some(st.req_mode),
            st.enqueued_at.elapsed().as_secs(),
        )
    });
    if !granted && flags.contains(LockFlags::CANCELING) && !flags.contains(LockFlags::FAILED) {
        debug!(handle = lock.handle().cookie, "client-side enqueue: interrupted by cancel");
        return Err(DlmError::Interrupted);
    }
    if flags.is_gone() {
        debug!(handle = lock.handle().cookie, "client-side enqueue: destroyed");
        return Err(DlmError::io("lock destroyed or failed while enqueued"));
    }
    if waited {
        debug!(handle = lock.handle().cookie, delay, "client-side enqueue: granted after wait");
        if let Some(ns) = lock.namespace() {
            ns.at_measured(delay);
        }
    } else {
        debug!(handle = lock.handle().cookie, "client-side enqueue: granted");
    }
    Ok(())
}

/// The waiting completion handler. Parks the caller until the lock is
/// granted or torn down; the wake comes from the reply path or from an
/// inbound completion notification.
#[derive(Debug, Default)]
pub struct SyncCompletion;

impl SyncCompletion {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

#[async_trait]
impl CompletionAst for SyncCompletion {
    async fn completion(&self, lock: &Arc<Lock>, flags: LockFlags) -> Result<()> {
        if flags != LockFlags::WAIT_NOREPROC {
            if !flags.is_blocked() {
                lock.waitq.notify_waiters();
                return Ok(());
            }
            debug!(handle = lock.handle().cookie, "enqueue returned a blocked lock, sleeping");
        } else {
            debug!(handle = lock.handle().cookie, "waiting on pending lock");
        }

        let ns = lock
            .namespace()
            .ok_or_else(|| DlmError::internal("lock outlived its namespace"))?;
        let no_timeout = lock.flags().contains(LockFlags::NO_TIMEOUT);
        let timeout = cp_timeout(&ns);
        lock.with_state(|st| st.last_activity = wall_now());

        // Snapshot the connection generation before sleeping so a timeout
        // reports the connection we waited on, not one a concurrent
        // reconnect installed meanwhile.
        let export = lock.export();
        let import = export.as_ref().map(|e| e.import().clone());
        let conn_generation = import.as_ref().map(|imp| imp.generation());

        let mut deadline = if no_timeout {
            debug!(handle = lock.handle().cookie, "waiting indefinitely because of NO_TIMEOUT");
            None
        } else {
            Some(tokio::time::Instant::now() + timeout)
        };

        loop {
            let notified = lock.waitq.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if lock.is_granted_or_cancelled() {
                break;
            }
            match deadline {
                Some(at) => {
                    if tokio::time::timeout_at(at, notified).await.is_err() {
                        match (&import, conn_generation) {
                            (Some(import), Some(generation)) => {
                                error!(
                                    handle = lock.handle().cookie,
                                    generation, "lock timed out, entering recovery"
                                );
                                import.fail(generation);
                                return Err(DlmError::timeout("lock completion wait expired"));
                            }
                            _ => {
                                // No server behind this lock; nothing to
                                // recover, keep sleeping.
                                error!(handle = lock.handle().cookie, "local lock timed out, going back to sleep");
                                deadline = None;
                            }
                        }
                    }
                }
                None => notified.await,
            }
        }
        completion_tail(lock, true)
    }
}

/// The non-waiting completion handler, for callers that cannot block.
#[derive(Debug, Default)]
pub struct AsyncCompletion;

impl AsyncCompletion {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

#[async_trait]
impl CompletionAst for AsyncCompletion {
    async fn completion(&self, lock: &Arc<Lock>, flags: LockFlags) -> Result<()> {
        if flags == LockFlags::WAIT_NOREPROC {
            debug!(handle = lock.handle().cookie, "waiting on pending lock");
            return Ok(());
        }
        if !flags.is_blocked() {
            lock.waitq.notify_waiters();
            return completion_tail(lock, false);
        }
        debug!(handle = lock.handle().cookie, "enqueue returned a blocked lock, going forward");
        Ok(())
    }
}

/// Stamp a lock that will never be granted so any racing server
/// notification is answered with an error instead of a cancel, then drop
/// the caller's mode. Flock locks die outright, having no client-side
/// blocking path to finish the job later.
pub(crate) fn failed_lock_cleanup(ns: &Arc<Namespace>, lock: &Arc<Lock>, mode: LockMode) {
    let need_cancel = lock.with_res_and_state(|_, st| {
        if st.granted_mode != Some(st.req_mode) && !st.flags.contains(LockFlags::FAILED) {
            st.flags
                .insert(LockFlags::LOCAL_ONLY | LockFlags::FAILED | LockFlags::ATOMIC_CB | LockFlags::CBPENDING);
            true
        } else {
            false
        }
    });
    if need_cancel {
        debug!(handle = lock.handle().cookie, "marked LOCAL_ONLY|FAILED|ATOMIC_CB|CBPENDING");
    } else {
        debug!(handle = lock.handle().cookie, "lock was granted or failed in race");
    }
    lock.waitq.notify_waiters();

    if lock.kind() == LockKind::Flock {
        lock.with_res_and_state(|lists, st| {
            if !st.flags.contains(LockFlags::DESTROYED) {
                if mode.is_reader() {
                    st.readers = st.readers.saturating_sub(1);
                }
                if mode.is_writer() {
                    st.writers = st.writers.saturating_sub(1);
                }
                lock.destroy_nolock(Some(ns), lists, st);
            }
        });
    } else {
        lock.decref(mode);
    }
}

/// Install a reconciled lock into the namespace: granted when the reply
/// says so, parked on the waiting list when the grant is still to come.
fn lock_enqueue(lock: &Arc<Lock>, flags: LockFlags) {
    lock.with_res_and_state(|lists, st| {
        if st.flags.contains(LockFlags::DESTROYED) {
            return;
        }
        if st.granted_mode == Some(st.req_mode) {
            // A completion notification raced ahead of the reply.
            let mode = st.req_mode;
            lock.grant_nolock(lists, st, mode);
        } else if flags.is_blocked() {
            if st.list == ListState::Detached {
                if let Some(lists) = lists {
                    lists.waiting.push(lock.clone());
                    st.list = ListState::Waiting;
                }
            }
        } else {
            let mode = st.req_mode;
            lock.grant_nolock(lists, st, mode);
        }
    });
}

/// Finishing portion of the client enqueue, run on the reply.
///
/// Reconciles the server's view into the local lock: remote handle,
/// inherited flags, a possibly rewritten mode/resource/policy, an LVB,
/// and finally installation plus one completion callback invocation.
pub async fn enqueue_fini(
    export: &Arc<Export>,
    handle: LockHandle,
    mode: LockMode,
    with_policy: bool,
    is_replay: bool,
    lvb_cap: usize,
    outcome: Result<RpcReply>,
) -> Result<(LockFlags, Option<Bytes>)> {
    let ns = export.namespace();
    let Some(lock) = ns.handle2lock(&handle) else {
        // Only flock teardown legitimately beats us here.
        return Err(DlmError::no_lock(handle.cookie));
    };

    let reply = match outcome {
        Ok(reply) => reply,
        Err(err) => {
            debug!(handle = handle.cookie, %err, "client-side enqueue END (FAILED)");
            failed_lock_cleanup(ns, &lock, mode);
            return Err(err);
        }
    };

    if lvb_cap > 0 {
        let replied = reply.lvb.as_ref().map(|b| b.len()).unwrap_or(0);
        if replied > lvb_cap {
            error!(
                handle = handle.cookie,
                expected = lvb_cap,
                replied,
                "replied LVB is larger than expectation"
            );
            failed_lock_cleanup(ns, &lock, mode);
            return Err(DlmError::protocol("replied LVB larger than expectation"));
        }
    }

    if reply.status == ReplyStatus::LockAborted {
        debug!(handle = handle.cookie, "client-side enqueue END (ABORTED)");
        let lvb = if lvb_cap > 0 { reply.lvb.clone() } else { None };
        failed_lock_cleanup(ns, &lock, mode);
        return Err(DlmError::LockAborted { lvb });
    }

    // Lock is live on the server from here on; later failures must still
    // go through cleanup so racing notifications are turned away.
    let remote = RemoteHandle(reply.remote_handle);
    let effective = LockFlags::from_wire(reply.flags);
    lock.with_res_and_state(|_, st| {
        let old = st.remote_handle.take();
        export.rehash_lock(old, remote, &lock);
        st.remote_handle = Some(remote);
        st.flags |= effective & LockFlags::INHERIT_MASK;
    });
    debug!(handle = handle.cookie, %remote, flags = ?effective, "remote cookie recorded");

    if effective.contains(LockFlags::LOCK_CHANGED) {
        let Some(desc) = reply.desc.clone() else {
            failed_lock_cleanup(ns, &lock, mode);
            return Err(DlmError::protocol("LOCK_CHANGED reply without descriptor"));
        };
        apply_lock_change(ns, &lock, &desc, with_policy);
    }

    if effective.contains(LockFlags::AST_SENT) {
        lock.with_res_and_state(|_, st| {
            st.flags.insert(LockFlags::CBPENDING | LockFlags::BL_AST);
        });
        debug!(handle = handle.cookie, "enqueue reply includes blocking notification");
    }

    // Don't clobber an LVB a racing completion already delivered; the
    // membership check and the copy must share one critical section.
    if lvb_cap > 0 {
        lock.with_res_and_state(|_, st| {
            if st.granted_mode != Some(st.req_mode) {
                st.lvb = reply.lvb.clone();
            }
        });
    }

    if !is_replay {
        lock_enqueue(&lock, effective);
        if let Err(err) = lock.callbacks().completion.clone().completion(&lock, effective).await {
            failed_lock_cleanup(ns, &lock, mode);
            return Err(err);
        }
    }

    let caller_lvb = if lvb_cap > 0 { lock.lvb() } else { None };
    debug!(handle = handle.cookie, "client-side enqueue END");
    Ok((effective, caller_lvb))
}

fn apply_lock_change(ns: &Arc<Namespace>, lock: &Arc<Lock>, desc: &LockDescriptor, with_policy: bool) {
    let (old_mode, old_res) = lock.with_state(|st| (st.req_mode, st.res_name));
    if desc.req_mode != old_mode {
        debug!(handle = lock.handle().cookie, mode = %desc.req_mode, "server returned different mode");
        lock.with_state(|st| st.req_mode = desc.req_mode);
    }
    if desc.resource != old_res {
        debug!(
            handle = lock.handle().cookie,
            old = %old_res,
            new = %desc.resource,
            "remote intent success, locking different resource"
        );
        ns.change_resource(lock, desc.resource);
    }
    if with_policy {
        lock.with_state(|st| st.policy = desc.policy);
    }
}

/// Client-side lock enqueue.
///
/// With `REPLAY` set the handle must already exist and only invariants are
/// checked; otherwise a fresh lock is created with the supplied callback
/// set and one user reference. The request carries piggybacked cancels
/// when the connection allows it. Parks in the completion handler until
/// the grant settles.
pub async fn enqueue(
    export: &Arc<Export>,
    einfo: &EnqueueInfo,
    res_id: ResourceName,
    policy: Option<PolicyData>,
    flags: LockFlags,
    lvb_cap: usize,
    replay_of: Option<LockHandle>,
) -> Result<(LockHandle, LockFlags, Option<Bytes>)> {
    let (lock, request) = enqueue_start(export, einfo, res_id, policy, flags, lvb_cap, replay_of).await?;
    let handle = lock.handle();

    debug!(handle = handle.cookie, "sending request");
    let outcome = export.import().transport().send_and_wait(request).await;
    if let Ok(reply) = &outcome {
        crate::lru::update_pool(export.namespace(), reply);
    }

    let is_replay = flags.contains(LockFlags::REPLAY);
    let (effective, lvb) = enqueue_fini(export, handle, einfo.mode, policy.is_some(), is_replay, lvb_cap, outcome).await?;
    Ok((handle, effective, lvb))
}

/// Prepare an enqueue but leave sending to the caller, who owns completion.
pub async fn enqueue_async(
    export: &Arc<Export>,
    einfo: &EnqueueInfo,
    res_id: ResourceName,
    policy: Option<PolicyData>,
    flags: LockFlags,
    lvb_cap: usize,
) -> Result<PreparedEnqueue> {
    let (lock, request) = enqueue_start(export, einfo, res_id, policy, flags, lvb_cap, None).await?;
    Ok(PreparedEnqueue {
        handle: lock.handle(),
        request,
        mode: einfo.mode,
        with_policy: policy.is_some(),
        lvb_cap,
    })
}

async fn enqueue_start(
    export: &Arc<Export>,
    einfo: &EnqueueInfo,
    res_id: ResourceName,
    policy: Option<PolicyData>,
    flags: LockFlags,
    lvb_cap: usize,
    replay_of: Option<LockHandle>,
) -> Result<(Arc<Lock>, RpcRequest)> {
    let ns = export.namespace();
    let is_replay = flags.contains(LockFlags::REPLAY);

    let lock = if is_replay {
        let handle = replay_of.ok_or_else(|| DlmError::inval("replay enqueue without a handle"))?;
        let lock = ns.handle2lock(&handle).ok_or_else(|| DlmError::no_lock(handle.cookie))?;
        debug!(handle = handle.cookie, "client-side enqueue START (replay)");
        lock
    } else {
        if einfo.kind == LockKind::Extent && policy.is_none() {
            return Err(DlmError::inval("extent lock without policy"));
        }
        if let Some(policy) = &policy {
            if !policy.matches_kind(einfo.kind) {
                return Err(DlmError::inval("policy data does not match lock type"));
            }
        }
        let resource = ns
            .resource_get(res_id, einfo.kind, true)
            .ok_or_else(|| DlmError::no_mem("resource allocation failed"))?;
        let lock = ns.new_lock(&resource, einfo.kind, einfo.mode, einfo.callbacks.clone(), lvb_cap);
        lock.addref(einfo.mode);
        lock.with_state(|st| st.policy = policy);
        debug!(handle = lock.handle().cookie, flags = ?flags, "client-side enqueue START");
        lock
    };

    lock.with_state(|st| {
        st.conn = Arc::downgrade(export);
        st.flags |= flags & (LockFlags::NO_LRU | LockFlags::EXCL);
        st.last_activity = wall_now();
        st.enqueued_at = tokio::time::Instant::now();
    });

    let piggyback = match crate::cancel::prep_enqueue_req(export).await {
        Ok(handles) => handles,
        Err(err) => {
            failed_lock_cleanup(ns, &lock, einfo.mode);
            return Err(err);
        }
    };

    let mut handles = Vec::with_capacity(1 + piggyback.len());
    handles.push(lock.handle().cookie);
    handles.extend(piggyback);
    let request = RpcRequest::enqueue(EnqueueRequest {
        desc: lock.descriptor(),
        flags: flags.to_wire(),
        handles,
        lvb_cap,
    });
    Ok((lock, request))
}

/// Inbound completion notification: the server granted a lock we were
/// waiting on. Applies the descriptor, stores the LVB, and runs the
/// lock's completion callback, which wakes the parked enqueuer.
pub async fn handle_cp_callback(
    export: &Arc<Export>,
    handle: LockHandle,
    desc: Option<LockDescriptor>,
    lvb: Option<Bytes>,
) -> Result<()> {
    let ns = export.namespace();
    let lock = ns.handle2lock(&handle).ok_or_else(|| DlmError::no_lock(handle.cookie))?;
    debug!(handle = handle.cookie, "completion notification");
    lock.with_res_and_state(|lists, st| {
        if let Some(lvb) = &lvb {
            st.lvb = Some(lvb.clone());
        }
        let mode = desc.as_ref().and_then(|d| d.granted_mode).unwrap_or(st.req_mode);
        lock.grant_nolock(lists, st, mode);
    });
    lock.callbacks().completion.clone().completion(&lock, LockFlags::empty()).await
}
