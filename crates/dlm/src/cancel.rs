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

//! The cancel pipeline: local cancellation, batching of handles into
//! cancel RPCs, piggybacking onto enqueues, and the retry loop that keeps
//! a cancel alive across transport hiccups.

use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::error::{DlmError, Result};
use crate::flags::{CancelFlags, LockFlags, LruFlags};
use crate::import::Export;
use crate::lock::{ListState, Lock};
use crate::namespace::Namespace;
use crate::resource::Resource;
use crate::rpc::{CancelBatch, CancelRequest, RpcRequest};
use crate::types::{
    req_bufsize, req_handles_avail, LockHandle, LockKind, LockMode, PolicyData, ResourceName, ENQUEUE_CANCEL_OFF,
    LOCKREQ_BASE_SIZE,
};

/// How a locally cancelled lock must be told to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelDisposition {
    /// No RPC needed.
    LocalOnly,
    /// Joins an ordinary batched cancel RPC.
    Canceling,
    /// Must go out on the blocking-notification path, separately from any
    /// request being assembled.
    BlAst,
}

/// Cancel the client side of a lock: promise no new users, run the cancel
/// callback once, unlink and destroy. Returns how the server side is to
/// be handled.
pub(crate) fn cancel_local(lock: &Arc<Lock>) -> Result<CancelDisposition> {
    if lock.export().is_none() {
        error!(handle = lock.handle().cookie, "trying to cancel a lock with no server connection");
        return Err(DlmError::inval("cancel of a connection-less lock"));
    }
    debug!(handle = lock.handle().cookie, "client-side cancel");
    let (local_only, mut disp) = lock.with_res_and_state(|_, st| {
        st.flags.insert(LockFlags::CBPENDING);
        let local_only = st.flags.intersects(LockFlags::LOCAL_ONLY | LockFlags::CANCEL_ON_BLOCK);
        let disp = if st.flags.contains(LockFlags::BL_AST) {
            CancelDisposition::BlAst
        } else {
            CancelDisposition::Canceling
        };
        (local_only, disp)
    });
    lock.run_cancel_callback();
    if local_only {
        debug!(handle = lock.handle().cookie, "not sending request (at caller's instruction)");
        disp = CancelDisposition::LocalOnly;
    }
    lock.cancel_client_side();
    Ok(disp)
}

/// Client-side lock cancel, the public entry point.
///
/// A lock already mid-cancel is left alone when the caller asked for
/// asynchronous treatment. Otherwise the lock is cancelled locally and,
/// unless nothing needs telling the server, shipped out together with
/// whatever else the LRU is willing to shed.
pub async fn cancel(ns: &Arc<Namespace>, handle: LockHandle, flags: CancelFlags) -> Result<()> {
    let Some(lock) = ns.handle2lock(&handle) else {
        debug!(cookie = handle.cookie, "lock is already being destroyed");
        return Ok(());
    };

    let already = lock.with_res_and_state(|_, st| {
        if st.flags.contains(LockFlags::CANCELING) && flags.contains(CancelFlags::ASYNC) {
            return true;
        }
        st.flags.insert(LockFlags::CANCELING);
        false
    });
    if already {
        return Ok(());
    }

    let export = lock.export();
    let disp = cancel_local(&lock)?;
    if disp == CancelDisposition::LocalOnly || flags.contains(CancelFlags::LOCAL) {
        return Ok(());
    }

    // Even a blocking-path cancel travels to the cancel portal, so other
    // LRU locks may ride along in the same RPC.
    let mut batch = vec![lock.clone()];
    if let Some(export) = export {
        if export.namespace().connect_cancelset() {
            let avail = req_handles_avail(ns.config().max_req_size, LOCKREQ_BASE_SIZE, 0);
            let lru_flags = if ns.connect_lru_resize() {
                LruFlags::LRUR
            } else {
                LruFlags::AGED
            };
            crate::lru::cancel_lru_local(ns, &mut batch, 0, avail.saturating_sub(1), lru_flags, CancelFlags::BL_AST).await;
        }
    }
    cancel_list(batch, None, flags).await
}

/// Locally cancel `batch[from..]`. Locks needing no RPC leave the batch;
/// blocking-path locks are split into their own immediate RPC unless the
/// caller wants them kept. Returns how many locks remain in range.
pub(crate) async fn cancel_list_local(batch: &mut Vec<Arc<Lock>>, from: usize, flags: CancelFlags) -> usize {
    let mut bl_batch = Vec::new();
    let mut idx = from;
    while idx < batch.len() {
        let lock = batch[idx].clone();
        let disp = if flags.contains(CancelFlags::LOCAL) {
            lock.cancel_client_side();
            CancelDisposition::LocalOnly
        } else {
            cancel_local(&lock).unwrap_or(CancelDisposition::LocalOnly)
        };
        if !flags.contains(CancelFlags::BL_AST) && disp == CancelDisposition::BlAst {
            debug!(handle = lock.handle().cookie, "cancel lock separately");
            batch.remove(idx);
            bl_batch.push(lock);
            continue;
        }
        if disp == CancelDisposition::LocalOnly {
            batch.remove(idx);
            continue;
        }
        idx += 1;
    }
    let remaining = batch.len() - from;
    if !bl_batch.is_empty() {
        let _ = Box::pin(cancel_list(bl_batch, None, CancelFlags::empty())).await;
    }
    remaining
}

/// Pack up to `count` remote handles from `batch` into `out`. A lock the
/// server never acknowledged packs as a zero handle, which the server
/// ignores.
fn cancel_pack(out: &mut Vec<u64>, batch: &[Arc<Lock>], count: usize) -> usize {
    let mut packed = 0;
    for lock in batch.iter().take(count) {
        let remote = lock.remote_handle().unwrap_or_default();
        debug!(handle = lock.handle().cookie, %remote, "packing");
        out.push(remote.0);
        packed += 1;
    }
    debug!(packed, "locks packed");
    packed
}

/// Send one batched cancel RPC for the first `count` locks.
///
/// The cancel never fails the user: a stale handle means the server beat
/// us to it, a timeout on an unchanged connection is retried, and any
/// other error is reported while the locks stay cancelled client-side.
async fn cancel_req(export: &Arc<Export>, batch: &[Arc<Lock>], count: usize, flags: CancelFlags) -> usize {
    let ns = export.namespace();
    let free = req_handles_avail(ns.config().max_req_size, LOCKREQ_BASE_SIZE, 0);
    let count = count.min(free).min(batch.len());
    if count == 0 {
        return 0;
    }
    let mut handles = Vec::with_capacity(count);
    cancel_pack(&mut handles, batch, count);

    loop {
        let import = export.import();
        if import.is_invalid() {
            debug!("skipping cancel on invalid import");
            return count;
        }
        let req = RpcRequest::cancel(CancelRequest { handles: handles.clone() });
        let generation = import.generation();

        if flags.contains(CancelFlags::ASYNC) {
            import.queue().submit(
                req,
                Box::new(|outcome| {
                    if let Err(err) = outcome {
                        debug!(%err, "async cancel reply");
                    }
                }),
            );
            return count;
        }

        match import.transport().send_and_wait(req).await {
            Ok(reply) => {
                crate::lru::update_pool(ns, &reply);
                return count;
            }
            Err(DlmError::Stale { .. }) => {
                debug!("client/server out of sync -- not fatal");
                return count;
            }
            Err(DlmError::Timeout { .. }) if import.generation() == generation => {
                // Same connection, reply merely late: try again.
                continue;
            }
            Err(DlmError::Shutdown) => {
                debug!("cancel RPC during shutdown: canceling anyway");
                return count;
            }
            Err(err) => {
                warn!(%err, "cancel RPC failed: canceling anyway");
                return count;
            }
        }
    }
}

/// Ship cancelled locks to their servers. With `piggyback` the handles
/// ride in a request under construction; otherwise batched cancel RPCs go
/// out, one per group the connection can express.
pub(crate) async fn cancel_list(mut batch: Vec<Arc<Lock>>, mut piggyback: Option<&mut Vec<u64>>, flags: CancelFlags) -> Result<()> {
    while !batch.is_empty() {
        let first = batch[0].clone();
        let Some(export) = first.export() else {
            batch.remove(0);
            continue;
        };
        let sent = if export.namespace().connect_cancelset() {
            if let Some(out) = piggyback.as_mut() {
                cancel_pack(out, &batch, batch.len())
            } else {
                cancel_req(&export, &batch, batch.len(), flags).await
            }
        } else {
            // No cancel-set support: one handle per RPC.
            cancel_req(&export, &batch, 1, flags).await
        };
        let sent = sent.clamp(1, batch.len());
        batch.drain(..sent);
    }
    Ok(())
}

/// Drive a background-queued cancel batch; the worker calls this.
pub async fn run_cancel_batch(batch: CancelBatch) {
    let CancelBatch { mut locks, flags } = batch;
    let _ = cancel_list_local(&mut locks, 0, flags).await;
    let _ = cancel_list(locks, None, flags).await;
}

/// Estimate piggyback room and fill an enqueue under construction with
/// early cancels: claim LRU locks up to the room available, pack what
/// fits after the request's own slots, and send the overflow as a
/// separate cancel batch right away.
pub(crate) async fn prep_elc_req(export: &Arc<Export>, canceloff: usize, caller: Vec<Arc<Lock>>) -> Result<Vec<u64>> {
    let ns = export.namespace();
    let mut batch = caller;
    if !ns.connect_cancelset() {
        // No early cancel on this connection; extra RPCs would only slow
        // the enqueue down.
        return Ok(Vec::new());
    }
    let avail = req_handles_avail(ns.config().max_req_size, req_bufsize(0, canceloff > 0), canceloff);
    let lru_flags = if ns.connect_lru_resize() {
        LruFlags::LRUR_NO_WAIT
    } else {
        LruFlags::AGED
    };
    if avail > batch.len() {
        let room = avail - batch.len();
        crate::lru::cancel_lru_local(ns, &mut batch, room, 0, lru_flags, CancelFlags::empty()).await;
    }
    let pack = batch.len().min(avail.saturating_sub(canceloff));
    let overflow = batch.split_off(pack);
    let mut handles = Vec::with_capacity(pack);
    cancel_list(batch, Some(&mut handles), CancelFlags::empty()).await?;
    if !overflow.is_empty() {
        cancel_list(overflow, None, CancelFlags::empty()).await?;
    }
    Ok(handles)
}

/// Early-cancel preparation for an enqueue request.
pub(crate) async fn prep_enqueue_req(export: &Arc<Export>) -> Result<Vec<u64>> {
    prep_elc_req(export, ENQUEUE_CANCEL_OFF, Vec::new()).await
}

/// Claim this resource's cached unused locks that clash with `mode` (all
/// of them when `mode` is `None`; inode-bits locks additionally filtered
/// by `policy`), cancel them locally and leave the rest in `batch`.
pub async fn cancel_resource_local(
    res: &Arc<Resource>,
    batch: &mut Vec<Arc<Lock>>,
    policy: Option<&PolicyData>,
    mode: Option<LockMode>,
    lock_flags: LockFlags,
    cancel_flags: CancelFlags,
) -> usize {
    let Some(ns) = res.namespace() else {
        return 0;
    };
    let from = batch.len();
    for lock in ns.lru_snapshot() {
        let claimed = lock.with_res_and_state(|_, st| {
            if st.res_name != res.name() || st.list != ListState::UnusedLru {
                return false;
            }
            if st.flags.intersects(LockFlags::BL_AST | LockFlags::CANCELING) {
                return false;
            }
            if let (Some(mode), Some(granted)) = (mode, st.granted_mode) {
                if granted.compatible_with(mode) {
                    return false;
                }
            }
            if let (Some(PolicyData::IBits { bits: wanted }), Some(PolicyData::IBits { bits })) = (policy, st.policy.as_ref())
            {
                if bits & wanted == 0 {
                    return false;
                }
            }
            st.flags.insert(LockFlags::CBPENDING | LockFlags::CANCELING);
            st.flags |= lock_flags;
            st.list = ListState::BlAst;
            ns.lru_remove(&lock);
            true
        });
        if claimed {
            batch.push(lock);
        }
    }
    cancel_list_local(batch, from, cancel_flags).await
}

/// Cancel every unused lock on one resource. With [`CancelFlags::LOCAL`]
/// the locks are thrown away without telling the server.
pub async fn cancel_unused_resource(
    ns: &Arc<Namespace>,
    res_id: ResourceName,
    policy: Option<PolicyData>,
    mode: Option<LockMode>,
    flags: CancelFlags,
) -> Result<()> {
    let Some(res) = ns.resource_get(res_id, LockKind::Plain, false) else {
        debug!(%res_id, "no resource, nothing to cancel");
        return Ok(());
    };
    let mut batch = Vec::new();
    let count = cancel_resource_local(
        &res,
        &mut batch,
        policy.as_ref(),
        mode,
        LockFlags::empty(),
        flags | CancelFlags::BL_AST,
    )
    .await;
    debug!(%res_id, count, "canceling unused locks on resource");
    cancel_list(batch, None, flags).await
}

/// Cancel every unused lock of the namespace, or of one resource when
/// `res_id` is given.
pub async fn cancel_unused(ns: &Arc<Namespace>, res_id: Option<ResourceName>, flags: CancelFlags) -> Result<()> {
    match res_id {
        Some(res_id) => cancel_unused_resource(ns, res_id, None, None, flags).await,
        None => {
            let mut names = Vec::new();
            ns.for_each_resource(|res| {
                names.push(res.name());
                std::ops::ControlFlow::Continue(())
            });
            for name in names {
                cancel_unused_resource(ns, name, None, None, flags).await?;
            }
            Ok(())
        }
    }
}
