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
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{LockKind, LockMode, PolicyData, ResourceName};

/// Wire opcodes of the lock service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum Opcode {
    Enqueue = 101,
    Cancel = 103,
    BlCallback = 104,
    CpCallback = 105,
    GlCallback = 106,
}

/// Portal cancel requests are sent to.
pub const CANCEL_REQUEST_PORTAL: u32 = 24;
/// Portal cancel replies come back on.
pub const CANCEL_REPLY_PORTAL: u32 = 25;

bitflags::bitflags! {
    /// Transport message flags the engine sets on outgoing requests.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MsgFlags: u32 {
        /// All request replay is finished; lock replay may be processed.
        const REQ_REPLAY_DONE = 0x0008;
    }
}

/// Import state a request may be sent in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SendState {
    /// Normal full-connection traffic.
    #[default]
    Full,
    /// Recovery traffic allowed while locks are being replayed.
    ReplayLocks,
}

/// One lock as described on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockDescriptor {
    pub resource: ResourceName,
    pub kind: LockKind,
    pub req_mode: LockMode,
    pub granted_mode: Option<LockMode>,
    pub policy: Option<PolicyData>,
}

/// Body of an enqueue request. `handles[0]` is the enqueued lock's own
/// cookie; any further entries are piggybacked cancel handles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub desc: LockDescriptor,
    pub flags: u64,
    pub handles: Vec<u64>,
    /// Server-side LVB buffer the reply may fill, in bytes.
    pub lvb_cap: usize,
}

/// Body of a batched cancel request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelRequest {
    pub handles: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RequestBody {
    Enqueue(EnqueueRequest),
    Cancel(CancelRequest),
}

/// A logical request handed to the transport. Byte-level packing, queuing
/// and retransmission live behind the [`Transport`] trait.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub opcode: Opcode,
    pub body: RequestBody,
    pub portal: u32,
    pub reply_portal: u32,
    #[serde(skip)]
    pub msg_flags: MsgFlags,
    pub send_state: SendState,
}

impl RpcRequest {
    pub fn enqueue(body: EnqueueRequest) -> Self {
        Self {
            opcode: Opcode::Enqueue,
            body: RequestBody::Enqueue(body),
            portal: 0,
            reply_portal: 0,
            msg_flags: MsgFlags::empty(),
            send_state: SendState::Full,
        }
    }

    pub fn cancel(body: CancelRequest) -> Self {
        Self {
            opcode: Opcode::Cancel,
            body: RequestBody::Cancel(body),
            portal: CANCEL_REQUEST_PORTAL,
            reply_portal: CANCEL_REPLY_PORTAL,
            msg_flags: MsgFlags::empty(),
            send_state: SendState::Full,
        }
    }
}

/// Server verdict carried inside an otherwise successful reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyStatus {
    Success,
    /// Enqueue processed but the lock was refused; LVB may still be present.
    LockAborted,
}

/// A decoded lock service reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcReply {
    pub status: ReplyStatus,
    pub remote_handle: u64,
    pub flags: u64,
    pub desc: Option<LockDescriptor>,
    pub lvb: Option<Bytes>,
    /// Server lock volume; zero means the server does not drive our cache.
    pub slv: u64,
    /// Server lock-count limit; zero means unknown.
    pub limit: u32,
}

impl RpcReply {
    /// A plain granted reply with no rewrite, LVB or pool feedback.
    pub fn granted(remote_handle: u64) -> Self {
        Self {
            status: ReplyStatus::Success,
            remote_handle,
            flags: 0,
            desc: None,
            lvb: None,
            slv: 0,
            limit: 0,
        }
    }
}

/// Completion callback for asynchronously submitted requests.
pub type ReplyCallback = Box<dyn FnOnce(Result<RpcReply>) + Send + 'static>;

/// A locally cancelled batch awaiting background RPC processing, handed to
/// the worker through [`WorkQueue::submit_cancel_batch`]; the worker drives
/// it with [`crate::cancel::run_cancel_batch`].
#[derive(Debug)]
pub struct CancelBatch {
    pub locks: Vec<std::sync::Arc<crate::lock::Lock>>,
    pub flags: crate::flags::CancelFlags,
}

/// The RPC gateway. Implementations own packing, queuing and reply
/// dispatch; the engine only sees logical requests and decoded replies.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Send one request and park until its reply (or failure) arrives.
    async fn send_and_wait(&self, req: RpcRequest) -> Result<RpcReply>;
}

/// Asynchronous work hand-off, the worker-queue seam. Replay and async
/// cancel go through here so the engine does not pin a threading model.
pub trait WorkQueue: Send + Sync + std::fmt::Debug {
    /// Queue a request; `on_reply` runs when the reply (or failure) is in.
    fn submit(&self, req: RpcRequest, on_reply: ReplyCallback);

    /// Queue a prepared cancel batch for background sending.
    fn submit_cancel_batch(&self, batch: CancelBatch);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_request_uses_cancel_portals() {
        let req = RpcRequest::cancel(CancelRequest { handles: vec![0xbeef] });
        assert_eq!(req.opcode, Opcode::Cancel);
        assert_eq!(req.portal, CANCEL_REQUEST_PORTAL);
        assert_eq!(req.reply_portal, CANCEL_REPLY_PORTAL);
    }

    #[test]
    fn test_enqueue_request_serializes() {
        let req = RpcRequest::enqueue(EnqueueRequest {
            desc: LockDescriptor {
                resource: ResourceName::new([1, 0, 0, 0]),
                kind: LockKind::Plain,
                req_mode: LockMode::Pr,
                granted_mode: None,
                policy: None,
            },
            flags: 0x100,
            handles: vec![1, 2, 3],
            lvb_cap: 0,
        });
        let json = serde_json::to_string(&req).unwrap();
        let back: RpcRequest = serde_json::from_str(&json).unwrap();
        match back.body {
            RequestBody::Enqueue(e) => {
                assert_eq!(e.handles, vec![1, 2, 3]);
                assert_eq!(e.flags, 0x100);
            }
            RequestBody::Cancel(_) => panic!("wrong body"),
        }
    }
}
