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

//! Client-side lock request engine of the ShaleFS lock service.
//!
//! A client process caches many locks covering server-owned resources and
//! mediates their lifecycle through asynchronous notifications:
//!
//! - a *completion* notification reports that a requested lock, queued
//!   behind conflicting ones, has been granted;
//! - a *blocking* notification tells a holder that someone else wants a
//!   conflicting lock, so the holder should release in good time or be
//!   evicted;
//! - a *glimpse* notification asks a holder for a resource's value block
//!   without making it give the lock up.
//!
//! The engine drives lock enqueue with early-cancel piggybacking, the
//! cancel pipeline with its retry loop, eviction of cached unused locks
//! under pluggable policies, and replay of held locks after a reconnect.
//! The RPC transport, the worker queue and the reconnection machinery are
//! injected through the traits in [`rpc`].

pub mod adaptive;
pub mod cancel;
pub mod config;
pub mod enqueue;
pub mod error;
pub mod flags;
pub mod import;
pub mod lock;
pub mod lru;
pub mod namespace;
pub mod replay;
pub mod resource;
pub mod rpc;
pub mod types;


pub use adaptive::AdaptiveEstimate;
pub use cancel::{cancel, cancel_unused, cancel_unused_resource, run_cancel_batch, CancelDisposition};
pub use config::{EngineConfig, LruConfig};
pub use enqueue::{
    enqueue, enqueue_async, enqueue_fini, handle_cp_callback, AsyncCompletion, EnqueueInfo, PreparedEnqueue, SyncCompletion,
};
pub use error::{DlmError, Result};
pub use flags::{CancelFlags, LockFlags, LruFlags};
pub use import::{ConnectCaps, Export, Import, ImportEvent};
pub use lock::{BlockingPhase, CompletionAst, ListState, Lock, LockCallbacks};
pub use lru::{cancel_lru, prepare_lru_list, update_pool, PolicyVerdict};
pub use namespace::{Namespace, PoolState};
pub use replay::replay_locks;
pub use rpc::{
    CancelBatch, CancelRequest, EnqueueRequest, LockDescriptor, MsgFlags, Opcode, ReplyCallback, ReplyStatus, RequestBody,
    RpcReply, RpcRequest, SendState, Transport, WorkQueue,
};
pub use types::{LockHandle, LockKind, LockMode, PolicyData, RemoteHandle, ResourceName};
