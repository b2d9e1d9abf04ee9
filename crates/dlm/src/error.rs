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

use bytes::Bytes;
use thiserror::Error;

/// Lock engine error types, one variant per status a caller can observe.
#[derive(Error, Debug, Clone)]
pub enum DlmError {
    /// The server processed the enqueue but refused to grant the lock.
    /// Carries the lock value block shipped with the refusal, if any.
    #[error("lock enqueue aborted by server")]
    LockAborted { lvb: Option<Bytes> },

    /// The lock behind a handle no longer exists on this client.
    #[error("no lock for handle {cookie:#x}")]
    NoLock { cookie: u64 },

    /// Reply violated the wire contract (missing descriptor, oversized LVB).
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Allocation failed; the single operation is aborted.
    #[error("out of memory: {message}")]
    NoMem { message: String },

    /// A wait or RPC ran out of time.
    #[error("timed out: {message}")]
    Timeout { message: String },

    /// The server has forgotten the lock in question.
    #[error("stale handle: {message}")]
    Stale { message: String },

    /// The connection is being torn down.
    #[error("shutting down")]
    Shutdown,

    /// A waiting caller was interrupted, typically by a concurrent cancel.
    #[error("interrupted while waiting")]
    Interrupted,

    /// The lock was destroyed or failed while the caller waited on it.
    #[error("io error: {message}")]
    Io { message: String },

    /// Caller passed arguments the engine cannot honor.
    #[error("invalid argument: {message}")]
    Inval { message: String },

    /// Transport-level failure underneath an RPC.
    #[error("network error: {message}")]
    Network { message: String },

    /// Anything that does not fit the categories above.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl DlmError {
    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol { message: message.into() }
    }

    /// Create an out-of-memory error
    pub fn no_mem(message: impl Into<String>) -> Self {
        Self::NoMem { message: message.into() }
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout { message: message.into() }
    }

    /// Create a stale-handle error
    pub fn stale(message: impl Into<String>) -> Self {
        Self::Stale { message: message.into() }
    }

    /// Create an io error
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io { message: message.into() }
    }

    /// Create an invalid-argument error
    pub fn inval(message: impl Into<String>) -> Self {
        Self::Inval { message: message.into() }
    }

    /// Create a network error
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Create a no-lock error
    pub fn no_lock(cookie: u64) -> Self {
        Self::NoLock { cookie }
    }

    /// True when retrying the same RPC may succeed (transport trouble).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Network { .. })
    }

    /// True when the error ends the operation for good.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Protocol { .. } | Self::Inval { .. } | Self::Shutdown | Self::NoMem { .. }
        )
    }
}

/// Lock engine Result type
pub type Result<T> = std::result::Result<T, DlmError>;

impl From<std::io::Error> for DlmError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => Self::timeout(err.to_string()),
            std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::ConnectionReset => Self::network(err.to_string()),
            std::io::ErrorKind::OutOfMemory => Self::no_mem(err.to_string()),
            _ => Self::io(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for DlmError {
    fn from(err: serde_json::Error) -> Self {
        Self::protocol(format!("wire encoding: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let timeout = DlmError::timeout("enqueue reply");
        assert!(matches!(timeout, DlmError::Timeout { .. }));

        let stale = DlmError::stale("server forgot handle");
        assert!(matches!(stale, DlmError::Stale { .. }));

        let aborted = DlmError::LockAborted { lvb: None };
        assert!(matches!(aborted, DlmError::LockAborted { .. }));
    }

    #[test]
    fn test_error_retryable() {
        assert!(DlmError::timeout("t").is_retryable());
        assert!(DlmError::network("n").is_retryable());
        assert!(!DlmError::stale("s").is_retryable());
        assert!(!DlmError::Shutdown.is_retryable());
    }

    #[test]
    fn test_error_fatal() {
        assert!(DlmError::protocol("bad lvb").is_fatal());
        assert!(DlmError::inval("no export").is_fatal());
        assert!(!DlmError::timeout("t").is_fatal());
        assert!(!DlmError::Interrupted.is_fatal());
    }

    #[test]
    fn test_from_io_error() {
        let err: DlmError = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow").into();
        assert!(matches!(err, DlmError::Timeout { .. }));

        let err: DlmError = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "gone").into();
        assert!(matches!(err, DlmError::Network { .. }));
    }
}
