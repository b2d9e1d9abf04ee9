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

use serde::{Deserialize, Serialize};

/// Lock mode, wire values fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum LockMode {
    /// Exclusive
    Ex = 1,
    /// Protected write
    Pw = 2,
    /// Protected read
    Pr = 4,
    /// Concurrent write
    Cw = 8,
    /// Concurrent read
    Cr = 16,
    /// Null (no access, holds a reference only)
    Nl = 32,
}

impl LockMode {
    /// Reader-counted modes.
    pub fn is_reader(self) -> bool {
        matches!(self, LockMode::Nl | LockMode::Cr | LockMode::Pr)
    }

    /// Writer-counted modes.
    pub fn is_writer(self) -> bool {
        matches!(self, LockMode::Ex | LockMode::Cw | LockMode::Pw)
    }

    /// Classic DLM mode compatibility matrix.
    pub fn compatible_with(self, other: LockMode) -> bool {
        use LockMode::*;
        match (self, other) {
            (Nl, _) | (_, Nl) => true,
            (Cr, Ex) | (Ex, Cr) => false,
            (Cr, _) | (_, Cr) => true,
            (Cw, Cw) => true,
            (Pr, Pr) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LockMode::Ex => "EX",
            LockMode::Pw => "PW",
            LockMode::Pr => "PR",
            LockMode::Cw => "CW",
            LockMode::Cr => "CR",
            LockMode::Nl => "NL",
        }
    }
}

impl std::fmt::Display for LockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lock type; drives the shape of the policy data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockKind {
    /// Whole-resource lock, no policy data.
    Plain,
    /// Byte-range lock over file data.
    Extent,
    /// Inode metadata bits.
    IBits,
    /// POSIX advisory file lock.
    Flock,
}

/// Type-dependent lock descriptor payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyData {
    Extent { start: u64, end: u64, gid: u64 },
    IBits { bits: u64 },
    Flock { start: u64, end: u64, owner: u64, pid: u32 },
}

impl PolicyData {
    /// Whether this payload shape belongs to the given lock type.
    pub fn matches_kind(&self, kind: LockKind) -> bool {
        matches!(
            (self, kind),
            (PolicyData::Extent { .. }, LockKind::Extent)
                | (PolicyData::IBits { .. }, LockKind::IBits)
                | (PolicyData::Flock { .. }, LockKind::Flock)
        )
    }
}

/// Resource name inside a namespace; opaque to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceName(pub [u64; 4]);

impl ResourceName {
    pub const fn new(name: [u64; 4]) -> Self {
        Self(name)
    }
}

impl std::fmt::Display for ResourceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:#x}:{:#x}:{:#x}:{:#x}]", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

/// Local lock handle: opaque cookie plus a namespace generation so a stale
/// handle from a previous incarnation never resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockHandle {
    pub cookie: u64,
    pub generation: u32,
}

/// Server-issued cookie for the same lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RemoteHandle(pub u64);

impl std::fmt::Display for RemoteHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// On-wire size of one lock handle.
pub const HANDLE_SIZE: usize = 8;
/// Handle slots built into every lock request body.
pub const LOCKREQ_HANDLES: usize = 2;
/// Slots of an enqueue request already spoken for (its own handle).
pub const ENQUEUE_CANCEL_OFF: usize = 1;
/// Base size of a lock request body (descriptor, flags, built-in handles).
pub const LOCKREQ_BASE_SIZE: usize = 104;
/// Link-layer headroom kept free below one page.
pub const PAGE_HEADROOM: usize = 512;
/// Page size assumed for send/receive buffers.
pub const PAGE_SIZE: usize = 4096;

/// Number of lock handles that fit into a request of `req_size` bytes,
/// `off` of the built-in slots being already taken.
pub fn req_handles_avail(max_req_size: usize, req_size: usize, off: usize) -> usize {
    let ceiling = max_req_size.min(PAGE_SIZE - PAGE_HEADROOM);
    let avail = ceiling.saturating_sub(req_size) / HANDLE_SIZE;
    (avail + LOCKREQ_HANDLES).saturating_sub(off)
}

/// Size of a lock request body carrying `count` handles for the given
/// operation. Enqueue keeps one built-in slot for its own handle.
pub fn req_bufsize(count: usize, is_enqueue: bool) -> usize {
    let mut avail = LOCKREQ_HANDLES;
    if is_enqueue {
        avail -= ENQUEUE_CANCEL_OFF;
    }
    let extra = count.saturating_sub(avail) * HANDLE_SIZE;
    LOCKREQ_BASE_SIZE + extra
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_counters() {
        assert!(LockMode::Pr.is_reader());
        assert!(LockMode::Nl.is_reader());
        assert!(LockMode::Pw.is_writer());
        assert!(LockMode::Ex.is_writer());
        assert!(!LockMode::Ex.is_reader());
    }

    #[test]
    fn test_mode_compat() {
        assert!(LockMode::Pr.compatible_with(LockMode::Pr));
        assert!(!LockMode::Pr.compatible_with(LockMode::Pw));
        assert!(LockMode::Nl.compatible_with(LockMode::Ex));
        assert!(LockMode::Cr.compatible_with(LockMode::Pw));
        assert!(!LockMode::Cr.compatible_with(LockMode::Ex));
        assert!(!LockMode::Ex.compatible_with(LockMode::Ex));
    }

    #[test]
    fn test_policy_matches_kind() {
        let extent = PolicyData::Extent { start: 0, end: 4095, gid: 0 };
        assert!(extent.matches_kind(LockKind::Extent));
        assert!(!extent.matches_kind(LockKind::IBits));

        let bits = PolicyData::IBits { bits: 0x3 };
        assert!(bits.matches_kind(LockKind::IBits));
    }

    #[test]
    fn test_handles_avail() {
        // One page minus headroom caps the request no matter how large the
        // configured maximum is.
        let roomy = req_handles_avail(1 << 20, LOCKREQ_BASE_SIZE, 0);
        assert_eq!(roomy, (PAGE_SIZE - PAGE_HEADROOM - LOCKREQ_BASE_SIZE) / HANDLE_SIZE + LOCKREQ_HANDLES);

        // Request larger than the ceiling still leaves the built-in slots.
        let tight = req_handles_avail(128, 4096, 1);
        assert_eq!(tight, LOCKREQ_HANDLES - 1);

        // A 152-byte ceiling gives 6 spill slots + 2 built-in - 1 taken.
        assert_eq!(req_handles_avail(152, LOCKREQ_BASE_SIZE, 1), 7);
    }

    #[test]
    fn test_bufsize() {
        assert_eq!(req_bufsize(0, true), LOCKREQ_BASE_SIZE);
        assert_eq!(req_bufsize(1, true), LOCKREQ_BASE_SIZE);
        assert_eq!(req_bufsize(2, true), LOCKREQ_BASE_SIZE + HANDLE_SIZE);
        assert_eq!(req_bufsize(2, false), LOCKREQ_BASE_SIZE);
        assert_eq!(req_bufsize(5, false), LOCKREQ_BASE_SIZE + 3 * HANDLE_SIZE);
    }
}
