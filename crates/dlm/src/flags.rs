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

bitflags::bitflags! {
    /// Per-lock flag word. The low 32 bits travel on the wire and must keep
    /// their values; bits from `FAIL_LOC` up are client-local state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LockFlags: u64 {
        /// Server rewrote the request: mode and/or resource changed in reply.
        const LOCK_CHANGED = 0x0000_0000_0000_0001;
        /// Granted after waiting behind conflicting locks.
        const BLOCK_GRANTED = 0x0000_0000_0000_0002;
        /// Replayed lock was mid-conversion on the client.
        const BLOCK_CONV = 0x0000_0000_0000_0004;
        /// Replayed lock was still waiting on the client.
        const BLOCK_WAIT = 0x0000_0000_0000_0008;
        /// A blocking notification was already in flight when the reply left.
        const AST_SENT = 0x0000_0000_0000_0020;
        /// Enqueue reproduces a lock the client already holds.
        const REPLAY = 0x0000_0000_0000_0100;
        /// Completion waiter never times out (still interruptible).
        const NO_TIMEOUT = 0x0000_0000_0002_0000;
        /// Server drops the lock instead of sending a blocking notification.
        const CANCEL_ON_BLOCK = 0x0000_0000_0080_0000;

        /// Scan marker: no-wait eviction pass already rejected this lock.
        const SKIPPED = 0x0000_0002_0000_0000;
        /// Promise that no new readers or writers will be admitted.
        const CBPENDING = 0x0000_0004_0000_0000;
        /// Caller reuses the completion coordinator as a bare wait primitive.
        const WAIT_NOREPROC = 0x0000_0008_0000_0000;
        /// Cancel callback has run.
        const CANCEL = 0x0000_0010_0000_0000;
        /// No cancel RPC should reach the server for this lock.
        const LOCAL_ONLY = 0x0000_0020_0000_0000;
        /// Abandoned by server eviction or local failure.
        const FAILED = 0x0000_0040_0000_0000;
        /// Cancellation in progress.
        const CANCELING = 0x0000_0080_0000_0000;
        /// Lock never had a server-side twin.
        const LOCAL = 0x0000_0100_0000_0000;
        /// Racing server notifications must be answered with an error.
        const ATOMIC_CB = 0x0000_2000_0000_0000;
        /// Cancel must travel on the blocking-notification path.
        const BL_AST = 0x0000_4000_0000_0000;
        /// Blocking-path cancel has completed.
        const BL_DONE = 0x0000_8000_0000_0000;
        /// Keep out of the unused-lock LRU.
        const NO_LRU = 0x0001_0000_0000_0000;
        /// Gone for good; only handle references keep the shell alive.
        const DESTROYED = 0x0004_0000_0000_0000;
        /// Exclusive user reference semantics requested at enqueue.
        const EXCL = 0x0080_0000_0000_0000;
    }
}

impl LockFlags {
    /// Reply bits meaning "not granted yet, wait for a completion".
    pub const BLOCKED_MASK: LockFlags = LockFlags::BLOCK_GRANTED
        .union(LockFlags::BLOCK_CONV)
        .union(LockFlags::BLOCK_WAIT);

    /// Reply bits the lock inherits into its own flag word.
    pub const INHERIT_MASK: LockFlags = LockFlags::CANCEL_ON_BLOCK;

    /// Bits with on-wire meaning; everything else is client-local.
    pub const ON_WIRE_MASK: LockFlags = LockFlags::LOCK_CHANGED
        .union(LockFlags::BLOCK_GRANTED)
        .union(LockFlags::BLOCK_CONV)
        .union(LockFlags::BLOCK_WAIT)
        .union(LockFlags::AST_SENT)
        .union(LockFlags::REPLAY)
        .union(LockFlags::NO_TIMEOUT)
        .union(LockFlags::CANCEL_ON_BLOCK);

    /// Bits meaning the lock will never be granted.
    pub const GONE_MASK: LockFlags = LockFlags::DESTROYED.union(LockFlags::FAILED);

    /// Decode a wire flag word, dropping anything without wire meaning.
    pub fn from_wire(wire: u64) -> LockFlags {
        LockFlags::from_bits_truncate(wire) & Self::ON_WIRE_MASK
    }

    /// Encode for the wire, dropping client-local bits.
    pub fn to_wire(self) -> u64 {
        (self & Self::ON_WIRE_MASK).bits()
    }

    pub fn is_blocked(self) -> bool {
        self.intersects(Self::BLOCKED_MASK)
    }

    pub fn is_gone(self) -> bool {
        self.intersects(Self::GONE_MASK)
    }
}

bitflags::bitflags! {
    /// Flags steering a cancel request through the pipeline.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CancelFlags: u32 {
        /// Do not wait for the cancel RPC; hand it to the work queue.
        const ASYNC = 0x1;
        /// Cancel locally only, never telling the server.
        const LOCAL = 0x2;
        /// Keep blocking-path locks in the batch instead of splitting them
        /// into a separate RPC.
        const BL_AST = 0x4;
    }
}

bitflags::bitflags! {
    /// Selects the LRU eviction policy for one scan.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LruFlags: u32 {
        /// Drop locks unused longer than the namespace max age.
        const AGED = 0x01;
        /// Drop the requested number of oldest locks.
        const PASSED = 0x02;
        /// Memory-pressure shrink; behaves like PASSED.
        const SHRINK = 0x04;
        /// Server-lock-volume driven eviction.
        const LRUR = 0x08;
        /// Cancel only what needs no RPC and no waiting.
        const NO_WAIT = 0x10;
        /// LRUR keep-decisions, NO_WAIT cancel-decisions.
        const LRUR_NO_WAIT = 0x20;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_round_trip_keeps_wire_bits() {
        let flags = LockFlags::REPLAY | LockFlags::BLOCK_GRANTED | LockFlags::CANCELING;
        let wire = flags.to_wire();
        assert_eq!(wire, (LockFlags::REPLAY | LockFlags::BLOCK_GRANTED).bits());

        let back = LockFlags::from_wire(wire);
        assert!(back.contains(LockFlags::REPLAY | LockFlags::BLOCK_GRANTED));
        assert!(!back.contains(LockFlags::CANCELING));
    }

    #[test]
    fn test_wire_values_are_stable() {
        assert_eq!(LockFlags::LOCK_CHANGED.bits(), 0x1);
        assert_eq!(LockFlags::BLOCK_GRANTED.bits(), 0x2);
        assert_eq!(LockFlags::BLOCK_CONV.bits(), 0x4);
        assert_eq!(LockFlags::BLOCK_WAIT.bits(), 0x8);
        assert_eq!(LockFlags::AST_SENT.bits(), 0x20);
        assert_eq!(LockFlags::REPLAY.bits(), 0x100);
        assert_eq!(LockFlags::NO_TIMEOUT.bits(), 0x20000);
        assert_eq!(LockFlags::CANCEL_ON_BLOCK.bits(), 0x80_0000);
    }

    #[test]
    fn test_blocked_mask() {
        assert!(LockFlags::BLOCK_WAIT.is_blocked());
        assert!(LockFlags::BLOCK_GRANTED.is_blocked());
        assert!(!LockFlags::AST_SENT.is_blocked());
        assert_eq!(LockFlags::BLOCKED_MASK.bits(), 0xe);
    }

    #[test]
    fn test_inherit_mask_is_cancel_on_block() {
        assert_eq!(LockFlags::INHERIT_MASK, LockFlags::CANCEL_ON_BLOCK);
    }

    #[test]
    fn test_unknown_wire_bits_dropped() {
        let back = LockFlags::from_wire(0xdead_0000_0000_0000);
        assert!(back.is_empty());
    }
}
