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

//! Eviction of cached unused locks. A pluggable policy walks the LRU and
//! decides, lock by lock, whether the cache keeps it or a cancel batch
//! takes it.

use std::sync::Arc;
use tracing::debug;

use crate::flags::{CancelFlags, LockFlags, LruFlags};
use crate::lock::{ListState, Lock};
use crate::namespace::Namespace;
use crate::rpc::{CancelBatch, RpcReply};
use crate::types::LockKind;

/// What a policy decided about one scanned lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyVerdict {
    /// Keep it cached and stop the scan.
    Keep,
    /// Move it to the cancel batch.
    Cancel,
    /// Leave it cached but keep scanning.
    Skip,
}

type PolicyFn = fn(&Arc<Namespace>, &Arc<Lock>, usize, usize, i64) -> PolicyVerdict;

fn lock_age_secs(ns: &Namespace, lock: &Arc<Lock>) -> u64 {
    let last_used = lock.with_state(|st| st.last_used);
    ns.coarse_now().saturating_sub(last_used)
}

/// Cancel until the scan has added `target` locks.
fn policy_passed(_ns: &Arc<Namespace>, _lock: &Arc<Lock>, _unused: usize, added: usize, target: i64) -> PolicyVerdict {
    if added as i64 >= target {
        PolicyVerdict::Keep
    } else {
        PolicyVerdict::Cancel
    }
}

/// As `passed`, but a lock past the namespace max age is never kept.
fn policy_aged(ns: &Arc<Namespace>, lock: &Arc<Lock>, _unused: usize, added: usize, target: i64) -> PolicyVerdict {
    if added as i64 >= target && lock_age_secs(ns, lock) < ns.max_age_secs() {
        PolicyVerdict::Keep
    } else {
        PolicyVerdict::Cancel
    }
}

/// Server-volume driven: weigh the lock as `lvf * age * unused` and cancel
/// once the weight reaches the server lock volume. An unknown SLV keeps
/// everything; an over-aged lock goes regardless.
fn policy_lru_resize(ns: &Arc<Namespace>, lock: &Arc<Lock>, unused: usize, added: usize, target: i64) -> PolicyVerdict {
    if target != 0 && added as i64 >= target {
        return PolicyVerdict::Keep;
    }
    let age = lock_age_secs(ns, lock);
    if age > ns.max_age_secs() {
        return PolicyVerdict::Cancel;
    }
    let pool = ns.pool();
    let lv = pool.lvf.saturating_mul(age).saturating_mul(unused as u64);
    ns.set_pool_clv(lv);
    if pool.slv == 0 || lv < pool.slv {
        PolicyVerdict::Keep
    } else {
        PolicyVerdict::Cancel
    }
}

/// Cancel only what the resource type allows and the caller's predicate
/// blesses; everything else is marked so the pass never revisits it.
fn policy_no_wait(ns: &Arc<Namespace>, lock: &Arc<Lock>, _unused: usize, _added: usize, _target: i64) -> PolicyVerdict {
    let allowed = matches!(lock.kind(), LockKind::Extent | LockKind::IBits)
        && ns.cancel_predicate().map_or(false, |pred| pred(lock));
    if allowed {
        PolicyVerdict::Cancel
    } else {
        lock.with_state(|st| st.flags.insert(LockFlags::SKIPPED));
        PolicyVerdict::Skip
    }
}

fn policy_lrur_no_wait(ns: &Arc<Namespace>, lock: &Arc<Lock>, unused: usize, added: usize, target: i64) -> PolicyVerdict {
    match policy_lru_resize(ns, lock, unused, added, target) {
        PolicyVerdict::Keep => PolicyVerdict::Keep,
        _ => policy_no_wait(ns, lock, unused, added, target),
    }
}

/// Pick the policy for one scan from the request flags and the server's
/// LRU-resize capability.
pub(crate) fn select_policy(ns: &Namespace, flags: LruFlags) -> PolicyFn {
    if flags.contains(LruFlags::NO_WAIT) {
        return policy_no_wait;
    }
    if ns.connect_lru_resize() {
        if flags.contains(LruFlags::SHRINK) {
            // Kill the passed number of old locks regardless of volume.
            return policy_passed;
        } else if flags.contains(LruFlags::LRUR) {
            return policy_lru_resize;
        } else if flags.contains(LruFlags::PASSED) {
            return policy_passed;
        } else if flags.contains(LruFlags::LRUR_NO_WAIT) {
            return policy_lrur_no_wait;
        }
    } else if flags.contains(LruFlags::AGED) {
        return policy_aged;
    }
    policy_passed
}

/// Walk the unused LRU front to back and claim locks for a cancel batch.
///
/// - `target` is how many the policy should prefer to shed; when the
///   server does not size our cache it is raised by the overflow past
///   `max_unused` so the cache stays hard-capped.
/// - at most `max` locks are taken when `max` is positive.
///
/// A lock is claimed only while it is still unused, unmarked and untouched
/// since the scan saw it; the claim stamps `CBPENDING | CANCELING` and
/// moves it to the batch in one critical section, so nothing else can
/// re-add it to the LRU afterwards. A lock released within the current
/// coarse-clock tick is given one more tick of grace.
pub fn prepare_lru_list(
    ns: &Arc<Namespace>,
    batch: &mut Vec<Arc<Lock>>,
    target: usize,
    max: usize,
    flags: LruFlags,
) -> usize {
    let no_wait = flags.intersects(LruFlags::NO_WAIT | LruFlags::LRUR_NO_WAIT);
    let snapshot = ns.lru_snapshot();
    let unused = snapshot.len();
    let mut target = target as i64;
    if !ns.connect_lru_resize() {
        target += unused as i64 - ns.max_unused() as i64;
    }
    let policy = select_policy(ns, flags);
    let now = ns.coarse_now();
    let mut added = 0usize;

    for lock in snapshot {
        if max > 0 && added >= max {
            break;
        }
        let stamp = lock.with_state(|st| {
            if st.list != ListState::UnusedLru {
                return None;
            }
            if no_wait && st.flags.contains(LockFlags::SKIPPED) {
                return None;
            }
            if st.flags.contains(LockFlags::CANCELING) {
                return None;
            }
            if st.last_used == now {
                return None;
            }
            Some(st.last_used)
        });
        let Some(stamp) = stamp else { continue };

        match policy(ns, &lock, unused - added, added, target) {
            PolicyVerdict::Keep => break,
            PolicyVerdict::Skip => continue,
            PolicyVerdict::Cancel => {}
        }

        let claimed = lock.with_res_and_state(|_, st| {
            // Re-check under the double lock; the lock may have been
            // re-used, claimed or touched since the policy saw it.
            if st.flags.contains(LockFlags::CANCELING) || st.list != ListState::UnusedLru || st.last_used != stamp {
                return false;
            }
            debug_assert!(st.readers == 0 && st.writers == 0);
            // A voluntary cancel must reach the server even for locks the
            // server offered to drop silently.
            st.flags.remove(LockFlags::CANCEL_ON_BLOCK);
            // Once CBPENDING is set the lock can accumulate no more users.
            st.flags.insert(LockFlags::CBPENDING | LockFlags::CANCELING);
            st.list = ListState::BlAst;
            ns.lru_remove(&lock);
            true
        });
        if claimed {
            batch.push(lock);
            added += 1;
        }
    }
    added
}

/// Prepare up to `max` LRU locks and cancel them locally; the survivors
/// stay in `batch` for the caller to send.
pub(crate) async fn cancel_lru_local(
    ns: &Arc<Namespace>,
    batch: &mut Vec<Arc<Lock>>,
    target: usize,
    max: usize,
    lru_flags: LruFlags,
    cancel_flags: CancelFlags,
) -> usize {
    let from = batch.len();
    let added = prepare_lru_list(ns, batch, target, max, lru_flags);
    if added == 0 {
        return 0;
    }
    crate::cancel::cancel_list_local(batch, from, cancel_flags).await
}

/// Cancel at least `nr` locks from the namespace LRU. With
/// [`CancelFlags::ASYNC`] the prepared batch goes to the background
/// worker; otherwise the cancels are driven inline.
pub async fn cancel_lru(ns: &Arc<Namespace>, nr: usize, cancel_flags: CancelFlags, lru_flags: LruFlags) -> usize {
    let mut batch = Vec::new();
    let count = prepare_lru_list(ns, &mut batch, nr, 0, lru_flags);
    if count == 0 {
        return 0;
    }
    if cancel_flags.contains(CancelFlags::ASYNC) {
        if let Some(queue) = batch.first().and_then(|l| l.export()).map(|e| e.import().queue().clone()) {
            queue.submit_cancel_batch(CancelBatch {
                locks: std::mem::take(&mut batch),
                flags: cancel_flags,
            });
            return count;
        }
    }
    let _ = crate::cancel::cancel_list_local(&mut batch, 0, cancel_flags).await;
    let _ = crate::cancel::cancel_list(batch, None, cancel_flags).await;
    count
}

/// Apply the server pool feedback riding on a reply. Zero SLV or limit
/// means the server does not support (or momentarily cannot compute) the
/// feedback and must leave our view untouched.
pub fn update_pool(ns: &Arc<Namespace>, reply: &RpcReply) {
    if !ns.connect_lru_resize() {
        return;
    }
    if reply.slv == 0 || reply.limit == 0 {
        debug!(slv = reply.slv, limit = reply.limit, "zero SLV or limit found, ignoring");
        return;
    }
    ns.set_pool(reply.slv, reply.limit);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::ConnectCaps;
    use crate::tests::support::{cached_lock, test_namespace, test_namespace_with};
    use crate::types::{LockMode, ResourceName};

    fn fill_lru(ns: &Arc<Namespace>, n: usize) -> Vec<Arc<Lock>> {
        let now = ns.coarse_now();
        (0..n)
            .map(|i| {
                let lock = cached_lock(ns, ResourceName::new([40 + i as u64, 0, 0, 0]), LockMode::Pr);
                lock.with_state(|st| st.last_used = now.saturating_sub(30));
                lock
            })
            .collect()
    }

    #[tokio::test]
    async fn test_prepare_respects_max() {
        let ns = test_namespace_with(|c| {
            c.lru.max_unused = 0;
        });
        ns.set_connect_caps(ConnectCaps {
            cancelset: false,
            lru_resize: true,
        });
        let _locks = fill_lru(&ns, 10);
        let mut batch = Vec::new();
        let added = prepare_lru_list(&ns, &mut batch, 4, 6, LruFlags::PASSED);
        assert_eq!(added, 4);
        assert!(added <= 6.max(4));

        let mut batch = Vec::new();
        let added = prepare_lru_list(&ns, &mut batch, 8, 5, LruFlags::PASSED);
        assert_eq!(added, 5);
    }

    #[tokio::test]
    async fn test_prepare_monotone_across_retries() {
        let ns = test_namespace_with(|c| {
            c.lru.max_unused = 0;
        });
        ns.set_connect_caps(ConnectCaps {
            cancelset: false,
            lru_resize: true,
        });
        let _locks = fill_lru(&ns, 9);
        let mut first = Vec::new();
        let mut second = Vec::new();
        let a = prepare_lru_list(&ns, &mut first, 3, 3, LruFlags::PASSED);
        let b = prepare_lru_list(&ns, &mut second, 3, 3, LruFlags::PASSED);
        assert_eq!(a, 3);
        assert!(b >= a);
    }

    #[tokio::test]
    async fn test_grace_tick_skips_fresh_locks() {
        let ns = test_namespace();
        let lock = cached_lock(&ns, ResourceName::new([50, 0, 0, 0]), LockMode::Pr);
        lock.with_state(|st| st.last_used = ns.coarse_now());
        let mut batch = Vec::new();
        let added = prepare_lru_list(&ns, &mut batch, 1, 0, LruFlags::PASSED);
        assert_eq!(added, 0);
        assert_eq!(lock.list_state(), ListState::UnusedLru);
    }

    #[tokio::test]
    async fn test_claim_sets_cancel_milestones() {
        let ns = test_namespace_with(|c| {
            c.lru.max_unused = 0;
        });
        let lock = cached_lock(&ns, ResourceName::new([51, 0, 0, 0]), LockMode::Pr);
        lock.with_state(|st| {
            st.last_used = ns.coarse_now().saturating_sub(5);
            st.flags.insert(LockFlags::CANCEL_ON_BLOCK);
        });
        let mut batch = Vec::new();
        let added = prepare_lru_list(&ns, &mut batch, 1, 0, LruFlags::PASSED);
        assert_eq!(added, 1);
        let flags = lock.flags();
        assert!(flags.contains(LockFlags::CBPENDING | LockFlags::CANCELING));
        assert!(!flags.contains(LockFlags::CANCEL_ON_BLOCK));
        assert_eq!(lock.list_state(), ListState::BlAst);
        assert_eq!(ns.nr_unused(), 0);
    }

    #[tokio::test]
    async fn test_aged_policy_keeps_young_cancels_old() {
        let ns = test_namespace_with(|c| {
            c.lru.max_age = std::time::Duration::from_secs(60);
            c.lru.max_unused = 100;
        });
        let now = ns.coarse_now();
        let old = cached_lock(&ns, ResourceName::new([52, 0, 0, 0]), LockMode::Pr);
        old.with_state(|st| st.last_used = now.saturating_sub(120));
        let young = cached_lock(&ns, ResourceName::new([53, 0, 0, 0]), LockMode::Pr);
        young.with_state(|st| st.last_used = now.saturating_sub(5));

        let mut batch = Vec::new();
        let added = prepare_lru_list(&ns, &mut batch, 0, 0, LruFlags::AGED);
        assert_eq!(added, 1);
        assert!(old.flags().contains(LockFlags::CANCELING));
        assert!(!young.flags().contains(LockFlags::CANCELING));
    }

    #[tokio::test]
    async fn test_lrur_policy_weighs_against_slv() {
        let ns = test_namespace();
        ns.set_connect_caps(ConnectCaps {
            cancelset: false,
            lru_resize: true,
        });
        let lock = cached_lock(&ns, ResourceName::new([54, 0, 0, 0]), LockMode::Pr);
        lock.with_state(|st| st.last_used = ns.coarse_now().saturating_sub(100));

        // SLV unknown: everything stays.
        let mut batch = Vec::new();
        assert_eq!(prepare_lru_list(&ns, &mut batch, 0, 0, LruFlags::LRUR), 0);

        // Tiny SLV: the weight (lvf * age * unused) exceeds it.
        ns.set_pool(10, 5);
        let mut batch = Vec::new();
        assert_eq!(prepare_lru_list(&ns, &mut batch, 0, 0, LruFlags::LRUR), 1);
        assert!(ns.pool().clv >= 100);
    }

    #[tokio::test]
    async fn test_no_wait_policy_marks_skipped() {
        let ns = test_namespace();
        let lock = cached_lock(&ns, ResourceName::new([55, 0, 0, 0]), LockMode::Pr);
        lock.with_state(|st| st.last_used = ns.coarse_now().saturating_sub(5));

        // Plain locks are never no-wait cancellable: marked and skipped.
        let mut batch = Vec::new();
        assert_eq!(prepare_lru_list(&ns, &mut batch, 1, 0, LruFlags::NO_WAIT), 0);
        assert!(lock.flags().contains(LockFlags::SKIPPED));

        // The next no-wait pass does not even consult the policy.
        let mut batch = Vec::new();
        assert_eq!(prepare_lru_list(&ns, &mut batch, 1, 0, LruFlags::NO_WAIT), 0);
    }

    #[tokio::test]
    async fn test_update_pool_ignores_zero_feedback() {
        let ns = test_namespace();
        ns.set_connect_caps(ConnectCaps {
            cancelset: false,
            lru_resize: true,
        });
        let mut reply = RpcReply::granted(1);
        reply.slv = 5000;
        reply.limit = 32;
        update_pool(&ns, &reply);
        assert_eq!(ns.pool().slv, 5000);
        assert_eq!(ns.pool().limit, 32);

        let mut zero = RpcReply::granted(2);
        zero.slv = 0;
        zero.limit = 17;
        update_pool(&ns, &zero);
        assert_eq!(ns.pool().slv, 5000);
        assert_eq!(ns.pool().limit, 32);

        zero.slv = 700;
        zero.limit = 0;
        update_pool(&ns, &zero);
        assert_eq!(ns.pool().slv, 5000);
    }
}
