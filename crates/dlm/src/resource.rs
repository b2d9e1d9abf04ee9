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

use parking_lot::Mutex;
use std::ops::ControlFlow;
use std::sync::{Arc, Weak};

use crate::lock::Lock;
use crate::namespace::Namespace;
use crate::types::{LockKind, ResourceName};

/// Granted and waiting locks of one resource, guarded together. Ownership
/// runs namespace → resource → lock; locks point back up through weaks.
#[derive(Debug, Default)]
pub struct ResourceLists {
    pub granted: Vec<Arc<Lock>>,
    pub waiting: Vec<Arc<Lock>>,
}

/// One server-owned resource as seen by this client.
#[derive(Debug)]
pub struct Resource {
    name: ResourceName,
    kind: LockKind,
    ns: Weak<Namespace>,
    pub(crate) lists: Mutex<ResourceLists>,
}

impl Resource {
    pub(crate) fn new(ns: &Arc<Namespace>, name: ResourceName, kind: LockKind) -> Arc<Self> {
        Arc::new(Self {
            name,
            kind,
            ns: Arc::downgrade(ns),
            lists: Mutex::new(ResourceLists::default()),
        })
    }

    pub fn name(&self) -> ResourceName {
        self.name
    }

    pub fn kind(&self) -> LockKind {
        self.kind
    }

    pub(crate) fn namespace(&self) -> Option<Arc<Namespace>> {
        self.ns.upgrade()
    }

    /// Visit granted then waiting locks under the resource lists lock.
    /// The visitor may take individual lock mutexes but must not re-enter
    /// this resource.
    pub fn foreach(&self, mut f: impl FnMut(&Arc<Lock>) -> ControlFlow<()>) -> ControlFlow<()> {
        let lists = self.lists.lock();
        for lock in lists.granted.iter().chain(lists.waiting.iter()) {
            f(lock)?;
        }
        ControlFlow::Continue(())
    }

    /// Clone out the membership, granted first, for lock-free processing.
    pub fn locks_snapshot(&self) -> Vec<Arc<Lock>> {
        let lists = self.lists.lock();
        lists.granted.iter().chain(lists.waiting.iter()).cloned().collect()
    }

    /// Number of locks currently attached to this resource.
    pub fn lock_count(&self) -> usize {
        let lists = self.lists.lock();
        lists.granted.len() + lists.waiting.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::ListState;
    use crate::tests::support::{test_lock_on, test_namespace};
    use crate::types::LockMode;

    #[tokio::test]
    async fn test_foreach_order_and_stop() {
        let ns = test_namespace();
        let name = ResourceName::new([21, 0, 0, 0]);
        let granted = test_lock_on(&ns, name, LockMode::Pr);
        let waiting = test_lock_on(&ns, name, LockMode::Pw);
        granted.with_res_and_state(|lists, st| granted.grant_nolock(lists, st, LockMode::Pr));
        waiting.with_res_and_state(|lists, st| {
            if let Some(lists) = lists {
                lists.waiting.push(waiting.clone());
                st.list = ListState::Waiting;
            }
        });

        let res = ns.resource_get(name, crate::types::LockKind::Plain, false).unwrap();
        let mut seen = Vec::new();
        let flow = res.foreach(|lock| {
            seen.push(lock.handle().cookie);
            ControlFlow::Continue(())
        });
        assert_eq!(flow, ControlFlow::Continue(()));
        assert_eq!(seen, vec![granted.handle().cookie, waiting.handle().cookie]);

        let mut first = None;
        let flow = res.foreach(|lock| {
            first = Some(lock.handle().cookie);
            ControlFlow::Break(())
        });
        assert_eq!(flow, ControlFlow::Break(()));
        assert_eq!(first, Some(granted.handle().cookie));
    }

    #[tokio::test]
    async fn test_lock_count() {
        let ns = test_namespace();
        let name = ResourceName::new([22, 0, 0, 0]);
        let res = ns.resource_get(name, crate::types::LockKind::Plain, true).unwrap();
        assert_eq!(res.lock_count(), 0);
        let lock = test_lock_on(&ns, name, LockMode::Cr);
        lock.with_res_and_state(|lists, st| lock.grant_nolock(lists, st, LockMode::Cr));
        assert_eq!(res.lock_count(), 1);
    }
}
