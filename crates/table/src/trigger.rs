// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use async_trait::async_trait;

use crate::registry::Registry;

/// Callback invoked on every applied update to a local shard (spec.md
/// §4.3). May veto the write and may mutate the proposed value in place
/// before it is accumulated. `registry` lets a trigger reach sibling
/// tables to enqueue further writes (spec.md §9: triggers that need to
/// write elsewhere must go through `enqueue_update`, never back through
/// the table that is currently firing them — doing so would try to
/// re-acquire that table's own lock from the same task and hang it).
#[async_trait]
pub trait Trigger<K, V>: Send + Sync {
    /// Returns `true` to accept the write (possibly with `proposed`
    /// mutated), `false` to veto it entirely, leaving the shard untouched.
    async fn fire(&self, registry: &Registry, key: &K, current: Option<&V>, proposed: &mut V) -> bool;
}

struct Entry<K, V> {
    id: u32,
    enabled: bool,
    trigger: Box<dyn Trigger<K, V>>,
}

/// Per-table ordered list of triggers (spec.md §4.3). Registration order
/// is firing order; triggers are enabled/disabled by id between tasks,
/// never mid-task.
pub struct TriggerDispatcher<K, V> {
    next_id: u32,
    triggers: Vec<Entry<K, V>>,
}

impl<K, V> Default for TriggerDispatcher<K, V> {
    fn default() -> Self {
        Self {
            next_id: 0,
            triggers: Vec::new(),
        }
    }
}

impl<K, V> TriggerDispatcher<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `trigger` at the end of the firing order, returning its
    /// id for later enable/disable calls.
    pub fn register(&mut self, trigger: Box<dyn Trigger<K, V>>) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        self.triggers.push(Entry {
            id,
            enabled: true,
            trigger,
        });
        id
    }

    pub fn set_enabled(&mut self, trigger_id: u32, enabled: bool) {
        if let Some(entry) = self.triggers.iter_mut().find(|e| e.id == trigger_id) {
            entry.enabled = enabled;
        }
    }

    /// Runs every enabled trigger in registration order against `proposed`.
    /// Returns `false` (veto) the moment any trigger rejects the write;
    /// triggers after the vetoing one do not run, mirroring the source's
    /// abandon-on-first-veto semantics the spec carries forward.
    pub async fn dispatch(&self, registry: &Registry, key: &K, current: Option<&V>, proposed: &mut V) -> bool {
        for entry in &self.triggers {
            if !entry.enabled {
                continue;
            }
            if !entry.trigger.fire(registry, key, current, proposed).await {
                return false;
            }
        }
        true
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysAccept;
    #[async_trait]
    impl Trigger<u64, i64> for AlwaysAccept {
        async fn fire(&self, _registry: &Registry, _key: &u64, _current: Option<&i64>, proposed: &mut i64) -> bool {
            *proposed += 1;
            true
        }
    }

    struct AlwaysVeto;
    #[async_trait]
    impl Trigger<u64, i64> for AlwaysVeto {
        async fn fire(&self, _registry: &Registry, _key: &u64, _current: Option<&i64>, _proposed: &mut i64) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn triggers_fire_in_registration_order() {
        let registry = Registry::new();
        let mut dispatcher = TriggerDispatcher::new();
        dispatcher.register(Box::new(AlwaysAccept));
        dispatcher.register(Box::new(AlwaysAccept));

        let mut value = 0i64;
        let accepted = dispatcher.dispatch(&registry, &1, None, &mut value).await;
        assert!(accepted);
        assert_eq!(value, 2);
    }

    #[tokio::test]
    async fn veto_stops_the_write() {
        let registry = Registry::new();
        let mut dispatcher = TriggerDispatcher::new();
        dispatcher.register(Box::new(AlwaysVeto));
        dispatcher.register(Box::new(AlwaysAccept));

        let mut value = 0i64;
        let accepted = dispatcher.dispatch(&registry, &1, None, &mut value).await;
        assert!(!accepted);
        assert_eq!(value, 0, "trigger after the veto must not run");
    }

    #[tokio::test]
    async fn disabled_trigger_is_skipped() {
        let registry = Registry::new();
        let mut dispatcher = TriggerDispatcher::new();
        let id = dispatcher.register(Box::new(AlwaysVeto));
        dispatcher.set_enabled(id, false);

        let mut value = 0i64;
        assert!(dispatcher.dispatch(&registry, &1, None, &mut value).await);
    }
}
