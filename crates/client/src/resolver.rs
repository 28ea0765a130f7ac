//! Dependency ordering of queued mutations.
//!
//! The graph has one node per outstanding (Pending or Syncing) entry and two
//! kinds of edges:
//! - explicit: every key in `depends_on` that is still queued
//! - implicit: entries targeting the same entity id or temp id form a chain
//!   in enqueue order, so two writes to one entity are never in flight
//!   together
//!
//! Kahn's algorithm with a min-heap on `(timestamp, id)` yields a stable
//! order. Whatever Kahn cannot consume is either on a cycle or downstream of
//! one.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};

use crate::idempotency::IdempotencyKey;
use crate::types::{EntityKind, MutationEntry, MutationStatus, Operation};

/// Result of one resolver pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Pending entries with no unresolved predecessor, in send order.
    /// At most one per entity chain.
    pub ready: Vec<IdempotencyKey>,
    /// Topological order of every acyclic outstanding entry.
    pub order: Vec<IdempotencyKey>,
    /// Strongly connected groups of entries that depend on each other.
    pub cycles: Vec<Vec<IdempotencyKey>>,
    /// Pending entries that can never be sent as they are: a dependency
    /// failed, is unknown, or sits on a cycle.
    pub blocked: Vec<IdempotencyKey>,
}

impl Resolution {
    pub fn has_cycles(&self) -> bool {
        !self.cycles.is_empty()
    }
}

/// Order `entries`. `is_synced` answers for dependency keys that are no
/// longer in the queue because they already reached `Synced`.
pub fn resolve<'a, I, F>(entries: I, is_synced: F) -> Resolution
where
    I: IntoIterator<Item = &'a MutationEntry>,
    F: Fn(&IdempotencyKey) -> bool,
{
    let all: Vec<&MutationEntry> = entries.into_iter().collect();

    let mut nodes: Vec<&MutationEntry> = all
        .iter()
        .copied()
        .filter(|e| e.status.is_outstanding())
        .collect();
    // Index order is send order; the heap below relies on it.
    nodes.sort_by_key(|e| e.sort_key());

    let index: HashMap<IdempotencyKey, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, e)| (e.idempotency_key, i))
        .collect();
    let n = nodes.len();

    let mut preds: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); n];
    let mut blocked = vec![false; n];

    for (i, entry) in nodes.iter().enumerate() {
        for dep in &entry.depends_on {
            match index.get(dep) {
                Some(&j) => {
                    preds[i].insert(j);
                }
                None if is_synced(dep) => {}
                // Failed, discarded, or never known.
                None => blocked[i] = true,
            }
        }
    }

    let mut chain_tail: HashMap<(EntityKind, &str), usize> = HashMap::new();
    for (i, entry) in nodes.iter().enumerate() {
        if let Some(target) = entry.target() {
            if let Some(&j) = chain_tail.get(&(entry.entity, target)) {
                preds[i].insert(j);
            }
            chain_tail.insert((entry.entity, target), i);
        }
    }

    // A failed Create leaves its temp id without a server counterpart.
    for failed in all
        .iter()
        .filter(|e| e.status == MutationStatus::Failed && e.operation == Operation::Create)
    {
        if let Some(temp_id) = failed.temp_id.as_deref() {
            for (i, entry) in nodes.iter().enumerate() {
                if entry.targets(failed.entity, temp_id) {
                    blocked[i] = true;
                }
            }
        }
    }

    let mut succs: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, p) in preds.iter().enumerate() {
        for &j in p {
            succs[j].push(i);
        }
    }

    let mut indegree: Vec<usize> = preds.iter().map(BTreeSet::len).collect();
    let mut heap: BinaryHeap<Reverse<usize>> = (0..n)
        .filter(|&i| indegree[i] == 0)
        .map(Reverse)
        .collect();
    let mut order = Vec::with_capacity(n);
    let mut visited = vec![false; n];

    while let Some(Reverse(i)) = heap.pop() {
        visited[i] = true;
        order.push(i);
        for &s in &succs[i] {
            indegree[s] -= 1;
            if indegree[s] == 0 {
                heap.push(Reverse(s));
            }
        }
    }

    for &i in &order {
        if preds[i].iter().any(|&p| blocked[p]) {
            blocked[i] = true;
        }
    }

    let remaining: Vec<usize> = (0..n).filter(|&i| !visited[i]).collect();
    let reach: HashMap<usize, HashSet<usize>> = remaining
        .iter()
        .map(|&i| (i, reachable_from(i, &succs)))
        .collect();

    let mut grouped = vec![false; n];
    let mut cycles = Vec::new();
    for &i in &remaining {
        if grouped[i] || !reach[&i].contains(&i) {
            continue;
        }
        let members: Vec<usize> = remaining
            .iter()
            .copied()
            .filter(|j| reach[&i].contains(j) && reach[j].contains(&i))
            .collect();
        for &m in &members {
            grouped[m] = true;
        }
        cycles.push(members.iter().map(|&m| nodes[m].idempotency_key).collect());
    }
    for &i in &remaining {
        if !grouped[i] {
            blocked[i] = true;
        }
    }

    let ready = order
        .iter()
        .copied()
        .filter(|&i| {
            preds[i].is_empty() && !blocked[i] && nodes[i].status == MutationStatus::Pending
        })
        .map(|i| nodes[i].idempotency_key)
        .collect();

    let blocked = (0..n)
        .filter(|&i| blocked[i] && !grouped[i] && nodes[i].status == MutationStatus::Pending)
        .map(|i| nodes[i].idempotency_key)
        .collect();

    Resolution {
        ready,
        order: order.iter().map(|&i| nodes[i].idempotency_key).collect(),
        cycles,
        blocked,
    }
}

/// Nodes reachable from `start` through one or more edges.
fn reachable_from(start: usize, succs: &[Vec<usize>]) -> HashSet<usize> {
    let mut seen = HashSet::new();
    let mut stack: Vec<usize> = succs[start].clone();
    while let Some(i) = stack.pop() {
        if seen.insert(i) {
            stack.extend(succs[i].iter().copied());
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::raw_entry;
    use chrono::{Duration, Utc};
    use proptest::prelude::*;
    use stowage_core::TenantId;

    fn chain(n: u64) -> Vec<MutationEntry> {
        let tenant = TenantId::new();
        let base = Utc::now();
        (1..=n)
            .map(|i| {
                let mut e = raw_entry(tenant, i, EntityKind::Item);
                e.timestamp = base + Duration::milliseconds(i as i64);
                e
            })
            .collect()
    }

    fn never(_: &IdempotencyKey) -> bool {
        false
    }

    #[test]
    fn independent_entries_are_all_ready_in_enqueue_order() {
        let entries = chain(3);
        let resolution = resolve(&entries, never);
        let keys: Vec<_> = entries.iter().map(|e| e.idempotency_key).collect();
        assert_eq!(resolution.ready, keys);
        assert_eq!(resolution.order, keys);
    }

    #[test]
    fn explicit_dependency_holds_back_dependent() {
        let mut entries = chain(2);
        entries[1].depends_on = vec![entries[0].idempotency_key];

        let resolution = resolve(&entries, never);
        assert_eq!(resolution.ready, vec![entries[0].idempotency_key]);

        entries[0].status = MutationStatus::Syncing;
        let resolution = resolve(&entries, never);
        assert!(resolution.ready.is_empty());
    }

    #[test]
    fn synced_dependency_is_satisfied() {
        let mut entries = chain(2);
        let gone = entries.remove(0).idempotency_key;
        entries[0].depends_on = vec![gone];

        let resolution = resolve(&entries, |k| *k == gone);
        assert_eq!(resolution.ready, vec![entries[0].idempotency_key]);
        assert!(resolution.blocked.is_empty());
    }

    #[test]
    fn same_entity_updates_form_an_implicit_chain() {
        let mut entries = chain(3);
        entries[1].entity_id = entries[0].entity_id.clone();
        entries[2].entity_id = entries[0].entity_id.clone();

        let resolution = resolve(&entries, never);
        assert_eq!(resolution.ready, vec![entries[0].idempotency_key]);
        assert_eq!(resolution.order.len(), 3);
    }

    #[test]
    fn failed_dependency_blocks_transitively() {
        let mut entries = chain(3);
        entries[0].status = MutationStatus::Failed;
        entries[1].depends_on = vec![entries[0].idempotency_key];
        entries[2].depends_on = vec![entries[1].idempotency_key];

        let resolution = resolve(&entries, never);
        assert!(resolution.ready.is_empty());
        assert_eq!(
            resolution.blocked,
            vec![entries[1].idempotency_key, entries[2].idempotency_key]
        );
    }

    #[test]
    fn three_way_cycle_is_reported_as_one_group() {
        let mut entries = chain(4);
        let k: Vec<_> = entries.iter().map(|e| e.idempotency_key).collect();
        entries[0].depends_on = vec![k[2]];
        entries[1].depends_on = vec![k[0]];
        entries[2].depends_on = vec![k[1]];
        entries[3].depends_on = vec![k[2]];

        let resolution = resolve(&entries, never);
        assert_eq!(resolution.cycles, vec![vec![k[0], k[1], k[2]]]);
        assert_eq!(resolution.blocked, vec![k[3]]);
        assert!(resolution.ready.is_empty());
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let mut entries = chain(1);
        entries[0].depends_on = vec![entries[0].idempotency_key];
        let resolution = resolve(&entries, never);
        assert_eq!(resolution.cycles, vec![vec![entries[0].idempotency_key]]);
    }

    proptest! {
        #[test]
        fn order_respects_every_edge(
            deps in prop::collection::vec(prop::collection::vec(any::<prop::sample::Index>(), 0..3), 1..24),
            shared in prop::collection::vec(0u8..4, 24),
        ) {
            let mut entries = chain(deps.len() as u64);
            for (i, picks) in deps.iter().enumerate() {
                if i > 0 {
                    entries[i].depends_on = picks
                        .iter()
                        .map(|p| entries[p.index(i)].idempotency_key)
                        .collect();
                }
                entries[i].entity_id = Some(format!("srv_{}", shared[i]));
            }

            let resolution = resolve(&entries, never);
            prop_assert!(resolution.cycles.is_empty());
            prop_assert_eq!(resolution.order.len(), entries.len());

            let position: HashMap<_, _> = resolution
                .order
                .iter()
                .enumerate()
                .map(|(i, k)| (*k, i))
                .collect();
            for entry in &entries {
                for dep in &entry.depends_on {
                    prop_assert!(position[dep] < position[&entry.idempotency_key]);
                }
            }

            let ready_targets: HashSet<_> = resolution
                .ready
                .iter()
                .map(|k| entries.iter().find(|e| e.idempotency_key == *k).and_then(|e| e.entity_id.clone()))
                .collect();
            prop_assert_eq!(ready_targets.len(), resolution.ready.len());
        }
    }
}
