/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Wait-for edges between threads that live in different schedulers.
//!
//! Ordering inside one scheduler follows from its runnable list. Across
//! schedulers a thread that must wait for a foreign thread is blocked with
//! [`BlockReason::ForeignThread`](crate::BlockReason::ForeignThread) and an
//! edge records what it waits on. The edge is released when the foreign
//! thread is signalled.

use crate::arena::ThreadId;
use crate::scheduler::SchedulerId;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Dependency {
    /// `waiter` may not continue until `on` has been signalled. With
    /// `interrupt` set, `on` was enqueued to interrupt `waiter`, and
    /// cancelling `waiter` cancels `on` as long as it is still in the
    /// scheduler it was enqueued into.
    ForeignBlock {
        interrupt: bool,
        blocking_scheduler: SchedulerId,
    },
    /// `waiter` is a terminating thread waiting for the teardown of a child
    /// document, whose terminating thread is `on`.
    TerminatingChild,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WaitFor {
    pub waiter: ThreadId,
    pub on: ThreadId,
    pub kind: Dependency,
}

#[derive(Debug, Default)]
pub(crate) struct DependencyGraph {
    edges: Vec<WaitFor>,
}

impl DependencyGraph {
    pub(crate) fn add(&mut self, edge: WaitFor) {
        self.edges.push(edge);
    }

    pub(crate) fn edges(&self) -> &[WaitFor] {
        &self.edges
    }

    /// Foreign threads `waiter` is still blocked on.
    pub(crate) fn foreign_blockers(&self, waiter: ThreadId) -> usize {
        self.edges
            .iter()
            .filter(|edge| {
                edge.waiter == waiter && matches!(edge.kind, Dependency::ForeignBlock { .. })
            })
            .count()
    }

    /// Remove and return every edge waiting on `on`.
    pub(crate) fn take_waiting_on(&mut self, on: ThreadId) -> Vec<WaitFor> {
        let (taken, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.edges)
            .into_iter()
            .partition(|edge| edge.on == on);
        self.edges = kept;
        taken
    }

    /// Remove and return every edge `waiter` waits through.
    pub(crate) fn take_waited_by(&mut self, waiter: ThreadId) -> Vec<WaitFor> {
        let (taken, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.edges)
            .into_iter()
            .partition(|edge| edge.waiter == waiter);
        self.edges = kept;
        taken
    }
}

#[cfg(feature = "deadlock_detection")]
pub(crate) mod deadlock {
    use rustc_hash::{FxHashMap, FxHashSet};

    use crate::arena::ThreadId;

    /// Depth first search for a cycle in a wait-for relation. `successors`
    /// lists, for each thread, the threads it waits for. Returns the threads on
    /// the first cycle found, in wait order.
    pub(crate) fn find_cycle(
        successors: &FxHashMap<ThreadId, Vec<ThreadId>>,
    ) -> Option<Vec<ThreadId>> {
        let mut finished = FxHashSet::default();
        let mut roots: Vec<_> = successors.keys().copied().collect();
        roots.sort();

        for root in roots {
            if finished.contains(&root) {
                continue;
            }
            let mut path = Vec::new();
            let mut on_path = FxHashSet::default();
            if let Some(cycle) = visit(root, successors, &mut path, &mut on_path, &mut finished) {
                return Some(cycle);
            }
        }
        None
    }

    fn visit(
        thread: ThreadId,
        successors: &FxHashMap<ThreadId, Vec<ThreadId>>,
        path: &mut Vec<ThreadId>,
        on_path: &mut FxHashSet<ThreadId>,
        finished: &mut FxHashSet<ThreadId>,
    ) -> Option<Vec<ThreadId>> {
        if on_path.contains(&thread) {
            let start = path.iter().position(|&id| id == thread)?;
            return Some(path[start..].to_vec());
        }
        if finished.contains(&thread) {
            return None;
        }

        path.push(thread);
        on_path.insert(thread);
        for &next in successors.get(&thread).into_iter().flatten() {
            if let Some(cycle) = visit(next, successors, path, on_path, finished) {
                return Some(cycle);
            }
        }
        path.pop();
        on_path.remove(&thread);
        finished.insert(thread);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;

    #[test]
    fn test_edges_are_released_by_either_end() {
        let mut arena = Arena::default();
        let (a, b, c) = (arena.insert(()), arena.insert(()), arena.insert(()));
        let foreign = Dependency::ForeignBlock {
            interrupt: false,
            blocking_scheduler: SchedulerId(2),
        };

        let mut graph = DependencyGraph::default();
        graph.add(WaitFor {
            waiter: a,
            on: b,
            kind: foreign,
        });
        graph.add(WaitFor {
            waiter: a,
            on: c,
            kind: foreign,
        });
        graph.add(WaitFor {
            waiter: c,
            on: b,
            kind: Dependency::TerminatingChild,
        });
        assert_eq!(graph.foreign_blockers(a), 2);

        let released = graph.take_waiting_on(b);
        assert_eq!(released.len(), 2);
        assert_eq!(graph.foreign_blockers(a), 1);

        assert_eq!(graph.take_waited_by(a).len(), 1);
        assert!(graph.edges().is_empty());
    }

    #[cfg(feature = "deadlock_detection")]
    #[test]
    fn test_find_cycle() {
        use rustc_hash::FxHashMap;

        let mut arena = Arena::default();
        let (a, b, c) = (arena.insert(()), arena.insert(()), arena.insert(()));

        let mut successors = FxHashMap::default();
        successors.insert(a, vec![b]);
        successors.insert(b, vec![c]);
        assert_eq!(deadlock::find_cycle(&successors), None);

        successors.insert(c, vec![a]);
        let cycle = deadlock::find_cycle(&successors).unwrap();
        assert_eq!(cycle.len(), 3);
    }
}
