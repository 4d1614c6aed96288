//! Blocking-edge graph helpers.
//!
//! Edges are stored as `task -> {blockers}`. Incremental inserts are checked
//! with a reachability walk; whole-graph validation (used when reopening a
//! store) uses Kahn's algorithm.

use crate::store::TaskId;
use std::collections::{BTreeSet, HashMap, HashSet};

/// Blocking edges keyed by the blocked task.
pub type EdgeMap = HashMap<TaskId, BTreeSet<TaskId>>;

/// Returns true if making `task` blocked by `blocker` would close a cycle,
/// i.e. `blocker` is `task` or is already (transitively) blocked by `task`.
pub fn would_create_cycle(edges: &EdgeMap, task: TaskId, blocker: TaskId) -> bool {
    if task == blocker {
        return true;
    }

    let mut stack = vec![blocker];
    let mut seen = HashSet::new();

    while let Some(node) = stack.pop() {
        if !seen.insert(node) {
            continue;
        }
        if let Some(blockers) = edges.get(&node) {
            for &next in blockers {
                if next == task {
                    return true;
                }
                stack.push(next);
            }
        }
    }

    false
}

/// Validate a whole edge set; returns the tasks that sit on a cycle.
pub fn cycle_members(edges: &EdgeMap) -> Vec<TaskId> {
    let mut nodes: BTreeSet<TaskId> = BTreeSet::new();
    let mut dependents: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
    let mut in_degree: HashMap<TaskId, usize> = HashMap::new();

    for (&task, blockers) in edges {
        nodes.insert(task);
        *in_degree.entry(task).or_default() += blockers.len();
        for &blocker in blockers {
            nodes.insert(blocker);
            in_degree.entry(blocker).or_default();
            dependents.entry(blocker).or_default().push(task);
        }
    }

    let mut queue: Vec<TaskId> = nodes
        .iter()
        .filter(|n| in_degree.get(n).copied().unwrap_or(0) == 0)
        .copied()
        .collect();

    while let Some(node) = queue.pop() {
        if let Some(deps) = dependents.get(&node) {
            for dep in deps {
                if let Some(deg) = in_degree.get_mut(dep) {
                    *deg -= 1;
                    if *deg == 0 {
                        queue.push(*dep);
                    }
                }
            }
        }
    }

    nodes
        .into_iter()
        .filter(|n| in_degree.get(n).copied().unwrap_or(0) > 0)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edges(pairs: &[(i64, i64)]) -> EdgeMap {
        let mut map = EdgeMap::new();
        for &(task, blocker) in pairs {
            map.entry(TaskId(task)).or_default().insert(TaskId(blocker));
        }
        map
    }

    #[test]
    fn test_self_edge_is_cycle() {
        assert!(would_create_cycle(&EdgeMap::new(), TaskId(1), TaskId(1)));
    }

    #[test]
    fn test_transitive_cycle_detected() {
        // 3 blocked by 2, 2 blocked by 1
        let map = edges(&[(3, 2), (2, 1)]);
        // Making 1 blocked by 3 closes the loop
        assert!(would_create_cycle(&map, TaskId(1), TaskId(3)));
        // Making 3 blocked by 1 is just a redundant edge
        assert!(!would_create_cycle(&map, TaskId(3), TaskId(1)));
    }

    #[test]
    fn test_diamond_is_acyclic() {
        let map = edges(&[(2, 1), (3, 1), (4, 2), (4, 3)]);
        assert!(cycle_members(&map).is_empty());
        assert!(!would_create_cycle(&map, TaskId(5), TaskId(4)));
    }

    #[test]
    fn test_cycle_members_reports_loop_only() {
        // 1 -> 2 -> 3 -> 1 loop plus an unrelated 5 blocked by 4
        let map = edges(&[(1, 3), (2, 1), (3, 2), (5, 4)]);
        let members = cycle_members(&map);
        assert_eq!(members, vec![TaskId(1), TaskId(2), TaskId(3)]);
    }
}
