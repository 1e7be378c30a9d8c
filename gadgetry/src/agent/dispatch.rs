//! Topological wave planning for one iteration's invocations.
//!
//! Within a wave, gadgets run concurrently; across waves, strict
//! happens-before. Only dependencies pointing at invocations of the same
//! iteration order the waves; everything else is resolved against the tree
//! at execution time.

use std::collections::HashMap;

use crate::parser::ParsedGadgetCall;
use crate::tree::NodeId;

/// One parsed invocation scheduled for dispatch, with its tree node and its
/// position in the parsed stream.
pub(crate) type PlannedCall = (ParsedGadgetCall, NodeId);

/// Kahn layering over the in-iteration dependency graph.
///
/// Returns the waves (indices into `calls`, each wave sorted by parse
/// order) and the indices left over by cycles.
pub(crate) fn build_waves(calls: &[PlannedCall]) -> (Vec<Vec<usize>>, Vec<usize>) {
    let index_of: HashMap<&str, usize> = calls
        .iter()
        .enumerate()
        .map(|(index, (call, _))| (call.invocation_id.as_str(), index))
        .collect();

    let mut indegree = vec![0usize; calls.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); calls.len()];
    for (index, (call, _)) in calls.iter().enumerate() {
        for dep in &call.dependencies {
            if let Some(&dep_index) = index_of.get(dep.as_str())
                && dep_index != index
            {
                indegree[index] += 1;
                dependents[dep_index].push(index);
            }
        }
    }

    let mut waves: Vec<Vec<usize>> = Vec::new();
    let mut current: Vec<usize> = (0..calls.len()).filter(|&i| indegree[i] == 0).collect();
    let mut placed = 0;
    while !current.is_empty() {
        placed += current.len();
        let mut next = Vec::new();
        for &index in &current {
            for &dependent in &dependents[index] {
                indegree[dependent] -= 1;
                if indegree[dependent] == 0 {
                    next.push(dependent);
                }
            }
        }
        next.sort_unstable();
        waves.push(std::mem::replace(&mut current, next));
    }

    let cycles = if placed == calls.len() {
        Vec::new()
    } else {
        let mut missing: Vec<usize> = (0..calls.len())
            .filter(|i| !waves.iter().any(|wave| wave.contains(i)))
            .collect();
        missing.sort_unstable();
        missing
    };

    (waves, cycles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::ExecutionTree;
    use std::collections::BTreeSet;

    fn plan(specs: &[(&str, &[&str])]) -> Vec<PlannedCall> {
        let tree = ExecutionTree::new();
        specs
            .iter()
            .map(|(id, deps)| {
                let call = ParsedGadgetCall {
                    name: "T".into(),
                    invocation_id: (*id).to_string(),
                    params_raw: String::new(),
                    params: Some(serde_json::json!({})),
                    parse_error: None,
                    dependencies: deps.iter().map(|d| (*d).to_string()).collect::<BTreeSet<_>>(),
                };
                let node = tree.add_gadget(&call, None);
                (call, node)
            })
            .collect()
    }

    #[test]
    fn independent_calls_share_one_wave() {
        let calls = plan(&[("a", &[]), ("b", &[]), ("c", &[])]);
        let (waves, cycles) = build_waves(&calls);
        assert_eq!(waves, vec![vec![0, 1, 2]]);
        assert!(cycles.is_empty());
    }

    #[test]
    fn chain_layers_into_sequential_waves() {
        let calls = plan(&[("a", &[]), ("b", &["a"]), ("c", &["b"])]);
        let (waves, _) = build_waves(&calls);
        assert_eq!(waves, vec![vec![0], vec![1], vec![2]]);
    }

    #[test]
    fn diamond_merges_at_the_join() {
        let calls = plan(&[
            ("a", &[]),
            ("b", &["a"]),
            ("c", &["a"]),
            ("d", &["b", "c"]),
        ]);
        let (waves, _) = build_waves(&calls);
        assert_eq!(waves, vec![vec![0], vec![1, 2], vec![3]]);
    }

    #[test]
    fn out_of_iteration_deps_do_not_order() {
        let calls = plan(&[("a", &["earlier_iteration"]), ("b", &[])]);
        let (waves, cycles) = build_waves(&calls);
        assert_eq!(waves, vec![vec![0, 1]]);
        assert!(cycles.is_empty());
    }

    #[test]
    fn cycles_are_reported_not_scheduled() {
        let calls = plan(&[("a", &["b"]), ("b", &["a"]), ("c", &[])]);
        let (waves, cycles) = build_waves(&calls);
        assert_eq!(waves, vec![vec![2]]);
        assert_eq!(cycles, vec![0, 1]);
    }

    #[test]
    fn self_dependency_is_ignored() {
        let calls = plan(&[("a", &["a"])]);
        let (waves, cycles) = build_waves(&calls);
        assert_eq!(waves, vec![vec![0]]);
        assert!(cycles.is_empty());
    }
}
