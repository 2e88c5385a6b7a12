use std::collections::{BTreeMap, BTreeSet};

use crate::errors::GprocError;

/// One node of the startup graph: a process id and the ids it depends
/// on. Dependencies outside the batch are the caller's problem (they
/// are gated on being Running at spawn time, not ordered here).
#[derive(Debug, Clone)]
pub struct DepNode {
    pub id: String,
    pub dependencies: Vec<String>,
}

/// Computes dependency-ordered startup waves over the given batch.
///
/// Nodes within a wave have no edges between each other and may start
/// in parallel; every wave only depends on earlier waves. A cycle
/// rejects the whole batch before anything is started.
pub fn startup_waves(nodes: &[DepNode]) -> Result<Vec<Vec<String>>, GprocError> {
    let batch: BTreeSet<&str> = nodes.iter().map(|node| node.id.as_str()).collect();

    // In-batch edges only; remaining in-degree per node.
    let mut pending: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for node in nodes {
        let deps: BTreeSet<&str> = node
            .dependencies
            .iter()
            .map(String::as_str)
            .filter(|dep| batch.contains(dep))
            .collect();
        pending.insert(node.id.as_str(), deps);
    }

    let mut waves = Vec::new();
    while !pending.is_empty() {
        let ready: Vec<&str> = pending
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(id, _)| *id)
            .collect();

        if ready.is_empty() {
            let mut cycle: Vec<String> = pending.keys().map(|id| id.to_string()).collect();
            cycle.sort();
            return Err(GprocError::DependencyCycle(cycle));
        }

        for id in &ready {
            pending.remove(id);
        }
        for deps in pending.values_mut() {
            for id in &ready {
                deps.remove(id);
            }
        }
        waves.push(ready.into_iter().map(str::to_string).collect());
    }

    Ok(waves)
}

#[cfg(test)]
mod tests {
    use super::{startup_waves, DepNode};

    fn node(id: &str, deps: &[&str]) -> DepNode {
        DepNode {
            id: id.to_string(),
            dependencies: deps.iter().map(|dep| dep.to_string()).collect(),
        }
    }

    #[test]
    fn independent_nodes_form_a_single_wave() {
        let waves = startup_waves(&[node("a", &[]), node("b", &[]), node("c", &[])])
            .expect("independent nodes must order");
        assert_eq!(waves, vec![vec!["a", "b", "c"]]);
    }

    #[test]
    fn chain_produces_one_wave_per_node() {
        let waves = startup_waves(&[node("c", &["b"]), node("b", &["a"]), node("a", &[])])
            .expect("chain must order");
        assert_eq!(waves, vec![vec!["a"], vec!["b"], vec!["c"]]);
    }

    #[test]
    fn diamond_joins_parallel_middle_wave() {
        let waves = startup_waves(&[
            node("top", &["left", "right"]),
            node("left", &["base"]),
            node("right", &["base"]),
            node("base", &[]),
        ])
        .expect("diamond must order");
        assert_eq!(
            waves,
            vec![vec!["base"], vec!["left", "right"], vec!["top"]]
        );
    }

    #[test]
    fn cycle_is_rejected_with_members() {
        let err = startup_waves(&[node("a", &["b"]), node("b", &["a"]), node("c", &[])])
            .expect_err("cycle must be rejected");
        match err {
            crate::errors::GprocError::DependencyCycle(members) => {
                assert_eq!(members, vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn dependencies_outside_the_batch_are_ignored_for_ordering() {
        let waves = startup_waves(&[node("worker", &["database"])])
            .expect("external dependency must not block ordering");
        assert_eq!(waves, vec![vec!["worker"]]);
    }
}
