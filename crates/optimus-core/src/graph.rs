//! Dependency graph resolution.
//!
//! Nodes are ordered with Kahn's algorithm. Among nodes that become ready at
//! the same time, the one declared first wins, so identical input always
//! yields the identical order.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::resource::ResourceNode;
use crate::{Error, Result};

/// Validated dependency graph over a stack's resource nodes.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: Vec<ResourceNode>,
    index: HashMap<String, usize>,
    /// `dependencies[i]` holds the declaration indices node `i` depends on.
    dependencies: Vec<Vec<usize>>,
    /// `dependents[i]` holds the declaration indices that depend on node `i`.
    dependents: Vec<Vec<usize>>,
}

impl DependencyGraph {
    /// Build a graph, rejecting duplicate ids and references to undeclared nodes.
    pub fn new(nodes: Vec<ResourceNode>) -> Result<Self> {
        let mut index = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            if index.insert(node.id.clone(), i).is_some() {
                return Err(Error::DuplicateNode(node.id.clone()));
            }
        }

        let mut dependencies = vec![Vec::new(); nodes.len()];
        let mut dependents = vec![Vec::new(); nodes.len()];
        for (i, node) in nodes.iter().enumerate() {
            let mut seen = HashSet::new();
            for dep in &node.depends_on {
                let Some(&dep_idx) = index.get(dep) else {
                    return Err(Error::UnknownDependency {
                        node: node.id.clone(),
                        missing: dep.clone(),
                    });
                };
                if seen.insert(dep_idx) {
                    dependencies[i].push(dep_idx);
                    dependents[dep_idx].push(i);
                }
            }
        }

        Ok(Self {
            nodes,
            index,
            dependencies,
            dependents,
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&ResourceNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    /// Nodes in declaration order.
    pub fn nodes(&self) -> &[ResourceNode] {
        &self.nodes
    }

    /// Ids of every node that depends on `id`, directly or transitively.
    pub fn transitive_dependents(&self, id: &str) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        let Some(&start) = self.index.get(id) else {
            return out;
        };
        let mut stack = vec![start];
        let mut visited = HashSet::new();
        while let Some(i) = stack.pop() {
            for &dependent in &self.dependents[i] {
                if visited.insert(dependent) {
                    out.insert(self.nodes[dependent].id.clone());
                    stack.push(dependent);
                }
            }
        }
        out
    }

    /// Compute the creation order.
    ///
    /// Fails with [`Error::Cycle`] naming one full cycle; no partial order is returned.
    pub fn order(&self) -> Result<Vec<&ResourceNode>> {
        let mut remaining: Vec<usize> = self.dependencies.iter().map(Vec::len).collect();
        let mut ready: BTreeSet<usize> = remaining
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree == 0)
            .map(|(i, _)| i)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(i) = ready.pop_first() {
            order.push(i);
            for &dependent in &self.dependents[i] {
                remaining[dependent] -= 1;
                if remaining[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }

        if order.len() != self.nodes.len() {
            return Err(Error::Cycle {
                path: self.find_cycle(&remaining),
            });
        }

        Ok(order.into_iter().map(|i| &self.nodes[i]).collect())
    }

    /// Walk unresolved dependencies from the first stuck node until a node repeats.
    ///
    /// Every node left with a non-zero count has at least one dependency that is
    /// also stuck, so the walk always closes a loop.
    fn find_cycle(&self, remaining: &[usize]) -> Vec<String> {
        let stuck = |i: usize| remaining[i] > 0;
        let Some(start) = (0..self.nodes.len()).find(|&i| stuck(i)) else {
            return Vec::new();
        };

        let mut path: Vec<usize> = Vec::new();
        let mut position: HashMap<usize, usize> = HashMap::new();
        let mut current = start;
        loop {
            if let Some(&pos) = position.get(&current) {
                let mut cycle: Vec<String> = path[pos..]
                    .iter()
                    .map(|&i| self.nodes[i].id.clone())
                    .collect();
                cycle.push(self.nodes[current].id.clone());
                return cycle;
            }
            position.insert(current, path.len());
            path.push(current);

            match self.dependencies[current].iter().copied().find(|&d| stuck(d)) {
                Some(next) => current = next,
                None => {
                    return path.iter().map(|&i| self.nodes[i].id.clone()).collect();
                }
            }
        }
    }
}

/// Resolve a set of declared nodes into a valid creation order.
pub fn resolve(nodes: Vec<ResourceNode>) -> Result<Vec<ResourceNode>> {
    let graph = DependencyGraph::new(nodes)?;
    let order = graph.order()?;
    Ok(order.into_iter().cloned().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceKind;

    fn node(id: &str, deps: &[&str]) -> ResourceNode {
        deps.iter().fold(
            ResourceNode::new(id, ResourceKind::Storage),
            |node, dep| node.depends_on(*dep),
        )
    }

    fn ids(nodes: &[ResourceNode]) -> Vec<&str> {
        nodes.iter().map(|n| n.id.as_str()).collect()
    }

    fn assert_topologically_valid(order: &[ResourceNode]) {
        for (pos, n) in order.iter().enumerate() {
            for dep in &n.depends_on {
                let dep_pos = order.iter().position(|o| &o.id == dep).unwrap();
                assert!(dep_pos < pos, "{} must come after {}", n.id, dep);
            }
        }
    }

    #[test]
    fn test_resolve_orders_dependencies_first() {
        let nodes = vec![
            node("pipeline", &["build", "deploy-group", "bootstrap"]),
            node("build", &["role", "bucket"]),
            node("deploy-group", &["role", "instance"]),
            node("bootstrap", &["instance"]),
            node("instance", &["vpc", "role"]),
            node("role", &["bucket", "table"]),
            node("table", &[]),
            node("bucket", &[]),
            node("vpc", &[]),
        ];

        let order = resolve(nodes).unwrap();
        assert_eq!(order.len(), 9);
        assert_topologically_valid(&order);
    }

    #[test]
    fn test_ties_break_by_declaration_order() {
        let nodes = vec![
            node("c", &[]),
            node("a", &[]),
            node("b", &["c"]),
            node("d", &[]),
        ];

        let order = resolve(nodes).unwrap();
        assert_eq!(ids(&order), vec!["c", "a", "b", "d"]);
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let make = || {
            vec![
                node("vpc", &[]),
                node("bucket", &[]),
                node("role", &["bucket"]),
                node("instance", &["vpc", "role"]),
                node("table", &[]),
            ]
        };
        let first = resolve(make()).unwrap();
        for _ in 0..10 {
            assert_eq!(ids(&resolve(make()).unwrap()), ids(&first));
        }
        assert_eq!(ids(&first), vec!["vpc", "bucket", "role", "instance", "table"]);
    }

    #[test]
    fn test_unknown_dependency_names_missing_id() {
        let nodes = vec![node("instance", &["vpc"])];
        match resolve(nodes).unwrap_err() {
            Error::UnknownDependency { node, missing } => {
                assert_eq!(node, "instance");
                assert_eq!(missing, "vpc");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let nodes = vec![node("vpc", &[]), node("vpc", &[])];
        assert!(matches!(
            resolve(nodes).unwrap_err(),
            Error::DuplicateNode(id) if id == "vpc"
        ));
    }

    #[test]
    fn test_cycle_reports_full_path() {
        let nodes = vec![
            node("vpc", &[]),
            node("a", &["c", "vpc"]),
            node("b", &["a"]),
            node("c", &["b"]),
        ];

        match resolve(nodes).unwrap_err() {
            Error::Cycle { path } => {
                assert_eq!(path, vec!["a", "c", "b", "a"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let nodes = vec![node("loop", &["loop"])];
        match resolve(nodes).unwrap_err() {
            Error::Cycle { path } => assert_eq!(path, vec!["loop", "loop"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_cycle_downstream_of_valid_nodes_still_fails() {
        let nodes = vec![
            node("vpc", &[]),
            node("x", &["vpc", "y"]),
            node("y", &["x"]),
            node("tail", &["y"]),
        ];
        let err = resolve(nodes).unwrap_err();
        assert!(err.is_graph_error());
        assert!(err.to_string().contains("x -> y -> x"));
    }

    #[test]
    fn test_transitive_dependents() {
        let graph = DependencyGraph::new(vec![
            node("instance", &[]),
            node("bootstrap", &["instance"]),
            node("group", &["instance"]),
            node("pipeline", &["bootstrap", "group"]),
            node("table", &[]),
        ])
        .unwrap();

        let dependents = graph.transitive_dependents("bootstrap");
        assert_eq!(dependents.into_iter().collect::<Vec<_>>(), vec!["pipeline"]);

        let dependents = graph.transitive_dependents("instance");
        assert_eq!(dependents.len(), 3);
        assert!(!dependents.contains("table"));
    }
}
