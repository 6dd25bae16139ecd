//! Dependency graph analysis over the task set (spec §4.2).
//!
//! Builds adjacency/reverse-adjacency from each task's `depends_on` list,
//! detects cycles and serial chains ahead of scheduling, and computes
//! dispatch levels via Kahn's algorithm. Levels only bound eligibility —
//! the scheduler is free to dispatch within a level in any order subject
//! to its own tie-breaking rule.

use std::collections::{HashMap, HashSet, VecDeque};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("task {from} depends on unknown task {to}")]
    UnknownDependency { from: String, to: String },
}

/// A directed graph over task ids, built from each task's `depends_on` list.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    adjacency: HashMap<String, Vec<String>>,
    reverse_adjacency: HashMap<String, Vec<String>>,
    nodes: Vec<String>,
}

impl DependencyGraph {
    /// Build a graph from `(task_id, depends_on)` pairs. Order of `nodes`
    /// is preserved from the input for deterministic iteration.
    pub fn build<'a>(
        tasks: impl IntoIterator<Item = (&'a str, &'a [String])>,
    ) -> Result<Self, GraphError> {
        let mut nodes = Vec::new();
        let mut adjacency: HashMap<String, Vec<String>> = HashMap::new();
        let mut reverse_adjacency: HashMap<String, Vec<String>> = HashMap::new();
        let mut known: HashSet<String> = HashSet::new();
        let mut pending_edges: Vec<(String, String)> = Vec::new();

        for (id, deps) in tasks.into_iter() {
            nodes.push(id.to_string());
            adjacency.entry(id.to_string()).or_default();
            reverse_adjacency.entry(id.to_string()).or_default();
            known.insert(id.to_string());
            for dep in deps.iter() {
                pending_edges.push((id.to_string(), dep.clone()));
            }
        }

        for (from, to) in pending_edges {
            if !known.contains(&to) {
                return Err(GraphError::UnknownDependency { from, to });
            }
            // Edge direction: `to` must run before `from` (dependency -> dependent).
            adjacency.entry(to.clone()).or_default().push(from.clone());
            reverse_adjacency.entry(from).or_default().push(to);
        }

        Ok(Self {
            adjacency,
            reverse_adjacency,
            nodes,
        })
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    /// Tasks that depend on `id` (i.e. `id`'s dependents).
    pub fn dependents(&self, id: &str) -> &[String] {
        self.adjacency.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Tasks that `id` depends on.
    pub fn dependencies(&self, id: &str) -> &[String] {
        self.reverse_adjacency
            .get(id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// All tasks transitively dependent on `id`, per the reverse adjacency
    /// list. Used for blast-radius propagation when a serial chain or task
    /// fails (spec §4.5 Phase B/C).
    pub fn transitive_dependents(&self, id: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(id);

        while let Some(current) = queue.pop_front() {
            for dependent in self.dependents(current) {
                if seen.insert(dependent.clone()) {
                    queue.push_back(dependent);
                }
            }
        }

        seen
    }

    /// Detect cycles via DFS with a three-colour visited set. Returns one
    /// `Vec<String>` per distinct cycle found, each containing exactly the
    /// nodes on that cycle.
    pub fn detect_cycles(&self) -> Vec<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Colour {
            White,
            Gray,
            Black,
        }

        let mut colour: HashMap<&str, Colour> = self
            .nodes
            .iter()
            .map(|n| (n.as_str(), Colour::White))
            .collect();
        let mut stack: Vec<&str> = Vec::new();
        let mut cycles = Vec::new();
        let mut reported: HashSet<Vec<String>> = HashSet::new();

        fn dfs<'a>(
            node: &'a str,
            graph: &'a DependencyGraph,
            colour: &mut HashMap<&'a str, Colour>,
            stack: &mut Vec<&'a str>,
            cycles: &mut Vec<Vec<String>>,
            reported: &mut HashSet<Vec<String>>,
        ) {
            colour.insert(node, Colour::Gray);
            stack.push(node);

            for next in graph.dependents(node) {
                match colour.get(next.as_str()).copied().unwrap_or(Colour::White) {
                    Colour::White => dfs(next, graph, colour, stack, cycles, reported),
                    Colour::Gray => {
                        if let Some(pos) = stack.iter().position(|&n| n == next.as_str()) {
                            let mut cycle: Vec<String> =
                                stack[pos..].iter().map(|s| s.to_string()).collect();
                            cycle.sort();
                            if reported.insert(cycle.clone()) {
                                cycles.push(cycle);
                            }
                        }
                    }
                    Colour::Black => {}
                }
            }

            stack.pop();
            colour.insert(node, Colour::Black);
        }

        for node in &self.nodes {
            if colour.get(node.as_str()).copied() == Some(Colour::White) {
                dfs(node, self, &mut colour, &mut stack, &mut cycles, &mut reported);
            }
        }

        cycles
    }

    /// Detect maximal serial chains: runs of tasks where each has exactly
    /// one predecessor and each predecessor has exactly one successor.
    /// Chains of length 1 (no actual chaining) are not returned.
    pub fn detect_serial_chains(&self) -> Vec<Vec<String>> {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut chains = Vec::new();

        let is_chain_link = |id: &str| -> bool {
            self.dependencies(id).len() <= 1
        };

        for node in &self.nodes {
            if visited.contains(node.as_str()) {
                continue;
            }

            // Only start a chain at a node whose single predecessor (if any)
            // has more than one successor, or which has no predecessor —
            // i.e. a genuine chain head.
            let deps = self.dependencies(node);
            let is_head = match deps.len() {
                0 => true,
                1 => self.dependents(&deps[0]).len() != 1,
                _ => continue,
            };
            if !is_head {
                continue;
            }

            let mut chain = vec![node.clone()];
            visited.insert(node.as_str());
            let mut current = node.as_str();

            loop {
                let successors = self.dependents(current);
                if successors.len() != 1 {
                    break;
                }
                let next = &successors[0];
                if !is_chain_link(next) || visited.contains(next.as_str()) {
                    break;
                }
                chain.push(next.clone());
                visited.insert(next.as_str());
                current = next.as_str();
            }

            if chain.len() > 1 {
                chains.push(chain);
            } else {
                visited.remove(node.as_str());
            }
        }

        chains
    }

    /// Kahn's-algorithm level computation, excluding `excluded` nodes
    /// (cycle members and serial-chain members, which are scheduled by
    /// their own dedicated paths). Each returned `Vec<String>` is one
    /// dispatch level; levels bound eligibility only.
    pub fn compute_levels(&self, excluded: &HashSet<String>) -> Vec<Vec<String>> {
        let active: Vec<&String> = self
            .nodes
            .iter()
            .filter(|n| !excluded.contains(n.as_str()))
            .collect();

        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        for node in &active {
            let degree = self
                .dependencies(node)
                .iter()
                .filter(|d| !excluded.contains(d.as_str()))
                .count();
            in_degree.insert(node.as_str(), degree);
        }

        let mut initial: Vec<&str> = in_degree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(n, _)| *n)
            .collect();
        initial.sort();
        let mut queue: VecDeque<&str> = initial.into();

        let mut levels = Vec::new();

        while !queue.is_empty() {
            let level_size = queue.len();
            let mut level: Vec<String> = Vec::with_capacity(level_size);
            let mut next_round: Vec<&str> = Vec::new();

            for _ in 0..level_size {
                let node = queue.pop_front().unwrap();
                level.push(node.to_string());

                for dependent in self.dependents(node) {
                    if excluded.contains(dependent.as_str()) {
                        continue;
                    }
                    if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                        *degree -= 1;
                        if *degree == 0 {
                            next_round.push(dependent.as_str());
                        }
                    }
                }
            }

            level.sort();
            levels.push(level);
            next_round.sort();
            queue.extend(next_round);
        }

        levels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&str, &[&str])]) -> DependencyGraph {
        let owned: Vec<(String, Vec<String>)> = edges
            .iter()
            .map(|(id, deps)| {
                (
                    id.to_string(),
                    deps.iter().map(|d| d.to_string()).collect(),
                )
            })
            .collect();
        let refs: Vec<(&str, &[String])> = owned
            .iter()
            .map(|(id, deps)| (id.as_str(), deps.as_slice()))
            .collect();
        DependencyGraph::build(refs).unwrap()
    }

    #[test]
    fn linear_chain_detected() {
        let g = graph(&[("a", &[]), ("b", &["a"]), ("c", &["b"])]);
        let chains = g.detect_serial_chains();
        assert_eq!(chains.len(), 1);
        assert_eq!(chains[0], vec!["a", "b", "c"]);
    }

    #[test]
    fn fan_out_is_not_a_chain() {
        let g = graph(&[("a", &[]), ("b", &["a"]), ("c", &["a"])]);
        let chains = g.detect_serial_chains();
        assert!(chains.is_empty());
    }

    #[test]
    fn cycle_detected() {
        let g = graph(&[("a", &["b"]), ("b", &["a"])]);
        let cycles = g.detect_cycles();
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0], vec!["a", "b"]);
    }

    #[test]
    fn acyclic_graph_has_no_cycles() {
        let g = graph(&[("a", &[]), ("b", &["a"]), ("c", &["a", "b"])]);
        assert!(g.detect_cycles().is_empty());
    }

    #[test]
    fn levels_respect_dependencies() {
        let g = graph(&[("a", &[]), ("b", &["a"]), ("c", &["a"]), ("d", &["b", "c"])]);
        let levels = g.compute_levels(&HashSet::new());
        assert_eq!(levels[0], vec!["a"]);
        assert_eq!(levels[1], vec!["b", "c"]);
        assert_eq!(levels[2], vec!["d"]);
    }

    #[test]
    fn levels_exclude_cycle_and_chain_nodes() {
        let g = graph(&[
            ("a", &[]),
            ("b", &["a"]),
            ("x", &["y"]),
            ("y", &["x"]),
        ]);
        let mut excluded = HashSet::new();
        excluded.insert("x".to_string());
        excluded.insert("y".to_string());
        let levels = g.compute_levels(&excluded);
        let flat: Vec<&String> = levels.iter().flatten().collect();
        assert_eq!(flat.len(), 2);
        assert!(!flat.iter().any(|n| n.as_str() == "x" || n.as_str() == "y"));
    }

    #[test]
    fn transitive_dependents_walks_full_subgraph() {
        let g = graph(&[("a", &[]), ("b", &["a"]), ("c", &["b"]), ("d", &["a"])]);
        let dependents = g.transitive_dependents("a");
        assert!(dependents.contains("b"));
        assert!(dependents.contains("c"));
        assert!(dependents.contains("d"));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let result = DependencyGraph::build(vec![("a", &["missing".to_string()][..])]);
        assert!(result.is_err());
    }
}
