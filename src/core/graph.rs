//! Resource dependency graph.
//!
//! Nodes are resource ids held in a sorted vector and addressed by index;
//! edges point from a resource to the resources its params reference.
//! Ordering uses a three-colour DFS that visits nodes and dependencies in id
//! order, so the topological order depends only on the graph, never on the
//! order requests were declared in.

use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    White,
    Gray,
    Black,
}

#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    ids: Vec<String>,
    index: HashMap<String, usize>,
    deps: Vec<BTreeSet<usize>>,
}

impl ResourceGraph {
    /// Create a graph with the given nodes and no edges.
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut ids: Vec<String> = ids.into_iter().map(Into::into).collect();
        ids.sort();
        ids.dedup();
        let index = ids.iter().enumerate().map(|(i, id)| (id.clone(), i)).collect();
        let deps = vec![BTreeSet::new(); ids.len()];
        Self { ids, index, deps }
    }

    /// Record that `dependent` needs `dependency` resolved first.
    /// Returns false if either node is unknown.
    pub fn add_edge(&mut self, dependent: &str, dependency: &str) -> bool {
        match (self.index.get(dependent), self.index.get(dependency)) {
            (Some(&from), Some(&to)) => {
                self.deps[from].insert(to);
                true
            }
            _ => false,
        }
    }

    /// Topological order (dependencies first). On a cycle, returns the cycle's
    /// members in traversal order.
    pub fn topological_order(&self) -> Result<Vec<String>, Vec<String>> {
        let mut marks = vec![Mark::White; self.ids.len()];
        let mut order = Vec::with_capacity(self.ids.len());
        let mut path = Vec::new();

        for start in 0..self.ids.len() {
            if marks[start] == Mark::White {
                self.visit(start, &mut marks, &mut path, &mut order)?;
            }
        }

        Ok(order.into_iter().map(|i| self.ids[i].clone()).collect())
    }

    fn visit(
        &self,
        node: usize,
        marks: &mut [Mark],
        path: &mut Vec<usize>,
        order: &mut Vec<usize>,
    ) -> Result<(), Vec<String>> {
        marks[node] = Mark::Gray;
        path.push(node);

        for &dep in &self.deps[node] {
            match marks[dep] {
                Mark::White => self.visit(dep, marks, path, order)?,
                Mark::Gray => {
                    let start = path.iter().position(|&n| n == dep).unwrap_or(0);
                    return Err(path[start..].iter().map(|&n| self.ids[n].clone()).collect());
                }
                Mark::Black => {}
            }
        }

        path.pop();
        marks[node] = Mark::Black;
        order.push(node);
        Ok(())
    }

    /// Group nodes into waves: every node's dependencies sit in earlier waves.
    /// Nodes within a wave are independent and sorted by id.
    pub fn waves(&self) -> Result<Vec<Vec<String>>, Vec<String>> {
        let order = self.topological_order()?;
        let mut level = vec![0usize; self.ids.len()];
        let mut waves: Vec<Vec<String>> = Vec::new();

        for id in order {
            let i = self.index[&id];
            let l = self.deps[i].iter().map(|&d| level[d] + 1).max().unwrap_or(0);
            level[i] = l;
            if waves.len() <= l {
                waves.resize_with(l + 1, Vec::new);
            }
            waves[l].push(id);
        }
        for wave in &mut waves {
            wave.sort();
        }
        Ok(waves)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_linear_chain() {
        let mut g = ResourceGraph::new(["c", "b", "a"]);
        assert!(g.add_edge("b", "a"));
        assert!(g.add_edge("c", "b"));
        assert_eq!(g.topological_order().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(g.waves().unwrap(), vec![vec!["a"], vec!["b"], vec!["c"]]);
    }

    #[test]
    fn test_independent_sorted() {
        let g = ResourceGraph::new(["beta", "alpha"]);
        assert_eq!(g.topological_order().unwrap(), vec!["alpha", "beta"]);
        assert_eq!(g.waves().unwrap(), vec![vec!["alpha", "beta"]]);
    }

    #[test]
    fn test_diamond_waves() {
        let mut g = ResourceGraph::new(["top", "left", "right", "bottom"]);
        g.add_edge("left", "top");
        g.add_edge("right", "top");
        g.add_edge("bottom", "left");
        g.add_edge("bottom", "right");
        let waves = g.waves().unwrap();
        assert_eq!(waves, vec![vec!["top"], vec!["left", "right"], vec!["bottom"]]);
    }

    #[test]
    fn test_unknown_edge_rejected() {
        let mut g = ResourceGraph::new(["a"]);
        assert!(!g.add_edge("a", "ghost"));
        assert!(!g.add_edge("ghost", "a"));
        assert_eq!(g.topological_order().unwrap(), vec!["a"]);
    }

    #[test]
    fn test_cycle_names_members_only() {
        let mut g = ResourceGraph::new(["a", "b", "c", "d"]);
        g.add_edge("a", "d");
        g.add_edge("b", "c");
        g.add_edge("c", "d");
        g.add_edge("d", "b");
        let cycle = g.topological_order().unwrap_err();
        let members: BTreeSet<_> = cycle.iter().map(String::as_str).collect();
        assert_eq!(members, BTreeSet::from(["b", "c", "d"]));
    }

    #[test]
    fn test_self_cycle() {
        let mut g = ResourceGraph::new(["a"]);
        g.add_edge("a", "a");
        assert_eq!(g.waves().unwrap_err(), vec!["a"]);
    }

    proptest! {
        #[test]
        fn prop_order_independent_of_declaration(mut ids in proptest::collection::vec("[a-z]{1,4}", 1..12), seed in 0u64..1000) {
            ids.sort();
            ids.dedup();
            let mut shuffled = ids.clone();
            shuffled.reverse();
            let n = shuffled.len();
            shuffled.rotate_left((seed as usize) % n);

            let build = |nodes: &[String]| {
                let mut g = ResourceGraph::new(nodes.iter().cloned());
                // chain every node onto the lexicographically previous one
                for pair in ids.windows(2) {
                    g.add_edge(&pair[1], &pair[0]);
                }
                g
            };
            let a = build(&ids).topological_order().unwrap();
            let b = build(&shuffled).topological_order().unwrap();
            prop_assert_eq!(&a, &b);
            prop_assert_eq!(a, ids);
        }
    }
}
