//! Recipe dependency graph using `petgraph`.

use std::collections::HashMap;

use fim_common::error::{FimError, Result};
use petgraph::graph::{DiGraph, NodeIndex};

/// Recipes and the dependencies between them.
#[derive(Debug, Default)]
pub struct RecipeGraph {
    graph: DiGraph<String, ()>,
    nodes: HashMap<String, NodeIndex>,
}

impl RecipeGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the node of `name`, adding it on first sight.
    pub fn add_recipe(&mut self, name: &str) -> NodeIndex {
        if let Some(index) = self.nodes.get(name) {
            return *index;
        }
        let index = self.graph.add_node(name.to_string());
        let _ = self.nodes.insert(name.to_string(), index);
        index
    }

    /// Records that `dependent` needs `dependency` installed first.
    ///
    /// The edge points from `dependency` to `dependent`, so a topological
    /// sort yields dependencies first.
    pub fn add_dependency(&mut self, dependent: &str, dependency: &str) {
        let from = self.add_recipe(dependency);
        let to = self.add_recipe(dependent);
        let _ = self.graph.update_edge(from, to, ());
    }

    /// Whether `name` is already part of the graph.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// Recipes ordered so every dependency precedes its dependents.
    ///
    /// # Errors
    ///
    /// Returns a usage error naming a recipe on a dependency cycle.
    pub fn install_order(&self) -> Result<Vec<String>> {
        petgraph::algo::toposort(&self.graph, None)
            .map(|indices| {
                indices
                    .iter()
                    .filter_map(|&idx| self.graph.node_weight(idx).cloned())
                    .collect()
            })
            .map_err(|cycle| {
                let name = self
                    .graph
                    .node_weight(cycle.node_id())
                    .cloned()
                    .unwrap_or_default();
                FimError::usage(format!("cyclic dependency detected for recipe '{name}'"))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependencies_come_first() {
        let mut graph = RecipeGraph::new();
        graph.add_dependency("gpu", "xorg");
        graph.add_dependency("xorg", "fonts");
        graph.add_dependency("gpu", "fonts");

        let order = graph.install_order().expect("order");
        let pos = |name: &str| order.iter().position(|n| n == name).expect(name);
        assert!(pos("fonts") < pos("xorg"));
        assert!(pos("xorg") < pos("gpu"));
    }

    #[test]
    fn nodes_are_deduplicated_by_name() {
        let mut graph = RecipeGraph::new();
        let a = graph.add_recipe("audio");
        let b = graph.add_recipe("audio");
        assert_eq!(a, b);
        assert_eq!(graph.install_order().expect("order"), vec!["audio"]);
    }

    #[test]
    fn two_recipe_cycle_is_reported() {
        let mut graph = RecipeGraph::new();
        graph.add_dependency("a", "b");
        graph.add_dependency("b", "a");
        let msg = graph.install_order().unwrap_err().to_string();
        assert!(
            msg.starts_with("cyclic dependency detected for recipe '"),
            "got: {msg}"
        );
    }
}
