use crate::error::{Error, Result};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;
use std::collections::HashMap;
use std::hash::Hash;

/// In-memory DAG over job or template node identifiers.
///
/// The persistent store keeps only root membership and parent→child edges;
/// this graph is rebuilt on demand for traversal queries.
#[derive(Debug)]
pub struct Dag<N: Clone + Eq + Hash> {
    graph: DiGraph<N, ()>,
    indices: HashMap<N, NodeIndex>,
}

impl<N: Clone + Eq + Hash> Dag<N> {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            indices: HashMap::new(),
        }
    }

    /// Add a node if it is not already present.
    pub fn add_node(&mut self, node: N) -> NodeIndex {
        if let Some(index) = self.indices.get(&node) {
            return *index;
        }
        let index = self.graph.add_node(node.clone());
        self.indices.insert(node, index);
        index
    }

    /// Add an edge from `parent` to `child`, inserting missing endpoints.
    pub fn add_edge(&mut self, parent: N, child: N) {
        let parent = self.add_node(parent);
        let child = self.add_node(child);
        if self.graph.find_edge(parent, child).is_none() {
            self.graph.add_edge(parent, child, ());
        }
    }

    pub fn contains(&self, node: &N) -> bool {
        self.indices.contains_key(node)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn nodes(&self) -> impl Iterator<Item = &N> {
        self.graph.node_weights()
    }

    pub fn in_degree(&self, node: &N) -> usize {
        match self.indices.get(node) {
            Some(index) => self
                .graph
                .neighbors_directed(*index, petgraph::Direction::Incoming)
                .count(),
            None => 0,
        }
    }

    /// All nodes with no incoming edges.
    pub fn roots(&self) -> Vec<N> {
        self.graph
            .node_indices()
            .filter(|&n| {
                self.graph
                    .neighbors_directed(n, petgraph::Direction::Incoming)
                    .count()
                    == 0
            })
            .map(|n| self.graph[n].clone())
            .collect()
    }

    pub fn children(&self, node: &N) -> Vec<N> {
        match self.indices.get(node) {
            Some(index) => self
                .graph
                .neighbors_directed(*index, petgraph::Direction::Outgoing)
                .map(|n| self.graph[n].clone())
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn is_cyclic(&self) -> bool {
        petgraph::algo::is_cyclic_directed(&self.graph)
    }

    /// Nodes in dependency order, parents before children.
    pub fn topological_order(&self) -> Result<Vec<N>> {
        let order = petgraph::algo::toposort(&self.graph, None)
            .map_err(|_| Error::validation("graph contains a cycle"))?;
        Ok(order.into_iter().map(|n| self.graph[n].clone()).collect())
    }

    /// Every node reachable from `node`, excluding `node` itself.
    pub fn descendants(&self, node: &N) -> Vec<N> {
        let Some(start) = self.indices.get(node) else {
            return Vec::new();
        };
        let mut bfs = Bfs::new(&self.graph, *start);
        let mut nodes = Vec::new();
        while let Some(next) = bfs.next(&self.graph) {
            if next != *start {
                nodes.push(self.graph[next].clone());
            }
        }
        nodes
    }
}

impl<N: Clone + Eq + Hash> Default for Dag<N> {
    fn default() -> Self {
        Self::new()
    }
}
