use crate::error::{Error, Result};
use crate::types::DefaultParameters;
use crate::workflow::dag::Dag;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Reusable workflow shape: named command nodes joined by output-to-parameter
/// connections. Instantiating a template stamps out one job per node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateGraph {
    pub nodes: BTreeMap<String, TemplateNode>,
    #[serde(default)]
    pub edges: Vec<TemplateEdge>,
}

/// One node of a template: the command it runs and the default parameter set
/// that seeds its job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateNode {
    pub command: String,
    pub default_params: DefaultParameters,
}

/// A connection between two template nodes, mapping outputs of the source
/// command to parameters of the target command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateEdge {
    pub source: String,
    pub target: String,
    pub connections: BTreeMap<String, String>,
}

impl TemplateGraph {
    pub fn node(&self, name: &str) -> Result<&TemplateNode> {
        self.nodes
            .get(name)
            .ok_or_else(|| Error::validation(format!("template has no node named '{name}'")))
    }

    /// Edges whose target is `name`.
    pub fn incoming(&self, name: &str) -> Vec<&TemplateEdge> {
        self.edges.iter().filter(|e| e.target == name).collect()
    }

    /// Build the node-name DAG, validating that every edge endpoint exists.
    pub fn dag(&self) -> Result<Dag<String>> {
        let mut dag = Dag::new();
        for name in self.nodes.keys() {
            dag.add_node(name.clone());
        }
        for edge in &self.edges {
            if !self.nodes.contains_key(&edge.source) {
                return Err(Error::validation(format!(
                    "template edge references unknown node '{}'",
                    edge.source
                )));
            }
            if !self.nodes.contains_key(&edge.target) {
                return Err(Error::validation(format!(
                    "template edge references unknown node '{}'",
                    edge.target
                )));
            }
            dag.add_edge(edge.source.clone(), edge.target.clone());
        }
        Ok(dag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(command: &str) -> TemplateNode {
        TemplateNode {
            command: command.to_string(),
            default_params: DefaultParameters::new(command, BTreeMap::new()),
        }
    }

    #[test]
    fn test_dag_from_template() {
        let template = TemplateGraph {
            nodes: [
                ("demux".to_string(), node("split-libraries")),
                ("otus".to_string(), node("pick-otus")),
            ]
            .into(),
            edges: vec![TemplateEdge {
                source: "demux".to_string(),
                target: "otus".to_string(),
                connections: [("demultiplexed".to_string(), "input".to_string())].into(),
            }],
        };

        let dag = template.dag().unwrap();
        assert_eq!(dag.roots(), vec!["demux".to_string()]);
        assert_eq!(template.incoming("otus").len(), 1);
        assert!(template.incoming("demux").is_empty());
    }

    #[test]
    fn test_unknown_edge_endpoint_rejected() {
        let template = TemplateGraph {
            nodes: [("demux".to_string(), node("split-libraries"))].into(),
            edges: vec![TemplateEdge {
                source: "demux".to_string(),
                target: "missing".to_string(),
                connections: BTreeMap::new(),
            }],
        };

        let err = template.dag().unwrap_err();
        assert!(err.to_string().contains("unknown node 'missing'"));
    }
}
