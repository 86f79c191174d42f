//! Execution graph: nodes plus dependency adjacency, validated acyclic.

use super::node::{Node, OutputVariables};
use crate::dag::Step;
use crate::error::{Error, Result};
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub struct ExecutionGraph {
    nodes: Vec<Arc<Node>>,
    by_name: HashMap<String, usize>,
    deps: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    output_variables: OutputVariables,
}

impl ExecutionGraph {
    /// Build the graph from the DAG's steps, in step order. Node ids equal
    /// positions, which is also the FIFO order the scheduler dequeues in.
    pub fn new(steps: &[Step]) -> Result<Self> {
        let output_variables: OutputVariables = Arc::new(Mutex::new(HashMap::new()));

        let mut by_name = HashMap::new();
        for (i, step) in steps.iter().enumerate() {
            if by_name.insert(step.name.clone(), i).is_some() {
                return Err(Error::DuplicateStepName(step.name.clone()));
            }
        }

        let mut deps = vec![Vec::new(); steps.len()];
        let mut dependents = vec![Vec::new(); steps.len()];
        for (i, step) in steps.iter().enumerate() {
            for dep in &step.depends {
                let Some(&j) = by_name.get(dep) else {
                    return Err(Error::UnknownDependency {
                        step: step.name.clone(),
                        dependency: dep.clone(),
                    });
                };
                deps[i].push(j);
                dependents[j].push(i);
            }
        }

        validate_acyclic(steps)?;

        let nodes = steps
            .iter()
            .enumerate()
            .map(|(i, step)| Arc::new(Node::new(i, step.clone(), output_variables.clone())))
            .collect();

        Ok(Self {
            nodes,
            by_name,
            deps,
            dependents,
            output_variables,
        })
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    pub fn node(&self, id: usize) -> &Arc<Node> {
        &self.nodes[id]
    }

    pub fn node_by_name(&self, name: &str) -> Option<&Arc<Node>> {
        self.by_name.get(name).map(|&i| &self.nodes[i])
    }

    pub fn deps_of(&self, id: usize) -> &[usize] {
        &self.deps[id]
    }

    pub fn dependents_of(&self, id: usize) -> &[usize] {
        &self.dependents[id]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn output_variables(&self) -> OutputVariables {
        self.output_variables.clone()
    }
}

fn validate_acyclic(steps: &[Step]) -> Result<()> {
    let mut graph = DiGraph::<&str, ()>::new();
    let mut indices = HashMap::new();
    for step in steps {
        let idx = graph.add_node(step.name.as_str());
        indices.insert(step.name.as_str(), idx);
    }
    for step in steps {
        for dep in &step.depends {
            graph.add_edge(indices[dep.as_str()], indices[step.name.as_str()], ());
        }
    }
    toposort(&graph, None)
        .map(|_| ())
        .map_err(|cycle| Error::CycleDetected(graph[cycle.node_id()].to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(name: &str, depends: &[&str]) -> Step {
        Step {
            name: name.to_string(),
            command: "true".to_string(),
            cmd_with_args: "true".to_string(),
            depends: depends.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_linear_graph() {
        let graph = ExecutionGraph::new(&[
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["b"]),
        ])
        .unwrap();
        assert_eq!(graph.len(), 3);
        assert_eq!(graph.deps_of(0), &[] as &[usize]);
        assert_eq!(graph.deps_of(1), &[0]);
        assert_eq!(graph.dependents_of(0), &[1]);
    }

    #[test]
    fn test_diamond_graph() {
        let graph = ExecutionGraph::new(&[
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["a"]),
            step("d", &["b", "c"]),
        ])
        .unwrap();
        assert_eq!(graph.dependents_of(0), &[1, 2]);
        assert_eq!(graph.deps_of(3), &[1, 2]);
    }

    #[test]
    fn test_cycle_rejected() {
        let result = ExecutionGraph::new(&[
            step("a", &["c"]),
            step("b", &["a"]),
            step("c", &["b"]),
        ]);
        assert!(matches!(result, Err(Error::CycleDetected(_))));
    }

    #[test]
    fn test_self_cycle_rejected() {
        let result = ExecutionGraph::new(&[step("a", &["a"])]);
        assert!(matches!(result, Err(Error::CycleDetected(_))));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let result = ExecutionGraph::new(&[step("a", &["ghost"])]);
        assert!(matches!(result, Err(Error::UnknownDependency { .. })));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let result = ExecutionGraph::new(&[step("a", &[]), step("a", &[])]);
        assert!(matches!(result, Err(Error::DuplicateStepName(_))));
    }
}
