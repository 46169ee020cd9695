use std::collections::{HashMap, HashSet};

use crate::error::PlanError;

/// Step dependency graph (DAG) over arena indices.
#[derive(Debug, Clone)]
pub struct StepGraph {
    keys: Vec<String>,
    /// Dependency edges: step -> steps it depends on
    edges: Vec<Vec<usize>>,
    /// Reverse edges: step -> steps that depend on it
    reverse_edges: Vec<Vec<usize>>,
}

impl StepGraph {
    /// Resolve keyed dependencies into an index graph.
    ///
    /// Nodes keep their input order; that order is the creation order used for every
    /// tie-break downstream.
    pub fn build<I>(nodes: I) -> Result<Self, PlanError>
    where
        I: IntoIterator<Item = (String, Vec<String>)>,
    {
        let nodes: Vec<(String, Vec<String>)> = nodes.into_iter().collect();
        if nodes.is_empty() {
            return Err(PlanError::Empty);
        }

        let mut index: HashMap<&str, usize> = HashMap::with_capacity(nodes.len());
        for (i, (key, _)) in nodes.iter().enumerate() {
            if index.insert(key.as_str(), i).is_some() {
                return Err(PlanError::DuplicateStepId(key.clone()));
            }
        }

        let mut edges = vec![Vec::new(); nodes.len()];
        let mut reverse_edges = vec![Vec::new(); nodes.len()];
        for (i, (key, deps)) in nodes.iter().enumerate() {
            for dep in deps {
                let Some(&d) = index.get(dep.as_str()) else {
                    return Err(PlanError::DependencyNotFound {
                        step: key.clone(),
                        missing_dep: dep.clone(),
                    });
                };
                if d == i {
                    return Err(PlanError::SelfDependency(key.clone()));
                }
                if !edges[i].contains(&d) {
                    edges[i].push(d);
                    reverse_edges[d].push(i);
                }
            }
            edges[i].sort_unstable();
        }

        let graph = Self {
            keys: nodes.into_iter().map(|(k, _)| k).collect(),
            edges,
            reverse_edges,
        };
        graph.topological_stages()?;
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn key(&self, i: usize) -> &str {
        &self.keys[i]
    }

    pub fn dependencies(&self, i: usize) -> &[usize] {
        &self.edges[i]
    }

    /// Topological sort using Kahn's algorithm.
    ///
    /// Returns stages where steps in the same stage can run in parallel, each stage in
    /// creation order. Steps never released by the sort sit on or behind a cycle and
    /// are reported in `CircularDependency`.
    pub fn topological_stages(&self) -> Result<Vec<Vec<usize>>, PlanError> {
        let mut in_degree: Vec<usize> = self.edges.iter().map(Vec::len).collect();

        let mut stages: Vec<Vec<usize>> = Vec::new();
        let mut current: Vec<usize> = (0..self.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut processed = 0;

        while !current.is_empty() {
            processed += current.len();
            let mut next = Vec::new();
            for &i in &current {
                for &dependent in &self.reverse_edges[i] {
                    in_degree[dependent] -= 1;
                    if in_degree[dependent] == 0 {
                        next.push(dependent);
                    }
                }
            }
            next.sort_unstable();
            stages.push(std::mem::replace(&mut current, next));
        }

        if processed != self.len() {
            let stuck = (0..self.len())
                .filter(|&i| in_degree[i] > 0)
                .map(|i| self.keys[i].clone())
                .collect();
            return Err(PlanError::CircularDependency(stuck));
        }

        Ok(stages)
    }

    /// Every step downstream of `i`, in creation order.
    pub fn transitive_dependents(&self, i: usize) -> Vec<usize> {
        let mut seen = HashSet::new();
        let mut stack = self.reverse_edges[i].clone();
        while let Some(n) = stack.pop() {
            if seen.insert(n) {
                stack.extend(self.reverse_edges[n].iter().copied());
            }
        }
        let mut out: Vec<usize> = seen.into_iter().collect();
        out.sort_unstable();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn node(key: &str, deps: &[&str]) -> (String, Vec<String>) {
        (
            key.to_string(),
            deps.iter().map(|d| d.to_string()).collect(),
        )
    }

    #[test]
    fn diamond_sorts_into_stages() {
        let g = StepGraph::build(vec![
            node("a", &[]),
            node("b", &["a"]),
            node("c", &["a"]),
            node("d", &["b", "c"]),
        ])
        .unwrap();
        assert_eq!(g.topological_stages().unwrap(), vec![vec![0], vec![1, 2], vec![3]]);
        assert_eq!(g.transitive_dependents(0), vec![1, 2, 3]);
    }

    #[test]
    fn cycle_reports_participants() {
        let err = StepGraph::build(vec![
            node("a", &[]),
            node("b", &["c"]),
            node("c", &["b"]),
            node("d", &["c"]),
        ])
        .unwrap_err();
        assert_eq!(
            err,
            PlanError::CircularDependency(vec!["b".into(), "c".into(), "d".into()])
        );
    }

    #[test]
    fn structural_errors() {
        assert_eq!(
            StepGraph::build(vec![node("a", &[]), node("a", &[])]).unwrap_err(),
            PlanError::DuplicateStepId("a".into())
        );
        assert_eq!(
            StepGraph::build(vec![node("a", &["zz"])]).unwrap_err(),
            PlanError::DependencyNotFound {
                step: "a".into(),
                missing_dep: "zz".into()
            }
        );
        assert_eq!(
            StepGraph::build(vec![node("a", &["a"])]).unwrap_err(),
            PlanError::SelfDependency("a".into())
        );
        assert_eq!(
            StepGraph::build(Vec::<(String, Vec<String>)>::new()).unwrap_err(),
            PlanError::Empty
        );
    }
}
