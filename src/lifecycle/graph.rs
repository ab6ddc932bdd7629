use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::{McpError, Result};

/// Servers in dependency order
#[derive(Debug)]
pub struct DependencyGraph {
    /// Topological start order
    order: Vec<String>,
}

impl DependencyGraph {
    /// Build from `(name, depends_on)` pairs
    ///
    /// Dependencies on names outside the set are ignored here; starting such a
    /// server fails later with `UnknownServer`.
    pub fn build<'a, I>(nodes: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a [String])>,
    {
        let nodes: Vec<(&str, &[String])> = nodes.into_iter().collect();
        let names: Vec<&str> = nodes.iter().map(|(n, _)| *n).collect();
        let known: HashSet<&str> = names.iter().copied().collect();

        // Reverse edges for Kahn's: dep -> servers waiting on it
        let mut in_degree: HashMap<&str, usize> = names.iter().map(|n| (*n, 0)).collect();
        let mut dependents: HashMap<&str, Vec<&str>> =
            names.iter().map(|n| (*n, vec![])).collect();

        for (name, deps) in &nodes {
            for dep in deps.iter().filter(|d| known.contains(d.as_str())) {
                *in_degree.entry(*name).or_insert(0) += 1;
                dependents.entry(dep.as_str()).or_default().push(*name);
            }
        }

        // Declaration order breaks ties
        let mut queue: VecDeque<&str> = names
            .iter()
            .filter(|n| in_degree[*n] == 0)
            .copied()
            .collect();

        let mut order = Vec::with_capacity(names.len());
        while let Some(node) = queue.pop_front() {
            order.push(node.to_string());
            for &dependent in &dependents[node] {
                if let Some(deg) = in_degree.get_mut(dependent) {
                    *deg -= 1;
                    if *deg == 0 {
                        queue.push_back(dependent);
                    }
                }
            }
        }

        if order.len() < names.len() {
            let cycled: Vec<&str> = names
                .iter()
                .filter(|n| !order.iter().any(|o| o == *n))
                .copied()
                .collect();
            return Err(McpError::DependencyCycle(cycled.join(", ")));
        }

        Ok(Self { order })
    }

    pub fn start_order(&self) -> &[String] {
        &self.order
    }

    pub fn stop_order(&self) -> impl Iterator<Item = &str> {
        self.order.iter().rev().map(|s| s.as_str())
    }
}

/// Transitive dependencies of `name`, deepest first, excluding `name` itself
///
/// Depth-first over the declared map; revisiting a server already on the
/// current path fails with `DependencyCycle` naming the path.
pub fn dependency_chain(name: &str, deps: &HashMap<String, Vec<String>>) -> Result<Vec<String>> {
    fn visit(
        node: &str,
        deps: &HashMap<String, Vec<String>>,
        path: &mut Vec<String>,
        done: &mut HashSet<String>,
        out: &mut Vec<String>,
    ) -> Result<()> {
        if done.contains(node) {
            return Ok(());
        }
        if path.iter().any(|p| p == node) {
            let mut cycle = path.clone();
            cycle.push(node.to_string());
            return Err(McpError::DependencyCycle(cycle.join(" -> ")));
        }
        path.push(node.to_string());
        for dep in deps.get(node).into_iter().flatten() {
            visit(dep, deps, path, done, out)?;
        }
        path.pop();
        done.insert(node.to_string());
        out.push(node.to_string());
        Ok(())
    }

    let mut out = Vec::new();
    visit(name, deps, &mut Vec::new(), &mut HashSet::new(), &mut out)?;
    out.pop();
    Ok(out)
}
