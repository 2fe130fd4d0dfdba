//! Validated descriptor set and dependency ordering.
//!
//! Creation order is a topological sort of the `depends_on` graph using
//! Kahn's algorithm. When several resources are ready at once they are
//! emitted in declaration order, so the same file always yields the same
//! plan. Deletion order is the exact reverse of creation order: dependents
//! are always destroyed before the resources they depend on.

use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::debug;

use crate::descriptor::ResourceDescriptor;
use crate::error::OrchestratorError;

/// Compute the dependency-respecting creation order of `descriptors`.
///
/// # Errors
///
/// Returns [`OrchestratorError::CycleDetected`] if the graph is not acyclic,
/// and [`OrchestratorError::DuplicateId`] or
/// [`OrchestratorError::UnknownDependency`] for malformed sets.
pub fn topological_order(
    descriptors: &[ResourceDescriptor],
) -> Result<Vec<String>, OrchestratorError> {
    Registry::new(descriptors.to_vec()).map(|registry| registry.order)
}

/// Compute the deletion order of `descriptors`: `topological_order` reversed.
///
/// # Errors
///
/// Same as [`topological_order`].
pub fn reverse_order(descriptors: &[ResourceDescriptor]) -> Result<Vec<String>, OrchestratorError> {
    let mut order = topological_order(descriptors)?;
    order.reverse();
    Ok(order)
}

/// A validated, acyclic set of resource descriptors.
#[derive(Debug, Clone)]
pub struct Registry {
    descriptors: Vec<ResourceDescriptor>,
    index: HashMap<String, usize>,
    order: Vec<String>,
}

impl Registry {
    /// Validate `descriptors` and compute their creation order.
    ///
    /// # Errors
    ///
    /// Returns an error for duplicate ids, dependencies on undeclared ids, or
    /// dependency cycles.
    pub fn new(descriptors: Vec<ResourceDescriptor>) -> Result<Self, OrchestratorError> {
        let mut index = HashMap::with_capacity(descriptors.len());
        for (position, descriptor) in descriptors.iter().enumerate() {
            if index.insert(descriptor.id.clone(), position).is_some() {
                return Err(OrchestratorError::DuplicateId(descriptor.id.clone()));
            }
        }

        for descriptor in &descriptors {
            if let Some(missing) = descriptor
                .depends_on
                .iter()
                .find(|dep| !index.contains_key(dep.as_str()))
            {
                return Err(OrchestratorError::UnknownDependency {
                    id: descriptor.id.clone(),
                    dependency: missing.clone(),
                });
            }
        }

        let order = kahn_order(&descriptors, &index)?;
        debug!(order = ?order, "Computed creation order");

        Ok(Self {
            descriptors,
            index,
            order,
        })
    }

    /// Look up a descriptor by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ResourceDescriptor> {
        self.index.get(id).map(|&i| &self.descriptors[i])
    }

    /// Whether `id` is declared.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Descriptors in declaration order.
    #[must_use]
    pub fn descriptors(&self) -> &[ResourceDescriptor] {
        &self.descriptors
    }

    /// Number of declared resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Creation order.
    #[must_use]
    pub fn topological_order(&self) -> &[String] {
        &self.order
    }

    /// Deletion order (creation order reversed).
    #[must_use]
    pub fn reverse_order(&self) -> Vec<String> {
        self.order.iter().rev().cloned().collect()
    }

    /// Ids that directly depend on `id`, in declaration order.
    #[must_use]
    pub fn dependents(&self, id: &str) -> Vec<&str> {
        self.descriptors
            .iter()
            .filter(|d| d.depends_on.iter().any(|dep| dep == id))
            .map(|d| d.id.as_str())
            .collect()
    }

    /// Group the creation order into waves of mutually independent resources.
    ///
    /// Every resource in wave N depends only on resources in waves 0..N, so
    /// the members of a wave may be processed concurrently.
    #[must_use]
    pub fn waves(&self) -> Vec<Vec<String>> {
        let mut depth: HashMap<&str, usize> = HashMap::with_capacity(self.order.len());
        let mut waves: Vec<Vec<String>> = Vec::new();

        for id in &self.order {
            let level = self
                .get(id)
                .map(|d| {
                    d.depends_on
                        .iter()
                        .filter_map(|dep| depth.get(dep.as_str()))
                        .map(|l| l + 1)
                        .max()
                        .unwrap_or(0)
                })
                .unwrap_or(0);
            depth.insert(id.as_str(), level);
            if waves.len() <= level {
                waves.resize_with(level + 1, Vec::new);
            }
            waves[level].push(id.clone());
        }

        waves
    }

    /// Restrict the registry to `ids`, dropping edges to resources outside it.
    ///
    /// A subset of an acyclic graph is acyclic, so this cannot fail.
    #[must_use]
    pub fn subset(&self, ids: &HashSet<String>) -> Self {
        let descriptors: Vec<ResourceDescriptor> = self
            .descriptors
            .iter()
            .filter(|d| ids.contains(&d.id))
            .map(|d| {
                let mut d = d.clone();
                d.depends_on.retain(|dep| ids.contains(dep));
                d
            })
            .collect();

        let index = descriptors
            .iter()
            .enumerate()
            .map(|(i, d)| (d.id.clone(), i))
            .collect();
        let order = self
            .order
            .iter()
            .filter(|id| ids.contains(*id))
            .cloned()
            .collect();

        Self {
            descriptors,
            index,
            order,
        }
    }
}

fn kahn_order(
    descriptors: &[ResourceDescriptor],
    index: &HashMap<String, usize>,
) -> Result<Vec<String>, OrchestratorError> {
    let count = descriptors.len();

    // Deduplicated dependency edges by declaration position.
    let deps: Vec<BTreeSet<usize>> = descriptors
        .iter()
        .map(|d| d.depends_on.iter().filter_map(|dep| index.get(dep).copied()).collect())
        .collect();

    let mut in_degree: Vec<usize> = deps.iter().map(BTreeSet::len).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); count];
    for (node, node_deps) in deps.iter().enumerate() {
        for &dep in node_deps {
            dependents[dep].push(node);
        }
    }

    // Ordered set keyed by declaration position gives deterministic tie-breaking.
    let mut ready: BTreeSet<usize> = (0..count).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(count);

    while let Some(node) = ready.pop_first() {
        order.push(descriptors[node].id.clone());
        for &dependent in &dependents[node] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if order.len() == count {
        return Ok(order);
    }

    Err(OrchestratorError::CycleDetected {
        cycle: find_cycle(descriptors, &deps, &in_degree),
    })
}

/// Walk unresolved dependencies from the first stuck node until one repeats.
///
/// Every node left with a non-zero in-degree has at least one unresolved
/// dependency, so the walk always closes a cycle.
fn find_cycle(
    descriptors: &[ResourceDescriptor],
    deps: &[BTreeSet<usize>],
    in_degree: &[usize],
) -> Vec<String> {
    let Some(start) = (0..descriptors.len()).find(|&i| in_degree[i] > 0) else {
        return Vec::new();
    };

    let mut path = vec![start];
    let mut seen: HashMap<usize, usize> = HashMap::from([(start, 0)]);
    let mut current = start;

    while let Some(&next) = deps[current].iter().find(|&&d| in_degree[d] > 0) {
        if let Some(&position) = seen.get(&next) {
            let mut cycle: Vec<String> = path[position..]
                .iter()
                .map(|&i| descriptors[i].id.clone())
                .collect();
            cycle.push(descriptors[next].id.clone());
            return cycle;
        }
        seen.insert(next, path.len());
        path.push(next);
        current = next;
    }

    path.iter().map(|&i| descriptors[i].id.clone()).collect()
}
