use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArchitectureError {
    #[error("unknown architecture label: {0}")]
    UnknownLabel(String),
    #[error("no architectures configured for the task")]
    NoArchitectures,
    #[error("architecture {label} cannot host a single core of {gigs_per_core} GiB")]
    UnsatisfiableMemory { label: String, gigs_per_core: f64 },
}

/// Static description of one remote node type.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ArchitectureDescriptor {
    pub cores: u32,
    pub memory_gigs: f64,
}

/// Read-only table of node architectures known to the remote cluster.
#[derive(Debug, Clone)]
pub struct ArchitectureCatalog {
    table: BTreeMap<String, ArchitectureDescriptor>,
}

/// Process-wide default catalog; sites with other node types override it
/// through the module configuration.
pub static DEFAULT_CATALOG: Lazy<ArchitectureCatalog> = Lazy::new(|| {
    ArchitectureCatalog::new(
        [
            ("wes", 12, 24.0),
            ("san", 16, 32.0),
            ("ivy", 20, 64.0),
            ("has", 24, 128.0),
            ("bro", 28, 128.0),
        ]
        .into_iter()
        .map(|(label, cores, memory_gigs)| {
            (
                label.to_string(),
                ArchitectureDescriptor { cores, memory_gigs },
            )
        })
        .collect(),
    )
});

impl ArchitectureCatalog {
    pub fn new(table: BTreeMap<String, ArchitectureDescriptor>) -> Self {
        Self { table }
    }

    pub fn descriptor(&self, label: &str) -> Result<ArchitectureDescriptor, ArchitectureError> {
        self.table
            .get(label)
            .copied()
            .ok_or_else(|| ArchitectureError::UnknownLabel(label.to_string()))
    }

    /// Usable cores on one node of `label`, bounded by both the core
    /// count and the per-core memory demand.
    pub fn cores_per_node(
        &self,
        label: &str,
        gigs_per_core: f64,
    ) -> Result<u32, ArchitectureError> {
        let descriptor = self.descriptor(label)?;
        let by_memory = (descriptor.memory_gigs / gigs_per_core).floor();

        if !(by_memory >= 1.0) {
            return Err(ArchitectureError::UnsatisfiableMemory {
                label: label.to_string(),
                gigs_per_core,
            });
        }

        Ok(descriptor.cores.min(by_memory as u32))
    }

    /// Uniform-random pick among the architectures a task permits. The
    /// returned label borrows from `allowed`, not from the catalog.
    pub fn select<'a>(&self, allowed: &'a [String]) -> Result<&'a str, ArchitectureError> {
        let known: Vec<&String> = allowed
            .iter()
            .filter(|label| self.table.contains_key(label.as_str()))
            .collect();

        if let Some(unknown) = allowed.iter().find(|label| !self.table.contains_key(label.as_str())) {
            return Err(ArchitectureError::UnknownLabel(unknown.clone()));
        }

        known
            .choose(&mut rand::thread_rng())
            .map(|label| label.as_str())
            .ok_or(ArchitectureError::NoArchitectures)
    }
}

/// Nodes required to host the remaining sub-tasks. A zero remainder is
/// treated as one sub-task so a bookkeeping-only resubmission still
/// requests a node.
pub fn nodes_needed(remaining_sub_tasks: u32, tasks_per_core: u32, cores_per_node: u32) -> u32 {
    let remaining = remaining_sub_tasks.max(1);
    let cores_needed = remaining.div_ceil(tasks_per_core);

    cores_needed.div_ceil(cores_per_node)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cores_per_node_bounded_by_cores() {
        // 24 cores, 128 GiB at 4 GiB/core: memory allows 32, cores cap at 24
        assert_eq!(DEFAULT_CATALOG.cores_per_node("has", 4.0).unwrap(), 24);
    }

    #[test]
    fn cores_per_node_bounded_by_memory() {
        // 12 cores, 24 GiB at 3 GiB/core: memory caps at 8
        assert_eq!(DEFAULT_CATALOG.cores_per_node("wes", 3.0).unwrap(), 8);
    }

    #[test]
    fn cores_per_node_rejects_oversized_cores() {
        assert!(matches!(
            DEFAULT_CATALOG.cores_per_node("wes", 48.0),
            Err(ArchitectureError::UnsatisfiableMemory { .. })
        ));
    }

    #[test]
    fn unknown_label_is_an_error() {
        assert!(matches!(
            DEFAULT_CATALOG.cores_per_node("vax", 1.0),
            Err(ArchitectureError::UnknownLabel(_))
        ));
    }

    #[test]
    fn nodes_needed_rounds_up() {
        assert_eq!(nodes_needed(100, 2, 24), 3);
        assert_eq!(nodes_needed(48, 1, 24), 2);
        assert_eq!(nodes_needed(1, 4, 24), 1);
    }

    #[test]
    fn zero_remaining_still_requests_one_node() {
        assert_eq!(nodes_needed(0, 2, 24), 1);
    }

    #[test]
    fn selection_requires_a_non_empty_known_set() {
        assert!(matches!(
            DEFAULT_CATALOG.select(&[]),
            Err(ArchitectureError::NoArchitectures)
        ));
        assert!(matches!(
            DEFAULT_CATALOG.select(&["vax".to_string()]),
            Err(ArchitectureError::UnknownLabel(_))
        ));

        let allowed = vec!["wes".to_string(), "has".to_string()];
        let picked = DEFAULT_CATALOG.select(&allowed).unwrap();
        assert!(allowed.iter().any(|label| label == picked));
    }

    #[test]
    fn selected_label_outlives_the_catalog_borrow() {
        let allowed = vec!["has".to_string()];
        let picked = {
            let catalog = DEFAULT_CATALOG.clone();
            catalog.select(&allowed).unwrap()
        };
        assert_eq!(picked, "has");
    }
}
