//! Requirement graph analysis
//!
//! Pure functions over a snapshot of the object store. The scheduler owns all
//! state changes; this module only answers questions about the graph.

use crate::error::{Error, Result};
use crate::object::{ConfigObject, ObjectName};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};

/// Snapshot of the requirement graph
///
/// An edge `a -> b` means `a` requires `b`. Node order is declaration order.
#[derive(Debug, Clone, Default)]
pub struct RequirementGraph {
    sequence: BTreeMap<ObjectName, u64>,
    requires: BTreeMap<ObjectName, Vec<ObjectName>>,
    required_by: BTreeMap<ObjectName, Vec<ObjectName>>,
}

impl RequirementGraph {
    pub fn new(objects: &[ConfigObject]) -> Self {
        let mut graph = Self::default();
        for object in objects {
            graph.sequence.insert(object.name.clone(), object.sequence);
            graph
                .requires
                .insert(object.name.clone(), object.requirements.clone());
            for requirement in &object.requirements {
                graph
                    .required_by
                    .entry(requirement.clone())
                    .or_default()
                    .push(object.name.clone());
            }
        }
        graph
    }

    pub fn contains(&self, name: &ObjectName) -> bool {
        self.sequence.contains_key(name)
    }

    fn key(&self, name: &ObjectName) -> (u64, ObjectName) {
        (
            self.sequence.get(name).copied().unwrap_or(u64::MAX),
            name.clone(),
        )
    }

    /// Requirements that name objects not in the graph, sorted
    pub fn missing(&self) -> Vec<ObjectName> {
        let missing: BTreeSet<ObjectName> = self
            .requires
            .values()
            .flatten()
            .filter(|r| !self.contains(r))
            .cloned()
            .collect();
        missing.into_iter().collect()
    }

    /// Every object that transitively requires `failed`, in declaration order
    pub fn dependents_of(&self, failed: &ObjectName) -> Vec<ObjectName> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![failed.clone()];
        while let Some(node) = stack.pop() {
            for dependent in self.required_by.get(&node).into_iter().flatten() {
                if dependent != failed && seen.insert(dependent.clone()) {
                    stack.push(dependent.clone());
                }
            }
        }
        let mut dependents: Vec<ObjectName> = seen.into_iter().collect();
        dependents.sort_by_key(|n| self.key(n));
        dependents
    }

    /// Topological order: requirements first, declaration order on ties
    ///
    /// # Errors
    ///
    /// Returns `Error::UnresolvableRequirements` for requirements on objects
    /// outside the graph and for cycles.
    pub fn topological_order(&self) -> Result<Vec<ObjectName>> {
        self.kahn()
    }

    fn kahn(&self) -> Result<Vec<ObjectName>> {
        let missing = self.missing();
        if !missing.is_empty() {
            let mut objects: Vec<ObjectName> = self
                .requires
                .iter()
                .filter(|(_, reqs)| reqs.iter().any(|r| missing.contains(r)))
                .map(|(name, _)| name.clone())
                .collect();
            objects.sort_by_key(|n| self.key(n));
            return Err(unresolvable(&objects, &missing));
        }

        let mut pending: BTreeMap<&ObjectName, usize> = self
            .requires
            .iter()
            .map(|(name, reqs)| (name, reqs.iter().filter(|r| *r != name).count()))
            .collect();

        let mut ready: BinaryHeap<Reverse<(u64, ObjectName)>> = pending
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(name, _)| Reverse(self.key(name)))
            .collect();

        let mut order = Vec::with_capacity(pending.len());
        while let Some(Reverse((_, name))) = ready.pop() {
            for dependent in self.required_by.get(&name).into_iter().flatten() {
                if *dependent == name {
                    continue;
                }
                if let Some(count) = pending.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push(Reverse(self.key(dependent)));
                    }
                }
            }
            order.push(name);
        }

        if order.len() < self.sequence.len() {
            let done: BTreeSet<&ObjectName> = order.iter().collect();
            let mut stuck: Vec<ObjectName> = self
                .sequence
                .keys()
                .filter(|n| !done.contains(n))
                .cloned()
                .collect();
            stuck.sort_by_key(|n| self.key(n));
            let cycle = self.find_cycle(&stuck);
            // Cycle members first, then whatever waits on them
            let mut objects = cycle.clone();
            objects.extend(stuck.into_iter().filter(|n| !cycle.contains(n)));
            return Err(unresolvable(&objects, &[]));
        }
        Ok(order)
    }

    /// One cycle among `nodes`, found by depth-first search
    fn find_cycle(&self, nodes: &[ObjectName]) -> Vec<ObjectName> {
        let allowed: BTreeSet<&ObjectName> = nodes.iter().collect();
        let mut finished: BTreeSet<&ObjectName> = BTreeSet::new();

        for start in nodes {
            if finished.contains(start) {
                continue;
            }
            let mut path: Vec<(&ObjectName, usize)> = vec![(start, 0)];
            while let Some((node, idx)) = path.last().copied() {
                let reqs = self.requires.get(node).map(Vec::as_slice).unwrap_or(&[]);
                let Some(next) = reqs.get(idx) else {
                    finished.insert(node);
                    path.pop();
                    continue;
                };
                if let Some(top) = path.last_mut() {
                    top.1 += 1;
                }
                if !allowed.contains(next) || finished.contains(next) {
                    continue;
                }
                if let Some(pos) = path.iter().position(|(n, _)| *n == next) {
                    return path[pos..].iter().map(|(n, _)| (*n).clone()).collect();
                }
                path.push((next, 0));
            }
        }
        Vec::new()
    }
}

fn unresolvable(objects: &[ObjectName], missing: &[ObjectName]) -> Error {
    Error::UnresolvableRequirements {
        objects: objects.iter().map(ToString::to_string).collect(),
        missing: missing.iter().map(ToString::to_string).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Parameters;
    use crate::types::ObjectState;

    fn obj(name: &str, sequence: u64, requires: &[&str]) -> ConfigObject {
        ConfigObject {
            name: ObjectName::parse(name).unwrap(),
            parameters: Parameters::new(),
            requirements: requires
                .iter()
                .map(|r| ObjectName::parse(r).unwrap())
                .collect(),
            state: ObjectState::ReadyForCode,
            sequence,
            source: Vec::new(),
        }
    }

    fn names(order: &[ObjectName]) -> Vec<String> {
        order.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_order_respects_edges_and_declaration() {
        let objects = vec![
            obj("__a/1", 0, &["__c/3"]),
            obj("__b/2", 1, &[]),
            obj("__c/3", 2, &[]),
            obj("__d/4", 3, &["__a/1", "__b/2"]),
        ];
        let order = RequirementGraph::new(&objects).topological_order().unwrap();
        assert_eq!(names(&order), vec!["__b/2", "__c/3", "__a/1", "__d/4"]);
    }

    #[test]
    fn test_order_is_deterministic() {
        let objects: Vec<ConfigObject> = (0..20)
            .map(|i| {
                let name = format!("__t/{i}");
                if i % 3 == 0 && i > 0 {
                    let req = format!("__t/{}", i - 1);
                    obj(&name, i, &[req.as_str()])
                } else {
                    obj(&name, i, &[])
                }
            })
            .collect();
        let mut reversed = objects.clone();
        reversed.reverse();

        let first = RequirementGraph::new(&objects).topological_order().unwrap();
        let second = RequirementGraph::new(&reversed).topological_order().unwrap();
        assert_eq!(first, second);

        let position = |n: &str| names(&first).iter().position(|x| x == n).unwrap();
        for object in &objects {
            for req in &object.requirements {
                assert!(position(&req.to_string()) < position(&object.name.to_string()));
            }
        }
    }

    #[test]
    fn test_cycle_is_unresolvable() {
        let objects = vec![
            obj("__x/0", 0, &[]),
            obj("__a/1", 1, &["__b/2"]),
            obj("__b/2", 2, &["__a/1"]),
            obj("__c/3", 3, &["__a/1"]),
        ];
        match RequirementGraph::new(&objects).topological_order() {
            Err(Error::UnresolvableRequirements { objects, missing }) => {
                assert!(objects.contains(&"__a/1".to_string()));
                assert!(objects.contains(&"__b/2".to_string()));
                assert!(!objects.contains(&"__x/0".to_string()));
                assert_eq!(objects.last().map(String::as_str), Some("__c/3"));
                assert!(missing.is_empty());
            }
            other => panic!("expected unresolvable, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_requirement_is_unresolvable() {
        let objects = vec![obj("__a/1", 0, &["__ghost/1"])];
        match RequirementGraph::new(&objects).topological_order() {
            Err(Error::UnresolvableRequirements { objects, missing }) => {
                assert_eq!(objects, vec!["__a/1".to_string()]);
                assert_eq!(missing, vec!["__ghost/1".to_string()]);
            }
            other => panic!("expected unresolvable, got {other:?}"),
        }
    }

    #[test]
    fn test_dependents_are_transitive() {
        let objects = vec![
            obj("__b/1", 0, &[]),
            obj("__a/1", 1, &["__b/1"]),
            obj("__z/1", 2, &["__a/1"]),
            obj("__y/1", 3, &[]),
        ];
        let graph = RequirementGraph::new(&objects);
        let failed = ObjectName::parse("__b/1").unwrap();
        assert_eq!(names(&graph.dependents_of(&failed)), vec!["__a/1", "__z/1"]);
    }
}
