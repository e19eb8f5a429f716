//! Start ordering over the dependency graph.
//!
//! Kahn's algorithm, processed in waves: wave 0 holds every service without
//! dependencies, wave k+1 every service whose last dependency sits in wave k.
//! Within a wave services keep their declaration order, so the linear order
//! (the waves concatenated) is reproducible run to run.

use std::collections::{BTreeSet, HashMap};

use thiserror::Error;
use warden_types::{ServiceDefinition, WardenError};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DependencyError {
    #[error("Service '{service}' depends on undeclared service '{dependency}'")]
    Missing { service: String, dependency: String },

    #[error("Dependency cycle between: {}", members.join(", "))]
    Cycle { members: Vec<String> },

    #[error("Unknown service '{0}'")]
    UnknownService(String),
}

impl From<DependencyError> for WardenError {
    fn from(e: DependencyError) -> Self {
        WardenError::Config(e.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct DependencyResolver {
    names: Vec<String>,
    /// `deps[i]` are the indices service `i` waits for.
    deps: Vec<Vec<usize>>,
    index: HashMap<String, usize>,
}

impl DependencyResolver {
    /// Index `defs` in declaration order. Every dependency must be declared.
    pub fn new<'a, I>(defs: I) -> Result<Self, DependencyError>
    where
        I: IntoIterator<Item = &'a ServiceDefinition>,
    {
        let defs: Vec<&ServiceDefinition> = defs.into_iter().collect();
        let names: Vec<String> = defs.iter().map(|d| d.name.clone()).collect();
        let index: HashMap<String, usize> = names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.clone(), i))
            .collect();

        let mut deps = Vec::with_capacity(defs.len());
        for def in &defs {
            let mut edges = Vec::with_capacity(def.dependencies.len());
            for dep in &def.dependencies {
                let Some(&i) = index.get(dep) else {
                    return Err(DependencyError::Missing {
                        service: def.name.clone(),
                        dependency: dep.clone(),
                    });
                };
                if !edges.contains(&i) {
                    edges.push(i);
                }
            }
            deps.push(edges);
        }
        Ok(Self { names, deps, index })
    }

    /// Linear start order: every service after all of its dependencies.
    pub fn order(&self) -> Result<Vec<String>, DependencyError> {
        Ok(self.waves()?.into_iter().flatten().collect())
    }

    /// Groups of services that may start concurrently, in start order.
    pub fn waves(&self) -> Result<Vec<Vec<String>>, DependencyError> {
        let n = self.names.len();
        let mut pending: Vec<usize> = self.deps.iter().map(Vec::len).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, edges) in self.deps.iter().enumerate() {
            for &d in edges {
                dependents[d].push(i);
            }
        }

        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| pending[i] == 0).collect();
        let mut placed = 0;
        let mut waves = Vec::new();
        while !ready.is_empty() {
            let wave = std::mem::take(&mut ready);
            for &i in &wave {
                for &j in &dependents[i] {
                    pending[j] -= 1;
                    if pending[j] == 0 {
                        ready.insert(j);
                    }
                }
            }
            placed += wave.len();
            waves.push(wave.into_iter().map(|i| self.names[i].clone()).collect());
        }

        if placed < n {
            return Err(DependencyError::Cycle {
                members: self.cycle_members(&pending),
            });
        }
        Ok(waves)
    }

    /// `targets` plus everything they transitively depend on, in start order.
    pub fn closure(&self, targets: &[&str]) -> Result<Vec<String>, DependencyError> {
        let mut wanted = vec![false; self.names.len()];
        let mut stack = Vec::new();
        for t in targets {
            let &i = self
                .index
                .get(*t)
                .ok_or_else(|| DependencyError::UnknownService(t.to_string()))?;
            stack.push(i);
        }
        while let Some(i) = stack.pop() {
            if wanted[i] {
                continue;
            }
            wanted[i] = true;
            stack.extend(self.deps[i].iter().copied());
        }

        let order = self.order()?;
        Ok(order
            .into_iter()
            .filter(|name| self.index.get(name).is_some_and(|&i| wanted[i]))
            .collect())
    }

    /// Direct dependencies of `name`, in declaration order of the dependency list.
    pub fn dependencies_of(&self, name: &str) -> Option<Vec<&str>> {
        let &i = self.index.get(name)?;
        Some(self.deps[i].iter().map(|&d| self.names[d].as_str()).collect())
    }

    /// Services left over by Kahn's pass, minus the ones that merely sit
    /// downstream of a cycle.
    fn cycle_members(&self, pending: &[usize]) -> Vec<String> {
        let mut stuck: Vec<bool> = pending.iter().map(|&p| p > 0).collect();
        loop {
            let mut changed = false;
            for i in 0..stuck.len() {
                if !stuck[i] {
                    continue;
                }
                let needed = (0..stuck.len()).any(|j| stuck[j] && self.deps[j].contains(&i));
                if !needed {
                    stuck[i] = false;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        stuck
            .iter()
            .enumerate()
            .filter(|(_, s)| **s)
            .map(|(i, _)| self.names[i].clone())
            .collect()
    }
}
