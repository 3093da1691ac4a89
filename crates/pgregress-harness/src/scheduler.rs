//! Dependency scheduling.
//!
//! Turns requested file names into a run order where every file follows all of its
//! transitive dependencies, and splits that order into groups that share no files so
//! they can run on separate connections.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::error::FixtureError;
use crate::registry::FixtureRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

struct Walk<'a> {
    registry: &'a FixtureRegistry,
    marks: HashMap<String, Mark>,
    stack: Vec<String>,
    order: Vec<String>,
}

impl<'a> Walk<'a> {
    fn new(registry: &'a FixtureRegistry) -> Self {
        Self {
            registry,
            marks: HashMap::new(),
            stack: Vec::new(),
            order: Vec::new(),
        }
    }

    fn visit(&mut self, name: &str) -> Result<(), FixtureError> {
        match self.marks.get(name) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::InProgress) => {
                let start = self.stack.iter().position(|n| n == name).unwrap_or(0);
                let mut cycle = self.stack[start..].to_vec();
                cycle.push(name.to_string());
                return Err(FixtureError::CyclicDependency { cycle });
            }
            None => {}
        }

        let Some(file) = self.registry.lookup(name) else {
            return Err(match self.stack.last() {
                Some(parent) => FixtureError::UnknownDependency {
                    file: parent.clone(),
                    dependency: name.to_string(),
                },
                None => FixtureError::UnknownFile(name.to_string()),
            });
        };

        self.marks.insert(name.to_string(), Mark::InProgress);
        self.stack.push(name.to_string());
        for dependency in &file.depends_on {
            self.visit(dependency)?;
        }
        self.stack.pop();
        self.marks.insert(name.to_string(), Mark::Done);
        self.order.push(name.to_string());
        Ok(())
    }
}

/// Linear run order for one file: each transitive dependency exactly once, before
/// its dependents, ending with `name`.
pub fn plan(registry: &FixtureRegistry, name: &str) -> Result<Vec<String>, FixtureError> {
    let mut walk = Walk::new(registry);
    walk.visit(name)?;
    Ok(walk.order)
}

/// One entry of a run group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedFile {
    pub name: String,
    /// Requested files are verified and reported; the rest only run for their side effects.
    pub requested: bool,
}

/// Files that must share one connection, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunGroup {
    pub files: Vec<PlannedFile>,
}

impl RunGroup {
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.files.iter().map(|f| f.name.as_str())
    }
}

/// Independent run groups covering every requested file and its dependencies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunPlan {
    pub groups: Vec<RunGroup>,
}

impl RunPlan {
    #[must_use]
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Total number of file executions across groups.
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.groups.iter().map(|g| g.files.len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Render the plan as indented text, one group per block.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (i, group) in self.groups.iter().enumerate() {
            out.push_str(&format!("group {}:\n", i + 1));
            for file in &group.files {
                let role = if file.requested { "" } else { " (dependency)" };
                out.push_str(&format!("  {}{role}\n", file.name));
            }
        }
        out
    }
}

fn find(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

/// Plan several requested files at once.
///
/// Groups are the weakly connected components of the dependency graph restricted
/// to the planned files, ordered by their first file in the combined order.
pub fn plan_many<S: AsRef<str>>(
    registry: &FixtureRegistry,
    names: &[S],
) -> Result<RunPlan, FixtureError> {
    let mut walk = Walk::new(registry);
    let mut requested = HashSet::new();
    for name in names {
        let name = name.as_ref();
        walk.visit(name)?;
        requested.insert(name.to_string());
    }
    let order = walk.order;

    let index: HashMap<&str, usize> = order
        .iter()
        .enumerate()
        .map(|(i, name)| (name.as_str(), i))
        .collect();
    let mut parent: Vec<usize> = (0..order.len()).collect();
    for (i, name) in order.iter().enumerate() {
        let Some(file) = registry.lookup(name) else {
            continue;
        };
        for dependency in &file.depends_on {
            if let Some(&j) = index.get(dependency.as_str()) {
                let (a, b) = (find(&mut parent, i), find(&mut parent, j));
                if a != b {
                    parent[a.max(b)] = a.min(b);
                }
            }
        }
    }

    let mut group_of_root: HashMap<usize, usize> = HashMap::new();
    let mut groups: Vec<RunGroup> = Vec::new();
    for (i, name) in order.iter().enumerate() {
        let root = find(&mut parent, i);
        let slot = *group_of_root.entry(root).or_insert_with(|| {
            groups.push(RunGroup::default());
            groups.len() - 1
        });
        groups[slot].files.push(PlannedFile {
            name: name.clone(),
            requested: requested.contains(name),
        });
    }
    Ok(RunPlan { groups })
}
