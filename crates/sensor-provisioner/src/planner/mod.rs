use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::error::{Error, Result};
use crate::executor::{StageKind, StagePolicy};

pub type TaskId = String;

#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub label: String,
    pub stage: StageKind,
    pub policy: StagePolicy,
    /// Task ids this task runs after. A trailing `?` makes the dependency optional.
    pub after: Vec<TaskId>,
}

impl Task {
    pub fn for_stage(stage: StageKind, after: &[&str]) -> Self {
        Self {
            id: stage.id().into(),
            label: stage.to_string(),
            stage,
            policy: stage.policy(),
            after: after.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Default)]
pub struct Plan {
    tasks: BTreeMap<TaskId, Task>,
}

impl Plan {
    /// Stages for one run: profile install and compile always, clean and upload on request.
    pub fn for_request(clean: bool, upload: bool) -> Result<Self> {
        let mut plan = Plan::default();
        if clean {
            plan.add(Task::for_stage(StageKind::Clean, &[]))?;
        }
        plan.add(Task::for_stage(StageKind::InstallProfile, &["clean?"]))?;
        plan.add(Task::for_stage(StageKind::Compile, &["profile"]))?;
        if upload {
            plan.add(Task::for_stage(StageKind::Upload, &["compile"]))?;
        }
        Ok(plan)
    }

    pub fn add(&mut self, task: Task) -> Result<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(Error::msg(format!("duplicate task id '{}'", task.id)));
        }
        self.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    fn resolve_dep_maybe<'a>(&'a self, dep: &'a str) -> Result<Option<&'a str>> {
        let (dep, optional) = dep
            .strip_suffix('?')
            .map(|d| (d, true))
            .unwrap_or((dep, false));
        if self.tasks.contains_key(dep) {
            return Ok(Some(dep));
        }
        if optional {
            Ok(None)
        } else {
            Err(Error::msg(format!("unknown dependency '{}'", dep)))
        }
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn contains(&self, stage: StageKind) -> bool {
        self.tasks.contains_key(stage.id())
    }

    pub fn ordered(&self) -> Result<Vec<&Task>> {
        // Build adjacency from "after" constraints.
        let mut incoming: BTreeMap<&str, usize> = BTreeMap::new();
        let mut outgoing: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();

        for (id, task) in &self.tasks {
            outgoing.entry(id.as_str()).or_default();
            let mut deps = 0usize;
            for dep in &task.after {
                let Some(dep_id) = self.resolve_dep_maybe(dep.as_str()).map_err(|e| {
                    Error::msg(format!(
                        "task '{}' has invalid dependency '{}': {}",
                        id, dep, e
                    ))
                })?
                else {
                    continue;
                };
                outgoing.entry(dep_id).or_default().insert(id.as_str());
                deps += 1;
            }
            incoming.insert(id.as_str(), deps);
        }

        let mut q: VecDeque<&str> = incoming
            .iter()
            .filter_map(|(k, v)| (*v == 0).then_some(*k))
            .collect();
        let mut out: Vec<&Task> = Vec::with_capacity(self.tasks.len());

        while let Some(n) = q.pop_front() {
            if let Some(task) = self.tasks.get(n) {
                out.push(task);
            }
            if let Some(children) = outgoing.get(n) {
                for &m in children {
                    if let Some(slot) = incoming.get_mut(m) {
                        *slot -= 1;
                        if *slot == 0 {
                            q.push_back(m);
                        }
                    }
                }
            }
        }

        if out.len() != self.tasks.len() {
            // cycle; attempt to show the nodes involved
            let remaining: Vec<&str> = incoming
                .iter()
                .filter_map(|(k, v)| (*v > 0).then_some(*k))
                .collect();
            return Err(Error::msg(format!(
                "task graph contains a cycle; remaining nodes: {}",
                remaining.join(", ")
            )));
        }
        Ok(out)
    }
}
