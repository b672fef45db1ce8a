//! Dependency ordering over backlog tasks.

use super::{Backlog, Task, TaskStatus};
use crate::errors::OrchestratorError;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap, VecDeque};

/// Validated dependency DAG with a precomputed topological order.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    tasks: BTreeMap<String, Task>,
    /// Reverse edges: task -> tasks that depend on it
    dependents: HashMap<String, Vec<String>>,
    order: Vec<String>,
}

impl DependencyGraph {
    /// Build and sort. Unknown dependencies are a validation error; a cycle
    /// is a `DependencyCycle` naming its members.
    pub fn build(tasks: &[Task]) -> Result<Self, OrchestratorError> {
        let mut by_id = BTreeMap::new();
        for task in tasks {
            if by_id.insert(task.id.clone(), task.clone()).is_some() {
                return Err(OrchestratorError::validation(format!(
                    "Task {} appears twice",
                    task.id
                )));
            }
        }

        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for task in tasks {
            for dep in &task.depends_on {
                if !by_id.contains_key(dep) {
                    return Err(OrchestratorError::validation(format!(
                        "Task {} depends on unknown task {}",
                        task.id, dep
                    )));
                }
                dependents.entry(dep.clone()).or_default().push(task.id.clone());
            }
        }

        let order = kahn_order(&by_id, &dependents)?;
        Ok(Self {
            tasks: by_id,
            dependents,
            order,
        })
    }

    /// Every task, dependencies before dependents, lower rank first among
    /// tasks that are ready at the same time.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    fn deps_done(&self, task: &Task) -> bool {
        task.depends_on
            .iter()
            .all(|d| self.tasks.get(d).map(|t| t.status) == Some(TaskStatus::Done))
    }

    /// The first task in order that is actionable with every dependency
    /// done.
    pub fn next_actionable(&self) -> Option<&Task> {
        self.actionable().into_iter().next()
    }

    /// All tasks that could be selected right now, in selection order.
    pub fn actionable(&self) -> Vec<&Task> {
        self.order
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .filter(|t| t.status.is_actionable() && self.deps_done(t))
            .collect()
    }

    /// Tasks transitively depending on `id`, in topological order.
    pub fn downstream(&self, id: &str) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([id.to_string()]);
        while let Some(node) = queue.pop_front() {
            for next in self.dependents.get(&node).into_iter().flatten() {
                if seen.insert(next.clone()) {
                    queue.push_back(next.clone());
                }
            }
        }
        self.order
            .iter()
            .filter(|t| seen.contains(*t))
            .cloned()
            .collect()
    }

    /// `(task, blocked dependency)` pairs for every not-yet-blocked, not-done
    /// task downstream of a blocked one.
    pub fn blocked_closure(&self) -> Vec<(String, String)> {
        let mut newly: BTreeMap<String, String> = BTreeMap::new();
        for id in &self.order {
            let Some(task) = self.tasks.get(id) else {
                continue;
            };
            if task.status != TaskStatus::Blocked {
                continue;
            }
            for down in self.downstream(id) {
                let Some(t) = self.tasks.get(&down) else {
                    continue;
                };
                if matches!(t.status, TaskStatus::Blocked | TaskStatus::Done) {
                    continue;
                }
                newly.entry(down).or_insert_with(|| id.clone());
            }
        }
        self.order
            .iter()
            .filter_map(|id| newly.get(id).map(|root| (id.clone(), root.clone())))
            .collect()
    }
}

fn kahn_order(
    tasks: &BTreeMap<String, Task>,
    dependents: &HashMap<String, Vec<String>>,
) -> Result<Vec<String>, OrchestratorError> {
    let mut in_degree: HashMap<&str, usize> = tasks
        .values()
        .map(|t| (t.id.as_str(), t.depends_on.len()))
        .collect();

    let mut ready: BinaryHeap<Reverse<(u64, &str)>> = tasks
        .values()
        .filter(|t| t.depends_on.is_empty())
        .map(|t| Reverse((t.rank(), t.id.as_str())))
        .collect();

    let mut order = Vec::with_capacity(tasks.len());
    while let Some(Reverse((_, id))) = ready.pop() {
        order.push(id.to_string());
        for next in dependents.get(id).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(next.as_str()) {
                *degree -= 1;
                if *degree == 0
                    && let Some(task) = tasks.get(next)
                {
                    ready.push(Reverse((task.rank(), task.id.as_str())));
                }
            }
        }
    }

    if order.len() == tasks.len() {
        return Ok(order);
    }

    // Leftovers are cycle members plus anything between or downstream of
    // cycles. Keep only nodes that can reach themselves.
    let sorted: BTreeSet<&str> = order.iter().map(String::as_str).collect();
    let remaining: BTreeSet<&str> = tasks
        .keys()
        .map(String::as_str)
        .filter(|id| !sorted.contains(id))
        .collect();
    let on_cycle = |start: &str| -> bool {
        let mut stack = vec![start];
        let mut seen = BTreeSet::new();
        while let Some(id) = stack.pop() {
            for next in dependents.get(id).into_iter().flatten() {
                let next = next.as_str();
                if next == start {
                    return true;
                }
                if remaining.contains(next) && seen.insert(next) {
                    stack.push(next);
                }
            }
        }
        false
    };

    Err(OrchestratorError::DependencyCycle {
        nodes: remaining
            .iter()
            .copied()
            .filter(|id| on_cycle(*id))
            .map(String::from)
            .collect(),
    })
}

/// Mark every task downstream of a blocked task as blocked. Done tasks are
/// never touched. Returns the newly blocked task IDs.
pub fn propagate_blocked(backlog: &mut Backlog) -> Result<Vec<String>, OrchestratorError> {
    let graph = DependencyGraph::build(backlog.tasks())?;
    let mut newly = Vec::new();
    for (task, root) in graph.blocked_closure() {
        backlog.set_status(
            &task,
            TaskStatus::Blocked,
            Some(&format!("blocked: depends on {}", root)),
        )?;
        newly.push(task);
    }
    Ok(newly)
}
