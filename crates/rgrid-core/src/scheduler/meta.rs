//! Meta-job dependency graph
//!
//! A meta submission shares one group id across its jobs and records
//! `parent -> child` edges. A child stays outside the admission queue
//! until every parent completed successfully; a failed parent cancels the
//! whole dependent subtree without executing it.

use crate::scheduler::job::{GroupId, Job, JobId};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    /// Waiting for parents, job not yet admitted
    Pending,

    /// Admitted to the queue / executing
    Released,

    /// Finished successfully
    Done,

    /// Finished unsuccessfully
    Failed,

    /// Dropped without execution
    Cancelled,
}

struct MetaNode {
    /// Held until release; the queue owns the job afterwards
    job: Option<Arc<Job>>,
    waiting_on: HashSet<JobId>,
    children: HashSet<JobId>,
    state: NodeState,
}

struct MetaGroup {
    nodes: HashMap<JobId, MetaNode>,
}

impl MetaGroup {
    fn is_settled(&self) -> bool {
        self.nodes.values().all(|n| {
            matches!(
                n.state,
                NodeState::Done | NodeState::Failed | NodeState::Cancelled
            )
        })
    }
}

/// Result of feeding a completion into the graph
#[derive(Default)]
pub struct MetaOutcome {
    /// Children whose parents have all succeeded; push these into the queue
    pub released: Vec<Arc<Job>>,

    /// Unreleased descendants dropped because a parent failed
    pub parent_failed: Vec<Arc<Job>>,
}

/// Dependency DAGs of every live meta submission
pub struct MetaGraph {
    groups: Mutex<HashMap<GroupId, MetaGroup>>,
}

impl Default for MetaGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl MetaGraph {
    pub fn new() -> Self {
        Self {
            groups: Mutex::new(HashMap::new()),
        }
    }

    /// Record a meta submission. Returns the root jobs (no parents), which
    /// are released immediately.
    pub fn register(
        &self,
        group_id: GroupId,
        jobs: Vec<Arc<Job>>,
        edges: &[(JobId, JobId)],
    ) -> Vec<Arc<Job>> {
        let mut nodes: HashMap<JobId, MetaNode> = jobs
            .into_iter()
            .map(|job| {
                (
                    job.job_id,
                    MetaNode {
                        job: Some(job),
                        waiting_on: HashSet::new(),
                        children: HashSet::new(),
                        state: NodeState::Pending,
                    },
                )
            })
            .collect();

        for &(parent, child) in edges {
            if !nodes.contains_key(&parent) || !nodes.contains_key(&child) {
                warn!(group_id, parent, child, "dependency edge names unknown job, ignored");
                continue;
            }
            if let Some(node) = nodes.get_mut(&parent) {
                node.children.insert(child);
            }
            if let Some(node) = nodes.get_mut(&child) {
                node.waiting_on.insert(parent);
            }
        }

        let mut roots = Vec::new();
        for node in nodes.values_mut() {
            if node.waiting_on.is_empty() {
                node.state = NodeState::Released;
                if let Some(job) = node.job.take() {
                    roots.push(job);
                }
            }
        }

        info!(
            group_id,
            jobs = nodes.len(),
            roots = roots.len(),
            "meta submission registered"
        );
        self.groups
            .lock()
            .expect("meta graph lock poisoned")
            .insert(group_id, MetaGroup { nodes });
        roots
    }

    /// Feed a terminal job state into the graph. For non-meta jobs the
    /// outcome is empty.
    pub fn on_job_done(&self, group_id: GroupId, job_id: JobId, success: bool) -> MetaOutcome {
        let mut groups = self.groups.lock().expect("meta graph lock poisoned");
        let Some(group) = groups.get_mut(&group_id) else {
            return MetaOutcome::default();
        };
        if !group.nodes.contains_key(&job_id) {
            return MetaOutcome::default();
        }

        let mut outcome = MetaOutcome::default();
        if success {
            if let Some(node) = group.nodes.get_mut(&job_id) {
                node.state = NodeState::Done;
            }
            let children: Vec<JobId> = group
                .nodes
                .get(&job_id)
                .map(|n| n.children.iter().copied().collect())
                .unwrap_or_default();
            for child_id in children {
                let Some(child) = group.nodes.get_mut(&child_id) else {
                    continue;
                };
                child.waiting_on.remove(&job_id);
                if child.waiting_on.is_empty() && child.state == NodeState::Pending {
                    child.state = NodeState::Released;
                    if let Some(job) = child.job.take() {
                        outcome.released.push(job);
                    }
                }
            }
        } else {
            if let Some(node) = group.nodes.get_mut(&job_id) {
                node.state = NodeState::Failed;
            }

            // Cancel the whole unreleased subtree below the failed job
            let mut frontier: VecDeque<JobId> = group
                .nodes
                .get(&job_id)
                .map(|n| n.children.iter().copied().collect())
                .unwrap_or_default();
            let mut seen = HashSet::new();
            while let Some(descendant_id) = frontier.pop_front() {
                if !seen.insert(descendant_id) {
                    continue;
                }
                let Some(node) = group.nodes.get_mut(&descendant_id) else {
                    continue;
                };
                if node.state == NodeState::Pending {
                    node.state = NodeState::Cancelled;
                    if let Some(job) = node.job.take() {
                        outcome.parent_failed.push(job);
                    }
                }
                frontier.extend(node.children.iter().copied());
            }
        }

        if group.is_settled() {
            groups.remove(&group_id);
        }
        outcome
    }

    /// Drop every unreleased job of a group (administrative group stop)
    pub fn cancel_group(&self, group_id: GroupId) -> Vec<Arc<Job>> {
        let mut groups = self.groups.lock().expect("meta graph lock poisoned");
        let Some(group) = groups.remove(&group_id) else {
            return Vec::new();
        };
        group
            .nodes
            .into_values()
            .filter(|n| n.state == NodeState::Pending)
            .filter_map(|mut n| n.job.take())
            .collect()
    }

    /// Drop every unreleased job of every group (master-wide stop)
    pub fn cancel_all(&self) -> Vec<Arc<Job>> {
        let mut groups = self.groups.lock().expect("meta graph lock poisoned");
        groups
            .drain()
            .flat_map(|(_, group)| group.nodes.into_values())
            .filter(|n| n.state == NodeState::Pending)
            .filter_map(|mut n| n.job.take())
            .collect()
    }

    /// Number of live meta groups
    pub fn num_groups(&self) -> usize {
        self.groups.lock().expect("meta graph lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::ExecSpec;

    fn job(job_id: JobId, group_id: GroupId) -> Arc<Job> {
        let mut job = Job::new(
            job_id,
            group_id,
            ExecSpec {
                script: "/tmp/t.py".to_string(),
                language: "python".to_string(),
            },
        );
        job.group_id = group_id;
        Arc::new(job)
    }

    #[test]
    fn test_roots_released_immediately() {
        let graph = MetaGraph::new();
        let roots = graph.register(42, vec![job(1, 42), job(2, 42)], &[(1, 2)]);
        let ids: Vec<JobId> = roots.iter().map(|j| j.job_id).collect();
        assert_eq!(ids, vec![1]);
    }

    #[test]
    fn test_child_released_after_all_parents() {
        let graph = MetaGraph::new();
        // 1 -> 3, 2 -> 3
        graph.register(42, vec![job(1, 42), job(2, 42), job(3, 42)], &[(1, 3), (2, 3)]);

        let outcome = graph.on_job_done(42, 1, true);
        assert!(outcome.released.is_empty());

        let outcome = graph.on_job_done(42, 2, true);
        assert_eq!(outcome.released.len(), 1);
        assert_eq!(outcome.released[0].job_id, 3);

        // Leaf completion settles and drops the group
        graph.on_job_done(42, 3, true);
        assert_eq!(graph.num_groups(), 0);
    }

    #[test]
    fn test_parent_failure_cancels_subtree() {
        let graph = MetaGraph::new();
        // 1 -> 2 -> 3, and 1 -> 4
        graph.register(
            42,
            vec![job(1, 42), job(2, 42), job(3, 42), job(4, 42)],
            &[(1, 2), (2, 3), (1, 4)],
        );

        let outcome = graph.on_job_done(42, 1, false);
        let mut cancelled: Vec<JobId> = outcome.parent_failed.iter().map(|j| j.job_id).collect();
        cancelled.sort_unstable();
        assert!(outcome.released.is_empty());
        assert_eq!(cancelled, vec![2, 3, 4]);
        assert_eq!(graph.num_groups(), 0);
    }

    #[test]
    fn test_non_meta_completion_is_noop() {
        let graph = MetaGraph::new();
        let outcome = graph.on_job_done(7, 7, true);
        assert!(outcome.released.is_empty());
        assert!(outcome.parent_failed.is_empty());
    }

    #[test]
    fn test_cancel_group_returns_unreleased() {
        let graph = MetaGraph::new();
        graph.register(42, vec![job(1, 42), job(2, 42)], &[(1, 2)]);

        let cancelled = graph.cancel_group(42);
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].job_id, 2);
        assert_eq!(graph.num_groups(), 0);
    }
}
