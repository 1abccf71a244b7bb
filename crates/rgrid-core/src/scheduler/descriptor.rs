//! Job description files
//!
//! Two extensions are recognized: `.job` holds a single JSON job
//! descriptor, `.meta` holds a set of named descriptors plus
//! `parent -> child` dependency edges. Host-list files are plain text,
//! one host per line.

use crate::error::{Error, Result};
use crate::scheduler::job::{ExecSpec, GroupId, Job, JobId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use validator::Validate;

/// One `.job` file
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct JobDescriptor {
    /// Optional name; required for meta-job members
    #[serde(default)]
    pub name: Option<String>,

    /// Script path or inline source executed by the worker
    #[validate(length(min = 1))]
    pub script: String,

    #[serde(default = "default_language")]
    pub language: String,

    #[serde(default)]
    pub priority: i32,

    #[serde(default = "default_num_tasks")]
    #[validate(range(min = 1))]
    pub num_tasks: u32,

    #[serde(default = "default_max_failed_nodes")]
    pub max_failed_nodes: u32,

    /// Distinct-host spread cap; negative means unlimited
    #[serde(default = "default_unlimited")]
    pub max_cluster_cpu: i32,

    /// In-flight instance cap; negative means unlimited
    #[serde(default = "default_unlimited")]
    pub max_cpu: i32,

    /// Seconds in queue before expiry; negative means forever
    #[serde(default = "default_no_timeout")]
    pub queue_timeout: i64,

    /// Seconds of execution before expiry; negative means forever
    #[serde(default = "default_no_timeout")]
    pub job_timeout: i64,

    /// Seconds per task instance; negative means forever
    #[serde(default = "default_no_timeout")]
    pub task_timeout: i64,

    /// Per-host attempt budget; negative means unlimited
    #[serde(default = "default_unlimited")]
    pub max_exec: i32,

    #[serde(default)]
    pub host_group: Option<String>,

    #[serde(default)]
    pub no_reschedule: bool,
}

impl JobDescriptor {
    /// Parse and validate one `.job` document
    pub fn parse(text: &str) -> Result<Self> {
        let descriptor: JobDescriptor = serde_json::from_str(text)?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Materialize a job with allocated identifiers
    pub fn into_job(self, job_id: JobId, group_id: GroupId) -> Job {
        let mut job = Job::new(
            job_id,
            group_id,
            ExecSpec {
                script: self.script,
                language: self.language,
            },
        );
        job.name = self.name;
        job.priority = self.priority;
        job.num_tasks = self.num_tasks;
        job.max_failed_nodes = self.max_failed_nodes;
        job.max_cluster_cpu = self.max_cluster_cpu;
        job.max_cpu = self.max_cpu;
        job.queue_timeout = self.queue_timeout;
        job.job_timeout = self.job_timeout;
        job.task_timeout = self.task_timeout;
        job.max_exec = self.max_exec;
        job.host_group = self.host_group;
        job.no_reschedule = self.no_reschedule;
        job
    }
}

/// One `.meta` file: named jobs plus dependency edges
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaDescriptor {
    pub jobs: Vec<JobDescriptor>,

    /// `[parent, child]` pairs; the parent must complete first
    #[serde(default)]
    pub depends: Vec<(String, String)>,
}

impl MetaDescriptor {
    /// Parse and validate one `.meta` document: named, unique members,
    /// edges over known names, and an acyclic graph.
    pub fn parse(text: &str) -> Result<Self> {
        let descriptor: MetaDescriptor = serde_json::from_str(text)?;

        if descriptor.jobs.is_empty() {
            return Err(Error::invalid_job("meta description contains no jobs"));
        }

        let mut names = HashSet::new();
        for job in &descriptor.jobs {
            job.validate()?;
            let Some(name) = job.name.as_deref().filter(|n| !n.is_empty()) else {
                return Err(Error::invalid_job("meta-job member is missing a name"));
            };
            if !names.insert(name.to_string()) {
                return Err(Error::invalid_job(format!("duplicate meta-job name '{}'", name)));
            }
        }

        for (parent, child) in &descriptor.depends {
            if !names.contains(parent) {
                return Err(Error::invalid_job(format!("unknown dependency parent '{}'", parent)));
            }
            if !names.contains(child) {
                return Err(Error::invalid_job(format!("unknown dependency child '{}'", child)));
            }
        }

        descriptor.check_acyclic()?;
        Ok(descriptor)
    }

    // Kahn's algorithm; leftover nodes mean a dependency cycle
    fn check_acyclic(&self) -> Result<()> {
        let mut indegree: HashMap<&str, usize> = self
            .jobs
            .iter()
            .filter_map(|j| j.name.as_deref())
            .map(|n| (n, 0))
            .collect();
        let mut children: HashMap<&str, Vec<&str>> = HashMap::new();
        for (parent, child) in &self.depends {
            *indegree.entry(child.as_str()).or_insert(0) += 1;
            children.entry(parent.as_str()).or_default().push(child.as_str());
        }

        let mut ready: VecDeque<&str> = indegree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(&n, _)| n)
            .collect();
        let mut visited = 0;
        while let Some(name) = ready.pop_front() {
            visited += 1;
            for &child in children.get(name).into_iter().flatten() {
                let degree = indegree.get_mut(child).expect("edge endpoints validated");
                *degree -= 1;
                if *degree == 0 {
                    ready.push_back(child);
                }
            }
        }

        if visited != indegree.len() {
            return Err(Error::invalid_job("dependency graph contains a cycle"));
        }
        Ok(())
    }
}

/// A parsed submission of either kind
#[derive(Debug, Clone)]
pub enum Submission {
    Job(JobDescriptor),
    Meta(MetaDescriptor),
}

impl Submission {
    /// Dispatch on the file extension of a submitted description
    pub fn from_file_contents(file_name: &str, contents: &str) -> Result<Self> {
        let extension = file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext)
            .ok_or_else(|| {
                Error::invalid_job(format!("couldn't extract job file extension '{}'", file_name))
            })?;

        match extension {
            "job" => Ok(Submission::Job(JobDescriptor::parse(contents)?)),
            "meta" => Ok(Submission::Meta(MetaDescriptor::parse(contents)?)),
            other => Err(Error::invalid_job(format!("unknown file extension '{}'", other))),
        }
    }
}

/// Parse a host-list file: one host per line, blanks and `#` comments ignored
pub fn parse_host_list(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

fn default_language() -> String {
    "python".to_string()
}

fn default_num_tasks() -> u32 {
    1
}

fn default_max_failed_nodes() -> u32 {
    1
}

fn default_unlimited() -> i32 {
    -1
}

fn default_no_timeout() -> i64 {
    -1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_job_with_defaults() {
        let descriptor = JobDescriptor::parse(r#"{"script": "/opt/jobs/etl.py"}"#).unwrap();
        assert_eq!(descriptor.language, "python");
        assert_eq!(descriptor.num_tasks, 1);
        assert_eq!(descriptor.max_cluster_cpu, -1);
        assert_eq!(descriptor.queue_timeout, -1);
        assert!(!descriptor.no_reschedule);
    }

    #[test]
    fn test_parse_job_full() {
        let descriptor = JobDescriptor::parse(
            r#"{
                "name": "etl",
                "script": "/opt/jobs/etl.py",
                "language": "python",
                "priority": 4,
                "num_tasks": 25,
                "max_failed_nodes": 10,
                "max_cluster_cpu": -1,
                "max_cpu": 1,
                "queue_timeout": 300,
                "job_timeout": 1800,
                "task_timeout": 300,
                "max_exec": 2,
                "host_group": "batch",
                "no_reschedule": false
            }"#,
        )
        .unwrap();

        assert_eq!(descriptor.num_tasks, 25);
        assert_eq!(descriptor.host_group.as_deref(), Some("batch"));

        let job = descriptor.into_job(7, 8);
        assert_eq!(job.job_id, 7);
        assert_eq!(job.group_id, 8);
        assert_eq!(job.priority, 4);
        assert_eq!(job.max_exec, 2);
    }

    #[test]
    fn test_invalid_job_rejected() {
        assert!(JobDescriptor::parse(r#"{"script": ""}"#).is_err());
        assert!(JobDescriptor::parse(r#"{"script": "/a.py", "num_tasks": 0}"#).is_err());
        assert!(JobDescriptor::parse("not json").is_err());
    }

    #[test]
    fn test_parse_meta() {
        let descriptor = MetaDescriptor::parse(
            r#"{
                "jobs": [
                    {"name": "extract", "script": "/opt/jobs/extract.py"},
                    {"name": "load", "script": "/opt/jobs/load.py"}
                ],
                "depends": [["extract", "load"]]
            }"#,
        )
        .unwrap();
        assert_eq!(descriptor.jobs.len(), 2);
        assert_eq!(descriptor.depends.len(), 1);
    }

    #[test]
    fn test_meta_rejects_bad_graphs() {
        // Unnamed member
        assert!(MetaDescriptor::parse(r#"{"jobs": [{"script": "/a.py"}]}"#).is_err());

        // Duplicate names
        assert!(MetaDescriptor::parse(
            r#"{"jobs": [
                {"name": "a", "script": "/a.py"},
                {"name": "a", "script": "/b.py"}
            ]}"#
        )
        .is_err());

        // Edge to a job that does not exist
        assert!(MetaDescriptor::parse(
            r#"{"jobs": [{"name": "a", "script": "/a.py"}], "depends": [["a", "b"]]}"#
        )
        .is_err());

        // Cycle
        assert!(MetaDescriptor::parse(
            r#"{"jobs": [
                {"name": "a", "script": "/a.py"},
                {"name": "b", "script": "/b.py"}
            ], "depends": [["a", "b"], ["b", "a"]]}"#
        )
        .is_err());
    }

    #[test]
    fn test_submission_extension_dispatch() {
        let job = Submission::from_file_contents("etl.job", r#"{"script": "/a.py"}"#);
        assert!(matches!(job, Ok(Submission::Job(_))));

        let meta = Submission::from_file_contents(
            "pipeline.meta",
            r#"{"jobs": [{"name": "a", "script": "/a.py"}]}"#,
        );
        assert!(matches!(meta, Ok(Submission::Meta(_))));

        assert!(Submission::from_file_contents("x.txt", "").is_err());
        assert!(Submission::from_file_contents("noext", "").is_err());
    }

    #[test]
    fn test_parse_host_list() {
        let hosts = parse_host_list("# batch pool\nnode1\n\n  node2  \n#node3\n");
        assert_eq!(hosts, vec!["node1".to_string(), "node2".to_string()]);
    }
}
