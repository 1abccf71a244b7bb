//! Admin command handlers
//!
//! Each JSON-RPC method maps to one handler that deserializes its params,
//! drives the master and returns a JSON result.

use crate::rpc::RpcError;
use rgrid_core::scheduler::descriptor::{parse_host_list, Submission};
use rgrid_core::Master;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path;
use tracing::warn;

#[derive(Debug, Deserialize)]
struct FileParams {
    file: String,
}

#[derive(Debug, Deserialize)]
struct JobIdParams {
    job_id: i64,
}

#[derive(Debug, Deserialize)]
struct GroupIdParams {
    group_id: i64,
}

#[derive(Debug, Deserialize)]
struct HostsParams {
    hosts: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct GroupParams {
    group: String,
}

fn params<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, RpcError> {
    serde_json::from_value(value).map_err(|e| RpcError::invalid_params(e.to_string()))
}

/// Dispatch one admin method
pub async fn handle(master: &Master, method: &str, raw_params: Value) -> Result<Value, RpcError> {
    match method {
        "run" => run(master, params(raw_params)?).await,
        "stop" => stop(master, params(raw_params)?).await,
        "stop_group" => stop_group(master, params(raw_params)?).await,
        "stop_all" => stop_all(master).await,
        "stop_prev" => stop_prev(master).await,
        "add_hosts" => add_hosts(master, params(raw_params)?),
        "delete_hosts" => delete_hosts(master, params(raw_params)?).await,
        "add_group" => add_group(master, params(raw_params)?).await,
        "delete_group" => delete_group(master, params(raw_params)?).await,
        "info" => info(master, params(raw_params)?).await,
        "stat" => stat(master).await,
        other => Err(RpcError::method_not_found(other)),
    }
}

/// Parse a `.job` or `.meta` description file and push it into the queue
async fn run(master: &Master, params: FileParams) -> Result<Value, RpcError> {
    let file_name = Path::new(&params.file)
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| RpcError::invalid_params(format!("bad file path '{}'", params.file)))?
        .to_string();

    let contents = tokio::fs::read_to_string(&params.file)
        .await
        .map_err(|e| RpcError::internal(format!("couldn't open '{}': {}", params.file, e)))?;

    let submission = Submission::from_file_contents(&file_name, &contents)
        .map_err(|e| RpcError::internal(e.to_string()))?;

    let job_ids = master
        .submit(submission)
        .await
        .map_err(|e| RpcError::internal(e.to_string()))?;

    Ok(json!({ "job_ids": job_ids }))
}

/// Remove a job from the queue, or stop it if it is already executing
async fn stop(master: &Master, params: JobIdParams) -> Result<Value, RpcError> {
    master
        .scheduler
        .stop_job(params.job_id)
        .await
        .map_err(|e| RpcError::internal(e.to_string()))?;
    Ok(json!({ "stopped": params.job_id }))
}

async fn stop_group(master: &Master, params: GroupIdParams) -> Result<Value, RpcError> {
    let stopped = master.scheduler.stop_job_group(params.group_id).await;
    Ok(json!({ "stopped": stopped }))
}

async fn stop_all(master: &Master) -> Result<Value, RpcError> {
    let stopped = master.scheduler.stop_all_jobs().await;
    Ok(json!({ "stopped": stopped }))
}

async fn stop_prev(master: &Master) -> Result<Value, RpcError> {
    let stopped = master.scheduler.stop_previous_jobs().await;
    Ok(json!({ "stopped": stopped }))
}

/// `hosts` alternates group and host names: `[group, host, group, host, ...]`
fn add_hosts(master: &Master, params: HostsParams) -> Result<Value, RpcError> {
    if params.hosts.len() % 2 != 0 {
        return Err(RpcError::invalid_params(
            "hosts must alternate group and host names",
        ));
    }
    let mut added = 0;
    for pair in params.hosts.chunks(2) {
        if master.add_host(&pair[0], &pair[1]) {
            added += 1;
        }
    }
    Ok(json!({ "added": added }))
}

async fn delete_hosts(master: &Master, params: HostsParams) -> Result<Value, RpcError> {
    let mut deleted = 0;
    for host in &params.hosts {
        match master.delete_host(host).await {
            Ok(()) => deleted += 1,
            Err(e) => warn!(%host, error = %e, "delete_hosts skipped host"),
        }
    }
    Ok(json!({ "deleted": deleted }))
}

/// Bulk-add hosts from a host-list file; the group takes the file name
async fn add_group(master: &Master, params: FileParams) -> Result<Value, RpcError> {
    let group = Path::new(&params.file)
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| RpcError::invalid_params(format!("bad file path '{}'", params.file)))?
        .to_string();

    let contents = tokio::fs::read_to_string(&params.file)
        .await
        .map_err(|e| RpcError::internal(format!("couldn't open '{}': {}", params.file, e)))?;

    let hosts = parse_host_list(&contents);
    let added = hosts.len();
    master.add_host_group(&group, hosts);
    Ok(json!({ "group": group, "added": added }))
}

async fn delete_group(master: &Master, params: GroupParams) -> Result<Value, RpcError> {
    let deleted = master.delete_host_group(&params.group).await;
    Ok(json!({ "deleted": deleted }))
}

async fn info(master: &Master, params: JobIdParams) -> Result<Value, RpcError> {
    let info = master
        .scheduler
        .get_job_info(params.job_id)
        .await
        .map_err(|e| RpcError::internal(e.to_string()))?;
    serde_json::to_value(info).map_err(|e| RpcError::internal(e.to_string()))
}

async fn stat(master: &Master) -> Result<Value, RpcError> {
    let stats = master.scheduler.get_statistics().await;
    serde_json::to_value(stats).map_err(|e| RpcError::internal(e.to_string()))
}
