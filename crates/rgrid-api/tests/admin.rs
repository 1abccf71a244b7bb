//! End-to-end admin protocol tests over a real TCP connection

use rgrid_core::{Config, Master};
use serde_json::{json, Value};
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

struct AdminClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    next_id: i64,
}

impl AdminClient {
    async fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, writer) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer,
            next_id: 1,
        }
    }

    async fn call(&mut self, method: &str, params: Value) -> Value {
        let id = self.next_id;
        self.next_id += 1;
        let request = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        self.send_raw(&request.to_string()).await
    }

    async fn send_raw(&mut self, text: &str) -> Value {
        self.writer.write_all(text.as_bytes()).await.unwrap();
        self.writer.flush().await.unwrap();
        let mut line = String::new();
        self.reader.read_line(&mut line).await.unwrap();
        serde_json::from_str(&line).unwrap()
    }
}

async fn start_admin() -> (Arc<Master>, AdminClient) {
    let mut config = Config::default();
    config.ping.enabled = false;

    let (master, _channels) = Master::start(config).await.unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(rgrid_api::serve(master.clone(), listener));

    let client = AdminClient::connect(addr).await;
    (master, client)
}

#[tokio::test]
async fn stat_and_host_management_round_trip() {
    let (_master, mut client) = start_admin().await;

    let response = client.call("stat", json!({})).await;
    assert_eq!(response["jsonrpc"], "2.0");
    assert_eq!(response["result"]["workers"]["total_workers"], 0);

    let response = client
        .call("add_hosts", json!({"hosts": ["batch", "w1", "batch", "w2"]}))
        .await;
    assert_eq!(response["result"]["added"], 2);

    let response = client.call("stat", json!({})).await;
    assert_eq!(response["result"]["workers"]["total_workers"], 2);

    let response = client.call("delete_hosts", json!({"hosts": ["w1"]})).await;
    assert_eq!(response["result"]["deleted"], 1);

    let response = client.call("delete_group", json!({"group": "batch"})).await;
    assert_eq!(response["result"]["deleted"], 1);

    let response = client.call("stat", json!({})).await;
    assert_eq!(response["result"]["workers"]["total_workers"], 0);
}

#[tokio::test]
async fn submit_info_and_stop_a_job() {
    let (_master, mut client) = start_admin().await;

    let mut file = tempfile::Builder::new().suffix(".job").tempfile().unwrap();
    write!(
        file,
        r#"{{"script": "/opt/jobs/etl.py", "priority": 3, "num_tasks": 2}}"#
    )
    .unwrap();

    let response = client
        .call("run", json!({"file": file.path().to_str().unwrap()}))
        .await;
    let job_id = response["result"]["job_ids"][0].as_i64().unwrap();

    // No workers are registered, so the job waits in the queue
    let response = client.call("info", json!({"job_id": job_id})).await;
    assert_eq!(response["result"]["state"], "queued");
    assert_eq!(response["result"]["num_tasks"], 2);

    let response = client.call("stop", json!({"job_id": job_id})).await;
    assert_eq!(response["result"]["stopped"], job_id);

    // Stopping it again is an internal error: the job is gone
    let response = client.call("stop", json!({"job_id": job_id})).await;
    assert_eq!(response["error"]["code"], -32603);
}

#[tokio::test]
async fn meta_submission_reports_all_job_ids() {
    let (_master, mut client) = start_admin().await;

    let mut file = tempfile::Builder::new().suffix(".meta").tempfile().unwrap();
    write!(
        file,
        r#"{{
            "jobs": [
                {{"name": "extract", "script": "/opt/jobs/extract.py"}},
                {{"name": "load", "script": "/opt/jobs/load.py"}}
            ],
            "depends": [["extract", "load"]]
        }}"#
    )
    .unwrap();

    let response = client
        .call("run", json!({"file": file.path().to_str().unwrap()}))
        .await;
    let ids = response["result"]["job_ids"].as_array().unwrap();
    assert_eq!(ids.len(), 2);

    let response = client
        .call("stop_group", json!({"group_id": 1}))
        .await;
    // The queued root plus the unreleased child
    assert_eq!(response["result"]["stopped"], 2);
}

#[tokio::test]
async fn add_group_reads_host_list_file() {
    let (master, mut client) = start_admin().await;

    let mut file = tempfile::Builder::new().tempfile().unwrap();
    write!(file, "# pool\nnode1\nnode2\n\nnode3\n").unwrap();

    let response = client
        .call("add_group", json!({"file": file.path().to_str().unwrap()}))
        .await;
    assert_eq!(response["result"]["added"], 3);

    let group = response["result"]["group"].as_str().unwrap().to_string();
    assert_eq!(master.registry.get_workers(Some(&group)).len(), 3);
}

#[tokio::test]
async fn protocol_errors_follow_jsonrpc_codes() {
    let (_master, mut client) = start_admin().await;

    // Unknown method
    let response = client.call("reboot_the_world", json!({})).await;
    assert_eq!(response["error"]["code"], -32601);

    // Missing params
    let response = client.call("stop", json!({})).await;
    assert_eq!(response["error"]["code"], -32602);

    // Unparseable request: error with null id
    let response = client.send_raw(r#"{"method": 7}"#).await;
    assert_eq!(response["error"]["code"], -32700);
    assert_eq!(response["id"], Value::Null);

    // Missing description file
    let response = client
        .call("run", json!({"file": "/nonexistent/path/x.job"}))
        .await;
    assert_eq!(response["error"]["code"], -32603);

    // Two requests in one write are framed and answered separately
    let response = client
        .send_raw(r#"{"jsonrpc":"2.0","id":90,"method":"stat","params":{}}{"jsonrpc":"2.0","id":91,"method":"stat","params":{}}"#)
        .await;
    assert_eq!(response["id"], 90);
    let mut line = String::new();
    client.reader.read_line(&mut line).await.unwrap();
    let second: Value = serde_json::from_str(&line).unwrap();
    assert_eq!(second["id"], 91);
}

#[tokio::test]
async fn stop_all_and_stop_prev_over_rpc() {
    let (_master, mut client) = start_admin().await;

    let mut file = tempfile::Builder::new().suffix(".job").tempfile().unwrap();
    write!(file, r#"{{"script": "/opt/jobs/a.py"}}"#).unwrap();
    client
        .call("run", json!({"file": file.path().to_str().unwrap()}))
        .await;

    // Nothing is executing, so stop_prev has nothing older to stop
    let response = client.call("stop_prev", json!({})).await;
    assert_eq!(response["result"]["stopped"], 0);

    let response = client.call("stop_all", json!({})).await;
    assert_eq!(response["result"]["stopped"], 1);
}
