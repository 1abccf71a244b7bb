//! Thin JSON-RPC client for the admin endpoint

use anyhow::Context;
use colored::Colorize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

/// Send one request to a running master and return the response envelope
pub async fn call(master_addr: &str, method: &str, params: Value) -> anyhow::Result<Value> {
    let stream = TcpStream::connect(master_addr)
        .await
        .with_context(|| format!("couldn't connect to master at {}", master_addr))?;
    let (read_half, mut write_half) = stream.into_split();

    let request = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": method,
        "params": params,
    });
    write_half.write_all(request.to_string().as_bytes()).await?;
    write_half.flush().await?;

    let mut line = String::new();
    BufReader::new(read_half)
        .read_line(&mut line)
        .await
        .context("master closed the connection")?;
    let response: Value =
        serde_json::from_str(&line).context("master sent an unparseable response")?;
    Ok(response)
}

/// Print a response envelope; errors go to stderr and set the exit status
pub fn print_response(response: &Value) -> anyhow::Result<()> {
    if let Some(error) = response.get("error") {
        let code = error["code"].as_i64().unwrap_or(0);
        let message = error["message"].as_str().unwrap_or("unknown error");
        eprintln!("{} [{}] {}", "error".red().bold(), code, message);
        anyhow::bail!("admin command failed");
    }

    let result = response.get("result").cloned().unwrap_or(Value::Null);
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
