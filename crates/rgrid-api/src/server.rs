//! Admin JSON-RPC server over a framed TCP stream

use crate::codec::JsonRpcCodec;
use crate::commands;
use crate::rpc::{Request, Response, RpcError};
use futures::{SinkExt, StreamExt};
use rgrid_core::{Error, Master, Result};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tracing::{error, info, warn};

/// Bind the admin endpoint from the master's configuration and serve
pub async fn run(master: Arc<Master>) -> Result<()> {
    let addr = SocketAddr::from((
        master
            .config
            .server
            .host
            .parse::<std::net::IpAddr>()
            .map_err(|e| Error::Config(format!("Invalid host: {}", e)))?,
        master.config.server.admin_port,
    ));

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Network(e.to_string()))?;
    info!("admin endpoint listening on {}", addr);
    serve(master, listener).await
}

/// Accept loop over an already-bound listener
pub async fn serve(master: Arc<Master>, listener: TcpListener) -> Result<()> {
    loop {
        let (socket, peer) = listener
            .accept()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;
        info!(%peer, "admin connection accepted");
        let master = master.clone();
        tokio::spawn(async move {
            handle_session(master, socket, peer).await;
        });
    }
}

async fn handle_session(master: Arc<Master>, socket: TcpStream, peer: SocketAddr) {
    let mut framed = Framed::new(socket, JsonRpcCodec::new());

    while let Some(frame) = framed.next().await {
        let text = match frame {
            Ok(text) => text,
            Err(e) => {
                warn!(%peer, error = %e, "admin stream error");
                break;
            }
        };

        let response = process_request(&master, &text).await;
        let encoded = match serde_json::to_string(&response) {
            Ok(encoded) => encoded,
            Err(e) => {
                error!(%peer, error = %e, "failed to encode admin response");
                break;
            }
        };
        if let Err(e) = framed.send(encoded).await {
            warn!(%peer, error = %e, "failed to write admin response");
            break;
        }
    }
    info!(%peer, "admin connection closed");
}

/// Parse one request frame and produce its response envelope
pub async fn process_request(master: &Master, text: &str) -> Response {
    let request: Request = match serde_json::from_str(text) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "unparseable admin request");
            return Response::error(Value::Null, RpcError::parse_error());
        }
    };

    info!(method = %request.method, "admin request");
    match commands::handle(master, &request.method, request.params).await {
        Ok(result) => Response::result(request.id, result),
        Err(e) => Response::error(request.id, e),
    }
}
