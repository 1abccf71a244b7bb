//! Admin front-end for the rgrid master
//!
//! JSON-RPC 2.0 over a TCP stream. Requests are bare JSON objects framed
//! by brace balance; responses are one JSON document per line and always
//! carry `jsonrpc`, `id`, and either `result` or `error`.

pub mod codec;
pub mod commands;
pub mod rpc;
pub mod server;

pub use codec::JsonRpcCodec;
pub use rpc::{Request, Response, RpcError};
pub use server::{run, serve};
