//! Minimal plugin binary.
//!
//! Serves one service, named by the first argument (default `echo`), with methods:
//!
//! - `Echo`: returns the request payload
//! - `Metadata`: returns the request metadata and extracted traceparent as JSON
//! - `Sleep`: sleeps for the number of milliseconds in the payload
//! - `Fill`: returns as many zero bytes as the payload asks for
//! - `Startup`: returns the startup config received from the host as JSON
//! - `Panic`: panics inside the handler
//! - `Exit`: terminates the process with status 3

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use plugin_host::plugin::HANDSHAKE;
use plugin_host::rpc::{PluginServer, RequestContext, ServiceHandler, Status};

struct Echo;

#[async_trait]
impl ServiceHandler for Echo {
    async fn call(&self, ctx: RequestContext, method: &str, payload: Bytes) -> Result<Bytes, Status> {
        match method {
            "Echo" => Ok(payload),
            "Metadata" => {
                let body = serde_json::json!({
                    "metadata": ctx.metadata,
                    "traceparent": ctx.trace.map(|t| t.to_traceparent()),
                });
                serde_json::to_vec(&body)
                    .map(Bytes::from)
                    .map_err(|e| Status::internal(e.to_string()))
            }
            "Sleep" => {
                let millis: u64 = parse_number(&payload)
                    .ok_or_else(|| Status::invalid_argument("Sleep expects a number of milliseconds"))?;
                tokio::time::sleep(Duration::from_millis(millis)).await;
                Ok(payload)
            }
            "Fill" => {
                let len: usize =
                    parse_number(&payload).ok_or_else(|| Status::invalid_argument("Fill expects a byte count"))?;
                Ok(Bytes::from(vec![0u8; len]))
            }
            "Startup" => serde_json::to_vec(&*ctx.startup)
                .map(Bytes::from)
                .map_err(|e| Status::internal(e.to_string())),
            "Panic" => panic!("echo plugin was asked to panic"),
            "Exit" => std::process::exit(3),
            other => Err(Status::unimplemented(format!("unknown method '{other}'"))),
        }
    }
}

fn parse_number<T: std::str::FromStr>(payload: &[u8]) -> Option<T> {
    std::str::from_utf8(payload).ok()?.trim().parse().ok()
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let service = std::env::args().nth(1).unwrap_or_else(|| "echo".to_string());
    let server = PluginServer::new(HANDSHAKE).register(service, Echo);

    if let Err(e) = server.serve().await {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
