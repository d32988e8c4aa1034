//! Reference worker for the sidecar protocol.
//!
//! Methods:
//! - `echo`: returns `params` unchanged
//! - `progress`: `{"steps": n, "delay_ms": d}` emits n progress notifications
//! - `fail`: `{"message": m}` answers with `error: m`
//! - `sleep`: `{"ms": n}` waits, then returns `n`
//! - `log`: `{"message": m}` emits a log notification, returns `null`
//! - `exit`: `{"code": n}` terminates the process without answering

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use serde::Deserialize;
use serde_json::{Value, json};
use sidecar_rpc::{RequestContext, RequestHandler, init_tracing, serve_stdio};

#[derive(Deserialize)]
struct ProgressParams {
    steps: u32,
    #[serde(default)]
    delay_ms: u64,
}

#[derive(Deserialize)]
struct MessageParams {
    message: String,
}

#[derive(Deserialize)]
struct SleepParams {
    ms: u64,
}

#[derive(Deserialize)]
struct ExitParams {
    #[serde(default)]
    code: i32,
}

fn parse<T: serde::de::DeserializeOwned>(method: &str, params: Value) -> anyhow::Result<T> {
    serde_json::from_value(params).with_context(|| format!("invalid params for `{method}`"))
}

struct EchoHandler;

#[async_trait::async_trait]
impl RequestHandler for EchoHandler {
    async fn handle(
        &self,
        method: &str,
        params: Value,
        ctx: RequestContext,
    ) -> anyhow::Result<Value> {
        match method {
            "echo" => Ok(params),
            "progress" => {
                let ProgressParams { steps, delay_ms } = parse(method, params)?;
                for step in 1..=steps {
                    ctx.progress(format!("step {step}/{steps}"), f64::from(step) / f64::from(steps));
                    if delay_ms > 0 {
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    }
                }
                Ok(json!({ "steps": steps }))
            }
            "fail" => {
                let MessageParams { message } = parse(method, params)?;
                bail!(message)
            }
            "sleep" => {
                let SleepParams { ms } = parse(method, params)?;
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!(ms))
            }
            "log" => {
                let MessageParams { message } = parse(method, params)?;
                tracing::debug!(request_id = %ctx.id(), "Forwarding log line");
                ctx.log(message);
                Ok(Value::Null)
            }
            "exit" => {
                let ExitParams { code } = parse(method, params)?;
                tracing::info!(code, "Exiting on request");
                std::process::exit(code)
            }
            other => bail!("unknown method: {other}"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    tracing::info!(pid = std::process::id(), "sidecar-echo ready");
    serve_stdio(Arc::new(EchoHandler)).await?;
    tracing::info!("Input closed, exiting");
    Ok(())
}
