//! tether - JSON-RPC 2.0 peer
//!
//! Command-line usage:
//!   tether serve                         - Serve demo methods on stdin/stdout
//!   tether call -p PEER METHOD [PARAMS]  - Spawn PEER and call METHOD on it

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tether::{
    handler_fn, typed_handler, Agent, AgentBuilder, AgentConfig, ExecutionMode, HandlerError,
    ParamShape, ValueKind,
};

/// tether - bidirectional JSON-RPC 2.0 peer
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Agent config file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve echo/ping/add/sleep on stdin/stdout
    Serve {
        /// Override the worker pool size
        #[arg(long)]
        pool_workers: Option<usize>,
    },
    /// Spawn a peer process and call one method on it
    Call {
        /// Peer program to spawn
        #[arg(short, long)]
        program: String,

        /// Argument for the peer program (repeatable)
        #[arg(long = "arg")]
        args: Vec<String>,

        /// Method name
        method: String,

        /// Parameters as JSON (array or object)
        #[arg(default_value = "[]")]
        params: String,

        /// Send as a notification and don't wait for a result
        #[arg(long)]
        notify: bool,

        /// Give up waiting after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

#[derive(Debug, Deserialize)]
struct LogParams {
    message: String,
    #[serde(default)]
    level: Option<String>,
}

fn load_config(path: Option<&PathBuf>) -> Result<AgentConfig> {
    match path {
        Some(path) => AgentConfig::from_file(path),
        None => Ok(AgentConfig::default()),
    }
}

fn register_demo_methods(agent: &Agent) {
    agent.register_request_handler(
        "echo",
        handler_fn(|_ctx, params| async move { Ok::<_, HandlerError>(params.into_value()) }),
        ExecutionMode::Inline,
    );

    agent.register_request_handler(
        "ping",
        handler_fn(|_ctx, _params| async { Ok::<_, HandlerError>(Value::from("pong")) }),
        ExecutionMode::Inline,
    );

    agent.register_request_handler(
        "add",
        typed_handler(|_ctx, (a, b): (f64, f64)| async move { Ok::<_, HandlerError>(a + b) }),
        ExecutionMode::Inline,
    );
    agent.register_request_signature(
        "add",
        ParamShape::positional()
            .arg(ValueKind::Number)
            .arg(ValueKind::Number),
        ValueKind::Number,
    );

    // プールで実行されるので他のリクエストを止めない
    agent.register_request_handler(
        "sleep",
        typed_handler(|_ctx, (ms,): (u64,)| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok::<_, HandlerError>(ms)
        }),
        ExecutionMode::Pooled,
    );
    agent.register_request_signature(
        "sleep",
        ParamShape::positional().arg(ValueKind::Integer),
        ValueKind::Integer,
    );

    agent.register_notification_inducer("log", |connection, params: LogParams| async move {
        match params.level.as_deref() {
            Some("warn") | Some("error") => warn!("[{}] {}", connection.name(), params.message),
            _ => info!("[{}] {}", connection.name(), params.message),
        }
    });
}

async fn serve(config: AgentConfig, pool_workers: Option<usize>) -> Result<()> {
    let mut builder = AgentBuilder::from_config(config);
    if let Some(workers) = pool_workers {
        builder = builder.max_pool_workers(workers);
    }
    let agent = builder.build();
    register_demo_methods(&agent);

    info!("Serving {:?} on stdio", agent.registry().request_methods());
    let connection = agent.connect_stdio();
    connection.closed().await;

    match connection.disconnect_reason() {
        Some(reason) => info!("Connection finished: {}", reason),
        None => debug!("Connection finished"),
    }
    Ok(())
}

struct CallArgs {
    program: String,
    args: Vec<String>,
    method: String,
    params: String,
    notify: bool,
}

async fn call(config: AgentConfig, call: CallArgs) -> Result<()> {
    let params: Value = serde_json::from_str(&call.params)
        .with_context(|| format!("params must be JSON: {}", call.params))?;

    let agent = Agent::new(config);
    let child = agent
        .spawn_process(&call.program, &call.args)
        .with_context(|| format!("failed to spawn {}", call.program))?;

    let outcome = if call.notify {
        child.connection.notify(&call.method, params).await.map(|_| None)
    } else {
        child
            .connection
            .call::<Value>(&call.method, params)
            .await
            .map(Some)
    };

    child.shutdown().await?;

    if let Some(result) = outcome.with_context(|| format!("{} failed", call.method))? {
        println!("{}", serde_json::to_string_pretty(&result)?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_ref())?;

    match cli.command {
        Command::Serve { pool_workers } => serve(config, pool_workers).await,
        Command::Call {
            program,
            args,
            method,
            params,
            notify,
            timeout_ms,
        } => {
            if timeout_ms.is_some() {
                config.call_timeout_ms = timeout_ms;
            }
            call(
                config,
                CallArgs {
                    program,
                    args,
                    method,
                    params,
                    notify,
                },
            )
            .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_call_arguments_parse() {
        let cli = Cli::parse_from([
            "tether", "call", "-p", "peer", "--arg", "serve", "add", "[1, 2]", "--timeout-ms", "500",
        ]);
        match cli.command {
            Command::Call {
                program,
                args,
                method,
                params,
                notify,
                timeout_ms,
            } => {
                assert_eq!(program, "peer");
                assert_eq!(args, vec!["serve".to_string()]);
                assert_eq!(method, "add");
                assert_eq!(params, "[1, 2]");
                assert!(!notify);
                assert_eq!(timeout_ms, Some(500));
            }
            _ => panic!("expected call"),
        }
    }
}
