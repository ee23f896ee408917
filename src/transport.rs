//! Ready-made stream pairs: this process's stdio, or a spawned child's.

use log::{debug, warn};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::time::{timeout, Duration};

use crate::agent::Agent;
use crate::connection::Connection;
use crate::error::{RpcError, RpcResult};

/// How long [`ChildConnection::shutdown`] waits for the child to exit
const CHILD_EXIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection to a spawned child process over its stdin/stdout
pub struct ChildConnection {
    pub connection: Arc<Connection>,
    child: Child,
}

impl ChildConnection {
    pub fn child_id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Close the connection (the child sees EOF on stdin), then wait for the
    /// child to exit, killing it if it takes too long
    pub async fn shutdown(mut self) -> RpcResult<Option<ExitStatus>> {
        debug!("Shutting down child connection {}", self.connection.name());
        self.connection.close().await;

        match timeout(CHILD_EXIT_TIMEOUT, self.child.wait()).await {
            Ok(status) => {
                let status = status?;
                debug!("Process exited with status: {:?}", status);
                Ok(Some(status))
            }
            Err(_) => {
                warn!("Process didn't exit gracefully, killing");
                self.child.kill().await?;
                Ok(None)
            }
        }
    }
}

fn missing_pipe(name: &str) -> RpcError {
    RpcError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("Child process {} not available", name),
    ))
}

async fn forward_stderr(name: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    warn!("{} stderr: {}", name, trimmed);
                }
            }
            Ok(None) => {
                debug!("{} stderr EOF", name);
                break;
            }
            Err(e) => {
                debug!("{} stderr read failed: {}", name, e);
                break;
            }
        }
    }
}

impl Agent {
    /// Serve this process's stdin/stdout
    pub fn connect_stdio(&self) -> Arc<Connection> {
        self.connect(tokio::io::stdin(), tokio::io::stdout(), "stdio")
    }

    /// Spawn `program` and connect to it over its stdin/stdout. Its stderr
    /// is forwarded to the log.
    pub fn spawn_process(&self, program: &str, args: &[String]) -> RpcResult<ChildConnection> {
        debug!("Spawning process: {} {:?}", program, args);

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing_pipe("stderr"))?;

        tokio::spawn(forward_stderr(program.to_string(), stderr));
        let connection = self.connect(stdout, stdin, program);

        Ok(ChildConnection { connection, child })
    }
}
