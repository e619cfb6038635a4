//! Disposable server processes for end-to-end tests.
//!
//! Spawns a real server binary (`redis-server` unless overridden through
//! `KVLINK_TEST_SERVER`) on a scratch directory that disappears with the
//! process. Live tests are expected to gate themselves with `#[ignore]`
//! and skip when no binary is installed.

use std::process::Stdio;
use std::time::Duration;

use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::error::{ClientError, Result};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Environment variable naming the server binary to spawn.
pub const SERVER_ENV: &str = "KVLINK_TEST_SERVER";

fn server_binary() -> String {
    std::env::var(SERVER_ENV).unwrap_or_else(|_| "redis-server".to_string())
}

/// One spawned server. The process is killed and its scratch directory
/// removed on drop; [`shutdown`](ServerProcess::shutdown) does the same
/// but waits for the process to actually exit.
#[derive(Debug)]
pub struct ServerProcess {
    child: Child,
    addr: String,
    port: u16,
    _dir: TempDir,
}

impl ServerProcess {
    /// Spawn a standalone server on `port`.
    pub fn spawn(port: u16) -> Result<Self> {
        Self::spawn_with(&server_binary(), port, false)
    }

    /// Spawn a cluster-enabled node on `port`. Forming the cluster
    /// (MEET, slot assignment) is the test's job.
    pub fn spawn_cluster_node(port: u16) -> Result<Self> {
        Self::spawn_with(&server_binary(), port, true)
    }

    /// Spawn `binary` on `port`, optionally cluster-enabled.
    pub fn spawn_with(binary: &str, port: u16, cluster: bool) -> Result<Self> {
        let dir = TempDir::new()?;
        let mut command = Command::new(binary);
        command
            .arg("--port")
            .arg(port.to_string())
            .arg("--dir")
            .arg(dir.path())
            .arg("--save")
            .arg("")
            .arg("--appendonly")
            .arg("no")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if cluster {
            command
                .arg("--cluster-enabled")
                .arg("yes")
                .arg("--cluster-config-file")
                .arg("nodes.conf");
        }
        let child = command.spawn()?;
        let addr = format!("127.0.0.1:{port}");
        debug!(addr = %addr, binary = %binary, cluster, "spawned test server");
        Ok(Self {
            child,
            addr,
            port,
            _dir: dir,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Poll until the server accepts a TCP connection or the deadline
    /// passes.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            match TcpStream::connect(&self.addr).await {
                Ok(_) => return Ok(()),
                Err(e) if Instant::now() >= deadline => {
                    return Err(ClientError::Connect {
                        addr: self.addr.clone(),
                        source: e,
                    });
                }
                Err(_) => sleep(READY_POLL_INTERVAL).await,
            }
        }
    }

    /// Kill the process and wait for it to exit.
    pub async fn shutdown(mut self) -> Result<()> {
        self.child.start_kill()?;
        self.child.wait().await?;
        debug!(addr = %self.addr, "test server stopped");
        Ok(())
    }
}
