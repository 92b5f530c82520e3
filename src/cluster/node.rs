//! Handle to a single node process: spawn/stop, readiness wait, named
//! maintenance commands, log searching, and filesystem accessors.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout, Instant};

use crate::config::NodeConfig;
use crate::error::{CuttleError, Result};
use crate::mgmt::{MgmtClient, STORAGE_SERVICE_BEAN};

pub struct NodeHandle {
    config: NodeConfig,
    binary: PathBuf,
    startup_timeout: Duration,
    child: Option<Child>,
}

impl NodeHandle {
    pub fn new(config: NodeConfig, binary: PathBuf, startup_timeout: Duration) -> Self {
        Self {
            config,
            binary,
            startup_timeout,
            child: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn path(&self) -> &Path {
        &self.config.node_dir
    }

    pub fn datadir_count(&self) -> usize {
        self.config.datadir_count
    }

    pub fn datadirs(&self) -> Vec<PathBuf> {
        (0..self.config.datadir_count)
            .map(|i| self.config.datadir(i))
            .collect()
    }

    pub fn native_addr(&self) -> std::net::SocketAddr {
        self.config.native_addr
    }

    pub fn mgmt_addr(&self) -> std::net::SocketAddr {
        self.config.mgmt_addr
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut NodeConfig {
        &mut self.config
    }

    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Spawn the node process. The current config is written to the node's
    /// conf directory first, so config edits (e.g. a version bump) take
    /// effect on the next start.
    pub fn start(&mut self) -> Result<()> {
        if self.child.is_some() {
            return Err(CuttleError::Process(format!(
                "{} is already running",
                self.config.name
            )));
        }
        let config_path = self.config.config_file();
        self.config.store(&config_path)?;

        let logs_dir = self.config.node_dir.join("logs");
        std::fs::create_dir_all(&logs_dir)?;
        let stderr_file = std::fs::File::create(logs_dir.join("stderr.log"))?;

        let child = Command::new(&self.binary)
            .arg("--config")
            .arg(&config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr_file))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                CuttleError::Process(format!("spawning {}: {e}", self.binary.display()))
            })?;

        tracing::info!(node = %self.config.name, pid = ?child.id(), "node process started");
        self.child = Some(child);
        Ok(())
    }

    /// Block until the node accepts client connections and reports
    /// operation mode NORMAL. A bootstrapping node only passes this once
    /// streaming has finished, since it opens its native port last.
    pub async fn wait_for_native_proto(&self) -> Result<()> {
        let deadline = Instant::now() + self.startup_timeout;
        let mgmt = MgmtClient::attach(self.config.mgmt_addr);
        loop {
            if Instant::now() > deadline {
                return Err(CuttleError::Timeout(format!(
                    "{} did not become ready within {:?}",
                    self.config.name, self.startup_timeout
                )));
            }
            let probe = timeout(
                Duration::from_secs(2),
                TcpStream::connect(self.config.native_addr),
            )
            .await;
            if let Ok(Ok(_)) = probe {
                match mgmt
                    .read_attribute(STORAGE_SERVICE_BEAN, "OperationMode")
                    .await
                {
                    Ok(mode) if mode == "NORMAL" => return Ok(()),
                    Ok(mode) => {
                        tracing::debug!(node = %self.config.name, %mode, "waiting for NORMAL")
                    }
                    Err(e) => tracing::debug!(node = %self.config.name, "mgmt probe failed: {e}"),
                }
            }
            sleep(Duration::from_millis(100)).await;
        }
    }

    /// Invoke a named maintenance subcommand with string arguments.
    pub async fn admin(&self, command: &str, args: &[&str]) -> Result<String> {
        self.mgmt().tool(command, args).await
    }

    /// Attach a management client to this node.
    pub fn mgmt(&self) -> MgmtClient {
        MgmtClient::attach(self.config.mgmt_addr)
    }

    /// Kill the node process and reap it.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill().await;
            let _ = child.wait().await;
            tracing::info!(node = %self.config.name, "node process stopped");
        }
        Ok(())
    }

    /// Wait for the process to exit on its own (e.g. after decommission).
    pub async fn wait_exit(&mut self, limit: Duration) -> Result<()> {
        if let Some(mut child) = self.child.take() {
            match timeout(limit, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::info!(node = %self.config.name, %status, "node process exited");
                    Ok(())
                }
                Ok(Err(e)) => Err(e.into()),
                Err(_) => {
                    let _ = child.kill().await;
                    Err(CuttleError::Timeout(format!(
                        "{} did not exit within {limit:?}",
                        self.config.name
                    )))
                }
            }
        } else {
            Ok(())
        }
    }

    /// Drain, stop, and restart the node advertising a new release version.
    /// This is one step of a rolling upgrade.
    pub async fn drain_and_restart_as(&mut self, version: &str) -> Result<()> {
        self.admin("drain", &[]).await?;
        self.stop().await?;
        self.config.version = version.to_string();
        self.start()?;
        self.wait_for_native_proto().await
    }

    /// Lines of the node's log containing the given substring.
    pub fn grep_log(&self, pattern: &str) -> Result<Vec<String>> {
        let log_path = self.config.log_file();
        if !log_path.exists() {
            return Ok(Vec::new());
        }
        let contents = std::fs::read_to_string(&log_path)?;
        Ok(contents
            .lines()
            .filter(|line| line.contains(pattern))
            .map(|line| line.to_string())
            .collect())
    }

    /// ERROR-level lines in the node's log.
    pub fn error_log_lines(&self) -> Result<Vec<String>> {
        self.grep_log("ERROR")
    }
}
