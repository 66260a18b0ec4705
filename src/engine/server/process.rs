//! `llama-server` child process supervision
//!
//! Spawns the server, forwards its output to `tracing`, waits for the health
//! endpoint and shuts the process down again. Dropping a [`ServerProcess`]
//! that is still running sends SIGTERM (Unix) or a kill request elsewhere.

use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

use crate::engine::server::client::LlamaServerClient;
use crate::error::{LlamaChatError, Result};

const RECENT_LINES: usize = 20;
const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(250);

type RecentLines = Arc<Mutex<VecDeque<String>>>;

/// A running `llama-server` process
#[derive(Debug)]
pub struct ServerProcess {
    child: Child,
    recent: RecentLines,
}

impl ServerProcess {
    /// Spawn `binary` with `args`
    ///
    /// # Errors
    ///
    /// Returns [`LlamaChatError::ContextInit`] if the executable cannot be
    /// started.
    pub fn spawn(binary: &Path, args: &[String]) -> Result<Self> {
        tracing::debug!("spawning {} {}", binary.display(), args.join(" "));

        let mut child = Command::new(binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                LlamaChatError::ContextInit(format!(
                    "failed to start `{}`: {}",
                    binary.display(),
                    e
                ))
            })?;

        let recent: RecentLines = Arc::new(Mutex::new(VecDeque::with_capacity(RECENT_LINES)));
        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, Arc::clone(&recent));
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, Arc::clone(&recent));
        }

        Ok(Self { child, recent })
    }

    /// OS process id, if the process has not been reaped yet
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Wait until the server answers its health check
    ///
    /// Fails if the process exits first or `timeout` elapses. The error
    /// includes the last lines the server printed.
    pub async fn wait_ready(&mut self, client: &LlamaServerClient, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if let Some(status) = self.child.try_wait()? {
                return Err(LlamaChatError::ContextInit(format!(
                    "llama-server exited with {}: {}",
                    status,
                    self.recent_output()
                ))
                .into());
            }

            if client.health().await {
                tracing::debug!("llama-server ready at {}", client.base_url());
                return Ok(());
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(LlamaChatError::ContextInit(format!(
                    "llama-server did not become ready within {}s: {}",
                    timeout.as_secs(),
                    self.recent_output()
                ))
                .into());
            }

            tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
        }
    }

    /// Last lines the server wrote, joined with `" | "`
    pub fn recent_output(&self) -> String {
        let recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        if recent.is_empty() {
            "no output".to_string()
        } else {
            recent.iter().cloned().collect::<Vec<_>>().join(" | ")
        }
    }

    /// Stop the server: SIGTERM, then kill after `grace`
    pub async fn terminate(&mut self, grace: Duration) -> Result<()> {
        if self.child.try_wait()?.is_some() {
            return Ok(());
        }

        send_sigterm(&mut self.child);

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => {
                tracing::debug!("llama-server exited with {}", status?);
            }
            Err(_) => {
                tracing::warn!(
                    "llama-server ignored SIGTERM for {}s, killing it",
                    grace.as_secs()
                );
                self.child.kill().await?;
            }
        }
        Ok(())
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        if self.child.id().is_some() {
            send_sigterm(&mut self.child);
        }
    }
}

#[cfg(unix)]
fn send_sigterm(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: pid comes from a live tokio::process::Child that has not been reaped.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn send_sigterm(child: &mut Child) {
    let _ = child.start_kill();
}

fn forward_output<R>(reader: R, recent: RecentLines)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(target: "llamachat::engine::server", "llama-server: {}", line);
            let mut recent = recent.lock().unwrap_or_else(|e| e.into_inner());
            if recent.len() == RECENT_LINES {
                recent.pop_front();
            }
            recent.push_back(line);
        }
    });
}

/// Ask the OS for a free TCP port on `host`
pub fn free_port(host: &str) -> Result<u16> {
    let listener = std::net::TcpListener::bind((host, 0))?;
    Ok(listener.local_addr()?.port())
}
