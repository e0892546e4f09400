//! Supervision of the backend process.

use crate::config::RunConfig;
use crate::error::ProxyError;
use crate::gate::Runner;
use log::{debug, error, info, warn};
use std::process::{Child, Command, Stdio};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

#[derive(Default)]
struct RunnerState {
    child: Option<Child>,
    /// Set after a successful rebuild: the running process is outdated
    stale: bool,
}

/// Starts the backend on demand and restarts it when it exited or was
/// invalidated by a rebuild.
pub struct ProcessRunner {
    config: RunConfig,
    backend_port: Option<u16>,
    state: Mutex<RunnerState>,
}

impl ProcessRunner {
    pub fn new(config: RunConfig) -> Self {
        Self {
            config,
            backend_port: None,
            state: Mutex::new(RunnerState::default()),
        }
    }

    /// Port exported to the backend as `PORT`, so it listens where the proxy forwards.
    pub fn with_backend_port(mut self, port: u16) -> Self {
        self.backend_port = Some(port);
        self
    }

    fn lock(&self) -> MutexGuard<'_, RunnerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mark the running backend as outdated; the next `run` restarts it.
    pub fn invalidate(&self) {
        self.lock().stale = true;
    }

    pub fn is_running(&self) -> bool {
        match self.lock().child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.lock().child.as_ref().map(Child::id)
    }

    pub fn kill(&self) {
        Self::stop(&mut self.lock());
    }

    fn stop(state: &mut RunnerState) {
        if let Some(mut child) = state.child.take() {
            let pid = child.id();
            if let Err(e) = child.kill() {
                debug!("Backend {} already gone: {}", pid, e);
            }
            // Reap so the process does not linger as a zombie
            let _ = child.wait();
            info!("Backend stopped (pid {})", pid);
        }
    }

    fn spawn(&self) -> Result<Child, ProxyError> {
        let mut command = Command::new(&self.config.command);
        command
            .args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::null());
        if let Some(port) = self.backend_port {
            command.env("PORT", port.to_string());
        }
        if let Some(dir) = &self.config.dir {
            command.current_dir(dir);
        }

        command
            .spawn()
            .map_err(|e| ProxyError::Process(format!("Failed to start {}: {}", self.config.command, e)))
    }
}

impl Runner for ProcessRunner {
    /// Holds the lock for the whole attempt, settle pause included, so
    /// concurrent callers wait for one start instead of racing to spawn.
    fn run(&self) {
        let mut state = self.lock();

        let needs_start = match state.child.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(None) => state.stale,
                Ok(Some(status)) => {
                    warn!("Backend exited with {}", status);
                    true
                }
                Err(e) => {
                    warn!("Could not query backend status: {}", e);
                    true
                }
            },
            None => true,
        };
        if !needs_start {
            return;
        }

        Self::stop(&mut state);
        match self.spawn() {
            Ok(child) => {
                info!("Backend started (pid {}): {}", child.id(), self.config.command);
                state.child = Some(child);
                state.stale = false;
                std::thread::sleep(Duration::from_millis(self.config.settle_ms));
            }
            Err(e) => error!("{}", e),
        }
    }
}

impl Drop for ProcessRunner {
    fn drop(&mut self) {
        self.kill();
    }
}
