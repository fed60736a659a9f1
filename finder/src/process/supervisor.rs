//! Process supervisor
//!
//! Launches every resolved service concurrently, waits for each one's first
//! stdout line, then watches ready services and restarts them within a
//! bounded budget. Failures stay local to their service.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;

use super::command::build_process_spec;
use super::status::{
    classify_exit, is_permanent_failure, ExitDisposition, RuntimeStatus, ServiceProcess,
    ServiceState, WARN_DEFINITION_MISSING, WARN_EXITED_NORMALLY, WARN_PERMANENT_FAILURE,
    WARN_RESTART_LIMIT,
};
use crate::config::{ResolvedService, RunMode, ServerDefinition};

/// Default wait for a service's first stdout line
pub const DEFAULT_READINESS_TIMEOUT: Duration = Duration::from_secs(1);

/// Default restarts per service
pub const DEFAULT_MAX_RESTARTS: u32 = 1;

/// SIGTERM grace before a kill on shutdown
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Grace for a process that closed stdout during start-up to finish exiting
const EARLY_EXIT_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub readiness_timeout: Duration,
    pub max_restarts: u32,
    /// Environment every launch starts from
    pub base_env: HashMap<String, String>,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            readiness_timeout: DEFAULT_READINESS_TIMEOUT,
            max_restarts: DEFAULT_MAX_RESTARTS,
            base_env: default_base_env(),
        }
    }
}

/// Current process environment, with unbuffered output for script-based servers
pub fn default_base_env() -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars().collect();
    env.entry("PYTHONUNBUFFERED".to_string())
        .or_insert_with(|| "1".to_string());
    env
}

enum Readiness {
    Ready,
    TimedOut,
    Exited,
}

/// Owns the launch inputs; statuses are handed back to the caller
pub struct Supervisor {
    definitions: BTreeMap<String, ServerDefinition>,
    resolved: BTreeMap<String, ResolvedService>,
    options: SupervisorOptions,
}

impl Supervisor {
    pub fn new(
        definitions: BTreeMap<String, ServerDefinition>,
        resolved: BTreeMap<String, ResolvedService>,
        options: SupervisorOptions,
    ) -> Self {
        Self {
            definitions,
            resolved,
            options,
        }
    }

    pub fn definition(&self, name: &str) -> Option<&ServerDefinition> {
        self.definitions.get(name)
    }

    // ========================================================================
    // Launch
    // ========================================================================

    /// Launch every resolved service at once and wait for all readiness checks
    pub async fn launch_all(&self) -> BTreeMap<String, RuntimeStatus> {
        let launches = self.resolved.keys().map(|name| async move {
            let status = self.launch(name).await;
            (name.clone(), status)
        });
        join_all(launches).await.into_iter().collect()
    }

    /// Build, spawn and wait for readiness of one service
    pub async fn launch(&self, name: &str) -> RuntimeStatus {
        let mode = self
            .resolved
            .get(name)
            .map_or(RunMode::Fallback, |decision| decision.selected_mode);
        let mut status = RuntimeStatus::new(name, mode);

        let Some(definition) = self.definitions.get(name) else {
            tracing::warn!("{}: {}", name, WARN_DEFINITION_MISSING);
            status.fail_start(
                Some(WARN_DEFINITION_MISSING.to_string()),
                WARN_DEFINITION_MISSING.to_string(),
            );
            return status;
        };

        let spec = match build_process_spec(definition, mode, &self.options.base_env) {
            Ok(spec) => spec,
            Err(e) => {
                tracing::error!("{}: {}", name, e);
                status.fail_start(None, e.to_string());
                return status;
            }
        };

        status.state = ServiceState::Starting;
        status.command = Some(spec.argv.clone());
        tracing::info!("Starting {} ({} mode): {}", name, mode, spec.argv.join(" "));

        let mut process = match ServiceProcess::spawn(&spec) {
            Ok(process) => process,
            Err(e) => {
                let warning = format!("start failed: {}", e);
                tracing::warn!("{}: {}", name, warning);
                status.fail_start(Some(warning), e.to_string());
                return status;
            }
        };

        match self.await_readiness(name, &mut process).await {
            Readiness::Ready => {
                tracing::info!("{}: ready (pid {:?})", name, process.pid());
                status.process = Some(process);
                status.ready = true;
                status.state = ServiceState::Ready;
            }
            Readiness::TimedOut => {
                let warning = format!(
                    "readiness timeout after {:.1}s",
                    self.options.readiness_timeout.as_secs_f64()
                );
                tracing::warn!("{}: {}", name, warning);
                status.fail_start(Some(warning.clone()), warning);
                // Still running; a late starter keeps its handle
                status.process = Some(process);
            }
            Readiness::Exited => {
                let code = process.reap(EARLY_EXIT_GRACE).await;
                let stderr = process.read_stderr().await;
                let warning = if is_permanent_failure(&stderr) {
                    WARN_PERMANENT_FAILURE.to_string()
                } else {
                    match code {
                        Some(code) => format!("start failed: exit code {}", code),
                        None => "start failed".to_string(),
                    }
                };
                tracing::warn!("{}: {}", name, warning);
                if !stderr.trim().is_empty() {
                    tracing::debug!("{} stderr: {}", name, stderr.trim());
                }
                status.fail_start(Some(warning.clone()), warning);
            }
        }

        status
    }

    async fn await_readiness(&self, name: &str, process: &mut ServiceProcess) -> Readiness {
        match tokio::time::timeout(self.options.readiness_timeout, process.first_line()).await {
            Err(_) => Readiness::TimedOut,
            Ok(Ok(Some(line))) => {
                tracing::debug!("{}: first line: {}", name, line.trim_end());
                Readiness::Ready
            }
            Ok(Ok(None)) => Readiness::Exited,
            Ok(Err(e)) => {
                tracing::warn!("{}: failed to read stdout: {}", name, e);
                Readiness::Exited
            }
        }
    }

    // ========================================================================
    // Monitoring
    // ========================================================================

    /// Watch every ready service until it stops for good, or until `stop_after`
    ///
    /// On the deadline the watches stop observing; processes keep running and
    /// a relaunch already underway completes.
    pub async fn monitor(
        &self,
        statuses: &mut BTreeMap<String, RuntimeStatus>,
        stop_after: Option<Duration>,
    ) {
        let token = CancellationToken::new();
        let watches: Vec<_> = statuses
            .values_mut()
            .filter(|status| status.ready && status.process.is_some())
            .map(|status| self.watch(status, token.clone()))
            .collect();

        if watches.is_empty() {
            return;
        }

        let all = join_all(watches);
        let Some(limit) = stop_after else {
            all.await;
            return;
        };

        tokio::pin!(all);
        tokio::select! {
            _ = &mut all => {}
            _ = tokio::time::sleep(limit) => {
                tracing::info!("Monitoring stopped after {:.1}s", limit.as_secs_f64());
                token.cancel();
                all.await;
            }
        }
    }

    async fn watch(&self, status: &mut RuntimeStatus, token: CancellationToken) {
        loop {
            let Some(process) = status.process.as_mut() else {
                return;
            };

            let exit = tokio::select! {
                _ = token.cancelled() => return,
                exit = process.wait() => exit,
            };

            let code = match exit {
                Ok(exit_status) => exit_status.code(),
                Err(e) => {
                    tracing::warn!("{}: failed to wait for exit: {}", status.name, e);
                    None
                }
            };
            let stderr = process.read_stderr().await;

            match classify_exit(code, &stderr, status.restart_count, self.options.max_restarts) {
                ExitDisposition::Clean => {
                    tracing::info!("{}: exited normally", status.name);
                    let warning = status
                        .warning
                        .clone()
                        .unwrap_or_else(|| WARN_EXITED_NORMALLY.to_string());
                    status.mark_stopped(&warning);
                    return;
                }
                ExitDisposition::PermanentFailure => {
                    tracing::warn!("{}: {}", status.name, WARN_PERMANENT_FAILURE);
                    status.mark_stopped(WARN_PERMANENT_FAILURE);
                    return;
                }
                ExitDisposition::RestartLimit => {
                    tracing::warn!(
                        "{}: exit code {:?}, {}",
                        status.name,
                        code,
                        WARN_RESTART_LIMIT
                    );
                    status.mark_stopped(WARN_RESTART_LIMIT);
                    return;
                }
                ExitDisposition::Restart => {
                    status.restart_count += 1;
                    status.state = ServiceState::Restarting;
                    tracing::warn!(
                        "{}: exit code {:?}, restart attempt #{}",
                        status.name,
                        code,
                        status.restart_count
                    );

                    let replacement = self.launch(&status.name).await;
                    status.replace_with(replacement);
                }
            }
        }
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Terminate every live process and clear its handle
    pub async fn shutdown(&self, statuses: &mut BTreeMap<String, RuntimeStatus>) {
        let stops = statuses.values_mut().map(|status| async move {
            if let Some(mut process) = status.process.take() {
                tracing::debug!("Stopping {} (pid {:?})", status.name, process.pid());
                process.terminate(SHUTDOWN_GRACE).await;
                status.ready = false;
                status.state = ServiceState::Stopped;
            }
        });
        join_all(stops).await;
    }
}
