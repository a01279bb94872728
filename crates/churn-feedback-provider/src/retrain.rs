use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use churn_feedback_core::{RetrainInvoker, TriggerDisposition};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrainCommand {
    pub program: String,
    pub args: Vec<String>,
    pub workdir: Option<PathBuf>,
}

impl Default for RetrainCommand {
    fn default() -> Self {
        Self {
            program: "python".to_string(),
            args: vec!["retrain_with_rl.py".to_string()],
            workdir: None,
        }
    }
}

impl RetrainCommand {
    fn spawn(&self) -> std::io::Result<Child> {
        let mut command = Command::new(&self.program);
        command.args(&self.args).stdin(Stdio::null());
        if let Some(workdir) = &self.workdir {
            command.current_dir(workdir);
        }
        command.spawn()
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
pub struct RetrainStats {
    pub started: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped_in_flight: u64,
    pub running: bool,
}

#[derive(Debug, Default)]
struct RetrainCounters {
    started: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    skipped_in_flight: AtomicU64,
}

/// Clears the in-flight flag when the worker exits, including by panic.
struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Launches the retraining program and waits for it on a background thread.
///
/// At most one run is in flight; triggers that arrive while a run is active
/// are skipped and counted.
#[derive(Debug, Clone)]
pub struct ProcessRetrainInvoker {
    command: RetrainCommand,
    in_flight: Arc<AtomicBool>,
    counters: Arc<RetrainCounters>,
}

impl ProcessRetrainInvoker {
    #[must_use]
    pub fn new(command: RetrainCommand) -> Self {
        Self {
            command,
            in_flight: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(RetrainCounters::default()),
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn stats(&self) -> RetrainStats {
        RetrainStats {
            started: self.counters.started.load(Ordering::SeqCst),
            succeeded: self.counters.succeeded.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
            skipped_in_flight: self.counters.skipped_in_flight.load(Ordering::SeqCst),
            running: self.is_running(),
        }
    }
}

impl RetrainInvoker for ProcessRetrainInvoker {
    fn trigger(&self) -> TriggerDisposition {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.counters
                .skipped_in_flight
                .fetch_add(1, Ordering::SeqCst);
            tracing::info!("retraining already in flight; trigger skipped");
            return TriggerDisposition::AlreadyRunning;
        }
        let guard = InFlightGuard(Arc::clone(&self.in_flight));

        let mut child = match self.command.spawn() {
            Ok(child) => child,
            Err(err) => {
                self.counters.failed.fetch_add(1, Ordering::SeqCst);
                tracing::warn!(
                    program = %self.command.program,
                    error = %err,
                    "failed to launch retraining job"
                );
                return TriggerDisposition::SpawnFailed;
            }
        };
        self.counters.started.fetch_add(1, Ordering::SeqCst);
        tracing::info!(
            program = %self.command.program,
            pid = child.id(),
            "retraining job started"
        );

        let counters = Arc::clone(&self.counters);
        let program = self.command.program.clone();
        let spawned = std::thread::Builder::new()
            .name("churn-retrain".to_string())
            .spawn(move || {
                let _guard = guard;
                match child.wait() {
                    Ok(status) if status.success() => {
                        counters.succeeded.fetch_add(1, Ordering::SeqCst);
                        tracing::info!(%program, "retraining job finished");
                    }
                    Ok(status) => {
                        counters.failed.fetch_add(1, Ordering::SeqCst);
                        tracing::warn!(%program, %status, "retraining job failed");
                    }
                    Err(err) => {
                        counters.failed.fetch_add(1, Ordering::SeqCst);
                        tracing::warn!(%program, error = %err, "failed to wait on retraining job");
                    }
                }
            });

        // The child keeps running unobserved; the flag is released with the
        // dropped closure.
        if let Err(err) = spawned {
            tracing::warn!(error = %err, "failed to spawn retraining watcher thread");
        }

        TriggerDisposition::Started
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;

    fn shell(script: &str) -> RetrainCommand {
        RetrainCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            workdir: None,
        }
    }

    fn wait_idle(invoker: &ProcessRetrainInvoker) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while invoker.is_running() {
            assert!(Instant::now() < deadline, "retraining job never finished");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn default_command_runs_retraining_script() {
        let command = RetrainCommand::default();
        assert_eq!(command.program, "python");
        assert_eq!(command.args, vec!["retrain_with_rl.py".to_string()]);
    }

    #[test]
    fn successful_run_is_counted() {
        let invoker = ProcessRetrainInvoker::new(shell("exit 0"));
        assert_eq!(invoker.trigger(), TriggerDisposition::Started);
        wait_idle(&invoker);

        let stats = invoker.stats();
        assert_eq!(stats.started, 1);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.failed, 0);
        assert!(!stats.running);
    }

    #[test]
    fn failed_run_is_counted_not_raised() {
        let invoker = ProcessRetrainInvoker::new(shell("exit 3"));
        assert_eq!(invoker.trigger(), TriggerDisposition::Started);
        wait_idle(&invoker);
        assert_eq!(invoker.stats().failed, 1);
    }

    #[test]
    fn overlapping_trigger_is_skipped() {
        let invoker = ProcessRetrainInvoker::new(shell("sleep 1"));
        assert_eq!(invoker.trigger(), TriggerDisposition::Started);
        assert_eq!(invoker.trigger(), TriggerDisposition::AlreadyRunning);
        wait_idle(&invoker);

        let stats = invoker.stats();
        assert_eq!(stats.started, 1);
        assert_eq!(stats.skipped_in_flight, 1);

        assert_eq!(invoker.trigger(), TriggerDisposition::Started);
        wait_idle(&invoker);
        assert_eq!(invoker.stats().started, 2);
    }

    #[test]
    fn missing_program_reports_spawn_failure_and_releases_flag() {
        let invoker = ProcessRetrainInvoker::new(RetrainCommand {
            program: "churn-retrain-program-that-does-not-exist".to_string(),
            args: Vec::new(),
            workdir: None,
        });
        assert_eq!(invoker.trigger(), TriggerDisposition::SpawnFailed);
        assert!(!invoker.is_running());
        assert_eq!(invoker.stats().failed, 1);
    }

    #[test]
    fn trigger_returns_before_job_completes() {
        let invoker = ProcessRetrainInvoker::new(shell("sleep 2"));
        let started = Instant::now();
        assert_eq!(invoker.trigger(), TriggerDisposition::Started);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(invoker.is_running());
        wait_idle(&invoker);
    }
}
