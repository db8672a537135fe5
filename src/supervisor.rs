//! Process supervisor (cluster mode)
//!
//! Re-executes the current binary once per worker. Each worker runs the
//! full server stack with its own registry and relay subscription, so the
//! relay is the only path between workers even on one host.
//!
//! Workers talk back over stdout, one signal per line: `ready` once the
//! listener accepts connections, `stopping` right before a clean exit. A
//! worker that exits without saying `stopping` crashed and is replaced
//! immediately. Closing a worker's stdin asks it to shut down.

use std::collections::HashMap;
use std::future::Future;
use std::io::Write;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::AppError;

/// Environment variable marking a spawned worker
pub const ROLE_ENV: &str = "SOCKET_RELAY_ROLE";
pub const WORKER_ROLE: &str = "worker";

/// Environment variable carrying the worker's slot number
pub const WORKER_INDEX_ENV: &str = "SOCKET_RELAY_WORKER";

/// How long workers get to exit after being asked to stop
const STOP_TIMEOUT: Duration = Duration::from_secs(15);

/// What this process should do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Single process, no supervisor
    Standalone,
    /// Forks and watches workers
    Supervisor,
    /// Spawned by a supervisor
    Worker,
}

impl Role {
    pub fn detect(config: &Config, role_var: Option<&str>) -> Self {
        match role_var {
            Some(WORKER_ROLE) => Role::Worker,
            _ if config.cluster => Role::Supervisor,
            _ => Role::Standalone,
        }
    }
}

/// Line protocol from worker to supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerSignal {
    Ready,
    Stopping,
}

impl WorkerSignal {
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim() {
            "ready" => Some(Self::Ready),
            "stopping" => Some(Self::Stopping),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Stopping => "stopping",
        }
    }

    /// Emit this signal on stdout for the supervisor
    pub fn emit(&self) {
        let mut stdout = std::io::stdout().lock();
        if let Err(e) = writeln!(stdout, "{}", self.as_str()).and_then(|_| stdout.flush()) {
            warn!(error = %e, "Failed to signal supervisor");
        }
    }
}

/// Resolves when the supervisor closes this worker's stdin
pub async fn supervisor_closed() {
    let mut stdin = tokio::io::stdin();
    let mut buf = [0u8; 64];
    loop {
        match stdin.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => continue,
        }
    }
}

/// How a worker ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    pub index: usize,
    pub pid: Option<u32>,
    /// Exit code, `None` when killed by a signal
    pub code: Option<i32>,
    /// The worker announced `stopping` before exiting
    pub intentional: bool,
}

/// Crashed workers are replaced unless the supervisor itself is stopping
pub fn should_restart(exit: &WorkerExit, stopping: bool) -> bool {
    !stopping && !exit.intentional
}

struct WorkerHandle {
    stdin: Option<ChildStdin>,
    monitor: JoinHandle<()>,
}

fn spawn_worker(index: usize, exits: mpsc::UnboundedSender<WorkerExit>) -> std::io::Result<WorkerHandle> {
    let exe = std::env::current_exe()?;
    let mut child = Command::new(exe)
        .args(std::env::args_os().skip(1))
        .env(ROLE_ENV, WORKER_ROLE)
        .env(WORKER_INDEX_ENV, index.to_string())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()?;

    let pid = child.id();
    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    info!(index, ?pid, "Worker started");

    let monitor = tokio::spawn(async move {
        let mut intentional = false;
        if let Some(stdout) = stdout {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match WorkerSignal::parse(&line) {
                    Some(WorkerSignal::Ready) => info!(index, ?pid, "Worker ready"),
                    Some(WorkerSignal::Stopping) => intentional = true,
                    None => debug!(index, %line, "Worker output"),
                }
            }
        }

        let code = match child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                error!(index, error = %e, "Failed to wait for worker");
                None
            }
        };
        let _ = exits.send(WorkerExit {
            index,
            pid,
            code,
            intentional,
        });
    });

    Ok(WorkerHandle {
        stdin,
        monitor,
    })
}

/// Fork `config.worker_count()` workers and keep them running until
/// `shutdown` resolves
pub async fn run<F>(config: Config, shutdown: F) -> Result<(), AppError>
where
    F: Future<Output = ()>,
{
    let count = config.worker_count();
    info!(workers = count, "Starting supervisor");

    let (exit_tx, mut exit_rx) = mpsc::unbounded_channel();
    let mut workers = HashMap::new();
    for index in 0..count {
        workers.insert(index, spawn_worker(index, exit_tx.clone())?);
    }

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            Some(exit) = exit_rx.recv() => {
                workers.remove(&exit.index);
                if should_restart(&exit, false) {
                    error!(index = exit.index, pid = ?exit.pid, code = ?exit.code, "Worker has died, restarting");
                    match spawn_worker(exit.index, exit_tx.clone()) {
                        Ok(worker) => {
                            workers.insert(exit.index, worker);
                        }
                        Err(e) => error!(index = exit.index, error = %e, "Failed to restart worker"),
                    }
                } else {
                    info!(index = exit.index, pid = ?exit.pid, "Worker stopped");
                }
                if workers.is_empty() {
                    warn!("No workers left, supervisor exiting");
                    return Ok(());
                }
            }
        }
    }

    info!(workers = workers.len(), "Stopping workers");
    for worker in workers.values_mut() {
        // Closing stdin is the worker's shutdown request
        worker.stdin.take();
    }

    let deadline = tokio::time::sleep(STOP_TIMEOUT);
    tokio::pin!(deadline);
    while !workers.is_empty() {
        tokio::select! {
            _ = &mut deadline => break,
            Some(exit) = exit_rx.recv() => {
                debug!(index = exit.index, code = ?exit.code, "Worker exited");
                workers.remove(&exit.index);
            }
        }
    }

    for (index, worker) in workers {
        warn!(index, "Worker did not stop in time, killing");
        // Dropping the child inside the monitor kills it
        worker.monitor.abort();
    }

    info!("Supervisor stopped");
    Ok(())
}
