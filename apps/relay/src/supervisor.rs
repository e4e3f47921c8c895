//! Supervisor process: spawns the workers, restarts crashed ones, forwards
//! shutdown signals and samples the status rings.
//!
//! Workers are full processes (re-exec of this binary with `--worker N`),
//! not threads: they share nothing but the listening port, which is the
//! point of the `SO_REUSEPORT` design.

use std::path::PathBuf;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::status::{ring_path, StatusReader};

const RESTART_BACKOFF: Duration = Duration::from_secs(1);
const SUPERVISE_TICK: Duration = Duration::from_millis(500);
const STATUS_REPORT_EVERY: u64 = 120; // ticks -> once a minute

struct WorkerSlot {
    id: usize,
    child: Option<Child>,
}

pub async fn run(
    config: Config,
    config_path: Option<PathBuf>,
    debug_logging: bool,
) -> anyhow::Result<()> {
    let worker_count = config.worker_count();
    info!(
        workers = worker_count,
        listen = %config.server.listen,
        "supervisor starting"
    );

    let mut slots = Vec::with_capacity(worker_count);
    for id in 0..worker_count {
        slots.push(WorkerSlot {
            id,
            child: Some(spawn_worker(id, &config_path, debug_logging)?),
        });
    }

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut tick = tokio::time::interval(SUPERVISE_TICK);
    let mut ticks: u64 = 0;

    loop {
        tokio::select! {
            _ = tick.tick() => {
                ticks += 1;
                supervise(&mut slots, &config_path, debug_logging).await;
                if ticks % STATUS_REPORT_EVERY == 0 {
                    report_status(&config, worker_count);
                }
            }
            _ = sigterm.recv() => break,
            _ = sigint.recv() => break,
        }
    }

    info!("supervisor shutting down, draining workers");
    for slot in &slots {
        if let Some(pid) = slot.child.as_ref().and_then(Child::id) {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
    }

    let deadline =
        tokio::time::Instant::now() + Duration::from_secs(config.server.drain_secs + 2);
    loop {
        let mut alive = 0;
        for slot in &mut slots {
            if let Some(child) = &mut slot.child {
                match child.try_wait() {
                    Ok(Some(_)) => slot.child = None,
                    Ok(None) => alive += 1,
                    Err(err) => {
                        warn!(worker = slot.id, %err, "cannot reap worker");
                        slot.child = None;
                    }
                }
            }
        }
        if alive == 0 {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(alive, "drain deadline passed, killing remaining workers");
            for slot in &mut slots {
                if let Some(child) = &mut slot.child {
                    let _ = child.kill().await;
                }
            }
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    info!("supervisor exited");
    Ok(())
}

/// Reap exited workers and restart them (crashes only; a clean exit during
/// steady state is still unexpected and logged).
async fn supervise(slots: &mut [WorkerSlot], config_path: &Option<PathBuf>, debug_logging: bool) {
    for slot in slots {
        let Some(child) = &mut slot.child else {
            continue;
        };
        let status = match child.try_wait() {
            Ok(Some(status)) => status,
            Ok(None) => continue,
            Err(err) => {
                warn!(worker = slot.id, %err, "cannot poll worker");
                continue;
            }
        };
        warn!(worker = slot.id, %status, "worker exited, restarting");
        slot.child = None;
        tokio::time::sleep(RESTART_BACKOFF).await;
        match spawn_worker(slot.id, config_path, debug_logging) {
            Ok(child) => slot.child = Some(child),
            Err(err) => warn!(worker = slot.id, %err, "failed to respawn worker"),
        }
    }
}

fn spawn_worker(
    id: usize,
    config_path: &Option<PathBuf>,
    debug_logging: bool,
) -> std::io::Result<Child> {
    let exe = std::env::current_exe()?;
    let mut command = Command::new(exe);
    command.arg("--worker").arg(id.to_string());
    if let Some(path) = config_path {
        command.arg("--config").arg(path);
    }
    if debug_logging {
        command.arg("--debug");
    }
    command.kill_on_drop(true);
    debug!(worker = id, "spawning worker");
    command.spawn()
}

fn report_status(config: &Config, worker_count: usize) {
    let mut clients = 0u64;
    let mut bytes = 0u64;
    let mut dropped_pool = 0u64;
    for id in 0..worker_count {
        let path = ring_path(&config.status.dir, id);
        match StatusReader::open(&path) {
            Ok(reader) => {
                let counters = reader.counters();
                clients += counters.clients_active;
                bytes += counters.send.bytes_sent;
                dropped_pool += counters.pool.exhaustions;
            }
            Err(err) => debug!(worker = id, %err, "status ring unavailable"),
        }
    }
    info!(clients, bytes, pool_exhaustions = dropped_pool, "relay status");
}
