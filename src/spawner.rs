//! Broker subprocess launching, modeled as an injected `Spawner` so tests
//! can observe invocations without forking a real process.

use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};

/// Launches a detached broker process. The default [`ProcessSpawner`]
/// fires-and-forgets a real child; tests substitute a recording fake.
pub trait Spawner: std::fmt::Debug + Send + Sync {
    /// Attempts to launch `command` with `args`, detached from this
    /// process's lifetime. Returns `Ok(())` once the spawn syscall itself
    /// succeeds — the client does not track or wait on the child.
    fn spawn(&self, command: &str, args: &[String]) -> std::io::Result<()>;
}

/// Spawns a real detached OS process: stdio wired to `/dev/null`, and the
/// `Child` handle forgotten so its lifetime is not tied to ours.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessSpawner;

impl Spawner for ProcessSpawner {
    fn spawn(&self, command: &str, args: &[String]) -> std::io::Result<()> {
        let child = Command::new(command)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        log::info!("[connection] spawned broker process (pid {})", child.id());
        // Detach — the broker manages its own lifetime; the client never
        // waits on or signals it.
        std::mem::forget(child);
        Ok(())
    }
}

/// A recording fake used by tests: every call is appended to a shared log
/// instead of touching the real process table.
#[derive(Debug, Clone, Default)]
pub struct RecordingSpawner {
    calls: Arc<Mutex<Vec<(String, Vec<String>)>>>,
}

impl RecordingSpawner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Spawner for RecordingSpawner {
    fn spawn(&self, command: &str, args: &[String]) -> std::io::Result<()> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((command.to_string(), args.to_vec()));
        Ok(())
    }
}
