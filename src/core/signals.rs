use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::{Context, Result};
use signal_hook::consts::{SIGINT, SIGQUIT, SIGTERM};

/// Shared run state, flipped to "terminated" by a termination signal or by
/// calling `terminate()` on any of its clones.
#[derive(Clone, Debug)]
pub(crate) struct Running {
    terminated: Arc<AtomicBool>,
}

impl Running {
    pub(crate) fn new() -> Self {
        Self {
            terminated: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Stop running on SIGINT, SIGTERM and SIGQUIT. A second signal received
    /// while the first one is still pending (e.g. the process is blocked
    /// writing to a stalled reader) exits right away with status 0.
    pub(crate) fn register_term_signals(&mut self) -> Result<()> {
        for signal in [SIGINT, SIGTERM, SIGQUIT] {
            // Registered first so it sees the flag before this signal sets it.
            signal_hook::flag::register_conditional_shutdown(
                signal,
                0,
                Arc::clone(&self.terminated),
            )
            .with_context(|| format!("Unable to install exit handler for signal {signal}"))?;
            signal_hook::flag::register(signal, Arc::clone(&self.terminated))
                .with_context(|| format!("Unable to install handler for signal {signal}"))?;
        }
        Ok(())
    }

    pub(crate) fn running(&self) -> bool {
        !self.terminated.load(Ordering::Relaxed)
    }

    pub(crate) fn terminate(&mut self) {
        self.terminated.store(true, Ordering::Relaxed);
    }
}

impl Default for Running {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::{env, process::Command};

    use super::*;

    const REPEATED_SIGNAL_CHILD: &str = "EBPFDUMP_REPEATED_SIGNAL_CHILD";

    #[test]
    fn terminate_is_shared() {
        let run = Running::new();
        let mut other = run.clone();
        assert!(run.running());

        other.terminate();
        assert!(!run.running());
        assert!(!other.running());
    }

    #[test]
    fn signal_stops_running() {
        let mut run = Running::new();
        run.register_term_signals().unwrap();
        assert!(run.running());

        signal_hook::low_level::raise(SIGTERM).unwrap();
        assert!(!run.running());
    }

    /// Only does something when run by `repeated_signal_exits`: the first
    /// signal must only stop the run, the second one must end the process.
    #[test]
    fn repeated_signal_child() {
        if env::var_os(REPEATED_SIGNAL_CHILD).is_none() {
            return;
        }
        let mut run = Running::new();
        run.register_term_signals().unwrap();

        signal_hook::low_level::raise(SIGTERM).unwrap();
        assert!(!run.running());
        println!("still alive after first signal");

        signal_hook::low_level::raise(SIGTERM).unwrap();
        panic!("still alive after second signal");
    }

    #[test]
    fn repeated_signal_exits() {
        let output = Command::new(env::current_exe().unwrap())
            .args([
                "--exact",
                "core::signals::tests::repeated_signal_child",
                "--nocapture",
                "--test-threads=1",
            ])
            .env(REPEATED_SIGNAL_CHILD, "1")
            .output()
            .unwrap();

        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(output.status.success(), "{stdout}");
        assert!(stdout.contains("still alive after first signal"));
        assert!(!stdout.contains("test result"));
    }
}
