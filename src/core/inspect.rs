//! # Inspect
//!
//! Checks on the running environment.

use anyhow::Result;
use caps::{CapSet, Capability};
use log::{debug, warn};

/// Loading and attaching the instrumentation needs either CAP_BPF (with
/// CAP_PERFMON) or CAP_SYS_ADMIN. Report what is missing; the load failure
/// that follows, if any, is the actual error.
pub(crate) fn collection_prerequisites() -> Result<()> {
    let has = |cap| caps::has_cap(None, CapSet::Effective, cap);

    if has(Capability::CAP_SYS_ADMIN)? {
        debug!("Running with CAP_SYS_ADMIN");
        return Ok(());
    }

    let missing: Vec<_> = [Capability::CAP_BPF, Capability::CAP_PERFMON]
        .into_iter()
        .filter(|cap| !has(*cap).unwrap_or(false))
        .collect();
    if !missing.is_empty() {
        warn!(
            "Missing capabilities {:?}, loading the eBPF instrumentation will likely fail",
            missing
        );
    }

    Ok(())
}
