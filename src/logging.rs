use crate::activities::{StateChange, Tracker};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber filtered by `RUST_LOG` (default `info`).
///
/// Safe to call more than once; only the first call installs anything.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(false).try_init();
}

/// Tracker that forwards every activity state change to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleTracker;

impl Tracker for ConsoleTracker {
    fn activity_state_changed(&self, change: &StateChange) {
        let name = change.display_name.as_deref().unwrap_or(change.activity_kind);
        match change.state {
            crate::ActivityState::Fault => warn!(
                instance = %change.instance_id,
                activity = %change.activity_id,
                name,
                from = %change.previous,
                "activity faulted"
            ),
            s if s.is_terminal() => info!(
                instance = %change.instance_id,
                activity = %change.activity_id,
                name,
                state = %s,
                "activity finished"
            ),
            s => debug!(
                instance = %change.instance_id,
                activity = %change.activity_id,
                name,
                from = %change.previous,
                to = %s,
                "activity state changed"
            ),
        }
    }
}
