//! The coordinator service loop.

use std::time::{Duration, Instant};

use vigil_types::Timestamp;

/// Runs the node until the duration elapses (or indefinitely).
pub fn run(project_dir: &str, duration_secs: Option<u64>) -> anyhow::Result<()> {
    let node = super::load_node(project_dir)?;
    let interval = Duration::from_millis(node.config().node.tick_interval_ms);
    let started = Instant::now();

    tracing::info!(
        name = %node.config().node.name,
        tick_ms = node.config().node.tick_interval_ms,
        "coordinator running"
    );

    while node.is_running() {
        let now = Timestamp::now();
        node.pump(now);
        node.tick(now);

        if let Some(limit) = duration_secs {
            if started.elapsed() >= Duration::from_secs(limit) {
                break;
            }
        }
        std::thread::sleep(interval);
    }

    node.shutdown();
    tracing::info!("coordinator stopped");
    Ok(())
}
