//! Periodic update loop

use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

use super::orchestrator::{Local, Remote, UpdateReport, Updater};
use crate::engine::firmware::FirmwareVerifier;

/// Runs update cycles every `interval` until `shutdown` resolves or a cycle
/// reboots the device. A running cycle is never interrupted; shutdown is
/// only observed between cycles.
///
/// Returns the report of the cycle that rebooted, if any.
pub async fn run_update_loop<L, R, V, F>(
    updater: &Updater<L, R, V>,
    interval: Duration,
    shutdown: F,
) -> Option<UpdateReport>
where
    L: Local,
    R: Remote,
    V: FirmwareVerifier,
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);

    loop {
        match updater.cycle().await {
            Ok(report) if report.rebooted => {
                info!("Update cycle installed firmware, leaving update loop");
                return Some(report);
            }
            Ok(report) => {
                if report.os.is_failed() || report.applet.is_failed() {
                    warn!(?report, "Update cycle finished with failures");
                } else {
                    info!("Firmware is up to date");
                }
            }
            Err(e) => warn!("Update cycle failed: {}", e),
        }

        tokio::select! {
            _ = &mut shutdown => {
                info!("Update loop stopped");
                return None;
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
