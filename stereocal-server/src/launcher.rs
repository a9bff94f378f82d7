//! Launches the external calibration job once the frame quota is reached.
//!
//! The job reads the side-keyed frame directories by convention; nothing
//! else is passed to it. Its exit status is logged from a detached task but
//! the authoritative end-of-run signal is the completion notification on
//! the signal endpoint.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{error, info, warn};

use stereocal_config_data::IntakeConfig;

use crate::store::{Gate, Shared};

/// Start the configured calibration command. Called right after the gate
/// closed, with the shared-state lock already released. A spawn failure
/// reopens intake immediately so the service is never left closed with no
/// recovery path.
pub(crate) fn start_calibration(shared: &Arc<Shared>, cfg: &IntakeConfig) {
    info!("triggering stereo camera calibration");
    let Some((program, args)) = cfg.calibration_command.split_first() else {
        error!("calibration command is empty, reopening intake");
        shared.complete_run();
        return;
    };

    let mut command = tokio::process::Command::new(program);
    command.args(args).current_dir(&cfg.output_base_dirname);
    match command.spawn() {
        Ok(mut child) => {
            tokio::spawn(async move {
                match child.wait().await {
                    Ok(status) => info!("calibration job exited: {status}"),
                    Err(e) => warn!("could not await calibration job: {e}"),
                }
            });
        }
        Err(e) => {
            error!(
                "failed to start calibration job {:?}: {e}, reopening intake",
                cfg.calibration_command
            );
            shared.complete_run();
            return;
        }
    }

    if cfg.calibration_wait_timeout_secs > 0 {
        tokio::spawn(stale_run_watchdog(
            shared.clone(),
            Duration::from_secs(cfg.calibration_wait_timeout_secs),
        ));
    }
}

/// Force intake open again if no completion notification arrives in time,
/// so a crashed or hung calibration job cannot block the service forever.
async fn stale_run_watchdog(shared: Arc<Shared>, max_wait: Duration) {
    let mut gate_rx = shared.subscribe_gate();
    let reopened = timeout(max_wait, gate_rx.wait_for(|gate| *gate == Gate::Open)).await;
    if reopened.is_err() {
        error!(
            "no completion notification within {}s, treating calibration run as failed",
            max_wait.as_secs()
        );
        shared.complete_run();
    }
}
