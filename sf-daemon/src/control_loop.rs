//! Periodic control loop
//!
//! Each cycle runs on the blocking pool since it shells out to `ipmitool`
//! and waits on the controller. Between cycles the loop sleeps for the
//! polling interval unless woken for shutdown.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use sf_core::{ControlManager, ControlState};

/// Consecutive failed cycles between repeated error reports
const ERROR_REPORT_EVERY: u32 = 10;

pub async fn run_control_loop(
    manager: Arc<Mutex<ControlManager>>,
    shutdown: Arc<AtomicBool>,
    wake: Arc<Notify>,
    monitoring: bool,
) {
    let status = manager.lock().status_handle();
    let mut consecutive_errors: u32 = 0;
    let mut fatal_reported = false;

    info!(monitoring, "Control loop starting");

    loop {
        if shutdown.load(Ordering::SeqCst) {
            info!("Control loop shutting down");
            break;
        }

        let cycle_manager = Arc::clone(&manager);
        let outcome = tokio::task::spawn_blocking(move || cycle_manager.lock().run_cycle()).await;

        match outcome {
            Ok(Ok(state)) => {
                if consecutive_errors > 0 {
                    info!("Control loop recovered after {} failed cycles", consecutive_errors);
                    consecutive_errors = 0;
                }
                if let ControlState::Emergency { fatal: true, .. } = state {
                    if !fatal_reported {
                        error!("EMERGENCY: Fans could not be driven; automatic control left in charge, operator attention required");
                        fatal_reported = true;
                    }
                }
            }
            Ok(Err(e)) => {
                consecutive_errors += 1;
                if consecutive_errors == 1 || consecutive_errors % ERROR_REPORT_EVERY == 0 {
                    warn!("Control cycle failed (count: {}): {}", consecutive_errors, e);
                }
            }
            Err(e) => {
                error!("Control cycle aborted: {}", e);
                break;
            }
        }

        let snapshot = status.latest();
        if monitoring {
            info!("{}", snapshot.summary());
        } else {
            debug!("{}", snapshot.summary());
        }

        let interval = manager.lock().poll_interval(monitoring);
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = wake.notified() => {
                debug!("Control loop woken early");
            }
        }
    }

    info!("Control loop stopped");
}
