//! Interval scheduler for the acquisition cycle.
//!
//! A single background task wakes up every ten seconds and checks whether
//! the configured interval has elapsed since the last cycle started.
//! Measuring from start to start keeps the cadence steady regardless of
//! how long individual cycles take.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::cycle::{CycleReport, Orchestrator};
use crate::error::OurResult;

/// How often the scheduler re-evaluates whether a cycle is due.
const TICK_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct Scheduler {
    orchestrator: Arc<Orchestrator>,
}

impl Scheduler {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Start the ticking task. Calling this while already running is a
    /// logged no-op; there is never more than one ticker.
    pub async fn start(&self) {
        {
            let mut state = self.orchestrator.state().write().await;
            if state.running {
                warn!("Scheduler is already running, ignoring start request");
                return;
            }
            state.running = true;
        }
        info!("Scheduler started");

        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.tick_loop().await;
        });
    }

    /// Ask the ticker to stop. The flag is checked once per tick, so
    /// shutdown takes effect within one tick interval.
    pub async fn stop(&self) {
        let mut state = self.orchestrator.state().write().await;
        if state.running {
            state.running = false;
            info!("Scheduler stopping");
        }
    }

    /// Run a cycle immediately, bypassing the interval check. Shares the
    /// orchestrator's single-flight guard with scheduled runs, so a manual
    /// trigger during a scheduled cycle is rejected rather than queued.
    pub async fn force_run_now(&self) -> OurResult<CycleReport> {
        self.orchestrator.run_cycle().await
    }

    async fn tick_loop(&self) {
        loop {
            sleep(TICK_INTERVAL).await;

            let (running, due) = {
                let state = self.orchestrator.state().read().await;
                (state.running, cycle_due(&state))
            };
            if !running {
                info!("Scheduler stopped");
                return;
            }
            if !due {
                continue;
            }

            match self.orchestrator.run_cycle().await {
                Ok(report) => {
                    info!("Scheduled cycle finished: {:?}", report.outcome);
                }
                Err(e) => {
                    // Most likely a manual run holding the single-flight
                    // guard; the next due tick will try again.
                    error!("Scheduled cycle did not run: {e}");
                }
            }
        }
    }
}

/// A cycle is due when none has ever started, or when the interval has
/// elapsed since the last one started.
fn cycle_due(state: &crate::cycle::CycleState) -> bool {
    match state.last_cycle_start {
        None => true,
        Some(started) => {
            let elapsed = Utc::now().signed_duration_since(started);
            elapsed.num_seconds() >= state.interval_secs as i64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::cycle::CycleState;
    use chrono::Duration as ChronoDuration;

    fn test_state() -> CycleState {
        CycleState::from_settings(&Settings::default())
    }

    #[test]
    fn test_cycle_due_when_never_started() {
        let state = test_state();
        assert!(cycle_due(&state));
    }

    #[test]
    fn test_cycle_due_after_interval() {
        let mut state = test_state();
        state.last_cycle_start = Some(Utc::now() - ChronoDuration::seconds(1801));
        assert!(cycle_due(&state));
    }

    #[test]
    fn test_cycle_not_due_within_interval() {
        let mut state = test_state();
        state.last_cycle_start = Some(Utc::now() - ChronoDuration::seconds(60));
        assert!(!cycle_due(&state));
    }
}
