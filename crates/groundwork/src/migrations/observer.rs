//! Progress reporting for migration runs

use std::time::Duration;

use tracing::{error, info, warn};

use super::definitions::{Direction, MigrationId, RunReport, RunState};

/// Receives run progress. All methods default to doing nothing.
pub trait MigrationObserver: Send + Sync {
    /// The runner entered `state`; `unit` is set for per-unit states
    fn state_changed(&self, _state: RunState, _unit: Option<&MigrationId>) {}

    fn unit_completed(&self, _direction: Direction, _unit: &MigrationId, _elapsed: Duration) {}

    fn unit_failed(&self, _direction: Direction, _unit: &MigrationId, _error: &anyhow::Error) {}

    fn run_finished(&self, _report: &RunReport) {}
}

/// Forwards progress to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl MigrationObserver for TracingObserver {
    fn state_changed(&self, state: RunState, unit: Option<&MigrationId>) {
        match (state, unit) {
            (RunState::Applying(_), Some(id)) => info!("Applying {}", id),
            (RunState::Reverting(_), Some(id)) => info!("Reverting {}", id),
            (RunState::Planning, _) => tracing::debug!("Planning migration run"),
            _ => {}
        }
    }

    fn unit_completed(&self, direction: Direction, unit: &MigrationId, elapsed: Duration) {
        info!(
            "{} {} in {}ms",
            match direction {
                Direction::Up => "Applied",
                Direction::Down => "Reverted",
            },
            unit,
            elapsed.as_millis()
        );
    }

    fn unit_failed(&self, direction: Direction, unit: &MigrationId, error: &anyhow::Error) {
        error!("Migration {} failed during {}: {:#}", unit, direction, error);
    }

    fn run_finished(&self, report: &RunReport) {
        if report.cancelled {
            warn!(
                "Migration run cancelled after {} unit(s)",
                report.processed.len()
            );
        } else {
            info!(
                "Migration run ({}) finished: {} unit(s) in {}ms",
                report.direction,
                report.processed.len(),
                report.elapsed_ms
            );
        }
    }
}

/// Discards all progress
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentObserver;

impl MigrationObserver for SilentObserver {}
