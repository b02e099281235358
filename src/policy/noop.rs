use super::{MigrationCommand, Policy};
use crate::{kernel::SimTime, orchestrator::PlacementView, AccessRecord};

/// Leaves every chunk where it is. Baseline for comparing policies.
pub struct Noop {}

impl Policy for Noop {
    fn decide(
        &mut self,
        _now: SimTime,
        _window: &[AccessRecord],
        _view: &PlacementView<'_>,
    ) -> Vec<MigrationCommand> {
        Vec::new()
    }
}
