//! Ordered phase plans
//!
//! A [`Plan`] is an ordered list of [`Phase`]s. Each phase names its
//! optional checkpoint key, the keys it depends on, the progress tracker it
//! reports to and the [`Step`] that does the work.

use crate::bootstrap::state::RunFlags;
use crate::error::Result;
use crate::orchestrator::RunContext;
use async_trait::async_trait;
use std::fmt;

/// Whether a phase applies to the current run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Condition {
    #[default]
    Always,
    UnlessSkipScm,
    UnlessSkipVault,
}

impl Condition {
    pub fn applies(self, flags: &RunFlags) -> bool {
        match self {
            Condition::Always => true,
            Condition::UnlessSkipScm => !flags.skip_scm,
            Condition::UnlessSkipVault => !flags.skip_vault,
        }
    }
}

/// Operator-visible progress group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tracker {
    pub id: &'static str,
    pub label: &'static str,
}

#[async_trait]
pub trait Step: Send + Sync {
    async fn execute(&self, ctx: &mut RunContext) -> Result<()>;

    /// Runs instead of `execute` when the phase checkpoint is already set.
    async fn on_skip(&self, _ctx: &mut RunContext) -> Result<()> {
        Ok(())
    }
}

pub struct Phase {
    pub id: &'static str,
    pub label: &'static str,
    pub tracker: Tracker,
    pub checkpoint: Option<String>,
    pub depends_on: Vec<String>,
    pub weight: u64,
    pub condition: Condition,
    pub step: Box<dyn Step>,
}

impl Phase {
    pub fn new(
        id: &'static str,
        label: &'static str,
        tracker: Tracker,
        step: impl Step + 'static,
    ) -> Self {
        Self {
            id,
            label,
            tracker,
            checkpoint: None,
            depends_on: Vec::new(),
            weight: 1,
            condition: Condition::Always,
            step: Box::new(step),
        }
    }

    pub fn checkpoint(mut self, key: impl Into<String>) -> Self {
        self.checkpoint = Some(key.into());
        self
    }

    pub fn depends_on(mut self, key: impl Into<String>) -> Self {
        self.depends_on.push(key.into());
        self
    }

    pub fn weight(mut self, weight: u64) -> Self {
        self.weight = weight;
        self
    }

    pub fn when(mut self, condition: Condition) -> Self {
        self.condition = condition;
        self
    }
}

impl fmt::Debug for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Phase")
            .field("id", &self.id)
            .field("tracker", &self.tracker.id)
            .field("checkpoint", &self.checkpoint)
            .field("depends_on", &self.depends_on)
            .field("weight", &self.weight)
            .field("condition", &self.condition)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct Plan {
    phases: Vec<Phase>,
}

impl Plan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(mut self, phase: Phase) -> Self {
        self.phases.push(phase);
        self
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    /// Trackers in first-use order with the summed weight of the phases
    /// that apply under `flags`.
    pub fn tracker_totals(&self, flags: &RunFlags) -> Vec<(Tracker, u64)> {
        let mut totals: Vec<(Tracker, u64)> = Vec::new();
        for phase in self.phases.iter().filter(|p| p.condition.applies(flags)) {
            match totals.iter_mut().find(|(t, _)| t.id == phase.tracker.id) {
                Some((_, total)) => *total += phase.weight,
                None => totals.push((phase.tracker, phase.weight)),
            }
        }
        totals
    }

    /// Checkpoint keys in plan order.
    pub fn checkpoint_keys(&self) -> impl Iterator<Item = &str> {
        self.phases.iter().filter_map(|p| p.checkpoint.as_deref())
    }
}
