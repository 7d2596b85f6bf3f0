//! Terminal progress bars, one per tracker
//!
//! Bars are only drawn on a TTY; otherwise messages fall through to the
//! log. `SilentProgress` drops everything for `--silent` runs.

use crate::bootstrap::collaborators::ProgressReporter;
use console::Term;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};

const BAR_TEMPLATE: &str = "{prefix:>28.bold} [{bar:30.cyan/blue}] {pos}/{len} {wide_msg}";

pub struct IndicatifProgress {
    multi: MultiProgress,
    bars: Mutex<HashMap<String, ProgressBar>>,
    interactive: bool,
}

impl IndicatifProgress {
    pub fn new() -> Self {
        let interactive = Term::stdout().is_term() && std::env::var_os("NO_COLOR").is_none();
        let target = if interactive {
            ProgressDrawTarget::stdout()
        } else {
            ProgressDrawTarget::hidden()
        };
        Self {
            multi: MultiProgress::with_draw_target(target),
            bars: Mutex::new(HashMap::new()),
            interactive,
        }
    }

    fn style() -> ProgressStyle {
        ProgressStyle::with_template(BAR_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ")
    }

    /// Position and length of a tracker's bar, if one was added.
    pub fn position(&self, id: &str) -> Option<(u64, u64)> {
        let bars = self.bars.lock().unwrap_or_else(PoisonError::into_inner);
        bars.get(id)
            .map(|bar| (bar.position(), bar.length().unwrap_or(0)))
    }
}

impl Default for IndicatifProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter for IndicatifProgress {
    fn add_tracker(&self, id: &str, label: &str, total_weight: u64) {
        let mut bars = self.bars.lock().unwrap_or_else(PoisonError::into_inner);
        if bars.contains_key(id) {
            return;
        }
        let bar = self.multi.add(ProgressBar::new(total_weight));
        bar.set_style(Self::style());
        bar.set_prefix(label.to_string());
        bars.insert(id.to_string(), bar);
    }

    fn increment(&self, id: &str, delta: u64) {
        let bars = self.bars.lock().unwrap_or_else(PoisonError::into_inner);
        match bars.get(id) {
            Some(bar) => {
                bar.inc(delta);
                if bar.length().is_some_and(|len| bar.position() >= len) {
                    bar.finish();
                }
            }
            None => debug!(tracker = id, "increment on unknown tracker"),
        }
    }

    fn message(&self, text: &str) {
        if self.interactive {
            // Printing through the multi-progress keeps bars intact.
            if self.multi.println(text).is_err() {
                info!("{text}");
            }
        } else {
            info!("{text}");
        }
    }
}

/// Reporter for unattended runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn add_tracker(&self, _id: &str, _label: &str, _total_weight: u64) {}

    fn increment(&self, _id: &str, _delta: u64) {}

    fn message(&self, _text: &str) {}
}
