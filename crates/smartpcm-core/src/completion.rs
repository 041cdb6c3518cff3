//! Progress estimates for maintenance tasks.
//!
//! Two policies exist and they intentionally disagree:
//!
//! - [`InProgress`] is used while a task is being created or worked. It is
//!   driven by the actual start and the planned end, and never reports 100
//!   until an actual end is recorded.
//! - [`PlannedWindow`] is used when editing a persisted record. It only looks
//!   at the planned window and reaches 100 once `now` passes the planned end.
//!
//! Both are pure: the current instant is a parameter.

use std::str::FromStr;

use anyhow::anyhow;
use chrono::{DateTime, Utc};

use crate::model::MaintenanceTask;

const OVERDUE_CAP: u8 = 99;
const DONE: u8 = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompletionInput {
    pub planned_start: Option<DateTime<Utc>>,
    pub planned_end: Option<DateTime<Utc>>,
    pub actual_start: Option<DateTime<Utc>>,
    pub actual_end: Option<DateTime<Utc>>,
}

impl From<&MaintenanceTask> for CompletionInput {
    fn from(task: &MaintenanceTask) -> Self {
        Self {
            planned_start: task.planned_start,
            planned_end: task.planned_end,
            actual_start: task.actual_start,
            actual_end: task.actual_end,
        }
    }
}

pub trait CompletionPolicy {
    fn name(&self) -> &'static str;

    /// Percentage in `0..=100`.
    fn estimate(&self, input: &CompletionInput, now: DateTime<Utc>) -> u8;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct InProgress;

impl CompletionPolicy for InProgress {
    fn name(&self) -> &'static str {
        "in-progress"
    }

    fn estimate(&self, input: &CompletionInput, now: DateTime<Utc>) -> u8 {
        if input.actual_end.is_some() {
            return DONE;
        }
        let Some(actual_start) = input.actual_start else {
            return 0;
        };
        let Some(planned_end) = input.planned_end else {
            return 0;
        };
        if now > planned_end {
            return OVERDUE_CAP;
        }

        let total_ms = (planned_end - actual_start).num_milliseconds();
        if total_ms <= 0 {
            return OVERDUE_CAP;
        }
        let elapsed_ms = (now - actual_start).num_milliseconds();
        ratio_percent(elapsed_ms, total_ms, OVERDUE_CAP)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PlannedWindow;

impl CompletionPolicy for PlannedWindow {
    fn name(&self) -> &'static str {
        "planned-window"
    }

    fn estimate(&self, input: &CompletionInput, now: DateTime<Utc>) -> u8 {
        let (Some(start), Some(end)) = (input.planned_start, input.planned_end) else {
            return 0;
        };
        if now < start {
            return 0;
        }
        if now > end {
            return DONE;
        }

        let total_ms = (end - start).num_milliseconds();
        // start <= now <= end with an empty window means now is the end
        if total_ms <= 0 {
            return DONE;
        }
        let elapsed_ms = (now - start).num_milliseconds();
        ratio_percent(elapsed_ms, total_ms, DONE)
    }
}

/// Which form a completion value is shown on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowContext {
    #[default]
    Create,
    Edit,
}

impl FlowContext {
    pub fn policy(self) -> &'static dyn CompletionPolicy {
        match self {
            FlowContext::Create => &InProgress,
            FlowContext::Edit => &PlannedWindow,
        }
    }
}

impl FromStr for FlowContext {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "create" | "new" | "in-progress" => Ok(FlowContext::Create),
            "edit" | "modify" | "planned" | "planned-window" => Ok(FlowContext::Edit),
            other => Err(anyhow!("invalid completion flow: {other} (expected create or edit)")),
        }
    }
}

pub fn estimate(flow: FlowContext, input: &CompletionInput, now: DateTime<Utc>) -> u8 {
    flow.policy().estimate(input, now)
}

fn ratio_percent(elapsed_ms: i64, total_ms: i64, cap: u8) -> u8 {
    let pct = elapsed_ms as f64 / total_ms as f64 * 100.0;
    pct.clamp(0.0, f64::from(cap)).round() as u8
}
