use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "LOW",
            Priority::Medium => "MEDIUM",
            Priority::High => "HIGH",
        }
    }
}

impl FromStr for Priority {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LOW" | "L" => Ok(Priority::Low),
            "MEDIUM" | "M" => Ok(Priority::Medium),
            "HIGH" | "H" => Ok(Priority::High),
            other => Err(anyhow!("invalid priority: {other} (expected LOW, MEDIUM or HIGH)")),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StopStatus {
    #[default]
    Planned,
    InProgress,
    Completed,
    Cancelled,
}

impl StopStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StopStatus::Planned => "planned",
            StopStatus::InProgress => "in-progress",
            StopStatus::Completed => "completed",
            StopStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for StopStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "planned" => Ok(StopStatus::Planned),
            "in-progress" | "inprogress" | "active" => Ok(StopStatus::InProgress),
            "completed" | "done" => Ok(StopStatus::Completed),
            "cancelled" | "canceled" => Ok(StopStatus::Cancelled),
            other => Err(anyhow!("invalid stop status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetGroup {
    pub uuid: Uuid,
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub site: String,
    #[serde(default)]
    pub area: String,
    #[serde(default)]
    pub description: String,
    pub entry: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

impl AssetGroup {
    pub fn new(id: u64, name: String, now: DateTime<Utc>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            id,
            name,
            site: String::new(),
            area: String::new(),
            description: String::new(),
            entry: now,
            modified: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    pub uuid: Uuid,
    pub id: u64,
    pub name: String,
    pub asset_group: u64,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub frequency_days: Option<u32>,
    #[serde(default)]
    pub description: String,
    pub entry: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

impl Strategy {
    pub fn new(id: u64, name: String, asset_group: u64, now: DateTime<Utc>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            id,
            name,
            asset_group,
            priority: Priority::Medium,
            start: None,
            end: None,
            frequency_days: None,
            description: String::new(),
            entry: now,
            modified: now,
        }
    }

    pub fn schedule_item(&self) -> ScheduleItem {
        ScheduleItem {
            id: self.id,
            name: self.name.clone(),
            start: self.start,
            end: self.end,
            kind: ItemKind::Strategy,
            priority: Some(self.priority),
            status: None,
            asset_groups: vec![self.asset_group],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stop {
    pub uuid: Uuid,
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub asset_groups: Vec<u64>,
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: StopStatus,
    #[serde(default)]
    pub description: String,
    pub entry: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

impl Stop {
    pub fn new(id: u64, name: String, now: DateTime<Utc>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            id,
            name,
            asset_groups: vec![],
            start: None,
            end: None,
            status: StopStatus::Planned,
            description: String::new(),
            entry: now,
            modified: now,
        }
    }

    pub fn schedule_item(&self) -> ScheduleItem {
        ScheduleItem {
            id: self.id,
            name: self.name.clone(),
            start: self.start,
            end: self.end,
            kind: ItemKind::Stop,
            priority: None,
            status: Some(self.status.as_str().to_string()),
            asset_groups: self.asset_groups.clone(),
        }
    }
}

/// A unit of maintenance work. Its completion percentage is derived from the
/// timestamps on every render and never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceTask {
    pub uuid: Uuid,
    pub id: u64,
    pub description: String,
    #[serde(default)]
    pub stop: Option<u64>,
    #[serde(default)]
    pub strategy: Option<u64>,
    #[serde(default)]
    pub planned_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub planned_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub actual_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub actual_end: Option<DateTime<Utc>>,
    pub entry: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

impl MaintenanceTask {
    pub fn new(id: u64, description: String, now: DateTime<Utc>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            id,
            description,
            stop: None,
            strategy: None,
            planned_start: None,
            planned_end: None,
            actual_start: None,
            actual_end: None,
            entry: now,
            modified: now,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Strategy,
    Stop,
}

impl ItemKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemKind::Strategy => "strategy",
            ItemKind::Stop => "stop",
        }
    }
}

impl FromStr for ItemKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strategy" | "strategies" => Ok(ItemKind::Strategy),
            "stop" | "stops" => Ok(ItemKind::Stop),
            other => Err(anyhow!("invalid item kind: {other} (expected strategy or stop)")),
        }
    }
}

/// One row of the schedule grid.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ScheduleItem {
    pub id: u64,
    pub name: String,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub kind: ItemKind,
    pub priority: Option<Priority>,
    pub status: Option<String>,
    pub asset_groups: Vec<u64>,
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0)
            .single()
            .expect("valid now")
    }

    #[test]
    fn priority_parses_case_insensitively() {
        assert_eq!("high".parse::<Priority>().expect("parse"), Priority::High);
        assert_eq!("M".parse::<Priority>().expect("parse"), Priority::Medium);
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn priority_serializes_uppercase() {
        let json = serde_json::to_string(&Priority::Low).expect("serialize");
        assert_eq!(json, "\"LOW\"");
    }

    #[test]
    fn stop_status_serializes_kebab_case() {
        let json = serde_json::to_string(&StopStatus::InProgress).expect("serialize");
        assert_eq!(json, "\"in-progress\"");
        assert_eq!(
            "done".parse::<StopStatus>().expect("parse"),
            StopStatus::Completed
        );
    }

    #[test]
    fn strategy_schedule_item_carries_priority_only() {
        let mut strategy = Strategy::new(3, "Lubrication".to_string(), 1, now());
        strategy.priority = Priority::High;
        let item = strategy.schedule_item();
        assert_eq!(item.kind, ItemKind::Strategy);
        assert_eq!(item.priority, Some(Priority::High));
        assert_eq!(item.status, None);
        assert_eq!(item.asset_groups, vec![1]);
    }

    #[test]
    fn stop_schedule_item_carries_status_only() {
        let mut stop = Stop::new(2, "Annual shutdown".to_string(), now());
        stop.status = StopStatus::Cancelled;
        let item = stop.schedule_item();
        assert_eq!(item.kind, ItemKind::Stop);
        assert_eq!(item.priority, None);
        assert_eq!(item.status.as_deref(), Some("cancelled"));
    }

    #[test]
    fn task_deserializes_without_optional_fields() {
        let raw = r#"{"uuid":"6f1e3d43-2a55-4c39-9c2d-1e1f0b1f7a10","id":1,"description":"Replace seals","entry":"2025-03-01T08:00:00Z","modified":"2025-03-01T08:00:00Z"}"#;
        let task: MaintenanceTask = serde_json::from_str(raw).expect("deserialize");
        assert_eq!(task.id, 1);
        assert!(task.actual_start.is_none());
        assert!(task.stop.is_none());
    }
}
