//! Rules the entry forms enforce before a record is written.

use anyhow::{anyhow, bail};
use chrono::{DateTime, Utc};

use crate::datastore::{Snapshot, find_by_id};
use crate::model::{AssetGroup, MaintenanceTask, Stop, Strategy};

fn require_text(field: &str, value: &str) -> anyhow::Result<()> {
    if value.trim().is_empty() {
        bail!("{field} is required");
    }
    Ok(())
}

fn require_order(
    what: &str,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> anyhow::Result<()> {
    if let (Some(start), Some(end)) = (start, end)
        && end < start
    {
        bail!(
            "{what}: end {} is before start {}",
            end.to_rfc3339(),
            start.to_rfc3339()
        );
    }
    Ok(())
}

fn require_asset(snapshot: &Snapshot, id: u64) -> anyhow::Result<()> {
    find_by_id(&snapshot.assets, id)
        .map(|_| ())
        .ok_or_else(|| anyhow!("asset group {id} does not exist"))
}

pub fn asset_group(asset: &AssetGroup) -> anyhow::Result<()> {
    require_text("asset group name", &asset.name)?;
    require_text("site", &asset.site)?;
    require_text("area", &asset.area)
}

pub fn strategy(strategy: &Strategy, snapshot: &Snapshot) -> anyhow::Result<()> {
    require_text("strategy name", &strategy.name)?;
    require_asset(snapshot, strategy.asset_group)?;
    if strategy.frequency_days == Some(0) {
        bail!("strategy frequency must be at least one day");
    }
    require_order("strategy", strategy.start, strategy.end)
}

pub fn stop(stop: &Stop, snapshot: &Snapshot) -> anyhow::Result<()> {
    require_text("stop name", &stop.name)?;
    for id in &stop.asset_groups {
        require_asset(snapshot, *id)?;
    }
    require_order("stop", stop.start, stop.end)
}

pub fn task(task: &MaintenanceTask, snapshot: &Snapshot) -> anyhow::Result<()> {
    require_text("task description", &task.description)?;
    if let Some(id) = task.stop
        && find_by_id(&snapshot.stops, id).is_none()
    {
        bail!("stop {id} does not exist");
    }
    if let Some(id) = task.strategy
        && find_by_id(&snapshot.strategies, id).is_none()
    {
        bail!("strategy {id} does not exist");
    }
    require_order("planned window", task.planned_start, task.planned_end)?;
    require_order("actual window", task.actual_start, task.actual_end)?;
    if task.actual_end.is_some() && task.actual_start.is_none() {
        bail!("actual end requires an actual start");
    }
    Ok(())
}

pub fn asset_group_deletable(snapshot: &Snapshot, id: u64) -> anyhow::Result<()> {
    if let Some(strategy) = snapshot.strategies.iter().find(|s| s.asset_group == id) {
        bail!(
            "asset group {id} is used by strategy {} ({})",
            strategy.id,
            strategy.name
        );
    }
    if let Some(stop) = snapshot
        .stops
        .iter()
        .find(|s| s.asset_groups.contains(&id))
    {
        bail!("asset group {id} is used by stop {} ({})", stop.id, stop.name);
    }
    Ok(())
}

pub fn strategy_deletable(snapshot: &Snapshot, id: u64) -> anyhow::Result<()> {
    if let Some(task) = snapshot.tasks.iter().find(|t| t.strategy == Some(id)) {
        bail!("strategy {id} is used by task {}", task.id);
    }
    Ok(())
}

pub fn stop_deletable(snapshot: &Snapshot, id: u64) -> anyhow::Result<()> {
    if let Some(task) = snapshot.tasks.iter().find(|t| t.stop == Some(id)) {
        bail!("stop {id} is used by task {}", task.id);
    }
    Ok(())
}
