use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info};
use uuid::Uuid;

use crate::model::{AssetGroup, MaintenanceTask, ScheduleItem, Stop, Strategy};

/// Common handle of every stored collection entry.
pub trait Record {
    fn id(&self) -> u64;
    fn uuid(&self) -> Uuid;
}

macro_rules! impl_record {
    ($($ty:ty),+) => {
        $(impl Record for $ty {
            fn id(&self) -> u64 {
                self.id
            }

            fn uuid(&self) -> Uuid {
                self.uuid
            }
        })+
    };
}

impl_record!(AssetGroup, Strategy, Stop, MaintenanceTask);

pub fn next_id<T: Record>(records: &[T]) -> u64 {
    records.iter().map(Record::id).max().unwrap_or(0) + 1
}

pub fn find_by_id<T: Record>(records: &[T], id: u64) -> Option<&T> {
    records.iter().find(|record| record.id() == id)
}

pub fn find_by_id_mut<T: Record>(records: &mut [T], id: u64) -> Option<&mut T> {
    records.iter_mut().find(|record| record.id() == id)
}

/// Full contents of the store; also the unit of undo and of export/import.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub assets: Vec<AssetGroup>,
    #[serde(default)]
    pub strategies: Vec<Strategy>,
    #[serde(default)]
    pub stops: Vec<Stop>,
    #[serde(default)]
    pub tasks: Vec<MaintenanceTask>,
}

impl Snapshot {
    /// Strategies followed by stops, each ordered by id.
    pub fn schedule_items(&self) -> Vec<ScheduleItem> {
        let mut strategies: Vec<&Strategy> = self.strategies.iter().collect();
        strategies.sort_by_key(|s| s.id);
        let mut stops: Vec<&Stop> = self.stops.iter().collect();
        stops.sort_by_key(|s| s.id);

        strategies
            .into_iter()
            .map(Strategy::schedule_item)
            .chain(stops.into_iter().map(Stop::schedule_item))
            .collect()
    }
}

#[derive(Debug)]
pub struct DataStore {
    pub data_dir: PathBuf,
    pub assets_path: PathBuf,
    pub strategies_path: PathBuf,
    pub stops_path: PathBuf,
    pub tasks_path: PathBuf,
    pub undo_path: PathBuf,
}

impl DataStore {
    #[tracing::instrument(skip(data_dir))]
    pub fn open(data_dir: &Path) -> anyhow::Result<Self> {
        let data_dir = data_dir.to_path_buf();
        fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create {}", data_dir.display()))?;

        let store = Self {
            assets_path: data_dir.join("assets.data"),
            strategies_path: data_dir.join("strategies.data"),
            stops_path: data_dir.join("stops.data"),
            tasks_path: data_dir.join("tasks.data"),
            undo_path: data_dir.join("undo.data"),
            data_dir,
        };

        for path in [
            &store.assets_path,
            &store.strategies_path,
            &store.stops_path,
            &store.tasks_path,
            &store.undo_path,
        ] {
            if !path.exists() {
                fs::write(path, "")
                    .with_context(|| format!("failed to create {}", path.display()))?;
            }
        }

        info!(data_dir = %store.data_dir.display(), "opened datastore");
        Ok(store)
    }

    #[tracing::instrument(skip(self))]
    pub fn load_assets(&self) -> anyhow::Result<Vec<AssetGroup>> {
        load_jsonl(&self.assets_path).context("failed to load assets.data")
    }

    #[tracing::instrument(skip(self))]
    pub fn load_strategies(&self) -> anyhow::Result<Vec<Strategy>> {
        load_jsonl(&self.strategies_path).context("failed to load strategies.data")
    }

    #[tracing::instrument(skip(self))]
    pub fn load_stops(&self) -> anyhow::Result<Vec<Stop>> {
        load_jsonl(&self.stops_path).context("failed to load stops.data")
    }

    #[tracing::instrument(skip(self))]
    pub fn load_tasks(&self) -> anyhow::Result<Vec<MaintenanceTask>> {
        load_jsonl(&self.tasks_path).context("failed to load tasks.data")
    }

    #[tracing::instrument(skip(self, assets))]
    pub fn save_assets(&self, assets: &[AssetGroup]) -> anyhow::Result<()> {
        save_jsonl_atomic(&self.assets_path, assets).context("failed to save assets.data")
    }

    #[tracing::instrument(skip(self, strategies))]
    pub fn save_strategies(&self, strategies: &[Strategy]) -> anyhow::Result<()> {
        save_jsonl_atomic(&self.strategies_path, strategies)
            .context("failed to save strategies.data")
    }

    #[tracing::instrument(skip(self, stops))]
    pub fn save_stops(&self, stops: &[Stop]) -> anyhow::Result<()> {
        save_jsonl_atomic(&self.stops_path, stops).context("failed to save stops.data")
    }

    #[tracing::instrument(skip(self, tasks))]
    pub fn save_tasks(&self, tasks: &[MaintenanceTask]) -> anyhow::Result<()> {
        save_jsonl_atomic(&self.tasks_path, tasks).context("failed to save tasks.data")
    }

    #[tracing::instrument(skip(self))]
    pub fn load_snapshot(&self) -> anyhow::Result<Snapshot> {
        Ok(Snapshot {
            assets: self.load_assets()?,
            strategies: self.load_strategies()?,
            stops: self.load_stops()?,
            tasks: self.load_tasks()?,
        })
    }

    #[tracing::instrument(skip(self, snapshot))]
    pub fn save_snapshot(&self, snapshot: &Snapshot) -> anyhow::Result<()> {
        self.save_assets(&snapshot.assets)?;
        self.save_strategies(&snapshot.strategies)?;
        self.save_stops(&snapshot.stops)?;
        self.save_tasks(&snapshot.tasks)?;
        Ok(())
    }

    /// Saves `after` and records `before` so `undo` can restore it.
    #[tracing::instrument(skip(self, before, after))]
    pub fn commit(&self, before: &Snapshot, after: &Snapshot) -> anyhow::Result<()> {
        self.push_undo_snapshot(before)?;
        self.save_snapshot(after)
    }

    #[tracing::instrument(skip(self, snapshot))]
    pub fn push_undo_snapshot(&self, snapshot: &Snapshot) -> anyhow::Result<()> {
        let mut entries: Vec<Snapshot> = load_jsonl(&self.undo_path)?;
        entries.push(snapshot.clone());
        save_jsonl_atomic(&self.undo_path, &entries)
    }

    /// Restores the newest undo snapshot and only then drops it from the
    /// log. Returns how many entries remain, or `None` when the log is empty.
    #[tracing::instrument(skip(self))]
    pub fn undo_last(&self) -> anyhow::Result<Option<usize>> {
        let mut entries: Vec<Snapshot> = load_jsonl(&self.undo_path)?;
        let Some(entry) = entries.pop() else {
            return Ok(None);
        };
        self.save_snapshot(&entry)
            .context("failed to restore undo snapshot")?;
        save_jsonl_atomic(&self.undo_path, &entries)?;
        info!(remaining = entries.len(), "restored undo snapshot");
        Ok(Some(entries.len()))
    }
}

#[tracing::instrument(skip(path))]
fn load_jsonl<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Vec<T>> {
    debug!(file = %path.display(), "loading jsonl");
    let file = fs::File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut out = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let record: T = serde_json::from_str(trimmed)
            .with_context(|| format!("failed parsing {} line {}", path.display(), idx + 1))?;
        out.push(record);
    }

    debug!(count = out.len(), "loaded records from jsonl");
    Ok(out)
}

#[tracing::instrument(skip(path, records))]
fn save_jsonl_atomic<T: Serialize>(path: &Path, records: &[T]) -> anyhow::Result<()> {
    debug!(file = %path.display(), count = records.len(), "saving jsonl atomically");

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = NamedTempFile::new_in(dir)?;
    for record in records {
        let serialized = serde_json::to_string(record)?;
        writeln!(temp, "{serialized}")?;
    }
    temp.flush()?;

    temp.persist(path)
        .map_err(|err| anyhow!("failed to persist {}: {}", path.display(), err))?;

    Ok(())
}
