use std::io::{self, IsTerminal, Write};

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use unicode_width::UnicodeWidthStr;

use crate::completion::{CompletionInput, FlowContext};
use crate::config::Config;
use crate::datastore::find_by_id;
use crate::datetime::format_project_date;
use crate::grid::{Grid, GridRow};
use crate::model::{AssetGroup, ItemKind, MaintenanceTask, Priority, ScheduleItem, Stop, Strategy};

const ACTIVE_CELL: &str = "■";
const IDLE_CELL: &str = "·";
const BAR_WIDTH: usize = 10;

#[derive(Debug, Clone)]
pub struct Renderer {
    color: bool,
}

impl Renderer {
    pub fn new(cfg: &Config) -> anyhow::Result<Self> {
        let color_cfg = cfg.get("color").unwrap_or_else(|| "on".to_string());
        let color = match color_cfg.to_ascii_lowercase().as_str() {
            "on" | "yes" | "true" | "1" => true,
            "off" | "no" | "false" | "0" => false,
            other => return Err(anyhow!("invalid color setting: {other}")),
        };

        Ok(Self {
            color: color && io::stdout().is_terminal(),
        })
    }

    pub fn plain() -> Self {
        Self { color: false }
    }

    #[tracing::instrument(skip(self, grid, rows))]
    pub fn print_schedule(&self, title: &str, grid: &Grid, rows: &[GridRow<'_>]) -> anyhow::Result<()> {
        let out = io::stdout().lock();
        self.write_schedule(out, title, grid, rows)
    }

    pub fn write_schedule<W: Write>(
        &self,
        mut writer: W,
        title: &str,
        grid: &Grid,
        rows: &[GridRow<'_>],
    ) -> anyhow::Result<()> {
        writeln!(writer, "{title}")?;
        if rows.is_empty() {
            writeln!(writer, "No scheduled items.")?;
            return Ok(());
        }

        let mut headers = vec!["ID".to_string(), "Kind".to_string(), "Name".to_string()];
        headers.extend(grid.buckets.iter().map(|bucket| bucket.label.clone()));

        let table_rows = rows
            .iter()
            .map(|row| {
                let code = item_color(row.item);
                let mut cells = vec![
                    row.item.id.to_string(),
                    row.item.kind.as_str().to_string(),
                    row.item.name.clone(),
                ];
                cells.extend(row.cells.iter().map(|active| {
                    if *active {
                        self.paint(ACTIVE_CELL, code)
                    } else {
                        IDLE_CELL.to_string()
                    }
                }));
                cells
            })
            .collect();

        write_table(writer, headers, table_rows)
    }

    #[tracing::instrument(skip(self, assets))]
    pub fn print_asset_table(&self, assets: &[AssetGroup]) -> anyhow::Result<()> {
        let headers = vec![
            "ID".to_string(),
            "Site".to_string(),
            "Area".to_string(),
            "Name".to_string(),
            "Description".to_string(),
        ];
        let rows = assets
            .iter()
            .map(|asset| {
                vec![
                    self.paint(&asset.id.to_string(), "33"),
                    asset.site.clone(),
                    asset.area.clone(),
                    asset.name.clone(),
                    asset.description.clone(),
                ]
            })
            .collect();
        write_table(io::stdout().lock(), headers, rows)
    }

    #[tracing::instrument(skip(self, strategies, assets))]
    pub fn print_strategy_table(
        &self,
        strategies: &[Strategy],
        assets: &[AssetGroup],
    ) -> anyhow::Result<()> {
        let headers = vec![
            "ID".to_string(),
            "Priority".to_string(),
            "Asset group".to_string(),
            "Start".to_string(),
            "End".to_string(),
            "Every".to_string(),
            "Name".to_string(),
        ];
        let rows = strategies
            .iter()
            .map(|strategy| {
                let asset = find_by_id(assets, strategy.asset_group)
                    .map(|a| a.name.clone())
                    .unwrap_or_else(|| format!("#{}", strategy.asset_group));
                vec![
                    self.paint(&strategy.id.to_string(), "33"),
                    self.paint(strategy.priority.as_str(), priority_color(strategy.priority)),
                    asset,
                    date_cell(strategy.start),
                    date_cell(strategy.end),
                    strategy
                        .frequency_days
                        .map(|days| format!("{days}d"))
                        .unwrap_or_default(),
                    strategy.name.clone(),
                ]
            })
            .collect();
        write_table(io::stdout().lock(), headers, rows)
    }

    #[tracing::instrument(skip(self, stops))]
    pub fn print_stop_table(&self, stops: &[Stop]) -> anyhow::Result<()> {
        let headers = vec![
            "ID".to_string(),
            "Status".to_string(),
            "Start".to_string(),
            "End".to_string(),
            "Assets".to_string(),
            "Name".to_string(),
        ];
        let rows = stops
            .iter()
            .map(|stop| {
                vec![
                    self.paint(&stop.id.to_string(), "33"),
                    stop.status.as_str().to_string(),
                    date_cell(stop.start),
                    date_cell(stop.end),
                    stop.asset_groups
                        .iter()
                        .map(u64::to_string)
                        .collect::<Vec<_>>()
                        .join(","),
                    stop.name.clone(),
                ]
            })
            .collect();
        write_table(io::stdout().lock(), headers, rows)
    }

    #[tracing::instrument(skip(self, tasks, now))]
    pub fn print_task_table(&self, tasks: &[MaintenanceTask], now: DateTime<Utc>) -> anyhow::Result<()> {
        let headers = vec![
            "ID".to_string(),
            "Stop".to_string(),
            "Planned".to_string(),
            "Progress".to_string(),
            "Description".to_string(),
        ];
        let rows = tasks
            .iter()
            .map(|task| {
                let pct = FlowContext::Edit
                    .policy()
                    .estimate(&CompletionInput::from(task), now);
                let planned = format!(
                    "{}..{}",
                    date_cell(task.planned_start),
                    date_cell(task.planned_end)
                );
                let overdue = task.actual_end.is_none()
                    && task.planned_end.is_some_and(|end| end < now);
                vec![
                    self.paint(&task.id.to_string(), "33"),
                    task.stop.map(|id| id.to_string()).unwrap_or_default(),
                    if overdue {
                        self.paint(&planned, "31")
                    } else {
                        planned
                    },
                    progress_bar(pct),
                    task.description.clone(),
                ]
            })
            .collect();
        write_table(io::stdout().lock(), headers, rows)
    }

    #[tracing::instrument(skip(self, task, now))]
    pub fn print_task_info(&self, task: &MaintenanceTask, now: DateTime<Utc>) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();
        let input = CompletionInput::from(task);

        writeln!(out, "id             {}", task.id)?;
        writeln!(out, "uuid           {}", task.uuid)?;
        writeln!(out, "description    {}", task.description)?;
        if let Some(stop) = task.stop {
            writeln!(out, "stop           {stop}")?;
        }
        if let Some(strategy) = task.strategy {
            writeln!(out, "strategy       {strategy}")?;
        }
        for (label, value) in [
            ("planned start", task.planned_start),
            ("planned end", task.planned_end),
            ("actual start", task.actual_start),
            ("actual end", task.actual_end),
        ] {
            if let Some(dt) = value {
                writeln!(out, "{label:<14} {}", dt.to_rfc3339())?;
            }
        }
        for flow in [FlowContext::Create, FlowContext::Edit] {
            let policy = flow.policy();
            writeln!(
                out,
                "{:<14} {}",
                policy.name(),
                progress_bar(policy.estimate(&input, now))
            )?;
        }
        writeln!(out, "entry          {}", task.entry.to_rfc3339())?;
        writeln!(out, "modified       {}", task.modified.to_rfc3339())?;

        Ok(())
    }

    fn paint(&self, text: &str, code: &str) -> String {
        if !self.color {
            return text.to_string();
        }
        format!("\x1b[{code}m{text}\x1b[0m")
    }
}

pub fn progress_bar(pct: u8) -> String {
    let pct = pct.min(100);
    let filled = usize::from(pct) * BAR_WIDTH / 100;
    format!(
        "[{}{}] {pct:>3}%",
        "#".repeat(filled),
        "-".repeat(BAR_WIDTH - filled)
    )
}

fn item_color(item: &ScheduleItem) -> &'static str {
    match (item.kind, item.priority) {
        (ItemKind::Strategy, Some(priority)) => priority_color(priority),
        (ItemKind::Strategy, None) => "33",
        (ItemKind::Stop, _) => "36",
    }
}

fn priority_color(priority: Priority) -> &'static str {
    match priority {
        Priority::High => "31",
        Priority::Medium => "33",
        Priority::Low => "32",
    }
}

fn date_cell(value: Option<DateTime<Utc>>) -> String {
    value.map(format_project_date).unwrap_or_default()
}

fn write_table<W: Write>(
    mut writer: W,
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
) -> anyhow::Result<()> {
    let column_count = headers.len();
    let mut widths = vec![0usize; column_count];

    for (idx, header) in headers.iter().enumerate() {
        widths[idx] = widths[idx].max(UnicodeWidthStr::width(header.as_str()));
    }

    for row in &rows {
        for (idx, cell) in row.iter().enumerate().take(column_count) {
            widths[idx] = widths[idx].max(UnicodeWidthStr::width(strip_ansi(cell).as_str()));
        }
    }

    for (header, width) in headers.iter().zip(&widths) {
        write!(writer, "{header:width$} ", width = *width)?;
    }
    writeln!(writer)?;

    for width in &widths {
        write!(writer, "{:-<width$} ", "", width = *width)?;
    }
    writeln!(writer)?;

    for row in rows {
        for (cell, width) in row.iter().zip(&widths) {
            let visible_width = UnicodeWidthStr::width(strip_ansi(cell).as_str());
            let padding = width.saturating_sub(visible_width);
            write!(writer, "{}{} ", cell, " ".repeat(padding))?;
        }
        writeln!(writer)?;
    }

    Ok(())
}

fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut escaped = false;

    for ch in s.chars() {
        if escaped {
            if ch == 'm' {
                escaped = false;
            }
            continue;
        }

        if ch == '\x1b' {
            escaped = true;
            continue;
        }

        out.push(ch);
    }

    out
}
