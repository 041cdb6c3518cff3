use std::collections::HashMap;
use std::io::{self, Read};

use anyhow::{Context, anyhow, bail};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::cli::Invocation;
use crate::completion::{CompletionInput, FlowContext};
use crate::config::Config;
use crate::datastore::{DataStore, Record, Snapshot, find_by_id, find_by_id_mut, next_id};
use crate::datetime::{current_year, parse_date_expr_in, parse_instant_lenient, project_timezone};
use crate::filter::Filter;
use crate::grid::{GridConfig, generate_buckets, parse_month};
use crate::model::{
    AssetGroup, MaintenanceTask, Priority, ScheduleItem, Stop, StopStatus, Strategy,
};
use crate::render::{Renderer, progress_bar};
use crate::validate;

const MIN_ABBREV_LEN: usize = 2;

pub fn known_command_names() -> Vec<&'static str> {
    vec![
        "asset",
        "assets",
        "strategy",
        "strategies",
        "stop",
        "stops",
        "task",
        "tasks",
        "schedule",
        "completion",
        "undo",
        "export",
        "import",
        "show",
        "help",
        "version",
    ]
}

pub fn expand_command_abbrev<'a>(token: &'a str, known: &[&'a str]) -> Option<&'a str> {
    if known.contains(&token) {
        return Some(token);
    }
    if token.len() < MIN_ABBREV_LEN {
        return None;
    }

    let mut matches = known.iter().copied().filter(|name| name.starts_with(token));
    let first = matches.next()?;
    if matches.next().is_some() {
        None
    } else {
        Some(first)
    }
}

#[instrument(skip(store, cfg, renderer, inv))]
pub fn dispatch(
    store: &DataStore,
    cfg: &Config,
    renderer: &Renderer,
    inv: Invocation,
) -> anyhow::Result<()> {
    let now = Utc::now();
    let tz = project_timezone();
    let command = inv.command.as_str();

    debug!(
        command,
        filter = ?inv.filter_terms,
        args = ?inv.command_args,
        "dispatching command"
    );

    if !inv.filter_terms.is_empty() && !command_uses_filter(command) {
        warn!(command, "filter terms are ignored by this command");
    }

    match command {
        "asset" => cmd_asset(store, renderer, &inv.command_args, now, tz),
        "assets" => cmd_assets(store, renderer, &inv.filter_terms),
        "strategy" => cmd_strategy(store, renderer, &inv.command_args, now, tz),
        "strategies" => cmd_strategies(store, renderer, &inv.filter_terms),
        "stop" => cmd_stop(store, renderer, &inv.command_args, now, tz),
        "stops" => cmd_stops(store, renderer, &inv.filter_terms),
        "task" => cmd_task(store, renderer, &inv.command_args, now, tz),
        "tasks" => cmd_tasks(store, renderer, &inv.filter_terms, now),
        "schedule" => cmd_schedule(store, cfg, renderer, &inv.filter_terms, &inv.command_args, now, tz),
        "completion" => cmd_completion(store, &inv.command_args, now, tz),
        "undo" => cmd_undo(store),
        "export" => cmd_export(store),
        "import" => cmd_import(store, now, tz),
        "show" => cmd_show(cfg),
        "help" => cmd_help(),
        "version" => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        other => Err(anyhow!("unknown command: {other}")),
    }
}

fn command_uses_filter(command: &str) -> bool {
    matches!(
        command,
        "assets" | "strategies" | "stops" | "tasks" | "schedule"
    )
}

/// What to do with one record type.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Action {
    Add(Vec<String>),
    Modify(u64, Vec<String>),
    Delete(u64),
    Info(u64),
}

fn parse_action(entity: &str, args: &[String]) -> anyhow::Result<Action> {
    let Some((verb, rest)) = args.split_first() else {
        bail!("{entity}: expected add, modify, delete or info");
    };

    if let Ok(id) = verb.parse::<u64>() {
        return match rest.split_first() {
            None => Ok(Action::Info(id)),
            Some((next, tail)) => action_for(entity, next, id, tail),
        };
    }

    match verb.to_ascii_lowercase().as_str() {
        "add" | "new" => Ok(Action::Add(rest.to_vec())),
        other => {
            let (id, tail) = parse_id_arg(entity, rest)?;
            action_for(entity, other, id, tail)
        }
    }
}

fn action_for(entity: &str, verb: &str, id: u64, tail: &[String]) -> anyhow::Result<Action> {
    match verb.to_ascii_lowercase().as_str() {
        "modify" | "mod" | "edit" => Ok(Action::Modify(id, tail.to_vec())),
        "delete" | "del" | "rm" => Ok(Action::Delete(id)),
        "info" | "show" => Ok(Action::Info(id)),
        other => Err(anyhow!("{entity}: unknown action: {other}")),
    }
}

fn parse_id_arg<'a>(entity: &str, args: &'a [String]) -> anyhow::Result<(u64, &'a [String])> {
    let Some((first, rest)) = args.split_first() else {
        bail!("{entity}: an id is required");
    };
    let id = first
        .parse()
        .map_err(|_| anyhow!("{entity}: invalid id: {first}"))?;
    Ok((id, rest))
}

#[derive(Debug, Clone, PartialEq)]
enum Mod {
    Name(String),
    Description(String),
    Site(String),
    Area(String),
    Asset(u64),
    Assets(Vec<u64>),
    Priority(Priority),
    Status(StopStatus),
    Every(Option<u32>),
    Start(Option<DateTime<Utc>>),
    End(Option<DateTime<Utc>>),
    Stop(Option<u64>),
    Strategy(Option<u64>),
    PlannedStart(Option<DateTime<Utc>>),
    PlannedEnd(Option<DateTime<Utc>>),
    ActualStart(Option<DateTime<Utc>>),
    ActualEnd(Option<DateTime<Utc>>),
}

impl Mod {
    fn key(&self) -> &'static str {
        match self {
            Mod::Name(_) => "name",
            Mod::Description(_) => "desc",
            Mod::Site(_) => "site",
            Mod::Area(_) => "area",
            Mod::Asset(_) => "asset",
            Mod::Assets(_) => "assets",
            Mod::Priority(_) => "priority",
            Mod::Status(_) => "status",
            Mod::Every(_) => "every",
            Mod::Start(_) => "start",
            Mod::End(_) => "end",
            Mod::Stop(_) => "stop",
            Mod::Strategy(_) => "strategy",
            Mod::PlannedStart(_) => "planned_start",
            Mod::PlannedEnd(_) => "planned_end",
            Mod::ActualStart(_) => "actual_start",
            Mod::ActualEnd(_) => "actual_end",
        }
    }
}

/// Splits arguments into free words and `key:value` modifiers.
#[instrument(skip(args, now, tz))]
fn parse_words_and_mods(
    args: &[String],
    now: DateTime<Utc>,
    tz: &Tz,
) -> anyhow::Result<(String, Vec<Mod>)> {
    let mut words = Vec::new();
    let mut mods = Vec::new();

    let mut literal = false;
    for arg in args {
        if arg == "--" {
            literal = true;
            continue;
        }

        if !literal && let Some(one_mod) = parse_one_mod(arg, now, tz)? {
            mods.push(one_mod);
            continue;
        }

        words.push(arg.clone());
    }

    Ok((words.join(" "), mods))
}

fn parse_one_mod(tok: &str, now: DateTime<Utc>, tz: &Tz) -> anyhow::Result<Option<Mod>> {
    let Some((key, value)) = tok.split_once(':') else {
        return Ok(None);
    };
    let value = value.trim();

    let one_mod = match key.to_ascii_lowercase().as_str() {
        "name" => Mod::Name(value.to_string()),
        "desc" | "description" => Mod::Description(value.to_string()),
        "site" => Mod::Site(value.to_string()),
        "area" => Mod::Area(value.to_string()),
        "asset" => Mod::Asset(parse_id(key, value)?),
        "assets" => Mod::Assets(parse_id_list(value)?),
        "pri" | "priority" => Mod::Priority(value.parse()?),
        "status" => Mod::Status(value.parse()?),
        "every" | "frequency" => Mod::Every(optional(value, |v| {
            v.trim_end_matches('d')
                .parse::<u32>()
                .map_err(|_| anyhow!("invalid frequency: {v}"))
        })?),
        "start" => Mod::Start(optional_date(value, now, tz)?),
        "end" => Mod::End(optional_date(value, now, tz)?),
        "stop" => Mod::Stop(optional(value, |v| parse_id(key, v))?),
        "strategy" => Mod::Strategy(optional(value, |v| parse_id(key, v))?),
        "planned_start" | "pstart" => Mod::PlannedStart(optional_date(value, now, tz)?),
        "planned_end" | "pend" => Mod::PlannedEnd(optional_date(value, now, tz)?),
        "actual_start" | "astart" => Mod::ActualStart(optional_date(value, now, tz)?),
        "actual_end" | "aend" => Mod::ActualEnd(optional_date(value, now, tz)?),
        _ => return Ok(None),
    };

    Ok(Some(one_mod))
}

/// An empty value clears the field.
fn optional<T>(value: &str, parse: impl FnOnce(&str) -> anyhow::Result<T>) -> anyhow::Result<Option<T>> {
    if value.is_empty() {
        return Ok(None);
    }
    parse(value).map(Some)
}

fn optional_date(value: &str, now: DateTime<Utc>, tz: &Tz) -> anyhow::Result<Option<DateTime<Utc>>> {
    optional(value, |v| parse_date_expr_in(v, now, tz))
}

fn parse_id(key: &str, value: &str) -> anyhow::Result<u64> {
    value
        .parse()
        .map_err(|_| anyhow!("invalid {key} id: {value}"))
}

fn parse_id_list(value: &str) -> anyhow::Result<Vec<u64>> {
    let mut ids = Vec::new();
    for part in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let id = parse_id("asset", part)?;
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    Ok(ids)
}

fn not_applicable(one_mod: &Mod, entity: &str) -> anyhow::Error {
    anyhow!("{}: does not apply to {entity}", one_mod.key())
}

fn apply_asset_mods(asset: &mut AssetGroup, mods: &[Mod]) -> anyhow::Result<()> {
    for one_mod in mods {
        match one_mod {
            Mod::Name(name) => asset.name = name.clone(),
            Mod::Description(desc) => asset.description = desc.clone(),
            Mod::Site(site) => asset.site = site.clone(),
            Mod::Area(area) => asset.area = area.clone(),
            other => return Err(not_applicable(other, "asset groups")),
        }
    }
    Ok(())
}

fn apply_strategy_mods(strategy: &mut Strategy, mods: &[Mod]) -> anyhow::Result<()> {
    for one_mod in mods {
        match one_mod {
            Mod::Name(name) => strategy.name = name.clone(),
            Mod::Description(desc) => strategy.description = desc.clone(),
            Mod::Asset(id) => strategy.asset_group = *id,
            Mod::Priority(priority) => strategy.priority = *priority,
            Mod::Every(days) => strategy.frequency_days = *days,
            Mod::Start(dt) => strategy.start = *dt,
            Mod::End(dt) => strategy.end = *dt,
            other => return Err(not_applicable(other, "strategies")),
        }
    }
    Ok(())
}

fn apply_stop_mods(stop: &mut Stop, mods: &[Mod]) -> anyhow::Result<()> {
    for one_mod in mods {
        match one_mod {
            Mod::Name(name) => stop.name = name.clone(),
            Mod::Description(desc) => stop.description = desc.clone(),
            Mod::Asset(id) => {
                if !stop.asset_groups.contains(id) {
                    stop.asset_groups.push(*id);
                }
            }
            Mod::Assets(ids) => stop.asset_groups = ids.clone(),
            Mod::Status(status) => stop.status = *status,
            Mod::Start(dt) => stop.start = *dt,
            Mod::End(dt) => stop.end = *dt,
            other => return Err(not_applicable(other, "stops")),
        }
    }
    Ok(())
}

fn apply_task_mods(task: &mut MaintenanceTask, mods: &[Mod]) -> anyhow::Result<()> {
    for one_mod in mods {
        match one_mod {
            Mod::Description(desc) | Mod::Name(desc) => task.description = desc.clone(),
            Mod::Stop(id) => task.stop = *id,
            Mod::Strategy(id) => task.strategy = *id,
            Mod::PlannedStart(dt) => task.planned_start = *dt,
            Mod::PlannedEnd(dt) => task.planned_end = *dt,
            Mod::ActualStart(dt) => task.actual_start = *dt,
            Mod::ActualEnd(dt) => task.actual_end = *dt,
            other => return Err(not_applicable(other, "tasks")),
        }
    }
    Ok(())
}

fn replace_record<T: Record>(records: &mut [T], record: T) {
    if let Some(slot) = find_by_id_mut(records, record.id()) {
        *slot = record;
    }
}

fn require<'a, T: Record>(records: &'a [T], entity: &str, id: u64) -> anyhow::Result<&'a T> {
    find_by_id(records, id).ok_or_else(|| anyhow!("{entity} {id} not found"))
}

#[instrument(skip(store, renderer, args, now, tz))]
fn cmd_asset(
    store: &DataStore,
    renderer: &Renderer,
    args: &[String],
    now: DateTime<Utc>,
    tz: &Tz,
) -> anyhow::Result<()> {
    info!("command asset");
    let before = store.load_snapshot()?;
    let mut after = before.clone();

    match parse_action("asset", args)? {
        Action::Add(rest) => {
            let (name, mods) = parse_words_and_mods(&rest, now, tz)?;
            let id = next_id(&after.assets);
            let mut asset = AssetGroup::new(id, name, now);
            apply_asset_mods(&mut asset, &mods)?;
            validate::asset_group(&asset)?;
            after.assets.push(asset);
            store.commit(&before, &after)?;
            println!("Created asset group {id}.");
        }
        Action::Modify(id, rest) => {
            let (name, mods) = parse_words_and_mods(&rest, now, tz)?;
            let mut asset = require(&after.assets, "asset group", id)?.clone();
            if !name.is_empty() {
                asset.name = name;
            }
            apply_asset_mods(&mut asset, &mods)?;
            asset.modified = now;
            validate::asset_group(&asset)?;
            replace_record(&mut after.assets, asset);
            store.commit(&before, &after)?;
            println!("Modified asset group {id}.");
        }
        Action::Delete(id) => {
            require(&after.assets, "asset group", id)?;
            validate::asset_group_deletable(&before, id)?;
            after.assets.retain(|asset| asset.id != id);
            store.commit(&before, &after)?;
            println!("Deleted asset group {id}.");
        }
        Action::Info(id) => {
            let asset = require(&before.assets, "asset group", id)?;
            renderer.print_asset_table(std::slice::from_ref(asset))?;
        }
    }

    Ok(())
}

#[instrument(skip(store, renderer, args, now, tz))]
fn cmd_strategy(
    store: &DataStore,
    renderer: &Renderer,
    args: &[String],
    now: DateTime<Utc>,
    tz: &Tz,
) -> anyhow::Result<()> {
    info!("command strategy");
    let before = store.load_snapshot()?;
    let mut after = before.clone();

    match parse_action("strategy", args)? {
        Action::Add(rest) => {
            let (name, mods) = parse_words_and_mods(&rest, now, tz)?;
            let asset_group = mods
                .iter()
                .find_map(|one_mod| match one_mod {
                    Mod::Asset(id) => Some(*id),
                    _ => None,
                })
                .ok_or_else(|| anyhow!("strategy add: asset:<id> is required"))?;
            let id = next_id(&after.strategies);
            let mut strategy = Strategy::new(id, name, asset_group, now);
            apply_strategy_mods(&mut strategy, &mods)?;
            validate::strategy(&strategy, &after)?;
            after.strategies.push(strategy);
            store.commit(&before, &after)?;
            println!("Created strategy {id}.");
        }
        Action::Modify(id, rest) => {
            let (name, mods) = parse_words_and_mods(&rest, now, tz)?;
            let mut strategy = require(&after.strategies, "strategy", id)?.clone();
            if !name.is_empty() {
                strategy.name = name;
            }
            apply_strategy_mods(&mut strategy, &mods)?;
            strategy.modified = now;
            validate::strategy(&strategy, &after)?;
            replace_record(&mut after.strategies, strategy);
            store.commit(&before, &after)?;
            println!("Modified strategy {id}.");
        }
        Action::Delete(id) => {
            require(&after.strategies, "strategy", id)?;
            validate::strategy_deletable(&before, id)?;
            after.strategies.retain(|strategy| strategy.id != id);
            store.commit(&before, &after)?;
            println!("Deleted strategy {id}.");
        }
        Action::Info(id) => {
            let strategy = require(&before.strategies, "strategy", id)?;
            renderer.print_strategy_table(std::slice::from_ref(strategy), &before.assets)?;
        }
    }

    Ok(())
}

#[instrument(skip(store, renderer, args, now, tz))]
fn cmd_stop(
    store: &DataStore,
    renderer: &Renderer,
    args: &[String],
    now: DateTime<Utc>,
    tz: &Tz,
) -> anyhow::Result<()> {
    info!("command stop");
    let before = store.load_snapshot()?;
    let mut after = before.clone();

    match parse_action("stop", args)? {
        Action::Add(rest) => {
            let (name, mods) = parse_words_and_mods(&rest, now, tz)?;
            let id = next_id(&after.stops);
            let mut stop = Stop::new(id, name, now);
            apply_stop_mods(&mut stop, &mods)?;
            validate::stop(&stop, &after)?;
            after.stops.push(stop);
            store.commit(&before, &after)?;
            println!("Created stop {id}.");
        }
        Action::Modify(id, rest) => {
            let (name, mods) = parse_words_and_mods(&rest, now, tz)?;
            let mut stop = require(&after.stops, "stop", id)?.clone();
            if !name.is_empty() {
                stop.name = name;
            }
            apply_stop_mods(&mut stop, &mods)?;
            stop.modified = now;
            validate::stop(&stop, &after)?;
            replace_record(&mut after.stops, stop);
            store.commit(&before, &after)?;
            println!("Modified stop {id}.");
        }
        Action::Delete(id) => {
            require(&after.stops, "stop", id)?;
            validate::stop_deletable(&before, id)?;
            after.stops.retain(|stop| stop.id != id);
            store.commit(&before, &after)?;
            println!("Deleted stop {id}.");
        }
        Action::Info(id) => {
            let stop = require(&before.stops, "stop", id)?;
            renderer.print_stop_table(std::slice::from_ref(stop))?;
        }
    }

    Ok(())
}

#[instrument(skip(store, renderer, args, now, tz))]
fn cmd_task(
    store: &DataStore,
    renderer: &Renderer,
    args: &[String],
    now: DateTime<Utc>,
    tz: &Tz,
) -> anyhow::Result<()> {
    info!("command task");
    let before = store.load_snapshot()?;
    let mut after = before.clone();

    match parse_action("task", args)? {
        Action::Add(rest) => {
            let (description, mods) = parse_words_and_mods(&rest, now, tz)?;
            let id = next_id(&after.tasks);
            let mut task = MaintenanceTask::new(id, description, now);
            apply_task_mods(&mut task, &mods)?;
            validate::task(&task, &after)?;
            let pct = FlowContext::Create
                .policy()
                .estimate(&CompletionInput::from(&task), now);
            after.tasks.push(task);
            store.commit(&before, &after)?;
            println!("Created task {id}. Completion {pct}%.");
        }
        Action::Modify(id, rest) => {
            let (description, mods) = parse_words_and_mods(&rest, now, tz)?;
            let mut task = require(&after.tasks, "task", id)?.clone();
            if !description.is_empty() {
                task.description = description;
            }
            apply_task_mods(&mut task, &mods)?;
            task.modified = now;
            validate::task(&task, &after)?;
            let pct = FlowContext::Edit
                .policy()
                .estimate(&CompletionInput::from(&task), now);
            replace_record(&mut after.tasks, task);
            store.commit(&before, &after)?;
            println!("Modified task {id}. Completion {pct}%.");
        }
        Action::Delete(id) => {
            require(&after.tasks, "task", id)?;
            after.tasks.retain(|task| task.id != id);
            store.commit(&before, &after)?;
            println!("Deleted task {id}.");
        }
        Action::Info(id) => {
            let task = require(&before.tasks, "task", id)?;
            renderer.print_task_info(task, now)?;
        }
    }

    Ok(())
}

#[instrument(skip(store, renderer, filter_terms))]
fn cmd_assets(store: &DataStore, renderer: &Renderer, filter_terms: &[String]) -> anyhow::Result<()> {
    info!("command assets");
    let filter = Filter::parse(filter_terms)?;
    if !filter.applies_to_assets() {
        bail!("assets: only asset:, site:, area: and text filters apply to asset groups");
    }

    let mut assets = store.load_assets()?;
    assets.retain(|asset| filter.matches_asset(asset));
    assets.sort_by_key(|asset| asset.id);
    renderer.print_asset_table(&assets)
}

#[instrument(skip(store, renderer, filter_terms))]
fn cmd_strategies(
    store: &DataStore,
    renderer: &Renderer,
    filter_terms: &[String],
) -> anyhow::Result<()> {
    info!("command strategies");
    let filter = Filter::parse(filter_terms)?;
    let snapshot = store.load_snapshot()?;

    let mut strategies: Vec<Strategy> = snapshot
        .strategies
        .iter()
        .filter(|strategy| filter.matches(&strategy.schedule_item(), &snapshot.assets))
        .cloned()
        .collect();
    strategies.sort_by_key(|strategy| strategy.id);
    renderer.print_strategy_table(&strategies, &snapshot.assets)
}

#[instrument(skip(store, renderer, filter_terms))]
fn cmd_stops(store: &DataStore, renderer: &Renderer, filter_terms: &[String]) -> anyhow::Result<()> {
    info!("command stops");
    let filter = Filter::parse(filter_terms)?;
    let snapshot = store.load_snapshot()?;

    let mut stops: Vec<Stop> = snapshot
        .stops
        .iter()
        .filter(|stop| filter.matches(&stop.schedule_item(), &snapshot.assets))
        .cloned()
        .collect();
    stops.sort_by_key(|stop| stop.id);
    renderer.print_stop_table(&stops)
}

#[instrument(skip(store, renderer, filter_terms, now))]
fn cmd_tasks(
    store: &DataStore,
    renderer: &Renderer,
    filter_terms: &[String],
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    info!("command tasks");
    let filter = Filter::parse(filter_terms)?;
    let snapshot = store.load_snapshot()?;

    let mut tasks: Vec<MaintenanceTask> = snapshot
        .tasks
        .iter()
        .filter(|task| task_matches(&filter, task, &snapshot))
        .cloned()
        .collect();
    tasks.sort_by_key(|task| task.id);
    renderer.print_task_table(&tasks, now)
}

/// A task is selected through the stop and strategy it belongs to.
fn task_matches(filter: &Filter, task: &MaintenanceTask, snapshot: &Snapshot) -> bool {
    if filter.is_empty() {
        return true;
    }
    let linked = [
        task.stop
            .and_then(|id| find_by_id(&snapshot.stops, id))
            .map(Stop::schedule_item),
        task.strategy
            .and_then(|id| find_by_id(&snapshot.strategies, id))
            .map(Strategy::schedule_item),
    ];
    linked
        .iter()
        .flatten()
        .any(|item| filter.matches(item, &snapshot.assets))
}

/// Applies `year:`, `month:`, `week:` and `mode:` in order; a later month or
/// week replaces an earlier one.
fn parse_schedule_args(
    cfg: &Config,
    args: &[String],
    now: DateTime<Utc>,
    tz: &Tz,
) -> anyhow::Result<GridConfig> {
    let mut config = GridConfig::new(current_year(now, tz));
    config.mode = cfg.grid_mode()?;

    for arg in args {
        let (key, value) = arg
            .split_once(':')
            .ok_or_else(|| anyhow!("schedule: expected key:value, got {arg}"))?;
        match key.to_ascii_lowercase().as_str() {
            "year" => {
                config.year = value
                    .parse()
                    .map_err(|_| anyhow!("schedule: invalid year: {value}"))?;
            }
            "month" => config.select_month(parse_month(value)?),
            "week" => config.select_week(
                value
                    .parse()
                    .map_err(|_| anyhow!("schedule: invalid week: {value}"))?,
            ),
            "mode" => config.mode = value.parse()?,
            other => bail!("schedule: unknown argument: {other}"),
        }
    }

    Ok(config)
}

#[instrument(skip(store, cfg, renderer, filter_terms, args, now, tz))]
fn cmd_schedule(
    store: &DataStore,
    cfg: &Config,
    renderer: &Renderer,
    filter_terms: &[String],
    args: &[String],
    now: DateTime<Utc>,
    tz: &Tz,
) -> anyhow::Result<()> {
    info!("command schedule");
    let config = parse_schedule_args(cfg, args, now, tz)?;
    let grid = generate_buckets(&config)?;

    let filter = Filter::parse(filter_terms)?;
    let snapshot = store.load_snapshot()?;
    let items: Vec<ScheduleItem> = snapshot
        .schedule_items()
        .into_iter()
        .filter(|item| filter.matches(item, &snapshot.assets))
        .collect();
    debug!(count = items.len(), "items on the grid");

    let rows = grid.rows(&items, tz);
    renderer.print_schedule(&config.title(), &grid, &rows)
}

fn parse_completion_args(
    args: &[String],
    snapshot: &Snapshot,
    now: DateTime<Utc>,
    tz: &Tz,
) -> anyhow::Result<(FlowContext, CompletionInput, DateTime<Utc>)> {
    let mut flow = FlowContext::default();
    let mut input = CompletionInput::default();
    let mut at = now;

    for arg in args {
        if let Ok(id) = arg.parse::<u64>() {
            input = CompletionInput::from(require(&snapshot.tasks, "task", id)?);
            continue;
        }

        let (key, value) = arg
            .split_once(':')
            .ok_or_else(|| anyhow!("completion: expected key:value, got {arg}"))?;
        match key.to_ascii_lowercase().as_str() {
            "flow" => flow = value.parse()?,
            "now" => at = parse_date_expr_in(value, now, tz)?,
            "planned_start" | "pstart" => input.planned_start = optional_date(value, now, tz)?,
            "planned_end" | "pend" => input.planned_end = optional_date(value, now, tz)?,
            "actual_start" | "astart" => input.actual_start = optional_date(value, now, tz)?,
            "actual_end" | "aend" => input.actual_end = optional_date(value, now, tz)?,
            other => bail!("completion: unknown argument: {other}"),
        }
    }

    Ok((flow, input, at))
}

#[instrument(skip(store, args, now, tz))]
fn cmd_completion(
    store: &DataStore,
    args: &[String],
    now: DateTime<Utc>,
    tz: &Tz,
) -> anyhow::Result<()> {
    info!("command completion");
    let snapshot = store.load_snapshot()?;
    let (flow, input, at) = parse_completion_args(args, &snapshot, now, tz)?;
    let policy = flow.policy();
    let pct = policy.estimate(&input, at);
    debug!(policy = policy.name(), pct, "estimated completion");
    println!("{} {}", policy.name(), progress_bar(pct));
    Ok(())
}

#[instrument(skip(store))]
fn cmd_undo(store: &DataStore) -> anyhow::Result<()> {
    info!("command undo");

    let Some(remaining) = store.undo_last()? else {
        println!("No undo transactions available.");
        return Ok(());
    };

    println!("Undo completed. {remaining} transaction(s) left.");
    Ok(())
}

#[instrument(skip(store))]
fn cmd_export(store: &DataStore) -> anyhow::Result<()> {
    info!("command export");
    let snapshot = store.load_snapshot()?;
    let out = serde_json::to_string_pretty(&snapshot)?;
    println!("{out}");
    Ok(())
}

/// Import payload before normalization. Records stay loose JSON so
/// malformed instants can be dropped instead of failing the whole file.
#[derive(Debug, Default, Deserialize)]
struct ImportSnapshot {
    #[serde(default)]
    assets: Vec<Value>,
    #[serde(default)]
    strategies: Vec<Value>,
    #[serde(default)]
    stops: Vec<Value>,
    #[serde(default)]
    tasks: Vec<Value>,
}

const INSTANT_FIELDS: [&str; 8] = [
    "start",
    "end",
    "planned_start",
    "planned_end",
    "actual_start",
    "actual_end",
    "entry",
    "modified",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportCounts {
    pub added: usize,
    pub updated: usize,
}

/// Merges an exported snapshot into `target`, matching records by uuid.
/// Unknown records keep their id when it is free.
#[instrument(skip(target, raw, now, tz))]
pub fn merge_import(
    target: &mut Snapshot,
    raw: &str,
    now: DateTime<Utc>,
    tz: &Tz,
) -> anyhow::Result<ImportCounts> {
    let incoming: ImportSnapshot =
        serde_json::from_str(raw).context("import: expected an exported snapshot object")?;

    let mut counts = ImportCounts::default();
    let mut remap = IdRemap::default();
    remap.assets = merge_records(&mut target.assets, incoming.assets, &remap, &mut counts, now, tz)
        .context("import: assets")?;
    remap.strategies =
        merge_records(&mut target.strategies, incoming.strategies, &remap, &mut counts, now, tz)
            .context("import: strategies")?;
    remap.stops = merge_records(&mut target.stops, incoming.stops, &remap, &mut counts, now, tz)
        .context("import: stops")?;
    merge_records(&mut target.tasks, incoming.tasks, &remap, &mut counts, now, tz)
        .context("import: tasks")?;

    for asset in &target.assets {
        validate::asset_group(asset).with_context(|| format!("import: asset group {}", asset.id))?;
    }
    for strategy in &target.strategies {
        validate::strategy(strategy, target)
            .with_context(|| format!("import: strategy {}", strategy.id))?;
    }
    for stop in &target.stops {
        validate::stop(stop, target).with_context(|| format!("import: stop {}", stop.id))?;
    }
    for task in &target.tasks {
        validate::task(task, target).with_context(|| format!("import: task {}", task.id))?;
    }

    Ok(counts)
}

/// Exported id to local id, per referenced collection.
#[derive(Debug, Default)]
struct IdRemap {
    assets: HashMap<u64, u64>,
    strategies: HashMap<u64, u64>,
    stops: HashMap<u64, u64>,
}

impl IdRemap {
    /// Points `asset_group`, `asset_groups`, `stop` and `strategy` at the
    /// ids the referenced records were given locally.
    fn rewrite(&self, obj: &mut Map<String, Value>) {
        if let Some(value) = obj.get_mut("asset_group") {
            remap_id(value, &self.assets);
        }
        if let Some(Value::Array(ids)) = obj.get_mut("asset_groups") {
            for value in ids {
                remap_id(value, &self.assets);
            }
        }
        if let Some(value) = obj.get_mut("stop") {
            remap_id(value, &self.stops);
        }
        if let Some(value) = obj.get_mut("strategy") {
            remap_id(value, &self.strategies);
        }
    }
}

fn remap_id(value: &mut Value, ids: &HashMap<u64, u64>) {
    if let Some(local) = value.as_u64().and_then(|id| ids.get(&id)) {
        *value = Value::from(*local);
    }
}

/// Returns the exported id to local id mapping of the merged records.
fn merge_records<T: Record + DeserializeOwned>(
    existing: &mut Vec<T>,
    incoming: Vec<Value>,
    remap: &IdRemap,
    counts: &mut ImportCounts,
    now: DateTime<Utc>,
    tz: &Tz,
) -> anyhow::Result<HashMap<u64, u64>> {
    let mut assigned = HashMap::new();

    for (idx, mut value) in incoming.into_iter().enumerate() {
        let Value::Object(obj) = &mut value else {
            bail!("record {} is not a JSON object", idx + 1);
        };
        remap.rewrite(obj);

        for field in INSTANT_FIELDS {
            let Some(raw) = obj.get(field) else {
                continue;
            };
            match parse_instant_lenient(raw.as_str(), tz) {
                Some(dt) => {
                    obj.insert(field.to_string(), Value::String(dt.to_rfc3339()));
                }
                None => {
                    warn!(field, record = idx + 1, "dropping unparseable instant");
                    obj.remove(field);
                }
            }
        }
        for field in ["entry", "modified"] {
            obj.entry(field)
                .or_insert_with(|| Value::String(now.to_rfc3339()));
        }

        let uuid = obj
            .get("uuid")
            .and_then(Value::as_str)
            .and_then(|raw| Uuid::parse_str(raw).ok())
            .unwrap_or_else(Uuid::new_v4);
        obj.insert("uuid".to_string(), Value::String(uuid.to_string()));

        let exported_id = obj.get("id").and_then(Value::as_u64);
        let position = existing.iter().position(|record| record.uuid() == uuid);
        let id = match position {
            Some(pos) => existing[pos].id(),
            None => exported_id
                .filter(|id| *id > 0 && find_by_id(existing, *id).is_none())
                .unwrap_or_else(|| next_id(existing)),
        };
        obj.insert("id".to_string(), Value::from(id));
        if let Some(exported) = exported_id {
            if exported != id {
                debug!(exported, id, "imported record renumbered");
            }
            assigned.entry(exported).or_insert(id);
        }

        let record: T = serde_json::from_value(value)
            .with_context(|| format!("record {} is invalid", idx + 1))?;
        match position {
            Some(pos) => {
                existing[pos] = record;
                counts.updated += 1;
            }
            None => {
                existing.push(record);
                counts.added += 1;
            }
        }
    }

    Ok(assigned)
}

#[instrument(skip(store, now, tz))]
fn cmd_import(store: &DataStore, now: DateTime<Utc>, tz: &Tz) -> anyhow::Result<()> {
    info!("command import");

    let mut stdin = String::new();
    io::stdin()
        .read_to_string(&mut stdin)
        .context("failed reading stdin")?;

    let trimmed = stdin.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("import: empty input"));
    }

    let before = store.load_snapshot()?;
    let mut after = before.clone();
    let counts = merge_import(&mut after, trimmed, now, tz)?;

    if counts.added + counts.updated > 0 {
        store.commit(&before, &after)?;
    }

    println!(
        "Imported {} record(s): {} added, {} updated.",
        counts.added + counts.updated,
        counts.added,
        counts.updated
    );
    Ok(())
}

fn cmd_show(cfg: &Config) -> anyhow::Result<()> {
    let mut entries: Vec<(&String, &String)> = cfg.iter().collect();
    entries.sort();
    for (k, v) in entries {
        println!("{k}={v}");
    }
    for path in &cfg.loaded_files {
        println!("# loaded {}", path.display());
    }
    Ok(())
}

fn cmd_help() -> anyhow::Result<()> {
    println!(
        "\
usage: smartpcm [flags] [filter...] <command> [args...]

  asset add <name> site:S area:A [desc:..]     asset <id> modify|delete
  strategy add <name> asset:<id> [priority:P] [start:D] [end:D] [every:N]
  stop add <name> assets:1,2 [start:D] [end:D] [status:S]
  task add <desc> [stop:<id>] [strategy:<id>] planned_start:D planned_end:D
  task <id> [info|modify|delete]
  assets | strategies | stops | tasks           list, filtered
  schedule [year:Y] [month:M | week:W] [mode:weeks|months]
  completion [flow:create|edit] [<task id>] planned_start:D ... [now:D]
  undo | export | import | show | help | version

filters: kind:strategy|stop priority:P status:S asset:<id> site:S area:A text, 'or'"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0)
            .single()
            .expect("valid now")
    }

    fn strings(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    fn seeded() -> Snapshot {
        let mut asset = AssetGroup::new(1, "Pumps".to_string(), now());
        asset.site = "North".to_string();
        asset.area = "Utilities".to_string();
        Snapshot {
            assets: vec![asset],
            ..Snapshot::default()
        }
    }

    #[test]
    fn abbreviations_must_be_unique_and_long_enough() {
        let known = known_command_names();
        assert_eq!(expand_command_abbrev("sched", &known), Some("schedule"));
        assert_eq!(expand_command_abbrev("stop", &known), Some("stop"));
        assert_eq!(expand_command_abbrev("strat", &known), None);
        assert_eq!(expand_command_abbrev("u", &known), None);
        assert_eq!(expand_command_abbrev("un", &known), Some("undo"));
    }

    #[test]
    fn actions_accept_id_first_or_verb_first() {
        assert_eq!(
            parse_action("task", &strings(&["3"])).expect("info"),
            Action::Info(3)
        );
        assert_eq!(
            parse_action("task", &strings(&["3", "modify", "astart:now"])).expect("modify"),
            Action::Modify(3, strings(&["astart:now"]))
        );
        assert_eq!(
            parse_action("stop", &strings(&["delete", "2"])).expect("delete"),
            Action::Delete(2)
        );
        assert!(parse_action("stop", &strings(&["delete"])).is_err());
        assert!(parse_action("stop", &strings(&["frobnicate", "1"])).is_err());
    }

    #[test]
    fn words_and_mods_are_separated() {
        let (name, mods) = parse_words_and_mods(
            &strings(&["Kiln", "reline", "assets:1,2,1", "status:active", "end:"]),
            now(),
            &chrono_tz::UTC,
        )
        .expect("parse");
        assert_eq!(name, "Kiln reline");
        assert_eq!(
            mods,
            vec![
                Mod::Assets(vec![1, 2]),
                Mod::Status(StopStatus::InProgress),
                Mod::End(None),
            ]
        );
    }

    #[test]
    fn mods_are_checked_per_record_type() {
        let mut asset = AssetGroup::new(1, "Pumps".to_string(), now());
        let err = apply_asset_mods(&mut asset, &[Mod::Priority(Priority::High)])
            .expect_err("priority is not an asset field");
        assert!(err.to_string().contains("priority"));

        let mut strategy = Strategy::new(1, "Lube".to_string(), 1, now());
        apply_strategy_mods(&mut strategy, &[Mod::Every(Some(14)), Mod::Priority(Priority::Low)])
            .expect("apply");
        assert_eq!(strategy.frequency_days, Some(14));
        assert_eq!(strategy.priority, Priority::Low);
    }

    #[test]
    fn later_month_or_week_wins() {
        let cfg = Config::default();
        let config = parse_schedule_args(
            &cfg,
            &strings(&["year:2025", "month:mar", "week:11"]),
            now(),
            &chrono_tz::UTC,
        )
        .expect("parse");
        assert_eq!(config.week, Some(11));
        assert_eq!(config.month, None);

        let config = parse_schedule_args(
            &cfg,
            &strings(&["week:11", "month:4"]),
            now(),
            &chrono_tz::UTC,
        )
        .expect("parse");
        assert_eq!(config.year, 2025);
        assert_eq!(config.month, Some(4));
        assert_eq!(config.week, None);
    }

    #[test]
    fn completion_args_read_task_and_overrides() {
        let mut snapshot = seeded();
        let mut task = MaintenanceTask::new(1, "Seals".to_string(), now());
        task.planned_start = Some(now() - Duration::days(1));
        task.planned_end = Some(now() + Duration::days(1));
        snapshot.tasks.push(task);

        let (flow, input, at) = parse_completion_args(
            &strings(&["flow:edit", "1"]),
            &snapshot,
            now(),
            &chrono_tz::UTC,
        )
        .expect("parse");
        assert_eq!(flow, FlowContext::Edit);
        assert_eq!(at, now());
        assert_eq!(flow.policy().estimate(&input, at), 50);

        assert!(
            parse_completion_args(&strings(&["9"]), &snapshot, now(), &chrono_tz::UTC).is_err()
        );
    }

    #[test]
    fn import_merges_by_uuid_and_tolerates_bad_instants() {
        let mut target = seeded();
        let uuid = target.assets[0].uuid;
        let raw = format!(
            r#"{{
              "assets": [
                {{"uuid": "{uuid}", "id": 1, "name": "Pumps", "site": "South", "area": "Utilities"}},
                {{"id": 1, "name": "Fans", "site": "North", "area": "HVAC"}}
              ],
              "stops": [
                {{"id": 5, "name": "Shutdown", "asset_groups": [1],
                  "start": "2025-03-10", "end": "not a date", "entry": 42}}
              ]
            }}"#
        );

        let counts = merge_import(&mut target, &raw, now(), &chrono_tz::UTC).expect("import");
        assert_eq!(counts, ImportCounts { added: 2, updated: 1 });
        assert_eq!(target.assets.len(), 2);
        assert_eq!(target.assets[0].site, "South");
        assert_eq!(target.assets[1].id, 2);

        let stop = &target.stops[0];
        assert_eq!(stop.id, 5);
        assert!(stop.start.is_some());
        assert_eq!(stop.end, None);
        assert_eq!(stop.entry, now());
    }

    #[test]
    fn import_rejects_dangling_references() {
        let mut target = seeded();
        let raw = r#"{"strategies": [{"name": "Lube", "asset_group": 9}]}"#;
        let err = merge_import(&mut target, raw, now(), &chrono_tz::UTC).expect_err("dangling");
        assert!(format!("{err:#}").contains("asset group 9"));
    }

    #[test]
    fn colliding_ids_keep_imported_links() {
        let mut target = seeded();
        target.strategies.push(Strategy::new(1, "Pump lube".to_string(), 1, now()));
        target.stops.push(Stop::new(1, "Pump overhaul".to_string(), now()));
        let raw = r#"{
          "assets": [{"id": 1, "name": "Kilns", "site": "South", "area": "Process"}],
          "strategies": [{"id": 1, "name": "Kiln lube", "asset_group": 1}],
          "stops": [{"id": 1, "name": "Reline", "asset_groups": [1]}],
          "tasks": [{"id": 1, "description": "Bricks", "stop": 1, "strategy": 1}]
        }"#;

        merge_import(&mut target, raw, now(), &chrono_tz::UTC).expect("import");

        let kilns = target.assets.iter().find(|a| a.name == "Kilns").expect("kilns");
        assert_eq!(kilns.id, 2);
        let lube = target.strategies.iter().find(|s| s.name == "Kiln lube").expect("lube");
        assert_eq!((lube.id, lube.asset_group), (2, 2));
        let reline = target.stops.iter().find(|s| s.name == "Reline").expect("reline");
        assert_eq!((reline.id, reline.asset_groups.clone()), (2, vec![2]));
        assert_eq!((target.tasks[0].stop, target.tasks[0].strategy), (Some(2), Some(2)));

        assert_eq!(target.strategies[0].asset_group, 1);
        assert_eq!(target.stops[0].asset_groups, Vec::<u64>::new());
    }

    #[test]
    fn tasks_are_filtered_through_their_stop() {
        let mut snapshot = seeded();
        let mut stop = Stop::new(1, "Shutdown".to_string(), now());
        stop.asset_groups = vec![1];
        snapshot.stops.push(stop);
        let mut linked = MaintenanceTask::new(1, "Seals".to_string(), now());
        linked.stop = Some(1);
        snapshot.tasks.push(linked);
        snapshot
            .tasks
            .push(MaintenanceTask::new(2, "Loose".to_string(), now()));

        let filter = Filter::parse(&strings(&["site:north"])).expect("filter");
        let ids: Vec<u64> = snapshot
            .tasks
            .iter()
            .filter(|task| task_matches(&filter, task, &snapshot))
            .map(|task| task.id)
            .collect();
        assert_eq!(ids, vec![1]);
    }
}
