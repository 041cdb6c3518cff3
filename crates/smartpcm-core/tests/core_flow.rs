use chrono::{DateTime, Duration, TimeZone, Utc};
use chrono_tz::America::Sao_Paulo;
use smartpcm_core::commands::merge_import;
use smartpcm_core::completion::{CompletionInput, FlowContext, estimate};
use smartpcm_core::datastore::{DataStore, next_id};
use smartpcm_core::filter::Filter;
use smartpcm_core::grid::{GridConfig, Granularity, generate_buckets};
use smartpcm_core::model::{AssetGroup, MaintenanceTask, Priority, Stop, Strategy};
use smartpcm_core::validate;
use tempfile::tempdir;

fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, 0, 0)
        .single()
        .expect("valid instant")
}

#[test]
fn plan_a_year_and_track_a_task() {
    let dir = tempdir().expect("tempdir");
    let store = DataStore::open(dir.path()).expect("open store");
    let now = at(2025, 3, 12, 15);

    let before = store.load_snapshot().expect("load");
    let mut after = before.clone();

    let mut pumps = AssetGroup::new(next_id(&after.assets), "Pumps".to_string(), now);
    pumps.site = "North".to_string();
    pumps.area = "Utilities".to_string();
    validate::asset_group(&pumps).expect("valid asset group");
    after.assets.push(pumps);

    let mut lube = Strategy::new(next_id(&after.strategies), "Lubrication".to_string(), 1, now);
    lube.priority = Priority::High;
    lube.start = Some(at(2025, 3, 10, 12));
    lube.end = Some(at(2025, 3, 20, 12));
    validate::strategy(&lube, &after).expect("valid strategy");
    after.strategies.push(lube);

    let mut shutdown = Stop::new(next_id(&after.stops), "Annual shutdown".to_string(), now);
    shutdown.asset_groups = vec![1];
    shutdown.start = Some(at(2025, 7, 1, 12));
    shutdown.end = Some(at(2025, 8, 15, 12));
    validate::stop(&shutdown, &after).expect("valid stop");
    after.stops.push(shutdown);

    let mut seals = MaintenanceTask::new(next_id(&after.tasks), "Replace seals".to_string(), now);
    seals.stop = Some(1);
    seals.planned_start = Some(at(2025, 3, 12, 3));
    seals.planned_end = Some(at(2025, 3, 13, 3));
    seals.actual_start = Some(at(2025, 3, 12, 3));
    validate::task(&seals, &after).expect("valid task");
    after.tasks.push(seals);

    store.commit(&before, &after).expect("commit");

    let snapshot = store.load_snapshot().expect("reload");
    let items = snapshot.schedule_items();
    assert_eq!(items.len(), 2);

    let grid = generate_buckets(&GridConfig::new(2025)).expect("weeks");
    assert_eq!(grid.buckets.len(), 52);
    let rows = grid.rows(&items, &Sao_Paulo);
    let active_weeks: Vec<Vec<u32>> = rows
        .iter()
        .map(|row| {
            grid.buckets
                .iter()
                .zip(&row.cells)
                .filter(|(_, active)| **active)
                .map(|(bucket, _)| bucket.value)
                .collect()
        })
        .collect();
    assert_eq!(active_weeks[0], vec![11, 12]);
    assert_eq!(active_weeks[1], (27..=33).collect::<Vec<u32>>());

    let mut months = GridConfig::new(2025);
    months.mode = Granularity::Months;
    let grid = generate_buckets(&months).expect("months");
    let rows = grid.rows(&items, &Sao_Paulo);
    assert_eq!(rows[1].cells.iter().filter(|c| **c).count(), 2);

    let filter = Filter::parse(&["kind:stop".to_string()]).expect("filter");
    let stops: Vec<&str> = items
        .iter()
        .filter(|item| filter.matches(item, &snapshot.assets))
        .map(|item| item.name.as_str())
        .collect();
    assert_eq!(stops, vec!["Annual shutdown"]);

    let input = CompletionInput::from(&snapshot.tasks[0]);
    assert_eq!(estimate(FlowContext::Create, &input, now), 50);
    assert_eq!(estimate(FlowContext::Edit, &input, now), 50);

    let late = now + Duration::days(3);
    assert_eq!(estimate(FlowContext::Create, &input, late), 99);
    assert_eq!(estimate(FlowContext::Edit, &input, late), 100);

    assert_eq!(store.undo_last().expect("undo"), Some(0));
    assert!(store.load_snapshot().expect("reload").assets.is_empty());
}

#[test]
fn export_then_import_into_an_empty_store() {
    let now = at(2025, 3, 12, 15);
    let source = tempdir().expect("tempdir");
    let store = DataStore::open(source.path()).expect("open store");

    let before = store.load_snapshot().expect("load");
    let mut after = before.clone();
    let mut kilns = AssetGroup::new(3, "Kilns".to_string(), now);
    kilns.site = "South".to_string();
    kilns.area = "Process".to_string();
    after.assets.push(kilns);
    let mut reline = Stop::new(4, "Kiln reline".to_string(), now);
    reline.asset_groups = vec![3];
    after.stops.push(reline);
    store.commit(&before, &after).expect("commit");

    let exported = serde_json::to_string(&store.load_snapshot().expect("load")).expect("json");

    let target = tempdir().expect("tempdir");
    let other = DataStore::open(target.path()).expect("open target");
    let mut merged = other.load_snapshot().expect("load");
    let counts = merge_import(&mut merged, &exported, now, &Sao_Paulo).expect("import");
    assert_eq!(counts.added, 2);
    other.save_snapshot(&merged).expect("save");

    let reloaded = other.load_snapshot().expect("reload");
    assert_eq!(reloaded.assets[0].id, 3);
    assert_eq!(reloaded.stops[0].asset_groups, vec![3]);

    let again = merge_import(&mut merged, &exported, now, &Sao_Paulo).expect("re-import");
    assert_eq!(again.added, 0);
    assert_eq!(again.updated, 2);
}
