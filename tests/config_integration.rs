//! Integration tests for loading execution settings from disk

mod common;

use acero_rs::batch::Table;
use acero_rs::plan::nodes::{SinkNodeOptions, TableSourceNodeOptions};
use acero_rs::plan::{make_exec_node, BackpressureOptions};
use acero_rs::{ErrorKind, ExecConfig, ExecContext, ExecPlan};
use common::builders::basic_batches;
use std::sync::Arc;
use tempfile::TempDir;

#[test]
fn test_save_and_load_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("exec.toml");
    let config = ExecConfig {
        worker_threads: Some(2),
        table_source_batch_size: 4096,
        sink_backpressure: Some(BackpressureOptions::new(1 << 10, 1 << 20)),
        ..ExecConfig::threaded()
    };

    config.save(&path).unwrap();
    assert!(path.exists());
    assert_eq!(ExecConfig::load(&path).unwrap(), config);
}

#[test]
fn test_load_missing_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("absent.toml");
    let err = ExecConfig::load(&path).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
    assert_eq!(ExecConfig::load_or_default(&path), ExecConfig::default());
}

#[test]
fn test_load_or_default_on_invalid_content() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("exec.toml");
    std::fs::write(&path, "table_source_batch_size = 0\n").unwrap();
    assert!(ExecConfig::load(&path).is_err());
    assert_eq!(ExecConfig::load_or_default(&path), ExecConfig::default());
}

#[test]
fn test_loaded_config_drives_table_source() {
    common::init_logging();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("exec.toml");
    std::fs::write(
        &path,
        "use_threads = true\nworker_threads = 2\ntable_source_batch_size = 1\n",
    )
    .unwrap();
    let config = ExecConfig::load(&path).unwrap();
    let ctx = ExecContext::from_config(&config).unwrap();
    assert!(ctx.use_threads());
    assert_eq!(ctx.executor().parallelism(), 2);

    let plan = ExecPlan::make(ctx);
    let data = basic_batches();
    let table = Arc::new(Table::from_batches(data.schema.clone(), data.batches.clone()).unwrap());
    let source = make_exec_node(
        "table_source",
        &plan,
        Vec::new(),
        TableSourceNodeOptions::new(table),
    )
    .unwrap();
    let sink_options = SinkNodeOptions::new();
    let generator = sink_options.generator();
    make_exec_node("sink", &plan, vec![source], sink_options).unwrap();

    let batches = common::start_and_collect(&plan, generator).unwrap();
    assert_eq!(batches.len(), 5);
    assert_eq!(common::sorted_rows(&batches), data.all_rows());
}
