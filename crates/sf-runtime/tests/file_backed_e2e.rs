//! The file-backed collaborators the binary runs with.

mod common;

use std::path::Path;
use std::time::Duration;

use serde_json::{Value, json};

use sf_config::EngineConfig;
use sf_core::record::WindowResult;
use sf_runtime::lifecycle::{Collaborators, Pipeline};

use common::{eventually, stop};

const WAIT: Duration = Duration::from_secs(5);

fn file_config(dir: &Path) -> EngineConfig {
    let mut config = common::config();
    config.source.path = dir.join("in/events.jsonl");
    config.sink.path = dir.join("out/results.jsonl");
    config.dead_letter.path = dir.join("out/dead_letter.jsonl");
    config.checkpoint.dir = dir.join("state");
    config
}

fn read_lines(path: &Path) -> Vec<Value> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

fn write_events(path: &Path, events: &[Value]) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let body: String = events.iter().map(|e| format!("{e}\n")).collect();
    std::fs::write(path, body).unwrap();
}

#[tokio::test]
async fn jsonl_in_jsonl_out_with_durable_checkpoints() {
    let dir = tempfile::tempdir().unwrap();
    let config = file_config(dir.path());
    write_events(
        &config.source.path,
        &[
            json!({ "key": "a", "event_time": 5, "payload": { "value": 1.5 } }),
            json!({ "key": "a", "event_time": 35, "payload": { "value": 2.5 } }),
            json!({ "key": "a", "event_time": 40, "payload": "not an object" }),
            json!({ "key": "a", "event_time": 70, "payload": { "value": 1.0 } }),
        ],
    );

    let parts = Collaborators::from_config(&config);
    let pipeline = Pipeline::start(config.clone(), parts).await.unwrap();
    assert_eq!(pipeline.recovered_checkpoint(), None);
    let results_path = config.sink.path.clone();
    assert!(eventually(WAIT, || async { !read_lines(&results_path).is_empty() }).await);
    assert!(eventually(WAIT, || async { pipeline.in_flight() == 0 }).await);
    stop(pipeline).await;

    let results: Vec<WindowResult> = read_lines(&config.sink.path)
        .into_iter()
        .map(|v| serde_json::from_value(v).unwrap())
        .collect();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].value, json!(4.0));
    assert_eq!(results[0].record_count, 2);

    let dead = read_lines(&config.dead_letter.path);
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0]["error_kind"], json!("permanent"));

    let checkpoints = std::fs::read_dir(&config.checkpoint.dir).unwrap().count();
    assert!(checkpoints >= 1);

    // A restart resumes from the checkpoint and replays nothing.
    let parts = Collaborators::from_config(&config);
    let pipeline = Pipeline::start(config.clone(), parts).await.unwrap();
    assert!(pipeline.recovered_checkpoint().is_some());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(pipeline.metrics().source_records(), 0);
    stop(pipeline).await;
    assert_eq!(read_lines(&config.sink.path).len(), 1);
}

#[tokio::test]
async fn start_rejects_an_unknown_accumulator() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = file_config(dir.path());
    config.accumulator.kind = "median".into();
    let parts = Collaborators::from_config(&config);
    assert!(Pipeline::start(config, parts).await.is_err());
}
