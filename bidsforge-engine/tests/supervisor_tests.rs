//! Supervised conversion scripts: completion, failure and cancellation

#![cfg(unix)]

use bidsforge_common::config::SupervisorSettings;
use bidsforge_engine::supervisor::{RunOutcome, ScriptRunner};
use bidsforge_engine::EngineError;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tempfile::TempDir;

fn runner() -> ScriptRunner {
    ScriptRunner::new(SupervisorSettings {
        poll_interval_ms: 50,
        cancel_marker: ".cancel".to_string(),
    })
}

fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body).unwrap();
    path
}

#[tokio::test]
async fn test_successful_script_runs_completion_callback() {
    let scripts = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();
    let convert = script(scripts.path(), "convert.sh", "echo converting \"$1\"\ntouch \"$1/done\"\n");

    let called = AtomicBool::new(false);
    let outcome = runner()
        .run(work.path(), &convert, |dir| {
            assert!(dir.join("done").exists());
            called.store(true, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(outcome, RunOutcome::Completed);
    assert!(called.load(Ordering::SeqCst));
    assert!(fs::read_to_string(work.path().join("convert.log"))
        .unwrap()
        .starts_with("converting"));
}

#[tokio::test]
async fn test_failed_script_reports_last_error_line() {
    let scripts = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();
    let convert = script(
        scripts.path(),
        "convert.sh",
        "echo 'reading dicoms' >&2\necho 'dcm2niix: no valid DICOM files' >&2\nexit 3\n",
    );

    let outcome = runner()
        .run(work.path(), &convert, |_| panic!("callback must not run on failure"))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        RunOutcome::Failed {
            exit_code: Some(3),
            last_error: Some("dcm2niix: no valid DICOM files".to_string()),
        }
    );
}

#[tokio::test]
async fn test_cancel_marker_terminates_script() {
    let scripts = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();
    let convert = script(scripts.path(), "convert.sh", "echo started\nsleep 30 &\nwait\n");

    let runner = runner();
    let marker = runner.cancel_marker(work.path());
    let writer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        fs::write(marker, "").unwrap();
    });

    let outcome = tokio::time::timeout(
        Duration::from_secs(10),
        runner.run(work.path(), &convert, |_| panic!("callback must not run on cancel")),
    )
    .await
    .expect("cancellation should stop the script promptly")
    .unwrap();
    writer.await.unwrap();

    assert_eq!(outcome, RunOutcome::Canceled);
    assert!(work.path().join("convert.log.canceled").exists());
    assert!(work.path().join("convert.err.canceled").exists());
    assert!(!work.path().join("convert.log").exists());
}

#[tokio::test]
async fn test_callback_error_is_returned() {
    let scripts = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();
    let convert = script(scripts.path(), "convert.sh", "exit 0\n");

    let result = runner()
        .run(work.path(), &convert, |_| {
            Err(EngineError::MalformedDocument("dataset.json is empty".to_string()))
        })
        .await;

    assert!(matches!(result, Err(EngineError::MalformedDocument(_))));
}
