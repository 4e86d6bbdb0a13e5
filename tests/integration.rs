//! Integration tests for the ballot-interp CLI and worker pool.
//!
//! These run the real binary, both as a CLI and as pool worker processes,
//! against sheets whose interpretations are recorded in sidecar files.

use assert_cmd::Command;
use ballot_interp::error::JobError;
use ballot_interp::interpretation::{ImageDescriptor, PageInterpretation};
use ballot_interp::worker::{TerminationReason, WorkerCommand, WorkerPool, WorkerPoolConfig};
use predicates::prelude::*;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::tempdir;

/// Get a command for the ballot-interp binary.
fn ballot() -> Command {
    #[allow(deprecated)]
    let mut cmd = Command::cargo_bin("ballot-interp").unwrap();
    cmd.env_remove("BALLOT_LOG")
        .env_remove("BALLOT_LOG_FILE")
        .env_remove("BALLOT_WORKERS")
        .env_remove("RUST_LOG");
    cmd
}

fn metadata() -> Value {
    json!({
        "electionHash": "b1c0e5a9",
        "ballotStyleId": "12",
        "precinctId": "23",
        "ballotType": "precinct",
        "isTestMode": false
    })
}

fn bmd_page() -> Value {
    json!({
        "type": "InterpretedBmdPage",
        "ballotId": "bmd-0001",
        "metadata": metadata(),
        "votes": {"mayor": ["sherlock-holmes"]}
    })
}

fn hmpb_page(page_number: u32, requires_adjudication: bool) -> Value {
    let mut metadata = metadata();
    metadata["pageNumber"] = json!(page_number);
    json!({
        "type": "InterpretedHmpbPage",
        "metadata": metadata,
        "markInfo": {"marks": []},
        "votes": {"controller": ["winston-churchill"]},
        "adjudicationInfo": {"requiresAdjudication": requires_adjudication}
    })
}

fn blank_page() -> Value {
    json!({"type": "BlankPage"})
}

/// Write a fake scan and its recorded interpretation.
fn record(dir: &Path, name: &str, page: &Value) -> PathBuf {
    let image = dir.join(name);
    std::fs::write(&image, b"\x89PNG fake scan").unwrap();
    std::fs::write(
        dir.join(format!("{}.interpretation.json", name)),
        serde_json::to_string(page).unwrap(),
    )
    .unwrap();
    image
}

/// Directory of five sheets covering each castability outcome.
fn scan_dir() -> tempfile::TempDir {
    let dir = tempdir().unwrap();
    let d = dir.path();
    record(d, "0001-front.png", &bmd_page());
    record(d, "0001-back.png", &blank_page());
    record(d, "0002-front.png", &hmpb_page(1, false));
    record(d, "0002-back.png", &hmpb_page(2, false));
    record(d, "0003-front.png", &hmpb_page(1, false));
    record(d, "0003-back.png", &hmpb_page(2, true));
    record(d, "0004-front.png", &blank_page());
    record(d, "0004-back.png", &blank_page());
    record(d, "0005-front.png", &hmpb_page(1, false));
    // No recording: replayed as unreadable.
    std::fs::write(d.join("0005-back.png"), b"smudge").unwrap();
    dir
}

fn stdout_json(output: &std::process::Output) -> Value {
    serde_json::from_slice(&output.stdout).unwrap()
}

// ============================================================================
// CLI
// ============================================================================

#[test]
fn test_help() {
    ballot()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("sheet"))
        .stdout(predicate::str::contains("batch"))
        // The package description mentions workers; only the subcommand is hidden.
        .stdout(predicate::str::contains("  worker ").not());
}

#[test]
fn test_sheet_inline() {
    let dir = tempdir().unwrap();
    let front = record(dir.path(), "a-front.png", &bmd_page());
    let back = record(dir.path(), "a-back.png", &blank_page());

    let output = ballot()
        .args(["sheet", "--inline"])
        .arg(&front)
        .arg(&back)
        .output()
        .unwrap();
    assert!(output.status.success());

    let sheet = stdout_json(&output);
    assert_eq!(sheet["castability"], "CastableWithoutReview");
    assert_eq!(sheet["front"]["type"], "InterpretedBmdPage");
    assert_eq!(sheet["back"]["type"], "BlankPage");
}

#[test]
fn test_sheet_with_worker_processes() {
    let dir = tempdir().unwrap();
    let front = record(dir.path(), "b-front.png", &hmpb_page(1, false));
    let back = record(dir.path(), "b-back.png", &hmpb_page(2, true));

    let output = ballot()
        .args(["sheet", "--workers", "2"])
        .arg(&front)
        .arg(&back)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert_eq!(stdout_json(&output)["castability"], "CastableWithReview");
}

#[test]
fn test_sheet_missing_image_fails_naming_side() {
    let dir = tempdir().unwrap();
    let back = record(dir.path(), "c-back.png", &blank_page());

    ballot()
        .args(["sheet", "--workers", "1"])
        .arg(dir.path().join("c-front.png"))
        .arg(&back)
        .assert()
        .failure()
        .code(1)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("front page"))
        .stderr(predicate::str::contains("Image not found"));
}

#[test]
fn test_batch_decides_every_sheet() {
    let dir = scan_dir();
    let output = ballot()
        .args(["batch", "--workers", "3"])
        .arg(dir.path())
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let records = stdout_json(&output);
    let decisions: Vec<(&str, &str)> = records
        .as_array()
        .unwrap()
        .iter()
        .map(|r| {
            (
                r["sheet"].as_str().unwrap(),
                r["interpretation"]["castability"].as_str().unwrap(),
            )
        })
        .collect();
    assert_eq!(
        decisions,
        vec![
            ("0001", "CastableWithoutReview"),
            ("0002", "CastableWithoutReview"),
            ("0003", "CastableWithReview"),
            ("0004", "Uncastable"),
            ("0005", "Uncastable"),
        ]
    );
}

#[test]
fn test_batch_inline_matches_worker_processes() {
    let dir = scan_dir();
    let inline = ballot()
        .args(["batch", "--inline"])
        .arg(dir.path())
        .output()
        .unwrap();
    let pooled = ballot()
        .args(["batch", "-j", "4"])
        .arg(dir.path())
        .output()
        .unwrap();
    assert!(inline.status.success());
    assert!(pooled.status.success());
    assert_eq!(stdout_json(&inline), stdout_json(&pooled));
}

#[test]
fn test_batch_reports_failed_sheets() {
    let dir = scan_dir();
    std::fs::write(
        dir.path().join("0002-back.png.interpretation.json"),
        "{\"type\":\"NotAPage\"}",
    )
    .unwrap();

    let output = ballot()
        .args(["batch", "--workers", "2"])
        .arg(dir.path())
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("1 of 5 sheets"));

    let records = stdout_json(&output);
    let failed = &records[1];
    assert_eq!(failed["sheet"], "0002");
    assert!(failed["error"].as_str().unwrap().contains("back page"));
    assert!(failed.get("interpretation").is_none());
    assert_eq!(records[0]["interpretation"]["castability"], "CastableWithoutReview");
}

#[test]
fn test_batch_empty_directory() {
    let dir = tempdir().unwrap();
    ballot()
        .arg("batch")
        .arg(dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("No front/back image pairs"));
}

// ============================================================================
// Worker protocol
// ============================================================================

#[test]
fn test_worker_subcommand_speaks_protocol() {
    let dir = tempdir().unwrap();
    let image = record(dir.path(), "p.png", &blank_page());
    let job = json!({"type": "job", "id": 7, "payload": {"path": image}});
    let stdin = format!("{}\n{{\"type\":\"exit\"}}\n", job);

    let output = ballot()
        .args(["worker", "--entry", "replay"])
        .write_stdin(stdin)
        .output()
        .unwrap();
    assert!(output.status.success());

    let lines: Vec<Value> = String::from_utf8(output.stdout)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines[0], json!({"type": "ready"}));
    assert_eq!(
        lines[1],
        json!({
            "type": "reply",
            "id": 7,
            "envelope": {"status": "ok", "value": {"type": "BlankPage"}}
        })
    );
}

#[test]
fn test_worker_subcommand_replies_with_error_envelope() {
    let job = json!({"type": "job", "id": 1, "payload": {"path": "/nonexistent/x.png"}});
    let output = ballot()
        .arg("worker")
        .write_stdin(format!("{}\n", job))
        .output()
        .unwrap();
    // Stdin closed after the job: clean exit.
    assert!(output.status.success());

    let reply: Value = serde_json::from_str(
        String::from_utf8(output.stdout).unwrap().lines().nth(1).unwrap(),
    )
    .unwrap();
    assert_eq!(reply["envelope"]["status"], "error");
    assert_eq!(reply["envelope"]["error"]["$type"], "Error");
    assert!(
        reply["envelope"]["error"]["message"]
            .as_str()
            .unwrap()
            .contains("Image not found")
    );
}

// ============================================================================
// Pool against real worker processes
// ============================================================================

fn replay_workers() -> WorkerCommand {
    WorkerCommand::new(env!("CARGO_BIN_EXE_ballot-interp"))
        .arg("worker")
        .arg("--entry")
        .arg("replay")
}

#[test]
fn test_pool_of_binary_workers() {
    let dir = scan_dir();
    let pool: WorkerPool<ImageDescriptor, PageInterpretation> =
        WorkerPool::spawn(replay_workers(), WorkerPoolConfig::default().with_pool_size(3))
            .unwrap();

    let handles: Vec<_> = (1..=5)
        .flat_map(|n| {
            ["front", "back"].map(|side| dir.path().join(format!("{:04}-{}.png", n, side)))
        })
        .map(|path| pool.submit(ImageDescriptor::from_path(path)))
        .collect();
    let pages: Vec<_> = handles.into_iter().map(|h| h.wait().unwrap()).collect();

    assert_eq!(pages.len(), 10);
    assert_eq!(pages[1], PageInterpretation::BlankPage);
    assert!(matches!(pages[9], PageInterpretation::UnreadablePage { .. }));

    let stats = pool.stats();
    assert_eq!(stats.jobs_succeeded, 10);
    assert!(stats.peak_in_flight <= 3);
    pool.shutdown().wait();
}

/// Worker that answers BlankPage, or exits 9 when the image path says "crash".
fn crashing_workers() -> WorkerCommand {
    WorkerCommand::new("sh").arg("-c").arg(
        r#"echo '{"type":"ready"}'
while read -r line; do
  case "$line" in
    *'"exit"'*) exit 0 ;;
    *crash*) exit 9 ;;
  esac
  id=$(echo "$line" | sed 's/.*"id":\([0-9]*\).*/\1/')
  echo "{\"type\":\"reply\",\"id\":$id,\"envelope\":{\"status\":\"ok\",\"value\":{\"type\":\"BlankPage\"}}}"
done"#,
    )
}

#[test]
fn test_pool_survives_worker_crashes() {
    let pool: WorkerPool<ImageDescriptor, PageInterpretation> =
        WorkerPool::spawn(crashing_workers(), WorkerPoolConfig::default().with_pool_size(2))
            .unwrap();

    let handles: Vec<_> = (0..12)
        .map(|n| {
            let name = if n % 4 == 0 { "crash.png" } else { "page.png" };
            pool.submit(ImageDescriptor::from_path(format!("/scans/{}/{}", n, name)))
        })
        .collect();

    for (n, handle) in handles.into_iter().enumerate() {
        match handle.wait() {
            Ok(page) => {
                assert_ne!(n % 4, 0);
                assert_eq!(page, PageInterpretation::BlankPage);
            }
            Err(JobError::Worker { reason, .. }) => {
                assert_eq!(n % 4, 0);
                assert_eq!(reason, TerminationReason::Exited(9));
            }
            Err(other) => panic!("Unexpected error for job {}: {}", n, other),
        }
    }

    let stats = pool.stats();
    assert_eq!(stats.jobs_failed, 3);
    assert_eq!(stats.jobs_succeeded, 9);
    assert_eq!(stats.worker_restarts, 3);
    assert_eq!(pool.size(), 2);
}

#[test]
fn test_shutdown_kills_stuck_workers_after_grace() {
    let stuck = WorkerCommand::new("sh").arg("-c").arg(
        r#"echo '{"type":"ready"}'
read -r line
exec sleep 30"#,
    );
    let config = WorkerPoolConfig::default()
        .with_pool_size(1)
        .with_shutdown_grace(Duration::from_millis(200));
    let pool: WorkerPool<ImageDescriptor, PageInterpretation> =
        WorkerPool::spawn(stuck, config).unwrap();

    let running = pool.submit(ImageDescriptor::from_path("/scans/a.png"));
    let queued = pool.submit(ImageDescriptor::from_path("/scans/b.png"));
    std::thread::sleep(Duration::from_millis(50));

    let started = std::time::Instant::now();
    pool.shutdown().wait();
    assert!(started.elapsed() < Duration::from_secs(10));

    match running.wait() {
        Err(JobError::Worker { reason, .. }) => assert_eq!(reason, TerminationReason::Killed),
        other => panic!("Expected killed worker, got {:?}", other),
    }
    assert_eq!(queued.wait().unwrap_err(), JobError::PoolClosed);
    assert_eq!(
        pool.submit(ImageDescriptor::from_path("/scans/c.png"))
            .wait()
            .unwrap_err(),
        JobError::PoolClosed
    );
}

#[test]
fn test_pool_fails_fast_when_workers_cannot_start() {
    let result: ballot_interp::Result<WorkerPool<ImageDescriptor, PageInterpretation>> =
        WorkerPool::spawn(
            WorkerCommand::new("/nonexistent/ballot-worker"),
            WorkerPoolConfig::default().with_pool_size(2),
        );
    let err = result.err().unwrap();
    assert!(err.to_string().contains("failed to initialize"));
}
