//! Job lifecycle tests against stub engines.
//!
//! Each test writes a tiny shell script standing in for the OMR engine, runs
//! real subprocesses through the controller, and checks the observable
//! contract: event order, error classification, and that no workspace or
//! permit outlives its job.

#![cfg(unix)]

mod common;

use common::*;
use edgequake_omr::{
    EngineFailure, ErrorKind, GatewayError, JobState, ProgressEvent, ValidationError,
};
use futures::future::join_all;
use futures::StreamExt;
use std::time::{Duration, Instant};

// ── Test helpers ─────────────────────────────────────────────────────────────

/// Stages of non-detail events with consecutive repeats collapsed.
fn stage_path(events: &[ProgressEvent]) -> Vec<JobState> {
    let mut path: Vec<JobState> = Vec::new();
    for e in events.iter().filter(|e| !e.detail) {
        if path.last() != Some(&e.stage) {
            path.push(e.stage);
        }
    }
    path
}

fn assert_well_formed(events: &[ProgressEvent]) {
    assert!(!events.is_empty());
    for pair in events.windows(2) {
        assert!(pair[0].seq < pair[1].seq, "sequence numbers must increase");
    }
    let terminals = events.iter().filter(|e| e.is_terminal()).count();
    assert_eq!(terminals, 1, "exactly one terminal event");
    assert!(events.last().unwrap().is_terminal(), "terminal event is last");
}

fn messages(events: &[ProgressEvent]) -> Vec<&str> {
    events.iter().map(|e| e.message.as_str()).collect()
}

// ── Happy path ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn png_runs_full_lifecycle_and_leaves_nothing_behind() {
    let sb = Sandbox::new();
    let engine = sb.script(
        "engine.sh",
        &format!(
            "echo 'INFO  StepMonitor | LOAD'\n\
             echo 'INFO  StepMonitor | BINARY'\n\
             echo 'INFO  StepMonitor | SCALE'\n\
             echo 'INFO  StepMonitor | GRID'\n\
             echo 'INFO  StepMonitor | HEADS'\n\
             echo 'INFO  StepMonitor | HEADS'\n\
             echo 'INFO  StepMonitor | RHYTHMS'\n\
             echo 'INFO  StepMonitor | PAGE'\n\
             echo 'Exporting score'\n\
             {WRITE_ARTIFACT}"
        ),
    );
    let ctl = sb.controller(sb.config(&engine));

    let handle = ctl.submit(png_upload("score.png", 2 * 1024 * 1024)).unwrap();
    let events: Vec<ProgressEvent> = handle.into_events().collect().await;

    assert_well_formed(&events);
    assert_eq!(
        stage_path(&events),
        [
            JobState::Queued,
            JobState::Validating,
            JobState::Preparing,
            JobState::Running,
            JobState::Extracting,
            JobState::Complete,
        ]
    );

    let msgs = messages(&events);
    for expected in [
        "Loading image",
        "Binarizing image",
        "Detecting staves",
        "Recognising symbols",
        "Building measures and rhythm",
        "Exporting MusicXML",
    ] {
        assert!(msgs.contains(&expected), "missing {expected:?} in {msgs:?}");
    }
    assert_eq!(
        msgs.iter().filter(|m| **m == "Recognising symbols").count(),
        1,
        "duplicate stages are collapsed"
    );

    let last = events.last().unwrap();
    assert_eq!(last.message, "Processing complete");
    let artifact = last.payload.as_ref().expect("complete carries the artifact");
    assert_eq!(artifact.bytes, STUB_ARTIFACT);
    assert_eq!(artifact.filename, "score.mxl");

    // Resources are released before the terminal event is published.
    assert_eq!(sb.leftover_workspaces(), 0);
    assert_eq!(ctl.gate().in_flight(), 0);
    assert_eq!(ctl.workspaces().live(), 0);
    assert_eq!(ctl.runner().launches(), 1);
}

#[tokio::test]
async fn unrecognised_output_is_forwarded_as_detail_when_enabled() {
    let sb = Sandbox::new();
    let engine = sb.script(
        "engine.sh",
        &format!("echo 'hello from the engine'\necho LOAD\n{WRITE_ARTIFACT}"),
    );
    let ctl = sb.controller(sb.config(&engine).forward_engine_output(true));

    let events: Vec<ProgressEvent> = ctl
        .submit(png_upload("a.png", 128))
        .unwrap()
        .into_events()
        .collect()
        .await;

    let detail: Vec<&ProgressEvent> = events.iter().filter(|e| e.detail).collect();
    assert_eq!(detail.len(), 1);
    assert_eq!(detail[0].message, "hello from the engine");
    assert_eq!(detail[0].stage, JobState::Running);
    assert_eq!(events.last().unwrap().stage, JobState::Complete);
}

#[tokio::test]
async fn unrecognised_output_stays_private_by_default() {
    let sb = Sandbox::new();
    let engine = sb.script(
        "engine.sh",
        &format!("echo 'hello from the engine'\n{WRITE_ARTIFACT}"),
    );
    let ctl = sb.controller(sb.config(&engine));
    let events: Vec<ProgressEvent> = ctl
        .submit(png_upload("a.png", 128))
        .unwrap()
        .into_events()
        .collect()
        .await;
    assert!(events.iter().all(|e| !e.detail));
    assert!(!messages(&events).contains(&"hello from the engine"));
}

// ── Admission ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn oversized_upload_fails_before_any_allocation() {
    let sb = Sandbox::new();
    let engine = sb.script("engine.sh", WRITE_ARTIFACT);
    let ctl = sb.controller(sb.config(&engine).max_upload_bytes(10 * 1024 * 1024));

    let started = Instant::now();
    let err = ctl
        .convert(png_upload("big.png", 11 * 1024 * 1024))
        .await
        .unwrap_err();

    assert!(
        matches!(err, GatewayError::Validation(ValidationError::TooLarge { .. })),
        "{err:?}"
    );
    assert!(err.is_admission());
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(ctl.workspaces().allocations(), 0);
    assert_eq!(ctl.runner().launches(), 0);
    assert_eq!(ctl.gate().snapshot().peak, 0);
}

#[tokio::test]
async fn mislabelled_content_is_rejected() {
    let sb = Sandbox::new();
    let engine = sb.script("engine.sh", WRITE_ARTIFACT);
    let ctl = sb.controller(sb.config(&engine));
    let err = ctl
        .convert(edgequake_omr::Upload::new(
            "test.pdf",
            Some("application/pdf".into()),
            b"invalid content".to_vec(),
        ))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        GatewayError::Validation(ValidationError::ContentMismatch { .. })
    ));
    assert_eq!(ctl.runner().launches(), 0);
}

#[tokio::test]
async fn queue_wait_timeout_is_service_busy_without_allocation() {
    let sb = Sandbox::new();
    let engine = sb.script("engine.sh", &format!("sleep 2\n{WRITE_ARTIFACT}"));
    let ctl = sb.controller(
        sb.config(&engine)
            .max_concurrent_jobs(1)
            .permit_wait_timeout(Some(Duration::from_millis(200))),
    );

    let first = ctl.submit(png_upload("first.png", 64)).unwrap();
    wait_until(|| ctl.gate().in_flight() == 1).await;

    let err = ctl.convert(png_upload("second.png", 64)).await.unwrap_err();
    assert!(matches!(err, GatewayError::ServiceBusy { capacity: 1, .. }), "{err:?}");
    assert_eq!(ctl.workspaces().allocations(), 1);

    first.result().await.unwrap();
    assert_eq!(ctl.gate().in_flight(), 0);
}

// ── Concurrency ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn capacity_one_runs_jobs_strictly_one_at_a_time() {
    let sb = Sandbox::new();
    let lock = sb.path().join("engine.lock");
    let engine = sb.script(
        "engine.sh",
        &format!(
            "mkdir '{lock}' || {{ echo 'overlapping engine' >&2; exit 9; }}\n\
             sleep 0.5\n\
             rmdir '{lock}'\n\
             {WRITE_ARTIFACT}",
            lock = lock.display()
        ),
    );
    let ctl = sb.controller(sb.config(&engine).max_concurrent_jobs(1));

    let started = Instant::now();
    let handles: Vec<_> = (0..3)
        .map(|i| ctl.submit(png_upload(&format!("s{i}.png"), 256)).unwrap())
        .collect();
    let results = join_all(handles.into_iter().map(|h| h.result())).await;

    for r in &results {
        assert!(r.is_ok(), "{r:?}");
    }
    assert!(started.elapsed() >= Duration::from_millis(1400));
    let snap = ctl.gate().snapshot();
    assert_eq!(snap.peak, 1);
    assert_eq!(snap.in_flight, 0);
    assert_eq!(snap.waiting, 0);
    assert_eq!(sb.leftover_workspaces(), 0);
}

// ── Engine failures ──────────────────────────────────────────────────────────

#[tokio::test]
async fn timeout_kills_engine_and_cleans_up() {
    let sb = Sandbox::new();
    let engine = sb.script("engine.sh", "echo LOAD\nsleep 30");
    let ctl = sb.controller(sb.config(&engine).job_timeout(Duration::from_secs(1)));

    let handle = ctl.submit(png_upload("slow.png", 64)).unwrap();
    let id = handle.id();
    let started = Instant::now();
    let err = handle.result().await.unwrap_err();

    assert!(matches!(err, GatewayError::Timeout { .. }), "{err:?}");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(sb.leftover_workspaces(), 0);
    assert_eq!(ctl.gate().in_flight(), 0);
    assert!(!ctl.runner().is_running(id));

    let events = ctl.bus().snapshot(id).unwrap();
    assert_well_formed(&events);
    assert_eq!(events.last().unwrap().error, Some(ErrorKind::Timeout));
}

#[tokio::test]
async fn non_zero_exit_carries_exit_code_and_output_tail() {
    let sb = Sandbox::new();
    let engine = sb.script(
        "engine.sh",
        "echo LOAD\necho 'java.lang.IllegalStateException: no staves' >&2\nexit 2",
    );
    let ctl = sb.controller(sb.config(&engine));

    let handle = ctl.submit(png_upload("bad.png", 64)).unwrap();
    let id = handle.id();
    let err = handle.result().await.unwrap_err();

    match &err {
        GatewayError::Engine(EngineFailure::NonZeroExit { code, tail }) => {
            assert_eq!(*code, 2);
            assert!(tail
                .lines()
                .iter()
                .any(|l| l.contains("IllegalStateException")));
        }
        other => panic!("unexpected: {other:?}"),
    }
    let last = ctl.bus().snapshot(id).unwrap().pop().unwrap();
    assert_eq!(last.stage, JobState::Failed);
    assert_eq!(last.error, Some(ErrorKind::Engine));
    assert!(last.message.contains("exited with code 2"), "{}", last.message);
    assert_eq!(sb.leftover_workspaces(), 0);
}

#[tokio::test]
async fn zero_exit_without_artifact_is_missing_artifact() {
    let sb = Sandbox::new();
    let engine = sb.script("engine.sh", "echo LOAD\nexit 0");
    let ctl = sb.controller(sb.config(&engine));
    let err = ctl.convert(png_upload("x.png", 64)).await.unwrap_err();
    assert!(
        matches!(err, GatewayError::Engine(EngineFailure::MissingArtifact { .. })),
        "{err:?}"
    );
    assert_eq!(sb.leftover_workspaces(), 0);
}

#[tokio::test]
async fn artifact_in_book_folder_is_found() {
    let sb = Sandbox::new();
    let engine = sb.script(
        "engine.sh",
        r#"mkdir -p "$2/$3" && printf 'PK\003\004stub-musicxml' > "$2/$3/$3.mxl""#,
    );
    let ctl = sb.controller(sb.config(&engine));
    let artifact = ctl.convert(png_upload("book.png", 64)).await.unwrap();
    assert_eq!(artifact.bytes, STUB_ARTIFACT);
    assert_eq!(artifact.filename, "book.mxl");
}

#[tokio::test]
async fn signal_death_is_reported_as_killed_by_limit() {
    let sb = Sandbox::new();
    let engine = sb.script("engine.sh", "echo LOAD\nkill -9 $$");
    let ctl = sb.controller(sb.config(&engine));
    let err = ctl.convert(png_upload("oom.png", 64)).await.unwrap_err();
    assert!(
        matches!(err, GatewayError::Engine(EngineFailure::KilledByLimit { .. })),
        "{err:?}"
    );
    assert_eq!(sb.leftover_workspaces(), 0);
}

#[tokio::test]
async fn missing_engine_binary_is_a_spawn_failure() {
    let sb = Sandbox::new();
    let ctl = sb.controller(
        sb.config(std::path::Path::new("unused"))
            .engine_program("/nonexistent/audiveris")
            .engine_args(["{input}"]),
    );
    let err = ctl.convert(png_upload("x.png", 64)).await.unwrap_err();
    assert!(
        matches!(err, GatewayError::Engine(EngineFailure::Spawn { .. })),
        "{err:?}"
    );
    assert_eq!(sb.leftover_workspaces(), 0);
    assert_eq!(ctl.gate().in_flight(), 0);
}

#[tokio::test]
async fn engine_exit_is_final_even_if_a_helper_keeps_stdout_open() {
    let sb = Sandbox::new();
    let engine = sb.script("engine.sh", &format!("{WRITE_ARTIFACT}\nsleep 30 &\nexit 0"));
    let ctl = sb.controller(sb.config(&engine).job_timeout(Duration::from_secs(5)));

    let started = Instant::now();
    let artifact = ctl.convert(png_upload("score.png", 64)).await.unwrap();
    assert_eq!(artifact.bytes, STUB_ARTIFACT);
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(sb.leftover_workspaces(), 0);
}

#[tokio::test]
async fn helpers_left_by_the_engine_die_with_the_job() {
    let sb = Sandbox::new();
    let marker = sb.path().join("helper-survived");
    let engine = sb.script(
        "engine.sh",
        &format!(
            "(sleep 1; touch '{}') >/dev/null 2>&1 &\n{WRITE_ARTIFACT}",
            marker.display()
        ),
    );
    let ctl = sb.controller(sb.config(&engine));

    ctl.convert(png_upload("score.png", 64)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(!marker.exists(), "background helper outlived its job");
}

// ── PDF pre-conversion ───────────────────────────────────────────────────────

#[tokio::test]
async fn pdf_is_rasterised_before_the_engine_runs() {
    let sb = Sandbox::new();
    let pre = sb.script("pre.sh", r#"printf 'II*\000' > "$2""#);
    let engine = sb.script(
        "engine.sh",
        &format!("case \"$1\" in *.tiff) ;; *) echo \"got $1\" >&2; exit 4;; esac\n{WRITE_ARTIFACT}"),
    );
    let ctl = sb.controller(sb.config(&engine).preprocess(Some(sb.preprocess(&pre))));

    let events: Vec<ProgressEvent> = ctl
        .submit(pdf_upload("score.pdf"))
        .unwrap()
        .into_events()
        .collect()
        .await;

    assert_well_formed(&events);
    let msgs = messages(&events);
    for expected in [
        "Detected PDF file",
        "Converting PDF to TIFF...",
        "PDF conversion complete",
    ] {
        assert!(msgs.contains(&expected), "missing {expected:?} in {msgs:?}");
    }
    let last = events.last().unwrap();
    assert_eq!(last.stage, JobState::Complete, "{msgs:?}");
    assert_eq!(last.payload.as_ref().unwrap().filename, "score.mxl");
    assert_eq!(ctl.runner().launches(), 2);
}

#[tokio::test]
async fn preconversion_failure_is_engine_error_and_skips_engine() {
    let sb = Sandbox::new();
    let pre = sb.script("pre.sh", "echo 'convert: no decode delegate' >&2\nexit 1");
    let engine = sb.script("engine.sh", WRITE_ARTIFACT);
    let ctl = sb.controller(sb.config(&engine).preprocess(Some(sb.preprocess(&pre))));

    let err = ctl.convert(pdf_upload("score.pdf")).await.unwrap_err();
    match &err {
        GatewayError::Engine(EngineFailure::Preprocess { tail, .. }) => {
            assert!(tail.lines().iter().any(|l| l.contains("no decode delegate")));
        }
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(ctl.runner().launches(), 1);
    assert_eq!(sb.leftover_workspaces(), 0);
}

#[tokio::test]
async fn pdf_goes_straight_to_an_engine_that_reads_it() {
    let sb = Sandbox::new();
    let pre = sb.script("pre.sh", "exit 1");
    let engine = sb.script(
        "engine.sh",
        &format!("case \"$1\" in *.pdf) ;; *) echo \"got $1\" >&2; exit 4;; esac\n{WRITE_ARTIFACT}"),
    );
    let native = sb.script("reads-pdf.sh", "exit 0");
    let mut preprocess = sb.preprocess(&pre);
    preprocess.native_pdf_check = Some(vec!["sh".into(), native.to_string_lossy().into_owned()]);
    let ctl = sb.controller(sb.config(&engine).preprocess(Some(preprocess)));

    let events: Vec<ProgressEvent> = ctl
        .submit(pdf_upload("score.pdf"))
        .unwrap()
        .into_events()
        .collect()
        .await;

    let msgs = messages(&events);
    assert_eq!(events.last().unwrap().stage, JobState::Complete, "{msgs:?}");
    assert!(!msgs.contains(&"Converting PDF to TIFF..."), "{msgs:?}");
    assert_eq!(ctl.runner().launches(), 1);

    // The answer is cached: a second PDF does not re-run the check.
    std::fs::write(&native, "#!/bin/sh\nexit 1\n").unwrap();
    ctl.convert(pdf_upload("again.pdf")).await.unwrap();
    assert_eq!(ctl.runner().launches(), 2);
}

#[tokio::test]
async fn pdf_is_preconverted_when_the_engine_cannot_read_it() {
    let sb = Sandbox::new();
    let pre = sb.script("pre.sh", r#"printf 'II*\000' > "$2""#);
    let engine = sb.script("engine.sh", WRITE_ARTIFACT);
    let mut preprocess = sb.preprocess(&pre);
    preprocess.native_pdf_check = Some(vec!["sh".into(), "-c".into(), "exit 1".into()]);
    let ctl = sb.controller(sb.config(&engine).preprocess(Some(preprocess)));

    ctl.convert(pdf_upload("score.pdf")).await.unwrap();
    assert_eq!(ctl.runner().launches(), 2);
}

#[tokio::test]
async fn images_skip_preconversion() {
    let sb = Sandbox::new();
    let pre = sb.script("pre.sh", "exit 1");
    let engine = sb.script("engine.sh", WRITE_ARTIFACT);
    let ctl = sb.controller(sb.config(&engine).preprocess(Some(sb.preprocess(&pre))));
    ctl.convert(png_upload("x.png", 64)).await.unwrap();
    assert_eq!(ctl.runner().launches(), 1);
}

// ── Observers ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn late_subscriber_sees_the_same_sequence() {
    let sb = Sandbox::new();
    let engine = sb.script(
        "engine.sh",
        &format!("echo LOAD\nsleep 0.2\necho SCALE\n{WRITE_ARTIFACT}"),
    );
    let ctl = sb.controller(sb.config(&engine));

    let handle = ctl.submit(png_upload("a.png", 64)).unwrap();
    let id = handle.id();
    let early: Vec<ProgressEvent> = handle.into_events().collect().await;
    let late: Vec<ProgressEvent> = ctl.subscribe(id).unwrap().collect().await;

    let key = |e: &ProgressEvent| (e.seq, e.stage, e.message.clone());
    assert_eq!(
        early.iter().map(key).collect::<Vec<_>>(),
        late.iter().map(key).collect::<Vec<_>>()
    );
    assert_well_formed(&late);
}

#[tokio::test]
async fn mid_job_subscriber_replays_then_follows() {
    let sb = Sandbox::new();
    let engine = sb.script(
        "engine.sh",
        &format!("echo LOAD\nsleep 0.5\necho PAGE\n{WRITE_ARTIFACT}"),
    );
    let ctl = sb.controller(sb.config(&engine));

    let handle = ctl.submit(png_upload("a.png", 64)).unwrap();
    let id = handle.id();
    wait_until(|| ctl.runner().is_running(id)).await;

    let mid: Vec<ProgressEvent> = ctl.subscribe(id).unwrap().collect().await;
    let all = ctl.bus().snapshot(id).unwrap();
    assert_eq!(mid.len(), all.len());
    assert_eq!(mid.first().unwrap().seq, 1);
    assert_eq!(mid.last().unwrap().stage, JobState::Complete);
    handle.result().await.unwrap();
}

#[tokio::test]
async fn dropping_the_handle_does_not_cancel_by_default() {
    let sb = Sandbox::new();
    let engine = sb.script("engine.sh", &format!("sleep 0.3\n{WRITE_ARTIFACT}"));
    let ctl = sb.controller(sb.config(&engine));

    let handle = ctl.submit(png_upload("a.png", 64)).unwrap();
    let id = handle.id();
    let observer = ctl.subscribe(id).unwrap();
    drop(handle);

    let events: Vec<ProgressEvent> = observer.collect().await;
    assert_eq!(events.last().unwrap().stage, JobState::Complete);
}

#[tokio::test]
async fn dropping_the_handle_cancels_when_configured() {
    let sb = Sandbox::new();
    let engine = sb.script("engine.sh", "echo LOAD\nsleep 30");
    let ctl = sb.controller(sb.config(&engine).cancel_on_disconnect(true));

    let handle = ctl.submit(png_upload("a.png", 64)).unwrap();
    let id = handle.id();
    let observer = ctl.subscribe(id).unwrap();
    wait_until(|| ctl.runner().is_running(id)).await;

    let started = Instant::now();
    drop(handle);
    let events: Vec<ProgressEvent> = observer.collect().await;

    assert!(started.elapsed() < Duration::from_secs(5));
    let last = events.last().unwrap();
    assert_eq!(last.stage, JobState::Failed);
    assert_eq!(last.error, Some(ErrorKind::Cancelled));
    assert_eq!(sb.leftover_workspaces(), 0);
    assert_eq!(ctl.gate().in_flight(), 0);
}
