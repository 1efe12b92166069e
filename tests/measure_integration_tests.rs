//! Integration tests for live measurement
//!
//! A renderer task plays the other side of the signal handshake: it waits
//! for `start-render`, lets the mock desktop show its frames, raises
//! `stop-render`, saves its rendered frames, and raises `image-saved`.

mod common;

use std::{path::PathBuf, sync::Arc, time::Duration};

use display_latency::{
    capture::{CaptureSession, MockEvent, MockFrameSource, mock::test_pattern},
    clock::SteppingClock,
    error::{LatencyError, LatencyResult},
    measure::{MeasureOptions, run_measurement},
    model::CaptureRegion,
    signal::RenderSignals,
    util::image_store::{CAPTURE_IMAGE_SUFFIX, ImageStore, RENDER_IMAGE_SUFFIX},
};
use tempfile::TempDir;

use crate::common::pattern_frames;

const WIDTH: u32 = 64;
const HEIGHT: u32 = 48;

fn options() -> MeasureOptions {
    MeasureOptions::new(vec![CaptureRegion::new(0, 0, WIDTH as i32, HEIGHT as i32)])
        .with_timeout(Duration::from_secs(10))
        .with_poll_interval(Duration::from_millis(5))
}

fn mock_session() -> LatencyResult<CaptureSession<MockFrameSource>> {
    let source = MockFrameSource::new(WIDTH, HEIGHT)
        .with_events((0..5).map(|_| MockEvent::TimedOut))
        .with_frames((0..5).map(|i| test_pattern(WIDTH, HEIGHT, i)))
        .with_delay(Duration::from_millis(1));
    Ok(CaptureSession::new(source).with_clock(Arc::new(SteppingClock::new(1000, 10, 1000))))
}

/// Plays the renderer side of the handshake
async fn renderer(signals: RenderSignals, image_dir: PathBuf) {
    let start = Arc::clone(&signals.start_render);
    let started = tokio::task::spawn_blocking(move || start.wait(Duration::from_secs(10)))
        .await
        .unwrap()
        .unwrap();
    assert!(started, "start-render never arrived");

    tokio::time::sleep(Duration::from_millis(200)).await;
    signals.stop_render.set().unwrap();

    let store = ImageStore::open(&image_dir).unwrap();
    store
        .save(&pattern_frames(WIDTH, HEIGHT, &[0, 1, 2, 3, 4], 0), RENDER_IMAGE_SUFFIX)
        .unwrap();
    signals.image_saved.set().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_measurement_with_local_signals() {
    let dir = TempDir::new().unwrap();
    let store = ImageStore::open(dir.path()).unwrap();
    let signals = RenderSignals::local();

    let renderer = tokio::spawn(renderer(signals.clone(), dir.path().to_path_buf()));
    let outcome = run_measurement(mock_session, signals, &store, options())
        .await
        .unwrap();
    renderer.await.unwrap();

    // captured at ticks 1000, 1010, ... against rendered ticks 0, 1, ...
    assert_eq!(outcome.captured.len(), 5);
    assert_eq!(outcome.rendered.len(), 5);
    assert_eq!(outcome.estimate.match_count(), 5);
    assert!((outcome.estimate.latency_ms - 1018.0).abs() < 1e-9);
    assert_eq!(outcome.ticks_per_second, 1000);

    let report = outcome.report();
    assert_eq!(report.match_count, 5);
    assert_eq!(report.captured_frames, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_measurement_with_file_signals_keeps_captures() {
    let dir = TempDir::new().unwrap();
    let signal_dir = dir.path().join("signals");
    let store = ImageStore::open(dir.path().join("images")).unwrap();
    let signals = RenderSignals::file_backed(&signal_dir).unwrap();

    let renderer = tokio::spawn(renderer(
        RenderSignals::file_backed(&signal_dir).unwrap(),
        store.path().to_path_buf(),
    ));
    let outcome = run_measurement(
        mock_session,
        signals,
        &store,
        options().with_save_captured(true),
    )
    .await
    .unwrap();
    renderer.await.unwrap();

    assert_eq!(outcome.estimate.match_count(), 5);
    assert_eq!(store.load(CAPTURE_IMAGE_SUFFIX).unwrap().len(), 5);
    assert_eq!(store.load(RENDER_IMAGE_SUFFIX).unwrap().len(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_measurement_times_out_without_renderer() {
    let dir = TempDir::new().unwrap();
    let store = ImageStore::open(dir.path()).unwrap();

    let result = run_measurement(
        || Ok(CaptureSession::new(MockFrameSource::new(WIDTH, HEIGHT))),
        RenderSignals::local(),
        &store,
        options().with_timeout(Duration::from_millis(150)),
    )
    .await;

    match result {
        Err(LatencyError::Timeout { what, duration_ms }) => {
            assert_eq!(what, "image-saved signal");
            assert_eq!(duration_ms, 150);
        }
        other => panic!("expected Timeout, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_capture_failure_ends_measurement() {
    let dir = TempDir::new().unwrap();
    let store = ImageStore::open(dir.path()).unwrap();

    let result = run_measurement(
        || {
            Ok(CaptureSession::new(
                MockFrameSource::new(WIDTH, HEIGHT)
                    .with_events([MockEvent::Fail("duplication lost".to_string())]),
            ))
        },
        RenderSignals::local(),
        &store,
        options(),
    )
    .await;

    assert!(matches!(result, Err(LatencyError::AcquisitionFailure { .. })));
}
