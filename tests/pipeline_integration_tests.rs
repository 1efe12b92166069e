//! Integration tests for the readback pipeline
//!
//! These tests run [`ReadbackPipeline`] and [`CaptureSession`] against the
//! scripted mock frame source and check ordering, surface lifetime, and
//! shutdown behavior with producers and consumers running at different
//! speeds.

mod common;

use std::{
    sync::{Arc, atomic::Ordering},
    thread,
    time::Duration,
};

use display_latency::{
    capture::{
        CaptureSession, MockEvent, MockFrameSource, PipelineConfig, PixelLayout,
        ReadbackPipeline, mock::test_pattern,
    },
    clock::SteppingClock,
    error::LatencyError,
    model::{CaptureRegion, DesktopBounds},
};
use image::imageops;

fn full(width: u32, height: u32) -> CaptureRegion {
    CaptureRegion::full(&DesktopBounds::from_size(width, height))
}

/// Runs until `frames` frames were delivered and returns their timestamps
fn run_collecting(
    pipeline: &mut ReadbackPipeline<MockFrameSource>,
    regions: &[CaptureRegion],
    frames: usize,
    consumer_delay: Option<Duration>,
) -> (Vec<i64>, display_latency::capture::PipelineStats) {
    let mut timestamps = Vec::new();
    let stats = pipeline
        .run(regions, |_, timestamp| {
            if let Some(delay) = consumer_delay {
                thread::sleep(delay);
            }
            timestamps.push(timestamp);
            timestamps.len() < frames
        })
        .unwrap();
    (timestamps, stats)
}

// ========================================================================
// Ordering
// ========================================================================

#[test]
fn test_fifo_with_slow_consumer() {
    let source = MockFrameSource::animated(32, 24, 20);
    let live = source.live_surfaces();
    let mut pipeline =
        ReadbackPipeline::new(source).with_clock(Arc::new(SteppingClock::new(0, 1, 1000)));

    let (timestamps, stats) =
        run_collecting(&mut pipeline, &[full(32, 24)], 20, Some(Duration::from_millis(2)));

    assert_eq!(timestamps.len(), 20);
    assert!(timestamps.windows(2).all(|pair| pair[0] < pair[1]));
    assert_eq!(stats.frames_acquired, 20);
    assert_eq!(stats.frames_delivered, 20);
    assert_eq!(live.load(Ordering::SeqCst), 0);
}

#[test]
fn test_fifo_with_slow_producer() {
    let source = MockFrameSource::animated(32, 24, 10).with_delay(Duration::from_millis(2));
    let mut pipeline = ReadbackPipeline::new(source);

    let (timestamps, stats) = run_collecting(&mut pipeline, &[full(32, 24)], 10, None);

    assert_eq!(timestamps.len(), 10);
    assert!(timestamps.windows(2).all(|pair| pair[0] < pair[1]));
    assert_eq!(stats.frames_delivered, 10);
}

#[test]
fn test_frames_delivered_in_capture_order() {
    let source = MockFrameSource::animated(16, 16, 8);
    let mut pipeline = ReadbackPipeline::new(source);

    let mut delivered = Vec::new();
    pipeline
        .run(&[full(16, 16)], |buffers, _| {
            delivered.push(buffers[0].clone());
            delivered.len() < 8
        })
        .unwrap();

    for (index, image) in delivered.iter().enumerate() {
        assert_eq!(*image, test_pattern(16, 16, index));
    }
}

// ========================================================================
// Surface Lifetime
// ========================================================================

#[test]
fn test_reclaim_is_bounded_and_nothing_leaks() {
    let source = MockFrameSource::animated(32, 24, 40);
    let live = source.live_surfaces();
    let mut pipeline = ReadbackPipeline::new(source);

    let regions = [CaptureRegion::new(0, 0, 16, 12), CaptureRegion::new(16, 12, 16, 12)];
    let (_, stats) =
        run_collecting(&mut pipeline, &regions, 40, Some(Duration::from_micros(500)));

    assert!(stats.max_reclaimed_per_iteration <= 3);
    assert_eq!(stats.items_reclaimed, stats.frames_acquired);
    assert_eq!(live.load(Ordering::SeqCst), 0);
}

#[test]
fn test_custom_reclaim_limit() {
    let source = MockFrameSource::animated(8, 8, 30);
    let mut pipeline = ReadbackPipeline::new(source).with_config(PipelineConfig {
        acquire_timeout:       None,
        reclaim_per_iteration: 1,
    });

    let (_, stats) = run_collecting(&mut pipeline, &[full(8, 8)], 30, None);
    assert!(stats.max_reclaimed_per_iteration <= 1);
    assert_eq!(stats.items_reclaimed, stats.frames_acquired);
}

#[test]
fn test_frames_released_back_to_source() {
    let mut pipeline = ReadbackPipeline::new(MockFrameSource::animated(8, 8, 5));
    run_collecting(&mut pipeline, &[full(8, 8)], 5, None);

    let source = pipeline.into_source();
    assert_eq!(source.released_frames(), 5);
    assert!(!source.is_holding_frame());
}

// ========================================================================
// Shutdown
// ========================================================================

#[test]
fn test_stop_still_delivers_queued_frames() {
    let source = MockFrameSource::animated(16, 16, 10);
    let live = source.live_surfaces();
    let mut pipeline = ReadbackPipeline::new(source);

    let mut calls = 0;
    let stats = pipeline
        .run(&[full(16, 16)], |_, _| {
            calls += 1;
            thread::sleep(Duration::from_millis(5));
            false
        })
        .unwrap();

    assert!(calls >= 1);
    assert_eq!(stats.frames_delivered, stats.frames_acquired);
    assert_eq!(calls as u64, stats.frames_delivered);
    assert_eq!(live.load(Ordering::SeqCst), 0);
}

#[test]
fn test_acquisition_failure_stops_pipeline() {
    let source = MockFrameSource::new(16, 16)
        .with_frames([test_pattern(16, 16, 0), test_pattern(16, 16, 1)])
        .with_events([MockEvent::Fail("access lost".to_string())]);
    let live = source.live_surfaces();
    let mut pipeline = ReadbackPipeline::new(source);

    let result = pipeline.run(&[full(16, 16)], |_, _| true);

    match result {
        Err(LatencyError::AcquisitionFailure { reason }) => assert_eq!(reason, "access lost"),
        other => panic!("expected AcquisitionFailure, got {other:?}"),
    }
    assert_eq!(live.load(Ordering::SeqCst), 0);
}

#[test]
fn test_copy_failure_releases_frame() {
    let source = MockFrameSource::animated(16, 16, 3).with_copy_error("device removed");
    let mut pipeline = ReadbackPipeline::new(source);

    let result = pipeline.run(&[full(16, 16)], |_, _| true);

    assert!(matches!(result, Err(LatencyError::AcquisitionFailure { .. })));
    assert!(!pipeline.source().is_holding_frame());
    assert_eq!(pipeline.source().released_frames(), 1);
}

#[test]
fn test_callback_panic_reported() {
    let source = MockFrameSource::animated(8, 8, 4);
    let live = source.live_surfaces();
    let mut pipeline = ReadbackPipeline::new(source);

    let result = pipeline.run(&[full(8, 8)], |_, _| panic!("callback failed"));

    assert!(matches!(result, Err(LatencyError::WorkerPanicked { .. })));
    assert_eq!(live.load(Ordering::SeqCst), 0);
}

#[test]
fn test_unchanged_and_timeouts_counted() {
    let source = MockFrameSource::new(8, 8).with_events([
        MockEvent::Unchanged,
        MockEvent::TimedOut,
        MockEvent::Frame(test_pattern(8, 8, 0)),
        MockEvent::Unchanged,
        MockEvent::Frame(test_pattern(8, 8, 1)),
    ]);
    let mut pipeline = ReadbackPipeline::new(source);

    let (timestamps, stats) = run_collecting(&mut pipeline, &[full(8, 8)], 2, None);

    assert_eq!(timestamps.len(), 2);
    assert_eq!(stats.unchanged_frames, 2);
    assert!(stats.timeouts >= 1);
    assert_eq!(stats.frames_acquired, 2);
}

// ========================================================================
// Regions and Readback
// ========================================================================

#[test]
fn test_invalid_region_rejected_before_capture() {
    let mut pipeline = ReadbackPipeline::new(MockFrameSource::animated(16, 16, 2));

    let result = pipeline.run(&[CaptureRegion::new(-5, 0, 10, 10)], |_, _| true);
    assert!(matches!(result, Err(LatencyError::InvalidRegion { .. })));

    let result = pipeline.run(&[CaptureRegion::new(20, 0, 10, 10)], |_, _| true);
    assert!(matches!(result, Err(LatencyError::InvalidRegion { .. })));

    // nothing was acquired
    assert_eq!(pipeline.source().remaining_events(), 2);
}

#[test]
fn test_empty_region_list_rejected() {
    let mut pipeline = ReadbackPipeline::new(MockFrameSource::new(8, 8));
    let result = pipeline.run(&[], |_, _| true);
    assert!(matches!(result, Err(LatencyError::InvalidParameter { .. })));
}

#[test]
fn test_regions_clamped_and_cropped() {
    let frame = test_pattern(64, 48, 2);
    let source = MockFrameSource::new(64, 48).with_frames([frame.clone()]);
    let mut pipeline = ReadbackPipeline::new(source);

    let regions = [CaptureRegion::new(8, 4, 16, 16), CaptureRegion::new(50, 40, 100, 100)];
    let mut buffers = Vec::new();
    pipeline
        .run(&regions, |frame_buffers, _| {
            buffers = frame_buffers.to_vec();
            false
        })
        .unwrap();

    assert_eq!(buffers.len(), 2);
    assert_eq!(buffers[0], imageops::crop_imm(&frame, 8, 4, 16, 16).to_image());
    assert_eq!(buffers[1].dimensions(), (14, 8));
    assert_eq!(buffers[1], imageops::crop_imm(&frame, 50, 40, 14, 8).to_image());
}

#[test]
fn test_offset_desktop_origin() {
    let frame = test_pattern(32, 32, 1);
    let bounds = DesktopBounds {
        left:   -32,
        top:    0,
        right:  0,
        bottom: 32,
    };
    let source = MockFrameSource::new(32, 32).with_bounds(bounds).with_frames([frame.clone()]);
    let mut pipeline = ReadbackPipeline::new(source);

    let mut captured = None;
    pipeline
        .run(&[CaptureRegion::new(-16, 8, 8, 8)], |frame_buffers, _| {
            captured = Some(frame_buffers[0].clone());
            false
        })
        .unwrap();

    assert_eq!(captured.unwrap(), imageops::crop_imm(&frame, 16, 8, 8, 8).to_image());
}

#[test]
fn test_layouts_and_row_padding_read_back_identically() {
    let frame = test_pattern(30, 10, 5);
    for (layout, alignment) in [(PixelLayout::Bgra8, 256), (PixelLayout::Rgba8, 1), (PixelLayout::Rgba8, 64)] {
        let source = MockFrameSource::new(30, 10)
            .with_layout(layout)
            .with_row_alignment(alignment)
            .with_frames([frame.clone()]);
        let mut pipeline = ReadbackPipeline::new(source);

        let mut captured = None;
        pipeline
            .run(&[full(30, 10)], |frame_buffers, _| {
                captured = Some(frame_buffers[0].clone());
                false
            })
            .unwrap();
        assert_eq!(captured.unwrap(), frame, "layout {layout:?} alignment {alignment}");
    }
}

// ========================================================================
// Capture Session
// ========================================================================

#[test]
fn test_session_collect_uses_clock() {
    let source = MockFrameSource::animated(16, 16, 4);
    let mut session =
        CaptureSession::new(source).with_clock(Arc::new(SteppingClock::new(500, 25, 1000)));

    let frames = session.collect(&[full(16, 16)], 4).unwrap();
    let timestamps: Vec<i64> = frames[0].iter().map(|f| f.timestamp).collect();
    assert_eq!(timestamps, vec![500, 525, 550, 575]);
}
