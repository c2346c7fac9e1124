mod common;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::{clip, ends_after, millis, rig, rtsp, wait_for};
use stream_sampler::source::synthetic::{OpenStep, Pattern, SyntheticOpener};
use stream_sampler::{FrameReader, FrameSource, ReaderConfig, ReaderState, SystemClock};

#[test]
fn ten_seconds_at_thirty_fps_sampled_to_two_fps() {
    let config = ReaderConfig {
        target_fps: 2.0,
        output_width: 320,
        output_height: 180,
        max_reconnect_attempts: Some(0),
        ..ReaderConfig::default()
    };
    let rig = rig(rtsp(), config, ends_after(300), |o| o);

    rig.reader.start().unwrap();
    wait_for("end of stream", || rig.reader.state() == ReaderState::Failed);

    let stats = rig.reader.stats();
    assert_eq!(stats.decoded, 300);
    assert!((19..=21).contains(&stats.published), "{stats:?}");
    assert_eq!(stats.published + stats.sampled_out, stats.decoded);

    let frame = rig.reader.read().unwrap();
    assert_eq!((frame.width(), frame.height()), (320, 180));
    assert_eq!(frame.as_bytes().len(), 320 * 180 * 3);
    assert_eq!(frame.sequence, stats.published);
}

#[test]
fn permanent_failure_gives_up_after_backoff_schedule() {
    let config = ReaderConfig {
        reconnect_backoff: millis(&[100, 200, 400]),
        max_reconnect_attempts: Some(3),
        ..ReaderConfig::default()
    };
    let rig = rig(rtsp(), config, ends_after(1), |o| {
        o.with_script([OpenStep::Succeed])
            .then_always(OpenStep::Fail)
    });

    rig.reader.start().unwrap();
    wait_for("failure", || rig.reader.state() == ReaderState::Failed);

    assert_eq!(rig.clock.elapsed(), Duration::from_millis(700));
    assert!(!rig.reader.is_healthy());
    assert_eq!(rig.reader.read().map(|f| f.sequence), Some(1));
    assert_eq!(rig.opener.open_attempts(), 4);
    assert_eq!(rig.reader.stats().reconnect_attempts, 3);
    let error = rig.reader.status().last_error.unwrap();
    assert!(error.contains("3 reconnect attempts"), "{error}");

    // No silent restart.
    thread::sleep(Duration::from_millis(20));
    assert_eq!(rig.reader.state(), ReaderState::Failed);
    assert_eq!(rig.opener.open_attempts(), 4);
}

#[test]
fn recovers_when_failures_fit_the_attempt_budget() {
    let config = ReaderConfig {
        target_fps: 1_000.0,
        reconnect_backoff: millis(&[100]),
        max_reconnect_attempts: Some(3),
        ..ReaderConfig::default()
    };
    let rig = rig(rtsp(), config, ends_after(1), |o| {
        o.with_script([OpenStep::Succeed, OpenStep::Fail, OpenStep::Fail])
    });

    rig.reader.start().unwrap();
    wait_for("fresh frames after recovery", || {
        rig.reader.read().is_some_and(|f| f.sequence >= 3)
    });

    assert_ne!(rig.reader.state(), ReaderState::Failed);
    assert!(rig.opener.opened() >= 3);
    rig.reader.stop();
    assert_eq!(rig.opener.live_captures(), 0);
}

#[test]
fn fails_when_failures_exceed_the_attempt_budget() {
    let config = ReaderConfig {
        reconnect_backoff: millis(&[100]),
        max_reconnect_attempts: Some(3),
        ..ReaderConfig::default()
    };
    let rig = rig(rtsp(), config, ends_after(1), |o| {
        o.with_script([OpenStep::Succeed])
            .with_script([OpenStep::Fail; 5])
    });

    rig.reader.start().unwrap();
    wait_for("failure", || rig.reader.state() == ReaderState::Failed);

    assert_eq!(rig.opener.opened(), 1);
    assert_eq!(rig.reader.read().map(|f| f.sequence), Some(1));
}

#[test]
fn files_loop_without_reconnecting() {
    let rig = rig(clip(), ReaderConfig::default(), ends_after(30), |o| o);

    rig.reader.start().unwrap();
    wait_for("two loops", || rig.reader.stats().file_loops >= 2);
    rig.reader.stop();

    let stats = rig.reader.stats();
    assert_eq!(stats.reconnect_attempts, 0);
    assert_eq!(rig.opener.opened() as u64, stats.file_loops + 1);
    assert_eq!(rig.opener.live_captures(), 0);
    assert_eq!(rig.reader.state(), ReaderState::Stopped);
}

#[test]
fn fallback_takes_over_after_repeated_failures() {
    let config = ReaderConfig {
        target_fps: 1_000.0,
        reconnect_backoff: millis(&[100]),
        max_reconnect_attempts: Some(10),
        fallback: Some(clip()),
        fallback_after: 2,
        ..ReaderConfig::default()
    };
    let rig = rig(rtsp(), config, ends_after(1), |o| {
        o.with_script([
            OpenStep::Succeed,
            OpenStep::Fail,
            OpenStep::Fail,
            OpenStep::Succeed,
        ])
        .then_always(OpenStep::Fail)
    });

    rig.reader.start().unwrap();
    wait_for("fallback", || rig.reader.status().active_source == clip());
    wait_for("fallback frame", || {
        rig.reader.read().is_some_and(|f| f.sequence >= 2)
    });

    assert_eq!(rig.opener.opened_sources(), vec![rtsp(), clip()]);
    rig.reader.stop();
    assert_eq!(rig.opener.live_captures(), 0);
}

#[test]
fn start_and_stop_are_idempotent() {
    let rig = rig(rtsp(), ReaderConfig::default(), Pattern::default(), |o| o);

    rig.reader.stop();
    assert_eq!(rig.reader.state(), ReaderState::Stopped);

    rig.reader.start().unwrap();
    rig.reader.start().unwrap();
    assert_eq!(rig.opener.opened(), 1);
    wait_for("first frame", || rig.reader.read().is_some());

    rig.reader.stop();
    rig.reader.stop();
    assert_eq!(rig.reader.state(), ReaderState::Stopped);
    assert_eq!(rig.opener.live_captures(), 0);
    assert!(!rig.reader.is_healthy());
}

#[test]
fn restart_keeps_sequence_numbers_monotonic() {
    let rig = rig(rtsp(), ReaderConfig::default(), Pattern::default(), |o| o);

    rig.reader.start().unwrap();
    wait_for("frames", || rig.reader.read().is_some_and(|f| f.sequence >= 2));
    rig.reader.stop();
    let before = rig.reader.read().unwrap().sequence;

    rig.reader.start().unwrap();
    wait_for("frames after restart", || {
        rig.reader.read().is_some_and(|f| f.sequence > before)
    });
    rig.reader.stop();
    assert_eq!(rig.opener.opened(), 2);
    assert_eq!(rig.opener.live_captures(), 0);
}

#[test]
fn failed_reader_recovers_only_through_stop_and_start() {
    let config = ReaderConfig {
        reconnect_backoff: millis(&[100]),
        max_reconnect_attempts: Some(1),
        ..ReaderConfig::default()
    };
    let rig = rig(rtsp(), config, ends_after(1), |o| {
        o.with_script([OpenStep::Succeed, OpenStep::Fail])
    });

    rig.reader.start().unwrap();
    wait_for("failure", || rig.reader.state() == ReaderState::Failed);

    rig.reader.start().unwrap();
    assert_eq!(rig.reader.state(), ReaderState::Failed);

    rig.reader.stop();
    rig.reader.start().unwrap();
    assert_ne!(rig.reader.state(), ReaderState::Failed);
    rig.reader.stop();
}

#[test]
fn concurrent_readers_never_go_backwards() {
    let rig = rig(rtsp(), ReaderConfig::default(), Pattern::default(), |o| o);
    rig.reader.start().unwrap();

    thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                let mut last = 0;
                for _ in 0..500 {
                    if let Some(frame) = rig.reader.read() {
                        assert!(frame.sequence >= last);
                        last = frame.sequence;
                    }
                }
            });
        }
    });

    rig.reader.stop();
    assert_eq!(rig.opener.live_captures(), 0);
}

#[test]
fn blocking_stream_ends_with_the_last_frame() {
    let config = ReaderConfig {
        max_reconnect_attempts: Some(0),
        ..ReaderConfig::default()
    };
    let rig = rig(rtsp(), config, ends_after(300), |o| o);
    rig.reader.start().unwrap();

    let sequences: Vec<u64> = rig
        .reader
        .read_stream(Duration::from_millis(1))
        .map(|frame| frame.sequence)
        .collect();

    assert!(sequences.windows(2).all(|pair| pair[0] < pair[1]));
    assert_eq!(sequences.last().copied(), Some(rig.reader.stats().published));
}

/// Every `read()` and `is_healthy()` call stays well under `bound`.
fn assert_reads_return_promptly(reader: &FrameReader, bound: Duration) {
    for _ in 0..100 {
        let started = Instant::now();
        assert!(reader.read().is_some());
        reader.is_healthy();
        let took = started.elapsed();
        assert!(took < bound, "read took {took:?}");
    }
}

#[test]
fn reads_never_wait_on_a_reconnecting_or_failed_reader() {
    let bound = Duration::from_millis(10);
    let clock = Arc::new(SystemClock);

    let opener = Arc::new(SyntheticOpener::new(ends_after(1), clock.clone()));
    let config = ReaderConfig {
        reconnect_backoff: vec![Duration::from_secs(30)],
        ..ReaderConfig::default()
    };
    let reader = FrameReader::with_opener(rtsp(), config, opener.clone(), clock.clone()).unwrap();
    reader.start().unwrap();
    wait_for("backoff wait", || {
        reader.state() == ReaderState::Reconnecting && reader.read().is_some()
    });
    assert_reads_return_promptly(&reader, bound);
    assert_eq!(reader.state(), ReaderState::Reconnecting);

    let started = Instant::now();
    reader.stop();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(opener.live_captures(), 0);

    let config = ReaderConfig {
        max_reconnect_attempts: Some(0),
        ..ReaderConfig::default()
    };
    let reader = FrameReader::with_opener(
        rtsp(),
        config,
        Arc::new(SyntheticOpener::new(ends_after(1), clock.clone())),
        clock,
    )
    .unwrap();
    reader.start().unwrap();
    wait_for("failure", || reader.state() == ReaderState::Failed);
    assert_reads_return_promptly(&reader, bound);
}
