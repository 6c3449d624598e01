//! Engine facade behavior: queries, seeks, parameters, meters, stop.

mod helpers;

use helpers::{standard_track, DeviceHandle, ManualDevice, Recorder};
use segue_engine::{DeckId, Engine, EngineConfig, EngineEvent, VecTrackQueue};
use std::sync::Arc;
use std::time::Duration;

fn start_engine(paths: &[std::path::PathBuf]) -> (Engine, DeviceHandle, Arc<Recorder>) {
    let mut queue = VecTrackQueue::new();
    for path in paths {
        queue.push_path(path.clone());
    }
    let (device, handle) = ManualDevice::create();
    let engine = Engine::with_device(Box::new(queue), device, EngineConfig::default()).unwrap();
    let recorder = Recorder::create();
    engine.add_listener(recorder.clone());
    (engine, handle, recorder)
}

#[test]
fn duration_and_position_track_the_main_deck() {
    let dir = tempfile::tempdir().unwrap();
    let t1 = standard_track(dir.path(), "t1.wav");
    let (engine, device, recorder) = start_engine(&[t1]);

    assert_eq!(engine.duration_seconds(), 0.0);
    assert_eq!(engine.position_seconds(), 0.0);

    engine.play();
    assert!(recorder.wait_for(5_000, |e| matches!(e, EngineEvent::Loaded { deck: DeckId::A })));
    assert!((engine.duration_seconds() - 10.0).abs() < 0.05);

    device.pump_until(100, || false);
    assert!(engine.position_seconds() > 0.5);
}

#[test]
fn seek_repositions_the_main_deck() {
    let dir = tempfile::tempdir().unwrap();
    let t1 = standard_track(dir.path(), "t1.wav");
    let (engine, device, recorder) = start_engine(&[t1]);

    engine.play();
    assert!(recorder.wait_for(5_000, |e| matches!(e, EngineEvent::Started { deck: DeckId::A })));

    engine.seek(5.0);
    assert!((engine.position_seconds() - 5.0).abs() < 0.05);

    // Playback continues from the new position.
    device.pump_until(50, || false);
    let position = engine.position_seconds();
    assert!(position >= 5.0 && position < 6.5);

    engine.seek_fractional(0.1);
    assert!((engine.position_seconds() - 1.0).abs() < 0.1);
}

#[test]
fn fading_curve_and_limits_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let t1 = standard_track(dir.path(), "t1.wav");
    let (engine, _device, _recorder) = start_engine(&[t1]);

    assert_eq!(engine.fading_curve(), 50.0);
    engine.set_fading_curve(80.0);
    assert_eq!(engine.fading_curve(), 80.0);
    engine.set_fading_curve(300.0);
    assert_eq!(engine.fading_curve(), 100.0);

    engine.set_max_transition_time(5.0);
    assert_eq!(engine.max_transition_time(), 5.0);
    engine.set_max_leading_duration(4.0);
    assert_eq!(engine.max_leading_duration(), 4.0);
}

#[test]
fn master_gain_scales_the_mix() {
    let dir = tempfile::tempdir().unwrap();
    let t1 = standard_track(dir.path(), "t1.wav");
    let (engine, device, recorder) = start_engine(&[t1]);

    engine.play();
    assert!(recorder.wait_for(5_000, |e| matches!(e, EngineEvent::Started { deck: DeckId::A })));
    device.pump_until(50, || false);

    let peak = |block: &[f32]| block.iter().fold(0.0f32, |m, s| m.max(s.abs()));

    let full = device.pump();
    assert!(peak(&full) > 0.4, "expected ≈0.5 peak, got {}", peak(&full));

    engine.set_gain(0.5);
    device.pump(); // ramp block
    let halved = device.pump();
    assert!(
        (peak(&halved) - 0.25).abs() < 0.05,
        "expected ≈0.25 peak at half gain, got {}",
        peak(&halved)
    );
}

#[test]
fn level_meters_follow_the_output() {
    let dir = tempfile::tempdir().unwrap();
    let t1 = standard_track(dir.path(), "t1.wav");
    let (engine, device, recorder) = start_engine(&[t1]);

    assert_eq!(engine.get_level(0), 0.0);

    engine.play();
    assert!(recorder.wait_for(5_000, |e| matches!(e, EngineEvent::Started { deck: DeckId::A })));
    for _ in 0..30 {
        device.pump();
        std::thread::sleep(Duration::from_millis(2));
    }
    // Give the visualisation worker a few ticks to fold summaries in.
    std::thread::sleep(Duration::from_millis(60));
    device.pump();
    std::thread::sleep(Duration::from_millis(30));

    assert!(engine.get_level(0) > 0.05, "left level {}", engine.get_level(0));
    assert!(engine.get_peak_level(1) > 0.3, "right peak {}", engine.get_peak_level(1));
}

#[test]
fn stop_unloads_both_decks() {
    let dir = tempfile::tempdir().unwrap();
    let t1 = standard_track(dir.path(), "t1.wav");
    let t2 = standard_track(dir.path(), "t2.wav");
    let (engine, device, recorder) = start_engine(&[t1, t2]);

    engine.play();
    assert!(recorder.wait_for(5_000, |e| matches!(e, EngineEvent::Started { deck: DeckId::A })));
    device.pump_until(20, || false);

    engine.stop();
    assert!(!engine.is_playing());
    assert!(engine.deck_snapshot(DeckId::A).is_none());
    assert!(engine.deck_snapshot(DeckId::B).is_none());
    assert!(recorder.has(|e| matches!(e, EngineEvent::Unloaded { deck: DeckId::A })));

    // A later play() pulls the remaining queue entry.
    engine.play();
    let start = std::time::Instant::now();
    while recorder.count(|e| matches!(e, EngineEvent::Loaded { .. })) < 2 {
        assert!(
            start.elapsed() < Duration::from_secs(5),
            "second load never happened"
        );
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn removed_listener_hears_nothing_more() {
    let dir = tempfile::tempdir().unwrap();
    let t1 = standard_track(dir.path(), "t1.wav");
    let (engine, _device, recorder) = start_engine(&[t1]);

    let second = Recorder::create();
    let id = engine.add_listener(second.clone());
    assert!(engine.remove_listener(id));
    assert!(!engine.remove_listener(id));

    engine.play();
    assert!(recorder.wait_for(5_000, |e| matches!(e, EngineEvent::Loaded { deck: DeckId::A })));
    assert_eq!(second.events().len(), 0);
}
