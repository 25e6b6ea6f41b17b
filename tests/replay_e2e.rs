use glam::Vec3;
use meshprobe::config::EffectiveConfig;
use meshprobe::detect::CancelToken;
use meshprobe::fit::{FitParams, SEED_RADIUS_RANGE, TargetFeature};
use meshprobe::geometry::{Plane, Primitive, SurfaceFit, placement};
use meshprobe::mesh::FragmentKey;
use meshprobe::store::ObjectStore;
use meshprobe::tape::compress::write_tape_text;
use meshprobe::tape::replay::{ReplayMode, replay_live};
use meshprobe::tape::{ReplayHarness, ReplayReport, Tape, TapeEvent, TapeEventData, to_jsonl};

fn ev(t: u64, data: TapeEventData) -> TapeEvent {
    TapeEvent { t, data }
}

fn plane() -> SurfaceFit {
    SurfaceFit::new(
        Primitive::Plane(Plane {
            width: 1.5,
            height: 1.5,
            extrinsics: placement(Vec3::new(0.0, 0.0, -1.0), Vec3::Z),
        }),
        vec![
            Vec3::new(-0.2, 0.0, -1.0),
            Vec3::new(0.2, 0.0, -1.0),
            Vec3::new(0.0, 0.2, -1.0),
        ],
        0.004,
    )
}

/// Wall in front of the viewer, looking at it, armed.
fn opening() -> Vec<TapeEvent> {
    vec![
        ev(
            0,
            TapeEventData::MeshAdd {
                key: FragmentKey::new(),
                vertices: vec![
                    Vec3::new(-1.0, -1.0, -1.0),
                    Vec3::new(1.0, -1.0, -1.0),
                    Vec3::new(0.0, 1.0, -1.0),
                ],
                faces: vec![[0, 1, 2]],
            },
        ),
        ev(
            0,
            TapeEventData::Pose {
                position: Vec3::ZERO,
                forward: Vec3::NEG_Z,
            },
        ),
        ev(1, TapeEventData::Arm { armed: true }),
    ]
}

/// Finds a plane, then commits against the retained result `commit_delay` ms later.
fn commit_tape(commit_delay: u64) -> Tape {
    let mut events = opening();
    events.extend([
        ev(2, TapeEventData::Fit { result: Some(plane()) }),
        ev(10, TapeEventData::Tick { count: 1 }),
        ev(10 + commit_delay, TapeEventData::Commit),
        ev(10 + commit_delay, TapeEventData::Tick { count: 1 }),
    ]);
    Tape::parse(&to_jsonl(&events).expect("serialize tape")).expect("parse tape")
}

fn run(store: ObjectStore, tape: &Tape) -> ReplayReport {
    let mut harness = ReplayHarness::new(store, &EffectiveConfig::default()).expect("harness");
    harness.run(tape).expect("replay")
}

#[test]
fn retained_result_commits_and_promotes() {
    let report = run(ObjectStore::open_in_memory().expect("store"), &commit_tape(50));

    assert_eq!(report.mode, ReplayMode::Deterministic);
    assert_eq!(report.events, 7);
    assert_eq!(report.duration_ms, 60);
    assert_eq!(report.iterations.total, 2);
    assert_eq!(report.iterations.previewed, 1);
    assert_eq!(report.iterations.committed, 1);
    assert_eq!(report.fit_calls, 2);
    assert_eq!(report.committed, vec!["Plane0".to_string()]);
    assert_eq!(report.anchors.promoted, 1);
    assert_eq!(report.objects_stored, 1);
    assert_eq!(report.pending, 0);
    assert_eq!(report.live_objects, 1);
    assert_eq!(report.feedback.commits_succeeded, vec!["Plane0".to_string()]);
    assert_eq!(report.feedback.spawned, 1);
    assert_eq!(report.stats.iterations, 2);
    assert_eq!(report.stats.found_in_window, 1);
}

#[test]
fn stale_retained_result_fails_the_commit() {
    let report = run(ObjectStore::open_in_memory().expect("store"), &commit_tape(250));

    assert_eq!(report.iterations.commit_failed, 1);
    assert_eq!(report.feedback.commits_failed, 1);
    assert!(report.committed.is_empty());
    assert_eq!(report.objects_stored, 0);
    assert_eq!(report.pending, 0);
}

#[test]
fn configured_target_filters_other_primitives() {
    let config = EffectiveConfig {
        fit: FitParams {
            target: TargetFeature::Sphere,
            seed_radius: 50.0,
            ..FitParams::default()
        },
        ..EffectiveConfig::default()
    };
    let mut harness =
        ReplayHarness::new(ObjectStore::open_in_memory().expect("store"), &config).expect("harness");
    let report = harness.run(&commit_tape(50)).expect("replay");

    assert_eq!(report.fit_params.target, TargetFeature::Sphere);
    assert_eq!(report.fit_params.seed_radius, SEED_RADIUS_RANGE.1);
    assert_eq!(report.iterations.previewed, 0);
    assert_eq!(report.iterations.not_found, 1);
    assert_eq!(report.iterations.commit_failed, 1);
    assert!(report.committed.is_empty());
    assert_eq!(report.objects_stored, 0);
}

#[test]
fn rejected_anchor_leaves_nothing_behind() {
    let mut events = opening();
    events.extend([
        ev(2, TapeEventData::AnchorReject),
        ev(3, TapeEventData::Fit { result: Some(plane()) }),
        ev(3, TapeEventData::Commit),
        ev(4, TapeEventData::Tick { count: 1 }),
    ]);
    let tape = Tape::parse(&to_jsonl(&events).expect("serialize")).expect("parse");
    let report = run(ObjectStore::open_in_memory().expect("store"), &tape);

    assert_eq!(report.iterations.commit_failed, 1);
    assert_eq!(report.pending, 0);
    assert_eq!(report.objects_stored, 0);
    assert_eq!(report.anchors.promoted, 0);
    assert_eq!(report.feedback.commits_failed, 1);
}

#[test]
fn commits_while_disarmed_are_ignored() {
    let mut events = opening();
    events.extend([
        ev(2, TapeEventData::Arm { armed: false }),
        ev(3, TapeEventData::Commit),
        ev(4, TapeEventData::Tick { count: 3 }),
    ]);
    let tape = Tape::parse(&to_jsonl(&events).expect("serialize")).expect("parse");
    let report = run(ObjectStore::open_in_memory().expect("store"), &tape);

    assert_eq!(report.commits_ignored, 1);
    assert_eq!(report.iterations.scanned, 3);
    assert_eq!(report.fit_calls, 0);
    assert_eq!(report.feedback.highlights, 3);
}

#[test]
fn fitter_errors_count_as_not_found() {
    let mut events = opening();
    events.extend([
        ev(2, TapeEventData::FitError {
            message: "diverged".to_string(),
        }),
        ev(3, TapeEventData::Tick { count: 2 }),
    ]);
    let tape = Tape::parse(&to_jsonl(&events).expect("serialize")).expect("parse");
    let report = run(ObjectStore::open_in_memory().expect("store"), &tape);

    assert_eq!(report.iterations.not_found, 2);
    assert_eq!(report.fit_calls, 2);
    assert_eq!(report.feedback.previews_cleared, 2);
}

#[test]
fn lost_pose_misses() {
    let mut events = opening();
    events.extend([
        ev(2, TapeEventData::PoseLost),
        ev(3, TapeEventData::Tick { count: 2 }),
    ]);
    let tape = Tape::parse(&to_jsonl(&events).expect("serialize")).expect("parse");
    let report = run(ObjectStore::open_in_memory().expect("store"), &tape);

    assert_eq!(report.iterations.missed, 2);
    assert_eq!(report.fit_calls, 0);
    assert_eq!(report.stats.iterations, 2);
    assert_eq!(report.stats.found_in_window, 0);
}

#[test]
fn release_all_removes_stored_objects() {
    let mut events = commit_tape(20)
        .events
        .into_iter()
        .map(|at| at.event)
        .collect::<Vec<_>>();
    events.push(ev(40, TapeEventData::ReleaseAll));
    let tape = Tape::parse(&to_jsonl(&events).expect("serialize")).expect("parse");
    let report = run(ObjectStore::open_in_memory().expect("store"), &tape);

    assert_eq!(report.anchors.promoted, 1);
    assert_eq!(report.anchors.removed, 1);
    assert_eq!(report.objects_stored, 0);
    assert_eq!(report.live_objects, 0);
    assert_eq!(report.feedback.despawned, 1);
}

#[test]
fn objects_survive_between_sessions() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = dir.path().join("objects.sqlite");

    let first = run(ObjectStore::open(&db).expect("open"), &commit_tape(30));
    assert_eq!(first.committed, vec!["Plane0".to_string()]);

    let second = run(ObjectStore::open(&db).expect("reopen"), &commit_tape(30));
    assert_eq!(second.anchors.recovered, 1);
    assert_eq!(second.committed, vec!["Plane1".to_string()]);
    assert_eq!(second.objects_stored, 2);
    assert_eq!(second.live_objects, 2);
}

#[test]
fn compressed_tape_replays_like_plain() {
    let dir = tempfile::tempdir().expect("tempdir");
    let tape = commit_tape(50);
    let events = tape.events.iter().map(|at| at.event.clone()).collect::<Vec<_>>();
    let packed = dir.path().join("session.jsonl.zst");
    write_tape_text(&packed, &to_jsonl(&events).expect("serialize")).expect("write");

    let from_disk = Tape::read(&packed).expect("read");
    assert_eq!(from_disk.id, tape.id);
    let report = run(ObjectStore::open_in_memory().expect("store"), &from_disk);
    assert_eq!(report.committed, vec!["Plane0".to_string()]);
}

#[test]
fn live_replay_runs_in_the_background() {
    let mut events = opening();
    events.push(ev(30, TapeEventData::Tick { count: 1 }));
    let tape = Tape::parse(&to_jsonl(&events).expect("serialize")).expect("parse");

    let (report, points) = replay_live(
        &tape,
        ObjectStore::open_in_memory().expect("store"),
        &EffectiveConfig::default(),
        &CancelToken::new(),
    )
    .expect("live replay");

    assert_eq!(report.mode, ReplayMode::Live);
    assert_eq!(report.events, 4);
    assert_eq!(report.objects_stored, 0);
    assert_eq!(points.len(), 3);
}

#[test]
fn cancelled_live_replay_returns_early() {
    let mut events = opening();
    events.push(ev(60_000, TapeEventData::Commit));
    let tape = Tape::parse(&to_jsonl(&events).expect("serialize")).expect("parse");
    let cancel = CancelToken::new();
    cancel.cancel();

    let (report, _) = replay_live(
        &tape,
        ObjectStore::open_in_memory().expect("store"),
        &EffectiveConfig::default(),
        &cancel,
    )
    .expect("live replay");
    assert_eq!(report.commits_ignored, 0);
    assert!(report.committed.is_empty());
}
