//! Several workers, each with its own coordinator, sharing one flag store.

use facelog_core::{
    Coordinator, Embedding, GalleryIndex, MemoryFlagStore, Outcome, Reconciler,
    ReconcilerConfig, RecordingSink, SimilarityIndex, Subject, Suppression, EMBEDDING_DIM,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn along(a: usize, b: usize, sim: f32) -> Embedding {
    let mut v = vec![0.0f32; EMBEDDING_DIM];
    v[a] = sim;
    v[b] = (1.0 - sim * sim).max(0.0).sqrt();
    Embedding::normalized(v).unwrap()
}

struct Cluster {
    index: Arc<GalleryIndex>,
    sink: Arc<RecordingSink>,
    workers: Vec<Arc<Reconciler>>,
}

async fn cluster(size: usize) -> Cluster {
    let config = ReconcilerConfig::default();
    let store = Arc::new(MemoryFlagStore::new());
    let index = Arc::new(GalleryIndex::new());
    index.upsert("alice", &along(0, 1, 1.0)).await.unwrap();
    index.upsert("bob", &along(10, 11, 1.0)).await.unwrap();
    let sink = Arc::new(RecordingSink::new());

    let workers = (0..size)
        .map(|_| {
            let coordinator = Arc::new(Coordinator::new(
                store.clone(),
                config.dedup_ttl,
                config.camera_lock_ttl,
            ));
            Arc::new(Reconciler::new(
                coordinator,
                index.clone(),
                sink.clone(),
                config.clone(),
            ))
        })
        .collect();

    Cluster { index, sink, workers }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_person_on_many_cameras_recorded_once() {
    let c = cluster(4).await;

    let mut tasks = Vec::new();
    for (i, reconciler) in c.workers.iter().enumerate() {
        for j in 0..5 {
            let reconciler = reconciler.clone();
            let camera = format!("cam{}", i * 5 + j);
            let frame = along(0, 20 + i * 5 + j, 0.8);
            tasks.push(tokio::spawn(async move {
                reconciler.reconcile(&camera, &frame).await.unwrap()
            }));
        }
    }

    let mut matched = 0;
    for task in tasks {
        match task.await.unwrap() {
            Outcome::Matched { .. } => matched += 1,
            Outcome::Suppressed(Suppression::EmployeeCooldown { .. }) => {}
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    assert_eq!(matched, 1);
    assert_eq!(c.sink.count_for(&Subject::Employee("alice".into())), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn identical_frame_on_every_worker_scored_once() {
    let c = cluster(4).await;
    let frame = along(10, 12, 0.9);

    let tasks: Vec<_> = c
        .workers
        .iter()
        .enumerate()
        .map(|(i, reconciler)| {
            let reconciler = reconciler.clone();
            let frame = frame.clone();
            tokio::spawn(async move { reconciler.reconcile(&format!("cam{i}"), &frame).await.unwrap() })
        })
        .collect();

    let mut duplicates = 0;
    for task in tasks {
        if task.await.unwrap() == Outcome::Suppressed(Suppression::DuplicateFrame) {
            duplicates += 1;
        }
    }

    assert_eq!(duplicates, 3);
    assert_eq!(c.index.query_count(), 1);
    assert_eq!(c.sink.count_for(&Subject::Employee("bob".into())), 1);
}

#[tokio::test]
async fn unknown_faces_on_one_camera_guessed_once_across_workers() {
    let c = cluster(3).await;

    let mut outcomes = Vec::new();
    for (i, reconciler) in c.workers.iter().enumerate() {
        let stranger = along(100 + i, 200 + i, 1.0);
        outcomes.push(reconciler.reconcile("lobby", &stranger).await.unwrap());
    }

    assert!(matches!(outcomes[0], Outcome::Guessed { recorded: true, .. }));
    for outcome in &outcomes[1..] {
        assert_eq!(outcome, &Outcome::Suppressed(Suppression::GuessCooldown));
    }
    assert_eq!(c.sink.count_for(&Subject::Unknown), 1);
}

#[tokio::test(start_paused = true)]
async fn hold_cancelled_by_confident_frame_on_another_worker() {
    let c = cluster(2).await;
    let holder = &c.workers[0];
    let second = &c.workers[1];
    let ambiguous = along(0, 2, 0.47);
    let confident = along(0, 3, 0.9);
    let poll = ReconcilerConfig::default().hold_poll;

    let started = Instant::now();
    let hold = async {
        let outcome = holder.reconcile("cam1", &ambiguous).await.unwrap();
        (outcome, started.elapsed())
    };
    let matched = async {
        tokio::time::sleep(Duration::from_millis(400)).await;
        second.reconcile("cam1", &confident).await.unwrap()
    };
    let ((held, held_for), matched) = tokio::join!(hold, matched);

    match matched {
        Outcome::Matched { identity_id, recorded, .. } => {
            assert_eq!(identity_id, "alice");
            assert!(recorded);
        }
        other => panic!("expected Matched, got {other:?}"),
    }
    assert_eq!(held, Outcome::Suppressed(Suppression::SupersededByMatch));
    // noticed on the next store poll, well before the hold window ends
    assert!(held_for <= Duration::from_millis(400) + poll);
    assert_eq!(c.sink.count_for(&Subject::Employee("alice".into())), 1);
    assert_eq!(c.sink.count_for(&Subject::Unknown), 0);
}
