//! End-to-end pipeline runs against scripted collaborators.

use super::test_utils::{
    sample_design, ScriptedGeneration, ScriptedSimilarity, StackComposer, StaticFingerprint,
    TableFormatter,
};
use archsheet::error::{PipelineError, ServiceError, StorageError};
use archsheet::pipeline::{
    PacingConfig, PacingQueue, Pipeline, PipelineOutcome, PipelineServices, PipelineSettings,
    RunOptions,
};
use archsheet::progress::{MemoryProgressSink, ProgressRuntime};
use archsheet::store::{BaselineStore, SledBaselineStore};
use archsheet::types::PanelRole;
use std::sync::Arc;
use std::time::Duration;

struct Fixture {
    generation: Arc<ScriptedGeneration>,
    similarity: Arc<ScriptedSimilarity>,
    composer: Arc<StackComposer>,
    sink: Arc<MemoryProgressSink>,
    store: Arc<SledBaselineStore>,
    pipeline: Pipeline,
}

fn fixture() -> Fixture {
    let generation = Arc::new(ScriptedGeneration::default());
    let similarity = Arc::new(ScriptedSimilarity::default());
    let composer = Arc::new(StackComposer::default());
    let sink = Arc::new(MemoryProgressSink::new());
    let store = Arc::new(SledBaselineStore::temporary().unwrap());

    let queue = Arc::new(PacingQueue::new(PacingConfig {
        min_interval_ms: 500,
        ..PacingConfig::default()
    }));
    queue.start().unwrap();

    let services = PipelineServices::new(
        generation.clone(),
        similarity.clone(),
        Arc::new(StaticFingerprint),
        composer.clone(),
    )
    .with_formatter(Arc::new(TableFormatter));
    let pipeline = Pipeline::new(PipelineSettings::default(), services, queue)
        .with_store(store.clone())
        .with_progress(Arc::new(ProgressRuntime::new(sink.clone())));

    Fixture {
        generation,
        similarity,
        composer,
        sink,
        store,
        pipeline,
    }
}

fn roles(names: &[PanelRole]) -> RunOptions {
    RunOptions {
        roles: Some(names.to_vec()),
        ..RunOptions::default()
    }
}

#[tokio::test(start_paused = true)]
async fn anchor_is_generated_first_and_calls_are_paced() {
    let f = fixture();
    let outcome = f
        .pipeline
        .run(
            &sample_design(),
            roles(&[
                PanelRole::ELEVATION_NORTH,
                PanelRole::SECTION_A,
                PanelRole::HERO_3D,
            ]),
        )
        .await;
    assert!(outcome.is_success());

    let called = f.generation.roles_called();
    assert_eq!(called[0], PanelRole::HERO_3D);
    assert_eq!(called.len(), 3);
    for pair in f.generation.call_times().windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_millis(500));
    }

    // Dependents reference the anchor artifact
    for request in &f.generation.requests()[1..] {
        assert_eq!(
            request.reference_artifact.as_ref().map(|a| a.as_str()),
            Some("hero_3d#1")
        );
    }
    assert_eq!(f.sink.count("plan_corrected"), 1);
}

#[tokio::test(start_paused = true)]
async fn persistent_drift_aborts_without_persisting() {
    let f = fixture();
    f.similarity
        .script(PanelRole::ELEVATION_NORTH, vec![0.65, 0.82]);
    f.similarity
        .script(PanelRole::ELEVATION_SOUTH, vec![0.70, 0.72, 0.75]);

    let outcome = f
        .pipeline
        .run(
            &sample_design(),
            roles(&[
                PanelRole::HERO_3D,
                PanelRole::ELEVATION_NORTH,
                PanelRole::ELEVATION_SOUTH,
            ]),
        )
        .await;

    let PipelineOutcome::Failed(failure) = outcome else {
        panic!("expected a failed run");
    };
    match &failure.error {
        PipelineError::ConsistencyFailure { failed } => {
            assert_eq!(failed, &vec![(PanelRole::ELEVATION_SOUTH, 0.75)]);
        }
        other => panic!("unexpected error: {other}"),
    }
    let partial = failure.partial_bundle.expect("partial bundle");
    assert!(partial.panel(&PanelRole::HERO_3D).is_some());
    assert!(partial.panel(&PanelRole::ELEVATION_NORTH).is_some());
    assert!(partial.panel(&PanelRole::ELEVATION_SOUTH).is_none());
    assert_eq!(partial.required_roles.len(), 3);
    assert!(matches!(
        f.store.save(&partial),
        Err(StorageError::MissingRole(role)) if role == PanelRole::ELEVATION_SOUTH
    ));

    assert!(f.store.load_latest("house-001").unwrap().is_none());
    assert!(f.composer.requests.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn anchor_failure_fails_fast() {
    let f = fixture();
    f.generation.fail(
        PanelRole::HERO_3D,
        (0..5).map(|_| ServiceError::transient("503")).collect(),
    );

    let outcome = f
        .pipeline
        .run(
            &sample_design(),
            roles(&[PanelRole::HERO_3D, PanelRole::ELEVATION_NORTH]),
        )
        .await;

    let failure = outcome.into_result().unwrap_err();
    assert!(matches!(
        failure.error,
        PipelineError::AnchorFailure { attempts: 5, .. }
    ));
    assert!(f
        .generation
        .roles_called()
        .iter()
        .all(|role| *role == PanelRole::HERO_3D));
}

#[tokio::test(start_paused = true)]
async fn repeated_runs_reuse_seeds_and_supersede_baseline() {
    let f = fixture();
    let options = roles(&[
        PanelRole::HERO_3D,
        PanelRole::FLOOR_PLAN_GROUND,
        PanelRole::SCHEDULES,
    ]);

    let first = f
        .pipeline
        .run(&sample_design(), options.clone())
        .await
        .into_result()
        .unwrap();
    let second = f
        .pipeline
        .run(&sample_design(), options)
        .await
        .into_result()
        .unwrap();

    assert_eq!(first.bundle.seeds, second.bundle.seeds);
    assert_ne!(first.run_id, second.run_id);
    assert_eq!(
        second.bundle.panel(&PanelRole::SCHEDULES).unwrap().artifact_ref.as_ref().map(|a| a.as_str()),
        Some("schedules#table")
    );

    let latest = f.store.load_latest("house-001").unwrap().unwrap();
    assert_eq!(latest.run_id, second.run_id);
    assert_eq!(f.store.list_runs("house-001").unwrap().len(), 2);

    let composed = f.composer.requests.lock();
    assert_eq!(composed.len(), 2);
    let order: Vec<PanelRole> = composed[0].panels.iter().map(|p| p.role.clone()).collect();
    assert_eq!(
        order,
        vec![
            PanelRole::HERO_3D,
            PanelRole::FLOOR_PLAN_GROUND,
            PanelRole::SCHEDULES
        ]
    );
}
