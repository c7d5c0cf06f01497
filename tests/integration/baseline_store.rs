//! Baseline store persistence across reopen.

use super::test_utils::{
    sample_design, ScriptedGeneration, ScriptedSimilarity, StackComposer, StaticFingerprint,
};
use archsheet::pipeline::{
    PacingConfig, PacingQueue, Pipeline, PipelineServices, PipelineSettings, RunOptions,
};
use archsheet::store::{BaselineStore, SledBaselineStore};
use archsheet::types::PanelRole;
use std::sync::Arc;
use tempfile::TempDir;

#[tokio::test(start_paused = true)]
async fn persisted_bundle_round_trips_through_disk() {
    let temp = TempDir::new().unwrap();
    let run_id = {
        let store = Arc::new(SledBaselineStore::new(temp.path()).unwrap());
        let queue = Arc::new(PacingQueue::new(PacingConfig {
            min_interval_ms: 10,
            ..PacingConfig::default()
        }));
        queue.start().unwrap();
        let services = PipelineServices::new(
            Arc::new(ScriptedGeneration::default()),
            Arc::new(ScriptedSimilarity::default()),
            Arc::new(StaticFingerprint),
            Arc::new(StackComposer::default()),
        );
        let pipeline = Pipeline::new(PipelineSettings::default(), services, Arc::clone(&queue))
            .with_store(store);
        let success = pipeline
            .run(
                &sample_design(),
                RunOptions {
                    roles: Some(vec![PanelRole::HERO_3D, PanelRole::SECTION_A]),
                    ..RunOptions::default()
                },
            )
            .await
            .into_result()
            .unwrap();
        assert!(success.persistence_warning.is_none());
        queue.stop().await.unwrap();
        success.run_id
    };

    let store = SledBaselineStore::new(temp.path()).unwrap();
    let bundle = store.load_latest("house-001").unwrap().unwrap();
    assert_eq!(bundle.run_id, run_id);
    assert!(bundle.validate().is_ok());
    assert!(bundle.fingerprint.is_some());
    assert!(bundle.consistency.gate_passed);
    assert_eq!(bundle.required_roles, vec![PanelRole::HERO_3D, PanelRole::SECTION_A]);
    assert_eq!(
        bundle.metadata.design_hash,
        sample_design().content_hash().unwrap()
    );
}
