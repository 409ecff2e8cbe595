use std::path::PathBuf;

use chrono::{NaiveDate, TimeZone, Utc};
use edgebook_core::{AnalysisClassifier, AnalysisType, ConfidenceTier, ResultStatus};
use edgebook_ingest::{
    apply_settlements, ingest_bundle, ingest_into_store, load_bundle, load_settlements, pending_due,
};
use edgebook_storage::{Dataset, JsonFileStore, OpportunityStore, StoreError};
use uuid::Uuid;

fn fixtures() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/sample-run")
}

#[test]
fn sample_bundle_ingests_with_rejections() {
    let bundle = load_bundle(fixtures().join("bundle.json")).unwrap();
    let mut dataset = Dataset::default();
    let summary = ingest_bundle(&mut dataset, bundle, &AnalysisClassifier::default()).unwrap();

    assert_eq!(summary.matches_accepted, 2);
    assert_eq!(summary.matches_rejected, 1);
    assert_eq!(summary.opportunities_inserted, 4);
    assert_eq!(summary.opportunities_rejected, 1);

    let home = dataset
        .opportunities
        .iter()
        .find(|o| o.match_id == 1035001 && o.market == "1x2")
        .unwrap();
    // 13:00 local kickoff, run at 17:00 local.
    assert_eq!(home.analysis_type, AnalysisType::Retroactive);
    assert!((home.model_prob.unwrap() - 0.521).abs() < 1e-12);
    assert_eq!(home.confidence, ConfidenceTier::Low);

    let palmeiras = dataset
        .opportunities
        .iter()
        .find(|o| o.match_id == 1035002 && o.market == "1x2")
        .unwrap();
    assert_eq!(palmeiras.analysis_type, AnalysisType::PreMatch);
    assert_eq!(palmeiras.confidence, ConfidenceTier::High);

    let btts = dataset.opportunities.iter().find(|o| o.market == "BTTS").unwrap();
    assert!((btts.edge - 0.031).abs() < 1e-12);
    assert!(btts.confidence_score.unwrap() > 0.0);

    let run = &dataset.runs[0];
    assert_eq!(run.stats.total_matches, 2);
    assert_eq!(run.stats.total_leagues, 2);
    assert_eq!(run.stats.high_conf, 1);
    assert_eq!(run.stats.api_calls_used, 126);
}

#[tokio::test]
async fn settlements_apply_once_through_file_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonFileStore::new(dir.path());

    let bundle = load_bundle(fixtures().join("bundle.json")).unwrap();
    ingest_into_store(&store, bundle, &AnalysisClassifier::default()).await.unwrap();

    let updates = load_settlements(fixtures().join("settlements.json")).unwrap();
    let now = Utc.with_ymd_and_hms(2026, 3, 15, 1, 0, 0).single().unwrap();
    let summary = apply_settlements(&store, &updates, now).await.unwrap();

    assert_eq!(summary.applied, 2);
    assert_eq!(summary.rejected.len(), 1);
    assert!(summary.rejected[0].1.contains("already settled"));

    let home = store.get(updates[0].opportunity_id).await.unwrap();
    assert_eq!(home.result_status, ResultStatus::Green);
    assert_eq!(home.version, 1);
    assert_eq!(home.result_detail.as_ref().and_then(|d| d.corners), Some(9));
    assert!((home.bet.profit.unwrap() - 1.1).abs() < 1e-9);

    let reloaded = store.load().await.unwrap();
    let today = NaiveDate::from_ymd_opt(2026, 3, 14).unwrap();
    assert_eq!(pending_due(&reloaded, today).len(), 2);
    assert!(pending_due(&reloaded, NaiveDate::from_ymd_opt(2026, 3, 13).unwrap()).is_empty());
}

#[tokio::test]
async fn ingest_keeps_settlements_written_by_another_handle() {
    let dir = tempfile::tempdir().unwrap();
    let intake = JsonFileStore::new(dir.path());
    let settler = JsonFileStore::new(dir.path());
    let classifier = AnalysisClassifier::default();
    let bundle = load_bundle(fixtures().join("bundle.json")).unwrap();
    ingest_into_store(&intake, bundle.clone(), &classifier).await.unwrap();

    let base = intake.load().await.unwrap();
    let updates = load_settlements(fixtures().join("settlements.json")).unwrap();
    let now = Utc.with_ymd_and_hms(2026, 3, 15, 1, 0, 0).single().unwrap();
    apply_settlements(&settler, &updates, now).await.unwrap();

    let mut rerun = bundle;
    rerun.run.id = Some(Uuid::new_v4());
    let mut next = base.clone();
    ingest_bundle(&mut next, rerun.clone(), &classifier).unwrap();
    let err = intake.save(&base, &next).await.unwrap_err();
    assert!(matches!(err, StoreError::StaleSnapshot { .. }));

    let summary = ingest_into_store(&intake, rerun, &classifier).await.unwrap();
    assert_eq!(summary.superseded, 2);

    let home = intake.get(updates[0].opportunity_id).await.unwrap();
    assert_eq!(home.result_status, ResultStatus::Green);
    assert_eq!(home.version, 1);
}
