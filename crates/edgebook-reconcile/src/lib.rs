//! Backfill reconciler: corrects analysis types, fills missing scores and applies
//! date-scoped manual overrides to historical opportunities.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use edgebook_core::{confidence_score, AnalysisClassifier, AnalysisType, CoreError, Opportunity};
use edgebook_storage::{update_with_retry, Dataset, OpportunityStore, StoreError, UpdateOutcome};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "edgebook-reconcile";

/// One manual correction: every opportunity on `match_date` (optionally only the
/// listed matches) gets `analysis_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverrideEntry {
    pub match_date: NaiveDate,
    pub analysis_type: AnalysisType,
    #[serde(default)]
    pub match_ids: Vec<i64>,
    pub reason: String,
}

impl OverrideEntry {
    pub fn covers(&self, opportunity: &Opportunity) -> bool {
        opportunity.match_date == self.match_date
            && (self.match_ids.is_empty() || self.match_ids.contains(&opportunity.match_id))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverrideList {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub overrides: Vec<OverrideEntry>,
}

fn default_version() -> u32 {
    1
}

impl Default for OverrideList {
    fn default() -> Self {
        Self {
            version: default_version(),
            overrides: Vec::new(),
        }
    }
}

impl OverrideList {
    pub fn new(overrides: Vec<OverrideEntry>) -> Self {
        Self {
            version: default_version(),
            overrides,
        }
    }

    /// A missing file is an empty list.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!(path = %path.display(), "no override file");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// First entry covering the opportunity.
    pub fn lookup(&self, opportunity: &Opportunity) -> Option<&OverrideEntry> {
        self.overrides.iter().find(|entry| entry.covers(opportunity))
    }

    pub fn len(&self) -> usize {
        self.overrides.len()
    }

    pub fn is_empty(&self) -> bool {
        self.overrides.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReconcileSkip {
    #[error("owning run {run_id} not found, classification left as is")]
    MissingRun { run_id: Uuid },
    #[error("kickoff could not be resolved: {0}")]
    InvalidKickoff(CoreError),
    #[error("write conflict persisted after one retry")]
    Conflict,
    #[error("opportunity disappeared during reconciliation")]
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedRecord {
    pub opportunity_id: Uuid,
    pub reason: String,
}

/// What reconciliation would do to one opportunity.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub next: Opportunity,
    pub reclassified: bool,
    pub rescored: bool,
    pub overridden: bool,
    pub skip: Option<ReconcileSkip>,
}

impl Plan {
    pub fn changed(&self) -> bool {
        self.reclassified || self.rescored || self.overridden
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ReconcileReport {
    pub examined: usize,
    pub reclassified: usize,
    pub rescored: usize,
    pub overridden: usize,
    pub conflicts_retried: usize,
    pub skipped: Vec<SkippedRecord>,
}

impl ReconcileReport {
    pub fn changes(&self) -> usize {
        self.reclassified + self.rescored + self.overridden
    }

    fn skip(&mut self, opportunity_id: Uuid, reason: &ReconcileSkip) {
        warn!(%opportunity_id, %reason, "reconciliation skipped");
        self.skipped.push(SkippedRecord {
            opportunity_id,
            reason: reason.to_string(),
        });
    }
}

#[derive(Debug, Clone, Default)]
pub struct Reconciler {
    classifier: AnalysisClassifier,
    overrides: OverrideList,
}

impl Reconciler {
    pub fn new(classifier: AnalysisClassifier, overrides: OverrideList) -> Self {
        Self { classifier, overrides }
    }

    /// Pure decision for one record. `executed_at` is the owning run's execution instant.
    ///
    /// Classification only moves PRE_MATCH to RETROACTIVE, and is left to the
    /// override list for records an override covers. Scores are only filled
    /// where the stored one is the unscored sentinel.
    pub fn plan(&self, current: &Opportunity, executed_at: Option<DateTime<Utc>>) -> Plan {
        let mut next = current.clone();
        let mut plan_skip = None;
        let entry = self.overrides.lookup(current);

        let mut reclassified = false;
        if entry.is_none() && current.analysis_type == AnalysisType::PreMatch {
            match executed_at {
                None => plan_skip = Some(ReconcileSkip::MissingRun { run_id: current.run_id }),
                Some(executed_at) => match self.classifier.classify_opportunity(current, executed_at) {
                    Ok(AnalysisType::Retroactive) => {
                        next.analysis_type = AnalysisType::Retroactive;
                        reclassified = true;
                    }
                    Ok(AnalysisType::PreMatch) => {}
                    Err(err) => plan_skip = Some(ReconcileSkip::InvalidKickoff(err)),
                },
            }
        }

        let rescored = current.is_unscored();
        if rescored {
            next.confidence_score = Some(confidence_score(&next.score_input()));
        }

        let overridden = match entry {
            Some(entry) if next.analysis_type != entry.analysis_type => {
                next.analysis_type = entry.analysis_type;
                true
            }
            _ => false,
        };

        Plan {
            next,
            reclassified,
            rescored,
            overridden,
            skip: plan_skip,
        }
    }

    /// Counts what [`Reconciler::run`] would change, without writing.
    pub fn preview(&self, dataset: &Dataset) -> ReconcileReport {
        let executed = execution_times(dataset);
        let mut report = ReconcileReport::default();
        for opportunity in &dataset.opportunities {
            report.examined += 1;
            let plan = self.plan(opportunity, executed.get(&opportunity.run_id).copied());
            report.reclassified += usize::from(plan.reclassified);
            report.rescored += usize::from(plan.rescored);
            report.overridden += usize::from(plan.overridden);
            if let Some(reason) = &plan.skip {
                report.skipped.push(SkippedRecord {
                    opportunity_id: opportunity.id,
                    reason: reason.to_string(),
                });
            }
        }
        report
    }

    /// Reconciles every stored opportunity. Safe to re-run: a second pass finds nothing to do.
    pub async fn run<S>(&self, store: &S) -> Result<ReconcileReport, StoreError>
    where
        S: OpportunityStore + ?Sized,
    {
        let snapshot = store.load().await?;
        let executed = execution_times(&snapshot);
        info!(
            opportunities = snapshot.opportunities.len(),
            overrides = self.overrides.len(),
            "reconciliation started"
        );

        let mut report = ReconcileReport::default();
        for opportunity in &snapshot.opportunities {
            report.examined += 1;
            let executed_at = executed.get(&opportunity.run_id).copied();
            let preview = self.plan(opportunity, executed_at);
            if let Some(reason) = &preview.skip {
                report.skip(opportunity.id, reason);
            }
            if !preview.changed() {
                continue;
            }

            let mut applied = None;
            let outcome = update_with_retry(store, opportunity.id, |fresh| {
                let plan = self.plan(fresh, executed_at);
                if !plan.changed() {
                    return None;
                }
                applied = Some((plan.reclassified, plan.rescored, plan.overridden));
                Some(plan.next)
            })
            .await;

            match outcome {
                Ok(UpdateOutcome::Written { attempts, .. }) => {
                    if attempts > 1 {
                        report.conflicts_retried += 1;
                    }
                    if let Some((reclassified, rescored, overridden)) = applied {
                        report.reclassified += usize::from(reclassified);
                        report.rescored += usize::from(rescored);
                        report.overridden += usize::from(overridden);
                    }
                    debug!(opportunity_id = %opportunity.id, attempts, "opportunity reconciled");
                }
                Ok(UpdateOutcome::Unchanged) => {
                    debug!(opportunity_id = %opportunity.id, "already reconciled by a concurrent writer");
                }
                Ok(UpdateOutcome::Conflicted) => {
                    report.conflicts_retried += 1;
                    report.skip(opportunity.id, &ReconcileSkip::Conflict);
                }
                Err(StoreError::NotFound { .. }) => report.skip(opportunity.id, &ReconcileSkip::NotFound),
                Err(err) => return Err(err),
            }
        }

        info!(
            examined = report.examined,
            reclassified = report.reclassified,
            rescored = report.rescored,
            overridden = report.overridden,
            skipped = report.skipped.len(),
            "reconciliation finished"
        );
        Ok(report)
    }
}

fn execution_times(dataset: &Dataset) -> HashMap<Uuid, DateTime<Utc>> {
    dataset.runs.iter().map(|run| (run.id, run.executed_at)).collect()
}
