//! Pipeline batch intake, outcome settlement and bet registration.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use edgebook_core::{
    classify_confidence, confidence_score, implied_probability, normalize_fraction,
    opportunity_id, AnalysisClassifier, AnalysisType, BetRecord, ConfidenceTier, ContextNotes, CoreError, Match,
    Opportunity, ResultDetail, ResultStatus, Run, RunStats,
};
use edgebook_storage::{update_with_retry, Dataset, OpportunityStore, StoreError, UpdateOutcome};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "edgebook-ingest";

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("bundle for run {run_id} contains no matches and no opportunities")]
    EmptyBundle { run_id: Uuid },
    #[error("run {run_id} was already ingested")]
    DuplicateRun { run_id: Uuid },
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Header of one upstream pipeline execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunDraft {
    #[serde(default)]
    pub id: Option<Uuid>,
    pub executed_at: DateTime<Utc>,
    #[serde(default)]
    pub analysis_dates: Vec<NaiveDate>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub run_time_seconds: f64,
    #[serde(default)]
    pub api_calls_used: u32,
}

/// Raw opportunity fields as emitted by the upstream pipeline, before scoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpportunityDraft {
    pub match_id: i64,
    #[serde(default)]
    pub league_name: String,
    #[serde(default)]
    pub league_country: String,
    pub match_date: NaiveDate,
    #[serde(default)]
    pub match_time: Option<String>,
    #[serde(default)]
    pub home_team: String,
    #[serde(default)]
    pub away_team: String,
    pub market: String,
    pub selection: String,
    #[serde(default)]
    pub bookmaker: Option<String>,
    #[serde(default)]
    pub market_odd: Option<f64>,
    #[serde(default)]
    pub fair_odd: Option<f64>,
    #[serde(default)]
    pub model_prob: Option<f64>,
    #[serde(default)]
    pub implied_prob: Option<f64>,
    #[serde(default)]
    pub edge: Option<f64>,
    #[serde(default)]
    pub kelly_fraction: f64,
    #[serde(default)]
    pub confidence: Option<ConfidenceTier>,
    #[serde(default)]
    pub confidence_score: Option<f64>,
    #[serde(default)]
    pub analysis_type: Option<AnalysisType>,
    #[serde(default)]
    pub reasoning: String,
    #[serde(flatten)]
    pub notes: ContextNotes,
    #[serde(default)]
    pub data_quality: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineBundle {
    pub run: RunDraft,
    #[serde(default)]
    pub matches: Vec<Match>,
    #[serde(default)]
    pub opportunities: Vec<OpportunityDraft>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct IngestSummary {
    pub run_id: Uuid,
    pub matches_accepted: usize,
    pub matches_rejected: usize,
    pub opportunities_inserted: usize,
    pub opportunities_rejected: usize,
    pub superseded: usize,
    pub preserved_pending: usize,
    pub orphan_runs_removed: usize,
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

pub fn load_bundle(path: impl AsRef<Path>) -> Result<PipelineBundle> {
    read_json_file(path)
}

pub fn load_settlements(path: impl AsRef<Path>) -> Result<Vec<SettlementUpdate>> {
    read_json_file(path)
}

/// Score and classify one draft at creation time.
pub fn build_opportunity(
    run_id: Uuid,
    executed_at: DateTime<Utc>,
    draft: OpportunityDraft,
    classifier: &AnalysisClassifier,
) -> Result<Opportunity, CoreError> {
    if draft.market.trim().is_empty() {
        return Err(CoreError::InvalidInput {
            field: "market",
            reason: format!("empty market for match {}", draft.match_id),
        });
    }

    let model_prob = draft.model_prob.map(normalize_fraction);
    let implied_prob = draft
        .implied_prob
        .map(normalize_fraction)
        .or_else(|| draft.market_odd.and_then(implied_probability));
    let edge = match (draft.edge, model_prob, implied_prob) {
        (Some(edge), _, _) => normalize_fraction(edge),
        (None, Some(model), Some(implied)) => model - implied,
        _ => 0.0,
    };
    let confidence = draft.confidence.unwrap_or_else(|| {
        classify_confidence(
            edge,
            model_prob.unwrap_or_default(),
            draft.notes.weather_stable(),
            draft.notes.fatigue_free(),
        )
    });

    let mut opportunity = Opportunity {
        id: opportunity_id(run_id, draft.match_id, &draft.market, &draft.selection),
        run_id,
        version: 0,
        match_id: draft.match_id,
        league_name: draft.league_name,
        league_country: draft.league_country,
        match_date: draft.match_date,
        match_time: draft.match_time,
        home_team: draft.home_team,
        away_team: draft.away_team,
        market: draft.market,
        selection: draft.selection,
        bookmaker: draft.bookmaker,
        market_odd: draft.market_odd,
        fair_odd: draft.fair_odd,
        model_prob,
        implied_prob,
        edge,
        kelly_fraction: normalize_fraction(draft.kelly_fraction),
        confidence,
        confidence_score: draft.confidence_score,
        analysis_type: AnalysisType::PreMatch,
        reasoning: draft.reasoning,
        notes: draft.notes,
        data_quality: draft.data_quality,
        result_status: ResultStatus::Pending,
        result_score: None,
        result_detail: None,
        result_updated_at: None,
        bet: BetRecord::default(),
    };

    if opportunity.is_unscored() {
        opportunity.confidence_score = Some(confidence_score(&opportunity.score_input()));
    }
    opportunity.analysis_type = match draft.analysis_type {
        Some(explicit) => explicit,
        None => classifier.classify_opportunity(&opportunity, executed_at)?,
    };
    Ok(opportunity)
}

/// Run counters derived from what was actually accepted.
pub fn summarize_run(draft: &RunDraft, matches: &[Match], opportunities: &[Opportunity]) -> RunStats {
    let leagues: HashSet<(&str, &str)> = if matches.is_empty() {
        opportunities
            .iter()
            .map(|o| (o.league_name.as_str(), o.league_country.as_str()))
            .collect()
    } else {
        matches
            .iter()
            .map(|m| (m.league_name.as_str(), m.league_country.as_str()))
            .collect()
    };
    let total_matches = if matches.is_empty() {
        opportunities.iter().map(|o| o.match_id).collect::<HashSet<_>>().len()
    } else {
        matches.len()
    };
    let count_tier = |tier: ConfidenceTier| opportunities.iter().filter(|o| o.confidence == tier).count() as u32;
    let avg_edge = if opportunities.is_empty() {
        0.0
    } else {
        opportunities.iter().map(|o| o.edge).sum::<f64>() / opportunities.len() as f64
    };
    let max_edge = opportunities.iter().map(|o| o.edge).fold(0.0_f64, f64::max);

    RunStats {
        total_matches: total_matches as u32,
        total_leagues: leagues.len() as u32,
        total_opportunities: opportunities.len() as u32,
        high_conf: count_tier(ConfidenceTier::High),
        med_conf: count_tier(ConfidenceTier::Medium),
        low_conf: count_tier(ConfidenceTier::Low),
        avg_edge,
        max_edge,
        run_time_seconds: draft.run_time_seconds,
        api_calls_used: draft.api_calls_used,
    }
}

/// Adds one pipeline batch to the dataset.
///
/// Pending opportunities for the same match, market and selection inside the
/// batch's date range are replaced; settled rows are never touched. Runs left
/// without opportunities are removed with their matches afterwards.
pub fn ingest_bundle(
    dataset: &mut Dataset,
    bundle: PipelineBundle,
    classifier: &AnalysisClassifier,
) -> Result<IngestSummary, IngestError> {
    let PipelineBundle {
        run: run_draft,
        matches,
        opportunities: drafts,
    } = bundle;
    let run_id = run_draft.id.unwrap_or_else(Uuid::new_v4);
    let span = info_span!("ingest_bundle", %run_id);
    let _guard = span.enter();

    if matches.is_empty() && drafts.is_empty() {
        return Err(IngestError::EmptyBundle { run_id });
    }
    if dataset.run(run_id).is_some() {
        return Err(IngestError::DuplicateRun { run_id });
    }

    let mut summary = IngestSummary {
        run_id,
        ..Default::default()
    };

    let mut accepted_matches = Vec::with_capacity(matches.len());
    for mut m in matches {
        match m.validate() {
            Ok(()) => {
                m.run_id = run_id;
                accepted_matches.push(m);
            }
            Err(err) => {
                warn!(match_id = m.match_id, error = %err, "rejecting match");
                summary.matches_rejected += 1;
            }
        }
    }
    summary.matches_accepted = accepted_matches.len();

    let mut by_id: HashMap<Uuid, Opportunity> = HashMap::with_capacity(drafts.len());
    let mut order = Vec::with_capacity(drafts.len());
    for draft in drafts {
        let match_id = draft.match_id;
        match build_opportunity(run_id, run_draft.executed_at, draft, classifier) {
            Ok(opportunity) => {
                if by_id.contains_key(&opportunity.id) {
                    debug!(id = %opportunity.id, "duplicate pick in batch, keeping the later one");
                } else {
                    order.push(opportunity.id);
                }
                by_id.insert(opportunity.id, opportunity);
            }
            Err(err) => {
                warn!(match_id, error = %err, "rejecting opportunity");
                summary.opportunities_rejected += 1;
            }
        }
    }
    let new_opportunities: Vec<Opportunity> = order.into_iter().filter_map(|id| by_id.remove(&id)).collect();
    summary.opportunities_inserted = new_opportunities.len();

    if let (Some(from), Some(to)) = (
        new_opportunities.iter().map(|o| o.match_date).min(),
        new_opportunities.iter().map(|o| o.match_date).max(),
    ) {
        let incoming: HashSet<_> = new_opportunities.iter().map(Opportunity::supersede_key).collect();
        let before = dataset.opportunities.len();
        let mut preserved = 0usize;
        dataset.opportunities.retain(|existing| {
            let in_range = existing.result_status == ResultStatus::Pending
                && existing.match_date >= from
                && existing.match_date <= to;
            if !in_range {
                return true;
            }
            let replaced = incoming.contains(&existing.supersede_key());
            if !replaced {
                preserved += 1;
            }
            !replaced
        });
        summary.superseded = before - dataset.opportunities.len();
        summary.preserved_pending = preserved;
    }

    let analysis_dates = if run_draft.analysis_dates.is_empty() {
        new_opportunities
            .iter()
            .map(|o| o.match_date)
            .chain(accepted_matches.iter().map(|m| m.match_date))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    } else {
        run_draft.analysis_dates.clone()
    };
    let run = Run {
        id: run_id,
        executed_at: run_draft.executed_at,
        analysis_dates,
        stats: summarize_run(&run_draft, &accepted_matches, &new_opportunities),
        mode: run_draft.mode.clone().unwrap_or_else(|| "live".to_string()),
    };

    dataset.runs.push(run);
    dataset.matches.extend(accepted_matches);
    dataset.opportunities.extend(new_opportunities);

    for orphan in dataset.orphan_runs(run_id) {
        if dataset.remove_run(orphan) {
            info!(run_id = %orphan, "removed run without opportunities");
            summary.orphan_runs_removed += 1;
        }
    }

    info!(
        inserted = summary.opportunities_inserted,
        superseded = summary.superseded,
        rejected = summary.opportunities_rejected,
        "batch ingested"
    );
    Ok(summary)
}

/// Ingests a bundle against the latest stored dataset.
///
/// The save is refused when another writer touched the store after the load;
/// the bundle is then re-applied once to a fresh snapshot.
pub async fn ingest_into_store<S>(
    store: &S,
    mut bundle: PipelineBundle,
    classifier: &AnalysisClassifier,
) -> Result<IngestSummary, IngestError>
where
    S: OpportunityStore + ?Sized,
{
    let run_id = *bundle.run.id.get_or_insert_with(Uuid::new_v4);
    let mut retried = false;
    loop {
        let base = store.load().await?;
        let mut next = base.clone();
        let summary = ingest_bundle(&mut next, bundle.clone(), classifier)?;
        match store.save(&base, &next).await {
            Ok(()) => return Ok(summary),
            Err(StoreError::StaleSnapshot { id }) if !retried => {
                warn!(%run_id, changed = %id, "dataset changed during ingest, retrying");
                retried = true;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

// Outcome settlement.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementUpdate {
    pub opportunity_id: Uuid,
    pub result_status: ResultStatus,
    #[serde(default)]
    pub result_score: Option<String>,
    #[serde(default)]
    pub detail: Option<ResultDetail>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SettlementRejection {
    #[error("status {0} is not a terminal outcome")]
    NotTerminal(ResultStatus),
    #[error("already settled as {0}")]
    AlreadySettled(ResultStatus),
    #[error("opportunity not found")]
    NotFound,
    #[error("concurrent write conflict")]
    Conflict,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct SettlementSummary {
    pub applied: usize,
    pub rejected: Vec<(Uuid, String)>,
}

fn bet_for_outcome(bet: &BetRecord, status: ResultStatus, market_odd: Option<f64>) -> BetRecord {
    let odd = market_odd.unwrap_or_default();
    if bet.placed {
        let Some(amount) = bet.amount else {
            return bet.clone();
        };
        if bet.bet_return.is_some() {
            return bet.clone();
        }
        let bet_return = match status {
            ResultStatus::Green => amount * odd,
            ResultStatus::Red => 0.0,
            ResultStatus::Void | ResultStatus::Pending => amount,
        };
        return BetRecord {
            bet_return: Some(bet_return),
            profit: Some(bet_return - amount),
            ..bet.clone()
        };
    }
    // One-unit accounting for picks nobody actually staked.
    let bet_return = match status {
        ResultStatus::Green => odd,
        ResultStatus::Red => 0.0,
        ResultStatus::Void | ResultStatus::Pending => 1.0,
    };
    BetRecord {
        placed: false,
        amount: Some(1.0),
        bet_return: Some(bet_return),
        profit: Some(bet_return - 1.0),
        notes: bet.notes.clone(),
    }
}

/// Pending -> terminal transition. Settled rows are immutable.
pub fn settle(
    current: &Opportunity,
    update: &SettlementUpdate,
    now: DateTime<Utc>,
) -> Result<Opportunity, SettlementRejection> {
    if !update.result_status.is_terminal() {
        return Err(SettlementRejection::NotTerminal(update.result_status));
    }
    if current.result_status.is_terminal() {
        return Err(SettlementRejection::AlreadySettled(current.result_status));
    }
    let mut next = current.clone();
    next.result_status = update.result_status;
    next.result_score = update.result_score.clone();
    next.result_detail = update.detail.clone();
    next.result_updated_at = Some(now);
    next.bet = bet_for_outcome(&current.bet, update.result_status, current.market_odd);
    Ok(next)
}

pub async fn apply_settlements<S>(
    store: &S,
    updates: &[SettlementUpdate],
    now: DateTime<Utc>,
) -> Result<SettlementSummary, StoreError>
where
    S: OpportunityStore + ?Sized,
{
    let mut summary = SettlementSummary::default();
    for (index, update) in updates.iter().enumerate() {
        let id = update.opportunity_id;
        let mut rejection = None;
        let outcome = update_with_retry(store, id, |current| match settle(current, update, now) {
            Ok(next) => Some(next),
            Err(reason) => {
                rejection = Some(reason);
                None
            }
        })
        .await;

        match outcome {
            Ok(UpdateOutcome::Written { .. }) => summary.applied += 1,
            Ok(UpdateOutcome::Unchanged) => {
                let reason = rejection.unwrap_or(SettlementRejection::Conflict);
                warn!(%id, reason = %reason, "settlement rejected");
                summary.rejected.push((id, reason.to_string()));
            }
            Ok(UpdateOutcome::Conflicted) => {
                summary.rejected.push((id, SettlementRejection::Conflict.to_string()));
            }
            Err(StoreError::NotFound { .. }) => {
                warn!(%id, "settlement for unknown opportunity");
                summary.rejected.push((id, SettlementRejection::NotFound.to_string()));
            }
            Err(err) => return Err(err),
        }

        if (index + 1) % 50 == 0 {
            info!(done = index + 1, total = updates.len(), applied = summary.applied, "settlement progress");
        }
    }
    Ok(summary)
}

/// Pending opportunities whose match date is on or before `today`, latest first.
pub fn pending_due(dataset: &Dataset, today: NaiveDate) -> Vec<&Opportunity> {
    let mut due: Vec<&Opportunity> = dataset
        .opportunities
        .iter()
        .filter(|o| o.result_status == ResultStatus::Pending && o.match_date <= today)
        .collect();
    due.sort_by(|a, b| b.match_date.cmp(&a.match_date).then_with(|| a.match_id.cmp(&b.match_id)));
    due
}

// Bet registration.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BetRegistration {
    pub amount: f64,
    #[serde(default)]
    pub bet_return: Option<f64>,
    #[serde(default)]
    pub notes: Option<String>,
}

pub fn register_bet(current: &Opportunity, registration: &BetRegistration) -> Result<Opportunity, CoreError> {
    if !registration.amount.is_finite() || registration.amount <= 0.0 {
        return Err(CoreError::InvalidInput {
            field: "bet_amount",
            reason: format!("{} must be positive", registration.amount),
        });
    }
    if let Some(bet_return) = registration.bet_return {
        if !bet_return.is_finite() || bet_return < 0.0 {
            return Err(CoreError::InvalidInput {
                field: "bet_return",
                reason: format!("{bet_return} must be non-negative"),
            });
        }
    }
    let mut next = current.clone();
    next.bet = BetRecord {
        placed: true,
        amount: Some(registration.amount),
        bet_return: registration.bet_return,
        profit: registration.bet_return.map(|r| r - registration.amount),
        notes: registration.notes.clone().or_else(|| current.bet.notes.clone()),
    };
    Ok(next)
}

pub async fn place_bet<S>(store: &S, id: Uuid, registration: &BetRegistration) -> Result<UpdateOutcome, IngestError>
where
    S: OpportunityStore + ?Sized,
{
    let current = store.get(id).await?;
    register_bet(&current, registration)?;
    let outcome = update_with_retry(store, id, |fresh| register_bet(fresh, registration).ok()).await?;
    Ok(outcome)
}
