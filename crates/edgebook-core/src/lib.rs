//! Core domain model, confidence scoring and analysis-type classification for Edgebook.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "edgebook-core";

/// Reference time zone used to interpret local kickoff dates and times.
pub const DEFAULT_TIMEZONE: Tz = chrono_tz::America::Sao_Paulo;

/// Pipeline latency allowance before an analysis counts as retroactive.
pub const DEFAULT_GRACE_MINUTES: i64 = 30;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoreError {
    #[error("invalid input for {field}: {reason}")]
    InvalidInput { field: &'static str, reason: String },
    #[error("missing {kind} reference {id}")]
    MissingReference { kind: &'static str, id: String },
}

impl CoreError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultStatus {
    #[default]
    #[serde(alias = "PENDENTE")]
    Pending,
    Green,
    Red,
    Void,
}

impl ResultStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Green or red: the outcome counts towards hit rate.
    pub fn is_decided(self) -> bool {
        matches!(self, Self::Green | Self::Red)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Green => "GREEN",
            Self::Red => "RED",
            Self::Void => "VOID",
        }
    }
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResultStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" | "PENDENTE" => Ok(Self::Pending),
            "GREEN" => Ok(Self::Green),
            "RED" => Ok(Self::Red),
            "VOID" => Ok(Self::Void),
            other => Err(CoreError::invalid("result_status", format!("unknown status {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnalysisType {
    #[default]
    #[serde(alias = "PRE_JOGO")]
    PreMatch,
    #[serde(alias = "RETROATIVO")]
    Retroactive,
}

impl AnalysisType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PreMatch => "PRE_MATCH",
            Self::Retroactive => "RETROACTIVE",
        }
    }
}

impl fmt::Display for AnalysisType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnalysisType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "PRE_MATCH" | "PRE_JOGO" => Ok(Self::PreMatch),
            "RETROACTIVE" | "RETROATIVO" => Ok(Self::Retroactive),
            other => Err(CoreError::invalid("analysis_type", format!("unknown type {other}"))),
        }
    }
}

/// Coarse reliability label, distinct from the continuous confidence score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfidenceTier {
    #[serde(alias = "ALTO")]
    High,
    #[serde(alias = "MEDIO", alias = "MÉDIO")]
    Medium,
    #[serde(alias = "BAIXO")]
    Low,
}

impl ConfidenceTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "HIGH",
            Self::Medium => "MEDIUM",
            Self::Low => "LOW",
        }
    }
}

impl fmt::Display for ConfidenceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConfidenceTier {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "HIGH" | "ALTO" => Ok(Self::High),
            "MEDIUM" | "MEDIO" | "MÉDIO" => Ok(Self::Medium),
            "LOW" | "BAIXO" => Ok(Self::Low),
            other => Err(CoreError::invalid("confidence", format!("unknown tier {other}"))),
        }
    }
}

/// Aggregate counters recorded for one pipeline execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RunStats {
    pub total_matches: u32,
    pub total_leagues: u32,
    pub total_opportunities: u32,
    pub high_conf: u32,
    pub med_conf: u32,
    pub low_conf: u32,
    pub avg_edge: f64,
    pub max_edge: f64,
    pub run_time_seconds: f64,
    pub api_calls_used: u32,
}

/// One execution of the upstream analysis pipeline. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub executed_at: DateTime<Utc>,
    #[serde(default)]
    pub analysis_dates: Vec<NaiveDate>,
    #[serde(default)]
    pub stats: RunStats,
    #[serde(default = "default_mode")]
    pub mode: String,
}

fn default_mode() -> String {
    "live".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MatchResult {
    pub home_goals: u8,
    pub away_goals: u8,
    #[serde(default)]
    pub ht_score: Option<String>,
}

/// One analyzed fixture, whether or not it produced an opportunity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    #[serde(default)]
    pub run_id: Uuid,
    pub match_id: i64,
    #[serde(default)]
    pub league_id: Option<i64>,
    pub league_name: String,
    pub league_country: String,
    pub match_date: NaiveDate,
    #[serde(default)]
    pub match_time: Option<String>,
    pub home_team: String,
    pub away_team: String,
    #[serde(default)]
    pub home_team_id: Option<i64>,
    #[serde(default)]
    pub away_team_id: Option<i64>,
    #[serde(default)]
    pub venue: Option<String>,
    #[serde(default)]
    pub referee: Option<String>,
    #[serde(default)]
    pub home_xg: f64,
    #[serde(default)]
    pub away_xg: f64,
    #[serde(default)]
    pub prob_home: f64,
    #[serde(default)]
    pub prob_draw: f64,
    #[serde(default)]
    pub prob_away: f64,
    #[serde(default)]
    pub prob_over25: f64,
    #[serde(default)]
    pub prob_btts: f64,
    #[serde(default)]
    pub odds_home: Option<f64>,
    #[serde(default)]
    pub odds_draw: Option<f64>,
    #[serde(default)]
    pub odds_away: Option<f64>,
    #[serde(default)]
    pub bookmaker: Option<String>,
    #[serde(default)]
    pub data_quality: Option<f64>,
    /// Model features (form, standings, shot/card/corner averages, weather, referee).
    #[serde(default)]
    pub features: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub result: Option<MatchResult>,
}

impl Match {
    pub fn validate(&self) -> Result<(), CoreError> {
        let same_team = match (self.home_team_id, self.away_team_id) {
            (Some(home), Some(away)) => home == away,
            _ => self.home_team.trim().eq_ignore_ascii_case(self.away_team.trim()),
        };
        if same_team {
            return Err(CoreError::invalid(
                "away_team",
                format!("match {} has identical home and away teams", self.match_id),
            ));
        }
        for (field, value) in [
            ("prob_home", self.prob_home),
            ("prob_draw", self.prob_draw),
            ("prob_away", self.prob_away),
        ] {
            if value.is_nan() || value < 0.0 {
                return Err(CoreError::invalid(field, format!("{value} is negative")));
            }
        }
        Ok(())
    }
}

/// Contextual notes attached by the upstream model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextNotes {
    #[serde(default)]
    pub weather_note: String,
    #[serde(default)]
    pub fatigue_note: String,
    #[serde(default = "neutral_urgency")]
    pub urgency_home: f64,
    #[serde(default = "neutral_urgency")]
    pub urgency_away: f64,
}

fn neutral_urgency() -> f64 {
    0.5
}

impl Default for ContextNotes {
    fn default() -> Self {
        Self {
            weather_note: String::new(),
            fatigue_note: String::new(),
            urgency_home: neutral_urgency(),
            urgency_away: neutral_urgency(),
        }
    }
}

impl ContextNotes {
    pub fn weather_stable(&self) -> bool {
        self.weather_note.trim().is_empty()
    }

    pub fn fatigue_free(&self) -> bool {
        self.fatigue_note.trim().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ResultDetail {
    #[serde(default)]
    pub ht_score: Option<String>,
    #[serde(default)]
    pub corners: Option<u32>,
    #[serde(default)]
    pub cards: Option<u32>,
    #[serde(default)]
    pub shots: Option<u32>,
    #[serde(default)]
    pub extra: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BetRecord {
    #[serde(default)]
    pub placed: bool,
    #[serde(default)]
    pub amount: Option<f64>,
    #[serde(default)]
    pub bet_return: Option<f64>,
    #[serde(default)]
    pub profit: Option<f64>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// One flagged mispricing on one market of one match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: Uuid,
    pub run_id: Uuid,
    /// Write counter used for optimistic concurrency.
    #[serde(default)]
    pub version: u64,
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
    pub edge: f64,
    #[serde(default)]
    pub kelly_fraction: f64,
    pub confidence: ConfidenceTier,
    /// `None` and `Some(0.0)` both mean "never scored".
    #[serde(default)]
    pub confidence_score: Option<f64>,
    #[serde(default)]
    pub analysis_type: AnalysisType,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub notes: ContextNotes,
    #[serde(default)]
    pub data_quality: Option<f64>,
    #[serde(default)]
    pub result_status: ResultStatus,
    #[serde(default)]
    pub result_score: Option<String>,
    #[serde(default)]
    pub result_detail: Option<ResultDetail>,
    #[serde(default)]
    pub result_updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub bet: BetRecord,
}

impl Opportunity {
    pub fn is_unscored(&self) -> bool {
        is_unscored(self.confidence_score)
    }

    /// Flat one-unit-stake profit, `None` while pending or when the odd is unknown.
    pub fn flat_profit(&self) -> Option<f64> {
        match self.result_status {
            ResultStatus::Pending => None,
            ResultStatus::Green => self.market_odd.map(|odd| odd - 1.0),
            ResultStatus::Red => Some(-1.0),
            ResultStatus::Void => Some(0.0),
        }
    }

    /// Identity used to detect a newer analysis of the same pick.
    pub fn supersede_key(&self) -> (i64, String, String) {
        (
            self.match_id,
            self.market.trim().to_lowercase(),
            self.selection.trim().to_lowercase(),
        )
    }

    pub fn score_input(&self) -> ScoreInput {
        ScoreInput {
            edge: self.edge,
            market_odd: self.market_odd,
            model_prob: self.model_prob,
            context: ContextSignals {
                data_quality: self.data_quality,
            },
        }
    }
}

pub fn is_unscored(score: Option<f64>) -> bool {
    match score {
        None => true,
        Some(value) => value == 0.0 || value.is_nan(),
    }
}

/// Accepts either a fraction or a percentage (values above 1 are divided by 100).
pub fn normalize_fraction(value: f64) -> f64 {
    if value > 1.0 {
        value / 100.0
    } else {
        value
    }
}

pub fn implied_probability(market_odd: f64) -> Option<f64> {
    if market_odd.is_finite() && market_odd > 0.0 {
        Some(1.0 / market_odd)
    } else {
        None
    }
}

pub fn edge_from(model_prob: f64, market_odd: f64) -> Option<f64> {
    implied_probability(market_odd).map(|implied| model_prob - implied)
}

// Confidence scoring.

pub const EDGE_MAX_POINTS: f64 = 25.0;
pub const ODD_MAX_POINTS: f64 = 20.0;
pub const PROBABILITY_MAX_POINTS: f64 = 20.0;
pub const DATA_QUALITY_POINTS: f64 = 7.0;
pub const CONTEXT_POINTS: f64 = 8.0;
pub const AGREEMENT_MAX_POINTS: f64 = 10.0;

pub const DEFAULT_MARKET_ODD: f64 = 2.0;
pub const DEFAULT_MODEL_PROB: f64 = 0.0;

/// Upper-inclusive edge thresholds. Values past the last entry score 3.
const EDGE_POINTS: &[(f64, f64)] = &[
    (0.0, 0.0),
    (0.05, 10.0),
    (0.10, 25.0),
    (0.15, 22.0),
    (0.25, 15.0),
    (0.40, 8.0),
];
const EDGE_FALLBACK_POINTS: f64 = 3.0;

const ODD_POINTS: &[(f64, f64)] = &[
    (1.3, 18.0),
    (1.6, 20.0),
    (2.0, 17.0),
    (2.5, 14.0),
    (3.5, 10.0),
    (5.0, 6.0),
];
const ODD_FALLBACK_POINTS: f64 = 3.0;

/// Lower-inclusive probability thresholds, evaluated top-down.
const PROBABILITY_POINTS: &[(f64, f64)] = &[
    (0.75, 20.0),
    (0.60, 17.0),
    (0.50, 14.0),
    (0.40, 10.0),
    (0.30, 6.0),
];
const PROBABILITY_FALLBACK_POINTS: f64 = 3.0;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ContextSignals {
    pub data_quality: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreInput {
    pub edge: f64,
    pub market_odd: Option<f64>,
    pub model_prob: Option<f64>,
    pub context: ContextSignals,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub edge: f64,
    pub odd: f64,
    pub probability: f64,
    pub context: f64,
    pub agreement: f64,
}

impl ScoreBreakdown {
    pub fn total(&self) -> f64 {
        (self.edge + self.odd + self.probability + self.context + self.agreement).clamp(0.0, 100.0)
    }
}

fn points_at_most(value: f64, table: &[(f64, f64)], fallback: f64) -> f64 {
    table
        .iter()
        .find(|(threshold, _)| value <= *threshold)
        .map(|(_, points)| *points)
        .unwrap_or(fallback)
}

fn points_at_least(value: f64, table: &[(f64, f64)], fallback: f64) -> f64 {
    table
        .iter()
        .find(|(threshold, _)| value >= *threshold)
        .map(|(_, points)| *points)
        .unwrap_or(fallback)
}

pub fn edge_points(edge: f64) -> f64 {
    if edge.is_nan() {
        return 0.0;
    }
    points_at_most(edge, EDGE_POINTS, EDGE_FALLBACK_POINTS)
}

pub fn odd_points(market_odd: f64) -> f64 {
    points_at_most(market_odd, ODD_POINTS, ODD_FALLBACK_POINTS)
}

pub fn probability_points(model_prob: f64) -> f64 {
    points_at_least(model_prob, PROBABILITY_POINTS, PROBABILITY_FALLBACK_POINTS)
}

/// Placeholder weight until richer context (injuries, referee profile) is modelled.
pub fn context_points(_signals: &ContextSignals) -> f64 {
    DATA_QUALITY_POINTS + CONTEXT_POINTS
}

pub fn agreement_points(model_prob: Option<f64>, implied_prob: Option<f64>) -> f64 {
    let (Some(model), Some(implied)) = (model_prob, implied_prob) else {
        return 5.0;
    };
    if model <= 0.0 || implied <= 0.0 || model.is_nan() || implied.is_nan() {
        return 5.0;
    }
    let ratio = model / implied;
    if (1.03..=1.25).contains(&ratio) {
        10.0
    } else if (1.01..=1.50).contains(&ratio) {
        6.0
    } else if ratio > 1.50 {
        2.0
    } else {
        0.0
    }
}

pub fn score_breakdown(input: &ScoreInput) -> ScoreBreakdown {
    let valid_odd = input
        .market_odd
        .filter(|odd| odd.is_finite() && *odd > 0.0);
    let odd = valid_odd.unwrap_or(DEFAULT_MARKET_ODD);
    let model_prob = input
        .model_prob
        .filter(|p| p.is_finite())
        .unwrap_or(DEFAULT_MODEL_PROB);

    ScoreBreakdown {
        edge: edge_points(input.edge),
        odd: odd_points(odd),
        probability: probability_points(model_prob),
        context: context_points(&input.context),
        agreement: agreement_points(Some(model_prob), valid_odd.and_then(implied_probability)),
    }
}

/// Reliability score in [0, 100]. Never fails: incomplete rows take documented defaults.
pub fn confidence_score(input: &ScoreInput) -> f64 {
    score_breakdown(input).total()
}

pub fn classify_confidence(edge: f64, model_prob: f64, weather_stable: bool, fatigue_free: bool) -> ConfidenceTier {
    let clean_context = weather_stable && fatigue_free;
    if (edge > 0.10 && model_prob > 0.40 && clean_context) || (edge > 0.08 && model_prob > 0.35) {
        ConfidenceTier::High
    } else if edge > 0.05 {
        ConfidenceTier::Medium
    } else {
        ConfidenceTier::Low
    }
}

// Analysis-type classification.

pub fn parse_match_time(raw: Option<&str>) -> Result<NaiveTime, CoreError> {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(NaiveTime::MIN);
    };
    NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
        .map_err(|err| CoreError::invalid("match_time", format!("{raw}: {err}")))
}

pub fn classify_analysis(kickoff: DateTime<Utc>, executed_at: DateTime<Utc>, grace: Duration) -> AnalysisType {
    if kickoff >= executed_at - grace {
        AnalysisType::PreMatch
    } else {
        AnalysisType::Retroactive
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalysisClassifier {
    timezone: Tz,
    grace: Duration,
}

impl Default for AnalysisClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEZONE, Duration::minutes(DEFAULT_GRACE_MINUTES))
    }
}

impl AnalysisClassifier {
    pub fn new(timezone: Tz, grace: Duration) -> Self {
        Self { timezone, grace }
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Kickoff instant from a local date and optional `HH:MM[:SS]` time.
    pub fn kickoff(&self, match_date: NaiveDate, match_time: Option<&str>) -> Result<DateTime<Utc>, CoreError> {
        let local = NaiveDateTime::new(match_date, parse_match_time(match_time)?);
        // Nonexistent local times (DST gaps) resolve one hour later.
        let resolved = self
            .timezone
            .from_local_datetime(&local)
            .earliest()
            .or_else(|| {
                self.timezone
                    .from_local_datetime(&(local + Duration::hours(1)))
                    .earliest()
            })
            .ok_or_else(|| CoreError::invalid("match_time", format!("{local} does not exist in {}", self.timezone)))?;
        Ok(resolved.with_timezone(&Utc))
    }

    pub fn classify(&self, kickoff: DateTime<Utc>, executed_at: DateTime<Utc>) -> AnalysisType {
        classify_analysis(kickoff, executed_at, self.grace)
    }

    pub fn classify_opportunity(&self, opportunity: &Opportunity, executed_at: DateTime<Utc>) -> Result<AnalysisType, CoreError> {
        let kickoff = self.kickoff(opportunity.match_date, opportunity.match_time.as_deref())?;
        Ok(self.classify(kickoff, executed_at))
    }

    /// Calendar date of an instant in the reference zone.
    pub fn local_date(&self, instant: DateTime<Utc>) -> NaiveDate {
        instant.with_timezone(&self.timezone).date_naive()
    }
}

/// Deterministic opportunity identity within a run.
pub fn opportunity_id(run_id: Uuid, match_id: i64, market: &str, selection: &str) -> Uuid {
    let source = format!(
        "{}:{}:{}:{}",
        run_id,
        match_id,
        market.trim().to_lowercase(),
        selection.trim().to_lowercase()
    );
    Uuid::new_v5(&Uuid::NAMESPACE_OID, source.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(edge: f64, market_odd: Option<f64>, model_prob: Option<f64>) -> ScoreInput {
        ScoreInput {
            edge,
            market_odd,
            model_prob,
            context: ContextSignals::default(),
        }
    }

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn edge_bucket_upper_bound_is_inclusive() {
        assert_eq!(edge_points(0.10), 25.0);
        assert_eq!(edge_points(0.1001), 22.0);
        assert_eq!(edge_points(0.0), 0.0);
        assert_eq!(edge_points(-0.02), 0.0);
        assert_eq!(edge_points(0.05), 10.0);
        assert_eq!(edge_points(0.40), 8.0);
        assert_eq!(edge_points(0.41), 3.0);
    }

    #[test]
    fn odd_and_probability_buckets_match_table() {
        assert_eq!(odd_points(1.3), 18.0);
        assert_eq!(odd_points(1.6), 20.0);
        assert_eq!(odd_points(1.61), 17.0);
        assert_eq!(odd_points(3.5), 10.0);
        assert_eq!(odd_points(5.0), 6.0);
        assert_eq!(odd_points(7.5), 3.0);

        assert_eq!(probability_points(0.75), 20.0);
        assert_eq!(probability_points(0.60), 17.0);
        assert_eq!(probability_points(0.5), 14.0);
        assert_eq!(probability_points(0.45), 10.0);
        assert_eq!(probability_points(0.30), 6.0);
        assert_eq!(probability_points(0.10), 3.0);
    }

    #[test]
    fn agreement_ratio_bands() {
        assert_eq!(agreement_points(Some(0.55), Some(0.5)), 10.0);
        assert_eq!(agreement_points(Some(0.51), Some(0.5)), 6.0);
        assert_eq!(agreement_points(Some(0.9), Some(0.5)), 2.0);
        assert_eq!(agreement_points(Some(0.5), Some(0.5)), 0.0);
        assert_eq!(agreement_points(None, Some(0.5)), 5.0);
        assert_eq!(agreement_points(Some(0.0), Some(0.5)), 5.0);
    }

    #[test]
    fn sweet_spot_scores_full_marks() {
        // edge 10% at odd 1.5 (implied 0.667) with model prob 0.767
        let score = confidence_score(&input(0.10, Some(1.5), Some(0.767)));
        assert_eq!(score, 25.0 + 20.0 + 20.0 + 15.0 + 10.0);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let breakdown = score_breakdown(&input(0.07, None, None));
        assert_eq!(breakdown.odd, 17.0);
        assert_eq!(breakdown.probability, 3.0);
        assert_eq!(breakdown.agreement, 5.0);
        assert_eq!(breakdown.total(), 25.0 + 17.0 + 3.0 + 15.0 + 5.0);

        let non_positive = score_breakdown(&input(0.07, Some(-1.0), Some(0.5)));
        assert_eq!(non_positive.odd, 17.0);
        assert_eq!(non_positive.agreement, 5.0);
    }

    #[test]
    fn score_stays_in_range_and_is_deterministic() {
        let edges = [-1.0, -0.01, 0.0, 0.03, 0.1, 0.2, 0.5, 3.0, f64::NAN, f64::INFINITY];
        let odds = [None, Some(0.0), Some(1.01), Some(1.5), Some(2.2), Some(4.0), Some(50.0)];
        let probs = [None, Some(0.0), Some(0.2), Some(0.5), Some(0.8), Some(1.0)];
        for edge in edges {
            for odd in odds {
                for prob in probs {
                    let first = confidence_score(&input(edge, odd, prob));
                    let second = confidence_score(&input(edge, odd, prob));
                    assert!((0.0..=100.0).contains(&first), "{edge} {odd:?} {prob:?} -> {first}");
                    assert_eq!(first.to_bits(), second.to_bits());
                }
            }
        }
    }

    #[test]
    fn tier_classification_follows_thresholds() {
        assert_eq!(classify_confidence(0.12, 0.45, true, true), ConfidenceTier::High);
        assert_eq!(classify_confidence(0.12, 0.45, false, true), ConfidenceTier::High);
        assert_eq!(classify_confidence(0.12, 0.30, false, true), ConfidenceTier::Medium);
        assert_eq!(classify_confidence(0.06, 0.60, true, true), ConfidenceTier::Medium);
        assert_eq!(classify_confidence(0.04, 0.60, true, true), ConfidenceTier::Low);
    }

    #[test]
    fn classifier_grace_window() {
        let classifier = AnalysisClassifier::default();
        let executed = utc("2026-03-14T18:00:00Z");
        assert_eq!(
            classifier.classify(executed - Duration::minutes(31), executed),
            AnalysisType::Retroactive
        );
        assert_eq!(
            classifier.classify(executed - Duration::minutes(29), executed),
            AnalysisType::PreMatch
        );
        assert_eq!(
            classifier.classify(executed - Duration::minutes(30), executed),
            AnalysisType::PreMatch
        );
        assert_eq!(
            classifier.classify(executed + Duration::hours(3), executed),
            AnalysisType::PreMatch
        );
    }

    #[test]
    fn kickoff_uses_reference_timezone_and_midnight_default() {
        let classifier = AnalysisClassifier::default();
        let date = NaiveDate::from_ymd_opt(2026, 3, 14).unwrap();
        // Sao Paulo is UTC-3.
        assert_eq!(
            classifier.kickoff(date, Some("16:00")).unwrap(),
            utc("2026-03-14T19:00:00Z")
        );
        assert_eq!(classifier.kickoff(date, None).unwrap(), utc("2026-03-14T03:00:00Z"));
        assert_eq!(classifier.kickoff(date, Some("")).unwrap(), utc("2026-03-14T03:00:00Z"));
        assert!(matches!(
            classifier.kickoff(date, Some("late evening")),
            Err(CoreError::InvalidInput { field: "match_time", .. })
        ));
    }

    #[test]
    fn match_validation_rejects_same_team_and_negative_probabilities() {
        let mut m: Match = serde_json::from_value(serde_json::json!({
            "match_id": 1,
            "league_name": "Serie A",
            "league_country": "Brazil",
            "match_date": "2026-03-14",
            "home_team": "Palmeiras",
            "away_team": "Santos",
            "prob_home": 48.0,
            "prob_draw": 27.0,
            "prob_away": 28.0
        }))
        .unwrap();
        assert!(m.validate().is_ok());

        m.prob_draw = -1.0;
        assert!(m.validate().is_err());

        m.prob_draw = 27.0;
        m.home_team_id = Some(7);
        m.away_team_id = Some(7);
        assert!(m.validate().is_err());
    }

    #[test]
    fn statuses_parse_legacy_labels() {
        let status: ResultStatus = serde_json::from_str("\"PENDENTE\"").unwrap();
        assert_eq!(status, ResultStatus::Pending);
        let tier: ConfidenceTier = serde_json::from_str("\"MÉDIO\"").unwrap();
        assert_eq!(tier, ConfidenceTier::Medium);
        assert_eq!("pre-match".parse::<AnalysisType>().unwrap(), AnalysisType::PreMatch);
        assert!(ResultStatus::Void.is_terminal());
        assert!(!ResultStatus::Void.is_decided());
    }

    #[test]
    fn sentinel_detection() {
        assert!(is_unscored(None));
        assert!(is_unscored(Some(0.0)));
        assert!(!is_unscored(Some(42.0)));
    }

    #[test]
    fn opportunity_ids_are_stable() {
        let run = Uuid::new_v4();
        assert_eq!(
            opportunity_id(run, 10, "1x2", "Home"),
            opportunity_id(run, 10, " 1X2", "home ")
        );
        assert_ne!(opportunity_id(run, 10, "1x2", "Home"), opportunity_id(run, 10, "1x2", "Away"));
    }
}
