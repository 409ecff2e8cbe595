//! Performance report tables over settled opportunities, and their on-disk export.
//!
//! Every table is produced by the same grouping primitive: opportunities are
//! tallied per group key and the tally is turned into hit rate, flat-stake
//! profit and ROI. Tables are recomputed from the dataset on every call.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, Float64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use edgebook_core::{AnalysisType, ConfidenceTier, CoreError, Opportunity, ResultStatus};
use edgebook_storage::{write_atomic, Dataset};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "edgebook-analytics";

/// Sample-size floor for the confidence x market cross table.
pub const CROSS_TABLE_MIN_DECIDED: u32 = 3;

/// Exclusive upper bounds, evaluated first-match-wins.
pub const ODD_BUCKETS: &[(f64, &str)] = &[
    (1.30, "<1.30"),
    (1.50, "1.30-1.49"),
    (1.80, "1.50-1.79"),
    (2.00, "1.80-1.99"),
    (2.50, "2.00-2.49"),
    (3.00, "2.50-2.99"),
    (5.00, "3.00-4.99"),
];
pub const ODD_OVERFLOW: &str = "5.00+";

pub const EDGE_BUCKETS: &[(f64, &str)] = &[
    (0.03, "<3%"),
    (0.05, "3-5%"),
    (0.10, "5-10%"),
    (0.20, "10-20%"),
    (0.50, "20-50%"),
];
pub const EDGE_OVERFLOW: &str = "50%+";

/// Position and label of the first bucket whose bound exceeds `value`.
pub fn bucket(value: f64, table: &[(f64, &'static str)], overflow: &'static str) -> (usize, &'static str) {
    table
        .iter()
        .enumerate()
        .find(|(_, (bound, _))| value < *bound)
        .map(|(index, (_, label))| (index, *label))
        .unwrap_or((table.len(), overflow))
}

pub fn odd_bucket(market_odd: f64) -> (usize, &'static str) {
    bucket(market_odd, ODD_BUCKETS, ODD_OVERFLOW)
}

pub fn edge_bucket(edge: f64) -> (usize, &'static str) {
    bucket(edge, EDGE_BUCKETS, EDGE_OVERFLOW)
}

/// `numerator / denominator * 100`, or `None` when there is nothing to divide by.
pub fn compute_percentage(numerator: f64, denominator: u32) -> Option<f64> {
    if denominator > 0 {
        Some(numerator / f64::from(denominator) * 100.0)
    } else {
        None
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

fn mean(sum: f64, count: u32) -> Option<f64> {
    (count > 0).then(|| sum / f64::from(count))
}

/// Monday of the ISO week containing `date`.
pub fn week_start(date: NaiveDate) -> NaiveDate {
    date - Duration::days(i64::from(date.weekday().num_days_from_monday()))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceStats {
    pub total: u32,
    pub greens: u32,
    pub reds: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voids: Option<u32>,
    pub pending: u32,
    pub hit_rate_pct: Option<f64>,
    pub profit_units: f64,
    pub roi_pct: Option<f64>,
    pub avg_odd: Option<f64>,
    pub avg_edge_green_pct: Option<f64>,
    pub avg_edge_red_pct: Option<f64>,
}

#[derive(Debug, Clone, Default)]
struct Tally {
    greens: u32,
    reds: u32,
    voids: u32,
    pending: u32,
    profit: f64,
    odd_sum: f64,
    odd_count: u32,
    edge_green_sum: f64,
    edge_red_sum: f64,
}

impl Tally {
    fn add(&mut self, opportunity: &Opportunity) {
        match opportunity.result_status {
            ResultStatus::Pending => {
                self.pending += 1;
                return;
            }
            ResultStatus::Void => {
                self.voids += 1;
                return;
            }
            ResultStatus::Green => {
                self.greens += 1;
                self.edge_green_sum += opportunity.edge;
            }
            ResultStatus::Red => {
                self.reds += 1;
                self.edge_red_sum += opportunity.edge;
            }
        }
        self.profit += opportunity.flat_profit().unwrap_or_default();
        if let Some(odd) = opportunity.market_odd {
            self.odd_sum += odd;
            self.odd_count += 1;
        }
    }

    fn decided(&self) -> u32 {
        self.greens + self.reds
    }

    fn stats(&self, include_voids: bool) -> PerformanceStats {
        let decided = self.decided();
        PerformanceStats {
            total: if include_voids { decided + self.voids } else { decided },
            greens: self.greens,
            reds: self.reds,
            voids: include_voids.then_some(self.voids),
            pending: self.pending,
            hit_rate_pct: compute_percentage(f64::from(self.greens), decided).map(|v| round_to(v, 1)),
            profit_units: round_to(self.profit, 2),
            roi_pct: compute_percentage(self.profit, decided).map(|v| round_to(v, 1)),
            avg_odd: mean(self.odd_sum, self.odd_count).map(|v| round_to(v, 2)),
            avg_edge_green_pct: mean(self.edge_green_sum * 100.0, self.greens).map(|v| round_to(v, 2)),
            avg_edge_red_pct: mean(self.edge_red_sum * 100.0, self.reds).map(|v| round_to(v, 2)),
        }
    }
}

/// The grouping primitive shared by every report. Rows whose key is `None` are left out.
fn tally_by<K, F>(rows: &[&Opportunity], key: F) -> BTreeMap<K, Tally>
where
    K: Ord,
    F: Fn(&Opportunity) -> Option<K>,
{
    let mut groups: BTreeMap<K, Tally> = BTreeMap::new();
    for opportunity in rows {
        if let Some(k) = key(*opportunity) {
            groups.entry(k).or_default().add(*opportunity);
        }
    }
    groups
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportName {
    Summary,
    Weekly,
    ByConfidence,
    ByMarket,
    ByOddRange,
    ByEdgeRange,
    ByLeague,
    ByCountry,
    Daily,
    ConfidenceMarket,
}

impl ReportName {
    pub const ALL: [ReportName; 10] = [
        Self::Summary,
        Self::Weekly,
        Self::ByConfidence,
        Self::ByMarket,
        Self::ByOddRange,
        Self::ByEdgeRange,
        Self::ByLeague,
        Self::ByCountry,
        Self::Daily,
        Self::ConfidenceMarket,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Summary => "summary",
            Self::Weekly => "weekly",
            Self::ByConfidence => "by_confidence",
            Self::ByMarket => "by_market",
            Self::ByOddRange => "by_odd_range",
            Self::ByEdgeRange => "by_edge_range",
            Self::ByLeague => "by_league",
            Self::ByCountry => "by_country",
            Self::Daily => "daily",
            Self::ConfidenceMarket => "confidence_market",
        }
    }

    pub fn dimensions(self) -> &'static [&'static str] {
        match self {
            Self::Summary => &["scope"],
            Self::Weekly => &["week_start"],
            Self::ByConfidence => &["confidence"],
            Self::ByMarket => &["market"],
            Self::ByOddRange => &["odd_range"],
            Self::ByEdgeRange => &["edge_range"],
            Self::ByLeague => &["league_name", "league_country"],
            Self::ByCountry => &["league_country"],
            Self::Daily => &["match_date"],
            Self::ConfidenceMarket => &["confidence", "market"],
        }
    }
}

impl fmt::Display for ReportName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReportName {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|name| name.as_str() == wanted)
            .ok_or_else(|| CoreError::InvalidInput {
                field: "report",
                reason: format!("unknown report {s}"),
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportRow {
    pub group: Vec<String>,
    #[serde(flatten)]
    pub stats: PerformanceStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cumulative_profit: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportTable {
    pub name: ReportName,
    pub dimensions: &'static [&'static str],
    pub rows: Vec<ReportRow>,
}

impl ReportTable {
    fn new(name: ReportName, rows: Vec<ReportRow>) -> Self {
        Self {
            name,
            dimensions: name.dimensions(),
            rows,
        }
    }

    pub fn row(&self, group: &[&str]) -> Option<&ReportRow> {
        self.rows
            .iter()
            .find(|row| row.group.iter().map(String::as_str).eq(group.iter().copied()))
    }
}

fn into_rows<K, L>(groups: BTreeMap<K, Tally>, include_voids: bool, label: L) -> Vec<ReportRow>
where
    L: Fn(&K) -> Vec<String>,
{
    groups
        .iter()
        .map(|(key, tally)| ReportRow {
            group: label(key),
            stats: tally.stats(include_voids),
            cumulative_profit: None,
        })
        .collect()
}

/// Restricts which opportunities enter the aggregation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportFilter {
    #[serde(default)]
    pub market: Option<String>,
    #[serde(default)]
    pub from: Option<NaiveDate>,
    #[serde(default)]
    pub to: Option<NaiveDate>,
    #[serde(default)]
    pub analysis_type: Option<AnalysisType>,
    #[serde(default)]
    pub confidence: Option<ConfidenceTier>,
}

impl ReportFilter {
    pub fn matches(&self, opportunity: &Opportunity) -> bool {
        if let Some(market) = &self.market {
            if !opportunity.market.trim().eq_ignore_ascii_case(market.trim()) {
                return false;
            }
        }
        if self.from.is_some_and(|from| opportunity.match_date < from) {
            return false;
        }
        if self.to.is_some_and(|to| opportunity.match_date > to) {
            return false;
        }
        if self.analysis_type.is_some_and(|t| opportunity.analysis_type != t) {
            return false;
        }
        if self.confidence.is_some_and(|c| opportunity.confidence != c) {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    /// Skip opportunities whose match is absent from the dataset.
    pub require_match_reference: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            require_match_reference: true,
        }
    }
}

/// An opportunity left out of every table, with the reason.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedRow {
    pub opportunity_id: Uuid,
    pub match_id: i64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportSet {
    pub generated_at: DateTime<Utc>,
    pub filter: ReportFilter,
    pub opportunities_considered: usize,
    pub warnings: Vec<SkippedRow>,
    pub tables: Vec<ReportTable>,
}

impl ReportSet {
    pub fn table(&self, name: ReportName) -> Option<&ReportTable> {
        self.tables.iter().find(|t| t.name == name)
    }
}

/// Markets group case-insensitively, the same way report filters match them.
fn market_key(opportunity: &Opportunity) -> String {
    opportunity.market.trim().to_lowercase()
}

pub struct AggregationEngine<'a> {
    rows: Vec<&'a Opportunity>,
    warnings: Vec<SkippedRow>,
    /// First spelling seen for each market key.
    market_labels: HashMap<String, String>,
}

impl<'a> AggregationEngine<'a> {
    pub fn new(dataset: &'a Dataset, filter: &ReportFilter) -> Self {
        Self::with_options(dataset, filter, EngineOptions::default())
    }

    pub fn with_options(dataset: &'a Dataset, filter: &ReportFilter, options: EngineOptions) -> Self {
        let known_matches: HashSet<i64> = if options.require_match_reference {
            dataset.match_ids()
        } else {
            HashSet::new()
        };
        let mut rows = Vec::new();
        let mut warnings = Vec::new();

        for opportunity in dataset.opportunities.iter().filter(|o| filter.matches(o)) {
            let problem = if options.require_match_reference && !known_matches.contains(&opportunity.match_id) {
                Some(CoreError::MissingReference {
                    kind: "match",
                    id: opportunity.match_id.to_string(),
                })
            } else if opportunity.edge.is_nan() {
                Some(CoreError::InvalidInput {
                    field: "edge",
                    reason: "edge is not a number".to_string(),
                })
            } else if opportunity.market_odd.is_some_and(f64::is_nan) {
                Some(CoreError::InvalidInput {
                    field: "market_odd",
                    reason: "market odd is not a number".to_string(),
                })
            } else if opportunity.result_status == ResultStatus::Green && opportunity.flat_profit().is_none() {
                Some(CoreError::InvalidInput {
                    field: "market_odd",
                    reason: "settled GREEN without a market odd".to_string(),
                })
            } else {
                None
            };

            match problem {
                Some(err) => {
                    warn!(opportunity_id = %opportunity.id, error = %err, "skipping row in aggregation");
                    warnings.push(SkippedRow {
                        opportunity_id: opportunity.id,
                        match_id: opportunity.match_id,
                        reason: err.to_string(),
                    });
                }
                None => rows.push(opportunity),
            }
        }
        let mut market_labels = HashMap::new();
        for opportunity in &rows {
            market_labels
                .entry(market_key(opportunity))
                .or_insert_with(|| opportunity.market.trim().to_string());
        }
        debug!(rows = rows.len(), skipped = warnings.len(), "aggregation input prepared");
        Self {
            rows,
            warnings,
            market_labels,
        }
    }

    fn market_label(&self, key: &str) -> String {
        self.market_labels.get(key).cloned().unwrap_or_else(|| key.to_string())
    }

    pub fn rows(&self) -> &[&'a Opportunity] {
        &self.rows
    }

    pub fn warnings(&self) -> &[SkippedRow] {
        &self.warnings
    }

    pub fn report(&self, name: ReportName) -> ReportTable {
        let rows = match name {
            ReportName::Summary => self.summary(),
            ReportName::Weekly => self.weekly(),
            ReportName::ByConfidence => into_rows(tally_by(&self.rows, |o| Some(o.confidence)), false, |tier| {
                vec![tier.as_str().to_string()]
            }),
            ReportName::ByMarket => {
                into_rows(tally_by(&self.rows, |o| Some(market_key(o))), true, |key| vec![self.market_label(key)])
            }
            ReportName::ByOddRange => into_rows(
                tally_by(&self.rows, |o| o.market_odd.map(odd_bucket)),
                false,
                |(_, label)| vec![label.to_string()],
            ),
            ReportName::ByEdgeRange => into_rows(
                tally_by(&self.rows, |o| Some(edge_bucket(o.edge))),
                false,
                |(_, label)| vec![label.to_string()],
            ),
            ReportName::ByLeague => into_rows(
                tally_by(&self.rows, |o| Some((o.league_name.clone(), o.league_country.clone()))),
                false,
                |(league, country)| vec![league.clone(), country.clone()],
            ),
            ReportName::ByCountry => into_rows(
                tally_by(&self.rows, |o| Some(o.league_country.clone())),
                false,
                |country| vec![country.clone()],
            ),
            ReportName::Daily => self.daily(),
            ReportName::ConfidenceMarket => self.confidence_market(),
        };
        ReportTable::new(name, rows)
    }

    pub fn report_set(&self, filter: &ReportFilter, generated_at: DateTime<Utc>) -> ReportSet {
        ReportSet {
            generated_at,
            filter: filter.clone(),
            opportunities_considered: self.rows.len(),
            warnings: self.warnings.clone(),
            tables: ReportName::ALL.into_iter().map(|name| self.report(name)).collect(),
        }
    }

    fn summary(&self) -> Vec<ReportRow> {
        let mut tally = Tally::default();
        for opportunity in &self.rows {
            tally.add(opportunity);
        }
        vec![ReportRow {
            group: vec!["all".to_string()],
            stats: tally.stats(true),
            cumulative_profit: None,
        }]
    }

    fn weekly(&self) -> Vec<ReportRow> {
        let mut rows = into_rows(
            tally_by(&self.rows, |o| Some(week_start(o.match_date))),
            false,
            |week| vec![week.to_string()],
        );
        rows.reverse();
        rows
    }

    /// Most recent day first; cumulative profit runs forward in time.
    fn daily(&self) -> Vec<ReportRow> {
        let groups = tally_by(&self.rows, |o| Some(o.match_date));
        let mut running = 0.0;
        let mut rows: Vec<ReportRow> = groups
            .iter()
            .map(|(day, tally)| {
                running += tally.profit;
                ReportRow {
                    group: vec![day.to_string()],
                    stats: tally.stats(false),
                    cumulative_profit: Some(round_to(running, 2)),
                }
            })
            .collect();
        rows.reverse();
        rows
    }

    fn confidence_market(&self) -> Vec<ReportRow> {
        let mut groups = tally_by(&self.rows, |o| Some((o.confidence, market_key(o))));
        groups.retain(|_, tally| tally.decided() >= CROSS_TABLE_MIN_DECIDED);
        into_rows(groups, false, |(tier, key)| vec![tier.as_str().to_string(), self.market_label(key)])
    }
}

// Export.

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub export_id: String,
    pub files: Vec<SnapshotManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifestFile {
    pub name: String,
    pub path: String,
    pub rows: usize,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportSummary {
    pub export_id: String,
    pub export_dir: PathBuf,
    pub reports_json: PathBuf,
    pub brief: PathBuf,
    pub manifest: PathBuf,
    pub snapshot_files: usize,
}

/// Writes `reports.json`, `performance_brief.md` and Parquet snapshots with a manifest
/// under `<reports_root>/<export_id>/`.
pub async fn export_reports(set: &ReportSet, reports_root: &Path, export_id: &str) -> Result<ExportSummary> {
    let export_dir = reports_root.join(export_id);
    let snapshot_dir = export_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let reports_json = export_dir.join("reports.json");
    let bytes = serde_json::to_vec_pretty(set).context("serializing report set")?;
    write_atomic(&reports_json, &bytes)
        .await
        .with_context(|| format!("writing {}", reports_json.display()))?;

    let brief = export_dir.join("performance_brief.md");
    write_atomic(&brief, performance_brief(set, export_id).as_bytes())
        .await
        .with_context(|| format!("writing {}", brief.display()))?;

    let mut files = Vec::with_capacity(set.tables.len());
    for table in &set.tables {
        let path = snapshot_dir.join(format!("{}.parquet", table.name));
        write_parquet(&path, table_batch(table)?)?;
        files.push(manifest_entry(table, &export_dir, &path)?);
        debug!(report = %table.name, rows = table.rows.len(), "wrote parquet snapshot");
    }

    let manifest = SnapshotManifest {
        schema_version: 1,
        export_id: export_id.to_string(),
        files,
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
    write_atomic(&manifest_path, &bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    info!(export_id, dir = %export_dir.display(), tables = set.tables.len(), "reports exported");
    Ok(ExportSummary {
        export_id: export_id.to_string(),
        export_dir,
        reports_json,
        brief,
        manifest: manifest_path,
        snapshot_files: manifest.files.len(),
    })
}

fn fmt_pct(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{v:.1}%"))
}

pub fn performance_brief(set: &ReportSet, export_id: &str) -> String {
    let mut lines = vec![
        "# Edgebook Performance Brief".to_string(),
        String::new(),
        format!("- Export: `{export_id}`"),
        format!("- Generated: {}", set.generated_at.to_rfc3339()),
        format!("- Opportunities considered: {}", set.opportunities_considered),
        format!("- Skipped rows: {}", set.warnings.len()),
    ];
    if let Some(analysis_type) = set.filter.analysis_type {
        lines.push(format!("- Analysis type: {analysis_type}"));
    }
    if let Some(market) = &set.filter.market {
        lines.push(format!("- Market: {market}"));
    }

    if let Some(summary) = set.table(ReportName::Summary).and_then(|t| t.rows.first()) {
        let s = &summary.stats;
        lines.push(String::new());
        lines.push("## Summary".to_string());
        lines.push(String::new());
        lines.push("| Settled | Greens | Reds | Voids | Pending | Hit rate | Profit (u) | ROI |".to_string());
        lines.push("|---|---|---|---|---|---|---|---|".to_string());
        lines.push(format!(
            "| {} | {} | {} | {} | {} | {} | {:.2} | {} |",
            s.total,
            s.greens,
            s.reds,
            s.voids.unwrap_or_default(),
            s.pending,
            fmt_pct(s.hit_rate_pct),
            s.profit_units,
            fmt_pct(s.roi_pct)
        ));
    }

    if let Some(daily) = set.table(ReportName::Daily) {
        lines.push(String::new());
        lines.push("## Daily".to_string());
        lines.push(String::new());
        lines.push("| Date | Decided | Hit rate | Profit (u) | Cumulative (u) |".to_string());
        lines.push("|---|---|---|---|---|".to_string());
        for row in &daily.rows {
            lines.push(format!(
                "| {} | {} | {} | {:.2} | {:.2} |",
                row.group.join(" / "),
                row.stats.total,
                fmt_pct(row.stats.hit_rate_pct),
                row.stats.profit_units,
                row.cumulative_profit.unwrap_or_default()
            ));
        }
    }

    if let Some(markets) = set.table(ReportName::ByMarket) {
        lines.push(String::new());
        lines.push("## Markets".to_string());
        lines.push(String::new());
        lines.push("| Market | Total | Greens | Reds | Voids | Hit rate | Profit (u) | ROI |".to_string());
        lines.push("|---|---|---|---|---|---|---|---|".to_string());
        for row in &markets.rows {
            let s = &row.stats;
            lines.push(format!(
                "| {} | {} | {} | {} | {} | {} | {:.2} | {} |",
                row.group.join(" / "),
                s.total,
                s.greens,
                s.reds,
                s.voids.unwrap_or_default(),
                fmt_pct(s.hit_rate_pct),
                s.profit_units,
                fmt_pct(s.roi_pct)
            ));
        }
    }

    if !set.warnings.is_empty() {
        lines.push(String::new());
        lines.push("## Skipped rows".to_string());
        lines.push(String::new());
        for warning in &set.warnings {
            lines.push(format!("- `{}` (match {}): {}", warning.opportunity_id, warning.match_id, warning.reason));
        }
    }

    lines.push(String::new());
    lines.join("\n")
}

fn table_batch(table: &ReportTable) -> Result<RecordBatch> {
    let mut fields = Vec::new();
    let mut columns: Vec<ArrayRef> = Vec::new();

    for (index, dimension) in table.dimensions.iter().enumerate() {
        fields.push(ArrowField::new(*dimension, DataType::Utf8, false));
        columns.push(Arc::new(StringArray::from(
            table
                .rows
                .iter()
                .map(|row| row.group.get(index).map(String::as_str).unwrap_or_default())
                .collect::<Vec<_>>(),
        )));
    }

    let counts: [(&str, fn(&PerformanceStats) -> u32); 4] = [
        ("total", |s| s.total),
        ("greens", |s| s.greens),
        ("reds", |s| s.reds),
        ("pending", |s| s.pending),
    ];
    for (name, get) in counts {
        fields.push(ArrowField::new(name, DataType::UInt32, false));
        columns.push(Arc::new(UInt32Array::from(
            table.rows.iter().map(|row| get(&row.stats)).collect::<Vec<_>>(),
        )));
    }
    fields.push(ArrowField::new("voids", DataType::UInt32, true));
    columns.push(Arc::new(UInt32Array::from(
        table.rows.iter().map(|row| row.stats.voids).collect::<Vec<_>>(),
    )));

    let metrics: [(&str, fn(&ReportRow) -> Option<f64>); 7] = [
        ("hit_rate_pct", |r| r.stats.hit_rate_pct),
        ("profit_units", |r| Some(r.stats.profit_units)),
        ("roi_pct", |r| r.stats.roi_pct),
        ("avg_odd", |r| r.stats.avg_odd),
        ("avg_edge_green_pct", |r| r.stats.avg_edge_green_pct),
        ("avg_edge_red_pct", |r| r.stats.avg_edge_red_pct),
        ("cumulative_profit", |r| r.cumulative_profit),
    ];
    for (name, get) in metrics {
        fields.push(ArrowField::new(name, DataType::Float64, true));
        columns.push(Arc::new(Float64Array::from(
            table.rows.iter().map(get).collect::<Vec<_>>(),
        )));
    }

    RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
        .with_context(|| format!("building {} record batch", table.name))
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn manifest_entry(table: &ReportTable, export_dir: &Path, path: &Path) -> Result<SnapshotManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let rel = path.strip_prefix(export_dir).unwrap_or(path).display().to_string();
    Ok(SnapshotManifestFile {
        name: table.name.to_string(),
        path: rel,
        rows: table.rows.len(),
        sha256: hex::encode(hasher.finalize()),
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgebook_core::{BetRecord, ContextNotes, Match};

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
    }

    fn opp(market: &str, status: ResultStatus, odd: f64, edge: f64, date: NaiveDate) -> Opportunity {
        Opportunity {
            id: Uuid::new_v4(),
            run_id: Uuid::nil(),
            version: 0,
            match_id: 7,
            league_name: "Serie A".into(),
            league_country: "Brazil".into(),
            match_date: date,
            match_time: None,
            home_team: "Palmeiras".into(),
            away_team: "Santos".into(),
            market: market.into(),
            selection: "Home".into(),
            bookmaker: None,
            market_odd: Some(odd),
            fair_odd: None,
            model_prob: None,
            implied_prob: None,
            edge,
            kelly_fraction: 0.0,
            confidence: ConfidenceTier::Medium,
            confidence_score: Some(60.0),
            analysis_type: AnalysisType::PreMatch,
            reasoning: String::new(),
            notes: ContextNotes::default(),
            data_quality: None,
            result_status: status,
            result_score: None,
            result_detail: None,
            result_updated_at: None,
            bet: BetRecord::default(),
        }
    }

    fn fixture_match(match_id: i64) -> Match {
        serde_json::from_value(serde_json::json!({
            "match_id": match_id,
            "league_name": "Serie A",
            "league_country": "Brazil",
            "match_date": "2026-03-14",
            "home_team": "Palmeiras",
            "away_team": "Santos"
        }))
        .unwrap()
    }

    fn dataset(opportunities: Vec<Opportunity>) -> Dataset {
        Dataset {
            runs: vec![],
            matches: vec![fixture_match(7)],
            opportunities,
        }
    }

    #[test]
    fn three_greens_and_a_red() {
        let ds = dataset(vec![
            opp("1x2", ResultStatus::Green, 2.0, 0.06, day(14)),
            opp("1x2", ResultStatus::Green, 2.0, 0.08, day(14)),
            opp("1x2", ResultStatus::Green, 2.0, 0.07, day(14)),
            opp("1x2", ResultStatus::Red, 2.0, 0.04, day(14)),
        ]);
        let engine = AggregationEngine::new(&ds, &ReportFilter::default());
        let table = engine.report(ReportName::ByMarket);
        let stats = &table.row(&["1x2"]).unwrap().stats;
        assert_eq!(stats.total, 4);
        assert_eq!(stats.hit_rate_pct, Some(75.0));
        assert_eq!(stats.profit_units, 2.0);
        assert_eq!(stats.roi_pct, Some(50.0));
        assert_eq!(stats.avg_odd, Some(2.0));
        assert_eq!(stats.avg_edge_green_pct, Some(7.0));
        assert_eq!(stats.avg_edge_red_pct, Some(4.0));
    }

    #[test]
    fn groups_without_decided_rows_report_null() {
        let ds = dataset(vec![
            opp("BTTS", ResultStatus::Void, 1.9, 0.05, day(14)),
            opp("BTTS", ResultStatus::Pending, 1.9, 0.05, day(14)),
        ]);
        let engine = AggregationEngine::new(&ds, &ReportFilter::default());
        let market = engine.report(ReportName::ByMarket);
        let stats = &market.row(&["BTTS"]).unwrap().stats;
        assert_eq!(stats.total, 1);
        assert_eq!(stats.voids, Some(1));
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.hit_rate_pct, None);
        assert_eq!(stats.roi_pct, None);
        assert_eq!(stats.profit_units, 0.0);

        let by_tier = engine.report(ReportName::ByConfidence);
        let row = serde_json::to_value(&by_tier.rows[0]).unwrap();
        assert!(row["hit_rate_pct"].is_null());
        assert!(row.get("voids").is_none());
    }

    #[test]
    fn cross_table_needs_three_decided() {
        let mut rows = vec![
            opp("1x2", ResultStatus::Green, 1.8, 0.06, day(14)),
            opp("1x2", ResultStatus::Red, 1.8, 0.06, day(14)),
            opp("1x2", ResultStatus::Void, 1.8, 0.06, day(14)),
            opp("Over 2.5", ResultStatus::Green, 1.9, 0.06, day(14)),
            opp("Over 2.5", ResultStatus::Green, 1.9, 0.06, day(14)),
            opp("Over 2.5", ResultStatus::Red, 1.9, 0.06, day(14)),
        ];
        rows[0].confidence = ConfidenceTier::High;
        rows[1].confidence = ConfidenceTier::High;
        rows[2].confidence = ConfidenceTier::High;
        let ds = dataset(rows);
        let table = AggregationEngine::new(&ds, &ReportFilter::default()).report(ReportName::ConfidenceMarket);
        assert_eq!(table.rows.len(), 1);
        assert!(table.row(&["HIGH", "1x2"]).is_none());
        let kept = table.row(&["MEDIUM", "Over 2.5"]).unwrap();
        assert_eq!(kept.stats.total, 3);
    }

    #[test]
    fn market_spellings_share_one_group() {
        let ds = dataset(vec![
            opp("Over 2.5", ResultStatus::Green, 1.9, 0.06, day(14)),
            opp("Over 2.5", ResultStatus::Green, 1.9, 0.06, day(14)),
            opp("over 2.5", ResultStatus::Red, 1.9, 0.06, day(14)),
            opp(" OVER 2.5", ResultStatus::Green, 1.9, 0.06, day(14)),
        ]);
        let engine = AggregationEngine::new(&ds, &ReportFilter::default());

        let by_market = engine.report(ReportName::ByMarket);
        assert_eq!(by_market.rows.len(), 1);
        assert_eq!(by_market.rows[0].group, vec!["Over 2.5".to_string()]);
        assert_eq!(by_market.rows[0].stats.total, 4);

        let cross = engine.report(ReportName::ConfidenceMarket);
        assert_eq!(cross.rows.len(), 1);
        assert_eq!(cross.row(&["MEDIUM", "Over 2.5"]).unwrap().stats.total, 4);
    }

    #[test]
    fn non_numeric_edge_or_odd_is_skipped() {
        let nan_edge = opp("1x2", ResultStatus::Green, 2.0, f64::NAN, day(14));
        let nan_odd = opp("1x2", ResultStatus::Red, f64::NAN, 0.06, day(14));
        let ds = dataset(vec![nan_edge, nan_odd, opp("1x2", ResultStatus::Red, 2.0, 0.06, day(14))]);

        let engine = AggregationEngine::new(&ds, &ReportFilter::default());
        assert_eq!(engine.rows().len(), 1);
        assert_eq!(engine.warnings().len(), 2);
        assert!(engine.warnings()[0].reason.contains("edge"));
        assert!(engine.warnings()[1].reason.contains("market_odd"));

        let edges = engine.report(ReportName::ByEdgeRange);
        assert!(edges.row(&[EDGE_OVERFLOW]).is_none());
        let odds = engine.report(ReportName::ByOddRange);
        assert!(odds.row(&[ODD_OVERFLOW]).is_none());
    }

    #[test]
    fn bucket_tables_use_exclusive_upper_bounds() {
        assert_eq!(odd_bucket(1.29).1, "<1.30");
        assert_eq!(odd_bucket(1.30).1, "1.30-1.49");
        assert_eq!(odd_bucket(1.99).1, "1.80-1.99");
        assert_eq!(odd_bucket(4.99).1, "3.00-4.99");
        assert_eq!(odd_bucket(5.0), (7, "5.00+"));
        assert_eq!(edge_bucket(0.0299).1, "<3%");
        assert_eq!(edge_bucket(0.03).1, "3-5%");
        assert_eq!(edge_bucket(0.10).1, "10-20%");
        assert_eq!(edge_bucket(0.75).1, "50%+");
    }

    #[test]
    fn odd_range_rows_follow_bucket_order() {
        let ds = dataset(vec![
            opp("1x2", ResultStatus::Green, 5.5, 0.06, day(14)),
            opp("1x2", ResultStatus::Red, 1.2, 0.06, day(14)),
            opp("1x2", ResultStatus::Green, 2.1, 0.06, day(14)),
        ]);
        let table = AggregationEngine::new(&ds, &ReportFilter::default()).report(ReportName::ByOddRange);
        let labels: Vec<&str> = table.rows.iter().map(|r| r.group[0].as_str()).collect();
        assert_eq!(labels, vec!["<1.30", "2.00-2.49", "5.00+"]);
    }

    #[test]
    fn daily_cumulative_profit_runs_forward_and_lists_latest_first() {
        let ds = dataset(vec![
            opp("1x2", ResultStatus::Green, 2.5, 0.06, day(12)),
            opp("1x2", ResultStatus::Red, 2.0, 0.06, day(13)),
            opp("1x2", ResultStatus::Red, 2.0, 0.06, day(14)),
        ]);
        let table = AggregationEngine::new(&ds, &ReportFilter::default()).report(ReportName::Daily);
        let summary: Vec<(String, Option<f64>)> = table
            .rows
            .iter()
            .map(|r| (r.group[0].clone(), r.cumulative_profit))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("2026-03-14".to_string(), Some(-0.5)),
                ("2026-03-13".to_string(), Some(0.5)),
                ("2026-03-12".to_string(), Some(1.5)),
            ]
        );
    }

    #[test]
    fn weekly_groups_by_monday() {
        // 2026-03-09 is a Monday.
        assert_eq!(week_start(day(15)), day(9));
        assert_eq!(week_start(day(9)), day(9));
        let ds = dataset(vec![
            opp("1x2", ResultStatus::Green, 2.0, 0.06, day(9)),
            opp("1x2", ResultStatus::Green, 2.0, 0.06, day(15)),
            opp("1x2", ResultStatus::Red, 2.0, 0.06, day(16)),
        ]);
        let table = AggregationEngine::new(&ds, &ReportFilter::default()).report(ReportName::Weekly);
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0].group, vec!["2026-03-16".to_string()]);
        assert_eq!(table.rows[1].stats.greens, 2);
    }

    #[test]
    fn missing_match_and_missing_odd_become_warnings() {
        let mut orphan = opp("1x2", ResultStatus::Green, 2.0, 0.06, day(14));
        orphan.match_id = 404;
        let mut no_odd = opp("1x2", ResultStatus::Green, 2.0, 0.06, day(14));
        no_odd.market_odd = None;
        let ds = dataset(vec![orphan, no_odd, opp("1x2", ResultStatus::Red, 2.0, 0.06, day(14))]);

        let engine = AggregationEngine::new(&ds, &ReportFilter::default());
        assert_eq!(engine.rows().len(), 1);
        assert_eq!(engine.warnings().len(), 2);
        assert!(engine.warnings()[0].reason.contains("missing match reference 404"));

        let relaxed = AggregationEngine::with_options(
            &ds,
            &ReportFilter::default(),
            EngineOptions {
                require_match_reference: false,
            },
        );
        assert_eq!(relaxed.rows().len(), 2);
    }

    #[test]
    fn filters_narrow_the_input() {
        let mut retro = opp("Over 2.5", ResultStatus::Green, 2.0, 0.06, day(14));
        retro.analysis_type = AnalysisType::Retroactive;
        let ds = dataset(vec![
            retro,
            opp("over 2.5", ResultStatus::Red, 2.0, 0.06, day(14)),
            opp("over 2.5", ResultStatus::Red, 2.0, 0.06, day(20)),
            opp("1x2", ResultStatus::Green, 2.0, 0.06, day(14)),
        ]);
        let filter = ReportFilter {
            market: Some("OVER 2.5".into()),
            to: Some(day(15)),
            analysis_type: Some(AnalysisType::PreMatch),
            ..Default::default()
        };
        let engine = AggregationEngine::new(&ds, &filter);
        assert_eq!(engine.rows().len(), 1);
        let set = engine.report_set(&filter, Utc::now());
        assert_eq!(set.tables.len(), ReportName::ALL.len());
        let summary = &set.table(ReportName::Summary).unwrap().rows[0].stats;
        assert_eq!(summary.reds, 1);
        assert_eq!(summary.hit_rate_pct, Some(0.0));
    }

    #[test]
    fn report_names_parse() {
        assert_eq!("by-odd-range".parse::<ReportName>().unwrap(), ReportName::ByOddRange);
        assert_eq!("Confidence_Market".parse::<ReportName>().unwrap(), ReportName::ConfidenceMarket);
        assert!("by_referee".parse::<ReportName>().is_err());
        for name in ReportName::ALL {
            assert_eq!(name.as_str().parse::<ReportName>().unwrap(), name);
        }
    }

    #[test]
    fn brief_renders_null_rates_as_na() {
        let ds = dataset(vec![opp("BTTS", ResultStatus::Pending, 1.9, 0.05, day(14))]);
        let filter = ReportFilter::default();
        let set = AggregationEngine::new(&ds, &filter).report_set(&filter, Utc::now());
        let brief = performance_brief(&set, "export-1");
        assert!(brief.contains("# Edgebook Performance Brief"));
        assert!(brief.contains("| 0 | 0 | 0 | 0 | 1 | n/a | 0.00 | n/a |"));
    }
}
