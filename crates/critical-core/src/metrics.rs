//! Per-run size and timing counters, and the performance impact report
//! rendered from them.

use std::fmt::Write as _;
use std::path::Path;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::BudgetConfig;
use crate::error::Result;
use crate::fs::write_atomic;

pub const REPORT_SCHEMA_VERSION: &str = "1.0.0";

/// Rough gzip ratio for minified CSS.
const GZIP_RATIO: f64 = 0.3;
const SLOW_3G_KBPS: f64 = 400.0;
const FAST_4G_KBPS: f64 = 1600.0;

/// Counters of one pipeline run. Each size is recorded once, by the stage
/// that produces it, and read when the report is built.
#[derive(Debug, Clone)]
pub struct PerformanceMetrics {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    start: Instant,
    pub routes: usize,
    pub viewports: usize,
    pub original_css_size: u64,
    pub critical_css_size: u64,
    pub reduced_main_css_size: u64,
    pub extracted: usize,
    pub skipped: usize,
}

impl PerformanceMetrics {
    pub fn new(run_id: impl Into<String>, routes: usize, viewports: usize) -> Self {
        Self {
            run_id: run_id.into(),
            started_at: Utc::now(),
            start: Instant::now(),
            routes,
            viewports,
            original_css_size: 0,
            critical_css_size: 0,
            reduced_main_css_size: 0,
            extracted: 0,
            skipped: 0,
        }
    }

    pub fn record_original(&mut self, bytes: u64) {
        self.original_css_size = bytes;
        tracing::debug!(metric = "original_css_size", bytes);
    }

    pub fn record_critical(&mut self, bytes: u64) {
        self.critical_css_size = bytes;
        tracing::debug!(metric = "critical_css_size", bytes);
    }

    pub fn record_reduced(&mut self, bytes: u64) {
        self.reduced_main_css_size = bytes;
        tracing::debug!(metric = "reduced_main_css_size", bytes);
    }

    pub fn record_extraction(&mut self, extracted: bool) {
        if extracted {
            self.extracted += 1;
        } else {
            self.skipped += 1;
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// Where the critical CSS stands against the configured budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetStatus {
    Within,
    Warning,
    Exceeded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetReport {
    pub max_bytes: u64,
    /// Critical CSS size as a percentage of `max_bytes`.
    pub utilisation_percent: f64,
    pub status: BudgetStatus,
}

impl BudgetReport {
    pub fn evaluate(bytes: u64, budget: &BudgetConfig) -> Self {
        let utilisation = if budget.max_critical_bytes == 0 {
            0.0
        } else {
            bytes as f64 / budget.max_critical_bytes as f64
        };
        let status = if utilisation > 1.0 {
            BudgetStatus::Exceeded
        } else if utilisation > budget.warning_threshold {
            BudgetStatus::Warning
        } else {
            BudgetStatus::Within
        };
        Self {
            max_bytes: budget.max_critical_bytes,
            utilisation_percent: round2(utilisation * 100.0),
            status,
        }
    }
}

/// Estimated time to download the critical CSS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadEstimate {
    pub slow_3g_ms: u64,
    pub fast_4g_ms: u64,
}

impl DownloadEstimate {
    pub fn for_bytes(bytes: u64) -> Self {
        Self {
            slow_3g_ms: transfer_ms(bytes, SLOW_3G_KBPS),
            fast_4g_ms: transfer_ms(bytes, FAST_4G_KBPS),
        }
    }
}

fn transfer_ms(bytes: u64, kbps: f64) -> u64 {
    let bytes_per_sec = kbps * 1024.0 / 8.0;
    (bytes as f64 / bytes_per_sec * 1000.0).round() as u64
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn kb(bytes: u64) -> f64 {
    round2(bytes as f64 / 1024.0)
}

/// Performance impact summary of one run, persisted as JSON and printed as text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub schema_version: String,
    pub run_id: String,
    pub generated_at: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub routes: usize,
    pub viewports: usize,
    pub extracted: usize,
    pub skipped: usize,
    pub original_css_bytes: u64,
    pub critical_css_bytes: u64,
    pub reduced_main_css_bytes: u64,
    pub gzip_estimate_bytes: u64,
    pub budget: BudgetReport,
    pub download: DownloadEstimate,
    /// Hex SHA-256 of the combined critical CSS.
    pub critical_css_sha256: Option<String>,
}

impl PerformanceReport {
    pub fn from_metrics(
        metrics: &PerformanceMetrics,
        budget: &BudgetConfig,
        critical_css: Option<&str>,
    ) -> Self {
        let critical = metrics.critical_css_size;
        Self {
            schema_version: REPORT_SCHEMA_VERSION.to_string(),
            run_id: metrics.run_id.clone(),
            generated_at: Utc::now(),
            elapsed_secs: round2(metrics.elapsed_ms() as f64 / 1000.0),
            routes: metrics.routes,
            viewports: metrics.viewports,
            extracted: metrics.extracted,
            skipped: metrics.skipped,
            original_css_bytes: metrics.original_css_size,
            critical_css_bytes: critical,
            reduced_main_css_bytes: metrics.reduced_main_css_size,
            gzip_estimate_bytes: (critical as f64 * GZIP_RATIO).round() as u64,
            budget: BudgetReport::evaluate(critical, budget),
            download: DownloadEstimate::for_bytes(critical),
            critical_css_sha256: critical_css.map(sha256_hex),
        }
    }

    /// Bytes removed from the main stylesheet.
    pub fn saved_bytes(&self) -> u64 {
        self.original_css_bytes
            .saturating_sub(self.reduced_main_css_bytes)
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        out.push_str("Critical CSS performance report\n\n");
        let _ = writeln!(out, "Run:                 {}", self.run_id);
        let _ = writeln!(
            out,
            "Routes x viewports:  {} x {} ({} extracted, {} skipped)",
            self.routes, self.viewports, self.extracted, self.skipped
        );
        let _ = writeln!(out, "Elapsed:             {:.2}s\n", self.elapsed_secs);

        let _ = writeln!(out, "Original CSS:        {:.2} KB", kb(self.original_css_bytes));
        let _ = writeln!(
            out,
            "Critical CSS:        {:.2} KB (~{:.2} KB gzipped)",
            kb(self.critical_css_bytes),
            kb(self.gzip_estimate_bytes)
        );
        let _ = writeln!(
            out,
            "Reduced main CSS:    {:.2} KB ({:.2} KB saved)",
            kb(self.reduced_main_css_bytes),
            kb(self.saved_bytes())
        );

        let _ = writeln!(
            out,
            "Budget:              {:.1}% of {} bytes",
            self.budget.utilisation_percent, self.budget.max_bytes
        );
        match self.budget.status {
            BudgetStatus::Within => {}
            BudgetStatus::Warning => out.push_str("  warning: critical CSS is close to its budget\n"),
            BudgetStatus::Exceeded => out.push_str("  warning: critical CSS exceeds its budget\n"),
        }

        let _ = writeln!(
            out,
            "Download estimate:   {} ms on 3G, {} ms on 4G",
            self.download.slow_3g_ms, self.download.fast_4g_ms
        );
        if let Some(digest) = &self.critical_css_sha256 {
            let _ = writeln!(out, "SHA-256:             {digest}");
        }
        out
    }
}

pub fn sha256_hex(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Write the report as pretty JSON.
pub fn write_report_json(path: &Path, report: &PerformanceReport) -> Result<()> {
    let content = serde_json::to_string_pretty(report)?;
    write_atomic(path, content.as_bytes())
}
