//! Inspection of built HTML for critical CSS coverage.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::assets::html_path;
use crate::error::{PipelineError, Result};
use crate::inject::{is_build_asset, parse_attributes, LINK_TAG, NOSCRIPT};
use crate::model::Route;

static CRITICAL_STYLE_BODY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<style\b[^>]*\bdata-critical\b[^>]*>(.*?)</style\s*>").unwrap()
});
static FALLBACK_NOSCRIPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<noscript\b[^>]*\bdata-critical-fallback\b").unwrap());
static SIZE_HINT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<meta\b[^>]*\bname\s*=\s*["']?critical-css-size["']?[^>]*\bcontent\s*=\s*["']?(\d+)"#)
        .unwrap()
});

/// What one HTML document looks like with respect to critical CSS.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentAnalysis {
    /// Number of `<style data-critical>` elements.
    pub critical_styles: usize,
    /// Bytes of CSS inside them.
    pub critical_bytes: usize,
    /// `critical_bytes` as a percentage of the budget.
    pub budget_usage_percent: f64,
    /// Stylesheet links loaded through the preload-then-promote pattern.
    pub deferred_links: usize,
    /// Build-asset stylesheet links that still block rendering.
    pub blocking_links: usize,
    pub noscript_fallback: bool,
    /// Value of the `critical-css-size` meta hint.
    pub size_hint: Option<u64>,
}

impl DocumentAnalysis {
    pub fn has_critical_css(&self) -> bool {
        self.critical_styles > 0 && self.critical_bytes > 0
    }
}

/// Inspect one document against a critical CSS byte budget.
pub fn analyze_html(html: &str, budget_bytes: u64) -> DocumentAnalysis {
    let mut analysis = DocumentAnalysis::default();

    for caps in CRITICAL_STYLE_BODY.captures_iter(html) {
        analysis.critical_styles += 1;
        analysis.critical_bytes += caps.get(1).map_or(0, |m| m.as_str().len());
    }
    if budget_bytes > 0 {
        let usage = analysis.critical_bytes as f64 / budget_bytes as f64 * 100.0;
        analysis.budget_usage_percent = (usage * 10.0).round() / 10.0;
    }

    let noscript: Vec<_> = NOSCRIPT.find_iter(html).map(|m| m.range()).collect();
    for caps in LINK_TAG.captures_iter(html) {
        let start = caps.get(0).map_or(0, |m| m.start());
        if noscript.iter().any(|range| range.contains(&start)) {
            continue;
        }
        let attributes = parse_attributes(&caps[1]);
        let attr = |name: &str| {
            attributes
                .iter()
                .find(|(key, _)| key == name)
                .and_then(|(_, value)| value.as_deref())
        };
        let rel = attr("rel").unwrap_or_default().to_ascii_lowercase();
        let rel_has = |token: &str| rel.split_whitespace().any(|t| t == token);

        if (rel_has("preload") || rel_has("prefetch")) && attr("as") == Some("style") {
            analysis.deferred_links += 1;
        } else if rel_has("stylesheet") && attr("href").is_some_and(is_build_asset) {
            analysis.blocking_links += 1;
        }
    }

    analysis.noscript_fallback = FALLBACK_NOSCRIPT.is_match(html);
    analysis.size_hint = SIZE_HINT
        .captures(html)
        .and_then(|caps| caps[1].parse().ok());
    analysis
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recommendation {
    pub priority: Priority,
    pub route: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteAnalysis {
    pub route: String,
    pub path: PathBuf,
    #[serde(flatten)]
    pub document: DocumentAnalysis,
}

/// Coverage report over every route document in a build output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub generated_at: DateTime<Utc>,
    pub budget_bytes: u64,
    pub routes: Vec<RouteAnalysis>,
    pub recommendations: Vec<Recommendation>,
}

impl AnalysisReport {
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        out.push_str("Critical CSS analysis\n\n");
        for route in &self.routes {
            let doc = &route.document;
            let _ = writeln!(out, "{} ({})", route.route, route.path.display());
            if doc.has_critical_css() {
                let _ = writeln!(
                    out,
                    "  critical CSS:      {} style(s), {} bytes ({:.1}% of budget)",
                    doc.critical_styles, doc.critical_bytes, doc.budget_usage_percent
                );
            } else {
                out.push_str("  critical CSS:      missing\n");
            }
            let _ = writeln!(out, "  deferred links:    {}", doc.deferred_links);
            let _ = writeln!(out, "  blocking links:    {}", doc.blocking_links);
            let _ = writeln!(
                out,
                "  noscript fallback: {}",
                if doc.noscript_fallback { "yes" } else { "no" }
            );
        }

        if self.recommendations.is_empty() {
            out.push_str("\nNo recommendations.\n");
        } else {
            out.push_str("\nRecommendations:\n");
            for rec in &self.recommendations {
                let _ = writeln!(out, "  [{:?}] {}: {}", rec.priority, rec.route, rec.message);
            }
        }
        out
    }
}

fn recommend(route: &str, doc: &DocumentAnalysis, budget_bytes: u64) -> Vec<Recommendation> {
    let mut recs = Vec::new();
    let mut push = |priority, message: String| {
        recs.push(Recommendation {
            priority,
            route: route.to_string(),
            message,
        })
    };

    if !doc.has_critical_css() {
        push(
            Priority::High,
            "no critical CSS inlined; run `critical run` after building".into(),
        );
    } else if budget_bytes > 0 && doc.critical_bytes as u64 > budget_bytes {
        push(
            Priority::Medium,
            format!(
                "critical CSS is {} bytes, over the {budget_bytes} byte budget",
                doc.critical_bytes
            ),
        );
    }
    if doc.deferred_links > 0 && !doc.noscript_fallback {
        push(
            Priority::Low,
            "deferred stylesheets have no <noscript> fallback".into(),
        );
    }
    recs
}

/// Analyze the entry document and every other route document present in
/// `dist_dir`. The entry document must exist.
pub fn analyze_build(dist_dir: &Path, routes: &[Route], budget_bytes: u64) -> Result<AnalysisReport> {
    let mut ordered: Vec<Route> = vec![Route::new("/")];
    ordered.extend(routes.iter().filter(|route| !route.is_entry()).cloned());

    let mut analyses = Vec::new();
    let mut recommendations = Vec::new();
    for route in &ordered {
        let path = html_path(dist_dir, route);
        let html = match fs::read_to_string(&path) {
            Ok(html) => html,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                if route.is_entry() {
                    return Err(PipelineError::EntryHtmlMissing(path));
                }
                warn!(route = %route.path, path = %path.display(), "no HTML document for route");
                continue;
            }
            Err(err) => return Err(err.into()),
        };

        let document = analyze_html(&html, budget_bytes);
        recommendations.extend(recommend(&route.path, &document, budget_bytes));
        analyses.push(RouteAnalysis {
            route: route.path.clone(),
            path,
            document,
        });
    }
    recommendations.sort_by_key(|rec| rec.priority);

    Ok(AnalysisReport {
        generated_at: Utc::now(),
        budget_bytes,
        routes: analyses,
        recommendations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inject::inject_critical;

    const PAGE: &str = "<html><head><title>x</title>\
        <link rel=\"stylesheet\" href=\"/assets/index.css\"></head><body></body></html>";

    #[test]
    fn test_analyze_plain_build() {
        let doc = analyze_html(PAGE, 14_000);
        assert!(!doc.has_critical_css());
        assert_eq!(doc.blocking_links, 1);
        assert_eq!(doc.deferred_links, 0);
        assert!(!doc.noscript_fallback);
        assert_eq!(doc.size_hint, None);

        let recs = recommend("/", &doc, 14_000);
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].priority, Priority::High);
    }

    #[test]
    fn test_analyze_injected_document() {
        let css = "body{margin:0}";
        let (html, _) = inject_critical(PAGE, css, "bm9uY2U=").unwrap();
        let doc = analyze_html(&html, 28);

        assert_eq!(doc.critical_styles, 1);
        assert_eq!(doc.critical_bytes, css.len());
        assert_eq!(doc.budget_usage_percent, 50.0);
        assert_eq!(doc.deferred_links, 1);
        assert_eq!(doc.blocking_links, 0);
        assert!(doc.noscript_fallback);
        assert_eq!(doc.size_hint, Some(css.len() as u64));
        assert!(recommend("/", &doc, 28).is_empty());
    }

    #[test]
    fn test_over_budget_and_missing_fallback() {
        let html = "<head><style data-critical>.a{color:red}.b{color:blue}</style>\
            <link rel=\"preload\" as=\"style\" href=\"/assets/a.css\"></head>";
        let doc = analyze_html(html, 10);
        let priorities: Vec<_> = recommend("/about", &doc, 10)
            .into_iter()
            .map(|rec| rec.priority)
            .collect();
        assert_eq!(priorities, vec![Priority::Medium, Priority::Low]);
    }

    #[test]
    fn test_analyze_build_requires_entry() {
        let dir = tempfile::tempdir().unwrap();
        let err = analyze_build(dir.path(), &[Route::new("/about")], 14_000).unwrap_err();
        assert!(matches!(err, PipelineError::EntryHtmlMissing(_)));

        fs::write(dir.path().join("index.html"), PAGE).unwrap();
        let report = analyze_build(dir.path(), &[Route::new("/about")], 14_000).unwrap();
        assert_eq!(report.routes.len(), 1);
        assert_eq!(report.routes[0].route, "/");
        assert!(report.render_text().contains("critical CSS:      missing"));
    }

    #[test]
    fn test_patterns_compile() {
        LazyLock::force(&CRITICAL_STYLE_BODY);
        LazyLock::force(&FALLBACK_NOSCRIPT);
        LazyLock::force(&SIZE_HINT);
    }
}
