//! Inlining critical CSS into built HTML.
//!
//! The transformation is text-level and re-runnable: every element this
//! module adds carries a marker (`data-critical`, `data-critical-csp`,
//! `data-critical-fallback`, `name="critical-css-size"`) and is removed before
//! a new injection, together with the whitespace inserted in front of it.

use std::fmt::Write as _;
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::RngCore;
use regex::{Captures, Regex};
use serde::Serialize;
use tracing::{info, warn};

use crate::assets::html_path;
use crate::error::{PipelineError, Result};
use crate::fs::write_atomic;
use crate::model::Route;

pub(crate) static CRITICAL_STYLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)\s*<style\b[^>]*\bdata-critical\b[^>]*>.*?</style\s*>").unwrap()
});
static CSP_MARKER_META: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\s*<meta\b[^>]*\bdata-critical-csp\b[^>]*>").unwrap());
static SIZE_META: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\s*<meta\b[^>]*\bname\s*=\s*["']?critical-css-size\b[^>]*>"#).unwrap()
});
static CSP_META: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<meta\b[^>]*\bhttp-equiv\s*=\s*["']?content-security-policy\b[^>]*>"#)
        .unwrap()
});
static HEAD_CLOSE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)</head\s*>").unwrap());
static TITLE_OPEN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)<title\b").unwrap());
pub(crate) static NOSCRIPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<noscript\b[^>]*>.*?</noscript\s*>").unwrap());
pub(crate) static LINK_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<link\b([^>]*?)\s*/?>").unwrap());
static ATTRIBUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([A-Za-z_:][-A-Za-z0-9_:.]*)(?:\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'=<>`]+)))?"#)
        .unwrap()
});
static STYLE_CLOSE_IN_CSS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)</style").unwrap());

/// Promotes a deferred link to a stylesheet once, then detaches itself.
const PROMOTE_ONLOAD: &str = "this.rel='stylesheet';this.onload=null;";

/// Failures of the pure markup transformation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MarkupError {
    #[error("document has no </head>")]
    MissingHead,
}

/// What one injection changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InjectStats {
    /// A previously injected critical style was replaced.
    pub replaced_previous: bool,
    /// Stylesheet links converted to the deferred pattern.
    pub links_deferred: usize,
    /// A CSP meta was added (none was present).
    pub csp_added: bool,
    /// Bytes of CSS inlined.
    pub inlined_bytes: usize,
}

/// A fresh CSP nonce: 16 random bytes, base64.
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    STANDARD.encode(bytes)
}

/// Inline `css` into `html` under `nonce`.
///
/// Removes earlier injections, rewrites stylesheet links to build assets into
/// deferred links with a `<noscript>` fallback, adds a CSP meta allowing the
/// nonce unless the document already has a CSP, and inserts a size hint and
/// the `<style data-critical>` element right before `</head>`.
pub fn inject_critical(
    html: &str,
    css: &str,
    nonce: &str,
) -> std::result::Result<(String, InjectStats), MarkupError> {
    let mut stats = InjectStats {
        inlined_bytes: css.len(),
        ..InjectStats::default()
    };

    stats.replaced_previous = CRITICAL_STYLE.is_match(html);
    let html = CRITICAL_STYLE.replace_all(html, "");
    let html = CSP_MARKER_META.replace_all(&html, "");
    let html = SIZE_META.replace_all(&html, "");

    if !HEAD_CLOSE.is_match(&html) {
        return Err(MarkupError::MissingHead);
    }

    let (mut html, deferred) = defer_stylesheet_links(&html);
    stats.links_deferred = deferred;

    let mut head_block = String::new();
    if !CSP_META.is_match(&html) {
        let csp = csp_meta(nonce);
        stats.csp_added = true;
        match TITLE_OPEN.find(&html).map(|m| m.start()) {
            Some(title) if HEAD_CLOSE.find(&html).is_some_and(|head| title < head.start()) => {
                let insert_at = html[..title].trim_end().len();
                let indent = html[insert_at..title].to_string();
                html.insert_str(insert_at, &format!("{indent}{csp}"));
            }
            _ => head_block.push_str(&format!("\n  {csp}")),
        }
    }

    let _ = write!(
        head_block,
        "\n  <meta name=\"critical-css-size\" content=\"{}\">\n  <style data-critical nonce=\"{}\">{}</style>",
        css.len(),
        nonce,
        STYLE_CLOSE_IN_CSS.replace_all(css, "<\\/style"),
    );

    let head_close = HEAD_CLOSE
        .find(&html)
        .map(|m| m.start())
        .ok_or(MarkupError::MissingHead)?;
    let insert_at = html[..head_close].trim_end().len();
    html.insert_str(insert_at, &head_block);

    Ok((html, stats))
}

fn csp_meta(nonce: &str) -> String {
    format!(
        "<meta http-equiv=\"Content-Security-Policy\" content=\"style-src 'self' 'nonce-{nonce}' 'unsafe-inline';\" data-critical-csp>"
    )
}

pub(crate) fn parse_attributes(inner: &str) -> Vec<(String, Option<String>)> {
    ATTRIBUTE
        .captures_iter(inner)
        .map(|caps| {
            let name = caps[1].to_ascii_lowercase();
            let value = caps
                .get(2)
                .or_else(|| caps.get(3))
                .or_else(|| caps.get(4))
                .map(|m| m.as_str().to_string());
            (name, value)
        })
        .collect()
}

/// A same-origin stylesheet from the build output: relative or root-relative
/// href ending in `.css` (ignoring query and fragment).
pub(crate) fn is_build_asset(href: &str) -> bool {
    let path = href.split(['?', '#']).next().unwrap_or(href);
    let external = href.starts_with("//") || href.contains("://") || href.starts_with("data:");
    !external && path.to_ascii_lowercase().ends_with(".css")
}

fn defer_stylesheet_links(html: &str) -> (String, usize) {
    let noscript: Vec<Range<usize>> = NOSCRIPT.find_iter(html).map(|m| m.range()).collect();
    let mut deferred = 0;

    let out = LINK_TAG.replace_all(html, |caps: &Captures| {
        let whole = caps.get(0).map_or(0..0, |m| m.range());
        let original = &html[whole.clone()];
        if noscript.iter().any(|range| range.contains(&whole.start)) {
            return original.to_string();
        }

        let attributes = parse_attributes(&caps[1]);
        let attr = |name: &str| {
            attributes
                .iter()
                .find(|(key, _)| key == name)
                .and_then(|(_, value)| value.as_deref())
        };
        let is_stylesheet = attr("rel").is_some_and(|rel| {
            rel.split_whitespace()
                .any(|token| token.eq_ignore_ascii_case("stylesheet"))
        });
        let Some(href) = attr("href") else {
            return original.to_string();
        };
        if !is_stylesheet || !is_build_asset(href) {
            return original.to_string();
        }

        let mut passthrough = String::new();
        for (name, value) in &attributes {
            if matches!(name.as_str(), "rel" | "href" | "as" | "onload") {
                continue;
            }
            match value {
                Some(value) => {
                    let _ = write!(passthrough, " {name}=\"{}\"", value.replace('"', "&quot;"));
                }
                None => {
                    let _ = write!(passthrough, " {name}");
                }
            }
        }

        deferred += 1;
        format!(
            "<link rel=\"preload\" href=\"{href}\" as=\"style\"{passthrough} onload=\"{PROMOTE_ONLOAD}\">\
             <noscript data-critical-fallback><link rel=\"stylesheet\" href=\"{href}\"{passthrough}></noscript>"
        )
    });

    (out.into_owned(), deferred)
}

/// Per-document result of [`HtmlInjector::inject_routes`].
#[derive(Debug, Clone, Serialize)]
pub struct InjectedDocument {
    pub route: String,
    pub path: PathBuf,
    pub stats: InjectStats,
}

/// Applies [`inject_critical`] to files in the build output.
pub struct HtmlInjector {
    dist_dir: PathBuf,
}

impl HtmlInjector {
    pub fn new(dist_dir: impl Into<PathBuf>) -> Self {
        Self {
            dist_dir: dist_dir.into(),
        }
    }

    /// Rewrite one HTML file in place with a fresh nonce.
    ///
    /// The file is read whole, transformed in memory and replaced atomically.
    pub fn inject(&self, path: &Path, css: &str) -> Result<InjectStats> {
        let html = match fs::read_to_string(path) {
            Ok(html) => html,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(PipelineError::EntryHtmlMissing(path.to_path_buf()))
            }
            Err(err) => {
                return Err(PipelineError::Injection {
                    path: path.to_path_buf(),
                    reason: err.to_string(),
                })
            }
        };

        let nonce = generate_nonce();
        let (html, stats) =
            inject_critical(&html, css, &nonce).map_err(|err| PipelineError::Injection {
                path: path.to_path_buf(),
                reason: err.to_string(),
            })?;

        write_atomic(path, html.as_bytes()).map_err(|err| PipelineError::Injection {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;

        info!(
            path = %path.display(),
            bytes = stats.inlined_bytes,
            links_deferred = stats.links_deferred,
            replaced = stats.replaced_previous,
            "injected critical CSS"
        );
        Ok(stats)
    }

    /// Inject into the entry document (required) and every other route's
    /// document that exists. Missing non-entry documents are skipped.
    pub fn inject_routes(&self, routes: &[Route], css: &str) -> Result<Vec<InjectedDocument>> {
        let entry = Route::new("/");
        let entry_path = html_path(&self.dist_dir, &entry);
        let mut documents = vec![InjectedDocument {
            route: entry.path.clone(),
            stats: self.inject(&entry_path, css)?,
            path: entry_path,
        }];

        for route in routes.iter().filter(|route| !route.is_entry()) {
            let path = html_path(&self.dist_dir, route);
            if !path.is_file() {
                warn!(route = %route.path, path = %path.display(), "no HTML document for route, skipping");
                continue;
            }
            let stats = self.inject(&path, css)?;
            documents.push(InjectedDocument {
                route: route.path.clone(),
                path,
                stats,
            });
        }
        Ok(documents)
    }
}
