//! Merging fragments into one critical stylesheet.

use std::collections::HashMap;
use std::fs;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{PipelineError, Result};
use crate::fs::ScratchDir;
use crate::model::{combinations, fragment_key, CriticalFragment, Route, Viewport};

/// Where the combined fragments came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CombineSource {
    Memory,
    Scratch,
}

/// The deduplicated, minified critical stylesheet of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CombinedCritical {
    pub css: String,
    pub fragments: usize,
    pub source: CombineSource,
}

impl CombinedCritical {
    pub fn size(&self) -> usize {
        self.css.len()
    }
}

/// Concatenate `texts`, keep the first copy of every rule, then minify.
pub fn combine_texts<'a, I>(texts: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let joined = texts.into_iter().collect::<Vec<_>>().join("\n");
    critical_css::minify_css(&critical_css::dedupe_rules(&joined))
}

/// Combine fragments in the order given.
pub fn combine_fragments(fragments: &[CriticalFragment]) -> String {
    combine_texts(fragments.iter().map(|fragment| fragment.css.as_str()))
}

/// Combines fragments from memory, or from the scratch directory when there
/// are none in memory, and persists the result.
///
/// Fragments are ordered route-major by the configured routes and viewports
/// whichever source they come from, so both sources give identical output
/// for identical fragment contents. Scratch files matching no configured
/// combination come last, by file name.
pub struct Combiner {
    scratch: ScratchDir,
    order: HashMap<String, usize>,
}

impl Combiner {
    pub fn new(scratch: ScratchDir, routes: &[Route], viewports: &[Viewport]) -> Self {
        let order = combinations(routes, viewports)
            .enumerate()
            .map(|(index, (route, viewport))| (fragment_key(route, viewport), index))
            .collect();
        Self { scratch, order }
    }

    fn rank(&self, key: &str) -> (usize, String) {
        (
            self.order.get(key).copied().unwrap_or(usize::MAX),
            key.to_string(),
        )
    }

    pub fn combine(&self, fragments: &[CriticalFragment]) -> Result<CombinedCritical> {
        if fragments.is_empty() {
            info!("no fragments in memory, reading scratch directory");
            return self.combine_from_scratch();
        }

        let mut ordered: Vec<&CriticalFragment> = fragments.iter().collect();
        ordered.sort_by_key(|fragment| self.rank(&fragment.key));
        let css = combine_texts(ordered.iter().map(|fragment| fragment.css.as_str()));
        self.finish(css, fragments.len(), CombineSource::Memory)
    }

    /// Combine the fragment files left in the scratch directory.
    pub fn combine_from_scratch(&self) -> Result<CombinedCritical> {
        let mut texts = Vec::new();
        for path in self.scratch.fragment_files()? {
            let key = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default();
            match fs::read_to_string(&path) {
                Ok(text) if !text.trim().is_empty() => texts.push((self.rank(&key), text)),
                Ok(_) => warn!(path = %path.display(), "skipping empty fragment file"),
                Err(err) => warn!(path = %path.display(), error = %err, "failed to read fragment file"),
            }
        }
        texts.sort_by(|a, b| a.0.cmp(&b.0));

        let count = texts.len();
        let css = combine_texts(texts.iter().map(|(_, text)| text.as_str()));
        self.finish(css, count, CombineSource::Scratch)
    }

    fn finish(&self, css: String, fragments: usize, source: CombineSource) -> Result<CombinedCritical> {
        if css.is_empty() {
            return Err(PipelineError::Combine(format!(
                "no critical CSS to combine ({fragments} fragments, source {source:?})"
            )));
        }
        let path = self.scratch.write_combined(&css)?;
        info!(
            bytes = css.len(),
            fragments,
            ?source,
            path = %path.display(),
            "combined critical CSS"
        );
        Ok(CombinedCritical {
            css,
            fragments,
            source,
        })
    }
}
