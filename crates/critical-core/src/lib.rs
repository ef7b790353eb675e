//! Critical CSS Pipeline
//!
//! Extracts above-the-fold CSS for every route and viewport of a built
//! static site, inlines it into the HTML, defers the full stylesheet and
//! trims the inlined rules from it. [`CriticalPipeline`] sequences the stages
//! and guarantees the preview server is stopped on every exit path.

pub mod analyze;
pub mod assets;
pub mod build;
pub mod combine;
pub mod config;
pub mod error;
pub mod extract;
pub mod fs;
pub mod inject;
pub mod inspect;
pub mod metrics;
pub mod model;
pub mod obs;
pub mod pipeline;
pub mod reduce;
pub mod state;
pub mod telemetry;

pub use analyze::{analyze_build, analyze_html, AnalysisReport, Priority, Recommendation};
pub use combine::{combine_fragments, CombinedCritical, Combiner};
pub use config::{PipelineConfig, COMBINED_FILE_NAME, CONFIG_FILE_NAME};
pub use error::{PipelineError, Result};
pub use extract::{CommandEngine, ChromeEngine, CriticalEngine, CriticalExtractor, ExtractRequest};
pub use inject::{inject_critical, HtmlInjector};
pub use metrics::{write_report_json, PerformanceMetrics, PerformanceReport};
pub use model::{default_routes, default_viewports, CriticalFragment, Route, Viewport};
pub use pipeline::{CriticalPipeline, PipelineOutcome, RunMode, RunSummary};
pub use state::PipelineState;
pub use telemetry::init_tracing;
