//! Critical CSS text engine
//!
//! String-in, string-out utilities shared by the critical CSS pipeline:
//! - [`sanitize_css`] strips script-capable constructs from extracted CSS
//! - [`scan_blocks`] / [`extract_rules`] split a stylesheet into top-level rules
//! - [`dedupe_rules`] keeps the first occurrence of every distinct rule
//! - [`strip_declarations`] drops unwanted properties from a rule
//! - [`minify_css`] collapses whitespace and comments
//! - [`reduce_stylesheet`] removes critical rules from the main stylesheet while
//!   keeping interaction-dependent rules eagerly available
//!
//! This is not a CSS parser. Rules are found with a brace-depth scanner that
//! understands strings and comments but nothing else; results are an
//! approximation of the stylesheet's structure.

pub mod minify;
pub mod reduce;
pub mod rules;
pub mod sanitize;

pub use minify::minify_css;
pub use reduce::{is_interactive_rule, reduce_stylesheet, Reduction, DEFAULT_MIN_RULE_LEN};
pub use rules::{
    dedupe_rules, extract_rules, rule_key, scan_blocks, strip_declarations, BlockKind, CssBlock,
};
pub use sanitize::sanitize_css;
