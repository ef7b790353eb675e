//! Removal of already-inlined critical rules from the main stylesheet.

use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

use crate::rules::{rule_key, scan_blocks};

/// Rules at or below this many bytes are never removed from the main stylesheet.
pub const DEFAULT_MIN_RULE_LEN: usize = 10;

const INTERACTIVE_MARKERS: &[&str] = &[
    ":hover",
    ":focus",
    ":active",
    ":visited",
    ":checked",
    ":nth-child",
    ":nth-of-type",
    ":first-child",
    ":last-child",
    ":first-of-type",
    ":last-of-type",
    ":only-child",
    "::before",
    "::after",
    "::placeholder",
    "::selection",
    "transition",
    "animation",
    "keyframes",
    "@media",
    "transform",
];

static BLANK_LINES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n\s*\n\s*\n").unwrap());

/// Whether a rule depends on interaction, animation or media state and must
/// stay in the eagerly loaded stylesheet even if it is also critical.
pub fn is_interactive_rule(rule: &str) -> bool {
    INTERACTIVE_MARKERS.iter().any(|marker| rule.contains(marker))
        || (rule.contains("opacity") && rule.contains("hover"))
}

/// Result of [`reduce_stylesheet`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reduction {
    /// The reduced stylesheet text.
    pub css: String,
    /// Number of blocks removed from the main stylesheet.
    pub removed: usize,
    /// Critical rules that were left in place because they are interactive.
    pub kept_interactive: usize,
    /// Critical rules too short to be eligible for removal.
    pub skipped_short: usize,
}

/// Remove from `main_css` every top-level block whose whitespace-normalized
/// text equals a non-interactive rule of `critical_css` longer than `min_len`.
///
/// Interactive blocks in the main stylesheet are never touched. The result is
/// never longer than the input.
pub fn reduce_stylesheet(main_css: &str, critical_css: &str, min_len: usize) -> Reduction {
    let mut removable = HashSet::new();
    let mut kept_interactive = 0;
    let mut skipped_short = 0;

    for block in scan_blocks(critical_css) {
        let rule = block.text.trim();
        if is_interactive_rule(rule) {
            kept_interactive += 1;
            continue;
        }
        if rule.len() <= min_len {
            skipped_short += 1;
            continue;
        }
        removable.insert(rule_key(rule));
    }

    let mut css = String::with_capacity(main_css.len());
    let mut cursor = 0;
    let mut removed = 0;

    for block in scan_blocks(main_css) {
        if is_interactive_rule(block.text) || !removable.contains(&rule_key(block.text)) {
            continue;
        }
        css.push_str(&main_css[cursor..block.start]);
        cursor = block.end;
        removed += 1;
    }
    css.push_str(&main_css[cursor..]);

    let css = if removed > 0 {
        BLANK_LINES.replace_all(&css, "\n\n").trim().to_string()
    } else {
        css
    };

    tracing::debug!(removed, kept_interactive, skipped_short, "reduced stylesheet");

    Reduction {
        css,
        removed,
        kept_interactive,
        skipped_short,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interactive_predicate() {
        assert!(is_interactive_rule(".btn:hover{color:red}"));
        assert!(is_interactive_rule(".a::before{content:''}"));
        assert!(is_interactive_rule("li:nth-child(2n){margin:0}"));
        assert!(is_interactive_rule(".fade{transition:opacity .2s}"));
        assert!(is_interactive_rule("@media (min-width:640px){.a{color:red}}"));
        assert!(is_interactive_rule("@keyframes spin{to{transform:rotate(1turn)}}"));
        assert!(is_interactive_rule(".card{opacity:1}.card-hover"));
        assert!(!is_interactive_rule(".container{max-width:1200px}"));
        assert!(!is_interactive_rule("body{opacity:1}"));
    }

    #[test]
    fn removes_matching_static_rules_only() {
        let main = ".container{max-width:1200px}\n.btn:hover{color:red}\n.footer{padding:2rem}";
        let critical = ".container{max-width:1200px}.btn:hover{color:red}";
        let reduction = reduce_stylesheet(main, critical, DEFAULT_MIN_RULE_LEN);

        assert_eq!(reduction.css, ".btn:hover{color:red}\n.footer{padding:2rem}");
        assert_eq!(reduction.removed, 1);
        assert_eq!(reduction.kept_interactive, 1);
    }

    #[test]
    fn matches_across_formatting_differences() {
        let main = ".container {\n  max-width: 1200px;\n  margin: 0 auto;\n}\n.x{color:red}";
        let critical = ".container{max-width:1200px;margin:0 auto}";
        let reduction = reduce_stylesheet(main, critical, DEFAULT_MIN_RULE_LEN);
        assert_eq!(reduction.css, ".x{color:red}");
    }

    #[test]
    fn short_rules_are_not_removed() {
        let main = "a{top:0}.b{color:red}";
        let reduction = reduce_stylesheet(main, "a{top:0}", DEFAULT_MIN_RULE_LEN);
        assert_eq!(reduction.css, main);
        assert_eq!(reduction.skipped_short, 1);
        assert_eq!(reduction.removed, 0);
    }

    #[test]
    fn does_not_match_inside_selector_lists() {
        let main = ".x,.container{max-width:1200px}";
        let reduction = reduce_stylesheet(main, ".container{max-width:1200px}", 10);
        assert_eq!(reduction.css, main);
    }

    #[test]
    fn media_blocks_stay_even_if_critical() {
        let main = "@media (min-width:640px){.grid{display:grid}}\n.grid{display:block}";
        let critical = "@media (min-width:640px){.grid{display:grid}}.grid{display:block}";
        let reduction = reduce_stylesheet(main, critical, DEFAULT_MIN_RULE_LEN);
        assert_eq!(reduction.css, "@media (min-width:640px){.grid{display:grid}}");
    }

    #[test]
    fn patterns_compile() {
        LazyLock::force(&BLANK_LINES);
    }
}
