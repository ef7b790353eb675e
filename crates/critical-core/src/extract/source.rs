//! Mapping rules selected in the browser back to the stylesheet source.
//!
//! The page reports where each kept rule sits in its CSSOM instead of the
//! browser's serialization of it, and the text is sliced out of the original
//! stylesheet. Critical rules then stay comparable with the main stylesheet
//! during reduction.

use critical_css::{scan_blocks, strip_declarations, BlockKind, CssBlock};
use serde::Deserialize;
use tracing::debug;

/// One rule the page kept, addressed by its index in the parent rule list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SelectedRule {
    pub index: usize,
    /// `selectorText` of a style rule, or the at-keyword (`@media`,
    /// `@supports`, `@font-face`) of any other rule.
    pub selector: String,
    /// Kept children of a grouping rule.
    #[serde(default)]
    pub inner: Option<Vec<SelectedRule>>,
}

/// Source text of every selected rule, in selection order, with
/// `drop_properties` removed from style rules.
///
/// A selection whose index does not line up with the source (the browser
/// drops rules it cannot parse) is looked up by selector instead, and skipped
/// when no source rule matches.
pub fn source_rules(css: &str, selected: &[SelectedRule], drop_properties: &[String]) -> Vec<String> {
    let blocks: Vec<CssBlock<'_>> = scan_blocks(css)
        .into_iter()
        .filter(|block| block.kind != BlockKind::Statement)
        .collect();

    let mut rules = Vec::new();
    for pick in selected {
        let Some(block) = locate(&blocks, pick) else {
            debug!(index = pick.index, selector = %pick.selector, "selected rule not found in source");
            continue;
        };
        match &pick.inner {
            Some(inner) => {
                let children = block_body(block.text)
                    .map(|body| source_rules(body, inner, drop_properties))
                    .unwrap_or_default();
                if !children.is_empty() {
                    rules.push(format!("{}{{{}}}", block.prelude, children.concat()));
                }
            }
            None if block.kind == BlockKind::Rule => {
                rules.extend(strip_declarations(block.text, drop_properties));
            }
            None => rules.push(block.text.to_string()),
        }
    }
    rules
}

fn locate<'a>(blocks: &[CssBlock<'a>], pick: &SelectedRule) -> Option<CssBlock<'a>> {
    let wanted = selector_key(&pick.selector);
    let matches = |block: &CssBlock<'a>| {
        let prelude = selector_key(block.prelude);
        if wanted.starts_with('@') {
            prelude.starts_with(&wanted)
        } else {
            prelude == wanted
        }
    };

    blocks
        .get(pick.index)
        .filter(|block| matches(*block))
        .or_else(|| blocks.iter().find(|block| matches(*block)))
        .copied()
}

/// Selector text with the browser's normalizations undone: whitespace and
/// quotes removed, case folded, `::before` and `:before` made equal.
fn selector_key(selector: &str) -> String {
    selector
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '"' && *c != '\'')
        .flat_map(char::to_lowercase)
        .collect::<String>()
        .replace("::", ":")
}

fn block_body(text: &str) -> Option<&str> {
    let open = text.find('{')?;
    let close = text.rfind('}')?;
    (open < close).then(|| &text[open + 1..close])
}

#[cfg(test)]
mod tests {
    use super::*;
    use critical_css::reduce_stylesheet;

    const MAIN: &str = ".container{max-width:1200px;margin:0 auto}
.footer{padding:2rem;background:#222}
.card,.tile{opacity:.9;border:1px solid #eee}
input[type=text]{border:0}
@media (min-width: 640px){.container{padding:0 1rem}.footer{display:none}}
";

    fn picks(json: &str) -> Vec<SelectedRule> {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_selected_rules_use_source_text() {
        // selectors as Chrome serializes them
        let selected = picks(
            r#"[
                {"index": 0, "selector": ".container"},
                {"index": 2, "selector": ".card, .tile"},
                {"index": 3, "selector": "input[type=\"text\"]"},
                {"index": 4, "selector": "@media", "inner": [{"index": 0, "selector": ".container"}]}
            ]"#,
        );
        let rules = source_rules(MAIN, &selected, &[]);
        assert_eq!(
            rules,
            vec![
                ".container{max-width:1200px;margin:0 auto}",
                ".card,.tile{opacity:.9;border:1px solid #eee}",
                "input[type=text]{border:0}",
                "@media (min-width: 640px){.container{padding:0 1rem}}",
            ]
        );
    }

    #[test]
    fn test_browser_selection_reduces_main_stylesheet() {
        let selected = picks(
            r#"[
                {"index": 0, "selector": ".container"},
                {"index": 1, "selector": ".footer"},
                {"index": 2, "selector": ".card, .tile"}
            ]"#,
        );
        let critical = source_rules(MAIN, &selected, &[]).join("\n");
        let reduction = reduce_stylesheet(MAIN, &critical, 10);

        assert_eq!(reduction.removed, 3);
        assert!(!reduction.css.contains(".footer{padding"));
        assert!(reduction.css.contains("input[type=text]{border:0}"));
        assert!(reduction.css.contains("@media (min-width: 640px)"));
    }

    #[test]
    fn test_misaligned_index_falls_back_to_selector() {
        // the browser drops the rule with the unknown pseudo-class
        let css = "a:nope{color:red}\n.a{color:blue}\n.b{margin:0}";
        let selected = picks(r#"[{"index": 1, "selector": ".b"}, {"index": 7, "selector": ".gone"}]"#);
        assert_eq!(source_rules(css, &selected, &[]), vec![".b{margin:0}"]);
    }

    #[test]
    fn test_dropped_properties_removed_from_source() {
        let css = ".nav{display:flex;transition:opacity .3s}\n.fade{transition:all 1s}\n@font-face{font-family:X;src:url(x.woff2)}";
        let selected = picks(
            r#"[
                {"index": 0, "selector": ".nav"},
                {"index": 1, "selector": ".fade"},
                {"index": 2, "selector": "@font-face"}
            ]"#,
        );
        let rules = source_rules(css, &selected, &["transition".to_string()]);
        assert_eq!(
            rules,
            vec![".nav{display:flex}", "@font-face{font-family:X;src:url(x.woff2)}"]
        );
    }
}
