//! Top-level rule scanning and rule-granularity deduplication.

use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

use crate::minify::minify_css;

/// What a top-level block looks like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// `selector { declarations }`
    Rule,
    /// `@media ... { ... }`, `@font-face { ... }`, `@keyframes ... { ... }`
    AtRule,
    /// A brace-less statement terminated by `;` (`@charset "utf-8";`)
    Statement,
}

/// One top-level block of a stylesheet, borrowed from the scanned text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CssBlock<'a> {
    pub kind: BlockKind,
    /// Byte offset of the first character of the block.
    pub start: usize,
    /// Byte offset one past the closing `}` or `;`.
    pub end: usize,
    /// Full block text, selector/prelude included.
    pub text: &'a str,
    /// Selector list or at-rule prelude, trimmed.
    pub prelude: &'a str,
}

/// Split `css` into top-level blocks.
///
/// Braces inside strings and comments are ignored; nested blocks stay inside
/// their parent. Unterminated trailing text and stray `}` are dropped.
pub fn scan_blocks(css: &str) -> Vec<CssBlock<'_>> {
    let bytes = css.as_bytes();
    let mut blocks = Vec::new();
    let mut depth = 0usize;
    let mut start: Option<usize> = None;
    let mut prelude_end: Option<usize> = None;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];

        if b == b'/' && bytes.get(i + 1) == Some(&b'*') {
            i = match css[i + 2..].find("*/") {
                Some(offset) => i + 2 + offset + 2,
                None => bytes.len(),
            };
            continue;
        }

        match b {
            b'"' | b'\'' => {
                start.get_or_insert(i);
                i = skip_string(bytes, i);
                continue;
            }
            b'{' => {
                start.get_or_insert(i);
                if depth == 0 {
                    prelude_end = Some(i);
                }
                depth += 1;
            }
            b'}' => {
                if depth == 0 {
                    start = None;
                } else {
                    depth -= 1;
                    if depth == 0 {
                        if let Some(s) = start.take() {
                            let prelude = css[s..prelude_end.unwrap_or(s)].trim();
                            let kind = if prelude.starts_with('@') {
                                BlockKind::AtRule
                            } else {
                                BlockKind::Rule
                            };
                            blocks.push(CssBlock {
                                kind,
                                start: s,
                                end: i + 1,
                                text: &css[s..i + 1],
                                prelude,
                            });
                        }
                        prelude_end = None;
                    }
                }
            }
            b';' if depth == 0 => {
                if let Some(s) = start.take() {
                    blocks.push(CssBlock {
                        kind: BlockKind::Statement,
                        start: s,
                        end: i + 1,
                        text: &css[s..i + 1],
                        prelude: css[s..i].trim(),
                    });
                }
            }
            _ if b.is_ascii_whitespace() => {}
            _ => {
                start.get_or_insert(i);
            }
        }
        i += 1;
    }

    blocks
}

/// Returns the index just past the string literal opening at `open`.
fn skip_string(bytes: &[u8], open: usize) -> usize {
    let quote = bytes[open];
    let mut i = open + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b if b == quote => return i + 1,
            b'\n' => return i,
            _ => i += 1,
        }
    }
    bytes.len()
}

/// Text of every top-level rule (selector + declaration block, or a whole
/// at-rule block) in source order.
pub fn extract_rules(css: &str) -> Vec<&str> {
    scan_blocks(css).into_iter().map(|block| block.text).collect()
}

static SPACE_AROUND_COMMA: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s*,\s*").unwrap());

static SPACE_AFTER_COLON: LazyLock<Regex> = LazyLock::new(|| Regex::new(r":\s+").unwrap());

/// Whitespace-insensitive identity of a rule, used for dedupe and reduction.
///
/// Two rules share a key when they differ only in comments, whitespace, a
/// trailing `;` before `}`, spacing around `,` or spacing after `:`.
pub fn rule_key(rule: &str) -> String {
    let minified = minify_css(rule);
    let key = SPACE_AROUND_COMMA.replace_all(&minified, ",");
    SPACE_AFTER_COLON.replace_all(&key, ":").into_owned()
}

/// Keep only the first occurrence of each distinct rule, preserving
/// first-seen order. Rules are joined with newlines.
pub fn dedupe_rules(css: &str) -> String {
    let mut seen = HashSet::new();
    let mut unique = Vec::new();

    for block in scan_blocks(css) {
        let key = rule_key(block.text);
        if key.is_empty() {
            continue;
        }
        if seen.insert(key) {
            unique.push(block.text.trim());
        }
    }

    unique.join("\n")
}

/// Drop the declarations of a style rule whose property is listed in
/// `properties`, or is a longhand of a listed shorthand (`transition` also
/// drops `transition-delay`).
///
/// The rule text comes back untouched when nothing is dropped, and `None`
/// when no declaration is left.
pub fn strip_declarations(rule: &str, properties: &[String]) -> Option<String> {
    let bytes = rule.as_bytes();
    let mut open = None;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'"' | b'\'' => {
                i = skip_string(bytes, i);
                continue;
            }
            b'{' => {
                open = Some(i);
                break;
            }
            _ => i += 1,
        }
    }
    let (Some(open), Some(close)) = (open, rule.rfind('}')) else {
        return Some(rule.to_string());
    };
    if close < open {
        return Some(rule.to_string());
    }

    let declarations = split_declarations(&rule[open + 1..close]);
    let dropped = |declaration: &str| {
        let minified = minify_css(declaration);
        let name = minified.split(':').next().unwrap_or_default().trim().to_ascii_lowercase();
        properties.iter().any(|property| {
            let property = property.trim().to_ascii_lowercase();
            name == property
                || name
                    .strip_prefix(property.as_str())
                    .is_some_and(|rest| rest.starts_with('-'))
        })
    };
    let kept: Vec<&str> = declarations
        .iter()
        .copied()
        .filter(|declaration| !dropped(declaration))
        .collect();

    if kept.is_empty() {
        None
    } else if kept.len() == declarations.len() {
        Some(rule.to_string())
    } else {
        Some(format!("{}{{{}}}", rule[..open].trim_end(), kept.join(";")))
    }
}

/// Non-empty declarations of a block body, split on `;` outside strings,
/// comments and parentheses.
fn split_declarations(body: &str) -> Vec<&str> {
    let bytes = body.as_bytes();
    let mut declarations = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i = match body[i + 2..].find("*/") {
                    Some(offset) => i + 2 + offset + 2,
                    None => bytes.len(),
                };
                continue;
            }
            b'"' | b'\'' => {
                i = skip_string(bytes, i);
                continue;
            }
            b'(' => depth += 1,
            b')' => depth = depth.saturating_sub(1),
            b';' if depth == 0 => {
                declarations.push(&body[start..i]);
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    declarations.push(&body[start..]);

    declarations
        .into_iter()
        .map(str::trim)
        .filter(|declaration| !minify_css(declaration).is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scans_flat_rules() {
        let css = "html{margin:0}\n.a, .b { color: red; }\n";
        let blocks = scan_blocks(css);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].text, "html{margin:0}");
        assert_eq!(blocks[0].prelude, "html");
        assert_eq!(blocks[1].prelude, ".a, .b");
        assert_eq!(blocks[1].kind, BlockKind::Rule);
        assert_eq!(&css[blocks[1].start..blocks[1].end], blocks[1].text);
    }

    #[test]
    fn nested_at_rule_is_one_block() {
        let css = "@media (min-width:640px){.a{color:red}.b{color:blue}}.c{margin:0}";
        let rules = extract_rules(css);
        assert_eq!(
            rules,
            vec!["@media (min-width:640px){.a{color:red}.b{color:blue}}", ".c{margin:0}"]
        );
        assert_eq!(scan_blocks(css)[0].kind, BlockKind::AtRule);
    }

    #[test]
    fn braces_in_strings_and_comments_are_ignored() {
        let css = r#".a::after{content:"}"}/* } { */.b[data-x='{']{color:red}"#;
        let rules = extract_rules(css);
        assert_eq!(rules, vec![r#".a::after{content:"}"}"#, ".b[data-x='{']{color:red}"]);
    }

    #[test]
    fn statements_and_stray_braces() {
        let css = "@charset \"utf-8\";} .a{color:red} .b{color:";
        let blocks = scan_blocks(css);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].kind, BlockKind::Statement);
        assert_eq!(blocks[1].text, ".a{color:red}");
    }

    #[test]
    fn dedupe_keeps_first_occurrence_in_order() {
        let css = ".a{color:red}\n.b{margin:0}\n.a { color: red; }\n.c{padding:0}\n.b{margin:0}";
        assert_eq!(dedupe_rules(css), ".a{color:red}\n.b{margin:0}\n.c{padding:0}");
    }

    #[test]
    fn dedupe_keeps_same_selector_with_different_declarations() {
        let css = ".a{color:red}.a{color:blue}";
        assert_eq!(dedupe_rules(css), ".a{color:red}\n.a{color:blue}");
    }

    #[test]
    fn rule_key_ignores_cosmetic_whitespace() {
        assert_eq!(rule_key(".a , .b {\n  color: red;\n}"), rule_key(".a,.b{color:red}"));
        assert_ne!(rule_key(".a .b{color:red}"), rule_key(".a.b{color:red}"));
    }

    #[test]
    fn strips_listed_properties_and_longhands() {
        let drop = vec!["transition".to_string(), "will-change".to_string()];
        assert_eq!(
            strip_declarations(
                ".nav { display: flex; transition: opacity .3s; transition-delay: 1s; will-change: transform }",
                &drop
            )
            .as_deref(),
            Some(".nav{display: flex}")
        );
        assert_eq!(
            strip_declarations(".a{background:url(\"a;b.png\");color:red}", &drop).as_deref(),
            Some(".a{background:url(\"a;b.png\");color:red}")
        );
        assert_eq!(strip_declarations(".a{transition:all 1s;}", &drop), None);
        assert_eq!(
            strip_declarations(".a{transitions-custom:1}", &drop).as_deref(),
            Some(".a{transitions-custom:1}")
        );
    }

    #[test]
    fn patterns_compile() {
        LazyLock::force(&SPACE_AROUND_COMMA);
        LazyLock::force(&SPACE_AFTER_COLON);
    }
}
