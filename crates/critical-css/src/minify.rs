//! Whitespace and comment minification.

use regex::Regex;
use std::sync::LazyLock;

static COMMENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)/\*.*?\*/").unwrap());
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static SEMICOLON_BEFORE_CLOSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*;\s*\}").unwrap());
static OPEN_BRACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s*\{\s*").unwrap());
static CLOSE_BRACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s*\}\s*").unwrap());
static SEMICOLON: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s*;\s*").unwrap());

/// Strip comments, collapse whitespace runs, drop the `;` right before `}` and
/// tighten spacing around braces and semicolons.
pub fn minify_css(css: &str) -> String {
    let out = COMMENT.replace_all(css, "");
    let out = WHITESPACE.replace_all(&out, " ");
    let out = SEMICOLON_BEFORE_CLOSE.replace_all(&out, "}");
    let out = OPEN_BRACE.replace_all(&out, "{");
    let out = CLOSE_BRACE.replace_all(&out, "}");
    let out = SEMICOLON.replace_all(&out, ";");
    out.trim().to_string()
}
