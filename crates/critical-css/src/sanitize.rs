//! Strips XSS-capable constructs from CSS produced by the extraction engine.
//!
//! Sanitization only removes text, it never rejects input. It is applied until
//! the output stops changing so that nested payloads such as
//! `javajavascript:script:` cannot reassemble after a single pass.

use regex::Regex;
use std::sync::LazyLock;

static SCRIPT_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<script\b[^>]*>.*?</script\s*>").unwrap());

static SCRIPT_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)</?script\b[^>]*>").unwrap());

static JAVASCRIPT_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)url\s*\(\s*(['"]?)\s*javascript\s*:"#).unwrap());

static JAVASCRIPT_PROTOCOL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)javascript\s*:").unwrap());

static EXPRESSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)expression\s*\(").unwrap());

static IMPORT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)@import\b[^;{}]*;?").unwrap());

static BINDING_DECLARATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(^|[;{\s])(?:-moz-binding|behavior)\s*:[^;{}]*;?").unwrap());

/// Remove script tags, `javascript:` URIs, `expression()`, `@import` and
/// legacy `behavior` / `-moz-binding` declarations.
///
/// `url(javascript:...)` keeps its `url(` wrapper and argument so the rest of
/// the declaration survives.
pub fn sanitize_css(css: &str) -> String {
    let mut current = css.to_string();
    loop {
        let next = sanitize_pass(&current);
        if next == current {
            return next;
        }
        tracing::trace!(before = current.len(), after = next.len(), "sanitize pass changed input");
        current = next;
    }
}

fn sanitize_pass(css: &str) -> String {
    let out = SCRIPT_BLOCK.replace_all(css, "");
    let out = SCRIPT_TAG.replace_all(&out, "");
    let out = JAVASCRIPT_URL.replace_all(&out, "url(${1}");
    let out = JAVASCRIPT_PROTOCOL.replace_all(&out, "");
    let out = EXPRESSION.replace_all(&out, "(");
    let out = IMPORT.replace_all(&out, "");
    let out = BINDING_DECLARATION.replace_all(&out, "${1}");
    out.into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_javascript_inside_url() {
        let out = sanitize_css(".a{background:url(javascript:alert(1)) no-repeat}");
        assert!(!out.to_lowercase().contains("javascript:"));
        assert_eq!(out, ".a{background:url(alert(1)) no-repeat}");
    }

    #[test]
    fn strips_quoted_javascript_url() {
        let out = sanitize_css(".a{background:url( 'JavaScript:alert(1)')}");
        assert_eq!(out, ".a{background:url('alert(1)')}");
    }

    #[test]
    fn strips_script_tags() {
        let out = sanitize_css(".a{color:red}<script>alert(1)</script>.b{color:blue}");
        assert_eq!(out, ".a{color:red}.b{color:blue}");

        let stray = sanitize_css(".a{color:red}<SCRIPT src=x>");
        assert_eq!(stray, ".a{color:red}");
    }

    #[test]
    fn strips_expression_and_import() {
        let out = sanitize_css("@import url(evil.css);.a{width:expression(alert(1))}");
        assert_eq!(out, ".a{width:(alert(1))}");

        let quoted = sanitize_css("@import 'x.css' screen;\n.b{color:red}");
        assert_eq!(quoted.trim(), ".b{color:red}");
    }

    #[test]
    fn strips_binding_declarations() {
        let out = sanitize_css(".a{behavior:url(x.htc);color:red;-moz-binding:url(x.xml#b)}");
        assert_eq!(out, ".a{color:red;}");
    }

    #[test]
    fn keeps_scroll_behavior() {
        let css = "html{scroll-behavior:smooth}";
        assert_eq!(sanitize_css(css), css);
    }

    #[test]
    fn nested_payload_does_not_reassemble() {
        let out = sanitize_css(".a{background:url(javajavascript:script:alert(1))}");
        assert!(!out.to_lowercase().contains("javascript"));
    }

    #[test]
    fn clean_css_is_untouched() {
        let css = "html{margin:0}body{font-family:system-ui}.btn:hover{opacity:.8}";
        assert_eq!(sanitize_css(css), css);
    }

    #[test]
    fn patterns_compile() {
        LazyLock::force(&SCRIPT_BLOCK);
        LazyLock::force(&SCRIPT_TAG);
        LazyLock::force(&JAVASCRIPT_URL);
        LazyLock::force(&JAVASCRIPT_PROTOCOL);
        LazyLock::force(&EXPRESSION);
        LazyLock::force(&IMPORT);
        LazyLock::force(&BINDING_DECLARATION);
    }
}
