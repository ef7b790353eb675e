//! Headless Chrome extraction engine.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use headless_chrome::{Browser, LaunchOptionsBuilder, Tab};
use serde::Deserialize;
use tracing::{debug, info};

use super::source::{source_rules, SelectedRule};
use super::{CriticalEngine, ExtractRequest};
use crate::config::ExtractConfig;

/// Evaluated in the page. Parses the stylesheet into a constructed
/// `CSSStyleSheet` and reports, by index, the rules whose selectors match an
/// element intersecting the initial viewport, rules matching a force-include
/// prefix, matching `@media` blocks and `@font-face`.
const EXTRACT_SCRIPT: &str = r#"
(() => {
  const cssText = __CSS__;
  const forceInclude = __FORCE__;
  const sheet = new CSSStyleSheet();
  try {
    sheet.replaceSync(cssText);
  } catch (e) {
    return JSON.stringify({ error: 'stylesheet rejected: ' + String(e) });
  }
  const vw = window.innerWidth;
  const vh = window.innerHeight;
  const aboveFold = (el) => {
    const r = el.getBoundingClientRect();
    return (r.width > 0 || r.height > 0) && r.top < vh && r.bottom >= 0 && r.left < vw && r.right >= 0;
  };
  const visible = (selectorText) => selectorText.split(',').some((part) => {
    const selector = part.trim();
    if (forceInclude.some((prefix) => selector.startsWith(prefix))) return true;
    const base = selector.replace(/::?[a-zA-Z-]+(\([^)]*\))?/g, '').trim() || '*';
    let nodes;
    try {
      nodes = document.querySelectorAll(base);
    } catch (e) {
      return false;
    }
    for (const el of nodes) {
      if (aboveFold(el)) return true;
    }
    return false;
  });
  const pick = (rules) => {
    const out = [];
    for (let index = 0; index < rules.length; index++) {
      const rule = rules[index];
      if (rule instanceof CSSStyleRule) {
        if (visible(rule.selectorText)) out.push({ index, selector: rule.selectorText });
      } else if (rule instanceof CSSMediaRule) {
        if (window.matchMedia(rule.media.mediaText).matches) {
          const inner = pick(rule.cssRules);
          if (inner.length) out.push({ index, selector: '@media', inner });
        }
      } else if (rule instanceof CSSSupportsRule) {
        const inner = pick(rule.cssRules);
        if (inner.length) out.push({ index, selector: '@supports', inner });
      } else if (rule instanceof CSSFontFaceRule) {
        out.push({ index, selector: '@font-face' });
      }
    }
    return out;
  };
  return JSON.stringify({ rules: pick(sheet.cssRules) });
})()
"#;

#[derive(Deserialize)]
struct ScriptResult {
    rules: Option<Vec<SelectedRule>>,
    error: Option<String>,
}

type BrowserCache = Arc<Mutex<HashMap<(u32, u32), Browser>>>;
type TabSlot = Arc<Mutex<Option<Arc<Tab>>>>;

/// Renders pages in headless Chrome, one browser per viewport size.
///
/// Renders never overlap: each one holds the render lock for its whole
/// blocking run, including one that outlived its caller's timeout.
pub struct ChromeEngine {
    config: ExtractConfig,
    browsers: BrowserCache,
    render_lock: Arc<Mutex<()>>,
    current_tab: TabSlot,
}

impl ChromeEngine {
    pub fn new(config: ExtractConfig) -> Self {
        Self {
            config,
            browsers: Arc::new(Mutex::new(HashMap::new())),
            render_lock: Arc::new(Mutex::new(())),
            current_tab: Arc::new(Mutex::new(None)),
        }
    }
}

/// Cancels the render in flight when the extraction future is dropped
/// before it finished, closing its tab so blocked CDP calls return.
struct CancelOnDrop {
    cancelled: Arc<AtomicBool>,
    tab: TabSlot,
    armed: bool,
}

impl CancelOnDrop {
    fn new(tab: TabSlot) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            tab,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.cancelled.store(true, Ordering::SeqCst);
        let Some(tab) = take_tab(&self.tab) else {
            return;
        };
        debug!("closing tab of abandoned extraction");
        let close = move || {
            if let Err(err) = tab.close(false) {
                debug!(error = %err, "failed to close abandoned tab");
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(close);
            }
            Err(_) => close(),
        }
    }
}

fn take_tab(slot: &TabSlot) -> Option<Arc<Tab>> {
    slot.lock().ok().and_then(|mut tab| tab.take())
}

fn launch(config: &ExtractConfig, width: u32, height: u32) -> anyhow::Result<Browser> {
    let mut args = vec![
        OsStr::new("--disable-gpu"),
        OsStr::new("--disable-dev-shm-usage"),
        OsStr::new("--hide-scrollbars"),
        OsStr::new("--force-device-scale-factor=1"),
    ];
    if config.no_sandbox {
        args.push(OsStr::new("--no-sandbox"));
        args.push(OsStr::new("--disable-setuid-sandbox"));
    }

    let options = LaunchOptionsBuilder::default()
        .headless(true)
        .sandbox(!config.no_sandbox)
        .window_size(Some((width, height)))
        .idle_browser_timeout(Duration::from_secs(300))
        .path(config.chrome_path.clone())
        .args(args)
        .build()
        .map_err(|err| anyhow!("invalid Chrome launch options: {err}"))?;

    info!(width, height, "launching headless Chrome");
    Browser::new(options).context("failed to launch Chrome")
}

fn render_script(request: &ExtractRequest) -> anyhow::Result<String> {
    Ok(EXTRACT_SCRIPT
        .replace("__FORCE__", &serde_json::to_string(&request.force_include)?)
        .replace("__CSS__", &serde_json::to_string(&*request.stylesheet)?))
}

/// Time left before `deadline`, or an error once it passed or the render was
/// cancelled.
fn remaining(deadline: Instant, cancelled: &AtomicBool) -> anyhow::Result<Duration> {
    if cancelled.load(Ordering::SeqCst) {
        bail!("extraction cancelled");
    }
    match deadline.checked_duration_since(Instant::now()) {
        Some(left) if !left.is_zero() => Ok(left),
        _ => bail!("extraction deadline passed"),
    }
}

fn cached_browser(
    config: &ExtractConfig,
    browsers: &Mutex<HashMap<(u32, u32), Browser>>,
    size: (u32, u32),
) -> anyhow::Result<Browser> {
    let mut browsers = browsers
        .lock()
        .map_err(|_| anyhow!("browser cache poisoned"))?;
    if let Some(browser) = browsers.get(&size) {
        return Ok(browser.clone());
    }
    let browser = launch(config, size.0, size.1)?;
    browsers.insert(size, browser.clone());
    Ok(browser)
}

/// Navigate and evaluate; every blocking step gets only the budget left.
fn render(
    tab: &Tab,
    request: &ExtractRequest,
    deadline: Instant,
    cancelled: &AtomicBool,
) -> anyhow::Result<String> {
    tab.set_default_timeout(remaining(deadline, cancelled)?);
    tab.set_user_agent(&request.user_agent, None, None)?;

    tab.set_default_timeout(remaining(deadline, cancelled)?);
    tab.navigate_to(&request.url)?;
    tab.set_default_timeout(remaining(deadline, cancelled)?);
    tab.wait_until_navigated()?;

    std::thread::sleep(request.render_wait.min(remaining(deadline, cancelled)?));

    let script = render_script(request)?;
    tab.set_default_timeout(remaining(deadline, cancelled)?);
    let value = tab
        .evaluate(&script, false)?
        .value
        .ok_or_else(|| anyhow!("no value returned from page evaluation"))?;
    let text = value
        .as_str()
        .ok_or_else(|| anyhow!("page evaluation returned a non-string value"))?;

    let result: ScriptResult = serde_json::from_str(text)?;
    if let Some(error) = result.error {
        bail!(error);
    }
    let rules = source_rules(
        &request.stylesheet,
        &result.rules.unwrap_or_default(),
        &request.drop_properties,
    );
    Ok(rules.join("\n"))
}

fn extract_blocking(
    config: &ExtractConfig,
    browsers: &Mutex<HashMap<(u32, u32), Browser>>,
    slot: &TabSlot,
    request: &ExtractRequest,
    deadline: Instant,
    cancelled: &AtomicBool,
) -> anyhow::Result<String> {
    remaining(deadline, cancelled)?;
    let browser = cached_browser(config, browsers, (request.viewport.width, request.viewport.height))?;

    let tab = browser.new_tab().context("failed to open tab")?;
    if let Ok(mut current) = slot.lock() {
        *current = Some(Arc::clone(&tab));
    }
    let result = render(&tab, request, deadline, cancelled);

    if let Some(tab) = take_tab(slot) {
        if let Err(err) = tab.close(true) {
            debug!(error = %err, "failed to close tab");
        }
    }
    result
}

#[async_trait]
impl CriticalEngine for ChromeEngine {
    fn name(&self) -> &str {
        "chrome"
    }

    async fn extract(&self, request: &ExtractRequest) -> anyhow::Result<String> {
        let deadline = Instant::now() + Duration::from_millis(self.config.timeout_ms);
        let guard = CancelOnDrop::new(Arc::clone(&self.current_tab));
        let cancelled = Arc::clone(&guard.cancelled);

        let config = self.config.clone();
        let browsers = Arc::clone(&self.browsers);
        let render_lock = Arc::clone(&self.render_lock);
        let slot = Arc::clone(&self.current_tab);
        let request = request.clone();
        let css = tokio::task::spawn_blocking(move || {
            let _serial = render_lock
                .lock()
                .map_err(|_| anyhow!("render lock poisoned"))?;
            extract_blocking(&config, &browsers, &slot, &request, deadline, &cancelled)
        })
        .await
        .context("extraction task panicked")??;

        guard.disarm();
        Ok(css)
    }

    /// Waits for a render still in flight, then drops every cached browser,
    /// which shuts Chrome down.
    async fn close(&self) {
        if let Some(tab) = take_tab(&self.current_tab) {
            let _ = tokio::task::spawn_blocking(move || tab.close(false)).await;
        }
        let browsers = Arc::clone(&self.browsers);
        let render_lock = Arc::clone(&self.render_lock);
        let closed = tokio::task::spawn_blocking(move || {
            let _serial = render_lock.lock();
            browsers.lock().map_or(0, |mut browsers| {
                let count = browsers.len();
                browsers.clear();
                count
            })
        })
        .await;
        match closed {
            Ok(count) => debug!(count, "closed Chrome instances"),
            Err(err) => debug!(error = %err, "failed to close Chrome instances"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Route, Viewport};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn request(url: &str, stylesheet: &str) -> ExtractRequest {
        ExtractRequest {
            url: url.to_string(),
            route: Route::new("/"),
            viewport: Viewport::new("desktop", 1300, 900),
            stylesheet: Arc::from(stylesheet),
            user_agent: String::new(),
            render_wait: Duration::ZERO,
            force_include: vec!["html".into(), "body".into(), ".container".into()],
            drop_properties: vec!["transition".into()],
        }
    }

    #[test]
    fn test_script_embeds_json_literals() {
        let request = request(
            "http://localhost:4173/",
            ".a::after{content:\"}\"}\n`${x}`",
        );
        let script = render_script(&request).unwrap();
        assert!(script.contains(r#"const forceInclude = ["html","body",".container"];"#));
        assert!(script.contains(r#"const cssText = ".a::after{content:\"}\"}\n`${x}`";"#));
        assert!(!script.contains("__CSS__"));
        assert!(!script.contains("__FORCE__"));
    }

    #[test]
    fn test_remaining_budget() {
        let cancelled = AtomicBool::new(false);
        let left = remaining(Instant::now() + Duration::from_secs(5), &cancelled).unwrap();
        assert!(left <= Duration::from_secs(5));
        assert!(remaining(Instant::now(), &cancelled).is_err());

        cancelled.store(true, Ordering::SeqCst);
        let err = remaining(Instant::now() + Duration::from_secs(5), &cancelled).unwrap_err();
        assert_eq!(err.to_string(), "extraction cancelled");
    }

    #[tokio::test]
    async fn test_dropped_extraction_is_cancelled() {
        let slot: TabSlot = Arc::new(Mutex::new(None));
        let guard = CancelOnDrop::new(Arc::clone(&slot));
        let cancelled = Arc::clone(&guard.cancelled);
        drop(guard);
        assert!(cancelled.load(Ordering::SeqCst));

        let guard = CancelOnDrop::new(slot);
        let cancelled = Arc::clone(&guard.cancelled);
        guard.disarm();
        assert!(!cancelled.load(Ordering::SeqCst));
    }

    const FIXTURE_PAGE: &str = r#"<!doctype html>
<html>
<head><title>fixture</title></head>
<body style="margin:0">
  <nav class="nav" style="height:80px">Nav</nav>
  <div class="spacer" style="height:3000px"></div>
  <div class="container">below the fold</div>
  <footer class="footer">Footer</footer>
</body>
</html>
"#;

    const FIXTURE_CSS: &str = ".nav{display:flex;transition:opacity .3s}
.container{max-width:1200px}
.footer{padding:2rem;background:#222}
@media (min-width: 2000px){.nav{color:red}}
@media (max-width: 2000px){.nav{color:blue}}
";

    async fn serve_fixture() -> String {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 2048];
                    let _ = socket.read(&mut buf).await;
                    let response = format!(
                        "HTTP/1.1 200 OK\r\ncontent-type: text/html\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{FIXTURE_PAGE}",
                        FIXTURE_PAGE.len()
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                });
            }
        });
        format!("http://127.0.0.1:{port}/")
    }

    #[tokio::test(flavor = "multi_thread")]
    #[ignore = "needs a local Chrome; run with --ignored"]
    async fn test_chrome_selects_above_the_fold_rules() {
        let url = serve_fixture().await;
        let config = ExtractConfig {
            no_sandbox: true,
            timeout_ms: 60_000,
            ..ExtractConfig::default()
        };
        let engine = ChromeEngine::new(config);

        let css = engine.extract(&request(&url, FIXTURE_CSS)).await.unwrap();
        engine.close().await;

        // force-included although below the fold
        assert!(css.contains(".container{max-width:1200px}"));
        // transition dropped, source text kept
        assert!(css.contains(".nav{display:flex}"));
        assert!(!css.contains("transition"));
        assert!(!css.contains(".footer"));
        assert!(!css.contains("color:red"));
        assert!(css.contains("@media (max-width: 2000px){.nav{color:blue}}"));

        let reduction = critical_css::reduce_stylesheet(FIXTURE_CSS, &css, 10);
        assert_eq!(reduction.removed, 1);
        assert!(!reduction.css.contains(".container"));
    }
}
