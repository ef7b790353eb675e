//! Routes, viewports and extraction results.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One page of the built site.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "RouteSpec")]
pub struct Route {
    /// URL path, always starting with `/`.
    pub path: String,
    /// Short name used in fragment keys and file names.
    pub name: String,
}

/// Routes may be configured as a bare path or as `{ "path", "name" }`.
#[derive(Deserialize)]
#[serde(untagged)]
enum RouteSpec {
    Path(String),
    Full { path: String, name: Option<String> },
}

impl From<RouteSpec> for Route {
    fn from(spec: RouteSpec) -> Self {
        match spec {
            RouteSpec::Path(path) | RouteSpec::Full { path, name: None } => Route::new(&path),
            RouteSpec::Full {
                path,
                name: Some(name),
            } => Route::named(&path, &name),
        }
    }
}

impl Route {
    /// A route whose name is derived from its path.
    pub fn new(path: &str) -> Self {
        let path = normalize_path(path);
        Self {
            name: route_name(&path),
            path,
        }
    }

    pub fn named(path: &str, name: &str) -> Self {
        Self {
            path: normalize_path(path),
            name: name.to_string(),
        }
    }

    /// Whether this is the site root.
    pub fn is_entry(&self) -> bool {
        self.path == "/"
    }

    /// Built HTML file for this route, relative to the output root:
    /// `/` is `index.html`, `/about` is `about.html`.
    pub fn html_file(&self) -> String {
        let trimmed = self.path.trim_matches('/');
        if trimmed.is_empty() {
            "index.html".to_string()
        } else {
            format!("{trimmed}.html")
        }
    }
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.trim();
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// `/` is `home`; otherwise the path without surrounding slashes, with inner
/// slashes turned into dashes.
pub fn route_name(path: &str) -> String {
    let trimmed = path.trim().trim_matches('/');
    if trimmed.is_empty() {
        "home".to_string()
    } else {
        trimmed.replace('/', "-")
    }
}

/// A named rendering size.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Viewport {
    pub name: String,
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub fn new(name: &str, width: u32, height: u32) -> Self {
        Self {
            name: name.to_string(),
            width,
            height,
        }
    }
}

impl fmt::Display for Viewport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}x{})", self.name, self.width, self.height)
    }
}

pub fn default_routes() -> Vec<Route> {
    ["/", "/about", "/services", "/blog", "/contact"]
        .into_iter()
        .map(Route::new)
        .collect()
}

pub fn default_viewports() -> Vec<Viewport> {
    vec![
        Viewport::new("desktop", 1300, 900),
        Viewport::new("mobile", 375, 667),
    ]
}

/// Every (route, viewport) pair, route-major.
pub fn combinations<'a>(
    routes: &'a [Route],
    viewports: &'a [Viewport],
) -> impl Iterator<Item = (&'a Route, &'a Viewport)> + 'a {
    routes
        .iter()
        .flat_map(move |route| viewports.iter().map(move |viewport| (route, viewport)))
}

/// `<route name>-<viewport name>`
pub fn fragment_key(route: &Route, viewport: &Viewport) -> String {
    format!("{}-{}", route.name, viewport.name)
}

/// Sanitized critical CSS for one (route, viewport) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriticalFragment {
    pub key: String,
    pub route: String,
    pub viewport: String,
    pub css: String,
}

impl CriticalFragment {
    pub fn new(route: &Route, viewport: &Viewport, css: String) -> Self {
        Self {
            key: fragment_key(route, viewport),
            route: route.name.clone(),
            viewport: viewport.name.clone(),
            css,
        }
    }

    /// File name of this fragment inside the scratch directory.
    pub fn file_name(&self) -> String {
        format!("{}.css", self.key)
    }
}
