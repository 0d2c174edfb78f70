use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use regex::Regex;

use crate::error::PageResult;
use crate::http::{Context, PageRequest, PageResponse};

/// A delegated sub-application view.
///
/// Receives the request, the positional captures and the keyword captures
/// already merged with the page context. `Ok(None)` means the view declined
/// and the page renders with its own template.
pub type DelegateView =
    Arc<dyn Fn(&PageRequest, &[String], Context) -> PageResult<Option<PageResponse>> + Send + Sync>;

struct Route {
    pattern: Regex,
    name: String,
    view: DelegateView,
}

/// Ordered regex routes for one delegate target; first match wins.
#[derive(Default)]
pub struct Urlconf {
    routes: Vec<Route>,
}

/// A successful urlconf lookup.
pub struct ResolverMatch {
    pub view: DelegateView,
    pub name: String,
    pub args: Vec<String>,
    pub kwargs: Context,
}

impl fmt::Debug for ResolverMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolverMatch")
            .field("name", &self.name)
            .field("args", &self.args)
            .field("kwargs", &self.kwargs)
            .finish()
    }
}

impl Urlconf {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a route. Patterns match the sub-path without its leading `/`.
    pub fn route<F>(mut self, pattern: &str, name: &str, view: F) -> Result<Self>
    where
        F: Fn(&PageRequest, &[String], Context) -> PageResult<Option<PageResponse>>
            + Send
            + Sync
            + 'static,
    {
        let pattern =
            Regex::new(pattern).with_context(|| format!("invalid urlconf pattern {pattern:?}"))?;
        self.routes.push(Route {
            pattern,
            name: name.to_string(),
            view: Arc::new(view),
        });
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Match `path` against the routes. Named groups become keyword
    /// arguments; when a pattern has none, unnamed groups become positional.
    pub fn resolve(&self, path: &str) -> Option<ResolverMatch> {
        let path = path.strip_prefix('/').unwrap_or(path);
        for route in &self.routes {
            let Some(captures) = route.pattern.captures(path) else {
                continue;
            };

            let mut kwargs = Context::new();
            for name in route.pattern.capture_names().flatten() {
                if let Some(value) = captures.name(name) {
                    kwargs.insert(name.to_string(), value.as_str().into());
                }
            }

            let args = if kwargs.is_empty() {
                captures
                    .iter()
                    .skip(1)
                    .flatten()
                    .map(|group| group.as_str().to_string())
                    .collect()
            } else {
                Vec::new()
            };

            return Some(ResolverMatch {
                view: Arc::clone(&route.view),
                name: route.name.clone(),
                args,
                kwargs,
            });
        }
        None
    }
}

/// Routing tables keyed by delegate target identifier.
#[derive(Default)]
pub struct UrlconfRegistry {
    urlconfs: BTreeMap<String, Urlconf>,
}

impl UrlconfRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `urlconf` for `target`, replacing any earlier registration.
    pub fn register(&mut self, target: &str, urlconf: Urlconf) {
        self.urlconfs.insert(target.to_string(), urlconf);
    }

    pub fn get_urlconf(&self, target: &str) -> Option<&Urlconf> {
        self.urlconfs.get(target)
    }

    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.urlconfs.keys().map(String::as_str)
    }
}

impl fmt::Debug for UrlconfRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.urlconfs.iter().map(|(target, urlconf)| (target, urlconf.len())))
            .finish()
    }
}
