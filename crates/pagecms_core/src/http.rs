use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::config::PageSettings;

/// Render context handed to templates and delegated views.
pub type Context = Map<String, Value>;

pub const LANGUAGE_QUERY_PARAM: &str = "language";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct User {
    pub is_authenticated: bool,
    pub is_staff: bool,
}

impl User {
    pub fn staff() -> Self {
        Self {
            is_authenticated: true,
            is_staff: true,
        }
    }

    pub fn member() -> Self {
        Self {
            is_authenticated: true,
            is_staff: false,
        }
    }
}

/// The slice of an incoming HTTP request page resolution looks at.
#[derive(Debug, Clone, Default)]
pub struct PageRequest {
    pub path: String,
    pub query_string: Option<String>,
    headers: BTreeMap<String, String>,
    pub user: Option<User>,
}

impl PageRequest {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Header names are matched case-insensitively.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_query(mut self, query_string: impl Into<String>) -> Self {
        let query_string = query_string.into();
        let trimmed = query_string.trim_start_matches('?');
        self.query_string = if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        };
        self
    }

    pub fn with_user(mut self, user: User) -> Self {
        self.user = Some(user);
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query_string.as_deref()?.split('&').find_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (key == name).then_some(value)
        })
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.header("cookie")?.split(';').find_map(|pair| {
            let (key, value) = pair.trim().split_once('=')?;
            (key.trim() == name).then(|| value.trim())
        })
    }

    pub fn is_ajax(&self) -> bool {
        self.header("x-requested-with") == Some("XMLHttpRequest")
    }

    pub fn is_staff(&self) -> bool {
        self.user
            .is_some_and(|user| user.is_authenticated && user.is_staff)
    }

    pub fn full_path(&self) -> String {
        match &self.query_string {
            Some(query) => format!("{}?{query}", self.path),
            None => self.path.clone(),
        }
    }
}

/// What the resolver (or a delegated view) hands back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PageResponse {
    Render { template: String, context: Context },
    PermanentRedirect { location: String },
    Content {
        status: u16,
        content_type: String,
        body: String,
    },
}

impl PageResponse {
    pub fn redirect(location: impl Into<String>) -> Self {
        Self::PermanentRedirect {
            location: location.into(),
        }
    }

    pub fn html(body: impl Into<String>) -> Self {
        Self::Content {
            status: 200,
            content_type: "text/html; charset=utf-8".to_string(),
            body: body.into(),
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            Self::Render { .. } => 200,
            Self::PermanentRedirect { .. } => 301,
            Self::Content { status, .. } => *status,
        }
    }
}

/// Language for a request with no explicit choice:
/// query parameter -> language cookie -> Accept-Language -> default language.
pub fn get_language_from_request(request: &PageRequest, settings: &PageSettings) -> String {
    if let Some(lang) = request.query_param(LANGUAGE_QUERY_PARAM)
        && settings.has_language(lang)
    {
        return lang.to_string();
    }

    if let Some(lang) = request.cookie(&settings.language_cookie)
        && settings.has_language(lang)
    {
        return lang.to_string();
    }

    if let Some(header) = request.header("accept-language")
        && let Some(lang) = parse_accept_language(header, &settings.language_keys())
    {
        return lang;
    }

    settings.default_language.clone()
}

pub fn parse_accept_language(header: &str, languages: &[&str]) -> Option<String> {
    if header.trim().is_empty() {
        return None;
    }

    let mut entries: Vec<(&str, f64)> = Vec::new();
    for part in header.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let mut segments = part.split(';');
        let lang = segments.next().unwrap_or("").trim();
        let mut q = 1.0_f64;
        for segment in segments {
            if let Some(value) = segment.trim().strip_prefix("q=")
                && let Ok(parsed) = value.parse::<f64>()
            {
                q = parsed;
            }
        }
        if q > 0.0 {
            entries.push((lang, q));
        }
    }

    // Stable sort keeps header order between equal weights.
    entries.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    for (lang, _) in &entries {
        if let Some(found) = languages.iter().find(|key| key.eq_ignore_ascii_case(lang)) {
            return Some((*found).to_string());
        }
        // fr-CA -> fr
        if let Some((prefix, _)) = lang.split_once('-')
            && let Some(found) = languages.iter().find(|key| key.eq_ignore_ascii_case(prefix))
        {
            return Some((*found).to_string());
        }
    }

    None
}

/// Split a leading language segment off `path` when it names a configured language.
pub fn split_language_prefix<'a>(path: &'a str, languages: &[&str]) -> Option<(&'a str, &'a str)> {
    let (first, rest) = path.split_once('/').unwrap_or((path, ""));
    if languages.contains(&first) {
        Some((first, rest))
    } else {
        None
    }
}

/// Drop the last slug of a path; `None` once no parent path remains.
pub fn remove_slug(path: &str) -> Option<String> {
    let trimmed = path.trim_matches('/');
    let (parent, _) = trimmed.rsplit_once('/')?;
    Some(parent.to_string())
}

/// Leading slash, no trailing slash, `/` for the empty url.
pub fn normalize_url(url: &str) -> String {
    if url.is_empty() {
        return "/".to_string();
    }
    let mut normalized = if url.starts_with('/') {
        url.to_string()
    } else {
        format!("/{url}")
    };
    if normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }
    normalized
}
