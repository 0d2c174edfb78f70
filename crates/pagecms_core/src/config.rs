use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const DEFAULT_TEMPLATE: &str = "pages/base.html";
pub const DEFAULT_LANGUAGE_COOKIE: &str = "pages_language";
pub const DEFAULT_LANGUAGE_KEY: &str = "en";
pub const DEFAULT_LANGUAGE_NAME: &str = "English";

/// Zero-argument producer of extra render context (`PAGE_EXTRA_CONTEXT`).
pub type ExtraContextFn = Arc<dyn Fn() -> Map<String, Value> + Send + Sync>;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct PagesConfig {
    #[serde(default)]
    pub pages: PagesSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct PagesSection {
    #[serde(default)]
    pub languages: Vec<LanguageEntry>,
    pub default_language: Option<String>,
    pub use_language_prefix: Option<bool>,
    pub default_template: Option<String>,
    #[serde(default)]
    pub show_start_date: bool,
    #[serde(default)]
    pub show_end_date: bool,
    pub language_cookie: Option<String>,
    #[serde(default)]
    pub extra_context: toml::Table,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct LanguageEntry {
    pub key: String,
    pub name: String,
}

impl LanguageEntry {
    pub fn new(key: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
        }
    }
}

impl PagesConfig {
    /// Resolve runtime settings from the process environment: env > config > default.
    pub fn settings(&self) -> Result<PageSettings> {
        self.settings_with_lookup(|key| env::var(key).ok())
    }

    pub fn settings_with_lookup<F>(&self, lookup_env: F) -> Result<PageSettings>
    where
        F: Fn(&str) -> Option<String>,
    {
        let languages = if self.pages.languages.is_empty() {
            vec![LanguageEntry::new(DEFAULT_LANGUAGE_KEY, DEFAULT_LANGUAGE_NAME)]
        } else {
            self.pages.languages.clone()
        };
        for entry in &languages {
            if entry.key.trim().is_empty() || entry.key.contains('/') {
                bail!("invalid language key {:?} in [pages].languages", entry.key);
            }
        }

        let default_language = env_value(&lookup_env, "PAGE_DEFAULT_LANGUAGE")
            .or_else(|| self.pages.default_language.clone())
            .unwrap_or_else(|| languages[0].key.clone());
        if !languages.iter().any(|entry| entry.key == default_language) {
            bail!("default language {default_language:?} is not listed in [pages].languages");
        }

        let use_language_prefix = match env_value(&lookup_env, "PAGE_USE_LANGUAGE_PREFIX") {
            Some(value) => parse_flag(&value).with_context(|| {
                format!("PAGE_USE_LANGUAGE_PREFIX must be a boolean, got {value:?}")
            })?,
            None => self.pages.use_language_prefix.unwrap_or(false),
        };

        let default_template = env_value(&lookup_env, "PAGE_DEFAULT_TEMPLATE")
            .or_else(|| self.pages.default_template.clone())
            .unwrap_or_else(|| DEFAULT_TEMPLATE.to_string());

        let extra_context = if self.pages.extra_context.is_empty() {
            None
        } else {
            let value = serde_json::to_value(&self.pages.extra_context)
                .context("failed to convert [pages.extra_context] to JSON")?;
            let map = match value {
                Value::Object(map) => map,
                _ => bail!("[pages.extra_context] must be a table"),
            };
            let producer: ExtraContextFn = Arc::new(move || map.clone());
            Some(producer)
        };

        Ok(PageSettings {
            languages,
            default_language,
            use_language_prefix,
            default_template,
            show_start_date: self.pages.show_start_date,
            show_end_date: self.pages.show_end_date,
            language_cookie: self
                .pages
                .language_cookie
                .clone()
                .unwrap_or_else(|| DEFAULT_LANGUAGE_COOKIE.to_string()),
            extra_context,
        })
    }
}

/// Resolved settings handed down the resolution call chain.
#[derive(Clone)]
pub struct PageSettings {
    pub languages: Vec<LanguageEntry>,
    pub default_language: String,
    pub use_language_prefix: bool,
    pub default_template: String,
    pub show_start_date: bool,
    pub show_end_date: bool,
    pub language_cookie: String,
    pub extra_context: Option<ExtraContextFn>,
}

impl PageSettings {
    pub fn language_keys(&self) -> Vec<&str> {
        self.languages.iter().map(|entry| entry.key.as_str()).collect()
    }

    pub fn has_language(&self, key: &str) -> bool {
        self.languages.iter().any(|entry| entry.key == key)
    }

    pub fn with_extra_context<F>(mut self, producer: F) -> Self
    where
        F: Fn() -> Map<String, Value> + Send + Sync + 'static,
    {
        self.extra_context = Some(Arc::new(producer));
        self
    }
}

impl Default for PageSettings {
    fn default() -> Self {
        Self {
            languages: vec![LanguageEntry::new(DEFAULT_LANGUAGE_KEY, DEFAULT_LANGUAGE_NAME)],
            default_language: DEFAULT_LANGUAGE_KEY.to_string(),
            use_language_prefix: false,
            default_template: DEFAULT_TEMPLATE.to_string(),
            show_start_date: false,
            show_end_date: false,
            language_cookie: DEFAULT_LANGUAGE_COOKIE.to_string(),
            extra_context: None,
        }
    }
}

impl fmt::Debug for PageSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageSettings")
            .field("languages", &self.languages)
            .field("default_language", &self.default_language)
            .field("use_language_prefix", &self.use_language_prefix)
            .field("default_template", &self.default_template)
            .field("show_start_date", &self.show_start_date)
            .field("show_end_date", &self.show_end_date)
            .field("language_cookie", &self.language_cookie)
            .field("extra_context", &self.extra_context.is_some())
            .finish()
    }
}

/// Load and parse a PagesConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<PagesConfig> {
    if !config_path.exists() {
        return Ok(PagesConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: PagesConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

fn env_value<F>(lookup_env: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup_env(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_flag(value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => bail!("unrecognized boolean {value:?}"),
    }
}
