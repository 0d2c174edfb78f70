use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context as _, Result, bail};
use serde_json::Value;
use walkdir::WalkDir;

use crate::error::PageResult;
use crate::http::{Context, PageRequest, PageResponse};
use crate::runtime::{EMBEDDED_TEMPLATES, normalize_for_display};
use crate::template::{Template, TemplateLoader};
use crate::views::Details;

/// Turns a template identifier plus context into output text.
pub trait TemplateRenderer {
    fn render(&self, template: &str, context: &Context, lang: &str) -> Result<String>;

    fn exists(&self, _template: &str) -> bool {
        true
    }
}

/// Renders templates from a directory, falling back to the built-in set.
#[derive(Debug, Clone)]
pub struct FileTemplateRenderer {
    root: PathBuf,
}

impl FileTemplateRenderer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Template names under the root, sorted, with `/` separators.
    pub fn list_templates(&self) -> Result<Vec<String>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in WalkDir::new(&self.root).follow_links(false) {
            let entry = entry.with_context(|| {
                format!("failed to walk templates under {}", self.root.display())
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&self.root)
                .with_context(|| format!("template outside root: {}", entry.path().display()))?;
            names.push(normalize_for_display(relative));
        }
        names.sort();
        Ok(names)
    }

    fn template_path(&self, name: &str) -> Result<PathBuf> {
        let relative = Path::new(name);
        if relative.is_absolute()
            || relative
                .components()
                .any(|component| !matches!(component, Component::Normal(_)))
        {
            bail!("template name {name:?} must be a relative path without `..`");
        }
        Ok(self.root.join(relative))
    }
}

impl TemplateLoader for FileTemplateRenderer {
    fn load(&self, name: &str) -> Result<Template> {
        let path = self.template_path(name)?;
        if path.is_file() {
            let source = fs::read_to_string(&path)
                .with_context(|| format!("failed to read template {}", path.display()))?;
            return Template::parse(name, &source);
        }
        match EMBEDDED_TEMPLATES.iter().find(|(embedded, _)| *embedded == name) {
            Some((_, source)) => Template::parse(name, source),
            None => bail!("template {name} not found under {}", self.root.display()),
        }
    }
}

impl TemplateRenderer for FileTemplateRenderer {
    fn render(&self, template: &str, context: &Context, lang: &str) -> Result<String> {
        let mut data = context.clone();
        data.entry("LANGUAGE_CODE")
            .or_insert_with(|| Value::from(lang));
        self.load(template)?
            .render(&data, self)
            .with_context(|| format!("failed to render {template}"))
    }

    fn exists(&self, template: &str) -> bool {
        self.template_path(template).is_ok_and(|path| path.is_file())
            || EMBEDDED_TEMPLATES
                .iter()
                .any(|(embedded, _)| *embedded == template)
    }
}

/// Output of [`AutoRender::call`].
#[derive(Debug, Clone, PartialEq)]
pub enum Rendered {
    /// Context only, template not rendered.
    Context { template: String, context: Context },
    Response(PageResponse),
}

/// Wraps the resolver so `Render` results come back as HTML.
pub struct AutoRender<'a, R> {
    details: Details<'a>,
    renderer: R,
}

impl<'a, R: TemplateRenderer> AutoRender<'a, R> {
    pub fn new(details: Details<'a>, renderer: R) -> Self {
        Self { details, renderer }
    }

    pub fn call(
        &self,
        request: &PageRequest,
        path: Option<&str>,
        lang: Option<&str>,
        delegation: bool,
        only_context: bool,
    ) -> PageResult<Rendered> {
        match self.details.resolve(request, path, lang, delegation)? {
            PageResponse::Render { template, context } if only_context => {
                Ok(Rendered::Context { template, context })
            }
            PageResponse::Render { template, context } => {
                let lang = context
                    .get("lang")
                    .and_then(Value::as_str)
                    .unwrap_or(&self.details.settings().default_language);
                let body = self.renderer.render(&template, &context, lang)?;
                Ok(Rendered::Response(PageResponse::html(body)))
            }
            other => Ok(Rendered::Response(other)),
        }
    }
}
