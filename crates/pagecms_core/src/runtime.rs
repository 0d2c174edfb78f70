use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

pub const MIGRATIONS_POLICY_MESSAGE: &str =
    "Run `pagecms db migrate` to apply pending schema migrations.";

pub const STATE_DIR_NAME: &str = ".pagecms";
pub const DB_FILENAME: &str = "pages.db";

const EMBEDDED_CONFIG: &str = include_str!("../assets/config.toml");

/// Built-in templates written by `init` and used when the project has no override.
pub const EMBEDDED_TEMPLATES: &[(&str, &str)] = &[
    ("pages/base.html", include_str!("../assets/base.html")),
    ("body_pages/base.html", include_str!("../assets/body_base.html")),
    (
        "search/indexes/pages/page_text.txt",
        include_str!("../assets/page_text.txt"),
    ),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Heuristic,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Heuristic => "heuristic",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub project_root: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
    pub executable_dir: Option<PathBuf>,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        let executable_dir = env::current_exe()
            .ok()
            .and_then(|path| path.parent().map(Path::to_path_buf));
        Ok(Self {
            cwd,
            executable_dir,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub project_root: PathBuf,
    pub templates_dir: PathBuf,
    pub state_dir: PathBuf,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub config_path: PathBuf,
    pub root_source: ValueSource,
    pub data_source: ValueSource,
    pub config_source: ValueSource,
}

#[derive(Debug, Clone)]
pub struct RuntimeStatus {
    pub project_root_exists: bool,
    pub templates_exists: bool,
    pub state_dir_exists: bool,
    pub data_dir_exists: bool,
    pub db_exists: bool,
    pub db_size_bytes: Option<u64>,
    pub config_exists: bool,
    pub warnings: Vec<String>,
}

impl ResolvedPaths {
    /// Layout rooted at `project_root` with every value at its default.
    pub fn for_project(project_root: &Path) -> Self {
        let state_dir = project_root.join(STATE_DIR_NAME);
        let data_dir = state_dir.join("data");
        Self {
            templates_dir: project_root.join("templates"),
            db_path: data_dir.join(DB_FILENAME),
            config_path: state_dir.join("config.toml"),
            project_root: project_root.to_path_buf(),
            state_dir,
            data_dir,
            root_source: ValueSource::Flag,
            data_source: ValueSource::Default,
            config_source: ValueSource::Default,
        }
    }

    pub fn diagnostics(&self) -> String {
        format!(
            "project_root={} ({})\nstate_dir={}\ntemplates_dir={}\ndata_dir={} ({})\ndb_path={}\nconfig_path={} ({})\npolicy={}",
            normalize_for_display(&self.project_root),
            self.root_source.as_str(),
            normalize_for_display(&self.state_dir),
            normalize_for_display(&self.templates_dir),
            normalize_for_display(&self.data_dir),
            self.data_source.as_str(),
            normalize_for_display(&self.db_path),
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
            MIGRATIONS_POLICY_MESSAGE
        )
    }
}

pub fn inspect_runtime(paths: &ResolvedPaths) -> Result<RuntimeStatus> {
    let project_root_exists = paths.project_root.exists();
    let templates_exists = paths.templates_dir.exists();
    let state_dir_exists = paths.state_dir.exists();
    let data_dir_exists = paths.data_dir.exists();
    let config_exists = paths.config_path.exists();
    let db_exists = paths.db_path.exists();
    let db_size_bytes = if db_exists {
        let metadata = fs::metadata(&paths.db_path)
            .with_context(|| format!("failed to inspect {}", paths.db_path.display()))?;
        Some(metadata.len())
    } else {
        None
    };

    let mut warnings = Vec::new();
    if !templates_exists {
        warnings.push("templates/ is missing; pages cannot be rendered".to_string());
    }
    if !state_dir_exists {
        warnings.push(".pagecms/ is missing; run `pagecms init` first".to_string());
    }
    if !db_exists {
        warnings.push(format!("page database is missing; {MIGRATIONS_POLICY_MESSAGE}"));
    }

    Ok(RuntimeStatus {
        project_root_exists,
        templates_exists,
        state_dir_exists,
        data_dir_exists,
        db_exists,
        db_size_bytes,
        config_exists,
        warnings,
    })
}

pub fn ensure_database_ready(paths: &ResolvedPaths, status: &RuntimeStatus) -> Result<()> {
    if !status.db_exists {
        bail!(
            "Page database not found at {}\n{}\nRun: pagecms init --project-root {}",
            normalize_for_display(&paths.db_path),
            MIGRATIONS_POLICY_MESSAGE,
            normalize_for_display(&paths.project_root)
        );
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct InitOptions {
    pub include_templates: bool,
    pub materialize_config: bool,
    pub force: bool,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            include_templates: true,
            materialize_config: true,
            force: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InitReport {
    pub created_dirs: Vec<PathBuf>,
    pub wrote_config: bool,
    pub wrote_templates: Vec<PathBuf>,
}

pub fn resolve_paths(
    context: &ResolutionContext,
    overrides: &PathOverrides,
) -> Result<ResolvedPaths> {
    resolve_paths_with_lookup(context, overrides, |key| env::var(key).ok())
}

fn resolve_paths_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: F,
) -> Result<ResolvedPaths>
where
    F: Fn(&str) -> Option<String>,
{
    let (project_root, root_source) = match layered(
        overrides.project_root.as_deref(),
        &lookup_env,
        "PAGECMS_PROJECT_ROOT",
        &context.cwd,
    ) {
        Some(resolved) => resolved,
        None => (
            find_project_root(&context.cwd, context.executable_dir.as_deref())
                .context("failed to resolve project root")?,
            ValueSource::Heuristic,
        ),
    };

    let state_dir = project_root.join(STATE_DIR_NAME);
    let (data_dir, data_source) = layered(
        overrides.data_dir.as_deref(),
        &lookup_env,
        "PAGECMS_DATA_DIR",
        &project_root,
    )
    .unwrap_or_else(|| (state_dir.join("data"), ValueSource::Default));
    let (config_path, config_source) = layered(
        overrides.config.as_deref(),
        &lookup_env,
        "PAGECMS_CONFIG",
        &project_root,
    )
    .unwrap_or_else(|| (state_dir.join("config.toml"), ValueSource::Default));

    Ok(ResolvedPaths {
        templates_dir: project_root.join("templates"),
        db_path: data_dir.join(DB_FILENAME),
        project_root,
        state_dir,
        data_dir,
        config_path,
        root_source,
        data_source,
        config_source,
    })
}

/// Flag, then environment variable, each made absolute against `base`.
fn layered<F>(
    flag: Option<&Path>,
    lookup_env: &F,
    env_key: &str,
    base: &Path,
) -> Option<(PathBuf, ValueSource)>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = flag {
        return Some((base.join(path), ValueSource::Flag));
    }
    lookup_env(env_key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .map(|value| (base.join(value), ValueSource::Env))
}

/// Nearest ancestor of the cwd (then of the executable) holding a `.pagecms/` dir.
fn find_project_root(cwd: &Path, executable_dir: Option<&Path>) -> Result<PathBuf> {
    if !cwd.is_absolute() {
        bail!("working directory {} is not absolute", cwd.display());
    }
    let found = cwd
        .ancestors()
        .chain(executable_dir.into_iter().flat_map(Path::ancestors))
        .find(|candidate| candidate.join(STATE_DIR_NAME).is_dir());
    Ok(found.unwrap_or(cwd).to_path_buf())
}

pub fn init_layout(paths: &ResolvedPaths, options: &InitOptions) -> Result<InitReport> {
    let mut created_dirs = Vec::new();

    let mut required_dirs = vec![paths.state_dir.clone(), paths.data_dir.clone()];
    if options.include_templates {
        required_dirs.push(paths.templates_dir.clone());
    }

    for dir in &required_dirs {
        if !dir.exists() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            created_dirs.push(dir.clone());
        }
    }

    let wrote_config = if options.materialize_config {
        write_text_file(&paths.config_path, EMBEDDED_CONFIG, options.force)?
    } else {
        false
    };

    let mut wrote_templates = Vec::new();
    if options.include_templates {
        for (relative, content) in EMBEDDED_TEMPLATES {
            let target = paths.templates_dir.join(relative);
            if write_text_file(&target, content, options.force)? {
                wrote_templates.push(target);
            }
        }
    }

    Ok(InitReport {
        created_dirs,
        wrote_config,
        wrote_templates,
    })
}

fn write_text_file(path: &Path, content: &str, force: bool) -> Result<bool> {
    if path.exists() && !force {
        return Ok(false);
    }

    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create parent directory {}", parent.display()))?;
    fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(true)
}

pub fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
