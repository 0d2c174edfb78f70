use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use pagecms_core::config::{PageSettings, load_config};
use pagecms_core::fixtures::{ImportOptions, import_fixture_file};
use pagecms_core::http::{PageRequest, PageResponse, User};
use pagecms_core::migrate::{pending_migration_count, run_migrations};
use pagecms_core::render::{AutoRender, FileTemplateRenderer, Rendered};
use pagecms_core::runtime::{
    InitOptions, MIGRATIONS_POLICY_MESSAGE, PathOverrides, ResolutionContext, ResolvedPaths,
    ensure_database_ready, init_layout, inspect_runtime, normalize_for_display, resolve_paths,
};
use pagecms_core::search::{PageIndex, search};
use pagecms_core::store::SqliteStore;
use pagecms_core::views::Details;

#[derive(Debug, Parser)]
#[command(
    name = "pagecms",
    version,
    about = "Resolve, render and index pages of a hierarchical CMS"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            data_dir: cli.data_dir.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    Init(InitArgs),
    Db(DbArgs),
    #[command(about = "Import pages and aliases from a JSON or YAML fixture")]
    Import(ImportArgs),
    #[command(about = "Resolve a path and print the rendered page or redirect")]
    Resolve(ResolveArgs),
    #[command(about = "List project templates")]
    Templates,
    Index(IndexArgs),
    Search(SearchArgs),
    Status,
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Skip writing templates/")]
    no_templates: bool,
    #[arg(long, help = "Overwrite existing config and template files")]
    force: bool,
    #[arg(long, help = "Skip writing .pagecms/config.toml")]
    no_config: bool,
}

#[derive(Debug, Args)]
struct DbArgs {
    #[command(subcommand)]
    command: DbSubcommand,
}

#[derive(Debug, Subcommand)]
enum DbSubcommand {
    Migrate,
    Stats,
}

#[derive(Debug, Args)]
struct ImportArgs {
    path: PathBuf,
    #[arg(long, help = "Delete existing pages and aliases first")]
    replace: bool,
}

#[derive(Debug, Args)]
struct ResolveArgs {
    path: String,
    #[arg(long, value_name = "LANG")]
    lang: Option<String>,
    #[arg(long, help = "Resolve as an authenticated staff user")]
    staff: bool,
    #[arg(long, help = "Send X-Requested-With: XMLHttpRequest")]
    ajax: bool,
    #[arg(long, value_name = "HEADER")]
    accept_language: Option<String>,
    #[arg(long, value_name = "HEADER")]
    cookie: Option<String>,
    #[arg(long, help = "Do not hand the request to a delegated urlconf")]
    no_delegation: bool,
    #[arg(long, help = "Print the template context instead of rendering")]
    only_context: bool,
}

#[derive(Debug, Args)]
struct IndexArgs {
    #[command(subcommand)]
    command: IndexSubcommand,
}

#[derive(Debug, Subcommand)]
enum IndexSubcommand {
    Rebuild,
    Update,
}

#[derive(Debug, Args)]
struct SearchArgs {
    query: String,
    #[arg(long, default_value_t = 20)]
    limit: usize,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let runtime = RuntimeOptions::from_cli(&cli);
    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Db(DbArgs { command })) => match command {
            DbSubcommand::Migrate => run_db_migrate(&runtime),
            DbSubcommand::Stats => run_db_stats(&runtime),
        },
        Some(Commands::Import(args)) => run_import(&runtime, args),
        Some(Commands::Resolve(args)) => run_resolve(&runtime, args),
        Some(Commands::Templates) => run_templates(&runtime),
        Some(Commands::Index(IndexArgs { command })) => run_index(&runtime, command),
        Some(Commands::Search(args)) => run_search(&runtime, args),
        Some(Commands::Status) => run_status(&runtime),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(
        &paths,
        &InitOptions {
            include_templates: !args.no_templates,
            materialize_config: !args.no_config,
            force: args.force,
        },
    )?;
    let migrations = run_migrations(&paths)?;
    println!("Initialized pagecms runtime layout");
    println!("project_root: {}", normalize_for_display(&paths.project_root));
    println!("templates: {}", normalize_for_display(&paths.templates_dir));
    println!("state_dir: {}", normalize_for_display(&paths.state_dir));
    println!("data_dir: {}", normalize_for_display(&paths.data_dir));
    println!("db_path: {}", normalize_for_display(&paths.db_path));
    println!("config_path: {}", normalize_for_display(&paths.config_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    println!("wrote_templates: {}", report.wrote_templates.len());
    println!("migrations.applied: {}", migrations.applied.len());
    println!("schema_version: {}", migrations.current_version);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_db_migrate(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = run_migrations(&paths)?;
    println!("db migrate");
    println!("db_path: {}", normalize_for_display(&paths.db_path));
    if report.applied.is_empty() {
        println!("applied: <none>");
    } else {
        for migration in &report.applied {
            println!("applied: v{:03}_{}", migration.version, migration.name);
        }
    }
    println!("schema_version: {}", report.current_version);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_db_stats(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let settings = load_settings(&paths)?;
    let store = open_store(&paths, &settings)?;
    let stats = store.stats()?;
    println!("db stats");
    println!("db_path: {}", normalize_for_display(&paths.db_path));
    println!("pages: {}", stats.pages);
    println!("contents: {}", stats.contents);
    println!("aliases: {}", stats.aliases);
    for (status, count) in &stats.by_status {
        println!("pages.{status}: {count}");
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_import(runtime: &RuntimeOptions, args: ImportArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let settings = load_settings(&paths)?;
    let mut store = open_store(&paths, &settings)?;
    let report = import_fixture_file(
        &mut store,
        &args.path,
        ImportOptions {
            replace: args.replace,
        },
    )?;
    println!("import");
    println!("fixture: {}", normalize_for_display(&args.path));
    println!("replace: {}", args.replace);
    println!("pages: {}", report.pages);
    println!("contents: {}", report.contents);
    println!("aliases: {}", report.aliases);
    println!("redirects: {}", report.redirects);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_resolve(runtime: &RuntimeOptions, args: ResolveArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let settings = load_settings(&paths)?;
    let store = open_store(&paths, &settings)?;

    let mut request = PageRequest::new(format!("/{}", args.path.trim_start_matches('/')));
    if args.staff {
        request = request.with_user(User::staff());
    }
    if args.ajax {
        request = request.with_header("X-Requested-With", "XMLHttpRequest");
    }
    if let Some(header) = &args.accept_language {
        request = request.with_header("Accept-Language", header.clone());
    }
    if let Some(cookie) = &args.cookie {
        request = request.with_header("Cookie", cookie.clone());
    }

    let view = AutoRender::new(
        Details::new(&store, &store, &settings),
        FileTemplateRenderer::new(&paths.templates_dir),
    );
    let outcome = view.call(
        &request,
        Some(args.path.as_str()),
        args.lang.as_deref(),
        !args.no_delegation,
        args.only_context,
    );
    let rendered = match outcome {
        Ok(rendered) => rendered,
        Err(error) => {
            println!("status: {}", error.status());
            return Err(error.into());
        }
    };

    match rendered {
        Rendered::Context { template, context } => {
            println!("status: 200");
            println!("template: {template}");
            println!("{}", serde_json::to_string_pretty(&context)?);
        }
        Rendered::Response(PageResponse::PermanentRedirect { location }) => {
            println!("status: 301");
            println!("location: {location}");
        }
        Rendered::Response(PageResponse::Content {
            status,
            content_type,
            body,
        }) => {
            println!("status: {status}");
            println!("content_type: {content_type}");
            println!();
            println!("{body}");
        }
        Rendered::Response(response @ PageResponse::Render { .. }) => {
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_templates(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let renderer = FileTemplateRenderer::new(&paths.templates_dir);
    let templates = renderer.list_templates()?;
    println!("templates");
    println!("templates_dir: {}", normalize_for_display(&paths.templates_dir));
    println!("templates.count: {}", templates.len());
    if templates.is_empty() {
        println!("templates: <none> (run `pagecms init`)");
    } else {
        for name in templates {
            println!("templates.name: {name}");
        }
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_index(runtime: &RuntimeOptions, command: IndexSubcommand) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let settings = load_settings(&paths)?;
    let mut store = open_store(&paths, &settings)?;
    let renderer = FileTemplateRenderer::new(&paths.templates_dir);
    let index = PageIndex::new(&settings).with_renderer(&renderer);
    let (label, report) = match command {
        IndexSubcommand::Rebuild => ("index rebuild", index.rebuild_index(&mut store)?),
        IndexSubcommand::Update => ("index update", index.update_index(&mut store)?),
    };
    println!("{label}");
    println!("db_path: {}", normalize_for_display(&paths.db_path));
    println!("documents: {}", report.documents);
    println!("written: {}", report.written);
    println!("unchanged: {}", report.unchanged);
    println!("removed: {}", report.removed);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_search(runtime: &RuntimeOptions, args: SearchArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let settings = load_settings(&paths)?;
    let store = open_store(&paths, &settings)?;
    let query = args.query.trim();
    if query.is_empty() {
        bail!("search requires a non-empty query");
    }
    let hits = search(store.connection(), query, args.limit)?;
    println!("search");
    println!("query: {query}");
    println!("hits.count: {}", hits.len());
    if hits.is_empty() {
        println!("hits: <none>");
    } else {
        for hit in hits {
            println!("hits.page: {} {} ({})", hit.page_id, hit.url, hit.title);
        }
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_status(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;
    println!("runtime status");
    println!("project_root: {}", normalize_for_display(&paths.project_root));
    println!(
        "project_root_exists: {}",
        format_flag(status.project_root_exists)
    );
    println!("templates_exists: {}", format_flag(status.templates_exists));
    println!("state_dir_exists: {}", format_flag(status.state_dir_exists));
    println!("data_dir_exists: {}", format_flag(status.data_dir_exists));
    println!("db_exists: {}", format_flag(status.db_exists));
    println!(
        "db_size_bytes: {}",
        status
            .db_size_bytes
            .map(|size| size.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    );
    println!("config_exists: {}", format_flag(status.config_exists));
    println!("pending_migrations: {}", pending_migration_count(&paths)?);

    let settings = load_settings(&paths)?;
    println!("languages: {}", settings.language_keys().join(","));
    println!("default_language: {}", settings.default_language);
    println!("use_language_prefix: {}", settings.use_language_prefix);
    println!("default_template: {}", settings.default_template);
    if !status.warnings.is_empty() {
        println!("warnings:");
        for warning in &status.warnings {
            println!("  - {warning}");
        }
    }
    println!("policy: {MIGRATIONS_POLICY_MESSAGE}");
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn load_settings(paths: &ResolvedPaths) -> Result<PageSettings> {
    load_config(&paths.config_path)?.settings()
}

fn open_store(paths: &ResolvedPaths, settings: &PageSettings) -> Result<SqliteStore> {
    let status = inspect_runtime(paths)?;
    ensure_database_ready(paths, &status)?;
    if pending_migration_count(paths)? > 0 {
        bail!("page database schema is out of date. {MIGRATIONS_POLICY_MESSAGE}");
    }
    SqliteStore::open(paths, &settings.default_language)
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        data_dir: runtime.data_dir.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    resolve_paths(&context, &overrides)
}

fn print_diagnostics(runtime: &RuntimeOptions, paths: &ResolvedPaths) {
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
