use std::env;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, bail};
use badgebot_core::classify::{ActionBucket, Bucket};
use badgebot_core::config::{BotConfig, load_config};
use badgebot_core::driver::{LiveFactSource, classify_project, run_all, select_projects};
use badgebot_core::output::OutputFiles;
use badgebot_core::query_service::QueryServiceClient;
use badgebot_core::replica::Replica;
use badgebot_core::runtime::{
    InitOptions, PathOverrides, ResolutionContext, ResolvedPaths, init_layout, inspect_runtime,
    normalize_for_display, resolve_paths,
};
use badgebot_core::wikibase::{WikibaseClient, WikibaseClientConfig};
use clap::{Args, CommandFactory, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::MakeWriterExt;

#[derive(Debug, Parser)]
#[command(
    name = "badgebot",
    version,
    about = "Maintain sitelink-to-redirect badges on Wikidata sitelinks"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    output_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    replica_dir: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[arg(
        long,
        global = true,
        value_name = "FILTER",
        help = "Log filter (overrides RUST_LOG), e.g. info or badgebot_core=debug"
    )]
    log_level: Option<String>,
    #[arg(
        long,
        global = true,
        value_name = "PATH",
        help = "Also append logs to this file"
    )]
    log_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    config: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    replica_dir: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            config: cli.config.clone(),
            output_dir: cli.output_dir.clone(),
            replica_dir: cli.replica_dir.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Create .badgebot/config.toml and the output directory")]
    Init(InitArgs),
    #[command(about = "Print the resolved configuration and paths")]
    Config,
    #[command(about = "Classify one project and print its bucket counts")]
    Classify(ClassifyArgs),
    #[command(about = "Reconcile badges across every selected project")]
    Run(RunArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config file")]
    force: bool,
}

#[derive(Debug, Args)]
struct ClassifyArgs {
    #[arg(value_name = "DBNAME")]
    db_name: String,
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(long, help = "Write to the repository instead of simulating")]
    live: bool,
    #[arg(long = "project", value_name = "DBNAME", help = "Only process this project")]
    projects: Vec<String>,
    #[arg(long = "enable", value_name = "BUCKET", help = "Enable an action bucket")]
    enable: Vec<String>,
    #[arg(long, help = "Enable every action bucket")]
    all_buckets: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Config) => run_config(&runtime),
        Some(Commands::Classify(args)) => {
            let paths = resolve_runtime_paths(&runtime)?;
            let log_file = log_path(&paths, cli.log_file.as_deref());
            init_logging(cli.log_level.as_deref(), log_file.as_deref())?;
            run_classify(&runtime, &paths, args)
        }
        Some(Commands::Run(args)) => {
            let paths = resolve_runtime_paths(&runtime)?;
            let log_file = log_path(&paths, cli.log_file.as_deref());
            init_logging(cli.log_level.as_deref(), log_file.as_deref())?;
            run_reconcile(&runtime, &paths, args)
        }
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

/// Relative log files land in the output directory.
fn log_path(paths: &ResolvedPaths, log_file: Option<&Path>) -> Option<PathBuf> {
    log_file.map(|path| {
        if path.is_relative() {
            paths.output_dir.join(path)
        } else {
            path.to_path_buf()
        }
    })
}

fn init_logging(level: Option<&str>, log_file: Option<&Path>) -> Result<()> {
    let filter = match level {
        Some(level) => EnvFilter::try_new(level)
            .with_context(|| format!("invalid log filter `{level}`"))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    match log_file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            builder
                .with_ansi(false)
                .with_writer(std::io::stderr.and(Mutex::new(file)))
                .init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(&paths, &InitOptions { force: args.force })?;

    println!("Initialized badgebot runtime layout");
    println!("project_root: {}", normalize_for_display(&paths.project_root));
    println!("state_dir: {}", normalize_for_display(&paths.state_dir));
    println!("output_dir: {}", normalize_for_display(&paths.output_dir));
    println!("replica_dir: {}", normalize_for_display(&paths.replica_dir));
    println!("config_path: {}", normalize_for_display(&paths.config_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_config(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths);
    let config = load_runtime_config(&paths)?;

    println!("project_root: {}", normalize_for_display(&paths.project_root));
    println!(
        "config_path: {} ({})",
        normalize_for_display(&paths.config_path),
        if status.config_exists { "found" } else { "missing" }
    );
    println!("output_dir: {}", normalize_for_display(&paths.output_dir));
    println!(
        "replica_dir: {} ({})",
        normalize_for_display(&paths.replica_dir),
        if status.meta_db_exists {
            "meta.db found"
        } else {
            "meta.db missing"
        }
    );
    println!("run.simulate: {}", config.run.simulate);
    println!("run.project_delay_ms: {}", config.run.project_delay_ms);
    println!(
        "run.redirect_length_cutoff: {}",
        config.run.redirect_length_cutoff
    );
    println!(
        "run.only_projects: {}",
        format_list(&config.run.only_projects)
    );
    for bucket in ActionBucket::ALL {
        println!(
            "buckets.{}: {}",
            bucket.as_str(),
            config.buckets.enabled(bucket)
        );
    }
    println!(
        "badges.sitelink_to_redirect: {}",
        config.badges.sitelink_to_redirect
    );
    println!(
        "badges.intentional_sitelink_to_redirect: {}",
        config.badges.intentional_sitelink_to_redirect
    );
    println!("endpoints.repo_api_url: {}", config.endpoints.repo_api_url);
    println!(
        "endpoints.query_service_url: {}",
        config.endpoints.query_service_url
    );
    println!("endpoints.user_agent: {}", config.endpoints.user_agent());
    println!(
        "report.page: {}",
        config.report.page.as_deref().unwrap_or("<none>")
    );
    if !status.warnings.is_empty() {
        println!("warnings:");
        for warning in &status.warnings {
            println!("  - {warning}");
        }
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_classify(runtime: &RuntimeOptions, paths: &ResolvedPaths, args: ClassifyArgs) -> Result<()> {
    let config = load_runtime_config(paths)?;
    let mut facts = live_fact_source(paths, &config)?;
    let stats = classify_project(&config, &mut facts, &args.db_name)?;

    println!("project: {}", args.db_name);
    for bucket in Bucket::ALL {
        println!("{}: {}", bucket.as_str(), stats.get(bucket));
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_reconcile(runtime: &RuntimeOptions, paths: &ResolvedPaths, args: RunArgs) -> Result<()> {
    let mut config = load_runtime_config(paths)?;
    if args.live {
        config.run.simulate = false;
    }
    if !args.projects.is_empty() {
        config.run.only_projects = args.projects.clone();
    }
    if args.all_buckets {
        config.buckets.enable_all();
    }
    for name in &args.enable {
        let Some(bucket) = ActionBucket::parse(name) else {
            bail!(
                "unknown bucket `{name}` (expected one of: {})",
                ActionBucket::ALL.map(ActionBucket::as_str).join(", ")
            );
        };
        config.buckets.set(bucket, true);
    }

    let mut facts = live_fact_source(paths, &config)?;
    let mut client = WikibaseClient::new(WikibaseClientConfig::from_endpoints(&config.endpoints))?;
    let replica = Replica::new(&paths.replica_dir);
    for project in select_projects(replica.list_projects()?, &config.run.only_projects) {
        client.register_project(&project);
    }
    if !config.run.simulate {
        let (username, password) = bot_credentials()?;
        client.login(&username, &password)?;
        info!(user = username.as_str(), "logged in to repository");
    }

    let output = OutputFiles::new(&paths.output_dir);
    let summary = run_all(&config, &mut facts, &mut client, &output)?;

    println!("simulate: {}", summary.simulate);
    println!("projects_seen: {}", summary.projects_seen);
    println!("projects_processed: {}", summary.projects_processed);
    println!("projects_failed: {}", summary.projects_failed);
    println!("applied: {}", summary.applied);
    println!("simulated: {}", summary.simulated);
    println!("skipped: {}", summary.skipped);
    println!(
        "aborted_buckets: {}",
        format_list(&summary.aborted_buckets)
    );
    println!("report_rows: {}", summary.report_rows);
    println!("report_published: {}", summary.report_published);
    println!("api_requests: {}", client.request_count());
    println!("output_dir: {}", normalize_for_display(output.dir()));
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn live_fact_source(paths: &ResolvedPaths, config: &BotConfig) -> Result<LiveFactSource> {
    Ok(LiveFactSource::new(
        Replica::new(&paths.replica_dir),
        QueryServiceClient::new(&config.endpoints)?,
        config.badges.clone(),
    ))
}

fn load_runtime_config(paths: &ResolvedPaths) -> Result<BotConfig> {
    let config = load_config(&paths.config_path)?.with_process_env();
    config.validate()?;
    Ok(config)
}

fn bot_credentials() -> Result<(String, String)> {
    let username = env::var("BADGEBOT_BOT_USER").unwrap_or_default();
    let password = env::var("BADGEBOT_BOT_PASS").unwrap_or_default();
    if username.trim().is_empty() || password.trim().is_empty() {
        bail!("live runs need BADGEBOT_BOT_USER and BADGEBOT_BOT_PASS (environment or .env)");
    }
    Ok((username, password))
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        config: runtime.config.clone(),
        output_dir: runtime.output_dir.clone(),
        replica_dir: runtime.replica_dir.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    resolve_paths(&context, &overrides)
}

fn format_list(values: &[String]) -> String {
    if values.is_empty() {
        "<none>".to_string()
    } else {
        values.join(", ")
    }
}
