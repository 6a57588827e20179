use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use serde::Serialize;
use tracing::debug;
use tracing_subscriber::EnvFilter;
use transync_core::lock::LockStatus;
use transync_core::manager::{LocaleSelection, MakeRequest, Manager, RunOutcome};
use transync_core::runtime::{
    InitOptions, PathOverrides, ResolutionContext, ResolvedPaths, init_layout, inspect_runtime,
    resolve_paths,
};
use transync_core::store::EntryFilter;
use transync_core::sync::IngestReport;

#[derive(Debug, Parser)]
#[command(
    name = "transync",
    version,
    about = "Extract translatable strings into gettext catalogs and keep them in sync with a translation store"
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
    #[arg(short, long, global = true, help = "Log debug output to stderr")]
    verbose: bool,
    #[arg(long, global = true, help = "Print command results as JSON")]
    json: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
    json: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            data_dir: cli.data_dir.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
            json: cli.json,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    Init(InitArgs),
    #[command(about = "Extract source strings and merge them into every selected catalog")]
    Make(MakeArgs),
    #[command(about = "Render stored translations back into catalog files")]
    Compile(CompileArgs),
    #[command(about = "Load every catalog file into the translation store")]
    Load,
    Status,
    #[command(about = "Snapshot every catalog file into the store")]
    Backup,
    Backups(BackupsArgs),
    Entries(EntriesArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config file")]
    force: bool,
    #[arg(long, help = "Skip writing .transync/config.toml")]
    no_config: bool,
}

#[derive(Debug, Args)]
struct MakeArgs {
    #[arg(short, long = "locale", value_name = "LOCALE", help = "Locale to process (repeatable)")]
    locales: Vec<String>,
    #[arg(short, long = "domain", value_name = "DOMAIN", help = "Domain to process (repeatable)")]
    domains: Vec<String>,
    #[arg(short, long, conflicts_with = "locales", help = "Process every locale directory")]
    all: bool,
}

#[derive(Debug, Args)]
struct CompileArgs {
    #[arg(short, long, value_name = "LOCALE", help = "Only render this language")]
    locale: Option<String>,
}

#[derive(Debug, Args)]
struct BackupsArgs {
    #[command(subcommand)]
    command: BackupsSubcommand,
}

#[derive(Debug, Subcommand)]
enum BackupsSubcommand {
    List,
    Restore { id: i64 },
}

#[derive(Debug, Args)]
struct EntriesArgs {
    #[command(subcommand)]
    command: EntriesSubcommand,
}

#[derive(Debug, Subcommand)]
enum EntriesSubcommand {
    List(EntriesListArgs),
    Set(EntriesSetArgs),
}

#[derive(Debug, Args)]
struct EntriesListArgs {
    #[arg(long)]
    language: Option<String>,
    #[arg(long)]
    domain: Option<String>,
    #[arg(long, value_name = "DIR")]
    locale_parent_dir: Option<String>,
    #[arg(long, help = "Substring matched against originals and translations")]
    search: Option<String>,
    #[arg(long)]
    untranslated: bool,
    #[arg(long)]
    include_obsolete: bool,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
struct EntriesSetArgs {
    id: i64,
    translation: String,
    #[arg(long = "plural", value_name = "TEXT", help = "Plural form translation, in msgstr[n] order (repeatable)")]
    plurals: Vec<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Make(args)) => run_make(&runtime, args),
        Some(Commands::Compile(args)) => run_compile(&runtime, args),
        Some(Commands::Load) => run_load(&runtime),
        Some(Commands::Status) => run_status(&runtime),
        Some(Commands::Backup) => run_backup(&runtime),
        Some(Commands::Backups(BackupsArgs { command })) => match command {
            BackupsSubcommand::List => run_backups_list(&runtime),
            BackupsSubcommand::Restore { id } => run_backups_restore(&runtime, id),
        },
        Some(Commands::Entries(EntriesArgs { command })) => match command {
            EntriesSubcommand::List(args) => run_entries_list(&runtime, args),
            EntriesSubcommand::Set(args) => run_entries_set(&runtime, args),
        },
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(
        &paths,
        &InitOptions {
            materialize_config: !args.no_config,
            force: args.force,
        },
    )?;

    println!("Initialized transync runtime layout");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("state_dir: {}", normalize_path(&paths.state_dir));
    println!("data_dir: {}", normalize_path(&paths.data_dir));
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("config_path: {}", normalize_path(&paths.config_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_make(runtime: &RuntimeOptions, args: MakeArgs) -> Result<()> {
    if args.locales.is_empty() && !args.all {
        bail!("make requires at least one --locale or --all");
    }
    let paths = resolve_runtime_paths(runtime)?;
    let manager = Manager::open(paths.clone())?;
    let request = MakeRequest {
        domains: args.domains,
        locales: if args.all {
            LocaleSelection::All
        } else {
            LocaleSelection::Only(args.locales)
        },
    };

    let report = match manager.make(&request)? {
        RunOutcome::Completed(report) => report,
        RunOutcome::AlreadyRunning => return print_already_running(runtime, "make"),
    };
    if runtime.json {
        return print_json(&report);
    }

    println!("make");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("locale_root: {} ({})", report.locale_root, report.root_kind);
    println!("toolchain: {}", report.toolchain);
    println!("languages: {}", join_or_none(&report.languages));
    if !report.skipped_locales.is_empty() {
        println!("skipped_locales: {}", report.skipped_locales.join(", "));
    }
    println!("backups: {}", report.backups);
    println!("files_scanned: {}", report.files_scanned);
    for domain in &report.domains {
        println!(
            "domain.{}: files={} with_messages={}",
            domain.domain, domain.files_processed, domain.files_with_messages
        );
        for catalog in &domain.catalogs {
            println!(
                "catalog.{}.{}: {}",
                catalog.language,
                catalog.domain,
                catalog.change.as_str()
            );
        }
    }
    println!("ingested_catalogs: {}", report.ingest.catalogs.len());
    println!("ingested_entries: {}", report.ingest.entry_count());
    print_ingest_failures(&report.ingest);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_compile(runtime: &RuntimeOptions, args: CompileArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let manager = Manager::open(paths.clone())?;
    let report = match manager.compile(args.locale.as_deref())? {
        RunOutcome::Completed(report) => report,
        RunOutcome::AlreadyRunning => return print_already_running(runtime, "compile"),
    };
    if runtime.json {
        return print_json(&report);
    }

    println!("compile");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("catalogs: {}", report.catalogs.len());
    println!("written: {}", report.written_count());
    for catalog in &report.catalogs {
        println!(
            "catalog.{}: entries={} written={} backup={}",
            catalog.scope,
            catalog.entries,
            format_flag(catalog.written),
            catalog
                .backup_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "n/a".to_string())
        );
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_load(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = match Manager::open(paths.clone())?.load_from_po()? {
        RunOutcome::Completed(report) => report,
        RunOutcome::AlreadyRunning => return print_already_running(runtime, "load"),
    };
    if runtime.json {
        return print_json(&report);
    }

    println!("load");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("catalogs: {}", report.catalogs.len());
    println!("entries: {}", report.entry_count());
    print_ingest_failures(&report);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn print_ingest_failures(report: &IngestReport) {
    println!("failures: {}", report.failures.len());
    for failure in &report.failures {
        println!("  - {}: {}", failure.path, failure.message);
    }
}

#[derive(Debug, Serialize)]
struct StatusReport {
    project_root: String,
    state_dir_exists: bool,
    db_exists: bool,
    db_size_bytes: Option<u64>,
    config_exists: bool,
    lock: LockStatus,
    warnings: Vec<String>,
}

fn run_status(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;
    let manager = Manager::open(paths.clone())?;
    let report = StatusReport {
        project_root: normalize_path(&paths.project_root),
        state_dir_exists: status.state_dir_exists,
        db_exists: status.db_exists,
        db_size_bytes: status.db_size_bytes,
        config_exists: status.config_exists,
        lock: manager.status()?,
        warnings: status.warnings,
    };
    if runtime.json {
        return print_json(&report);
    }

    println!("runtime status");
    println!("project_root: {}", report.project_root);
    println!("state_dir_exists: {}", format_flag(report.state_dir_exists));
    println!("db_exists: {}", format_flag(report.db_exists));
    println!(
        "db_size_bytes: {}",
        report
            .db_size_bytes
            .map(|size| size.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    );
    println!("config_exists: {}", format_flag(report.config_exists));
    println!("running: {}", format_flag(report.lock.running));
    if let Some(holder) = &report.lock.holder {
        println!("lock.pid: {}", holder.pid);
        println!("lock.started_unix: {}", holder.started_unix);
    }
    if !report.warnings.is_empty() {
        println!("warnings:");
        for warning in &report.warnings {
            println!("  - {warning}");
        }
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_backup(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let backups = match Manager::open(paths.clone())?.backup_all()? {
        RunOutcome::Completed(backups) => backups,
        RunOutcome::AlreadyRunning => return print_already_running(runtime, "backup"),
    };
    if runtime.json {
        return print_json(&backups);
    }

    println!("backup");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("backups: {}", backups.len());
    for backup in &backups {
        println!(
            "backup.{}: {}/{}/{} hash={}",
            backup.id, backup.locale_parent_dir, backup.language, backup.domain, backup.content_hash
        );
    }
    Ok(())
}

fn run_backups_list(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let backups = Manager::open(paths)?.list_backups()?;
    if runtime.json {
        return print_json(&backups);
    }

    println!("backups.count: {}", backups.len());
    if backups.is_empty() {
        println!("backups: <none>");
    }
    for backup in &backups {
        println!(
            "backup.{}: {}/{}/{} hash={} bytes={} created_unix={}",
            backup.id,
            backup.locale_parent_dir,
            backup.language,
            backup.domain,
            backup.content_hash,
            backup.bytes,
            backup.created_unix
        );
    }
    Ok(())
}

fn run_backups_restore(runtime: &RuntimeOptions, id: i64) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = match Manager::open(paths)?.restore(id)? {
        RunOutcome::Completed(report) => report,
        RunOutcome::AlreadyRunning => return print_already_running(runtime, "restore"),
    };
    if runtime.json {
        return print_json(&report);
    }

    println!("restore");
    println!("backup: {}", report.backup.id);
    println!("path: {}", report.path);
    println!("entries: {}", report.stats.entries);
    println!("obsoleted: {}", report.stats.obsoleted);
    println!("deleted: {}", report.stats.deleted);
    Ok(())
}

fn run_entries_list(runtime: &RuntimeOptions, args: EntriesListArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let entries = Manager::open(paths)?.list_entries(&EntryFilter {
        language: args.language,
        domain: args.domain,
        locale_parent_dir: args.locale_parent_dir,
        search: args.search,
        untranslated_only: args.untranslated,
        include_obsolete: args.include_obsolete,
        limit: args.limit,
    })?;
    if runtime.json {
        return print_json(&entries);
    }

    println!("entries.count: {}", entries.len());
    for entry in &entries {
        let mut markers = Vec::new();
        if entry.is_obsolete {
            markers.push("obsolete");
        }
        if entry.is_dirty {
            markers.push("dirty");
        }
        if entry.flags.iter().any(|flag| flag == "fuzzy") {
            markers.push("fuzzy");
        }
        println!(
            "entry.{}: [{}] {:?} -> {:?}{}",
            entry.id,
            entry.scope(),
            entry.original.replace('\u{4}', " | "),
            entry.translation,
            if markers.is_empty() {
                String::new()
            } else {
                format!(" ({})", markers.join(", "))
            }
        );
    }
    Ok(())
}

fn run_entries_set(runtime: &RuntimeOptions, args: EntriesSetArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let plurals = (!args.plurals.is_empty()).then_some(args.plurals.as_slice());
    let entry =
        Manager::open(paths)?.set_translation(args.id, &args.translation, plurals)?;
    if runtime.json {
        return print_json(&entry);
    }

    println!("entry: {}", entry.id);
    println!("scope: {}", entry.scope());
    println!("translation: {:?}", entry.translation);
    println!("dirty: {}", format_flag(entry.is_dirty));
    Ok(())
}

fn print_already_running(runtime: &RuntimeOptions, command: &str) -> Result<()> {
    if runtime.json {
        return print_json(&RunOutcome::<()>::AlreadyRunning);
    }
    println!("{command}: skipped (another run holds the lock)");
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_diagnostics(runtime: &RuntimeOptions, paths: &ResolvedPaths) {
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
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

    let paths = resolve_paths(&context, &overrides)?;
    debug!(
        project_root = %normalize_path(&paths.project_root),
        source = paths.root_source.as_str(),
        "resolved runtime paths"
    );
    Ok(paths)
}

fn join_or_none(values: &[String]) -> String {
    if values.is_empty() {
        "<none>".to_string()
    } else {
        values.join(", ")
    }
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
