use std::env;
use std::fs;
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use stockmeta_contracts::credentials::{fingerprint, parse_key_file};
use stockmeta_contracts::events::EventWriter;
use stockmeta_contracts::models::{ModelChoice, ModelSelector, VISION};
use stockmeta_contracts::settings::{FileSettingsStore, SettingsStore};
use stockmeta_contracts::target::AssetReference;
use stockmeta_engine::wire::run_host;
use stockmeta_engine::{describe_asset, EngineConfig, GeminiClient};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "stockmeta",
    version,
    about = "Stock image metadata automation"
)]
struct Cli {
    /// Settings file (defaults to $STOCKMETA_SETTINGS, then the user config dir).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
    /// Log filter for stderr, e.g. `debug` or `stockmeta_engine=trace`.
    #[arg(long, global = true)]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(subcommand)]
    Settings(SettingsCommand),
    Describe(DescribeArgs),
    Host(HostArgs),
}

#[derive(Debug, Subcommand)]
enum SettingsCommand {
    /// Replace the key list with the keys in a text file, one per line.
    Import(ImportArgs),
    /// Change the generation model.
    Model(ModelArgs),
    /// Print the stored settings without raw keys.
    Show,
    /// List known image-capable models.
    Models,
}

#[derive(Debug, Parser)]
struct ImportArgs {
    key_file: PathBuf,
    #[arg(long)]
    model: Option<String>,
}

#[derive(Debug, Parser)]
struct ModelArgs {
    model: String,
}

#[derive(Debug, Parser)]
struct DescribeArgs {
    #[arg(long)]
    image: String,
}

#[derive(Debug, Parser)]
struct HostArgs {
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    settle_ms: Option<u64>,
    #[arg(long)]
    extract_timeout_ms: Option<u64>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("stockmeta error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());
    let settings_path = resolve_settings_path(cli.settings, non_empty_env, dirs::config_dir())?;
    tracing::debug!(path = %settings_path.display(), "using settings file");
    let store = FileSettingsStore::new(settings_path);

    let mut stdout = io::stdout();
    match cli.command {
        Command::Settings(command) => run_settings(command, &store, &mut stdout)?,
        Command::Describe(args) => run_describe(args, Arc::new(store), &mut stdout)?,
        Command::Host(args) => run_host_command(args, Arc::new(store))?,
    }
    Ok(0)
}

/// Logs go to stderr; stdout belongs to command output and the wire.
fn init_logging(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn resolve_settings_path(
    explicit: Option<PathBuf>,
    lookup: impl Fn(&str) -> Option<String>,
    config_dir: Option<PathBuf>,
) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path);
    }
    if let Some(path) = lookup("STOCKMETA_SETTINGS") {
        return Ok(PathBuf::from(path));
    }
    match config_dir {
        Some(dir) => Ok(dir.join("stockmeta").join("settings.json")),
        None => bail!("no config directory available; pass --settings"),
    }
}

fn run_settings(
    command: SettingsCommand,
    store: &dyn SettingsStore,
    out: &mut dyn Write,
) -> Result<()> {
    match command {
        SettingsCommand::Import(args) => {
            let text = fs::read_to_string(&args.key_file)
                .with_context(|| format!("failed reading {}", args.key_file.display()))?;
            let keys = parse_key_file(&text)
                .with_context(|| format!("no keys found in {}", args.key_file.display()))?;
            let model = resolve_model(&ModelSelector::default(), args.model.as_deref())?;
            let label = file_label(&args.key_file);

            let mut settings = store.load()?;
            let count = keys.len();
            settings.import_credentials(&label, keys, &model);
            store.save(&settings)?;
            tracing::info!(count, label = %label, model = %model, "credentials imported");
            writeln!(out, "Imported {count} keys from {label}; model {model}.")?;
        }
        SettingsCommand::Model(args) => {
            let model = resolve_model(&ModelSelector::default(), Some(&args.model))?;
            let mut settings = store.load()?;
            settings
                .select_model(&model)
                .context("import a key file before choosing a model")?;
            store.save(&settings)?;
            writeln!(out, "Model set to {model}.")?;
        }
        SettingsCommand::Show => {
            let settings = store.load()?;
            let summary = json!({
                "credentialFileLabel": settings.credential_file_label,
                "credentialCount": settings.credential_list.len(),
                "credentialFingerprints": settings
                    .credential_list
                    .iter()
                    .map(|key| fingerprint(key))
                    .collect::<Vec<String>>(),
                "selectedModel": settings.selected_model,
                "lastUsedIndex": settings.last_used_index,
            });
            writeln!(out, "{}", serde_json::to_string_pretty(&summary)?)?;
        }
        SettingsCommand::Models => {
            let selector = ModelSelector::default();
            for model in selector.registry().list() {
                writeln!(out, "{}\t{}", model.name, model.capabilities.join(","))?;
            }
        }
    }
    Ok(())
}

/// Known vision models are taken as is and unknown names are kept with a
/// warning. A known model without vision support is refused.
fn resolve_model(selector: &ModelSelector, requested: Option<&str>) -> Result<String> {
    let choice = selector.select(requested, VISION)?;
    match &choice {
        ModelChoice::Unlisted(name) => {
            tracing::warn!(model = %name, "keeping unrecognised model name");
        }
        ModelChoice::Default { reason, .. } => {
            tracing::debug!(%reason, "model defaulted");
        }
        ModelChoice::Listed(_) => {}
    }
    Ok(choice.name().to_string())
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

fn run_describe(
    args: DescribeArgs,
    store: Arc<FileSettingsStore>,
    out: &mut dyn Write,
) -> Result<()> {
    let config = EngineConfig::from_env()?;
    let client = GeminiClient::new(&config);
    let store: Arc<dyn SettingsStore> = store;
    let description = describe_asset(&store, &client, &AssetReference(args.image))?;
    tracing::info!(
        model = %description.model,
        index = description.credential_index,
        "image described"
    );
    writeln!(
        out,
        "{}",
        serde_json::to_string_pretty(&description.record)?
    )?;
    Ok(())
}

fn run_host_command(args: HostArgs, store: Arc<FileSettingsStore>) -> Result<()> {
    let mut config = EngineConfig::from_env()?;
    if let Some(settle_ms) = args.settle_ms {
        config = config.with_settle_delay(Duration::from_millis(settle_ms));
    }
    if let Some(timeout_ms) = args.extract_timeout_ms {
        config = config.with_poll_timeout(Duration::from_millis(timeout_ms));
    }
    let events = args
        .events
        .map(|path| EventWriter::new(path, uuid::Uuid::new_v4().to_string()));
    if let Some(events) = events.as_ref() {
        tracing::info!(
            path = %events.path().display(),
            session_id = events.session_id(),
            "recording events"
        );
    }

    let generator = Arc::new(GeminiClient::new(&config));
    run_host(
        &config,
        store,
        generator,
        events,
        BufReader::new(io::stdin()),
        Box::new(io::stdout()),
    )
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
