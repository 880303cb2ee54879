use anyhow::{bail, Context, Result};
use payflow::{
    agent::{LocalTransport, SimulatedAgent},
    cli::{
        commands::{RunCommand, StatusCommand, ValidateCommand},
        output::*,
        Cli, Command,
    },
    core::{BatchStatus, Settings},
    execution::{CompletionRouter, DispatchGateway, PipelineExecutor, PipelineLoader, WorkflowStateManager},
    persistence::{FileStore, InMemoryCache, InMemoryStateStore, LocalFileStore, RulesCatalog, StateStore},
};
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging; RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to set logging subscriber: {}", e))?;

    match &cli.command {
        Command::Run(cmd) => run_batch(cmd).await?,
        Command::Validate(cmd) => validate_pipelines(cmd).await?,
        Command::Status(cmd) => show_status(cmd).await?,
    }

    Ok(())
}

#[cfg(feature = "sqlite")]
async fn open_state_store(db: Option<&Path>) -> Result<Arc<dyn StateStore>> {
    use payflow::persistence::SqliteStateStore;

    let store = match db {
        Some(path) => SqliteStateStore::new(path).await?,
        None => SqliteStateStore::with_default_path().await?,
    };
    Ok(Arc::new(store))
}

#[cfg(not(feature = "sqlite"))]
async fn open_state_store(_db: Option<&Path>) -> Result<Arc<dyn StateStore>> {
    bail!("Built without the `sqlite` feature; use --in-memory")
}

async fn run_batch(cmd: &RunCommand) -> Result<()> {
    let settings = match &cmd.settings {
        Some(path) => Settings::from_file(path)?,
        None => Settings::default(),
    };
    let settings = Arc::new(settings);

    let catalog = RulesCatalog::from_file(&cmd.rules).context("Failed to load rules catalog")?;
    println!(
        "{}Loaded {} pipeline definitions from {}",
        INFO,
        style(catalog.pipelines.len()).cyan(),
        style(cmd.rules.display()).dim()
    );

    let files = LocalFileStore::new(&cmd.file_root);
    if !files.exists(&cmd.source).await? {
        bail!(
            "Source file {} not found under {}",
            cmd.source,
            cmd.file_root.display()
        );
    }

    let store: Arc<dyn StateStore> = if cmd.in_memory {
        Arc::new(InMemoryStateStore::new())
    } else {
        open_state_store(cmd.db.as_deref()).await?
    };

    let agent = cmd
        .fail_steps
        .iter()
        .fold(SimulatedAgent::new(), |agent, step| agent.failing(step));
    let router = Arc::new(CompletionRouter::new());
    let transport = Arc::new(LocalTransport::new(Arc::new(agent), router.clone()).with_acknowledgements());
    let gateway = Arc::new(DispatchGateway::new(transport.clone(), router));

    let executor = PipelineExecutor::new(
        store,
        Arc::new(InMemoryCache::new()),
        Arc::new(catalog),
        gateway,
        settings,
    );
    executor
        .add_event_handler(|event| println!("{}", format_execution_event(&event)))
        .await;

    let batch_id = cmd
        .batch_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    println!();
    let state = executor
        .run(&batch_id, &cmd.plan, &cmd.pay_freq, &cmd.source)
        .await
        .with_context(|| format!("Batch {} could not be run", batch_id))?;

    println!("\n{}", format_batch_state(&state));

    let escalations = transport.escalations().await;
    for payload in &escalations {
        println!(
            "\n{}Sent to human review:\n{}",
            WARN,
            serde_json::to_string_pretty(payload)?
        );
    }

    if state.status != BatchStatus::Completed {
        std::process::exit(1);
    }

    Ok(())
}

async fn validate_pipelines(cmd: &ValidateCommand) -> Result<()> {
    println!("{}Validating pipelines in {}...", INFO, style(cmd.rules.display()).dim());

    let catalog = RulesCatalog::from_file(&cmd.rules).context("Failed to load rules catalog")?;
    let loader = PipelineLoader::new(
        Arc::new(catalog),
        Arc::new(InMemoryCache::new()),
        &Settings::default(),
    );

    let results = loader.validate_all().await?;
    if results.is_empty() {
        println!("{}No pipeline definitions found", WARN);
        return Ok(());
    }

    let mut invalid = 0;
    let mut report = Vec::new();
    for (key, result) in &results {
        match result {
            Ok(definition) => {
                println!(
                    "{}{} ({} steps)",
                    CHECK,
                    style(key).bold(),
                    style(definition.steps().len()).cyan()
                );
                report.push(serde_json::json!({ "pipeline": key, "valid": true, "definition": definition }));
            }
            Err(e) => {
                invalid += 1;
                println!("{}{}: {}", CROSS, style(key).bold(), style(e).red());
                report.push(serde_json::json!({ "pipeline": key, "valid": false, "error": e.to_string() }));
            }
        }
    }

    if cmd.json {
        println!("\n{}", serde_json::to_string_pretty(&report)?);
    }

    if invalid > 0 {
        println!("\n{}{} of {} pipelines invalid", CROSS, invalid, results.len());
        std::process::exit(1);
    }

    println!("\n{}All {} pipelines are valid", CHECK, results.len());
    Ok(())
}

async fn show_status(cmd: &StatusCommand) -> Result<()> {
    let store = open_state_store(cmd.db.as_deref()).await?;
    let manager = WorkflowStateManager::new(
        store,
        Arc::new(InMemoryCache::new()),
        Arc::new(Settings::default()),
    );

    match manager.find_batch_state(&cmd.batch_id).await? {
        Some(state) if cmd.json => println!("{}", serde_json::to_string_pretty(&state)?),
        Some(state) => println!("{}", format_batch_state(&state)),
        None => {
            println!("{}Batch {} not found", WARN, style(&cmd.batch_id).bold());
            std::process::exit(1);
        }
    }

    Ok(())
}
