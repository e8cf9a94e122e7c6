// ABOUTME: CLI command executing one source file through the orchestrator
// ABOUTME: Builds an ad-hoc tool, streams logs and stats, and prints the final record

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Args;
use colored::*;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use runbox_config::EngineSettings;
use runbox_sandboxes::types::ParamType;
use runbox_sandboxes::{
    ContainerManager, ExecutionEvent, ExecutionOrchestrator, ExecutionStatus, ExecutionStore,
    InMemoryExecutionStore, IsolationTier, LanguageProfiles, LogStream, ResourceLimits,
    SqliteExecutionStore, Tool, ToolParameter, ToolType,
};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Source file to execute
    pub file: PathBuf,

    /// Language name or alias (inferred from the file extension when omitted)
    #[arg(long, short)]
    pub language: Option<String>,

    /// Run in a container instead of the embedded interpreter
    #[arg(long)]
    pub container: bool,

    /// Wall-clock limit in milliseconds
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Memory limit in megabytes
    #[arg(long)]
    pub memory_mb: Option<u64>,

    /// CPU share in percent of one core (container only)
    #[arg(long)]
    pub cpu_percent: Option<u8>,

    /// Allow network access (container only)
    #[arg(long)]
    pub network: bool,

    /// Test file run with the language's test command (container only)
    #[arg(long)]
    pub tests: Option<PathBuf>,

    /// Dependency manifest installed before running (container only)
    #[arg(long)]
    pub dependencies: Option<PathBuf>,

    /// Input as key=value; the value is parsed as JSON when it can be
    #[arg(long = "param", short = 'p', value_parser = parse_param)]
    pub params: Vec<(String, Value)>,

    /// User the execution is recorded under
    #[arg(long, default_value = "cli")]
    pub user: String,

    /// Only print the final record
    #[arg(long, short)]
    pub quiet: bool,
}

pub async fn run_command(args: RunArgs, mut settings: EngineSettings) -> Result<()> {
    let code = read_file(&args.file)?;
    if args.container {
        settings.container_sandbox_enabled = true;
    }

    let profiles = Arc::new(LanguageProfiles::load(
        settings.language_profiles_path.as_deref(),
    )?);
    let language = match &args.language {
        Some(language) => language.trim().to_lowercase(),
        None => infer_language(&args.file, &profiles)?,
    };

    let tool = build_tool(&args, &language);
    let parameters = build_parameters(&args, code)?;

    let mut orchestrator = ExecutionOrchestrator::new(open_store(&settings).await?, settings);
    if args.container {
        let manager = ContainerManager::new()
            .await
            .context("Failed to connect to Docker")?;
        orchestrator = orchestrator.with_container_runtime(Arc::new(manager), profiles);
    }

    let mut events = orchestrator.subscribe();
    let ticket = orchestrator.execute(&tool, parameters, &args.user).await?;
    let id = ticket.execution_id;
    if !args.quiet {
        eprintln!("{} {}", "Execution".dimmed(), id);
    }

    loop {
        match events.recv().await {
            Ok(event) if event.execution_id() == id => {
                if !args.quiet {
                    print_event(&event);
                }
                if let ExecutionEvent::Status { status, .. } = event {
                    if status.is_terminal() {
                        break;
                    }
                }
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!("Skipped {} events", skipped);
                if orchestrator.get_status(&id, &args.user).await?.status.is_terminal() {
                    break;
                }
            }
            Err(RecvError::Closed) => break,
        }
    }

    let record = orchestrator.get_status(&id, &args.user).await?;
    println!("{}", serde_json::to_string_pretty(&record)?);

    if record.status != ExecutionStatus::Completed {
        return Err(anyhow!(
            "execution failed: {}",
            record.error.unwrap_or_else(|| "unknown error".to_string())
        ));
    }
    Ok(())
}

async fn open_store(settings: &EngineSettings) -> Result<Arc<dyn ExecutionStore>> {
    match &settings.database_url {
        Some(url) => {
            let store = SqliteExecutionStore::connect(url)
                .await
                .with_context(|| format!("Failed to open execution store at {}", url))?;
            store.initialize().await?;
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(InMemoryExecutionStore::new())),
    }
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

/// Map a file extension to a language name
fn infer_language(file: &Path, profiles: &LanguageProfiles) -> Result<String> {
    let extension = file
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_lowercase())
        .ok_or_else(|| anyhow!("{} has no extension; pass --language", file.display()))?;

    if matches!(extension.as_str(), "mjs" | "cjs") {
        return Ok("javascript".to_string());
    }

    profiles
        .list()
        .into_iter()
        .find(|profile| profile.extension == extension)
        .map(|profile| profile.id.clone())
        .ok_or_else(|| anyhow!("No language uses the .{} extension; pass --language", extension))
}

/// Limits left unset here are filled from the engine settings on execute
fn build_tool(args: &RunArgs, language: &str) -> Tool {
    let string_param = |name: &str, required: bool| ToolParameter {
        name: name.to_string(),
        param_type: ParamType::String,
        required,
        default: None,
    };

    Tool {
        id: "cli-run".to_string(),
        name: format!("runbox run {}", args.file.display()),
        tool_type: ToolType::Execution,
        command: language.to_string(),
        parameters: vec![
            string_param("code", true),
            string_param("tests", false),
            string_param("dependencies", false),
        ],
        resource_limits: ResourceLimits {
            max_execution_time_ms: args.timeout_ms,
            max_memory_mb: args.memory_mb,
            max_cpu_percent: args.cpu_percent,
            network_access: args.network,
            file_system_access: Vec::new(),
        },
        isolation: if args.container {
            IsolationTier::Container
        } else {
            IsolationTier::InProcess
        },
    }
}

fn build_parameters(args: &RunArgs, code: String) -> Result<HashMap<String, Value>> {
    let mut parameters: HashMap<String, Value> = args.params.iter().cloned().collect();
    parameters.insert("code".to_string(), Value::String(code));

    if let Some(tests) = &args.tests {
        parameters.insert("tests".to_string(), Value::String(read_file(tests)?));
    }
    if let Some(manifest) = &args.dependencies {
        parameters.insert("dependencies".to_string(), Value::String(read_file(manifest)?));
    }

    Ok(parameters)
}

fn parse_param(raw: &str) -> std::result::Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty parameter name in '{}'", raw));
    }

    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn print_event(event: &ExecutionEvent) {
    match event {
        ExecutionEvent::Status { status, error, .. } => {
            let label = match status {
                ExecutionStatus::Completed => status.to_string().green(),
                ExecutionStatus::Failed => status.to_string().red(),
                _ => status.to_string().cyan(),
            };
            match error {
                Some(error) => eprintln!("{} {} ({})", "status".dimmed(), label, error),
                None => eprintln!("{} {}", "status".dimmed(), label),
            }
        }
        ExecutionEvent::Log {
            stream, message, ..
        } => match stream {
            LogStream::Stdout => eprintln!("{}", message),
            LogStream::Stderr => eprintln!("{}", message.yellow()),
        },
        ExecutionEvent::Stats {
            memory_usage_mb,
            cpu_percent,
            ..
        } => eprintln!(
            "{}",
            format!("stats {} MB, {:.1}% cpu", memory_usage_mb, cpu_percent).dimmed()
        ),
    }
}
