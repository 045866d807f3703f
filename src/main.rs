use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use hearth_core::chain::{ChainDefinition, ChainId};
use hearth_core::config::AppConfig;
use hearth_core::event::EventBus;
use hearth_core::record::RunStatus;
use hearth_core::traits::{RecordSink, ToolDispatcher};
use hearth_core::types::{Caller, ChainEvent};

use hearth_engine::{ChainRunner, ChainTree, JsonlRecordSink, RunRequest};
use hearth_memory::SqliteStore;
use hearth_tools::ToolRegistry;

#[derive(Parser)]
#[command(name = "hearth", version, about = "Homelab assistant tool-chain runner")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "hearth.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a stored chain
    Run {
        chain_id: i64,
        /// Caller group (defaults to permissions.default_group)
        #[arg(long)]
        group: Option<String>,
        /// Run input as key=value (value parsed as JSON when possible)
        #[arg(long = "input", short = 'i')]
        inputs: Vec<String>,
    },
    /// Validate a stored chain or a definition file
    Validate {
        chain_id: Option<i64>,
        /// Chain definition JSON file
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Store a chain definition JSON file (replaces a chain with the same id)
    Import { path: PathBuf },
    /// List stored chains
    Chains,
    /// Delete a stored chain
    Delete { chain_id: i64 },
    /// Show recent execution records of a chain
    Records {
        chain_id: i64,
        #[arg(long, default_value = "10")]
        limit: usize,
    },
    /// List configured tools
    Tools,
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hearth=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "hearth", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Tools => {
            let registry = ToolRegistry::from_config(&config.tools);
            for def in registry.definitions() {
                println!("{:<24} {}", def.name, def.description);
            }
        }
        Commands::Validate { chain_id, file } => {
            let def = match (chain_id, file) {
                (_, Some(path)) => read_definition(&path)?,
                (Some(id), None) => open_store(&config)?.chain(ChainId(id))?,
                (None, None) => anyhow::bail!("pass a chain id or --file"),
            };
            let registry = ToolRegistry::from_config(&config.tools);
            let tree = ChainTree::build(&def, config.engine.max_depth)?;
            println!(
                "Chain {} '{}' is valid: {} steps, {} actions, depth {}",
                tree.id(),
                tree.chain().name,
                tree.steps().len(),
                tree.actions().len(),
                tree.depth()
            );
            for tool in tree.tool_names() {
                if !registry.contains(tool) {
                    println!("  warning: tool '{}' is not configured", tool);
                }
            }
        }
        Commands::Import { path } => {
            let def = read_definition(&path)?;
            ChainTree::build(&def, config.engine.max_depth)?;
            open_store(&config)?.save_chain(&def)?;
            println!("Imported chain {} '{}'", def.chain.id, def.chain.name);
        }
        Commands::Chains => {
            for chain in open_store(&config)?.chains()? {
                let state = if chain.enabled { "" } else { " (disabled)" };
                println!(
                    "{:>6}  {}{}  {}",
                    chain.id,
                    chain.name,
                    state,
                    chain.description.as_deref().unwrap_or("")
                );
            }
        }
        Commands::Delete { chain_id } => {
            if open_store(&config)?.delete_chain(ChainId(chain_id))? {
                println!("Deleted chain {}", chain_id);
            } else {
                println!("No chain {}", chain_id);
            }
        }
        Commands::Records { chain_id, limit } => {
            for record in open_store(&config)?.records_for(ChainId(chain_id), limit)? {
                println!("{}", serde_json::to_string(&record)?);
            }
        }
        Commands::Run {
            chain_id,
            group,
            inputs,
        } => {
            let group = group.unwrap_or_else(|| config.permissions.default_group.clone());
            let status = run_chain(&config, ChainId(chain_id), Caller::group(group), &inputs).await?;
            if status != RunStatus::Completed {
                std::process::exit(1);
            }
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }

    Ok(())
}

async fn run_chain(
    config: &AppConfig,
    chain_id: ChainId,
    caller: Caller,
    inputs: &[String],
) -> anyhow::Result<RunStatus> {
    let store = Arc::new(open_store(config)?);
    let dispatcher: Arc<dyn ToolDispatcher> = Arc::new(ToolRegistry::from_config(&config.tools));
    let event_bus = Arc::new(EventBus::default());

    let mut runner = ChainRunner::new(
        dispatcher,
        Arc::new(config.permissions.to_policy()),
        config.engine.clone(),
    )
    .with_event_bus(event_bus.clone())
    .with_sink(store.clone() as Arc<dyn RecordSink>);
    if let Some(dir) = config.export_dir() {
        info!(dir = %dir.display(), "Exporting records as JSONL");
        runner = runner.with_sink(Arc::new(JsonlRecordSink::new(dir)));
    }

    let mut request = RunRequest::new(caller);
    for input in inputs {
        let (key, value) = parse_input(input)?;
        request = request.with_input(key, value);
    }

    // Ctrl-C cancels the run; the record is still sealed and stored.
    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n[cancelling]");
            ctrl_c.cancel();
        }
    });

    // Spawn event printer
    let mut rx = event_bus.subscribe();
    let print_handle = tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            match event {
                ChainEvent::RunStarted { chain_name, .. } => eprintln!("[run: {}]", chain_name),
                ChainEvent::StepStarted { step_id, tool, .. } => {
                    eprintln!("[step {}: {}]", step_id, tool)
                }
                ChainEvent::StepFinished { step_id, status, .. } => {
                    eprintln!("[step {}: {}]", step_id, status)
                }
                ChainEvent::ActionFinished {
                    action_id, status, ..
                } => eprintln!("  [action {}: {}]", action_id, status),
                ChainEvent::ToolBlocked { tool, group, .. } => {
                    eprintln!("  [blocked: '{}' not permitted for '{}']", tool, group)
                }
                ChainEvent::RunFinished { status, .. } => {
                    eprintln!("[finished: {}]", status);
                    break;
                }
            }
        }
    });

    let record = runner
        .run_by_id(store.as_ref(), chain_id, request, cancel)
        .await?;
    print_handle.await.ok();

    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(record.status)
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    // Check for config in the home directory
    if let Some(home_config) = dirs_home().map(|h| h.join(".hearth").join("config.toml")) {
        if home_config.exists() {
            info!(path = %home_config.display(), "Loading config from home directory");
            return Ok(AppConfig::load(&home_config)?);
        }
    }
    warn!("No config file found, using defaults (no tools, no permissions)");
    Ok(AppConfig::default())
}

fn open_store(config: &AppConfig) -> anyhow::Result<SqliteStore> {
    Ok(SqliteStore::open(&config.store_path())?)
}

fn read_definition(path: &Path) -> anyhow::Result<ChainDefinition> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Split `key=value`; the value is JSON when it parses, a string otherwise.
fn parse_input(input: &str) -> anyhow::Result<(String, serde_json::Value)> {
    let (key, raw) = input
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("input '{}' is not key=value", input))?;
    let value = serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
    Ok((key.trim().to_string(), value))
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inputs_parse_as_json_or_string() {
        assert_eq!(
            parse_input("host=nas.local").unwrap(),
            ("host".to_string(), serde_json::json!("nas.local"))
        );
        assert_eq!(
            parse_input("retries=3").unwrap(),
            ("retries".to_string(), serde_json::json!(3))
        );
        assert_eq!(
            parse_input("force=true").unwrap().1,
            serde_json::json!(true)
        );
        assert!(parse_input("novalue").is_err());
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }
}
