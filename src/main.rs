use clap::{CommandFactory, Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use sparkinsight::agent::Agent;
use sparkinsight::config::{Config, DEFAULT_CONFIG_FILE};
use sparkinsight::logging;
use std::path::{Path, PathBuf};
use tracing::info;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const LONG_ABOUT: &str = concat!(
    "SPARKInsight v",
    env!("CARGO_PKG_VERSION"),
    "\n",
    "Persistent key-value memory for agent scripts, plus USDC payment checks on Base.\n",
    "\n",
    "Config is read from $SPARKINSIGHT_CONFIG or ./sparkinsight.config.yaml;\n",
    "without one, built-in defaults are used.",
);

#[derive(Debug, Parser)]
#[command(name = "sparkinsight", version = VERSION, about = LONG_ABOUT)]
struct Cli {
    /// Path to a YAML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<MainCommand>,
}

#[derive(Debug, Subcommand)]
enum MainCommand {
    /// Store a value (JSON, or plain text stored as a string)
    Remember {
        key: String,
        value: String,
        /// Tag used by search (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// Print the value stored under a key
    Recall { key: String },
    /// Case-insensitive search over values and tags
    Search { query: String },
    /// Delete a key
    Forget { key: String },
    /// List all memories, most recent first
    List,
    /// Print the number of stored memories
    Count,
    /// Delete every memory
    Clear {
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },
    /// Check that a transaction paid our wallet
    Verify {
        tx_hash: String,
        /// Minimum token amount (defaults to the configured minimum)
        #[arg(long)]
        min_amount: Option<f64>,
        /// Store a verified result in memory
        #[arg(long)]
        record: bool,
    },
    /// Write a config file with the built-in defaults
    Init {
        /// Replace an existing file
        #[arg(long)]
        force: bool,
    },
    /// Show version
    Version,
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    Ok(match path {
        Some(p) => Config::load_from(p)?,
        None => Config::load()?,
    })
}

fn write_default_config(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to replace it)", path.display());
    }
    Config::default().save_yaml(path)?;
    Ok(())
}

fn parse_cli_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let command = match cli.command {
        Some(MainCommand::Version) => {
            println!("sparkinsight {VERSION}");
            return Ok(());
        }
        Some(MainCommand::Init { force }) => {
            let path = cli
                .config
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
            write_default_config(&path, force)?;
            println!("Wrote {}", path.display());
            return Ok(());
        }
        Some(command) => command,
        None => {
            let mut cmd = Cli::command();
            cmd.print_help()?;
            println!();
            return Ok(());
        }
    };

    let config = load_config(cli.config.as_deref())?;
    match &config.log_dir {
        Some(dir) => logging::init_logging(Path::new(dir))?,
        None => logging::init_console_logging()?,
    }
    let agent = Agent::from_config(&config)?;
    info!("SPARKInsight ready ({} memories)", agent.count());

    let ok = match command {
        MainCommand::Remember { key, value, tags } => {
            let tags: Vec<&str> = tags.iter().map(String::as_str).collect();
            agent.remember(&key, &parse_cli_value(&value), &tags)
        }
        MainCommand::Recall { key } => match agent.recall(&key) {
            Some(value) => {
                print_json(&value)?;
                true
            }
            None => {
                eprintln!("No memory stored under {key:?}");
                false
            }
        },
        MainCommand::Search { query } => {
            print_json(&agent.search(&query))?;
            true
        }
        MainCommand::Forget { key } => agent.forget(&key),
        MainCommand::List => {
            print_json(&agent.list_all())?;
            true
        }
        MainCommand::Count => {
            println!("{}", agent.count());
            true
        }
        MainCommand::Clear { yes } => {
            if !yes {
                anyhow::bail!("refusing to delete all memories without --yes");
            }
            agent.clear()
        }
        MainCommand::Verify {
            tx_hash,
            min_amount,
            record,
        } => {
            let result = match min_amount {
                Some(min) => agent.verify_payment(&tx_hash, min),
                None => agent.verify_payment_default(&tx_hash),
            };
            print_json(&result)?;
            if record && result.verified && !agent.record_payment(&result) {
                eprintln!("Payment verified but could not be recorded");
            }
            result.verified
        }
        MainCommand::Init { .. } | MainCommand::Version => true,
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}
