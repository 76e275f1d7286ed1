use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use env_logger::Builder;
use log::LevelFilter;
use log::{debug, error, info};
use serde_json::Value;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use dci_http_connector::DciClient;
use dci_rs::action::ParameterSet;
use dci_rs::callback::{DciCallback, JunitCallback, PlaybookCallback, PlaybookEvent};
use dci_rs::config::{DciConfig, JunitConfig};
use dci_rs::filters;
use dci_rs::module::{oval_to_junit, run_named, ModuleError, ModuleName, ModuleOutcome};
use dci_rs::session::{RunBacklog, RunSession};

/// Module parameters that carry connection settings rather than resource
/// fields.
const CONNECTION_PARAMS: [&str; 5] = [
    "dci_login",
    "dci_password",
    "dci_cs_url",
    "dci_client_id",
    "dci_api_secret",
];

#[derive(Parser, Debug)]
#[command(
    name = "dci",
    version,
    author = "Distributed CI Developers",
    about = "Distributed CI command-line driver",
    long_about = "Manage Distributed CI resources and report playbook runs to the control-server."
)]
struct Cli {
    /// Sets a custom config file
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Sets the control-server URL directly
    #[arg(short = 'u', long = "api-url", value_name = "URL")]
    api_url: Option<String>,

    /// Enable verbose logging
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a module, e.g. `dci module team name=ci`
    Module {
        /// Resource type or `job_component`, `keys`, `oval_to_junit`, with
        /// or without the `dci_` prefix
        resource: String,
        /// Module parameters; values are parsed as JSON when possible
        #[arg(value_name = "KEY=VALUE")]
        params: Vec<String>,
    },
    /// Report a playbook run read as newline-delimited JSON events
    Callback {
        /// Event file, stdin when omitted
        #[arg(long = "events", value_name = "FILE")]
        events: Option<PathBuf>,

        /// Also write a JUnit report
        #[arg(long = "junit")]
        junit: bool,
    },
    Filter {
        #[command(subcommand)]
        filter_command: FilterCommands,
    },
}

#[derive(Subcommand, Debug)]
enum FilterCommands {
    /// Parse a kernel command line, /proc/cmdline when omitted
    CmdlineToJson { cmdline: Option<String> },
    /// Replace dots by underscores in the keys of a JSON document (stdin
    /// when omitted)
    DotToUnderscore { json: Option<String> },
    /// Sort versions loosely
    VersionSort { versions: Vec<String> },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        Builder::new().filter(None, LevelFilter::Debug).init();
    } else {
        Builder::new().filter(None, LevelFilter::Info).init();
    }

    match cli.command {
        // dci module <MODULE> [KEY=VALUE ...]
        Commands::Module { resource, params } => {
            let name: ModuleName = resource.parse()?;
            let params = parse_params(&params)?;
            info!("Running {name} module");
            let outcome = match name {
                ModuleName::OvalToJunit => oval_to_junit(&params),
                _ => {
                    let config =
                        load_config(cli.config.as_deref(), cli.api_url.as_deref(), &params)?;
                    let client = DciClient::from_config(&config)?;
                    run_named(&client, name, &params).await
                }
            };
            report(name, outcome)?;
        }

        // dci callback [--events FILE] [--junit]
        Commands::Callback { events, junit } => {
            let config = load_config(
                cli.config.as_deref(),
                cli.api_url.as_deref(),
                &ParameterSet::new(),
            )?;
            let input: Box<dyn Read> = match &events {
                Some(path) => Box::new(
                    std::fs::File::open(path)
                        .with_context(|| format!("Failed to open {}", path.display()))?,
                ),
                None => Box::new(std::io::stdin()),
            };
            callback(&config, BufReader::new(input), junit).await?;
        }

        // dci filter ...
        Commands::Filter { filter_command } => filter(filter_command)?,
    }

    Ok(())
}

fn parse_params(args: &[String]) -> Result<ParameterSet> {
    args.iter()
        .map(|arg| {
            let (key, value) = arg
                .split_once('=')
                .with_context(|| format!("Invalid parameter {arg:?}, expected KEY=VALUE"))?;
            let value = serde_json::from_str(value).unwrap_or_else(|_| Value::from(value));
            Ok((key.to_string(), value))
        })
        .collect()
}

/// Layered configuration, with `--api-url` and `dci_*` module parameters
/// taking precedence.
fn load_config(path: Option<&Path>, api_url: Option<&str>, params: &ParameterSet) -> Result<DciConfig> {
    let mut config = DciConfig::load(path).context("Failed to load configuration")?;
    for key in CONNECTION_PARAMS {
        let Some(value) = params.get_str(key) else {
            continue;
        };
        let value = value.to_string();
        match key {
            "dci_login" => config.login = Some(value),
            "dci_password" => config.password = Some(value),
            "dci_cs_url" => config.cs_url = value,
            "dci_client_id" => config.client_id = Some(value),
            _ => config.api_secret = Some(value),
        }
    }
    if let Some(api_url) = api_url {
        config.cs_url = api_url.to_string();
    }
    debug!("Using control-server at {}", config.cs_url);
    Ok(config)
}

/// Print the module result as JSON, exiting non-zero on failure.
fn report(name: ModuleName, outcome: Result<ModuleOutcome, ModuleError>) -> Result<()> {
    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(err) => {
            error!("{name} module failed: {err}");
            ModuleOutcome::failure(&err)
        }
    };

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    if outcome.failed {
        std::process::exit(1);
    }
    Ok(())
}

async fn callback(config: &DciConfig, events: impl BufRead, junit: bool) -> Result<()> {
    let client = DciClient::from_config(config)?;
    let session = RunSession::from_config(config);
    let mut dci = DciCallback::new(RunBacklog::with_session(session, client));
    let mut junit = if junit {
        Some(JunitCallback::new(
            JunitConfig::load().context("Failed to load JUnit settings")?,
        )?)
    } else {
        None
    };

    for (index, line) in events.lines().enumerate() {
        let line = line.context("Failed to read events")?;
        if line.trim().is_empty() {
            continue;
        }
        let event: PlaybookEvent = serde_json::from_str(&line)
            .with_context(|| format!("Invalid event on line {}", index + 1))?;
        debug!("Event: {:?}", event);

        dci.handle(&event).await?;
        if let Some(junit) = junit.as_mut() {
            junit.handle(&event).await?;
        }
    }

    if let Some(report) = junit.as_ref().and_then(JunitCallback::report) {
        println!("JUnit report: {}", report.display());
    }

    let unsent = dci.unsent().len() + dci.backlog().backlog_len();
    if unsent > 0 {
        error!("{unsent} reporting entries were never sent");
        bail!("{unsent} reporting entries were never sent");
    }
    info!("Playbook run reported");
    Ok(())
}

fn filter(command: FilterCommands) -> Result<()> {
    let output = match command {
        FilterCommands::CmdlineToJson { cmdline } => {
            let cmdline = match cmdline {
                Some(cmdline) => cmdline,
                None => std::fs::read_to_string("/proc/cmdline")
                    .context("Failed to read /proc/cmdline")?,
            };
            filters::cmdline_to_json(&cmdline)
        }
        FilterCommands::DotToUnderscore { json } => {
            let json = match json {
                Some(json) => json,
                None => {
                    let mut input = String::new();
                    std::io::stdin().read_to_string(&mut input)?;
                    input
                }
            };
            let data: Value = serde_json::from_str(&json).context("Invalid JSON document")?;
            filters::dot_to_underscore(&data)
        }
        FilterCommands::VersionSort { versions } => Value::from(filters::version_sort(&versions)),
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
