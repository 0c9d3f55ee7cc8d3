use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use letslive_node::{
    default_data_dir, CancellationToken, Cid, LogFormat, Node, NodeConfig, Role,
};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn cli() -> Command {
    Command::new("letslive-node")
        .version(env!("CARGO_PKG_VERSION"))
        .about("LetsLive peer-to-peer storage node")
        .arg(
            Arg::new("bootstrap")
                .short('b')
                .long("bootstrap")
                .action(ArgAction::SetTrue)
                .help("Run as a bootstrap node (ignores --bootstrap-addr)")
                .global(true),
        )
        .arg(
            Arg::new("bootstrap-addr")
                .short('a')
                .long("bootstrap-addr")
                .value_name("MULTIADDR")
                .help("Bootstrap node address, ending in /p2p/<peer id>")
                .global(true),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .help("Configuration file path")
                .global(true),
        )
        .arg(
            Arg::new("listen")
                .short('l')
                .long("listen")
                .value_name("MULTIADDR")
                .action(ArgAction::Append)
                .help("Listen address, repeatable (replaces configured addresses)")
                .global(true),
        )
        .arg(
            Arg::new("data-dir")
                .short('d')
                .long("data-dir")
                .value_name("DIR")
                .value_parser(value_parser!(PathBuf))
                .help("Block store and identity directory")
                .global(true),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .help("Override the log level")
                .global(true),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .value_parser(["pretty", "json"])
                .help("Select log output format")
                .global(true),
        )
        .subcommand(
            Command::new("add")
                .about("Add a file and print its root CID")
                .arg(
                    Arg::new("file")
                        .value_name("FILE")
                        .value_parser(value_parser!(PathBuf))
                        .required(true),
                )
                .arg(
                    Arg::new("serve")
                        .long("serve")
                        .action(ArgAction::SetTrue)
                        .help("Keep serving the file until Ctrl-C"),
                ),
        )
        .subcommand(
            Command::new("get")
                .about("Fetch a file by root CID")
                .arg(Arg::new("cid").value_name("CID").required(true))
                .arg(
                    Arg::new("output")
                        .short('o')
                        .long("output")
                        .value_name("FILE")
                        .value_parser(value_parser!(PathBuf))
                        .required(true),
                ),
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();
    let config = load_config_with_overrides(&matches)?;
    init_logging(&config)?;

    let node = Node::start(config)
        .await
        .context("failed to start node")?;

    let outcome = match matches.subcommand() {
        Some(("add", sub)) => add(&node, sub).await,
        Some(("get", sub)) => get(&node, sub).await,
        _ => run(&node).await,
    };

    node.shutdown().await;
    outcome
}

async fn run(node: &Node) -> Result<()> {
    if node.config().role == Role::Bootstrap {
        match node.bootstrap_address() {
            Some(address) => println!("bootstrap node address: {address}"),
            None => warn!("bootstrap node has no dialable address"),
        }
    }
    info!(peer_id = %node.peer_id(), "node is running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}

async fn add(node: &Node, matches: &ArgMatches) -> Result<()> {
    let path = matches
        .get_one::<PathBuf>("file")
        .context("missing FILE argument")?;
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;

    let encoded = node.add_file(file).await?;
    let summary = json!({
        "root": encoded.root,
        "size": encoded.size,
        "blocks": encoded.blocks.len(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if matches.get_flag("serve") {
        info!(root = %encoded.root, "serving, press Ctrl-C to stop");
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

async fn get(node: &Node, matches: &ArgMatches) -> Result<()> {
    let raw = matches
        .get_one::<String>("cid")
        .context("missing CID argument")?;
    let root: Cid = raw
        .parse()
        .with_context(|| format!("invalid CID '{raw}'"))?;
    let output = matches
        .get_one::<PathBuf>("output")
        .context("missing --output")?;

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let mut file = tokio::fs::File::create(output)
        .await
        .with_context(|| format!("failed to create {}", output.display()))?;
    let result = node
        .get_file_with_cancel(root, cancel)
        .copy_to(&mut file)
        .await;
    interrupt.abort();

    match result {
        Ok(written) => {
            info!(%root, bytes = written, output = %output.display(), "file retrieved");
            Ok(())
        }
        Err(err) => {
            drop(file);
            if let Err(remove) = tokio::fs::remove_file(output).await {
                warn!("failed to remove partial output: {remove}");
            }
            Err(err).with_context(|| format!("failed to retrieve {root}"))
        }
    }
}

fn load_config_with_overrides(matches: &ArgMatches) -> Result<NodeConfig> {
    let path = matches.get_one::<PathBuf>("config");
    let mut config = NodeConfig::load(path.map(PathBuf::as_path))?;
    apply_overrides(matches, &mut config)?;
    if config.data_dir.is_none() {
        config.data_dir = default_data_dir();
    }
    config.validate()?;
    Ok(config)
}

fn apply_overrides(matches: &ArgMatches, config: &mut NodeConfig) -> Result<()> {
    if matches.get_flag("bootstrap") {
        config.role = Role::Bootstrap;
    }

    if let Some(address) = matches.get_one::<String>("bootstrap-addr") {
        config.bootstrap_address = Some(address.clone());
    }

    if let Some(listen) = matches.get_many::<String>("listen") {
        config.listen_addresses = listen.cloned().collect();
    }

    if let Some(data_dir) = matches.get_one::<PathBuf>("data-dir") {
        config.data_dir = Some(data_dir.clone());
    }

    if let Some(log_level) = matches.get_one::<String>("log-level") {
        config.log_level = log_level.clone();
    }

    if let Some(log_format) = matches.get_one::<String>("log-format") {
        config.log_format = log_format.parse()?;
    }

    Ok(())
}

fn init_logging(config: &NodeConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    match config.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()?,
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()?,
    }

    Ok(())
}
