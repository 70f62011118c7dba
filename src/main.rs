//! prefork - process-pool load balancer

mod cli;
mod client;
mod config;
mod error;
mod logging;
mod output;
mod paths;
mod pidfile;
mod pool;
mod theme;

use anyhow::Result;
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr};

use cli::{Cli, Commands, ControlArgs, StartArgs, StatusArgs, WorkerArgs};
use client::ControlClient;
use logging::LogConfig;
use paths::SocketPaths;
use theme::Themed;

/// Parse arguments, set up logging, dispatch the subcommand and report
/// errors with their cause chain before exiting with status 1.
fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        theme::disable_colors();
    }
    init_logging(&cli);

    let result = match &cli.command {
        Commands::Start(args) => cmd_start(args),
        Commands::Stop(args) => cmd_stop(args),
        Commands::Status(args) => cmd_status(args),
        Commands::Reload(args) => cmd_reload(args),
        Commands::Config(args) => cmd_config(args),
        Commands::Completions(args) => {
            args.generate();
            Ok(())
        }
        Commands::Worker(args) => cmd_worker(args),
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

fn init_logging(cli: &Cli) {
    let config = match &cli.command {
        // Worker stderr is captured by the master, which adds its own framing.
        Commands::Worker(args) => LogConfig::for_worker(args.debug),
        _ => {
            let mut config = LogConfig::for_master().with_ansi(!cli.no_color);
            if let Some(level) = logging::level_from_verbosity(cli.verbose, cli.quiet) {
                config = config.with_filter(level.to_string().to_lowercase());
            }
            config = config.with_env_overrides();
            if let Some(format) = cli.log_format {
                config = config.with_format(format);
            }
            if let Some(path) = &cli.log_file {
                config = config.with_file(path.clone());
            }
            config
        }
    };
    logging::init(config);
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?)
}

fn control_client(args: &ControlArgs) -> Result<(ControlClient, config::PoolConfig)> {
    let config = args.load()?;
    let socket = SocketPaths::new(&config.socket_path).controller();
    Ok((ControlClient::new(socket), config))
}

fn cmd_start(args: &StartArgs) -> Result<()> {
    let config = args.load()?;
    runtime()?.block_on(pool::run(config))?;
    Ok(())
}

fn cmd_stop(args: &ControlArgs) -> Result<()> {
    let (client, _) = control_client(args)?;
    client.stop()?;
    println!("{}", "Stop requested".success());
    Ok(())
}

fn cmd_reload(args: &ControlArgs) -> Result<()> {
    let (client, _) = control_client(args)?;
    client.reload()?;
    println!("{}", "Reload requested".success());
    Ok(())
}

fn cmd_status(args: &StatusArgs) -> Result<()> {
    let (client, config) = control_client(&args.control)?;
    let report = client.status()?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let pid = pidfile::read(&config.pidfile);
    println!("{}", output::status_table(&report, pid));
    if report.handled_requests_per_worker.is_empty() {
        println!("{}", "No workers attached.".muted());
    } else {
        println!("{}", output::workers_table(&report));
    }
    Ok(())
}

fn cmd_config(args: &StartArgs) -> Result<()> {
    let config = args.load()?;
    println!("{}", output::config_table(&config));
    Ok(())
}

fn cmd_worker(args: &WorkerArgs) -> Result<()> {
    runtime()?.block_on(pool::runtime::run(args.options()))?;
    Ok(())
}
