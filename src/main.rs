use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use plugin_runtime::{CommandReply, EventContext, PluginConfig, PluginHost};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "plugin-host", about = "Run a plugin host from the console")]
#[command(version)]
struct Cli {
    /// Root directory holding `plugins/` and `shared/`
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Copy plugin libraries here before opening them
    #[arg(long)]
    shadow_dir: Option<PathBuf>,

    /// OnTick events per second
    #[arg(long, default_value_t = 64)]
    tick_rate: u32,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

struct Console;

impl CommandReply for Console {
    fn reply(&mut self, message: &str) {
        println!("{}", message);
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = match cli.root {
        Some(root) => PluginConfig::new(root),
        None => PluginConfig::default(),
    }
    .with_tick_rate(cli.tick_rate);
    if let Some(dir) = cli.shadow_dir {
        config = config.with_shadow_dir(dir);
    }
    config
        .ensure_dirs()
        .with_context(|| format!("creating plugin directories under {:?}", config.root_dir))?;

    let mut host = PluginHost::new(config);
    host.init().context("initializing plugin host")?;

    let mut ticker = tokio::time::interval(host.config().tick_interval());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                host.raise_event("OnTick", &EventContext::new());
            }
            line = lines.next_line() => {
                match line? {
                    Some(line) => handle_line(&mut host, line.trim()),
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
        }
    }

    host.on_native_unload();
    Ok(())
}

/// `event <Name> [json args]` raises an event; anything else is a command.
fn handle_line(host: &mut PluginHost, line: &str) {
    if line.is_empty() {
        return;
    }

    let Some(rest) = line.strip_prefix("event ") else {
        host.execute_command(line, &mut Console);
        return;
    };

    let (name, args) = match rest.trim().split_once(char::is_whitespace) {
        Some((name, args)) => (name, args.trim()),
        None => (rest.trim(), "[]"),
    };
    match EventContext::parse(args) {
        Ok(ctx) => {
            let report = host.raise_event(name, &ctx);
            println!(
                "{}: {} handlers invoked, {} failed",
                name, report.invoked, report.failed
            );
        }
        Err(e) => println!("Bad event arguments: {}", e),
    }
}
