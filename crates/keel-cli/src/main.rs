use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "keel",
    about = "Keel — health-gated, revision-pinned rollouts",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a starter keel.toml
    Init {
        /// Directory to write keel.toml into
        #[arg(short, long, default_value = ".")]
        path: String,
        /// Target name (default: directory name)
        #[arg(short, long)]
        name: Option<String>,
        /// Image repository (default: registry.example.com/<name>)
        #[arg(short, long)]
        image: Option<String>,
        /// Overwrite an existing keel.toml
        #[arg(long)]
        force: bool,
    },
    /// Print the step plan for a replica-count transition
    Plan {
        #[arg(long)]
        current: u32,
        #[arg(long)]
        desired: u32,
        #[arg(long, default_value = "0")]
        max_unavailable: u32,
        #[arg(long, default_value = "1")]
        max_surge: u32,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// Roll a revision out to the configured (simulated) workload.
    ///
    /// Events are printed to stdout as JSON lines. Ctrl-C cancels the
    /// rollout; applied steps are rolled back before exit.
    Rollout {
        #[arg(short, long, default_value = "keel.toml")]
        config: String,
        /// Source revision to deploy
        #[arg(short, long)]
        revision: String,
        /// Override [rollout].desired_replicas
        #[arg(long)]
        desired: Option<u32>,
    },
    /// Run a single HTTP health probe
    Probe {
        /// host:port of the replica
        #[arg(short, long)]
        address: String,
        #[arg(long, default_value = "/healthz")]
        path: String,
        #[arg(long, default_value = "2s")]
        timeout: String,
    },
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("keel=info"))?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json)?;

    match cli.command {
        Commands::Init {
            path,
            name,
            image,
            force,
        } => commands::init::init(&path, name.as_deref(), image.as_deref(), force),
        Commands::Plan {
            current,
            desired,
            max_unavailable,
            max_surge,
            format,
        } => commands::plan::plan(current, desired, max_unavailable, max_surge, &format),
        Commands::Rollout {
            config,
            revision,
            desired,
        } => commands::rollout::rollout(&config, &revision, desired).await,
        Commands::Probe {
            address,
            path,
            timeout,
        } => commands::probe::probe(&address, &path, &timeout).await,
    }
}
