use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use log::{error, info, warn};
use tokio::net::TcpListener;

use sandboxd::agent::{AgentService, AgentTimings, TaskRepository};
use sandboxd::api::{AppState, create_router};
use sandboxd::auth::AuthState;
use sandboxd::config::Config;
use sandboxd::container::CliDriver;
use sandboxd::db::Database;
use sandboxd::exposure::{CloudflareDns, Reloader, TunnelIngress};
use sandboxd::notify::LogNotifier;
use sandboxd::ports::PortAllocator;
use sandboxd::runner::RunnerClient;
use sandboxd::session::{SessionRepository, SessionService};
use sandboxd::terminal::{TerminalDeps, TerminalRegistry};
use sandboxd::vault::Vault;

const APP_NAME: &str = "sandboxd";

/// How often expired sessions are swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Per-user sandbox session orchestrator.",
    propagate_version = true
)]
struct Cli {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the HTTP API server
    Serve,
    /// Output the effective configuration
    Config,
    /// Generate a bcrypt hash for the admin password
    HashPassword,
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    match cli.command {
        Command::Serve => {
            let config = Config::load(cli.config.as_deref())?;
            async_serve(config)
        }
        Command::Config => {
            let config = Config::load(cli.config.as_deref())?;
            println!(
                "{}",
                toml::to_string_pretty(&config).context("serializing configuration")?
            );
            Ok(())
        }
        Command::HashPassword => {
            let password = read_password()?;
            let hash =
                bcrypt::hash(password.trim(), bcrypt::DEFAULT_COST).context("hashing password")?;
            println!("{hash}");
            Ok(())
        }
        Command::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
            Ok(())
        }
    }
}

fn init_logging(debug: bool) {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let level = if debug { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("sandboxd={level},tower_http={level}")));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_ansi(io::stderr().is_terminal()))
        .try_init()
        .ok();

    // Also init env_logger for compatibility with log crate users
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .try_init()
        .ok();
}

fn read_password() -> Result<String> {
    let mut password = String::new();
    if io::stdin().is_terminal() {
        eprint!("password: ");
        let _ = io::stderr().flush();
    }
    io::stdin()
        .read_line(&mut password)
        .context("reading password from stdin")?;
    if password.trim().is_empty() {
        bail!("empty password");
    }
    Ok(password)
}

#[tokio::main]
async fn async_serve(config: Config) -> Result<()> {
    serve(config).await
}

async fn serve(config: Config) -> Result<()> {
    validate(&config)?;

    let db_path = config.database.expanded_path();
    info!("database path: {}", db_path.display());
    let database = Database::new(&db_path).await?;
    let pool = database.pool().clone();

    let driver = Arc::new(CliDriver::new(
        config.container.binary.clone(),
        config.container.image.clone(),
    ));
    let dns = Arc::new(CloudflareDns::new(config.dns.clone()));
    if !config.dns.is_configured() {
        warn!("DNS credentials not configured, record management disabled");
    }
    let tunnel = Arc::new(TunnelIngress::new(
        config.tunnel.config_path(),
        Reloader::new(config.tunnel.reload_command.clone()),
    ));
    if config.tunnel.config_path().is_none() {
        warn!("tunnel config path not set, ingress routing disabled");
    }

    let session_repo = SessionRepository::new(pool.clone());
    let allocator = PortAllocator::new(pool.clone(), config.ports);
    let sessions = SessionService::new(
        session_repo.clone(),
        allocator,
        driver.clone(),
        dns,
        tunnel,
        config.domain.clone(),
    );

    let vault = Vault::new(&config.vault.master_key)?;
    let runner = RunnerClient::new();
    let agent = AgentService::new(
        session_repo.clone(),
        TaskRepository::new(pool.clone()),
        vault,
        driver,
        Arc::new(runner.clone()),
        Arc::new(LogNotifier),
        AgentTimings::default(),
    );

    let state = AppState {
        sessions: sessions.clone(),
        agent,
        auth: AuthState::new(
            &config.auth.jwt_secret,
            config.auth.admin_password_hash.clone(),
        ),
        terminal: TerminalDeps {
            sessions: session_repo,
            registry: Arc::new(TerminalRegistry::new()),
        },
        runner,
        domain: config.domain.clone(),
    };

    tokio::spawn(async move {
        loop {
            tokio::time::sleep(SWEEP_INTERVAL).await;
            if let Err(err) = sessions.sweep_expired().await {
                error!("expiry sweep failed: {err:#}");
            }
        }
    });

    let app = create_router(state);
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("listening on {addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("serving HTTP")?;

    info!("shutdown complete");
    Ok(())
}

fn validate(config: &Config) -> Result<()> {
    if config.domain.is_empty() {
        bail!("domain must be set");
    }
    if config.auth.jwt_secret.is_empty() {
        bail!("auth.jwt_secret must be set");
    }
    if config.auth.admin_password_hash.is_empty() {
        bail!("auth.admin_password_hash must be set (generate with `sandboxd hash-password`)");
    }
    if config.vault.master_key.is_empty() {
        bail!("vault.master_key must be set");
    }
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let ctrl_c = tokio::signal::ctrl_c();
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            error!("installing SIGTERM handler: {err}");
            let _ = ctrl_c.await;
            return;
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = term.recv() => info!("received SIGTERM"),
    }
}
