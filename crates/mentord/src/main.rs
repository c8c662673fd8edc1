use clap::{Parser, Subcommand};
use cm_api::auth::{load_or_create_secret, JwtKeys, TOKEN_EXPIRY_DAYS};
use cm_api::rest::health::init_start_time;
use cm_api::{build_router, AppState};
use cm_config::{ConfigPaths, MentorConfig};
use cm_usage::{HttpUsageClient, Session, TrackerOptions, UsageTracker};
use mentord::{read_session, render_usage_report, write_session, MENTORD_VERSION};
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "mentord", version = MENTORD_VERSION, about = "Code mentor usage daemon")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the usage API server in the foreground
    Serve {
        /// Port to bind to (defaults to the configured port)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Issue an API token and save it as the client session
    Token {
        /// User id the token is issued for
        #[arg(long)]
        user: String,
        #[arg(long)]
        email: Option<String>,
        /// Token lifetime in days
        #[arg(long, default_value_t = TOKEN_EXPIRY_DAYS)]
        days: i64,
    },
    /// Show today's usage for the configured model
    Usage {
        /// Print the full state as JSON
        #[arg(long)]
        json: bool,
    },
    /// Record a single API call and wait for it to sync
    Record {
        #[arg(long, default_value = cm_usage::record::DEFAULT_OPERATION)]
        operation: String,
        /// Mark the call as failed
        #[arg(long)]
        failed: bool,
        /// Response time in milliseconds
        #[arg(long)]
        response_time: Option<u64>,
    },
    /// Print version
    Version,
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                if tokio::signal::ctrl_c().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        }
    }
    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
    tracing::info!("Shutting down...");
}

/// Tracker talking to the configured usage server with the saved session.
async fn start_tracker(config: &MentorConfig, paths: &ConfigPaths) -> UsageTracker {
    let session = read_session(&paths.session_token_path());
    if session.is_none() {
        tracing::warn!("No saved session, run 'mentord token --user <id>' first");
    }
    let client = HttpUsageClient::new(config.server_url.clone(), session);
    UsageTracker::start(TrackerOptions::from_config(config), Arc::new(client)).await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "mentord=info,cm_api=info,cm_usage=info,tower_http=info".into()
            }),
        )
        .init();

    let cli = Cli::parse();
    let paths = ConfigPaths::new()?;

    match cli.command {
        Commands::Serve { port } => {
            let mut config = MentorConfig::load_from(&paths)?;
            if let Some(port) = port {
                config.port = port;
                config.validate()?;
            }

            init_start_time();
            let state = AppState::new(config.clone())?;
            let app = build_router(state);

            let addr: SocketAddr = config.bind_addr().parse()?;
            let listener = tokio::net::TcpListener::bind(addr).await?;
            tracing::info!("Listening on {}", addr);
            println!("Usage API listening on http://{}", addr);

            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(shutdown_signal())
            .await?;

            Ok(())
        }

        Commands::Token { user, email, days } => {
            if days <= 0 {
                anyhow::bail!("--days must be greater than 0");
            }
            paths.ensure_config_dir()?;
            let secret = load_or_create_secret(&paths)?;
            let keys = JwtKeys::new(&secret);
            let token = keys.issue(&user, email.as_deref(), chrono::Duration::days(days))?;

            let session = Session {
                user_id: user,
                token: token.clone(),
            };
            write_session(&paths.session_token_path(), &session)?;
            println!("{}", token);
            println!();
            println!(
                "Saved session for {} to {}",
                session.user_id,
                paths.session_token_path().display()
            );
            Ok(())
        }

        Commands::Usage { json } => {
            let config = MentorConfig::load_from(&paths)?;
            let tracker = start_tracker(&config, &paths).await;
            let state = tracker.state();
            if json {
                println!("{}", serde_json::to_string_pretty(&state)?);
            } else {
                println!("{}", render_usage_report(&state));
            }
            tracker.shutdown().await;
            Ok(())
        }

        Commands::Record {
            operation,
            failed,
            response_time,
        } => {
            let config = MentorConfig::load_from(&paths)?;
            let tracker = start_tracker(&config, &paths).await;
            if !tracker.can_make_call() {
                tracing::warn!(
                    "Daily limit for {} already reached, recording anyway",
                    config.model
                );
            }
            tracker.record_api_call(&operation, !failed, response_time);
            let state = tracker.state();
            tracker.shutdown().await;
            println!("{}", render_usage_report(&state));
            Ok(())
        }

        Commands::Version => {
            println!("mentord {}", MENTORD_VERSION);
            Ok(())
        }
    }
}
