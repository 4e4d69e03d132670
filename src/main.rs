//! Waterflow - main entry point.
//!
//! Runs the REST API and the per-repository worker. The git-host and
//! issue-tracker adapters are deployment-specific; until one is wired in,
//! the worker runs against the in-memory host so the API surface and job
//! dispatch can be exercised end to end.

use std::net::SocketAddr;
use std::path::PathBuf;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use waterflow::git::{CommitIdentity, GitConfig, Workspace};
use waterflow::hosting::InMemoryHost;
use waterflow::server::{AppState, build_router};
use waterflow::settings::RepositorySettings;
use waterflow::tracker::InMemoryTracker;
use waterflow::worker::{JobBoard, RepoWorker};

/// Process configuration from the environment.
struct Config {
    listen_addr: SocketAddr,
    settings_path: PathBuf,
    git_base_dir: PathBuf,
    remote_url: String,
}

impl Config {
    fn from_env() -> Self {
        let listen_addr = std::env::var("LISTEN_ADDR")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 3000)));

        let settings_path = std::env::var("WATERFLOW_SETTINGS")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./settings.json"));

        let git_base_dir = std::env::var("GIT_BASE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/repos"));

        let remote_url = std::env::var("GIT_REMOTE_URL").unwrap_or_default();

        Config {
            listen_addr,
            settings_path,
            git_base_dir,
            remote_url,
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "waterflow=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();

    let settings = match RepositorySettings::load(&config.settings_path) {
        Ok(settings) => settings,
        Err(err) => {
            tracing::error!(path = %config.settings_path.display(), %err, "cannot load settings");
            std::process::exit(1);
        }
    };

    tracing::info!(
        repo = %settings.repo_id(),
        robot = %settings.robot,
        "starting waterflow"
    );

    let git_config = GitConfig {
        base_dir: config.git_base_dir,
        repo: settings.repo_id(),
        remote_url: config.remote_url,
        identity: CommitIdentity {
            name: settings.robot.clone(),
            email: settings.robot_email.clone(),
        },
    };
    let workspace = match Workspace::open(git_config) {
        Ok(workspace) => workspace,
        Err(err) => {
            tracing::error!(%err, "cannot open the git workspace");
            std::process::exit(1);
        }
    };

    let board = JobBoard::new();
    let shutdown = CancellationToken::new();

    tracing::warn!("no git-host adapter configured, using the in-memory host");
    let worker: RepoWorker<InMemoryHost, InMemoryTracker> = RepoWorker::new(
        settings.clone(),
        board.clone(),
        InMemoryHost::new(),
        None,
        workspace,
        shutdown.clone(),
    );
    let worker_handle = tokio::spawn(worker.run());

    let app = build_router(AppState::new(settings, board));

    tracing::info!("listening on {}", config.listen_addr);
    let listener = match tokio::net::TcpListener::bind(config.listen_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(%err, "cannot bind listen address");
            std::process::exit(1);
        }
    };

    let server_shutdown = shutdown.clone();
    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
        server_shutdown.cancelled().await;
    });

    tokio::select! {
        result = serve => {
            if let Err(err) = result {
                tracing::error!(%err, "server stopped");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            shutdown.cancel();
        }
    }

    shutdown.cancel();
    let _ = worker_handle.await;
}
