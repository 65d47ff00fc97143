use std::{env, process::ExitCode, sync::Arc, time::Duration};

use beatsync_core::{
    backup::{FileSnapshotStore, MemorySnapshotStore, SnapshotStore},
    Beatsync, BlobStore, Config, GeoLocator, HttpBlobStore, HttpGeoLocator, HttpMusicProvider,
    MemoryBlobStore, MusicProvider, NullGeoLocator, NullMusicProvider,
};
use log::{error, info, warn};
use thiserror::Error;
use tokio::runtime::{self, Runtime};

mod logging;

struct App {
    core: Arc<Beatsync>,
    snapshots: Arc<dyn SnapshotStore>,
    port: u16,
    runtime: Runtime,
}

#[derive(Debug, Error)]
enum AppError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl App {
    fn new() -> Result<Self, AppError> {
        info!("Building async runtime...");
        let runtime = runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("beatsync-async")
            .build()
            .map_err(|e| AppError::Fatal(e.to_string()))?;

        let port = match env::var("BEATSYNC_SERVER_PORT") {
            Ok(value) => value
                .parse::<u16>()
                .map_err(|_| AppError::Config(format!("{value} is not a valid port")))?,
            Err(_) => beatsync_server::DEFAULT_PORT,
        };

        let mut config = Config::default();

        if let Ok(tracks) = env::var("BEATSYNC_DEFAULT_TRACKS") {
            config.default_tracks = tracks
                .split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect();
        }

        let storage: Arc<dyn BlobStore> = match env::var("STORAGE_URL") {
            Ok(url) => Arc::new(HttpBlobStore::new(url)),
            Err(_) => {
                warn!("STORAGE_URL is not set, uploads will not survive restarts");
                Arc::new(MemoryBlobStore::new())
            }
        };

        let provider: Arc<dyn MusicProvider> = match env::var("PROVIDER_URL") {
            Ok(url) => Arc::new(HttpMusicProvider::new(url)),
            Err(_) => {
                warn!("PROVIDER_URL is not set, search and streaming are disabled");
                Arc::new(NullMusicProvider)
            }
        };

        let geo: Arc<dyn GeoLocator> = match env::var("GEOIP_URL") {
            Ok(url) => Arc::new(HttpGeoLocator::new(url)),
            Err(_) => Arc::new(NullGeoLocator),
        };

        let snapshots: Arc<dyn SnapshotStore> = match env::var("BEATSYNC_SNAPSHOT_PATH") {
            Ok(path) => Arc::new(FileSnapshotStore::new(path)),
            Err(_) => {
                warn!("BEATSYNC_SNAPSHOT_PATH is not set, state will not survive restarts");
                Arc::new(MemorySnapshotStore::new())
            }
        };

        let core = Arc::new(Beatsync::new(config, storage, provider, geo));

        Ok(Self {
            core,
            snapshots,
            port,
            runtime,
        })
    }

    fn run(&self) -> Result<(), AppError> {
        self.runtime.block_on(async {
            match self.snapshots.load_latest().await {
                Ok(Some(snapshot)) => {
                    info!(
                        "Restoring {} rooms from the latest snapshot",
                        snapshot.data.rooms.len()
                    );
                    self.core.restore_snapshot(snapshot);
                }
                Ok(None) => info!("No snapshot to restore"),
                Err(e) => warn!("Could not restore snapshot: {e}"),
            }

            tokio::spawn(run_backups(self.core.clone(), self.snapshots.clone()));

            info!("Listening on port {}", self.port);

            tokio::select! {
                result = beatsync_server::run_server(self.core.clone(), self.port) => {
                    result.map_err(|e| AppError::Fatal(e.to_string()))
                }
                _ = shutdown_signal() => {
                    info!("Shutting down, writing final snapshot...");

                    if let Err(e) = self.snapshots.save(&self.core.create_snapshot()).await {
                        warn!("Final snapshot failed: {e}");
                    }

                    Ok(())
                }
            }
        })
    }
}

/// Hands a fresh snapshot to the store on a fixed cadence.
async fn run_backups(core: Arc<Beatsync>, snapshots: Arc<dyn SnapshotStore>) {
    let interval_ms = core.context().config.backup_interval_ms;
    let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));

    // The first tick fires immediately; skip it so an empty boot state
    // never overwrites a snapshot we just restored from.
    interval.tick().await;

    loop {
        interval.tick().await;

        if let Err(e) = snapshots.save(&core.create_snapshot()).await {
            warn!("Periodic snapshot failed: {e}");
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate =
        signal(SignalKind::terminate()).expect("terminate signal handler installs");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn main() -> ExitCode {
    logging::init_logger();

    let app = match App::new() {
        Ok(app) => app,
        Err(error) => {
            error!("Beatsync failed to start!");
            error!("{error}");
            return ExitCode::FAILURE;
        }
    };

    info!("Initialized successfully.");

    match app.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!("{error}");
            ExitCode::FAILURE
        }
    }
}
