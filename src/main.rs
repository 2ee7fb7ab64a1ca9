mod backends;
mod cache_store;
mod config;
mod drive_registry;
mod library_cache_manager;
mod metadata;
mod network_drive_manager;
mod network_file_adapter;
mod persist;
mod protocol;

use std::sync::Arc;
use std::thread;

use log::{info, warn};
use tokio::sync::broadcast;

use backends::DefaultClientFactory;
use cache_store::CacheStore;
use config::Config;
use drive_registry::DriveRegistry;
use library_cache_manager::LibraryCacheManager;
use metadata::FilenameMetadataParser;
use network_drive_manager::NetworkDriveManager;
use network_file_adapter::NetworkFileAdapter;
use protocol::{CacheMessage, DriveMessage, Message};

fn main() {
    let mut clog = colog::default_builder();
    clog.filter(None, log::LevelFilter::Debug);
    clog.init();

    std::panic::set_hook(Box::new(|panic_info| {
        let current_thread = std::thread::current();
        let thread_name = current_thread.name().unwrap_or("unnamed");
        log::error!("panic in thread '{}': {}", thread_name, panic_info);
    }));

    let config_file = dirs::config_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("nettune.toml");
    let config = Config::load_or_default(&config_file);
    if !config_file.exists() {
        info!(
            "Config file not found. Creating default config. path={}",
            config_file.display()
        );
        if let Err(err) = config.save(&config_file) {
            warn!("Failed to write default config: {err}");
        }
    }

    let data_dir = config.resolve_data_dir();
    info!("Data directory: {}", data_dir.display());

    // Bus for communication between components
    let (bus_sender, _) = broadcast::channel::<Message>(4096);

    // Setup drive manager
    let registry = DriveRegistry::open(data_dir.join("drive-registry.json"));
    let drive_manager = Arc::new(NetworkDriveManager::new(
        bus_sender.clone(),
        Arc::new(DefaultClientFactory),
        registry,
        data_dir.join("network-drives-state.json"),
        config.network.clone(),
    ));

    let monitor_manager = Arc::clone(&drive_manager);
    let monitor_bus_receiver = bus_sender.subscribe();
    let monitor_handle = thread::Builder::new()
        .name("drive-monitor".to_string())
        .spawn(move || monitor_manager.run_monitor(monitor_bus_receiver))
        .expect("failed to spawn drive monitor thread");

    // Setup library cache manager
    let adapter = Arc::new(NetworkFileAdapter::new(
        Arc::clone(&drive_manager),
        &config.network,
    ));
    let cache_bus_sender = bus_sender.clone();
    let cache_bus_receiver = bus_sender.subscribe();
    let cache_store = CacheStore::new(data_dir.join("music-library-cache.json"));
    let cache_adapter = Arc::clone(&adapter);
    let cache_handle = thread::Builder::new()
        .name("library-cache".to_string())
        .spawn(move || {
            let manager = LibraryCacheManager::new(
                cache_bus_sender,
                cache_store,
                Some(cache_adapter),
                Box::new(FilenameMetadataParser),
            );
            manager.run(cache_bus_receiver);
        })
        .expect("failed to spawn library cache thread");

    // Bring previously mounted drives back up before the first scan.
    drive_manager.replay_persisted_mounts();
    let _ = bus_sender.send(Message::Drive(DriveMessage::RequestDriveSnapshot));

    if !config.library.folders.is_empty() {
        info!(
            "Scheduling startup scan of {} folder(s)",
            config.library.folders.len()
        );
        let _ = bus_sender.send(Message::Cache(CacheMessage::ScanDirectories(
            config.library.folders.clone(),
        )));
    }

    if let Err(err) = cache_handle.join() {
        warn!("library cache thread exited abnormally: {err:?}");
    }
    if let Err(err) = monitor_handle.join() {
        warn!("drive monitor thread exited abnormally: {err:?}");
    }
    info!("Application exiting");
}
