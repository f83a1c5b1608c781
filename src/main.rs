use ergo_indexer::cache::NodeCache;
use ergo_indexer::config::{get_global_config, init_global_config};
use ergo_indexer::db_handles::{DbHandles, ALL_COLUMN_FAMILIES};
use ergo_indexer::node_client::NodeClient;
use ergo_indexer::store::Store;
use ergo_indexer::sync_controller::SyncController;
use ergo_indexer::telemetry::{init_tracing, TelemetryConfig};

use std::sync::Arc;
use std::time::Duration;

use rocksdb::{ColumnFamilyDescriptor, Options, DB};
use tracing::{error, info};

/// Process entrypoint (SPEC_FULL.md §12). No HTTP API, no mempool, no
/// dashboard — this binary does exactly one job: run the SyncController
/// until it is told to stop.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_global_config()?;
    let config = get_global_config();

    init_tracing(TelemetryConfig::from(config))?;
    ergo_indexer::metrics::init_metrics()?;

    info!(node_url = %config.node_url, db_path = %config.db_path, "starting ergo-indexer");

    let mut cf_descriptors = vec![ColumnFamilyDescriptor::new("default", Options::default())];
    for cf in ALL_COLUMN_FAMILIES {
        cf_descriptors.push(ColumnFamilyDescriptor::new(cf.to_string(), Options::default()));
    }

    let mut db_options = Options::default();
    db_options.create_if_missing(true);
    db_options.create_missing_column_families(true);
    db_options.set_write_buffer_size(256 * 1024 * 1024);
    db_options.set_max_write_buffer_number(4);
    db_options.set_min_write_buffer_number_to_merge(2);
    db_options.set_target_file_size_base(256 * 1024 * 1024);
    db_options.set_level_zero_file_num_compaction_trigger(8);
    db_options.set_max_background_jobs(8);
    db_options.set_compression_type(rocksdb::DBCompressionType::Lz4);

    let db = DB::open_cf_descriptors(&db_options, &config.db_path, cf_descriptors)?;
    let db = Arc::new(db);
    DbHandles::new(db.clone()).map_err(|e| -> Box<dyn std::error::Error> { e.into() })?;

    let mut node_client = NodeClient::new(
        config.node_url.clone(),
        config.node_api_key.clone(),
        Duration::from_millis(config.request_timeout_ms),
    )?;
    if config.cache_enabled {
        let cache = Arc::new(NodeCache::new(1024, Duration::from_secs(config.cache_ttl_s)));
        node_client = node_client.with_cache(cache);
    }
    let node = Arc::new(node_client);

    let store = Store::new(db);
    let controller = SyncController::new(node, store, config.clone());

    let result = controller.run(shutdown_signal()).await;
    if let Err(e) = &result {
        error!(error = %e, "sync controller exited with error");
    }
    info!("ergo-indexer stopped");
    result.map_err(|e| e.into())
}

/// Resolves on SIGINT or SIGTERM, letting the in-flight batch finish before
/// the process exits (spec §4.8 "graceful shutdown").
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
