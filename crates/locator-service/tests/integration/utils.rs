use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use locator_service::ResolverService;
use locator_service::config::Config;
use locator_service::display::DisplayTable;
use locator_service::persistence::FsStorage;
use locator_service::remote::HttpLookup;
use locator_test::LookupServer;

/// A configuration pointing at `server`, with pacing short enough for tests.
pub fn config(server: &LookupServer) -> Config {
    let mut config = Config::default();
    config.remote.base_url = Some(server.url());
    config.remote.timeout = Duration::from_secs(2);
    config.queue.min_interval = Duration::from_millis(10);
    config.queue.cooldown = Duration::from_millis(1);
    config
        .display_names
        .insert("France".into(), "République française".into());
    config
}

/// Creates a resolver for `config` that keeps its state in `dir`.
pub async fn setup_service(config: &Config, dir: &Path) -> ResolverService {
    let remote = HttpLookup::from_config(&config.remote).unwrap();
    let storage = FsStorage::new(dir);
    let display = DisplayTable::new(config.display_names.clone());
    ResolverService::new(
        config,
        Arc::new(remote),
        Arc::new(storage),
        Arc::new(display),
    )
    .await
}
