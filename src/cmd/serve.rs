//! Monitor server command: `warden serve`.

use anyhow::Result;
use std::path::Path;
use tracing::warn;

use warden::config::Settings;

pub async fn cmd_serve(config_path: &Path, port: Option<u16>) -> Result<()> {
    let mut settings = Settings::load_or_default(config_path)?;
    if let Some(port) = port {
        settings.server.port = port;
    }
    for warning in settings.validate() {
        warn!("{}", warning);
    }

    warden::monitor::start_server(settings).await
}
