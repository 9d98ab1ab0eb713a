//! Workspace initialization: `warden init`.

use anyhow::{Context, Result};
use std::path::Path;

use warden::config::Settings;

pub fn cmd_init(config_path: &Path, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        println!("Settings already exist at {}", config_path.display());
        println!("Use --force to overwrite them.");
        return Ok(());
    }

    if let Some(parent) = config_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let mut settings = Settings::default();
    settings.save(config_path)?;
    settings.base_dir = config_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();

    let state_dir = settings.state_file();
    let state_dir = state_dir.parent().unwrap_or(Path::new("."));
    for dir in [settings.binaries_dir(), settings.data_dir(), state_dir.to_path_buf()] {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    println!("Initialized warden at {}", config_path.display());
    println!();
    println!("Next steps:");
    println!("  1. Review {} (launch command, listener)", config_path.display());
    println!("  2. Run 'warden serve' and connect to ws://<host>:<port>/socket");
    println!("  3. Create the first admin with :user create \"<name>\"");
    Ok(())
}
