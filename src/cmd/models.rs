//! The `models` subcommand.

use clap::Args;

use crate::{config::Config, prelude::*};

/// List the models configured in the registry.
#[derive(Debug, Args)]
pub struct ModelsOpts {}

/// Run the `models` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_models(config: Config, _opts: ModelsOpts) -> Result<()> {
    if config.models.is_empty() {
        println!("no models configured; add [models.<id>] entries to distill.toml");
        return Ok(());
    }
    println!("{:<20} {:<12} {}", "MODEL", "KIND", "BASE URL");
    for (id, entry) in &config.models {
        let kind = match entry.kind {
            crate::config::ModelKind::Chat => "chat",
            crate::config::ModelKind::Completion => "completion",
            crate::config::ModelKind::Echo => "echo",
        };
        println!(
            "{:<20} {:<12} {}",
            id,
            kind,
            entry.base_url.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}
