// # TextMatch Server
//
// Entry point. The first positional argument selects the mode (api, posting,
// queue, standalone, or a client command); the remaining flags configure the
// registry. Standalone runs every service in one process.

use clap::Parser;
use textmatch::registry::{self, Flags, Mode, Registry};
use textmatch::{client, Result, VERSION};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let (mode, rest) = registry::parse_mode(&args);
    let program = args
        .first()
        .cloned()
        .unwrap_or_else(|| "textmatch".to_string());

    if mode == Mode::Client {
        // Client commands mix positionals with flags; flags must use the
        // --name=value form so the split stays unambiguous.
        let (flag_args, positionals): (Vec<String>, Vec<String>) = rest
            .into_iter()
            .partition(|arg| arg.starts_with("--"));
        let flags = Flags::parse_from(std::iter::once(program).chain(flag_args));
        return client::run(&flags, &positionals).await;
    }

    let flags = Flags::parse_from(std::iter::once(program).chain(rest));

    info!("textmatch {} starting in {:?} mode", VERSION, mode);
    let registry = Registry::open(mode, flags).await?;
    info!(
        "window_size={} hash_width={} group_size={} shards={}",
        registry.key.window_size,
        registry.key.hash_width,
        registry.posting_configs[0].group_size,
        registry.posting_configs.len()
    );
    registry.clone().start_services().await?;

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    registry.shutdown().await;
    Ok(())
}
