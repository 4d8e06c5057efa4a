use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

mod download;
mod error;
mod int_range;
mod manga;
mod net;
mod script;
use manga::get::GetManga;

fn init_logging(verbose: bool) {
    let default = if verbose { "mangabz_dl=debug,info" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = GetManga::parse();
    init_logging(args.verbose);

    let manga = args.get().await?;
    if args.chapters {
        manga.print_chapters();
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing pages in flight...");
            on_interrupt.cancel();
        }
    });

    let report = manga.download(&cancel).await?;
    report.log_summary();
    if !report.is_clean() {
        std::process::exit(1);
    }
    Ok(())
}
