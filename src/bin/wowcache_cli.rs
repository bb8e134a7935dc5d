// wowcache-cli: thin operational wrapper around the write-back page cache.
//
// One narrow verification subcommand rather than a full server: init
// tracing up front, plain eprintln usage errors, no subsystem startup.

use std::process::ExitCode;
use std::sync::Arc;

use once_cell::sync::Lazy;
use tracing::{error, info};
use wowcache::buffer_pool::HeapBufferPool;
use wowcache::file_io::LocalFileLayer;
use wowcache::{CacheConfig, WOWCache};

/// Built once on first use; the CLI's own default differs from the
/// library's (a larger open-file capacity, since a standalone verify run
/// has no caller-provided sizing to inherit).
static DEFAULT_CONFIG: Lazy<CacheConfig> = Lazy::new(|| {
    let mut cfg = CacheConfig::default();
    cfg.open_file_capacity = 1024;
    cfg
});

fn usage() -> ! {
    eprintln!("usage: wowcache-cli verify <data-dir> [page-size]");
    std::process::exit(2);
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt().with_target(false).with_level(true).init();

    let mut args = std::env::args().skip(1);
    let Some(command) = args.next() else { usage() };

    match command.as_str() {
        "verify" => {
            let Some(dir) = args.next() else { usage() };
            let page_size: usize = args
                .next()
                .map(|s| s.parse().unwrap_or_else(|_| usage()))
                .unwrap_or(64 * 1024);

            match run_verify(&dir, page_size).await {
                Ok(errors) if errors.is_empty() => {
                    info!(data_dir = %dir, "verification passed, no integrity errors");
                    ExitCode::SUCCESS
                }
                Ok(errors) => {
                    for e in &errors {
                        error!(
                            file_id = e.file_id,
                            page_index = e.page_index,
                            magic_wrong = e.magic_wrong,
                            crc_wrong = e.crc_wrong,
                            "page integrity error"
                        );
                    }
                    ExitCode::FAILURE
                }
                Err(e) => {
                    error!(error = %e, "verification failed to run");
                    ExitCode::FAILURE
                }
            }
        }
        _ => usage(),
    }
}

async fn run_verify(
    dir: &str,
    page_size: usize,
) -> wowcache::Result<Vec<wowcache::verify::PageIntegrityError>> {
    let mut config = DEFAULT_CONFIG.clone();
    config.page_size = page_size;

    let layer = Arc::new(LocalFileLayer::new(dir));
    let pool = Arc::new(HeapBufferPool::new(page_size));
    let cache = WOWCache::open(dir, config, layer, pool, None)?;
    let errors = cache.verify(None).await?;
    cache.close_all().await?;
    Ok(errors)
}
