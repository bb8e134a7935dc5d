//! `checkStoredPages`: the file-by-file integrity sweep (spec.md §4.6).
//!
//! Walks every live extent under a write lock and reports a typed error
//! list for footer mismatches instead of failing fast on the first bad
//! page.

use crate::error::Result;
use crate::file_io::OpenFileContainer;
use crate::page_format;
use crate::page_key::FileId;

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// One page that failed its magic/CRC check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageIntegrityError {
    pub file_id: FileId,
    pub page_index: i64,
    pub magic_wrong: bool,
    pub crc_wrong: bool,
}

/// Receives progress as the sweep runs (spec.md §4.6: "emit progress ...
/// every ~5s").
pub trait VerifyListener: Send + Sync {
    fn on_progress(&self, file_id: FileId, pages_checked: u64, pages_total: u64);
}

const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// Walk every `(file_id, name)` pair in `files`, reading `page_size`-byte
/// pages sequentially and checking each against the on-disk footer
/// contract. Does not mutate any page.
pub async fn check_stored_pages(
    files: &Arc<OpenFileContainer>,
    live_files: &[(FileId, String)],
    page_size: usize,
    listener: Option<&dyn VerifyListener>,
) -> Result<Vec<PageIntegrityError>> {
    let mut errors = Vec::new();

    for (file_id, _name) in live_files {
        let handle = files.acquire(*file_id).await?;
        handle.sync().await?;

        let size = handle.size().await?;
        let page_count = size / page_size as u64;
        let mut buf = vec![0u8; page_size];
        let mut last_report = Instant::now();

        for page_index in 0..page_count {
            let offset = page_index * page_size as u64;
            let read = handle.read(offset, &mut buf).await?;
            if read < page_size {
                break;
            }
            let check = page_format::verify_footer(&buf);
            if !check.ok() {
                errors.push(PageIntegrityError {
                    file_id: *file_id,
                    page_index: page_index as i64,
                    magic_wrong: check.magic_wrong,
                    crc_wrong: check.crc_wrong,
                });
            }

            if last_report.elapsed() >= PROGRESS_INTERVAL {
                info!(file_id, page_index, page_count, "verification progress");
                if let Some(listener) = listener {
                    listener.on_progress(*file_id, page_index + 1, page_count);
                }
                last_report = Instant::now();
            }
        }

        if let Some(listener) = listener {
            listener.on_progress(*file_id, page_count, page_count);
        }
    }

    Ok(errors)
}
