use crate::errors::SequencerError;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

struct LogFile {
    path: PathBuf,
    len: u64,
    modified: Option<SystemTime>,
}

fn io_error(err: std::io::Error) -> SequencerError {
    SequencerError::Io(err.to_string())
}

fn jsonl_files(dir: &Path) -> Result<Vec<LogFile>, SequencerError> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_error)?.flatten() {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("jsonl") {
            continue;
        }
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if meta.is_file() {
            files.push(LogFile {
                path,
                len: meta.len(),
                modified: meta.modified().ok(),
            });
        }
    }
    files.sort_by_key(|file| file.modified);
    Ok(files)
}

/// Delete the oldest `*.jsonl` files in `dir` until the directory fits in
/// `budget_bytes`. `keep` is never removed, even when it alone exceeds the budget.
pub fn enforce_total_budget(
    dir: &Path,
    budget_bytes: u64,
    keep: &Path,
) -> Result<Vec<PathBuf>, SequencerError> {
    let files = jsonl_files(dir)?;
    let mut total: u64 = files.iter().map(|file| file.len).sum();

    let mut deleted = Vec::new();
    for file in files.into_iter().filter(|file| file.path != keep) {
        if total <= budget_bytes {
            break;
        }
        fs::remove_file(&file.path).map_err(io_error)?;
        total = total.saturating_sub(file.len);
        deleted.push(file.path);
    }
    Ok(deleted)
}
