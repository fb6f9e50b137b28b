pub mod gpt;
pub mod io;
pub mod types;
pub mod utils;

use anyhow::{bail, Context, Result};
use std::path::Path;

/// Create (or truncate and recreate) a sparse, zero-filled image file.
pub fn create_image(path: &Path, size_bytes: u64) -> Result<()> {
    if path.is_dir() {
        bail!("{} is a directory", path.display());
    }
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).with_context(|| {
            format!("failed to create parent directory: {}", parent.display())
        })?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("failed to create image {}", path.display()))?;
    file.set_len(size_bytes)
        .with_context(|| "failed to set image size".to_string())?;
    debug!("created {} ({} bytes)", path.display(), size_bytes);
    Ok(())
}
