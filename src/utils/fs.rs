use std::path::{Path, PathBuf};
use tokio::fs;
use crate::utils::{BridgeError, BridgeResult, OutputFormat};

/// Strips an optional `file://` scheme from a module location.
pub fn module_path(location: &str) -> &Path {
    Path::new(location.strip_prefix("file://").unwrap_or(location))
}

/// Reads a native module image from disk.
///
/// Runs on the blocking pool, so this uses `std::fs` rather than tokio.
pub fn read_module_bytes(location: &str) -> BridgeResult<Vec<u8>> {
    let path = module_path(location);
    std::fs::read(path).map_err(|e| BridgeError::initialization(
        format!("Failed to read module {}: {}", path.display(), e)
    ))
}

/// Read an input image into memory
pub async fn read_input(path: impl AsRef<Path>) -> BridgeResult<Vec<u8>> {
    fs::read(path.as_ref())
        .await
        .map_err(|e| BridgeError::Io(format!("Failed to read {}: {}", path.as_ref().display(), e)))
}

/// Write converted bytes, creating the parent directory when needed
pub async fn write_output(path: impl AsRef<Path>, bytes: &[u8]) -> BridgeResult<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }
    fs::write(path, bytes)
        .await
        .map_err(|e| BridgeError::Io(format!("Failed to write {}: {}", path.display(), e)))
}

/// Builds the output path for `input` in `out_dir` with the format's extension.
///
/// PNGX output keeps the `.png` extension, so writing next to the input
/// would overwrite it; callers pass a separate directory in that case.
pub fn output_path_for(input: &Path, out_dir: Option<&Path>, format: OutputFormat) -> BridgeResult<PathBuf> {
    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| BridgeError::validation(
            format!("Input has no file name: {}", input.display())
        ))?;
    let dir = match out_dir {
        Some(dir) => dir.to_path_buf(),
        None => input.parent().map(Path::to_path_buf).unwrap_or_default(),
    };
    Ok(dir.join(format!("{}.{}", stem, format.output_extension())))
}
