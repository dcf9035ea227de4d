use std::path::Path;
use crate::utils::{BridgeError, BridgeResult};

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n'];

/// Validates that the input is an existing regular file
pub fn validate_input_path(path: &Path) -> BridgeResult<()> {
    if !path.exists() {
        return Err(BridgeError::validation(
            format!("Input file does not exist: {}", path.display())
        ));
    }

    if !path.is_file() {
        return Err(BridgeError::validation(
            format!("Input path is not a file: {}", path.display())
        ));
    }

    Ok(())
}

/// Refuses output paths that would overwrite the input
pub fn validate_output_path(input: &Path, output: &Path) -> BridgeResult<()> {
    if input == output {
        return Err(BridgeError::validation(format!(
            "Output would overwrite the input: {}. Use a separate output directory",
            output.display()
        )));
    }
    Ok(())
}

/// Checks the PNG signature; every codec entry point takes PNG input
pub fn validate_png(bytes: &[u8]) -> BridgeResult<()> {
    if bytes.len() < PNG_SIGNATURE.len() || bytes[..PNG_SIGNATURE.len()] != PNG_SIGNATURE {
        return Err(BridgeError::validation("Input is not a PNG file"));
    }
    Ok(())
}
