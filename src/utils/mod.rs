pub mod error;
pub mod formats;
pub mod fs;
pub mod validation;

pub use error::{BridgeError, BridgeResult, NativeErrorCode, NATIVE_OUTPUT_NOT_SMALLER};
pub use formats::OutputFormat;
pub use fs::{module_path, read_module_bytes, read_input, write_output, output_path_for};
pub use validation::{validate_input_path, validate_output_path, validate_png};
