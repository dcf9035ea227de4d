//! Command handlers behind the `codec-bridge` binary.
//!
//! - [`convert_files`]: convert PNG files on disk through a worker
//! - [`render_info`]: format the module capability report

mod convert;
mod info;

pub use convert::{convert_files, ConvertJob};
pub use info::render_info;
