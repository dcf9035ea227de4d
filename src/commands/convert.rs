//! File-to-file conversion through a worker.

use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use crate::core::{ConversionSummary, OptionRecord};
use crate::utils::{
    output_path_for, read_input, validate_input_path, validate_output_path, validate_png, write_output,
    BridgeError, OutputFormat,
};
use crate::worker::{WorkerClient, WorkerError};

/// One batch of files converted with the same format and options.
#[derive(Debug, Clone)]
pub struct ConvertJob {
    pub inputs: Vec<PathBuf>,
    pub format: OutputFormat,
    pub options: OptionRecord,
    /// Defaults to each input's own directory
    pub out_dir: Option<PathBuf>,
}

/// Converts every input of `job`, one request at a time.
///
/// A failing file is reported in its summary and does not stop the batch.
///
/// # Returns
/// One summary per input, in input order.
pub async fn convert_files(client: &WorkerClient, job: &ConvertJob) -> Vec<ConversionSummary> {
    debug!("Converting {} files to {}", job.inputs.len(), job.format);
    let mut summaries = Vec::with_capacity(job.inputs.len());

    for input in &job.inputs {
        let summary = convert_file(client, job, input).await;
        if summary.success {
            info!(
                "{} -> {}: saved {} bytes ({:.1}%)",
                summary.input_path, summary.output_path, summary.saved_bytes, summary.compression_ratio
            );
        } else {
            warn!("{}: {}", summary.input_path, summary.error.as_deref().unwrap_or("conversion failed"));
        }
        summaries.push(summary);
    }
    summaries
}

async fn convert_file(client: &WorkerClient, job: &ConvertJob, input: &Path) -> ConversionSummary {
    let input_path = input.display().to_string();
    let output = match output_path_for(input, job.out_dir.as_deref(), job.format) {
        Ok(output) => output,
        Err(e) => return failed_bridge(input_path, String::new(), 0, &e),
    };
    let output_path = output.display().to_string();

    let bytes = match prepare_input(input, &output).await {
        Ok(bytes) => bytes,
        Err(e) => return failed_bridge(input_path, output_path, 0, &e),
    };
    let input_size = bytes.len() as u64;

    let converted = match client.convert(Some(job.format.id()), job.options.clone(), bytes).await {
        Ok(converted) => converted,
        Err(e) => return failed_worker(input_path, output_path, input_size, &e),
    };

    if let Err(e) = write_output(&output, &converted).await {
        return failed_bridge(input_path, output_path, input_size, &e);
    }
    ConversionSummary::succeeded(input_path, output_path, input_size, converted.len() as u64)
}

async fn prepare_input(input: &Path, output: &Path) -> Result<Vec<u8>, BridgeError> {
    validate_input_path(input)?;
    validate_output_path(input, output)?;
    let bytes = read_input(input).await?;
    validate_png(&bytes)?;
    Ok(bytes)
}

fn failed_bridge(input_path: String, output_path: String, input_size: u64, error: &BridgeError) -> ConversionSummary {
    ConversionSummary::failed(input_path, output_path, input_size, error.to_string(), Some(error.code().to_string()))
}

fn failed_worker(input_path: String, output_path: String, input_size: u64, error: &WorkerError) -> ConversionSummary {
    ConversionSummary::failed(
        input_path,
        output_path,
        input_size,
        error.to_string(),
        error.code().map(str::to_string),
    )
}
