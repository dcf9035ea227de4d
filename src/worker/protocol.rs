//! Messages exchanged between a [`WorkerClient`](super::WorkerClient) and its orchestrator.

use serde::{Deserialize, Serialize};
use crate::core::{InitInfo, OptionRecord, VersionInfo, WorkerConfig};
use crate::utils::BridgeError;

pub type RequestId = u64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum WorkerRequest {
    #[serde(rename_all = "camelCase")]
    Init {
        id: RequestId,
        module_location: String,
        #[serde(default)]
        secondary_location: Option<String>,
        #[serde(default)]
        thread_count: Option<usize>,
    },
    #[serde(rename_all = "camelCase")]
    Convert {
        id: RequestId,
        #[serde(default)]
        format_id: Option<String>,
        #[serde(default)]
        options: OptionRecord,
        input: Vec<u8>,
    },
}

impl WorkerRequest {
    pub fn init(id: RequestId, config: WorkerConfig) -> Self {
        Self::Init {
            id,
            module_location: config.module_location,
            secondary_location: config.secondary_location,
            thread_count: config.thread_count,
        }
    }

    pub fn id(&self) -> RequestId {
        match self {
            Self::Init { id, .. } | Self::Convert { id, .. } => *id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum WorkerResponse {
    #[serde(rename_all = "camelCase")]
    InitComplete {
        id: RequestId,
        threads_enabled: bool,
        secondary_enabled: bool,
        secondary_threads_enabled: bool,
        versions: VersionInfo,
    },
    #[serde(rename_all = "camelCase")]
    ConvertResult {
        id: RequestId,
        output: Vec<u8>,
        input_size: usize,
        output_size: usize,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        id: RequestId,
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_code: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input_size: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_size: Option<usize>,
    },
}

impl WorkerResponse {
    pub fn init_complete(id: RequestId, info: InitInfo) -> Self {
        Self::InitComplete {
            id,
            threads_enabled: info.threads_enabled,
            secondary_enabled: info.secondary_enabled,
            secondary_threads_enabled: info.secondary_threads_enabled,
            versions: info.versions,
        }
    }

    pub fn converted(id: RequestId, input_size: usize, output: Vec<u8>) -> Self {
        Self::ConvertResult {
            id,
            output_size: output.len(),
            input_size,
            output,
        }
    }

    /// Error response carrying the code and sizes the error knows about.
    pub fn failed(id: RequestId, error: &BridgeError) -> Self {
        Self::Error {
            id,
            error: error.to_string(),
            error_code: Some(error.code().to_string()),
            input_size: error.input_size(),
            output_size: error.output_size(),
        }
    }

    pub fn id(&self) -> RequestId {
        match self {
            Self::InitComplete { id, .. } | Self::ConvertResult { id, .. } | Self::Error { id, .. } => *id,
        }
    }

    pub fn success(&self) -> bool {
        !matches!(self, Self::Error { .. })
    }
}
