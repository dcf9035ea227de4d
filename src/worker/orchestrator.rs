//! Request loop that owns the codec context.

use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, OnceCell};
use tracing::{debug, info, warn};
use super::protocol::{RequestId, WorkerRequest, WorkerResponse};
use crate::core::{FormatOptions, InitInfo, OptionRecord, WorkerConfig};
use crate::processing::native::ModuleLoader;
use crate::processing::{convert, CodecContext};
use crate::utils::{BridgeError, OutputFormat};

pub const NOT_INITIALIZED: &str = "Module not initialized. Call init first.";
pub const INPUT_REQUIRED: &str = "inputBytes is required";

/// Handles requests strictly one at a time, in arrival order.
///
/// Native work runs on the blocking pool while the loop awaits it.
pub struct Orchestrator {
    loader: Arc<dyn ModuleLoader>,
    context: OnceCell<Arc<Mutex<CodecContext>>>,
}

impl Orchestrator {
    pub fn new(loader: Arc<dyn ModuleLoader>) -> Self {
        Self { loader, context: OnceCell::new() }
    }

    /// Serves requests until the request channel closes or nobody listens for responses.
    pub async fn run(
        self,
        mut requests: mpsc::UnboundedReceiver<WorkerRequest>,
        responses: mpsc::UnboundedSender<WorkerResponse>,
    ) {
        while let Some(request) = requests.recv().await {
            let response = self.handle(request).await;
            if responses.send(response).is_err() {
                debug!("Response channel closed, stopping orchestrator");
                break;
            }
        }
        debug!("Orchestrator stopped");
    }

    pub async fn handle(&self, request: WorkerRequest) -> WorkerResponse {
        match request {
            WorkerRequest::Init { id, module_location, secondary_location, thread_count } => {
                let config = WorkerConfig { module_location, secondary_location, thread_count };
                match self.init(config).await {
                    Ok(info) => WorkerResponse::init_complete(id, info),
                    Err(e) => {
                        warn!("Initialization failed: {}", e);
                        WorkerResponse::failed(id, &e)
                    }
                }
            }
            WorkerRequest::Convert { id, format_id, options, input } => {
                self.convert(id, format_id.as_deref(), options, input).await
            }
        }
    }

    async fn init(&self, config: WorkerConfig) -> Result<InitInfo, BridgeError> {
        let context = self
            .context
            .get_or_try_init(|| async move {
                info!("Initializing codec context from {}", config.module_location);
                let loader = Arc::clone(&self.loader);
                let context = tokio::task::spawn_blocking(move || CodecContext::init(loader.as_ref(), &config))
                    .await
                    .map_err(|e| BridgeError::initialization(format!("Initialization task failed: {e}")))??;
                Ok::<_, BridgeError>(Arc::new(Mutex::new(context)))
            })
            .await?;

        let guard = context
            .lock()
            .map_err(|_| BridgeError::initialization("Codec context is poisoned"))?;
        Ok(guard.info())
    }

    async fn convert(
        &self,
        id: RequestId,
        format_id: Option<&str>,
        options: OptionRecord,
        input: Vec<u8>,
    ) -> WorkerResponse {
        let Some(context) = self.context.get() else {
            return rejected(id, NOT_INITIALIZED, "not_initialized");
        };
        if input.is_empty() {
            return rejected(id, INPUT_REQUIRED, "invalid_request");
        }

        let format = OutputFormat::from_id_or_default(format_id);
        let options = FormatOptions::from_record(format, &options);
        let context = Arc::clone(context);
        let input_size = input.len();
        debug!("Converting {} bytes to {} (request {})", input_size, format, id);

        let result = tokio::task::spawn_blocking(move || {
            let mut context = context
                .lock()
                .map_err(|_| BridgeError::fault("codec context is poisoned"))?;
            convert(&mut context, &options, &input)
        })
        .await
        .unwrap_or_else(|e| Err(BridgeError::fault(format!("conversion task failed: {e}"))));

        match result {
            Ok(output) => {
                debug!("{} conversion done: {} -> {} bytes", format, input_size, output.len());
                WorkerResponse::converted(id, input_size, output)
            }
            Err(e) => {
                debug!("{} conversion failed: {}", format, e);
                WorkerResponse::failed(id, &e)
            }
        }
    }
}

fn rejected(id: RequestId, message: &str, code: &str) -> WorkerResponse {
    WorkerResponse::Error {
        id,
        error: message.to_string(),
        error_code: Some(code.to_string()),
        input_size: None,
        output_size: None,
    }
}
