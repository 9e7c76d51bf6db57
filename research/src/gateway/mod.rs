//! Agent execution gateway
//!
//! A uniform contract for running a prompt against an agent backend and
//! getting back either a single aggregated result or a live stream of
//! typed messages. Backends only decode their wire format; timeouts,
//! cancellation and aggregation are handled here for all of them.

mod decoder;
mod dialects;
mod http;
mod registry;
mod subprocess;
mod types;

pub use decoder::{LineDecoder, SseDecoder, SseFrame};
pub use dialects::{decode_opencode, OpencodeSignal};
pub use http::HttpBackend;
pub use registry::{ProviderRegistry, RoleBinding};
pub use subprocess::SubprocessBackend;
pub use types::{
    Call, ExecutionResult, GatewayError, MessageSink, StreamMessage, CANCELLED, TIMEOUT,
};

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

/// Messages buffered between a backend and its consumer
const MESSAGE_BUFFER: usize = 64;

/// Callback for messages as they arrive during [`AgentExecutor::execute`]
pub type MessageCallback<'a> = &'a (dyn Fn(&StreamMessage) + Send + Sync);

// ============================================================================
// Backend Trait
// ============================================================================

/// A provider-specific way of running one call.
///
/// Implementations push decoded messages into `sink` and return when the
/// call is over. They may be dropped at any await point; resources must be
/// released on drop (e.g. `kill_on_drop` for child processes).
#[async_trait]
pub trait Backend: Send + Sync {
    /// Provider name, for logs
    fn name(&self) -> &str;

    async fn run(&self, call: Call, sink: MessageSink) -> Result<(), GatewayError>;

    /// Release long-lived resources.
    ///
    /// The default does nothing: subprocess backends spawn one child per call
    /// and hold nothing between calls. Backends that pool connections drop
    /// them here and refuse later calls.
    async fn close(&self) {}
}

// ============================================================================
// Executor
// ============================================================================

/// A backend bound to a model and a per-call timeout
pub struct AgentExecutor {
    backend: Arc<dyn Backend>,
    model: String,
    timeout: Option<Duration>,
    closed: AtomicBool,
}

impl AgentExecutor {
    pub fn new(backend: Arc<dyn Backend>, model: impl Into<String>, timeout: Option<Duration>) -> Self {
        Self {
            backend,
            model: model.into(),
            timeout,
            closed: AtomicBool::new(false),
        }
    }

    pub fn provider(&self) -> &str {
        self.backend.name()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn call(&self, prompt: &str, system_prompt: Option<&str>) -> Call {
        Call {
            prompt: prompt.to_string(),
            system_prompt: system_prompt.map(str::to_string),
            model: self.model.clone(),
        }
    }

    /// Run a prompt to completion and aggregate its messages
    pub async fn execute(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        on_message: Option<MessageCallback<'_>>,
    ) -> ExecutionResult {
        self.execute_cancellable(prompt, system_prompt, on_message, &CancellationToken::new())
            .await
    }

    /// Like [`execute`](Self::execute), stopping early when `cancel` fires
    pub async fn execute_cancellable(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        on_message: Option<MessageCallback<'_>>,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let start = Instant::now();
        let (tx, mut rx) = mpsc::channel(MESSAGE_BUFFER);
        let sink = MessageSink::new(tx);
        let malformed = sink.malformed_counter();
        let call = self.call(prompt, system_prompt);

        tracing::debug!(
            provider = %self.provider(),
            model = %self.model,
            prompt_len = prompt.len(),
            "Executing agent call"
        );

        let mut messages = Vec::new();
        let outcome = {
            let backend = self.backend.clone();
            let collect = async {
                while let Some(message) = rx.recv().await {
                    if let Some(callback) = on_message {
                        callback(&message);
                    }
                    messages.push(message);
                }
            };
            let work = async {
                let (outcome, ()) = tokio::join!(backend.run(call, sink), collect);
                outcome
            };
            guard(work, self.timeout, cancel).await
        };

        let result = aggregate(
            messages,
            outcome,
            start.elapsed(),
            malformed.load(Ordering::Relaxed),
        );

        if result.success {
            tracing::debug!(
                provider = %self.provider(),
                duration_ms = result.duration.as_millis() as u64,
                "Agent call succeeded"
            );
        } else {
            tracing::warn!(
                provider = %self.provider(),
                duration_ms = result.duration.as_millis() as u64,
                "Agent call failed: {}",
                result.error.as_deref().unwrap_or("unknown error")
            );
        }
        result
    }

    /// Stream messages as the backend produces them.
    ///
    /// Failures (including timeout) arrive as a final `error` message.
    /// Dropping the stream stops the backend.
    pub fn execute_stream(&self, prompt: &str, system_prompt: Option<&str>) -> MessageStream {
        let (tx, rx) = mpsc::channel(MESSAGE_BUFFER);
        let cancel = CancellationToken::new();
        let backend = self.backend.clone();
        let call = self.call(prompt, system_prompt);
        let timeout = self.timeout;
        let token = cancel.clone();

        tokio::spawn(async move {
            let error_tx = tx.clone();
            let sink = MessageSink::new(tx);
            match guard(backend.run(call, sink), timeout, &token).await {
                Ok(()) | Err(GatewayError::Cancelled) => {}
                Err(e) => {
                    let _ = error_tx.send(StreamMessage::error(e.to_string())).await;
                }
            }
        });

        MessageStream {
            rx,
            _cancel: cancel.drop_guard(),
        }
    }

    /// Release backend resources; later calls are no-ops
    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.backend.close().await;
        }
    }
}

/// Apply the timeout and cancellation policy to a backend future
async fn guard<F, T>(fut: F, timeout: Option<Duration>, cancel: &CancellationToken) -> Result<T, GatewayError>
where
    F: Future<Output = Result<T, GatewayError>>,
{
    let timed = async {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| GatewayError::Timeout)?,
            None => fut.await,
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(GatewayError::Cancelled),
        outcome = timed => outcome,
    }
}

/// Fold a message sequence and the backend outcome into a result.
///
/// A `result` message supplies the content when present, otherwise the
/// assistant text is concatenated. Any `error` message fails the call.
pub fn aggregate(
    messages: Vec<StreamMessage>,
    outcome: Result<(), GatewayError>,
    duration: Duration,
    malformed_records: u64,
) -> ExecutionResult {
    let final_text = messages.iter().rev().find_map(|m| match m {
        StreamMessage::Result { text } => Some(text.clone()),
        _ => None,
    });
    let content = final_text.unwrap_or_else(|| {
        messages
            .iter()
            .filter_map(|m| match m {
                StreamMessage::AssistantText { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    });
    let stream_error = messages.iter().find_map(|m| match m {
        StreamMessage::Error { message } => Some(message.clone()),
        _ => None,
    });

    let (success, content, error) = match outcome {
        Err(e @ (GatewayError::Timeout | GatewayError::Cancelled)) => {
            (false, String::new(), Some(e.to_string()))
        }
        Err(e) => (false, content, Some(stream_error.unwrap_or_else(|| e.to_string()))),
        Ok(()) => match stream_error {
            Some(message) => (false, content, Some(message)),
            None => (true, content, None),
        },
    };

    ExecutionResult {
        success,
        content,
        messages,
        error,
        duration,
        malformed_records,
    }
}

// ============================================================================
// Message Stream
// ============================================================================

/// Live, finite, non-restartable sequence of messages from one call
pub struct MessageStream {
    rx: mpsc::Receiver<StreamMessage>,
    _cancel: DropGuard,
}

impl MessageStream {
    pub async fn next_message(&mut self) -> Option<StreamMessage> {
        self.rx.recv().await
    }
}

impl Stream for MessageStream {
    type Item = StreamMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
