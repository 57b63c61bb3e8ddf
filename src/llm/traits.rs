//! The adapter contract every provider backend implements.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

use super::{AdapterError, ChatRequest, ClassifiedError, ProviderResponse};

/// Zero-argument closure resolving the current API key. Re-evaluated on
/// every outbound request, so a vault unlock or rotation is visible
/// without re-registering the adapter. An empty string means "send
/// without credentials".
pub type KeyFunc = Arc<dyn Fn() -> String + Send + Sync>;

/// A raw byte stream from a provider, passed through to the caller.
pub type ByteStream =
    Pin<Box<dyn Stream<Item = std::result::Result<Bytes, AdapterError>> + Send>>;

/// Result of a health probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Up,
    Down(String),
    /// The adapter variant has no probe endpoint.
    Unsupported,
}

/// Provider-transport capability set for one backend.
///
/// Variants share this call surface but differ in wire encoding, auth
/// headers, and failure shapes. Each adapter owns its own mapping from
/// provider-specific failures to the five-variant classification.
#[async_trait]
pub trait Sender: Send + Sync {
    /// Registry id of this adapter.
    fn id(&self) -> &str;

    /// Send a chat request to the named model. `deadline` is the time
    /// remaining in the request's latency budget, when one is set.
    async fn send(
        &self,
        model: &str,
        request: &ChatRequest,
        deadline: Option<Duration>,
    ) -> std::result::Result<ProviderResponse, AdapterError>;

    /// Map a failure this adapter produced to the shared classification.
    fn classify_error(&self, err: &AdapterError) -> ClassifiedError;

    /// Open a pass-through byte stream for the request. Optional.
    async fn stream(
        &self,
        _model: &str,
        _request: &ChatRequest,
        _deadline: Option<Duration>,
    ) -> std::result::Result<ByteStream, AdapterError> {
        Err(AdapterError::Stream(
            "streaming not supported by this adapter".to_string(),
        ))
    }

    /// Cheap health probe. Optional.
    async fn probe(&self) -> ProbeOutcome {
        ProbeOutcome::Unsupported
    }
}
