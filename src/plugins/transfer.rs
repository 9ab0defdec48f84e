use crate::core::error::EngineError;
use crate::core::events::TransferEvent;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::path::Path;

/// Lazy, non-restartable sequence of lifecycle events for one transfer.
pub type EventStream = BoxStream<'static, TransferEvent>;

/// Cancellation side of a transfer handle.
pub trait TransferControl: Send + Sync {
    /// Requests termination. Confirmation arrives later on the event stream as
    /// `Cancelled` or `CancelFailed`.
    fn cancel(&self) -> Result<(), EngineError>;
}

pub struct TransferHandle {
    pub events: EventStream,
    pub control: Box<dyn TransferControl>,
}

#[async_trait]
pub trait TransferEngine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the engine is still holding a transfer for this resource.
    fn is_tracking(&self, resource_id: &str) -> bool;

    /// Starts a transfer and returns without waiting for it to finish.
    async fn begin(&self, resource_id: &str, destination: &Path) -> Result<TransferHandle, EngineError>;
}
