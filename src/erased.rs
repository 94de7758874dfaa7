//! Type-erased item chain for runtime dispatch.

use async_trait::async_trait;

use crate::collaborators::SourceEvent;
use crate::pipeline::{BuiltPipeline, PipelineError, StageChain};
use crate::stages::IngestedEvent;

/// The per-item chain as the orchestrator sees it.
#[async_trait]
pub trait ItemChain: Send + Sync {
    /// Get the pipeline name.
    fn name(&self) -> &str;

    /// Run every stage for one item.
    async fn process(&self, event: SourceEvent) -> Result<IngestedEvent, PipelineError>;
}

#[async_trait]
impl<Chain> ItemChain for BuiltPipeline<SourceEvent, IngestedEvent, Chain>
where
    Chain: StageChain<SourceEvent, IngestedEvent> + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        BuiltPipeline::name(self)
    }

    async fn process(&self, event: SourceEvent) -> Result<IngestedEvent, PipelineError> {
        self.run(event).await
    }
}
