//! Pipeline builder and executor.
//!
//! A pipeline is a typed chain of [`Stage`]s: the compiler checks that each
//! stage's output is the next stage's input. Every stage attempt runs inside
//! its own tracked run, so a retried stage leaves one run per attempt.

use async_trait::async_trait;
use thiserror::Error;
use tracing::Instrument;

use crate::collaborators::CollaboratorError;
use crate::model::Algorithm;
use crate::recorder::{ActiveRun, Failure, RunRecorder};
use crate::retry::RetryPolicy;
use crate::stage::{error_kind, Stage, StageError};
use crate::store::StoreError;

/// Error returned by pipeline execution.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A stage failed permanently.
    #[error("stage '{stage}' failed: {source}")]
    StageFailed {
        stage: &'static str,
        kind: String,
        #[source]
        source: anyhow::Error,
    },

    /// A stage exhausted all retries.
    #[error("stage '{stage}' exhausted {attempts} attempts: {source}")]
    RetriesExhausted {
        stage: &'static str,
        attempts: u32,
        kind: String,
        #[source]
        source: anyhow::Error,
    },

    /// A store call outside any stage failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The event source could not produce a batch.
    #[error("event source failed: {0}")]
    Source(#[source] CollaboratorError),

    #[error("panicked: {0}")]
    Panicked(String),
}

impl Failure for PipelineError {
    fn kind(&self) -> String {
        match self {
            Self::StageFailed { kind, .. } | Self::RetriesExhausted { kind, .. } => kind.clone(),
            Self::Store(e) => e.kind().to_string(),
            Self::Source(e) => e.kind().to_string(),
            Self::Panicked(_) => "PipelineError::Panicked".to_string(),
        }
    }

    fn panicked(message: String) -> Self {
        Self::Panicked(message)
    }
}

/// Trait for types that can provide an entity ID for logging.
pub trait HasEntityId {
    /// Returns the entity identifier for this input.
    fn entity_id(&self) -> String;
}

impl HasEntityId for String {
    fn entity_id(&self) -> String {
        self.clone()
    }
}

/// Internal trait for boxed stage execution.
#[doc(hidden)]
#[async_trait]
pub trait BoxedStage<I, O>: Send + Sync {
    fn name(&self) -> &'static str;
    async fn execute(&self, input: I, run: &ActiveRun) -> Result<O, StageError>;
}

/// Wrapper to make any Stage into a BoxedStage.
#[doc(hidden)]
pub struct StageWrapper<S>(pub S);

#[async_trait]
impl<S> BoxedStage<S::Input, S::Output> for StageWrapper<S>
where
    S: Stage,
{
    fn name(&self) -> &'static str {
        self.0.name()
    }

    async fn execute(
        &self,
        input: S::Input,
        run: &ActiveRun,
    ) -> Result<S::Output, StageError> {
        self.0.execute(input, run).await
    }
}

/// Execution context shared by every link of a chain.
#[doc(hidden)]
pub struct ChainContext<'a> {
    pub pipeline: &'a str,
    pub recorder: &'a RunRecorder,
    pub retry_policy: &'a RetryPolicy,
}

/// A chain of stages that transforms I -> O.
#[doc(hidden)]
#[async_trait]
pub trait StageChain<I, O>: Send + Sync {
    async fn run(&self, input: I, ctx: &ChainContext<'_>) -> Result<O, PipelineError>;

    /// Returns the number of stages in this chain.
    fn stage_count(&self) -> u32;

    /// Collect stage names in order.
    fn collect_stage_names(&self, names: &mut Vec<&'static str>);
}

/// Terminal chain - identity transform.
#[doc(hidden)]
pub struct Identity;

#[async_trait]
impl<T: Send + 'static> StageChain<T, T> for Identity {
    async fn run(&self, input: T, _ctx: &ChainContext<'_>) -> Result<T, PipelineError> {
        Ok(input)
    }

    fn stage_count(&self) -> u32 {
        0
    }

    fn collect_stage_names(&self, _names: &mut Vec<&'static str>) {}
}

/// Run one stage under the retry policy, one tracked run per attempt.
async fn run_stage<S, I, O>(stage: &S, input: I, ctx: &ChainContext<'_>) -> Result<O, PipelineError>
where
    S: BoxedStage<I, O>,
    I: Send + Sync + Clone,
    O: Send,
{
    let stage_name = stage.name();
    let algorithm = Algorithm::current(format!("{}.{}", ctx.pipeline, stage_name));

    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let attempt_input = input.clone();
        let result = ctx
            .recorder
            .track(algorithm.clone(), Vec::new(), |run| async move {
                stage.execute(attempt_input, &run).await
            })
            .await;

        match result {
            Ok(output) => {
                tracing::debug!(stage = stage_name, attempt, "Stage finished");
                return Ok(output);
            }
            Err(StageError::Permanent(e)) => {
                return Err(PipelineError::StageFailed {
                    stage: stage_name,
                    kind: error_kind(&e),
                    source: e,
                });
            }
            Err(StageError::Retryable(e)) => match ctx.retry_policy.delay_for_attempt(attempt) {
                Some(delay) => {
                    tracing::warn!(
                        stage = stage_name,
                        attempt,
                        budget = ctx.retry_policy.attempt_budget(),
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Stage failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    return Err(PipelineError::RetriesExhausted {
                        stage: stage_name,
                        attempts: attempt,
                        kind: error_kind(&e),
                        source: e,
                    });
                }
            },
        }
    }
}

/// Chain that runs a stage then continues with the rest.
#[doc(hidden)]
pub struct ChainedStage<S, Next, I, M, O>
where
    S: BoxedStage<I, M>,
    Next: StageChain<M, O>,
{
    pub stage: S,
    pub next: Next,
    pub _phantom: std::marker::PhantomData<fn(I) -> (M, O)>,
}

#[async_trait]
impl<S, Next, I, M, O> StageChain<I, O> for ChainedStage<S, Next, I, M, O>
where
    I: Send + Sync + Clone + 'static,
    M: Send + Sync + 'static,
    O: Send + Sync + 'static,
    S: BoxedStage<I, M> + Send + Sync,
    Next: StageChain<M, O> + Send + Sync,
{
    async fn run(&self, input: I, ctx: &ChainContext<'_>) -> Result<O, PipelineError> {
        let output = run_stage(&self.stage, input, ctx).await?;
        self.next.run(output, ctx).await
    }

    fn stage_count(&self) -> u32 {
        1 + self.next.stage_count()
    }

    fn collect_stage_names(&self, names: &mut Vec<&'static str>) {
        names.push(self.stage.name());
        self.next.collect_stage_names(names);
    }
}

/// Chain that runs first chain then a stage.
#[doc(hidden)]
pub struct ThenChain<First, S, I, M, O>
where
    First: StageChain<I, M>,
    S: BoxedStage<M, O>,
{
    pub first: First,
    pub stage: S,
    pub _phantom: std::marker::PhantomData<fn(I) -> (M, O)>,
}

#[async_trait]
impl<First, S, I, M, O> StageChain<I, O> for ThenChain<First, S, I, M, O>
where
    I: Send + Sync + Clone + 'static,
    M: Send + Sync + Clone + 'static,
    O: Send + Sync + 'static,
    First: StageChain<I, M> + Send + Sync,
    S: BoxedStage<M, O> + Send + Sync,
{
    async fn run(&self, input: I, ctx: &ChainContext<'_>) -> Result<O, PipelineError> {
        let mid = self.first.run(input, ctx).await?;
        run_stage(&self.stage, mid, ctx).await
    }

    fn stage_count(&self) -> u32 {
        self.first.stage_count() + 1
    }

    fn collect_stage_names(&self, names: &mut Vec<&'static str>) {
        self.first.collect_stage_names(names);
        names.push(self.stage.name());
    }
}

/// Builder for constructing pipelines.
pub struct Pipeline<I, O, Chain>
where
    Chain: StageChain<I, O>,
{
    name: String,
    chain: Chain,
    retry_policy: RetryPolicy,
    recorder: RunRecorder,
    _phantom: std::marker::PhantomData<fn(I) -> O>,
}

impl Pipeline<(), (), Identity> {
    /// Create a new pipeline builder whose stage runs go to `recorder`.
    pub fn new(name: impl Into<String>, recorder: RunRecorder) -> Self {
        Self {
            name: name.into(),
            chain: Identity,
            retry_policy: RetryPolicy::default(),
            recorder,
            _phantom: std::marker::PhantomData,
        }
    }

    /// Add the first stage to the pipeline.
    #[allow(clippy::type_complexity)]
    pub fn start_with<S>(
        self,
        stage: S,
    ) -> Pipeline<
        S::Input,
        S::Output,
        ChainedStage<StageWrapper<S>, Identity, S::Input, S::Output, S::Output>,
    >
    where
        S: Stage + 'static,
        S::Input: 'static,
        S::Output: 'static,
    {
        Pipeline {
            name: self.name,
            chain: ChainedStage {
                stage: StageWrapper(stage),
                next: Identity,
                _phantom: std::marker::PhantomData,
            },
            retry_policy: self.retry_policy,
            recorder: self.recorder,
            _phantom: std::marker::PhantomData,
        }
    }
}

impl<I, O, Chain> Pipeline<I, O, Chain>
where
    I: Send + Sync + Clone + 'static,
    O: Send + Sync + Clone + 'static,
    Chain: StageChain<I, O> + Send + Sync + 'static,
{
    /// Add a stage to the pipeline.
    pub fn then<S>(self, stage: S) -> Pipeline<I, S::Output, impl StageChain<I, S::Output>>
    where
        S: Stage<Input = O> + 'static,
        S::Output: 'static,
    {
        Pipeline {
            name: self.name,
            chain: ThenChain {
                first: self.chain,
                stage: StageWrapper(stage),
                _phantom: std::marker::PhantomData,
            },
            retry_policy: self.retry_policy,
            recorder: self.recorder,
            _phantom: std::marker::PhantomData,
        }
    }

    /// Set the retry policy for this pipeline.
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Build the pipeline, ready for execution.
    pub fn build(self) -> BuiltPipeline<I, O, Chain> {
        BuiltPipeline {
            name: self.name,
            chain: self.chain,
            retry_policy: self.retry_policy,
            recorder: self.recorder,
            _phantom: std::marker::PhantomData,
        }
    }
}

/// A built pipeline ready for execution.
pub struct BuiltPipeline<I, O, Chain>
where
    Chain: StageChain<I, O>,
{
    name: String,
    chain: Chain,
    retry_policy: RetryPolicy,
    recorder: RunRecorder,
    _phantom: std::marker::PhantomData<fn(I) -> O>,
}

impl<I, O, Chain> BuiltPipeline<I, O, Chain>
where
    I: Send + HasEntityId + 'static,
    O: Send + 'static,
    Chain: StageChain<I, O> + Send + Sync,
{
    /// Execute the pipeline with the given input.
    pub async fn run(&self, input: I) -> Result<O, PipelineError> {
        let span = tracing::info_span!("pipeline", name = %self.name, entity = %input.entity_id());
        let ctx = ChainContext {
            pipeline: &self.name,
            recorder: &self.recorder,
            retry_policy: &self.retry_policy,
        };
        self.chain.run(input, &ctx).instrument(span).await
    }

    /// Get the pipeline name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stage names in execution order.
    pub fn stage_names(&self) -> Vec<&'static str> {
        let mut names = Vec::with_capacity(self.chain.stage_count() as usize);
        self.chain.collect_stage_names(&mut names);
        names
    }
}
