//! Step orchestration.
//!
//! Drives one build unit through the step state machine:
//!
//! ```text
//! Idle → Resolving → Reconstructing → Preparing → Executing → Committing → DiffExtracting → Done
//! ```
//!
//! Any phase may move to the absorbing `Failed` state. Failures are not
//! retried; the error that caused them is returned with the phase prefix.

use std::sync::Arc;
use std::time::Instant;

use distbuild_core::error::{BuildError, ErrorKind, Result};
use distbuild_core::log::LogConfig;
use distbuild_core::response::StepResponse;
use distbuild_core::unit::BuildUnit;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::executor::{HandleGuard, StepExecutor, StepRequest};
use crate::pull::PullSource;
use crate::reconstruct::LayerReconstructor;
use crate::resolve::ImageResolver;
use crate::store::{LayerStore, StoredImage};

/// States of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    Idle,
    Resolving,
    Reconstructing,
    Preparing,
    Executing,
    Committing,
    DiffExtracting,
    Done,
    Failed,
}

impl StepPhase {
    /// Present participle used in cancellation messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            StepPhase::Idle => "idle",
            StepPhase::Resolving => "resolving",
            StepPhase::Reconstructing => "reconstructing",
            StepPhase::Preparing => "preparing",
            StepPhase::Executing => "executing",
            StepPhase::Committing => "committing",
            StepPhase::DiffExtracting => "extracting diff",
            StepPhase::Done => "done",
            StepPhase::Failed => "failed",
        }
    }
}

impl std::fmt::Display for StepPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one orchestrated step.
#[derive(Debug)]
pub struct StepReport {
    /// Phases entered, in order, ending in `Done` or `Failed`
    pub phases: Vec<StepPhase>,
    /// The new diff, or the error that failed the step
    pub result: Result<Vec<u8>>,
    /// Image committed by the executor, when the step got that far
    pub image: Option<StoredImage>,
}

impl StepReport {
    pub fn final_phase(&self) -> StepPhase {
        self.phases.last().copied().unwrap_or(StepPhase::Idle)
    }

    pub fn to_response(&self) -> StepResponse {
        StepResponse::from_result(&self.result)
    }
}

/// Tag a collaborator error with the phase it happened in, unless it
/// already carries that phase or is a cancellation.
fn tag(phase: StepPhase, err: BuildError) -> BuildError {
    match (phase, err.kind()) {
        (_, ErrorKind::Cancelled)
        | (StepPhase::Preparing, ErrorKind::Prepare)
        | (StepPhase::Executing, ErrorKind::Execute)
        | (StepPhase::Committing, ErrorKind::Commit)
        | (StepPhase::DiffExtracting, ErrorKind::DiffExtraction) => err,
        (StepPhase::Preparing, _) => BuildError::Prepare(err.to_string()),
        (StepPhase::Executing, _) => BuildError::Execute(err.to_string()),
        (StepPhase::Committing, _) => BuildError::Commit(err.to_string()),
        (StepPhase::DiffExtracting, _) => BuildError::DiffExtraction(err.to_string()),
        _ => err,
    }
}

/// Runs build units end to end against shared collaborators.
pub struct StepOrchestrator {
    store: Arc<dyn LayerStore>,
    resolver: ImageResolver,
    reconstructor: LayerReconstructor,
    executor: Arc<dyn StepExecutor>,
    log: LogConfig,
}

impl StepOrchestrator {
    pub fn new(
        store: Arc<dyn LayerStore>,
        puller: Arc<dyn PullSource>,
        executor: Arc<dyn StepExecutor>,
        log: LogConfig,
    ) -> Self {
        Self {
            resolver: ImageResolver::new(store.clone(), puller, log.clone()),
            reconstructor: LayerReconstructor::new(store.clone(), log.clone()),
            store,
            executor,
            log,
        }
    }

    /// Run one unit and return the new diff.
    pub async fn run_step(&self, unit: BuildUnit, cancel: &CancellationToken) -> Result<Vec<u8>> {
        self.run(unit, cancel).await.result
    }

    /// Run one unit and report every phase it went through.
    pub async fn run(&self, mut unit: BuildUnit, cancel: &CancellationToken) -> StepReport {
        let started = Instant::now();
        let mut phases = vec![StepPhase::Idle];
        let mut image = None;

        let result = self.drive(&mut unit, cancel, &mut phases, &mut image).await;

        match &result {
            Ok(diff) => {
                phases.push(StepPhase::Done);
                tracing::info!(
                    base = %unit.base_image_ref,
                    diff_size = diff.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Step completed"
                );
            }
            Err(e) => {
                let failed_in = phases.last().copied().unwrap_or(StepPhase::Idle);
                phases.push(StepPhase::Failed);
                tracing::warn!(
                    phase = %failed_in,
                    kind = ?e.kind(),
                    error = %e,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Step failed"
                );
            }
        }

        StepReport {
            phases,
            result,
            image,
        }
    }

    fn enter(&self, phases: &mut Vec<StepPhase>, phase: StepPhase) {
        if self.log.verbose() {
            tracing::debug!(phase = %phase, "Entering step phase");
        }
        phases.push(phase);
    }

    async fn drive(
        &self,
        unit: &mut BuildUnit,
        cancel: &CancellationToken,
        phases: &mut Vec<StepPhase>,
        committed: &mut Option<StoredImage>,
    ) -> Result<Vec<u8>> {
        let instruction = unit
            .instruction
            .clone()
            .ok_or(BuildError::MissingInstruction)?;

        tracing::info!(
            base = %unit.base_image_ref,
            instruction = instruction.keyword(),
            diff_size = unit.accumulated_diff.len(),
            "Step started"
        );

        self.enter(phases, StepPhase::Resolving);
        let base = self.resolver.resolve(&unit.base_image_ref, cancel).await?;

        self.enter(phases, StepPhase::Reconstructing);
        if cancel.is_cancelled() {
            return Err(BuildError::cancelled(StepPhase::Reconstructing.as_str()));
        }
        let image = self.reconstructor.reconstruct(unit, &base).await?;

        self.enter(phases, StepPhase::Preparing);
        let request = StepRequest {
            image,
            instruction,
            options: unit.build_options.clone(),
            allowed_build_args: unit.allowed_build_args.clone(),
            report_sink: unit.report_sink.clone(),
        };
        let handle = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BuildError::cancelled(StepPhase::Preparing.as_str())),
            result = self.executor.prepare(request) => result.map_err(|e| tag(StepPhase::Preparing, e))?,
        };

        let mut guard = HandleGuard::new(handle);
        let outcome = self.execute_and_commit(&mut guard, cancel, phases).await;
        if let Err(e) = guard.release().await {
            tracing::warn!(error = %e, "Failed to release step resources");
        }
        let image = outcome?;
        *committed = Some(image.clone());

        self.enter(phases, StepPhase::DiffExtracting);
        self.store
            .read_diff(&image.top_layer)
            .await
            .map_err(|e| tag(StepPhase::DiffExtracting, e))
    }

    async fn execute_and_commit(
        &self,
        guard: &mut HandleGuard,
        cancel: &CancellationToken,
        phases: &mut Vec<StepPhase>,
    ) -> Result<StoredImage> {
        self.enter(phases, StepPhase::Executing);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BuildError::cancelled(StepPhase::Executing.as_str())),
            result = guard.execute() => result.map_err(|e| tag(StepPhase::Executing, e))?,
        }

        self.enter(phases, StepPhase::Committing);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BuildError::cancelled(StepPhase::Committing.as_str())),
            result = guard.commit() => result.map_err(|e| tag(StepPhase::Committing, e)),
        }
    }
}
