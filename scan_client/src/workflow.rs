//! Upload / analyze / display state machine.
//!
//! All state lives in one [`WorkflowState`] and only changes through
//! [`WorkflowState::apply`]. [`Workflow`] owns that state for a session,
//! wires it to an [`InferenceBackend`] and guarantees that an analysis always
//! settles, whichever way the request ends.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    client::{AnalysisClient, InferenceBackend},
    config::DEFAULT_TIMEOUT,
    encoder,
    error::ClientError,
    projection::{HeatmapProjector, HeatmapReference},
    selection::{FilePick, PreviewReference, PreviewStore, SelectedImage},
    AnalysisResult, AnalyzeResponse,
};

/// The one message a user sees when the backend cannot be used.
pub const BACKEND_UNREACHABLE: &str =
    "Failed to reach the analysis server. Is the backend running?";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    Idle,
    Ready,
    Analyzing,
    Complete,
    Failed,
}

#[derive(Debug)]
pub enum WorkflowEvent {
    FileSelected {
        image: SelectedImage,
        preview: PreviewReference,
    },
    Cleared,
    AnalysisStarted,
    AnalysisSucceeded {
        generation: u64,
        result: Option<AnalysisResult>,
        heatmap: Option<HeatmapReference>,
    },
    AnalysisFailed {
        generation: u64,
        message: String,
    },
    AnalysisSettled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    Ignored,
    // Event belongs to a selection that has since been replaced.
    Stale,
}

#[derive(Debug, Default)]
pub struct WorkflowState {
    image: Option<SelectedImage>,
    preview: Option<PreviewReference>,
    result: Option<AnalysisResult>,
    heatmap: Option<HeatmapReference>,
    is_analyzing: bool,
    last_error: Option<String>,
    // Bumped on every selection and clear.
    generation: u64,
}

impl WorkflowState {
    pub fn apply(&mut self, event: WorkflowEvent) -> Transition {
        match event {
            WorkflowEvent::FileSelected { image, preview } => {
                self.image = Some(image);
                // Replacing the old reference revokes it.
                self.preview = Some(preview);
                self.result = None;
                self.heatmap = None;
                self.last_error = None;
                self.generation += 1;
                Transition::Applied
            }
            WorkflowEvent::Cleared => {
                self.image = None;
                self.preview = None;
                self.result = None;
                self.heatmap = None;
                self.generation += 1;
                Transition::Applied
            }
            WorkflowEvent::AnalysisStarted => {
                if self.image.is_none() || self.is_analyzing {
                    return Transition::Ignored;
                }
                self.is_analyzing = true;
                self.last_error = None;
                Transition::Applied
            }
            WorkflowEvent::AnalysisSucceeded {
                generation,
                result,
                heatmap,
            } => {
                if generation != self.generation {
                    return Transition::Stale;
                }
                // No artifact means nothing to show for this cycle.
                if heatmap.is_some() {
                    self.result = result;
                    self.heatmap = heatmap;
                }
                Transition::Applied
            }
            WorkflowEvent::AnalysisFailed {
                generation,
                message,
            } => {
                if generation != self.generation {
                    return Transition::Stale;
                }
                self.last_error = Some(message);
                Transition::Applied
            }
            WorkflowEvent::AnalysisSettled => {
                self.is_analyzing = false;
                Transition::Applied
            }
        }
    }

    pub fn phase(&self) -> Phase {
        if self.image.is_none() {
            Phase::Idle
        } else if self.is_analyzing {
            Phase::Analyzing
        } else if self.last_error.is_some() {
            Phase::Failed
        } else if self.result.is_some() {
            Phase::Complete
        } else {
            Phase::Ready
        }
    }

    pub fn image(&self) -> Option<&SelectedImage> {
        self.image.as_ref()
    }

    pub fn result(&self) -> Option<&AnalysisResult> {
        self.result.as_ref()
    }

    pub fn heatmap(&self) -> Option<&HeatmapReference> {
        self.heatmap.as_ref()
    }

    pub fn is_analyzing(&self) -> bool {
        self.is_analyzing
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn snapshot(&self) -> WorkflowSnapshot {
        WorkflowSnapshot {
            phase: self.phase(),
            file_name: self.image.as_ref().map(|i| i.file_name().to_string()),
            preview_url: self.preview.as_ref().map(|p| p.url().to_string()),
            result: self.result.clone(),
            heatmap_url: self.heatmap.as_ref().map(|h| h.url().to_string()),
            is_analyzing: self.is_analyzing,
            last_error: self.last_error.clone(),
            generation: self.generation,
            taken_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowSnapshot {
    pub phase: Phase,
    pub file_name: Option<String>,
    pub preview_url: Option<String>,
    pub result: Option<AnalysisResult>,
    pub heatmap_url: Option<String>,
    pub is_analyzing: bool,
    pub last_error: Option<String>,
    pub generation: u64,
    pub taken_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalyzeOutcome {
    // No request was sent.
    Skipped,
    Completed,
    // Artifact without a label/confidence pair.
    Incomplete,
    NoArtifact,
    Failed,
    Discarded,
}

pub struct Workflow {
    state: Mutex<WorkflowState>,
    backend: Arc<dyn InferenceBackend>,
    projector: HeatmapProjector,
    previews: PreviewStore,
    deadline: Duration,
}

impl Workflow {
    /// Uses [`DEFAULT_TIMEOUT`] as the deadline. Set [`Workflow::with_deadline`]
    /// when the backend may take longer, e.g. because it retries.
    pub fn new(backend: Arc<dyn InferenceBackend>, files_base: Url) -> Self {
        Self {
            state: Mutex::new(WorkflowState::default()),
            backend,
            projector: HeatmapProjector::new(files_base),
            previews: PreviewStore::new(),
            deadline: DEFAULT_TIMEOUT,
        }
    }

    /// Talks to the HTTP backend, with the deadline taken from its config.
    pub fn from_client(client: Arc<AnalysisClient>) -> Self {
        let files_base = client.config().files_base();
        let deadline = client.config().deadline();
        Self::new(client, files_base).with_deadline(deadline)
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn previews(&self) -> &PreviewStore {
        &self.previews
    }

    fn lock(&self) -> MutexGuard<'_, WorkflowState> {
        lock_state(&self.state)
    }

    pub fn select(&self, pick: FilePick) -> Transition {
        let Some(image) = pick.into_first() else {
            debug!("empty file pick ignored");
            return Transition::Ignored;
        };
        let preview = self.previews.create(&image);
        info!(file = image.file_name(), bytes = image.len(), "image selected");
        self.lock()
            .apply(WorkflowEvent::FileSelected { image, preview })
    }

    pub fn clear(&self) {
        self.lock().apply(WorkflowEvent::Cleared);
        info!("selection cleared");
    }

    /// Submits the current image. Calls without an image, or while another
    /// analysis is in flight, return [`AnalyzeOutcome::Skipped`] without
    /// touching the network.
    pub async fn analyze(&self) -> AnalyzeOutcome {
        let (generation, payload) = {
            let mut state = self.lock();
            if state.apply(WorkflowEvent::AnalysisStarted) == Transition::Ignored {
                debug!(analyzing = state.is_analyzing(), "analyze skipped");
                return AnalyzeOutcome::Skipped;
            }
            match encoder::encode(state.image()) {
                Ok(payload) => (state.generation(), payload),
                Err(e) => {
                    warn!(error = %e, "could not encode selection");
                    state.apply(WorkflowEvent::AnalysisSettled);
                    return AnalyzeOutcome::Skipped;
                }
            }
        };

        let guard = SettleGuard::arm(&self.state);
        info!(file = payload.file_name(), generation, "analysis started");

        let response = match tokio::time::timeout(self.deadline, self.backend.analyze(&payload)).await
        {
            Ok(response) => response,
            Err(_) => Err(ClientError::Timeout),
        };

        let (event, outcome) = match response {
            Ok(response) => self.interpret(generation, response),
            Err(ClientError::Decode(detail)) => {
                warn!(%detail, "malformed analysis response");
                (
                    WorkflowEvent::AnalysisSucceeded {
                        generation,
                        result: None,
                        heatmap: None,
                    },
                    AnalyzeOutcome::NoArtifact,
                )
            }
            Err(e) => {
                warn!(error = %e, "analysis failed");
                (
                    WorkflowEvent::AnalysisFailed {
                        generation,
                        message: BACKEND_UNREACHABLE.to_string(),
                    },
                    AnalyzeOutcome::Failed,
                )
            }
        };

        match guard.finish(event) {
            Transition::Stale => {
                info!(generation, "selection changed during analysis, response discarded");
                AnalyzeOutcome::Discarded
            }
            _ => outcome,
        }
    }

    fn interpret(&self, generation: u64, response: AnalyzeResponse) -> (WorkflowEvent, AnalyzeOutcome) {
        let Some(artifact) = response.artifact_name() else {
            return (
                WorkflowEvent::AnalysisSucceeded {
                    generation,
                    result: None,
                    heatmap: None,
                },
                AnalyzeOutcome::NoArtifact,
            );
        };

        let heatmap = self.projector.project(&artifact);
        let result = response.analysis_result(Some(artifact));
        let outcome = if result.is_some() {
            AnalyzeOutcome::Completed
        } else {
            AnalyzeOutcome::Incomplete
        };
        (
            WorkflowEvent::AnalysisSucceeded {
                generation,
                result,
                heatmap: Some(heatmap),
            },
            outcome,
        )
    }

    pub fn phase(&self) -> Phase {
        self.lock().phase()
    }

    pub fn is_analyzing(&self) -> bool {
        self.lock().is_analyzing()
    }

    pub fn result(&self) -> Option<AnalysisResult> {
        self.lock().result().cloned()
    }

    pub fn heatmap(&self) -> Option<HeatmapReference> {
        self.lock().heatmap().cloned()
    }

    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error().map(str::to_string)
    }

    pub fn snapshot(&self) -> WorkflowSnapshot {
        self.lock().snapshot()
    }
}

fn lock_state(state: &Mutex<WorkflowState>) -> MutexGuard<'_, WorkflowState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clears `is_analyzing` exactly once, either through [`SettleGuard::finish`]
/// or on drop if the analysis future is abandoned mid-flight.
struct SettleGuard<'a> {
    state: &'a Mutex<WorkflowState>,
    armed: bool,
}

impl<'a> SettleGuard<'a> {
    fn arm(state: &'a Mutex<WorkflowState>) -> Self {
        Self { state, armed: true }
    }

    fn finish(mut self, event: WorkflowEvent) -> Transition {
        let mut state = lock_state(self.state);
        let transition = state.apply(event);
        state.apply(WorkflowEvent::AnalysisSettled);
        self.armed = false;
        transition
    }
}

impl Drop for SettleGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            lock_state(self.state).apply(WorkflowEvent::AnalysisSettled);
            debug!("abandoned analysis settled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selected(store: &PreviewStore, name: &str) -> WorkflowEvent {
        let image = SelectedImage::new(name, vec![1u8, 2, 3]);
        let preview = store.create(&image);
        WorkflowEvent::FileSelected { image, preview }
    }

    fn diagnosis(label: &str, confidence: f64) -> Option<AnalysisResult> {
        Some(AnalysisResult {
            prediction_label: label.to_string(),
            confidence_percent: confidence,
            artifact_name: Some("a.png".to_string()),
        })
    }

    fn heatmap() -> Option<HeatmapReference> {
        let projector = HeatmapProjector::new(Url::parse("http://localhost:5001/files/").unwrap());
        Some(projector.project("a.png"))
    }

    #[test]
    fn starts_idle() {
        let state = WorkflowState::default();
        assert_eq!(state.phase(), Phase::Idle);
        assert!(!state.is_analyzing());
        assert_eq!(state.generation(), 0);
    }

    #[test]
    fn selection_moves_to_ready_and_drops_old_results() {
        let store = PreviewStore::new();
        let mut state = WorkflowState::default();
        state.apply(selected(&store, "a.png"));
        assert_eq!(state.phase(), Phase::Ready);

        state.apply(WorkflowEvent::AnalysisStarted);
        let generation = state.generation();
        state.apply(WorkflowEvent::AnalysisSucceeded {
            generation,
            result: diagnosis("glioma", 92.0),
            heatmap: heatmap(),
        });
        state.apply(WorkflowEvent::AnalysisSettled);
        assert_eq!(state.phase(), Phase::Complete);

        state.apply(selected(&store, "b.png"));
        assert_eq!(state.phase(), Phase::Ready);
        assert!(state.result().is_none());
        assert!(state.heatmap().is_none());
        assert_eq!(state.image().unwrap().file_name(), "b.png");
        assert_eq!(store.live_count(), 1);
    }

    #[test]
    fn analysis_start_requires_image_and_no_flight() {
        let store = PreviewStore::new();
        let mut state = WorkflowState::default();
        assert_eq!(state.apply(WorkflowEvent::AnalysisStarted), Transition::Ignored);

        state.apply(selected(&store, "a.png"));
        assert_eq!(state.apply(WorkflowEvent::AnalysisStarted), Transition::Applied);
        assert_eq!(state.phase(), Phase::Analyzing);
        assert_eq!(state.apply(WorkflowEvent::AnalysisStarted), Transition::Ignored);
    }

    #[test]
    fn failure_sets_error_and_selection_clears_it() {
        let store = PreviewStore::new();
        let mut state = WorkflowState::default();
        state.apply(selected(&store, "a.png"));
        state.apply(WorkflowEvent::AnalysisStarted);
        let generation = state.generation();
        state.apply(WorkflowEvent::AnalysisFailed {
            generation,
            message: BACKEND_UNREACHABLE.to_string(),
        });
        state.apply(WorkflowEvent::AnalysisSettled);

        assert_eq!(state.phase(), Phase::Failed);
        assert_eq!(state.last_error(), Some(BACKEND_UNREACHABLE));
        assert!(state.result().is_none());

        state.apply(selected(&store, "b.png"));
        assert_eq!(state.phase(), Phase::Ready);
        assert!(state.last_error().is_none());
    }

    #[test]
    fn retry_after_failure_clears_error() {
        let store = PreviewStore::new();
        let mut state = WorkflowState::default();
        state.apply(selected(&store, "a.png"));
        state.apply(WorkflowEvent::AnalysisStarted);
        let generation = state.generation();
        state.apply(WorkflowEvent::AnalysisFailed {
            generation,
            message: BACKEND_UNREACHABLE.to_string(),
        });
        state.apply(WorkflowEvent::AnalysisSettled);

        state.apply(WorkflowEvent::AnalysisStarted);
        assert!(state.last_error().is_none());
        assert_eq!(state.phase(), Phase::Analyzing);
    }

    #[test]
    fn clear_keeps_error_but_drops_everything_else() {
        let store = PreviewStore::new();
        let mut state = WorkflowState::default();
        state.apply(selected(&store, "a.png"));
        state.apply(WorkflowEvent::AnalysisStarted);
        let generation = state.generation();
        state.apply(WorkflowEvent::AnalysisFailed {
            generation,
            message: BACKEND_UNREACHABLE.to_string(),
        });
        state.apply(WorkflowEvent::AnalysisSettled);

        state.apply(WorkflowEvent::Cleared);
        assert_eq!(state.phase(), Phase::Idle);
        assert!(state.image().is_none());
        assert_eq!(state.last_error(), Some(BACKEND_UNREACHABLE));
        assert_eq!(store.live_count(), 0);
    }

    #[test]
    fn stale_responses_are_rejected() {
        let store = PreviewStore::new();
        let mut state = WorkflowState::default();
        state.apply(selected(&store, "a.png"));
        state.apply(WorkflowEvent::AnalysisStarted);
        let in_flight = state.generation();

        state.apply(selected(&store, "b.png"));
        let transition = state.apply(WorkflowEvent::AnalysisSucceeded {
            generation: in_flight,
            result: diagnosis("glioma", 92.0),
            heatmap: heatmap(),
        });
        assert_eq!(transition, Transition::Stale);
        assert!(state.result().is_none());

        let transition = state.apply(WorkflowEvent::AnalysisFailed {
            generation: in_flight,
            message: BACKEND_UNREACHABLE.to_string(),
        });
        assert_eq!(transition, Transition::Stale);
        assert!(state.last_error().is_none());
    }

    #[test]
    fn response_without_artifact_leaves_state_alone() {
        let store = PreviewStore::new();
        let mut state = WorkflowState::default();
        state.apply(selected(&store, "a.png"));
        state.apply(WorkflowEvent::AnalysisStarted);
        let generation = state.generation();
        state.apply(WorkflowEvent::AnalysisSucceeded {
            generation,
            result: None,
            heatmap: None,
        });
        state.apply(WorkflowEvent::AnalysisSettled);

        assert_eq!(state.phase(), Phase::Ready);
        assert!(state.heatmap().is_none());
        assert!(state.last_error().is_none());
    }

    #[test]
    fn snapshot_mirrors_state() {
        let store = PreviewStore::new();
        let mut state = WorkflowState::default();
        state.apply(selected(&store, "a.png"));

        let snapshot = state.snapshot();
        assert_eq!(snapshot.phase, Phase::Ready);
        assert_eq!(snapshot.file_name.as_deref(), Some("a.png"));
        assert!(snapshot.preview_url.unwrap().starts_with("blob:"));
        assert_eq!(snapshot.generation, 1);

        let json = serde_json::to_value(state.snapshot()).unwrap();
        assert_eq!(json["phase"], "Ready");
        assert_eq!(json["is_analyzing"], false);
    }
}
