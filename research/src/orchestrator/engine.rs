//! Session lifecycle operations
//!
//! Public operations resolve and load the session, claim it for a run, then
//! hand it to the phase runners in `research.rs` and `synthesis.rs`.
//! Phase-scoped failures end the session in `failed` and are returned as a
//! failed session; only operation errors (unknown id, wrong phase, storage)
//! come back as `Err`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::language::detect_language;
use super::parse::parse_plan;
use super::prompts;
use crate::config::{EmptyResultsPolicy, Role, Settings};
use crate::error::{ResearchError, Result};
use crate::events::{Event, EventBus, EventPayload};
use crate::gateway::{AgentExecutor, ProviderRegistry};
use crate::model::{Phase, PlanItem, PlanItemStatus, Session};
use crate::store::SessionStore;

/// Shortest prefix accepted in place of a full session id
const MIN_PREFIX_LEN: usize = 8;

// ============================================================================
// Configuration
// ============================================================================

/// Knobs the orchestrator reads from [`Settings`]
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Research units allowed in flight at once
    pub max_parallel_agents: usize,

    /// Period of the background checkpoint timer during research
    pub checkpoint_interval: Duration,

    /// What to do when research produced no results
    pub on_empty_results: EmptyResultsPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl OrchestratorConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_parallel_agents: settings.max_parallel_agents,
            checkpoint_interval: settings.checkpoint_interval(),
            on_empty_results: settings.synthesis.on_empty_results,
        }
    }

    pub fn with_max_parallel_agents(mut self, max: usize) -> Self {
        self.max_parallel_agents = max;
        self
    }

    pub fn with_checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    pub fn with_empty_results(mut self, policy: EmptyResultsPolicy) -> Self {
        self.on_empty_results = policy;
        self
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Drives research sessions through their phases
pub struct Orchestrator {
    pub(super) config: OrchestratorConfig,
    pub(super) registry: Arc<ProviderRegistry>,
    pub(super) store: Arc<dyn SessionStore>,
    pub(super) bus: EventBus,
    /// Cancellation tokens of sessions with an active run
    runs: Mutex<HashMap<String, CancellationToken>>,
}

/// A claimed session run; releases the claim on drop
pub(super) struct ActiveRun<'a> {
    runs: &'a Mutex<HashMap<String, CancellationToken>>,
    session_id: String,
    pub(super) token: CancellationToken,
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.runs.lock().remove(&self.session_id);
    }
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        registry: Arc<ProviderRegistry>,
        store: Arc<dyn SessionStore>,
        bus: EventBus,
    ) -> Self {
        Self {
            config,
            registry,
            store,
            bus,
            runs: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Whether a run currently owns the session
    pub fn is_running(&self, session_id: &str) -> bool {
        self.runs.lock().contains_key(session_id)
    }

    /// Ids of sessions with an active run
    pub fn active_sessions(&self) -> Vec<String> {
        self.runs.lock().keys().cloned().collect()
    }

    // ------------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------------

    /// Create a session and draft its plan.
    ///
    /// The language is detected from the query unless a hint is given.
    pub async fn start(&self, query: &str, language_hint: Option<&str>) -> Result<Session> {
        let language = language_hint
            .map(str::trim)
            .filter(|hint| !hint.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| detect_language(query).to_string());

        let session = Session::new(query, language);
        self.store.create(&session).await?;
        tracing::info!(
            session_id = %session.id,
            language = %session.language,
            "Started research session"
        );

        self.emit(
            &session.id,
            EventPayload::PhaseChange {
                old_phase: None,
                new_phase: Phase::Planning,
            },
        );
        self.checkpoint(&session).await;

        let run = self.begin_run(&session.id, "start")?;
        let prompt = prompts::planner_user_prompt(query);
        let session = self.plan(session, &prompt, &run.token).await?;
        self.settle(session, &run).await
    }

    /// Apply review edits, then research and synthesize
    pub async fn confirm(
        &self,
        session_id: &str,
        skip_item_ids: &[String],
        modifications: &[PlanItem],
    ) -> Result<Session> {
        let id = self.resolve_id(session_id).await?;
        let run = self.begin_run(&id, "confirm")?;
        let mut session = self.load(&id).await?;
        if session.phase != Phase::PlanReview {
            return Err(ResearchError::invalid_phase("confirm", session.phase));
        }

        let plan = session
            .plan
            .as_mut()
            .ok_or_else(|| ResearchError::invalid_phase("confirm", "plan_review without a plan"))?;
        let unknown = plan.apply_review(modifications, skip_item_ids);
        if !unknown.is_empty() {
            tracing::warn!(session_id = %id, ?unknown, "Ignoring skips for unknown plan items");
        }
        let plan = plan.clone();
        session.touch();

        tracing::info!(
            session_id = %id,
            items = plan.items.len(),
            skipped = plan.items.iter().filter(|i| i.status == PlanItemStatus::Skipped).count(),
            "Plan confirmed"
        );
        self.emit(&id, EventPayload::PlanUpdated { plan });

        self.transition(&mut session, Phase::Researching).await?;
        let session = self.research_then_synthesize(session, &run.token).await?;
        self.settle(session, &run).await
    }

    /// Send the plan back to the planner with the requester's feedback
    pub async fn revise(&self, session_id: &str, feedback: &str) -> Result<Session> {
        let id = self.resolve_id(session_id).await?;
        let run = self.begin_run(&id, "revise")?;
        let mut session = self.load(&id).await?;
        if session.phase != Phase::PlanReview {
            return Err(ResearchError::invalid_phase("revise", session.phase));
        }

        tracing::info!(session_id = %id, "Revising plan");
        session.revision_feedback = Some(feedback.to_string());
        self.transition(&mut session, Phase::Planning).await?;
        let prompt = prompts::revision_user_prompt(&session.query, session.plan.as_ref(), feedback);
        let session = self.plan(session, &prompt, &run.token).await?;
        self.settle(session, &run).await
    }

    /// Research a session already in `researching`, then synthesize
    pub async fn run_research(&self, session: Session) -> Result<Session> {
        if session.phase != Phase::Researching {
            return Err(ResearchError::invalid_phase("run_research", session.phase));
        }
        let run = self.begin_run(&session.id, "run_research")?;
        let session = self.research_then_synthesize(session, &run.token).await?;
        self.settle(session, &run).await
    }

    /// Synthesize a session already in `synthesizing`
    pub async fn run_synthesis(&self, session: Session) -> Result<Session> {
        if session.phase != Phase::Synthesizing {
            return Err(ResearchError::invalid_phase("run_synthesis", session.phase));
        }
        let run = self.begin_run(&session.id, "run_synthesis")?;
        let session = self.synthesize(session, &run.token).await?;
        self.settle(session, &run).await
    }

    /// Cancel a session.
    ///
    /// An active run is signalled and finishes the transition itself; an idle
    /// session is claimed like a run and moved to `cancelled` directly, so no
    /// other operation can start on it in between.
    pub async fn cancel(&self, session_id: &str) -> Result<()> {
        let id = self.resolve_id(session_id).await?;

        let _run = {
            let mut runs = self.runs.lock();
            if let Some(token) = runs.get(&id) {
                tracing::info!(session_id = %id, "Cancelling active run");
                token.cancel();
                return Ok(());
            }
            self.claim(&mut runs, &id)
        };

        let session = self.load(&id).await?;
        if session.phase.is_terminal() {
            return Err(ResearchError::invalid_phase("cancel", session.phase));
        }
        self.finish_cancelled(session, "cancelled by request").await?;
        Ok(())
    }

    /// Continue a session from its latest checkpoint
    pub async fn resume(&self, session_id: &str) -> Result<Session> {
        let id = self.resolve_id(session_id).await?;
        let run = self.begin_run(&id, "resume")?;
        let stored = self.load(&id).await?;
        if stored.phase.is_terminal() || stored.final_report.is_some() {
            tracing::info!(session_id = %id, phase = %stored.phase, "Session already finished");
            return Ok(stored);
        }

        let checkpoint = self
            .store
            .load_checkpoint(&id)
            .await?
            .ok_or_else(|| ResearchError::NoCheckpointFound(id.clone()))?;

        let mut session = if stored.phase.order() > checkpoint.phase.order() {
            tracing::warn!(
                session_id = %id,
                checkpoint_phase = %checkpoint.phase,
                stored_phase = %stored.phase,
                "Checkpoint is behind the stored session, resuming from the stored session"
            );
            Session::from_checkpoint(&stored.to_checkpoint())
        } else {
            Session::from_checkpoint(&checkpoint)
        };
        session.created_at = stored.created_at;
        self.store.update(&session).await?;

        let pending = session.plan.as_ref().map(|p| p.pending_ids().len()).unwrap_or(0);
        tracing::info!(
            session_id = %id,
            phase = %session.phase,
            results = session.results.len(),
            pending,
            "Resuming session"
        );
        self.emit(
            &id,
            EventPayload::PhaseChange {
                old_phase: None,
                new_phase: session.phase,
            },
        );

        let session = match session.phase {
            Phase::Planning => {
                let prompt = match session.revision_feedback.as_deref() {
                    Some(feedback) => prompts::revision_user_prompt(&session.query, session.plan.as_ref(), feedback),
                    None => prompts::planner_user_prompt(&session.query),
                };
                self.plan(session, &prompt, &run.token).await?
            }
            Phase::Researching => self.research_then_synthesize(session, &run.token).await?,
            Phase::Synthesizing => self.synthesize(session, &run.token).await?,
            Phase::PlanReview | Phase::Completed | Phase::Failed | Phase::Cancelled => session,
        };
        self.settle(session, &run).await
    }

    /// A stored session by id or unique prefix
    pub async fn get(&self, session_id: &str) -> Result<Session> {
        let id = self.resolve_id(session_id).await?;
        self.load(&id).await
    }

    /// Most recently updated sessions
    pub async fn list(&self, limit: usize) -> Result<Vec<Session>> {
        Ok(self.store.list(limit).await?)
    }

    // ------------------------------------------------------------------------
    // Phase runners
    // ------------------------------------------------------------------------

    /// Ask the planner for a plan and move to `plan_review`
    async fn plan(&self, mut session: Session, user_prompt: &str, cancel: &CancellationToken) -> Result<Session> {
        let executor = match self.executor(Role::Planner) {
            Ok(executor) => executor,
            Err(err) => return self.fail(session, err).await,
        };

        let system_prompt = prompts::planner_system_prompt(&session.language);
        let execution = executor
            .execute_cancellable(user_prompt, Some(&system_prompt), None, cancel)
            .await;

        if execution.is_cancelled() {
            return self.finish_cancelled(session, "cancelled during planning").await;
        }
        if !execution.success {
            let reason = execution.error.unwrap_or_else(|| "unknown error".to_string());
            return self.fail(session, ResearchError::PlanningFailure(reason)).await;
        }

        let plan = match parse_plan(&execution.content) {
            Ok(plan) => plan,
            Err(reason) => return self.fail(session, ResearchError::PlanningFailure(reason)).await,
        };

        tracing::info!(
            session_id = %session.id,
            items = plan.items.len(),
            estimated_minutes = plan.estimated_minutes,
            "Plan drafted"
        );
        session.plan = Some(plan.clone());
        session.revision_feedback = None;
        self.emit(&session.id, EventPayload::PlanDraft { plan });
        self.transition(&mut session, Phase::PlanReview).await?;
        Ok(session)
    }

    async fn research_then_synthesize(&self, session: Session, cancel: &CancellationToken) -> Result<Session> {
        let mut session = self.research(session, cancel).await?;
        if session.phase.is_terminal() {
            return Ok(session);
        }
        if cancel.is_cancelled() {
            return self.finish_cancelled(session, "cancelled during research").await;
        }

        if session.results.is_empty() {
            match self.config.on_empty_results {
                EmptyResultsPolicy::Fail => return self.fail(session, ResearchError::NoResults).await,
                EmptyResultsPolicy::Synthesize => {
                    tracing::warn!(session_id = %session.id, "No research results, synthesizing anyway");
                }
            }
        }

        self.transition(&mut session, Phase::Synthesizing).await?;
        self.synthesize(session, cancel).await
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    pub(super) fn emit(&self, session_id: &str, payload: EventPayload) {
        self.bus.publish(Event::new(session_id, payload));
    }

    pub(super) fn executor(&self, role: Role) -> Result<AgentExecutor> {
        self.registry
            .executor(role)
            .map_err(|e| ResearchError::ProviderUnavailable(e.to_string()))
    }

    /// Move along the phase table, persist, publish and checkpoint
    pub(super) async fn transition(&self, session: &mut Session, next: Phase) -> Result<()> {
        let old = session.phase;
        if !old.can_transition_to(next) {
            return Err(ResearchError::invalid_phase(&format!("transition to {}", next), old));
        }

        session.set_phase(next);
        self.store.update(session).await?;
        tracing::info!(session_id = %session.id, from = %old, to = %next, "Phase changed");
        self.emit(
            &session.id,
            EventPayload::PhaseChange {
                old_phase: Some(old),
                new_phase: next,
            },
        );

        if !next.is_terminal() {
            self.checkpoint(session).await;
        }
        Ok(())
    }

    pub(super) async fn checkpoint(&self, session: &Session) {
        save_checkpoint(self.store.as_ref(), &self.bus, session).await;
    }

    /// End the session in `failed` with a phase-scoped error
    pub(super) async fn fail(&self, mut session: Session, error: ResearchError) -> Result<Session> {
        let old = session.phase;
        tracing::error!(
            session_id = %session.id,
            phase = %old,
            code = error.code(),
            "Session failed: {}",
            error
        );

        session.error = Some(error.to_string());
        session.set_phase(Phase::Failed);
        self.store.update(&session).await?;

        self.emit(
            &session.id,
            EventPayload::Error {
                error_code: error.code().to_string(),
                error_message: error.to_string(),
                recoverable: false,
            },
        );
        self.emit(
            &session.id,
            EventPayload::PhaseChange {
                old_phase: Some(old),
                new_phase: Phase::Failed,
            },
        );
        self.bus.close_session(&session.id);
        Ok(session)
    }

    /// End the session in `cancelled`, keeping completed results
    pub(super) async fn finish_cancelled(&self, mut session: Session, reason: &str) -> Result<Session> {
        let old = session.phase;
        if let Some(plan) = session.plan.as_mut() {
            for item in plan.items.iter_mut() {
                if item.status == PlanItemStatus::InProgress {
                    item.status = PlanItemStatus::Pending;
                }
            }
        }
        session.set_phase(Phase::Cancelled);
        self.store.update(&session).await?;

        tracing::info!(
            session_id = %session.id,
            phase = %old,
            results = session.results.len(),
            "Session cancelled"
        );
        self.emit(
            &session.id,
            EventPayload::SessionCancelled {
                reason: reason.to_string(),
            },
        );
        self.emit(
            &session.id,
            EventPayload::PhaseChange {
                old_phase: Some(old),
                new_phase: Phase::Cancelled,
            },
        );
        self.bus.close_session(&session.id);
        Ok(session)
    }

    /// Honour a cancel request that arrived after the last cancellable call
    async fn settle(&self, session: Session, run: &ActiveRun<'_>) -> Result<Session> {
        if run.token.is_cancelled() && !session.phase.is_terminal() {
            return self.finish_cancelled(session, "cancelled by request").await;
        }
        Ok(session)
    }

    /// Claim the session before reading it; phase checks happen under the claim
    fn begin_run(&self, session_id: &str, operation: &str) -> Result<ActiveRun<'_>> {
        let mut runs = self.runs.lock();
        if runs.contains_key(session_id) {
            return Err(ResearchError::invalid_phase(operation, "a run already active"));
        }
        Ok(self.claim(&mut runs, session_id))
    }

    fn claim(&self, runs: &mut HashMap<String, CancellationToken>, session_id: &str) -> ActiveRun<'_> {
        let token = CancellationToken::new();
        runs.insert(session_id.to_string(), token.clone());
        ActiveRun {
            runs: &self.runs,
            session_id: session_id.to_string(),
            token,
        }
    }

    /// Full id for an id or a unique prefix of one
    async fn resolve_id(&self, session_id: &str) -> Result<String> {
        if self.store.status(session_id).await?.is_some() {
            return Ok(session_id.to_string());
        }
        if session_id.len() >= MIN_PREFIX_LEN {
            if let Some(id) = self.store.find_by_prefix(session_id).await? {
                return Ok(id);
            }
        }
        Err(ResearchError::SessionNotFound(session_id.to_string()))
    }

    async fn load(&self, id: &str) -> Result<Session> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| ResearchError::SessionNotFound(id.to_string()))
    }
}

/// Save a checkpoint and announce it; failures are logged and retried later
pub(super) async fn save_checkpoint(store: &dyn SessionStore, bus: &EventBus, session: &Session) {
    match store.save_checkpoint(session).await {
        Ok(checkpoint) => {
            tracing::debug!(
                session_id = %session.id,
                phase = %checkpoint.phase,
                "Checkpoint saved"
            );
            bus.publish(Event::new(
                &session.id,
                EventPayload::CheckpointSaved {
                    phase: checkpoint.phase,
                    completed_items: checkpoint.completed_item_ids.len(),
                    pending_items: checkpoint.pending_item_ids.len(),
                },
            ));
        }
        Err(e) => {
            let error = ResearchError::CheckpointWriteFailure(e.to_string());
            tracing::warn!(session_id = %session.id, code = error.code(), "{}", error);
        }
    }
}
