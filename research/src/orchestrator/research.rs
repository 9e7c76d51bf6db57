//! Research phase
//!
//! Every schedulable plan item becomes one unit of work. Units are admitted
//! in priority order with at most `max_parallel_agents` in flight; a failing
//! unit only fails its own item. A background timer checkpoints the session
//! while units run.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::engine::{save_checkpoint, Orchestrator};
use super::{parse, prompts};
use crate::config::Role;
use crate::error::{ResearchError, Result};
use crate::events::{EventBus, EventPayload};
use crate::gateway::{AgentExecutor, StreamMessage};
use crate::model::{AgentProgress, AgentStatus, Plan, PlanItem, PlanItemStatus, Session};
use crate::store::SessionStore;

/// Floor for the checkpoint period
const MIN_CHECKPOINT_INTERVAL: Duration = Duration::from_millis(10);

/// How a single unit ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnitOutcome {
    Completed,
    Failed,
    Cancelled,
}

impl Orchestrator {
    /// Run every schedulable item; returns the session still in `researching`
    /// unless the phase itself failed
    pub(super) async fn research(&self, session: Session, cancel: &CancellationToken) -> Result<Session> {
        let executor = match self.executor(Role::Researcher) {
            Ok(executor) => executor,
            Err(err) => return self.fail(session, err).await,
        };

        let items = session
            .plan
            .as_ref()
            .map(Plan::schedulable_items)
            .unwrap_or_default();
        let limit = self.config.max_parallel_agents.max(1);
        let session_id = session.id.clone();

        tracing::info!(
            session_id = %session_id,
            units = items.len(),
            max_parallel = limit,
            provider = %executor.provider(),
            model = %executor.model(),
            "Starting research"
        );

        let shared = Arc::new(Mutex::new(session));
        let stop = cancel.child_token();
        let timer = tokio::spawn(checkpoint_loop(
            self.store.clone(),
            self.bus.clone(),
            shared.clone(),
            self.config.checkpoint_interval,
            stop.clone(),
        ));
        let stop_timer = stop.drop_guard();

        let outcomes: Vec<UnitOutcome> = {
            let shared = shared.as_ref();
            let executor = &executor;
            stream::iter(items)
                .map(move |item| self.run_unit(shared, executor, item, cancel))
                .buffer_unordered(limit)
                .collect()
                .await
        };

        drop(stop_timer);
        if let Err(e) = timer.await {
            tracing::warn!(session_id = %session_id, "Checkpoint timer ended abnormally: {}", e);
        }

        let count = |wanted: UnitOutcome| outcomes.iter().filter(|o| **o == wanted).count();
        tracing::info!(
            session_id = %session_id,
            completed = count(UnitOutcome::Completed),
            failed = count(UnitOutcome::Failed),
            cancelled = count(UnitOutcome::Cancelled),
            "Research finished"
        );

        let session = shared.lock().clone();
        self.store.update(&session).await?;
        Ok(session)
    }

    /// Execute one plan item and record its outcome on the session
    async fn run_unit(
        &self,
        shared: &Mutex<Session>,
        executor: &AgentExecutor,
        item: PlanItem,
        cancel: &CancellationToken,
    ) -> UnitOutcome {
        if cancel.is_cancelled() {
            return UnitOutcome::Cancelled;
        }

        let progress = AgentProgress::running(&item.id, &item.topic);
        let agent_id = progress.agent_id.clone();
        let (session_id, language) = {
            let mut session = shared.lock();
            session.set_item_status(&item.id, PlanItemStatus::InProgress);
            session.update_progress(progress.clone());
            (session.id.clone(), session.language.clone())
        };

        tracing::info!(session_id = %session_id, item_id = %item.id, topic = %item.topic, "Research unit started");
        self.emit(
            &session_id,
            EventPayload::AgentStarted {
                agent_id: agent_id.clone(),
                plan_item_id: item.id.clone(),
                topic: item.topic.clone(),
            },
        );
        self.emit(&session_id, EventPayload::AgentProgress { progress });

        let system_prompt = prompts::researcher_system_prompt(&language);
        let prompt = prompts::researcher_user_prompt(&item);
        let on_message = |message: &StreamMessage| {
            let Some(action) = message.describe() else {
                return;
            };
            let progress = {
                let mut session = shared.lock();
                let Some(progress) = session.agent_progress.get_mut(&item.id) else {
                    return;
                };
                progress.advance(&action, message.tool_name());
                progress.clone()
            };
            self.emit(&session_id, EventPayload::AgentProgress { progress });
        };

        let execution = executor
            .execute_cancellable(&prompt, Some(&system_prompt), Some(&on_message), cancel)
            .await;

        if execution.is_cancelled() {
            let progress = {
                let mut session = shared.lock();
                session.set_item_status(&item.id, PlanItemStatus::Pending);
                finish_progress(&mut session, &item.id, AgentStatus::Cancelled, None)
            };
            if let Some(progress) = progress {
                self.emit(&session_id, EventPayload::AgentProgress { progress });
            }
            tracing::info!(session_id = %session_id, item_id = %item.id, "Research unit cancelled");
            return UnitOutcome::Cancelled;
        }

        if !execution.success {
            let error = if execution.is_timeout() {
                ResearchError::UnitTimeout {
                    item_id: item.id.clone(),
                }
            } else {
                ResearchError::UnitExecutionError {
                    item_id: item.id.clone(),
                    message: execution
                        .error
                        .clone()
                        .unwrap_or_else(|| "unknown error".to_string()),
                }
            };

            {
                let mut session = shared.lock();
                session.set_item_status(&item.id, PlanItemStatus::Failed);
                finish_progress(&mut session, &item.id, AgentStatus::Failed, Some(error.to_string()));
            }
            tracing::warn!(
                session_id = %session_id,
                item_id = %item.id,
                code = error.code(),
                "{}",
                error
            );
            self.emit(
                &session_id,
                EventPayload::AgentFailed {
                    agent_id,
                    plan_item_id: item.id.clone(),
                    code: error.code().to_string(),
                    error: error.to_string(),
                },
            );
            return UnitOutcome::Failed;
        }

        let result = parse::researcher_result(&item, &execution);
        {
            let mut session = shared.lock();
            session.add_result(result.clone());
            finish_progress(&mut session, &item.id, AgentStatus::Completed, None);
        }
        tracing::info!(
            session_id = %session_id,
            item_id = %item.id,
            confidence = result.confidence,
            sources = result.sources.len(),
            duration_ms = result.execution_time.as_millis() as u64,
            "Research unit completed"
        );
        self.emit(&session_id, EventPayload::AgentCompleted { result });
        UnitOutcome::Completed
    }
}

fn finish_progress(
    session: &mut Session,
    item_id: &str,
    status: AgentStatus,
    error: Option<String>,
) -> Option<AgentProgress> {
    let progress = session.agent_progress.get_mut(item_id)?;
    progress.finish(status, error);
    let progress = progress.clone();
    session.touch();
    Some(progress)
}

/// Checkpoint the shared session every `period` until `stop` fires
async fn checkpoint_loop(
    store: Arc<dyn SessionStore>,
    bus: EventBus,
    session: Arc<Mutex<Session>>,
    period: Duration,
    stop: CancellationToken,
) {
    let mut interval = tokio::time::interval(period.max(MIN_CHECKPOINT_INTERVAL));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    interval.tick().await;

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = interval.tick() => {
                let snapshot = session.lock().clone();
                save_checkpoint(store.as_ref(), &bus, &snapshot).await;
            }
        }
    }
}
