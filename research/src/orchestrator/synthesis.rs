//! Synthesis phase

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::engine::Orchestrator;
use super::prompts;
use crate::config::Role;
use crate::error::{ResearchError, Result};
use crate::events::EventPayload;
use crate::gateway::StreamMessage;
use crate::model::{truncate_chars, Phase, Session};

/// Characters of the report carried by `report_ready`
const REPORT_PREVIEW_CHARS: usize = 500;

impl Orchestrator {
    /// Turn the collected results into the final report and complete the session
    pub(super) async fn synthesize(&self, mut session: Session, cancel: &CancellationToken) -> Result<Session> {
        let executor = match self.executor(Role::Synthesizer) {
            Ok(executor) => executor,
            Err(err) => return self.fail(session, err).await,
        };

        let total_results = session.results.len();
        tracing::info!(
            session_id = %session.id,
            results = total_results,
            provider = %executor.provider(),
            model = %executor.model(),
            "Starting synthesis"
        );
        self.emit(&session.id, EventPayload::SynthesisStarted { total_results });

        let system_prompt = prompts::synthesizer_system_prompt(&session.language);
        let prompt = prompts::synthesizer_user_prompt(&session.query, &session.results);

        let percent = Mutex::new(0.0_f64);
        let session_id = session.id.clone();
        let on_message = |message: &StreamMessage| {
            let progress_percent = {
                let mut percent = percent.lock();
                *percent = (*percent + 2.0).min(95.0);
                *percent
            };
            let current_action = message
                .describe()
                .unwrap_or_else(|| "Writing report".to_string());
            self.emit(
                &session_id,
                EventPayload::SynthesisProgress {
                    progress_percent,
                    current_action,
                },
            );
        };

        let execution = executor
            .execute_cancellable(&prompt, Some(&system_prompt), Some(&on_message), cancel)
            .await;

        if execution.is_cancelled() {
            return self.finish_cancelled(session, "cancelled during synthesis").await;
        }
        if !execution.success {
            let reason = execution.error.unwrap_or_else(|| "unknown error".to_string());
            return self.fail(session, ResearchError::SynthesisFailure(reason)).await;
        }
        if execution.content.trim().is_empty() {
            let reason = "synthesizer returned an empty report".to_string();
            return self.fail(session, ResearchError::SynthesisFailure(reason)).await;
        }

        let report = execution.content;
        self.emit(
            &session.id,
            EventPayload::SynthesisProgress {
                progress_percent: 100.0,
                current_action: "Report complete".to_string(),
            },
        );

        let report_preview = truncate_chars(&report, REPORT_PREVIEW_CHARS);
        session.final_report = Some(report);
        self.transition(&mut session, Phase::Completed).await?;
        self.emit(&session.id, EventPayload::ReportReady { report_preview });
        self.bus.close_session(&session.id);

        tracing::info!(
            session_id = %session.id,
            report_chars = session.final_report.as_deref().map(|r| r.chars().count()).unwrap_or(0),
            "Synthesis complete"
        );
        Ok(session)
    }
}
