//! Full runs from query to report

use deep_research::config::EmptyResultsPolicy;
use deep_research::events::Filter;
use deep_research::model::{Phase, PlanItem, PlanItemStatus};
use deep_research::store::SessionStore;
use deep_research::{EventKind, EventPayload, ResearchError};

use super::support::{
    config, drain, instant_researcher, of_kind, plan_json, topic_of, Harness, Reply, ScriptedAgent,
    REPORT,
};

#[tokio::test]
async fn test_start_drafts_plan_for_review() {
    let harness = Harness::standard(3);
    let mut events = harness.events();

    let session = harness
        .orchestrator
        .start("How do async runtimes schedule tasks?", None)
        .await
        .unwrap();

    assert_eq!(session.phase, Phase::PlanReview);
    assert_eq!(session.language, "en");
    let plan = session.plan.as_ref().unwrap();
    assert_eq!(plan.items.len(), 3);
    assert!(plan.items.iter().all(|i| i.status == PlanItemStatus::Pending));
    assert_eq!(harness.planner.call_count(), 1);
    assert_eq!(harness.researcher.call_count(), 0);

    let events = drain(&mut events);
    assert!(events.iter().all(|e| e.session_id == session.id));
    assert_eq!(of_kind(&events, EventKind::PlanDraft).len(), 1);
    let phases: Vec<_> = of_kind(&events, EventKind::PhaseChange)
        .into_iter()
        .map(|e| match &e.payload {
            EventPayload::PhaseChange { old_phase, new_phase } => (*old_phase, *new_phase),
            other => panic!("unexpected payload {:?}", other),
        })
        .collect();
    assert_eq!(
        phases,
        vec![(None, Phase::Planning), (Some(Phase::Planning), Phase::PlanReview)]
    );

    let stored = harness.store.get(&session.id).await.unwrap().unwrap();
    assert_eq!(stored.phase, Phase::PlanReview);
    assert_eq!(stored.plan, session.plan);
}

#[tokio::test]
async fn test_language_detected_from_query() {
    let harness = Harness::standard(1);
    let session = harness
        .orchestrator
        .start("异步运行时如何调度任务？", None)
        .await
        .unwrap();
    assert_eq!(session.language, "zh");

    let system = harness.planner.calls()[0].system_prompt.clone().unwrap();
    assert!(system.contains("Chinese"));
}

#[tokio::test]
async fn test_confirm_with_skip_runs_remaining_items() {
    let harness = Harness::standard(3);
    let session = harness.orchestrator.start("Compare allocators", None).await.unwrap();
    let mut events = harness.events();

    let session = harness
        .orchestrator
        .confirm(&session.id, &["item-3".to_string()], &[])
        .await
        .unwrap();

    assert_eq!(session.phase, Phase::Completed);
    assert_eq!(session.final_report.as_deref(), Some(REPORT));
    assert!(session.completed_at.is_some());
    assert_eq!(session.results.len(), 2);

    let mut topics: Vec<_> = harness.researcher.calls().iter().map(topic_of).collect();
    topics.sort();
    assert_eq!(topics, vec!["Topic 1", "Topic 2"]);

    let plan = session.plan.as_ref().unwrap();
    assert_eq!(plan.item("item-1").unwrap().status, PlanItemStatus::Completed);
    assert_eq!(plan.item("item-2").unwrap().status, PlanItemStatus::Completed);
    assert_eq!(plan.item("item-3").unwrap().status, PlanItemStatus::Skipped);

    let events = drain(&mut events);
    assert_eq!(of_kind(&events, EventKind::PlanUpdated).len(), 1);
    assert_eq!(of_kind(&events, EventKind::AgentStarted).len(), 2);
    assert_eq!(of_kind(&events, EventKind::AgentCompleted).len(), 2);
    assert!(of_kind(&events, EventKind::AgentFailed).is_empty());
    match &of_kind(&events, EventKind::SynthesisStarted)[0].payload {
        EventPayload::SynthesisStarted { total_results } => assert_eq!(*total_results, 2),
        other => panic!("unexpected payload {:?}", other),
    }
    match &of_kind(&events, EventKind::ReportReady)[0].payload {
        EventPayload::ReportReady { report_preview } => assert_eq!(report_preview, REPORT),
        other => panic!("unexpected payload {:?}", other),
    }

    let stored = harness.store.get(&session.id).await.unwrap().unwrap();
    assert_eq!(stored.phase, Phase::Completed);
    assert_eq!(stored.results.len(), 2);
    assert_eq!(stored.final_report.as_deref(), Some(REPORT));
}

#[tokio::test]
async fn test_confirm_applies_modifications() {
    let harness = Harness::standard(2);
    let session = harness.orchestrator.start("Compare allocators", None).await.unwrap();

    let replaced = PlanItem::new("item-2", "Arena allocators").with_description("Bump and region allocation");
    let added = PlanItem::new("item-extra", "Allocator benchmarks");
    let session = harness
        .orchestrator
        .confirm(&session.id, &[], &[replaced, added])
        .await
        .unwrap();

    assert_eq!(session.phase, Phase::Completed);
    assert_eq!(session.results.len(), 3);
    let mut topics: Vec<_> = harness.researcher.calls().iter().map(topic_of).collect();
    topics.sort();
    assert_eq!(topics, vec!["Allocator benchmarks", "Arena allocators", "Topic 1"]);
}

#[tokio::test]
async fn test_synthesis_sees_every_result() {
    let harness = Harness::standard(3);
    let session = harness.orchestrator.start("Compare allocators", None).await.unwrap();
    harness.orchestrator.confirm(&session.id, &[], &[]).await.unwrap();

    let calls = harness.synthesizer.calls();
    assert_eq!(calls.len(), 1);
    let prompt = &calls[0].prompt;
    assert!(prompt.contains("<original_query>\nCompare allocators\n</original_query>"));
    for topic in ["Topic 1", "Topic 2", "Topic 3"] {
        assert!(prompt.contains(&format!("Findings about {}", topic)));
    }
    assert!(prompt.contains("### Research Result 3:"));
}

#[tokio::test]
async fn test_revise_replaces_plan() {
    let planner = ScriptedAgent::new("planner", |_, index| {
        if index == 0 {
            Reply::Text(plan_json(2))
        } else {
            Reply::Text(plan_json(4))
        }
    });
    let harness = Harness::new(planner, instant_researcher(), ScriptedAgent::replying("synthesizer", REPORT));
    let session = harness.orchestrator.start("Compare allocators", None).await.unwrap();
    assert_eq!(session.plan.as_ref().unwrap().items.len(), 2);

    let mut events = harness.events();
    let revised = harness
        .orchestrator
        .revise(&session.id, "Also cover fragmentation")
        .await
        .unwrap();

    assert_eq!(revised.phase, Phase::PlanReview);
    assert_eq!(revised.plan.as_ref().unwrap().items.len(), 4);
    let feedback_prompt = &harness.planner.calls()[1].prompt;
    assert!(feedback_prompt.contains("Also cover fragmentation"));
    assert!(feedback_prompt.contains("Topic 2"));

    let events = drain(&mut events);
    assert_eq!(of_kind(&events, EventKind::PlanDraft).len(), 1);
    assert_eq!(of_kind(&events, EventKind::PhaseChange).len(), 2);
}

#[tokio::test]
async fn test_confirm_outside_plan_review_is_rejected() {
    let harness = Harness::standard(1);
    let session = harness.orchestrator.start("Compare allocators", None).await.unwrap();
    harness.orchestrator.confirm(&session.id, &[], &[]).await.unwrap();

    let err = harness
        .orchestrator
        .confirm(&session.id, &[], &[])
        .await
        .unwrap_err();
    assert!(matches!(err, ResearchError::InvalidPhase { .. }));
    assert_eq!(err.code(), "INVALID_PHASE");

    let err = harness.orchestrator.revise(&session.id, "more").await.unwrap_err();
    assert!(matches!(err, ResearchError::InvalidPhase { .. }));
}

#[tokio::test]
async fn test_unknown_session_is_not_found() {
    let harness = Harness::standard(1);
    let err = harness.orchestrator.get("does-not-exist").await.unwrap_err();
    assert!(matches!(err, ResearchError::SessionNotFound(_)));

    let err = harness
        .orchestrator
        .confirm("does-not-exist", &[], &[])
        .await
        .unwrap_err();
    assert_eq!(err.code(), "SESSION_NOT_FOUND");
}

#[tokio::test]
async fn test_sessions_found_by_prefix() {
    let harness = Harness::standard(1);
    let session = harness.orchestrator.start("Compare allocators", None).await.unwrap();

    let found = harness.orchestrator.get(&session.id[..8]).await.unwrap();
    assert_eq!(found.id, session.id);

    let listed = harness.orchestrator.list(10).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, session.id);
}

#[tokio::test]
async fn test_planning_failure_fails_session() {
    let planner = ScriptedAgent::replying("planner", "I would research several things.");
    let harness = Harness::new(planner, instant_researcher(), ScriptedAgent::replying("synthesizer", REPORT));
    let mut events = harness.events();

    let session = harness.orchestrator.start("Compare allocators", None).await.unwrap();

    assert_eq!(session.phase, Phase::Failed);
    assert!(session.plan.is_none());
    assert!(session.error.is_some());

    let events = drain(&mut events);
    let errors = of_kind(&events, EventKind::Error);
    assert_eq!(errors.len(), 1);
    match &errors[0].payload {
        EventPayload::Error {
            error_code,
            recoverable,
            ..
        } => {
            assert_eq!(error_code, "PLANNING_FAILED");
            assert!(!recoverable);
        }
        other => panic!("unexpected payload {:?}", other),
    }

    let stored = harness.store.get(&session.id).await.unwrap().unwrap();
    assert_eq!(stored.phase, Phase::Failed);
}

#[tokio::test]
async fn test_planner_error_fails_session() {
    let planner = ScriptedAgent::new("planner", |_, _| Reply::Fail("model overloaded".to_string()));
    let harness = Harness::new(planner, instant_researcher(), ScriptedAgent::replying("synthesizer", REPORT));

    let session = harness.orchestrator.start("Compare allocators", None).await.unwrap();
    assert_eq!(session.phase, Phase::Failed);
    assert!(session.error.as_deref().unwrap().contains("model overloaded"));
}

#[tokio::test]
async fn test_empty_results_fail_by_default() {
    let researcher = ScriptedAgent::new("researcher", |_, _| Reply::Fail("search quota exhausted".to_string()));
    let harness = Harness::new(
        ScriptedAgent::replying("planner", plan_json(2)),
        researcher,
        ScriptedAgent::replying("synthesizer", REPORT),
    );
    let session = harness.orchestrator.start("Compare allocators", None).await.unwrap();
    let mut events = harness.events();

    let session = harness.orchestrator.confirm(&session.id, &[], &[]).await.unwrap();

    assert_eq!(session.phase, Phase::Failed);
    assert!(session.results.is_empty());
    assert_eq!(harness.synthesizer.call_count(), 0);

    let events = drain(&mut events);
    assert_eq!(of_kind(&events, EventKind::AgentFailed).len(), 2);
    let codes: Vec<_> = of_kind(&events, EventKind::Error)
        .into_iter()
        .filter_map(|e| match &e.payload {
            EventPayload::Error { error_code, .. } => Some(error_code.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(codes, vec!["NO_RESULTS"]);
}

#[tokio::test]
async fn test_empty_results_can_still_synthesize() {
    let researcher = ScriptedAgent::new("researcher", |_, _| Reply::Fail("search quota exhausted".to_string()));
    let harness = Harness::with_config(
        config(4, EmptyResultsPolicy::Synthesize),
        None,
        ScriptedAgent::replying("planner", plan_json(2)),
        researcher,
        ScriptedAgent::replying("synthesizer", REPORT),
    );
    let session = harness.orchestrator.start("Compare allocators", None).await.unwrap();

    let session = harness.orchestrator.confirm(&session.id, &[], &[]).await.unwrap();

    assert_eq!(session.phase, Phase::Completed);
    assert!(session.results.is_empty());
    let prompt = &harness.synthesizer.calls()[0].prompt;
    assert!(prompt.contains("No research results are available."));
}

#[tokio::test]
async fn test_synthesis_failure_fails_session() {
    let synthesizer = ScriptedAgent::replying("synthesizer", "   ");
    let harness = Harness::new(ScriptedAgent::replying("planner", plan_json(1)), instant_researcher(), synthesizer);
    let session = harness.orchestrator.start("Compare allocators", None).await.unwrap();

    let session = harness.orchestrator.confirm(&session.id, &[], &[]).await.unwrap();

    assert_eq!(session.phase, Phase::Failed);
    assert!(session.final_report.is_none());
    assert_eq!(session.results.len(), 1);
}

#[tokio::test]
async fn test_researcher_prose_is_kept_as_findings() {
    let researcher = ScriptedAgent::replying("researcher", "No JSON here, just notes.");
    let harness = Harness::new(
        ScriptedAgent::replying("planner", plan_json(1)),
        researcher,
        ScriptedAgent::replying("synthesizer", REPORT),
    );
    let session = harness.orchestrator.start("Compare allocators", None).await.unwrap();
    let session = harness.orchestrator.confirm(&session.id, &[], &[]).await.unwrap();

    let result = &session.results[0];
    assert_eq!(result.findings, "No JSON here, just notes.");
    assert!((result.confidence - 0.7).abs() < f64::EPSILON);
    assert!(result.sources.is_empty());
}

#[tokio::test]
async fn test_late_subscriber_sees_no_history() {
    let harness = Harness::standard(2);
    let session = harness.orchestrator.start("Compare allocators", None).await.unwrap();
    harness.orchestrator.confirm(&session.id, &[], &[]).await.unwrap();

    let mut late = harness.events();
    assert!(drain(&mut late).is_empty());
}

#[tokio::test]
async fn test_results_carry_parsed_sources() {
    let harness = Harness::standard(1);
    let session = harness.orchestrator.start("Compare allocators", None).await.unwrap();
    let session = harness.orchestrator.confirm(&session.id, &[], &[]).await.unwrap();

    let result = &session.results[0];
    assert_eq!(result.plan_item_id, "item-1");
    assert_eq!(result.agent_id, "researcher-item-1");
    assert_eq!(result.findings, "Findings about Topic 1");
    assert_eq!(result.sources.len(), 1);
    assert_eq!(result.sources[0].reliability, "high");
}

#[tokio::test]
async fn test_session_stream_ends_when_session_finishes() {
    let harness = Harness::standard(1);
    let session = harness.orchestrator.start("Compare allocators", None).await.unwrap();
    let mut stream = harness.bus.stream(Filter::session(&session.id));

    harness.orchestrator.confirm(&session.id, &[], &[]).await.unwrap();

    let mut kinds = Vec::new();
    while let Some(event) = stream.recv().await {
        kinds.push(event.kind());
    }
    assert_eq!(kinds.first(), Some(&EventKind::PlanUpdated));
    assert_eq!(kinds.last(), Some(&EventKind::ReportReady));
}
