//! Checkpoints and resuming interrupted sessions

use std::time::Duration;

use deep_research::config::EmptyResultsPolicy;
use deep_research::model::{agent_id_for, AgentResult, Phase, Plan, PlanItem, PlanItemStatus, Session};
use deep_research::store::SessionStore;
use deep_research::{EventKind, EventPayload, ResearchError};

use super::support::{
    config, drain, eventually, findings_json, instant_researcher, of_kind, plan_json, topic_of, Harness, Reply,
    ScriptedAgent, REPORT,
};

fn result_for(item: &PlanItem) -> AgentResult {
    AgentResult {
        agent_id: agent_id_for(&item.id),
        plan_item_id: item.id.clone(),
        topic: item.topic.clone(),
        findings: format!("Earlier findings about {}", item.topic),
        sources: Vec::new(),
        confidence: 0.8,
        raw_notes: String::new(),
        execution_time: Duration::from_secs(3),
    }
}

/// A session interrupted during research with `done` of `total` items finished
async fn interrupted_session(harness: &Harness, total: usize, done: usize) -> Session {
    let items: Vec<_> = (1..=total)
        .map(|i| PlanItem::new(format!("item-{}", i), format!("Topic {}", i)))
        .collect();
    let mut session = Session::new("Compare allocators", "en");
    session.plan = Some(Plan::new("Allocator comparison", items.clone()));
    session.set_phase(Phase::PlanReview);
    session.set_phase(Phase::Researching);
    for item in items.iter().take(done) {
        session.add_result(result_for(item));
    }
    // The crash left one unit mid-flight
    if let Some(item) = items.get(done) {
        session.set_item_status(&item.id, PlanItemStatus::InProgress);
    }

    harness.store.create(&session).await.unwrap();
    harness.store.save_checkpoint(&session).await.unwrap();
    session
}

#[tokio::test]
async fn test_resume_runs_only_pending_items() {
    let harness = Harness::standard(5);
    let seeded = interrupted_session(&harness, 5, 2).await;
    let stored = harness.store.get(&seeded.id).await.unwrap().unwrap();
    let mut events = harness.events();

    let session = harness.orchestrator.resume(&seeded.id).await.unwrap();

    assert_eq!(session.phase, Phase::Completed);
    assert_eq!(session.results.len(), 5);
    assert_eq!(session.created_at, stored.created_at);

    let mut topics: Vec<_> = harness.researcher.calls().iter().map(topic_of).collect();
    topics.sort();
    assert_eq!(topics, vec!["Topic 3", "Topic 4", "Topic 5"]);

    let earlier: Vec<_> = session
        .results
        .iter()
        .filter(|r| r.findings.starts_with("Earlier findings"))
        .map(|r| r.plan_item_id.as_str())
        .collect();
    assert_eq!(earlier, vec!["item-1", "item-2"]);

    let events = drain(&mut events);
    match &of_kind(&events, EventKind::PhaseChange)[0].payload {
        EventPayload::PhaseChange { old_phase, new_phase } => {
            assert_eq!(*old_phase, None);
            assert_eq!(*new_phase, Phase::Researching);
        }
        other => panic!("unexpected payload {:?}", other),
    }
    assert_eq!(of_kind(&events, EventKind::AgentStarted).len(), 3);
    assert_eq!(harness.planner.call_count(), 0);
}

#[tokio::test]
async fn test_resume_by_prefix() {
    let harness = Harness::standard(2);
    let seeded = interrupted_session(&harness, 2, 1).await;

    let session = harness.orchestrator.resume(&seeded.id[..8]).await.unwrap();
    assert_eq!(session.id, seeded.id);
    assert_eq!(session.phase, Phase::Completed);
    assert_eq!(harness.researcher.call_count(), 1);
}

#[tokio::test]
async fn test_resume_without_checkpoint_fails() {
    let harness = Harness::standard(1);
    let mut session = Session::new("Compare allocators", "en");
    session.set_phase(Phase::PlanReview);
    harness.store.create(&session).await.unwrap();

    let err = harness.orchestrator.resume(&session.id).await.unwrap_err();
    assert!(matches!(err, ResearchError::NoCheckpointFound(_)));
    assert_eq!(err.code(), "NO_CHECKPOINT_FOUND");
    assert!(!harness.orchestrator.is_running(&session.id));
}

#[tokio::test]
async fn test_resume_finished_session_is_a_no_op() {
    let harness = Harness::standard(2);
    let session = harness.orchestrator.start("Compare allocators", None).await.unwrap();
    let finished = harness.orchestrator.confirm(&session.id, &[], &[]).await.unwrap();
    assert_eq!(finished.phase, Phase::Completed);

    let resumed = harness.orchestrator.resume(&session.id).await.unwrap();
    assert_eq!(resumed.phase, Phase::Completed);
    assert_eq!(resumed.final_report.as_deref(), Some(REPORT));
    assert_eq!(harness.researcher.call_count(), 2);
    assert_eq!(harness.synthesizer.call_count(), 1);
}

#[tokio::test]
async fn test_resume_in_plan_review_waits_for_confirmation() {
    let harness = Harness::standard(3);
    let session = harness.orchestrator.start("Compare allocators", None).await.unwrap();

    let resumed = harness.orchestrator.resume(&session.id).await.unwrap();

    assert_eq!(resumed.phase, Phase::PlanReview);
    assert_eq!(resumed.plan, session.plan);
    assert_eq!(harness.planner.call_count(), 1);
    assert_eq!(harness.researcher.call_count(), 0);

    let finished = harness.orchestrator.confirm(&session.id, &[], &[]).await.unwrap();
    assert_eq!(finished.phase, Phase::Completed);
}

#[tokio::test]
async fn test_resume_retries_failed_items() {
    let harness = Harness::standard(3);
    let mut seeded = interrupted_session(&harness, 3, 1).await;
    seeded.set_item_status("item-2", PlanItemStatus::Failed);
    seeded.set_item_status("item-3", PlanItemStatus::Skipped);
    harness.store.update(&seeded).await.unwrap();
    harness.store.save_checkpoint(&seeded).await.unwrap();

    let session = harness.orchestrator.resume(&seeded.id).await.unwrap();

    assert_eq!(session.phase, Phase::Completed);
    let topics: Vec<_> = harness.researcher.calls().iter().map(topic_of).collect();
    assert_eq!(topics, vec!["Topic 2"]);
    let plan = session.plan.as_ref().unwrap();
    assert_eq!(plan.item("item-2").unwrap().status, PlanItemStatus::Completed);
    assert_eq!(plan.item("item-3").unwrap().status, PlanItemStatus::Skipped);
    assert_eq!(session.results.len(), 2);
}

#[tokio::test]
async fn test_resume_prefers_stored_session_ahead_of_checkpoint() {
    let harness = Harness::standard(2);
    let mut seeded = interrupted_session(&harness, 2, 2).await;
    seeded.set_phase(Phase::Synthesizing);
    harness.store.update(&seeded).await.unwrap();

    let session = harness.orchestrator.resume(&seeded.id).await.unwrap();

    assert_eq!(session.phase, Phase::Completed);
    assert_eq!(harness.researcher.call_count(), 0);
    assert_eq!(harness.synthesizer.call_count(), 1);
}

#[tokio::test]
async fn test_checkpoints_saved_during_research() {
    let researcher = ScriptedAgent::new("researcher", |call, _| {
        Reply::Delayed(Duration::from_millis(300), findings_json(&topic_of(call)))
    });
    let harness = Harness::with_config(
        config(2, EmptyResultsPolicy::Fail).with_checkpoint_interval(Duration::from_millis(50)),
        None,
        ScriptedAgent::replying("planner", plan_json(2)),
        researcher,
        ScriptedAgent::replying("synthesizer", REPORT),
    );
    let session = harness.orchestrator.start("Compare allocators", None).await.unwrap();
    let mut events = harness.events();

    harness.orchestrator.confirm(&session.id, &[], &[]).await.unwrap();

    let events = drain(&mut events);
    let during_research = of_kind(&events, EventKind::CheckpointSaved)
        .into_iter()
        .filter(|e| matches!(e.payload, EventPayload::CheckpointSaved { phase: Phase::Researching, .. }))
        .count();
    // One on entering the phase plus at least one periodic save
    assert!(during_research >= 2, "only {} checkpoints during research", during_research);

    let checkpoint = harness.store.load_checkpoint(&session.id).await.unwrap().unwrap();
    assert_eq!(checkpoint.phase, Phase::Synthesizing);
    assert_eq!(checkpoint.completed_item_ids, vec!["item-1", "item-2"]);
    assert!(checkpoint.pending_item_ids.is_empty());
}

#[tokio::test]
async fn test_resume_interrupted_revision_keeps_feedback() {
    let planner = ScriptedAgent::new("planner", |_, index| match index {
        0 => Reply::Text(plan_json(2)),
        1 => Reply::Hang,
        _ => Reply::Text(plan_json(3)),
    });
    let harness = Harness::new(planner, instant_researcher(), ScriptedAgent::replying("synthesizer", REPORT));
    let session = harness.orchestrator.start("Compare allocators", None).await.unwrap();
    assert_eq!(session.phase, Phase::PlanReview);

    let feedback = "Drop the history section and add a benchmark comparison";
    let run = {
        let orchestrator = harness.orchestrator.clone();
        let id = session.id.clone();
        tokio::spawn(async move { orchestrator.revise(&id, feedback).await })
    };
    let planner = harness.planner.clone();
    eventually("the revision planner call", move || planner.in_flight() == 1).await;

    // The process dies mid-call
    run.abort();
    assert!(run.await.unwrap_err().is_cancelled());

    let stored = harness.store.get(&session.id).await.unwrap().unwrap();
    assert_eq!(stored.phase, Phase::Planning);
    assert_eq!(stored.revision_feedback.as_deref(), Some(feedback));
    let checkpoint = harness.store.load_checkpoint(&session.id).await.unwrap().unwrap();
    assert_eq!(checkpoint.revision_feedback.as_deref(), Some(feedback));

    let resumed = harness.orchestrator.resume(&session.id).await.unwrap();

    assert_eq!(resumed.phase, Phase::PlanReview);
    assert_eq!(resumed.plan.as_ref().unwrap().items.len(), 3);
    assert!(resumed.revision_feedback.is_none());

    let calls = harness.planner.calls();
    assert_eq!(calls.len(), 3);
    assert!(calls[2].prompt.contains(feedback), "{}", calls[2].prompt);
    assert!(calls[2].prompt.contains("<previous_plan>"), "{}", calls[2].prompt);

    let stored = harness.store.get(&session.id).await.unwrap().unwrap();
    assert!(stored.revision_feedback.is_none());
}
