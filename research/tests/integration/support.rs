//! Scripted backends and a harness wiring them to an orchestrator

use std::future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use deep_research::config::{EmptyResultsPolicy, Role};
use deep_research::events::{Filter, Subscription};
use deep_research::gateway::{Backend, Call, GatewayError, MessageSink, ProviderRegistry, StreamMessage};
use deep_research::store::SessionStore;
use deep_research::{Database, Event, EventBus, EventKind, Orchestrator, OrchestratorConfig};

/// How a scripted agent answers one call
pub enum Reply {
    Text(String),
    Delayed(Duration, String),
    Fail(String),
    /// Never finishes; only a timeout or cancellation ends the call
    Hang,
}

type Script = dyn Fn(&Call, usize) -> Reply + Send + Sync;

/// A backend whose answers come from a closure over the call and its index
pub struct ScriptedAgent {
    name: String,
    script: Box<Script>,
    calls: Mutex<Vec<Call>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedAgent {
    pub fn new(
        name: &str,
        script: impl Fn(&Call, usize) -> Reply + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    /// Answers every call with the same text
    pub fn replying(name: &str, text: impl Into<String>) -> Arc<Self> {
        let text = text.into();
        Self::new(name, move |_, _| Reply::Text(text.clone()))
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for ScriptedAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, call: Call, sink: MessageSink) -> Result<(), GatewayError> {
        let index = {
            let mut calls = self.calls.lock();
            calls.push(call.clone());
            calls.len() - 1
        };
        let reply = (self.script)(&call, index);

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let _in_flight = InFlight(&self.in_flight);

        match reply {
            Reply::Text(text) => {
                sink.send(StreamMessage::assistant("Looking into it")).await;
                sink.send(StreamMessage::result(text)).await;
                Ok(())
            }
            Reply::Delayed(delay, text) => {
                sink.send(StreamMessage::ToolCall {
                    name: "WebSearch".to_string(),
                    input: json!({"query": "scripted"}),
                })
                .await;
                tokio::time::sleep(delay).await;
                sink.send(StreamMessage::result(text)).await;
                Ok(())
            }
            Reply::Fail(message) => Err(GatewayError::Provider(message)),
            Reply::Hang => future::pending().await,
        }
    }
}

// ============================================================================
// Canned responses
// ============================================================================

/// Planner output with items `item-1..=count` titled `Topic N`
pub fn plan_json(count: usize) -> String {
    let items: Vec<_> = (1..=count)
        .map(|i| {
            json!({
                "id": format!("item-{}", i),
                "topic": format!("Topic {}", i),
                "description": format!("Investigate topic {}", i),
                "priority": 3,
                "key_questions": [format!("What matters about topic {}?", i)],
            })
        })
        .collect();
    json!({
        "understanding": "A scripted research question",
        "plan_items": items,
        "estimated_time_minutes": 10,
    })
    .to_string()
}

/// Researcher output for a topic
pub fn findings_json(topic: &str) -> String {
    json!({
        "findings": format!("Findings about {}", topic),
        "sources": [{"url": "https://example.com", "title": "Example", "reliability": "high"}],
        "confidence": 0.9,
    })
    .to_string()
}

/// The topic a researcher call was asked about
pub fn topic_of(call: &Call) -> String {
    call.prompt
        .split_once("<topic>\n")
        .and_then(|(_, rest)| rest.split_once("\n</topic>"))
        .map(|(topic, _)| topic.to_string())
        .unwrap_or_default()
}

/// A researcher answering every topic immediately
pub fn instant_researcher() -> Arc<ScriptedAgent> {
    ScriptedAgent::new("researcher", |call, _| Reply::Text(findings_json(&topic_of(call))))
}

pub const REPORT: &str = "# Report\n\nEverything the researchers found.";

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<Database>,
    pub bus: EventBus,
    pub planner: Arc<ScriptedAgent>,
    pub researcher: Arc<ScriptedAgent>,
    pub synthesizer: Arc<ScriptedAgent>,
}

impl Harness {
    /// Planner drafting `items` topics, instant researchers and synthesizer
    pub fn standard(items: usize) -> Self {
        Self::new(
            ScriptedAgent::replying("planner", plan_json(items)),
            instant_researcher(),
            ScriptedAgent::replying("synthesizer", REPORT),
        )
    }

    pub fn new(
        planner: Arc<ScriptedAgent>,
        researcher: Arc<ScriptedAgent>,
        synthesizer: Arc<ScriptedAgent>,
    ) -> Self {
        Self::with_config(OrchestratorConfig::default(), None, planner, researcher, synthesizer)
    }

    pub fn with_config(
        config: OrchestratorConfig,
        timeout: Option<Duration>,
        planner: Arc<ScriptedAgent>,
        researcher: Arc<ScriptedAgent>,
        synthesizer: Arc<ScriptedAgent>,
    ) -> Self {
        let mut registry = ProviderRegistry::new(timeout);
        registry.register("planner", planner.clone());
        registry.register("researcher", researcher.clone());
        registry.register("synthesizer", synthesizer.clone());
        registry.bind(Role::Planner, "planner", "scripted-large");
        registry.bind(Role::Researcher, "researcher", "scripted-small");
        registry.bind(Role::Synthesizer, "synthesizer", "scripted-large");

        let store = Arc::new(Database::open_in_memory().expect("open in-memory store"));
        let bus = EventBus::new();
        let orchestrator = Orchestrator::new(
            config,
            Arc::new(registry),
            store.clone() as Arc<dyn SessionStore>,
            bus.clone(),
        );

        Self {
            orchestrator: Arc::new(orchestrator),
            store,
            bus,
            planner,
            researcher,
            synthesizer,
        }
    }

    /// Subscribe to every event on the bus
    pub fn events(&self) -> Subscription {
        self.bus.stream(Filter::all())
    }
}

pub fn config(max_parallel: usize, on_empty: EmptyResultsPolicy) -> OrchestratorConfig {
    OrchestratorConfig::default()
        .with_max_parallel_agents(max_parallel)
        .with_empty_results(on_empty)
}

// ============================================================================
// Event helpers
// ============================================================================

/// Everything queued on a subscription right now
pub fn drain(subscription: &mut Subscription) -> Vec<Event> {
    std::iter::from_fn(|| subscription.try_recv()).collect()
}

pub fn of_kind(events: &[Event], kind: EventKind) -> Vec<&Event> {
    events.iter().filter(|e| e.kind() == kind).collect()
}

/// Wait for the next event of `kind`, failing the test after five seconds
pub async fn wait_for(subscription: &mut Subscription, kind: EventKind) -> Event {
    let next = async {
        while let Some(event) = subscription.recv().await {
            if event.kind() == kind {
                return event;
            }
        }
        panic!("event stream closed before {:?}", kind);
    };
    tokio::time::timeout(Duration::from_secs(5), next)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {:?}", kind))
}

/// Poll until `condition` holds, failing the test after five seconds
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
