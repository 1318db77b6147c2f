//! Sub-Agent
//!
//! A second cooperative loop owning the external-tool-source lifecycle.
//! Requests queue with a priority, statuses are observable, and outcomes
//! flow back to the main loop as tagged messages. Work done here is
//! metered at a nominal energy rate that the main loop polls and debits.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::types::{
    ExternalTool, ExternalToolSource, RequestState, RequestStatus, SubAgentMessage,
    SubAgentRequest, ToolSourceAction,
};

/// Nominal energy cost per second of sub-agent wall work.
pub const SUBAGENT_ENERGY_RATE: f64 = 2.0;

/// Bounded request queue size; submissions beyond this are refused.
const QUEUE_CAPACITY: usize = 64;

/// Worker poll interval while the queue is empty.
const TICK_MS: u64 = 250;

#[derive(Default)]
struct Shared {
    queue: Mutex<VecDeque<SubAgentRequest>>,
    statuses: Mutex<HashMap<String, RequestStatus>>,
    outbound: Mutex<VecDeque<SubAgentMessage>>,
    energy_tally: Mutex<f64>,
    known_tools: Mutex<Vec<ExternalTool>>,
}

/// Cloneable client side of the sub-agent.
#[derive(Clone)]
pub struct SubAgentHandle {
    shared: Arc<Shared>,
    source: Arc<dyn ExternalToolSource>,
}

impl SubAgentHandle {
    /// Enqueue a lifecycle request. Refused when the queue is full.
    pub fn submit(&self, request: SubAgentRequest) -> anyhow::Result<()> {
        let mut queue = self.shared.queue.lock().unwrap();
        if queue.len() >= QUEUE_CAPACITY {
            anyhow::bail!("sub-agent queue is full ({QUEUE_CAPACITY} requests)");
        }
        self.shared.statuses.lock().unwrap().insert(
            request.id.clone(),
            RequestStatus { state: RequestState::Queued, progress: 0 },
        );
        queue.push_back(request);
        Ok(())
    }

    pub fn status(&self, request_id: &str) -> Option<RequestStatus> {
        self.shared.statuses.lock().unwrap().get(request_id).copied()
    }

    /// Cancel a request that has not started yet.
    pub fn cancel(&self, request_id: &str) -> bool {
        let mut queue = self.shared.queue.lock().unwrap();
        let before = queue.len();
        queue.retain(|r| r.id != request_id);
        let removed = queue.len() < before;
        if removed {
            self.shared.statuses.lock().unwrap().insert(
                request_id.to_string(),
                RequestStatus { state: RequestState::Cancelled, progress: 0 },
            );
        }
        removed
    }

    /// Take everything the sub-agent has published since the last drain.
    pub fn drain_messages(&self) -> Vec<SubAgentMessage> {
        self.shared.outbound.lock().unwrap().drain(..).collect()
    }

    /// Energy used since the previous poll. Resets on read: a second call
    /// with no intervening work returns zero.
    pub fn energy_consumed_since_last_poll(&self) -> f64 {
        std::mem::take(&mut *self.shared.energy_tally.lock().unwrap())
    }

    /// Tools currently known from the external source.
    pub fn external_tools(&self) -> Vec<ExternalTool> {
        self.shared.known_tools.lock().unwrap().clone()
    }

    /// The underlying source, for direct tool invocation by the dispatcher.
    pub fn source(&self) -> Arc<dyn ExternalToolSource> {
        Arc::clone(&self.source)
    }
}

/// The worker side: owns the background task.
pub struct SubAgent {
    handle: SubAgentHandle,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl SubAgent {
    pub fn new(source: Arc<dyn ExternalToolSource>) -> Self {
        Self {
            handle: SubAgentHandle { shared: Arc::new(Shared::default()), source },
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    pub fn handle(&self) -> SubAgentHandle {
        self.handle.clone()
    }

    /// Spawn the processing loop.
    pub fn start(&mut self) {
        if self.running.load(Ordering::SeqCst) {
            warn!("sub-agent is already running");
            return;
        }
        self.running.store(true, Ordering::SeqCst);
        info!("starting sub-agent worker");

        let running = Arc::clone(&self.running);
        let handle = self.handle.clone();

        let worker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(TICK_MS));
            loop {
                interval.tick().await;
                if !running.load(Ordering::SeqCst) {
                    info!("sub-agent worker stopping");
                    break;
                }
                while let Some(request) = pop_highest_priority(&handle.shared) {
                    process(&handle, request).await;
                }
            }
        });
        self.worker = Some(worker);
    }

    /// Stop the processing loop after its current request.
    pub fn stop(&mut self) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        info!("stopping sub-agent");
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }
}

fn pop_highest_priority(shared: &Shared) -> Option<SubAgentRequest> {
    let mut queue = shared.queue.lock().unwrap();
    let idx = queue
        .iter()
        .enumerate()
        .min_by_key(|(_, r)| r.priority)
        .map(|(i, _)| i)?;
    queue.remove(idx)
}

fn publish(shared: &Shared, message: SubAgentMessage) {
    shared.outbound.lock().unwrap().push_back(message);
}

fn set_status(shared: &Shared, request_id: &str, state: RequestState, progress: u8) {
    shared
        .statuses
        .lock()
        .unwrap()
        .insert(request_id.to_string(), RequestStatus { state, progress });
}

/// Run one lifecycle request against the external source, publishing
/// status traffic and metering the wall time spent.
async fn process(handle: &SubAgentHandle, request: SubAgentRequest) {
    let shared = &handle.shared;
    let id = request.id.clone();
    debug!(request_id = %id, "sub-agent processing request");

    set_status(shared, &id, RequestState::InProgress, 10);
    publish(
        shared,
        SubAgentMessage::StatusUpdate { request_id: id.clone(), data: json!({ "progress": 10 }) },
    );

    let start = Instant::now();
    let result = run_action(handle, &request.action).await;
    let elapsed = start.elapsed().as_secs_f64();
    *shared.energy_tally.lock().unwrap() += elapsed * SUBAGENT_ENERGY_RATE;

    match result {
        Ok(data) => {
            set_status(shared, &id, RequestState::Completed, 100);
            publish(
                shared,
                SubAgentMessage::Log {
                    request_id: id.clone(),
                    data: json!({ "elapsed_secs": elapsed }),
                },
            );
            publish(shared, SubAgentMessage::Completion { request_id: id, data });
        }
        Err(e) => {
            set_status(shared, &id, RequestState::Failed, 100);
            publish(
                shared,
                SubAgentMessage::Error {
                    request_id: id,
                    data: json!({ "error": format!("{e:#}") }),
                },
            );
        }
    }
}

async fn run_action(
    handle: &SubAgentHandle,
    action: &ToolSourceAction,
) -> anyhow::Result<serde_json::Value> {
    let source = &handle.source;
    let shared = &handle.shared;
    match action {
        ToolSourceAction::Add { name, endpoint } => {
            let tools = source.add_source(name, endpoint).await?;
            let mut known = shared.known_tools.lock().unwrap();
            known.retain(|t| t.source != *name);
            known.extend(tools.iter().cloned());
            Ok(json!({ "source": name, "tools": tools.len() }))
        }
        ToolSourceAction::Remove { name } => {
            source.remove_source(name).await?;
            shared.known_tools.lock().unwrap().retain(|t| t.source != *name);
            Ok(json!({ "removed": name }))
        }
        ToolSourceAction::Test { name } => {
            let healthy = source.test_source(name).await?;
            Ok(json!({ "source": name, "healthy": healthy }))
        }
        ToolSourceAction::List => {
            let tools = source.list_tools().await?;
            let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
            let listed = json!({ "tools": names });
            *shared.known_tools.lock().unwrap() = tools;
            Ok(listed)
        }
        ToolSourceAction::Search { query } => {
            let tools = source.search_tools(query).await?;
            let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
            Ok(json!({ "query": query, "matches": names }))
        }
    }
}

// ─── In-Memory Source ────────────────────────────────────────────

/// Tool source backed by a map. The default when no federation is
/// configured, and the fixture for tests.
#[derive(Default)]
pub struct InMemoryToolSource {
    sources: Mutex<HashMap<String, Vec<ExternalTool>>>,
}

impl InMemoryToolSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a source with tools (tests).
    pub fn seed(&self, source: &str, tools: Vec<ExternalTool>) {
        self.sources.lock().unwrap().insert(source.to_string(), tools);
    }
}

#[async_trait::async_trait]
impl ExternalToolSource for InMemoryToolSource {
    async fn add_source(&self, name: &str, _endpoint: &str) -> anyhow::Result<Vec<ExternalTool>> {
        let mut sources = self.sources.lock().unwrap();
        let tools = sources.entry(name.to_string()).or_default();
        Ok(tools.clone())
    }

    async fn remove_source(&self, name: &str) -> anyhow::Result<()> {
        self.sources.lock().unwrap().remove(name);
        Ok(())
    }

    async fn test_source(&self, name: &str) -> anyhow::Result<bool> {
        Ok(self.sources.lock().unwrap().contains_key(name))
    }

    async fn list_tools(&self) -> anyhow::Result<Vec<ExternalTool>> {
        Ok(self.sources.lock().unwrap().values().flatten().cloned().collect())
    }

    async fn search_tools(&self, query: &str) -> anyhow::Result<Vec<ExternalTool>> {
        let query = query.to_lowercase();
        Ok(self
            .sources
            .lock()
            .unwrap()
            .values()
            .flatten()
            .filter(|t| {
                t.name.to_lowercase().contains(&query)
                    || t.description.to_lowercase().contains(&query)
            })
            .cloned()
            .collect())
    }

    async fn call_tool(&self, name: &str, _arguments: &serde_json::Value) -> anyhow::Result<String> {
        let known = self
            .sources
            .lock()
            .unwrap()
            .values()
            .flatten()
            .any(|t| t.name == name);
        if known {
            Ok(format!("{name}: ok"))
        } else {
            anyhow::bail!("no such external tool: {name}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Priority;

    fn seeded_source() -> Arc<InMemoryToolSource> {
        let source = Arc::new(InMemoryToolSource::new());
        source.seed(
            "weather",
            vec![ExternalTool {
                name: "get_forecast".to_string(),
                description: "Fetch a weather forecast".to_string(),
                parameters: json!({ "type": "object", "properties": {} }),
                source: "weather".to_string(),
            }],
        );
        source
    }

    fn request(id: &str, priority: Priority, action: ToolSourceAction) -> SubAgentRequest {
        SubAgentRequest { id: id.to_string(), priority, action }
    }

    #[tokio::test]
    async fn test_energy_tally_resets_on_poll() {
        let agent = SubAgent::new(seeded_source());
        let handle = agent.handle();

        process(&handle, request("r1", Priority::Medium, ToolSourceAction::List)).await;

        let first = handle.energy_consumed_since_last_poll();
        assert!(first >= 0.0);
        let second = handle.energy_consumed_since_last_poll();
        assert_eq!(second, 0.0);
    }

    #[tokio::test]
    async fn test_list_completes_and_caches_tools() {
        let agent = SubAgent::new(seeded_source());
        let handle = agent.handle();

        process(&handle, request("r1", Priority::Medium, ToolSourceAction::List)).await;

        assert_eq!(handle.status("r1").unwrap().state, RequestState::Completed);
        assert_eq!(handle.status("r1").unwrap().progress, 100);
        assert_eq!(handle.external_tools().len(), 1);

        let messages = handle.drain_messages();
        assert!(matches!(messages.first(), Some(SubAgentMessage::StatusUpdate { .. })));
        assert!(matches!(messages.last(), Some(SubAgentMessage::Completion { .. })));
        // Drained; nothing left behind.
        assert!(handle.drain_messages().is_empty());
    }

    struct FailingSource;

    #[async_trait::async_trait]
    impl ExternalToolSource for FailingSource {
        async fn add_source(&self, _: &str, _: &str) -> anyhow::Result<Vec<ExternalTool>> {
            anyhow::bail!("source offline")
        }
        async fn remove_source(&self, _: &str) -> anyhow::Result<()> {
            anyhow::bail!("source offline")
        }
        async fn test_source(&self, _: &str) -> anyhow::Result<bool> {
            anyhow::bail!("source offline")
        }
        async fn list_tools(&self) -> anyhow::Result<Vec<ExternalTool>> {
            anyhow::bail!("source offline")
        }
        async fn search_tools(&self, _: &str) -> anyhow::Result<Vec<ExternalTool>> {
            anyhow::bail!("source offline")
        }
        async fn call_tool(&self, _: &str, _: &serde_json::Value) -> anyhow::Result<String> {
            anyhow::bail!("source offline")
        }
    }

    #[tokio::test]
    async fn test_failure_publishes_error() {
        let agent = SubAgent::new(Arc::new(FailingSource));
        let handle = agent.handle();

        process(&handle, request("r1", Priority::High, ToolSourceAction::List)).await;

        assert_eq!(handle.status("r1").unwrap().state, RequestState::Failed);
        let messages = handle.drain_messages();
        assert!(messages.iter().any(|m| matches!(m, SubAgentMessage::Error { .. })));
    }

    #[tokio::test]
    async fn test_priority_ordering_and_capacity() {
        let agent = SubAgent::new(seeded_source());
        let handle = agent.handle();

        handle.submit(request("low", Priority::Low, ToolSourceAction::List)).unwrap();
        handle.submit(request("high", Priority::High, ToolSourceAction::List)).unwrap();
        handle.submit(request("med", Priority::Medium, ToolSourceAction::List)).unwrap();

        let first = pop_highest_priority(&handle.shared).unwrap();
        assert_eq!(first.id, "high");
        let second = pop_highest_priority(&handle.shared).unwrap();
        assert_eq!(second.id, "med");

        // Fill to capacity; the next submit is refused.
        for i in 0..QUEUE_CAPACITY - 1 {
            handle
                .submit(request(&format!("bulk{i}"), Priority::Low, ToolSourceAction::List))
                .unwrap();
        }
        assert!(handle
            .submit(request("overflow", Priority::Low, ToolSourceAction::List))
            .is_err());
    }

    #[tokio::test]
    async fn test_cancel_queued_request() {
        let agent = SubAgent::new(seeded_source());
        let handle = agent.handle();
        handle.submit(request("r1", Priority::Low, ToolSourceAction::List)).unwrap();
        assert!(handle.cancel("r1"));
        assert_eq!(handle.status("r1").unwrap().state, RequestState::Cancelled);
        assert!(pop_highest_priority(&handle.shared).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_loop_drains_queue() {
        let mut agent = SubAgent::new(seeded_source());
        let handle = agent.handle();
        agent.start();

        handle.submit(request("r1", Priority::Medium, ToolSourceAction::List)).unwrap();
        // Let the worker tick.
        tokio::time::sleep(Duration::from_millis(TICK_MS * 3)).await;

        assert_eq!(handle.status("r1").unwrap().state, RequestState::Completed);
        agent.stop();
    }
}
