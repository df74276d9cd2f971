//! Gateway Actions
//!
//! Domain calls composed on top of [`GatewayClient`]:
//!
//! - **Start task**: hand an in-progress task to its assignee agent (`agent`)
//! - **Orchestrator run**: fire a scheduled orchestrator job now (`cron.run`)
//!
//! A task moving to "in progress" must never fail because the gateway is
//! down. [`GatewayClient::start_task_best_effort`] logs the failure, pokes the
//! orchestrator instead, and reports `triggered: false`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{clean_str, AgentRoster, DEFAULT_ORCHESTRATOR_JOB};
use crate::error::GatewayError;
use crate::gateway::protocol::truthy;
use crate::gateway::{CallOptions, GatewayClient, SessionRunner};

/// Reason reported for tasks that are unassigned or not in progress.
pub const NOT_STARTABLE: &str = "task not startable";

/// Reason reported when the start could not be delivered.
pub const GATEWAY_UNAVAILABLE: &str = "gateway unavailable";

/// Run timeout the agent is asked to honour, in milliseconds.
const AGENT_RUN_TIMEOUT_MS: u64 = 15_000;

/// Timeout for delivering the `agent` call itself.
const TASK_START_CALL_TIMEOUT: Duration = Duration::from_secs(20);

const ORCHESTRATOR_CALL_TIMEOUT: Duration = Duration::from_secs(15);

/// Task as published by the task store's status change feed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub implementation_plan: Option<String>,
    #[serde(default)]
    pub due_date: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub assignee: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStartOutcome {
    pub triggered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl TaskStartOutcome {
    fn skipped(reason: &str) -> Self {
        Self {
            triggered: false,
            reason: Some(reason.to_string()),
            agent_id: None,
            idempotency_key: None,
            run_id: None,
            status: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorRunOutcome {
    pub triggered: bool,
    pub job_id: String,
    pub ran: bool,
}

/// Whether a task is assigned and in progress.
///
/// Status comparison ignores case, whitespace, `-` and `_`.
pub fn is_startable(task: &TaskRecord) -> bool {
    let assignee = clean_str(task.assignee.as_deref().unwrap_or_default(), 120);
    let status: String = clean_str(task.status.as_deref().unwrap_or_default(), 32)
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-' && *c != '_')
        .collect::<String>()
        .to_lowercase();
    !assignee.is_empty() && status == "inprogress"
}

fn normalize_agent_name(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_lowercase()
}

/// Map a human-entered assignee to an agent id.
///
/// Aliases and unknown names land on `default_agent`; roster ids win over names.
pub fn resolve_agent_id(
    assignee: &str,
    roster: &AgentRoster,
    default_agent: &str,
    aliases: &[String],
) -> String {
    let wanted = normalize_agent_name(assignee);
    if wanted.is_empty() || aliases.iter().any(|a| normalize_agent_name(a) == wanted) {
        return default_agent.to_string();
    }

    let by_id = roster
        .agents
        .iter()
        .find(|agent| normalize_agent_name(&agent.id) == wanted);
    let by_name = || {
        roster.agents.iter().find(|agent| {
            agent
                .name
                .as_deref()
                .is_some_and(|name| normalize_agent_name(name) == wanted)
        })
    };

    match by_id.or_else(by_name) {
        Some(agent) => agent.id.clone(),
        None => {
            debug!(assignee = %assignee, default_agent = %default_agent, "Assignee not in roster");
            default_agent.to_string()
        }
    }
}

/// Instruction handed to the agent when a task starts.
pub fn build_task_start_prompt(task: &TaskRecord) -> String {
    let present = |value: &Option<String>| value.as_deref().filter(|v| !v.is_empty()).map(str::to_string);

    let mut lines = vec![
        "Mission Control task has been moved to inprogress. Start now.".to_string(),
        format!("Task ID: {}", task.id.as_deref().unwrap_or_default()),
        format!(
            "Title: {}",
            present(&task.title).unwrap_or_else(|| "Untitled task".to_string())
        ),
    ];
    if let Some(description) = present(&task.description) {
        lines.push(format!("Description: {}", description));
    }
    if let Some(plan) = present(&task.implementation_plan) {
        lines.push(format!("Implementation Plan:\n{}", plan));
    }
    if let Some(due) = present(&task.due_date) {
        lines.push(format!("Due Date: {}", due));
    }
    lines.push(
        "Requirements: keep scope to this task, produce concrete deliverables, and report blockers quickly."
            .to_string(),
    );
    lines.push(
        "When done, update Mission Control status and markdownFiles for this specific task only."
            .to_string(),
    );
    lines.join("\n\n")
}

impl<R: SessionRunner> GatewayClient<R> {
    /// Start `task` on its assignee agent.
    ///
    /// Returns `triggered: false` without any network traffic when the task
    /// is unassigned or not in progress.
    pub async fn trigger_task_start(&self, task: &TaskRecord) -> Result<TaskStartOutcome, GatewayError> {
        if !is_startable(task) {
            debug!(task_id = ?task.id, status = ?task.status, "Task not startable");
            return Ok(TaskStartOutcome::skipped(NOT_STARTABLE));
        }

        let settings = self.settings();
        let assignee = clean_str(task.assignee.as_deref().unwrap_or_default(), 120);
        let agent_id = resolve_agent_id(
            &assignee,
            &self.roster(),
            &settings.default_agent,
            &settings.default_agent_aliases,
        );

        let task_id = task.id.as_deref().filter(|id| !id.is_empty());
        let idempotency_key = format!(
            "mc-task-start-{}-{}",
            task_id.map(str::to_string).unwrap_or_else(|| Uuid::new_v4().to_string()),
            chrono::Utc::now().timestamp_millis()
        );

        info!(task_id = ?task_id, agent_id = %agent_id, "Starting task on agent");
        let payload = self
            .call(
                "agent",
                json!({
                    "agentId": agent_id,
                    "message": build_task_start_prompt(task),
                    "idempotencyKey": idempotency_key,
                    "deliver": false,
                    "timeout": AGENT_RUN_TIMEOUT_MS,
                    "label": format!("task-{}", task_id.unwrap_or("unknown")),
                }),
                CallOptions::timeout(TASK_START_CALL_TIMEOUT),
            )
            .await?;

        Ok(TaskStartOutcome {
            triggered: true,
            reason: None,
            agent_id: Some(agent_id),
            idempotency_key: Some(idempotency_key),
            run_id: string_field(&payload, "runId"),
            status: string_field(&payload, "status"),
        })
    }

    /// Fire the scheduled orchestrator job `job_id` now.
    pub async fn trigger_orchestrator_run(&self, job_id: &str) -> Result<OrchestratorRunOutcome, GatewayError> {
        info!(job_id = %job_id, "Triggering orchestrator run");
        let payload = self
            .call(
                "cron.run",
                json!({ "id": job_id }),
                CallOptions::timeout(ORCHESTRATOR_CALL_TIMEOUT),
            )
            .await?;

        Ok(OrchestratorRunOutcome {
            triggered: true,
            job_id: job_id.to_string(),
            ran: payload.get("ran").is_some_and(truthy),
        })
    }

    /// Start `task`, never failing.
    ///
    /// On delivery failure the default orchestrator job is triggered instead
    /// (its own failure is only logged).
    pub async fn start_task_best_effort(&self, task: &TaskRecord) -> TaskStartOutcome {
        match self.trigger_task_start(task).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(task_id = ?task.id, error = %e, "Task start not delivered, falling back to orchestrator run");
                if let Err(e) = self.trigger_orchestrator_run(DEFAULT_ORCHESTRATOR_JOB).await {
                    warn!(job_id = DEFAULT_ORCHESTRATOR_JOB, error = %e, "Fallback orchestrator run failed");
                }
                TaskStartOutcome::skipped(GATEWAY_UNAVAILABLE)
            }
        }
    }
}

/// Consume the task status change feed until every sender is dropped.
///
/// Each task is delivered on its own spawned task, so a slow or unreachable
/// gateway never holds up the next status change. Deliveries still running
/// when the feed closes are awaited before returning.
///
/// Returns how many tasks were handed to an agent.
pub async fn run_task_feed<R: SessionRunner + 'static>(
    client: Arc<GatewayClient<R>>,
    mut tasks: mpsc::Receiver<TaskRecord>,
) -> usize {
    let mut deliveries = JoinSet::new();
    let mut triggered = 0;

    while let Some(task) = tasks.recv().await {
        let client = Arc::clone(&client);
        deliveries.spawn(async move { client.start_task_best_effort(&task).await.triggered });

        while let Some(done) = deliveries.try_join_next() {
            triggered += delivered(done);
        }
    }

    debug!(in_flight = deliveries.len(), "Task feed closed, draining deliveries");
    while let Some(done) = deliveries.join_next().await {
        triggered += delivered(done);
    }
    debug!(triggered = triggered, "Task feed drained");
    triggered
}

fn delivered(done: Result<bool, JoinError>) -> usize {
    match done {
        Ok(triggered) => usize::from(triggered),
        Err(e) => {
            warn!(error = %e, "Task delivery aborted");
            0
        }
    }
}

fn string_field(payload: &Value, key: &str) -> Option<String> {
    match payload.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
