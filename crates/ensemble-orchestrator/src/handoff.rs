use crate::coordinator::Coordinator;
use chrono::{DateTime, Utc};
use ensemble_core::{invoke_agent, AgentContext, CancellationToken, EnsembleResult, Role};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, error, info};
use uuid::Uuid;

/// One entry of a handoff conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationEntry {
    /// Who produced the entry.
    pub role: Role,
    /// Message text.
    pub content: String,
    /// When the entry was added.
    pub timestamp: DateTime<Utc>,
    /// Agent ids and other annotations.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// One delegation step recorded on the call stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallFrame {
    /// Delegating agent.
    pub from_agent: String,
    /// Agent receiving control.
    pub to_agent: String,
    /// When the hop happened.
    pub timestamp: DateTime<Utc>,
}

/// Conversation state carried across one or more chained handoffs.
///
/// The history is append-only. Passing the same context to successive
/// [`HandoffManager::handoff`] calls accumulates every hop in one place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffContext {
    /// Id of the first handoff that created this context.
    pub handoff_id: String,
    /// Agent that started the chain.
    pub from_agent: String,
    /// Most recent target.
    pub to_agent: String,
    /// Input of the first handoff.
    pub input: String,
    /// Every message exchanged so far.
    #[serde(default)]
    pub conversation_history: Vec<ConversationEntry>,
    /// Data shared between the agents in the chain.
    #[serde(default)]
    pub shared_memory: HashMap<String, serde_json::Value>,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Delegation hops, oldest first.
    #[serde(default)]
    pub call_stack: Vec<CallFrame>,
    /// When the context was created.
    pub created_at: DateTime<Utc>,
}

impl HandoffContext {
    /// A context with an empty history and call stack.
    pub fn new(
        handoff_id: impl Into<String>,
        from_agent: impl Into<String>,
        to_agent: impl Into<String>,
        input: impl Into<String>,
    ) -> Self {
        Self {
            handoff_id: handoff_id.into(),
            from_agent: from_agent.into(),
            to_agent: to_agent.into(),
            input: input.into(),
            conversation_history: Vec::new(),
            shared_memory: HashMap::new(),
            metadata: HashMap::new(),
            call_stack: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Append a conversation entry.
    pub fn add_message(
        &mut self,
        role: Role,
        content: impl Into<String>,
        metadata: HashMap<String, serde_json::Value>,
    ) {
        self.conversation_history.push(ConversationEntry {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            metadata,
        });
    }

    /// The most recent conversation entry.
    pub fn last_message(&self) -> Option<&ConversationEntry> {
        self.conversation_history.last()
    }

    /// Encode the context as a JSON string.
    pub fn serialize(&self) -> EnsembleResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a context produced by [`serialize`](Self::serialize).
    pub fn deserialize(raw: &str) -> EnsembleResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Outcome status of a handoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffStatus {
    /// Created, not yet started.
    Pending,
    /// Target agent is running.
    InProgress,
    /// Target agent produced a result.
    Completed,
    /// Target agent failed or was not found.
    Failed,
    /// Cancelled before it finished.
    Cancelled,
}

/// What a handoff produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffResult {
    /// Id of this handoff.
    pub handoff_id: String,
    /// Outcome.
    pub status: HandoffStatus,
    /// Target agent output.
    pub result: Option<String>,
    /// Failure reason.
    pub error: Option<String>,
    /// Time spent in the target agent.
    pub execution_time: Duration,
    /// Whether control went back to the delegating agent.
    pub returned_to_caller: bool,
    /// Agent that holds control afterwards. `None` when the handoff did not complete.
    pub final_agent: Option<String>,
}

impl HandoffResult {
    fn unmatched() -> Self {
        Self {
            handoff_id: "none".to_string(),
            status: HandoffStatus::Failed,
            result: None,
            error: Some("No handoff rule matched".to_string()),
            execution_time: Duration::ZERO,
            returned_to_caller: false,
            final_agent: None,
        }
    }
}

/// Picks a handoff target from a context, or declines with `None`.
pub type HandoffRule = Arc<dyn Fn(&HandoffContext) -> Option<String> + Send + Sync>;

struct ActiveHandoff {
    context: HandoffContext,
    cancel: CancellationToken,
}

/// Delegates control between agents while preserving conversation context.
pub struct HandoffManager {
    coordinator: Arc<Coordinator>,
    rules: RwLock<Vec<(String, HandoffRule)>>,
    active: RwLock<HashMap<String, ActiveHandoff>>,
    history: RwLock<HashMap<String, HandoffContext>>,
}

impl HandoffManager {
    /// A manager with no rules, resolving agents through `coordinator`.
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self {
            coordinator,
            rules: RwLock::new(Vec::new()),
            active: RwLock::new(HashMap::new()),
            history: RwLock::new(HashMap::new()),
        }
    }

    /// Append a routing rule. Rules are tried in registration order.
    pub async fn register_rule(&self, name: impl Into<String>, rule: HandoffRule) {
        let name = name.into();
        info!(rule = %name, "Registered handoff rule");
        self.rules.write().await.push((name, rule));
    }

    /// Transfer control from `from` to `to` and run the target agent on `input`.
    ///
    /// When `context` is given it is extended in place, so chained calls share
    /// one history. Failures are reported in the returned result, never as `Err`.
    pub async fn handoff(
        &self,
        from: &str,
        to: &str,
        input: &str,
        context: Option<&mut HandoffContext>,
        return_to_caller: bool,
    ) -> HandoffResult {
        let start = Instant::now();

        let mut fresh;
        let context = match context {
            Some(existing) => {
                existing.from_agent = from.to_string();
                existing.to_agent = to.to_string();
                existing.input = input.to_string();
                existing
            }
            None => {
                let handoff_id = format!("handoff_{from}_to_{to}_{}", Uuid::new_v4().simple());
                fresh = HandoffContext::new(handoff_id, from, to, input);
                &mut fresh
            }
        };

        context.add_message(
            Role::System,
            format!("Handoff from {from} to {to}"),
            HashMap::from([(
                "return_to_caller".to_string(),
                serde_json::Value::Bool(return_to_caller),
            )]),
        );
        context.call_stack.push(CallFrame {
            from_agent: from.to_string(),
            to_agent: to.to_string(),
            timestamp: Utc::now(),
        });

        let handoff_id = context.handoff_id.clone();
        let cancel = CancellationToken::new();
        self.active.write().await.insert(
            handoff_id.clone(),
            ActiveHandoff {
                context: context.clone(),
                cancel: cancel.clone(),
            },
        );

        info!(handoff_id = %handoff_id, from = %from, to = %to, "Executing handoff");

        let outcome = self
            .run_target(context, to, input, return_to_caller, cancel)
            .await;

        let result = match outcome {
            Ok(output) => {
                context.add_message(
                    Role::Assistant,
                    output.clone(),
                    HashMap::from([("agent".to_string(), serde_json::json!(to))]),
                );
                let final_agent = Self::final_agent(context, from, to, return_to_caller);
                if final_agent != to {
                    info!(handoff_id = %handoff_id, caller = %final_agent, "Returning control to original caller");
                }
                info!(handoff_id = %handoff_id, to = %to, "Handoff completed");
                HandoffResult {
                    handoff_id: handoff_id.clone(),
                    status: HandoffStatus::Completed,
                    result: Some(output),
                    error: None,
                    execution_time: start.elapsed(),
                    returned_to_caller: return_to_caller,
                    final_agent: Some(final_agent),
                }
            }
            Err(e) => {
                let status = if e.is_cancelled() {
                    HandoffStatus::Cancelled
                } else {
                    HandoffStatus::Failed
                };
                error!(handoff_id = %handoff_id, to = %to, error = %e, "Handoff failed");
                HandoffResult {
                    handoff_id: handoff_id.clone(),
                    status,
                    result: None,
                    error: Some(e.to_string()),
                    execution_time: start.elapsed(),
                    returned_to_caller: return_to_caller,
                    final_agent: None,
                }
            }
        };

        self.active.write().await.remove(&handoff_id);
        self.history
            .write()
            .await
            .insert(handoff_id.clone(), context.clone());
        debug!(handoff_id = %handoff_id, "Handoff context archived");

        result
    }

    async fn run_target(
        &self,
        context: &HandoffContext,
        to: &str,
        input: &str,
        return_to_caller: bool,
        cancel: CancellationToken,
    ) -> EnsembleResult<String> {
        let agent = self.coordinator.require(to).await?;
        let agent_context = AgentContext::new(context.handoff_id.clone())
            .with_metadata("handoff_context", serde_json::to_value(context)?)
            .with_metadata("return_to_caller", serde_json::Value::Bool(return_to_caller))
            .with_cancellation(cancel);
        invoke_agent(agent.as_ref(), input, &agent_context).await
    }

    /// The earliest caller on the stack other than the immediate predecessor.
    fn final_agent(context: &HandoffContext, from: &str, to: &str, return_to_caller: bool) -> String {
        if return_to_caller {
            if let Some(frame) = context.call_stack.iter().find(|f| f.from_agent != from) {
                return frame.from_agent.clone();
            }
        }
        to.to_string()
    }

    /// Pick the target with the first matching rule and hand off to it.
    ///
    /// Without a match the result is failed with handoff id `"none"`.
    pub async fn auto_handoff(
        &self,
        from: &str,
        input: &str,
        context: Option<&mut HandoffContext>,
    ) -> HandoffResult {
        let rules: Vec<(String, HandoffRule)> = self.rules.read().await.clone();

        let target = {
            let scratch;
            let view: &HandoffContext = match context.as_deref() {
                Some(existing) => existing,
                None => {
                    scratch = HandoffContext::new("temp", from, "", input);
                    &scratch
                }
            };
            rules
                .iter()
                .find_map(|(name, rule)| rule(view).map(|target| (name.clone(), target)))
        };

        match target {
            Some((rule, to)) => {
                info!(rule = %rule, from = %from, to = %to, "Auto-handoff rule matched");
                self.handoff(from, &to, input, context, false).await
            }
            None => {
                debug!(from = %from, "No handoff rule matched");
                HandoffResult::unmatched()
            }
        }
    }

    /// Abort an in-flight handoff. Returns `false` if it is not active.
    pub async fn cancel_handoff(&self, handoff_id: &str) -> bool {
        match self.active.write().await.remove(handoff_id) {
            Some(active) => {
                active.cancel.cancel();
                info!(handoff_id = %handoff_id, "Cancelled handoff");
                true
            }
            None => false,
        }
    }

    /// Snapshots of the contexts of every in-flight handoff.
    pub async fn active_handoffs(&self) -> Vec<HandoffContext> {
        self.active
            .read()
            .await
            .values()
            .map(|a| a.context.clone())
            .collect()
    }

    /// The archived context of a finished handoff.
    pub async fn handoff_history(&self, handoff_id: &str) -> Option<HandoffContext> {
        self.history.read().await.get(handoff_id).cloned()
    }

    /// Number of archived handoffs.
    pub async fn history_len(&self) -> usize {
        self.history.read().await.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use ensemble_core::agent_fn;

    async fn setup() -> (Arc<Coordinator>, HandoffManager) {
        let coord = Arc::new(Coordinator::new());
        for id in ["triage", "billing", "refunds"] {
            let name = id.to_string();
            coord
                .register(
                    id,
                    agent_fn(move |input, _ctx| {
                        let name = name.clone();
                        async move { Ok(format!("{name} handled: {input}")) }
                    }),
                    Vec::<String>::new(),
                    HashMap::new(),
                )
                .await;
        }
        let manager = HandoffManager::new(coord.clone());
        (coord, manager)
    }

    #[tokio::test]
    async fn test_simple_handoff() {
        let (_coord, manager) = setup().await;
        let result = manager
            .handoff("triage", "billing", "invoice #4", None, false)
            .await;

        assert_eq!(result.status, HandoffStatus::Completed);
        assert_eq!(result.result.as_deref(), Some("billing handled: invoice #4"));
        assert_eq!(result.final_agent.as_deref(), Some("billing"));
        assert!(result.handoff_id.starts_with("handoff_triage_to_billing_"));

        let archived = manager.handoff_history(&result.handoff_id).await.unwrap();
        assert_eq!(archived.conversation_history.len(), 2);
        assert_eq!(
            archived.conversation_history[0].content,
            "Handoff from triage to billing"
        );
        assert_eq!(archived.conversation_history[1].role, Role::Assistant);
        assert_eq!(archived.conversation_history[1].metadata["agent"], "billing");
        assert!(manager.active_handoffs().await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_target_fails_and_archives() {
        let (_coord, manager) = setup().await;
        let result = manager.handoff("triage", "ghost", "hi", None, false).await;
        assert_eq!(result.status, HandoffStatus::Failed);
        assert!(result.error.unwrap().contains("Agent not found: ghost"));
        assert!(result.final_agent.is_none());
        assert_eq!(manager.history_len().await, 1);
    }

    #[tokio::test]
    async fn test_return_to_caller_uses_call_stack() {
        let (_coord, manager) = setup().await;
        let mut ctx = HandoffContext::new("conv-1", "triage", "billing", "refund please");

        let first = manager
            .handoff("triage", "billing", "refund please", Some(&mut ctx), false)
            .await;
        assert_eq!(first.final_agent.as_deref(), Some("billing"));

        let second = manager
            .handoff("billing", "refunds", "process refund", Some(&mut ctx), true)
            .await;
        assert_eq!(second.status, HandoffStatus::Completed);
        assert!(second.returned_to_caller);
        assert_eq!(second.final_agent.as_deref(), Some("triage"));
        assert_eq!(ctx.call_stack.len(), 2);
    }

    #[tokio::test]
    async fn test_agent_receives_handoff_metadata() {
        let coord = Arc::new(Coordinator::new());
        coord
            .register(
                "inspector",
                agent_fn(|_input, ctx| async move {
                    let history_len = ctx.get("handoff_context").unwrap()["conversation_history"]
                        .as_array()
                        .unwrap()
                        .len();
                    let ret = ctx.get("return_to_caller").unwrap().as_bool().unwrap();
                    Ok(format!("{}:{history_len}:{ret}", ctx.session_id))
                }),
                Vec::<String>::new(),
                HashMap::new(),
            )
            .await;
        let manager = HandoffManager::new(coord);
        let mut ctx = HandoffContext::new("h-42", "user", "inspector", "look");
        let result = manager
            .handoff("user", "inspector", "look", Some(&mut ctx), true)
            .await;
        assert_eq!(result.result.as_deref(), Some("h-42:1:true"));
    }

    #[tokio::test]
    async fn test_auto_handoff_first_matching_rule_wins() {
        let (_coord, manager) = setup().await;
        manager
            .register_rule(
                "refunds",
                Arc::new(|ctx: &HandoffContext| {
                    ctx.input.contains("refund").then(|| "refunds".to_string())
                }),
            )
            .await;
        manager
            .register_rule(
                "catch_all",
                Arc::new(|_ctx: &HandoffContext| Some("billing".to_string())),
            )
            .await;

        let result = manager.auto_handoff("triage", "refund my order", None).await;
        assert_eq!(result.final_agent.as_deref(), Some("refunds"));

        let result = manager.auto_handoff("triage", "where is my invoice", None).await;
        assert_eq!(result.final_agent.as_deref(), Some("billing"));
    }

    #[tokio::test]
    async fn test_auto_handoff_without_match() {
        let (_coord, manager) = setup().await;
        let result = manager.auto_handoff("triage", "hello", None).await;
        assert_eq!(result.handoff_id, "none");
        assert_eq!(result.status, HandoffStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("No handoff rule matched"));
    }

    #[tokio::test]
    async fn test_cancel_aborts_in_flight_handoff() {
        let coord = Arc::new(Coordinator::new());
        coord
            .register(
                "slow",
                agent_fn(|_input, _ctx| async move {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok("too late".to_string())
                }),
                Vec::<String>::new(),
                HashMap::new(),
            )
            .await;
        let manager = Arc::new(HandoffManager::new(coord));

        let runner = manager.clone();
        let handle =
            tokio::spawn(async move { runner.handoff("user", "slow", "work", None, false).await });

        let active = loop {
            let active = manager.active_handoffs().await;
            if !active.is_empty() {
                break active;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        assert!(manager.cancel_handoff(&active[0].handoff_id).await);
        assert!(!manager.cancel_handoff(&active[0].handoff_id).await);

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("cancelled handoff should finish promptly")
            .unwrap();
        assert_eq!(result.status, HandoffStatus::Cancelled);
        assert!(result.final_agent.is_none());
    }

    #[test]
    fn test_context_serialization() {
        let mut ctx = HandoffContext::new("h1", "a", "b", "hello");
        ctx.add_message(Role::User, "hello", HashMap::new());
        ctx.shared_memory
            .insert("ticket".into(), serde_json::json!(42));

        let raw = ctx.serialize().unwrap();
        let restored = HandoffContext::deserialize(&raw).unwrap();
        assert_eq!(restored.handoff_id, "h1");
        assert_eq!(restored.last_message().unwrap().content, "hello");
        assert_eq!(restored.shared_memory["ticket"], 42);
        assert!(HandoffContext::deserialize("not json").is_err());
    }
}
