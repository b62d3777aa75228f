//! Agent side of delegation
//!
//! A worker listens on its own mailbox, runs `task` messages through its
//! persona's handlers and answers with `task_result` or `task_failed`.

use std::sync::Arc;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};
use crate::capabilities::CapabilityMap;
use crate::channel::{Message, MessageBus, MessageHandler};
use crate::pool::{ScaleAction, ScaleEvent, ScaleHook};

/// Request type sent to workers
pub const TASK_MESSAGE: &str = "task";
/// Successful reply type
pub const TASK_RESULT: &str = "task_result";
/// Failed reply type
pub const TASK_FAILED: &str = "task_failed";

/// Executes delegated steps for one agent
pub struct Worker {
    name: String,
    persona: String,
    capabilities: CapabilityMap,
}

impl Worker {
    pub fn new(name: &str, persona: &str, capabilities: &CapabilityMap) -> Self {
        Self {
            name: name.to_string(),
            persona: persona.to_lowercase(),
            capabilities: capabilities.for_persona(persona),
        }
    }

    fn failure(error: String) -> Map<String, Value> {
        let mut payload = Map::new();
        payload.insert("status".into(), json!("failure"));
        payload.insert("error".into(), Value::String(error));
        payload
    }
}

#[async_trait]
impl MessageHandler for Worker {
    async fn handle(&self, bus: &MessageBus, message: Message) {
        if message.message_type() != TASK_MESSAGE {
            debug!(worker = %self.name, message_type = message.message_type(), "Ignoring message");
            return;
        }

        let action = message.payload().get("action").and_then(Value::as_str).unwrap_or_default();
        let parameters = message
            .payload()
            .get("parameters")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let (reply_type, payload) = match self.capabilities.get(&self.persona, action) {
            None => {
                warn!(worker = %self.name, action, "No handler for delegated action");
                (TASK_FAILED, Self::failure(format!("'{}' cannot perform '{}'", self.name, action)))
            }
            Some(handler) => match handler.call(parameters).await {
                Ok(result) => {
                    let mut payload = Map::new();
                    payload.insert("status".into(), json!("success"));
                    payload.insert("result".into(), result);
                    (TASK_RESULT, payload)
                }
                Err(e) => {
                    warn!(worker = %self.name, action, error = %e, "Delegated action failed");
                    (TASK_FAILED, Self::failure(e.to_string()))
                }
            },
        };

        if !bus.reply(&message, reply_type, payload).await {
            warn!(worker = %self.name, "Reply could not be delivered");
        }
    }
}

/// Starts a listener for `name` that serves `persona`'s handlers
///
/// Returns `false` if a listener for `name` already runs.
pub async fn spawn_worker(bus: &MessageBus, name: &str, persona: &str, capabilities: &CapabilityMap) -> bool {
    let spawned = bus.listen(name, Arc::new(Worker::new(name, persona, capabilities))).await;
    if spawned {
        info!(worker = name, persona, "Worker listening");
    }
    spawned
}

/// Keeps worker listeners in step with the autoscaler
pub struct WorkerAttacher {
    bus: MessageBus,
    capabilities: CapabilityMap,
}

impl WorkerAttacher {
    pub fn new(bus: MessageBus, capabilities: CapabilityMap) -> Self {
        Self { bus, capabilities }
    }
}

#[async_trait]
impl ScaleHook for WorkerAttacher {
    async fn on_scale(&self, event: &ScaleEvent) {
        match event.action {
            ScaleAction::Up => {
                spawn_worker(&self.bus, &event.agent, &event.persona, &self.capabilities).await;
            }
            ScaleAction::Down => {
                self.bus.unsubscribe(&event.agent).await;
            }
        }
    }
}
