use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use async_trait::async_trait;
use serde_json::Value;
use crate::error::Result;
use crate::goal::Parameters;

/// A local implementation of one action
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Runs the action with already-resolved parameters
    async fn call(&self, parameters: Parameters) -> Result<Value>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ActionHandler for FnHandler<F>
where
    F: Fn(Parameters) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    async fn call(&self, parameters: Parameters) -> Result<Value> {
        (self.0)(parameters).await
    }
}

/// Explicit `persona -> action -> handler` table built at startup
///
/// Personas are matched case-insensitively.
#[derive(Clone, Default)]
pub struct CapabilityMap {
    handlers: HashMap<String, HashMap<String, Arc<dyn ActionHandler>>>,
}

impl CapabilityMap {
    /// Creates an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler, replacing any previous one for the same action
    pub fn register(&mut self, persona: &str, action: &str, handler: Arc<dyn ActionHandler>) -> &mut Self {
        self.handlers
            .entry(persona.to_lowercase())
            .or_default()
            .insert(action.to_string(), handler);
        self
    }

    /// Registers an async closure as a handler
    pub fn register_fn<F, Fut>(&mut self, persona: &str, action: &str, f: F) -> &mut Self
    where
        F: Fn(Parameters) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.register(persona, action, Arc::new(FnHandler(f)))
    }

    /// Handler for `action` under `persona`
    pub fn get(&self, persona: &str, action: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers
            .get(&persona.to_lowercase())
            .and_then(|actions| actions.get(action))
            .cloned()
    }

    /// Checks whether a handler exists
    pub fn contains(&self, persona: &str, action: &str) -> bool {
        self.get(persona, action).is_some()
    }

    /// Registered personas, sorted
    pub fn personas(&self) -> Vec<String> {
        let mut personas: Vec<String> = self.handlers.keys().cloned().collect();
        personas.sort();
        personas
    }

    /// Actions registered for a persona, sorted
    pub fn actions(&self, persona: &str) -> Vec<String> {
        let mut actions: Vec<String> = self
            .handlers
            .get(&persona.to_lowercase())
            .map(|a| a.keys().cloned().collect())
            .unwrap_or_default();
        actions.sort();
        actions
    }

    /// Copies the handlers of one persona into a new map
    pub fn for_persona(&self, persona: &str) -> CapabilityMap {
        let persona = persona.to_lowercase();
        let mut map = CapabilityMap::new();
        if let Some(actions) = self.handlers.get(&persona) {
            map.handlers.insert(persona, actions.clone());
        }
        map
    }
}
