use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};
use crate::error::{DispatchError, Result};
use crate::goal::ActionStep;

/// A learned composite action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Skill {
    /// Action name that triggers expansion
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Steps spliced in place of the triggering step
    pub action_sequence: Vec<ActionStep>,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_version() -> u32 {
    1
}

impl Skill {
    pub fn new(name: impl Into<String>, description: impl Into<String>, action_sequence: Vec<ActionStep>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            action_sequence,
            usage_count: 0,
            version: 1,
            created_at: Utc::now(),
        }
    }
}

/// Named skills available for expansion
#[derive(Debug, Default, Clone)]
pub struct SkillLibrary {
    skills: Arc<RwLock<HashMap<String, Skill>>>,
    reserved: Arc<HashSet<String>>,
}

impl SkillLibrary {
    /// Creates an empty library
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a library that refuses skills shadowing any of `actions`
    pub fn with_reserved<I, S>(actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            skills: Arc::default(),
            reserved: Arc::new(actions.into_iter().map(Into::into).collect()),
        }
    }

    /// Adds or replaces a skill; a replacement bumps the version
    pub async fn add_skill(&self, mut skill: Skill) -> Result<()> {
        if self.reserved.contains(&skill.name) {
            warn!(skill = %skill.name, "Refusing to shadow a built-in action");
            return Err(DispatchError::Message(format!(
                "skill '{}' would shadow a built-in action",
                skill.name
            )));
        }
        if skill.action_sequence.is_empty() {
            return Err(DispatchError::Message(format!("skill '{}' has no steps", skill.name)));
        }
        let mut skills = self.skills.write().await;
        if let Some(existing) = skills.get(&skill.name) {
            skill.version = existing.version + 1;
            skill.usage_count = existing.usage_count;
        }
        info!(skill = %skill.name, version = skill.version, steps = skill.action_sequence.len(), "Learned skill");
        skills.insert(skill.name.clone(), skill);
        Ok(())
    }

    /// Snapshot of a skill
    pub async fn get(&self, name: &str) -> Option<Skill> {
        self.skills.read().await.get(name).cloned()
    }

    /// Checks whether `name` is a skill
    pub async fn is_skill(&self, name: &str) -> bool {
        self.skills.read().await.contains_key(name)
    }

    /// Steps of `name`, counting the use
    pub async fn expand(&self, name: &str) -> Option<Vec<ActionStep>> {
        let mut skills = self.skills.write().await;
        let skill = skills.get_mut(name)?;
        skill.usage_count += 1;
        Some(skill.action_sequence.clone())
    }

    /// Skill names, sorted
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.skills.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Loads skills from a JSON array file
    pub async fn load_json(&self, path: &Path) -> Result<usize> {
        let content = tokio::fs::read_to_string(path).await?;
        let loaded: Vec<Skill> = serde_json::from_str(&content)?;
        let count = loaded.len();
        for skill in loaded {
            self.add_skill(skill).await?;
        }
        Ok(count)
    }

    /// Writes every skill to a JSON array file
    pub async fn save_json(&self, path: &Path) -> Result<()> {
        let mut skills: Vec<Skill> = self.skills.read().await.values().cloned().collect();
        skills.sort_by(|a, b| a.name.cmp(&b.name));
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, serde_json::to_string_pretty(&skills)?).await?;
        Ok(())
    }
}
