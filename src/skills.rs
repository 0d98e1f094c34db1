//! Skill registry with two-phase system-prompt composition.
//!
//! A [`Skill`] is a named bundle of extra prompt instructions loaded in two
//! phases:
//!
//! - **Phase 1**: every registered, non-disabled skill contributes a single
//!   `- name: description` line so the model knows it exists.
//! - **Phase 2**: activated skills additionally inject their full
//!   `instructions` as a `## Skill:` section.
//!
//! [`SkillRegistry::compose`] rebuilds the prompt from scratch on every
//! call; for a fixed (base, registered, active) state the output is
//! byte-identical. Skills are iterated in registration order in both
//! phases, which is what makes composition deterministic and keeps the
//! cached prompt prefix stable across turns.

use crate::{Error, Result};

/// A named bundle of system-prompt instructions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Skill {
    /// Unique name.
    pub name: String,

    /// Short description injected in Phase 1.
    pub description: String,

    /// Full instructions injected in Phase 2 once activated.
    pub instructions: String,

    /// When true the skill is hidden from Phase 1 entirely.
    pub disable_model_invocation: bool,
}

impl Skill {
    /// Creates a model-invocable skill.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        instructions: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            instructions: instructions.into(),
            disable_model_invocation: false,
        }
    }

    /// Hides the skill from Phase 1.
    pub fn hidden(mut self) -> Self {
        self.disable_model_invocation = true;
        self
    }
}

/// Registry managing skill registration, activation and prompt composition.
#[derive(Debug, Clone, Default)]
pub struct SkillRegistry {
    // Registration order is the iteration order for both phases.
    skills: Vec<Skill>,
    active: Vec<String>,
}

impl SkillRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a skill.
    ///
    /// # Errors
    ///
    /// Duplicate names are a configuration error.
    pub fn register(&mut self, skill: Skill) -> Result<()> {
        if self.skills.iter().any(|s| s.name == skill.name) {
            return Err(Error::config(format!(
                "skill '{}' is already registered",
                skill.name
            )));
        }
        log::info!("skill registered: {}", skill.name);
        self.skills.push(skill);
        Ok(())
    }

    /// Activates a skill so Phase 2 injects its instructions.
    ///
    /// # Errors
    ///
    /// Fails when the skill is not registered.
    pub fn activate(&mut self, name: &str) -> Result<()> {
        if !self.skills.iter().any(|s| s.name == name) {
            return Err(Error::invalid_input(format!("unknown skill '{name}'")));
        }
        if !self.active.iter().any(|n| n == name) {
            self.active.push(name.to_string());
            log::info!("skill activated: {name}");
        }
        Ok(())
    }

    /// Deactivates a skill. Unknown names are a no-op.
    pub fn deactivate(&mut self, name: &str) {
        self.active.retain(|n| n != name);
    }

    /// Names of all registered skills, in registration order.
    pub fn list(&self) -> Vec<&str> {
        self.skills.iter().map(|s| s.name.as_str()).collect()
    }

    /// Names of currently active skills.
    pub fn list_active(&self) -> Vec<&str> {
        self.active.iter().map(String::as_str).collect()
    }

    /// Looks up a skill by name.
    pub fn get(&self, name: &str) -> Option<&Skill> {
        self.skills.iter().find(|s| s.name == name)
    }

    /// The Phase-1 description list, or an empty string when no skill is
    /// visible.
    fn descriptions(&self) -> String {
        let visible: Vec<&Skill> = self
            .skills
            .iter()
            .filter(|s| !s.disable_model_invocation)
            .collect();
        if visible.is_empty() {
            return String::new();
        }

        let mut lines = vec!["Available Skills:".to_string()];
        for skill in visible {
            lines.push(format!("- {}: {}", skill.name, skill.description));
        }
        lines.join("\n")
    }

    /// Composes the full system prompt: base, Phase-1 description list,
    /// then one `## Skill:` section per active skill.
    ///
    /// Stateless with respect to prior calls; an empty registry returns
    /// the base prompt unchanged.
    pub fn compose(&self, base_prompt: &str) -> String {
        if self.skills.is_empty() {
            return base_prompt.to_string();
        }

        let mut prompt = base_prompt.to_string();

        let descriptions = self.descriptions();
        if !descriptions.is_empty() {
            prompt.push_str("\n\n");
            prompt.push_str(&descriptions);
        }

        // Registration order, not activation order, so re-activating a
        // skill cannot reshuffle the composed prompt.
        for skill in &self.skills {
            if self.active.iter().any(|n| n == &skill.name) {
                prompt.push_str(&format!(
                    "\n\n## Skill: {}\n\n{}",
                    skill.name, skill.instructions
                ));
            }
        }

        prompt
    }
}
