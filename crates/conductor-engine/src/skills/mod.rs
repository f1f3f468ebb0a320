pub mod loader;

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use tracing::debug;

use crate::error::EngineError;

/// A named, triggerable prompt template.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Skill {
    pub name: String,
    pub description: String,
    /// Case-insensitive regex matched against user input.
    pub trigger: Option<String>,
    /// Body with `{{var}}` placeholders.
    pub template: String,
    /// Front-matter keys beyond name/description/trigger.
    pub frontmatter: BTreeMap<String, String>,
}

impl Skill {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        template: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            trigger: None,
            template: template.into(),
            frontmatter: BTreeMap::new(),
        }
    }

    pub fn with_trigger(mut self, trigger: impl Into<String>) -> Self {
        self.trigger = Some(trigger.into());
        self
    }

    /// Substitute `{{var}}` placeholders. Unknown placeholders are left as-is.
    pub fn render(&self, vars: &HashMap<&str, &str>) -> String {
        let mut out = String::with_capacity(self.template.len());
        let mut rest = self.template.as_str();

        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find("}}") else {
                out.push_str(&rest[start..]);
                return out;
            };
            let key = after[..end].trim();
            match vars.get(key) {
                Some(value) => out.push_str(value),
                None => out.push_str(&rest[start..start + 2 + end + 2]),
            }
            rest = &after[end + 2..];
        }
        out.push_str(rest);
        out
    }

    pub fn render_input(&self, input: &str) -> String {
        self.render(&HashMap::from([("input", input)]))
    }
}

/// Ordered set of skills with unique names.
#[derive(Clone, Debug, Default)]
pub struct SkillSet {
    skills: Vec<Skill>,
}

impl SkillSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert unless a skill with the same name exists. Returns whether it
    /// was added.
    pub fn insert(&mut self, skill: Skill) -> bool {
        if self.skills.iter().any(|s| s.name == skill.name) {
            debug!(skill = %skill.name, "duplicate skill name ignored");
            return false;
        }
        self.skills.push(skill);
        true
    }

    /// Combine several sources. The first skill seen under a name wins.
    pub fn merge<I>(sources: I) -> Self
    where
        I: IntoIterator,
        I::Item: IntoIterator<Item = Skill>,
    {
        let mut set = Self::new();
        for source in sources {
            for skill in source {
                set.insert(skill);
            }
        }
        set
    }

    pub fn get(&self, name: &str) -> Result<&Skill, EngineError> {
        self.skills
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| EngineError::SkillNotFound(name.to_string()))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Skill> {
        self.skills.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.skills.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }
}

impl FromIterator<Skill> for SkillSet {
    fn from_iter<T: IntoIterator<Item = Skill>>(iter: T) -> Self {
        Self::merge([iter.into_iter().collect::<Vec<_>>()])
    }
}

impl<'a> IntoIterator for &'a SkillSet {
    type Item = &'a Skill;
    type IntoIter = std::slice::Iter<'a, Skill>;

    fn into_iter(self) -> Self::IntoIter {
        self.skills.iter()
    }
}
