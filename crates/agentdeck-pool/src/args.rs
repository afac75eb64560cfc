use std::collections::HashMap;

use crate::profiles;

/// Prefix of the per-type override variables, e.g. `AGENTDECK_AGENT_ARGS_CODEX`.
pub const ENV_PREFIX: &str = "AGENTDECK_AGENT_ARGS_";

/// Token replaced by the message inside an argument template.
pub const MESSAGE_PLACEHOLDER: &str = "{message}";

/// Per-type argument templates for one-shot batch calls.
///
/// A template is a whitespace-separated argument list. Every token that
/// contains `{message}` has it substituted; with no placeholder anywhere the
/// message is appended as the last argument. Types without a template use
/// the built-in defaults from [`profiles`].
#[derive(Debug, Clone, Default)]
pub struct ArgTemplates {
    templates: HashMap<String, String>,
}

impl ArgTemplates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `AGENTDECK_AGENT_ARGS_<TYPE>` variable from the environment.
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars<I>(vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let templates = vars
            .into_iter()
            .filter_map(|(key, value)| {
                let kind = key.strip_prefix(ENV_PREFIX)?;
                let value = value.trim();
                if kind.is_empty() || value.is_empty() {
                    return None;
                }
                Some((kind.to_ascii_lowercase(), value.to_string()))
            })
            .collect();
        Self { templates }
    }

    pub fn with_override(mut self, kind: &str, template: impl Into<String>) -> Self {
        self.templates.insert(kind.to_ascii_lowercase(), template.into());
        self
    }

    pub fn get(&self, kind: &str) -> Option<&str> {
        self.templates
            .get(&kind.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Arguments for a batch call of `kind` carrying `message`.
    pub fn build(&self, kind: &str, message: &str) -> Vec<String> {
        let Some(template) = self.get(kind) else {
            return profiles::default_batch_args(kind, message);
        };

        let mut substituted = false;
        let mut args: Vec<String> = template
            .split_whitespace()
            .map(|token| {
                if token.contains(MESSAGE_PLACEHOLDER) {
                    substituted = true;
                    token.replace(MESSAGE_PLACEHOLDER, message)
                } else {
                    token.to_string()
                }
            })
            .collect();
        if !substituted {
            args.push(message.to_string());
        }
        args
    }
}
