//! Prompt profiles
//!
//! A profile is the set of textual conventions that make a rendered chat
//! legible to one model family: role labels, stop markers, instructions,
//! section labels and a few seed exchanges. Profiles are plain data; the
//! family-specific values live in [`registry`].
//!
//! Two renderings exist:
//! - `initial_prompt` for a fresh process (instructions, seeds, full history)
//! - `interaction_prompt` for feeding the next turn into a warm process

mod registry;

pub use registry::{ProfileKind, PROFILE_KEYWORDS};

use crate::{Message, Role};
use std::collections::HashMap;
use std::path::Path;

/// Line continuation understood by llama.cpp's interactive input
pub const CONTINUATION: &str = "\\\n";

/// How the stream decoder recognises the end of the echoed prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoBoundary {
    /// Echo is over once the output is longer than the prompt
    PromptLength,
    /// Echo is over once the prompt occurs more often than its quoted form
    /// (engines that also mention `'<prompt>'` in diagnostic lines)
    OccurrenceCount,
}

/// Textual conventions for one model family
#[derive(Debug, Clone)]
pub struct PromptProfile {
    pub kind: ProfileKind,
    /// Prepended to every rendered message, e.g. `###`
    pub chat_prefix: String,
    pub role_labels: HashMap<Role, String>,
    /// Exact-match literals that end the assistant turn
    pub stop_markers: Vec<String>,
    /// None means the default instructions built from the labels
    pub instructions: Option<String>,
    /// Line placed above the instructions
    pub preamble_prefix: String,
    pub history_label: String,
    pub response_label: String,
    pub uses_newline_continuation: bool,
    pub seed_exchanges: Vec<Message>,
    pub echo_boundary: EchoBoundary,
}

impl PromptProfile {
    /// Select the profile for a model file by keyword
    pub fn for_model(model_path: &Path) -> Self {
        ProfileKind::detect(model_path).profile()
    }

    /// Display label for a role; unknown roles get the assistant label
    pub fn label(&self, role: Role) -> &str {
        self.role_labels
            .get(&role)
            .or_else(|| self.role_labels.get(&Role::Assistant))
            .map(String::as_str)
            .unwrap_or("assistant")
    }

    /// Instructions block, falling back to the label-aware default
    pub fn instructions(&self) -> String {
        match &self.instructions {
            Some(text) => text.clone(),
            None => default_instructions(&self.role_labels),
        }
    }

    /// `[prefix ]label[ (name)]:<ws>content`
    pub fn render_message(&self, message: &Message, newline: bool) -> String {
        let whitespace = if newline { CONTINUATION } else { " " };
        let prefix = if self.chat_prefix.is_empty() {
            String::new()
        } else {
            format!("{} ", self.chat_prefix)
        };
        let name = message
            .name
            .as_deref()
            .filter(|n| !n.is_empty())
            .map(|n| format!(" ({})", n))
            .unwrap_or_default();

        format!(
            "{}{}{}:{}{}",
            prefix,
            self.label(message.role),
            name,
            whitespace,
            message.content
        )
    }

    pub fn render_messages(&self, messages: &[Message], newline: bool) -> String {
        messages
            .iter()
            .map(|m| self.render_message(m, newline))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Empty assistant turn the model continues from
    pub fn assistant_opening(&self) -> String {
        self.render_message(&Message::assistant(""), self.uses_newline_continuation)
    }

    /// Full prompt for a freshly launched process
    pub fn initial_prompt(&self, prior: &[Message], last: &[Message]) -> String {
        let newline = self.uses_newline_continuation;

        let mut head = String::new();
        if !self.preamble_prefix.is_empty() {
            head.push_str(&self.preamble_prefix);
            head.push('\n');
        }
        head.push_str(&self.instructions());

        let mut lines = Vec::new();
        if !self.history_label.is_empty() {
            lines.push(self.history_label.clone());
        }
        lines.extend(self.seed_exchanges.iter().map(|m| self.render_message(m, newline)));
        lines.extend(prior.iter().map(|m| self.render_message(m, newline)));
        lines.extend(last.iter().map(|m| self.render_message(m, newline)));
        if !self.response_label.is_empty() {
            lines.push(String::new());
            lines.push(self.response_label.clone());
        }
        lines.push(self.assistant_opening());

        let body = lines.join("\n");
        if head.trim().is_empty() {
            body
        } else {
            format!("{}\n\n{}", head, body)
        }
    }

    /// Short prompt written to a warm interactive process.
    ///
    /// Ends with the bare assistant label and a newline so the engine
    /// submits the input.
    pub fn interaction_prompt(&self, last: &[Message]) -> String {
        let mut prompt = String::new();
        prompt.push_str(&self.history_label);
        prompt.push_str(CONTINUATION);
        prompt.push_str(&self.render_messages(last, self.uses_newline_continuation));
        prompt.push_str(CONTINUATION);
        if !self.response_label.is_empty() {
            prompt.push_str(CONTINUATION);
            prompt.push_str(&self.response_label);
            prompt.push_str(CONTINUATION);
        }
        prompt.push_str(self.assistant_opening().trim_end_matches(' '));
        prompt.push('\n');
        prompt
    }

    /// Split a single rendered message back into a [`Message`].
    ///
    /// Labels are matched longest first so `ASSISTANT` never shadows a
    /// longer label sharing its prefix.
    pub fn parse_message(&self, rendered: &str) -> Option<Message> {
        let mut rest = rendered;
        if !self.chat_prefix.is_empty() {
            rest = rest.strip_prefix(&self.chat_prefix)?.strip_prefix(' ')?;
        }

        let mut labels: Vec<(&Role, &String)> = self.role_labels.iter().collect();
        labels.sort_by(|a, b| b.1.len().cmp(&a.1.len()));
        let (role, after_label) = labels
            .into_iter()
            .find_map(|(role, label)| rest.strip_prefix(label.as_str()).map(|r| (*role, r)))?;

        let (name, after_name) = match after_label.strip_prefix(" (") {
            Some(named) => {
                let close = named.find("):")?;
                (Some(named[..close].to_string()), &named[close + 1..])
            }
            None => (None, after_label),
        };

        let after_colon = after_name.strip_prefix(':')?;
        let content = after_colon
            .strip_prefix(CONTINUATION)
            .or_else(|| after_colon.strip_prefix(' '))?;

        Some(Message {
            role,
            content: content.to_string(),
            name,
        })
    }
}

/// Instructions used when a profile supplies none
pub fn default_instructions(labels: &HashMap<Role, String>) -> String {
    let get = |role: Role, fallback: &'static str| {
        labels
            .get(&role)
            .or_else(|| labels.get(&Role::Assistant))
            .map(String::as_str)
            .unwrap_or(fallback)
            .to_string()
    };

    format!(
        "Complete the following chat conversation between the {} and the {}. {} messages should be strictly followed as additional instructions.",
        get(Role::User, "user"),
        get(Role::Assistant, "assistant"),
        get(Role::System, "system"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversation() -> (Vec<Message>, Vec<Message>) {
        (
            vec![
                Message::system("You are terse."),
                Message::user("Name a colour."),
                Message::assistant("Blue."),
            ],
            vec![Message::user("Another one?")],
        )
    }

    #[test]
    fn test_every_message_rendered_once_in_order() {
        let (prior, last) = conversation();
        for (_, kind) in PROFILE_KEYWORDS.iter().chain([("", ProfileKind::Default)].iter()) {
            let profile = kind.profile();
            let prompt = profile.initial_prompt(&prior, &last);

            let mut cursor = 0;
            for message in prior.iter().chain(last.iter()) {
                assert_eq!(prompt.matches(&message.content).count(), 1, "{:?}", kind);
                let rendered = profile.render_message(message, profile.uses_newline_continuation);
                let at = prompt[cursor..]
                    .find(&rendered)
                    .unwrap_or_else(|| panic!("{:?}: {:?} missing or out of order", kind, rendered));
                cursor += at + rendered.len();
            }
            assert!(prompt.ends_with(&profile.assistant_opening()));
        }
    }

    #[test]
    fn test_default_initial_prompt_layout() {
        let profile = ProfileKind::Default.profile();
        let prompt = profile.initial_prompt(&[], &[Message::user("Hi")]);

        assert_eq!(
            prompt,
            "Complete the following chat conversation between the user and the assistant. \
             system messages should be strictly followed as additional instructions.\n\n\
             system: You are a helpful assistant.\n\
             user: How are you?\n\
             assistant: Hi, how may I help you today?\n\
             user: Hi\n\
             assistant: "
        );
    }

    #[test]
    fn test_default_instructions_use_profile_labels() {
        let profile = ProfileKind::Vicuna.profile();
        assert_eq!(
            profile.instructions(),
            "Complete the following chat conversation between the Human and the Assistant. \
             System messages should be strictly followed as additional instructions."
        );
    }

    #[test]
    fn test_unknown_role_falls_back_to_assistant_label() {
        let profile = ProfileKind::Dante.profile();
        // Dante has no system label
        assert_eq!(profile.label(Role::System), "[AI]");
        assert_eq!(profile.label(Role::Unknown), "[AI]");
        assert_eq!(profile.label(Role::User), "[HM]");
    }

    #[test]
    fn test_chat_prefix_and_name() {
        let profile = ProfileKind::Vicuna.profile();
        let line = profile.render_message(&Message::user("hello").with_name("ann"), false);
        assert_eq!(line, "### Human (ann): hello");
    }

    #[test]
    fn test_name_round_trip() {
        for kind in [ProfileKind::Default, ProfileKind::Vicuna, ProfileKind::RedPajama] {
            let profile = kind.profile();
            let original = Message::user("a: b (c) \\ d").with_name("Zoe");
            for newline in [false, true] {
                let rendered = profile.render_message(&original, newline);
                assert!(rendered.contains(&format!("{} (Zoe):", profile.label(Role::User))));
                assert_eq!(profile.parse_message(&rendered), Some(original.clone()));
            }
        }
    }

    #[test]
    fn test_interaction_prompt() {
        let profile = ProfileKind::Default.profile();
        let prompt = profile.interaction_prompt(&[Message::user("Next")]);
        assert_eq!(prompt, "\\\nuser: Next\\\nassistant:\n");

        let alpaca = ProfileKind::Alpaca.profile();
        let prompt = alpaca.interaction_prompt(&[Message::user("Next")]);
        assert_eq!(
            prompt,
            "### Inputs\\\nuser: Next\\\n\\\n### Response\\\nassistant:\n"
        );
    }

    #[test]
    fn test_interaction_prompt_has_no_space_before_submit() {
        let dante = ProfileKind::Dante.profile();
        let prompt = dante.interaction_prompt(&[Message::user("Next")]);
        assert!(prompt.ends_with("[AI]:\n"), "{:?}", prompt);
        assert!(!prompt.contains(" \n"));
    }

    #[test]
    fn test_newline_continuation_style() {
        let mut profile = ProfileKind::Default.profile();
        profile.uses_newline_continuation = true;
        assert_eq!(
            profile.render_message(&Message::user("x"), true),
            "user:\\\nx"
        );
        assert!(profile.interaction_prompt(&[Message::user("x")]).ends_with("assistant:\\\n\n"));
    }

    #[test]
    fn test_sections_with_labels() {
        let profile = ProfileKind::Alpaca.profile();
        let prompt = profile.initial_prompt(&[], &[Message::user("Hi")]);
        let inputs = prompt.find("### Inputs\n").unwrap();
        let response = prompt.find("\n\n### Response\nassistant: ").unwrap();
        assert!(inputs < response);
        assert!(prompt.starts_with("Below is an instruction"));
    }
}
