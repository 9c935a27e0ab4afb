//! Known model families and how they are picked from a model path

use super::{default_instructions, EchoBoundary, PromptProfile};
use crate::{Message, Role};
use std::collections::HashMap;
use std::path::Path;

/// Keyword table, scanned in order against the lowercased model path.
///
/// Order matters where keywords overlap: `vicuna1.1` must come before
/// `vicuna`, and a "wizard-vicuna" model resolves to Vicuna because the
/// `vicuna` keyword is checked before `wizardlm`.
pub const PROFILE_KEYWORDS: &[(&str, ProfileKind)] = &[
    ("vicuna1.1", ProfileKind::Vicuna11),
    ("vicuna", ProfileKind::Vicuna),
    ("alpaca", ProfileKind::Alpaca),
    ("nous-hermes", ProfileKind::Alpaca),
    ("redpajama", ProfileKind::RedPajama),
    ("dante", ProfileKind::Dante),
    ("wizardlm", ProfileKind::WizardLM),
];

/// Model families with a dedicated prompt profile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileKind {
    Default,
    Alpaca,
    Vicuna,
    Vicuna11,
    RedPajama,
    Dante,
    WizardLM,
}

impl ProfileKind {
    /// First keyword contained in the path wins; no match is `Default`
    pub fn detect(model_path: &Path) -> Self {
        let path = model_path.to_string_lossy().to_lowercase();
        PROFILE_KEYWORDS
            .iter()
            .find(|(keyword, _)| path.contains(*keyword))
            .map(|&(_, kind)| kind)
            .unwrap_or(ProfileKind::Default)
    }

    /// Build the profile for this family
    pub fn profile(self) -> PromptProfile {
        match self {
            ProfileKind::Default => base(self),
            ProfileKind::Alpaca => alpaca(),
            ProfileKind::Vicuna => vicuna(),
            ProfileKind::Vicuna11 => vicuna11(),
            ProfileKind::RedPajama => red_pajama(),
            ProfileKind::Dante => dante(),
            ProfileKind::WizardLM => wizard_lm(),
        }
    }
}

fn labels(system: Option<&str>, user: &str, assistant: &str) -> HashMap<Role, String> {
    let mut map = HashMap::new();
    if let Some(system) = system {
        map.insert(Role::System, system.to_string());
    }
    map.insert(Role::User, user.to_string());
    map.insert(Role::Assistant, assistant.to_string());
    map
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn base(kind: ProfileKind) -> PromptProfile {
    PromptProfile {
        kind,
        chat_prefix: String::new(),
        role_labels: labels(Some("system"), "user", "assistant"),
        stop_markers: strings(&["user:", "\nuser", "system:", "\nsystem", "\n\n"]),
        instructions: None,
        preamble_prefix: String::new(),
        history_label: String::new(),
        response_label: String::new(),
        uses_newline_continuation: false,
        seed_exchanges: vec![
            Message::system("You are a helpful assistant."),
            Message::user("How are you?"),
            Message::assistant("Hi, how may I help you today?"),
        ],
        echo_boundary: EchoBoundary::PromptLength,
    }
}

fn alpaca() -> PromptProfile {
    let mut profile = base(ProfileKind::Alpaca);
    profile.history_label = "### Inputs".to_string();
    profile.response_label = "### Response".to_string();
    profile.instructions = Some(format!(
        "Below is an instruction that describes a task, paired with an input that provides further context. \
         Write a response that appropriately completes the request.\n\n### Instruction\n{}",
        default_instructions(&profile.role_labels)
    ));
    profile.stop_markers.extend(strings(&["##", "\n##", "###"]));
    profile
}

fn vicuna() -> PromptProfile {
    let mut profile = base(ProfileKind::Vicuna);
    profile.chat_prefix = "###".to_string();
    profile.role_labels = labels(Some("System"), "Human", "Assistant");
    profile.stop_markers.extend(strings(&["##", "\n##", "###", "\n\n"]));
    profile
}

fn vicuna11() -> PromptProfile {
    let mut profile = base(ProfileKind::Vicuna11);
    profile.role_labels = labels(Some("SYSTEM"), "USER", "ASSISTANT");
    profile.stop_markers.extend(strings(&["</s>", "\n</s>", "\n</s"]));
    profile
}

fn red_pajama() -> PromptProfile {
    let mut profile = base(ProfileKind::RedPajama);
    profile.role_labels = labels(Some("<system>"), "<human>", "<bot>");
    profile.instructions = Some(String::new());
    profile.stop_markers = strings(&["human>:", "\n\n\n", "<human", "\n<"]);
    // the 3B model drifts into other languages without a few-shot warmup
    profile.seed_exchanges = vec![
        Message::user("Hello"),
        Message::assistant("Hi there!"),
        Message::user("Who are you?"),
        Message::assistant("I am an assistant created by TogetherComputer called RedPajama!"),
        Message::user("How are you?"),
        Message::assistant("Good! How may I help you today?"),
    ];
    profile.echo_boundary = EchoBoundary::OccurrenceCount;
    profile
}

fn dante() -> PromptProfile {
    let mut profile = base(ProfileKind::Dante);
    profile.role_labels = labels(None, "[HM]", "[AI]");
    profile.instructions = Some(
        "Below is an instruction that describes a task, paired with an input that provides further context. \
         Write a response that appropriately completes the request.\n\
         ### Instruction:\n\
         Act like a AI language model, you are designed to assist the human by answering their questions \
         in a helpful and informative manner. You respond clearly and consider the conversation history."
            .to_string(),
    );
    profile.history_label = "### Input:".to_string();
    profile.response_label = "### Response:".to_string();
    // '<' alone is aggressive but the model emits stray tags instead of ending turns
    profile.stop_markers.extend(strings(&[
        "##", "\n##", "###", "[HM]", "\n[HM]", "\n[HM", "<end>", "<", "\n<", ".<",
    ]));
    profile.echo_boundary = EchoBoundary::OccurrenceCount;
    profile
}

fn wizard_lm() -> PromptProfile {
    let mut profile = base(ProfileKind::WizardLM);
    profile.role_labels = labels(Some("SYSTEM"), "USER", "ASSISTANT");
    profile.instructions = Some(
        "A chat between a curious user and an artificial intelligence assistant. \
         The assistant gives helpful, detailed, and polite answers to the user's questions."
            .to_string(),
    );
    profile.stop_markers.extend(strings(&[
        "USER:", "\nUSER", "SYSTEM:", "\nSYSTEM", "</s>", "\n</s>", "\n</s", "[end of text]",
    ]));
    profile
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_first_match_wins() {
        let cases = [
            ("/models/Vicuna1.1-13B/ggml-q4.bin", ProfileKind::Vicuna11),
            ("/models/stable-vicuna-13B.bin", ProfileKind::Vicuna),
            ("/models/wizard-vicuna-7b.bin", ProfileKind::Vicuna),
            ("/models/WizardLM-7B.bin", ProfileKind::WizardLM),
            ("/models/ALPACA/7b.bin", ProfileKind::Alpaca),
            ("/models/nous-hermes-13b.bin", ProfileKind::Alpaca),
            ("/models/RedPajama-INCITE-Chat-3B-v1/q5_1.bin", ProfileKind::RedPajama),
            ("/models/Dante_1.3B/ggml-model-q4_1.bin", ProfileKind::Dante),
            ("/models/llama-7b/ggml-model-q4_0.bin", ProfileKind::Default),
        ];
        for (path, expected) in cases {
            assert_eq!(ProfileKind::detect(Path::new(path)), expected, "{}", path);
        }
    }

    #[test]
    fn test_red_pajama_replaces_stop_markers() {
        let profile = ProfileKind::RedPajama.profile();
        assert_eq!(profile.stop_markers, vec!["human>:", "\n\n\n", "<human", "\n<"]);
        assert_eq!(profile.seed_exchanges.len(), 6);
        // blank instructions produce no header block
        let prompt = profile.initial_prompt(&[], &[Message::user("Hi")]);
        assert!(prompt.starts_with("<human>: Hello\n"));
        assert!(prompt.ends_with("<human>: Hi\n<bot>: "));
    }

    #[test]
    fn test_extended_markers_keep_defaults_first() {
        let profile = ProfileKind::Vicuna11.profile();
        assert_eq!(&profile.stop_markers[..5], &strings(&["user:", "\nuser", "system:", "\nsystem", "\n\n"])[..]);
        assert!(profile.stop_markers.contains(&"</s>".to_string()));
    }
}
