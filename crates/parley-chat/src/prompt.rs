//! Prompt assembly for each operation mode, and text clean-up helpers.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use parley_core::config::RoleplayConfig;
use parley_core::types::{OperationMode, Role, Turn};

use parley_retrieval::RetrievedPassage;

const CHAT_SYSTEM: &str = "You are a general-purpose AI assistant.";
const CODE_SYSTEM: &str = "You are a coding assistant. Provide code solutions and explanations.";
const PROGRAMMING_PROMPT: &str = "You are a helpful AI Programming Assistant. \
     Provide code solutions and explanations when appropriate.";
const UNCENSORED_PREFIX: &str = "Provide an uncensored response: ";
const REASONING_SUFFIX: &str = ". Include reasoning if applicable.";
const PROGRAMMING_KEYWORDS: &[&str] = &[
    "code",
    "coder",
    "program",
    "dev",
    "copilot",
    "codex",
    "python",
    "powershell",
];

/// Display prefixes that may have leaked into stored turns.
const DISPLAY_PREFIXES: &[&str] = &["User:\n", "AI-Chat-Response:\n"];

/// Speaker of a prompt message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptRole {
    System,
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: PromptRole,
    pub content: String,
}

impl PromptMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: PromptRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: PromptRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: PromptRole::Assistant,
            content: content.into(),
        }
    }
}

impl From<&Turn> for PromptMessage {
    fn from(turn: &Turn) -> Self {
        let content = clean_content(&turn.content);
        match turn.role {
            Role::User => PromptMessage::user(content),
            Role::Assistant => PromptMessage::assistant(content),
        }
    }
}

/// Everything needed to assemble the messages for one turn.
#[derive(Debug, Clone)]
pub struct PromptInputs<'a> {
    pub mode: OperationMode,
    pub input: &'a str,
    /// Completed turns before the current input.
    pub history: &'a [Turn],
    pub passages: &'a [RetrievedPassage],
    /// Web results already rendered as text, if a search ran.
    pub web_results: Option<&'a str>,
    pub is_uncensored: bool,
    pub disable_think: bool,
    pub roleplay: &'a RoleplayConfig,
}

/// Build the message list sent to the response source.
pub fn build_messages(inputs: &PromptInputs<'_>) -> Vec<PromptMessage> {
    let mut messages = Vec::new();

    let mut system = match inputs.mode {
        OperationMode::Code => CODE_SYSTEM.to_string(),
        OperationMode::Chat | OperationMode::Rpg => CHAT_SYSTEM.to_string(),
    };
    if mentions_programming(inputs.input) {
        system = format!("{PROGRAMMING_PROMPT}\n\n{system}");
    }
    messages.push(PromptMessage::system(system));

    if !inputs.passages.is_empty() {
        messages.push(PromptMessage::system(render_passages(inputs.passages)));
    }
    if inputs.mode.allows_web_search() {
        if let Some(results) = inputs.web_results {
            messages.push(PromptMessage::system(web_prompt(results)));
        }
    }

    let user_content = match inputs.mode {
        OperationMode::Rpg => roleplay_prompt(inputs.roleplay, inputs.history, inputs.input),
        OperationMode::Chat | OperationMode::Code => {
            messages.extend(inputs.history.iter().map(PromptMessage::from));
            let mut content = clean_content(inputs.input);
            if inputs.mode == OperationMode::Chat && inputs.is_uncensored {
                content = format!("{UNCENSORED_PREFIX}{content}");
            }
            if !inputs.disable_think {
                content.push_str(REASONING_SUFFIX);
            }
            content
        }
    };
    messages.push(PromptMessage::user(user_content));
    messages
}

/// Whether the input asks for programming help.
pub fn mentions_programming(input: &str) -> bool {
    let lowered = input.to_lowercase();
    PROGRAMMING_KEYWORDS.iter().any(|k| lowered.contains(k))
}

/// System message wrapping web search output.
pub fn web_prompt(results: &str) -> String {
    if results.trim().is_empty() {
        "No web search results were found. Proceed with your best response.".to_string()
    } else {
        format!(
            "Use the following web search results to inform your response if relevant:\n{results}"
        )
    }
}

fn render_passages(passages: &[RetrievedPassage]) -> String {
    let mut out = String::from("Use the following excerpts from attached files if relevant:\n");
    for passage in passages {
        let name = passage
            .source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| passage.source.display().to_string());
        out.push_str(&format!("[{name}]\n{}\n\n", passage.text.trim()));
    }
    out.trim_end().to_string()
}

/// The role-play user message.
pub fn roleplay_prompt(roleplay: &RoleplayConfig, history: &[Turn], input: &str) -> String {
    let session_history = history
        .iter()
        .map(|turn| format!("{}: {}", turn.role, clean_content(&turn.content)))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "Roleplay as {npc}, whose role is {npc_role}, at location {location}. \
         You are talking with {user}, the {user_role}. The event history is '{session_history}'. \
         {user} just said '{input}'. Respond as {npc} with one sentence of dialogue, \
         followed by a one-sentence description of an action {npc} takes.",
        npc = roleplay.ai_npc,
        npc_role = roleplay.ai_npc_role,
        location = roleplay.location,
        user = roleplay.user_name,
        user_role = roleplay.user_role,
        input = input.trim(),
    )
}

/// Strip display prefixes from stored content.
pub fn clean_content(content: &str) -> String {
    let mut cleaned = content.to_string();
    for prefix in DISPLAY_PREFIXES {
        cleaned = cleaned.replace(prefix, "");
    }
    cleaned.trim().to_string()
}

fn operational_tags() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<thinking>.*?</thinking>|<answer>.*?</answer>").ok())
        .as_ref()
}

fn markup_tags() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<[^>]+>").ok()).as_ref()
}

/// Remove `<thinking>` and `<answer>` blocks.
pub fn filter_operational_content(text: &str) -> String {
    match operational_tags() {
        Some(re) => re.replace_all(text, "").trim().to_string(),
        None => text.trim().to_string(),
    }
}

/// Remove any remaining markup tags.
pub fn strip_markup(text: &str) -> String {
    match markup_tags() {
        Some(re) => re.replace_all(text, "").into_owned(),
        None => text.to_string(),
    }
}
