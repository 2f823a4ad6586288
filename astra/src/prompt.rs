//! Prompt assembly and context-window budgeting

use crate::error::{Error, Result};
use crate::memory::MemoryItem;
use crate::message::{Message, PromptMessage, Role};
use crate::persona::PersonaSettings;

/// Prefix marking an assistant message that holds a failure
pub const WARNING_MARKER: &str = "⚠️";

/// Rough per-message framing overhead of chat templates
const MESSAGE_OVERHEAD_TOKENS: u32 = 4;

/// Content of an assistant message replaced by a failure
pub fn warning_content(message: &str) -> String {
    format!("{} {}", WARNING_MARKER, message)
}

/// Build the message list for one turn: persona, selected memories, prior
/// conversation, then the new user input.
///
/// Empty messages (the pending assistant placeholder) and warning-marked
/// assistant messages are left out of the history.
pub fn assemble(
    persona: &PersonaSettings,
    memories: &[&MemoryItem],
    history: &[Message],
    input: &str,
) -> Vec<PromptMessage> {
    let mut messages = Vec::with_capacity(2 + memories.len() + history.len());
    messages.push(PromptMessage::system(persona.system_prompt.clone()));
    messages.extend(
        memories
            .iter()
            .map(|memory| PromptMessage::system(format!("Context memory: {}", memory.as_context()))),
    );
    messages.extend(
        history
            .iter()
            .filter(|m| !m.content.trim().is_empty())
            .filter(|m| !(m.role == Role::Assistant && m.content.starts_with(WARNING_MARKER)))
            .map(Message::to_prompt),
    );
    messages.push(PromptMessage::user(input));
    messages
}

/// Token counter using tiktoken
pub struct TokenCounter {
    bpe: tiktoken_rs::CoreBPE,
}

impl TokenCounter {
    /// Create a token counter for a specific model's tokenizer
    pub fn new(model: &str) -> Result<Self> {
        let bpe = tiktoken_rs::get_bpe_from_model(model)
            .map_err(|e| Error::config(format!("Failed to load tokenizer for {}: {}", model, e)))?;

        Ok(Self { bpe })
    }

    /// cl100k tokenizer; close enough for budgeting local chat models
    pub fn cl100k() -> Result<Self> {
        Self::new("gpt-4")
    }

    /// Count tokens in a text
    pub fn count(&self, text: &str) -> u32 {
        self.bpe.encode_with_special_tokens(text).len() as u32
    }

    /// Estimate tokens without the tokenizer (~4 characters per token)
    pub fn estimate(text: &str) -> u32 {
        (text.len() / 4) as u32
    }
}

/// Count a prompt, falling back to the estimate when no tokenizer loaded
pub fn count_prompt(counter: Option<&TokenCounter>, messages: &[PromptMessage]) -> u32 {
    messages
        .iter()
        .map(|m| {
            let content = match counter {
                Some(counter) => counter.count(&m.content),
                None => TokenCounter::estimate(&m.content),
            };
            content + MESSAGE_OVERHEAD_TOKENS
        })
        .sum()
}

/// Context budget manager for tracking token usage
#[derive(Debug, Clone)]
pub struct ContextBudget {
    pub limit: u32,
    pub used: u32,
    pub warning_threshold: f32,
}

impl ContextBudget {
    pub fn new(limit: u32, warning_threshold: f32) -> Self {
        Self {
            limit,
            used: 0,
            warning_threshold,
        }
    }

    pub fn add(&mut self, tokens: u32) {
        self.used += tokens;
    }

    /// Get utilization (0.0 - 1.0+)
    pub fn utilization(&self) -> f32 {
        if self.limit == 0 {
            return 1.0;
        }
        self.used as f32 / self.limit as f32
    }

    pub fn is_warning(&self) -> bool {
        self.utilization() >= self.warning_threshold
    }

    pub fn is_exceeded(&self) -> bool {
        self.used > self.limit
    }

    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.used)
    }

    pub fn status(&self) -> &'static str {
        if self.is_exceeded() {
            "exceeded"
        } else if self.is_warning() {
            "warning"
        } else {
            "ok"
        }
    }
}

/// Drop the oldest conversation messages until the prompt fits in
/// `window - reserve` tokens. System messages and the final user input are
/// always kept. Returns how many messages were dropped.
pub fn fit_to_window(
    messages: &mut Vec<PromptMessage>,
    counter: Option<&TokenCounter>,
    window: u32,
    reserve: u32,
) -> usize {
    let budget = window.saturating_sub(reserve);
    let mut dropped = 0;

    while count_prompt(counter, messages) > budget {
        let last = messages.len().saturating_sub(1);
        let oldest = messages
            .iter()
            .enumerate()
            .position(|(i, m)| i < last && m.role != Role::System);
        match oldest {
            Some(index) => {
                messages.remove(index);
                dropped += 1;
            }
            None => break,
        }
    }

    dropped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory(title: &str, details: &str) -> MemoryItem {
        MemoryItem::new(title, details)
    }

    #[test]
    fn assembles_persona_memories_history_and_input_once() {
        let persona = PersonaSettings::default();
        let coffee = memory("Coffee", "Oat flat white");
        let history = vec![
            Message::user("Plan my week"),
            Message::new(Role::Assistant, "Sure."),
            Message::new(Role::Assistant, warning_content("device lost")),
            Message::assistant_placeholder(),
        ];

        let prompt = assemble(&persona, &[&coffee], &history, "And today?");

        assert_eq!(prompt.len(), 5);
        assert_eq!(prompt[0], PromptMessage::system(persona.system_prompt.clone()));
        assert_eq!(
            prompt[1],
            PromptMessage::system("Context memory: Coffee: Oat flat white")
        );
        assert_eq!(prompt[2], PromptMessage::user("Plan my week"));
        assert_eq!(prompt[3].role, Role::Assistant);
        assert_eq!(prompt[4], PromptMessage::user("And today?"));
    }

    #[test]
    fn budget_status() {
        let mut budget = ContextBudget::new(100, 0.8);
        budget.add(50);
        assert_eq!(budget.status(), "ok");
        budget.add(30);
        assert_eq!(budget.status(), "warning");
        assert_eq!(budget.remaining(), 20);
        budget.add(30);
        assert_eq!(budget.status(), "exceeded");
    }

    #[test]
    fn fitting_drops_oldest_history_first() {
        let filler = "word ".repeat(40);
        let mut messages = vec![
            PromptMessage::system("be brief"),
            PromptMessage::user(format!("first {}", filler)),
            PromptMessage::system(format!("second {}", filler)),
            PromptMessage::user(format!("third {}", filler)),
            PromptMessage::user("now"),
        ];
        let before = count_prompt(None, &messages);

        // One token short: only the first user message has to go.
        let dropped = fit_to_window(&mut messages, None, before - 1, 0);

        assert_eq!(dropped, 1);
        assert!(messages[1].content.starts_with("second"));
        assert!(messages[2].content.starts_with("third"));
        assert_eq!(messages.last().unwrap().content, "now");
    }

    #[test]
    fn fitting_never_drops_system_or_input() {
        let mut messages = vec![
            PromptMessage::system("rules ".repeat(100)),
            PromptMessage::user("question ".repeat(100)),
        ];
        assert_eq!(fit_to_window(&mut messages, None, 10, 0), 0);
        assert_eq!(messages.len(), 2);
    }
}
