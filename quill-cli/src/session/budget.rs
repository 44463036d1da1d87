//! Context budget control.
//!
//! Decides, before each exchange, whether the conversation still fits the
//! configured token budget and which split of the history to summarize.
//! Pure decision logic so the outcome is reproducible without a backend.

use quill_common::tokens::estimate_text;
use quill_common::{Error, Result};

use super::model::{estimate_messages, Message, Role, Session};

/// Outcome of a budget check.
#[derive(Debug)]
pub enum BudgetDecision {
    /// Conversation fits; carries the current total estimate.
    Within { estimate: usize },
    /// Conversation is over budget and needs compression.
    NeedsSummarization {
        /// Older prefix to compress (empty when summarizing cannot help)
        to_summarize: Vec<Message>,
        /// Recent suffix kept verbatim for conversational grounding
        keep: Vec<Message>,
        /// Set when even the kept suffix alone exceeds the budget, so the
        /// caller must be prepared to hard-truncate afterwards
        may_exceed_after: bool,
    },
}

/// Budget controller for one engine configuration.
pub struct BudgetController {
    budget: usize,
    keep_last_n: usize,
}

impl BudgetController {
    pub fn new(budget: usize, keep_last_n: usize) -> Self {
        Self {
            budget,
            // Always keep at least the current turn verbatim.
            keep_last_n: keep_last_n.max(1),
        }
    }

    pub const fn budget(&self) -> usize {
        self.budget
    }

    /// Token estimate reserved for the running summary itself.
    ///
    /// Summaries compound rather than nest, so the reserve keeps them from
    /// swallowing the budget they are supposed to protect.
    pub const fn summary_reserve(&self) -> usize {
        self.budget / 4
    }

    /// Check the session against the budget.
    pub fn check(&self, session: &Session, system_prompt: &str) -> BudgetDecision {
        let estimate = session.context_estimate(system_prompt);
        if estimate <= self.budget {
            return BudgetDecision::Within { estimate };
        }

        let keep_n = self.keep_last_n.min(session.messages.len());
        let split = session.messages.len() - keep_n;
        let keep = session.messages[split..].to_vec();

        let system_estimate = if system_prompt.is_empty() {
            0
        } else {
            estimate_text(system_prompt) + quill_common::tokens::MESSAGE_OVERHEAD
        };

        if system_estimate + estimate_messages(&keep) > self.budget {
            // Summarizing the prefix cannot fix this; the caller falls
            // back to hard truncation.
            return BudgetDecision::NeedsSummarization {
                to_summarize: Vec::new(),
                keep,
                may_exceed_after: true,
            };
        }

        BudgetDecision::NeedsSummarization {
            to_summarize: session.messages[..split].to_vec(),
            keep,
            may_exceed_after: false,
        }
    }

    /// Bound a freshly generated summary to the reserved fraction by
    /// dropping its oldest sentences first.
    pub fn clamp_summary(&self, summary: &str) -> String {
        let reserve = self.summary_reserve().max(1);
        if estimate_text(summary) <= reserve {
            return summary.to_string();
        }

        let sentences: Vec<&str> = summary
            .split_inclusive(['.', '!', '?', '\n'])
            .filter(|sentence| !sentence.trim().is_empty())
            .collect();

        // Keep the newest sentences that still fit.
        let mut kept_from = sentences.len();
        let mut total = 0;
        for (idx, sentence) in sentences.iter().enumerate().rev() {
            let cost = estimate_text(sentence);
            if total + cost > reserve {
                break;
            }
            total += cost;
            kept_from = idx;
        }

        if kept_from == sentences.len() {
            // A single over-long sentence: fall back to a character cut.
            let chars: Vec<char> = summary.chars().collect();
            let keep_chars = reserve * 4;
            return chars[chars.len().saturating_sub(keep_chars)..]
                .iter()
                .collect::<String>()
                .trim_start()
                .to_string();
        }

        sentences[kept_from..].concat().trim().to_string()
    }

    /// Lossy last resort: drop oldest messages (then the summary) until the
    /// estimate fits. Fails if the final turn alone exceeds the budget.
    pub fn truncate_to_fit(&self, session: &mut Session, system_prompt: &str) -> Result<usize> {
        let mut dropped = 0;
        while session.context_estimate(system_prompt) > self.budget && session.messages.len() > 1 {
            session.messages.remove(0);
            dropped += 1;
        }

        if session.context_estimate(system_prompt) > self.budget && session.summary.is_some() {
            session.summary = None;
        }

        let estimate = session.context_estimate(system_prompt);
        if estimate > self.budget {
            return Err(Error::BudgetExceeded(format!(
                "estimate {estimate} exceeds budget {} even after truncation",
                self.budget
            )));
        }

        Ok(dropped)
    }

    /// Format the summarizer's input: previous summary (compounded) plus
    /// the candidate prefix as labelled turns.
    pub fn summary_input(previous: Option<&str>, messages: &[Message]) -> String {
        let mut input = String::new();

        if let Some(previous) = previous {
            input.push_str("Previous summary:\n");
            input.push_str(previous);
            input.push_str("\n\n");
        }

        input.push_str("Conversation:\n");
        for message in messages {
            let label = match message.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
                Role::System => "System",
            };
            input.push_str(label);
            input.push_str(": ");
            if message.content.is_empty() && message.image.is_some() {
                input.push_str("[image]");
            } else {
                input.push_str(&message.content);
            }
            input.push('\n');
        }

        input.push_str("\nWrite an updated summary of the conversation above.");
        input
    }
}
