//! Input token budgeting.
//!
//! The built-in key is shared by every caller, so requests using it get a
//! tighter per-model ceiling than requests carrying the caller's own key.

use std::collections::HashMap;

use tiktoken_rs::CoreBPE;

use crate::error::ProxyError;
use crate::models::{ChatMessage, Model};

/// Counts tokens in a piece of text.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// `cl100k_base` tokenizer shared by the gpt-3.5 and gpt-4 families.
pub struct TiktokenCounter {
    bpe: &'static CoreBPE,
}

impl TiktokenCounter {
    pub fn new() -> Self {
        Self {
            bpe: tiktoken_rs::cl100k_base_singleton(),
        }
    }
}

impl Default for TiktokenCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenCounter for TiktokenCounter {
    fn count(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }
}

/// Built-in key ceiling override supplied at startup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum InputTokenOverride {
    #[default]
    None,
    /// Same ceiling for every model
    Global(usize),
    /// Per-model ceilings; models not listed keep their default
    PerModel(HashMap<Model, usize>),
}

/// Resolved per-model ceilings, immutable after startup.
#[derive(Debug, Clone)]
pub struct TokenLimits {
    builtin: HashMap<Model, usize>,
}

impl TokenLimits {
    pub fn new(overrides: &InputTokenOverride) -> Self {
        let builtin = Model::ALL
            .into_iter()
            .map(|model| {
                let limit = match overrides {
                    InputTokenOverride::None => default_builtin_limit(model),
                    InputTokenOverride::Global(limit) => *limit,
                    InputTokenOverride::PerModel(map) => map
                        .get(&model)
                        .copied()
                        .unwrap_or_else(|| default_builtin_limit(model)),
                };
                (model, limit)
            })
            .collect();
        Self { builtin }
    }

    /// Ceiling for one request. Callers with their own key get at least the
    /// full context window.
    pub fn limit_for(&self, model: Model, used_builtin_key: bool) -> usize {
        let builtin = self
            .builtin
            .get(&model)
            .copied()
            .unwrap_or_else(|| default_builtin_limit(model));
        if used_builtin_key {
            builtin
        } else {
            builtin.max(model.context_window())
        }
    }
}

impl Default for TokenLimits {
    fn default() -> Self {
        Self::new(&InputTokenOverride::None)
    }
}

/// Leaves a quarter of the window for the completion.
fn default_builtin_limit(model: Model) -> usize {
    model.context_window() / 4 * 3
}

pub fn estimate(counter: &dyn TokenCounter, messages: &[ChatMessage]) -> usize {
    messages.iter().map(|m| counter.count(&m.content)).sum()
}

pub fn check(estimate: usize, limit: usize, conversation_len: usize) -> Result<(), ProxyError> {
    if estimate > limit {
        return Err(ProxyError::InputTooLong {
            tokens: estimate,
            limit,
            multi_turn: conversation_len > 1,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use crate::test_support::WordCounter;

    fn user(content: &str) -> ChatMessage {
        ChatMessage {
            role: Role::User,
            content: content.to_string(),
        }
    }

    #[test]
    fn test_estimate_sums_messages() {
        let messages = vec![user("one two"), user("three"), user("")];
        assert_eq!(estimate(&WordCounter, &messages), 3);
    }

    #[test]
    fn test_tiktoken_counter_counts() {
        let counter = TiktokenCounter::new();
        assert_eq!(counter.count(""), 0);
        assert!(counter.count("hello world") >= 2);
    }

    #[test]
    fn test_check_boundaries() {
        let limit = 100;
        assert!(check(limit - 1, limit, 1).is_ok());
        assert!(check(limit, limit, 1).is_ok());
        assert!(matches!(
            check(limit + 1, limit, 1),
            Err(ProxyError::InputTooLong {
                multi_turn: false,
                ..
            })
        ));
        assert!(matches!(
            check(limit + 1, limit, 3),
            Err(ProxyError::InputTooLong {
                multi_turn: true,
                ..
            })
        ));
    }

    #[test]
    fn test_supplied_key_gets_larger_limit() {
        let limits = TokenLimits::default();
        for model in Model::ALL {
            assert!(limits.limit_for(model, false) > limits.limit_for(model, true));
            assert_eq!(limits.limit_for(model, false), model.context_window());
        }
        assert_eq!(limits.limit_for(Model::Gpt35Turbo, true), 3072);
    }

    #[test]
    fn test_global_override() {
        let limits = TokenLimits::new(&InputTokenOverride::Global(500));
        for model in Model::ALL {
            assert_eq!(limits.limit_for(model, true), 500);
        }
        assert_eq!(limits.limit_for(Model::Gpt4, false), 8192);
    }

    #[test]
    fn test_per_model_override_keeps_other_defaults() {
        let map = HashMap::from([(Model::Gpt4, 1000)]);
        let limits = TokenLimits::new(&InputTokenOverride::PerModel(map));
        assert_eq!(limits.limit_for(Model::Gpt4, true), 1000);
        assert_eq!(limits.limit_for(Model::Gpt35Turbo, true), 3072);
    }
}
