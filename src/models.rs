//! Chat data model: messages, roles and the supported model catalogue.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// Supported upstream chat models
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Model {
    #[serde(rename = "gpt-3.5-turbo")]
    Gpt35Turbo,
    #[serde(rename = "gpt-3.5-turbo-16k")]
    Gpt35Turbo16k,
    #[serde(rename = "gpt-4")]
    Gpt4,
    #[serde(rename = "gpt-4-32k")]
    Gpt4_32k,
}

impl Model {
    pub const ALL: [Model; 4] = [
        Model::Gpt35Turbo,
        Model::Gpt35Turbo16k,
        Model::Gpt4,
        Model::Gpt4_32k,
    ];

    pub fn id(self) -> &'static str {
        match self {
            Model::Gpt35Turbo => "gpt-3.5-turbo",
            Model::Gpt35Turbo16k => "gpt-3.5-turbo-16k",
            Model::Gpt4 => "gpt-4",
            Model::Gpt4_32k => "gpt-4-32k",
        }
    }

    /// Context window in tokens
    pub fn context_window(self) -> usize {
        match self {
            Model::Gpt35Turbo => 4096,
            Model::Gpt35Turbo16k => 16384,
            Model::Gpt4 => 8192,
            Model::Gpt4_32k => 32768,
        }
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Model {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Model::ALL
            .into_iter()
            .find(|m| m.id() == s.trim())
            .ok_or_else(|| format!("unknown model: {s}"))
    }
}
