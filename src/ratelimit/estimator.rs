//! Cost estimation for outbound API calls.
//!
//! Every call kind has its own estimator, chosen once when the limiter is
//! built. The estimator never looks at a call to decide how to price it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tiktoken_rs::CoreBPE;

use crate::error::{QuotaError, Result};

/// Default completion budget assumed when a call does not set `max_tokens`.
pub const DEFAULT_MAX_TOKENS: u64 = 15;

/// Tokens of framing around every chat message.
const CHAT_TOKENS_PER_MESSAGE: u64 = 4;
/// Tokens priming every chat reply.
const CHAT_REPLY_PRIMING_TOKENS: u64 = 2;

/// The kinds of call the limiter can price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    /// Chat completions (a list of messages)
    Chat,
    /// Text completions (one or more prompts)
    Completion,
    /// Embeddings (one or more inputs)
    Embedding,
}

impl CallKind {
    /// Provider default `(request_limit, token_limit)` per minute.
    pub fn default_limits(&self) -> (u64, u64) {
        match self {
            CallKind::Chat => (3_500, 90_000),
            CallKind::Completion => (3_500, 350_000),
            CallKind::Embedding => (3_500, 70_000_000),
        }
    }

    /// Default shared-store namespace for this kind.
    pub fn default_bucket_key(&self) -> &'static str {
        match self {
            CallKind::Chat => "chat",
            CallKind::Completion => "completion",
            CallKind::Embedding => "embedding",
        }
    }
}

impl std::fmt::Display for CallKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.default_bucket_key())
    }
}

/// One chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Speaker role (`system`, `user`, `assistant`)
    pub role: String,
    /// Message text
    pub content: String,
    /// Optional participant name; when present the role costs nothing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    /// Create a message without a name.
    pub fn new(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: content.to_string(),
            name: None,
        }
    }
}

/// A single text or a batch of texts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Prompt {
    /// One text
    Single(String),
    /// Several texts sent in one call
    Batch(Vec<String>),
}

fn default_max_tokens() -> u64 {
    DEFAULT_MAX_TOKENS
}

fn default_n() -> u64 {
    1
}

/// The logical shape of one outbound call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CallShape {
    /// A chat completion request
    Chat {
        /// Conversation so far
        messages: Vec<ChatMessage>,
        /// Completion budget per choice
        #[serde(default = "default_max_tokens")]
        max_tokens: u64,
        /// Number of choices
        #[serde(default = "default_n")]
        n: u64,
    },
    /// A text completion request
    Completion {
        /// Prompt or prompts
        prompt: Prompt,
        /// Completion budget per choice
        #[serde(default = "default_max_tokens")]
        max_tokens: u64,
        /// Number of choices per prompt
        #[serde(default = "default_n")]
        n: u64,
    },
    /// An embedding request
    Embedding {
        /// Input or inputs
        input: Prompt,
    },
}

impl CallShape {
    /// Chat request with default `max_tokens` and `n`.
    pub fn chat(messages: Vec<ChatMessage>) -> Self {
        CallShape::Chat {
            messages,
            max_tokens: DEFAULT_MAX_TOKENS,
            n: 1,
        }
    }

    /// Completion request with default `max_tokens` and `n`.
    pub fn completion(prompt: Prompt) -> Self {
        CallShape::Completion {
            prompt,
            max_tokens: DEFAULT_MAX_TOKENS,
            n: 1,
        }
    }

    /// Embedding request.
    pub fn embedding(input: Prompt) -> Self {
        CallShape::Embedding { input }
    }

    /// The kind of this call.
    pub fn kind(&self) -> CallKind {
        match self {
            CallShape::Chat { .. } => CallKind::Chat,
            CallShape::Completion { .. } => CallKind::Completion,
            CallShape::Embedding { .. } => CallKind::Embedding,
        }
    }
}

/// Maps a call to a non-negative cost in resource units.
pub trait CostEstimator: Send + Sync {
    /// Price one call.
    fn estimate(&self, shape: &CallShape) -> Result<u64>;
}

/// Estimates cost by counting BPE tokens.
///
/// Chat calls are counted with `cl100k_base`, completions and embeddings with
/// `p50k_base`.
#[derive(Clone)]
pub struct TokenEstimator {
    kind: CallKind,
    encoder: Arc<CoreBPE>,
}

impl std::fmt::Debug for TokenEstimator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenEstimator").field("kind", &self.kind).finish()
    }
}

impl TokenEstimator {
    /// Load the tokenizer for `kind`.
    pub fn new(kind: CallKind) -> Result<Self> {
        let encoder = match kind {
            CallKind::Chat => tiktoken_rs::cl100k_base(),
            CallKind::Completion | CallKind::Embedding => tiktoken_rs::p50k_base(),
        }
        .map_err(|e| QuotaError::Estimator(format!("Failed to load tokenizer: {}", e)))?;

        Ok(Self {
            kind,
            encoder: Arc::new(encoder),
        })
    }

    /// The kind this estimator prices.
    pub fn kind(&self) -> CallKind {
        self.kind
    }

    fn count(&self, text: &str) -> u64 {
        self.encoder.encode_ordinary(text).len() as u64
    }

    fn chat_cost(&self, messages: &[ChatMessage], max_tokens: u64, n: u64) -> Result<u64> {
        let mut tokens = checked(n.checked_mul(max_tokens))?;
        for message in messages {
            let mut message_tokens = CHAT_TOKENS_PER_MESSAGE
                + self.count(&message.role)
                + self.count(&message.content);
            if let Some(name) = &message.name {
                // A named message omits its role token
                message_tokens = (message_tokens + self.count(name)).saturating_sub(1);
            }
            tokens = checked(tokens.checked_add(message_tokens))?;
        }
        checked(tokens.checked_add(CHAT_REPLY_PRIMING_TOKENS))
    }

    fn completion_cost(&self, prompt: &Prompt, max_tokens: u64, n: u64) -> Result<u64> {
        let per_prompt = checked(n.checked_mul(max_tokens))?;
        match prompt {
            Prompt::Single(text) => checked(per_prompt.checked_add(self.count(text))),
            Prompt::Batch(texts) => {
                let budget = checked(per_prompt.checked_mul(texts.len() as u64))?;
                checked(budget.checked_add(self.sum_counts(texts)))
            }
        }
    }

    fn embedding_cost(&self, input: &Prompt) -> u64 {
        match input {
            Prompt::Single(text) => self.count(text),
            Prompt::Batch(texts) => self.sum_counts(texts),
        }
    }

    fn sum_counts(&self, texts: &[String]) -> u64 {
        texts
            .iter()
            .fold(0u64, |total, text| total.saturating_add(self.count(text)))
    }
}

/// Turn an overflowed cost into an estimation error.
fn checked(cost: Option<u64>) -> Result<u64> {
    cost.ok_or_else(|| QuotaError::Estimator("call cost does not fit in 64 bits".to_string()))
}

impl CostEstimator for TokenEstimator {
    fn estimate(&self, shape: &CallShape) -> Result<u64> {
        match (self.kind, shape) {
            (CallKind::Chat, CallShape::Chat { messages, max_tokens, n }) => {
                self.chat_cost(messages, *max_tokens, *n)
            }
            (CallKind::Completion, CallShape::Completion { prompt, max_tokens, n }) => {
                self.completion_cost(prompt, *max_tokens, *n)
            }
            (CallKind::Embedding, CallShape::Embedding { input }) => Ok(self.embedding_cost(input)),
            (expected, shape) => Err(QuotaError::ShapeMismatch {
                expected,
                actual: shape.kind(),
            }),
        }
    }
}

/// Charges the same cost for every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedCost(pub u64);

impl CostEstimator for FixedCost {
    fn estimate(&self, _shape: &CallShape) -> Result<u64> {
        Ok(self.0)
    }
}
