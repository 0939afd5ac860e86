//! The external LLM collaborator contract.
//!
//! A [`ClientWrapper`] is a wrapper around a specific cloud LLM service. It does
//! not keep track of conversations, budgets or rate limits; the
//! [`Dispatcher`](crate::dispatcher::Dispatcher) layers those concerns on top and
//! is the only component that calls [`ClientWrapper::chat`].
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use llmpanel::client_wrapper::{ChatResponse, ClientError, ClientWrapper};
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl ClientWrapper for Echo {
//!     async fn chat(
//!         &self,
//!         _system_prompt: &str,
//!         user_message: &str,
//!         _model: &str,
//!         _max_tokens: Option<usize>,
//!     ) -> Result<ChatResponse, ClientError> {
//!         Ok(ChatResponse::new(user_message))
//!     }
//! }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::error::Error;

/// Opaque provider/network failure returned by a [`ClientWrapper`].
pub type ClientError = Box<dyn Error + Send + Sync>;

/// How many tokens were spent on prompt vs. completion, as reported by the provider.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
}

impl TokenUsage {
    pub fn new(input_tokens: usize, output_tokens: usize) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total_tokens(&self) -> usize {
        self.input_tokens + self.output_tokens
    }
}

/// Text returned by the provider plus optional usage metadata.
#[derive(Clone, Debug)]
pub struct ChatResponse {
    /// The assistant's reply.
    pub content: String,
    /// Usage reported by the provider, `None` when the provider does not return it.
    pub usage: Option<TokenUsage>,
}

impl ChatResponse {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            usage: None,
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// Trait defining the interface to interact with various LLM services.
#[async_trait]
pub trait ClientWrapper: Send + Sync {
    /// Send a single system + user exchange to `model` and return the reply.
    ///
    /// Implementations must not retry on their own; timeouts are enforced by the caller.
    async fn chat(
        &self,
        system_prompt: &str,
        user_message: &str,
        model: &str,
        max_tokens: Option<usize>,
    ) -> Result<ChatResponse, ClientError>;

    /// Provider label recorded on ledger transactions when the model table has none.
    fn provider_name(&self) -> &str {
        "custom"
    }
}
