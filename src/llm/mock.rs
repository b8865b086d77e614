//! Scripted text generator (offline runs and tests, no backend needed)
//!
//! Prompts are matched against registered substrings in registration order.
//! A matching route pops its next reply; the last reply of a route repeats.
//! Every call is recorded with its parameters.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::core::{QuillError, Result};
use crate::llm::traits::{GenerationParams, TextGenerator};

/// One scripted answer
#[derive(Debug, Clone, PartialEq)]
pub enum MockReply {
    Text(String),
    /// Backend error carrying this message
    Error(String),
}

impl MockReply {
    pub fn text(text: impl Into<String>) -> Self {
        MockReply::Text(text.into())
    }

    pub fn error(message: impl Into<String>) -> Self {
        MockReply::Error(message.into())
    }
}

#[derive(Debug)]
struct Route {
    needle: String,
    replies: VecDeque<MockReply>,
}

impl Route {
    fn next(&mut self) -> Option<MockReply> {
        if self.replies.len() > 1 {
            self.replies.pop_front()
        } else {
            self.replies.front().cloned()
        }
    }
}

/// A recorded generate call
#[derive(Debug, Clone)]
pub struct MockCall {
    pub prompt: String,
    pub params: GenerationParams,
}

/// Generator answering from a script
#[derive(Debug)]
pub struct MockGenerator {
    routes: Mutex<Vec<Route>>,
    fallback: MockReply,
    calls: Mutex<Vec<MockCall>>,
}

impl Default for MockGenerator {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockGenerator {
    /// Generator that answers every prompt with the fallback reply
    pub fn new() -> Self {
        Self {
            routes: Mutex::new(Vec::new()),
            fallback: MockReply::text("mock response"),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Answer prompts containing `needle` with `text`
    pub fn respond(self, needle: impl Into<String>, text: impl Into<String>) -> Self {
        self.respond_seq(needle, vec![MockReply::Text(text.into())])
    }

    /// Answer prompts containing `needle` with `replies` in order
    pub fn respond_seq(self, needle: impl Into<String>, replies: Vec<MockReply>) -> Self {
        lock(&self.routes).push(Route {
            needle: needle.into(),
            replies: replies.into(),
        });
        self
    }

    /// Fail prompts containing `needle` with `message`
    pub fn fail(self, needle: impl Into<String>, message: impl Into<String>) -> Self {
        self.respond_seq(needle, vec![MockReply::Error(message.into())])
    }

    /// Reply used when no route matches
    pub fn fallback(mut self, reply: MockReply) -> Self {
        self.fallback = reply;
        self
    }

    /// All calls so far
    pub fn calls(&self) -> Vec<MockCall> {
        lock(&self.calls).clone()
    }

    /// Calls whose prompt contains `needle`
    pub fn calls_matching(&self, needle: &str) -> Vec<MockCall> {
        lock(&self.calls)
            .iter()
            .filter(|call| call.prompt.contains(needle))
            .cloned()
            .collect()
    }

    fn reply_for(&self, prompt: &str) -> MockReply {
        let mut routes = lock(&self.routes);
        routes
            .iter_mut()
            .find(|route| prompt.contains(&route.needle))
            .and_then(Route::next)
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl TextGenerator for MockGenerator {
    async fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<String> {
        lock(&self.calls).push(MockCall {
            prompt: prompt.to_string(),
            params: params.clone(),
        });

        match self.reply_for(prompt) {
            MockReply::Text(text) => Ok(text),
            MockReply::Error(message) => Err(QuillError::ollama(message)),
        }
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> GenerationParams {
        GenerationParams::new("mock-model", 0.0)
    }

    #[tokio::test]
    async fn test_routes_and_fallback() {
        let mock = MockGenerator::new()
            .respond("PLAN", "{\"subtasks\": []}")
            .fallback(MockReply::text("default"));

        assert_eq!(
            mock.generate("PLAN this", &params()).await.unwrap(),
            "{\"subtasks\": []}"
        );
        assert_eq!(mock.generate("other", &params()).await.unwrap(), "default");
        assert_eq!(mock.calls().len(), 2);
        assert_eq!(mock.calls_matching("PLAN").len(), 1);
    }

    #[tokio::test]
    async fn test_sequence_repeats_last() {
        let mock = MockGenerator::new().respond_seq(
            "x",
            vec![MockReply::error("model is loading"), MockReply::text("ok")],
        );

        assert!(mock.generate("x", &params()).await.is_err());
        assert_eq!(mock.generate("x", &params()).await.unwrap(), "ok");
        assert_eq!(mock.generate("x", &params()).await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_error_message_is_preserved() {
        let mock = MockGenerator::new().fail("x", "model is loading");
        let err = mock.generate("x", &params()).await.unwrap_err();
        assert!(err.to_string().contains("loading"));
    }
}
