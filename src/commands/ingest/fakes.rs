use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::time::Duration;

use super::client::{CompletionClient, CompletionReply, CompletionRequest, ServiceError};
use crate::shutdown::Sleeper;

pub fn reply(content: &str, prompt_tokens: u64, completion_tokens: u64) -> CompletionReply {
    CompletionReply {
        content: content.to_string(),
        prompt_tokens,
        completion_tokens,
    }
}

/// Answers from a fixed script, then from `fallback` if one is set.
pub struct ScriptedClient {
    script: RefCell<VecDeque<Result<CompletionReply, ServiceError>>>,
    fallback: Option<CompletionReply>,
    calls: Cell<usize>,
}

impl ScriptedClient {
    pub fn new(script: Vec<Result<CompletionReply, ServiceError>>) -> Self {
        Self {
            script: RefCell::new(script.into()),
            fallback: None,
            calls: Cell::new(0),
        }
    }

    pub fn always(content: &str, prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            script: RefCell::new(VecDeque::new()),
            fallback: Some(reply(content, prompt_tokens, completion_tokens)),
            calls: Cell::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }
}

impl CompletionClient for ScriptedClient {
    fn model(&self) -> &str {
        "gpt-5.2"
    }

    fn complete(&self, _request: &CompletionRequest<'_>) -> Result<CompletionReply, ServiceError> {
        self.calls.set(self.calls.get() + 1);
        if let Some(next) = self.script.borrow_mut().pop_front() {
            return next;
        }
        match &self.fallback {
            Some(reply) => Ok(reply.clone()),
            None => Err(ServiceError::Transport("script exhausted".to_string())),
        }
    }
}

/// Records requested waits without sleeping.
#[derive(Default)]
pub struct RecordingSleeper {
    slept: RefCell<Vec<Duration>>,
    interrupt: bool,
}

impl RecordingSleeper {
    /// Reports every wait as interrupted.
    pub fn interrupting() -> Self {
        Self {
            slept: RefCell::new(Vec::new()),
            interrupt: true,
        }
    }

    pub fn slept(&self) -> Vec<Duration> {
        self.slept.borrow().clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) -> bool {
        self.slept.borrow_mut().push(duration);
        !self.interrupt
    }
}
