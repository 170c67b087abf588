//! Scripted in-memory transport for driver tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use super::Transport;

#[derive(Default)]
struct State {
    once: HashMap<String, VecDeque<Vec<u8>>>,
    always: HashMap<String, Vec<u8>>,
    pending: VecDeque<u8>,
    writes: Vec<Vec<u8>>,
    closed: bool,
}

/// Replies are keyed by the exact command text (without the trailing
/// newline). Clones share state, so a test can keep one handle while the
/// driver owns another.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<State>>,
    timeout: Duration,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Arc::default(),
            timeout: Duration::from_millis(100),
        }
    }

    /// Reply to every occurrence of `command`.
    pub fn reply(&self, command: &str, response: impl AsRef<[u8]>) -> &Self {
        self.state
            .lock()
            .unwrap()
            .always
            .insert(command.to_string(), response.as_ref().to_vec());
        self
    }

    /// Reply to the next occurrence of `command` only; queued replies are
    /// consumed before any permanent one.
    pub fn reply_once(&self, command: &str, response: impl AsRef<[u8]>) -> &Self {
        self.state
            .lock()
            .unwrap()
            .once
            .entry(command.to_string())
            .or_default()
            .push_back(response.as_ref().to_vec());
        self
    }

    /// Every message written so far, decoded lossily and without terminator.
    pub fn writes(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .writes
            .iter()
            .map(|w| String::from_utf8_lossy(w).trim_end_matches('\n').to_string())
            .collect()
    }

    pub fn raw_writes(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    pub fn boxed(&self) -> Box<dyn Transport> {
        Box::new(self.clone())
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.writes.push(data.to_vec());
        let key = String::from_utf8_lossy(data).trim_end_matches('\n').to_string();
        let reply = match state.once.get_mut(&key).and_then(VecDeque::pop_front) {
            Some(reply) => Some(reply),
            None => state.always.get(&key).cloned(),
        };
        if let Some(reply) = reply {
            state.pending.extend(reply);
        }
        Ok(())
    }

    async fn read(&mut self) -> Result<Vec<u8>> {
        let mut state = self.state.lock().unwrap();
        if state.pending.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "no scripted reply pending",
            )
            .into());
        }
        // Hand out replies in small chunks to exercise reassembly.
        let n = state.pending.len().min(4096);
        Ok(state.pending.drain(..n).collect())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    async fn close(&mut self) -> Result<()> {
        self.state.lock().unwrap().closed = true;
        Ok(())
    }

    fn describe(&self) -> String {
        "MOCK::INSTR".to_string()
    }
}
