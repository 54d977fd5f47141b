use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::conversation_state::Message;
use crate::completion::{ChunkStream, CompletionBackend, Credential};
use crate::error::{TurnError, TurnResult};

pub enum Scripted {
    /// The request is accepted and the stream yields these items.
    Stream(Vec<TurnResult<String>>),
    /// The request itself is refused.
    Reject(TurnError),
}

impl Scripted {
    pub fn chunks(chunks: &[&str]) -> Self {
        Scripted::Stream(chunks.iter().map(|c| Ok(c.to_string())).collect())
    }
}

/// In-memory backend that replays scripted replies and records what it was
/// sent.
pub struct ScriptedBackend {
    script: Mutex<VecDeque<Scripted>>,
    sent: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedBackend {
    pub fn new(script: Vec<Scripted>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> usize {
        self.sent.lock().expect("sent log poisoned").len()
    }

    pub fn sent_lengths(&self) -> Vec<usize> {
        self.sent
            .lock()
            .expect("sent log poisoned")
            .iter()
            .map(Vec::len)
            .collect()
    }
}

#[async_trait]
impl CompletionBackend for ScriptedBackend {
    async fn send(&self, history: &[Message], _credential: &Credential) -> TurnResult<ChunkStream> {
        self.sent
            .lock()
            .expect("sent log poisoned")
            .push(history.to_vec());

        let next = self
            .script
            .lock()
            .expect("script poisoned")
            .pop_front()
            .ok_or_else(|| TurnError::Provider("script exhausted".to_string()))?;

        match next {
            Scripted::Stream(items) => Ok(Box::pin(futures::stream::iter(items))),
            Scripted::Reject(e) => Err(e),
        }
    }
}

/// `Write` target that can be read back after being handed over as
/// `Box<dyn Write>`.
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().expect("buffer poisoned")).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().expect("buffer poisoned").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
