//! In-memory transport for tests and offline runs.
//!
//! [`ScriptedTransport`] is a cloneable handle over shared state: the session
//! owns one clone, the test keeps another to inject vehicle bytes, inspect
//! what the session wrote, and break the link on demand.  A responder
//! closure can answer every write automatically, which is enough to play a
//! whole head unit.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::application::transport::{Transport, TransportError};

/// Produces the chunks the peer sends back for one written buffer.
pub type Responder = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>;

#[derive(Default)]
struct ScriptState {
    connected: bool,
    inbound: VecDeque<Vec<u8>>,
    written: Vec<Vec<u8>>,
    responder: Option<Responder>,
    fail_connect: bool,
    fail_writes: bool,
    dropped: bool,
    connect_attempts: u32,
}

#[derive(Clone, Default)]
pub struct ScriptedTransport {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues one chunk for a later `read`.
    pub fn inject(&self, bytes: impl Into<Vec<u8>>) {
        self.state().inbound.push_back(bytes.into());
    }

    /// Returns and clears everything written so far, one entry per write.
    pub fn take_written(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.state().written)
    }

    /// Installs a closure that answers every write.
    pub fn set_responder(&self, responder: impl FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static) {
        self.state().responder = Some(Box::new(responder));
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.state().fail_connect = fail;
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.state().fail_writes = fail;
    }

    /// Simulates the peer going away: the next `read` fails with
    /// [`TransportError::Closed`].  Queued inbound bytes are discarded.
    pub fn drop_connection(&self) {
        let mut state = self.state();
        state.dropped = true;
        state.inbound.clear();
    }

    pub fn is_open(&self) -> bool {
        self.state().connected
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state().connect_attempts
    }
}

impl Transport for ScriptedTransport {
    fn connect(&mut self) -> Result<(), TransportError> {
        let mut state = self.state();
        state.connect_attempts += 1;
        if state.fail_connect {
            return Err(TransportError::ConnectFailed("scripted failure".to_string()));
        }
        state.connected = true;
        state.dropped = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state().connected
    }

    fn read(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let mut state = self.state();
        if state.dropped {
            state.dropped = false;
            state.connected = false;
            return Err(TransportError::Closed);
        }
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        Ok(state.inbound.pop_front())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        if state.fail_writes {
            return Err(TransportError::Io("scripted write failure".to_string()));
        }
        state.written.push(bytes.to_vec());

        let replies = match state.responder.as_mut() {
            Some(responder) => responder(bytes),
            None => Vec::new(),
        };
        state.inbound.extend(replies);
        Ok(())
    }

    fn disconnect(&mut self) {
        let mut state = self.state();
        state.connected = false;
        state.inbound.clear();
    }
}
