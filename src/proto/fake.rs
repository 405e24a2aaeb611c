use std::collections::{HashMap, VecDeque};
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use super::port::{Connector, Port};
use super::Result;
use crate::settings::SessionConfig;

#[derive(Default)]
struct State {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
    replies: HashMap<u8, Vec<u8>>,
    // writes of a command left unanswered before its reply is sent
    silent: HashMap<u8, usize>,
    waker: Option<Waker>,
}

impl State {
    fn push(&mut self, bytes: &[u8]) {
        self.rx.extend(bytes);
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }
}

/// Scripted stand-in for the instrument.
///
/// Every write is recorded. Writes starting with a registered command
/// byte queue the canned reply, and stream bytes can be fed at any time.
#[derive(Clone, Default)]
pub(crate) struct FakeInstrument {
    state: Arc<Mutex<State>>,
}

impl FakeInstrument {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Answers the identity probe like a real URSA-II.
    pub(crate) fn ursa() -> Self {
        let fake = Self::new();
        fake.reply_to(b'U', b"URSA2\r\n");
        fake
    }

    pub(crate) fn reply_to(&self, cmd: u8, reply: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .replies
            .insert(cmd, reply.to_vec());
    }

    /// Like [`FakeInstrument::reply_to`], but the first `silent` writes
    /// of `cmd` get no answer.
    pub(crate) fn reply_after(&self, cmd: u8, silent: usize, reply: &[u8]) {
        let mut state = self.state.lock().unwrap();
        state.replies.insert(cmd, reply.to_vec());
        state.silent.insert(cmd, silent);
    }

    pub(crate) fn feed(&self, bytes: &[u8]) {
        self.state.lock().unwrap().push(bytes);
    }

    pub(crate) fn written(&self) -> Vec<u8> {
        self.state.lock().unwrap().tx.clone()
    }

    pub(crate) fn clear_written(&self) {
        self.state.lock().unwrap().tx.clear();
    }

    pub(crate) fn port(&self) -> FakeBuffer {
        FakeBuffer {
            state: self.state.clone(),
        }
    }

    pub(crate) fn connector(&self) -> FakeConnector {
        FakeConnector {
            instrument: self.clone(),
            failures: 0,
        }
    }
}

pub(crate) struct FakeBuffer {
    state: Arc<Mutex<State>>,
}

impl tokio::io::AsyncRead for FakeBuffer {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut state = self.state.lock().unwrap();
        if state.rx.is_empty() {
            state.waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        let n = buf.remaining().min(state.rx.len());
        let chunk: Vec<u8> = state.rx.drain(..n).collect();
        buf.put_slice(&chunk);
        Poll::Ready(Ok(()))
    }
}

impl tokio::io::AsyncWrite for FakeBuffer {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::result::Result<usize, io::Error>> {
        let mut state = self.state.lock().unwrap();
        state.tx.extend_from_slice(buf);
        let reply = match buf.first() {
            Some(cmd) => match state.silent.get_mut(cmd) {
                Some(silent) if *silent > 0 => {
                    *silent -= 1;
                    None
                }
                _ => state.replies.get(cmd).cloned(),
            },
            None => None,
        };
        if let Some(reply) = reply {
            state.push(&reply);
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<std::result::Result<(), io::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<std::result::Result<(), io::Error>> {
        Poll::Ready(Ok(()))
    }
}

pub(crate) struct FakeConnector {
    instrument: FakeInstrument,
    failures: usize,
}

impl FakeConnector {
    /// Fail the next `failures` opens.
    pub(crate) fn failing(mut self, failures: usize) -> Self {
        self.failures = failures;
        self
    }
}

impl Connector for FakeConnector {
    fn open(&mut self) -> Result<Port> {
        if self.failures > 0 {
            self.failures -= 1;
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such device").into());
        }
        Ok(Box::new(self.instrument.port()))
    }

    fn name(&self) -> &str {
        "fake"
    }
}

/// Session timing without pauses.
pub(crate) fn test_config() -> SessionConfig {
    SessionConfig {
        timeout: Duration::from_millis(50),
        settle: Duration::ZERO,
        stop_settle: Duration::ZERO,
        ramp_delay: Duration::ZERO,
        ramp_polls: 3,
        serial_settle: Duration::ZERO,
        ..SessionConfig::default()
    }
}
