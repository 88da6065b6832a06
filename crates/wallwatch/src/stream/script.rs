//! Deterministic in-memory feed for exercising the supervisor.
//!
//! Each `open` call pops the next scripted session. A session is either an
//! open failure or a list of steps (frames, pauses, a terminal error, or a
//! clean end), which lets tests drive reconnects, backoff, and shutdown
//! without a network.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use wall_common::InstrumentInfo;

use super::{FeedError, Frame, FrameStream, MarketFeed};

/// One step of a scripted session.
pub enum ScriptStep {
    /// Yield a frame.
    Frame(Frame),
    /// Sleep before the next step.
    Wait(Duration),
    /// Fail the stream with this error.
    Fail(FeedError),
}

/// A scripted session: fails at `open`, or plays its steps and then ends
/// cleanly.
pub enum Session {
    OpenError(FeedError),
    Steps(Vec<ScriptStep>),
}

/// Vector-of-sessions feed. Records the instrument sets it was opened with
/// so tests can assert on resubscription behavior.
pub struct ScriptedFeed {
    sessions: Mutex<VecDeque<Session>>,
    opened_with: Mutex<Vec<Vec<String>>>,
}

impl ScriptedFeed {
    pub fn new(sessions: impl IntoIterator<Item = Session>) -> Self {
        Self {
            sessions: Mutex::new(sessions.into_iter().collect()),
            opened_with: Mutex::new(Vec::new()),
        }
    }

    /// Instrument ids passed to each `open` call, in order.
    pub fn opened_with(&self) -> Vec<Vec<String>> {
        self.opened_with.lock().unwrap().clone()
    }
}

#[async_trait]
impl MarketFeed for ScriptedFeed {
    async fn open(
        &self,
        instruments: &[InstrumentInfo],
        _depth: usize,
    ) -> Result<Box<dyn FrameStream>, FeedError> {
        self.opened_with
            .lock()
            .unwrap()
            .push(instruments.iter().map(|i| i.instrument_id.clone()).collect());
        let session = self.sessions.lock().unwrap().pop_front();
        match session {
            Some(Session::OpenError(e)) => Err(e),
            Some(Session::Steps(steps)) => Ok(Box::new(ScriptedStream {
                steps: steps.into(),
            })),
            // Script exhausted: an immediately-ending stream.
            None => Ok(Box::new(ScriptedStream {
                steps: VecDeque::new(),
            })),
        }
    }
}

struct ScriptedStream {
    steps: VecDeque<ScriptStep>,
}

#[async_trait]
impl FrameStream for ScriptedStream {
    async fn next_frame(&mut self) -> Result<Option<Frame>, FeedError> {
        loop {
            match self.steps.pop_front() {
                Some(ScriptStep::Frame(frame)) => return Ok(Some(frame)),
                Some(ScriptStep::Wait(duration)) => tokio::time::sleep(duration).await,
                Some(ScriptStep::Fail(error)) => return Err(error),
                None => return Ok(None),
            }
        }
    }
}
