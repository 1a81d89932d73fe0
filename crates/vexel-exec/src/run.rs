use std::fmt;
use std::sync::{Arc, Weak};

use vexel_core::ExecResult;

use crate::command::Tracker;

/// Handle on one run (recording cycle) of a command buffer.
///
/// Reports finished once that run has no unsignaled fence left, or once the
/// buffer was reset or destroyed. The transition is one-way: a finished token
/// drops its reference and never looks at the buffer again.
#[derive(Clone)]
pub struct RunToken {
    tracker: Option<Weak<Tracker>>,
    run: u64,
}

impl RunToken {
    pub(crate) fn new(tracker: &Arc<Tracker>, run: u64) -> Self {
        Self {
            tracker: Some(Arc::downgrade(tracker)),
            run,
        }
    }

    /// A token that is finished from the start.
    pub fn finished() -> Self {
        Self {
            tracker: None,
            run: 0,
        }
    }

    pub fn has_finished(&mut self) -> bool {
        let Some(weak) = &self.tracker else {
            return true;
        };
        let done = match weak.upgrade() {
            Some(tracker) => tracker.run_finished(self.run),
            None => true,
        };
        if done {
            self.tracker = None;
        }
        done
    }

    /// True if the token already latched to finished, without polling.
    pub fn is_latched(&self) -> bool {
        self.tracker.is_none()
    }

    /// Block until the run's submissions complete.
    ///
    /// A run that is still recording, or ended but not yet submitted, has
    /// nothing to wait on; the call returns and the token stays unfinished.
    pub fn wait(&mut self) -> ExecResult<()> {
        if self.has_finished() {
            return Ok(());
        }
        if let Some(tracker) = self.tracker.as_ref().and_then(Weak::upgrade) {
            tracker.wait()?;
        }
        self.has_finished();
        Ok(())
    }

    /// Both tokens refer to the same run of the same command buffer.
    pub fn same_run(&self, other: &RunToken) -> bool {
        match (&self.tracker, &other.tracker) {
            (Some(a), Some(b)) => Weak::ptr_eq(a, b) && self.run == other.run,
            _ => false,
        }
    }
}

impl fmt::Debug for RunToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.tracker {
            Some(weak) => write!(f, "RunToken({:p}#{})", weak.as_ptr(), self.run),
            None => write!(f, "RunToken(finished)"),
        }
    }
}

/// The runs a GPU resource has been used in.
///
/// Resources call [`register`](Self::register) whenever they are referenced
/// while recording and hand [`take`](Self::take) to the reclamation bin when
/// they are deleted. Finished runs are pruned on every registration, so a
/// resource used every frame holds roughly one token per frame in flight.
#[derive(Debug, Default, Clone)]
pub struct RunSet {
    runs: Vec<RunToken>,
}

impl RunSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, mut token: RunToken) {
        self.runs.retain_mut(|run| !run.has_finished());
        if token.has_finished() || self.runs.iter().any(|run| run.same_run(&token)) {
            return;
        }
        self.runs.push(token);
    }

    /// True when every registered run has finished.
    pub fn all_finished(&mut self) -> bool {
        self.runs.retain_mut(|run| !run.has_finished());
        self.runs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn take(&mut self) -> Vec<RunToken> {
        std::mem::take(&mut self.runs)
    }
}
