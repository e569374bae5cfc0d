//! Playback state machine.
//!
//! `Stopped -> Connecting -> Playing <-> Paused`, any active state `-> Error`, and any
//! state `-> Stopped`. Workers name the session they belong to on every transition so a
//! worker that outlived its session cannot move a newer one.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PlaybackState {
    Stopped,
    Connecting,
    Playing,
    Paused,
    Error,
}

impl PlaybackState {
    /// Fine-grained projection: `0 Stopped, 1 Connecting, 2 Playing, 3 Paused, 4 Error`.
    pub fn code(self) -> u8 {
        match self {
            PlaybackState::Stopped => 0,
            PlaybackState::Connecting => 1,
            PlaybackState::Playing => 2,
            PlaybackState::Paused => 3,
            PlaybackState::Error => 4,
        }
    }

    /// Coarse projection: only `Playing` counts as playing.
    pub fn is_playing(self) -> bool {
        self == PlaybackState::Playing
    }

    pub fn is_active(self) -> bool {
        matches!(
            self,
            PlaybackState::Connecting | PlaybackState::Playing | PlaybackState::Paused
        )
    }
}

/// Identifier of one `start`..`stop` lifetime. `0` is never handed out.
pub type SessionId = u64;

struct Inner {
    state: PlaybackState,
    session: SessionId,
    next_session: SessionId,
}

/// Current state plus the id of the session allowed to change it.
pub struct StateCell {
    inner: Mutex<Inner>,
    cv: Condvar,
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCell {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: PlaybackState::Stopped,
                session: 0,
                next_session: 1,
            }),
            cv: Condvar::new(),
        }
    }

    pub fn get(&self) -> PlaybackState {
        self.inner.lock().unwrap().state
    }

    pub fn session(&self) -> SessionId {
        self.inner.lock().unwrap().session
    }

    /// Open a new session in `Connecting` and return its id.
    pub fn begin(&self) -> SessionId {
        let mut g = self.inner.lock().unwrap();
        let id = g.next_session;
        g.next_session += 1;
        g.session = id;
        g.state = PlaybackState::Connecting;
        drop(g);
        self.cv.notify_all();
        id
    }

    /// `Connecting -> Playing` once the prebuffer is in place.
    pub fn mark_playing(&self, id: SessionId) -> bool {
        self.transition(id, |s| {
            (s == PlaybackState::Connecting).then_some(PlaybackState::Playing)
        })
    }

    /// `Playing <-> Paused`; anything else is left alone. Returns the resulting state.
    ///
    /// `apply` runs under the state lock with the new state, so side effects such as the
    /// paused flag stay in step with concurrent toggles.
    pub fn toggle(&self, apply: impl FnOnce(PlaybackState)) -> PlaybackState {
        let mut g = self.inner.lock().unwrap();
        g.state = match g.state {
            PlaybackState::Playing => PlaybackState::Paused,
            PlaybackState::Paused => PlaybackState::Playing,
            other => other,
        };
        let state = g.state;
        apply(state);
        drop(g);
        self.cv.notify_all();
        state
    }

    /// Move an active session to `Error`.
    pub fn fail(&self, id: SessionId) -> bool {
        self.transition(id, |s| s.is_active().then_some(PlaybackState::Error))
    }

    /// Close the current session. Always ends in `Stopped`.
    pub fn stop(&self) {
        let mut g = self.inner.lock().unwrap();
        g.state = PlaybackState::Stopped;
        g.session = 0;
        drop(g);
        self.cv.notify_all();
    }

    /// Block until `pred` holds for the state or `timeout` expires. Returns the last state seen.
    pub fn wait_for(
        &self,
        timeout: Duration,
        pred: impl Fn(PlaybackState) -> bool,
    ) -> PlaybackState {
        let deadline = Instant::now() + timeout;
        let mut g = self.inner.lock().unwrap();
        while !pred(g.state) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (ng, _timeout) = self.cv.wait_timeout(g, deadline - now).unwrap();
            g = ng;
        }
        g.state
    }

    fn transition(
        &self,
        id: SessionId,
        next: impl FnOnce(PlaybackState) -> Option<PlaybackState>,
    ) -> bool {
        let mut g = self.inner.lock().unwrap();
        if g.session != id {
            tracing::debug!(session = id, current = g.session, "ignoring stale session transition");
            return false;
        }
        let Some(state) = next(g.state) else {
            return false;
        };
        tracing::debug!(session = id, from = ?g.state, to = ?state, "state transition");
        g.state = state;
        drop(g);
        self.cv.notify_all();
        true
    }
}
