//! Field Edit Session
//!
//! One session per actively edited scalar field. The session owns a copy of
//! the field's last persisted value and the in-progress buffer; it never
//! holds a reference into the document store. It is a plain state machine:
//! the engine feeds it inputs and clock readings and performs whatever
//! network call it asks for.
//!
//! # State machine
//!
//! ```text
//! idle ──begin/input──► editing ──debounce/blur/commit──► saving ──ok──► saved ──window──► idle
//!                        │  ▲                               │                │
//!                 cancel │  └──────────── input ────────────┤◄───── input ───┘
//!                        ▼                                  ▼
//!                       idle                    error ──retry──► saving
//! ```

mod state;

pub use state::{allowed_transitions, validate_transition, FieldState, SaveStatus, SessionError};

use crate::error::SyncError;
use crate::timer::CoalescingTimer;
use canvas_model::{FieldPath, FieldValue};
use std::time::Duration;
use tokio::time::Instant;

/// A dispatched save, matched against the session when it completes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveTicket {
    pub id: u64,
    /// Generation of the issuing session
    pub session: u64,
    pub path: FieldPath,
    /// Value sent to the gateway
    pub value: FieldValue,
    /// Last persisted value when the save was dispatched
    pub baseline: FieldValue,
}

/// What a completed save did to its session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// `saving → saved`
    Saved,
    /// `saving → error`
    Failed,
    /// The user edited again while the save was in flight; the session stays in `editing`
    Superseded,
    /// Not the session's current ticket; ignored
    Stale,
}

/// The save currently on the wire
#[derive(Debug, Clone)]
struct InFlight {
    id: u64,
    value: FieldValue,
}

/// Per-field edit state machine
#[derive(Debug, Clone)]
pub struct FieldSession {
    path: FieldPath,
    state: FieldState,
    persisted: FieldValue,
    buffer: FieldValue,
    debounce: CoalescingTimer,
    display: CoalescingTimer,
    focused: bool,
    /// Navigated away while a save was in flight
    disposed: bool,
    /// Save requested while another was in flight
    follow_up: bool,
    generation: u64,
    in_flight: Option<InFlight>,
    next_ticket: u64,
    last_error: Option<SyncError>,
}

impl FieldSession {
    /// Idle session seeded with the field's current value
    #[must_use]
    pub fn open(path: FieldPath, persisted: FieldValue, debounce: Duration, display: Duration) -> Self {
        Self {
            path,
            state: FieldState::Idle,
            buffer: persisted.clone(),
            persisted,
            debounce: CoalescingTimer::new(debounce),
            display: CoalescingTimer::new(display),
            focused: false,
            disposed: false,
            follow_up: false,
            generation: 0,
            in_flight: None,
            next_ticket: 0,
            last_error: None,
        }
    }

    /// Tag tickets with a generation unique to this session
    #[must_use]
    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    #[inline]
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[inline]
    #[must_use]
    pub fn path(&self) -> FieldPath {
        self.path
    }

    #[inline]
    #[must_use]
    pub fn state(&self) -> FieldState {
        self.state
    }

    #[inline]
    #[must_use]
    pub fn status(&self) -> SaveStatus {
        self.state.save_status()
    }

    /// Last value the gateway acknowledged
    #[inline]
    #[must_use]
    pub fn persisted(&self) -> &FieldValue {
        &self.persisted
    }

    /// In-progress value
    #[inline]
    #[must_use]
    pub fn buffer(&self) -> &FieldValue {
        &self.buffer
    }

    /// Check if the buffer differs from the persisted value
    #[inline]
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.buffer != self.persisted
    }

    #[inline]
    #[must_use]
    pub fn is_focused(&self) -> bool {
        self.focused
    }

    #[inline]
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    #[inline]
    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    #[inline]
    #[must_use]
    pub fn last_error(&self) -> Option<&SyncError> {
        self.last_error.as_ref()
    }

    /// Check if the buffer still represents unpersisted local intent
    #[must_use]
    pub fn holds_local_intent(&self) -> bool {
        matches!(
            self.state,
            FieldState::Editing | FieldState::Saving | FieldState::Error
        ) && self.is_dirty()
    }

    /// Nothing left to show or persist; the engine may drop the session
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.in_flight.is_none() && (self.disposed || (self.state == FieldState::Idle && !self.focused))
    }

    /// Earliest pending deadline (debounce or saved display window)
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        let debounce = self
            .debounce
            .deadline()
            .filter(|_| self.state == FieldState::Editing);
        let display = self.display.deadline().filter(|_| self.state == FieldState::Saved);
        match (debounce, display) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn transition(&mut self, to: FieldState) -> Result<(), SessionError> {
        validate_transition(self.path, self.state, to)?;
        tracing::trace!(path = %self.path, from = %self.state, to = %to, "field transition");
        self.state = to;
        Ok(())
    }

    /// Focus/activation
    ///
    /// # Errors
    /// Never fails from the current table; kept fallible like every transition.
    pub fn begin(&mut self) -> Result<(), SessionError> {
        self.focused = true;
        self.disposed = false;
        match self.state {
            FieldState::Idle | FieldState::Saved => {
                self.display.cancel();
                self.transition(FieldState::Editing)
            }
            _ => Ok(()),
        }
    }

    /// Keystroke: replace the buffer and restart the debounce countdown
    ///
    /// `value` must already be validated for the path.
    ///
    /// # Errors
    /// [`SessionError::IllegalTransition`] if the table forbids entering `editing`.
    pub fn input(&mut self, value: FieldValue, now: Instant) -> Result<(), SessionError> {
        self.transition(FieldState::Editing)?;
        self.focused = true;
        self.disposed = false;
        self.display.cancel();
        self.buffer = value;
        self.debounce.arm(now);
        Ok(())
    }

    /// Consume a due debounce; true if a save should be dispatched
    ///
    /// While another save is in flight the request becomes a follow-up.
    pub fn take_due(&mut self, now: Instant) -> bool {
        if !(self.debounce.take_if_due(now) && self.state == FieldState::Editing && self.is_dirty()) {
            return false;
        }
        if self.in_flight.is_some() {
            self.follow_up = true;
            return false;
        }
        true
    }

    /// Save now, or once the in-flight save has returned
    ///
    /// # Errors
    /// [`SessionError::IllegalTransition`] unless the session is editing or in error.
    pub fn request_save(&mut self) -> Result<Option<SaveTicket>, SessionError> {
        if self.in_flight.is_some() {
            validate_transition(self.path, self.state, FieldState::Saving)?;
            self.debounce.cancel();
            self.follow_up = true;
            return Ok(None);
        }
        self.start_save().map(Some)
    }

    /// Ticket for a save requested while the previous one was in flight
    pub fn take_follow_up(&mut self) -> Option<SaveTicket> {
        if !self.follow_up || self.in_flight.is_some() {
            return None;
        }
        self.follow_up = false;
        if self.state == FieldState::Editing && self.is_dirty() {
            self.start_save().ok()
        } else {
            None
        }
    }

    /// Enter `saving` and hand out the ticket for the gateway call
    ///
    /// # Errors
    /// [`SessionError::IllegalTransition`] unless the session is editing or
    /// in error, or while another save is in flight.
    pub fn start_save(&mut self) -> Result<SaveTicket, SessionError> {
        if self.in_flight.is_some() {
            return Err(SessionError::IllegalTransition {
                path: self.path,
                from: self.state,
                to: FieldState::Saving,
            });
        }
        self.transition(FieldState::Saving)?;
        self.debounce.cancel();
        self.next_ticket += 1;
        self.in_flight = Some(InFlight {
            id: self.next_ticket,
            value: self.buffer.clone(),
        });
        self.last_error = None;
        Ok(SaveTicket {
            id: self.next_ticket,
            session: self.generation,
            path: self.path,
            value: self.buffer.clone(),
            baseline: self.persisted.clone(),
        })
    }

    /// Apply the gateway result for `ticket`
    pub fn complete(
        &mut self,
        ticket: &SaveTicket,
        result: Result<(), SyncError>,
        now: Instant,
    ) -> Completion {
        let current = self.in_flight.as_ref().is_some_and(|f| f.id == ticket.id);
        if ticket.session != self.generation || !current {
            return Completion::Stale;
        }
        self.in_flight = None;

        match result {
            Ok(()) => {
                self.persisted = ticket.value.clone();
                if self.state == FieldState::Saving {
                    self.state = FieldState::Saved;
                    self.display.arm(now);
                    Completion::Saved
                } else {
                    Completion::Superseded
                }
            }
            Err(err) => {
                if self.state == FieldState::Saving {
                    self.state = FieldState::Error;
                    self.last_error = Some(err);
                    Completion::Failed
                } else {
                    Completion::Superseded
                }
            }
        }
    }

    /// Saved display window elapsed; true if the session returned to `idle`
    pub fn expire(&mut self, now: Instant) -> bool {
        if self.state == FieldState::Saved && self.display.take_if_due(now) {
            self.state = FieldState::Idle;
            true
        } else {
            false
        }
    }

    /// Escape: drop the buffer and return the value to restore
    ///
    /// # Errors
    /// [`SessionError::IllegalTransition`] while a save is in flight.
    pub fn cancel(&mut self) -> Result<FieldValue, SessionError> {
        if !matches!(self.state, FieldState::Idle | FieldState::Saved) {
            self.transition(FieldState::Idle)?;
            self.debounce.cancel();
            self.buffer = self.persisted.clone();
            self.last_error = None;
        }
        self.focused = false;
        Ok(self.persisted.clone())
    }

    /// Navigate away: drop focus, the debounce and any unsent buffer
    ///
    /// Returns the value the store should show: the in-flight value while a
    /// save is on the wire, otherwise the persisted one.
    pub fn dispose(&mut self) -> FieldValue {
        self.disposed = true;
        self.focused = false;
        self.follow_up = false;
        self.debounce.cancel();
        self.buffer = match &self.in_flight {
            Some(flight) => flight.value.clone(),
            None => self.persisted.clone(),
        };
        self.buffer.clone()
    }

    /// Focus lost with nothing to save
    pub fn end(&mut self) {
        self.focused = false;
        if self.state == FieldState::Editing && !self.is_dirty() {
            self.debounce.cancel();
            self.state = FieldState::Idle;
        }
    }

    /// Accept a server value after a reload; the buffer is kept only if it holds local intent
    pub fn rebase(&mut self, server: FieldValue) {
        if !self.holds_local_intent() {
            self.buffer = server.clone();
        }
        self.persisted = server;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use canvas_model::{ItemField, ItemId};

    const DEBOUNCE: Duration = Duration::from_millis(2000);

    fn session() -> FieldSession {
        FieldSession::open(
            FieldPath::item(ItemId::new(), ItemField::Description),
            FieldValue::text("old"),
            DEBOUNCE,
            Duration::from_millis(2000),
        )
    }

    fn failure(path: FieldPath) -> SyncError {
        SyncError::FieldSave {
            path,
            source: GatewayError::Transport("down".into()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_fires_once_after_quiet_period() {
        let mut s = session();
        s.begin().unwrap();
        s.input(FieldValue::text("A"), Instant::now()).unwrap();
        tokio::time::advance(Duration::from_millis(100)).await;
        s.input(FieldValue::text("AB"), Instant::now()).unwrap();

        tokio::time::advance(Duration::from_millis(1999)).await;
        assert!(!s.take_due(Instant::now()));
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(s.take_due(Instant::now()));
        assert!(!s.take_due(Instant::now()));

        let ticket = s.start_save().unwrap();
        assert_eq!(ticket.value, FieldValue::text("AB"));
        assert_eq!(ticket.baseline, FieldValue::text("old"));
        assert_eq!(s.status(), SaveStatus::Saving);
    }

    #[tokio::test(start_paused = true)]
    async fn save_success_then_display_window() {
        let mut s = session();
        s.input(FieldValue::text("new"), Instant::now()).unwrap();
        let ticket = s.start_save().unwrap();
        s.end();
        assert_eq!(s.complete(&ticket, Ok(()), Instant::now()), Completion::Saved);
        assert_eq!(s.persisted(), &FieldValue::text("new"));
        assert_eq!(s.status(), SaveStatus::Saved);

        tokio::time::advance(Duration::from_millis(2000)).await;
        assert!(s.expire(Instant::now()));
        assert_eq!(s.state(), FieldState::Idle);
        assert!(s.is_finished());
    }

    #[test]
    fn failure_keeps_buffer_and_retry_resubmits_it() {
        let mut s = session();
        s.input(FieldValue::text("new"), Instant::now()).unwrap();
        let ticket = s.start_save().unwrap();
        let completion = s.complete(&ticket, Err(failure(s.path())), Instant::now());
        assert_eq!(completion, Completion::Failed);
        assert_eq!(s.status(), SaveStatus::Error);
        assert_eq!(s.buffer(), &FieldValue::text("new"));
        assert!(s.last_error().is_some());

        let retry = s.start_save().unwrap();
        assert_eq!(retry.value, ticket.value);
        assert_ne!(retry.id, ticket.id);
    }

    #[test]
    fn cancel_restores_persisted_value() {
        let mut s = session();
        s.begin().unwrap();
        s.input(FieldValue::text("typo"), Instant::now()).unwrap();
        let restored = s.cancel().unwrap();
        assert_eq!(restored, FieldValue::text("old"));
        assert_eq!(s.state(), FieldState::Idle);
        assert!(!s.is_dirty());
        assert!(s.deadline().is_none());
    }

    #[test]
    fn cancel_while_saving_is_illegal() {
        let mut s = session();
        s.input(FieldValue::text("x"), Instant::now()).unwrap();
        s.start_save().unwrap();
        assert!(matches!(
            s.cancel(),
            Err(SessionError::IllegalTransition { from: FieldState::Saving, .. })
        ));
    }

    #[test]
    fn start_save_from_idle_is_illegal() {
        let mut s = session();
        assert!(s.start_save().is_err());
    }

    #[test]
    fn ticket_from_another_session_is_stale() {
        let mut old = session().with_generation(1);
        old.input(FieldValue::text("first"), Instant::now()).unwrap();
        let foreign = old.start_save().unwrap();

        let mut s = FieldSession::open(old.path(), FieldValue::text("first"), DEBOUNCE, DEBOUNCE)
            .with_generation(2);
        s.input(FieldValue::text("second"), Instant::now()).unwrap();
        let own = s.start_save().unwrap();
        assert_eq!(own.id, foreign.id);

        assert_eq!(s.complete(&foreign, Ok(()), Instant::now()), Completion::Stale);
        assert_eq!(s.state(), FieldState::Saving);
        assert_eq!(s.complete(&own, Ok(()), Instant::now()), Completion::Saved);
        assert_eq!(s.persisted(), &FieldValue::text("second"));
    }

    #[test]
    fn save_requested_in_flight_waits_for_the_result() {
        let mut s = session();
        s.input(FieldValue::text("a"), Instant::now()).unwrap();
        let first = s.start_save().unwrap();
        s.input(FieldValue::text("ab"), Instant::now()).unwrap();

        assert!(s.start_save().is_err());
        assert_eq!(s.request_save().unwrap(), None);
        assert!(s.take_follow_up().is_none());

        assert_eq!(s.complete(&first, Ok(()), Instant::now()), Completion::Superseded);
        let second = s.take_follow_up().unwrap();
        assert_eq!(second.value, FieldValue::text("ab"));
        assert!(s.take_follow_up().is_none());
        assert_eq!(s.complete(&second, Ok(()), Instant::now()), Completion::Saved);
        assert_eq!(s.persisted(), &FieldValue::text("ab"));
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_during_flight_becomes_follow_up() {
        let mut s = session();
        s.input(FieldValue::text("a"), Instant::now()).unwrap();
        let first = s.start_save().unwrap();
        s.input(FieldValue::text("ab"), Instant::now()).unwrap();
        tokio::time::advance(DEBOUNCE).await;
        assert!(!s.take_due(Instant::now()));

        s.complete(&first, Err(failure(s.path())), Instant::now());
        assert_eq!(s.take_follow_up().unwrap().value, FieldValue::text("ab"));
    }

    #[test]
    fn dispose_in_flight_shows_sent_value_until_done() {
        let mut s = session();
        s.begin().unwrap();
        s.input(FieldValue::text("sent"), Instant::now()).unwrap();
        let ticket = s.start_save().unwrap();
        s.input(FieldValue::text("unsent"), Instant::now()).unwrap();

        assert_eq!(s.dispose(), FieldValue::text("sent"));
        assert!(s.is_disposed());
        assert!(!s.is_finished());
        s.complete(&ticket, Err(failure(s.path())), Instant::now());
        assert!(s.is_finished());
        assert_eq!(s.persisted(), &FieldValue::text("old"));
    }

    #[test]
    fn begin_revives_disposed_session() {
        let mut s = session();
        s.input(FieldValue::text("x"), Instant::now()).unwrap();
        s.start_save().unwrap();
        s.dispose();
        s.begin().unwrap();
        assert!(!s.is_disposed());
        assert!(s.is_focused());
    }

    #[test]
    fn edit_during_save_supersedes_result() {
        let mut s = session();
        s.input(FieldValue::text("a"), Instant::now()).unwrap();
        let ticket = s.start_save().unwrap();
        s.input(FieldValue::text("ab"), Instant::now()).unwrap();

        assert_eq!(s.complete(&ticket, Ok(()), Instant::now()), Completion::Superseded);
        assert_eq!(s.state(), FieldState::Editing);
        assert_eq!(s.persisted(), &FieldValue::text("a"));
        assert!(s.is_dirty());
    }

    #[test]
    fn end_with_clean_buffer_returns_to_idle() {
        let mut s = session();
        s.begin().unwrap();
        s.end();
        assert!(s.is_finished());
    }

    #[test]
    fn rebase_keeps_local_intent() {
        let mut s = session();
        s.input(FieldValue::text("mine"), Instant::now()).unwrap();
        s.rebase(FieldValue::text("server"));
        assert_eq!(s.buffer(), &FieldValue::text("mine"));
        assert_eq!(s.persisted(), &FieldValue::text("server"));

        let mut idle = session();
        idle.rebase(FieldValue::text("server"));
        assert_eq!(idle.buffer(), &FieldValue::text("server"));
    }
}
