//! Commands that arrive before their session exists.
//!
//! Depending on scheduling order, a host may deliver commands to a unit whose
//! session has not been constructed yet. A [`SessionSlot`] starts out pending
//! and queues those commands; construction replays them in arrival order.

use crate::command::Command;
use crate::session::{PluginSession, SessionBuilder};
use consort_core::{HostError, Result};
use std::collections::VecDeque;

#[derive(Debug)]
pub enum SessionSlot {
    Pending(VecDeque<Command>),
    Ready(PluginSession),
}

impl Default for SessionSlot {
    fn default() -> Self {
        SessionSlot::Pending(VecDeque::new())
    }
}

impl SessionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a command now, or queue it until construction.
    pub fn command(&mut self, command: Command) {
        match self {
            SessionSlot::Pending(queue) => {
                tracing::debug!("Session not constructed yet, queueing {}", command.name());
                queue.push_back(command);
            }
            SessionSlot::Ready(session) => session.command(command),
        }
    }

    /// Build the session and replay queued commands, oldest first.
    ///
    /// On failure the slot stays pending with its queue intact.
    pub fn construct(&mut self, builder: SessionBuilder) -> Result<()> {
        let SessionSlot::Pending(queue) = self else {
            return Err(HostError::Busy("session already constructed".into()));
        };
        let mut session = builder.build()?;
        if !queue.is_empty() {
            tracing::debug!("Replaying {} queued commands", queue.len());
        }
        for command in queue.drain(..) {
            session.command(command);
        }
        *self = SessionSlot::Ready(session);
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, SessionSlot::Ready(_))
    }

    /// Commands waiting for construction.
    pub fn pending(&self) -> usize {
        match self {
            SessionSlot::Pending(queue) => queue.len(),
            SessionSlot::Ready(_) => 0,
        }
    }

    pub fn session(&self) -> Option<&PluginSession> {
        match self {
            SessionSlot::Ready(session) => Some(session),
            SessionSlot::Pending(_) => None,
        }
    }

    pub fn session_mut(&mut self) -> Option<&mut PluginSession> {
        match self {
            SessionSlot::Ready(session) => Some(session),
            SessionSlot::Pending(_) => None,
        }
    }
}
