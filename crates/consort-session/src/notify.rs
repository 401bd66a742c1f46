//! Notifications from the module, carried to the audio thread.
//!
//! Modules report parameter changes, latency changes and outgoing MIDI from
//! whatever thread they like (often their own GUI thread). The listener
//! pushes into a bounded lock-free FIFO that the session drains once per
//! block on the audio thread.

use consort_core::{MidiEvent, PluginListener, SysexEvent};
use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    ParamAutomated { index: usize, value: f32 },
    Latency(usize),
    Midi(MidiEvent),
    Sysex(SysexEvent),
}

pub struct NotificationQueue {
    queue: ArrayQueue<Notification>,
    dropped: AtomicUsize,
}

impl NotificationQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            dropped: AtomicUsize::new(0),
        }
    }

    /// Never blocks; a full queue drops the notification.
    pub fn push(&self, notification: Notification) {
        if self.queue.push(notification).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn pop(&self) -> Option<Notification> {
        self.queue.pop()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Dropped notifications since the last call.
    pub fn take_dropped(&self) -> usize {
        self.dropped.swap(0, Ordering::Relaxed)
    }
}

/// [`PluginListener`] feeding a [`NotificationQueue`].
pub struct QueueListener(pub Arc<NotificationQueue>);

impl PluginListener for QueueListener {
    fn parameter_automated(&self, index: usize, value: f32) {
        self.0.push(Notification::ParamAutomated { index, value });
    }

    fn latency_changed(&self, samples: usize) {
        self.0.push(Notification::Latency(samples));
    }

    fn midi_event(&self, event: MidiEvent) {
        self.0.push(Notification::Midi(event));
    }

    fn sysex_event(&self, event: SysexEvent) {
        self.0.push(Notification::Sysex(event));
    }
}
