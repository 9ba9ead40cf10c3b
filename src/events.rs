//! Application-facing event listeners
//!
//! Listeners subscribe by event name and are called in subscription order.
//! There is no unsubscribe.

use parking_lot::RwLock;
use std::sync::Arc;

/// Names applications can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    UserJoin,
    UserLeave,
    UserSpeak,
    AudioSticker,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::UserJoin => "user_join",
            EventKind::UserLeave => "user_leave",
            EventKind::UserSpeak => "user_speak",
            EventKind::AudioSticker => "audio_sticker",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "user_join" => Some(EventKind::UserJoin),
            "user_leave" => Some(EventKind::UserLeave),
            "user_speak" => Some(EventKind::UserSpeak),
            "audio_sticker" => Some(EventKind::AudioSticker),
            _ => None,
        }
    }
}

/// Notification delivered to listeners
#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    UserJoin { id: String },
    UserLeave { id: String },
    UserSpeak { id: String },
    /// A sticker sound was sent; `url` points at the server's static file
    AudioSticker { sticker: String, url: String },
}

impl AppEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            AppEvent::UserJoin { .. } => EventKind::UserJoin,
            AppEvent::UserLeave { .. } => EventKind::UserLeave,
            AppEvent::UserSpeak { .. } => EventKind::UserSpeak,
            AppEvent::AudioSticker { .. } => EventKind::AudioSticker,
        }
    }
}

type Listener = Arc<dyn Fn(&AppEvent) + Send + Sync>;

/// Subscribe-by-name dispatcher
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<(EventKind, Listener)>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, kind: EventKind, listener: F)
    where
        F: Fn(&AppEvent) + Send + Sync + 'static,
    {
        self.listeners.write().push((kind, Arc::new(listener)));
    }

    /// Subscribe using the wire name; returns false for unknown names
    pub fn on_named<F>(&self, name: &str, listener: F) -> bool
    where
        F: Fn(&AppEvent) + Send + Sync + 'static,
    {
        match EventKind::from_name(name) {
            Some(kind) => {
                self.on(kind, listener);
                true
            }
            None => false,
        }
    }

    /// Deliver `event` to every listener of its kind
    pub fn emit(&self, event: &AppEvent) {
        let kind = event.kind();

        // Listeners may subscribe from inside a callback
        let matching: Vec<Listener> = self
            .listeners
            .read()
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, l)| l.clone())
            .collect();

        for listener in matching {
            listener(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }
}
