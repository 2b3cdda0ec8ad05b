//! Pre/post notification points around view operations.
//!
//! A [`HookBus`] is owned by the [`Filesystem`](crate::Filesystem) context
//! and shared by every view it hands out. Listeners subscribe with
//! NATS-style subject patterns over `"<phase>.<signal>"` subjects:
//!
//! - `pre.write` matches only pre-write events
//! - `*.delete` matches both phases of delete
//! - `pre.>` matches every pre-hook
//!
//! A pre-hook listener returning [`HookControl::Cancel`] aborts the pending
//! operation before the storage is touched.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Operation a hook is fired for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum HookSignal {
    Read,
    Write,
    Create,
    Update,
    Delete,
    Rename,
    Copy,
    Touch,
    Umount,
}

/// Before or after the storage call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum HookPhase {
    Pre,
    Post,
}

/// What a listener wants the view to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HookControl {
    #[default]
    Continue,
    /// Abort the operation. Only honored for pre-hooks.
    Cancel,
}

/// One hook emission. Paths are relative to the emitting view's root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookEvent {
    pub signal: HookSignal,
    pub phase: HookPhase,
    pub path: String,
    /// Destination for two-path operations (rename, copy).
    pub target: Option<String>,
}

impl HookEvent {
    pub fn new(signal: HookSignal, phase: HookPhase, path: impl Into<String>) -> Self {
        Self {
            signal,
            phase,
            path: path.into(),
            target: None,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Subject used for pattern matching, e.g. `pre.write`.
    pub fn subject(&self) -> String {
        format!("{}.{}", self.phase.as_ref(), self.signal.as_ref())
    }
}

/// Listener callback.
pub type HookListener = Arc<dyn Fn(&HookEvent) -> HookControl + Send + Sync>;

/// Token returned by [`HookBus::connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Registration {
    id: ListenerId,
    pattern: String,
    listener: HookListener,
}

/// Hook dispatcher.
#[derive(Default)]
pub struct HookBus {
    listeners: RwLock<Vec<Registration>>,
    next_id: AtomicU64,
}

impl HookBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for every subject matching `pattern`.
    pub fn connect<F>(&self, pattern: impl Into<String>, listener: F) -> ListenerId
    where
        F: Fn(&HookEvent) -> HookControl + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push(Registration {
            id,
            pattern: pattern.into(),
            listener: Arc::new(listener),
        });
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn disconnect(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|r| r.id != id);
        listeners.len() != before
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Deliver `event` to every matching listener.
    ///
    /// All listeners run even after one cancels; the result is `Cancel` if
    /// any of them asked for it. Listeners may connect or emit from inside
    /// the callback.
    pub fn emit(&self, event: &HookEvent) -> HookControl {
        let subject = event.subject();
        let matching: Vec<HookListener> = self
            .listeners
            .read()
            .iter()
            .filter(|r| matches_pattern(&r.pattern, &subject))
            .map(|r| Arc::clone(&r.listener))
            .collect();

        let mut control = HookControl::Continue;
        for listener in matching {
            if listener(event) == HookControl::Cancel {
                control = HookControl::Cancel;
            }
        }

        if control == HookControl::Cancel {
            tracing::debug!(subject = %subject, path = %event.path, "operation cancelled by hook");
        }
        control
    }
}

impl std::fmt::Debug for HookBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookBus")
            .field("listeners", &self.listener_count())
            .finish_non_exhaustive()
    }
}

/// Check if a subject matches a pattern.
///
/// `*` matches exactly one token, `>` matches one or more trailing tokens.
pub fn matches_pattern(pattern: &str, subject: &str) -> bool {
    let pattern_tokens: Vec<&str> = pattern.split('.').collect();
    let subject_tokens: Vec<&str> = subject.split('.').collect();

    let mut pi = 0;
    let mut si = 0;

    while pi < pattern_tokens.len() && si < subject_tokens.len() {
        match pattern_tokens[pi] {
            ">" => return pi == pattern_tokens.len() - 1,
            "*" => {}
            token if token != subject_tokens[si] => return false,
            _ => {}
        }
        pi += 1;
        si += 1;
    }

    pi == pattern_tokens.len() && si == subject_tokens.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_subject_names() {
        let event = HookEvent::new(HookSignal::Umount, HookPhase::Pre, "/mnt");
        assert_eq!(event.subject(), "pre.umount");
        let event = HookEvent::new(HookSignal::Write, HookPhase::Post, "/a");
        assert_eq!(event.subject(), "post.write");
    }

    #[test]
    fn test_pattern_matching() {
        assert!(matches_pattern("pre.write", "pre.write"));
        assert!(matches_pattern("*.write", "post.write"));
        assert!(matches_pattern("pre.>", "pre.rename"));
        assert!(matches_pattern(">", "post.copy"));
        assert!(!matches_pattern("pre.*", "post.write"));
        assert!(!matches_pattern("pre.write", "pre.write.extra"));
        assert!(!matches_pattern("pre.write.extra", "pre.write"));
    }

    #[test]
    fn test_emit_reaches_matching_listeners_only() {
        let bus = HookBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let log = seen.clone();
        bus.connect("post.*", move |e| {
            log.lock().unwrap().push(e.subject());
            HookControl::Continue
        });

        bus.emit(&HookEvent::new(HookSignal::Write, HookPhase::Pre, "/a"));
        bus.emit(&HookEvent::new(HookSignal::Write, HookPhase::Post, "/a"));
        bus.emit(&HookEvent::new(HookSignal::Delete, HookPhase::Post, "/a"));

        assert_eq!(*seen.lock().unwrap(), vec!["post.write", "post.delete"]);
    }

    #[test]
    fn test_cancel_and_disconnect() {
        let bus = HookBus::new();
        let id = bus.connect("pre.delete", |_| HookControl::Cancel);
        let event = HookEvent::new(HookSignal::Delete, HookPhase::Pre, "/x");

        assert_eq!(bus.emit(&event), HookControl::Cancel);
        assert!(bus.disconnect(id));
        assert!(!bus.disconnect(id));
        assert_eq!(bus.emit(&event), HookControl::Continue);
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn test_listener_may_reenter_bus() {
        let bus = Arc::new(HookBus::new());
        let inner = bus.clone();
        bus.connect("pre.write", move |_| {
            inner.connect("post.write", |_| HookControl::Continue);
            HookControl::Continue
        });
        bus.emit(&HookEvent::new(HookSignal::Write, HookPhase::Pre, "/a"));
        assert_eq!(bus.listener_count(), 2);
    }
}
