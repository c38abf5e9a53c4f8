//! Backend readiness tracking
//!
//! The gate starts closed and opens once a line of backend output contains one of
//! the configured markers. It never closes again: a backend that dies after becoming
//! ready takes the whole process down with it instead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// Markers used when the configuration does not override them
pub const DEFAULT_READY_MARKERS: &[&str] = &["listening", "started", "bound"];

/// Shared handle to the readiness gate
pub type SharedGate = Arc<ReadinessGate>;

/// Readiness state of the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessState {
    NotReady,
    Ready,
}

/// Single-writer, many-reader readiness flag.
///
/// Only [`observe`](ReadinessGate::observe) and [`mark_ready`](ReadinessGate::mark_ready)
/// write to it; everything else calls [`is_ready`](ReadinessGate::is_ready), which is a
/// plain atomic load and safe to call right before a routing decision.
#[derive(Debug)]
pub struct ReadinessGate {
    ready: AtomicBool,
    markers: Vec<String>,
}

impl ReadinessGate {
    pub fn new(markers: Vec<String>) -> Self {
        Self {
            ready: AtomicBool::new(false),
            markers,
        }
    }

    /// Create a gate wrapped in an `Arc` for sharing between tasks
    pub fn shared(markers: Vec<String>) -> SharedGate {
        Arc::new(Self::new(markers))
    }

    /// Inspect one line of backend output.
    ///
    /// Matching is a case-sensitive substring search. Returns true only for the call
    /// that actually flipped the gate.
    pub fn observe(&self, line: &str) -> bool {
        if self.is_ready() {
            return false;
        }

        match self.markers.iter().find(|m| line.contains(m.as_str())) {
            Some(marker) => {
                let flipped = self.flip();
                if flipped {
                    info!(marker = %marker, line, "Backend signaled readiness");
                }
                flipped
            }
            None => false,
        }
    }

    /// Open the gate without a marker line
    pub fn mark_ready(&self) -> bool {
        let flipped = self.flip();
        if flipped {
            info!("Backend marked ready");
        }
        flipped
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ReadinessState {
        if self.is_ready() {
            ReadinessState::Ready
        } else {
            ReadinessState::NotReady
        }
    }

    pub fn markers(&self) -> &[String] {
        &self.markers
    }

    fn flip(&self) -> bool {
        self.ready
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new(DEFAULT_READY_MARKERS.iter().map(|m| m.to_string()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_not_ready() {
        let gate = ReadinessGate::default();
        assert!(!gate.is_ready());
        assert_eq!(gate.state(), ReadinessState::NotReady);
    }

    #[test]
    fn test_marker_flips_gate() {
        let gate = ReadinessGate::default();
        assert!(!gate.observe("loading plugins"));
        assert!(!gate.is_ready());

        assert!(gate.observe("server listening on 127.0.0.1:18789"));
        assert!(gate.is_ready());
        assert_eq!(gate.state(), ReadinessState::Ready);
    }

    #[test]
    fn test_transition_happens_once() {
        let gate = ReadinessGate::default();
        assert!(gate.observe("started"));
        assert!(!gate.observe("started again"));
        assert!(!gate.observe("bound to port"));
        assert!(!gate.mark_ready());
        assert!(gate.is_ready());
    }

    #[test]
    fn test_markers_are_case_sensitive() {
        let gate = ReadinessGate::default();
        assert!(!gate.observe("Server LISTENING"));
        assert!(!gate.observe("Started"));
        assert!(!gate.is_ready());
    }

    #[test]
    fn test_custom_markers() {
        let gate = ReadinessGate::new(vec!["accepting connections".to_string()]);
        assert!(!gate.observe("listening"));
        assert!(gate.observe("db: accepting connections"));
        assert_eq!(gate.markers(), &["accepting connections".to_string()]);
    }

    #[test]
    fn test_never_reverts() {
        let gate = ReadinessGate::default();
        gate.mark_ready();
        for line in ["error: crashed", "", "shutting down"] {
            gate.observe(line);
            assert!(gate.is_ready());
        }
    }

    #[test]
    fn test_concurrent_observers_flip_once() {
        let gate = Arc::new(ReadinessGate::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gate = Arc::clone(&gate);
                std::thread::spawn(move || gate.observe("listening"))
            })
            .collect();

        let flips = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|flipped| *flipped)
            .count();
        assert_eq!(flips, 1);
        assert!(gate.is_ready());
    }
}
