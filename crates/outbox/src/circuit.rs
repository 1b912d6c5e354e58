//! Circuit gate consulted before each dispatch.
//!
//! The breaker itself (failure counting, half-open probes) belongs to whoever
//! owns the downstream connection; the dispatcher only asks whether a kind is
//! currently blocked.

use std::collections::HashSet;
use std::sync::RwLock;

use crate::dead_letter::mode_for_kind;

pub trait CircuitGate: Send + Sync {
    /// `true` when deliveries of `kind` must be deferred.
    fn is_open(&self, kind: &str) -> bool;
}

/// Never blocks.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCircuit;

impl CircuitGate for NoCircuit {
    fn is_open(&self, _kind: &str) -> bool {
        false
    }
}

/// Operator-controlled gate, keyed by exact kind or by delivery mode.
///
/// Opening `"email"` blocks every `email.*` kind.
#[derive(Debug, Default)]
pub struct ManualCircuitGate {
    open: RwLock<HashSet<String>>,
}

impl ManualCircuitGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, key: impl Into<String>) {
        if let Ok(mut open) = self.open.write() {
            open.insert(key.into());
        }
    }

    pub fn close(&self, key: &str) {
        if let Ok(mut open) = self.open.write() {
            open.remove(key);
        }
    }
}

impl CircuitGate for ManualCircuitGate {
    fn is_open(&self, kind: &str) -> bool {
        match self.open.read() {
            Ok(open) => open.contains(kind) || open.contains(&mode_for_kind(kind)),
            // A poisoned gate fails closed: deliveries proceed.
            Err(_) => false,
        }
    }
}
