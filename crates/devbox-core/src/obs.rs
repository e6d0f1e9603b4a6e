//! Structured events for devbox phases and rebuild sessions.
//!
//! Every provisioning phase reports `phase.started`, then either
//! `phase.finished` with `elapsed_ms` or `phase.failed` with the error chain.
//! Rebuild sessions report `rebuild.*` events keyed by binary group.

use std::error::Error;
use std::time::Instant;

use tracing::{error, info, warn};

/// RAII span for one devbox session.
pub struct SessionSpan {
    _span: tracing::span::EnteredSpan,
}

impl SessionSpan {
    pub fn enter(session: &str) -> Self {
        let span = tracing::info_span!("devbox.session", session = %session);
        Self {
            _span: span.entered(),
        }
    }
}

/// Times one phase and reports its outcome.
///
/// ```ignore
/// let phase = PhaseTimer::start("create namespace");
/// provisioner.create().await?;
/// phase.finish();
/// ```
#[derive(Debug)]
pub struct PhaseTimer {
    phase: String,
    started: Instant,
}

impl PhaseTimer {
    pub fn start(phase: impl Into<String>) -> Self {
        let phase = phase.into();
        info!(event = "phase.started", phase = %phase);
        Self {
            phase,
            started: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn finish(self) -> u64 {
        let elapsed_ms = self.elapsed_ms();
        info!(event = "phase.finished", phase = %self.phase, elapsed_ms = elapsed_ms);
        elapsed_ms
    }

    pub fn fail(self, err: &(dyn Error + 'static)) {
        error!(
            event = "phase.failed",
            phase = %self.phase,
            elapsed_ms = self.elapsed_ms(),
            error = %error_chain(err),
        );
    }
}

/// Render an error and its sources as `outer: inner: root`.
pub fn error_chain(err: &(dyn Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        let text = inner.to_string();
        if !out.ends_with(&text) {
            out.push_str(": ");
            out.push_str(&text);
        }
        source = inner.source();
    }
    out
}

pub fn emit_rebuild_started(group: &str, path: &str) {
    info!(event = "rebuild.started", group = %group, path = %path);
}

pub fn emit_rebuild_finished(group: &str, hash: &str, changed: bool, elapsed_ms: u64) {
    info!(
        event = "rebuild.finished",
        group = %group,
        hash = %hash,
        changed = changed,
        elapsed_ms = elapsed_ms,
    );
}

pub fn emit_rebuild_cancelled(group: &str) {
    info!(event = "rebuild.cancelled", group = %group);
}

pub fn emit_rebuild_failed(group: &str, err: &(dyn Error + 'static)) {
    warn!(event = "rebuild.failed", group = %group, error = %error_chain(err));
}

pub fn emit_teardown_error(step: &str, err: &(dyn Error + 'static)) {
    warn!(event = "teardown.failed", step = %step, error = %error_chain(err));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ClusterError, DevboxError};

    #[test]
    fn phase_timer_reports_elapsed() {
        let phase = PhaseTimer::start("test phase");
        let elapsed = phase.finish();
        assert!(elapsed < 1_000);
    }

    #[test]
    fn error_chain_includes_sources() {
        let err = DevboxError::provisioning("deploy storage", ClusterError::Api("boom".into()));
        let chain = error_chain(&err);
        assert!(chain.starts_with("deploy storage failed"));
        assert!(chain.contains("boom"));
    }

    #[test]
    fn session_span_enters() {
        let _span = SessionSpan::enter("abc");
    }
}
