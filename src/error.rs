//! Pipeline error taxonomy.
//!
//! Every fault that crosses a component boundary is one of these kinds, so
//! that logging and the per-(component, kind) metric counters stay uniform.
//! Filter rejections are deliberately *not* errors: a dropped prediction is
//! a normal outcome of the chain.

use thiserror::Error;

/// A fault raised by one of the pipeline components.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or inconsistent configuration. Fatal at startup; reported with
    /// field-path context on reload.
    #[error("config: {field}: {message}")]
    Config { field: String, message: String },

    /// Recoverable capture fault (read timeout, brief underrun, decoder
    /// stall). Handled inside the capture worker.
    #[error("capture[{source}]: transient: {message}")]
    CaptureTransient { source: String, message: String },

    /// Unrecoverable capture fault. The worker exits and the source manager
    /// backs off and retries.
    #[error("capture[{source}]: {message}")]
    CaptureFatal { source: String, message: String },

    /// A single window failed to classify. The window is dropped, never
    /// retried; the sound moment has passed.
    #[error("classify[{source}]: {message}")]
    ClassifyFailed { source: String, message: String },

    /// Clip extraction requested after the ring overwrote the range.
    #[error("clip[{source}]: requested range no longer in ring")]
    ClipExpired { source: String },

    /// Datastore fault. `transient` faults are retried, the rest go to the
    /// deadletter.
    #[error("store: {message}")]
    Persistence { message: String, transient: bool },

    /// Per-sink delivery fault. Retried by the sink, then dropped with a
    /// metric; never propagates to the rest of the pipeline.
    #[error("sink[{sink}]: {message}")]
    SinkDelivery { sink: String, message: String },

    /// Cancellation. Surfaces as clean completion, not a fault.
    #[error("shutting down")]
    Shutdown,
}

impl Error {
    /// Component tag for logs and metric keys.
    pub fn component(&self) -> &'static str {
        match self {
            Error::Config { .. } => "config",
            Error::CaptureTransient { .. } | Error::CaptureFatal { .. } => "capture",
            Error::ClassifyFailed { .. } => "classifier",
            Error::ClipExpired { .. } => "router",
            Error::Persistence { .. } => "store",
            Error::SinkDelivery { .. } => "sink",
            Error::Shutdown => "supervisor",
        }
    }

    /// Kind tag for metric keys, stable across releases.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config { .. } => "config",
            Error::CaptureTransient { .. } => "capture-transient",
            Error::CaptureFatal { .. } => "capture-fatal",
            Error::ClassifyFailed { .. } => "classify-failed",
            Error::ClipExpired { .. } => "clip-expired",
            Error::Persistence { transient: true, .. } => "persistence-transient",
            Error::Persistence { transient: false, .. } => "persistence-permanent",
            Error::SinkDelivery { .. } => "sink-delivery",
            Error::Shutdown => "shutdown",
        }
    }

    /// Source id, for errors scoped to one capture source.
    pub fn source(&self) -> Option<&str> {
        match self {
            Error::CaptureTransient { source, .. }
            | Error::CaptureFatal { source, .. }
            | Error::ClassifyFailed { source, .. }
            | Error::ClipExpired { source } => Some(source),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_distinguish_persistence_classes() {
        let transient = Error::Persistence { message: "busy".into(), transient: true };
        let permanent = Error::Persistence { message: "schema".into(), transient: false };
        assert_eq!(transient.kind(), "persistence-transient");
        assert_eq!(permanent.kind(), "persistence-permanent");
        assert_eq!(transient.component(), "store");
    }

    #[test]
    fn source_is_carried_where_applicable() {
        let e = Error::CaptureFatal { source: "yard".into(), message: "gone".into() };
        assert_eq!(e.source(), Some("yard"));
        assert_eq!(Error::Shutdown.source(), None);
    }
}
