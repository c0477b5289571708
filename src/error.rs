//! Engine error type
//!
//! One enum for every failure an actor can report. Errors travel as messages
//! (see `core::actor::ErrorReport`), so the type is `Clone` and carries
//! strings rather than source errors.

use std::fmt;

/// Engine errors
#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Container could not be opened or has no usable video stream
    Media(String),
    /// Seek or decode failed on an open container
    Decode(String),
    /// No evictable block left when a fetch was required
    CacheExhausted { blocks: usize, requested_seq: u64 },
    /// Tunables violate a startup precondition
    Config(String),
    /// Audio output device failure
    Device(String),
    /// A handler panicked; the actor was stopped
    ActorPanicked { actor: &'static str, message: String },
    /// Worker thread could not be spawned
    Spawn(String),
}

impl EngineError {
    /// Errors that end the current video load.
    ///
    /// Device errors do not: playback continues without sound.
    pub fn is_fatal_for_load(&self) -> bool {
        !matches!(self, EngineError::Device(_))
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Media(e) => write!(f, "Media error: {}", e),
            EngineError::Decode(e) => write!(f, "Decode error: {}", e),
            EngineError::CacheExhausted { blocks, requested_seq } => write!(
                f,
                "Frame cache exhausted: all {} blocks in use while fetching frame {}",
                blocks, requested_seq
            ),
            EngineError::Config(e) => write!(f, "Config error: {}", e),
            EngineError::Device(e) => write!(f, "Audio device error: {}", e),
            EngineError::ActorPanicked { actor, message } => {
                write!(f, "Actor '{}' panicked: {}", actor, message)
            }
            EngineError::Spawn(e) => write!(f, "Failed to spawn actor thread: {}", e),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Spawn(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_errors_are_not_fatal() {
        assert!(!EngineError::Device("gone".into()).is_fatal_for_load());
        assert!(EngineError::Decode("bad packet".into()).is_fatal_for_load());
        assert!(
            EngineError::CacheExhausted { blocks: 2, requested_seq: 16 }.is_fatal_for_load()
        );
    }

    #[test]
    fn test_display_mentions_context() {
        let err = EngineError::CacheExhausted { blocks: 4, requested_seq: 99 };
        let text = err.to_string();
        assert!(text.contains("4 blocks"));
        assert!(text.contains("99"));
    }
}
