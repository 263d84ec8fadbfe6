/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// The message does not describe a valid frame.
    #[error("malformed frame: {0}")]
    Malformed(String),
}

impl FrameError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed(reason.into())
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
