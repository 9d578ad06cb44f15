// Error module
// Failure taxonomy shared by every stage of the overlay pipeline

use std::path::PathBuf;
use thiserror::Error;

/// Fatal conditions. Every one of them ends the process.
#[derive(Debug, Error)]
pub enum OverlayError {
    /// Bad or missing command line input. Carries the usage text.
    #[error("{0}")]
    Argument(String),

    #[error("file {} does not exist", .0.display())]
    FileNotFound(PathBuf),

    #[error("failed to decode image: {0}")]
    Decode(String),

    /// The decoder succeeded but produced no pixels.
    #[error("decoded image is empty ({width}x{height})")]
    ZeroSizedImage { width: u32, height: u32 },

    #[error("failed to resize image: {0}")]
    Resize(String),

    #[error("shared memory allocation failed: {0}")]
    Allocation(String),

    #[error("{0}")]
    Protocol(String),
}

impl OverlayError {
    /// Process exit status for this error.
    pub fn exit_code(&self) -> i32 {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_are_single_line() {
        let errors = [
            OverlayError::FileNotFound(PathBuf::from("/nope.png")),
            OverlayError::Decode("truncated".into()),
            OverlayError::ZeroSizedImage { width: 0, height: 5 },
            OverlayError::Allocation("name collisions".into()),
            OverlayError::Protocol("output not found: DP-9".into()),
        ];
        for err in &errors {
            let msg = err.to_string();
            assert!(!msg.contains('\n'), "{msg:?}");
            assert_eq!(err.exit_code(), 1);
        }
        assert_eq!(errors[0].to_string(), "file /nope.png does not exist");
    }
}
