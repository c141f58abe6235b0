use std::fmt::{Display, Formatter};

/// Broad classification of an engine error, used by callers to decide
/// between reporting a bad input and reporting an internal defect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GrismErrorCategory {
    InputValidationError,
    ComputationError,
    InternalError,
}

impl GrismErrorCategory {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InputValidationError => "INPUT-VALIDATION",
            Self::ComputationError => "COMPUTATION",
            Self::InternalError => "INTERNAL",
        }
    }
}

impl Display for GrismErrorCategory {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str((*self).as_str())
    }
}

/// Structural error raised when a contract between components is broken.
///
/// Recoverable conditions (degenerate inputs, non-converged fits, physical
/// limit violations) never surface here; they are clamped locally and
/// recorded as warnings and quality flags.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("[{category}] {code}: {message}")]
pub struct GrismError {
    category: GrismErrorCategory,
    code: String,
    message: String,
}

impl GrismError {
    pub fn input_validation(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            category: GrismErrorCategory::InputValidationError,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn computation(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            category: GrismErrorCategory::ComputationError,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            category: GrismErrorCategory::InternalError,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn category(&self) -> GrismErrorCategory {
        self.category
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

pub type GrismResult<T> = Result<T, GrismError>;

#[cfg(test)]
mod tests {
    use super::{GrismError, GrismErrorCategory};

    #[test]
    fn constructors_set_category_and_code() {
        let error = GrismError::input_validation("INPUT.TRACK_SHAPE", "length mismatch");
        assert_eq!(error.category(), GrismErrorCategory::InputValidationError);
        assert_eq!(error.code(), "INPUT.TRACK_SHAPE");

        let error = GrismError::computation("RUN.PROFILE_FIT", "model shape");
        assert_eq!(error.category(), GrismErrorCategory::ComputationError);

        let error = GrismError::internal("BUG.WINDOW", "empty window");
        assert_eq!(error.category(), GrismErrorCategory::InternalError);
    }

    #[test]
    fn display_carries_category_code_and_message() {
        let error = GrismError::input_validation("INPUT.IMAGE_DIMS", "image is 0x0");
        let rendered = error.to_string();
        assert!(rendered.contains("INPUT-VALIDATION"));
        assert!(rendered.contains("INPUT.IMAGE_DIMS"));
        assert!(rendered.contains("image is 0x0"));
    }
}
