use thiserror::Error;

/// Failure surfaces of page resolution.
///
/// `NotFound` is the single request-time miss category (unmatched path or
/// alias, invisible page, unknown language) and maps onto a 404.
/// `Configuration` flags a caller wiring mistake. `Internal` carries backend
/// failures from the stores or the template layer.
#[derive(Debug, Error)]
pub enum PageError {
    #[error("page not found: {0}")]
    NotFound(String),
    #[error("improperly configured: {0}")]
    Configuration(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type PageResult<T> = std::result::Result<T, PageError>;

impl PageError {
    pub fn not_found(reason: impl Into<String>) -> Self {
        Self::NotFound(reason.into())
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration(reason.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn status(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::Configuration(_) | Self::Internal(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;

    use super::PageError;

    #[test]
    fn status_codes_follow_error_kind() {
        assert_eq!(PageError::not_found("x").status(), 404);
        assert_eq!(PageError::configuration("x").status(), 500);
        assert_eq!(PageError::from(anyhow!("disk gone")).status(), 500);
    }

    #[test]
    fn display_includes_reason() {
        assert_eq!(
            PageError::not_found("no page at about").to_string(),
            "page not found: no page at about"
        );
        assert_eq!(
            PageError::configuration("path is required").to_string(),
            "improperly configured: path is required"
        );
    }

    #[test]
    fn internal_errors_are_transparent() {
        let error = PageError::from(anyhow!("failed to open pages.db"));
        assert!(!error.is_not_found());
        assert_eq!(error.to_string(), "failed to open pages.db");
    }
}
