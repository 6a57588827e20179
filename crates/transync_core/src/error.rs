use thiserror::Error;

/// Failure classes surfaced by the synchronization pipeline.
///
/// Functions in this crate return `anyhow::Result`; when a failure belongs to
/// one of these classes the root error is a `SyncError`, so callers can
/// `downcast_ref::<SyncError>()` to decide how to report it.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{0}")]
    Configuration(String),
    #[error("errors happened while running {command} on {path}\n{message}")]
    Extraction {
        command: String,
        path: String,
        message: String,
    },
    #[error("{message} (file: {path})")]
    Transform { path: String, message: String },
    #[error("errors happened while running {command} on {path}\n{message}")]
    Merge {
        command: String,
        path: String,
        message: String,
    },
    #[error("failed to ingest {path}: {message}")]
    Ingestion { path: String, message: String },
}

impl SyncError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Extraction { .. } => "extraction",
            Self::Transform { .. } => "transform",
            Self::Merge { .. } => "merge",
            Self::Ingestion { .. } => "ingestion",
        }
    }
}

/// Returns the taxonomy entry of an error chain, if any layer carries one.
pub fn classify(error: &anyhow::Error) -> Option<&SyncError> {
    error.chain().find_map(|cause| cause.downcast_ref::<SyncError>())
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::{SyncError, classify};

    #[test]
    fn classify_finds_sync_error_below_context() {
        let result: anyhow::Result<()> = Err(SyncError::Merge {
            command: "msgmerge -q".to_string(),
            path: "locale/fr/LC_MESSAGES/django.po".to_string(),
            message: "boom".to_string(),
        }
        .into());
        let error = result.context("failed to merge fr").expect_err("must fail");

        let classified = classify(&error).expect("taxonomy entry");
        assert_eq!(classified.kind(), "merge");
        assert!(classified.to_string().contains("msgmerge -q"));
    }

    #[test]
    fn classify_returns_none_for_plain_errors() {
        let error = anyhow::anyhow!("plain");
        assert!(classify(&error).is_none());
    }
}
