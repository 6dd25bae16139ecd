use std::path::PathBuf;

/// Errors surfaced by the coordination store, per spec §7's concept-level
/// error kinds (`NOT_FOUND`, `ALREADY_EXISTS`, `VERSION_CONFLICT`).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("document not found: {collection}/{id}")]
    NotFound { collection: &'static str, id: String },

    #[error("document already exists: {collection}/{id}")]
    AlreadyExists { collection: &'static str, id: String },

    #[error(
        "version conflict on {collection}/{id}: expected {expected}, found {found}"
    )]
    VersionConflict {
        collection: &'static str,
        id: String,
        expected: u64,
        found: u64,
    },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to (de)serialize document at {path}: {source}")]
    Serde {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub fn not_found(collection: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            collection,
            id: id.into(),
        }
    }

    pub fn already_exists(collection: &'static str, id: impl Into<String>) -> Self {
        Self::AlreadyExists {
            collection,
            id: id.into(),
        }
    }
}
