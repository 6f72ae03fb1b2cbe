/// Errors produced by the file distribution layer (spec §4.7).
#[derive(Debug, thiserror::Error)]
pub enum FilesError {
    #[error("file already in flight: {0}")]
    AlreadyInFlight(String),

    #[error("backing file outside files directory: {0}")]
    BackingFileEscapes(String),

    #[error("file not found on any peer: {0}")]
    NotFoundOnMesh(String),

    #[error("content hash mismatch after fetch: {0}")]
    HashMismatch(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FilesError>;

impl FilesError {
    /// spec §7/§9: the "file already in flight" string-matched predicate is
    /// promoted to a named variant; this mirrors the *meaning* of that
    /// predicate (join the in-flight transfer instead of failing) without
    /// any substring matching on a rendered message.
    pub fn is_already_in_flight(&self) -> bool {
        matches!(self, FilesError::AlreadyInFlight(_))
    }
}
