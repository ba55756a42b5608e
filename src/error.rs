use thiserror::Error;

#[derive(Debug, Error)]
pub enum OssuaryError {
   #[error("Input error: {0}")]
   Input(String),

   #[error("No upstream repository for {ecosystem}:{name}: {reason}")]
   UnresolvedRepo {
      ecosystem: String,
      name:      String,
      reason:    String,
   },

   #[error("Transient collection failure: {0}")]
   Transient(String),

   #[error("Repository gone: {0}")]
   RepoGone(String),

   #[error("Retries exhausted after {retries} attempts: {source}")]
   RetryExhausted {
      retries: u32,
      #[source]
      source:  Box<Self>,
   },

   #[error("Internal invariant violated: {0}")]
   Invariant(String),

   #[error("Git command failed: {0}")]
   Git(String),

   #[error("Cache error: {0}")]
   Cache(#[from] rusqlite::Error),

   #[error("IO error: {0}")]
   Io(#[from] std::io::Error),

   #[error("JSON error: {0}")]
   Json(#[from] serde_json::Error),

   #[error("HTTP error: {0}")]
   Http(#[from] reqwest::Error),
}

impl OssuaryError {
   /// CLI exit code: 1 unresolved/gone repo, 2 transient/internal, 3 bad input.
   pub const fn exit_code(&self) -> i32 {
      match self {
         Self::UnresolvedRepo { .. } | Self::RepoGone(_) => 1,
         Self::Input(_) => 3,
         _ => 2,
      }
   }

   /// Whether the orchestrator may degrade around this failure instead of
   /// propagating it.
   pub const fn is_transient(&self) -> bool {
      matches!(self, Self::Transient(_) | Self::Http(_) | Self::RetryExhausted { .. })
   }
}

pub type Result<T> = std::result::Result<T, OssuaryError>;
