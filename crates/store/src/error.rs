use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("row not found: {0}")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl From<StoreError> for nieuws_core::Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => {
                nieuws_core::Error::InvalidInput(format!("not found: {what}"))
            }
            other => nieuws_core::Error::Storage(other.to_string()),
        }
    }
}
