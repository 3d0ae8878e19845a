use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("model catalog fetch failed ({status}): {body}")]
    FetchFailed { status: u16, body: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, CatalogError>;
