use tandem_core::SchemaError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BindingError {
    /// `sync` was handed a shared element and a local node of different
    /// types. Programmer error; never tolerated.
    #[error("shared element `{shared}` cannot be synced with local node `{local}`")]
    NodeNameMismatch { shared: String, local: String },

    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("binding has no view attached")]
    NoView,

    #[error("decode error: {0}")]
    Decode(String),

    #[error("failed to apply update: {0}")]
    Update(String),

    /// Version rendering reads deleted content, which a garbage-collected
    /// document no longer has.
    #[error("cannot read document history: {0}")]
    History(#[from] yrs::error::Error),

    #[error("bound root has no counterpart in the rebuilt document")]
    MissingRoot,
}

impl From<yrs::encoding::read::Error> for BindingError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        BindingError::Decode(e.to_string())
    }
}
