use thiserror::Error;

/// Network-level failure while retrieving one document.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },
    #[error("transport error for {url}: {message}")]
    Transport { url: String, message: String },
}

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("document is empty")]
    Empty,
    #[error("document is not markup")]
    NotMarkup,
}

/// The identification section yielded no subject name.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("document has no identification data")]
pub struct EmptyDocument;

/// One field of one block could not be extracted. Never aborts the block.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FieldExtractionError {
    #[error("field `{field}`: offset +{offset} after `{anchor}` is past the end of the block")]
    OffsetOutOfRange {
        field: String,
        anchor: String,
        offset: usize,
    },
    #[error("field `{field}`: cannot read {value:?} as {kind}")]
    TypeParse {
        field: String,
        value: String,
        kind: &'static str,
    },
}

/// Record-level failure inside the persistence layer.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("no valid columns left for table `{0}`")]
    NoValidColumns(String),
    #[error("no key columns resolvable for table `{0}`")]
    NoKeyColumns(String),
    #[error("schema introspection failed for `{table}`: {source}")]
    Introspection {
        table: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("transaction rolled back: {0}")]
    Transaction(#[from] rusqlite::Error),
}
