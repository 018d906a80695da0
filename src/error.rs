use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("filter `{field}` for tenant {tenant} must be a list, found {found}")]
    InvalidFilterValue {
        tenant: String,
        field: String,
        found: &'static str,
    },
    #[error("invalid predicate on `{field}`: {reason}")]
    InvalidPredicate { field: String, reason: String },
    #[error("limit must be positive, got {0}")]
    InvalidLimit(i64),
    #[error("group stage requires at least one accumulator")]
    EmptyAccumulators,
    #[error("unsupported date format `{0}`")]
    UnsupportedDateFormat(String),
    #[error("invalid collection name `{0}`")]
    InvalidCollection(String),
    #[error("unknown criteria mode `{0}` (expected `in` or `nin`)")]
    UnknownCriteriaMode(String),
    #[error("tenant id list is missing or empty")]
    MissingTenants,
    #[error("no WIP criteria configured for tenant {0}")]
    MissingTenantCriteria(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// True for malformed input supplied by the caller. These are never worth retrying.
    pub fn is_caller_contract(&self) -> bool {
        match self {
            Error::InvalidFilterValue { .. }
            | Error::InvalidPredicate { .. }
            | Error::InvalidLimit(_)
            | Error::EmptyAccumulators
            | Error::UnsupportedDateFormat(_)
            | Error::InvalidCollection(_)
            | Error::UnknownCriteriaMode(_)
            | Error::MissingTenants
            | Error::MissingTenantCriteria(_) => true,
            Error::Context { source, .. } => source.is_caller_contract(),
            _ => false,
        }
    }

    pub(crate) fn invalid_predicate(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidPredicate {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub trait WithContext<T> {
    fn context(self, msg: impl Into<String>) -> Result<T>;
}

impl<T> WithContext<T> for Result<T> {
    fn context(self, msg: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::Context {
            context: msg.into(),
            source: Box::new(e),
        })
    }
}
