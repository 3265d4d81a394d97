//! Error taxonomy of the runtime.

use blockflow_dstore::StoreError;

/// Semantic error categories. Consumers dispatch on the variant: transient
/// storage errors have already exhausted their retries by the time they
/// surface here, protocol violations and invalid requests are permanent, and
/// cancellation terminates the response stream verbatim.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("storage: {0}")]
    Storage(#[from] StoreError),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("module {module} at block {block_num}: {source}")]
    ModuleExecution {
        block_num: u64,
        module: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("request canceled")]
    Canceled,
}

impl Error {
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Error::InvalidRequest(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::ProtocolViolation(msg.into())
    }

    pub fn module_execution(
        block_num: u64,
        module: impl Into<String>,
        source: anyhow::Error,
    ) -> Self {
        Error::ModuleExecution {
            block_num,
            module: module.into(),
            source,
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::Canceled)
    }
}
