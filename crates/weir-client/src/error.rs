// Error type for the streaming layer.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArg(String),
    #[error("timeout must be strictly positive")]
    InvalidTimeout,
    #[error("request timed out")]
    Timeout,
    #[error("stalled with too many outstanding asynchronously published messages")]
    Stalled,
    #[error("not found")]
    NotFound,
    #[error("illegal state: {0}")]
    IllegalState(String),
    #[error("no responders available for request")]
    NoResponders,
    #[error("consumer sequence mismatch")]
    Mismatch,
    #[error("invalid subscription: {0}")]
    InvalidSubscription(String),
    /// Error reported by the streaming service in an API response envelope.
    #[error("{description} (err_code {err_code})")]
    Api {
        code: i64,
        err_code: u16,
        description: String,
    },
    /// Unexpected status message on a pull subscription.
    #[error("{description} (status {status})")]
    ServerStatus { status: u16, description: String },
    #[error("no stream matches subject '{0}'")]
    NoStreamMatch(String),
    #[error("invalid acknowledgment subject '{0}'")]
    InvalidAckSubject(String),
    #[error("subject '{subject}' does not match consumer filter subject '{filter}'")]
    FilterMismatch { subject: String, filter: String },
    #[error("a queue subscription cannot be created for a consumer with heartbeats")]
    QueueHeartbeat,
    #[error("a queue subscription cannot be created for a consumer with flow control")]
    QueueFlowControl,
    #[error("cannot pull subscribe to a push based consumer")]
    PullToPushConsumer,
    #[error("must use pull subscribe to bind to a pull based consumer")]
    PullSubscribeRequired,
    #[error("cannot create a queue subscription for a consumer without a deliver group")]
    QueueWithoutDeliverGroup,
    #[error("consumer is already bound to a subscription")]
    ConsumerBound,
    #[error("cannot create a subscription for a consumer with a deliver group '{0}'")]
    DeliverGroupRequiresQueue(String),
    #[error(
        "cannot create a queue subscription '{queue}' for a consumer with a deliver group '{group}'"
    )]
    DeliverGroupMismatch { queue: String, group: String },
    #[error("configuration requests {field} to be {requested}, but consumer's value is {server}")]
    ConfigMismatch {
        field: &'static str,
        requested: String,
        server: String,
    },
    #[error(transparent)]
    Core(weir_core::Error),
    #[error("malformed API response: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<weir_core::Error> for Error {
    fn from(err: weir_core::Error) -> Self {
        match err {
            weir_core::Error::Timeout => Error::Timeout,
            weir_core::Error::NoResponders => Error::NoResponders,
            other => Error::Core(other),
        }
    }
}

impl Error {
    /// Server error code carried by an API error response, if any.
    pub fn err_code(&self) -> Option<u16> {
        match self {
            Error::Api { err_code, .. } => Some(*err_code),
            _ => None,
        }
    }
}
