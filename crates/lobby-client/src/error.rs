use tokio_tungstenite::tungstenite;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("websocket: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("handshake rejected with status {0}")]
    Rejected(u16),

    #[error("token is not a valid header value")]
    InvalidToken,

    #[error("invalid request name")]
    InvalidName,

    #[error("request {0} aborted")]
    Aborted(String),

    #[error("request {0} timed out")]
    Timeout(String),

    #[error("connection closed")]
    Closed,

    #[error("unexpected reply: {0}")]
    Decode(#[from] serde_json::Error),
}
