use thiserror::Error;

use stratos_common::time::TimestampSeconds;

#[derive(Debug, Error)]
pub enum P2pError {
    #[error("request to {peer} timed out after {millis}ms")]
    Timeout { peer: String, millis: u64 },
    #[error("request to {peer} failed: {reason}")]
    RequestFailed { peer: String, reason: String },
    #[error("peer {peer} answered {status}")]
    BadStatus { peer: String, status: u16 },
    #[error("malformed response from {peer}: {reason}")]
    MalformedResponse { peer: String, reason: String },
    #[error("circuit open for peer {0}")]
    CircuitOpen(String),
    #[error("peer {peer} suppressed until {until} after repeated failures")]
    PeerSuppressed { peer: String, until: TimestampSeconds },
    #[error("no peer available for {0}")]
    NoPeerAvailable(String),
    #[error("all {attempts} failover attempts failed: {last}")]
    AllAttemptsFailed { attempts: usize, last: String },
    #[error("unknown peer {0}")]
    UnknownPeer(String),
}

impl P2pError {
    pub fn from_reqwest(peer: &str, error: reqwest::Error) -> Self {
        if error.is_timeout() {
            P2pError::Timeout {
                peer: peer.to_string(),
                millis: 0,
            }
        } else if let Some(status) = error.status() {
            P2pError::BadStatus {
                peer: peer.to_string(),
                status: status.as_u16(),
            }
        } else if error.is_decode() {
            P2pError::MalformedResponse {
                peer: peer.to_string(),
                reason: error.to_string(),
            }
        } else {
            P2pError::RequestFailed {
                peer: peer.to_string(),
                reason: error.to_string(),
            }
        }
    }
}
