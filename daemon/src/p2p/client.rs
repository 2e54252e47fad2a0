// HTTP client for the inter-node API
//
// Thin reqwest wrapper: every call carries an explicit per-peer timeout
// decided by the caller (adaptive timeouts live in the propagation layer,
// not here). Responses are decoded eagerly so transport and decode errors
// both surface as P2pError.

use log::trace;
use reqwest::StatusCode;
use std::time::Duration;

use stratos_common::{
    api::{
        BlockHeadersResponse, BlockPayload, BlocksRangeResponse, EventEnvelope,
        HasSnapshotResponse, SnapshotDocument, HEADER_EVENT_ID, HEADER_EVENT_PRIORITY,
        HEADER_EVENT_TYPE, HEADER_SOURCE_NODE,
    },
    block::BlockHeight,
};

use crate::p2p::{
    compression::maybe_compress,
    error::P2pError,
};

pub struct PeerClient {
    http: reqwest::Client,
    node_id: String,
    enable_compression: bool,
}

impl PeerClient {
    pub fn new(node_id: String, enable_compression: bool) -> Self {
        PeerClient {
            http: reqwest::Client::new(),
            node_id,
            enable_compression,
        }
    }

    /// POST an event envelope to a peer. The body is the raw envelope JSON,
    /// or a gzip+base64 wrapper when compression actually shrinks it.
    pub async fn post_event(
        &self,
        peer_url: &str,
        envelope: &EventEnvelope,
        timeout: Duration,
    ) -> Result<(), P2pError> {
        let url = format!("{}/api/sync/events", peer_url);
        let raw = serde_json::to_vec(envelope).map_err(|error| P2pError::MalformedResponse {
            peer: peer_url.to_string(),
            reason: error.to_string(),
        })?;

        let mut request = self
            .http
            .post(&url)
            .timeout(timeout)
            .header(HEADER_EVENT_PRIORITY, u8::from(envelope.priority).to_string())
            .header(HEADER_SOURCE_NODE, &self.node_id)
            .header(HEADER_EVENT_TYPE, envelope.event_type.to_string())
            .header(HEADER_EVENT_ID, &envelope.id);

        request = match self.enable_compression.then(|| maybe_compress(&raw)).flatten() {
            Some(body) => {
                trace!("event {} compressed for {}", envelope.id, peer_url);
                request.json(&body)
            }
            None => request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(raw),
        };

        let response = request
            .send()
            .await
            .map_err(|error| P2pError::from_reqwest(peer_url, error))?;
        Self::expect_success(peer_url, response.status())
    }

    pub async fn get_block(
        &self,
        peer_url: &str,
        height: BlockHeight,
        timeout: Duration,
    ) -> Result<BlockPayload, P2pError> {
        let url = format!("{}/api/explorer/get_block?block_id={}", peer_url, height);
        self.get_json(peer_url, &url, timeout).await
    }

    /// Ranged download. `Ok(None)` means the peer does not implement the
    /// range endpoint and the caller should fall back to per-block GETs.
    pub async fn get_blocks_range(
        &self,
        peer_url: &str,
        start: BlockHeight,
        end: BlockHeight,
        timeout: Duration,
    ) -> Result<Option<BlocksRangeResponse>, P2pError> {
        let url = format!(
            "{}/api/explorer/get_blocks_range?start={}&end={}",
            peer_url, start, end
        );
        let response = self
            .http
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|error| P2pError::from_reqwest(peer_url, error))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::expect_success(peer_url, response.status())?;
        response
            .json()
            .await
            .map(Some)
            .map_err(|error| P2pError::MalformedResponse {
                peer: peer_url.to_string(),
                reason: error.to_string(),
            })
    }

    pub async fn get_block_headers(
        &self,
        peer_url: &str,
        start: BlockHeight,
        end: BlockHeight,
        timeout: Duration,
    ) -> Result<BlockHeadersResponse, P2pError> {
        let url = format!(
            "{}/api/explorer/get_block_headers?start={}&end={}",
            peer_url, start, end
        );
        self.get_json(peer_url, &url, timeout).await
    }

    pub async fn has_state_snapshot(
        &self,
        peer_url: &str,
        height: BlockHeight,
        timeout: Duration,
    ) -> Result<bool, P2pError> {
        let url = format!(
            "{}/api/explorer/has_state_snapshot?height={}",
            peer_url, height
        );
        let response: HasSnapshotResponse = self.get_json(peer_url, &url, timeout).await?;
        Ok(response.exists)
    }

    pub async fn get_state_snapshot(
        &self,
        peer_url: &str,
        height: BlockHeight,
        timeout: Duration,
    ) -> Result<SnapshotDocument, P2pError> {
        let url = format!(
            "{}/api/explorer/get_state_snapshot?height={}",
            peer_url, height
        );
        self.get_json(peer_url, &url, timeout).await
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        peer_url: &str,
        url: &str,
        timeout: Duration,
    ) -> Result<T, P2pError> {
        trace!("GET {}", url);
        let response = self
            .http
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|error| P2pError::from_reqwest(peer_url, error))?;
        Self::expect_success(peer_url, response.status())?;
        response
            .json()
            .await
            .map_err(|error| P2pError::MalformedResponse {
                peer: peer_url.to_string(),
                reason: error.to_string(),
            })
    }

    fn expect_success(peer_url: &str, status: StatusCode) -> Result<(), P2pError> {
        if status.is_success() {
            Ok(())
        } else {
            Err(P2pError::BadStatus {
                peer: peer_url.to_string(),
                status: status.as_u16(),
            })
        }
    }
}
