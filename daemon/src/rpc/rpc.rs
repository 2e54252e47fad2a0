// Inter-node API handlers
//
// The event intake accepts either a raw EventEnvelope or the gzip+base64
// wrapper the propagation layer produces; duplicates still answer 2xx so
// the sender never retries something we already hold. Explorer endpoints
// serve blocks, ranges, headers and snapshots to syncing peers.

use actix_web::{web, HttpResponse};
use log::{debug, trace};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use stratos_common::{
    api::{
        BlockHeadersResponse, BlockPayload, BlocksRangeResponse, EventEnvelope,
        HasSnapshotResponse,
    },
    block::{BlockHeader, BlockHeight},
};

use crate::{
    core::storage::Storage,
    p2p::{
        compression::{gunzip_base64, CompressedBody, GZIP_BASE64_ENCODING},
        event::SubmitOutcome,
    },
};

use super::{ApiContext, ApiError};

type Context<S> = web::Data<Arc<ApiContext<S>>>;

/// POST /api/sync/events
pub async fn receive_event<S: Storage>(
    context: Context<S>,
    body: web::Bytes,
) -> Result<HttpResponse, ApiError> {
    // the body is either the envelope itself or a compression wrapper
    let envelope: EventEnvelope = match serde_json::from_slice::<CompressedBody>(&body) {
        Ok(wrapper) if wrapper.encoding == GZIP_BASE64_ENCODING => {
            let raw = gunzip_base64(&wrapper.data)
                .map_err(|error| ApiError::BadParameter(error.to_string()))?;
            serde_json::from_slice(&raw)
                .map_err(|error| ApiError::BadParameter(error.to_string()))?
        }
        _ => serde_json::from_slice(&body)
            .map_err(|error| ApiError::BadParameter(error.to_string()))?,
    };

    trace!(
        "inbound event {} ({}) from {}",
        envelope.id,
        envelope.event_type,
        envelope.source_node
    );
    match context.event_sync.ingest(envelope).await? {
        SubmitOutcome::Accepted => Ok(HttpResponse::Ok().json(json!({ "status": "accepted" }))),
        SubmitOutcome::Duplicate => {
            Ok(HttpResponse::Ok().json(json!({ "status": "duplicate" })))
        }
        SubmitOutcome::Backpressure => Err(ApiError::Backpressure),
    }
}

#[derive(Deserialize)]
pub struct BlockQuery {
    block_id: BlockHeight,
}

/// GET /api/explorer/get_block?block_id=H
pub async fn get_block<S: Storage>(
    context: Context<S>,
    query: web::Query<BlockQuery>,
) -> Result<HttpResponse, ApiError> {
    let block = context
        .chain
        .get_block_by_height(query.block_id)
        .await?
        .ok_or(ApiError::BlockNotFound)?;
    Ok(HttpResponse::Ok().json(BlockPayload::from(&block)))
}

#[derive(Deserialize)]
pub struct RangeQuery {
    start: BlockHeight,
    end: BlockHeight,
}

/// GET /api/explorer/get_blocks_range?start=A&end=B
pub async fn get_blocks_range<S: Storage>(
    context: Context<S>,
    query: web::Query<RangeQuery>,
) -> Result<HttpResponse, ApiError> {
    let (start, end) = clamp_range(query.start, query.end, context.max_range)?;
    let mut blocks = Vec::new();
    for height in start..=end {
        match context.chain.get_block_by_height(height).await? {
            Some(block) => blocks.push(BlockPayload::from(&block)),
            None => break,
        }
    }
    debug!("serving {} blocks for range [{}, {}]", blocks.len(), start, end);
    Ok(HttpResponse::Ok().json(BlocksRangeResponse { blocks }))
}

/// GET /api/explorer/get_block_headers?start=A&end=B
pub async fn get_block_headers<S: Storage>(
    context: Context<S>,
    query: web::Query<RangeQuery>,
) -> Result<HttpResponse, ApiError> {
    let (start, end) = clamp_range(query.start, query.end, context.max_range)?;
    let mut headers: Vec<BlockHeader> = Vec::new();
    for height in start..=end {
        match context.chain.get_block_by_height(height).await? {
            Some(block) => headers.push(block.header().clone()),
            None => break,
        }
    }
    Ok(HttpResponse::Ok().json(BlockHeadersResponse { headers }))
}

#[derive(Deserialize)]
pub struct SnapshotQuery {
    height: BlockHeight,
}

/// GET /api/explorer/has_state_snapshot?height=H
pub async fn has_state_snapshot<S: Storage>(
    context: Context<S>,
    query: web::Query<SnapshotQuery>,
) -> Result<HttpResponse, ApiError> {
    let exists = context.snapshots.has_snapshot_at(query.height)?;
    Ok(HttpResponse::Ok().json(HasSnapshotResponse { exists }))
}

/// GET /api/explorer/get_state_snapshot?height=H
pub async fn get_state_snapshot<S: Storage>(
    context: Context<S>,
    query: web::Query<SnapshotQuery>,
) -> Result<HttpResponse, ApiError> {
    let document = context
        .snapshots
        .load_at(query.height)?
        .ok_or(ApiError::SnapshotNotFound)?;
    Ok(HttpResponse::Ok().json(document))
}

fn clamp_range(
    start: BlockHeight,
    end: BlockHeight,
    max_range: u64,
) -> Result<(BlockHeight, BlockHeight), ApiError> {
    if end < start {
        return Err(ApiError::BadParameter(format!(
            "end {} precedes start {}",
            end, start
        )));
    }
    // never serve more than one sync batch per request
    Ok((start, end.min(start + max_range.saturating_sub(1))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_range() {
        assert_eq!(clamp_range(10, 20, 100).unwrap(), (10, 20));
        assert_eq!(clamp_range(10, 500, 100).unwrap(), (10, 109));
        assert!(clamp_range(20, 10, 100).is_err());
    }
}
