pub mod rpc;

use actix_web::{dev::ServerHandle, web, App, HttpServer};
use anyhow::Context;
use log::info;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::{
    core::{
        blockchain::Blockchain, error::BlockchainError, snapshot::SnapshotManager,
        storage::Storage,
    },
    p2p::event::EventSync,
};

pub type SharedRpcServer = Arc<RpcServer>;

/// Everything the HTTP handlers reach for.
pub struct ApiContext<S: Storage> {
    pub chain: Arc<Blockchain<S>>,
    pub event_sync: Arc<EventSync<S>>,
    pub snapshots: Arc<SnapshotManager>,
    /// Upper bound on one ranged response, mirroring the sync batch size.
    pub max_range: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("missing or invalid parameter: {0}")]
    BadParameter(String),
    #[error("block not found")]
    BlockNotFound,
    #[error("snapshot not found")]
    SnapshotNotFound,
    #[error("event queue saturated")]
    Backpressure,
    #[error(transparent)]
    Chain(#[from] BlockchainError),
}

impl actix_web::ResponseError for ApiError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;
        match self {
            ApiError::BadParameter(_) => StatusCode::BAD_REQUEST,
            ApiError::BlockNotFound | ApiError::SnapshotNotFound => StatusCode::NOT_FOUND,
            ApiError::Backpressure => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Chain(error) if error.is_validation() => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Chain(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> actix_web::HttpResponse {
        actix_web::HttpResponse::build(self.status_code())
            .json(serde_json::json!({ "error": self.to_string() }))
    }
}

pub struct RpcServer {
    handle: Mutex<Option<ServerHandle>>,
}

impl RpcServer {
    /// Bind the inter-node API and start serving in the background.
    pub async fn start<S: Storage>(
        bind_address: &str,
        context: ApiContext<S>,
    ) -> anyhow::Result<SharedRpcServer> {
        let context = web::Data::new(Arc::new(context));
        let server = HttpServer::new(move || {
            App::new()
                .app_data(context.clone())
                .route("/api/sync/events", web::post().to(rpc::receive_event::<S>))
                .route("/api/explorer/get_block", web::get().to(rpc::get_block::<S>))
                .route(
                    "/api/explorer/get_blocks_range",
                    web::get().to(rpc::get_blocks_range::<S>),
                )
                .route(
                    "/api/explorer/get_block_headers",
                    web::get().to(rpc::get_block_headers::<S>),
                )
                .route(
                    "/api/explorer/has_state_snapshot",
                    web::get().to(rpc::has_state_snapshot::<S>),
                )
                .route(
                    "/api/explorer/get_state_snapshot",
                    web::get().to(rpc::get_state_snapshot::<S>),
                )
        })
        .bind(bind_address)
        .with_context(|| format!("binding inter-node API on {}", bind_address))?
        .disable_signals()
        .run();

        let handle = server.handle();
        tokio::spawn(server);
        info!("inter-node API listening on {}", bind_address);

        Ok(Arc::new(RpcServer {
            handle: Mutex::new(Some(handle)),
        }))
    }

    pub async fn stop(&self, graceful: bool) {
        if let Some(handle) = self.handle.lock().await.take() {
            handle.stop(graceful).await;
        }
    }
}
