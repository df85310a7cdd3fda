use crate::error::Error;
use hyper::{
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server, StatusCode,
};
use lazy_static::lazy_static;
use prometheus::{
    register_histogram_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_with_registry, Encoder, Histogram,
    IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder,
};
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tracing::*;

lazy_static! {
    pub static ref AUCTIONEER_REGISTRY: Registry =
        Registry::new_custom(Some("auctioneer".to_string()), None).unwrap();
}

lazy_static! {
    pub static ref AUCTIONS_STARTED: IntCounter = register_int_counter_with_registry!(
        "auctions_started_total",
        "Auctions scheduled by the orchestrator",
        AUCTIONEER_REGISTRY
    )
    .unwrap();
    pub static ref AUCTIONS_COMPLETED: IntCounterVec = register_int_counter_vec_with_registry!(
        "auctions_completed_total",
        "Auctions that left the active set, by outcome",
        &["outcome"],
        AUCTIONEER_REGISTRY
    )
    .unwrap();
    pub static ref AUCTIONS_ACTIVE: IntGauge = register_int_gauge_with_registry!(
        "auctions_active",
        "Auctions currently running",
        AUCTIONEER_REGISTRY
    )
    .unwrap();
    pub static ref AUCTION_TRANSITIONS: IntCounterVec = register_int_counter_vec_with_registry!(
        "auction_transitions_total",
        "Covenant transitions attempted, by transition and status",
        &["transition", "status"],
        AUCTIONEER_REGISTRY
    )
    .unwrap();
    pub static ref AUCTION_ROLLBACKS: IntCounter = register_int_counter_with_registry!(
        "auction_rollbacks_total",
        "Auction states reverted by a chain reorganization",
        AUCTIONEER_REGISTRY
    )
    .unwrap();
    pub static ref FUNDING_REQUESTS: IntCounterVec = register_int_counter_vec_with_registry!(
        "funding_requests_total",
        "Funding requests by status",
        &["status"],
        AUCTIONEER_REGISTRY
    )
    .unwrap();
    pub static ref CHAOS_BLOCKS_MINED: IntCounter = register_int_counter_with_registry!(
        "chaos_blocks_mined_total",
        "Blocks mined by the chaos controller",
        AUCTIONEER_REGISTRY
    )
    .unwrap();
    pub static ref CHAOS_MINING_ERRORS: IntCounterVec = register_int_counter_vec_with_registry!(
        "chaos_mining_errors_total",
        "Mining calls that failed, by kind",
        &["kind"],
        AUCTIONEER_REGISTRY
    )
    .unwrap();
    pub static ref CHAOS_INVALIDATIONS: IntCounterVec = register_int_counter_vec_with_registry!(
        "chaos_invalidations_total",
        "Fork point invalidations, by status",
        &["status"],
        AUCTIONEER_REGISTRY
    )
    .unwrap();
    pub static ref RELAY_DELAY: Histogram = register_histogram_with_registry!(
        "relay_delay_seconds",
        "Delay applied before a block is relayed to a peer",
        vec![0.01, 0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0],
        AUCTIONEER_REGISTRY
    )
    .unwrap();
    pub static ref RELAY_DELIVERIES: IntCounterVec = register_int_counter_vec_with_registry!(
        "relay_deliveries_total",
        "Delayed block deliveries to peers, by status",
        &["status"],
        AUCTIONEER_REGISTRY
    )
    .unwrap();
    pub static ref BUS_EVENTS: IntCounterVec = register_int_counter_vec_with_registry!(
        "bus_events_total",
        "Events published on the notification bus, by kind",
        &["kind"],
        AUCTIONEER_REGISTRY
    )
    .unwrap();
    pub static ref BUS_DROPPED: IntCounterVec = register_int_counter_vec_with_registry!(
        "bus_dropped_total",
        "Events not delivered to a subscriber, by reason",
        &["reason"],
        AUCTIONEER_REGISTRY
    )
    .unwrap();
    pub static ref CHAIN_HEIGHT: IntGauge = register_int_gauge_with_registry!(
        "chain_height",
        "Tip height seen by the chain watcher",
        AUCTIONEER_REGISTRY
    )
    .unwrap();
    pub static ref CHAIN_REORGS: IntCounter = register_int_counter_with_registry!(
        "chain_reorgs_total",
        "Reorganizations detected by the chain watcher",
        AUCTIONEER_REGISTRY
    )
    .unwrap();
}

async fn handle_request(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let mut metric_families = AUCTIONEER_REGISTRY.gather();
            metric_families.extend(prometheus::gather());

            let encoder = TextEncoder::new();
            let mut buffer = Vec::new();
            match encoder.encode(&metric_families, &mut buffer) {
                Ok(()) => Response::builder()
                    .status(StatusCode::OK)
                    .header(hyper::header::CONTENT_TYPE, encoder.format_type())
                    .body(Body::from(buffer)),
                Err(err) => Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::from(err.to_string())),
            }
        }
        (&Method::GET, "/health") => {
            let health_status = json!({
                "status": "healthy",
                "timestamp": std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs(),
                "version": env!("CARGO_PKG_VERSION"),
                "activeAuctions": AUCTIONS_ACTIVE.get(),
                "chainHeight": CHAIN_HEIGHT.get(),
            });
            Response::builder()
                .status(StatusCode::OK)
                .header(hyper::header::CONTENT_TYPE, "application/json")
                .body(Body::from(health_status.to_string()))
        }
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::from("Not Found")),
    };

    Ok(response.unwrap_or_else(|_| Response::new(Body::empty())))
}

/// Serves `/metrics` and `/health` until `shutdown` is cancelled.
pub async fn start_server(port: u16, shutdown: CancellationToken) -> Result<(), Error> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let make_svc =
        make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(handle_request)) });

    let server = Server::try_bind(&addr)?
        .serve(make_svc)
        .with_graceful_shutdown(async move { shutdown.cancelled().await });

    info!("Starting metrics server on {}", addr);
    server.await?;
    Ok(())
}
