use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use log::{error, info, warn};
use serde::Deserialize;

mod protocol;
mod relay;
mod state;

use state::{AppState, SharedState, TrialStore, TrialStoreError};

const DEFAULT_ADDR: &str = "0.0.0.0:3000";
const DEFAULT_DATA_DIR: &str = "./data";

fn decode_path_segment(seg: &str) -> String {
    match urlencoding::decode(seg) {
        Ok(s) => s.into_owned(),
        Err(_) => seg.to_string(),
    }
}

// ============================================
// REST API (trials)
// ============================================

#[derive(Debug, Default, Deserialize)]
struct CreateTrialRequest {
    title: Option<String>,
    description: Option<String>,
}

fn json_response(status: StatusCode, body: String) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Body::from(body))
        .unwrap()
}

async fn handle_api_request(
    req: Request<Body>,
    state: SharedState,
) -> Result<Response<Body>, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    // Parse path: /api/trials[/{id}]
    let path_parts: Vec<&str> = path.split('/').collect();
    if path_parts.len() < 3 || path_parts[1] != "api" || path_parts[2] != "trials" {
        return Ok(json_response(
            StatusCode::NOT_FOUND,
            r#"{"error":"not_found"}"#.to_owned(),
        ));
    }
    let trial_id = path_parts.get(3).copied().filter(|s| !s.is_empty());

    match (method, trial_id) {
        // GET /api/trials - list, newest first
        (Method::GET, None) => {
            let trials = state.trials.lock().await;
            let json = serde_json::json!({ "trials": trials.list() }).to_string();
            Ok(json_response(StatusCode::OK, json))
        }

        // POST /api/trials - create and persist a trial record
        (Method::POST, None) => {
            let body_bytes = hyper::body::to_bytes(req.into_body()).await?;
            let create: CreateTrialRequest = if body_bytes.is_empty() {
                CreateTrialRequest::default()
            } else {
                match serde_json::from_slice(&body_bytes) {
                    Ok(create) => create,
                    Err(e) => {
                        warn!("Failed to parse trial create request: {}", e);
                        let json = serde_json::json!({
                            "error": format!("invalid request body: {}", e)
                        })
                        .to_string();
                        return Ok(json_response(StatusCode::BAD_REQUEST, json));
                    }
                }
            };

            let record = state
                .trials
                .lock()
                .await
                .create(create.title, create.description);
            info!("Created trial {} ({})", record.id, record.title);
            let json = serde_json::json!({ "ok": true, "trial": record }).to_string();
            Ok(json_response(StatusCode::OK, json))
        }

        // GET /api/trials/{id} - single record or 404
        (Method::GET, Some(id)) => {
            let id = decode_path_segment(id);
            let trials = state.trials.lock().await;
            match trials.get(&id) {
                Ok(record) => Ok(json_response(
                    StatusCode::OK,
                    serde_json::json!({ "trial": record }).to_string(),
                )),
                Err(TrialStoreError::NotFound) => Ok(json_response(
                    StatusCode::NOT_FOUND,
                    r#"{"error":"not_found"}"#.to_owned(),
                )),
            }
        }

        _ => Ok(Response::builder()
            .status(StatusCode::METHOD_NOT_ALLOWED)
            .body(Body::from("Method not allowed"))
            .unwrap()),
    }
}

// ============================================
// Main request handler
// ============================================

async fn handle_request(
    mut req: Request<Body>,
    state: SharedState,
    addr: SocketAddr,
) -> Result<Response<Body>, hyper::Error> {
    let path = req.uri().path();
    let method = req.method().clone();

    // CORS preflight for the browser client.
    if method == Method::OPTIONS {
        return Ok(Response::builder()
            .status(StatusCode::NO_CONTENT)
            .header("Access-Control-Allow-Origin", "*")
            .header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
            .header("Access-Control-Allow-Headers", "Content-Type")
            .header("Access-Control-Max-Age", "86400")
            .body(Body::empty())
            .unwrap());
    }

    if path == "/health" {
        return Ok(Response::builder()
            .status(StatusCode::OK)
            .header("Access-Control-Allow-Origin", "*")
            .body(Body::from("ok"))
            .unwrap());
    }

    if path.starts_with("/api/") {
        let mut resp = handle_api_request(req, state).await?;
        let headers = resp.headers_mut();
        headers.insert("Access-Control-Allow-Origin", "*".parse().unwrap());
        headers.insert(
            "Access-Control-Allow-Methods",
            "GET, POST, OPTIONS".parse().unwrap(),
        );
        headers.insert("Access-Control-Allow-Headers", "Content-Type".parse().unwrap());
        return Ok(resp);
    }

    // WebSocket upgrade
    if hyper_tungstenite::is_upgrade_request(&req) {
        match hyper_tungstenite::upgrade(&mut req, None) {
            Ok((response, websocket)) => {
                tokio::spawn(async move {
                    match websocket.await {
                        Ok(ws) => relay::handle_socket(ws, addr, state).await,
                        Err(e) => warn!("WebSocket handshake with {} failed: {}", addr, e),
                    }
                });
                return Ok(response);
            }
            Err(e) => {
                error!("WebSocket upgrade error: {}", e);
                return Ok(Response::builder()
                    .status(StatusCode::BAD_REQUEST)
                    .body(Body::from("Invalid WebSocket upgrade request"))
                    .unwrap());
            }
        }
    }

    Ok(Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Body::from(
            "Not found. Use /health for health check, /api/trials for REST, or upgrade to WebSocket.",
        ))
        .unwrap())
}

// ============================================
// Main entry point
// ============================================

#[tokio::main]
async fn main() {
    let addr_str = std::env::var("RELAY_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_owned());
    let addr: SocketAddr = addr_str.parse().expect("invalid RELAY_ADDR");

    // Healthcheck mode: exit 0 if the server is running (port in use), 1 if not.
    if std::env::args().any(|a| a == "--healthcheck") {
        use std::net::TcpListener;
        match TcpListener::bind(addr) {
            Ok(_) => std::process::exit(1),
            Err(_) => std::process::exit(0),
        }
    }

    env_logger::init();

    let data_dir = std::env::var("RELAY_DATA_DIR").unwrap_or_else(|_| DEFAULT_DATA_DIR.to_owned());
    let trials = TrialStore::open(Path::new(&data_dir).join("trials.json"));
    let state: SharedState = Arc::new(AppState::new(trials));

    let make_svc = make_service_fn(move |conn: &AddrStream| {
        let state = state.clone();
        let remote = conn.remote_addr();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| {
                let state = state.clone();
                handle_request(req, state, remote)
            }))
        }
    });

    let server = Server::bind(&addr).serve(make_svc);

    info!("Relay listening on http://{}", addr);
    info!("WebSocket endpoint: ws://{}", addr);
    info!("REST API: http://{}/api/trials", addr);
    info!("Health check: http://{}/health", addr);

    if let Err(e) = server.await {
        error!("Server error: {}", e);
    }
}
