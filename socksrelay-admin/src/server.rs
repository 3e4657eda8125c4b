//! The read-only status HTTP endpoint: an axum `Router` built once and
//! served via `axum::serve` against a bound `TcpListener`.

use axum::extract::State;
use axum::response::Json;
use axum::routing::get;
use axum::Router as AxumRouter;
use serde::Serialize;
use socksrelay_registry::{IsAdmin, Registry};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
struct AppState {
    registry: Arc<Registry>,
}

/// The status API server. A deployment may disable it entirely.
pub struct StatusServer {
    addr: SocketAddr,
    state: AppState,
}

impl StatusServer {
    pub fn new(addr: SocketAddr, registry: Arc<Registry>) -> Self {
        Self {
            addr,
            state: AppState { registry },
        }
    }

    fn build_router(&self) -> AxumRouter {
        AxumRouter::new()
            .route("/", get(relay_count))
            .route("/ntlmrelayx/api/v1.0/relays", get(relay_rows))
            .with_state(self.state.clone())
    }

    pub async fn start(self) -> anyhow::Result<()> {
        let addr = self.addr;
        let app = self.build_router();

        info!(addr = %addr, "starting status endpoint");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;
        Ok(())
    }
}

/// `GET /` — a human-readable relay count.
async fn relay_count(State(state): State<AppState>) -> String {
    let count = state.registry.len().await;
    format!("Number of relayed connections : {count}\n")
}

/// `[protocol, targetHost, principal, isAdmin, portAsString]`.
#[derive(Serialize)]
struct RelayRow(String, String, String, String, String);

/// `GET /ntlmrelayx/api/v1.0/relays`.
async fn relay_rows(State(state): State<AppState>) -> Json<Vec<RelayRow>> {
    let rows = state
        .registry
        .snapshot()
        .await
        .into_iter()
        .map(|row| {
            RelayRow(
                row.scheme,
                row.host,
                row.principal,
                is_admin_str(row.is_admin),
                row.port.to_string(),
            )
        })
        .collect();
    Json(rows)
}

fn is_admin_str(is_admin: IsAdmin) -> String {
    is_admin.as_str().to_string()
}
