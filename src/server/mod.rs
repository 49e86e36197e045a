//! HTTP surface used by the touchscreen app
//!
//! | Path                         | Behavior                                   |
//! |------------------------------|--------------------------------------------|
//! | `/camera/liveview/`          | start if needed, latest frame              |
//! | `/camera/liveview/stop/`     | stop the worker                            |
//! | `/camera/liveview/status/`   | worker state as JSON                       |
//! | `/camera/picture/<filename>` | picture from camera storage, cached        |
//! | `/camera/unlock/`            | clear the camera UI lock                   |

mod routes;

use std::future::Future;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{info, Level};

use crate::pipeline::LiveViewWorker;
use crate::Config;

pub use routes::StatusReport;

#[derive(Clone)]
pub struct AppState {
    pub worker: Arc<LiveViewWorker>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(worker: Arc<LiveViewWorker>, config: Config) -> Self {
        Self {
            worker,
            config: Arc::new(config),
        }
    }
}

/// Register `path` with and without its trailing slash
fn both<S: Clone + Send + Sync + 'static>(
    router: Router<S>,
    path: &str,
    method: axum::routing::MethodRouter<S>,
) -> Router<S> {
    let bare = path.trim_end_matches('/');
    router.route(path, method.clone()).route(bare, method)
}

pub fn router(state: AppState) -> Router {
    // TraceLayer logs all HTTP requests with method, path, status, and latency
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    let router = Router::new();
    let router = both(router, "/camera/liveview/", get(routes::liveview));
    let router = both(router, "/camera/liveview/stop/", get(routes::liveview_stop));
    let router = both(router, "/camera/liveview/status/", get(routes::liveview_status));
    let router = both(router, "/camera/picture/{filename}/", get(routes::picture));
    let router = both(router, "/camera/unlock/", get(routes::unlock));

    router.layer(trace_layer).with_state(state)
}

/// Serve until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!("Serving HTTP on {}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
