//! Serves the output directory as static files. The server only ever reads
//! the output tree, so it may observe a rebuild half-way through.

use axum::Router;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use tokio::net::TcpListener;
use tower_http::services::ServeDir;

/// The router serving `root`. `/dir/` serves `/dir/index.html`.
pub fn router(root: &Path) -> Router {
    Router::new().fallback_service(ServeDir::new(root))
}

/// Serves `root` on `addr` until the server fails.
pub async fn serve(addr: SocketAddr, root: &Path) -> io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Serving {} on {}", root.display(), listener.local_addr()?);
    axum::serve(listener, router(root)).await
}
