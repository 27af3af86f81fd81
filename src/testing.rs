//! Local HTTP servers standing in for mirrors and media hosts.

use axum::Router;

/// Serves `router` on an ephemeral loopback port and returns its base URL.
pub(crate) async fn spawn_upstream(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}
