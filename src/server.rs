//! HTTP listener and graceful shutdown.
//!
//! The accept loop hands each connection to a task tracked in a `JoinSet`.
//! On SIGTERM or Ctrl-C the listener stops accepting immediately and every
//! in-flight connection is drained before the server returns.

use std::net::SocketAddr;
use std::sync::Arc;

use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::dispatch::{dispatch, AppState};
use crate::error::{TejasError, TejasResult};

pub(crate) async fn serve(state: Arc<AppState>, addr: SocketAddr) -> TejasResult<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| TejasError::Listen(format!("bind {}: {}", addr, e)))?;

    info!(addr = %addr, "tejas listening");

    let mut tasks = tokio::task::JoinSet::new();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            // Check shutdown first so a signal stops new accepts even when
            // connections are queued.
            biased;

            () = &mut shutdown => {
                info!(in_flight = tasks.len(), "shutdown signal received, draining connections");
                break;
            }

            res = listener.accept() => {
                let (stream, remote_addr) = match res {
                    Ok(v) => v,
                    Err(e) => {
                        error!("accept error: {e}");
                        continue;
                    }
                };

                let state = Arc::clone(&state);
                let io = TokioIo::new(stream);

                tasks.spawn(async move {
                    // One service call per request on the connection.
                    let svc = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move {
                            Ok::<_, std::convert::Infallible>(
                                dispatch(state, req, remote_addr).await,
                            )
                        }
                    });

                    if let Err(e) = ConnBuilder::new(TokioExecutor::new())
                        .serve_connection(io, svc)
                        .await
                    {
                        error!(peer = %remote_addr, "connection error: {e}");
                    }
                });
            }

            // Reap finished connection tasks so the set stays bounded.
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
        }
    }

    while tasks.join_next().await.is_some() {}

    info!("tejas stopped");
    Ok(())
}

/// Resolves on the first shutdown signal: SIGTERM or Ctrl-C on Unix,
/// Ctrl-C elsewhere.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let sigterm = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = sigterm => {}
    }
}
