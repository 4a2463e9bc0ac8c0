//! Accepts connections on the plaintext and TLS ports and runs the per-
//! connection request loop.
//!
//! Each connection splits into two cooperative tasks over the
//! length-prefixed `PubSubRequest`/`ServerFrame` codec: one reads frames and
//! feeds them to the router, the other drains an outbound channel fed by
//! both request responses and delivery sessions, so a slow write never
//! blocks the read loop.

use crate::router::RequestRouter;
use fanout_core::{codec, PubSubRequest, Result, ServerFrame};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_rustls::TlsAcceptor;

const OUTBOUND_QUEUE_CAPACITY: usize = 256;

pub async fn run_plaintext_acceptor(
    listener: &TcpListener,
    router: Arc<RequestRouter>,
    shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let mut shutdown = shutdown_rx.clone();
        tokio::select! {
            accepted = listener.accept() => {
                let Ok((stream, peer)) = accepted else { continue };
                let router = router.clone();
                let conn_shutdown = shutdown_rx.clone();
                tokio::spawn(async move {
                    tracing::debug!(peer = %peer, "accepted plaintext connection");
                    if let Err(e) = handle_connection(stream, router, conn_shutdown).await {
                        tracing::debug!(peer = %peer, error = %e, "connection closed");
                    }
                });
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

pub async fn run_tls_acceptor(
    listener: &TcpListener,
    acceptor: TlsAcceptor,
    router: Arc<RequestRouter>,
    shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let mut shutdown = shutdown_rx.clone();
        tokio::select! {
            accepted = listener.accept() => {
                let Ok((stream, peer)) = accepted else { continue };
                let acceptor = acceptor.clone();
                let router = router.clone();
                let conn_shutdown = shutdown_rx.clone();
                tokio::spawn(async move {
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            tracing::debug!(peer = %peer, "accepted tls connection");
                            if let Err(e) = handle_connection(tls_stream, router, conn_shutdown).await {
                                tracing::debug!(peer = %peer, error = %e, "connection closed");
                            }
                        }
                        Err(e) => tracing::warn!(peer = %peer, error = %e, "tls handshake failed"),
                    }
                });
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

async fn handle_connection<S>(
    stream: S,
    router: Arc<RequestRouter>,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut read_half, mut write_half) = tokio::io::split(stream);

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerFrame>(OUTBOUND_QUEUE_CAPACITY);

    let send_task = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if let Err(e) = codec::write_frame(&mut write_half, &frame).await {
                tracing::debug!(error = %e, "write failed, closing connection");
                break;
            }
        }
    });

    // A dead writer surfaces here the next time a response needs sending:
    // `outbound_tx.send` fails once `outbound_rx` is dropped by the aborted
    // or finished send task, ending the read loop without a separate select
    // branch to track the writer's own completion.
    let result = loop {
        match codec::read_frame::<_, PubSubRequest>(&mut read_half).await {
            Ok(req) => {
                let response = router.handle(req, &outbound_tx, &shutdown_rx).await;
                if let Some(response) = response {
                    if outbound_tx.send(ServerFrame::Response(response)).await.is_err() {
                        break Ok(());
                    }
                }
            }
            Err(e) => break Err(e),
        }
    };

    send_task.abort();
    result
}
