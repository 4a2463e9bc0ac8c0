//! One physical TCP (optionally TLS) connection to a broker node, framed with
//! the shared `PubSubRequest`/`ServerFrame` codec and demultiplexing
//! responses back to their caller by `TxnId`.
//!
//! Pending requests are tracked in a `TxnId`-keyed oneshot map, and the
//! connection splits into the same read/write task shape the broker's own
//! connection handler uses: one task drains an outbound queue and writes
//! frames, the read loop demultiplexes `PubSubResponse` frames to their
//! pending oneshot and forwards `DeliveredMessage` frames to whoever is
//! listening for deliveries on this channel (subscribe channels only).

use fanout_core::{
    codec, DeliveredMessage, Error, PubSubRequest, PubSubResponse, Result, ServerFrame, TxnId,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_rustls::{rustls, TlsConnector};

const OUTBOUND_QUEUE_CAPACITY: usize = 256;
const DELIVERY_QUEUE_CAPACITY: usize = 256;

type PendingMap = Arc<Mutex<HashMap<TxnId, oneshot::Sender<PubSubResponse>>>>;

/// One connection's worth of request/response plumbing. Dropping it (or the
/// peer closing the socket) fails every still-pending request with
/// `UncertainState` and ends any in-progress delivery stream.
pub struct RequestChannel {
    outbound_tx: mpsc::Sender<PubSubRequest>,
    pending: PendingMap,
    closed: Arc<tokio::sync::Notify>,
}

impl RequestChannel {
    pub async fn connect_plaintext(addr: std::net::SocketAddr, ack_timeout: Duration) -> Result<(Self, mpsc::UnboundedReceiver<DeliveredMessage>)> {
        let stream = tokio::time::timeout(ack_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(|e| Error::CouldNotConnect(e.to_string()))?;
        Ok(Self::spawn(stream))
    }

    pub async fn connect_tls(
        addr: std::net::SocketAddr,
        server_name: &str,
        tls_config: Arc<rustls::ClientConfig>,
        ack_timeout: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<DeliveredMessage>)> {
        let tcp = tokio::time::timeout(ack_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(|e| Error::CouldNotConnect(e.to_string()))?;

        let name = rustls::pki_types::ServerName::try_from(server_name.to_string())
            .map_err(|e| Error::CouldNotConnect(e.to_string()))?;
        let connector = TlsConnector::from(tls_config);
        let stream = connector
            .connect(name, tcp)
            .await
            .map_err(|e| Error::CouldNotConnect(e.to_string()))?;
        Ok(Self::spawn(stream))
    }

    fn spawn<S>(stream: S) -> (Self, mpsc::UnboundedReceiver<DeliveredMessage>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut read_half, mut write_half) = tokio::io::split(stream);
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<PubSubRequest>(OUTBOUND_QUEUE_CAPACITY);
        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel::<DeliveredMessage>();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(tokio::sync::Notify::new());

        tokio::spawn(async move {
            while let Some(req) = outbound_rx.recv().await {
                if let Err(e) = codec::write_frame(&mut write_half, &req).await {
                    tracing::debug!(error = %e, "write failed, closing channel");
                    break;
                }
            }
        });

        let read_pending = pending.clone();
        let read_closed = closed.clone();
        tokio::spawn(async move {
            loop {
                match codec::read_frame::<_, ServerFrame>(&mut read_half).await {
                    Ok(ServerFrame::Response(resp)) => {
                        if let Some(tx) = read_pending.lock().await.remove(&resp.txn_id) {
                            let _ = tx.send(resp);
                        }
                    }
                    Ok(ServerFrame::Delivery(d)) => {
                        if delivery_tx.send(d).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            for (txn_id, tx) in read_pending.lock().await.drain() {
                // The server may or may not have observed these requests.
                let _ = tx.send(PubSubResponse::error(
                    txn_id,
                    fanout_core::StatusCode::UncertainState,
                    "connection closed".to_string(),
                ));
            }
            read_closed.notify_waiters();
        });

        (
            Self {
                outbound_tx,
                pending,
                closed,
            },
            delivery_rx,
        )
    }

    /// Send a request and await its response, subject to `timeout`. A channel
    /// closing mid-flight resolves every still-pending request with a
    /// synthesized `UncertainState` response rather than an error, matching
    /// the wire contract's own uncertain-outcome status rather than a
    /// transport-level error type.
    pub async fn send(&self, req: PubSubRequest, timeout: Duration) -> Result<PubSubResponse> {
        let txn_id = req.txn_id;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(txn_id, tx);

        if self.outbound_tx.send(req).await.is_err() {
            self.pending.lock().await.remove(&txn_id);
            return Err(Error::ConnectionClosed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => {
                self.pending.lock().await.remove(&txn_id);
                Err(Error::Timeout)
            }
        }
    }

    /// Send a request that expects no response (CONSUME).
    pub async fn send_fire_and_forget(&self, req: PubSubRequest) -> Result<()> {
        self.outbound_tx
            .send(req)
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Resolves once the channel's read loop has ended (peer closed, or a
    /// framing error), signalling the caller should reconnect.
    pub async fn closed(&self) {
        self.closed.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fanout_core::{RequestBody, SubscribeMode, SubscribeRequest, SubscriptionPreferences};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn send_receives_matching_response_by_txn_id() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let req: PubSubRequest = codec::read_frame(&mut stream).await.unwrap();
            let resp = PubSubResponse::success(req.txn_id, fanout_core::ResponseBody::None);
            codec::write_frame(&mut stream, &ServerFrame::Response(resp)).await.unwrap();
        });

        let (channel, _delivery_rx) = RequestChannel::connect_plaintext(addr, Duration::from_secs(2))
            .await
            .unwrap();

        let req = PubSubRequest::new(
            "t",
            TxnId(42),
            RequestBody::Subscribe(SubscribeRequest {
                subscriber_id: "alice".into(),
                mode: SubscribeMode::Create,
                synchronous: false,
                force_attach: false,
                preferences: SubscriptionPreferences::default(),
            }),
        );
        let resp = channel.send(req, Duration::from_secs(2)).await.unwrap();
        assert_eq!(resp.txn_id, TxnId(42));
        assert!(resp.is_success());
    }

    #[tokio::test]
    async fn pending_requests_resolve_uncertain_on_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let (channel, _delivery_rx) = RequestChannel::connect_plaintext(addr, Duration::from_secs(2))
            .await
            .unwrap();

        let req = PubSubRequest::new(
            "t",
            TxnId(1),
            RequestBody::Subscribe(SubscribeRequest {
                subscriber_id: "alice".into(),
                mode: SubscribeMode::Create,
                synchronous: false,
                force_attach: false,
                preferences: SubscriptionPreferences::default(),
            }),
        );
        let resp = channel.send(req, Duration::from_secs(2)).await.unwrap();
        assert_eq!(resp.status_code, fanout_core::StatusCode::UncertainState);
    }
}
