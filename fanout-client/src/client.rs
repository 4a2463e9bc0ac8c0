//! Top-level client handle: publish, subscribe, and unsubscribe against a
//! cluster of broker nodes, following redirects and caching the winning host
//! per topic.
//!
//! This is a host-addressed client: publish and unsubscribe share one
//! `RequestChannel` per host (reused across topics), while each
//! [`ClientSession`] dials its own dedicated channel so a slow subscriber
//! never backs up publishers.

use crate::channel::RequestChannel;
use crate::client_builder::{ClientBuilder, StrategyFactory};
use crate::metrics::ClientMetrics;
use crate::session::{ClientSession, HostCache};
use fanout_core::{
    DeliveredMessage, Error, HostAddr, PublishRequest, RequestBody, Result, ResponseBody, SeqId,
    StatusCode, SubscribeMode, SubscriptionPreferences, Topic, TxnId, UnsubscribeRequest,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

static NEXT_TXN_ID: AtomicU64 = AtomicU64::new(1);

fn next_txn_id() -> TxnId {
    TxnId(NEXT_TXN_ID.fetch_add(1, Ordering::Relaxed))
}

type ChannelPool = Arc<Mutex<HashMap<HostAddr, Arc<RequestChannel>>>>;

/// A handle to a broker cluster. All state is reference-counted internally,
/// so publishing, subscribing, and unsubscribing may happen concurrently
/// from the same `Client`.
pub struct Client {
    seed_host: HostAddr,
    strategy_factory: StrategyFactory,
    max_redirects: usize,
    ack_timeout: Duration,
    metrics: Option<Arc<ClientMetrics>>,
    host_cache: HostCache,
    publish_channels: ChannelPool,
}

impl Client {
    pub(crate) fn new(
        seed_host: HostAddr,
        strategy_factory: StrategyFactory,
        max_redirects: usize,
        ack_timeout: Duration,
        metrics: Option<Arc<ClientMetrics>>,
    ) -> Self {
        Self {
            seed_host,
            strategy_factory,
            max_redirects,
            ack_timeout,
            metrics,
            host_cache: Arc::new(RwLock::new(HashMap::new())),
            publish_channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn builder(seed_host: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(seed_host)
    }

    pub fn max_redirects(&self) -> usize {
        self.max_redirects
    }

    /// Subscribe to `topic` under `subscriber_id`, invoking `handler` for
    /// every delivered message. The returned session reconnects and
    /// re-subscribes transparently until [`ClientSession::unsubscribe`] is
    /// called or it is dropped.
    #[allow(clippy::too_many_arguments)]
    pub async fn subscribe(
        &self,
        topic: impl Into<Topic>,
        subscriber_id: impl Into<fanout_core::SubscriberId>,
        mode: SubscribeMode,
        force_attach: bool,
        preferences: SubscriptionPreferences,
        handler: impl Fn(DeliveredMessage) + Send + Sync + 'static,
    ) -> Result<ClientSession> {
        let strategy = (self.strategy_factory)();
        ClientSession::subscribe(
            self.seed_host.clone(),
            topic,
            subscriber_id,
            mode,
            force_attach,
            preferences,
            strategy,
            self.max_redirects,
            self.ack_timeout,
            self.host_cache.clone(),
            handler,
        )
        .await
    }

    /// Publish `payload` to `topic`, following redirects to the owning node
    /// and reusing a shared channel for subsequent publishes to that host.
    pub async fn publish(&self, topic: impl Into<Topic>, payload: Vec<u8>) -> Result<SeqId> {
        let topic = topic.into();
        let start = Instant::now();
        let result = self
            .request_with_redirects(&topic, RequestBody::Publish(PublishRequest { payload }))
            .await;

        if let Some(metrics) = &self.metrics {
            let status = if result.is_ok() { "success" } else { "error" };
            metrics.record_request("publish", status, start.elapsed().as_secs_f64());
        }

        match result? {
            ResponseBody::Publish(body) => Ok(body.seq_id),
            _ => Err(Error::ServiceDown("unexpected response to publish".into())),
        }
    }

    /// Unsubscribe `subscriber_id` from `topic` without going through a live
    /// [`ClientSession`] (e.g. to tear down a subscription from a different
    /// process than the one holding it).
    pub async fn unsubscribe(
        &self,
        topic: impl Into<Topic>,
        subscriber_id: impl Into<fanout_core::SubscriberId>,
    ) -> Result<()> {
        let topic = topic.into();
        let start = Instant::now();
        let result = self
            .request_with_redirects(
                &topic,
                RequestBody::Unsubscribe(UnsubscribeRequest {
                    subscriber_id: subscriber_id.into(),
                }),
            )
            .await;

        if let Some(metrics) = &self.metrics {
            let status = if result.is_ok() { "success" } else { "error" };
            metrics.record_request("unsubscribe", status, start.elapsed().as_secs_f64());
        }

        result.map(|_| ())
    }

    /// Drives a publish/unsubscribe request through the redirect chain,
    /// reusing the per-host shared channel and updating the host cache on
    /// success, mirroring [`crate::session::ClientSession`]'s subscribe-side
    /// redirect loop.
    async fn request_with_redirects(&self, topic: &str, body: RequestBody) -> Result<ResponseBody> {
        let mut candidate = self
            .host_cache
            .read()
            .await
            .get(topic)
            .cloned()
            .unwrap_or_else(|| self.seed_host.clone());
        let mut tried: Vec<String> = Vec::new();
        let mut should_claim = false;

        loop {
            let channel = self.channel_for_host(&candidate).await?;

            let mut req = fanout_core::PubSubRequest::new(topic.to_string(), next_txn_id(), body.clone());
            req.should_claim = should_claim;
            req.tried_servers = tried.clone();

            let resp = match channel.send(req, self.ack_timeout).await {
                Ok(resp) => resp,
                Err(e) => {
                    self.publish_channels.lock().await.remove(&candidate);
                    return Err(e);
                }
            };

            if resp.is_success() {
                self.host_cache
                    .write()
                    .await
                    .insert(topic.to_string(), candidate.clone());
                return Ok(resp.body);
            }

            if resp.status_code != StatusCode::NotResponsibleForTopic {
                return Err(Error::ServiceDown(resp.status_msg));
            }

            if let Some(metrics) = &self.metrics {
                metrics.record_redirect();
            }

            if tried.len() >= self.max_redirects {
                return Err(Error::TooManyRedirects {
                    topic: topic.to_string(),
                    tried: tried.len(),
                });
            }

            let next = HostAddr::parse(&resp.status_msg).unwrap_or_else(|| self.seed_host.clone());
            if tried.contains(&next.to_string()) {
                return Err(Error::RedirectLoop {
                    topic: topic.to_string(),
                    host: next.to_string(),
                });
            }

            tried.push(candidate.to_string());
            should_claim = true;
            candidate = next;
        }
    }

    /// Returns the shared channel for `host`, dialing a new one if none is
    /// cached.
    async fn channel_for_host(&self, host: &HostAddr) -> Result<Arc<RequestChannel>> {
        let mut pool = self.publish_channels.lock().await;
        if let Some(channel) = pool.get(host) {
            return Ok(channel.clone());
        }

        let addr: std::net::SocketAddr = host
            .plaintext_socket_addr()
            .parse()
            .map_err(|_| Error::CouldNotConnect(host.to_string()))?;
        let (channel, mut delivery_rx) =
            RequestChannel::connect_plaintext(addr, self.ack_timeout).await?;
        // Publish/unsubscribe channels never receive deliveries; drain and
        // discard so the read loop's unbounded sender never blocks.
        tokio::spawn(async move { while delivery_rx.recv().await.is_some() {} });

        let channel = Arc::new(channel);
        pool.insert(host.clone(), channel.clone());
        Ok(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fanout_core::{codec, PubSubRequest, PubSubResponse, PublishResponseBody, ServerFrame};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn publish_succeeds_against_a_direct_owner() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let req: PubSubRequest = codec::read_frame(&mut stream).await.unwrap();
            let resp = PubSubResponse::success(
                req.txn_id,
                ResponseBody::Publish(PublishResponseBody { seq_id: SeqId(7) }),
            );
            codec::write_frame(&mut stream, &ServerFrame::Response(resp)).await.unwrap();
            std::future::pending::<()>().await;
        });

        let client = ClientBuilder::new(format!("127.0.0.1:{port}")).build().unwrap();
        let seq_id = client.publish("t", b"hello".to_vec()).await.unwrap();
        assert_eq!(seq_id, SeqId(7));
    }

    #[tokio::test]
    async fn publish_reuses_channel_for_repeated_calls_to_same_host() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => break,
                };
                tokio::spawn(async move {
                    loop {
                        let req: PubSubRequest = match codec::read_frame(&mut stream).await {
                            Ok(r) => r,
                            Err(_) => break,
                        };
                        let resp = PubSubResponse::success(
                            req.txn_id,
                            ResponseBody::Publish(PublishResponseBody { seq_id: SeqId(1) }),
                        );
                        if codec::write_frame(&mut stream, &ServerFrame::Response(resp)).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        let client = ClientBuilder::new(format!("127.0.0.1:{port}")).build().unwrap();
        client.publish("t", b"one".to_vec()).await.unwrap();
        client.publish("t", b"two".to_vec()).await.unwrap();
        assert_eq!(client.publish_channels.lock().await.len(), 1);
    }
}
