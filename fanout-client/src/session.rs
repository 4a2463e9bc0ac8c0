//! Subscriber-side session: connects to a topic's owner, follows redirects,
//! and reconnects across disconnects while keeping the subscription alive
//! from the caller's point of view.
//!
//! Built on the `ConnectionManager`/`ReconnectionStrategy` pair, with the
//! richer `Connecting → AwaitAck → Active → Reconnecting` state set a
//! redirect-aware protocol needs, a process-wide topic→host cache, and a
//! `triedServers` chain carried on the pending subscribe itself.

use crate::channel::RequestChannel;
use crate::connection_state::{ConnectionManager, ConnectionState};
use crate::reconnect::ReconnectionStrategy;
use fanout_core::{
    DeliveredMessage, Error, HostAddr, PubSubRequest, RequestBody, Result, StatusCode,
    SubscribeMode, SubscribeRequest, SubscriberId, SubscriptionPreferences, Topic, TxnId,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};

static NEXT_TXN_ID: AtomicU64 = AtomicU64::new(1);

fn next_txn_id() -> TxnId {
    TxnId(NEXT_TXN_ID.fetch_add(1, Ordering::Relaxed))
}

pub type HostCache = Arc<RwLock<HashMap<Topic, HostAddr>>>;
pub type DeliveryHandler = Arc<dyn Fn(DeliveredMessage) + Send + Sync>;

/// A live (or reconnecting) subscription to one topic under one subscriber
/// id. Delivered messages are pushed to the handler supplied at
/// construction; dropping the session or calling [`ClientSession::unsubscribe`]
/// tears it down.
pub struct ClientSession {
    topic: Topic,
    subscriber_id: SubscriberId,
    conn: Arc<ConnectionManager>,
    current_channel: Arc<RwLock<Option<Arc<RequestChannel>>>>,
    shutdown_tx: watch::Sender<bool>,
}

struct SessionConfig {
    seed_host: HostAddr,
    topic: Topic,
    subscriber_id: SubscriberId,
    mode: SubscribeMode,
    force_attach: bool,
    preferences: SubscriptionPreferences,
    max_redirects: usize,
    ack_timeout: Duration,
    host_cache: HostCache,
    handler: DeliveryHandler,
}

impl ClientSession {
    #[allow(clippy::too_many_arguments)]
    pub async fn subscribe(
        seed_host: HostAddr,
        topic: impl Into<Topic>,
        subscriber_id: impl Into<SubscriberId>,
        mode: SubscribeMode,
        force_attach: bool,
        preferences: SubscriptionPreferences,
        reconnect_strategy: Box<dyn ReconnectionStrategy>,
        max_redirects: usize,
        ack_timeout: Duration,
        host_cache: HostCache,
        handler: impl Fn(DeliveredMessage) + Send + Sync + 'static,
    ) -> Result<Self> {
        let topic = topic.into();
        let subscriber_id = subscriber_id.into();
        let config = Arc::new(SessionConfig {
            seed_host: seed_host.clone(),
            topic: topic.clone(),
            subscriber_id: subscriber_id.clone(),
            mode,
            force_attach,
            preferences,
            max_redirects,
            ack_timeout,
            host_cache,
            handler: Arc::new(handler),
        });

        let conn = Arc::new(ConnectionManager::new(seed_host.to_string(), reconnect_strategy));
        let current_channel: Arc<RwLock<Option<Arc<RequestChannel>>>> = Arc::new(RwLock::new(None));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let channel = establish_with_redirects(&config, &conn).await?;
        spawn_delivery_forwarder(channel.1, config.handler.clone());
        *current_channel.write().await = Some(channel.0.clone());
        conn.active().await;

        tokio::spawn(run_supervisor(
            config,
            conn.clone(),
            current_channel.clone(),
            channel.0,
            shutdown_rx,
        ));

        Ok(Self {
            topic,
            subscriber_id,
            conn,
            current_channel,
            shutdown_tx,
        })
    }

    pub async fn state(&self) -> ConnectionState {
        self.conn.state().await
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn subscriber_id(&self) -> &SubscriberId {
        &self.subscriber_id
    }

    /// Send UNSUBSCRIBE on the current channel (if any) and stop the
    /// background reconnect supervisor. A session that is mid-reconnect at
    /// the time of the call simply stops retrying once the supervisor next
    /// wakes.
    pub async fn unsubscribe(&self, timeout: Duration) -> Result<()> {
        let channel = self.current_channel.read().await.clone();
        let _ = self.shutdown_tx.send(true);
        self.conn.closed().await;

        if let Some(channel) = channel {
            let req = PubSubRequest::new(
                self.topic.clone(),
                next_txn_id(),
                RequestBody::Unsubscribe(fanout_core::UnsubscribeRequest {
                    subscriber_id: self.subscriber_id.clone(),
                }),
            );
            let resp = channel.send(req, timeout).await?;
            if !resp.is_success() {
                return Err(Error::NotSubscribed);
            }
        }
        Ok(())
    }
}

/// Connects and subscribes, following `NOT_RESPONSIBLE_FOR_TOPIC` redirects
/// up to `max_redirects` hops, starting from the cached host for this topic
/// (if any) or the seed host.
async fn establish_with_redirects(
    config: &SessionConfig,
    conn: &ConnectionManager,
) -> Result<(Arc<RequestChannel>, tokio::sync::mpsc::UnboundedReceiver<DeliveredMessage>)> {
    let mut candidate = config
        .host_cache
        .read()
        .await
        .get(&config.topic)
        .cloned()
        .unwrap_or_else(|| config.seed_host.clone());
    let mut tried: Vec<String> = Vec::new();
    let mut should_claim = false;

    loop {
        conn.connecting().await;
        let addr: std::net::SocketAddr = candidate
            .plaintext_socket_addr()
            .parse()
            .map_err(|_| Error::CouldNotConnect(candidate.to_string()))?;
        let (channel, delivery_rx) =
            RequestChannel::connect_plaintext(addr, config.ack_timeout).await?;

        conn.await_ack().await;
        let mut req = PubSubRequest::new(
            config.topic.clone(),
            next_txn_id(),
            RequestBody::Subscribe(SubscribeRequest {
                subscriber_id: config.subscriber_id.clone(),
                mode: config.mode,
                synchronous: false,
                force_attach: config.force_attach,
                preferences: config.preferences.clone(),
            }),
        );
        req.should_claim = should_claim;
        req.tried_servers = tried.clone();

        let resp = channel.send(req, config.ack_timeout).await?;

        if resp.is_success() {
            config
                .host_cache
                .write()
                .await
                .insert(config.topic.clone(), candidate.clone());
            return Ok((Arc::new(channel), delivery_rx));
        }

        if resp.status_code != StatusCode::NotResponsibleForTopic {
            return Err(Error::ServiceDown(resp.status_msg));
        }

        if tried.len() >= config.max_redirects {
            return Err(Error::TooManyRedirects {
                topic: config.topic.clone(),
                tried: tried.len(),
            });
        }

        let next = HostAddr::parse(&resp.status_msg).unwrap_or_else(|| config.seed_host.clone());
        if tried.contains(&next.to_string()) {
            return Err(Error::RedirectLoop {
                topic: config.topic.clone(),
                host: next.to_string(),
            });
        }

        tried.push(candidate.to_string());
        should_claim = true;
        candidate = next;
    }
}

fn spawn_delivery_forwarder(
    mut delivery_rx: tokio::sync::mpsc::UnboundedReceiver<DeliveredMessage>,
    handler: DeliveryHandler,
) {
    tokio::spawn(async move {
        while let Some(delivered) = delivery_rx.recv().await {
            handler(delivered);
        }
    });
}

/// Watches the active channel for disconnect and re-establishes the
/// subscription against the seed host (dropping cached host mapping and
/// the redirect chain, per the wire contract's resubscribe behavior) until
/// the reconnection strategy gives up or the caller unsubscribes.
async fn run_supervisor(
    config: Arc<SessionConfig>,
    conn: Arc<ConnectionManager>,
    current_channel: Arc<RwLock<Option<Arc<RequestChannel>>>>,
    mut channel: Arc<RequestChannel>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = channel.closed() => {}
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return;
                }
            }
        }

        if *shutdown_rx.borrow() {
            return;
        }

        tracing::info!(topic = %config.topic, "subscribe channel disconnected, reconnecting");
        config.host_cache.write().await.remove(&config.topic);
        conn.start_reconnecting().await;
        *current_channel.write().await = None;

        loop {
            let Some(delay) = conn.next_reconnect_delay().await else {
                tracing::warn!(topic = %config.topic, "giving up on reconnect");
                return;
            };
            tokio::time::sleep(delay).await;

            match establish_with_redirects(&config, &conn).await {
                Ok((new_channel, delivery_rx)) => {
                    spawn_delivery_forwarder(delivery_rx, config.handler.clone());
                    *current_channel.write().await = Some(new_channel.clone());
                    conn.active().await;
                    channel = new_channel;
                    break;
                }
                Err(e) => {
                    tracing::debug!(topic = %config.topic, error = %e, "reconnect attempt failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconnect::ExponentialBackoff;
    use fanout_core::{codec, PubSubResponse, ResponseBody, ServerFrame, SubscribeResponseBody};
    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn subscribe_succeeds_against_a_direct_owner() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let req: PubSubRequest = codec::read_frame(&mut stream).await.unwrap();
            let resp = PubSubResponse::success(
                req.txn_id,
                ResponseBody::Subscribe(SubscribeResponseBody { last_consumed: None }),
            );
            codec::write_frame(&mut stream, &ServerFrame::Response(resp)).await.unwrap();
            std::future::pending::<()>().await;
        });

        let received = Arc::new(AtomicUsize::new(0));
        let received_clone = received.clone();
        let host_cache: HostCache = Arc::new(RwLock::new(HashMap::new()));

        let session = ClientSession::subscribe(
            HostAddr::new("127.0.0.1", port, None),
            "t",
            "alice",
            SubscribeMode::Create,
            false,
            SubscriptionPreferences::default(),
            Box::new(ExponentialBackoff::default()),
            3,
            Duration::from_secs(2),
            host_cache,
            move |_| {
                received_clone.fetch_add(1, Ordering::SeqCst);
            },
        )
        .await
        .unwrap();

        assert_eq!(session.state().await, ConnectionState::Active);
    }

    #[tokio::test]
    async fn subscribe_follows_a_single_redirect() {
        let owner_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let owner_port = owner_listener.local_addr().unwrap().port();
        let redirector_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let redirector_port = redirector_listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut stream, _) = owner_listener.accept().await.unwrap();
            let req: PubSubRequest = codec::read_frame(&mut stream).await.unwrap();
            let resp = PubSubResponse::success(
                req.txn_id,
                ResponseBody::Subscribe(SubscribeResponseBody { last_consumed: None }),
            );
            codec::write_frame(&mut stream, &ServerFrame::Response(resp)).await.unwrap();
            std::future::pending::<()>().await;
        });

        tokio::spawn(async move {
            let (mut stream, _) = redirector_listener.accept().await.unwrap();
            let req: PubSubRequest = codec::read_frame(&mut stream).await.unwrap();
            let owner = HostAddr::new("127.0.0.1", owner_port, None);
            let resp = PubSubResponse::error(
                req.txn_id,
                StatusCode::NotResponsibleForTopic,
                owner.to_string(),
            );
            codec::write_frame(&mut stream, &ServerFrame::Response(resp)).await.unwrap();
        });

        let host_cache: HostCache = Arc::new(RwLock::new(HashMap::new()));
        let session = ClientSession::subscribe(
            HostAddr::new("127.0.0.1", redirector_port, None),
            "t",
            "alice",
            SubscribeMode::Create,
            false,
            SubscriptionPreferences::default(),
            Box::new(ExponentialBackoff::default()),
            3,
            Duration::from_secs(2),
            host_cache.clone(),
            |_| {},
        )
        .await
        .unwrap();

        assert_eq!(session.state().await, ConnectionState::Active);
        assert_eq!(
            host_cache.read().await.get("t"),
            Some(&HostAddr::new("127.0.0.1", owner_port, None))
        );
    }
}
