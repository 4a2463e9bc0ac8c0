//! Dispatches an incoming `PubSubRequest` to the right collaborator: the
//! ownership registry for the owner check, and the subscription manager,
//! persistence gateway, and delivery manager for the four fixed operations.
//!
//! Dispatch is a closed match over the fixed PUBLISH/SUBSCRIBE/UNSUBSCRIBE/
//! CONSUME set this protocol carries, rather than an open method-name
//! registry; each request still opens its own tracing span for per-operation
//! latency and error visibility.

use crate::delivery::DeliveryManager;
use crate::ownership::{ClaimOutcome, OwnershipRegistry};
use crate::persistence::PersistenceGateway;
use crate::subscription::SubscriptionManager;
use fanout_core::{
    Error, HostAddr, PubSubRequest, PubSubResponse, PublishResponseBody, RequestBody,
    ResponseBody, ServerFrame, StatusCode, SubscribeResponseBody,
};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

pub struct RequestRouter {
    ownership: Arc<OwnershipRegistry>,
    persistence: Arc<PersistenceGateway>,
    subscriptions: Arc<SubscriptionManager>,
    delivery: Arc<DeliveryManager>,
}

impl RequestRouter {
    pub fn new(
        ownership: Arc<OwnershipRegistry>,
        persistence: Arc<PersistenceGateway>,
        subscriptions: Arc<SubscriptionManager>,
        delivery: Arc<DeliveryManager>,
    ) -> Self {
        Self {
            ownership,
            persistence,
            subscriptions,
            delivery,
        }
    }

    /// Handle one request frame. `outbound_tx`/`session_shutdown_rx` are only
    /// used when the request is a successful `SUBSCRIBE`, to start that
    /// subscriber's delivery session on the connection's outbound channel.
    ///
    /// Returns `None` for `CONSUME`, which per the wire contract never gets a
    /// response frame regardless of outcome.
    pub async fn handle(
        &self,
        req: PubSubRequest,
        outbound_tx: &mpsc::Sender<ServerFrame>,
        session_shutdown_rx: &watch::Receiver<bool>,
    ) -> Option<PubSubResponse> {
        let span = tracing::info_span!(
            "route_request",
            operation = req.body.operation_name(),
            topic = %req.topic,
            txn_id = %req.txn_id,
        );
        let _enter = span.enter();

        if matches!(req.body, RequestBody::Consume(_)) {
            self.handle_consume(req).await;
            return None;
        }

        Some(match self.dispatch(req, outbound_tx, session_shutdown_rx).await {
            Ok(resp) => resp,
            Err((txn_id, e)) => {
                tracing::warn!(error = %e, "request failed");
                let (code, msg) = e.to_status();
                PubSubResponse::error(txn_id, code, msg)
            }
        })
    }

    async fn handle_consume(&self, req: PubSubRequest) {
        if let RequestBody::Consume(consume) = req.body {
            if self.subscriptions.is_tracked(&req.topic).await {
                self.subscriptions
                    .consume(&req.topic, consume.subscriber_id, consume.seq_id)
                    .await;
            }
        }
    }

    async fn dispatch(
        &self,
        req: PubSubRequest,
        outbound_tx: &mpsc::Sender<ServerFrame>,
        session_shutdown_rx: &watch::Receiver<bool>,
    ) -> Result<PubSubResponse, (fanout_core::TxnId, Error)> {
        let txn_id = req.txn_id;

        if req.topic.is_empty() {
            return Err((txn_id, Error::MalformedRequest("empty topic".into())));
        }

        if let Err(owner) = self.ensure_ownership(&req).await {
            return Err((
                txn_id,
                Error::NotResponsibleForTopic(owner.to_string()),
            ));
        }

        let body = match req.body {
            RequestBody::Publish(publish) => {
                let seq_id = self
                    .persistence
                    .append(&req.topic, publish.payload)
                    .await
                    .map_err(|e| (txn_id, e))?;
                ResponseBody::Publish(PublishResponseBody { seq_id })
            }
            RequestBody::Subscribe(sub) => {
                if sub.subscriber_id.is_hub() {
                    return Err((
                        txn_id,
                        Error::InvalidSubscriberId(format!(
                            "subscriber id {} uses the reserved hub prefix",
                            sub.subscriber_id
                        )),
                    ));
                }

                let subscriber_id = sub.subscriber_id.clone();
                let result = self
                    .subscriptions
                    .subscribe(
                        &req.topic,
                        subscriber_id.clone(),
                        sub.mode,
                        sub.force_attach,
                        sub.preferences,
                        sub.synchronous,
                    )
                    .await
                    .map_err(|e| (txn_id, e))?;

                self.delivery
                    .spawn_session(
                        req.topic.clone(),
                        subscriber_id,
                        result.last_consumed,
                        sub.force_attach,
                        outbound_tx.clone(),
                        session_shutdown_rx.clone(),
                    )
                    .await
                    .map_err(|e| (txn_id, e))?;

                ResponseBody::Subscribe(SubscribeResponseBody {
                    last_consumed: result.last_consumed,
                })
            }
            RequestBody::Unsubscribe(unsub) => {
                self.delivery
                    .terminate_session(&req.topic, &unsub.subscriber_id)
                    .await;
                self.subscriptions
                    .unsubscribe(&req.topic, unsub.subscriber_id)
                    .await
                    .map_err(|e| (txn_id, e))?;
                ResponseBody::None
            }
            RequestBody::Consume(_) => unreachable!("CONSUME is handled before dispatch"),
        };

        Ok(PubSubResponse::success(txn_id, body))
    }

    /// Verify this node owns `req.topic`, claiming it first if the client set
    /// `should_claim`. Returns the current owner's address on failure so the
    /// caller can build a `NotResponsibleForTopic` response.
    async fn ensure_ownership(&self, req: &PubSubRequest) -> Result<(), HostAddr> {
        if self.subscriptions.is_tracked(&req.topic).await {
            return Ok(());
        }

        if !req.should_claim {
            return Err(HostAddr::new("", 0, None));
        }

        match self.ownership.claim(&req.topic).await {
            Ok(ClaimOutcome::Acquired) => {
                self.subscriptions.acquire_topic(&req.topic).await;
                Ok(())
            }
            Ok(ClaimOutcome::Redirect(owner)) => Err(owner),
            Err(_) => Err(HostAddr::new("", 0, None)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterRegistry;
    use fanout_core::{PublishRequest, SubscribeMode, SubscribeRequest, SubscriptionPreferences, TxnId};
    use std::time::Duration;

    fn router(dir: &std::path::Path) -> RequestRouter {
        let db = sled::open(dir).unwrap();
        let persistence = Arc::new(PersistenceGateway::open(dir.join("log")).unwrap());
        let filters = Arc::new(FilterRegistry::new());
        let subscriptions = Arc::new(SubscriptionManager::new(persistence.clone(), filters, 10));
        let ownership =
            Arc::new(OwnershipRegistry::new(&db, HostAddr::new("self", 9000, None), Duration::from_secs(30)).unwrap());
        let delivery = Arc::new(DeliveryManager::new(
            persistence.clone(),
            subscriptions.clone(),
            Duration::from_secs(5),
        ));
        RequestRouter::new(ownership, persistence, subscriptions, delivery)
    }

    #[tokio::test]
    async fn publish_without_claim_on_unowned_topic_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let router = router(dir.path());
        let (tx, _rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let req = PubSubRequest::new(
            "t",
            TxnId(1),
            RequestBody::Publish(PublishRequest { payload: b"x".to_vec() }),
        );
        let resp = router.handle(req, &tx, &shutdown_rx).await.unwrap();
        assert_eq!(resp.status_code, StatusCode::NotResponsibleForTopic);
    }

    #[tokio::test]
    async fn publish_with_should_claim_acquires_and_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let router = router(dir.path());
        let (tx, _rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut req = PubSubRequest::new(
            "t",
            TxnId(1),
            RequestBody::Publish(PublishRequest { payload: b"x".to_vec() }),
        );
        req.should_claim = true;
        let resp = router.handle(req, &tx, &shutdown_rx).await.unwrap();
        assert!(resp.is_success());
    }

    #[tokio::test]
    async fn subscribe_then_publish_delivers_on_outbound_channel() {
        let dir = tempfile::tempdir().unwrap();
        let router = router(dir.path());
        let (tx, mut rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut sub_req = PubSubRequest::new(
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
        sub_req.should_claim = true;
        let resp = router.handle(sub_req, &tx, &shutdown_rx).await.unwrap();
        assert!(resp.is_success());

        let mut pub_req = PubSubRequest::new(
            "t",
            TxnId(2),
            RequestBody::Publish(PublishRequest { payload: b"hi".to_vec() }),
        );
        pub_req.should_claim = true;
        let resp = router.handle(pub_req, &tx, &shutdown_rx).await.unwrap();
        assert!(resp.is_success());

        let delivered = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match delivered {
            ServerFrame::Delivery(d) => assert_eq!(d.message.payload, b"hi"),
            ServerFrame::Response(_) => panic!("expected a delivery frame"),
        }
    }

    #[tokio::test]
    async fn subscribe_with_hub_prefixed_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let router = router(dir.path());
        let (tx, _rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut sub_req = PubSubRequest::new(
            "t",
            TxnId(1),
            RequestBody::Subscribe(SubscribeRequest {
                subscriber_id: "hub:peer-a".into(),
                mode: SubscribeMode::Create,
                synchronous: false,
                force_attach: false,
                preferences: SubscriptionPreferences::default(),
            }),
        );
        sub_req.should_claim = true;
        let resp = router.handle(sub_req, &tx, &shutdown_rx).await.unwrap();
        assert_eq!(resp.status_code, StatusCode::InvalidSubscriberId);
    }

    #[tokio::test]
    async fn second_subscribe_without_force_attach_is_busy_and_force_attach_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let router = router(dir.path());
        let (tx1, _rx1) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut sub_req = PubSubRequest::new(
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
        sub_req.should_claim = true;
        let resp = router.handle(sub_req, &tx1, &shutdown_rx).await.unwrap();
        assert!(resp.is_success());

        let (tx2, _rx2) = mpsc::channel(8);
        let mut retry_req = PubSubRequest::new(
            "t",
            TxnId(2),
            RequestBody::Subscribe(SubscribeRequest {
                subscriber_id: "alice".into(),
                mode: SubscribeMode::Attach,
                synchronous: false,
                force_attach: false,
                preferences: SubscriptionPreferences::default(),
            }),
        );
        retry_req.should_claim = true;
        let resp = router.handle(retry_req, &tx2, &shutdown_rx).await.unwrap();
        assert_eq!(resp.status_code, StatusCode::TopicBusy);

        let (tx3, _rx3) = mpsc::channel(8);
        let mut force_req = PubSubRequest::new(
            "t",
            TxnId(3),
            RequestBody::Subscribe(SubscribeRequest {
                subscriber_id: "alice".into(),
                mode: SubscribeMode::Attach,
                synchronous: false,
                force_attach: true,
                preferences: SubscriptionPreferences::default(),
            }),
        );
        force_req.should_claim = true;
        let resp = router.handle(force_req, &tx3, &shutdown_rx).await.unwrap();
        assert!(resp.is_success());
    }
}
