use async_trait::async_trait;
use gateway::consumer::{Consumer, DeliveryOutcome, StartFrom, SubscriptionConfig, TransportFactory};
use gateway::transport::ws::{EventStoreTransport, EventStoreTransportConfig};
use gateway::transport::{RawEvent, Transport, TransportError};
use gw_test_utils::{MockEventStoreServer, RecordedAck};
use std::time::Duration;
use tokio::sync::watch;

struct WsFactory {
    url: String,
}

#[async_trait]
impl TransportFactory for WsFactory {
    async fn connect(&self, after: u64) -> Result<Box<dyn Transport>, TransportError> {
        let cfg = EventStoreTransportConfig {
            url: self.url.clone(),
            subscription_id: "sub-1".to_owned(),
            stream_name: "telemetry".to_owned(),
            group_name: "gateway".to_owned(),
        };
        let transport = EventStoreTransport::connect(&cfg, after).await?;
        Ok(Box::new(transport))
    }
}

fn sub_config() -> SubscriptionConfig {
    SubscriptionConfig {
        subscription_id: "sub-1".to_owned(),
        stream_name: "telemetry".to_owned(),
        group_name: "gateway".to_owned(),
        start_from: StartFrom::Begin,
        object_instance_offset: 0,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(100),
        max_reconnect_attempts: Some(3),
    }
}

#[tokio::test]
async fn consumer_delivers_events_in_order_and_acks_each() {
    let server = MockEventStoreServer::start().await.unwrap();
    let factory = WsFactory { url: server.url() };
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut consumer = Consumer::new(sub_config(), factory);

    let delivered = std::sync::Arc::new(tokio::sync::Mutex::new(Vec::<u64>::new()));
    let delivered_for_handler = delivered.clone();

    let run = tokio::spawn(async move {
        consumer
            .run(None, shutdown_rx, move |event: RawEvent, _offset| {
                let delivered = delivered_for_handler.clone();
                async move {
                    delivered.lock().await.push(event.position);
                    DeliveryOutcome::Processed
                }
            })
            .await
    });

    // Wait for the client to subscribe before pushing events.
    for _ in 0..50 {
        if server.last_subscribed_after().await.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(server.last_subscribed_after().await, Some(0));

    server
        .push_batch(vec![
            (1, serde_json::json!({"a": 1})),
            (2, serde_json::json!({"a": 2})),
        ])
        .await;

    for _ in 0..50 {
        if delivered.lock().await.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(*delivered.lock().await, vec![1, 2]);

    for _ in 0..50 {
        if server.acks().await.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(
        server.acks().await,
        vec![RecordedAck::Ack(1), RecordedAck::Ack(2)]
    );

    shutdown_tx.send(true).unwrap();
    run.await.unwrap().unwrap();
}
