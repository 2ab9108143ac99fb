//! Redis Streams transport tests against a live server.

use std::time::Duration;

use mproc_models::{MediaId, MediaType, QueueMessage, RequestBody};
use mproc_queue::{QueueConfig, QueueTransport, RedisTransport};

fn transport(namespace: &str) -> RedisTransport {
    dotenvy::dotenv().ok();
    let config = QueueConfig {
        namespace: namespace.to_string(),
        block_timeout: Duration::from_millis(500),
        ..QueueConfig::from_env().expect("queue config")
    };
    RedisTransport::new(config).expect("Failed to create transport")
}

fn request(media_type: MediaType) -> QueueMessage {
    QueueMessage::request(
        media_type,
        MediaId::new(),
        "test_user",
        RequestBody {
            s3_key: "uploads/test_user/photo.jpg".into(),
            original_filename: "photo.jpg".into(),
            mime_type: "image/jpeg".into(),
            file_size: 1024,
            metadata: None,
            attempt: 0,
        },
    )
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_publish_receive_ack() {
    let transport = transport(&format!("test-{}", MediaId::new()));
    transport.init().await.expect("Failed to initialize");
    transport.subscribe(MediaType::Image).await.unwrap();

    let message = request(MediaType::Image);
    transport.publish_request(&message).await.expect("Failed to publish");

    let batch = transport.receive(1).await.expect("Failed to receive");
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].message.media_id, message.media_id);

    transport.ack(&batch[0]).await.expect("Failed to ack");
    assert_eq!(transport.backlog(MediaType::Image).await.unwrap(), 0);
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_unsubscribed_stream_is_left_alone() {
    let transport = transport(&format!("test-{}", MediaId::new()));
    transport.init().await.unwrap();
    transport.subscribe(MediaType::Image).await.unwrap();

    transport.publish_request(&request(MediaType::Video)).await.unwrap();
    let batch = transport.receive(10).await.unwrap();
    assert!(batch.is_empty());
    assert_eq!(transport.backlog(MediaType::Video).await.unwrap(), 1);
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_release_makes_request_available_again() {
    let transport = transport(&format!("test-{}", MediaId::new()));
    transport.init().await.unwrap();
    transport.subscribe(MediaType::Zip).await.unwrap();

    let message = request(MediaType::Zip);
    transport.publish_request(&message).await.unwrap();
    let batch = transport.receive(1).await.unwrap();
    transport.release(&batch[0]).await.unwrap();

    let again = transport.receive(1).await.unwrap();
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].message.media_id, message.media_id);
    assert_ne!(again[0].id, batch[0].id);
    transport.ack(&again[0]).await.unwrap();
}
