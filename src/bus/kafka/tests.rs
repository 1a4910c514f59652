use super::*;
use crate::test_utils::make_event;
use rdkafka::message::Headers;

#[test]
fn test_new_config_uses_service_as_group() {
    let config = KafkaBrokerConfig::new("localhost:9092", "message-processor");
    assert_eq!(config.bootstrap_servers, "localhost:9092");
    assert_eq!(config.group_id, "message-processor");
    assert!(config.security_protocol.is_none());
}

#[test]
fn test_group_override() {
    let config =
        KafkaBrokerConfig::new("localhost:9092", "message-processor").with_group_id("workers");
    assert_eq!(config.group_id, "workers");
}

#[test]
fn test_sasl_config() {
    let config = KafkaBrokerConfig::new("localhost:9092", "svc").with_sasl(
        "user",
        "pass",
        "SCRAM-SHA-256",
    );
    assert_eq!(config.sasl_username, Some("user".to_string()));
    assert_eq!(config.sasl_password, Some("pass".to_string()));
    assert_eq!(config.sasl_mechanism, Some("SCRAM-SHA-256".to_string()));
    assert_eq!(config.security_protocol, Some("SASL_SSL".to_string()));
}

#[test]
fn test_ssl_config() {
    let config = KafkaBrokerConfig::new("localhost:9092", "svc")
        .with_security_protocol("SSL")
        .with_ssl_ca("/path/to/ca.crt");
    assert_eq!(config.security_protocol, Some("SSL".to_string()));
    assert_eq!(config.ssl_ca_location, Some("/path/to/ca.crt".to_string()));
}

#[test]
fn test_producer_config_is_durable() {
    let client = KafkaBrokerConfig::new("localhost:9092", "svc").build_producer_config();
    assert_eq!(client.get("acks"), Some("all"));
    assert_eq!(client.get("message.send.max.retries"), Some("5"));
    assert_eq!(client.get("enable.idempotence"), Some("true"));
}

#[test]
fn test_consumer_config_commits_manually() {
    let client = KafkaBrokerConfig::new("localhost:9092", "message-processor")
        .with_security_protocol("SASL_PLAINTEXT")
        .build_consumer_config();
    assert_eq!(client.get("group.id"), Some("message-processor"));
    assert_eq!(client.get("enable.auto.commit"), Some("false"));
    assert_eq!(client.get("auto.offset.reset"), Some("earliest"));
    assert_eq!(client.get("partition.assignment.strategy"), Some("roundrobin"));
    assert_eq!(client.get("security.protocol"), Some("SASL_PLAINTEXT"));
}

#[test]
fn test_event_headers_carry_correlation() {
    let event = make_event("k1");
    let headers = event_headers(&event);

    assert_eq!(headers.count(), 3);
    let expected = [
        ("correlation_id", "corr-k1"),
        ("idempotency_id", "k1"),
        ("event_type", "message.created"),
    ];
    for (idx, (key, value)) in expected.iter().enumerate() {
        let header = headers.get(idx);
        assert_eq!(header.key, *key);
        assert_eq!(header.value, Some(value.as_bytes()));
    }
}

#[tokio::test]
async fn test_publish_rejects_invalid_event_without_network() {
    // Producer creation does not connect, so this runs without a cluster.
    let broker = KafkaBroker::new(
        KafkaBrokerConfig::new("localhost:1", "svc"),
        DeliveryPolicy::default(),
    )
    .unwrap();
    let mut event = make_event("k1");
    event.idempotency_id.clear();

    let result = broker.publish("message.created", &event).await;

    assert!(matches!(result, Err(BusError::InvalidEvent(_))));
}
