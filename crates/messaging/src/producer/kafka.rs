//! rdkafka-backed producer client.

use futures::FutureExt;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::time::Duration;
use streamgate_config::{KafkaVersion, ProducerConfig};
use tracing::info;

use super::{PendingDelivery, ProduceClient};
use crate::error::{MessagingError, Result};
use crate::message::{DeliveryReport, ProducerRecord};

/// Producer client over an rdkafka [`FutureProducer`].
pub struct KafkaProduceClient {
    producer: FutureProducer,
}

impl KafkaProduceClient {
    /// Create the producer and check that the brokers answer a metadata request.
    pub async fn connect(config: &ProducerConfig) -> Result<Self> {
        let version = config.kafka_version()?;
        let brokers = config.bootstrap_servers();

        let producer: FutureProducer = Self::client_config(config, version)
            .create()
            .map_err(|e| MessagingError::connect(e.to_string(), brokers.clone()))?;

        let metadata_client = producer.clone();
        let timeout = config.connect_timeout();
        tokio::task::spawn_blocking(move || {
            metadata_client.client().fetch_metadata(None, timeout).map(|_| ())
        })
            .await
            .map_err(|e| MessagingError::connect(e.to_string(), brokers.clone()))?
            .map_err(|e| MessagingError::connect(e.to_string(), brokers.clone()))?;

        info!(
            producer = %config.name,
            brokers = %brokers,
            version = %version,
            acks = config.required_acks.acks(),
            "Connected producer client"
        );

        Ok(Self { producer })
    }

    /// librdkafka properties for a producer.
    pub fn client_config(config: &ProducerConfig, version: KafkaVersion) -> ClientConfig {
        let mut client_config = ClientConfig::new();

        client_config
            .set("bootstrap.servers", config.bootstrap_servers())
            .set("client.id", &config.client_id)
            .set("acks", config.required_acks.acks())
            .set("message.timeout.ms", config.message_timeout_ms.to_string())
            .set(
                "api.version.request",
                version.supports_api_version_request().to_string(),
            )
            .set("broker.version.fallback", version.as_str());

        for (key, value) in &config.extra {
            client_config.set(key, value);
        }

        client_config
    }
}

impl ProduceClient for KafkaProduceClient {
    fn enqueue(&self, record: &ProducerRecord) -> Result<PendingDelivery> {
        let future_record = FutureRecord::to(&record.topic)
            .key(record.key.as_str())
            .payload(record.payload.as_slice());

        let delivery = self
            .producer
            .send_result(future_record)
            .map_err(|(e, _)| MessagingError::delivery(e.to_string(), &record.topic))?;

        let topic = record.topic.clone();
        let key = record.key.clone();
        Ok(async move {
            match delivery.await {
                Ok(Ok((partition, offset))) => Ok(DeliveryReport {
                    topic,
                    key,
                    partition,
                    offset,
                }),
                Ok(Err((e, _))) => Err(MessagingError::delivery(e.to_string(), topic)),
                Err(_) => Err(MessagingError::delivery("delivery report dropped", topic)),
            }
        }
        .boxed())
    }

    fn flush(&self, timeout: Duration) -> Result<()> {
        self.producer.flush(Timeout::After(timeout))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use streamgate_config::{ProducerMode, RequiredAcks};

    #[test]
    fn test_client_config_properties() {
        let mut config = ProducerConfig::new(
            ProducerMode::Sync,
            "P1",
            vec!["b1:9092".to_string()],
            "0.10.2.1",
        );
        config.required_acks = RequiredAcks::All;
        config
            .extra
            .insert("compression.type".to_string(), "lz4".to_string());

        let client_config =
            KafkaProduceClient::client_config(&config, config.kafka_version().unwrap());

        assert_eq!(client_config.get("bootstrap.servers"), Some("b1:9092"));
        assert_eq!(client_config.get("acks"), Some("all"));
        assert_eq!(client_config.get("message.timeout.ms"), Some("30000"));
        assert_eq!(client_config.get("api.version.request"), Some("true"));
        assert_eq!(client_config.get("broker.version.fallback"), Some("0.10.2.1"));
        assert_eq!(client_config.get("compression.type"), Some("lz4"));
    }
}
