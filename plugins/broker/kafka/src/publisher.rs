use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;

use relay_api::{DeliveryPublisher, DeliveryReceipt, OutboundRecord, ReceiptCallback, SubmitError, TransportError};

use crate::transport_error;

#[derive(Debug, Clone)]
pub struct KafkaPublisherConfig {
    pub brokers: String,
    pub queue_capacity: usize,
    pub message_timeout: Duration,
    pub properties: BTreeMap<String, String>,
}

/// Producer: `submit` ставит запись в очередь librdkafka, квитанция
/// приходит из отдельной задачи, ожидающей подтверждения брокера.
pub struct KafkaPublisher {
    producer: FutureProducer,
    callback: ReceiptCallback,
}

impl KafkaPublisher {
    pub fn connect(config: &KafkaPublisherConfig, callback: ReceiptCallback) -> Result<Self, TransportError> {
        let mut client = ClientConfig::new();
        client
            .set("bootstrap.servers", &config.brokers)
            .set("queue.buffering.max.messages", config.queue_capacity.to_string())
            .set("message.timeout.ms", config.message_timeout.as_millis().to_string());
        for (key, value) in &config.properties {
            client.set(key, value);
        }

        let producer: FutureProducer = client
            .create()
            .map_err(|e| transport_error("create producer", e))?;
        tracing::info!(brokers = %config.brokers, "kafka producer created");

        Ok(Self { producer, callback })
    }
}

impl DeliveryPublisher for KafkaPublisher {
    fn submit(&mut self, record: OutboundRecord) -> Result<(), SubmitError> {
        let sent = {
            let mut outgoing: FutureRecord<'_, Vec<u8>, Vec<u8>> =
                FutureRecord::to(&record.topic).payload(&record.payload);
            if let Some(key) = &record.key {
                outgoing = outgoing.key(key);
            }
            self.producer.send_result(outgoing).map_err(|(e, _)| e)
        };

        let delivery = match sent {
            Ok(delivery) => delivery,
            Err(KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull)) => {
                return Err(SubmitError::QueueFull(record));
            }
            Err(e) => return Err(SubmitError::Fatal(transport_error("produce", e))),
        };

        let callback = self.callback.clone();
        let ticket = record.ticket;
        let topic = record.topic;
        tokio::spawn(async move {
            let receipt = match delivery.await {
                Ok(Ok((partition, offset))) => DeliveryReceipt::delivered(ticket, topic, partition, offset),
                Ok(Err((e, _))) => DeliveryReceipt::failed(ticket, e.to_string()),
                Err(_) => DeliveryReceipt::failed(ticket, "producer dropped before delivery report"),
            };
            callback(receipt);
        });
        Ok(())
    }

    fn flush(&mut self, timeout: Duration) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        let producer = self.producer.clone();
        Box::pin(async move {
            let flushed = tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
                .await
                .map_err(|e| TransportError::new(format!("flush task: {e}")))?;
            flushed.map_err(|e| transport_error("flush", e))
        })
    }
}
