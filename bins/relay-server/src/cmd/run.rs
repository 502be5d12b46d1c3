use tokio_util::sync::CancellationToken;

use broker_memory::MemoryBroker;
use pipeline::{Pipeline, receipt_channel, spawn_pipeline};
use relay_api::{DeliveryPublisher, ReceiptCallback, RecordReader};

use crate::config::{Effective, RunArgs, Transport};
use crate::error::RelayError;

type Transports = (Box<dyn RecordReader>, Box<dyn DeliveryPublisher>);

pub async fn run(args: RunArgs) -> Result<(), RelayError> {
    tracing::info!("relay-server starting");
    let eff = Effective::new(&args)?;
    tracing::info!(
        transport = %eff.transport,
        input = %eff.pipeline.input.topic,
        output = %eff.pipeline.output.topic,
        group = %eff.pipeline.input.group_id,
        offset_reset = %eff.pipeline.input.offset_reset,
        on_exhausted = %eff.pipeline.delivery.on_exhausted,
        "effective config"
    );

    // --- Transport ---
    let (callback, receipts) = receipt_channel();
    let (reader, publisher) = match eff.transport {
        Transport::Memory => connect_memory(&eff, callback)?,
        Transport::Kafka => connect_kafka(&eff, callback).await?,
    };

    // --- Pipeline ---
    let pipeline = Pipeline::new(&eff.pipeline, reader, publisher, receipts)?;
    let token = CancellationToken::new();
    let mut handle = spawn_pipeline(pipeline, token.clone());
    tracing::info!("relay ready");

    // --- Ожидание Ctrl+C или самостоятельной остановки (halt / fatal) ---
    let finished = tokio::select! {
        joined = &mut handle => Some(joined),
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("shutting down...");
            token.cancel();
            None
        }
    };
    let joined = match finished {
        Some(joined) => joined,
        None => handle.await,
    };
    let stats = joined??;

    tracing::info!(
        read = stats.read,
        delivered = stats.delivered,
        rejected = stats.rejected,
        malformed = stats.malformed,
        skipped = stats.skipped,
        "shutdown complete"
    );
    Ok(())
}

fn connect_memory(eff: &Effective, callback: ReceiptCallback) -> Result<Transports, RelayError> {
    let input = &eff.pipeline.input;
    let output = &eff.pipeline.output;

    let broker = MemoryBroker::new();
    broker.create_topic(&input.topic, eff.memory.partitions);
    broker.create_topic(&output.topic, eff.memory.partitions);
    if let Some(seed) = &eff.memory.seed {
        broker.load_seed(&input.topic, seed)?;
    }

    let reader = broker.reader(&input.group_id, &input.topic, input.offset_reset);
    let publisher = broker.publisher(output.queue_capacity, callback);
    tracing::info!(partitions = eff.memory.partitions, "memory broker ready");
    Ok((Box::new(reader), Box::new(publisher)))
}

#[cfg(feature = "kafka")]
async fn connect_kafka(eff: &Effective, callback: ReceiptCallback) -> Result<Transports, RelayError> {
    use broker_kafka::{KafkaPublisher, KafkaPublisherConfig, KafkaReader, KafkaReaderConfig};

    let reader_config = KafkaReaderConfig {
        brokers: eff.pipeline.input.brokers.clone(),
        group_id: eff.pipeline.input.group_id.clone(),
        topic: eff.pipeline.input.topic.clone(),
        offset_reset: eff.pipeline.input.offset_reset,
        metadata_timeout: eff.kafka.metadata_timeout(),
        properties: eff.kafka.consumer.clone(),
    };
    // Metadata fetch blocks until the cluster answers.
    let reader = tokio::task::spawn_blocking(move || KafkaReader::connect(&reader_config)).await??;

    let publisher = KafkaPublisher::connect(
        &KafkaPublisherConfig {
            brokers: eff.pipeline.output_brokers().to_string(),
            queue_capacity: eff.pipeline.output.queue_capacity,
            message_timeout: std::time::Duration::from_millis(eff.kafka.message_timeout_ms),
            properties: eff.kafka.producer.clone(),
        },
        callback,
    )?;
    Ok((Box::new(reader), Box::new(publisher)))
}

#[cfg(not(feature = "kafka"))]
async fn connect_kafka(_eff: &Effective, _callback: ReceiptCallback) -> Result<Transports, RelayError> {
    Err(RelayError::Config {
        context: "transport",
        detail: "built without the `kafka` feature; rebuild with `--features kafka` or use `--transport memory`"
            .into(),
    })
}
