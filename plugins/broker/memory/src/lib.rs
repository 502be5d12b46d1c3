//! In-process брокер с партиционированными topic'ами и consumer group'ами.
//!
//! Реализует [`RecordReader`](relay_api::RecordReader) и
//! [`DeliveryPublisher`](relay_api::DeliveryPublisher) без внешних
//! зависимостей: для тестов и локальных прогонов. Умеет впрыскивать
//! ошибки poll'а и доставки.

mod publisher;
mod reader;

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::Notify;

use relay_api::{DeliveryReceipt, OffsetReset, OutboundRecord, ReceiptCallback, TransportError};

pub use publisher::MemoryPublisher;
pub use reader::MemoryReader;

// ═══════════════════════════════════════════════════════════════
//  Config
// ═══════════════════════════════════════════════════════════════

fn default_partitions() -> u32 {
    1
}

/// Настройки memory-транспорта (`[memory]` в конфиге сервера).
#[derive(Debug, Clone, Deserialize)]
pub struct MemoryBrokerConfig {
    /// Число партиций для создаваемых topic'ов.
    #[serde(default = "default_partitions")]
    pub partitions: u32,
    /// JSON Lines файл, который загружается во входной topic при старте.
    #[serde(default)]
    pub seed: Option<PathBuf>,
}

impl Default for MemoryBrokerConfig {
    fn default() -> Self {
        Self {
            partitions: default_partitions(),
            seed: None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Stored record
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    pub partition: i32,
    pub offset: i64,
}

// ═══════════════════════════════════════════════════════════════
//  Broker
// ═══════════════════════════════════════════════════════════════

#[derive(Default)]
struct State {
    /// topic → партиции → записи (offset = индекс).
    topics: HashMap<String, Vec<Vec<StoredRecord>>>,
    /// (group, topic, partition) → next offset.
    committed: HashMap<(String, String, i32), i64>,
    round_robin: HashMap<String, usize>,
    poll_faults: u32,
    delivery_faults: u32,
    delivery_delay: Duration,
    reject_submissions: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    appended: Notify,
}

/// Брокер. Клонируется дёшево: все клоны видят одни и те же topic'и.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Создать topic. Существующий topic не меняется.
    pub fn create_topic(&self, name: &str, partitions: u32) {
        let mut state = self.lock();
        state
            .topics
            .entry(name.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions.max(1) as usize]);
    }

    /// Добавить запись. Партиция выбирается по хэшу ключа, без ключа
    /// по кругу. Несуществующий topic создаётся с одной партицией.
    pub fn append(&self, topic: &str, key: Option<&[u8]>, payload: &[u8]) -> (i32, i64) {
        let position = {
            let mut state = self.lock();
            let partitions = state.topics.get(topic).map_or(1, Vec::len);
            let partition = match key {
                Some(key) => {
                    let mut hasher = DefaultHasher::new();
                    key.hash(&mut hasher);
                    (hasher.finish() % partitions as u64) as usize
                }
                None => {
                    let next = state.round_robin.entry(topic.to_string()).or_default();
                    let partition = *next % partitions;
                    *next = next.wrapping_add(1);
                    partition
                }
            };
            push(&mut state, topic, partition, key, payload)
        };
        self.shared.appended.notify_waiters();
        position
    }

    /// Добавить запись в конкретную партицию.
    pub fn append_to(
        &self,
        topic: &str,
        partition: i32,
        key: Option<&[u8]>,
        payload: &[u8],
    ) -> Result<i64, TransportError> {
        let offset = {
            let mut state = self.lock();
            let partitions = state.topics.get(topic).map_or(0, Vec::len);
            let index = usize::try_from(partition)
                .ok()
                .filter(|p| *p < partitions)
                .ok_or_else(|| TransportError::new(format!("unknown partition {topic}[{partition}]")))?;
            push(&mut state, topic, index, key, payload).1
        };
        self.shared.appended.notify_waiters();
        Ok(offset)
    }

    /// Загрузить JSON Lines файл во входной topic: одна непустая
    /// строка даёт одну запись без ключа.
    pub fn load_seed(&self, topic: &str, path: &Path) -> Result<usize, TransportError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| TransportError::io(format!("seed {}: {e}", path.display())))?;
        let mut count = 0;
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            self.append(topic, None, line.as_bytes());
            count += 1;
        }
        tracing::info!(topic, path = %path.display(), records = count, "seed loaded");
        Ok(count)
    }

    /// Все записи topic'а: по партициям, внутри по offset'ам.
    pub fn records(&self, topic: &str) -> Vec<StoredRecord> {
        let state = self.lock();
        state
            .topics
            .get(topic)
            .map(|partitions| partitions.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    pub fn partitions(&self, topic: &str) -> u32 {
        self.lock().topics.get(topic).map_or(0, |p| p.len() as u32)
    }

    /// Сохранённый прогресс группы (next offset).
    pub fn committed(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.lock()
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
    }

    // ─── Fault injection ─────────────────────────────────────────

    /// Следующие `n` poll'ов вернут ошибку потока.
    pub fn fail_next_polls(&self, n: u32) {
        self.lock().poll_faults = n;
    }

    /// Следующие `n` доставок завершатся ошибкой.
    pub fn fail_next_deliveries(&self, n: u32) {
        self.lock().delivery_faults = n;
    }

    /// Задержка перед каждой доставкой.
    pub fn set_delivery_delay(&self, delay: Duration) {
        self.lock().delivery_delay = delay;
    }

    /// `submit` начнёт отвечать фатальной ошибкой.
    pub fn reject_submissions(&self, reject: bool) {
        self.lock().reject_submissions = reject;
    }

    // ─── Clients ─────────────────────────────────────────────────

    pub fn reader(&self, group: &str, topic: &str, reset: OffsetReset) -> MemoryReader {
        MemoryReader::new(self.clone(), group, topic, reset)
    }

    /// Publisher с очередью на `capacity` записей. Должен создаваться
    /// внутри tokio runtime: доставку выполняет фоновая задача.
    pub fn publisher(&self, capacity: usize, callback: ReceiptCallback) -> MemoryPublisher {
        MemoryPublisher::new(self.clone(), capacity, callback)
    }

    // ─── Internals ───────────────────────────────────────────────

    fn lock(&self) -> MutexGuard<'_, State> {
        // State stays consistent under every panic point, so poisoning is ignored.
        self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn delivery_delay(&self) -> Duration {
        self.lock().delivery_delay
    }

    fn submissions_rejected(&self) -> bool {
        self.lock().reject_submissions
    }

    /// Выполнить доставку одной записи и сформировать квитанцию.
    fn deliver(&self, record: &OutboundRecord) -> DeliveryReceipt {
        {
            let mut state = self.lock();
            if state.delivery_faults > 0 {
                state.delivery_faults -= 1;
                return DeliveryReceipt::failed(record.ticket, "injected delivery failure");
            }
        }
        let (partition, offset) = self.append(&record.topic, record.key.as_deref(), &record.payload);
        DeliveryReceipt::delivered(record.ticket, record.topic.clone(), partition, offset)
    }
}

fn push(state: &mut State, topic: &str, partition: usize, key: Option<&[u8]>, payload: &[u8]) -> (i32, i64) {
    let partitions = state
        .topics
        .entry(topic.to_string())
        .or_insert_with(|| vec![Vec::new()]);
    let log = &mut partitions[partition];
    let offset = log.len() as i64;
    log.push(StoredRecord {
        key: key.map(<[u8]>::to_vec),
        payload: payload.to_vec(),
        partition: partition as i32,
        offset,
    });
    (partition as i32, offset)
}
