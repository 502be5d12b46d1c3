//! Учёт прогресса чтения: какие записи уже можно считать обработанными
//! и докуда разрешено сдвигать сохранённую позицию группы.
//!
//! Запись считается завершённой, когда она отклонена валидатором,
//! признана некорректной либо получила окончательную квитанцию доставки.
//! Позиция партиции двигается только по непрерывному префиксу
//! завершённых записей: одна незавершённая запись удерживает все
//! последующие, даже если те уже доставлены.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use relay_api::{DeliveryOutcome, DeliveryReceipt, OutboundRecord, ProgressMark, StreamPosition};
use relay_transform::{MalformedReason, RejectReason};

use crate::config::{DeliveryConfig, FailurePolicy};

/// Идентификатор прочитанной записи внутри одного запуска.
pub type Ticket = u64;

// ═══════════════════════════════════════════════════════════════
//  Stats
// ═══════════════════════════════════════════════════════════════

/// Счётчики одного запуска пайплайна.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub read: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub rejected_by_reason: BTreeMap<RejectReason, u64>,
    pub malformed: u64,
    /// Отправки в транспорт, включая повторные.
    pub submitted: u64,
    pub delivered: u64,
    /// Квитанции с ошибкой доставки.
    pub delivery_failures: u64,
    pub retried: u64,
    /// Записи, пропущенные после исчерпания повторов (`skip`).
    pub skipped: u64,
    /// Записи, удерживающие прогресс партиции (`hold`/`halt`).
    pub held: u64,
    /// Принятые записи, не попавшие в транспорт до остановки.
    pub abandoned: u64,
    pub stream_errors: u64,
    pub commits: u64,
}

impl PipelineStats {
    pub fn rejected_for(&self, reason: RejectReason) -> u64 {
        self.rejected_by_reason.get(&reason).copied().unwrap_or(0)
    }
}

// ═══════════════════════════════════════════════════════════════
//  Receipt handling
// ═══════════════════════════════════════════════════════════════

/// Что пайплайн должен сделать после квитанции.
#[derive(Debug)]
pub enum ReceiptAction {
    Delivered { key: String, destination: StreamPosition },
    /// Отправить запись ещё раз. `retry`: номер повтора, начиная с 1.
    Retry { key: String, retry: u32, cause: String, record: OutboundRecord },
    /// Повторы исчерпаны, запись пропущена.
    Skipped { key: String, position: StreamPosition, cause: String },
    /// Повторы исчерпаны, прогресс партиции остановлен на этой записи.
    Held { key: String, position: StreamPosition, cause: String },
    /// Повторы исчерпаны, пайплайн должен остановиться.
    Halt { key: String, position: StreamPosition, cause: String },
    /// Квитанция по неизвестной или уже закрытой записи.
    Unknown { ticket: Ticket },
}

// ═══════════════════════════════════════════════════════════════
//  Ledger
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordState {
    /// Прочитана, но ещё не в транспорте.
    Pending,
    InFlight,
    /// Окончательно не доставлена, прогресс удерживается.
    Held,
    Done,
}

#[derive(Debug, Default)]
struct PartitionLedger {
    records: BTreeMap<i64, RecordState>,
    /// Offset, следующий за завершённым префиксом.
    watermark: Option<i64>,
    committed: Option<i64>,
    /// Самая ранняя удержанная запись. До перезапуска watermark выше
    /// неё не поднимется, поэтому завершённые записи за ней не хранятся.
    held_floor: Option<i64>,
}

impl PartitionLedger {
    fn complete(&mut self, offset: i64) {
        if self.held_floor.is_some_and(|floor| offset > floor) {
            self.records.remove(&offset);
            return;
        }
        self.records.insert(offset, RecordState::Done);
        self.advance();
    }

    fn hold(&mut self, offset: i64) {
        self.records.insert(offset, RecordState::Held);
        let floor = self.held_floor.map_or(offset, |f| f.min(offset));
        self.held_floor = Some(floor);
        self.records
            .retain(|&o, state| o <= floor || *state != RecordState::Done);
    }

    fn advance(&mut self) {
        while let Some(entry) = self.records.first_entry() {
            if *entry.get() != RecordState::Done {
                break;
            }
            let next = *entry.key() + 1;
            entry.remove();
            // A re-read of an older offset must not move the mark backwards.
            self.watermark = Some(self.watermark.map_or(next, |w| w.max(next)));
        }
    }
}

#[derive(Debug)]
struct Tracked {
    position: StreamPosition,
    key: String,
    /// Сколько раз запись отправлялась.
    attempts: u32,
    /// Копия последней отправки; `Some` пока ждём квитанцию.
    record: Option<OutboundRecord>,
}

// ═══════════════════════════════════════════════════════════════
//  Coordinator
// ═══════════════════════════════════════════════════════════════

/// Единственный владелец состояния прогресса. Не делает I/O:
/// пайплайн сообщает ему события и забирает готовые отметки.
#[derive(Debug)]
pub struct ProgressCoordinator {
    policy: DeliveryConfig,
    next_ticket: Ticket,
    ledgers: BTreeMap<String, BTreeMap<i32, PartitionLedger>>,
    tickets: HashMap<Ticket, Tracked>,
    in_flight: usize,
    stats: PipelineStats,
}

impl ProgressCoordinator {
    pub fn new(policy: DeliveryConfig) -> Self {
        Self {
            policy,
            next_ticket: 1,
            ledgers: BTreeMap::new(),
            tickets: HashMap::new(),
            in_flight: 0,
            stats: PipelineStats::default(),
        }
    }

    /// Зарегистрировать прочитанную запись.
    pub fn begin(&mut self, position: StreamPosition, key: impl Into<String>) -> Ticket {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.stats.read += 1;
        self.ledgers
            .entry(position.topic.clone())
            .or_default()
            .entry(position.partition)
            .or_default()
            .records
            .insert(position.offset, RecordState::Pending);
        self.tickets.insert(
            ticket,
            Tracked {
                position,
                key: key.into(),
                attempts: 0,
                record: None,
            },
        );
        ticket
    }

    pub fn reject(&mut self, ticket: Ticket, reason: RejectReason) {
        self.stats.rejected += 1;
        *self.stats.rejected_by_reason.entry(reason).or_default() += 1;
        self.close(ticket);
    }

    pub fn malformed(&mut self, ticket: Ticket, _reason: MalformedReason) {
        self.stats.malformed += 1;
        self.close(ticket);
    }

    pub fn accept(&mut self, _ticket: Ticket) {
        self.stats.accepted += 1;
    }

    /// Запись передана транспорту; копия хранится для повторов.
    pub fn submitted(&mut self, record: &OutboundRecord) {
        let Some(tracked) = self.tickets.get_mut(&record.ticket) else {
            return;
        };
        if tracked.record.is_none() {
            self.in_flight += 1;
        }
        tracked.attempts += 1;
        tracked.record = Some(record.clone());
        let position = tracked.position.clone();
        self.stats.submitted += 1;
        self.set_state(&position, RecordState::InFlight);
    }

    /// Транспорт так и не принял запись (остановка во время backpressure).
    /// Прогресс на ней останавливается.
    pub fn abandoned(&mut self, ticket: Ticket) {
        let Some(tracked) = self.tickets.get_mut(&ticket) else {
            return;
        };
        if tracked.record.take().is_some() {
            self.in_flight -= 1;
        }
        let position = tracked.position.clone();
        self.stats.abandoned += 1;
        self.set_state(&position, RecordState::Pending);
    }

    pub fn acknowledge(&mut self, receipt: DeliveryReceipt) -> ReceiptAction {
        let ticket = receipt.ticket;
        let Some(mut tracked) = self.tickets.remove(&ticket) else {
            return ReceiptAction::Unknown { ticket };
        };
        let Some(record) = tracked.record.take() else {
            self.tickets.insert(ticket, tracked);
            return ReceiptAction::Unknown { ticket };
        };
        self.in_flight -= 1;

        let cause = match receipt.outcome {
            DeliveryOutcome::Delivered { topic, partition, offset } => {
                self.stats.delivered += 1;
                self.finish(&tracked.position);
                return ReceiptAction::Delivered {
                    key: tracked.key,
                    destination: StreamPosition { topic, partition, offset },
                };
            }
            DeliveryOutcome::Failed { cause } => cause,
        };

        self.stats.delivery_failures += 1;
        if tracked.attempts <= self.policy.max_retries {
            self.stats.retried += 1;
            let key = tracked.key.clone();
            let retry = tracked.attempts;
            self.set_state(&tracked.position, RecordState::Pending);
            self.tickets.insert(ticket, tracked);
            return ReceiptAction::Retry { key, retry, cause, record };
        }

        let Tracked { position, key, .. } = tracked;
        match self.policy.on_exhausted {
            FailurePolicy::Skip => {
                self.stats.skipped += 1;
                self.finish(&position);
                ReceiptAction::Skipped { key, position, cause }
            }
            FailurePolicy::Hold => {
                self.stats.held += 1;
                self.hold(&position);
                ReceiptAction::Held { key, position, cause }
            }
            FailurePolicy::Halt => {
                self.stats.held += 1;
                self.hold(&position);
                ReceiptAction::Halt { key, position, cause }
            }
        }
    }

    pub fn record_stream_error(&mut self) {
        self.stats.stream_errors += 1;
    }

    /// Сколько отправок ждут квитанцию.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Отметки, которые продвинулись с последнего успешного commit'а.
    pub fn pending_marks(&self) -> Vec<ProgressMark> {
        let mut marks = Vec::new();
        for (topic, partitions) in &self.ledgers {
            for (partition, ledger) in partitions {
                if let Some(next_offset) = ledger.watermark {
                    if ledger.committed != Some(next_offset) {
                        marks.push(ProgressMark {
                            topic: topic.clone(),
                            partition: *partition,
                            next_offset,
                        });
                    }
                }
            }
        }
        marks
    }

    /// Транспорт принял отметки.
    pub fn confirm(&mut self, marks: &[ProgressMark]) {
        if marks.is_empty() {
            return;
        }
        self.stats.commits += 1;
        for mark in marks {
            if let Some(ledger) = self.ledger_mut(&mark.topic, mark.partition) {
                ledger.committed = Some(ledger.committed.map_or(mark.next_offset, |c| c.max(mark.next_offset)));
            }
        }
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    fn close(&mut self, ticket: Ticket) {
        if let Some(tracked) = self.tickets.remove(&ticket) {
            self.finish(&tracked.position);
        }
    }

    fn finish(&mut self, position: &StreamPosition) {
        if let Some(ledger) = self.ledger_mut(&position.topic, position.partition) {
            ledger.complete(position.offset);
        }
    }

    fn hold(&mut self, position: &StreamPosition) {
        if let Some(ledger) = self.ledger_mut(&position.topic, position.partition) {
            ledger.hold(position.offset);
        }
    }

    #[cfg(test)]
    fn retained(&self) -> usize {
        self.ledgers
            .values()
            .flat_map(BTreeMap::values)
            .map(|ledger| ledger.records.len())
            .sum()
    }

    fn set_state(&mut self, position: &StreamPosition, state: RecordState) {
        if let Some(ledger) = self.ledger_mut(&position.topic, position.partition) {
            ledger.records.insert(position.offset, state);
        }
    }

    fn ledger_mut(&mut self, topic: &str, partition: i32) -> Option<&mut PartitionLedger> {
        self.ledgers.get_mut(topic).and_then(|p| p.get_mut(&partition))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(partition: i32, offset: i64) -> StreamPosition {
        StreamPosition { topic: "in".into(), partition, offset }
    }

    fn outbound(ticket: Ticket) -> OutboundRecord {
        OutboundRecord {
            ticket,
            topic: "out".into(),
            key: None,
            payload: b"{}".to_vec(),
        }
    }

    fn coordinator(max_retries: u32, on_exhausted: FailurePolicy) -> ProgressCoordinator {
        ProgressCoordinator::new(DeliveryConfig { max_retries, on_exhausted })
    }

    fn send(c: &mut ProgressCoordinator, position: StreamPosition) -> Ticket {
        let ticket = c.begin(position, "k");
        c.accept(ticket);
        c.submitted(&outbound(ticket));
        ticket
    }

    fn marks(c: &ProgressCoordinator) -> Vec<(i32, i64)> {
        c.pending_marks().iter().map(|m| (m.partition, m.next_offset)).collect()
    }

    #[test]
    fn rejected_records_complete_immediately() {
        let mut c = coordinator(3, FailurePolicy::Skip);
        let t = c.begin(pos(0, 0), "k");
        c.reject(t, RejectReason::MissingIp);
        let t = c.begin(pos(0, 1), "k");
        c.malformed(t, MalformedReason::DecodeError);

        assert_eq!(marks(&c), [(0, 2)]);
        assert_eq!(c.stats().rejected_for(RejectReason::MissingIp), 1);
        assert_eq!(c.stats().malformed, 1);
    }

    #[test]
    fn mark_waits_for_the_oldest_outstanding_record() {
        let mut c = coordinator(3, FailurePolicy::Skip);
        let t0 = send(&mut c, pos(0, 0));
        let t1 = c.begin(pos(0, 1), "k");
        c.reject(t1, RejectReason::InvalidIp);
        let t2 = send(&mut c, pos(0, 2));

        c.acknowledge(DeliveryReceipt::delivered(t2, "out", 0, 9));
        assert!(marks(&c).is_empty());
        assert_eq!(c.in_flight(), 1);

        c.acknowledge(DeliveryReceipt::delivered(t0, "out", 0, 8));
        assert_eq!(marks(&c), [(0, 3)]);
        assert_eq!(c.in_flight(), 0);
    }

    #[test]
    fn partitions_advance_independently() {
        let mut c = coordinator(3, FailurePolicy::Skip);
        let _stuck = send(&mut c, pos(0, 10));
        let t = send(&mut c, pos(1, 4));
        c.acknowledge(DeliveryReceipt::delivered(t, "out", 0, 0));
        assert_eq!(marks(&c), [(1, 5)]);
    }

    #[test]
    fn confirmed_marks_are_not_repeated() {
        let mut c = coordinator(3, FailurePolicy::Skip);
        let t = c.begin(pos(0, 0), "k");
        c.reject(t, RejectReason::MissingIp);
        let pending = c.pending_marks();
        c.confirm(&pending);
        assert!(c.pending_marks().is_empty());
        assert_eq!(c.stats().commits, 1);

        let t = c.begin(pos(0, 1), "k");
        c.reject(t, RejectReason::MissingIp);
        assert_eq!(marks(&c), [(0, 2)]);
    }

    #[test]
    fn failed_delivery_is_retried_then_skipped() {
        let mut c = coordinator(2, FailurePolicy::Skip);
        let t = send(&mut c, pos(0, 0));

        for expected_retry in 1..=2 {
            match c.acknowledge(DeliveryReceipt::failed(t, "broker down")) {
                ReceiptAction::Retry { retry, record, .. } => {
                    assert_eq!(retry, expected_retry);
                    assert_eq!(record.ticket, t);
                    assert!(marks(&c).is_empty());
                    c.submitted(&record);
                }
                other => panic!("expected retry, got {other:?}"),
            }
        }

        assert!(matches!(
            c.acknowledge(DeliveryReceipt::failed(t, "broker down")),
            ReceiptAction::Skipped { .. }
        ));
        assert_eq!(marks(&c), [(0, 1)]);
        assert_eq!(c.stats().submitted, 3);
        assert_eq!(c.stats().delivery_failures, 3);
        assert_eq!(c.stats().retried, 2);
        assert_eq!(c.stats().skipped, 1);
        assert_eq!(c.in_flight(), 0);
    }

    #[test]
    fn hold_policy_blocks_the_partition() {
        let mut c = coordinator(0, FailurePolicy::Hold);
        let t0 = send(&mut c, pos(0, 0));
        let t1 = send(&mut c, pos(0, 1));

        assert!(matches!(
            c.acknowledge(DeliveryReceipt::failed(t0, "too large")),
            ReceiptAction::Held { .. }
        ));
        c.acknowledge(DeliveryReceipt::delivered(t1, "out", 0, 0));
        assert!(marks(&c).is_empty());
        assert_eq!(c.stats().held, 1);
    }

    #[test]
    fn held_partition_does_not_retain_completed_records() {
        let mut c = coordinator(0, FailurePolicy::Hold);
        let t0 = send(&mut c, pos(0, 0));
        let t1 = send(&mut c, pos(0, 1));
        c.acknowledge(DeliveryReceipt::delivered(t1, "out", 0, 0));
        c.acknowledge(DeliveryReceipt::failed(t0, "too large"));
        assert_eq!(c.retained(), 1);

        for offset in 2..10_002 {
            let t = c.begin(pos(0, offset), "k");
            c.reject(t, RejectReason::MissingIp);
        }
        assert_eq!(c.retained(), 1);

        // Outstanding records above the hold are still tracked until they finish.
        let t = send(&mut c, pos(0, 10_002));
        assert_eq!(c.retained(), 2);
        assert_eq!(c.in_flight(), 1);
        c.acknowledge(DeliveryReceipt::delivered(t, "out", 0, 1));
        assert_eq!(c.retained(), 1);
        assert!(marks(&c).is_empty());

        // Other partitions keep advancing.
        let t = c.begin(pos(1, 0), "k");
        c.reject(t, RejectReason::MissingIp);
        assert_eq!(marks(&c), [(1, 1)]);
    }

    #[test]
    fn records_below_a_hold_still_advance_the_mark() {
        let mut c = coordinator(0, FailurePolicy::Hold);
        let t0 = send(&mut c, pos(0, 0));
        let t1 = send(&mut c, pos(0, 1));
        c.acknowledge(DeliveryReceipt::failed(t1, "too large"));
        c.acknowledge(DeliveryReceipt::delivered(t0, "out", 0, 0));
        assert_eq!(marks(&c), [(0, 1)]);
    }

    #[test]
    fn halt_policy_reports_the_position() {
        let mut c = coordinator(0, FailurePolicy::Halt);
        let t = send(&mut c, pos(3, 7));
        match c.acknowledge(DeliveryReceipt::failed(t, "auth")) {
            ReceiptAction::Halt { position, cause, .. } => {
                assert_eq!(position, pos(3, 7));
                assert_eq!(cause, "auth");
            }
            other => panic!("expected halt, got {other:?}"),
        }
        assert!(marks(&c).is_empty());
    }

    #[test]
    fn duplicate_and_unknown_receipts_are_ignored() {
        let mut c = coordinator(3, FailurePolicy::Skip);
        let t = send(&mut c, pos(0, 0));
        c.acknowledge(DeliveryReceipt::delivered(t, "out", 0, 0));

        assert!(matches!(
            c.acknowledge(DeliveryReceipt::delivered(t, "out", 0, 0)),
            ReceiptAction::Unknown { .. }
        ));
        assert!(matches!(
            c.acknowledge(DeliveryReceipt::failed(999, "?")),
            ReceiptAction::Unknown { ticket: 999 }
        ));
        assert_eq!(c.stats().delivered, 1);
    }

    #[test]
    fn abandoned_record_keeps_progress_behind_it() {
        let mut c = coordinator(3, FailurePolicy::Skip);
        let t0 = send(&mut c, pos(0, 0));
        c.abandoned(t0);
        assert_eq!(c.in_flight(), 0);

        let t1 = c.begin(pos(0, 1), "k");
        c.reject(t1, RejectReason::MissingIp);
        assert!(marks(&c).is_empty());

        // A late receipt for an abandoned submission does not count.
        assert!(matches!(
            c.acknowledge(DeliveryReceipt::delivered(t0, "out", 0, 0)),
            ReceiptAction::Unknown { .. }
        ));
        assert_eq!(c.stats().abandoned, 1);
    }

    #[test]
    fn re_read_offset_does_not_move_mark_backwards() {
        let mut c = coordinator(3, FailurePolicy::Skip);
        for offset in 0..3 {
            let t = c.begin(pos(0, offset), "k");
            c.reject(t, RejectReason::MissingIp);
        }
        let t = c.begin(pos(0, 1), "k");
        c.reject(t, RejectReason::MissingIp);
        assert_eq!(marks(&c), [(0, 3)]);
    }
}
