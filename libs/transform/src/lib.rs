//! Трансформация входных событий: нормализация полей и решение
//! о публикации. Никакого I/O, только чистые функции над байтами записи.

mod normalize;
mod outcome;
mod record;
mod validate;

pub use normalize::{epoch_seconds_to_iso8601, normalize_ip, normalize_locale, normalize_timestamp};
pub use outcome::{MalformedReason, ProcessingOutcome, RejectReason};
pub use record::{fields, NormalizedRecord, ParsedRecord};
pub use validate::{Validator, ValidatorConfig};
