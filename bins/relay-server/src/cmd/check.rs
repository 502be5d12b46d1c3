use std::io::{BufRead, BufReader, Write};

use relay_transform::{ProcessingOutcome, Validator};

use crate::config::{CheckArgs, load_config};
use crate::error::RelayError;

/// Итог проверки файла.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Counts {
    pub accepted: u64,
    pub rejected: u64,
    pub malformed: u64,
}

/// Провалидировать JSON Lines: принятые записи в stdout,
/// отклонённые в лог с номером строки.
pub fn run(args: CheckArgs) -> Result<(), RelayError> {
    let mut validation = load_config(&args.config)?.pipeline.validation;
    if args.allow_missing_ip {
        validation.require_ip = false;
    }
    let validator = Validator::new(&validation);

    let out = std::io::stdout().lock();
    let counts = if args.input == "-" {
        check_lines(&validator, std::io::stdin().lock(), out)?
    } else {
        let file = std::fs::File::open(&args.input)?;
        check_lines(&validator, BufReader::new(file), out)?
    };

    tracing::info!(
        accepted = counts.accepted,
        rejected = counts.rejected,
        malformed = counts.malformed,
        "check finished"
    );
    Ok(())
}

pub fn check_lines(validator: &Validator, input: impl BufRead, mut out: impl Write) -> Result<Counts, RelayError> {
    let mut counts = Counts::default();
    for (index, line) in input.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match validator.validate(line.as_bytes()) {
            ProcessingOutcome::Accepted(record) => {
                out.write_all(&record.to_bytes()?)?;
                out.write_all(b"\n")?;
                counts.accepted += 1;
            }
            ProcessingOutcome::Rejected(reason) => {
                tracing::warn!(line = index + 1, %reason, "record rejected");
                counts.rejected += 1;
            }
            ProcessingOutcome::MalformedInput(reason) => {
                tracing::warn!(line = index + 1, %reason, "malformed record");
                counts.malformed += 1;
            }
        }
    }
    out.flush()?;
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_transform::ValidatorConfig;
    use serde_json::Value;

    const INPUT: &str = concat!(
        r#"{"user_id":"u1","timestamp":1700000000,"locale":"en-us","ip":"192.168.1.1"}"#, "\n",
        "\n",
        r#"{"user_id":"u2","timestamp":1700000000}"#, "\n",
        "   \n",
        "{not json\n",
        r#"{"timestamp":1700000000,"ip":"10.0.0.1"}"#, "\n",
        r#"[1,2]"#, "\n",
    );

    fn check(require_ip: bool) -> (Counts, Vec<Value>) {
        let validator = Validator::new(&ValidatorConfig { require_ip });
        let mut out = Vec::new();
        let counts = check_lines(&validator, INPUT.as_bytes(), &mut out).expect("check");
        let records = String::from_utf8(out)
            .expect("utf-8 output")
            .lines()
            .map(|line| serde_json::from_str(line).expect("each output line is json"))
            .collect();
        (counts, records)
    }

    #[test]
    fn accepted_records_are_written_as_json_lines() {
        let (counts, records) = check(true);
        assert_eq!(counts, Counts { accepted: 1, rejected: 2, malformed: 2 });
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["user_id"], "u1");
        assert_eq!(records[0]["ip"], "192.168.001.001");
        assert_eq!(records[0]["locale"], "EN-US");
        assert_eq!(records[0]["timestamp"], "2023-11-14T22:13:20Z");
        assert_eq!(records[0]["processed"], true);
    }

    #[test]
    fn ip_gate_can_be_lifted() {
        let (counts, records) = check(false);
        assert_eq!(counts, Counts { accepted: 2, rejected: 1, malformed: 2 });
        let users: Vec<&str> = records.iter().filter_map(|r| r["user_id"].as_str()).collect();
        assert_eq!(users, ["u1", "u2"]);
        assert!(records[1].get("ip").is_none());
    }

    #[test]
    fn empty_input_writes_nothing() {
        let mut out = Vec::new();
        let counts = check_lines(&Validator::default(), "\n\n".as_bytes(), &mut out).expect("check");
        assert_eq!(counts, Counts::default());
        assert!(out.is_empty());
    }
}
