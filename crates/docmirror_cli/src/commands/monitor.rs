//! Monitor command implementation.

use docmirror_postgres::{PgSource, PgStore};
use docmirror_sink::monitor::check;
use docmirror_sink::{DocumentStore, LagThresholds};

/// Parses `WARN,ERROR` thresholds in seconds.
pub fn parse_thresholds(text: &str) -> Result<LagThresholds, String> {
    let (warning, error) = text
        .split_once(',')
        .ok_or_else(|| format!("expected WARN,ERROR thresholds, got {text:?}"))?;
    let parse = |value: &str| {
        value
            .trim()
            .parse::<u64>()
            .map_err(|err| format!("invalid threshold {value:?}: {err}"))
    };
    let (warning, error) = (parse(warning)?, parse(error)?);
    if warning > error {
        return Err(format!("warning threshold {warning} exceeds error threshold {error}"));
    }
    Ok(LagThresholds::new(warning as f64, error as f64))
}

/// Runs the monitor command, printing one status line and returning the
/// exit code.
pub fn run(dsn: &str, client_id: &str, thresholds: LagThresholds) -> Result<u8, Box<dyn std::error::Error>> {
    let mut source = PgSource::connect(dsn)?;
    let mut store = PgStore::connect(dsn)?;
    let report = check(&mut source, &mut store, client_id, thresholds)?;
    store.rollback()?;
    println!("{}", report.line());
    Ok(report.exit_code())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thresholds_parse() {
        assert_eq!(parse_thresholds("1,99").unwrap(), LagThresholds::new(1.0, 99.0));
        assert_eq!(parse_thresholds(" 5 , 60 ").unwrap(), LagThresholds::new(5.0, 60.0));
    }

    #[test]
    fn bad_thresholds_are_rejected() {
        assert!(parse_thresholds("10").is_err());
        assert!(parse_thresholds("a,b").is_err());
        assert!(parse_thresholds("99,1").is_err());
    }
}
