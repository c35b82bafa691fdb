use std::time::Duration;

use crate::{parse_duration, parse_timeout, DurationParseError, Timeout};

#[test]
fn units() {
    assert_eq!(parse_duration("5min"), Ok(Duration::from_secs(300)));
    assert_eq!(parse_duration("5m"), Ok(Duration::from_secs(300)));
    assert_eq!(parse_duration("30s"), Ok(Duration::from_secs(30)));
    assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
    assert_eq!(parse_duration("90us"), Ok(Duration::from_micros(90)));
    assert_eq!(parse_duration("0ms"), Ok(Duration::ZERO));
}

#[test]
fn rejects_garbage() {
    for bad in ["", "ms", "5", "5h", "5 ms", "-5ms", "fivems"] {
        assert!(
            matches!(parse_duration(bad), Err(DurationParseError::BadFormat(_))),
            "{bad:?} should be rejected"
        );
    }
}

#[test]
fn rejects_overflow() {
    assert!(matches!(
        parse_duration("99999999999999999999ms"),
        Err(DurationParseError::OutOfRange(_))
    ));
    assert!(matches!(
        parse_duration("999999999999999999min"),
        Err(DurationParseError::OutOfRange(_))
    ));
}

#[test]
fn inf_is_a_timeout_but_not_a_duration() {
    assert_eq!(parse_timeout("inf"), Ok(Timeout::INF));
    assert!(parse_duration("inf").is_err());
    assert_eq!(
        parse_timeout("100ms"),
        Ok(Timeout::finite(Duration::from_millis(100)))
    );
}

#[test]
fn timeout_min_prefers_finite() {
    let a = Timeout::finite(Duration::from_millis(10));
    let b = Timeout::finite(Duration::from_millis(20));
    assert_eq!(a.min(b), a);
    assert_eq!(b.min(a), a);
    assert_eq!(Timeout::INF.min(a), a);
    assert_eq!(a.min(Timeout::INF), a);
    assert_eq!(Timeout::INF.min(Timeout::INF), Timeout::INF);
}

#[test]
fn display_forms() {
    assert_eq!(Timeout::INF.to_string(), "inf");
    assert_eq!(
        Timeout::finite(Duration::from_millis(250)).to_string(),
        "250ms"
    );
}
