use bucketail::{parse_time, Bound, Comparison, DateCondition, Zone};
use chrono::{DateTime, Duration, TimeZone, Utc};

fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
}

#[test]
fn naive_times_use_the_configured_zone() {
    let tokyo: Zone = "Asia/Tokyo".parse().unwrap();
    let t = parse_time("2015-01-01 09:00:00", Some("%Y-%m-%d %H:%M:%S"), &tokyo).unwrap();
    assert_eq!(t, utc(2015, 1, 1, 0, 0, 0));

    let fixed: Zone = "-05:00".parse().unwrap();
    let t = parse_time("2015-01-01 00:00:00", Some("%Y-%m-%d %H:%M:%S"), &fixed).unwrap();
    assert_eq!(t, utc(2015, 1, 1, 5, 0, 0));
}

#[test]
fn explicit_offsets_win_over_the_zone() {
    let tokyo: Zone = "Asia/Tokyo".parse().unwrap();
    let t = parse_time("2015-01-01 09:00:00 +0000", Some("%Y-%m-%d %H:%M:%S %z"), &tokyo).unwrap();
    assert_eq!(t, utc(2015, 1, 1, 9, 0, 0));

    let t = parse_time("2015-01-01T09:00:00+01:00", None, &tokyo).unwrap();
    assert_eq!(t, utc(2015, 1, 1, 8, 0, 0));
}

#[test]
fn guessed_formats_and_partial_dates() {
    let z = Zone::default();
    assert_eq!(parse_time("10/Oct/2015:13:55:36 -0700", None, &z).unwrap(), utc(2015, 10, 10, 20, 55, 36));
    assert_eq!(parse_time("2015-03-04 05:06:07", None, &z).unwrap(), utc(2015, 3, 4, 5, 6, 7));
    assert_eq!(parse_time("201503", Some("%Y%m"), &z).unwrap(), utc(2015, 3, 1, 0, 0, 0));
    assert_eq!(parse_time("20150304", Some("%Y%m%d"), &z).unwrap(), utc(2015, 3, 4, 0, 0, 0));
    assert!(parse_time("not a time", None, &z).is_err());
    assert!(parse_time("2015-13-45", Some("%Y-%m-%d"), &z).is_err());
}

#[test]
fn condition_parsing() {
    let z = Zone::default();
    let c = DateCondition::parse(1, "date %Y%m%d >= -86400", &z).unwrap();
    assert_eq!(c.group, "date");
    assert_eq!(c.format.as_deref(), Some("%Y%m%d"));
    assert_eq!(c.op, Comparison::Ge);
    assert_eq!(c.bound, Bound::Relative(-86400));

    let c = DateCondition::parse(2, "hour %Y-%m-%d %H < 2015-06-01T00:00:00Z", &z).unwrap();
    assert_eq!(c.format.as_deref(), Some("%Y-%m-%d %H"));
    assert_eq!(c.op, Comparison::Lt);
    assert_eq!(c.bound, Bound::Absolute(utc(2015, 6, 1, 0, 0, 0)));

    assert!(DateCondition::parse(3, "date", &z).is_err());
    assert!(DateCondition::parse(3, "date %Y%m%d => 0", &z).is_err());
}

#[test]
fn relative_bounds_follow_the_poll_time() {
    let z = Zone::default();
    let now = utc(2015, 6, 10, 12, 0, 0);
    let recent = DateCondition::parse(1, "date %Y%m%d >= -172800", &z).unwrap();

    assert!(recent.evaluate(Some("20150609"), now, &z).unwrap());
    assert!(recent.evaluate(Some("20150608"), now, &z).is_ok_and(|ok| !ok));
    assert!(recent.evaluate(Some("20150609"), now + Duration::days(3), &z).is_ok_and(|ok| !ok));
}

#[test]
fn unrepresentable_relative_bounds_error_instead_of_panicking() {
    let z = Zone::default();
    let now = utc(2015, 6, 10, 12, 0, 0);
    let huge = DateCondition::parse(1, "date %Y%m%d >= +9999999999999999", &z).unwrap();
    assert_eq!(huge.bound.resolve(now), None);
    assert!(huge.evaluate(Some("20150609"), now, &z).is_err());
    assert_eq!(Bound::Relative(-86400).resolve(now), Some(utc(2015, 6, 9, 12, 0, 0)));
}

#[test]
fn absent_values_pass_and_garbage_errors() {
    let z = Zone::default();
    let now = Utc::now();
    let c = DateCondition::parse(1, "date %Y%m%d == +0", &z).unwrap();
    assert!(c.evaluate(None, now, &z).unwrap(), "a key without the group is not constrained");
    assert!(c.evaluate(Some("yesterday"), now, &z).is_err());
}

#[test]
fn operators() {
    let z = Zone::default();
    let now = Utc::now();
    let check = |op: &str, value: &str| {
        DateCondition::parse(1, &format!("d %Y%m%d {op} 2015-06-10"), &z)
            .unwrap()
            .evaluate(Some(value), now, &z)
            .unwrap()
    };
    assert!(check("==", "20150610"));
    assert!(check("!=", "20150611"));
    assert!(check(">", "20150611"));
    assert!(!check(">", "20150610"));
    assert!(check("<=", "20150610"));
    assert!(check("<", "20150609"));
}
