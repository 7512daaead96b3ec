use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use fill_download::schedule::{ActiveDays, ScheduleGate, ScheduleWindow};
use proptest::prelude::*;

fn minute_of_day(m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(m / 60, m % 60, 0).unwrap()
}

fn arb_window() -> impl Strategy<Value = ScheduleWindow> {
    (
        0u32..1440,
        0u32..1440,
        prop::array::uniform7(any::<bool>()).prop_filter("one active day", |d| d.iter().any(|x| *x)),
        prop::option::of(0i64..60),
    )
        .prop_map(|(a, b, flags, start_offset)| {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            let start_date = start_offset
                .map(|d| NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + Duration::days(d));
            ScheduleWindow::new(minute_of_day(lo), minute_of_day(hi), ActiveDays::from_flags(flags), start_date)
                .unwrap()
        })
}

fn arb_instant() -> impl Strategy<Value = NaiveDateTime> {
    (0i64..90, 0u32..86_400).prop_map(|(day, secs)| {
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + Duration::days(day);
        date.and_time(NaiveTime::from_num_seconds_from_midnight_opt(secs, 0).unwrap())
    })
}

fn next_minute(t: NaiveDateTime) -> NaiveDateTime {
    let floor = t.date().and_hms_opt(t.hour(), t.minute(), 0).unwrap();
    floor + Duration::minutes(1)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn is_open_matches_definition(w in arb_window(), t in arb_instant()) {
        let gate = ScheduleGate::new(w.clone());
        let expected = w.days().contains(t.weekday())
            && t.time() >= w.start()
            && t.time() <= w.end()
            && w.start_date().map_or(true, |d| t.date() >= d);
        prop_assert_eq!(gate.is_open(t), expected);
    }

    #[test]
    fn next_open_is_reachable_open_and_tight(w in arb_window(), t in arb_instant()) {
        let gate = ScheduleGate::new(w);
        let next = gate.next_open_instant(t).expect("window has an active day");
        prop_assert!(next >= t);
        prop_assert!(gate.is_open(next));

        // the open set is a union of intervals starting on minute boundaries,
        // so checking t and every minute boundary before `next` is exhaustive
        if next > t {
            prop_assert!(!gate.is_open(t));
            let mut probe = next_minute(t);
            while probe < next {
                prop_assert!(!gate.is_open(probe), "open at {} before {}", probe, next);
                probe += Duration::minutes(1);
            }
        }
    }
}

#[test]
fn friday_evening_to_monday_morning_from_tuesday() {
    use chrono::Weekday;
    let days = ActiveDays::default()
        .with(Weekday::Fri)
        .with(Weekday::Sat)
        .with(Weekday::Sun)
        .with(Weekday::Mon);
    let gate = ScheduleGate::new(
        ScheduleWindow::new(minute_of_day(0), minute_of_day(1439), days, None).unwrap(),
    );
    // Tuesday 2024-03-12 noon -> Friday 2024-03-15 00:00
    let tue = NaiveDate::from_ymd_opt(2024, 3, 12).unwrap().and_hms_opt(12, 0, 0).unwrap();
    assert_eq!(
        gate.next_open_instant(tue),
        NaiveDate::from_ymd_opt(2024, 3, 15).unwrap().and_hms_opt(0, 0, 0)
    );
}
