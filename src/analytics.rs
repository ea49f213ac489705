//! Sleep and diaper analytics
//!
//! Pure functions over logged events. Calendar days are taken in the
//! supplied time zone (the CLI passes `chrono::Local`).

use crate::sleep::SleepState;
use crate::store::{DiaperEvent, SleepEvent};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::Serialize;

/// Recommended wake windows by age in months, in hours
const WAKE_WINDOWS: [(u32, f64, f64); 7] = [
    (0, 0.5, 1.0),
    (3, 1.25, 1.75),
    (6, 2.0, 3.0),
    (9, 2.5, 3.5),
    (12, 3.0, 4.0),
    (18, 4.0, 6.0),
    (24, 5.0, 6.0),
];

const NIGHT_START_HOUR: u32 = 19;
const NIGHT_END_HOUR: u32 = 7;

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

fn minutes(d: Duration) -> f64 {
    d.num_seconds() as f64 / 60.0
}

fn local_date<Tz: TimeZone>(at: DateTime<Utc>, tz: &Tz) -> NaiveDate {
    at.with_timezone(tz).date_naive()
}

/// Local wall-clock time on `date` as UTC
fn at_local<Tz: TimeZone>(date: NaiveDate, hour: u32, tz: &Tz) -> DateTime<Utc> {
    let naive = date.and_time(NaiveTime::from_hms_opt(hour, 0, 0).unwrap_or_default());
    match tz.from_local_datetime(&naive).earliest() {
        Some(dt) => dt.with_timezone(&Utc),
        None => Utc.from_utc_datetime(&naive),
    }
}

fn chronological(events: &[SleepEvent]) -> Vec<&SleepEvent> {
    let mut sorted: Vec<&SleepEvent> = events.iter().collect();
    sorted.sort_by_key(|e| e.start);
    sorted
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DailySleepStats {
    pub date: NaiveDate,
    pub total_nap_minutes: f64,
    pub nap_count: u32,
    pub longest_nap_minutes: f64,
}

/// Naps that start and end on `date`
pub fn daily_sleep_stats<Tz: TimeZone>(
    events: &[SleepEvent],
    date: NaiveDate,
    tz: &Tz,
) -> DailySleepStats {
    let mut stats = DailySleepStats {
        date,
        ..Default::default()
    };
    let mut nap_start: Option<DateTime<Utc>> = None;

    for event in chronological(events) {
        if local_date(event.start, tz) != date {
            continue;
        }
        match event.state {
            SleepState::Asleep => {
                nap_start = Some(event.start);
                stats.nap_count += 1;
            }
            SleepState::Awake => {
                if let Some(start) = nap_start.take() {
                    let nap = minutes(event.start - start);
                    stats.total_nap_minutes += nap;
                    stats.longest_nap_minutes = stats.longest_nap_minutes.max(nap);
                }
            }
            SleepState::Unknown => {}
        }
    }

    stats.total_nap_minutes = round1(stats.total_nap_minutes);
    stats.longest_nap_minutes = round1(stats.longest_nap_minutes);
    stats
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NightSleepStats {
    pub total_minutes: f64,
    pub wake_count: u32,
    pub longest_stretch_minutes: f64,
}

/// The night ending on the morning of `date`: 19:00 the day before to 07:00
pub fn night_sleep_stats<Tz: TimeZone>(
    events: &[SleepEvent],
    date: NaiveDate,
    tz: &Tz,
) -> NightSleepStats {
    let night_end = at_local(date, NIGHT_END_HOUR, tz);
    let night_start = at_local(date - Duration::days(1), NIGHT_START_HOUR, tz);

    let mut total = 0.0;
    let mut longest: f64 = 0.0;
    let mut wakes = 0u32;
    let mut sleep_start: Option<DateTime<Utc>> = None;

    for event in chronological(events) {
        if event.start < night_start || event.start > night_end {
            continue;
        }
        match event.state {
            SleepState::Asleep => sleep_start = Some(event.start),
            SleepState::Awake => {
                if let Some(start) = sleep_start.take() {
                    let stretch = minutes(event.start - start);
                    total += stretch;
                    longest = longest.max(stretch);
                }
                wakes += 1;
            }
            SleepState::Unknown => {}
        }
    }

    // Still asleep when the night ends
    if let Some(start) = sleep_start {
        let stretch = minutes(night_end - start);
        if stretch > 0.0 {
            total += stretch;
            longest = longest.max(stretch);
        }
    }

    NightSleepStats {
        total_minutes: round1(total),
        // The morning wake-up isn't a night waking
        wake_count: wakes.saturating_sub(1),
        longest_stretch_minutes: round1(longest),
    }
}

/// Daily stats for the seven days ending on `today`, oldest first
pub fn weekly_trends<Tz: TimeZone>(
    events: &[SleepEvent],
    today: NaiveDate,
    tz: &Tz,
) -> Vec<DailySleepStats> {
    (0..7)
        .rev()
        .map(|days_ago| daily_sleep_stats(events, today - Duration::days(days_ago), tz))
        .collect()
}

/// Recommended wake window (min, max) in hours for the baby's age
pub fn wake_window(age_months: u32) -> (f64, f64) {
    WAKE_WINDOWS
        .iter()
        .rev()
        .find(|(age, _, _)| *age <= age_months)
        .map(|&(_, min, max)| (min, max))
        .unwrap_or((2.0, 3.0))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Green,
    Yellow,
    Red,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WakeWindowStatus {
    pub awake_minutes: f64,
    pub window_min_minutes: f64,
    pub window_max_minutes: f64,
    pub remaining_minutes: f64,
    pub urgency: Urgency,
    pub baby_age_months: u32,
}

/// How far into the wake window the baby is. `awake_since` is None when
/// the baby isn't awake.
pub fn wake_window_status(
    age_months: u32,
    awake_since: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> WakeWindowStatus {
    let (min_h, max_h) = wake_window(age_months);
    let awake = awake_since
        .map(|since| minutes(now - since).max(0.0))
        .unwrap_or(0.0);
    let (min_m, max_m) = (min_h * 60.0, max_h * 60.0);

    let urgency = if awake >= max_m {
        Urgency::Red
    } else if awake >= min_m {
        Urgency::Yellow
    } else {
        Urgency::Green
    };

    WakeWindowStatus {
        awake_minutes: round1(awake),
        window_min_minutes: round1(min_m),
        window_max_minutes: round1(max_m),
        remaining_minutes: round1((max_m - awake).max(0.0)),
        urgency,
        baby_age_months: age_months,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiaperStats {
    pub date: NaiveDate,
    pub total: u32,
    pub wet: u32,
    pub dirty: u32,
    pub daily_average_7d: f64,
    pub last_change: Option<DiaperEvent>,
}

/// Counts for `date`, plus a trailing seven-day average ending `today`
pub fn diaper_stats<Tz: TimeZone>(
    events: &[DiaperEvent],
    date: NaiveDate,
    today: NaiveDate,
    tz: &Tz,
) -> DiaperStats {
    let on_date: Vec<&DiaperEvent> = events
        .iter()
        .filter(|e| local_date(e.at, tz) == date)
        .collect();
    let week_start = today - Duration::days(7);
    let last_week = events
        .iter()
        .filter(|e| local_date(e.at, tz) >= week_start)
        .count();

    DiaperStats {
        date,
        total: on_date.len() as u32,
        wet: on_date.iter().filter(|e| e.kind.is_wet()).count() as u32,
        dirty: on_date.iter().filter(|e| e.kind.is_dirty()).count() as u32,
        daily_average_7d: round1(last_week as f64 / 7.0),
        last_change: events.iter().max_by_key(|e| e.at).cloned(),
    }
}

/// When the baby last woke up, if the latest sleep event is a wake-up
pub fn awake_since(events: &[SleepEvent]) -> Option<DateTime<Utc>> {
    events
        .iter()
        .max_by_key(|e| e.start)
        .filter(|e| e.state == SleepState::Awake)
        .map(|e| e.start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DiaperKind;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    fn at(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, d, h, m, 0).unwrap()
    }

    fn ev(state: SleepState, start: DateTime<Utc>) -> SleepEvent {
        SleepEvent {
            state,
            start,
            confidence: None,
            reasons: vec![],
        }
    }

    fn diaper(kind: DiaperKind, when: DateTime<Utc>) -> DiaperEvent {
        DiaperEvent {
            at: when,
            kind,
            notes: None,
        }
    }

    #[test]
    fn test_daily_naps() {
        // Newest first, as the store returns them
        let events = vec![
            ev(SleepState::Awake, at(5, 15, 30)),
            ev(SleepState::Asleep, at(5, 14, 0)),
            ev(SleepState::Awake, at(5, 10, 45)),
            ev(SleepState::Asleep, at(5, 10, 0)),
            ev(SleepState::Asleep, at(4, 13, 0)),
        ];
        let stats = daily_sleep_stats(&events, date(5), &Utc);
        assert_eq!(stats.nap_count, 2);
        assert_eq!(stats.total_nap_minutes, 135.0);
        assert_eq!(stats.longest_nap_minutes, 90.0);
    }

    #[test]
    fn test_daily_empty() {
        let stats = daily_sleep_stats(&[], date(5), &Utc);
        assert_eq!(stats.nap_count, 0);
        assert_eq!(stats.total_nap_minutes, 0.0);
    }

    #[test]
    fn test_night_counts_wakes_after_first() {
        let events = vec![
            ev(SleepState::Awake, at(4, 18, 30)),
            ev(SleepState::Asleep, at(4, 19, 30)),
            ev(SleepState::Awake, at(4, 23, 30)),
            ev(SleepState::Asleep, at(4, 23, 50)),
            ev(SleepState::Awake, at(5, 6, 50)),
        ];
        let stats = night_sleep_stats(&events, date(5), &Utc);
        assert_eq!(stats.total_minutes, 240.0 + 420.0);
        assert_eq!(stats.longest_stretch_minutes, 420.0);
        assert_eq!(stats.wake_count, 1);
    }

    #[test]
    fn test_night_still_asleep_counts_to_night_end() {
        let events = vec![ev(SleepState::Asleep, at(5, 1, 0))];
        let stats = night_sleep_stats(&events, date(5), &Utc);
        assert_eq!(stats.total_minutes, 360.0);
        assert_eq!(stats.wake_count, 0);
    }

    #[test]
    fn test_weekly_trends_oldest_first() {
        let events = vec![
            ev(SleepState::Asleep, at(5, 10, 0)),
            ev(SleepState::Awake, at(5, 11, 0)),
        ];
        let week = weekly_trends(&events, date(7), &Utc);
        assert_eq!(week.len(), 7);
        assert_eq!(week[0].date, date(1));
        assert_eq!(week[6].date, date(7));
        assert_eq!(week[4].total_nap_minutes, 60.0);
    }

    #[test]
    fn test_wake_window_table() {
        assert_eq!(wake_window(0), (0.5, 1.0));
        assert_eq!(wake_window(4), (1.25, 1.75));
        assert_eq!(wake_window(12), (3.0, 4.0));
        assert_eq!(wake_window(40), (5.0, 6.0));
    }

    #[test]
    fn test_wake_window_urgency() {
        let now = at(5, 12, 0);
        let green = wake_window_status(6, Some(now - Duration::minutes(60)), now);
        assert_eq!(green.urgency, Urgency::Green);
        assert_eq!(green.remaining_minutes, 120.0);

        let yellow = wake_window_status(6, Some(now - Duration::minutes(150)), now);
        assert_eq!(yellow.urgency, Urgency::Yellow);

        let red = wake_window_status(6, Some(now - Duration::minutes(200)), now);
        assert_eq!(red.urgency, Urgency::Red);
        assert_eq!(red.remaining_minutes, 0.0);

        let asleep = wake_window_status(6, None, now);
        assert_eq!(asleep.awake_minutes, 0.0);
        assert_eq!(asleep.urgency, Urgency::Green);
    }

    #[test]
    fn test_diaper_counts() {
        let events = vec![
            diaper(DiaperKind::Wet, at(5, 8, 0)),
            diaper(DiaperKind::Both, at(5, 12, 0)),
            diaper(DiaperKind::Dirty, at(5, 16, 0)),
            diaper(DiaperKind::Dry, at(5, 18, 0)),
            diaper(DiaperKind::Wet, at(4, 20, 0)),
            diaper(DiaperKind::Wet, at(1, 20, 0)),
        ];
        let stats = diaper_stats(&events, date(5), date(10), &Utc);
        assert_eq!(stats.total, 4);
        assert_eq!(stats.wet, 2);
        assert_eq!(stats.dirty, 2);
        // Only the five from the 3rd onwards are in the trailing week
        assert_eq!(stats.daily_average_7d, 0.7);
        assert_eq!(stats.last_change.unwrap().at, at(5, 18, 0));
    }

    #[test]
    fn test_awake_since_latest_event() {
        let events = vec![
            ev(SleepState::Asleep, at(5, 9, 0)),
            ev(SleepState::Awake, at(5, 10, 0)),
        ];
        assert_eq!(awake_since(&events), Some(at(5, 10, 0)));
        assert_eq!(awake_since(&events[..1]), None);
    }
}
