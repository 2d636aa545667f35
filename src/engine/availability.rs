//! 可用时段与空闲槽位搜索
//!
//! 排期器、改期策略与补救复习共用同一套搜索：按可用星期逐日推进，
//! 从偏好时段起点开始绕开既有任务，单日跨度由调用方给定
//! （初始排期用 minutes_per_day，改期/补救放宽到日容量上限）。
//! 返回的槽位天然满足「同计划任务区间不重叠」。

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};

use crate::domain::{Availability, Task, TimeBand};

/// 某天偏好时段的起点（UTC）
pub fn band_start(date: NaiveDate, band: TimeBand) -> DateTime<Utc> {
    // 小时为常量枚举值，and_hms_opt 不会失败
    let naive = date.and_hms_opt(band.start_hour(), 0, 0).unwrap();
    Utc.from_utc_datetime(&naive)
}

/// [from 当天, until 当天] 内与可用星期匹配的日期序列
pub fn available_days(
    avail: &Availability,
    from: DateTime<Utc>,
    until: DateTime<Utc>,
) -> Vec<NaiveDate> {
    let mut out = Vec::new();
    let mut day = from.date_naive();
    let last = until.date_naive();
    while day <= last {
        if avail.includes(day.weekday()) {
            out.push(day);
        }
        match day.succ_opt() {
            Some(next) => day = next,
            None => break,
        }
    }
    out
}

/// 窗口内的总可用分钟数（时间分配的分母）
pub fn total_available_minutes(
    avail: &Availability,
    from: DateTime<Utc>,
    until: DateTime<Utc>,
) -> i64 {
    available_days(avail, from, until).len() as i64 * avail.minutes_per_day
}

/// 已排期任务在某天占用的分钟数（任何状态的任务都占据日历）
pub fn minutes_scheduled_on(tasks: &[Task], date: NaiveDate) -> i64 {
    tasks
        .iter()
        .filter(|t| t.start_time.map(|s| s.date_naive()) == Some(date))
        .map(|t| t.duration_min)
        .sum()
}

/// 在指定日期内找一个不与既有任务冲突的槽位。
/// day_window_min 限定当天从时段起点算起的总跨度：初始排期传
/// minutes_per_day，改期/补救传日容量上限（可向既定可用时间之外
/// 借一点，但不突破硬上限）。
pub fn find_slot_on_day(
    date: NaiveDate,
    avail: &Availability,
    tasks: &[Task],
    duration_min: i64,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    day_window_min: i64,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let window_start = band_start(date, avail.band);
    let window_end = window_start + Duration::minutes(day_window_min);

    let mut busy: Vec<(DateTime<Utc>, DateTime<Utc>)> = tasks
        .iter()
        .filter_map(|t| match (t.start_time, t.end_time) {
            (Some(s), Some(e)) if s.date_naive() == date => Some((s, e)),
            _ => None,
        })
        .collect();
    busy.sort();

    let mut cursor = window_start.max(not_before);
    for (start, end) in busy {
        if cursor + Duration::minutes(duration_min) <= start {
            break;
        }
        cursor = cursor.max(end);
    }

    let slot_end = cursor + Duration::minutes(duration_min);
    if cursor.date_naive() != date || slot_end > window_end || slot_end > not_after {
        return None;
    }
    Some((cursor, slot_end))
}

/// 从 from 起按日期顺序找第一个空闲槽位（最早优先）。
/// until 通常是考试时间：槽位必须整体落在它之前。
pub fn find_next_slot(
    avail: &Availability,
    tasks: &[Task],
    duration_min: i64,
    from: DateTime<Utc>,
    until: DateTime<Utc>,
    day_window_min: i64,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    if avail.is_empty() || duration_min <= 0 {
        return None;
    }
    for date in available_days(avail, from, until) {
        if let Some(slot) =
            find_slot_on_day(date, avail, tasks, duration_min, from, until, day_window_min)
        {
            return Some(slot);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Difficulty, TaskMeta, TaskStatus, TaskType};
    use chrono::Weekday;

    fn avail() -> Availability {
        Availability {
            weekdays: vec![Weekday::Mon, Weekday::Wed, Weekday::Fri],
            minutes_per_day: 120,
            band: TimeBand::Morning,
        }
    }

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    fn task_at(id: &str, start: DateTime<Utc>, dur: i64) -> Task {
        Task {
            id: id.to_string(),
            plan_id: "p1".to_string(),
            title: String::new(),
            description: String::new(),
            task_type: TaskType::Reading,
            status: TaskStatus::Pending,
            start_time: Some(start),
            end_time: Some(start + Duration::minutes(dur)),
            duration_min: dur,
            topic_id: "t1".to_string(),
            difficulty: Difficulty::Medium,
            content_ref: None,
            meta: TaskMeta::default(),
            original_start_time: None,
            original_end_time: None,
            created_at: start,
        }
    }

    #[test]
    fn test_available_days_match_weekdays() {
        // 2025-03-03 是周一
        let days = available_days(&avail(), at(2025, 3, 3, 0), at(2025, 3, 9, 23));
        let expected = vec![
            NaiveDate::from_ymd_opt(2025, 3, 3).unwrap(),
            NaiveDate::from_ymd_opt(2025, 3, 5).unwrap(),
            NaiveDate::from_ymd_opt(2025, 3, 7).unwrap(),
        ];
        assert_eq!(days, expected);
    }

    #[test]
    fn test_first_slot_starts_at_band() {
        let slot = find_next_slot(&avail(), &[], 60, at(2025, 3, 3, 0), at(2025, 3, 17, 0), 120);
        assert_eq!(slot, Some((at(2025, 3, 3, 8), at(2025, 3, 3, 9))));
    }

    #[test]
    fn test_slot_skips_busy_interval() {
        let busy = vec![task_at("a", at(2025, 3, 3, 8), 60)];
        let slot = find_next_slot(&avail(), &busy, 60, at(2025, 3, 3, 0), at(2025, 3, 17, 0), 120);
        assert_eq!(slot, Some((at(2025, 3, 3, 9), at(2025, 3, 3, 10))));
    }

    #[test]
    fn test_full_day_overflows_to_next_available() {
        let busy = vec![
            task_at("a", at(2025, 3, 3, 8), 60),
            task_at("b", at(2025, 3, 3, 9), 60),
        ];
        // 周一容量 120 分钟已满，下一个可用日是周三
        let slot = find_next_slot(&avail(), &busy, 30, at(2025, 3, 3, 0), at(2025, 3, 17, 0), 120);
        assert_eq!(slot, Some((at(2025, 3, 5, 8), at(2025, 3, 5, 8) + Duration::minutes(30))));
    }

    #[test]
    fn test_wider_window_borrows_beyond_planned_minutes() {
        let busy = vec![
            task_at("a", at(2025, 3, 3, 8), 60),
            task_at("b", at(2025, 3, 3, 9), 60),
        ];
        // 改期/补救允许把窗口放宽到日容量上限，同一天还能借到槽位
        let slot = find_next_slot(&avail(), &busy, 30, at(2025, 3, 3, 0), at(2025, 3, 17, 0), 240);
        assert_eq!(slot, Some((at(2025, 3, 3, 10), at(2025, 3, 3, 10) + Duration::minutes(30))));
    }

    #[test]
    fn test_no_slot_after_deadline() {
        let slot = find_next_slot(&avail(), &[], 60, at(2025, 3, 3, 0), at(2025, 3, 3, 8), 120);
        assert_eq!(slot, None);
    }

    #[test]
    fn test_empty_availability_has_no_slot() {
        let a = Availability {
            weekdays: vec![],
            minutes_per_day: 120,
            band: TimeBand::Morning,
        };
        assert_eq!(
            find_next_slot(&a, &[], 60, at(2025, 3, 3, 0), at(2025, 3, 17, 0), 120),
            None
        );
    }
}
