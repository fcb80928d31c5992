use bitflags::bitflags;
use chrono::Weekday;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};
use thiserror::Error;
use uuid::Uuid;

use crate::clock::MINUTE_MS;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("weekday number {0} is outside 1 (Monday) ..= 7 (Sunday)")]
    WeekdayOutOfRange(u8),
    #[error("unrecognised weekday '{0}'")]
    UnknownWeekday(String),
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum RepeatType {
    #[default]
    None,
    Daily,
    Weekly,
    Weekdays,
    Custom,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum Category {
    Work,
    #[default]
    Personal,
    Leisure,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Default,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    pub fn rank(self) -> i64 {
        match self {
            Priority::Low => 0,
            Priority::Medium => 1,
            Priority::High => 2,
        }
    }

    pub fn from_rank(rank: i64) -> Self {
        match rank {
            i64::MIN..=0 => Priority::Low,
            1 => Priority::Medium,
            _ => Priority::High,
        }
    }
}

bitflags! {
    /// Weekdays a `Custom` repeat fires on. Bit `n - 1` is ISO weekday `n`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct WeekdaySet: u8 {
        const MON = 1 << 0;
        const TUE = 1 << 1;
        const WED = 1 << 2;
        const THU = 1 << 3;
        const FRI = 1 << 4;
        const SAT = 1 << 5;
        const SUN = 1 << 6;
        const WORKWEEK = Self::MON.bits()
            | Self::TUE.bits()
            | Self::WED.bits()
            | Self::THU.bits()
            | Self::FRI.bits();
    }
}

impl WeekdaySet {
    pub fn from_weekday(day: Weekday) -> Self {
        Self::from_bits_truncate(1 << day.num_days_from_monday())
    }

    pub fn from_numbers<I>(numbers: I) -> Result<Self, ModelError>
    where
        I: IntoIterator<Item = u8>,
    {
        let mut set = WeekdaySet::empty();
        for number in numbers {
            if !(1..=7).contains(&number) {
                return Err(ModelError::WeekdayOutOfRange(number));
            }
            set |= Self::from_bits_truncate(1 << (number - 1));
        }
        Ok(set)
    }

    pub fn numbers(self) -> Vec<u8> {
        (1..=7u8)
            .filter(|number| self.bits() & (1 << (number - 1)) != 0)
            .collect()
    }

    pub fn includes(self, day: Weekday) -> bool {
        self.contains(Self::from_weekday(day))
    }

    /// Parses a comma separated list of day names (`mon`, `Tuesday`) or ISO numbers.
    pub fn parse_list(input: &str) -> Result<Self, ModelError> {
        let mut set = WeekdaySet::empty();
        for raw in input.split(',') {
            let token = raw.trim();
            if token.is_empty() {
                continue;
            }
            if let Ok(number) = token.parse::<u8>() {
                set |= Self::from_numbers([number])?;
                continue;
            }
            let day = token
                .parse::<Weekday>()
                .map_err(|_| ModelError::UnknownWeekday(token.to_string()))?;
            set |= Self::from_weekday(day);
        }
        Ok(set)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecklistItem {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub is_completed: bool,
}

impl ChecklistItem {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            text: text.into(),
            is_completed: false,
        }
    }
}

/// A planned task. Instants are epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub date_time: i64,
    /// Minutes.
    pub duration: u32,
    pub repeat_type: RepeatType,
    pub repeat_days: WeekdaySet,
    pub category: Category,
    pub priority: Priority,
    pub is_completed: bool,
    /// Absolute fire times for the current occurrence window, ascending.
    pub reminders: Vec<i64>,
    /// Minutes before each occurrence a reminder fires.
    pub reminder_leads: Vec<u32>,
    pub checklist: Vec<ChecklistItem>,
    pub tags: Vec<String>,
    pub color_hex: Option<String>,
    pub emoji: Option<String>,
    pub is_anchored: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Task {
    pub fn new(title: impl Into<String>, date_time: i64) -> Self {
        Self {
            id: 0,
            title: title.into(),
            description: String::new(),
            date_time,
            duration: 0,
            repeat_type: RepeatType::None,
            repeat_days: WeekdaySet::empty(),
            category: Category::default(),
            priority: Priority::default(),
            is_completed: false,
            reminders: Vec::new(),
            reminder_leads: Vec::new(),
            checklist: Vec::new(),
            tags: Vec::new(),
            color_hex: None,
            emoji: None,
            is_anchored: false,
            created_at: 0,
            updated_at: 0,
        }
    }

    pub fn is_persisted(&self) -> bool {
        self.id != 0
    }

    pub fn is_repeating(&self) -> bool {
        match self.repeat_type {
            RepeatType::None => false,
            RepeatType::Custom => !self.repeat_days.is_empty(),
            _ => true,
        }
    }

    pub fn end_time(&self) -> i64 {
        self.date_time + i64::from(self.duration) * MINUTE_MS
    }

    pub fn is_overdue(&self, now: i64) -> bool {
        !self.is_completed && self.date_time < now
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub id: i64,
    pub title: String,
    pub content: String,
    pub is_checklist: bool,
    pub checklist_items: Vec<ChecklistItem>,
    pub category: Option<Category>,
    pub tags: Vec<String>,
    pub color_hex: Option<String>,
    pub is_pinned: bool,
    pub is_favorite: bool,
    pub created_at: i64,
    pub updated_at: i64,
    /// Search excerpt, only filled by full-text queries.
    #[serde(skip)]
    pub snippet: Option<String>,
}

impl Note {
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: 0,
            title: title.into(),
            content: content.into(),
            is_checklist: false,
            checklist_items: Vec::new(),
            category: None,
            tags: Vec::new(),
            color_hex: None,
            is_pinned: false,
            is_favorite: false,
            created_at: 0,
            updated_at: 0,
            snippet: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum TaskFilter {
    #[default]
    All,
    Personal,
    Work,
    Leisure,
    Deadlines,
}

impl TaskFilter {
    pub fn matches(self, task: &Task, now: i64) -> bool {
        match self {
            TaskFilter::All => true,
            TaskFilter::Personal => task.category == Category::Personal,
            TaskFilter::Work => task.category == Category::Work,
            TaskFilter::Leisure => task.category == Category::Leisure,
            TaskFilter::Deadlines => task.is_overdue(now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn weekday_set_round_trips_iso_numbers() {
        let set = WeekdaySet::from_numbers([1, 3, 7]).expect("valid numbers");
        assert_eq!(set, WeekdaySet::MON | WeekdaySet::WED | WeekdaySet::SUN);
        assert_eq!(set.numbers(), vec![1, 3, 7]);
        assert!(set.includes(Weekday::Sun));
        assert!(!set.includes(Weekday::Tue));
    }

    #[test]
    fn weekday_set_rejects_out_of_range_numbers() {
        assert_matches!(
            WeekdaySet::from_numbers([0]),
            Err(ModelError::WeekdayOutOfRange(0))
        );
        assert_matches!(
            WeekdaySet::parse_list("mon,8"),
            Err(ModelError::WeekdayOutOfRange(8))
        );
        assert_matches!(
            WeekdaySet::parse_list("mon,someday"),
            Err(ModelError::UnknownWeekday(ref day)) if day == "someday"
        );
    }

    #[test]
    fn weekday_set_parses_names_and_numbers() {
        let set = WeekdaySet::parse_list("Mon, wednesday,5").expect("parse");
        assert_eq!(set, WeekdaySet::MON | WeekdaySet::WED | WeekdaySet::FRI);
        assert!(WeekdaySet::WORKWEEK.includes(Weekday::Fri));
        assert!(!WeekdaySet::WORKWEEK.includes(Weekday::Sat));
    }

    #[test]
    fn enums_parse_case_insensitively_and_display_upper() {
        assert_eq!("weekdays".parse::<RepeatType>(), Ok(RepeatType::Weekdays));
        assert_eq!(RepeatType::Weekdays.to_string(), "WEEKDAYS");
        assert_eq!("High".parse::<Priority>(), Ok(Priority::High));
        assert_eq!(Priority::from_rank(Priority::High.rank()), Priority::High);
        assert_eq!("deadlines".parse::<TaskFilter>(), Ok(TaskFilter::Deadlines));
    }

    #[test]
    fn custom_repeat_without_days_is_not_repeating() {
        let mut task = Task::new("Stretch", 0);
        task.repeat_type = RepeatType::Custom;
        assert!(!task.is_repeating());
        task.repeat_days = WeekdaySet::TUE;
        assert!(task.is_repeating());
    }

    #[test]
    fn task_with_custom_days_survives_json() -> anyhow::Result<()> {
        let mut task = Task::new("Piano", 1_000);
        task.repeat_type = RepeatType::Custom;
        task.repeat_days = WeekdaySet::MON | WeekdaySet::THU;
        task.checklist.push(ChecklistItem::new("Scales"));

        let json = serde_json::to_string(&task)?;
        let back: Task = serde_json::from_str(&json)?;
        assert_eq!(back.repeat_days.numbers(), vec![1, 4]);
        assert_eq!(back, task);
        Ok(())
    }

    #[test]
    fn deadline_filter_only_keeps_open_overdue_tasks() {
        let mut task = Task::new("File taxes", 1_000);
        assert!(TaskFilter::Deadlines.matches(&task, 2_000));
        assert!(!TaskFilter::Deadlines.matches(&task, 500));
        task.is_completed = true;
        assert!(!TaskFilter::Deadlines.matches(&task, 2_000));
    }
}
