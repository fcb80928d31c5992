use std::fmt::Write as _;
use std::io::{self, BufRead, Read};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use crossbeam_channel::{never, unbounded, Receiver};

use crate::app::{Planner, Reactor, UserCommand};
use crate::clock::{self, Clock, LocalZone};
use crate::config::{AppConfig, NoteOptions};
use crate::model::{Category, ChecklistItem, Note, Priority, RepeatType, Task, TaskFilter, WeekdaySet};
use crate::reminders::dispatch::{NotificationDispatcher, TerminalNotifier};
use crate::reminders::{AlarmService, ReminderScheduler};
use crate::search::{parse_query, regex_pattern_from_input};
use crate::storage::StorageHandle;

const MAX_TAG_LEN: usize = 64;

#[derive(Args, Debug, Clone)]
pub struct TaskArgs {
    #[command(subcommand)]
    pub command: TaskCommand,
}

#[derive(Subcommand, Debug, Clone)]
pub enum TaskCommand {
    /// Add a task and derive its reminders
    Add(TaskAddArgs),
    /// Change fields of an existing task
    Edit(TaskEditArgs),
    /// Show a day's agenda (today by default), a week, or a filtered list
    List(TaskListArgs),
    /// Print every field of one task
    Show(TaskIdArgs),
    /// Mark a task completed
    Done(TaskDoneArgs),
    /// Delete a task and withdraw its reminders
    Delete(TaskIdArgs),
    /// Copy a task under a new id
    Duplicate(TaskIdArgs),
    /// Move a task to the same time on the next day
    Postpone(TaskIdArgs),
}

/// Fields shared by `add` and `edit`. Unset fields keep their value.
#[derive(Args, Debug, Clone, Default)]
pub struct TaskFields {
    /// Details shown under the reminder
    #[arg(long)]
    pub description: Option<String>,
    /// Length in minutes
    #[arg(long)]
    pub duration: Option<u32>,
    /// none, daily, weekly, weekdays or custom
    #[arg(long)]
    pub repeat: Option<RepeatType>,
    /// Days for custom repeats: mon,wed,fri or 1,3,5
    #[arg(long, value_parser = WeekdaySet::parse_list)]
    pub days: Option<WeekdaySet>,
    /// work, personal or leisure
    #[arg(long)]
    pub category: Option<Category>,
    /// low, medium or high
    #[arg(long)]
    pub priority: Option<Priority>,
    /// Minutes before each occurrence to remind (repeatable)
    #[arg(long = "remind")]
    pub remind: Vec<u32>,
    /// Drop every reminder
    #[arg(long, conflicts_with = "remind")]
    pub no_remind: bool,
    /// Tag to attach (repeatable)
    #[arg(long = "tag")]
    pub tags: Vec<String>,
    /// Checklist entry to append (repeatable)
    #[arg(long = "item")]
    pub items: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct TaskAddArgs {
    /// Task title
    pub title: String,
    /// Local start, `YYYY-MM-DD HH:MM`
    #[arg(long)]
    pub at: String,
    #[command(flatten)]
    pub fields: TaskFields,
}

#[derive(Args, Debug, Clone)]
pub struct TaskEditArgs {
    /// Task identifier
    pub task_id: i64,
    /// New title
    #[arg(long)]
    pub title: Option<String>,
    /// New local start, `YYYY-MM-DD HH:MM`
    #[arg(long)]
    pub at: Option<String>,
    #[command(flatten)]
    pub fields: TaskFields,
}

#[derive(Args, Debug, Clone, Default)]
pub struct TaskListArgs {
    /// Day to show: today, tomorrow or YYYY-MM-DD
    #[arg(long)]
    pub day: Option<String>,
    /// Show the whole week containing the day
    #[arg(long)]
    pub week: bool,
    /// all, personal, work, leisure or deadlines
    #[arg(long, conflicts_with_all = ["day", "week"])]
    pub filter: Option<TaskFilter>,
}

#[derive(Args, Debug, Clone)]
pub struct TaskIdArgs {
    /// Task identifier
    pub task_id: i64,
}

#[derive(Args, Debug, Clone)]
pub struct TaskDoneArgs {
    /// Task identifier
    pub task_id: i64,
    /// Reopen instead of completing
    #[arg(long)]
    pub undo: bool,
}

#[derive(Args, Debug, Clone)]
pub struct NoteArgs {
    #[command(subcommand)]
    pub command: NoteCommand,
}

#[derive(Subcommand, Debug, Clone)]
pub enum NoteCommand {
    /// Create a note; the body is read from stdin when --body is omitted
    New(NoteNewArgs),
    /// List notes, pinned first
    List(NoteListArgs),
    /// Run a search and print matching notes
    Search(SearchArgs),
    /// Pin a note (or unpin with --off)
    Pin(NoteFlagArgs),
    /// Mark a note as favorite (or clear with --off)
    Favorite(NoteFlagArgs),
    /// Delete a note
    Delete(NoteIdArgs),
    /// Manage note tags
    Tag(TagArgs),
}

#[derive(Args, Debug, Clone)]
pub struct NoteNewArgs {
    /// Title for the note (prompted if omitted)
    #[arg()]
    pub title: Option<String>,
    /// Provide the note body inline. If omitted, reads from stdin.
    #[arg(long)]
    pub body: Option<String>,
    /// Pin the new note
    #[arg(long)]
    pub pin: bool,
    /// Mark the new note as favorite
    #[arg(long)]
    pub favorite: bool,
    /// work, personal or leisure
    #[arg(long)]
    pub category: Option<Category>,
    /// Tag to attach (repeatable)
    #[arg(long = "tag")]
    pub tags: Vec<String>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct NoteListArgs {
    /// Only pinned notes
    #[arg(long, conflicts_with_all = ["favorites", "category"])]
    pub pinned: bool,
    /// Only favorite notes
    #[arg(long, conflicts_with = "category")]
    pub favorites: bool,
    /// Only notes in this category
    #[arg(long)]
    pub category: Option<Category>,
}

#[derive(Args, Debug, Clone)]
pub struct SearchArgs {
    /// Search query terms (supports tag:, title:, created:/updated: ranges)
    #[arg()]
    pub query: Vec<String>,
    /// Treat the free text as a regular expression
    #[arg(long)]
    pub regex: bool,
    /// Limit the number of results printed
    #[arg(long)]
    pub limit: Option<usize>,
}

#[derive(Args, Debug, Clone)]
pub struct NoteFlagArgs {
    /// Note identifier
    pub note_id: i64,
    /// Clear the flag instead of setting it
    #[arg(long)]
    pub off: bool,
}

#[derive(Args, Debug, Clone)]
pub struct NoteIdArgs {
    /// Note identifier
    pub note_id: i64,
}

#[derive(Subcommand, Debug, Clone)]
pub enum TagCommand {
    /// Attach a tag to a note
    Add(TagAddArgs),
    /// Remove a tag from a note
    Remove(TagRemoveArgs),
    /// List tags of one note, or every tag when no note is given
    List(TagListArgs),
}

#[derive(Args, Debug, Clone)]
pub struct TagAddArgs {
    /// Note identifier
    pub note_id: i64,
    /// Tag to add (whitespace trimmed)
    pub tag: String,
}

#[derive(Args, Debug, Clone)]
pub struct TagRemoveArgs {
    /// Note identifier
    pub note_id: i64,
    /// Tag to remove
    pub tag: String,
}

#[derive(Args, Debug, Clone)]
pub struct TagListArgs {
    /// Note identifier
    pub note_id: Option<i64>,
}

#[derive(Args, Debug, Clone)]
pub struct TagArgs {
    #[command(subcommand)]
    pub command: TagCommand,
}

#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Seconds between reminder window refreshes (overrides the config)
    #[arg(long)]
    pub refresh_secs: Option<u64>,
}

pub fn handle_task_command(planner: &Planner, config: &AppConfig, args: TaskArgs) -> Result<()> {
    let output = match args.command {
        TaskCommand::Add(args) => add_task(planner, &config.reminders.default_leads, args)?,
        TaskCommand::Edit(args) => edit_task(planner, args)?,
        TaskCommand::List(args) => list_tasks(planner, &args)?,
        TaskCommand::Show(args) => show_task(planner, args.task_id)?,
        TaskCommand::Done(args) => complete_task(planner, args)?,
        TaskCommand::Delete(args) => {
            if !planner.delete_task(args.task_id)? {
                bail!("task #{} not found", args.task_id);
            }
            format!("Deleted task #{}\n", args.task_id)
        }
        TaskCommand::Duplicate(args) => match planner.duplicate_task(args.task_id)? {
            Some(copy) => format!("Created task #{} ({})\n", copy.id, copy.title),
            None => bail!("task #{} not found", args.task_id),
        },
        TaskCommand::Postpone(args) => match planner.move_to_next_day(args.task_id)? {
            Some(task) => format!(
                "Moved task #{} to {}\n",
                task.id,
                clock::format_date_time(planner.zone(), task.date_time)
            ),
            None => bail!("task #{} not found", args.task_id),
        },
    };
    print!("{output}");
    Ok(())
}

fn add_task(planner: &Planner, default_leads: &[u32], args: TaskAddArgs) -> Result<String> {
    let title = args.title.trim();
    if title.is_empty() {
        bail!("task title cannot be empty");
    }
    let at = clock::parse_local(planner.zone(), &args.at)?;
    let mut task = Task::new(title, at);
    task.reminder_leads = default_leads.to_vec();
    apply_fields(&mut task, args.fields)?;

    let saved = planner.add_task(task).context("adding task")?;
    let mut out = format!(
        "Created task #{} at {}",
        saved.id,
        clock::format_date_time(planner.zone(), saved.date_time)
    );
    match saved.reminders.first() {
        Some(next) => {
            let _ = writeln!(
                &mut out,
                " (next reminder {})",
                clock::format_date_time(planner.zone(), *next)
            );
        }
        None => out.push('\n'),
    }
    Ok(out)
}

fn edit_task(planner: &Planner, args: TaskEditArgs) -> Result<String> {
    let Some(mut task) = planner.task(args.task_id)? else {
        bail!("task #{} not found", args.task_id);
    };
    if let Some(title) = args.title {
        let title = title.trim();
        if title.is_empty() {
            bail!("task title cannot be empty");
        }
        task.title = title.to_string();
    }
    if let Some(at) = args.at {
        task.date_time = clock::parse_local(planner.zone(), &at)?;
    }
    apply_fields(&mut task, args.fields)?;
    let saved = planner
        .update_task(task)
        .with_context(|| format!("updating task {}", args.task_id))?;
    Ok(format!(
        "Updated task #{} ({} reminder{})\n",
        saved.id,
        saved.reminders.len(),
        if saved.reminders.len() == 1 { "" } else { "s" }
    ))
}

fn apply_fields(task: &mut Task, fields: TaskFields) -> Result<()> {
    if let Some(description) = fields.description {
        task.description = description;
    }
    if let Some(duration) = fields.duration {
        task.duration = duration;
    }
    if let Some(days) = fields.days {
        task.repeat_days = days;
        if fields.repeat.is_none() {
            task.repeat_type = RepeatType::Custom;
        }
    }
    if let Some(repeat) = fields.repeat {
        task.repeat_type = repeat;
    }
    if task.repeat_type == RepeatType::Custom && task.repeat_days.is_empty() {
        bail!("custom repeats need --days");
    }
    if let Some(category) = fields.category {
        task.category = category;
    }
    if let Some(priority) = fields.priority {
        task.priority = priority;
    }
    if fields.no_remind {
        task.reminder_leads.clear();
    } else if !fields.remind.is_empty() {
        let mut leads = fields.remind;
        leads.sort_unstable_by(|a, b| b.cmp(a));
        leads.dedup();
        task.reminder_leads = leads;
    }
    for tag in fields.tags {
        let tag = normalize_tag(&tag)?;
        if !task.tags.iter().any(|existing| existing.eq_ignore_ascii_case(&tag)) {
            task.tags.push(tag);
        }
    }
    task.checklist
        .extend(fields.items.into_iter().map(ChecklistItem::new));
    Ok(())
}

fn list_tasks(planner: &Planner, args: &TaskListArgs) -> Result<String> {
    let zone = planner.zone();
    let now = planner.clock().now_ms();
    if let Some(filter) = args.filter {
        let tasks = planner.filtered_tasks(filter)?;
        let mut out = String::new();
        let _ = writeln!(&mut out, "{} ({})", filter_label(filter), tasks.len());
        if tasks.is_empty() {
            out.push_str("  nothing here\n");
        }
        for task in &tasks {
            let _ = writeln!(&mut out, "  {}", format_task_line(zone, task, now, true));
        }
        return Ok(out);
    }

    let day = match args.day.as_deref() {
        Some(input) => resolve_day(zone, now, input)?,
        None => now,
    };
    if args.week {
        let week = planner.tasks_for_week(day)?;
        let mut out = String::new();
        for (start, tasks) in &week {
            out.push_str(&format_day(zone, *start, tasks, now));
        }
        return Ok(out);
    }
    let tasks = planner.tasks_for_day(day)?;
    Ok(format_day(zone, day, &tasks, now))
}

fn show_task(planner: &Planner, task_id: i64) -> Result<String> {
    let Some(task) = planner.task(task_id)? else {
        bail!("task #{task_id} not found");
    };
    let zone = planner.zone();
    let mut out = String::new();
    let _ = writeln!(&mut out, "#{}  {}", task.id, task.title);
    let _ = writeln!(
        &mut out,
        "    when      {} ({} min)",
        clock::format_date_time(zone, task.date_time),
        task.duration
    );
    let _ = writeln!(&mut out, "    repeat    {}", format_repeat(&task));
    let _ = writeln!(&mut out, "    category  {}", task.category);
    let _ = writeln!(&mut out, "    priority  {}", task.priority);
    let _ = writeln!(
        &mut out,
        "    status    {}",
        if task.is_completed { "done" } else { "open" }
    );
    if task.reminders.is_empty() {
        let _ = writeln!(&mut out, "    reminders none");
    } else {
        let _ = writeln!(
            &mut out,
            "    reminders {}",
            task.reminders
                .iter()
                .map(|ms| clock::format_date_time(zone, *ms))
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
    if !task.tags.is_empty() {
        let _ = writeln!(&mut out, "    tags      {}", format_tags(&task.tags));
    }
    for item in &task.checklist {
        let mark = if item.is_completed { 'x' } else { ' ' };
        let _ = writeln!(&mut out, "    [{mark}] {}", item.text);
    }
    if !task.description.is_empty() {
        let _ = writeln!(&mut out, "    {}", task.description.replace('\n', "\n    "));
    }
    Ok(out)
}

fn complete_task(planner: &Planner, args: TaskDoneArgs) -> Result<String> {
    let completed = !args.undo;
    match planner.set_completed(args.task_id, completed)? {
        Some(task) if completed => Ok(format!("Completed task #{} ({})\n", task.id, task.title)),
        Some(task) => Ok(format!("Reopened task #{} ({})\n", task.id, task.title)),
        None => bail!("task #{} not found", args.task_id),
    }
}

fn resolve_day(zone: &LocalZone, now: i64, input: &str) -> Result<i64> {
    match input.trim().to_ascii_lowercase().as_str() {
        "today" => Ok(now),
        "tomorrow" => Ok(clock::add_days(zone, now, 1)),
        "yesterday" => Ok(clock::add_days(zone, now, -1)),
        _ => clock::parse_local(zone, input),
    }
}

fn format_day(zone: &LocalZone, day: i64, tasks: &[Task], now: i64) -> String {
    let mut out = String::new();
    let _ = writeln!(
        &mut out,
        "{} {}",
        clock::day_of_week_name(zone, day),
        clock::format_date(zone, day)
    );
    if tasks.is_empty() {
        out.push_str("  no tasks\n");
    }
    for task in tasks {
        let _ = writeln!(&mut out, "  {}", format_task_line(zone, task, now, false));
    }
    out
}

fn format_task_line(zone: &LocalZone, task: &Task, now: i64, with_date: bool) -> String {
    let when = if with_date {
        clock::format_date_time(zone, task.date_time)
    } else {
        clock::format_time(zone, task.date_time)
    };
    let mut line = format!("#{}  {when}  {}", task.id, task.title);
    let _ = write!(&mut line, "  [{}]", task.category);
    if task.priority != Priority::Medium {
        let _ = write!(&mut line, "  [{}]", task.priority);
    }
    if task.is_repeating() {
        let _ = write!(&mut line, "  repeats {}", format_repeat(task));
    }
    if task.is_completed {
        line.push_str("  [DONE]");
    } else if task.is_overdue(now) {
        line.push_str("  [OVERDUE]");
    }
    line
}

fn format_repeat(task: &Task) -> String {
    match task.repeat_type {
        RepeatType::Custom => {
            let days: Vec<String> = task
                .repeat_days
                .numbers()
                .iter()
                .map(|number| number.to_string())
                .collect();
            format!("on days {}", days.join(","))
        }
        other => other.to_string().to_ascii_lowercase(),
    }
}

fn filter_label(filter: TaskFilter) -> &'static str {
    match filter {
        TaskFilter::All => "All tasks",
        TaskFilter::Personal => "Personal",
        TaskFilter::Work => "Work",
        TaskFilter::Leisure => "Leisure",
        TaskFilter::Deadlines => "Missed deadlines",
    }
}

pub fn handle_note_command(config: &AppConfig, storage: &StorageHandle, args: NoteArgs) -> Result<()> {
    let zone = config.calendar.zone()?;
    match args.command {
        NoteCommand::New(args) => new_note(storage, args),
        NoteCommand::List(args) => {
            print!("{}", list_notes(storage, &zone, &args)?);
            Ok(())
        }
        NoteCommand::Search(args) => {
            print!("{}", run_search(storage, &zone, &config.notes, &args)?);
            Ok(())
        }
        NoteCommand::Pin(args) => {
            storage
                .set_note_pinned(args.note_id, !args.off)
                .with_context(|| format!("updating note {}", args.note_id))?;
            println!(
                "{} note #{}",
                if args.off { "Unpinned" } else { "Pinned" },
                args.note_id
            );
            Ok(())
        }
        NoteCommand::Favorite(args) => {
            storage
                .set_note_favorite(args.note_id, !args.off)
                .with_context(|| format!("updating note {}", args.note_id))?;
            println!(
                "{} note #{}",
                if args.off { "Unfavorited" } else { "Favorited" },
                args.note_id
            );
            Ok(())
        }
        NoteCommand::Delete(args) => {
            if !storage.delete_note(args.note_id)? {
                bail!("note #{} not found", args.note_id);
            }
            println!("Deleted note #{}", args.note_id);
            Ok(())
        }
        NoteCommand::Tag(args) => handle_tag_command(storage, args),
    }
}

fn new_note(storage: &StorageHandle, args: NoteNewArgs) -> Result<()> {
    let mut title = match args.title {
        Some(t) => t,
        None => prompt("Title")?,
    };
    title = title.trim().to_owned();
    if title.is_empty() {
        bail!("note title cannot be empty");
    }
    let body = if let Some(body) = args.body {
        body
    } else {
        read_stdin()?.unwrap_or_default()
    };

    let mut note = Note::new(title, body);
    note.is_pinned = args.pin;
    note.is_favorite = args.favorite;
    note.category = args.category;
    for tag in &args.tags {
        note.tags.push(normalize_tag(tag)?);
    }
    let note_id = storage.insert_note(&note).context("creating note")?;
    println!(
        "Created note #{note_id}{}",
        if args.pin { " (pinned)" } else { "" }
    );
    Ok(())
}

fn list_notes(storage: &StorageHandle, zone: &LocalZone, args: &NoteListArgs) -> Result<String> {
    let notes = if args.pinned {
        storage.fetch_pinned_notes()?
    } else if args.favorites {
        storage.fetch_favorite_notes()?
    } else if let Some(category) = args.category {
        storage.fetch_notes_by_category(category)?
    } else {
        storage.fetch_all_notes()?
    };
    if notes.is_empty() {
        return Ok("No notes.\n".to_string());
    }
    Ok(format_notes(zone, &notes))
}

fn run_search(
    storage: &StorageHandle,
    zone: &LocalZone,
    options: &NoteOptions,
    args: &SearchArgs,
) -> Result<String> {
    let raw_query = args.query.join(" ");
    let trimmed = raw_query.trim();
    if trimmed.is_empty() {
        bail!("search query cannot be empty");
    }

    let use_regex = args.regex || options.regex_default;
    let mut query = parse_query(zone, trimmed);
    if use_regex {
        query.regex_pattern = regex_pattern_from_input(trimmed);
    }
    if query.is_empty() {
        bail!("search query must contain terms or filters");
    }

    let mut storage_query = query.clone();
    if use_regex && storage_query.regex_pattern.is_some() {
        storage_query.terms.clear();
        storage_query.title_terms.clear();
    }

    let limit = args.limit.unwrap_or(options.max_results);
    let results = storage
        .search_notes(&storage_query, limit)
        .context("executing search")?;
    if results.is_empty() {
        return Ok("No matches found.\n".to_string());
    }
    Ok(format_notes(zone, &results))
}

fn format_notes(zone: &LocalZone, notes: &[Note]) -> String {
    let mut out = String::new();
    for note in notes {
        let mut headline = format!("#{}  {}", note.id, note.title);
        if note.is_pinned {
            headline.push_str("  [PINNED]");
        }
        if note.is_favorite {
            headline.push_str("  [FAVORITE]");
        }
        if let Some(category) = note.category {
            let _ = write!(&mut headline, "  [{category}]");
        }
        let _ = writeln!(&mut out, "{headline}");
        let _ = writeln!(
            &mut out,
            "    updated {}",
            clock::format_date_time(zone, note.updated_at)
        );
        if !note.tags.is_empty() {
            let _ = writeln!(&mut out, "    tags    {}", format_tags(&note.tags));
        }
        if let Some(snippet) = build_snippet(note, 2) {
            let _ = writeln!(&mut out, "    {snippet}");
        }
        out.push('\n');
    }
    out
}

fn handle_tag_command(storage: &StorageHandle, args: TagArgs) -> Result<()> {
    match args.command {
        TagCommand::Add(args) => tag_add(storage, args),
        TagCommand::Remove(args) => tag_remove(storage, args),
        TagCommand::List(args) => {
            print!("{}", tag_list(storage, args)?);
            Ok(())
        }
    }
}

fn tag_add(storage: &StorageHandle, args: TagAddArgs) -> Result<()> {
    let note_id = args.note_id;
    let tag = normalize_tag(&args.tag)?;
    let title = note_title(storage, note_id)?;
    storage
        .add_tag_to_note(note_id, &tag)
        .with_context(|| format!("adding tag '{tag}' to note {note_id}"))?;
    println!("Added tag '{tag}' to note #{note_id} ({title})");
    Ok(())
}

fn tag_remove(storage: &StorageHandle, args: TagRemoveArgs) -> Result<()> {
    let note_id = args.note_id;
    let tag = args.tag.trim();
    if tag.is_empty() {
        bail!("tag cannot be empty");
    }
    let title = note_title(storage, note_id)?;
    storage
        .remove_tag_from_note(note_id, tag)
        .with_context(|| format!("removing tag '{tag}' from note {note_id}"))?;
    println!("Removed tag '{tag}' from note #{note_id} ({title})");
    Ok(())
}

fn tag_list(storage: &StorageHandle, args: TagListArgs) -> Result<String> {
    let mut out = String::new();
    let tags = match args.note_id {
        Some(note_id) => {
            let Some(note) = storage.fetch_note(note_id)? else {
                bail!("note #{note_id} not found");
            };
            let _ = writeln!(&mut out, "Tags for note #{} ({})", note.id, note.title);
            note.tags
        }
        None => storage.list_all_tags()?,
    };
    if tags.is_empty() {
        out.push_str("(no tags)\n");
    }
    for tag in tags {
        let _ = writeln!(&mut out, "- {tag}");
    }
    Ok(out)
}

fn note_title(storage: &StorageHandle, note_id: i64) -> Result<String> {
    match storage.fetch_note(note_id).context("checking note existence")? {
        Some(note) if note.title.is_empty() => Ok("<untitled>".into()),
        Some(note) => Ok(note.title),
        None => bail!("note #{note_id} not found"),
    }
}

fn normalize_tag(raw: &str) -> Result<String> {
    let mut tag = raw.trim().to_string();
    if tag.is_empty() {
        bail!("tag cannot be empty");
    }
    if tag.len() > MAX_TAG_LEN {
        let mut cut = MAX_TAG_LEN;
        while !tag.is_char_boundary(cut) {
            cut -= 1;
        }
        tag.truncate(cut);
    }
    Ok(tag)
}

/// Delivers reminders until stdin closes or the user types `quit`.
pub fn run_reminders(
    config: &AppConfig,
    storage: StorageHandle,
    clock: Arc<dyn Clock>,
    args: RunArgs,
) -> Result<()> {
    let zone = config.calendar.zone()?;
    let (alarms, fired) = AlarmService::start(clock.clone())?;
    let scheduler = Arc::new(ReminderScheduler::new(Arc::new(alarms), clock.clone()));
    let planner = Planner::new(storage, clock.clone(), config)?.with_scheduler(scheduler);
    let dispatcher = NotificationDispatcher::new(
        Box::new(TerminalNotifier::new(io::stdout(), zone)),
        config.reminders.snooze_minutes.clone(),
    );
    let refresh = args
        .refresh_secs
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.reminders.refresh_interval());

    let commands = spawn_command_reader()?;
    let mut reactor = Reactor::new(planner, dispatcher, fired, commands, refresh)?;
    let report = reactor.start()?;

    let now = clock.now_ms();
    print!("{}", format_day(&zone, now, reactor.today_agenda(), now));
    println!(
        "{} reminder{} pending. Type 'quit' or close stdin to stop.",
        report.registered,
        if report.registered == 1 { "" } else { "s" }
    );
    if report.failed > 0 {
        println!("{} reminder(s) could not be registered, see the log.", report.failed);
    }
    reactor.run(never())
}

fn spawn_command_reader() -> Result<Receiver<UserCommand>> {
    let (tx, rx) = unbounded();
    thread::Builder::new()
        .name("command-input".into())
        .spawn(move || {
            let stdin = io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else {
                    break;
                };
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match trimmed.parse::<UserCommand>() {
                    Ok(command) => {
                        if tx.send(command).is_err() {
                            break;
                        }
                    }
                    Err(err) => eprintln!("{err}"),
                }
            }
        })
        .context("spawning command reader")?;
    Ok(rx)
}

fn prompt(label: &str) -> Result<String> {
    use std::io::Write;
    let mut stdout = io::stdout();
    write!(stdout, "{}: ", label)?;
    stdout.flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim_end().to_owned())
}

fn read_stdin() -> Result<Option<String>> {
    if atty::is(atty::Stream::Stdin) {
        return Ok(None);
    }
    let mut buf = String::new();
    io::stdin().read_to_string(&mut buf)?;
    Ok(Some(buf))
}

fn build_snippet(note: &Note, fallback_lines: usize) -> Option<String> {
    if let Some(snippet) = note.snippet.as_ref() {
        let cleaned = snippet.replace('\n', " ").trim().to_string();
        if !cleaned.is_empty() {
            return Some(cleaned);
        }
    }
    if fallback_lines == 0 {
        return None;
    }
    let segments: Vec<&str> = note
        .content
        .lines()
        .take(fallback_lines)
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    if segments.is_empty() {
        None
    } else {
        Some(segments.join(" ").chars().take(160).collect())
    }
}

fn format_tags(tags: &[String]) -> String {
    tags.iter()
        .map(|tag| format!("#{}", tag))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::tests::utc_config;
    use crate::clock::tests::local_ms;
    use crate::clock::ManualClock;
    use crate::storage::tests::init_storage;
    use tempfile::TempDir;

    type TestResult<T = ()> = Result<T>;

    fn utc() -> LocalZone {
        LocalZone::parse("utc").expect("zone")
    }

    fn setup_planner() -> TestResult<(TempDir, Planner)> {
        let (temp, storage) = init_storage()?;
        let now = local_ms(&utc(), 2026, 10, 16, 8, 0);
        let planner = Planner::new(storage, Arc::new(ManualClock::new(now)), &utc_config())?;
        Ok((temp, planner))
    }

    fn add_args(title: &str, at: &str) -> TaskAddArgs {
        TaskAddArgs {
            title: title.into(),
            at: at.into(),
            fields: TaskFields::default(),
        }
    }

    fn search_args(query: &[&str], regex: bool) -> SearchArgs {
        SearchArgs {
            query: query.iter().map(|part| part.to_string()).collect(),
            regex,
            limit: Some(10),
        }
    }

    #[test]
    fn cli_add_uses_default_leads_and_reports_next_reminder() -> TestResult {
        let (_temp, planner) = setup_planner()?;
        let output = add_task(&planner, &[15], add_args("Dentist", "2026-10-16 10:00"))?;
        assert!(output.starts_with("Created task #"), "{output}");
        assert!(output.contains("next reminder Oct 16, 2026 09:45"), "{output}");

        let tasks = planner.tasks_for_day(local_ms(&utc(), 2026, 10, 16, 0, 0))?;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].reminder_leads, vec![15]);
        Ok(())
    }

    #[test]
    fn cli_days_imply_custom_repeat() -> TestResult {
        let (_temp, planner) = setup_planner()?;
        let mut args = add_args("Swim", "2026-10-16 07:00");
        args.fields.days = Some(WeekdaySet::parse_list("mon,wed")?);
        args.fields.category = Some(Category::Leisure);
        add_task(&planner, &[0], args)?;

        let task = planner.filtered_tasks(TaskFilter::Leisure)?.remove(0);
        assert_eq!(task.repeat_type, RepeatType::Custom);
        assert_eq!(task.repeat_days.numbers(), vec![1, 3]);
        assert_eq!(task.reminders[0], local_ms(&utc(), 2026, 10, 19, 7, 0));
        Ok(())
    }

    #[test]
    fn cli_custom_repeat_without_days_is_rejected() -> TestResult {
        let (_temp, planner) = setup_planner()?;
        let mut args = add_args("Broken", "2026-10-16 07:00");
        args.fields.repeat = Some(RepeatType::Custom);
        assert!(add_task(&planner, &[0], args).is_err());
        assert!(planner.filtered_tasks(TaskFilter::All)?.is_empty());
        Ok(())
    }

    #[test]
    fn cli_edit_replaces_leads_and_title() -> TestResult {
        let (_temp, planner) = setup_planner()?;
        add_task(&planner, &[0], add_args("Call", "2026-10-16 12:00"))?;
        let id = planner.filtered_tasks(TaskFilter::All)?[0].id;

        let output = edit_task(
            &planner,
            TaskEditArgs {
                task_id: id,
                title: Some("Call bank".into()),
                at: None,
                fields: TaskFields {
                    remind: vec![5, 30, 5],
                    ..TaskFields::default()
                },
            },
        )?;
        assert_eq!(output, format!("Updated task #{id} (2 reminders)\n"));
        let task = planner.task(id)?.expect("task");
        assert_eq!(task.title, "Call bank");
        assert_eq!(task.reminder_leads, vec![30, 5]);
        Ok(())
    }

    #[test]
    fn cli_day_and_week_views() -> TestResult {
        let (_temp, planner) = setup_planner()?;
        add_task(&planner, &[0], add_args("Standup", "2026-10-16 09:30"))?;
        add_task(&planner, &[0], add_args("Retro", "2026-10-14 16:00"))?;

        let today = list_tasks(&planner, &TaskListArgs::default())?;
        assert!(today.starts_with("Friday Oct 16, 2026"), "{today}");
        assert!(today.contains("09:30  Standup  [PERSONAL]"), "{today}");
        assert!(!today.contains("Retro"));

        let week = list_tasks(
            &planner,
            &TaskListArgs {
                week: true,
                ..TaskListArgs::default()
            },
        )?;
        assert!(week.starts_with("Monday Oct 12, 2026"), "{week}");
        assert_eq!(week.matches("no tasks").count(), 5);
        assert!(week.contains("Retro  [PERSONAL]  [OVERDUE]"), "{week}");
        Ok(())
    }

    #[test]
    fn cli_done_and_show() -> TestResult {
        let (_temp, planner) = setup_planner()?;
        let mut args = add_args("Taxes", "2026-10-20 18:00");
        args.fields.priority = Some(Priority::High);
        args.fields.items = vec!["Receipts".into()];
        add_task(&planner, &[60], args)?;
        let id = planner.filtered_tasks(TaskFilter::All)?[0].id;

        let shown = show_task(&planner, id)?;
        assert!(shown.contains("priority  HIGH"), "{shown}");
        assert!(shown.contains("reminders Oct 20, 2026 17:00"), "{shown}");
        assert!(shown.contains("[ ] Receipts"), "{shown}");

        let done = complete_task(&planner, TaskDoneArgs { task_id: id, undo: false })?;
        assert!(done.starts_with("Completed task"));
        assert!(show_task(&planner, id)?.contains("reminders none"));
        assert!(complete_task(&planner, TaskDoneArgs { task_id: 999, undo: false }).is_err());
        Ok(())
    }

    #[test]
    fn cli_search_filters_tags_and_marks_pinned() -> TestResult {
        let (_temp, planner) = setup_planner()?;
        let storage = planner.storage();
        let mut project = Note::new("Project Plan", "Timeline overview");
        project.is_pinned = true;
        project.tags = vec!["project".into()];
        storage.insert_note(&project)?;
        let mut misc = Note::new("Misc Note", "Just chatter");
        misc.tags = vec!["misc".into()];
        storage.insert_note(&misc)?;

        let output = run_search(
            storage,
            &utc(),
            &NoteOptions::default(),
            &search_args(&["tag:project"], false),
        )?;
        assert!(output.contains("Project Plan"));
        assert!(output.contains("[PINNED]"));
        assert!(!output.contains("Misc Note"));
        Ok(())
    }

    #[test]
    fn cli_search_supports_regex_filtering() -> TestResult {
        let (_temp, planner) = setup_planner()?;
        let storage = planner.storage();
        let mut hit = Note::new("Regex Note", "alpha foo123bar omega");
        hit.tags = vec!["regex".into()];
        storage.insert_note(&hit)?;
        let mut miss = Note::new("Regex Miss", "alpha foozzz omega");
        miss.tags = vec!["regex".into()];
        storage.insert_note(&miss)?;

        let output = run_search(
            storage,
            &utc(),
            &NoteOptions::default(),
            &search_args(&["tag:regex", "foo[0-9]+bar"], true),
        )?;
        assert!(output.contains("Regex Note"));
        assert!(!output.contains("Regex Miss"));
        Ok(())
    }

    #[test]
    fn cli_note_lists_and_tags() -> TestResult {
        let (_temp, planner) = setup_planner()?;
        let storage = planner.storage();
        let mut pinned = Note::new("Groceries", "milk\neggs");
        pinned.is_pinned = true;
        let pinned_id = storage.insert_note(&pinned)?;
        storage.insert_note(&Note::new("Ideas", ""))?;

        let listed = list_notes(
            storage,
            &utc(),
            &NoteListArgs {
                pinned: true,
                ..NoteListArgs::default()
            },
        )?;
        assert!(listed.contains("Groceries  [PINNED]"), "{listed}");
        assert!(listed.contains("    milk eggs"), "{listed}");
        assert!(!listed.contains("Ideas"));

        tag_add(
            storage,
            TagAddArgs {
                note_id: pinned_id,
                tag: "  shopping ".into(),
            },
        )?;
        let tags = tag_list(storage, TagListArgs { note_id: Some(pinned_id) })?;
        assert!(tags.contains("- shopping"), "{tags}");
        assert!(tag_list(storage, TagListArgs { note_id: None })?.contains("- shopping"));

        tag_remove(
            storage,
            TagRemoveArgs {
                note_id: pinned_id,
                tag: "shopping".into(),
            },
        )?;
        assert!(tag_list(storage, TagListArgs { note_id: Some(pinned_id) })?.contains("(no tags)"));
        assert!(tag_add(
            storage,
            TagAddArgs {
                note_id: 9_999,
                tag: "x".into()
            }
        )
        .is_err());
        Ok(())
    }

    #[test]
    fn tags_are_trimmed_and_capped() -> TestResult {
        assert_eq!(normalize_tag("  work ")?, "work");
        assert_eq!(normalize_tag(&"é".repeat(40))?.len(), 64);
        assert!(normalize_tag("   ").is_err());
        Ok(())
    }
}
