//! Operator console.
//!
//! Each stdin line is one command. Conflicts are never resolved implicitly:
//! a booking that overlaps queued sessions is declined and the conflicts are
//! listed, unless the operator passed `--replace`.

use std::io::{self, Write};

use anyhow::Result;
use bay_core::{
    BookingOutcome, BookingRequest, ConfirmConflicts, Session, SessionEdit, SessionId, Station,
    StationBank, StationView,
};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};

use crate::util::{parse_duration, parse_time_on, split_words};

#[derive(Debug, Parser)]
#[command(name = "console", no_binary_name = true, disable_version_flag = true)]
struct ConsoleLine {
    #[command(subcommand)]
    command: ConsoleCommand,
}

/// Console commands.
#[derive(Debug, Subcommand)]
pub enum ConsoleCommand {
    /// Show every bound station.
    Status,

    /// Activate a station.
    On { slot: usize },

    /// Deactivate a station, archiving the running session.
    Off { slot: usize },

    /// Book a session.
    Book {
        slot: usize,
        name: String,

        /// Start time (HH:MM or YYYY-MM-DD HH:MM). Defaults to now.
        #[arg(long, conflicts_with = "append")]
        start: Option<String>,

        /// Start when the last queued session ends.
        #[arg(long)]
        append: bool,

        /// Length, e.g. 1h30m, 90m or 1:30.
        #[arg(long, default_value = "1h")]
        duration: String,

        /// Remove conflicting sessions instead of declining.
        #[arg(long)]
        replace: bool,
    },

    /// Change a queued session.
    Edit {
        slot: usize,
        id: u64,

        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        start: Option<String>,

        /// New end time; the duration follows.
        #[arg(long, conflicts_with = "duration")]
        end: Option<String>,

        #[arg(long)]
        duration: Option<String>,

        /// Remove conflicting sessions instead of declining.
        #[arg(long)]
        replace: bool,
    },

    /// Delete queued sessions.
    Delete {
        slot: usize,
        #[arg(required = true)]
        ids: Vec<u64>,
    },

    /// Show archive statistics of a station.
    Stats { slot: usize },

    /// Propose a start time for the next booking.
    Suggest { slot: usize },

    /// Rediscover devices now.
    Refresh,

    /// Turn everything off, save and exit.
    #[command(alias = "exit")]
    Quit,
}

/// What the runtime should do after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Continue,
    Discover,
    Quit,
}

/// Records the conflicts offered for confirmation and answers with the
/// operator's `--replace` flag.
#[derive(Debug)]
struct ConflictPrompt {
    replace: bool,
    conflicts: Vec<Session>,
}

impl ConflictPrompt {
    const fn new(replace: bool) -> Self {
        Self {
            replace,
            conflicts: Vec::new(),
        }
    }
}

impl ConfirmConflicts for ConflictPrompt {
    fn confirm(&mut self, _candidate: &Session, conflicts: &[Session]) -> bool {
        self.conflicts = conflicts.to_vec();
        self.replace
    }
}

/// Parses and executes one console line.
///
/// Parse and command errors are written to `out`. Only failures to write are
/// returned.
pub fn handle_line<W: Write>(bank: &mut StationBank, line: &str, out: &mut W) -> io::Result<Action> {
    let words = match split_words(line) {
        Ok(words) => words,
        Err(err) => {
            writeln!(out, "error: {err}")?;
            return Ok(Action::Continue);
        }
    };
    if words.is_empty() {
        return Ok(Action::Continue);
    }
    let command = match ConsoleLine::try_parse_from(words) {
        Ok(line) => line.command,
        Err(err) => {
            write!(out, "{}", err.render())?;
            return Ok(Action::Continue);
        }
    };
    match execute(bank, command, out) {
        Ok(action) => Ok(action),
        Err(err) => {
            writeln!(out, "error: {err:#}")?;
            Ok(Action::Continue)
        }
    }
}

pub fn execute<W: Write>(
    bank: &mut StationBank,
    command: ConsoleCommand,
    out: &mut W,
) -> Result<Action> {
    let today = bank.now().date();
    match command {
        ConsoleCommand::Status => render_status(&bank.views(), out)?,
        ConsoleCommand::On { slot } => {
            bound_station(bank, slot)?.set_activated(true);
            writeln!(out, "slot {slot} activated")?;
        }
        ConsoleCommand::Off { slot } => {
            bound_station(bank, slot)?.set_activated(false);
            writeln!(out, "slot {slot} deactivated")?;
        }
        ConsoleCommand::Book {
            slot,
            name,
            start,
            append,
            duration,
            replace,
        } => {
            let start = if append {
                None
            } else {
                Some(match start {
                    Some(start) => parse_time_on(&start, today)?,
                    None => bank.now(),
                })
            };
            let duration = parse_duration(&duration)?;
            let station = bound_station(bank, slot)?;
            let mut prompt = ConflictPrompt::new(replace);
            let outcome =
                station.add_session(BookingRequest::new(name, start, duration), &mut prompt)?;
            report_outcome(station, outcome, &prompt, out)?;
        }
        ConsoleCommand::Edit {
            slot,
            id,
            name,
            start,
            end,
            duration,
            replace,
        } => {
            let edit = SessionEdit {
                customer_name: name,
                start: start.map(|s| parse_time_on(&s, today)).transpose()?,
                end: end.map(|s| parse_time_on(&s, today)).transpose()?,
                duration: duration.map(|d| parse_duration(&d)).transpose()?,
            };
            let station = bound_station(bank, slot)?;
            let mut prompt = ConflictPrompt::new(replace);
            let outcome = station.edit_session(SessionId::from_raw(id), edit, &mut prompt)?;
            report_outcome(station, outcome, &prompt, out)?;
        }
        ConsoleCommand::Delete { slot, ids } => {
            let ids: Vec<SessionId> = ids.into_iter().map(SessionId::from_raw).collect();
            let deleted = bound_station(bank, slot)?.delete_sessions(&ids)?;
            writeln!(out, "deleted {deleted} session(s)")?;
        }
        ConsoleCommand::Stats { slot } => {
            let today = bank.now().date();
            render_stats(station(bank, slot)?, today, out)?;
        }
        ConsoleCommand::Suggest { slot } => {
            let start = station(bank, slot)?.suggested_start();
            writeln!(out, "suggested start {}", start.format("%H:%M"))?;
        }
        ConsoleCommand::Refresh => return Ok(Action::Discover),
        ConsoleCommand::Quit => return Ok(Action::Quit),
    }
    Ok(Action::Continue)
}

fn station(bank: &StationBank, slot: usize) -> Result<&Station> {
    bank.station(slot)
        .ok_or_else(|| anyhow::anyhow!("no slot {slot}"))
}

fn bound_station(bank: &mut StationBank, slot: usize) -> Result<&mut Station> {
    let station = bank
        .station_mut(slot)
        .ok_or_else(|| anyhow::anyhow!("no slot {slot}"))?;
    if station.device().is_none() {
        anyhow::bail!("slot {slot} has no device");
    }
    Ok(station)
}

fn describe(session: &Session) -> String {
    format!(
        "{} {}-{}",
        session.customer_name(),
        session.start().format("%H:%M"),
        session.end().format("%H:%M")
    )
}

fn report_outcome<W: Write>(
    station: &Station,
    outcome: BookingOutcome,
    prompt: &ConflictPrompt,
    out: &mut W,
) -> io::Result<()> {
    match outcome {
        BookingOutcome::Added(id) => {
            if !prompt.conflicts.is_empty() {
                writeln!(
                    out,
                    "replaced {} conflicting session(s)",
                    prompt.conflicts.len()
                )?;
            }
            match station.sessions().iter().find(|session| session.id() == id) {
                Some(session) => writeln!(out, "booked #{id} {}", describe(session)),
                None => writeln!(out, "booked #{id}, already ended and archived"),
            }
        }
        BookingOutcome::Declined => {
            writeln!(out, "conflicts with:")?;
            for session in &prompt.conflicts {
                writeln!(out, "  #{} {}", session.id(), describe(session))?;
            }
            writeln!(
                out,
                "declined; repeat with --replace to remove the conflicting sessions"
            )
        }
    }
}

/// Renders the visible stations as a table.
pub fn render_status<W: Write>(views: &[StationView], out: &mut W) -> io::Result<()> {
    let visible: Vec<&StationView> = views.iter().filter(|view| !view.is_hidden).collect();
    if visible.is_empty() {
        return writeln!(out, "No devices bound. Use `refresh` to discover devices.");
    }
    writeln!(
        out,
        "{:<4} {:<16} {:<7} {:<28} {:<5} {:<5} {:<5} QUEUED",
        "SLOT", "DEVICE", "STATE", "CUSTOMER", "START", "END", "LEFT"
    )?;
    for view in visible {
        let state = match (view.is_activated, view.is_running) {
            (false, _) => "off",
            (true, true) => "running",
            (true, false) => "idle",
        };
        writeln!(
            out,
            "{:<4} {:<16} {:<7} {:<28} {:<5} {:<5} {:<5} {}",
            view.slot,
            view.device_name,
            state,
            view.customer_label,
            view.start_time,
            view.end_time,
            view.time_left,
            view.queued
        )?;
    }
    Ok(())
}

fn render_stats<W: Write>(station: &Station, today: NaiveDate, out: &mut W) -> io::Result<()> {
    let stats = station.tracker().stats().view();
    writeln!(out, "Total time:          {}", stats.total_time)?;
    writeln!(out, "Average time:        {}", stats.average_time)?;
    writeln!(out, "Total sessions:      {}", stats.total_sessions)?;
    writeln!(out, "Sessions per day:    {}", stats.average_sessions_per_day)?;
    let today = station.tracker().stats_on(today).view();
    writeln!(out, "Sessions today:      {}", today.total_sessions)?;
    writeln!(out, "Time today:          {}", today.total_time)
}
