//! Plain-text console: stdin commands and roster rendering

use std::fmt::Write;

use chrono::{DateTime, Utc};
use tally_core::{ConnectionStatus, RoundStatus};

use crate::dispatch::Role;
use crate::session::SessionView;

pub const HELP: &str = "\
commands:
  vote <card>       cast a vote (any text: 1, 2, 3, 5, 8, ?, coffee)
  unvote            withdraw your vote
  reveal | hide     show or hide the votes (facilitator)
  reset             start a new round (facilitator)
  host <name>       hand facilitation to someone (facilitator)
  auto on [secs]    enable auto-reveal (facilitator)
  auto off          disable auto-reveal (facilitator)
  reconnect         reattach after losing the room
  status            print the room
  leave             leave and forget this room
  quit              exit, keeping the room for `tally resume`";

/// One console line
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Vote(String),
    Unvote,
    Reveal,
    Hide,
    Reset,
    Host(String),
    AutoOn(Option<u32>),
    AutoOff,
    Reconnect,
    Status,
    Leave,
    Quit,
    Help,
}

#[derive(Debug, thiserror::Error, PartialEq)]
#[error("{0} (type `help` for commands)")]
pub struct InputError(String);

/// Parse a console line. Blank lines yield `None`.
pub fn parse(line: &str) -> Result<Option<Input>, InputError> {
    let line = line.trim();
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };

    let input = match word.to_ascii_lowercase().as_str() {
        "" => return Ok(None),
        "vote" if rest.is_empty() => return Err(InputError("vote needs a card".into())),
        "vote" => Input::Vote(rest.to_string()),
        "unvote" => Input::Unvote,
        "reveal" => Input::Reveal,
        "hide" => Input::Hide,
        "reset" => Input::Reset,
        "host" if rest.is_empty() => return Err(InputError("host needs a name".into())),
        "host" => Input::Host(rest.to_string()),
        "auto" => parse_auto(rest)?,
        "reconnect" => Input::Reconnect,
        "status" => Input::Status,
        "leave" => Input::Leave,
        "quit" | "exit" => Input::Quit,
        "help" | "?" => Input::Help,
        other => return Err(InputError(format!("unknown command '{}'", other))),
    };
    Ok(Some(input))
}

fn parse_auto(rest: &str) -> Result<Input, InputError> {
    let mut parts = rest.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("on"), None) => Ok(Input::AutoOn(None)),
        (Some("on"), Some(secs)) => secs
            .parse::<u32>()
            .ok()
            .filter(|s| *s > 0)
            .map(|s| Input::AutoOn(Some(s)))
            .ok_or_else(|| InputError(format!("bad duration '{}'", secs))),
        (Some("off"), None) => Ok(Input::AutoOff),
        _ => Err(InputError("usage: auto on [secs] | auto off".into())),
    }
}

/// Render the room as plain text
pub fn render(view: &SessionView, now: DateTime<Utc>) -> String {
    let state = &view.state;
    let mut out = String::new();

    let role = match view.role {
        Role::Relay => "relay",
        Role::Member => "member",
    };
    let _ = writeln!(out, "room {} ({}, {:?})", view.room_code, role, view.connection);
    let _ = writeln!(out, "you: {} (peer {})", view.name, view.me);
    if view.role == Role::Member && view.relay_status != ConnectionStatus::Online {
        let _ = writeln!(out, "relay is {}", view.relay_status.label());
    }

    let (voted, total) = state.vote_count();
    let status = match state.status {
        RoundStatus::Voting => "voting",
        RoundStatus::Revealed => "revealed",
    };
    let _ = write!(out, "round: {} ({}/{} voted)", status, voted, total);
    if state.settings.auto_reveal {
        let _ = write!(out, ", auto-reveal {}s", state.settings.auto_reveal_duration);
    }
    if let Some(left) = state.countdown_remaining(now) {
        let _ = write!(out, ", revealing in {}s", left.as_secs_f32().ceil() as u64);
    }
    out.push('\n');

    for p in &state.players {
        let vote = match (&p.vote, state.status) {
            (None, _) => "-".to_string(),
            (Some(_), RoundStatus::Voting) => "voted".to_string(),
            (Some(v), RoundStatus::Revealed) => v.clone(),
        };
        let mut tags = Vec::new();
        if p.is_host {
            tags.push("facilitator");
        }
        if p.user_id == view.user_id {
            tags.push("you");
        }
        let tags = if tags.is_empty() {
            String::new()
        } else {
            format!(" [{}]", tags.join(", "))
        };
        let _ = writeln!(
            out,
            "  {:<16} {:<8} {}{}",
            p.name,
            vote,
            p.connection_status.label(),
            tags
        );
    }

    if state.status == RoundStatus::Voting {
        if let Some(card) = view.me().and_then(|p| p.vote.as_deref()) {
            let _ = writeln!(out, "your vote: {}", card);
        }
    }

    if state.status == RoundStatus::Revealed {
        match state.average() {
            Some(avg) => {
                let _ = writeln!(out, "average: {}", format_average(avg));
            }
            None => {
                let _ = writeln!(out, "average: n/a");
            }
        }
    }
    out
}

fn format_average(avg: f64) -> String {
    let text = format!("{:.2}", avg);
    text.trim_end_matches('0').trim_end_matches('.').to_string()
}
