//! Wire format between clients and the indicator daemon.
//!
//! One exchange per connection: the client writes a single newline-terminated
//! request line, the daemon answers with a single `ok` or `error` line.
use std::fmt;

pub const ACTIVITY_PREFIX: &str = "activity:";

/// A request sent to the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Trigger a one-shot visual pulse.
    Flash,
    /// Terminate the daemon.
    Stop,
    /// Liveness check over the wire.
    Ping,
    /// Record that a named action occurred.
    Activity(String),
}

impl Command {
    /// Parses one request line. Matching is case-insensitive; the activity
    /// label keeps its original case and is trimmed.
    ///
    /// Returns `None` for anything that is not a known command.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();

        let head = line.get(..ACTIVITY_PREFIX.len());
        if head.is_some_and(|head| head.eq_ignore_ascii_case(ACTIVITY_PREFIX)) {
            let label = line[ACTIVITY_PREFIX.len()..].trim();
            return Some(Command::Activity(label.to_string()));
        }

        match line.to_ascii_lowercase().as_str() {
            "flash" => Some(Command::Flash),
            "stop" => Some(Command::Stop),
            "ping" => Some(Command::Ping),
            _ => None,
        }
    }

    /// The single-line request form, newline included. Newlines inside an
    /// activity label are folded to spaces so the request stays one line.
    pub fn to_line(&self) -> String {
        format!("{self}\n")
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Flash => f.write_str("flash"),
            Command::Stop => f.write_str("stop"),
            Command::Ping => f.write_str("ping"),
            Command::Activity(label) => {
                let label = label.replace(['\r', '\n'], " ");
                write!(f, "{ACTIVITY_PREFIX}{label}")
            }
        }
    }
}

/// The daemon's reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    Ok,
    Error,
}

impl Response {
    pub fn as_str(self) -> &'static str {
        match self {
            Response::Ok => "ok",
            Response::Error => "error",
        }
    }

    pub fn to_line(self) -> String {
        format!("{}\n", self.as_str())
    }

    /// Anything other than a (trimmed, case-folded) `ok` counts as an error.
    pub fn parse(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("ok") {
            Response::Ok
        } else {
            Response::Error
        }
    }
}
