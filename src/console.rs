//! Line-oriented control console for the binary.

use crate::commands::{scaled_hz, Command, CommandError};
use thiserror::Error;

pub const HELP: &str = "\
Commands:
  connect [uri]      connect to the receiver (default endpoint if omitted)
  disconnect         close the connection
  freq <f>[k|M]      tune, MHz unless suffixed (e.g. 90.7, 1010k)
  mode <am|fm|bpsk|qpsk|8psk>
  scan on|off
  seek up|down
  rate <f>[k|M]      tuner sample rate, MHz unless suffixed
  status             show connection, queue and last status record
  help
  quit";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConsoleError {
    #[error("Unknown command: {0} (try 'help')")]
    UnknownCommand(String),

    #[error("Missing argument for {0}")]
    MissingArgument(&'static str),

    #[error(transparent)]
    Command(#[from] CommandError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Connect(Option<String>),
    Disconnect,
    /// Tune to a frequency; zero leaves the tuner alone
    Tune(Option<u64>),
    Send(Command),
    Status,
    Help,
    Quit,
}

/// Parse one console line. Blank lines yield `None`.
pub fn parse_line(line: &str) -> Result<Option<ConsoleCommand>, ConsoleError> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let arg = words.next();

    let command = match verb.to_ascii_lowercase().as_str() {
        "connect" => ConsoleCommand::Connect(arg.map(str::to_string)),
        "disconnect" => ConsoleCommand::Disconnect,
        "freq" | "f" => {
            let hz = hertz(arg.ok_or(ConsoleError::MissingArgument("freq"))?)?;
            ConsoleCommand::Tune((hz > 0).then_some(hz))
        }
        "mode" | "m" => ConsoleCommand::Send(Command::mode(
            arg.ok_or(ConsoleError::MissingArgument("mode"))?,
        )?),
        "scan" => ConsoleCommand::Send(Command::scan(
            arg.ok_or(ConsoleError::MissingArgument("scan"))?,
        )?),
        "seek" => ConsoleCommand::Send(Command::seek(
            arg.ok_or(ConsoleError::MissingArgument("seek"))?,
        )?),
        "rate" | "r" => {
            let hz = hertz(arg.ok_or(ConsoleError::MissingArgument("rate"))?)?;
            if hz == 0 {
                return Err(CommandError::InvalidArgument {
                    command: "sample rate",
                    value: "0".to_string(),
                }
                .into());
            }
            ConsoleCommand::Send(Command::SetSampleRate(hz))
        }
        "status" | "s" => ConsoleCommand::Status,
        "help" | "?" => ConsoleCommand::Help,
        "quit" | "exit" | "q" => ConsoleCommand::Quit,
        other => return Err(ConsoleError::UnknownCommand(other.to_string())),
    };
    Ok(Some(command))
}

/// `90.7` and `90.7M` are MHz, `1010k` is kHz, `1010000Hz` is Hz.
fn hertz(value: &str) -> Result<u64, CommandError> {
    let lower = value.to_ascii_lowercase();
    let (number, order) = if let Some(n) = lower.strip_suffix("mhz") {
        (n, 1e6)
    } else if let Some(n) = lower.strip_suffix("khz") {
        (n, 1e3)
    } else if let Some(n) = lower.strip_suffix("hz") {
        (n, 1.0)
    } else if let Some(n) = lower.strip_suffix('m') {
        (n, 1e6)
    } else if let Some(n) = lower.strip_suffix('k') {
        (n, 1e3)
    } else {
        (lower.as_str(), 1e6)
    };
    scaled_hz(number, order).map_err(|_| CommandError::InvalidNumber(value.to_string()))
}
