//! Outgoing control commands.
//!
//! The receiver takes one getopt-style text command per WebSocket message:
//! `-f <hz>`, `-m <mode>`, `-s on|off`, `-s up|down`, `-r <hz>`. Nothing is
//! acknowledged; the effect shows up in a later status record.

use std::fmt;
use strum::{AsRefStr, Display, EnumIter, EnumString};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    #[error("Invalid number: {0}")]
    InvalidNumber(String),

    #[error("Unknown mode: {0}")]
    UnknownMode(String),

    #[error("Invalid argument for {command}: {value}")]
    InvalidArgument {
        command: &'static str,
        value: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr, EnumIter)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Mode {
    Am,
    Fm,
    Bpsk,
    Qpsk,
    #[strum(serialize = "8psk")]
    Psk8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ScanState {
    On,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum SeekDirection {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    SetFrequency(u64),
    SetMode(Mode),
    Scan(ScanState),
    Seek(SeekDirection),
    SetSampleRate(u64),
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::SetFrequency(hz) => write!(f, "-f {}", hz),
            Command::SetMode(mode) => write!(f, "-m {}", mode),
            // Scan and seek share -s; the argument tells them apart
            Command::Scan(state) => write!(f, "-s {}", state),
            Command::Seek(direction) => write!(f, "-s {}", direction),
            Command::SetSampleRate(hz) => write!(f, "-r {}", hz),
        }
    }
}

impl Command {
    /// Text sent on the wire.
    pub fn encode(&self) -> String {
        self.to_string()
    }

    /// Frequency given as a decimal in units of `order` Hz (`"90.7"`, 1e6).
    /// Zero tunes nowhere and yields no command.
    pub fn frequency(value: &str, order: f64) -> Result<Option<Command>, CommandError> {
        let hz = scaled_hz(value, order)?;
        Ok((hz > 0).then_some(Command::SetFrequency(hz)))
    }

    /// Sample rate given as a decimal in units of `order` Hz.
    pub fn sample_rate(value: &str, order: f64) -> Result<Command, CommandError> {
        let hz = scaled_hz(value, order)?;
        if hz == 0 {
            return Err(CommandError::InvalidArgument {
                command: "sample rate",
                value: value.to_string(),
            });
        }
        Ok(Command::SetSampleRate(hz))
    }

    pub fn mode(value: &str) -> Result<Command, CommandError> {
        value
            .parse::<Mode>()
            .map(Command::SetMode)
            .map_err(|_| CommandError::UnknownMode(value.to_string()))
    }

    pub fn scan(value: &str) -> Result<Command, CommandError> {
        value
            .parse::<ScanState>()
            .map(Command::Scan)
            .map_err(|_| CommandError::InvalidArgument {
                command: "scan",
                value: value.to_string(),
            })
    }

    pub fn seek(value: &str) -> Result<Command, CommandError> {
        value
            .parse::<SeekDirection>()
            .map(Command::Seek)
            .map_err(|_| CommandError::InvalidArgument {
                command: "seek",
                value: value.to_string(),
            })
    }
}

/// Parse a decimal, scale it and floor it to whole hertz.
pub fn scaled_hz(value: &str, order: f64) -> Result<u64, CommandError> {
    let number: f64 = value
        .trim()
        .parse()
        .map_err(|_| CommandError::InvalidNumber(value.to_string()))?;
    // 1.92 * 1e6 lands just under 1920000 in binary floating point
    let hz = (number * order + 1e-6).floor();
    if !hz.is_finite() || hz < 0.0 || hz > u64::MAX as f64 {
        return Err(CommandError::InvalidNumber(value.to_string()));
    }
    Ok(hz as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_command_encoding() {
        assert_eq!(Command::SetFrequency(90_700_000).encode(), "-f 90700000");
        assert_eq!(Command::SetMode(Mode::Am).encode(), "-m am");
        assert_eq!(Command::SetMode(Mode::Psk8).encode(), "-m 8psk");
        assert_eq!(Command::Scan(ScanState::On).encode(), "-s on");
        assert_eq!(Command::Scan(ScanState::Off).encode(), "-s off");
        assert_eq!(Command::Seek(SeekDirection::Up).encode(), "-s up");
        assert_eq!(Command::Seek(SeekDirection::Down).encode(), "-s down");
        assert_eq!(Command::SetSampleRate(2_048_000).encode(), "-r 2048000");
    }

    #[test]
    fn test_frequency_scaling() {
        assert_eq!(
            Command::frequency("90.7", 1e6).unwrap(),
            Some(Command::SetFrequency(90_700_000))
        );
        assert_eq!(
            Command::frequency("101.15", 1e6).unwrap(),
            Some(Command::SetFrequency(101_150_000))
        );
        assert_eq!(
            Command::frequency("1000", 1e3).unwrap(),
            Some(Command::SetFrequency(1_000_000))
        );
        assert_eq!(Command::frequency("0", 1e6).unwrap(), None);
        assert!(Command::frequency("abc", 1e6).is_err());
        assert!(Command::frequency("-1", 1e6).is_err());
    }

    #[test]
    fn test_sample_rate_scaling() {
        assert_eq!(
            Command::sample_rate("1.92", 1e6).unwrap(),
            Command::SetSampleRate(1_920_000)
        );
        assert!(Command::sample_rate("0", 1e6).is_err());
    }

    #[test]
    fn test_mode_names_round_trip() {
        for mode in Mode::iter() {
            assert_eq!(Command::mode(mode.as_ref()).unwrap(), Command::SetMode(mode));
        }
        assert_eq!(Command::mode("FM").unwrap(), Command::SetMode(Mode::Fm));
        assert!(matches!(
            Command::mode("usb"),
            Err(CommandError::UnknownMode(_))
        ));
    }

    #[test]
    fn test_scan_and_seek_arguments() {
        assert_eq!(Command::scan("on").unwrap(), Command::Scan(ScanState::On));
        assert_eq!(
            Command::seek("down").unwrap(),
            Command::Seek(SeekDirection::Down)
        );
        assert!(Command::scan("up").is_err());
        assert!(Command::seek("off").is_err());
    }
}
