//! Tuning state that sits next to the frequency controls.

use crate::commands::{Command, Mode};
use crate::protocol::StatusRecord;
use std::collections::HashMap;

/// Sample rates the receiver's tuner accepts; anything else is ignored by it.
pub const SUPPORTED_SAMPLE_RATES: [u64; 6] = [
    250_000, 1_000_000, 1_920_000, 2_000_000, 2_048_000, 2_400_000,
];

/// Frequency range the receiver will tune in a given mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Band {
    pub min_hz: u64,
    pub max_hz: u64,
    pub step_hz: u64,
}

impl Band {
    pub const FM: Band = Band {
        min_hz: 87_900_000,
        max_hz: 107_900_000,
        step_hz: 200_000,
    };

    pub const AM: Band = Band {
        min_hz: 540_000,
        max_hz: 1_700_000,
        step_hz: 10_000,
    };

    /// PSK modes have no tunable band on the receiver.
    pub fn for_mode(mode: Mode) -> Option<Band> {
        match mode {
            Mode::Fm => Some(Band::FM),
            Mode::Am => Some(Band::AM),
            _ => None,
        }
    }

    pub fn contains(&self, hz: u64) -> bool {
        (self.min_hz..=self.max_hz).contains(&hz)
    }

    /// Clamp into the band and snap down onto the step grid.
    pub fn snap(&self, hz: u64) -> u64 {
        let clamped = hz.clamp(self.min_hz, self.max_hz);
        self.min_hz + (clamped - self.min_hz) / self.step_hz * self.step_hz
    }
}

pub fn is_supported_sample_rate(hz: u64) -> bool {
    SUPPORTED_SAMPLE_RATES.contains(&hz)
}

/// The frequency the user is steering towards.
///
/// Dragging only moves the target; a command goes out when the drag is
/// committed, so the receiver is not flooded with retunes.
#[derive(Debug, Clone, Default)]
pub struct TuningState {
    target_hz: Option<u64>,
}

impl TuningState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn target_hz(&self) -> Option<u64> {
        self.target_hz
    }

    pub fn drag(&mut self, hz: u64, band: Option<Band>) -> u64 {
        let hz = band.map_or(hz, |band| band.snap(hz));
        self.target_hz = Some(hz);
        hz
    }

    pub fn commit(&mut self) -> Option<Command> {
        self.target_hz
            .filter(|&hz| hz > 0)
            .map(Command::SetFrequency)
    }

    /// Set and commit in one step, e.g. a typed-in frequency.
    pub fn tune(&mut self, hz: u64, band: Option<Band>) -> Option<Command> {
        self.drag(hz, band);
        self.commit()
    }

    /// While seeking the receiver moves on its own; follow it.
    pub fn follow(&mut self, status: &StatusRecord) {
        if status.seeking && status.center_frequency_hz > 0 {
            self.target_hz = Some(status.center_frequency_hz as u64);
        }
    }
}

/// Stations reported by the receiver while scanning or seeking, per mode.
#[derive(Debug, Clone, Default)]
pub struct StationLog {
    stations: HashMap<String, Vec<i64>>,
}

impl StationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the last found station if this status reports a new one.
    pub fn observe(&mut self, status: &StatusRecord) -> Option<i64> {
        let station = status.last_station_found;
        if !(status.scanning || status.seeking) || station <= 0 || status.mode.is_empty() {
            return None;
        }

        let found = self.stations.entry(status.mode.clone()).or_default();
        if found.contains(&station) {
            return None;
        }
        found.push(station);
        Some(station)
    }

    pub fn stations(&self, mode: &str) -> &[i64] {
        self.stations.get(mode).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scanning(mode: &str, station: i64) -> StatusRecord {
        StatusRecord {
            mode: mode.to_string(),
            scanning: true,
            last_station_found: station,
            ..Default::default()
        }
    }

    #[test]
    fn test_band_snap_and_contains() {
        assert!(Band::FM.contains(90_700_000));
        assert!(!Band::FM.contains(108_000_000));
        assert_eq!(Band::FM.snap(90_750_000), 90_700_000);
        assert_eq!(Band::FM.snap(200_000_000), 107_900_000);
        assert_eq!(Band::AM.snap(100), 540_000);
        assert_eq!(Band::AM.snap(1_234_567), 1_230_000);
        assert_eq!(Band::for_mode(Mode::Qpsk), None);
    }

    #[test]
    fn test_drag_does_not_send_until_commit() {
        let mut tuning = TuningState::new();
        assert_eq!(tuning.commit(), None);

        assert_eq!(tuning.drag(95_130_000, Some(Band::FM)), 95_100_000);
        assert_eq!(tuning.drag(99_990_000, Some(Band::FM)), 99_900_000);
        assert_eq!(tuning.commit(), Some(Command::SetFrequency(99_900_000)));
    }

    #[test]
    fn test_follow_while_seeking() {
        let mut tuning = TuningState::new();
        tuning.tune(90_700_000, None);

        let mut status = StatusRecord {
            center_frequency_hz: 93_100_000,
            ..Default::default()
        };
        tuning.follow(&status);
        assert_eq!(tuning.target_hz(), Some(90_700_000));

        status.seeking = true;
        tuning.follow(&status);
        assert_eq!(tuning.target_hz(), Some(93_100_000));
    }

    #[test]
    fn test_station_log() {
        let mut log = StationLog::new();
        assert_eq!(log.observe(&scanning("fm", 101_100_000)), Some(101_100_000));
        assert_eq!(log.observe(&scanning("fm", 101_100_000)), None);
        assert_eq!(log.observe(&scanning("fm", -1)), None);
        assert_eq!(log.observe(&scanning("am", 1_010_000)), Some(1_010_000));

        let idle = StatusRecord {
            mode: "fm".to_string(),
            last_station_found: 88_500_000,
            ..Default::default()
        };
        assert_eq!(log.observe(&idle), None);

        assert_eq!(log.stations("fm"), &[101_100_000]);
        assert_eq!(log.stations("am"), &[1_010_000]);
        assert!(log.stations("bpsk").is_empty());
    }

    #[test]
    fn test_supported_sample_rates() {
        assert!(is_supported_sample_rate(2_048_000));
        assert!(!is_supported_sample_rate(3_000_000));
    }
}
