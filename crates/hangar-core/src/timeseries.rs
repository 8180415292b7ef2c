//! Exponentially decayed time series.
//!
//! A [`TimeSeries`] is an exponential moving average with a bounded history.
//! [`MultiStageTimeSeries`] keeps three of them, updated every tick, every 6
//! ticks and every 360 ticks; with the default 10 second clock those are the
//! 10-second, minute and hour views.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::{Error, Result};

/// Resolution of a trend view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeScale {
    Sec10,
    Min,
    Hour,
}

impl TimeScale {
    pub const ALL: [TimeScale; 3] = [TimeScale::Sec10, TimeScale::Min, TimeScale::Hour];

    /// Clock ticks between two samples at this scale.
    pub fn ticks(&self) -> u32 {
        match self {
            TimeScale::Sec10 => 1,
            TimeScale::Min => 6,
            TimeScale::Hour => 360,
        }
    }

    /// Wall time between two samples for the given sampling clock.
    pub fn period(&self, clock: Duration) -> Duration {
        clock * self.ticks()
    }

    /// Number of samples retained at this scale.
    pub fn history_size(&self) -> usize {
        match self {
            TimeScale::Sec10 => 6 * 60,
            TimeScale::Min => 60 * 24,
            TimeScale::Hour => 28 * 24,
        }
    }

    /// Parse a scale name; `None` selects the minute view.
    pub fn parse(name: Option<&str>) -> Result<Self> {
        match name {
            None => Ok(TimeScale::Min),
            Some(s) => s.parse(),
        }
    }
}

impl FromStr for TimeScale {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sec10" => Ok(TimeScale::Sec10),
            "min" => Ok(TimeScale::Min),
            "hour" => Ok(TimeScale::Hour),
            other => Err(Error::InvalidInput(format!("time scale '{}'", other))),
        }
    }
}

impl fmt::Display for TimeScale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TimeScale::Sec10 => "sec10",
            TimeScale::Min => "min",
            TimeScale::Hour => "hour",
        })
    }
}

/// Exponential moving average with history, newest sample first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    decay: f64,
    history_size: usize,
    history: VecDeque<f64>,
}

impl TimeSeries {
    pub fn new(initial: f64, decay: f64, history_size: usize) -> Self {
        let mut history = VecDeque::with_capacity(history_size.max(1));
        history.push_front(initial);
        Self {
            decay,
            history_size: history_size.max(1),
            history,
        }
    }

    /// Blend a new sample: `latest * decay + sample * (1 - decay)`.
    pub fn update(&mut self, sample: f64) {
        let next = self.latest() * self.decay + sample * (1.0 - self.decay);
        self.history.push_front(next);
        self.history.truncate(self.history_size);
    }

    pub fn latest(&self) -> f64 {
        self.history.front().copied().unwrap_or(0.0)
    }

    /// Samples, newest first.
    pub fn history(&self) -> Vec<f64> {
        self.history.iter().copied().collect()
    }
}

/// One quantity observed at three time scales.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiStageTimeSeries {
    pub sec10: TimeSeries,
    pub min: TimeSeries,
    pub hour: TimeSeries,
    counter: u32,
}

impl MultiStageTimeSeries {
    pub fn new(initial: f64, decay: f64) -> Self {
        Self {
            sec10: TimeSeries::new(initial, decay, TimeScale::Sec10.history_size()),
            min: TimeSeries::new(initial, decay, TimeScale::Min.history_size()),
            hour: TimeSeries::new(initial, decay, TimeScale::Hour.history_size()),
            counter: 0,
        }
    }

    /// Record one clock tick's sample.
    pub fn update(&mut self, sample: f64) {
        self.counter = (self.counter + 1) % TimeScale::Hour.ticks();
        self.sec10.update(sample);
        if self.counter % TimeScale::Min.ticks() == 0 {
            self.min.update(sample);
        }
        if self.counter == 0 {
            self.hour.update(sample);
        }
    }

    /// Record `ticks` clock ticks that all observed `sample`. Used when the
    /// sampler fell behind, so missed ticks still decay.
    pub fn update_ticks(&mut self, sample: f64, ticks: u32) {
        for _ in 0..ticks {
            self.update(sample);
        }
    }

    pub fn pick(&self, scale: TimeScale) -> &TimeSeries {
        match scale {
            TimeScale::Sec10 => &self.sec10,
            TimeScale::Min => &self.min,
            TimeScale::Hour => &self.hour,
        }
    }

    pub fn latest(&self, scale: TimeScale) -> f64 {
        self.pick(scale).latest()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_blends_with_decay() {
        let mut ts = TimeSeries::new(10.0, 0.9, 4);
        ts.update(0.0);
        assert!((ts.latest() - 9.0).abs() < 1e-9);
        ts.update(20.0);
        assert!((ts.latest() - (9.0 * 0.9 + 2.0)).abs() < 1e-9);
    }

    #[test]
    fn test_history_is_bounded_newest_first() {
        let mut ts = TimeSeries::new(0.0, 0.0, 3);
        for v in 1..=5 {
            ts.update(v as f64);
        }
        assert_eq!(ts.history(), vec![5.0, 4.0, 3.0]);
    }

    #[test]
    fn test_idle_series_decays_monotonically_to_zero() {
        let mut series = MultiStageTimeSeries::new(8.0, 0.9);
        let mut previous = series.latest(TimeScale::Sec10);
        for _ in 0..200 {
            series.update(0.0);
            let latest = series.latest(TimeScale::Sec10);
            assert!(latest < previous);
            assert!(latest >= 0.0);
            previous = latest;
        }
        assert!(previous < 0.01);
    }

    #[test]
    fn test_coarser_scales_update_less_often() {
        let mut series = MultiStageTimeSeries::new(0.0, 0.5);
        series.update_ticks(4.0, 5);
        assert_eq!(series.sec10.history().len(), 6);
        assert_eq!(series.min.history().len(), 1);

        series.update(4.0);
        assert_eq!(series.min.history().len(), 2);
        assert_eq!(series.hour.history().len(), 1);

        series.update_ticks(4.0, 354);
        assert_eq!(series.hour.history().len(), 2);
    }

    #[test]
    fn test_parse_time_scale() {
        assert_eq!(TimeScale::parse(None).unwrap(), TimeScale::Min);
        assert_eq!(TimeScale::parse(Some("HOUR")).unwrap(), TimeScale::Hour);
        assert!(matches!(
            TimeScale::parse(Some("week")),
            Err(Error::InvalidInput(_))
        ));
        assert_eq!(
            TimeScale::Min.period(Duration::from_secs(10)),
            Duration::from_secs(60)
        );
    }
}
