//! Bounded, time-gated sample history per sensor channel.
//!
//! The gate intentionally downsamples: a notification burst only
//! contributes one sample per interval, so the retained window covers a
//! useful stretch of time for trend display instead of the last second
//! of chatter.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::device::constants::{SAMPLE_CAPACITY, SAMPLE_INTERVAL_SECS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorChannel {
    Temperature,
    Humidity,
    InteriorLight,
    ExteriorLight,
    ExteriorTintedLight,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub value: f32,
    pub at: Instant,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SampleLog {
    channels: HashMap<SensorChannel, VecDeque<Sample>>,
}

impl SampleLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn interval() -> Duration {
        Duration::from_secs(SAMPLE_INTERVAL_SECS)
    }

    /// Appends `(value, now)` to the channel unless the newest retained
    /// sample is younger than the gate interval; gated samples are
    /// silently dropped. At capacity the oldest sample is evicted first.
    /// Returns whether the sample was retained.
    pub fn record(&mut self, channel: SensorChannel, value: f32, now: Instant) -> bool {
        let sequence = self.channels.entry(channel).or_default();

        if let Some(newest) = sequence.back() {
            if newest.at + Self::interval() > now {
                return false;
            }
        }

        sequence.push_back(Sample { value, at: now });
        while sequence.len() > SAMPLE_CAPACITY {
            sequence.pop_front();
        }
        true
    }

    pub fn len(&self, channel: SensorChannel) -> usize {
        self.channels.get(&channel).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self, channel: SensorChannel) -> bool {
        self.len(channel) == 0
    }

    /// Samples oldest first.
    pub fn iter(&self, channel: SensorChannel) -> impl Iterator<Item = &Sample> + '_ {
        self.channels.get(&channel).into_iter().flatten()
    }

    pub fn newest(&self, channel: SensorChannel) -> Option<&Sample> {
        self.channels.get(&channel).and_then(VecDeque::back)
    }
}
