use alloc::{collections::VecDeque, string::String};

use super::Reading;
use crate::firmware::config::CHANNEL_BUFFER_MAX;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Sample {
    pub ts_ms: u64,
    pub value: f64,
}

/// Buffered samples for one collector channel. The oldest sample is
/// dropped once the buffer is full.
pub struct MeterChannel {
    uuid: String,
    identifier: Option<&'static str>,
    precision: u8,
    samples: VecDeque<Sample>,
    last: Option<Sample>,
    dropped: u32,
}

impl MeterChannel {
    pub fn new(uuid: &str, identifier: Option<&'static str>) -> Self {
        Self {
            uuid: String::from(uuid),
            identifier,
            precision: 2,
            samples: VecDeque::new(),
            last: None,
            dropped: 0,
        }
    }

    pub fn with_precision(mut self, precision: u8) -> Self {
        self.precision = precision.min(6);
        self
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn identifier(&self) -> Option<&'static str> {
        self.identifier
    }

    pub fn precision(&self) -> u8 {
        self.precision
    }

    /// A channel without identifier takes every reading of its source.
    pub fn accepts(&self, reading: &Reading) -> bool {
        match self.identifier {
            None => true,
            Some(wanted) => reading.identifier == Some(wanted),
        }
    }

    pub fn push(&mut self, sample: Sample) {
        if self.samples.len() >= CHANNEL_BUFFER_MAX {
            self.samples.pop_front();
            self.dropped = self.dropped.saturating_add(1);
        }
        self.samples.push_back(sample);
        self.last = Some(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn dropped(&self) -> u32 {
        self.dropped
    }

    pub fn last(&self) -> Option<Sample> {
        self.last
    }

    pub fn pending(&self) -> impl Iterator<Item = &Sample> {
        self.samples.iter()
    }

    /// Removes the `count` oldest samples after the collector took them.
    pub fn acknowledge(&mut self, count: usize) {
        let count = count.min(self.samples.len());
        self.samples.drain(..count);
    }
}
