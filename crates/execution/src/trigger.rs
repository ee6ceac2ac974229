//! Group emission policies.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

use rill_common::Value;
use rill_planner::TriggerSpec;

/// Decides when a group-by emits the current values of a key.
///
/// `poll` drains the keys that became ready since the last call;
/// `end_of_stream` drains every key with pending updates for the final
/// synthetic firing at source exhaustion.
pub trait Trigger: Send {
    /// Note an update of `key` carrying the given event time.
    fn record_received(&mut self, key: &Value, event_time: DateTime<Utc>);

    /// Note watermark progress.
    fn watermark_received(&mut self, watermark: DateTime<Utc>);

    /// Keys ready to fire, drained.
    fn poll(&mut self) -> Vec<Value>;

    /// Keys with pending updates, drained. Called once at exhaustion.
    fn end_of_stream(&mut self) -> Vec<Value>;
}

/// Build the trigger instance for a plan-level spec.
pub fn build_trigger(spec: &TriggerSpec) -> Box<dyn Trigger> {
    match spec {
        TriggerSpec::Watermark => Box::new(WatermarkTrigger::new()),
        TriggerSpec::Counting(n) => Box::new(CountingTrigger::new(*n)),
        TriggerSpec::EndOfStream => Box::new(EndOfStreamTrigger::default()),
    }
}

/// Fires a key once the watermark passes its event time.
pub struct WatermarkTrigger {
    key_times: BTreeMap<Value, DateTime<Utc>>,
    watermark: DateTime<Utc>,
}

impl WatermarkTrigger {
    /// Trigger with no watermark observed yet.
    pub fn new() -> Self {
        WatermarkTrigger {
            key_times: BTreeMap::new(),
            watermark: DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}

impl Default for WatermarkTrigger {
    fn default() -> Self {
        Self::new()
    }
}

impl Trigger for WatermarkTrigger {
    fn record_received(&mut self, key: &Value, event_time: DateTime<Utc>) {
        let slot = self.key_times.entry(key.clone()).or_insert(event_time);
        if event_time > *slot {
            *slot = event_time;
        }
    }

    fn watermark_received(&mut self, watermark: DateTime<Utc>) {
        if watermark > self.watermark {
            self.watermark = watermark;
        }
    }

    fn poll(&mut self) -> Vec<Value> {
        let watermark = self.watermark;
        let ready: Vec<Value> = self
            .key_times
            .iter()
            .filter(|(_, time)| **time <= watermark)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &ready {
            self.key_times.remove(key);
        }
        ready
    }

    fn end_of_stream(&mut self) -> Vec<Value> {
        std::mem::take(&mut self.key_times).into_keys().collect()
    }
}

/// Fires a key after every `n` updates to it.
pub struct CountingTrigger {
    fire_every: u64,
    counts: BTreeMap<Value, u64>,
    ready: Vec<Value>,
}

impl CountingTrigger {
    /// Trigger firing after every `fire_every` updates per key.
    pub fn new(fire_every: u64) -> Self {
        CountingTrigger {
            fire_every: fire_every.max(1),
            counts: BTreeMap::new(),
            ready: Vec::new(),
        }
    }
}

impl Trigger for CountingTrigger {
    fn record_received(&mut self, key: &Value, _event_time: DateTime<Utc>) {
        let count = self.counts.entry(key.clone()).or_insert(0);
        *count += 1;
        if *count >= self.fire_every {
            *count = 0;
            self.ready.push(key.clone());
        }
    }

    fn watermark_received(&mut self, _watermark: DateTime<Utc>) {}

    fn poll(&mut self) -> Vec<Value> {
        std::mem::take(&mut self.ready)
    }

    fn end_of_stream(&mut self) -> Vec<Value> {
        let mut remaining: Vec<Value> = std::mem::take(&mut self.counts)
            .into_iter()
            .filter(|(_, count)| *count > 0)
            .map(|(key, _)| key)
            .collect();
        remaining.extend(std::mem::take(&mut self.ready));
        remaining
    }
}

/// Fires everything once, at source exhaustion.
#[derive(Default)]
pub struct EndOfStreamTrigger {
    keys: BTreeSet<Value>,
}

impl Trigger for EndOfStreamTrigger {
    fn record_received(&mut self, key: &Value, _event_time: DateTime<Utc>) {
        self.keys.insert(key.clone());
    }

    fn watermark_received(&mut self, _watermark: DateTime<Utc>) {}

    fn poll(&mut self) -> Vec<Value> {
        Vec::new()
    }

    fn end_of_stream(&mut self) -> Vec<Value> {
        std::mem::take(&mut self.keys).into_iter().collect()
    }
}
