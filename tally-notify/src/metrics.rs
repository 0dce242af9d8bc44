use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

use tally_shared::Channel;

/// Delivery counters, registered on a registry owned by the caller so tests
/// and multiple dispatchers never collide on the process-global one.
#[derive(Clone)]
pub struct DispatcherMetrics {
    attempts: IntCounterVec,
    dead_letters: IntCounterVec,
}

impl DispatcherMetrics {
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let attempts = IntCounterVec::new(
            Opts::new("notification_attempts_total", "Notification delivery attempts"),
            &["channel", "outcome"],
        )?;
        let dead_letters = IntCounterVec::new(
            Opts::new("notification_dead_letters_total", "Notification jobs moved to the dead-letter queue"),
            &["channel"],
        )?;

        registry.register(Box::new(attempts.clone()))?;
        registry.register(Box::new(dead_letters.clone()))?;

        Ok(Self { attempts, dead_letters })
    }

    pub fn attempt(&self, channel: Channel, outcome: &str) {
        self.attempts.with_label_values(&[channel.as_str(), outcome]).inc();
    }

    pub fn dead_lettered(&self, channel: Channel) {
        self.dead_letters.with_label_values(&[channel.as_str()]).inc();
    }

    pub fn attempts_for(&self, channel: Channel, outcome: &str) -> u64 {
        self.attempts.with_label_values(&[channel.as_str(), outcome]).get()
    }
}

/// Text exposition of everything in `registry`.
pub fn render(registry: &Registry) -> Result<String, prometheus::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
