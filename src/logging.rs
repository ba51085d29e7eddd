use log::Level;
use parking_lot::Mutex;

/// Receives leveled events from the components; never interprets them.
pub trait LogSink: Send + Sync {
    fn log(&self, level: Level, message: &str);
}

/// Forwards every event to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogCrateSink;

impl LogSink for LogCrateSink {
    fn log(&self, level: Level, message: &str) {
        log::log!(target: "ct_icp", level, "{}", message);
    }
}

/// Keeps events in memory, handy to inspect what a run reported.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<(Level, String)>>,
}

impl MemorySink {
    pub fn events(&self) -> Vec<(Level, String)> {
        self.events.lock().clone()
    }

    pub fn count(&self, level: Level) -> usize {
        self.events.lock().iter().filter(|(l, _)| *l == level).count()
    }
}

impl LogSink for MemorySink {
    fn log(&self, level: Level, message: &str) {
        self.events.lock().push((level, message.to_owned()));
    }
}
