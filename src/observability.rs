use biometrics::{Collector, Counter, Moments};

pub(crate) static TURNS: Counter = Counter::new("parley.turn.started");
pub(crate) static TURN_ERRORS: Counter = Counter::new("parley.turn.errors");
pub(crate) static TURN_TIMEOUTS: Counter = Counter::new("parley.turn.timeouts");
pub(crate) static TURN_CANCELLATIONS: Counter = Counter::new("parley.turn.cancellations");
pub(crate) static TURN_DURATION: Moments = Moments::new("parley.turn.duration_seconds");

pub(crate) static STREAM_CHUNKS: Counter = Counter::new("parley.stream.chunks");
pub(crate) static STREAM_BYTES: Counter = Counter::new("parley.stream.bytes");
pub(crate) static STREAM_RECORDS: Counter = Counter::new("parley.stream.records");
pub(crate) static STREAM_RECORDS_SKIPPED: Counter = Counter::new("parley.stream.records_skipped");

pub(crate) static SESSIONS_CREATED: Counter = Counter::new("parley.session.created");
pub(crate) static SESSIONS_REMOVED: Counter = Counter::new("parley.session.removed");
pub(crate) static SESSION_REMOTE_ERRORS: Counter = Counter::new("parley.session.remote_errors");
pub(crate) static SUMMARIES: Counter = Counter::new("parley.session.summaries");

/// Register this crate's biometrics with the provided collector.
pub fn register_biometrics(collector: Collector) {
    collector.register_counter(&TURNS);
    collector.register_counter(&TURN_ERRORS);
    collector.register_counter(&TURN_TIMEOUTS);
    collector.register_counter(&TURN_CANCELLATIONS);
    collector.register_moments(&TURN_DURATION);

    collector.register_counter(&STREAM_CHUNKS);
    collector.register_counter(&STREAM_BYTES);
    collector.register_counter(&STREAM_RECORDS);
    collector.register_counter(&STREAM_RECORDS_SKIPPED);

    collector.register_counter(&SESSIONS_CREATED);
    collector.register_counter(&SESSIONS_REMOVED);
    collector.register_counter(&SESSION_REMOTE_ERRORS);
    collector.register_counter(&SUMMARIES);
}
