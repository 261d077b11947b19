//! Launch-geometry tuning: parameter tables, timers and the tuner itself.

mod store;
mod timer;
mod tuner;

pub use store::{InMemoryTuningStore, JsonFileTuningStore, TuningStore};
pub use timer::{ProfilingTimer, Timer};
pub use tuner::{Tuner, QUEUE_WINDOW_KEY};
