// Domain layer - timetable model and reminder engine
pub mod alert;
pub mod clock;
pub mod identity;
pub mod projector;
pub mod reminder;
pub mod timetable;

// Persistence and per-user state
pub mod session;
pub mod store;

// Timer tasks and HTTP surface
pub mod api;
pub mod runtime;

pub use alert::{Alert, AlertBoard, AlertDispatcher};
pub use projector::{next_occurrence, Occurrence};
pub use reminder::{FiredEventSet, ReminderController, ReminderKey, ReminderState};
pub use runtime::{RuntimeConfig, TimetableService};
pub use session::Session;
pub use timetable::{Entry, EventKind, NewEntry};
