//! Presentation events for running debates
//!
//! The coordinator publishes every observable step of a debate (status
//! changes, streamed chunks, finalized responses, assessments,
//! notifications, the verdict) on a broadcast [`EventBus`]. Renderers
//! subscribe, optionally through an [`EventFilter`].
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │ Coordinator  │────▶│  Event Bus   │────▶│  Subscribers │
//! │  (publish)   │     │  (broadcast) │     │   (recv)     │
//! └──────────────┘     └──────────────┘     └──────────────┘
//! ```

pub mod bus;
pub mod types;

pub use bus::{EventBus, EventBusExt, EventFilter, FilteredReceiver, SharedEventBus};
pub use types::{DebateEvent, NotificationLevel};
