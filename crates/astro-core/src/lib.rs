//! `astro-core`
//!
//! Shared building blocks for astro-daq device drivers.
//!
//! Every driver in the workspace is assembled from the same pieces:
//!
//! - [`property`]: the property store that clients observe and mutate
//! - [`timer`]: per-endpoint dispatch queues and cancellable, reschedulable timers
//! - [`connection`]: reference-counted physical handles and the CONNECTION state machine
//! - [`operation`]: the start / poll / complete pattern behind exposures, wheel moves
//!   and guide pulses
//! - [`capabilities`]: one trait per hardware capability
//! - [`classes`]: generic CCD, guider and filter-wheel endpoints built on the above
//! - [`driver`]: driver factories and the components they produce
//!
//! ## Example
//!
//! ```rust,ignore
//! use astro_core::property::MemoryPropertyStore;
//! use astro_core::timer::Scheduler;
//! use astro_core::driver::DriverContext;
//!
//! let store = std::sync::Arc::new(MemoryPropertyStore::new());
//! let context = DriverContext::new(store.clone(), Scheduler::new());
//! let mut events = store.subscribe();
//! // hand `context` to a DriverFactory, then watch `events`
//! ```

pub mod capabilities;
pub mod classes;
pub mod connection;
pub mod driver;
pub mod endpoint;
pub mod error;
pub mod lock;
pub mod mock_serial;
pub mod operation;
pub mod property;
pub mod serial;
pub mod timer;

pub use endpoint::{Endpoint, EndpointContext, EndpointKind, PropertyChange};
pub use error::{AppResult, AstroError};
pub use property::{MemoryPropertyStore, Property, PropertyState, PropertyStore};
pub use timer::{DispatchQueue, Scheduler, TimerAction, TimerHandle};
