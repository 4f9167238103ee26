//! Background location reporting.
//!
//! A [`LocationTracker`] samples a [`PositionProvider`] on a timer, filters
//! out samples that did not move far enough, and submits the rest through a
//! [`LocationSink`]. Samples that cannot be delivered wait in a bounded
//! [`PendingQueue`] until a later replay succeeds.

mod geo;
mod provider;
mod queue;
mod tracker;

pub use geo::{classify, haversine_meters, Displacement, Position, EARTH_RADIUS_METERS};
pub use provider::{FilePositionSource, LocationSink, Permission, PositionProvider, StaticPosition};
pub use queue::{PendingLocationSample, PendingQueue, ReplayReport, DEFAULT_CAPACITY, PENDING_KEY};
pub use tracker::{LocationTracker, ReportedSample, TickOutcome, TrackerSettings, TrackerStatus};
