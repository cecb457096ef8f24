//! Request scheduling and atomic application of drawing updates.
//!
//! Requests go out one at a time from a FIFO queue. Responses that carry
//! drawing content are folded into a session workspace and only reach the
//! visible model once the whole related group has arrived.

pub mod dispatcher;
pub mod navigation;
pub mod pending;
pub mod policy;
pub mod queue;
pub mod refresh;
pub mod request;
pub mod session;

pub use dispatcher::{Dispatch, SyncCore};
pub use navigation::NavigationStack;
pub use pending::{PendingResponse, PendingResponses};
pub use policy::SessionClass;
pub use queue::{Enqueued, RequestQueue};
pub use refresh::{RefreshGate, RefreshScheduler, ScheduleDecision};
pub use request::{Request, RequestId, RequestKind, TouchZoneInfo};
pub use session::{Session, SessionTracker};
