//! Warden - Request Rate Limiting Engine
//!
//! Decides per request whether a client may proceed, based on its resolved
//! identity, the endpoint class being hit and that class's policy. Repeat
//! offenders are escalated to temporary blocks. State lives behind a counter
//! store that is either in-process or shared through Redis, so several
//! instances can enforce one set of limits.

pub mod clock;
pub mod config;
pub mod error;
pub mod identity;
pub mod monitor;
pub mod ratelimit;
pub mod store;
