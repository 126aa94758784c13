//! Time-based session policy: hard-max, reservation expiry, orphan-grace
//! and stuck-session checks, plus the shared destroy-session interface (C4,
//! §4.4 and §4.6).

#![forbid(unsafe_code)]

pub mod destroyer;
pub mod manager;

pub use destroyer::{DestroyError, Destroyer};
pub use manager::{LifecycleConfig, LifecycleError, LifecycleManager, NowFn, TickReport};
