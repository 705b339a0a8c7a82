//! Sliding window counting and rate limit decisions.

mod clock;
mod keyed;
mod limiter;
mod local;
mod shared;
mod window;

pub use clock::{Clock, ManualClock, SystemClock};
pub use keyed::{window_key, DynLimiter, KeyedLimiter, WindowFactory, GLOBAL_SUBJECT};
pub use limiter::{Limiter, SimpleLimiter};
pub use local::LocalWindow;
pub use shared::{lock_name, SharedWindow, DEFAULT_WINDOW_KEY};
pub use window::{Window, WindowConfig};
