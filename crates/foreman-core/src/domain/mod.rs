//! Domain model (IDs, specs, requests, constraints, backoff, ...).
//!
//! ここにある型は I/O を持たず、store・processor・scheduler から共有されます。

pub mod backoff;
pub mod constraints;
pub mod data;
pub mod ids;
pub mod info;
pub mod policy;
pub mod request;
pub mod spec;
pub mod state;

pub use self::backoff::{
    BackoffPolicy, DEFAULT_BACKOFF_DELAY, MAX_BACKOFF, MIN_BACKOFF, MIN_PERIODIC_FLEX,
    MIN_PERIODIC_INTERVAL,
};
pub use self::constraints::{Constraints, NetworkType, TimeWindow};
pub use self::data::{Data, DataTooLarge, InputMerger, MAX_DATA_BYTES};
pub use self::ids::{ParseIdError, WorkId};
pub use self::info::WorkInfo;
pub use self::policy::{ExistingPeriodicWorkPolicy, ExistingWorkPolicy};
pub use self::request::{WorkRequest, WorkRequestBuilder};
pub use self::spec::{Periodicity, WorkSpec};
pub use self::state::WorkState;
