#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations)]

#[macro_use]
pub(crate) mod util;

pub mod blocking;
pub mod chan;
pub mod config;
pub mod future;
pub mod scheduler;
pub mod select;
pub mod task;

#[doc(inline)]
pub use self::blocking::{Blocking, BlockingError};
#[doc(inline)]
pub use self::chan::{Chan, RecvError, SendError, TryRecvError, TrySendError};
#[doc(inline)]
pub use self::config::Config;
#[doc(inline)]
pub use self::future::yield_now;
#[doc(inline)]
pub use self::scheduler::{Drained, RunError, Scheduler, Tick};
#[doc(inline)]
pub use self::select::Select;
#[doc(inline)]
pub use self::task::{JoinError, JoinHandle, TaskId, TaskRef};
