#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![cfg_attr(docsrs, doc(cfg_hide(docsrs, loom)))]
#![warn(missing_docs, missing_debug_implementations)]

pub(crate) mod loom;

#[macro_use]
pub(crate) mod util;

pub mod cond;
pub mod mutex;
pub mod once;
pub mod rwlock;
pub mod semaphore;
pub mod wait_group;

#[doc(inline)]
pub use self::cond::Cond;
#[doc(inline)]
pub use self::mutex::{Mutex, MutexGuard, RawMutex};
#[doc(inline)]
pub use self::once::Once;
#[doc(inline)]
pub use self::rwlock::{RawRwLock, RwLock, RwLockReadGuard, RwLockWriteGuard};
#[doc(inline)]
pub use self::semaphore::Semaphore;
#[doc(inline)]
pub use self::wait_group::WaitGroup;
