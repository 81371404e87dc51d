//! Convenience re-exports of the public API surface.

pub use crate::beacon::{Ap, Beacon, BeaconType, Cell};
pub use crate::cache::{CacheStore, Cacheline};
pub use crate::config::{Config, OptionField, Override};
pub use crate::error::{Error, Finalize, Result};
pub use crate::gnss::Gnss;
pub use crate::location::{Location, LocationStatus, Source};
pub use crate::plugin::chain::PluginChain;
pub use crate::rand::RandomSource;
pub use crate::rctx::{ApScan, CellScan, Rctx};
pub use crate::session::{AuthState, Credentials, Session};
pub use crate::timer::Clock;
