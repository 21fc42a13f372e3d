//! The conduit dispatch engine: conduit configuration shapes
//! (`config`), flavor/database matching (`matching`), process spawn and
//! header/status-stream handling (`process`, `status`), the SPC
//! side-channel codec (`spc`), and the `Dispatcher` that ties them
//! together for one flavor at a time.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod matching;
pub mod process;
pub mod spc;
pub mod status;

pub use config::{ConduitBlock, ConduitPath, Flavor, FlavorMask, MatchRule, PreferenceRef};
pub use dispatcher::{ConduitContext, ConduitOutcome, Dispatcher};
pub use error::DispatcherError;
pub use matching::select_conduits;
pub use process::{ConduitEvent, SpawnedConduit};
pub use spc::{SpcError, SpcHeader, SpcMessage, SpcOpcode, SpcState, SpcStatus};
pub use status::{parse_status_line, StatusClass, StatusLine};
