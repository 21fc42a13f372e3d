//! Typed command interface, session lifecycle, and device snapshot layered
//! over `cs_proto`'s Transactor.

pub mod commander;
pub mod infostore;
pub mod opcodes;
pub mod session;
pub mod types;
mod wire;

pub use commander::{encode_dbinfo, Commander, CommanderError};
pub use infostore::InfoStore;
pub use opcodes::Command;
pub use session::{Session, SessionError, SessionState};
pub use types::{
    CloseFlags, DbHandle, DeleteRecordFlags, DbListEntry, EndOfSyncStatus, OpenMode, RecordInfo, RecordPayload,
    StorageInfo, SysInfo, UserInfo, UserInfoModifyMask,
};
