//! Local database storage: the on-disk codec for backups
//! (`dbfile`), the append-only archive sink for deleted/archived records
//! (`archive`), and the cross-conduit preference cache (`prefcache`).

pub mod archive;
pub mod dbfile;
pub mod prefcache;

pub use archive::{ArchiveEntry, ArchiveError, ArchiveFile, ArchiveHeader, ArchiveRecordType};
pub use dbfile::{read, write, DbContents, DbFileError, LocalDatabase};
pub use prefcache::{PrefKey, PrefValue, PreferenceCache};
