//! Command opcodes: one opcode per typed Commander operation.
//! Request and response share an opcode; the Transactor's top response bit
//! (set on the wire, stripped by `decode_response`) is how a peer tells them
//! apart, not a separate number space here.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    ReadUserInfo = 1,
    ReadSysInfo = 2,
    ReadStorageInfo = 3,
    ReadDbList = 4,
    OpenDb = 5,
    CloseDb = 6,
    CreateDb = 7,
    DeleteDb = 8,
    ReadNextModifiedRec = 9,
    ReadRecordById = 10,
    WriteRecord = 11,
    DeleteRecord = 12,
    WriteResource = 13,
    DeleteResource = 14,
    ReadAppInfoBlock = 15,
    WriteAppInfoBlock = 16,
    ReadSortBlock = 17,
    WriteSortBlock = 18,
    OpenConduit = 19,
    CleanUpDatabase = 20,
    ResetSyncFlags = 21,
    WriteUserInfo = 22,
    EndOfSync = 23,
    AddSyncLog = 24,
    /// Real DLP opcode (`DlpReadRecordByIndex`), needed by FirstSync/
    /// SlowSync's "download every record" step; recovered from
    /// `original_source/`.
    ReadRecordByIndex = 25,
    /// Real DLP opcode (`DlpReadResourceByIndex`), needed for the wholesale
    /// download of a resource database on first encounter.
    ReadResourceByIndex = 26,
}

impl Command {
    pub fn opcode(self) -> u8 {
        self as u8
    }
}
