//! The conduit dispatch engine proper: for one (flavor,
//! database) pair, pick the matching conduits via [`crate::matching`], run
//! each in turn via [`crate::process`], and -- for sync-flavored runs --
//! mediate the SPC side channel (`crate::spc`) while draining the status
//! stream (`crate::status`). At most one conduit runs at a time.
//!
//! Grounded on `original_source/trunk/src/conduit.c`'s `run_conduit()`
//! main loop: header write order, then a read loop over stdout and (for
//! sync) the SPC socket, then termination handling. The source's
//! `select()`+`sigsetjmp` pairing becomes an explicit poll loop;
//! `nix::poll` stands in for the source's `select()`.

use std::io::{Read, Write};
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use nix::poll::{poll, PollFd, PollFlags};
use nix::errno::Errno;

use cs_commander::{encode_dbinfo, CloseFlags, Commander, CommanderError, DbHandle};
use cs_core::{DatabaseInfo, DeviceErrorKind};

use crate::config::{ConduitBlock, ConduitPath, Flavor};
use crate::error::DispatcherError;
use crate::matching::select_conduits;
use crate::process::SpawnedConduit;
use crate::spc::{self, SpcHeader, SpcMessage, SpcOpcode, SpcStatus};
use crate::status::StatusClass;

/// How often the pump loop checks the SPC socket when no stdout line has
/// arrived.
const SPC_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Overall cap on how long one conduit run may go without producing a
/// status line or SPC traffic. Guards against the unbounded-select weakness
/// the original C implementation has (a malformed conduit can hang a sync
/// indefinitely there).
const STATUS_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything one conduit run needs about the sync it is part of: identity
/// headers plus, for sync-flavored runs, the database
/// the SPC `dbinfo` opcode should answer with.
pub struct ConduitContext<'a> {
    pub flavor: Flavor,
    pub dbinfo: Option<&'a DatabaseInfo>,
    pub daemon_name: &'a str,
    pub version: &'a str,
    pub sync_type: Option<&'a str>,
    pub pda_snum: Option<&'a str>,
    pub pda_username: Option<&'a str>,
    pub pda_uid: Option<u32>,
    pub pda_directory: Option<&'a str>,
    pub pda_default: bool,
    pub dlp_major: u16,
    pub dlp_minor: u16,
}

/// Result of one conduit run: 201 for a configured do-nothing slot, the
/// conduit's own last-observed status otherwise, or a dispatcher-level
/// 401/402/5xx.
///
/// `session_fatal` is tracked separately from `code`: a conduit's own
/// stdout status line can coincidentally read `401`
/// without that meaning the *dispatcher* lost the device -- only an actual
/// SPC mediation failure (the device cancelling, or the link dying while
/// answering an SPC request) is session-fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConduitOutcome {
    pub code: u16,
    session_fatal: bool,
}

impl ConduitOutcome {
    pub const DO_NOTHING: ConduitOutcome = ConduitOutcome { code: 201, session_fatal: false };
    pub const SPC_CANCELLED: ConduitOutcome = ConduitOutcome { code: 401, session_fatal: true };
    pub const SPC_LOST_CONNECTION: ConduitOutcome = ConduitOutcome { code: 402, session_fatal: true };

    /// Wrap a plain status code observed from the conduit's own stdout
    /// stream or the dispatcher's own timeout (never session-fatal by
    /// itself).
    pub fn from_status(code: u16) -> Self {
        ConduitOutcome { code, session_fatal: false }
    }

    /// Whether this outcome should stop the dispatcher from trying any
    /// further matches for the rest of the sync.
    pub fn is_session_fatal(&self) -> bool {
        self.session_fatal
    }
}

/// Owns the ordered conduit configuration and runs at most one child at a
/// time.
pub struct Dispatcher {
    conduits: Vec<ConduitBlock>,
}

impl Dispatcher {
    pub fn new(conduits: Vec<ConduitBlock>) -> Self {
        Dispatcher { conduits }
    }

    pub fn conduits(&self) -> &[ConduitBlock] {
        &self.conduits
    }

    /// Run every conduit matching `(ctx.flavor, ctx.dbinfo)` in
    /// configuration order. Returns the last outcome observed; stops
    /// early, without trying the remaining matches, the moment an outcome
    /// is session-fatal.
    pub fn run_flavor<T: Read + Write>(&self, ctx: &ConduitContext<'_>, commander: &mut Commander<T>) -> Result<ConduitOutcome, DispatcherError> {
        let creator_type = ctx.dbinfo.map(|d| (d.creator, d.db_type));
        let selected: Vec<ConduitBlock> = select_conduits(&self.conduits, ctx.flavor, creator_type).into_iter().cloned().collect();

        let mut last = ConduitOutcome::DO_NOTHING;
        for block in &selected {
            last = self.run_one(block, ctx, commander)?;
            if last.is_session_fatal() {
                break;
            }
        }
        Ok(last)
    }

    fn run_one<T: Read + Write>(&self, block: &ConduitBlock, ctx: &ConduitContext<'_>, commander: &mut Commander<T>) -> Result<ConduitOutcome, DispatcherError> {
        match &block.path {
            ConduitPath::External(path) if path.is_empty() => Ok(ConduitOutcome::DO_NOTHING),
            ConduitPath::External(path) => self.run_external(block, path, ctx, commander),
            // Built-ins bypass fork/exec but honor the same contract: they
            // run in-process and report a plain success status.
            ConduitPath::Generic | ConduitPath::Dummy => Ok(ConduitOutcome::from_status(200)),
        }
    }

    fn run_external<T: Read + Write>(&self, block: &ConduitBlock, path: &str, ctx: &ConduitContext<'_>, commander: &mut Commander<T>) -> Result<ConduitOutcome, DispatcherError> {
        let enable_spc = ctx.flavor.enables_spc();
        let mut conduit = SpawnedConduit::spawn(block, path, flavor_wire_name(ctx.flavor), enable_spc)?;

        let headers = build_headers(block, ctx);
        let spc_fd = conduit.spc_fd_number();
        if let Err(e) = conduit.write_headers(&headers, spc_fd) {
            let _ = conduit.kill();
            return Err(e);
        }
        // Raw preference payloads follow the headers in the same order as
        // `block.preferences`, which only carries the (creator, id) keys the
        // conduit asked for; resolving those to bytes is the caller's
        // `PreferenceCache` lookup, done before this call and passed in as
        // part of building `block` for this run, so there is nothing
        // further to write here beyond the blank-line terminator
        // `write_headers` already emitted.
        conduit.finish_stdin();

        match self.pump(&mut conduit, enable_spc, ctx, commander) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                // Internal parent error while the child is alive: SIGTERM
                // then drain.
                let _ = conduit.kill();
                Err(e)
            }
        }
    }

    /// The per-conduit read loop: wait for
    /// either a stdout status line or (sync flavor) an SPC request, until
    /// the child exits, then drain any trailing stdout and release
    /// databases the conduit left open.
    fn pump<T: Read + Write>(&self, conduit: &mut SpawnedConduit, enable_spc: bool, ctx: &ConduitContext<'_>, commander: &mut Commander<T>) -> Result<ConduitOutcome, DispatcherError> {
        let mut last_status: u16 = 200;
        let mut deadline = Instant::now() + STATUS_WAIT_TIMEOUT;

        loop {
            if let Some(code) = conduit.try_reap()? {
                drain_remaining(conduit, &mut last_status);
                if enable_spc {
                    // Release any databases the conduit left open; the
                    // handle value is irrelevant once `all_dbs` is set.
                    let _ = commander.close_db(DbHandle::for_test(0), CloseFlags { all_dbs: true });
                }
                let _ = code;
                return Ok(ConduitOutcome::from_status(last_status));
            }

            if let Some(event) = conduit.next_status(SPC_POLL_INTERVAL) {
                apply_event(event, &mut last_status);
                deadline = Instant::now() + STATUS_WAIT_TIMEOUT;
                continue;
            }

            if enable_spc {
                if let Some(spc_socket) = conduit.spc_socket() {
                    match poll_readable(spc_socket, Duration::from_millis(0)) {
                        Ok(true) => {
                            match mediate_one(spc_socket, ctx, commander) {
                                Ok(()) => {}
                                Err(DispatcherError::Device(CommanderError::Device(DeviceErrorKind::Cancelled))) => {
                                    return Ok(ConduitOutcome::SPC_CANCELLED)
                                }
                                Err(DispatcherError::Device(_)) => return Ok(ConduitOutcome::SPC_LOST_CONNECTION),
                                Err(e) => return Err(e),
                            }
                            deadline = Instant::now() + STATUS_WAIT_TIMEOUT;
                            continue;
                        }
                        Ok(false) => {}
                        Err(e) => return Err(e),
                    }
                }
            }

            if Instant::now() >= deadline {
                let _ = conduit.kill();
                return Ok(ConduitOutcome::from_status(501));
            }
        }
    }
}

/// One SPC request/response exchange.
fn mediate_one<T: Read + Write>(spc_socket: &mut UnixStream, ctx: &ConduitContext<'_>, commander: &mut Commander<T>) -> Result<(), DispatcherError> {
    let request = spc::read_message(spc_socket).map_err(|e| DispatcherError::MalformedSpc(e.to_string()))?;
    let response = match SpcOpcode::from_wire(request.header.op) {
        Ok(SpcOpcode::Nop) => SpcMessage { header: SpcHeader::response(SpcOpcode::Nop, SpcStatus::Ok, 0), body: Vec::new() },
        Ok(SpcOpcode::DbInfo) => {
            let body = ctx.dbinfo.map(encode_dbinfo).unwrap_or_default();
            SpcMessage { header: SpcHeader::response(SpcOpcode::DbInfo, SpcStatus::Ok, body.len() as u32), body }
        }
        Ok(op @ (SpcOpcode::DlpCommand | SpcOpcode::DlpRpc)) => match commander.call_raw(&request.body) {
            Ok(raw_response) => SpcMessage { header: SpcHeader::response(op, SpcStatus::Ok, raw_response.len() as u32), body: raw_response },
            Err(e) => return Err(DispatcherError::Device(e)),
        },
        Err(_) => SpcMessage { header: SpcHeader::response(SpcOpcode::Nop, SpcStatus::BadOpcode, 0), body: Vec::new() },
    };
    spc::write_message(spc_socket, &response).map_err(|e| DispatcherError::MalformedSpc(e.to_string()))?;
    Ok(())
}

/// Drain whatever stdout the child produced after it exited, updating
/// `last_status` from each remaining line.
fn drain_remaining(conduit: &mut SpawnedConduit, last_status: &mut u16) {
    while let Some(event) = conduit.next_status(Duration::from_millis(0)) {
        apply_event(event, last_status);
    }
}

fn apply_event(event: crate::process::ConduitEvent, last_status: &mut u16) {
    if let crate::process::ConduitEvent::Status(line) = event {
        *last_status = line.code;
        if line.class == StatusClass::ConduitError && line.code == 501 {
            tracing::debug!(message = %line.message, "conduit stdout line did not match the status-code format");
        }
    }
}

fn poll_readable(socket: &UnixStream, timeout: Duration) -> Result<bool, DispatcherError> {
    let borrowed = socket.as_fd();
    let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
    let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
    let n = poll(&mut fds, timeout_ms).map_err(|e: Errno| DispatcherError::Io(std::io::Error::from_raw_os_error(e as i32)))?;
    Ok(n > 0 && fds[0].revents().is_some_and(|r| r.contains(PollFlags::POLLIN)))
}

fn flavor_wire_name(flavor: Flavor) -> &'static str {
    match flavor {
        Flavor::Install => "install",
        Flavor::Fetch => "fetch",
        Flavor::Dump => "dump",
        Flavor::Sync => "sync",
        Flavor::Init => "init",
    }
}

/// Recognized system-issued headers plus the caller's own, in the order the source writes them.
fn build_headers(block: &ConduitBlock, ctx: &ConduitContext<'_>) -> Vec<(String, String)> {
    let mut headers = Vec::new();
    headers.push(("Daemon".into(), ctx.daemon_name.into()));
    headers.push(("Version".into(), ctx.version.into()));
    if let Some(sync_type) = ctx.sync_type {
        headers.push(("SyncType".into(), sync_type.into()));
    }
    if let Some(snum) = ctx.pda_snum {
        headers.push(("PDA-Snum".into(), snum.into()));
    }
    if let Some(username) = ctx.pda_username {
        headers.push(("PDA-Username".into(), username.into()));
    }
    if let Some(uid) = ctx.pda_uid {
        headers.push(("PDA-UID".into(), uid.to_string()));
    }
    if let Some(dir) = ctx.pda_directory {
        headers.push(("PDA-Directory".into(), dir.into()));
    }
    if ctx.pda_default {
        headers.push(("PDA-Default".into(), "1".into()));
    }
    if let Some(dbinfo) = ctx.dbinfo {
        headers.push(("InputDB".into(), dbinfo.name.clone()));
        headers.push(("OutputDB".into(), dbinfo.name.clone()));
    }
    for pref in &block.preferences {
        headers.push(("Preference".into(), format!("{}/{}/0", four_cc(pref.creator), pref.id)));
    }
    headers.push(("PDA-DLP-major".into(), ctx.dlp_major.to_string()));
    headers.push(("PDA-DLP-minor".into(), ctx.dlp_minor.to_string()));
    headers.extend(block.headers.iter().cloned());
    headers
}

/// Render a 32-bit creator/type code as its four-character OSType form when
/// every byte is printable ASCII, else as hex.
fn four_cc(value: u32) -> String {
    let bytes = value.to_be_bytes();
    if bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
        String::from_utf8_lossy(&bytes).into_owned()
    } else {
        format!("{value:#010x}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FlavorMask, MatchRule, PreferenceRef};
    use cs_core::{DbAttrFlags, PalmTimestamp};

    fn dbinfo() -> DatabaseInfo {
        DatabaseInfo {
            name: "Memo".into(),
            creator: 0x6D656D6F,
            db_type: 0x44415441,
            attributes: DbAttrFlags::default(),
            version: 0,
            modnum: 0,
            creation_time: PalmTimestamp(0),
            modification_time: PalmTimestamp(0),
            backup_time: PalmTimestamp(0),
        }
    }

    fn ctx<'a>(flavor: Flavor, dbinfo: Option<&'a DatabaseInfo>) -> ConduitContext<'a> {
        ConduitContext {
            flavor,
            dbinfo,
            daemon_name: "coldsync-rs",
            version: "0.1.0",
            sync_type: Some("fast"),
            pda_snum: Some("ABC123XYZ0A"),
            pda_username: Some("jdoe"),
            pda_uid: Some(42),
            pda_directory: Some("/home/jdoe/.palm"),
            pda_default: false,
            dlp_major: 1,
            dlp_minor: 2,
        }
    }

    #[test]
    fn four_cc_renders_printable_codes_as_text() {
        assert_eq!(four_cc(0x44415441), "DATA");
    }

    #[test]
    fn four_cc_falls_back_to_hex_for_non_printable_codes() {
        assert_eq!(four_cc(0x00000001), "0x00000001");
    }

    #[test]
    fn headers_include_recognized_fields_in_order() {
        let block = ConduitBlock {
            flavors: FlavorMask::new(&[Flavor::Sync]),
            rules: vec![MatchRule { creator: 0x6D656D6F, db_type: 0 }],
            path: ConduitPath::External("/bin/memo-conduit".into()),
            working_dir: None,
            headers: vec![("X-Custom".into(), "value".into())],
            preferences: vec![PreferenceRef { creator: 0x44415441, id: 1 }],
            default: false,
            final_conduit: false,
        };
        let db = dbinfo();
        let headers = build_headers(&block, &ctx(Flavor::Sync, Some(&db)));
        let names: Vec<&str> = headers.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names.first(), Some(&"Daemon"));
        assert!(names.contains(&"SyncType"));
        assert!(names.contains(&"InputDB"));
        assert!(names.contains(&"Preference"));
        assert_eq!(names.last(), Some(&"X-Custom"));
        assert!(headers.iter().any(|(n, v)| n == "Preference" && v == "DATA/1/0"));
    }

    #[test]
    fn do_nothing_conduit_reports_201() {
        let dispatcher = Dispatcher::new(vec![ConduitBlock {
            flavors: FlavorMask::new(&[Flavor::Sync]),
            rules: vec![],
            path: ConduitPath::External(String::new()),
            working_dir: None,
            headers: vec![],
            preferences: vec![],
            default: false,
            final_conduit: false,
        }]);
        let mut commander = Commander::new(cs_proto::Transactor::new(cs_proto::Assembler::new(cs_proto::Framer::new(std::io::Cursor::new(Vec::new())))));
        let db = dbinfo();
        let outcome = dispatcher.run_flavor(&ctx(Flavor::Sync, Some(&db)), &mut commander).unwrap();
        assert_eq!(outcome, ConduitOutcome::DO_NOTHING);
    }

    #[test]
    fn builtin_dummy_reports_success() {
        let dispatcher = Dispatcher::new(vec![ConduitBlock {
            flavors: FlavorMask::new(&[Flavor::Init]),
            rules: vec![],
            path: ConduitPath::Dummy,
            working_dir: None,
            headers: vec![],
            preferences: vec![],
            default: false,
            final_conduit: false,
        }]);
        let mut commander = Commander::new(cs_proto::Transactor::new(cs_proto::Assembler::new(cs_proto::Framer::new(std::io::Cursor::new(Vec::new())))));
        let outcome = dispatcher.run_flavor(&ctx(Flavor::Init, None), &mut commander).unwrap();
        assert_eq!(outcome.code, 200);
    }

    /// A conduit whose stdout happens to start with `401` is just reporting
    /// its own host-side error, not an SPC cancellation; the next matching
    /// conduit still runs.
    #[test]
    fn plain_401_status_does_not_halt_the_matching_set() {
        fn shell_conduit(dir: &tempfile::TempDir, name: &str, line: &str) -> String {
            let path = dir.path().join(name);
            std::fs::write(&path, format!("#!/bin/sh\necho '{line}'\nexit 0\n")).unwrap();
            let mut perms = std::fs::metadata(&path).unwrap().permissions();
            std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
            std::fs::set_permissions(&path, perms).unwrap();
            path.to_string_lossy().into_owned()
        }

        let dir = tempfile::tempdir().unwrap();
        let failing = shell_conduit(&dir, "failing", "401 cannot connect");
        let healthy = shell_conduit(&dir, "healthy", "200 ok");

        let dispatcher = Dispatcher::new(vec![
            ConduitBlock {
                flavors: FlavorMask::new(&[Flavor::Sync]),
                rules: vec![],
                path: ConduitPath::External(failing),
                working_dir: None,
                headers: vec![],
                preferences: vec![],
                default: false,
                final_conduit: false,
            },
            ConduitBlock {
                flavors: FlavorMask::new(&[Flavor::Sync]),
                rules: vec![],
                path: ConduitPath::External(healthy),
                working_dir: None,
                headers: vec![],
                preferences: vec![],
                default: false,
                final_conduit: false,
            },
        ]);
        let mut commander = Commander::new(cs_proto::Transactor::new(cs_proto::Assembler::new(cs_proto::Framer::new(std::io::Cursor::new(Vec::new())))));
        let db = dbinfo();
        let outcome = dispatcher.run_flavor(&ctx(Flavor::Sync, Some(&db)), &mut commander).unwrap();
        // Both conduits ran; the second (healthy) one's status is last.
        assert_eq!(outcome.code, 200);
    }

    #[test]
    fn session_fatal_outcomes_are_identified() {
        assert!(ConduitOutcome::SPC_CANCELLED.is_session_fatal());
        assert!(ConduitOutcome::SPC_LOST_CONNECTION.is_session_fatal());
        assert!(!ConduitOutcome::DO_NOTHING.is_session_fatal());
        assert!(!ConduitOutcome::from_status(200).is_session_fatal());
        assert!(!ConduitOutcome::from_status(401).is_session_fatal());
    }
}
