//! The sync orchestration loop: bring up
//! the [`cs_commander::Session`], snapshot the device into an
//! [`cs_commander::InfoStore`], run `init`/`fetch` conduits, reconcile every
//! RAM-resident database (dispatching `sync` conduits around each one),
//! run `dump` conduits, then post the sync log and close the link.
//!
//! A thin driver owning the pieces built elsewhere in the workspace, with
//! no protocol or reconciliation logic of its own.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use cs_commander::{CloseFlags, DbHandle, EndOfSyncStatus, InfoStore, Session, UserInfo, UserInfoModifyMask};
use cs_core::{CancelFlag, CoreError, DatabaseInfo, HostIdentity};
use cs_dispatch::{status::StatusClass, ConduitBlock, ConduitContext, ConduitOutcome, Dispatcher, Flavor};
use cs_proto::{Transport, DEFAULT_NEGOTIATED_RATE};
use cs_sync::{choose_strategy, Reconciler, ReconcilerConfig, SyncStrategy};

/// Static configuration for one sync run.
pub struct SyncConfig {
    pub host: HostIdentity,
    pub daemon_name: String,
    pub version: String,
    pub backup_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub conduits: Vec<ConduitBlock>,
    pub force_slow: bool,
    pub force_fast: bool,
    pub preferred_rate: u32,
    /// Checked between steps that can be safely interrupted; a signal
    /// handler (or any other caller) sets this to request an early,
    /// orderly end to the sync rather than an abrupt abort.
    pub cancel: CancelFlag,
}

impl SyncConfig {
    pub fn new(host: HostIdentity, backup_dir: impl Into<PathBuf>, archive_dir: impl Into<PathBuf>) -> Self {
        SyncConfig {
            host,
            daemon_name: "coldsync-rs".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            backup_dir: backup_dir.into(),
            archive_dir: archive_dir.into(),
            conduits: Vec::new(),
            force_slow: false,
            force_fast: false,
            preferred_rate: DEFAULT_NEGOTIATED_RATE,
            cancel: CancelFlag::new(),
        }
    }
}

/// One database's pass through the loop, folded into the sync log that's
/// uploaded at `end_of_sync`.
#[derive(Debug, Clone)]
pub struct DatabaseOutcome {
    pub name: String,
    pub log_line: String,
    pub failed: bool,
}

/// The overall result of a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Complete,
    Partial,
    Fatal,
}

#[derive(Debug, Clone)]
pub struct SyncReport {
    pub databases: Vec<DatabaseOutcome>,
    pub outcome: Outcome,
}

impl SyncReport {
    pub fn outcome(&self) -> Outcome {
        self.outcome
    }
}

pub struct SyncEngine {
    config: SyncConfig,
}

impl SyncEngine {
    pub fn new(config: SyncConfig) -> Self {
        SyncEngine { config }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Run one full sync against `transport`.
    ///
    /// A session-fatal error partway through stops every remaining per-database step immediately, never
    /// sends `end_of_sync` on the wire, and returns `Outcome::Fatal` without
    /// attempting to upload the sync log -- the link is already gone.
    ///
    /// `config.cancel` is polled at every database/flavor boundary; once
    /// set, the run stops taking on new work and sends `end_of_sync` with
    /// `EndOfSyncStatus::Cancelled` instead of its usual status, closing
    /// whatever the interrupted step left open first. The device can also
    /// request this directly (`DeviceErrorKind::Cancelled`), which reaches
    /// here the same way.
    pub fn run<T: Transport>(&self, transport: T) -> Result<SyncReport, CoreError> {
        let mut session = Session::new(transport).establish(self.config.preferred_rate)?;

        let mut infostore = InfoStore::new();
        {
            let commander = session.commander_mut()?;
            infostore.populate(commander, true)?;
        }
        let ram_only = self.ram_resident_names(&mut session)?;

        let dispatcher = Dispatcher::new(self.config.conduits.clone());
        let (dlp_major, dlp_minor) = infostore.sys_info().map(|s| (s.dlp_major, s.dlp_minor)).unwrap_or((1, 1));
        let serial = infostore.serial_with_checksum();
        let username = infostore.user_name().map(str::to_owned);
        let uid = infostore.user_id();
        let device_last_sync_pc = infostore.last_sync_pc().unwrap_or(0);
        let databases_snapshot: Vec<DatabaseInfo> = infostore.databases().to_vec();

        let reconciler = Reconciler::new(ReconcilerConfig {
            host_id: self.config.host.id(),
            force_slow: self.config.force_slow,
            force_fast: self.config.force_fast,
        });
        let now_unix = now_unix_seconds();

        let mut databases = Vec::new();
        let mut link_dead = false;
        let mut any_failed = false;
        let mut cancelled = false;

        let run_one_flavor = |flavor: Flavor, dbinfo: Option<&DatabaseInfo>, sync_type: Option<&str>, session: &mut Session<T>| {
            let commander = session.commander_mut()?;
            let ctx = ConduitContext {
                flavor,
                dbinfo,
                daemon_name: &self.config.daemon_name,
                version: &self.config.version,
                sync_type,
                pda_snum: serial.as_deref(),
                pda_username: username.as_deref(),
                pda_uid: uid,
                pda_directory: None,
                pda_default: false,
                dlp_major,
                dlp_minor,
            };
            dispatcher.run_flavor(&ctx, commander).map_err(CoreError::from)
        };

        // A cancellation is only honored between steps -- never by
        // interrupting a command already in flight -- so every check below
        // sits at a database or flavor boundary.
        'run: {
            if self.config.cancel.is_set() {
                cancelled = true;
                break 'run;
            }

            // init completes before any fetch, all fetch before any sync, all
            // sync before any dump.
            run_one_flavor(Flavor::Init, None, None, &mut session)?;
            run_one_flavor(Flavor::Fetch, None, None, &mut session)?;
            for db in &databases_snapshot {
                if self.config.cancel.is_set() {
                    cancelled = true;
                    break 'run;
                }
                run_one_flavor(Flavor::Fetch, Some(db), None, &mut session)?;
            }

            'sync_loop: for db in &databases_snapshot {
                if self.config.cancel.is_set() {
                    cancelled = true;
                    break 'sync_loop;
                }

                let backup_path = self.config.backup_dir.join(&db.name);
                let strategy = if db.attributes.resource_db {
                    None
                } else {
                    Some(choose_strategy(
                        backup_path.exists(),
                        device_last_sync_pc,
                        self.config.host.id(),
                        self.config.force_slow,
                        self.config.force_fast,
                    ))
                };
                let sync_type = strategy.map(|s| match s {
                    SyncStrategy::Fast => "fast",
                    SyncStrategy::Slow | SyncStrategy::First => "slow",
                });

                let outcome = run_one_flavor(Flavor::Sync, Some(db), sync_type, &mut session)?;
                if outcome.is_session_fatal() {
                    databases.push(DatabaseOutcome { name: db.name.clone(), log_line: format!("{} - Error", db.name), failed: true });
                    link_dead = true;
                    if outcome == ConduitOutcome::SPC_CANCELLED {
                        cancelled = true;
                    }
                    break 'sync_loop;
                }
                if StatusClass::from_code(outcome.code) >= StatusClass::Warning {
                    tracing::warn!(db = %db.name, code = outcome.code, "sync conduit reported a non-success status");
                }

                if !ram_only.contains(&db.name) {
                    databases.push(DatabaseOutcome { name: db.name.clone(), log_line: format!("{} - OK (rom, not reconciled)", db.name), failed: false });
                    continue;
                }

                let commander = session.commander_mut()?;
                match reconciler.sync_database(commander, db, device_last_sync_pc, &backup_path, &self.config.archive_dir, now_unix) {
                    Ok(result) => databases.push(DatabaseOutcome { name: db.name.clone(), log_line: result.log_line, failed: false }),
                    Err(e) => {
                        let core_err: CoreError = e.into();
                        if core_err.is_session_fatal() {
                            databases.push(DatabaseOutcome { name: db.name.clone(), log_line: format!("{} - Error", db.name), failed: true });
                            link_dead = true;
                            if matches!(core_err, CoreError::CancelledByDevice | CoreError::CancelledByUser) {
                                cancelled = true;
                            }
                            break 'sync_loop;
                        }
                        tracing::warn!(db = %db.name, error = %core_err, "database sync failed, continuing with the next one");
                        databases.push(DatabaseOutcome { name: db.name.clone(), log_line: format!("{} - Error", db.name), failed: true });
                        any_failed = true;
                    }
                }
            }

            if !link_dead {
                for db in &databases_snapshot {
                    if self.config.cancel.is_set() {
                        cancelled = true;
                        break;
                    }
                    run_one_flavor(Flavor::Dump, Some(db), None, &mut session)?;
                }
            }
        }

        let outcome = if link_dead || cancelled {
            Outcome::Fatal
        } else if any_failed {
            Outcome::Partial
        } else {
            Outcome::Complete
        };

        if cancelled && !link_dead {
            // Best-effort: release whatever the interrupted step left open
            // before the final status goes out.
            if let Ok(commander) = session.commander_mut() {
                let _ = commander.close_db(DbHandle::for_test(0), CloseFlags { all_dbs: true });
            }
        }

        if !link_dead && !cancelled {
            let commander = session.commander_mut()?;
            for entry in &databases {
                let _ = commander.add_sync_log(&entry.log_line);
            }
            let user_info = UserInfo {
                user_id: uid.unwrap_or(0),
                viewer_id: 0,
                last_sync_pc: self.config.host.id(),
                last_sync_time: cs_core::PalmTimestamp::from_unix_epoch_secs(now_unix),
                last_good_sync_time: cs_core::PalmTimestamp::from_unix_epoch_secs(now_unix),
                name: username.clone().unwrap_or_default(),
                password_hash: Vec::new(),
            };
            let mask = UserInfoModifyMask { last_sync_pc: true, last_sync_time: true, last_good_sync_time: !any_failed, ..Default::default() };
            let _ = commander.write_user_info(&user_info, mask);
        }

        let status = if cancelled {
            EndOfSyncStatus::Cancelled
        } else {
            match outcome {
                Outcome::Complete => EndOfSyncStatus::Normal,
                Outcome::Partial => EndOfSyncStatus::OtherError,
                Outcome::Fatal => EndOfSyncStatus::OtherError,
            }
        };
        let session = session.end_of_sync(status, link_dead)?;
        session.close()?;

        Ok(SyncReport { databases, outcome })
    }

    /// The subset of the device's database list visible without the ROM
    /// flag, i.e. the databases the Reconciler actually reconciles. ROM
    /// databases are skipped by the Reconciler but stay visible to the
    /// Dispatcher, which already saw the full list via `infostore`.
    fn ram_resident_names<T: Transport>(&self, session: &mut Session<T>) -> Result<HashSet<String>, CoreError> {
        let commander = session.commander_mut()?;
        let mut names = HashSet::new();
        let mut index = 0u16;
        while let Some(info) = commander.read_db_list(0, false, index)? {
            names.insert(info.name);
            index += 1;
        }
        Ok(names)
    }
}

fn now_unix_seconds() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_type_header_maps_first_and_slow_to_the_same_wire_value() {
        // `SyncType` only distinguishes slow/fast on the wire;
        // FirstSync is a special case of the slow-sync family for a
        // conduit's purposes, so it reports "slow" too (DESIGN.md).
        let map = |s: SyncStrategy| match s {
            SyncStrategy::Fast => "fast",
            SyncStrategy::Slow | SyncStrategy::First => "slow",
        };
        assert_eq!(map(SyncStrategy::First), "slow");
        assert_eq!(map(SyncStrategy::Slow), "slow");
        assert_eq!(map(SyncStrategy::Fast), "fast");
    }
}
