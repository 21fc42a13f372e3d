//! End-to-end exercise of one sync run through the real protocol stack:
//! `SyncEngine::run` drives a [`cs_proto::Framer`]/[`cs_proto::Assembler`]/
//! [`cs_proto::Transactor`]/[`cs_commander::Commander`] chain over one half
//! of a `UnixStream::pair()`, answered by a hand-written device on the other
//! half running in a background thread. Complements the strategy-level
//! coverage in `cs-sync`'s reconciler tests (which exercise the same merge
//! outcomes against an in-memory `DeviceOps` fake, without a wire) by
//! proving the wire codec and session handshake actually compose end to end.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use cs_commander::{encode_dbinfo, Command};
use cs_core::{DatabaseInfo, DbAttrFlags, HostIdentity, PalmTimestamp};
use cs_engine::{Outcome, SyncConfig, SyncEngine};
use cs_proto::{Argument, Assembler, Framer, Transport};

// Mirrors the private wakeup/negotiate constants in cs_commander::session;
// a fake device has to speak the same raw Framer-level handshake.
const SOCKET_CMP: u8 = 0x01;
const CMP_WAKEUP: u8 = 1;
const CMP_INIT: u8 = 2;

const WIRE_ERR_NOT_FOUND: u16 = 3;

struct DuplexTransport(UnixStream);

impl Read for DuplexTransport {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.0.read(buf)
    }
}

impl Write for DuplexTransport {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.write(buf)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        self.0.flush()
    }
}

impl Transport for DuplexTransport {
    fn set_speed(&mut self, _bps: u32) -> std::io::Result<()> {
        Ok(())
    }
    fn drain(&mut self) -> std::io::Result<()> {
        self.0.flush()
    }
    fn close(&mut self) -> std::io::Result<()> {
        self.0.shutdown(std::net::Shutdown::Both)
    }
    fn set_read_timeout(&mut self, _timeout: Option<Duration>) -> std::io::Result<()> {
        Ok(())
    }
}

fn memo_db_info() -> DatabaseInfo {
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

// ---- tiny local TLV codec, mirroring cs_proto::transactor's private one --

const LONG_LENGTH_BIT: u8 = 0x80;

fn encode_args(args: &[Argument]) -> Vec<u8> {
    let mut out = Vec::new();
    for arg in args {
        let start = out.len();
        if arg.data.len() > 0xFF {
            out.push(arg.id | LONG_LENGTH_BIT);
            out.extend_from_slice(&(arg.data.len() as u16).to_be_bytes());
        } else {
            out.push(arg.id & !LONG_LENGTH_BIT);
            out.push(arg.data.len() as u8);
        }
        out.extend_from_slice(&arg.data);
        if (out.len() - start) % 2 != 0 {
            out.push(0);
        }
    }
    out
}

fn decode_args(mut bytes: &[u8], count: u8) -> Vec<Argument> {
    let mut args = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let raw_id = bytes[0];
        let has_long = raw_id & LONG_LENGTH_BIT != 0;
        let id = raw_id & !LONG_LENGTH_BIT;
        bytes = &bytes[1..];
        let len = if has_long {
            let l = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
            bytes = &bytes[2..];
            l
        } else {
            let l = bytes[0] as usize;
            bytes = &bytes[1..];
            l
        };
        let data = bytes[..len].to_vec();
        bytes = &bytes[len..];
        let consumed_header = if has_long { 3 } else { 2 };
        if (consumed_header + len) % 2 != 0 {
            bytes = &bytes[1..];
        }
        args.push(Argument::new(id, data));
    }
    args
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}
fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}
fn put_str(out: &mut Vec<u8>, s: &str) {
    out.push(s.len() as u8);
    out.extend_from_slice(s.as_bytes());
}

fn record_payload(id: u32, data: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    put_u32(&mut body, id);
    body.push(0); // attr octet: clean, category 0
    put_u32(&mut body, data.len() as u32);
    body.extend_from_slice(data);
    body
}

/// Runs one "Memo" record database (three clean records, ids 1-3) as a
/// device on the far end of `stream`, answering exactly the commands a
/// first sync against an empty backup directory drives. Returns the
/// sync log lines it was asked to store, so the test can confirm they
/// actually crossed the wire rather than only checking the local backup.
fn run_fake_device(stream: UnixStream) -> Vec<String> {
    let mut framer = Framer::new(DuplexTransport(stream));
    framer.send(SOCKET_CMP, SOCKET_CMP, CMP_WAKEUP, 0, &[]).expect("send wakeup");

    let proposal = loop {
        let frame = framer.recv().expect("recv cmp-init proposal");
        if frame.packet_type == CMP_INIT {
            break frame;
        }
    };
    let rate = u32::from_be_bytes(proposal.body[0..4].try_into().unwrap());
    framer.send(SOCKET_CMP, SOCKET_CMP, CMP_INIT, 0, &rate.to_be_bytes()).expect("ack rate");

    let mut assembler = Assembler::new(framer);
    let mut sync_logs = Vec::new();
    let records: [&[u8]; 3] = [b"a", b"b", b"c"];

    loop {
        let (xid, datagram) = match assembler.read() {
            Ok(v) => v,
            Err(_) => break,
        };
        let cmd = datagram[0];
        let argcount = datagram[1];
        let args = decode_args(&datagram[2..], argcount);
        let req = args.first().map(|a| a.data.as_slice()).unwrap_or(&[]);

        let (error, resp_args): (u16, Vec<Argument>) = if cmd == Command::ReadSysInfo.opcode() {
            let mut body = Vec::new();
            put_u32(&mut body, 0); // rom_version
            put_u32(&mut body, 0); // locale
            put_u32(&mut body, 0); // product_id
            put_u16(&mut body, 1); // dlp_major
            put_u16(&mut body, 1); // dlp_minor
            (0, vec![Argument::new(1, body)])
        } else if cmd == Command::ReadUserInfo.opcode() {
            let mut body = Vec::new();
            put_u32(&mut body, 777); // user_id
            put_u32(&mut body, 0); // viewer_id
            put_u32(&mut body, 0); // last_sync_pc
            put_u32(&mut body, 0); // last_sync_time
            put_u32(&mut body, 0); // last_good_sync_time
            put_str(&mut body, "tester");
            body.push(0); // password hash length
            (0, vec![Argument::new(1, body)])
        } else if cmd == Command::ReadStorageInfo.opcode() {
            let mut body = Vec::new();
            body.push(req.first().copied().unwrap_or(0)); // card, echoed
            put_u32(&mut body, 1_000_000); // total_bytes
            put_u32(&mut body, 500_000); // free_bytes
            put_u16(&mut body, 1); // ram_db_count
            put_u16(&mut body, 0); // rom_db_count
            put_str(&mut body, "Internal");
            put_str(&mut body, "Fake");
            (0, vec![Argument::new(1, body)])
        } else if cmd == Command::ReadDbList.opcode() {
            let index = u16::from_be_bytes([req[2], req[3]]);
            if index == 0 {
                (0, vec![Argument::new(1, encode_dbinfo(&memo_db_info()))])
            } else {
                (WIRE_ERR_NOT_FOUND, Vec::new())
            }
        } else if cmd == Command::OpenDb.opcode() {
            (0, vec![Argument::new(1, vec![1u8])]) // handle 1
        } else if cmd == Command::ReadRecordByIndex.opcode() {
            let index = u16::from_be_bytes([req[1], req[2]]) as usize;
            match records.get(index) {
                Some(data) => (0, vec![Argument::new(1, record_payload(index as u32 + 1, data))]),
                None => (WIRE_ERR_NOT_FOUND, Vec::new()),
            }
        } else if cmd == Command::OpenConduit.opcode()
            || cmd == Command::CleanUpDatabase.opcode()
            || cmd == Command::ResetSyncFlags.opcode()
            || cmd == Command::CloseDb.opcode()
            || cmd == Command::WriteUserInfo.opcode()
        {
            (0, Vec::new())
        } else if cmd == Command::AddSyncLog.opcode() {
            let len = req[0] as usize;
            sync_logs.push(String::from_utf8_lossy(&req[1..1 + len]).into_owned());
            (0, Vec::new())
        } else if cmd == Command::EndOfSync.opcode() {
            let mut out = vec![cmd | 0x80, 0, 0, 0];
            assembler.write(xid, &out).expect("send end_of_sync reply");
            out.clear();
            break;
        } else {
            panic!("fake device received an unexpected opcode {cmd}");
        };

        let mut out = vec![cmd | 0x80, resp_args.len() as u8];
        out.extend_from_slice(&error.to_be_bytes());
        out.extend_from_slice(&encode_args(&resp_args));
        assembler.write(xid, &out).expect("send reply");
    }

    sync_logs
}

/// First sync against an empty backup directory. The
/// device reports one record database ("Memo") with three clean records;
/// the host should download all three verbatim, clear their sync flags,
/// create no archive, and report a single "(1st) - OK" log line.
#[test]
fn first_sync_against_an_empty_backup_directory() {
    let (host_sock, device_sock) = UnixStream::pair().expect("socketpair");
    let device = std::thread::spawn(move || run_fake_device(device_sock));

    let dir = tempfile::tempdir().unwrap();
    let backup_dir = dir.path().join("backup");
    let archive_dir = dir.path().join("archive");
    std::fs::create_dir_all(&backup_dir).unwrap();
    std::fs::create_dir_all(&archive_dir).unwrap();

    let config = SyncConfig::new(HostIdentity::with_id(0xC0FFEE), backup_dir.clone(), archive_dir.clone());
    let engine = SyncEngine::new(config);
    let report = engine.run(DuplexTransport(host_sock)).expect("sync run");

    assert_eq!(report.outcome(), Outcome::Complete);
    assert_eq!(report.databases.len(), 1);
    assert_eq!(report.databases[0].name, "Memo");
    assert_eq!(report.databases[0].log_line, "Memo (1st) - OK");
    assert!(!report.databases[0].failed);

    let local = cs_db::dbfile::read(&backup_dir.join("Memo")).expect("read backup");
    assert_eq!(local.records().len(), 3);
    assert_eq!(local.find_by_id(1).unwrap().data, b"a");
    assert_eq!(local.find_by_id(2).unwrap().data, b"b");
    assert_eq!(local.find_by_id(3).unwrap().data, b"c");
    for rec in local.records() {
        assert!(rec.flags.is_clean());
    }
    assert!(!archive_dir.join("Memo").exists());

    let sync_logs = device.join().expect("device thread");
    assert_eq!(sync_logs, vec!["Memo (1st) - OK".to_string()]);
}
