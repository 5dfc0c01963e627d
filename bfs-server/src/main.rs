//! The BFS daemon: loads configuration, mounts a formatted device, and
//! serves RPC connections over TCP (`spec.md` §5's worker model,
//! `SPEC_FULL.md` §1's thin-contract instance of it).

use std::env;
use std::io;
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::Arc;
use std::thread;

use bfs_core::config::Config;
use bfs_core::crypto::SecAssociation;
use bfs_core::device::{BlockDevice, FileBlockDevice};
use bfs_core::error::BfsError;
use bfs_core::fs::ops::OpenFlags;
use bfs_core::fs::{AccessControl, AllowAll, Filesystem};
use bfs_core::logging::BfsLogger;
use bfs_core::rpc::{self, MsgType, Opcode, Request, Response, RpcError};
use bfs_core::session::UserContext;

#[derive(Default)]
struct Args {
    prog: String,
    help: bool,
    device_path: Option<PathBuf>,
    config_path: Option<PathBuf>,
}

fn parse_args() -> Args {
    let mut args: Args = Default::default();
    let mut iter = env::args();
    args.prog = iter.next().unwrap_or_else(|| "bfs-server".to_owned());

    let mut positional = 0;
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-h" | "--help" => args.help = true,
            "-c" | "--config" => {
                args.config_path = iter.next().map(PathBuf::from);
            }
            _ => {
                positional += 1;
                if positional == 1 {
                    args.device_path = Some(PathBuf::from(arg));
                } else {
                    eprintln!("{}: unexpected argument `{}`", args.prog, arg);
                    exit(1);
                }
            }
        }
    }
    args
}

fn print_usage(prog: &str) {
    eprintln!("usage: {prog} [-c config] <device-path>");
}

fn main() {
    let args = parse_args();
    if args.help {
        print_usage(&args.prog);
        return;
    }
    let device_path = args.device_path.unwrap_or_else(|| {
        print_usage(&args.prog);
        exit(1);
    });

    let config = match &args.config_path {
        Some(p) => Config::load(p).unwrap_or_else(|e| {
            eprintln!("{}: {}: {}", args.prog, p.display(), e);
            exit(1);
        }),
        None => Config::default(),
    };

    BfsLogger::new(
        config.log_enabled,
        config.log_verbose,
        config.log_to_file,
        config.logfile.as_deref(),
    )
    .install();

    let fs_key = config.fs_sa_key.unwrap_or_else(|| {
        eprintln!("{}: fs_sa.key is not set in the config", args.prog);
        exit(1);
    });
    let cl_serv_key = config.cl_serv_sa_key.unwrap_or_else(|| {
        eprintln!("{}: cl_serv_sa.key is not set in the config", args.prog);
        exit(1);
    });

    let device: Arc<dyn BlockDevice> = Arc::new(FileBlockDevice::open(&device_path).unwrap_or_else(|e| {
        eprintln!("{}: {}: {}", args.prog, device_path.display(), e);
        exit(1);
    }));
    let sa = Arc::new(SecAssociation::new(fs_key));
    let acl: Arc<dyn AccessControl> = Arc::new(AllowAll);

    let fs = Filesystem::mount(
        device,
        sa,
        acl,
        config.cache_sz_limit as usize,
        config.merkle_tree,
        config.paranoid,
    )
    .unwrap_or_else(|e| {
        log::error!("mount failed: {e}");
        exit(1);
    });
    let fs = Arc::new(fs);

    let listener = TcpListener::bind(("0.0.0.0", config.bfs_server_port)).unwrap_or_else(|e| {
        eprintln!("{}: failed to bind port {}: {}", args.prog, config.bfs_server_port, e);
        exit(1);
    });
    log::info!("bfs-server listening on port {}", config.bfs_server_port);

    if config.num_file_worker_threads == 0 {
        // Single-threaded cooperative mode: one connection serviced to
        // completion before the next is accepted (`spec.md` §5).
        for stream in listener.incoming() {
            match stream {
                Ok(s) => serve_connection(s, fs.clone(), cl_serv_key),
                Err(e) => log::warn!("accept failed: {e}"),
            }
        }
    } else {
        for (n, stream) in listener.incoming().enumerate() {
            match stream {
                Ok(s) => {
                    let fs = fs.clone();
                    let name = format!("bfs-client-{n}");
                    if let Err(e) = thread::Builder::new()
                        .name(name)
                        .spawn(move || serve_connection(s, fs, cl_serv_key))
                    {
                        log::warn!("failed to spawn worker thread: {e}");
                    }
                }
                Err(e) => log::warn!("accept failed: {e}"),
            }
        }
    }
}

/// Services one connection start to finish: the handshake, then a
/// request/response loop until the client disconnects, sends `Destroy`,
/// or a frame fails to authenticate (`spec.md` §4.8's drop-on-mismatch
/// rule, §7's fatal-error-drops-connection rule).
fn serve_connection(mut stream: TcpStream, fs: Arc<Filesystem>, cl_serv_key: [u8; 16]) {
    let sa = SecAssociation::new(cl_serv_key);
    let ctx = match handshake(&mut stream, sa) {
        Some(ctx) => ctx,
        None => return,
    };
    log::debug!("client uid={} connected", ctx.uid);

    loop {
        let expected = ctx.expected_recv_seq();
        let (mtype, opcode, body) = match rpc::read_frame(&mut stream, ctx.sa(), expected) {
            Ok(v) => v,
            Err(RpcError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                log::debug!("client uid={} disconnected", ctx.uid);
                return;
            }
            Err(e) => {
                log::warn!("frame error from uid={}, dropping connection: {e}", ctx.uid);
                return;
            }
        };
        if mtype != MsgType::ToServer {
            log::warn!("unexpected message type from uid={}, dropping connection", ctx.uid);
            return;
        }
        ctx.advance_recv_seq();

        if opcode == Opcode::Destroy {
            log::debug!("client uid={} requested destroy", ctx.uid);
            return;
        }

        let req = match rpc::decode_request_body(opcode, &body) {
            Ok(r) => r,
            Err(e) => {
                log::warn!("malformed request from uid={}, dropping connection: {e}", ctx.uid);
                return;
            }
        };

        let resp = match dispatch(&fs, ctx.uid, req) {
            Ok(r) => r,
            Err(msg) => {
                log::error!("server error serving uid={}: {msg}", ctx.uid);
                return;
            }
        };

        let send_seq = ctx.next_send_seq();
        let out_body = rpc::encode_response_body(&resp);
        if rpc::write_frame(&mut stream, ctx.sa(), send_seq, MsgType::FromServer, opcode, &out_body).is_err() {
            log::warn!("failed to send response to uid={}, dropping connection", ctx.uid);
            return;
        }
    }
}

/// Reads the first frame, which must be `Init`, and builds the session's
/// `UserContext` from the uid it carries.
fn handshake(stream: &mut TcpStream, sa: SecAssociation) -> Option<UserContext> {
    let (mtype, opcode, body) = match rpc::read_frame(stream, &sa, 0) {
        Ok(v) => v,
        Err(e) => {
            log::warn!("handshake failed: {e}");
            return None;
        }
    };
    if mtype != MsgType::ToServer || opcode != Opcode::Init {
        log::warn!("expected Init as the first frame");
        return None;
    }
    let uid = match rpc::decode_request_body(opcode, &body) {
        Ok(Request::Init { uid }) => uid,
        _ => {
            log::warn!("malformed Init request");
            return None;
        }
    };
    let ctx = UserContext::new(uid, sa);
    ctx.advance_recv_seq();

    let send_seq = ctx.next_send_seq();
    let ack = rpc::encode_response_body(&Response::Unit);
    if rpc::write_frame(stream, ctx.sa(), send_seq, MsgType::FromServer, Opcode::Init, &ack).is_err() {
        return None;
    }
    Some(ctx)
}

/// Calls the filesystem operation named by `req`, translating its result
/// into a wire `Response`. Returns `Err` only for a fatal `ServerError`,
/// which the caller must treat as "drop the connection" (`spec.md` §7).
fn dispatch(fs: &Filesystem, uid: u32, req: Request) -> Result<Response, String> {
    let result = match req {
        Request::Getattr { path } => fs.getattr(uid, &path).map(Response::Attr),
        Request::Mkdir { path, mode } => fs.mkdir(uid, &path, mode).map(Response::Ino),
        Request::Unlink { path } => fs.unlink(uid, &path).map(|_| Response::Unit),
        Request::Rmdir { path } => fs.rmdir(uid, &path).map(|_| Response::Unit),
        Request::Rename { from, to } => fs.rename(uid, &from, &to).map(|_| Response::Unit),
        Request::Open { path, flags } => fs
            .open(uid, &path, OpenFlags::from_bits_truncate(flags))
            .map(Response::Fh),
        Request::Read { fh, n, off } => fs.read(fh, n, off).map(Response::Bytes),
        Request::Write { fh, off, data } => fs.write(fh, &data, off).map(Response::Written),
        Request::Release { fh } => fs.release(fh).map(|_| Response::Unit),
        Request::Fsync { fh } => fs.fsync(fh).map(|_| Response::Unit),
        Request::Opendir { path } => fs.opendir(uid, &path).map(Response::Fh),
        Request::Readdir { fh } => fs
            .readdir(fh)
            .map(|entries| Response::Entries(entries.into_iter().map(|e| (e.ino, e.name)).collect())),
        Request::Create { path, mode } => fs
            .create(uid, &path, mode)
            .map(|(fh, ino)| Response::Created { fh, ino }),
        Request::Chmod { path, mode } => fs.chmod(uid, &path, mode).map(|_| Response::Unit),
        Request::Truncate { path, size } => fs.truncate(uid, &path, size).map(|_| Response::Unit),
        // Re-handshaking mid-session is a no-op ack; formatting a live
        // device over an established connection isn't supported, since
        // `bfs-mkfs` owns that path (`spec.md` §1).
        Request::Init { .. } => return Ok(Response::Unit),
        Request::InitMkfs { .. } => return Ok(Response::Error(libc::EPERM)),
        Request::Destroy => return Ok(Response::Unit),
    };
    match result {
        Ok(resp) => Ok(resp),
        Err(BfsError::Server(e)) => Err(e.to_string()),
        Err(e) => Ok(Response::Error(e.errno().unwrap_or(libc::EIO))),
    }
}
