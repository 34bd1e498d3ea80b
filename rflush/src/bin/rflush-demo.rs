//! rflush-demo: one server and one client over the in-process fabric.
//!
//! The server maps its region (a DevDax device or file when a path is given,
//! anonymous memory otherwise), prints the current message and waits for one
//! connection. The client writes a new message into the region with a
//! one-sided write, asks the server to flush it and disconnects. The server
//! then prints the new message.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use log::LevelFilter;

use fabric::Fabric;
use rflush::buffer::{SlotKind, wr_id};
use rflush::protocol::MSG_SIZE_MAX;
use rflush::{
    AlignedBuffer, CheckCompletion, Completion, ConnectionConfig, ConnectionRequest, Endpoint,
    FlushClient, FlushServer, MessageBuffer, Peer, PrivateData, Usage,
};

// =============================================================================
// CLI
// =============================================================================

#[derive(Parser, Debug)]
#[command(name = "rflush-demo", about = "Remote flush demo")]
struct Cli {
    /// Address the server listens on.
    server_address: String,

    /// Port the server listens on.
    port: u16,

    /// Persistent memory path (DevDax e.g. /dev/dax0.0, or regular file).
    /// Anonymous volatile memory is used when not set.
    pmem_path: Option<PathBuf>,

    /// Server region size in bytes.
    #[arg(long, default_value_t = 1024)]
    size: usize,

    /// Message slots on each side.
    #[arg(long, default_value_t = 1)]
    slots: usize,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long, default_value = "info")]
    log_level: LevelFilter,

    /// Message the client writes.
    #[arg(long, default_value = "Hello, persistent world!")]
    message: String,
}

const CLIENT_ADDRESS: &str = "127.0.0.1";
const SIGNATURE: &[u8] = b"RFLUSH_DEMO_SIG";
const FLUSH_TOKEN: u64 = 0x7;

fn read_message(ptr: *const u8, max: usize) -> String {
    // SAFETY: the caller passes a mapped range of at least `max` bytes.
    let bytes = unsafe { std::slice::from_raw_parts(ptr, max) };
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(max);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

// =============================================================================
// Server
// =============================================================================

fn run_server(fabric: &Fabric, cli: &Cli) -> rflush::Result<()> {
    let ctx = fabric
        .open_device(&cli.server_address)
        .map_err(|source| rflush::Error::Provider {
            op: "open_device",
            source,
        })?;
    let peer = Peer::new(&ctx)?;
    let endpoint = Endpoint::listen(&peer, &cli.server_address, cli.port)?;

    // SAFETY: the mapping is only accessed through this process and the fabric.
    let mut mapping = unsafe { pmem::map(cli.pmem_path.as_deref(), cli.size) }.map_err(
        |source| rflush::Error::Provider {
            op: "map",
            source,
        },
    )?;
    let data_offset = if mapping.is_persistent() {
        mapping
            .ensure_signature(SIGNATURE)
            .map_err(|source| rflush::Error::Provider {
                op: "ensure_signature",
                source,
            })?
    } else {
        0
    };
    let data_len = mapping.len() - data_offset;
    // SAFETY: data_offset lies within the mapping.
    let data = unsafe { mapping.as_ptr().add(data_offset) };
    println!("Old value: {}", read_message(data, data_len));

    let flush_usage = if mapping.is_persistent() {
        Usage::FLUSH_TYPE_PERSISTENT
    } else {
        Usage::FLUSH_TYPE_VISIBILITY
    };
    // SAFETY: the region is dropped before the mapping.
    let mr = unsafe { peer.register(mapping.as_ptr(), mapping.len(), Usage::WRITE_DST | flush_usage)? };

    let cfg = ConnectionConfig::default();
    let req = endpoint.next_conn_req(&cfg)?;
    let buf = MessageBuffer::new(&peer, cli.slots)?;
    for slot in 0..cli.slots {
        req.recv(buf.mr(), buf.recv_offset(slot), MSG_SIZE_MAX, wr_id(slot, SlotKind::Recv))?;
    }
    let pdata = PrivateData::from_region(&mr, data_offset as u64).to_bytes();
    let conn = req.connect(Some(&pdata))?;
    conn.wait_established()?;
    endpoint.shutdown();

    let stats = FlushServer::with_armed_buffer(&conn, buf, &mapping)?.run()?;
    log::info!(
        "server done: {} flushed, {} rejected",
        stats.flushed,
        stats.rejected
    );
    println!("New value: {}", read_message(data, data_len));
    conn.close()?;
    drop(mr);
    Ok(())
}

// =============================================================================
// Client
// =============================================================================

fn run_client(fabric: &Fabric, cli: &Cli) -> rflush::Result<()> {
    let ctx = fabric
        .open_device(CLIENT_ADDRESS)
        .map_err(|source| rflush::Error::Provider {
            op: "open_device",
            source,
        })?;
    let peer = Peer::new(&ctx)?;
    let cfg = ConnectionConfig::default().with_timeout(Duration::from_secs(5));
    let conn = ConnectionRequest::new(&peer, &cli.server_address, cli.port, &cfg)?.connect(None)?;
    conn.wait_established()?;

    let pdata = PrivateData::from_bytes(&conn.remote_private_data())?;
    let remote = pdata.region()?;

    // Message plus terminating NUL.
    let len = cli.message.len() + 1;
    let src = AlignedBuffer::new(len)?;
    // SAFETY: src holds `len` bytes and is not yet registered.
    unsafe {
        std::ptr::copy_nonoverlapping(cli.message.as_ptr(), src.as_ptr(), cli.message.len());
    }
    // SAFETY: src outlives the region.
    let src_mr = unsafe { peer.register(src.as_ptr(), len, Usage::WRITE_SRC)? };
    conn.write(&remote, pdata.data_offset, &src_mr, 0, len, Completion::Always, 0)?;
    conn.check_completion(&conn.cq().next_completion()?)?;

    let mut client = FlushClient::new(&peer, &conn, cli.slots)?;
    let done = client.flush_sync(pdata.data_offset, len as u64, FLUSH_TOKEN)?;
    log::info!(
        "flush of {} bytes acknowledged (token {:#x}, {:?})",
        len,
        done.token,
        done.durability
    );
    drop(client);
    conn.close()
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    rflush::logging::init(cli.log_level);

    if cli.slots == 0 {
        eprintln!("--slots must be at least 1");
        return ExitCode::FAILURE;
    }

    let fabric = Fabric::new();
    let (server, client) = std::thread::scope(|s| {
        let server = s.spawn(|| run_server(&fabric, &cli));
        let client = s.spawn(|| run_client(&fabric, &cli));
        (server.join(), client.join())
    });

    let mut code = ExitCode::SUCCESS;
    for (role, result) in [("server", server), ("client", client)] {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                log::error!("{} failed: {}", role, e);
                eprintln!("{} failed: {} (code {})", role, e, e.code());
                code = ExitCode::FAILURE;
            }
            Err(_) => {
                eprintln!("{} thread panicked", role);
                code = ExitCode::FAILURE;
            }
        }
    }
    code
}
