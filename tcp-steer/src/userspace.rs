//! Userspace data path over an AF_PACKET socket.
//!
//! The portable rendition of the steering core: worker threads receive raw
//! L2 frames from the interface, run the same decision-and-rewrite pipeline
//! as the XDP program, and transmit rewritten frames back out. Verdicts and
//! counters are identical to XDP mode; only the packet transport differs.
//!
//! Workers join one PACKET_FANOUT group so the kernel spreads flows across
//! them instead of delivering every frame to every socket. Each worker owns
//! its own stat shard; aggregation happens at reporting time.

use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use socket2::Socket;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::engine::{self, SteerState, SteerStats, Verdict};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Receive buffer size per frame. Large enough for any non-jumbo frame.
const FRAME_BUF_SIZE: usize = 2048;

/// Receive timeout so the shutdown flag is polled even on idle links.
const RECV_TIMEOUT: Duration = Duration::from_millis(200);

// Linux packet-socket constants (from <linux/if_packet.h>)
const SOL_PACKET: i32 = 263;
const PACKET_FANOUT: i32 = 18;
const PACKET_FANOUT_CPU: u32 = 2;

// ---------------------------------------------------------------------------
// Public Interface
// ---------------------------------------------------------------------------

/// A running userspace forwarding instance.
pub struct UserspaceForwarder {
    threads: Vec<thread::JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    /// One stat shard per worker thread.
    pub stats: Vec<Arc<SteerStats>>,
}

impl UserspaceForwarder {
    /// Start worker threads on the configured interface.
    ///
    /// `state` is the control-plane-owned data-plane state; the caller
    /// populates it before and mutates it during the forwarder's lifetime.
    pub fn start(config: &Config, state: Arc<SteerState>) -> Result<Self> {
        let ifindex = interface_index(&config.interface)?;

        let num_workers = if config.userspace.workers > 0 {
            config.userspace.workers
        } else {
            thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        };

        // One fanout group per process; the kernel spreads frames across
        // the member sockets by receiving CPU.
        let fanout_group = (std::process::id() & 0xFFFF) as u16;

        let shutdown = Arc::new(AtomicBool::new(false));
        let mut threads = Vec::with_capacity(num_workers);
        let mut stats = Vec::with_capacity(num_workers);

        info!(
            interface = %config.interface,
            ifindex,
            workers = num_workers,
            pin_cpus = config.userspace.pin_cpus,
            "starting userspace forwarder"
        );

        for worker_id in 0..num_workers {
            let socket = open_packet_socket(ifindex)
                .with_context(|| format!("opening AF_PACKET socket for worker {}", worker_id))?;

            if num_workers > 1 {
                set_fanout(socket.as_raw_fd(), fanout_group)
                    .with_context(|| format!("joining fanout group for worker {}", worker_id))?;
            }

            let shard = Arc::new(SteerStats::default());
            stats.push(shard.clone());

            let shutdown = shutdown.clone();
            let state = state.clone();
            let pin_cpus = config.userspace.pin_cpus;
            let iface = config.interface.clone();

            let handle = thread::Builder::new()
                .name(format!("steer-{}-{}", iface, worker_id))
                .spawn(move || {
                    if pin_cpus {
                        if let Some(core_id) =
                            (core_affinity::CoreId { id: worker_id }).into()
                        {
                            core_affinity::set_for_current(core_id);
                            info!(worker_id, core = worker_id, "worker pinned to CPU core");
                        }
                    }

                    if let Err(e) = steer_worker(socket, &state, &shard, &shutdown) {
                        error!(worker_id, error = %e, "steer worker exited with error");
                    }
                })
                .context("spawning steer worker")?;

            threads.push(handle);
        }

        Ok(Self {
            threads,
            shutdown,
            stats,
        })
    }

    /// Signal the workers to stop and wait for them.
    pub fn shutdown(mut self) {
        info!("shutting down userspace forwarder");
        self.shutdown.store(true, Ordering::Release);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

// ---------------------------------------------------------------------------
// Socket Setup
// ---------------------------------------------------------------------------

/// Get the interface index for a network interface name.
fn interface_index(iface: &str) -> Result<u32> {
    let idx = nix::net::if_::if_nametoindex(iface)
        .with_context(|| format!("interface '{}' not found", iface))?;
    Ok(idx)
}

/// Open an AF_PACKET socket bound to the interface, receiving all
/// ethertypes, with a receive timeout for shutdown polling.
fn open_packet_socket(ifindex: u32) -> Result<Socket> {
    let protocol = (libc::ETH_P_ALL as u16).to_be() as i32;

    let fd = unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_RAW, protocol) };
    if fd < 0 {
        bail!(
            "creating AF_PACKET socket: {}",
            std::io::Error::last_os_error()
        );
    }
    // Socket takes ownership of the fd; it closes on drop from here on.
    let socket = unsafe { Socket::from_raw_fd(fd) };

    let mut sll: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
    sll.sll_family = libc::AF_PACKET as u16;
    sll.sll_protocol = (libc::ETH_P_ALL as u16).to_be();
    sll.sll_ifindex = ifindex as i32;

    let ret = unsafe {
        libc::bind(
            socket.as_raw_fd(),
            &sll as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        bail!(
            "binding AF_PACKET socket to ifindex {}: {}",
            ifindex,
            std::io::Error::last_os_error()
        );
    }

    socket
        .set_read_timeout(Some(RECV_TIMEOUT))
        .context("setting receive timeout")?;

    Ok(socket)
}

/// Join the per-process fanout group so concurrent workers each see a
/// share of the traffic instead of a copy of all of it.
fn set_fanout(fd: RawFd, group: u16) -> Result<()> {
    let arg: u32 = (group as u32) | (PACKET_FANOUT_CPU << 16);
    let ret = unsafe {
        libc::setsockopt(
            fd,
            SOL_PACKET,
            PACKET_FANOUT,
            &arg as *const _ as *const libc::c_void,
            std::mem::size_of::<u32>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        bail!("PACKET_FANOUT: {}", std::io::Error::last_os_error());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Worker Loop
// ---------------------------------------------------------------------------

/// Receive frames, run the steering core, transmit rewrites.
fn steer_worker(
    socket: Socket,
    state: &SteerState,
    stats: &SteerStats,
    shutdown: &AtomicBool,
) -> Result<()> {
    let fd = socket.as_raw_fd();
    let mut buf = [0u8; FRAME_BUF_SIZE];

    debug!("entering steer worker loop");

    while !shutdown.load(Ordering::Relaxed) {
        let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            match err.kind() {
                // Timeout or signal: poll shutdown and keep going.
                std::io::ErrorKind::WouldBlock
                | std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::Interrupted => continue,
                _ => return Err(err.into()),
            }
        }

        let frame = &mut buf[..n as usize];
        match engine::process(frame, state, stats) {
            Verdict::Redirect => {
                // The rewritten frame goes back out the same interface,
                // mirroring XDP_TX.
                let sent = unsafe {
                    libc::send(fd, frame.as_ptr() as *const libc::c_void, frame.len(), 0)
                };
                if sent < 0 {
                    let err = std::io::Error::last_os_error();
                    if err.kind() != std::io::ErrorKind::WouldBlock {
                        warn!(error = %err, "transmitting rewritten frame failed");
                    }
                }
            }
            Verdict::PassThrough => {
                // AF_PACKET receives a copy; the original continues through
                // the normal stack without any action here.
            }
        }
    }

    debug!("steer worker loop exited");
    Ok(())
}
