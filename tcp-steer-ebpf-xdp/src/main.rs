//! XDP eBPF program for transparent TCP load balancing.
//!
//! Attached to the XDP hook on the network interface. Every inbound frame is
//! classified before the normal stack sees it:
//! - TCP packets whose destination port is in the listener map get their
//!   IPv4 destination address rewritten to a round-robin-selected backend,
//!   the header checksum repaired in place, and are transmitted back out
//!   (XDP_TX).
//! - Everything else (ARP, non-IPv4, non-TCP, unmonitored ports) → XDP_PASS
//!   to the kernel stack untouched.
//!
//! All failure modes are fail-open: a packet is never dropped here, only
//! passed through unmodified. The backend pool, listener map, and
//! round-robin counter are owned and populated by the userspace daemon; this
//! program only reads them (and advances the counter).

#![no_std]
#![no_main]

use core::mem;
use core::sync::atomic::{AtomicU32, Ordering};

use aya_ebpf::{
    bindings::xdp_action,
    macros::{map, xdp},
    maps::{Array, HashMap, PerCpuArray},
    programs::XdpContext,
};
use network_types::{
    eth::{EthHdr, EtherType},
    ip::{IpProto, Ipv4Hdr},
    tcp::TcpHdr,
};
use tcp_steer_common::{
    checksum, MAX_BACKENDS, MAX_LISTENERS, STAT_ABORTED, STAT_PASSED, STAT_PROCESSED,
    STAT_REDIRECTED, STAT_SLOTS,
};

// ---------------------------------------------------------------------------
// eBPF Maps
// ---------------------------------------------------------------------------

/// Backend pool: IPv4 addresses in network byte order, indexed 0..MAX_BACKENDS.
/// A slot holding 0 is unpopulated. Userspace writes, this program reads.
#[map]
static BACKEND_POOL: Array<u32> = Array::with_max_entries(MAX_BACKENDS, 0);

/// Shared round-robin counter. Single entry, advanced atomically after each
/// successful backend selection. Never reset here.
#[map]
static RR_COUNTER: Array<u32> = Array::with_max_entries(1, 0);

/// Monitored frontend ports, keyed in network byte order so the TCP header
/// field can be compared without a byte swap. The value is opaque metadata;
/// only key presence matters.
#[map]
static LISTENER_PORTS: HashMap<u16, u32> = HashMap::with_max_entries(MAX_LISTENERS, 0);

/// Per-CPU stat counters. Indices defined in tcp-steer-common; userspace
/// sums the per-CPU values when reporting.
#[map]
static STATS: PerCpuArray<u64> = PerCpuArray::with_max_entries(STAT_SLOTS, 0);

#[inline(always)]
fn inc_stat(idx: u32) {
    if let Some(val) = STATS.get_ptr_mut(idx) {
        unsafe { *val += 1 };
    }
}

// ---------------------------------------------------------------------------
// Bounds-checked header access
// ---------------------------------------------------------------------------

/// Pointer to a `T` at `offset` into the packet, or Err if the buffer does
/// not contain it in full. The explicit data_end comparison is what the
/// verifier keys on; no field is touched without it.
#[inline(always)]
fn ptr_at<T>(ctx: &XdpContext, offset: usize) -> Result<*const T, ()> {
    let start = ctx.data();
    let end = ctx.data_end();
    let len = mem::size_of::<T>();

    if start + offset + len > end {
        return Err(());
    }

    Ok((start + offset) as *const T)
}

#[inline(always)]
fn ptr_at_mut<T>(ctx: &XdpContext, offset: usize) -> Result<*mut T, ()> {
    let ptr: *const T = ptr_at(ctx, offset)?;
    Ok(ptr as *mut T)
}

// ---------------------------------------------------------------------------
// XDP Entry Point
// ---------------------------------------------------------------------------

/// XDP hook: decide per frame, rewrite in place, never drop.
///
/// Returns:
/// - `XDP_TX`: destination rewritten to a backend, transmit back out
/// - `XDP_PASS`: everything else (including all failure modes)
#[xdp]
pub fn tcp_steer(ctx: XdpContext) -> u32 {
    match try_steer(&ctx) {
        Ok(action) => action,
        Err(_) => xdp_action::XDP_PASS,
    }
}

/// The whole decision-and-rewrite pipeline. Bounded and loop-free; nothing
/// here scales with packet contents.
fn try_steer(ctx: &XdpContext) -> Result<u32, ()> {
    inc_stat(STAT_PROCESSED);

    // --- Ethernet header ---
    // A truncated buffer passes through before any field is inspected.
    let eth: *const EthHdr = match ptr_at(ctx, 0) {
        Ok(p) => p,
        Err(()) => return Ok(xdp_action::XDP_PASS),
    };
    match unsafe { (*eth).ether_type } {
        EtherType::Ipv4 => {}
        _ => {
            inc_stat(STAT_PASSED);
            return Ok(xdp_action::XDP_PASS);
        }
    }

    // --- IPv4 header ---
    // Fixed 20-byte header; frames carrying IP options are not rewritten.
    let iph: *mut Ipv4Hdr = match ptr_at_mut(ctx, EthHdr::LEN) {
        Ok(p) => p,
        Err(()) => return Ok(xdp_action::XDP_PASS),
    };
    match unsafe { (*iph).proto } {
        IpProto::Tcp => {}
        _ => {
            inc_stat(STAT_PASSED);
            return Ok(xdp_action::XDP_PASS);
        }
    }

    // --- TCP header ---
    let tcph: *const TcpHdr = match ptr_at(ctx, EthHdr::LEN + Ipv4Hdr::LEN) {
        Ok(p) => p,
        Err(()) => return Ok(xdp_action::XDP_PASS),
    };

    // --- Listener lookup ---
    // The port stays in network byte order end to end; userspace inserted
    // the key with to_be().
    let dest_port = unsafe { (*tcph).dest };
    if unsafe { LISTENER_PORTS.get(&dest_port) }.is_none() {
        inc_stat(STAT_PASSED);
        return Ok(xdp_action::XDP_PASS);
    }

    // --- Round-robin backend selection ---
    let counter: &AtomicU32 = match RR_COUNTER.get_ptr_mut(0) {
        Some(ptr) => unsafe { &*(ptr as *const AtomicU32) },
        None => {
            inc_stat(STAT_ABORTED);
            return Ok(xdp_action::XDP_PASS);
        }
    };

    let backend_idx = counter.load(Ordering::Relaxed) % MAX_BACKENDS;
    let backend_ip = match BACKEND_POOL.get(backend_idx) {
        Some(&ip) if ip != 0 => ip,
        // An empty slot aborts this packet: the counter is not advanced and
        // no other slot is probed.
        _ => {
            inc_stat(STAT_ABORTED);
            return Ok(xdp_action::XDP_PASS);
        }
    };

    // --- Rewrite destination and repair the checksum in place ---
    let old_daddr = unsafe { (*iph).dst_addr };
    unsafe { (*iph).dst_addr = backend_ip };

    counter.fetch_add(1, Ordering::Relaxed);

    let old_check = unsafe { (*iph).check };
    unsafe { (*iph).check = checksum::update_daddr(old_check, old_daddr, backend_ip) };

    inc_stat(STAT_REDIRECTED);
    Ok(xdp_action::XDP_TX)
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}

#[link_section = "license"]
#[no_mangle]
static LICENSE: [u8; 13] = *b"Dual MIT/GPL\0";
