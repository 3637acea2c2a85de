//! The decision-and-rewrite pipeline, userspace rendition.
//!
//! Same sequence as the XDP program: bounds-checked header walk, listener
//! membership, round-robin backend selection, in-place destination rewrite,
//! incremental checksum repair. One invocation per packet, O(1), no
//! allocation, fail-open on every branch.
//!
//! The shared state is injected per call and owned by the control plane.
//! Workers may invoke [`process`] concurrently; the only cross-context
//! mutable state is the round-robin counter (relaxed atomics, fairness
//! races tolerated), and each worker passes its own [`SteerStats`] shard.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;

use tcp_steer_common::{
    checksum, ETH_HLEN, ETH_P_IP, IPPROTO_TCP, IP_CHECK_OFFSET, IP_DADDR_OFFSET, IP_HLEN,
    IP_PROTO_OFFSET, MAX_BACKENDS, MIN_HEADER_LEN, TCP_DEST_OFFSET,
};

/// Terminal decision for one packet.
///
/// `PassThrough` means the caller continues normal handling of the (possibly
/// unmodified) buffer; `Redirect` means the buffer was mutated and must be
/// transmitted back out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    PassThrough,
    Redirect,
}

// ---------------------------------------------------------------------------
// Shared State
// ---------------------------------------------------------------------------

/// Data-plane state: backend pool, round-robin counter, listener set.
///
/// Created and populated by the control plane before any worker runs; the
/// data path only loads pool slots, loads listener snapshots, and advances
/// the counter. Control-plane mutation is safe concurrently with in-flight
/// packets: a packet observes either the old or the new value of any
/// single read.
pub struct SteerState {
    /// Backend addresses as big-endian u32 values; 0 marks an empty slot.
    backends: [AtomicU32; MAX_BACKENDS as usize],
    /// Shared round-robin counter. Wraps; never reset by the data path.
    rr_counter: AtomicU32,
    /// Monitored TCP destination ports (host order). Swapped wholesale on
    /// control-plane updates so readers never lock.
    listeners: ArcSwap<HashSet<u16>>,
}

impl SteerState {
    pub fn new() -> Self {
        Self {
            backends: std::array::from_fn(|_| AtomicU32::new(0)),
            rr_counter: AtomicU32::new(0),
            listeners: ArcSwap::from_pointee(HashSet::new()),
        }
    }

    /// Populate a pool slot. `0.0.0.0` is rejected by config validation
    /// before it can get here; storing it would read as an empty slot.
    pub fn set_backend(&self, idx: usize, addr: Ipv4Addr) {
        self.backends[idx].store(u32::from(addr), Ordering::Relaxed);
    }

    /// Empty a pool slot.
    #[allow(dead_code)]
    pub fn clear_backend(&self, idx: usize) {
        self.backends[idx].store(0, Ordering::Relaxed);
    }

    /// Mark a destination port as monitored.
    pub fn add_listener(&self, port: u16) {
        let mut set: HashSet<u16> = (**self.listeners.load()).clone();
        set.insert(port);
        self.listeners.store(Arc::new(set));
    }

    /// Stop monitoring a destination port.
    #[allow(dead_code)]
    pub fn remove_listener(&self, port: u16) {
        let mut set: HashSet<u16> = (**self.listeners.load()).clone();
        set.remove(&port);
        self.listeners.store(Arc::new(set));
    }

    /// Current counter value, for observability only.
    #[allow(dead_code)]
    pub fn counter(&self) -> u32 {
        self.rr_counter.load(Ordering::Relaxed)
    }
}

impl Default for SteerState {
    fn default() -> Self {
        Self::new()
    }
}

/// One worker context's stat counters. Each worker owns a shard; reporting
/// sums the shards. The data path only increments.
#[derive(Debug, Default)]
pub struct SteerStats {
    pub processed: AtomicU64,
    pub redirected: AtomicU64,
    /// Reserved: no path increments this. The slot exists for future policy.
    pub dropped: AtomicU64,
    pub passed: AtomicU64,
    pub aborted: AtomicU64,
}

// ---------------------------------------------------------------------------
// Packet Processing
// ---------------------------------------------------------------------------

/// Decide one frame and rewrite it in place if it is steered.
///
/// Every invocation increments `processed` once and exactly one of
/// {`redirected`, `passed`, `aborted`}, except on truncation, which passes
/// through with no stat beyond `processed` (a truncated buffer is detected
/// before any field of the missing header is inspected).
pub fn process(frame: &mut [u8], state: &SteerState, stats: &SteerStats) -> Verdict {
    stats.processed.fetch_add(1, Ordering::Relaxed);

    // --- Ethernet header ---
    if frame.len() < ETH_HLEN {
        return Verdict::PassThrough;
    }
    let ether_type = u16::from_be_bytes([frame[12], frame[13]]);
    if ether_type != ETH_P_IP {
        stats.passed.fetch_add(1, Ordering::Relaxed);
        return Verdict::PassThrough;
    }

    // --- IPv4 header ---
    // Fixed 20-byte header; frames carrying IP options are not rewritten.
    if frame.len() < ETH_HLEN + IP_HLEN {
        return Verdict::PassThrough;
    }
    let protocol = frame[ETH_HLEN + IP_PROTO_OFFSET];
    if protocol != IPPROTO_TCP {
        stats.passed.fetch_add(1, Ordering::Relaxed);
        return Verdict::PassThrough;
    }

    // --- TCP header ---
    if frame.len() < MIN_HEADER_LEN {
        return Verdict::PassThrough;
    }
    let dest_off = ETH_HLEN + IP_HLEN + TCP_DEST_OFFSET;
    let dest_port = u16::from_be_bytes([frame[dest_off], frame[dest_off + 1]]);

    // --- Listener lookup ---
    if !state.listeners.load().contains(&dest_port) {
        stats.passed.fetch_add(1, Ordering::Relaxed);
        return Verdict::PassThrough;
    }

    // --- Round-robin backend selection ---
    let backend_idx = (state.rr_counter.load(Ordering::Relaxed) % MAX_BACKENDS) as usize;
    let backend_ip = state.backends[backend_idx].load(Ordering::Relaxed);
    if backend_ip == 0 {
        // An empty slot aborts this packet: the counter is not advanced and
        // no other slot is probed.
        stats.aborted.fetch_add(1, Ordering::Relaxed);
        return Verdict::PassThrough;
    }

    // --- Rewrite destination and repair the checksum in place ---
    let daddr_off = ETH_HLEN + IP_DADDR_OFFSET;
    let old_daddr = u32::from_be_bytes([
        frame[daddr_off],
        frame[daddr_off + 1],
        frame[daddr_off + 2],
        frame[daddr_off + 3],
    ]);
    frame[daddr_off..daddr_off + 4].copy_from_slice(&backend_ip.to_be_bytes());

    state.rr_counter.fetch_add(1, Ordering::Relaxed);

    let check_off = ETH_HLEN + IP_CHECK_OFFSET;
    let old_check = u16::from_be_bytes([frame[check_off], frame[check_off + 1]]);
    let new_check = checksum::update_daddr(old_check, old_daddr, backend_ip);
    frame[check_off..check_off + 2].copy_from_slice(&new_check.to_be_bytes());

    stats.redirected.fetch_add(1, Ordering::Relaxed);
    Verdict::Redirect
}

#[cfg(test)]
mod tests {
    use super::*;
    use tcp_steer_common::checksum::ipv4_header_checksum;
    use tcp_steer_common::TCP_HLEN;

    /// Build a valid Eth + IPv4 + TCP frame with a correct IP checksum.
    fn build_tcp_frame(daddr: Ipv4Addr, dport: u16) -> Vec<u8> {
        let mut frame = vec![0u8; MIN_HEADER_LEN];

        // Ethernet: dst/src MACs irrelevant, EtherType IPv4.
        frame[12..14].copy_from_slice(&ETH_P_IP.to_be_bytes());

        // IPv4: version 4, IHL 5, total length = IP + TCP, TTL 64, TCP.
        let ip = &mut frame[ETH_HLEN..ETH_HLEN + IP_HLEN];
        ip[0] = 0x45;
        ip[2..4].copy_from_slice(&((IP_HLEN + TCP_HLEN) as u16).to_be_bytes());
        ip[8] = 64;
        ip[9] = IPPROTO_TCP;
        ip[12..16].copy_from_slice(&[192, 0, 2, 1]);
        ip[16..20].copy_from_slice(&daddr.octets());
        let check = ipv4_header_checksum(ip);
        ip[10..12].copy_from_slice(&check.to_be_bytes());

        // TCP: source port 40000, destination per caller.
        let tcp = &mut frame[ETH_HLEN + IP_HLEN..];
        tcp[0..2].copy_from_slice(&40000u16.to_be_bytes());
        tcp[2..4].copy_from_slice(&dport.to_be_bytes());
        // Data offset 5 words.
        tcp[12] = 0x50;

        frame
    }

    fn monitored_state(backends: &[Ipv4Addr]) -> SteerState {
        let state = SteerState::new();
        state.add_listener(80);
        for (i, addr) in backends.iter().enumerate() {
            state.set_backend(i, *addr);
        }
        state
    }

    fn snapshot(stats: &SteerStats) -> [u64; 4] {
        [
            stats.processed.load(Ordering::Relaxed),
            stats.redirected.load(Ordering::Relaxed),
            stats.passed.load(Ordering::Relaxed),
            stats.aborted.load(Ordering::Relaxed),
        ]
    }

    #[test]
    fn truncated_frames_pass_through_unchanged() {
        let state = monitored_state(&[Ipv4Addr::new(10, 0, 0, 5)]);
        let stats = SteerStats::default();
        let full = build_tcp_frame(Ipv4Addr::new(1, 1, 1, 1), 80);

        // Every prefix short of the full header chain passes through with
        // no stat beyond processed and no mutation.
        for len in 0..MIN_HEADER_LEN {
            let mut frame = full[..len].to_vec();
            let before = frame.clone();
            assert_eq!(process(&mut frame, &state, &stats), Verdict::PassThrough);
            assert_eq!(frame, before, "mutated at len {len}");
        }

        let [processed, redirected, passed, aborted] = snapshot(&stats);
        assert_eq!(processed, MIN_HEADER_LEN as u64);
        assert_eq!(redirected, 0);
        assert_eq!(aborted, 0);
        // Truncation never counts as passed, even once the prefix is long
        // enough to expose the IPv4 ethertype.
        assert_eq!(passed, 0);
        assert_eq!(state.counter(), 0);
    }

    #[test]
    fn non_ipv4_frames_pass_with_passed_stat() {
        let state = monitored_state(&[Ipv4Addr::new(10, 0, 0, 5)]);
        let stats = SteerStats::default();

        // ARP ethertype.
        let mut frame = build_tcp_frame(Ipv4Addr::new(1, 1, 1, 1), 80);
        frame[12..14].copy_from_slice(&0x0806u16.to_be_bytes());
        let before = frame.clone();

        assert_eq!(process(&mut frame, &state, &stats), Verdict::PassThrough);
        assert_eq!(frame, before);
        assert_eq!(snapshot(&stats), [1, 0, 1, 0]);
    }

    #[test]
    fn non_tcp_frames_pass_with_passed_stat() {
        let state = monitored_state(&[Ipv4Addr::new(10, 0, 0, 5)]);
        let stats = SteerStats::default();

        let mut frame = build_tcp_frame(Ipv4Addr::new(1, 1, 1, 1), 80);
        frame[ETH_HLEN + IP_PROTO_OFFSET] = 17; // UDP
        let before = frame.clone();

        assert_eq!(process(&mut frame, &state, &stats), Verdict::PassThrough);
        assert_eq!(frame, before);
        assert_eq!(snapshot(&stats), [1, 0, 1, 0]);
    }

    #[test]
    fn unmonitored_port_passes_with_passed_stat() {
        let state = monitored_state(&[Ipv4Addr::new(10, 0, 0, 5)]);
        let stats = SteerStats::default();

        let mut frame = build_tcp_frame(Ipv4Addr::new(1, 1, 1, 1), 8080);
        let before = frame.clone();

        assert_eq!(process(&mut frame, &state, &stats), Verdict::PassThrough);
        assert_eq!(frame, before);
        assert_eq!(snapshot(&stats), [1, 0, 1, 0]);
        assert_eq!(state.counter(), 0);
    }

    #[test]
    fn empty_pool_aborts_without_advancing_counter() {
        let state = monitored_state(&[]);
        let stats = SteerStats::default();

        let mut frame = build_tcp_frame(Ipv4Addr::new(1, 1, 1, 1), 80);
        let before = frame.clone();

        assert_eq!(process(&mut frame, &state, &stats), Verdict::PassThrough);
        assert_eq!(frame, before);
        assert_eq!(snapshot(&stats), [1, 0, 0, 1]);
        assert_eq!(state.counter(), 0);
    }

    #[test]
    fn empty_selected_slot_aborts_even_with_other_slots_populated() {
        // Slot 0 empty, slot 1 populated. Counter at 0 selects slot 0:
        // abort, no probing of slot 1, counter untouched.
        let state = monitored_state(&[]);
        state.set_backend(1, Ipv4Addr::new(10, 0, 0, 6));
        let stats = SteerStats::default();

        let mut frame = build_tcp_frame(Ipv4Addr::new(1, 1, 1, 1), 80);
        assert_eq!(process(&mut frame, &state, &stats), Verdict::PassThrough);
        assert_eq!(snapshot(&stats), [1, 0, 0, 1]);
        assert_eq!(state.counter(), 0);
    }

    #[test]
    fn redirect_rewrites_daddr_and_repairs_checksum() {
        let backend = Ipv4Addr::new(10, 0, 0, 5);
        let state = monitored_state(&[backend]);
        let stats = SteerStats::default();

        let mut frame = build_tcp_frame(Ipv4Addr::new(1, 1, 1, 1), 80);
        assert_eq!(process(&mut frame, &state, &stats), Verdict::Redirect);

        // Destination rewritten.
        assert_eq!(&frame[ETH_HLEN + IP_DADDR_OFFSET..ETH_HLEN + IP_DADDR_OFFSET + 4],
                   &backend.octets());

        // Checksum equals a from-scratch recompute over the mutated header.
        let ip = &frame[ETH_HLEN..ETH_HLEN + IP_HLEN];
        let stored = u16::from_be_bytes([ip[10], ip[11]]);
        assert_eq!(stored, ipv4_header_checksum(ip));

        assert_eq!(snapshot(&stats), [1, 1, 0, 0]);
        assert_eq!(state.counter(), 1);
    }

    #[test]
    fn round_robin_cycles_pool_in_order() {
        let backends: Vec<Ipv4Addr> =
            (0..MAX_BACKENDS).map(|i| Ipv4Addr::new(10, 0, 0, 1 + i as u8)).collect();
        let state = monitored_state(&backends);
        let stats = SteerStats::default();

        // 2 full cycles: selection order is c, c+1, ... mod 16 from c = 0.
        for n in 0..(2 * MAX_BACKENDS as usize) {
            let mut frame = build_tcp_frame(Ipv4Addr::new(1, 1, 1, 1), 80);
            assert_eq!(process(&mut frame, &state, &stats), Verdict::Redirect);

            let expected = backends[n % MAX_BACKENDS as usize];
            assert_eq!(
                &frame[ETH_HLEN + IP_DADDR_OFFSET..ETH_HLEN + IP_DADDR_OFFSET + 4],
                &expected.octets(),
                "packet {n}"
            );
        }
        assert_eq!(state.counter(), 2 * MAX_BACKENDS);
        assert_eq!(stats.redirected.load(Ordering::Relaxed), 2 * MAX_BACKENDS as u64);
    }

    #[test]
    fn listener_removal_takes_effect_for_subsequent_packets() {
        let state = monitored_state(&[Ipv4Addr::new(10, 0, 0, 5)]);
        let stats = SteerStats::default();

        let mut frame = build_tcp_frame(Ipv4Addr::new(1, 1, 1, 1), 80);
        assert_eq!(process(&mut frame, &state, &stats), Verdict::Redirect);

        state.remove_listener(80);
        let mut frame = build_tcp_frame(Ipv4Addr::new(1, 1, 1, 1), 80);
        assert_eq!(process(&mut frame, &state, &stats), Verdict::PassThrough);
        assert_eq!(stats.passed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn checksum_repair_handles_carry_heavy_addresses() {
        let backend = Ipv4Addr::new(255, 255, 255, 254);
        let state = monitored_state(&[backend]);
        let stats = SteerStats::default();

        let mut frame = build_tcp_frame(Ipv4Addr::new(0, 0, 0, 1), 80);
        assert_eq!(process(&mut frame, &state, &stats), Verdict::Redirect);

        let ip = &frame[ETH_HLEN..ETH_HLEN + IP_HLEN];
        let stored = u16::from_be_bytes([ip[10], ip[11]]);
        assert_eq!(stored, ipv4_header_checksum(ip));
    }
}
