//! Shared definitions between the tcp-steer userspace daemon and the XDP
//! program.
//!
//! This crate is `no_std` compatible so it can be used from eBPF code. It
//! carries the compile-time bounds, map names, stat indices, and the
//! one's-complement checksum arithmetic that both data-path renditions and
//! the host-side tests share.

#![no_std]

pub mod checksum;

// ---------------------------------------------------------------------------
// Capacities
// ---------------------------------------------------------------------------

/// Number of slots in the backend pool. Selection is `counter % MAX_BACKENDS`;
/// a slot holding 0 is unpopulated.
pub const MAX_BACKENDS: u32 = 16;

/// Maximum number of monitored frontend ports.
pub const MAX_LISTENERS: u32 = 256;

/// Number of stat counter slots. Indices 0-4 are defined, 5-7 reserved.
pub const STAT_SLOTS: u32 = 8;

// ---------------------------------------------------------------------------
// Stat Counter Indices
// ---------------------------------------------------------------------------

/// Every packet, counted once at entry.
pub const STAT_PROCESSED: u32 = 0;

/// Packets rewritten and transmitted back out.
pub const STAT_REDIRECTED: u32 = 1;

/// Reserved. No path increments this; the slot exists for future policy.
pub const STAT_DROPPED: u32 = 2;

/// Packets passed to the normal stack for protocol or listener reasons
/// (non-IPv4, non-TCP, unmonitored port). Truncated buffers pass without
/// incrementing this.
pub const STAT_PASSED: u32 = 3;

/// Packets passed because backend selection failed (missing counter or
/// empty pool slot).
pub const STAT_ABORTED: u32 = 4;

// ---------------------------------------------------------------------------
// eBPF Map Names (must match between the XDP program and the loader)
// ---------------------------------------------------------------------------

/// Map name: Array<u32> of MAX_BACKENDS backend IPv4 addresses in network
/// byte order; 0 marks an empty slot.
pub const MAP_BACKEND_POOL: &str = "BACKEND_POOL";

/// Map name: one-entry Array<u32> holding the shared round-robin counter.
pub const MAP_RR_COUNTER: &str = "RR_COUNTER";

/// Map name: HashMap<u16, u32> keyed by TCP destination port in network
/// byte order. Presence of a key marks the port as monitored; the value is
/// opaque metadata unused by the data path.
pub const MAP_LISTENER_PORTS: &str = "LISTENER_PORTS";

/// Map name: PerCpuArray<u64> of STAT_SLOTS counters.
pub const MAP_STATS: &str = "STATS";

// ---------------------------------------------------------------------------
// Protocol Constants
// ---------------------------------------------------------------------------

/// Ethernet header size.
pub const ETH_HLEN: usize = 14;

/// IPv4 header size. This design fixes the IP header at 20 bytes; packets
/// carrying IP options are not rewritten.
pub const IP_HLEN: usize = 20;

/// TCP header size without options. Only the fixed part is ever inspected.
pub const TCP_HLEN: usize = 20;

/// Minimum frame the data path will act on: Eth + IPv4 + TCP.
pub const MIN_HEADER_LEN: usize = ETH_HLEN + IP_HLEN + TCP_HLEN;

/// EtherType for IPv4.
pub const ETH_P_IP: u16 = 0x0800;

/// IP protocol number for TCP.
pub const IPPROTO_TCP: u8 = 6;

/// Byte offset of the IPv4 protocol field within the IP header.
pub const IP_PROTO_OFFSET: usize = 9;

/// Byte offset of the IPv4 header checksum within the IP header.
pub const IP_CHECK_OFFSET: usize = 10;

/// Byte offset of the IPv4 destination address within the IP header.
pub const IP_DADDR_OFFSET: usize = 16;

/// Byte offset of the TCP destination port within the TCP header.
pub const TCP_DEST_OFFSET: usize = 2;
