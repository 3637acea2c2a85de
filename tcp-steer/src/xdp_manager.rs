//! XDP program lifecycle manager.
//!
//! Loads the XDP eBPF program, attaches it to the network interface,
//! populates the backend pool and listener maps, initializes the
//! round-robin counter, and reads back the per-CPU stat counters.
//!
//! This is the whole control plane for XDP mode: the data path only ever
//! reads what this writes (and advances the counter).

use anyhow::{bail, Context, Result};
use aya::maps::{Array, HashMap, PerCpuArray};
use aya::programs::{Xdp, XdpFlags};
use aya::Ebpf;
use tracing::{info, warn};

use tcp_steer_common::{
    MAP_BACKEND_POOL, MAP_LISTENER_PORTS, MAP_RR_COUNTER, MAP_STATS, MAX_BACKENDS, STAT_ABORTED,
    STAT_DROPPED, STAT_PASSED, STAT_PROCESSED, STAT_REDIRECTED,
};

use crate::config::Config;
use crate::stats::StatsSnapshot;

// ---------------------------------------------------------------------------
// Public Interface
// ---------------------------------------------------------------------------

/// Manages the lifecycle of the XDP program and its maps.
pub struct XdpManager {
    bpf: Ebpf,
    attached_interface: Option<String>,
}

impl XdpManager {
    /// Load the XDP eBPF program from the ELF binary.
    pub fn load(ebpf_bytes: &[u8]) -> Result<Self> {
        let mut bpf = Ebpf::load(ebpf_bytes).context("loading XDP eBPF program")?;

        // Initialize aya-log if available
        if let Err(e) = aya_log::EbpfLogger::init(&mut bpf) {
            warn!("XDP eBPF logging not available: {}", e);
        }

        Ok(Self {
            bpf,
            attached_interface: None,
        })
    }

    /// Attach the XDP program to a network interface.
    ///
    /// Tries native (driver) mode first, falls back to SKB (generic) mode.
    pub fn attach(&mut self, iface: &str) -> Result<()> {
        let program: &mut Xdp = self
            .bpf
            .program_mut("tcp_steer")
            .context("XDP program 'tcp_steer' not found")?
            .try_into()
            .context("program type mismatch (expected Xdp)")?;

        program.load().context("loading XDP program")?;

        match program.attach(iface, XdpFlags::default()) {
            Ok(_link_id) => {
                info!(interface = iface, mode = "native", "attached XDP program");
            }
            Err(native_err) => {
                warn!(
                    interface = iface,
                    error = %native_err,
                    "native XDP attach failed, trying SKB mode"
                );
                program
                    .attach(iface, XdpFlags::SKB_MODE)
                    .with_context(|| {
                        format!(
                            "attaching XDP to {} (both native and SKB failed; native error: {})",
                            iface, native_err
                        )
                    })?;
                info!(interface = iface, mode = "skb", "attached XDP program");
            }
        }

        self.attached_interface = Some(iface.to_string());
        Ok(())
    }

    /// Write the backend pool slots and zero the round-robin counter.
    ///
    /// Slot values are stored in network byte order so the XDP program can
    /// write them into the IPv4 header without a swap. Slots beyond the
    /// configured list stay at their zero (unpopulated) default.
    pub fn populate_backends(&mut self, backends: &[std::net::Ipv4Addr]) -> Result<()> {
        if backends.len() > MAX_BACKENDS as usize {
            bail!(
                "backend pool capacity is {}, got {}",
                MAX_BACKENDS,
                backends.len()
            );
        }

        let mut pool: Array<_, u32> = self
            .bpf
            .map_mut(MAP_BACKEND_POOL)
            .context("BACKEND_POOL map not found")?
            .try_into()
            .context("BACKEND_POOL map type mismatch")?;

        for (i, backend) in backends.iter().enumerate() {
            let addr_be = u32::from_ne_bytes(backend.octets());
            pool.set(i as u32, addr_be, 0)
                .with_context(|| format!("writing backend {} into slot {}", backend, i))?;
        }

        let mut counter: Array<_, u32> = self
            .bpf
            .map_mut(MAP_RR_COUNTER)
            .context("RR_COUNTER map not found")?
            .try_into()
            .context("RR_COUNTER map type mismatch")?;
        counter
            .set(0, 0u32, 0)
            .context("initializing round-robin counter")?;

        info!(backends = backends.len(), "populated backend pool");
        Ok(())
    }

    /// Mark a TCP destination port as monitored.
    ///
    /// The key is stored in network byte order for direct comparison against
    /// the TCP header field in the XDP program. The value is opaque metadata;
    /// only key presence matters to the data path.
    pub fn register_listener(&mut self, port: u16) -> Result<()> {
        let mut listeners: HashMap<_, u16, u32> = self
            .bpf
            .map_mut(MAP_LISTENER_PORTS)
            .context("LISTENER_PORTS map not found")?
            .try_into()
            .context("LISTENER_PORTS map type mismatch")?;

        listeners
            .insert(port.to_be(), 1u32, 0)
            .with_context(|| format!("inserting port {} into LISTENER_PORTS", port))?;

        info!(port, "registered listener port");
        Ok(())
    }

    /// Stop monitoring a TCP destination port.
    #[allow(dead_code)]
    pub fn unregister_listener(&mut self, port: u16) -> Result<()> {
        let mut listeners: HashMap<_, u16, u32> = self
            .bpf
            .map_mut(MAP_LISTENER_PORTS)
            .context("LISTENER_PORTS map not found")?
            .try_into()
            .context("LISTENER_PORTS map type mismatch")?;

        listeners
            .remove(&port.to_be())
            .with_context(|| format!("removing port {} from LISTENER_PORTS", port))?;

        info!(port, "unregistered listener port");
        Ok(())
    }

    /// Populate all maps from config and attach to the configured interface.
    pub fn setup(&mut self, config: &Config) -> Result<()> {
        self.populate_backends(&config.backends)
            .context("populating backend pool")?;

        for &port in &config.listeners {
            self.register_listener(port)
                .with_context(|| format!("registering listener port {}", port))?;
        }

        self.attach(&config.interface)
            .with_context(|| format!("attaching XDP to {}", config.interface))?;

        Ok(())
    }

    /// Read the stat counters, summed across CPUs.
    pub fn read_stats(&self) -> Result<StatsSnapshot> {
        let stats: PerCpuArray<_, u64> = self
            .bpf
            .map(MAP_STATS)
            .context("STATS map not found")?
            .try_into()
            .context("STATS map type mismatch")?;

        let sum = |idx: u32| -> Result<u64> {
            let per_cpu = stats
                .get(&idx, 0)
                .with_context(|| format!("reading stat slot {}", idx))?;
            Ok(per_cpu.iter().sum())
        };

        Ok(StatsSnapshot {
            processed: sum(STAT_PROCESSED)?,
            redirected: sum(STAT_REDIRECTED)?,
            dropped: sum(STAT_DROPPED)?,
            passed: sum(STAT_PASSED)?,
            aborted: sum(STAT_ABORTED)?,
        })
    }

    /// Detach the XDP program and clean up.
    pub fn detach(self) -> Result<()> {
        if let Some(ref iface) = self.attached_interface {
            info!(interface = %iface, "detaching XDP program");
            // aya detaches when the Ebpf object is dropped; the log line is
            // the only explicit work.
        }
        Ok(())
    }
}
