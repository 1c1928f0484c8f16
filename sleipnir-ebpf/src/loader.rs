//! Datapath lifecycle: load the kernel object, patch the load-time globals,
//! arm the CPU redirect infrastructure, and attach the hooks.

use std::path::{Path, PathBuf};

use aya::maps::xdp::CpuMap;
use aya::maps::Array;
use aya::programs::{tc, SchedClassifier, TcAttachType, Xdp, XdpFlags};
use aya::{Ebpf, EbpfLoader};
use tracing::{debug, info, warn};

use sleipnir_ebpf_common::txq::TxqConfig;

use crate::{ControlError, DatapathError};

#[cfg(feature = "bundle-bpf")]
/// Raw bytes of the compiled datapath object, embedded at compile time.
/// `include_bytes_aligned!` ensures the alignment aya's ELF parser needs.
static DATAPATH_BPF_BYTES: &[u8] =
    aya::include_bytes_aligned!(concat!(env!("OUT_DIR"), "/sleipnir.bpf.o"));

/// XDP program name inside the object.
const XDP_PROGRAM: &str = "sleipnir_xdp";
/// TC egress program name.
const TC_EGRESS_PROGRAM: &str = "sleipnir_tc_egress";
/// TC ingress bridge-bypass program name.
const BIFROST_PROGRAM: &str = "bifrost";

/// Ring size handed to the kernel for each redirect CPU.
const CPU_REDIRECT_QUEUE: u32 = 2048;

/// Which way traffic on an attached interface faces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// The interface faces upstream; traffic seen here is upload.
    ToInternet,
    /// The interface faces the subscribers; traffic seen here is download.
    ToLocal,
    /// Single interface carrying both sides, split by VLAN tag.
    OnAStick,
}

impl Direction {
    fn as_global(self) -> u32 {
        match self {
            Direction::ToInternet => 1,
            Direction::ToLocal => 2,
            Direction::OnAStick => 3,
        }
    }
}

/// Load-time configuration. Written once into the object's globals before
/// the kernel verifies it; read-only thereafter.
#[derive(Clone, Debug)]
pub struct DatapathConfig {
    pub direction: Direction,
    /// VLAN tag of the Internet-facing side in stick mode (host order).
    pub internet_vlan: u16,
    /// VLAN tag of the subscriber-facing side in stick mode (host order).
    pub isp_vlan: u16,
    /// Added to the CPU and qdisc major when deriving upload classes in
    /// stick mode.
    pub stick_offset: u32,
    /// Keep the LRU hot cache in front of the LPM trie.
    pub hot_cache: bool,
    /// Emit kernel trace-pipe breadcrumbs for dropped measurements.
    pub verbose: bool,
    /// bpffs directory the shared maps are pinned under.
    pub pin_path: PathBuf,
}

impl Default for DatapathConfig {
    fn default() -> Self {
        Self {
            direction: Direction::ToLocal,
            internet_vlan: 0,
            isp_vlan: 0,
            stick_offset: 0,
            hot_cache: true,
            verbose: false,
            pin_path: PathBuf::from("/sys/fs/bpf/sleipnir"),
        }
    }
}

/// The loaded datapath. Owns the kernel object; maps and programs live as
/// long as this does, and links detach when it drops.
pub struct Datapath {
    pub(crate) ebpf: Ebpf,
    config: DatapathConfig,
}

impl Datapath {
    /// Load the datapath from a compiled object file on disk.
    pub fn load(object: impl AsRef<Path>, config: DatapathConfig) -> Result<Self, DatapathError> {
        let path = object.as_ref();
        let bytes = std::fs::read(path).map_err(|source| DatapathError::ReadObject {
            path: path.to_path_buf(),
            source,
        })?;
        Self::load_bytes(&bytes, config)
    }

    /// Load the datapath object embedded at compile time.
    #[cfg(feature = "bundle-bpf")]
    pub fn load_bundled(config: DatapathConfig) -> Result<Self, DatapathError> {
        Self::load_bytes(DATAPATH_BPF_BYTES, config)
    }

    fn load_bytes(bytes: &[u8], config: DatapathConfig) -> Result<Self, DatapathError> {
        // Remove the locked-memory limit so map creation does not depend on
        // the deployment environment's ulimits.
        unsafe {
            let rlim =
                libc::rlimit { rlim_cur: libc::RLIM_INFINITY, rlim_max: libc::RLIM_INFINITY };
            let _ = libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim);
        }

        std::fs::create_dir_all(&config.pin_path).map_err(|source| DatapathError::PinDir {
            path: config.pin_path.clone(),
            source,
        })?;

        // The kernel compares the frame's TCI (network order) against these
        // globals, so store them big-endian.
        let direction: u32 = config.direction.as_global();
        let internet_vlan: u16 = config.internet_vlan.to_be();
        let isp_vlan: u16 = config.isp_vlan.to_be();
        let stick_offset: u32 = config.stick_offset;
        let hot_cache_enabled: u32 = config.hot_cache.into();
        let verbose: u32 = config.verbose.into();

        let mut ebpf = EbpfLoader::new()
            .map_pin_path(&config.pin_path)
            .set_global("direction", &direction, false)
            .set_global("internet_vlan", &internet_vlan, false)
            .set_global("isp_vlan", &isp_vlan, false)
            .set_global("stick_offset", &stick_offset, false)
            .set_global("hot_cache_enabled", &hot_cache_enabled, false)
            .set_global("verbose", &verbose, false)
            .load(bytes)
            .map_err(DatapathError::Load)?;

        load_xdp(&mut ebpf, XDP_PROGRAM)?;
        load_classifier(&mut ebpf, TC_EGRESS_PROGRAM)?;
        load_classifier(&mut ebpf, BIFROST_PROGRAM)?;

        let mut datapath = Self { ebpf, config };
        datapath.arm_cpu_redirect()?;
        info!(direction = ?datapath.config.direction, "sleipnir datapath loaded");
        Ok(datapath)
    }

    /// Populate `cpu_map`, `cpus_available` and `map_txq_config` for every
    /// possible CPU. Must run before the first packet redirects.
    fn arm_cpu_redirect(&mut self) -> Result<(), DatapathError> {
        let cpus = aya::util::nr_cpus().map_err(|(_, e)| DatapathError::CpuCount(e))? as u32;

        {
            let map = self
                .ebpf
                .map_mut("cpu_map")
                .ok_or(ControlError::MapNotFound("cpu_map"))?;
            let mut cpu_map = CpuMap::try_from(map).map_err(|source| ControlError::Map {
                name: "cpu_map",
                source,
            })?;
            for cpu in 0..cpus {
                cpu_map
                    .set(cpu, CPU_REDIRECT_QUEUE, None, 0)
                    .map_err(|source| {
                        let source = match source {
                            aya::maps::xdp::XdpMapError::MapError(source) => source,
                            other => aya::maps::MapError::IoError(std::io::Error::other(
                                other.to_string(),
                            )),
                        };
                        ControlError::Map { name: "cpu_map", source }
                    })?;
            }
        }
        {
            let map = self
                .ebpf
                .map_mut("cpus_available")
                .ok_or(ControlError::MapNotFound("cpus_available"))?;
            let mut available: Array<_, u32> =
                Array::try_from(map).map_err(|source| ControlError::Map {
                    name: "cpus_available",
                    source,
                })?;
            for cpu in 0..cpus {
                available
                    .set(cpu, cpu, 0)
                    .map_err(|source| ControlError::Map { name: "cpus_available", source })?;
            }
        }
        {
            let map = self
                .ebpf
                .map_mut("map_txq_config")
                .ok_or(ControlError::MapNotFound("map_txq_config"))?;
            let mut txq: Array<_, TxqConfig> =
                Array::try_from(map).map_err(|source| ControlError::Map {
                    name: "map_txq_config",
                    source,
                })?;
            for cpu in 0..cpus {
                // Queue and HTB major are 1-based; 0 means unconfigured.
                let cfg = TxqConfig {
                    queue_mapping: (cpu + 1) as u16,
                    htb_major: (cpu + 1) as u16,
                };
                txq.set(cpu, cfg, 0)
                    .map_err(|source| ControlError::Map { name: "map_txq_config", source })?;
            }
        }
        debug!(cpus, "CPU redirect infrastructure armed");
        Ok(())
    }

    /// Attach the ingress XDP hook and the egress priority stamper to an
    /// interface. Call once per shaped interface (twice total in a
    /// two-interface bridge, once in stick mode).
    pub fn attach(&mut self, interface: &str) -> Result<(), DatapathError> {
        let xdp: &mut Xdp = self
            .ebpf
            .program_mut(XDP_PROGRAM)
            .ok_or(DatapathError::ProgramNotFound(XDP_PROGRAM))?
            .try_into()
            .map_err(|source| DatapathError::ProgramType { name: XDP_PROGRAM, source })?;
        // Prefer driver mode; fall back to generic for NICs without native
        // XDP support.
        if let Err(e) = xdp.attach(interface, XdpFlags::DRV_MODE) {
            warn!(interface, error = %e, "driver-mode XDP refused, using generic mode");
            xdp.attach(interface, XdpFlags::SKB_MODE)
                .map_err(|source| DatapathError::Attach {
                    name: XDP_PROGRAM,
                    interface: interface.to_string(),
                    source,
                })?;
        }

        ensure_clsact(interface)?;
        let egress: &mut SchedClassifier = self
            .ebpf
            .program_mut(TC_EGRESS_PROGRAM)
            .ok_or(DatapathError::ProgramNotFound(TC_EGRESS_PROGRAM))?
            .try_into()
            .map_err(|source| DatapathError::ProgramType { name: TC_EGRESS_PROGRAM, source })?;
        egress
            .attach(interface, TcAttachType::Egress)
            .map_err(|source| DatapathError::Attach {
                name: TC_EGRESS_PROGRAM,
                interface: interface.to_string(),
                source,
            })?;

        info!(interface, "datapath attached");
        Ok(())
    }

    /// Attach the bifrost bridge-bypass program to an interface's TC
    /// ingress. Only meaningful for interfaces with a redirect rule.
    pub fn attach_bridge(&mut self, interface: &str) -> Result<(), DatapathError> {
        ensure_clsact(interface)?;
        let bifrost: &mut SchedClassifier = self
            .ebpf
            .program_mut(BIFROST_PROGRAM)
            .ok_or(DatapathError::ProgramNotFound(BIFROST_PROGRAM))?
            .try_into()
            .map_err(|source| DatapathError::ProgramType { name: BIFROST_PROGRAM, source })?;
        bifrost
            .attach(interface, TcAttachType::Ingress)
            .map_err(|source| DatapathError::Attach {
                name: BIFROST_PROGRAM,
                interface: interface.to_string(),
                source,
            })?;
        info!(interface, "bifrost bridge bypass attached");
        Ok(())
    }

    pub fn config(&self) -> &DatapathConfig {
        &self.config
    }
}

fn load_xdp(ebpf: &mut Ebpf, name: &'static str) -> Result<(), DatapathError> {
    let program: &mut Xdp = ebpf
        .program_mut(name)
        .ok_or(DatapathError::ProgramNotFound(name))?
        .try_into()
        .map_err(|source| DatapathError::ProgramType { name, source })?;
    program
        .load()
        .map_err(|source| DatapathError::ProgramLoad { name, source })
}

fn load_classifier(ebpf: &mut Ebpf, name: &'static str) -> Result<(), DatapathError> {
    let program: &mut SchedClassifier = ebpf
        .program_mut(name)
        .ok_or(DatapathError::ProgramNotFound(name))?
        .try_into()
        .map_err(|source| DatapathError::ProgramType { name, source })?;
    program
        .load()
        .map_err(|source| DatapathError::ProgramLoad { name, source })
}

/// Create the clsact qdisc if it is not already there; an existing one is
/// fine (repeated runs, or the operator added it).
fn ensure_clsact(interface: &str) -> Result<(), DatapathError> {
    match tc::qdisc_add_clsact(interface) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(source) => Err(DatapathError::Qdisc { interface: interface.to_string(), source }),
    }
}
