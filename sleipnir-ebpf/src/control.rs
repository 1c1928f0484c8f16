//! Control-plane writes against the shared maps: shaping mappings and the
//! cache/epoch invalidation protocol, heimdall watch administration, and
//! bifrost redirect rules.
//!
//! The datapath never writes the trie and never deletes flows; everything
//! here is userspace's side of the contract.

use std::net::IpAddr;

use aya::maps::lpm_trie::{Key, LpmTrie};
use aya::maps::{Array, HashMap};
use ipnet::IpNet;
use tracing::debug;

use sleipnir_ebpf_common::bifrost::{vlan_map_key, BifrostInterface, BifrostVlan};
use sleipnir_ebpf_common::flow::{FlowEntry, FlowKey};
use sleipnir_ebpf_common::heimdall::HeimdallConfig;
use sleipnir_ebpf_common::ip::CanonicalIp;
use sleipnir_ebpf_common::mapping::ShapingMapping;

use crate::loader::Datapath;
use crate::ControlError;

/// Canonical prefix length for an `IpNet`: IPv4 prefixes sit behind the
/// 96 fixed bits of the v4 canonicalization prefix.
fn canonical_prefix(net: &IpNet) -> (u32, CanonicalIp) {
    match net {
        IpNet::V4(v4) => (
            96 + v4.prefix_len() as u32,
            CanonicalIp::from_v4_octets(v4.network().octets()),
        ),
        IpNet::V6(v6) => (
            v6.prefix_len() as u32,
            CanonicalIp::from_v6_octets(v6.network().octets()),
        ),
    }
}

impl Datapath {
    /// Insert or replace the shaping mapping for a prefix. Not visible to
    /// flows already running until [`commit_mappings`](Self::commit_mappings).
    pub fn insert_mapping(&mut self, net: IpNet, mapping: ShapingMapping) -> Result<(), ControlError> {
        let (prefix_len, addr) = canonical_prefix(&net);
        let map = self
            .ebpf
            .map_mut("map_ip_to_cpu_and_tc")
            .ok_or(ControlError::MapNotFound("map_ip_to_cpu_and_tc"))?;
        let mut trie: LpmTrie<_, CanonicalIp, ShapingMapping> = LpmTrie::try_from(map)
            .map_err(|source| ControlError::Map { name: "map_ip_to_cpu_and_tc", source })?;
        trie.insert(&Key::new(prefix_len, addr), mapping, 0)
            .map_err(|source| ControlError::Map { name: "map_ip_to_cpu_and_tc", source })?;
        debug!(%net, cpu = mapping.cpu, tc_handle = mapping.tc_handle, "mapping inserted");
        Ok(())
    }

    /// Remove the shaping mapping for a prefix.
    pub fn remove_mapping(&mut self, net: IpNet) -> Result<(), ControlError> {
        let (prefix_len, addr) = canonical_prefix(&net);
        let map = self
            .ebpf
            .map_mut("map_ip_to_cpu_and_tc")
            .ok_or(ControlError::MapNotFound("map_ip_to_cpu_and_tc"))?;
        let mut trie: LpmTrie<_, CanonicalIp, ShapingMapping> = LpmTrie::try_from(map)
            .map_err(|source| ControlError::Map { name: "map_ip_to_cpu_and_tc", source })?;
        trie.remove(&Key::new(prefix_len, addr))
            .map_err(|source| ControlError::Map { name: "map_ip_to_cpu_and_tc", source })?;
        Ok(())
    }

    /// Publish a batch of trie mutations: clear the hot cache FIRST, then
    /// advance the epoch. The order matters - the datapath may only observe
    /// the new epoch after every stale cache entry is gone, and flows then
    /// refresh their cached mapping lazily on their next packet.
    pub fn commit_mappings(&mut self) -> Result<u32, ControlError> {
        self.clear_hot_cache()?;
        let epoch = self.bump_epoch()?;
        debug!(epoch, "shaping mappings committed");
        Ok(epoch)
    }

    /// Drop every hot-cache entry (real and negative alike).
    pub fn clear_hot_cache(&mut self) -> Result<(), ControlError> {
        let map = self
            .ebpf
            .map_mut("ip_to_cpu_and_tc_hotcache")
            .ok_or(ControlError::MapNotFound("ip_to_cpu_and_tc_hotcache"))?;
        let mut cache: HashMap<_, CanonicalIp, ShapingMapping> = HashMap::try_from(map)
            .map_err(|source| ControlError::Map { name: "ip_to_cpu_and_tc_hotcache", source })?;
        let keys: Vec<CanonicalIp> = cache.keys().filter_map(Result::ok).collect();
        for key in keys {
            cache
                .remove(&key)
                .map_err(|source| ControlError::Map { name: "ip_to_cpu_and_tc_hotcache", source })?;
        }
        Ok(())
    }

    /// Advance the epoch; returns the new value.
    pub fn bump_epoch(&mut self) -> Result<u32, ControlError> {
        let map = self
            .ebpf
            .map_mut("ip_mapping_epoch")
            .ok_or(ControlError::MapNotFound("ip_mapping_epoch"))?;
        let mut epoch_map: Array<_, u32> = Array::try_from(map)
            .map_err(|source| ControlError::Map { name: "ip_mapping_epoch", source })?;
        let next = epoch_map
            .get(&0, 0)
            .map_err(|source| ControlError::Map { name: "ip_mapping_epoch", source })?
            .wrapping_add(1);
        epoch_map
            .set(0, next, 0)
            .map_err(|source| ControlError::Map { name: "ip_mapping_epoch", source })?;
        Ok(next)
    }

    /// Expire flow entries not seen since `cutoff_ns` (boot-time clock).
    /// The datapath only ever marks flows closed; reclaiming them is
    /// userspace's job (this, or LRU pressure). Returns how many were
    /// removed.
    pub fn sweep_flows(&mut self, cutoff_ns: u64) -> Result<usize, ControlError> {
        let map = self
            .ebpf
            .map_mut("flowbee")
            .ok_or(ControlError::MapNotFound("flowbee"))?;
        let mut flows: HashMap<_, FlowKey, FlowEntry> = HashMap::try_from(map)
            .map_err(|source| ControlError::Map { name: "flowbee", source })?;
        let stale: Vec<FlowKey> = flows
            .iter()
            .filter_map(Result::ok)
            .filter(|(_, entry)| entry.last_seen < cutoff_ns)
            .map(|(key, _)| key)
            .collect();
        for key in &stale {
            flows
                .remove(key)
                .map_err(|source| ControlError::Map { name: "flowbee", source })?;
        }
        if !stale.is_empty() {
            debug!(removed = stale.len(), "stale flows swept");
        }
        Ok(stale.len())
    }

    /// Set the heimdall monitor mode (0 = off, 1 = count only, 2 = full
    /// capture).
    pub fn set_monitor_mode(&mut self, mode: u32) -> Result<(), ControlError> {
        let map = self
            .ebpf
            .map_mut("heimdall_config")
            .ok_or(ControlError::MapNotFound("heimdall_config"))?;
        let mut cfg: Array<_, HeimdallConfig> = Array::try_from(map)
            .map_err(|source| ControlError::Map { name: "heimdall_config", source })?;
        cfg.set(0, HeimdallConfig { monitor_mode: mode }, 0)
            .map_err(|source| ControlError::Map { name: "heimdall_config", source })?;
        Ok(())
    }

    /// Add an address to the heimdall watch list.
    pub fn watch(&mut self, ip: IpAddr) -> Result<(), ControlError> {
        let map = self
            .ebpf
            .map_mut("heimdall_watching")
            .ok_or(ControlError::MapNotFound("heimdall_watching"))?;
        let mut watching: HashMap<_, CanonicalIp, u32> = HashMap::try_from(map)
            .map_err(|source| ControlError::Map { name: "heimdall_watching", source })?;
        watching
            .insert(CanonicalIp::from(ip), 1, 0)
            .map_err(|source| ControlError::Map { name: "heimdall_watching", source })?;
        Ok(())
    }

    /// Remove an address from the heimdall watch list.
    pub fn unwatch(&mut self, ip: IpAddr) -> Result<(), ControlError> {
        let map = self
            .ebpf
            .map_mut("heimdall_watching")
            .ok_or(ControlError::MapNotFound("heimdall_watching"))?;
        let mut watching: HashMap<_, CanonicalIp, u32> = HashMap::try_from(map)
            .map_err(|source| ControlError::Map { name: "heimdall_watching", source })?;
        watching
            .remove(&CanonicalIp::from(ip))
            .map_err(|source| ControlError::Map { name: "heimdall_watching", source })?;
        Ok(())
    }

    /// Install a bridge-bypass rule: frames arriving on `from` leave via
    /// `to`. With `scan_vlans`, only tagged frames are redirected and the
    /// VLAN rewrite rules below apply.
    pub fn set_interface_redirect(
        &mut self,
        from: u32,
        to: u32,
        scan_vlans: bool,
    ) -> Result<(), ControlError> {
        let map = self
            .ebpf
            .map_mut("bifrost_interface_map")
            .ok_or(ControlError::MapNotFound("bifrost_interface_map"))?;
        let mut rules: HashMap<_, u32, BifrostInterface> = HashMap::try_from(map)
            .map_err(|source| ControlError::Map { name: "bifrost_interface_map", source })?;
        let rule = BifrostInterface { redirect_to: to, scan_vlans: scan_vlans.into() };
        rules
            .insert(from, rule, 0)
            .map_err(|source| ControlError::Map { name: "bifrost_interface_map", source })?;
        Ok(())
    }

    /// Install a VLAN rewrite: frames on `ifindex` tagged `from_vlan` get
    /// retagged to `to_vlan` during dissection.
    pub fn set_vlan_redirect(
        &mut self,
        ifindex: u32,
        from_vlan: u16,
        to_vlan: u16,
    ) -> Result<(), ControlError> {
        let map = self
            .ebpf
            .map_mut("bifrost_vlan_map")
            .ok_or(ControlError::MapNotFound("bifrost_vlan_map"))?;
        let mut rules: HashMap<_, u32, BifrostVlan> = HashMap::try_from(map)
            .map_err(|source| ControlError::Map { name: "bifrost_vlan_map", source })?;
        rules
            .insert(vlan_map_key(ifindex, from_vlan), BifrostVlan { redirect_to: to_vlan as u32 }, 0)
            .map_err(|source| ControlError::Map { name: "bifrost_vlan_map", source })?;
        Ok(())
    }
}
