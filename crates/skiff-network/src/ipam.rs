//! IPv4 address management.
//!
//! Each network owns one subnet. Inside it the network address, the broadcast
//! address and the gateway are reserved; everything else is handed out
//! lowest-first, one address per container.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use skiff_common::{ContainerId, NetworkId, SkiffError, SkiffResult};

use crate::config::AddressPool;

/// Longest prefix that still leaves a gateway and one container address.
pub const MAX_PREFIX_LEN: u8 = 30;

/// Validate a subnet given by a user.
///
/// # Errors
///
/// Returns [`SkiffError::InvalidSubnet`] if host bits are set or the subnet
/// is too small to hold a gateway and a container.
pub fn validate_subnet(subnet: Ipv4Net) -> SkiffResult<Ipv4Net> {
    if subnet.trunc() != subnet {
        return Err(SkiffError::InvalidSubnet {
            subnet: subnet.to_string(),
            reason: format!("host bits set, did you mean {}?", subnet.trunc()),
        });
    }
    if subnet.prefix_len() > MAX_PREFIX_LEN {
        return Err(SkiffError::InvalidSubnet {
            subnet: subnet.to_string(),
            reason: format!("prefix longer than /{MAX_PREFIX_LEN} leaves no container addresses"),
        });
    }
    Ok(subnet)
}

/// The conventional gateway of a subnet: its first usable address.
///
/// # Errors
///
/// Returns [`SkiffError::InvalidSubnet`] for subnets without usable hosts.
pub fn gateway_for(subnet: Ipv4Net) -> SkiffResult<Ipv4Addr> {
    let subnet = validate_subnet(subnet)?;
    Ok(Ipv4Addr::from(u32::from(subnet.network()) + 1))
}

fn overlaps(a: &Ipv4Net, b: &Ipv4Net) -> bool {
    a.contains(&b.network()) || b.contains(&a.network())
}

/// Address allocations of one network.
#[derive(Debug, Clone)]
struct SubnetPool {
    subnet: Ipv4Net,
    gateway: Ipv4Addr,
    by_address: BTreeMap<Ipv4Addr, ContainerId>,
    by_container: HashMap<ContainerId, Ipv4Addr>,
}

impl SubnetPool {
    fn new(subnet: Ipv4Net, gateway: Ipv4Addr) -> SkiffResult<Self> {
        let subnet = validate_subnet(subnet)?;
        let pool = Self {
            subnet,
            gateway,
            by_address: BTreeMap::new(),
            by_container: HashMap::new(),
        };
        if !subnet.contains(&gateway) || pool.is_network_or_broadcast(gateway) {
            return Err(SkiffError::AddressConflict {
                address: gateway.to_string(),
                reason: format!("gateway must be a host address of {subnet}"),
            });
        }
        Ok(pool)
    }

    fn is_network_or_broadcast(&self, addr: Ipv4Addr) -> bool {
        addr == self.subnet.network() || addr == self.subnet.broadcast()
    }

    fn check_requested(&self, network: &NetworkId, addr: Ipv4Addr) -> SkiffResult<()> {
        let conflict = |reason: String| SkiffError::AddressConflict {
            address: addr.to_string(),
            reason,
        };
        if !self.subnet.contains(&addr) {
            return Err(conflict(format!(
                "outside subnet {} of network {}",
                self.subnet,
                network.short()
            )));
        }
        if addr == self.gateway {
            return Err(conflict("address is the network gateway".to_string()));
        }
        if self.is_network_or_broadcast(addr) {
            return Err(conflict("network and broadcast addresses are reserved".to_string()));
        }
        if let Some(owner) = self.by_address.get(&addr) {
            return Err(conflict(format!("already assigned to container {}", owner.short())));
        }
        Ok(())
    }

    fn lowest_free(&self) -> Option<Ipv4Addr> {
        let first = u32::from(self.subnet.network()) + 1;
        let last = u32::from(self.subnet.broadcast()) - 1;
        (first..=last)
            .map(Ipv4Addr::from)
            .find(|addr| *addr != self.gateway && !self.by_address.contains_key(addr))
    }

    fn insert(&mut self, container: &ContainerId, addr: Ipv4Addr) {
        self.by_address.insert(addr, container.clone());
        self.by_container.insert(container.clone(), addr);
    }
}

/// The address manager for every live network.
#[derive(Debug, Clone, Default)]
pub struct Ipam {
    pools: HashMap<NetworkId, SubnetPool>,
}

impl Ipam {
    /// Create an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start managing a network's subnet.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::InvalidSubnet`] if the subnet is malformed or
    /// overlaps another network, and [`SkiffError::AddressConflict`] for a
    /// gateway outside the subnet.
    pub fn add_network(
        &mut self,
        network: &NetworkId,
        subnet: Ipv4Net,
        gateway: Ipv4Addr,
    ) -> SkiffResult<()> {
        let pool = SubnetPool::new(subnet, gateway)?;
        let clash = self
            .pools
            .iter()
            .find(|(id, other)| *id != network && overlaps(&other.subnet, &subnet));
        if let Some((other, _)) = clash {
            return Err(SkiffError::InvalidSubnet {
                subnet: subnet.to_string(),
                reason: format!("overlaps network {}", other.short()),
            });
        }
        self.pools.insert(network.clone(), pool);
        Ok(())
    }

    /// Stop managing a network, dropping all its allocations.
    pub fn remove_network(&mut self, network: &NetworkId) -> bool {
        self.pools.remove(network).is_some()
    }

    /// The network whose subnet overlaps `subnet`, if any.
    #[must_use]
    pub fn overlapping(&self, subnet: Ipv4Net) -> Option<&NetworkId> {
        self.pools
            .iter()
            .find(|(_, pool)| overlaps(&pool.subnet, &subnet))
            .map(|(id, _)| id)
    }

    /// Pick the first subnet from `pools` that overlaps no live network.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::InvalidSubnet`] when every pool is used up.
    pub fn next_free_subnet(&self, pools: &[AddressPool]) -> SkiffResult<Ipv4Net> {
        for pool in pools {
            let Ok(candidates) = pool.base.subnets(pool.size) else {
                continue;
            };
            for candidate in candidates {
                if self.overlapping(candidate).is_none() {
                    return Ok(candidate);
                }
            }
        }
        Err(SkiffError::InvalidSubnet {
            subnet: "auto".to_string(),
            reason: "all address pools are fully subnetted".to_string(),
        })
    }

    /// Allocate an address for a container.
    ///
    /// With `preferred` the exact address is validated and reserved;
    /// otherwise the lowest free address is used.
    ///
    /// # Errors
    ///
    /// [`SkiffError::NetworkNotFound`] for an unmanaged network,
    /// [`SkiffError::AddressConflict`] for an unusable preferred address or a
    /// container that already holds one, [`SkiffError::AddressExhausted`]
    /// when nothing is left.
    pub fn allocate(
        &mut self,
        network: &NetworkId,
        container: &ContainerId,
        preferred: Option<Ipv4Addr>,
    ) -> SkiffResult<Ipv4Addr> {
        let pool = self.pool_mut(network)?;
        if let Some(existing) = pool.by_container.get(container) {
            return Err(SkiffError::AddressConflict {
                address: existing.to_string(),
                reason: format!("container {} already holds an address", container.short()),
            });
        }

        let addr = match preferred {
            Some(addr) => {
                pool.check_requested(network, addr)?;
                addr
            }
            None => pool.lowest_free().ok_or_else(|| SkiffError::AddressExhausted {
                network: network.to_string(),
                subnet: pool.subnet.to_string(),
            })?,
        };
        pool.insert(container, addr);
        tracing::debug!(network = %network.short(), container = %container.short(), %addr, "Allocated address");
        Ok(addr)
    }

    /// Re-reserve an address recorded earlier, e.g. from persisted state.
    ///
    /// # Errors
    ///
    /// Same as a preferred-address [`Self::allocate`].
    pub fn reserve(
        &mut self,
        network: &NetworkId,
        container: &ContainerId,
        addr: Ipv4Addr,
    ) -> SkiffResult<()> {
        self.allocate(network, container, Some(addr)).map(|_| ())
    }

    /// Release a container's address. Releasing twice is a no-op.
    pub fn release(&mut self, network: &NetworkId, container: &ContainerId) -> Option<Ipv4Addr> {
        let pool = self.pools.get_mut(network)?;
        let addr = pool.by_container.remove(container)?;
        pool.by_address.remove(&addr);
        tracing::debug!(network = %network.short(), container = %container.short(), %addr, "Released address");
        Some(addr)
    }

    fn pool_mut(&mut self, network: &NetworkId) -> SkiffResult<&mut SubnetPool> {
        self.pools
            .get_mut(network)
            .ok_or_else(|| SkiffError::NetworkNotFound {
                id: network.to_string(),
            })
    }
}
