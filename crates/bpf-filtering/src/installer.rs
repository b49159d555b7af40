use anyhow::{Context, Result};
use bpf_common::{
    Program, ProgramError, SharedCell, SharedMap,
    aya::{
        Pod,
        maps::{Array, HashMap, MapData},
    },
    maps::{MemoryCell, MemoryMap},
};

use crate::{FilterConfig, NS_ALLOW_MAP, NS_DENY_MAP, PID_ALLOW_MAP, PID_DENY_MAP, POLICY_MAP};

/// Capacity of the in-memory lists, matching the `max_entries` of the maps.
const LIST_CAPACITY: usize = 1024;

/// The maps consulted by the entry-time predicate.
#[derive(Clone)]
pub struct FilterTables<C, P, N> {
    pub policy: C,
    pub pid_allow: P,
    pub pid_deny: P,
    pub ns_allow: N,
    pub ns_deny: N,
}

pub type BpfFilterTables =
    FilterTables<Array<MapData, u32>, HashMap<MapData, u32, u8>, HashMap<MapData, u64, u8>>;

pub type MemoryFilterTables = FilterTables<MemoryCell<u32>, MemoryMap<u32, u8>, MemoryMap<u64, u8>>;

impl BpfFilterTables {
    /// Take the filter maps out of a loaded program, dropping entries left
    /// over in pinned maps by a previous run.
    pub fn load(program: &mut Program) -> Result<Self, ProgramError> {
        let policy = Array::try_from(program.take_map(POLICY_MAP)?)?;
        let mut tables = FilterTables {
            policy,
            pid_allow: HashMap::try_from(program.take_map(PID_ALLOW_MAP)?)?,
            pid_deny: HashMap::try_from(program.take_map(PID_DENY_MAP)?)?,
            ns_allow: HashMap::try_from(program.take_map(NS_ALLOW_MAP)?)?,
            ns_deny: HashMap::try_from(program.take_map(NS_DENY_MAP)?)?,
        };
        tables.policy.set(0, 0, 0)?;
        clear(&mut tables.pid_allow)?;
        clear(&mut tables.pid_deny)?;
        clear(&mut tables.ns_allow)?;
        clear(&mut tables.ns_deny)?;
        Ok(tables)
    }
}

impl MemoryFilterTables {
    pub fn in_memory() -> Self {
        FilterTables {
            policy: MemoryCell::new(0),
            pid_allow: MemoryMap::with_capacity(LIST_CAPACITY),
            pid_deny: MemoryMap::with_capacity(LIST_CAPACITY),
            ns_allow: MemoryMap::with_capacity(LIST_CAPACITY),
            ns_deny: MemoryMap::with_capacity(LIST_CAPACITY),
        }
    }
}

fn clear<K: Pod, V: Pod>(map: &mut HashMap<MapData, K, V>) -> Result<(), ProgramError> {
    let keys = map.keys().collect::<Result<Vec<K>, _>>()?;
    for key in keys {
        map.remove(&key)?;
    }
    Ok(())
}

/// Write the configured lists, then enable the rules.
pub fn install_filters<C, P, N>(tables: &mut FilterTables<C, P, N>, config: &FilterConfig) -> Result<()>
where
    C: SharedCell<u32>,
    P: SharedMap<u32, u8>,
    N: SharedMap<u64, u8>,
{
    for pid in &config.pid_allowlist {
        tables
            .pid_allow
            .put(*pid, 1)
            .with_context(|| format!("Error inserting {pid} in pid allow-list"))?;
    }
    for pid in &config.pid_denylist {
        tables
            .pid_deny
            .put(*pid, 1)
            .with_context(|| format!("Error inserting {pid} in pid deny-list"))?;
    }
    for ns in &config.ns_allowlist {
        tables
            .ns_allow
            .put(*ns, 1)
            .with_context(|| format!("Error inserting {ns} in namespace allow-list"))?;
    }
    for ns in &config.ns_denylist {
        tables
            .ns_deny
            .put(*ns, 1)
            .with_context(|| format!("Error inserting {ns} in namespace deny-list"))?;
    }

    let policy = config.policy();
    tables
        .policy
        .store(policy.as_raw())
        .context("Error setting filter policy")?;
    log::info!("Filter policy installed: {policy:?}");
    Ok(())
}
