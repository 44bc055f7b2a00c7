//! Slave candidate selection.
//!
//! Candidates are filtered by reachability, rank and replication lag, then
//! scored by the configured criterion; ties are broken by a weighted
//! random pick so unequal servers can share read load proportionally.

use std::time::Duration;

use rand::Rng;

use crate::backend::ServerCounters;
use crate::config::SlaveSelection;
use crate::topology::{ServerInfo, ServerRole, Topology};

use super::Gtid;

/// Constraints applied before scoring
pub struct SlaveFilter<'a> {
    pub max_replication_lag: Option<Duration>,
    /// Include the master among read candidates
    pub master_accept_reads: bool,
    /// Only servers caught up to this position qualify (causal_reads=fast)
    pub required_gtid: Option<Gtid>,
    pub counters: &'a ServerCounters,
}

/// Pick a read target from the topology, or None when nothing qualifies
pub fn select_slave<'a>(
    topology: &'a Topology,
    criterion: SlaveSelection,
    filter: &SlaveFilter<'_>,
    rng: &mut impl Rng,
) -> Option<&'a ServerInfo> {
    select_slave_from(topology.servers(), criterion, filter, rng)
}

fn select_slave_from<'a>(
    servers: &'a [ServerInfo],
    criterion: SlaveSelection,
    filter: &SlaveFilter<'_>,
    rng: &mut impl Rng,
) -> Option<&'a ServerInfo> {
    let eligible: Vec<&ServerInfo> = servers
        .iter()
        .filter(|s| is_eligible(s, filter))
        .collect();

    // Only the best (lowest) rank competes
    let best_rank = eligible.iter().map(|s| s.rank).min()?;
    let ranked: Vec<&ServerInfo> = eligible
        .into_iter()
        .filter(|s| s.rank == best_rank)
        .collect();

    let best_score = ranked
        .iter()
        .map(|s| score(s, criterion, filter.counters))
        .min()?;
    let best: Vec<&ServerInfo> = ranked
        .into_iter()
        .filter(|s| score(s, criterion, filter.counters) == best_score)
        .collect();

    weighted_pick(&best, rng).copied()
}

fn is_eligible(server: &ServerInfo, filter: &SlaveFilter<'_>) -> bool {
    if !server.reachable {
        return false;
    }
    match server.role {
        ServerRole::Slave => {}
        ServerRole::Master if filter.master_accept_reads => {}
        _ => return false,
    }
    if let Some(max_lag) = filter.max_replication_lag {
        match server.replication_lag {
            Some(lag) if lag <= max_lag => {}
            // Unknown lag is treated as too far behind
            _ if server.role == ServerRole::Slave => return false,
            _ => {}
        }
    }
    if let Some(required) = filter.required_gtid {
        // The master is by definition caught up
        if server.role != ServerRole::Master {
            let caught_up = server
                .gtid_pos
                .as_deref()
                .and_then(Gtid::parse)
                .map(|pos| required.reached_by(&pos))
                .unwrap_or(false);
            if !caught_up {
                return false;
            }
        }
    }
    true
}

/// Smaller is better
fn score(server: &ServerInfo, criterion: SlaveSelection, counters: &ServerCounters) -> i64 {
    let counter = counters.counter(server.id);
    match criterion {
        SlaveSelection::LeastCurrentConnections => counter.current_ops(),
        SlaveSelection::LeastRouterConnections => counter.router_connections(),
        SlaveSelection::LeastGlobalConnections => counter.connections(),
        SlaveSelection::LeastBehindMaster => server
            .replication_lag
            .map(|lag| lag.as_millis() as i64)
            .unwrap_or(i64::MAX),
        SlaveSelection::AdaptiveRouting => counter.avg_response().as_micros() as i64,
    }
}

fn weighted_pick<'a, 'b>(
    candidates: &'b [&'a ServerInfo],
    rng: &mut impl Rng,
) -> Option<&'b &'a ServerInfo> {
    match candidates {
        [] => None,
        [single] => Some(single),
        _ => {
            let total: u64 = candidates.iter().map(|s| s.weight.max(1) as u64).sum();
            let mut roll = rng.gen_range(0..total);
            for candidate in candidates {
                let weight = candidate.weight.max(1) as u64;
                if roll < weight {
                    return Some(candidate);
                }
                roll -= weight;
            }
            candidates.last()
        }
    }
}
