//! Message and byte accounting for the simulated RPC layer.
//!
//! Every remote interaction is an ordinary function call; what is
//! tallied here is what it would have cost on the wire. Counters are
//! kept per directed channel and per endpoint, with request and response
//! legs accounted separately so that per-endpoint response traffic (e.g.
//! the drift bytes pulled by the coordinator) can be reported on its
//! own.

use rustc_hash::FxHashMap;

/// A host of the simulated network: the coordinator or one site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Host {
    Coordinator,
    Site(usize),
}

/// Logical RPC endpoints of the monitoring protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Endpoint {
    /// New-round reset carrying a safe zone (oneway).
    Reset,
    /// Drift snapshot pull (request/response).
    GetDrift,
    /// Rebalanced drift push (oneway).
    SetDrift,
    /// Local-violation signal (oneway).
    LocalViolation,
    /// Sketch push of the plain monitoring method (oneway).
    Update,
}

/// Request or response leg of an RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Leg {
    Request,
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct ChannelKey {
    src: Host,
    dst: Host,
    endpoint: Endpoint,
    leg: Leg,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelStats {
    pub msgs: usize,
    pub bytes: usize,
}

/// All traffic counters of one simulated network.
#[derive(Debug, Default)]
pub struct ChannelTable {
    channels: FxHashMap<ChannelKey, ChannelStats>,
}

impl ChannelTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn count(&mut self, src: Host, dst: Host, endpoint: Endpoint, leg: Leg, bytes: usize) {
        let stats = self
            .channels
            .entry(ChannelKey {
                src,
                dst,
                endpoint,
                leg,
            })
            .or_default();
        stats.msgs += 1;
        stats.bytes += bytes;
    }

    /// Account a oneway call: a single request leg.
    pub fn oneway(&mut self, src: Host, dst: Host, endpoint: Endpoint, bytes: usize) {
        self.count(src, dst, endpoint, Leg::Request, bytes);
    }

    /// Account a request/response call; both legs accrue.
    pub fn round_trip(
        &mut self,
        src: Host,
        dst: Host,
        endpoint: Endpoint,
        req_bytes: usize,
        rsp_bytes: usize,
    ) {
        self.count(src, dst, endpoint, Leg::Request, req_bytes);
        self.count(dst, src, endpoint, Leg::Response, rsp_bytes);
    }

    pub fn total_msgs(&self) -> usize {
        self.channels.values().map(|s| s.msgs).sum()
    }

    pub fn total_bytes(&self) -> usize {
        self.channels.values().map(|s| s.bytes).sum()
    }

    /// Bytes carried on one leg of one endpoint, across all channels.
    pub fn endpoint_bytes(&self, endpoint: Endpoint, leg: Leg) -> usize {
        self.channels
            .iter()
            .filter(|(k, _)| k.endpoint == endpoint && k.leg == leg)
            .map(|(_, s)| s.bytes)
            .sum()
    }

    /// Per-endpoint stats summed over channels, in a stable order.
    pub fn by_endpoint(&self) -> Vec<(Endpoint, Leg, ChannelStats)> {
        let mut agg: std::collections::BTreeMap<(Endpoint, Leg), ChannelStats> =
            std::collections::BTreeMap::new();
        for (k, s) in &self.channels {
            let e = agg.entry((k.endpoint, k.leg)).or_default();
            e.msgs += s.msgs;
            e.bytes += s.bytes;
        }
        agg.into_iter().map(|((e, l), s)| (e, l, s)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_sum_all_legs_once() {
        let mut t = ChannelTable::new();
        t.oneway(Host::Coordinator, Host::Site(0), Endpoint::Reset, 100);
        t.oneway(Host::Site(0), Host::Coordinator, Endpoint::LocalViolation, 8);
        t.round_trip(Host::Coordinator, Host::Site(0), Endpoint::GetDrift, 0, 64);

        assert_eq!(t.total_msgs(), 4);
        assert_eq!(t.total_bytes(), 100 + 8 + 64);
        assert_eq!(t.endpoint_bytes(Endpoint::GetDrift, Leg::Response), 64);
        assert_eq!(t.endpoint_bytes(Endpoint::GetDrift, Leg::Request), 0);

        // No byte attributed twice: endpoint sums equal the grand total.
        let per_endpoint: usize = t.by_endpoint().iter().map(|(_, _, s)| s.bytes).sum();
        assert_eq!(per_endpoint, t.total_bytes());
    }

    #[test]
    fn channels_are_directed() {
        let mut t = ChannelTable::new();
        t.oneway(Host::Coordinator, Host::Site(1), Endpoint::SetDrift, 10);
        t.oneway(Host::Coordinator, Host::Site(2), Endpoint::SetDrift, 10);
        assert_eq!(t.total_msgs(), 2);
        assert_eq!(t.total_bytes(), 20);
    }
}
