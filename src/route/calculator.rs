//! Route search from the tool's bus to a target node.

use std::collections::HashSet;

use serde::Serialize;

use crate::bus::types::BusKind;
use crate::route::graph::{Interface, Node, RouteGraph};

/// Function the route is needed for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RouteMode {
    Update,
    Diagnostic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RouteStatus {
    Ok,
    /// Target index out of range
    Range,
    /// No path
    Com,
    /// Paths exist only across unsupported CAN/Ethernet bridges
    Config,
    /// The function is disabled wherever the target can be reached
    NoAct,
}

/// Where the tool ("PC") is attached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PcAttachment {
    pub bus_index: usize,
    pub connected: bool,
}

/// One gateway traversal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Hop {
    pub node: usize,
    pub ingress_bus: usize,
    pub ingress: BusKind,
    pub egress_bus: usize,
    pub egress: BusKind,
}

impl Hop {
    pub fn is_bridge(&self) -> bool {
        self.ingress != self.egress
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Route {
    pub origin_bus: usize,
    pub hops: Vec<Hop>,
    /// Bus the target is addressed on
    pub target_bus: usize,
}

impl Route {
    pub fn hop_count(&self) -> usize {
        self.hops.len()
    }

    pub fn has_bridge(&self) -> bool {
        self.hops.iter().any(Hop::is_bridge)
    }

    /// Local target, no gateway involved
    pub fn is_direct(&self) -> bool {
        self.hops.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteResult {
    pub status: RouteStatus,
    pub routes: Vec<Route>,
    /// Index into `routes`
    pub best: Option<usize>,
    /// Paths dropped for crossing an unsupported bridge
    pub removed: Vec<Route>,
    pub pc_connected: bool,
}

impl RouteResult {
    fn failed(status: RouteStatus, pc_connected: bool) -> Self {
        Self {
            status,
            routes: Vec::new(),
            best: None,
            removed: Vec::new(),
            pc_connected,
        }
    }

    pub fn best_route(&self) -> Option<&Route> {
        self.best.and_then(|i| self.routes.get(i))
    }

    /// Computed while the tool was disconnected; recompute before use
    pub fn is_stale(&self) -> bool {
        !self.pc_connected
    }
}

/// Whether `itf` may carry the requested function
pub fn check_interface_for_routing(itf: &Interface, mode: RouteMode) -> bool {
    match mode {
        RouteMode::Update => itf.update_enabled,
        RouteMode::Diagnostic => itf.diagnosis_enabled,
    }
}

/// Partial route ending on some bus
#[derive(Clone)]
struct Path {
    hops: Vec<Hop>,
    /// Buses passed so far, origin first
    buses: Vec<usize>,
    /// Crosses a bridge on a node that cannot bridge
    tainted: bool,
}

impl Path {
    fn bus(&self) -> usize {
        self.buses.last().copied().unwrap_or_default()
    }

    fn has_bridge(&self) -> bool {
        self.hops.iter().any(Hop::is_bridge)
    }

    fn extend(&self, hop: Hop, bridge_capable: bool) -> Path {
        let mut next = self.clone();
        next.tainted |= hop.is_bridge() && !bridge_capable;
        next.buses.push(hop.egress_bus);
        next.hops.push(hop);
        next
    }
}

/// Breadth-first search over buses, one hop per layer.
///
/// Every bus is settled once with its shortest path, separately for paths
/// with and without an unsupported bridge, so removed candidates never hide
/// a valid one. The search stops after the first layer that reaches the
/// target with a valid route.
struct Search<'a> {
    graph: &'a RouteGraph,
    active_flags: &'a [bool],
    target: usize,
    mode: RouteMode,
    origin_bus: usize,
    valid: Vec<Route>,
    removed: Vec<Route>,
    disabled_hits: usize,
}

impl Search<'_> {
    fn is_active(&self, node: usize) -> bool {
        self.active_flags.get(node).copied().unwrap_or(false)
    }

    fn may_pass_through(&self, node: usize) -> bool {
        match self.mode {
            RouteMode::Update => self.is_active(node),
            RouteMode::Diagnostic => true,
        }
    }

    fn record(&mut self, path: &Path) {
        let bus = path.bus();
        let target: &Node = &self.graph.nodes()[self.target];
        for itf in target.interfaces.iter().filter(|i| i.bus_index == bus) {
            if !check_interface_for_routing(itf, self.mode) {
                self.disabled_hits += 1;
                continue;
            }
            let route = Route {
                origin_bus: self.origin_bus,
                hops: path.hops.clone(),
                target_bus: bus,
            };
            if path.tainted {
                log::debug!(
                    "[Route] Removing route via {:?}: unsupported CAN/Ethernet bridge",
                    route.hops.iter().map(|h| h.node).collect::<Vec<_>>()
                );
                self.removed.push(route);
            } else {
                self.valid.push(route);
            }
        }
    }

    /// Paths one hop longer than `path`, in node then interface order
    fn expand(&self, path: &Path) -> Vec<Path> {
        let bus = path.bus();
        let usable = |itf: &&Interface| itf.routing_capable && check_interface_for_routing(itf, self.mode);
        let mut next = Vec::new();
        for (index, node) in self.graph.nodes().iter().enumerate() {
            if index == self.target
                || !self.may_pass_through(index)
                || path.hops.iter().any(|hop| hop.node == index)
            {
                continue;
            }
            let Some(ingress) = node
                .interfaces
                .iter()
                .filter(usable)
                .find(|itf| itf.bus_index == bus)
            else {
                continue;
            };
            for egress in node
                .interfaces
                .iter()
                .filter(usable)
                .filter(|itf| !path.buses.contains(&itf.bus_index))
            {
                let hop = Hop {
                    node: index,
                    ingress_bus: bus,
                    ingress: ingress.kind,
                    egress_bus: egress.bus_index,
                    egress: egress.kind,
                };
                next.push(path.extend(hop, node.bridge_capable));
            }
        }
        next
    }

    fn run(&mut self) {
        let mut settled: HashSet<(usize, bool)> = HashSet::new();
        settled.insert((self.origin_bus, false));
        let mut layer = vec![Path {
            hops: Vec::new(),
            buses: vec![self.origin_bus],
            tainted: false,
        }];

        while !layer.is_empty() {
            for path in &layer {
                self.record(path);
            }
            if !self.valid.is_empty() {
                break;
            }

            let mut next: Vec<Path> = Vec::new();
            for path in &layer {
                for candidate in self.expand(path) {
                    let key = (candidate.bus(), candidate.tainted);
                    if settled.contains(&key) {
                        continue;
                    }
                    match next.iter_mut().find(|p| (p.bus(), p.tainted) == key) {
                        Some(existing) => {
                            if existing.has_bridge() && !candidate.has_bridge() {
                                *existing = candidate;
                            }
                        }
                        None => next.push(candidate),
                    }
                }
            }
            for path in &next {
                settled.insert((path.bus(), path.tainted));
            }
            layer = next;
        }
    }
}

/// Search the shortest routes from the tool's bus to `target` and pick the best.
///
/// Shorter routes win; among equally long routes one without a CAN/Ethernet
/// bridge is preferred. Missing active flags count as inactive.
pub fn compute(
    graph: &RouteGraph,
    active_flags: &[bool],
    origin: PcAttachment,
    target: usize,
    mode: RouteMode,
) -> RouteResult {
    if target >= graph.nodes().len() {
        log::warn!(
            "[Route] Target {} out of range ({} nodes)",
            target,
            graph.nodes().len()
        );
        return RouteResult::failed(RouteStatus::Range, origin.connected);
    }
    if graph.bus(origin.bus_index).is_none() {
        log::warn!("[Route] Origin bus {} not in topology", origin.bus_index);
        return RouteResult::failed(RouteStatus::Range, origin.connected);
    }
    if !origin.connected {
        log::warn!("[Route] Tool is not connected, route will be stale");
    }

    let mut search = Search {
        graph,
        active_flags,
        target,
        mode,
        origin_bus: origin.bus_index,
        valid: Vec::new(),
        removed: Vec::new(),
        disabled_hits: 0,
    };
    search.run();

    let Search {
        valid: routes,
        removed,
        disabled_hits,
        ..
    } = search;

    let status = if !routes.is_empty() {
        RouteStatus::Ok
    } else if !removed.is_empty() {
        RouteStatus::Config
    } else if disabled_hits > 0 {
        RouteStatus::NoAct
    } else {
        RouteStatus::Com
    };

    let best = routes
        .iter()
        .enumerate()
        .min_by_key(|(_, route)| (route.hop_count(), route.has_bridge()))
        .map(|(index, _)| index);

    let name = &graph.nodes()[target].name;
    match best.and_then(|i| routes.get(i)) {
        Some(route) => log::info!(
            "[Route] {} route(s) to '{}' ({:?}), best has {} hop(s)",
            routes.len(),
            name,
            mode,
            route.hop_count()
        ),
        None => log::warn!("[Route] No usable route to '{}' ({:?}): {:?}", name, mode, status),
    }

    RouteResult {
        status,
        routes,
        best,
        removed,
        pc_connected: origin.connected,
    }
}
