pub mod calculator;
pub mod graph;

pub use calculator::{
    check_interface_for_routing, compute, Hop, PcAttachment, Route, RouteMode, RouteResult,
    RouteStatus,
};
pub use graph::{Bus, GraphError, Interface, Node, RouteGraph};
