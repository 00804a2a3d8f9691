//! Updating several nodes one after another, each through its own route.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::bus::Channel;
use crate::config::{FlashConfig, SessionConfig};
use crate::error::{FlashError, ResultCode};
use crate::image::FirmwareImage;
use crate::route::{compute, PcAttachment, Route, RouteGraph, RouteMode, RouteStatus};
use crate::sequencer::{ProgressReporter, UpdateSequencer};

/// Cooperative cancellation, checked between steps only
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct FleetTarget {
    /// Index into the topology's node list
    pub node_index: usize,
    /// Diagnostic address of the node
    pub server_node_id: u8,
    pub image: FirmwareImage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeOutcome {
    pub node_index: usize,
    pub result: ResultCode,
    pub message: String,
}

impl NodeOutcome {
    fn new(node_index: usize, result: ResultCode, message: impl Into<String>) -> Self {
        Self {
            node_index,
            result,
            message: message.into(),
        }
    }
}

pub struct FleetUpdater<'a> {
    graph: &'a RouteGraph,
    active_flags: &'a [bool],
    origin: PcAttachment,
    config: FlashConfig,
    activation_wait_ms: u64,
}

impl<'a> FleetUpdater<'a> {
    pub fn new(
        graph: &'a RouteGraph,
        active_flags: &'a [bool],
        origin: PcAttachment,
        config: FlashConfig,
    ) -> Self {
        Self {
            graph,
            active_flags,
            origin,
            config,
            activation_wait_ms: 0,
        }
    }

    /// Extra time the preprogramming broadcast runs beyond the configured floor
    pub fn with_activation_wait(mut self, wait_ms: u64) -> Self {
        self.activation_wait_ms = wait_ms;
        self
    }

    /// Flash every target in order. `connect` opens a channel to a node along its route.
    ///
    /// A failed node does not stop the run; cancellation does, and every
    /// remaining target is reported as cancelled.
    pub fn run<C, R, F>(
        &self,
        targets: &[FleetTarget],
        reporter: &mut R,
        mut connect: F,
        cancel: &CancelFlag,
    ) -> Vec<NodeOutcome>
    where
        C: Channel,
        R: ProgressReporter,
        F: FnMut(&SessionConfig, u32, &Route) -> Result<C, String>,
    {
        let mut outcomes = Vec::with_capacity(targets.len());
        for (position, target) in targets.iter().enumerate() {
            if cancel.is_cancelled() {
                log::warn!(
                    "[Fleet] Cancelled, skipping {} remaining node(s)",
                    targets.len() - position
                );
                outcomes.extend(targets[position..].iter().map(|t| {
                    NodeOutcome::new(t.node_index, ResultCode::Cancelled, "Cancelled")
                }));
                break;
            }
            log::info!(
                "[Fleet] Node {}/{}: index {}, address {}",
                position + 1,
                targets.len(),
                target.node_index,
                target.server_node_id
            );
            let outcome = self.update_one(target, reporter, &mut connect, cancel);
            if outcome.result.is_ok() {
                log::info!("[Fleet] Node {} updated", target.node_index);
            } else {
                log::error!("[Fleet] Node {} failed: {}", target.node_index, outcome.message);
            }
            outcomes.push(outcome);
        }
        outcomes
    }

    fn update_one<C, R, F>(
        &self,
        target: &FleetTarget,
        reporter: &mut R,
        connect: &mut F,
        cancel: &CancelFlag,
    ) -> NodeOutcome
    where
        C: Channel,
        R: ProgressReporter,
        F: FnMut(&SessionConfig, u32, &Route) -> Result<C, String>,
    {
        let index = target.node_index;
        let routes = compute(
            self.graph,
            self.active_flags,
            self.origin,
            index,
            RouteMode::Update,
        );
        if routes.status != RouteStatus::Ok {
            return NodeOutcome::new(
                index,
                routes.status.into(),
                format!("No usable route ({:?})", routes.status),
            );
        }
        if routes.is_stale() {
            return NodeOutcome::new(
                index,
                ResultCode::NoRoute,
                "Route computed while disconnected, recalculate",
            );
        }
        let Some(route) = routes.best_route() else {
            return NodeOutcome::new(index, ResultCode::NoRoute, "No best route");
        };

        let mut session_config = self.config.session.clone();
        session_config.server_node_id = target.server_node_id;

        let mut sequencer = UpdateSequencer::new(&mut *reporter, self.config.timings.clone());
        let result = sequencer
            .init_with(session_config, |cfg, bitrate| connect(cfg, bitrate, route))
            .and_then(|()| self.flash(&mut sequencer, &target.image, cancel));
        sequencer.teardown();

        match result {
            Ok(()) => NodeOutcome::new(index, ResultCode::Ok, "Updated"),
            Err(e) => NodeOutcome::new(index, e.code(), e.to_string()),
        }
    }

    fn flash<C: Channel, R: ProgressReporter>(
        &self,
        sequencer: &mut UpdateSequencer<C, R>,
        image: &FirmwareImage,
        cancel: &CancelFlag,
    ) -> Result<(), FlashError> {
        sequencer.activate_flashloader(self.activation_wait_ms)?;
        sequencer.checkpoint(cancel)?;
        sequencer.read_device_information()?;
        sequencer.update_node(image, cancel)
    }
}
