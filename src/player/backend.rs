//! The player backend: owns the output graph and exposes splicing.
//!
//! [`Player`] implements both capability traits.  Requests made before the
//! output graph exists are remembered on waiting lists and applied, in
//! request order, when [`Player::build_output`] runs.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::capability::{FilterSplice, SpliceBackend, SpliceObserver, TeeSplice};
use crate::config::{OutputConfig, SpliceConfig};
use crate::graph::{Element, Engine};
use crate::splice::{
    begin_splice, Fixture, SpliceCoordinator, SpliceError, SpliceHost, SpliceKind, SpliceStatus,
};

use super::output::Output;
use super::state::PlaybackState;

struct PlayerInner {
    output: Option<Arc<Output>>,
    playback: PlaybackState,
    waiting_filters: Vec<Element>,
    waiting_branches: Vec<Element>,
}

/// Splice-capable player backend.
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use live_splice::config::SpliceConfig;
/// use live_splice::graph::{ElementSpec, Engine, MemoryGraph};
/// use live_splice::player::{PlaybackState, Player};
/// use live_splice::capability::FilterSplice;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let graph = MemoryGraph::new();
/// let player = Player::spawn(graph.clone(), &SpliceConfig::default());
/// player.build_output()?;
/// player.set_playback(PlaybackState::Playing)?;
///
/// let eq = graph.create_element(ElementSpec::Gain(0.8), Some("eq"))?;
/// player.add_filter(&eq)?;
/// # Ok(())
/// # }
/// ```
pub struct Player {
    host: Arc<SpliceHost>,
    output_config: OutputConfig,
    inner: Mutex<PlayerInner>,
}

impl Player {
    /// Create a player and the coordinator that completes its blocked
    /// splices.  Spawn [`SpliceCoordinator::run`] before playing.
    pub fn new(engine: Arc<dyn Engine>, config: &SpliceConfig) -> (Self, SpliceCoordinator) {
        let (host, coordinator) = SpliceHost::new(engine, config.branch);
        let player = Self {
            host,
            output_config: config.output,
            inner: Mutex::new(PlayerInner {
                output: None,
                playback: PlaybackState::default(),
                waiting_filters: Vec::new(),
                waiting_branches: Vec::new(),
            }),
        };
        (player, coordinator)
    }

    /// Create a player and spawn its coordinator on the current tokio
    /// runtime.
    pub fn spawn(engine: Arc<dyn Engine>, config: &SpliceConfig) -> Arc<Self> {
        let (player, coordinator) = Self::new(engine, config);
        tokio::spawn(coordinator.run());
        Arc::new(player)
    }

    fn lock(&self) -> MutexGuard<'_, PlayerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn host(&self) -> &Arc<SpliceHost> {
        &self.host
    }

    pub fn subscribe(&self, observer: Arc<dyn SpliceObserver>) {
        self.host.subscribe(observer);
    }

    pub fn output(&self) -> Option<Arc<Output>> {
        self.lock().output.clone()
    }

    pub fn playback(&self) -> PlaybackState {
        self.lock().playback
    }

    /// Names of filters waiting for the output graph.
    pub fn waiting_filters(&self) -> Vec<String> {
        self.lock()
            .waiting_filters
            .iter()
            .map(|e| e.name().to_string())
            .collect()
    }

    /// Names of branches waiting for the output graph.
    pub fn waiting_branches(&self) -> Vec<String> {
        self.lock()
            .waiting_branches
            .iter()
            .map(|e| e.name().to_string())
            .collect()
    }

    /// Build the output graph (once) and apply everything waiting for it.
    ///
    /// A waiting element that fails to splice is logged and dropped; the
    /// output is still returned.
    pub fn build_output(&self) -> Result<Arc<Output>, SpliceError> {
        let (output, filters, branches) = {
            let mut inner = self.lock();
            if let Some(output) = &inner.output {
                return Ok(Arc::clone(output));
            }
            let engine = self.host.engine();
            let output = Arc::new(Output::build(engine, &self.output_config)?);
            let playback = inner.playback;
            self.host.set_flowing(playback.is_flowing(), || {
                output.set_state(engine, playback.run_state())
            })?;
            inner.output = Some(Arc::clone(&output));
            (
                output,
                std::mem::take(&mut inner.waiting_filters),
                std::mem::take(&mut inner.waiting_branches),
            )
        };

        for element in &filters {
            let spliced = begin_splice(
                &self.host,
                &output.filter_fixture,
                element,
                SpliceKind::AddFilter,
                false,
            );
            if let Err(e) = spliced {
                log::warn!("player: waiting filter {} not applied: {e}", element.name());
            }
        }
        for element in &branches {
            let spliced = begin_splice(
                &self.host,
                &output.tee_fixture,
                element,
                SpliceKind::AddBranch,
                false,
            );
            if let Err(e) = spliced {
                log::warn!("player: waiting branch {} not applied: {e}", element.name());
            }
        }
        Ok(output)
    }

    /// Change transport state and apply it to the output graph.
    ///
    /// Waits for any direct splice in progress; splices dispatched after
    /// this returns see the new state.
    pub fn set_playback(&self, state: PlaybackState) -> Result<(), SpliceError> {
        let mut inner = self.lock();
        let engine = self.host.engine();
        self.host
            .set_flowing(state.is_flowing(), || match &inner.output {
                Some(output) => output.set_state(engine, state.run_state()),
                None => Ok(()),
            })?;
        log::info!(
            "player: {} -> {}",
            inner.playback.label(),
            state.label()
        );
        inner.playback = state;
        Ok(())
    }

    /// Resolve the fixture for a request, or park the element on a waiting
    /// list when there is no output yet.
    fn route(
        &self,
        element: &Element,
        kind: SpliceKind,
    ) -> Result<Option<Arc<Fixture>>, SpliceError> {
        let mut inner = self.lock();
        if let Some(output) = &inner.output {
            let fixture = match kind {
                SpliceKind::AddFilter | SpliceKind::RemoveFilter => &output.filter_fixture,
                SpliceKind::AddBranch | SpliceKind::RemoveBranch => &output.tee_fixture,
            };
            return Ok(Some(Arc::clone(fixture)));
        }

        let list = match kind {
            SpliceKind::AddFilter | SpliceKind::RemoveFilter => &mut inner.waiting_filters,
            SpliceKind::AddBranch | SpliceKind::RemoveBranch => &mut inner.waiting_branches,
        };
        let position = list.iter().position(|e| e == element);
        match (kind.is_insert(), position) {
            (true, None) => {
                log::debug!("player: no output yet, {kind} {} waits", element.name());
                list.push(element.clone());
                Ok(None)
            }
            (true, Some(_)) => Err(SpliceError::AlreadyAttached(element.name().to_string())),
            (false, Some(index)) => {
                list.remove(index);
                Ok(None)
            }
            (false, None) => Err(SpliceError::NotAttached(element.name().to_string())),
        }
    }

    fn request(&self, element: &Element, kind: SpliceKind) -> Result<SpliceStatus, SpliceError> {
        match self.route(element, kind)? {
            // The host picks the path when the splice is dispatched.
            Some(fixture) => begin_splice(&self.host, &fixture, element, kind, false),
            None if kind.is_insert() => Ok(SpliceStatus::Deferred),
            None => Ok(SpliceStatus::Applied),
        }
    }
}

impl FilterSplice for Player {
    fn add_filter(&self, element: &Element) -> Result<SpliceStatus, SpliceError> {
        self.request(element, SpliceKind::AddFilter)
    }

    fn remove_filter(&self, element: &Element) -> Result<SpliceStatus, SpliceError> {
        self.request(element, SpliceKind::RemoveFilter)
    }
}

impl TeeSplice for Player {
    fn add_branch(&self, element: &Element) -> Result<SpliceStatus, SpliceError> {
        self.request(element, SpliceKind::AddBranch)
    }

    fn remove_branch(&self, element: &Element) -> Result<SpliceStatus, SpliceError> {
        self.request(element, SpliceKind::RemoveBranch)
    }
}

impl SpliceBackend for Player {
    fn filter_splice(&self) -> Option<&dyn FilterSplice> {
        Some(self)
    }

    fn tee_splice(&self) -> Option<&dyn TeeSplice> {
        Some(self)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{ChannelObserver, SpliceEvent};
    use crate::graph::{
        BlockTarget, BlockWaiter, ElementSpec, Event, MemoryGraph, PadId, SourceThread,
    };
    use std::collections::BTreeSet;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(5);

    struct Harness {
        graph: Arc<MemoryGraph>,
        player: Arc<Player>,
        output: Arc<Output>,
        events: mpsc::UnboundedReceiver<SpliceEvent>,
        source: Option<SourceThread>,
    }

    impl Harness {
        fn new(config: SpliceConfig) -> Self {
            let graph = MemoryGraph::new();
            let player = Player::spawn(graph.clone(), &config);
            let (observer, events) = ChannelObserver::new();
            player.subscribe(Arc::new(observer));
            let output = player.build_output().unwrap();
            Self {
                graph,
                player,
                output,
                events,
                source: None,
            }
        }

        fn pause(&self) {
            self.player.set_playback(PlaybackState::Paused).unwrap();
        }

        /// Start playing with a live streaming thread.
        fn play(&mut self) {
            self.player.set_playback(PlaybackState::Playing).unwrap();
            let src = self.output.source_pad(self.graph.as_ref()).unwrap();
            let thread =
                SourceThread::start(Arc::clone(&self.graph), src, 32, Duration::from_millis(1))
                    .unwrap();
            self.source = Some(thread);
            assert!(self.sink_probe().wait_for_buffers(3, WAIT));
        }

        fn sink_probe(&self) -> Arc<crate::graph::SinkProbe> {
            self.graph.probe(self.output.sink.id()).unwrap()
        }

        fn element(&self, spec: ElementSpec, name: &str) -> Element {
            self.graph.create_element(spec, Some(name)).unwrap()
        }

        async fn next_event(&mut self) -> SpliceEvent {
            tokio::time::timeout(WAIT, self.events.recv())
                .await
                .expect("timed out waiting for a splice event")
                .expect("observer channel closed")
        }

        /// Wait until no operation holds either fixture.
        async fn idle(&self) {
            let deadline = tokio::time::Instant::now() + WAIT;
            while self.output.filter_fixture.in_flight() || self.output.tee_fixture.in_flight() {
                assert!(tokio::time::Instant::now() < deadline, "splice never completed");
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        }

        /// Elements between the volume stage and the filter marker.
        fn filter_chain(&self) -> Vec<String> {
            let volume_src = self.graph.static_pad(self.output.volume.id(), "src").unwrap();
            let mut chain = self.graph.chain(volume_src, self.output.marker.id());
            chain.pop();
            chain
        }

        /// Links and memberships, by name.
        fn topology(&self) -> BTreeSet<String> {
            let snapshot = self.graph.snapshot();
            let mut names = std::collections::HashMap::new();
            let mut pads = std::collections::HashMap::new();
            for node in &snapshot.nodes {
                names.insert(node.id, node.name.clone());
                for pad in &node.pads {
                    pads.insert(pad.id, format!("{}.{}", node.name, pad.name));
                }
            }
            let mut out = BTreeSet::new();
            for node in &snapshot.nodes {
                if let Some(parent) = node.parent {
                    out.insert(format!("{} > {}", names[&parent], node.name));
                }
                for pad in &node.pads {
                    if let (Some(peer), crate::graph::PadDirection::Src) = (pad.peer, pad.direction)
                    {
                        out.insert(format!("{} -> {}", pads[&pad.id], pads[&peer]));
                    }
                }
            }
            out
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            if let Some(source) = self.source.take() {
                // A paused output holds the streaming thread; stop flushes it.
                let _ = self.player.set_playback(PlaybackState::Stopped);
                source.stop();
            }
        }
    }

    // -----------------------------------------------------------------------
    // Filters
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn filter_attached_while_flowing_sits_between_adapters() {
        let mut h = Harness::new(SpliceConfig::default());
        h.play();
        let eq = h.element(ElementSpec::Gain(0.5), "eq");
        let before = h.graph.stats();

        assert_eq!(h.player.add_filter(&eq), Ok(SpliceStatus::Pending));
        assert_eq!(
            h.next_event().await,
            SpliceEvent::FilterInserted {
                element: "eq".into()
            }
        );
        h.idle().await;

        let after = h.graph.stats();
        assert_eq!(after.block_requests - before.block_requests, 1);
        assert_eq!(after.unblocks - before.unblocks, 1);
        assert_eq!(
            h.filter_chain(),
            vec![
                "filter-convert-in",
                "eq-convert-in",
                "eq",
                "eq-convert-out"
            ]
        );

        let probe = h.sink_probe();
        let seen = probe.buffers();
        assert!(probe.wait_for_buffers(seen + 20, WAIT));
        assert_eq!(probe.last_buffer().unwrap().samples[0], 0.125);
        assert!(probe.events().contains(&Event::Resync));
    }

    #[tokio::test]
    async fn filters_added_while_flowing_chain_in_request_order() {
        let mut h = Harness::new(SpliceConfig::default());
        h.play();
        let f1 = h.element(ElementSpec::Identity, "f1");
        let f2 = h.element(ElementSpec::Identity, "f2");

        assert_eq!(h.player.add_filter(&f1), Ok(SpliceStatus::Pending));
        assert_eq!(h.player.add_filter(&f2), Ok(SpliceStatus::Queued));
        h.next_event().await;
        h.next_event().await;
        h.idle().await;

        assert_eq!(
            h.filter_chain(),
            vec![
                "filter-convert-in",
                "f1-convert-in",
                "f1",
                "f1-convert-out",
                "f2-convert-in",
                "f2",
                "f2-convert-out"
            ]
        );
    }

    #[tokio::test]
    async fn removing_first_of_two_filters_joins_second_to_predecessor() {
        let mut h = Harness::new(SpliceConfig::default());
        h.play();
        let f1 = h.element(ElementSpec::Identity, "f1");
        let f2 = h.element(ElementSpec::Identity, "f2");
        h.player.add_filter(&f1).unwrap();
        h.player.add_filter(&f2).unwrap();
        h.next_event().await;
        h.next_event().await;
        h.idle().await;

        assert_eq!(h.player.remove_filter(&f1), Ok(SpliceStatus::Pending));
        assert_eq!(
            h.next_event().await,
            SpliceEvent::FilterPreRemove {
                element: "f1".into()
            }
        );
        h.idle().await;

        assert_eq!(
            h.filter_chain(),
            vec!["filter-convert-in", "f2-convert-in", "f2", "f2-convert-out"]
        );
        assert_eq!(h.graph.parent(f1.id()), None);
        assert!(h.graph.contains(f1.id()));
        assert_eq!(f1.ref_count(), 1);

        let probe = h.sink_probe();
        let seen = probe.buffers();
        assert!(probe.wait_for_buffers(seen + 5, WAIT));
    }

    #[tokio::test]
    async fn filter_round_trip_restores_topology() {
        let h = Harness::new(SpliceConfig::default());
        h.pause();
        let eq = h.element(ElementSpec::Gain(2.0), "eq");
        let before = h.topology();

        assert_eq!(h.player.add_filter(&eq), Ok(SpliceStatus::Applied));
        assert_ne!(h.topology(), before);
        assert_eq!(h.player.remove_filter(&eq), Ok(SpliceStatus::Applied));

        assert_eq!(h.topology(), before);
    }

    #[tokio::test]
    async fn direct_path_completes_before_returning() {
        let mut h = Harness::new(SpliceConfig::default());
        h.pause();
        let eq = h.element(ElementSpec::Identity, "eq");
        let before = h.graph.stats();

        assert_eq!(h.player.add_filter(&eq), Ok(SpliceStatus::Applied));

        assert!(h.filter_chain().contains(&"eq".to_string()));
        assert!(!h.output.filter_fixture.in_flight());
        assert_eq!(h.graph.stats().block_requests, before.block_requests);
        assert_eq!(h.graph.state(eq.id()), Some(crate::graph::RunState::Paused));
        assert_eq!(
            h.events.try_recv().unwrap(),
            SpliceEvent::FilterInserted {
                element: "eq".into()
            }
        );
    }

    #[tokio::test]
    async fn full_cycle_releases_every_reference() {
        let mut h = Harness::new(SpliceConfig::default());
        h.play();
        let eq = h.element(ElementSpec::Identity, "eq");
        let host_refs = Arc::strong_count(h.player.host());
        let fixture_refs = Arc::strong_count(&h.output.filter_fixture);
        let element_refs = eq.ref_count();

        h.player.add_filter(&eq).unwrap();
        h.next_event().await;
        h.idle().await;
        h.player.remove_filter(&eq).unwrap();
        h.next_event().await;
        h.idle().await;

        assert_eq!(Arc::strong_count(h.player.host()), host_refs);
        assert_eq!(Arc::strong_count(&h.output.filter_fixture), fixture_refs);
        assert_eq!(eq.ref_count(), element_refs);
    }

    #[tokio::test]
    async fn link_failure_rolls_back_to_original_topology() {
        let h = Harness::new(SpliceConfig::default());
        h.pause();
        let eq = h.element(ElementSpec::Identity, "eq");
        let before = h.topology();

        // The sub-container's two internal links succeed, the splice-in fails.
        h.graph.fail_links(2, 1);
        let err = h.player.add_filter(&eq).unwrap_err();

        assert!(matches!(
            err,
            SpliceError::Engine(crate::graph::EngineError::LinkRefused { .. })
        ));
        assert_eq!(h.topology(), before);
        assert!(!h.output.filter_fixture.is_inconsistent());
        assert_eq!(h.graph.parent(eq.id()), None);
        assert_eq!(eq.ref_count(), 1);
    }

    #[tokio::test]
    async fn failed_rollback_flags_fixture_inconsistent() {
        let h = Harness::new(SpliceConfig::default());
        h.pause();
        let eq = h.element(ElementSpec::Identity, "eq");

        h.graph.fail_links(2, 2);
        let err = h.player.add_filter(&eq).unwrap_err();

        assert_eq!(err, SpliceError::Inconsistent("filters".into()));
        assert!(h.output.filter_fixture.is_inconsistent());

        let other = h.element(ElementSpec::Identity, "other");
        assert_eq!(
            h.player.add_filter(&other),
            Err(SpliceError::Inconsistent("filters".into()))
        );
        assert_eq!(other.ref_count(), 1);
    }

    #[tokio::test]
    async fn async_failure_is_reported_to_observers() {
        let mut h = Harness::new(SpliceConfig::default());
        h.play();
        let ghost = h.element(ElementSpec::Identity, "ghost");

        assert_eq!(h.player.remove_filter(&ghost), Ok(SpliceStatus::Pending));
        match h.next_event().await {
            SpliceEvent::SpliceFailed { element, kind, .. } => {
                assert_eq!(element, "ghost");
                assert_eq!(kind, SpliceKind::RemoveFilter);
            }
            other => panic!("unexpected event {other:?}"),
        }
        h.idle().await;

        let probe = h.sink_probe();
        let seen = probe.buffers();
        assert!(probe.wait_for_buffers(seen + 5, WAIT));
    }

    #[tokio::test]
    async fn direct_removal_of_unknown_filter_is_not_removed() {
        let h = Harness::new(SpliceConfig::default());
        h.pause();
        let ghost = h.element(ElementSpec::Identity, "ghost");

        assert_eq!(
            h.player.remove_filter(&ghost),
            Err(SpliceError::NotAttached("ghost".into()))
        );
        assert!(!h.output.filter_fixture.in_flight());
    }

    #[tokio::test]
    async fn refused_start_rolls_filter_back_out() {
        let h = Harness::new(SpliceConfig::default());
        h.pause();
        let eq = h.element(ElementSpec::Identity, "eq");
        let before = h.topology();

        h.graph.fail_state_changes(0, 1);
        let err = h.player.add_filter(&eq).unwrap_err();

        assert!(matches!(
            err,
            SpliceError::Engine(crate::graph::EngineError::StateChangeRefused(_))
        ));
        assert_eq!(h.topology(), before);
        assert!(!h.output.filter_fixture.is_inconsistent());
        assert_eq!(h.graph.parent(eq.id()), None);
        assert_eq!(eq.ref_count(), 1);
    }

    #[tokio::test]
    async fn half_unlinked_filter_is_put_back() {
        let h = Harness::new(SpliceConfig::default());
        h.pause();
        let eq = h.element(ElementSpec::Identity, "eq");
        h.player.add_filter(&eq).unwrap();
        let attached = h.topology();

        h.graph.fail_unlinks(1, 1);
        let err = h.player.remove_filter(&eq).unwrap_err();

        assert!(matches!(
            err,
            SpliceError::Engine(crate::graph::EngineError::UnlinkRefused { .. })
        ));
        assert_eq!(h.topology(), attached);
        assert!(!h.output.filter_fixture.is_inconsistent());
        assert_eq!(h.graph.state(eq.id()), Some(crate::graph::RunState::Paused));
        assert_eq!(h.player.remove_filter(&eq), Ok(SpliceStatus::Applied));
    }

    #[tokio::test]
    async fn half_unlinked_filter_that_cannot_be_put_back_is_inconsistent() {
        let h = Harness::new(SpliceConfig::default());
        h.pause();
        let eq = h.element(ElementSpec::Identity, "eq");
        h.player.add_filter(&eq).unwrap();

        h.graph.fail_unlinks(1, 1);
        h.graph.fail_links(0, 1);
        let err = h.player.remove_filter(&eq).unwrap_err();

        assert_eq!(err, SpliceError::Inconsistent("filters".into()));
        assert!(h.output.filter_fixture.is_inconsistent());
    }

    #[tokio::test]
    async fn paused_output_holds_flow_during_direct_splices() {
        let mut h = Harness::new(SpliceConfig::default());
        h.play();
        h.pause();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let sink = h.sink_probe();
        let source = h.source.as_ref().unwrap();
        let (delivered, pushed, failed) = (sink.buffers(), source.pushed(), source.failed());
        let eq = h.element(ElementSpec::Identity, "eq");
        let scope = h.element(ElementSpec::Sink, "scope");

        for _ in 0..25 {
            assert_eq!(h.player.add_filter(&eq), Ok(SpliceStatus::Applied));
            assert_eq!(h.player.add_branch(&scope), Ok(SpliceStatus::Applied));
            assert_eq!(h.player.remove_filter(&eq), Ok(SpliceStatus::Applied));
            assert_eq!(h.player.remove_branch(&scope), Ok(SpliceStatus::Applied));
        }

        assert_eq!(sink.buffers(), delivered);
        assert_eq!(source.pushed(), pushed);
        assert_eq!(source.failed(), failed);

        h.player.set_playback(PlaybackState::Playing).unwrap();
        assert!(sink.wait_for_buffers(delivered + 5, WAIT));
        assert_eq!(h.source.as_ref().unwrap().failed(), failed);
    }

    #[tokio::test]
    async fn direct_request_while_flowing_takes_blocking_path() {
        let mut h = Harness::new(SpliceConfig::default());
        h.play();
        let eq = h.element(ElementSpec::Identity, "eq");

        let status = begin_splice(
            h.player.host(),
            &h.output.filter_fixture,
            &eq,
            SpliceKind::AddFilter,
            false,
        );

        assert_eq!(status, Ok(SpliceStatus::Pending));
        assert_eq!(
            h.next_event().await,
            SpliceEvent::FilterInserted {
                element: "eq".into()
            }
        );
        h.idle().await;
        assert!(h.filter_chain().contains(&"eq".to_string()));
    }

    struct Inert;

    impl BlockTarget for Inert {
        fn blocked(self: Box<Self>, _pad: PadId) {}
        fn abandoned(self: Box<Self>) {}
    }

    #[tokio::test]
    async fn refused_block_request_is_abandoned_and_releases_slot() {
        let mut h = Harness::new(SpliceConfig::default());
        h.player.set_playback(PlaybackState::Playing).unwrap();
        let volume_src = h.graph.static_pad(h.output.volume.id(), "src").unwrap();
        h.graph
            .request_block(volume_src, BlockWaiter::new(Box::new(Inert)))
            .unwrap();
        let eq = h.element(ElementSpec::Identity, "eq");

        let err = h.player.add_filter(&eq).unwrap_err();
        assert_eq!(
            err,
            SpliceError::Engine(crate::graph::EngineError::AlreadyBlocked(volume_src))
        );
        assert!(matches!(
            h.next_event().await,
            SpliceEvent::SpliceFailed {
                kind: SpliceKind::AddFilter,
                ..
            }
        ));
        h.idle().await;
        assert_eq!(eq.ref_count(), 1);

        h.graph.unblock(volume_src).unwrap();
    }

    // -----------------------------------------------------------------------
    // Branches
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn removing_middle_branch_leaves_others_flowing() {
        let mut h = Harness::new(SpliceConfig::default());
        h.play();
        let scopes: Vec<Element> = ["a", "b", "c"]
            .iter()
            .map(|n| h.element(ElementSpec::Sink, &format!("scope-{n}")))
            .collect();

        for scope in &scopes {
            h.player.add_branch(scope).unwrap();
        }
        for _ in 0..3 {
            assert!(matches!(
                h.next_event().await,
                SpliceEvent::TeeInserted { .. }
            ));
        }
        h.idle().await;
        assert_eq!(h.graph.request_pads(h.output.tee.id()).len(), 4);

        assert_eq!(h.player.remove_branch(&scopes[1]), Ok(SpliceStatus::Pending));
        assert_eq!(
            h.next_event().await,
            SpliceEvent::TeePreRemove {
                element: "scope-b".into()
            }
        );
        h.idle().await;

        assert_eq!(h.graph.request_pads(h.output.tee.id()).len(), 3);
        assert_eq!(h.graph.parent(scopes[1].id()), None);
        let remaining = h.graph.child_names(h.output.bin.id());
        assert!(remaining.contains(&"scope-a-branch".to_string()));
        assert!(!remaining.contains(&"scope-b-branch".to_string()));
        assert!(remaining.contains(&"scope-c-branch".to_string()));

        for scope in [&scopes[0], &scopes[2]] {
            let probe = h.graph.probe(scope.id()).unwrap();
            let seen = probe.buffers();
            assert!(probe.wait_for_buffers(seen + 5, WAIT));
            assert!(probe.events().contains(&Event::Resync));
        }
        let main = h.sink_probe();
        let seen = main.buffers();
        assert!(main.wait_for_buffers(seen + 5, WAIT));
    }

    #[tokio::test]
    async fn stalled_branch_never_exceeds_its_bound() {
        let mut h = Harness::new(SpliceConfig::default());
        h.play();
        let scope = h.element(ElementSpec::Sink, "scope");
        let scope_probe = h.graph.probe(scope.id()).unwrap();
        scope_probe.stall();

        h.player.add_branch(&scope).unwrap();
        h.next_event().await;
        h.idle().await;

        let bin = h.graph.parent(scope.id()).unwrap();
        let queue_node = h.graph.children(bin)[0];
        let queue = h.graph.queue(queue_node).unwrap();
        assert_eq!(queue.capacity(), 3);

        let main = h.sink_probe();
        let seen = main.buffers();
        assert!(main.wait_for_buffers(seen + 30, WAIT));

        assert!(queue.len() <= 3);
        assert!(queue.high_water() <= 3);
        assert!(queue.dropped() > 0);
        scope_probe.resume();
    }

    #[tokio::test]
    async fn branch_queue_follows_configured_policy() {
        let mut config = SpliceConfig::default();
        config.branch.max_buffers = 5;
        config.branch.overflow = crate::graph::OverflowPolicy::Block;
        let h = Harness::new(config);
        h.pause();
        let scope = h.element(ElementSpec::Sink, "scope");

        assert_eq!(h.player.add_branch(&scope), Ok(SpliceStatus::Applied));

        let bin = h.graph.parent(scope.id()).unwrap();
        assert_eq!(
            h.graph.child_names(bin),
            vec!["scope-queue", "scope-convert", "scope"]
        );
        let queue = h.graph.queue(h.graph.children(bin)[0]).unwrap();
        assert_eq!(queue.capacity(), 5);
        assert_eq!(queue.policy(), crate::graph::OverflowPolicy::Block);
    }

    #[tokio::test]
    async fn branch_link_failure_releases_tee_pad() {
        let h = Harness::new(SpliceConfig::default());
        h.pause();
        let scope = h.element(ElementSpec::Sink, "scope");
        let pads = h.graph.request_pads(h.output.tee.id()).len();
        let children = h.graph.child_names(h.output.bin.id());
        let before = h.topology();

        // queue -> convert -> scope link, the tee link is refused.
        h.graph.fail_links(2, 1);
        let err = h.player.add_branch(&scope).unwrap_err();

        assert!(matches!(
            err,
            SpliceError::Engine(crate::graph::EngineError::LinkRefused { .. })
        ));
        assert_eq!(h.graph.request_pads(h.output.tee.id()).len(), pads);
        assert_eq!(h.graph.child_names(h.output.bin.id()), children);
        assert_eq!(h.topology(), before);
        assert!(!h.output.tee_fixture.is_inconsistent());
        assert_eq!(scope.ref_count(), 1);
    }

    #[tokio::test]
    async fn refused_branch_start_releases_tee_pad() {
        let h = Harness::new(SpliceConfig::default());
        h.pause();
        let scope = h.element(ElementSpec::Sink, "scope");
        let before = h.topology();

        h.graph.fail_state_changes(0, 1);
        let err = h.player.add_branch(&scope).unwrap_err();

        assert!(matches!(
            err,
            SpliceError::Engine(crate::graph::EngineError::StateChangeRefused(_))
        ));
        assert_eq!(h.topology(), before);
        assert_eq!(h.graph.parent(scope.id()), None);
        assert_eq!(scope.ref_count(), 1);
    }

    #[tokio::test]
    async fn removing_unknown_branch_is_not_attached() {
        let h = Harness::new(SpliceConfig::default());
        h.pause();
        let ghost = h.element(ElementSpec::Sink, "ghost");
        let pads = h.graph.request_pads(h.output.tee.id()).len();

        assert_eq!(
            h.player.remove_branch(&ghost),
            Err(SpliceError::NotAttached("ghost".into()))
        );
        assert!(!h.output.tee_fixture.in_flight());
        assert_eq!(h.graph.request_pads(h.output.tee.id()).len(), pads);
    }

    // -----------------------------------------------------------------------
    // Waiting lists and capabilities
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn requests_before_output_wait_and_apply_on_build() {
        let graph = MemoryGraph::new();
        let player = Player::spawn(graph.clone(), &SpliceConfig::default());
        let (observer, mut events) = ChannelObserver::new();
        player.subscribe(Arc::new(observer));

        let eq = graph.create_element(ElementSpec::Identity, Some("eq")).unwrap();
        let dropped = graph.create_element(ElementSpec::Identity, Some("dropped")).unwrap();
        let scope = graph.create_element(ElementSpec::Sink, Some("scope")).unwrap();

        assert_eq!(player.add_filter(&eq), Ok(SpliceStatus::Deferred));
        assert_eq!(player.add_filter(&dropped), Ok(SpliceStatus::Deferred));
        assert_eq!(player.add_branch(&scope), Ok(SpliceStatus::Deferred));
        assert_eq!(
            player.add_filter(&eq),
            Err(SpliceError::AlreadyAttached("eq".into()))
        );
        assert_eq!(player.remove_filter(&dropped), Ok(SpliceStatus::Applied));
        assert_eq!(player.waiting_filters(), vec!["eq"]);
        assert_eq!(player.waiting_branches(), vec!["scope"]);
        assert_eq!(dropped.ref_count(), 1);

        let output = player.build_output().unwrap();

        assert!(player.waiting_filters().is_empty());
        assert!(player.waiting_branches().is_empty());
        assert_eq!(
            graph.parent(graph.parent(eq.id()).unwrap()),
            Some(output.filters.id())
        );
        assert_eq!(
            graph.parent(graph.parent(scope.id()).unwrap()),
            Some(output.bin.id())
        );
        assert_eq!(
            events.try_recv().unwrap(),
            SpliceEvent::FilterInserted {
                element: "eq".into()
            }
        );
        assert_eq!(
            events.try_recv().unwrap(),
            SpliceEvent::TeeInserted {
                element: "scope".into()
            }
        );
    }

    #[tokio::test]
    async fn player_declares_both_capabilities() {
        let h = Harness::new(SpliceConfig::default());
        let caps = h.player.capabilities();
        assert!(caps.filter && caps.tee);

        let eq = h.element(ElementSpec::Identity, "eq");
        let backend: &dyn SpliceBackend = h.player.as_ref();
        assert_eq!(
            crate::capability::add_filter(backend, &eq),
            Ok(SpliceStatus::Applied)
        );
    }
}
