//! Demo entry point: splices a filter and a tee branch into a live output.
//!
//! # Sequence
//!
//! 1. Load [`SpliceConfig`] from disk (returns default on first run).
//! 2. Initialise logging with the configured level as the default filter.
//! 3. Build the in-memory graph, the player and its output graph.
//! 4. Start playing and feed the output from a streaming thread.
//! 5. Insert a gain filter and a monitoring branch, let audio flow through
//!    them, then remove both.
//! 6. Print the final topology as JSON.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;

use live_splice::capability::{self, ChannelObserver, SpliceEvent};
use live_splice::config::SpliceConfig;
use live_splice::graph::{ElementSpec, Engine, MemoryGraph, SourceThread};
use live_splice::player::{PlaybackState, Player};

/// How long to wait for the coordinator to report a splice.
const SPLICE_TIMEOUT: Duration = Duration::from_secs(5);

async fn expect_event(events: &mut mpsc::UnboundedReceiver<SpliceEvent>) -> Result<SpliceEvent> {
    let event = tokio::time::timeout(SPLICE_TIMEOUT, events.recv())
        .await
        .context("timed out waiting for a splice to complete")?
        .context("observer channel closed")?;
    log::info!("event: {}", serde_json::to_string(&event)?);
    if let SpliceEvent::SpliceFailed { element, reason, .. } = &event {
        bail!("splicing {element} failed: {reason}");
    }
    Ok(event)
}

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Configuration
    let (config, config_err) = match SpliceConfig::load() {
        Ok(config) => (config, None),
        Err(e) => (SpliceConfig::default(), Some(e)),
    };

    // 2. Logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.log.level))
        .init();
    if let Some(e) = config_err {
        log::warn!("Failed to load config ({e}); using defaults");
    }
    log::info!("live-splice demo starting up");

    // 3. Graph, player and output
    let graph = MemoryGraph::new();
    let player = Player::spawn(graph.clone(), &config);
    let (observer, mut events) = ChannelObserver::new();
    player.subscribe(Arc::new(observer));
    let output = player.build_output()?;

    // 4. Live flow
    player.set_playback(PlaybackState::Playing)?;
    let src = output
        .source_pad(graph.as_ref())
        .context("output source has no src pad")?;
    let source = SourceThread::start(Arc::clone(&graph), src, 256, Duration::from_millis(2))?;
    let sink = graph.probe(output.sink.id()).context("output sink has no probe")?;

    // 5. Splice in, let it run, splice out
    let eq = graph.create_element(ElementSpec::Gain(0.8), Some("eq"))?;
    let scope = graph.create_element(ElementSpec::Sink, Some("scope"))?;

    log::info!("add filter: {:?}", capability::add_filter(player.as_ref(), &eq)?);
    expect_event(&mut events).await?;
    log::info!("add branch: {:?}", capability::add_branch(player.as_ref(), &scope)?);
    expect_event(&mut events).await?;

    tokio::time::sleep(Duration::from_millis(100)).await;
    if let Some(probe) = graph.probe(scope.id()) {
        log::info!("scope received {} buffers", probe.buffers());
    }

    log::info!("remove filter: {:?}", capability::remove_filter(player.as_ref(), &eq)?);
    expect_event(&mut events).await?;
    log::info!("remove branch: {:?}", capability::remove_branch(player.as_ref(), &scope)?);
    expect_event(&mut events).await?;

    tokio::time::sleep(Duration::from_millis(50)).await;
    log::info!(
        "source pushed {} buffers, {} refused",
        source.pushed(),
        source.failed()
    );
    source.stop();
    player.set_playback(PlaybackState::Stopped)?;

    // 6. Report
    log::info!("main sink received {} buffers", sink.buffers());
    println!("{}", serde_json::to_string_pretty(&graph.snapshot())?);
    Ok(())
}
