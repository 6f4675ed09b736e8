//! The always-present output graph and its two splice fixtures.
//!
//! ```text
//! source ─▶ [output: volume ─▶ [filters: convert-in ─▶ marker] ─▶ convert ─▶ tee ─▶ queue ─▶ sink]
//!                               └──── filter fixture ─────────┘                └ tee fixture
//! ```
//!
//! The source sits outside the output container so the output can be
//! stopped and started without touching whatever feeds it.

use std::sync::Arc;

use crate::config::OutputConfig;
use crate::graph::{Element, ElementSpec, Engine, EngineError, OverflowPolicy, PadId, RunState};
use crate::splice::{Fixture, SpliceError};

/// Handles on every fixed node of the output graph.
pub struct Output {
    pub source: Element,
    pub bin: Element,
    pub volume: Element,
    pub filters: Element,
    pub marker: Element,
    pub convert: Element,
    pub tee: Element,
    pub queue: Element,
    pub sink: Element,
    pub filter_fixture: Arc<Fixture>,
    pub tee_fixture: Arc<Fixture>,
}

fn pad(engine: &dyn Engine, node: &Element, name: &'static str) -> Result<PadId, SpliceError> {
    engine
        .static_pad(node.id(), name)
        .ok_or_else(|| SpliceError::MissingPad {
            node: node.name().to_string(),
            pad: name,
        })
}

fn link(engine: &dyn Engine, from: &Element, to: &Element) -> Result<(), SpliceError> {
    engine.link(pad(engine, from, "src")?, pad(engine, to, "sink")?)?;
    Ok(())
}

fn child(
    engine: &dyn Engine,
    container: &Element,
    spec: ElementSpec,
    name: &str,
) -> Result<Element, SpliceError> {
    let element = engine.create_element(spec, Some(name))?;
    engine.add_child(container.id(), element.id())?;
    Ok(element)
}

impl Output {
    /// Build the output graph in the `Null` state.
    pub fn build(engine: &dyn Engine, config: &OutputConfig) -> Result<Self, SpliceError> {
        let source = engine.create_element(ElementSpec::Source, Some("source"))?;
        let bin = engine.create_bin(Some("output"))?;

        let volume = child(engine, &bin, ElementSpec::Gain(config.volume), "volume")?;

        let filters = engine.create_bin(Some("filters"))?;
        engine.add_child(bin.id(), filters.id())?;
        let convert_in = child(engine, &filters, ElementSpec::Identity, "filter-convert-in")?;
        let marker = child(engine, &filters, ElementSpec::Identity, "filter-marker")?;
        link(engine, &convert_in, &marker)?;
        engine.add_ghost_pad(filters.id(), "sink", pad(engine, &convert_in, "sink")?)?;
        engine.add_ghost_pad(filters.id(), "src", pad(engine, &marker, "src")?)?;

        let convert = child(engine, &bin, ElementSpec::Identity, "convert")?;
        let tee = child(engine, &bin, ElementSpec::Tee, "tee")?;
        let queue = child(
            engine,
            &bin,
            ElementSpec::Queue {
                max_buffers: config.main_queue_buffers,
                overflow: OverflowPolicy::Block,
            },
            "output-queue",
        )?;
        let sink = child(engine, &bin, ElementSpec::Sink, "sink")?;

        link(engine, &volume, &filters)?;
        link(engine, &filters, &convert)?;
        link(engine, &convert, &tee)?;
        engine.link(engine.request_pad(tee.id())?, pad(engine, &queue, "sink")?)?;
        link(engine, &queue, &sink)?;

        engine.add_ghost_pad(bin.id(), "sink", pad(engine, &volume, "sink")?)?;
        link(engine, &source, &bin)?;

        let filter_fixture = Fixture::filter(engine, "filters", filters.id(), marker.id())?;
        let tee_fixture = Fixture::tee(engine, "tee", tee.id())?;

        log::info!("player: output graph built");
        Ok(Self {
            source,
            bin,
            volume,
            filters,
            marker,
            convert,
            tee,
            queue,
            sink,
            filter_fixture,
            tee_fixture,
        })
    }

    /// Pad streaming threads push into.
    pub fn source_pad(&self, engine: &dyn Engine) -> Option<PadId> {
        engine.static_pad(self.source.id(), "src")
    }

    /// Apply `state` to the source and everything in the output container.
    pub fn set_state(&self, engine: &dyn Engine, state: RunState) -> Result<(), EngineError> {
        engine.set_state(self.bin.id(), state)?;
        engine.set_state(self.source.id(), state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Buffer, MemoryGraph};
    use std::time::Duration;

    #[test]
    fn output_graph_carries_data_end_to_end() {
        let graph = MemoryGraph::new();
        let output = Output::build(graph.as_ref(), &OutputConfig::default()).unwrap();
        output.set_state(graph.as_ref(), RunState::Playing).unwrap();

        let src = output.source_pad(graph.as_ref()).unwrap();
        assert_eq!(
            graph.chain(src, output.sink.id()),
            vec![
                "volume",
                "filter-convert-in",
                "filter-marker",
                "convert",
                "tee",
                "output-queue",
                "sink"
            ]
        );

        for pts in 0..4 {
            graph.push(src, Buffer::new(pts, vec![1.0; 8])).unwrap();
        }
        let probe = graph.probe(output.sink.id()).unwrap();
        assert!(probe.wait_for_buffers(4, Duration::from_secs(5)));
    }

    #[test]
    fn fixtures_point_at_the_fixed_nodes() {
        let graph = MemoryGraph::new();
        let output = Output::build(graph.as_ref(), &OutputConfig::default()).unwrap();

        assert_eq!(output.filter_fixture.marker().unwrap(), output.marker.id());
        assert_eq!(output.filter_fixture.container(), output.filters.id());
        assert_eq!(output.tee_fixture.tee_node().unwrap(), output.tee.id());
        assert_eq!(output.tee_fixture.container(), output.bin.id());

        let volume_src = graph.static_pad(output.volume.id(), "src");
        assert_eq!(graph.peer(output.filter_fixture.input_pad()), volume_src);
        let convert_src = graph.static_pad(output.convert.id(), "src");
        assert_eq!(graph.peer(output.tee_fixture.input_pad()), convert_src);
    }

    #[test]
    fn main_queue_uses_configured_bound() {
        let graph = MemoryGraph::new();
        let config = OutputConfig {
            main_queue_buffers: 4,
            volume: 0.5,
        };
        let output = Output::build(graph.as_ref(), &config).unwrap();
        let queue = graph.queue(output.queue.id()).unwrap();
        assert_eq!(queue.capacity(), 4);
        assert_eq!(queue.policy(), OverflowPolicy::Block);
    }
}
