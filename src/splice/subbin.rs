//! Private sub-containers wrapping a spliced element.
//!
//! A filter is wrapped as `{convert-in → element → convert-out}` with `sink`
//! and `src` ghost pads; a branch as `{queue → convert → element}` with only
//! a `sink` ghost pad.  The sub-container owns its adapters.  The caller's
//! element is always taken back out before the sub-container is destroyed,
//! so it can be reused.

use crate::graph::{Element, ElementSpec, Engine, EngineError, NodeId, PadId, RunState};

use super::error::SpliceError;

/// A built sub-container.
pub(crate) struct SubBin {
    pub bin: Element,
    pub sink: PadId,
    pub src: Option<PadId>,
}

/// An element's sub-container as found in a live graph.
pub(crate) struct Attached {
    pub bin: NodeId,
    pub sink: PadId,
    pub src: Option<PadId>,
}

fn pad(engine: &dyn Engine, node: &Element, name: &'static str) -> Result<PadId, SpliceError> {
    engine
        .static_pad(node.id(), name)
        .ok_or_else(|| SpliceError::MissingPad {
            node: node.name().to_string(),
            pad: name,
        })
}

/// Build `bin_name` holding `head`, then `target`, then `tail`, linked in
/// that order.
///
/// On failure everything created here is destroyed and `target` is left
/// free-standing.
pub(crate) fn wrap(
    engine: &dyn Engine,
    bin_name: &str,
    head: &[(ElementSpec, String)],
    target: &Element,
    tail: &[(ElementSpec, String)],
    expose_src: bool,
) -> Result<SubBin, SpliceError> {
    if engine.parent(target.id()).is_some() {
        return Err(SpliceError::AlreadyAttached(target.name().to_string()));
    }
    let bin = engine.create_bin(Some(bin_name))?;
    match populate(engine, &bin, head, target, tail, expose_src) {
        Ok((sink, src)) => Ok(SubBin { bin, sink, src }),
        Err(e) => {
            dismantle(engine, bin.id(), target);
            Err(e)
        }
    }
}

fn populate(
    engine: &dyn Engine,
    bin: &Element,
    head: &[(ElementSpec, String)],
    target: &Element,
    tail: &[(ElementSpec, String)],
    expose_src: bool,
) -> Result<(PadId, Option<PadId>), SpliceError> {
    let mut chain = Vec::with_capacity(head.len() + tail.len() + 1);
    for (spec, name) in head {
        chain.push(adopt(engine, bin, spec, name)?);
    }
    engine.add_child(bin.id(), target.id())?;
    chain.push(target.clone());
    for (spec, name) in tail {
        chain.push(adopt(engine, bin, spec, name)?);
    }

    for pair in chain.windows(2) {
        engine.link(pad(engine, &pair[0], "src")?, pad(engine, &pair[1], "sink")?)?;
    }

    let (Some(first), Some(last)) = (chain.first(), chain.last()) else {
        return Err(SpliceError::MissingPad {
            node: bin.name().to_string(),
            pad: "sink",
        });
    };
    let sink = engine.add_ghost_pad(bin.id(), "sink", pad(engine, first, "sink")?)?;
    let src = if expose_src {
        Some(engine.add_ghost_pad(bin.id(), "src", pad(engine, last, "src")?)?)
    } else {
        None
    };
    Ok((sink, src))
}

/// Create an adapter and move it into `bin`.
fn adopt(
    engine: &dyn Engine,
    bin: &Element,
    spec: &ElementSpec,
    name: &str,
) -> Result<Element, SpliceError> {
    let element = engine.create_element(spec.clone(), Some(name))?;
    if let Err(e) = engine.add_child(bin.id(), element.id()) {
        if let Err(e) = engine.destroy(element.id()) {
            log::warn!("splice: could not destroy loose adapter {name}: {e}");
        }
        return Err(e.into());
    }
    Ok(element)
}

/// Find the sub-container holding `target` inside `container`.
pub(crate) fn locate(
    engine: &dyn Engine,
    container: NodeId,
    target: &Element,
) -> Result<Attached, SpliceError> {
    let not_attached = || SpliceError::NotAttached(target.name().to_string());
    let bin = engine.parent(target.id()).ok_or_else(not_attached)?;
    if engine.parent(bin) != Some(container) {
        return Err(not_attached());
    }
    let sink = engine.static_pad(bin, "sink").ok_or_else(not_attached)?;
    Ok(Attached {
        bin,
        sink,
        src: engine.static_pad(bin, "src"),
    })
}

/// Stop `bin`, take `target` back out of it and destroy the rest.
///
/// Best effort: failures are logged, never returned.
pub(crate) fn dismantle(engine: &dyn Engine, bin: NodeId, target: &Element) {
    let step = |what: &str, result: Result<(), EngineError>| {
        if let Err(e) = result {
            log::warn!("splice: {what} while dismantling {bin}: {e}");
        }
    };

    step("stop", engine.set_state(bin, RunState::Null));
    if let Some(parent) = engine.parent(bin) {
        step("detach", engine.remove_child(parent, bin));
    }
    if engine.parent(target.id()) == Some(bin) {
        step("release target", engine.remove_child(bin, target.id()));
    }
    step("destroy", engine.destroy(bin));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::MemoryGraph;

    fn adapters(prefix: &str) -> Vec<(ElementSpec, String)> {
        vec![(ElementSpec::Identity, format!("{prefix}-convert-in"))]
    }

    #[test]
    fn wrap_builds_linked_sub_container() {
        let graph = MemoryGraph::new();
        let eq = graph.create_element(ElementSpec::Gain(0.5), Some("eq")).unwrap();

        let sub = wrap(
            graph.as_ref(),
            "eq-bin",
            &adapters("eq"),
            &eq,
            &[(ElementSpec::Identity, "eq-convert-out".into())],
            true,
        )
        .unwrap();

        assert_eq!(
            graph.child_names(sub.bin.id()),
            vec!["eq-convert-in", "eq", "eq-convert-out"]
        );
        assert_eq!(graph.parent(eq.id()), Some(sub.bin.id()));
        assert!(sub.src.is_some());
        assert_eq!(graph.stats().links, 2);
    }

    #[test]
    fn failed_wrap_leaves_target_free_standing() {
        let graph = MemoryGraph::new();
        let eq = graph.create_element(ElementSpec::Gain(0.5), Some("eq")).unwrap();
        graph.fail_links(1, 1);

        let err = wrap(
            graph.as_ref(),
            "eq-bin",
            &adapters("eq"),
            &eq,
            &[(ElementSpec::Identity, "eq-convert-out".into())],
            true,
        )
        .err()
        .unwrap();

        assert!(matches!(err, SpliceError::Engine(EngineError::LinkRefused { .. })));
        assert_eq!(graph.parent(eq.id()), None);
        assert!(graph.contains(eq.id()));
        assert_eq!(graph.snapshot().nodes.len(), 1);
        assert_eq!(eq.ref_count(), 1);
    }

    #[test]
    fn wrap_refuses_parented_target() {
        let graph = MemoryGraph::new();
        let owner = graph.create_bin(None).unwrap();
        let eq = graph.create_element(ElementSpec::Identity, Some("eq")).unwrap();
        graph.add_child(owner.id(), eq.id()).unwrap();

        let err = wrap(graph.as_ref(), "eq-bin", &[], &eq, &[], true).err().unwrap();
        assert_eq!(err, SpliceError::AlreadyAttached("eq".into()));
    }

    #[test]
    fn locate_requires_membership_of_container() {
        let graph = MemoryGraph::new();
        let container = graph.create_bin(None).unwrap();
        let eq = graph.create_element(ElementSpec::Identity, Some("eq")).unwrap();

        assert!(matches!(
            locate(graph.as_ref(), container.id(), &eq),
            Err(SpliceError::NotAttached(_))
        ));

        let sub = wrap(graph.as_ref(), "eq-bin", &[], &eq, &[], true).unwrap();
        graph.add_child(container.id(), sub.bin.id()).unwrap();
        let found = locate(graph.as_ref(), container.id(), &eq).unwrap();
        assert_eq!(found.bin, sub.bin.id());
        assert_eq!(found.sink, sub.sink);
        assert_eq!(found.src, sub.src);
    }
}
