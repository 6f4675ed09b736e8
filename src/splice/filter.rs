//! Filter splice: serial insertion next to the fixture's marker.
//!
//! ```text
//! before:  pred ─────────────────────────────────────────▶ marker
//! after:   pred ─▶ [F-convert-in ─▶ F ─▶ F-convert-out] ─▶ marker
//! ```
//!
//! Each new filter goes immediately upstream of the marker, so repeated
//! insertions build `pred → F1 → F2 → … → marker` in insertion order.

use crate::graph::{Element, ElementSpec, Engine, PadId, RunState};

use super::error::SpliceError;
use super::fixture::Fixture;
use super::subbin::{self, Attached};

/// Wrap `element` and link it in ahead of the marker.
///
/// Returns the new sub-container's input pad.  If linking or starting the
/// sub-container fails the direct `pred → marker` link is restored; if that
/// fails too the fixture is flagged inconsistent.
pub(crate) fn insert(
    engine: &dyn Engine,
    fixture: &Fixture,
    element: &Element,
    run_state: RunState,
) -> Result<PadId, SpliceError> {
    let marker = fixture.marker()?;
    let marker_sink = engine
        .static_pad(marker, "sink")
        .ok_or_else(|| SpliceError::MissingPad {
            node: fixture.name().to_string(),
            pad: "sink",
        })?;
    let pred = engine
        .peer(marker_sink)
        .ok_or_else(|| SpliceError::Detached(fixture.name().to_string()))?;

    let name = element.name();
    let sub = subbin::wrap(
        engine,
        &format!("{name}-bin"),
        &[(ElementSpec::Identity, format!("{name}-convert-in"))],
        element,
        &[(ElementSpec::Identity, format!("{name}-convert-out"))],
        true,
    )?;
    let bin = sub.bin.id();
    let Some(sub_src) = sub.src else {
        subbin::dismantle(engine, bin, element);
        return Err(SpliceError::MissingPad {
            node: sub.bin.name().to_string(),
            pad: "src",
        });
    };

    if let Err(e) = engine.add_child(fixture.container(), bin) {
        subbin::dismantle(engine, bin, element);
        return Err(e.into());
    }
    if let Err(e) = engine.unlink(pred, marker_sink) {
        subbin::dismantle(engine, bin, element);
        return Err(e.into());
    }

    let spliced = engine
        .link(pred, sub.sink)
        .and_then(|()| engine.link(sub_src, marker_sink))
        .and_then(|()| engine.set_state(bin, run_state));
    if let Err(e) = spliced {
        log::warn!(
            "splice: inserting {name} into {} failed: {e}; restoring direct link",
            fixture.name()
        );
        let unlink = |src: PadId, sink: PadId| {
            if let Err(e) = engine.unlink(src, sink) {
                log::debug!("splice: rollback unlink {src} -> {sink}: {e}");
            }
        };
        unlink(pred, sub.sink);
        unlink(sub_src, marker_sink);
        let restored = engine.link(pred, marker_sink);
        subbin::dismantle(engine, bin, element);
        return match restored {
            Ok(()) => Err(e.into()),
            Err(relink) => {
                log::error!(
                    "splice: could not restore {pred} -> {marker_sink} in {}: {relink}",
                    fixture.name()
                );
                Err(inconsistent(fixture))
            }
        };
    }

    log::info!("splice: filter {name} inserted into {}", fixture.name());
    Ok(sub.sink)
}

fn inconsistent(fixture: &Fixture) -> SpliceError {
    fixture.mark_inconsistent();
    SpliceError::Inconsistent(fixture.name().to_string())
}

/// Find the sub-container wrapping `element` in this fixture.
pub(crate) fn locate(
    engine: &dyn Engine,
    fixture: &Fixture,
    element: &Element,
) -> Result<Attached, SpliceError> {
    fixture.marker()?;
    subbin::locate(engine, fixture.container(), element)
}

/// Take the sub-container out and join its neighbours directly.
///
/// `element` is detached and left free-standing for reuse.  If either unlink
/// fails the sub-container is put back as it was; a fixture that cannot be
/// put back is flagged inconsistent.
pub(crate) fn remove(
    engine: &dyn Engine,
    fixture: &Fixture,
    element: &Element,
    attached: Attached,
) -> Result<(), SpliceError> {
    let detached = || SpliceError::Detached(fixture.name().to_string());
    let sub_src = attached.src.ok_or_else(detached)?;
    let prev = engine.peer(attached.sink).ok_or_else(detached)?;
    let next = engine.peer(sub_src).ok_or_else(detached)?;
    let was = engine.state(attached.bin).unwrap_or(RunState::Null);

    engine.set_state(attached.bin, RunState::Null)?;
    let unlinked = engine.unlink(prev, attached.sink).and_then(|()| {
        engine.unlink(sub_src, next).map_err(|e| {
            // Half out: reattach the input side before restarting.
            match engine.link(prev, attached.sink) {
                Ok(()) => e,
                Err(relink) => {
                    log::error!(
                        "splice: could not relink {prev} -> {} in {}: {relink}",
                        attached.sink,
                        fixture.name()
                    );
                    relink
                }
            }
        })
    });
    if let Err(e) = unlinked {
        log::warn!(
            "splice: unlinking {} from {} failed: {e}",
            element.name(),
            fixture.name()
        );
        let intact =
            engine.peer(attached.sink) == Some(prev) && engine.peer(sub_src) == Some(next);
        if intact && engine.set_state(attached.bin, was).is_ok() {
            return Err(e.into());
        }
        return Err(inconsistent(fixture));
    }

    let relinked = engine.link(prev, next);
    subbin::dismantle(engine, attached.bin, element);

    match relinked {
        Ok(()) => {
            log::info!(
                "splice: filter {} removed from {}",
                element.name(),
                fixture.name()
            );
            Ok(())
        }
        Err(e) => {
            log::error!(
                "splice: could not join {prev} -> {next} in {}: {e}",
                fixture.name()
            );
            Err(inconsistent(fixture))
        }
    }
}
