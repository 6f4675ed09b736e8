//! Tee splice: independent branches off the distribution tee.
//!
//! ```text
//! tee ─┬─ src_0 ─▶ (main path)
//!      └─ src_N ─▶ [B-queue ─▶ B-convert ─▶ B]
//! ```
//!
//! Every branch gets its own request pad and its own bounded queue, so a
//! slow consumer only ever stalls or drops within its own branch.

use crate::config::BranchConfig;
use crate::graph::{Element, ElementSpec, Engine, PadId, RunState};

use super::error::SpliceError;
use super::fixture::Fixture;
use super::subbin::{self, Attached};

/// Wrap `element` behind a bounded queue and hang it off a new tee pad.
///
/// Returns the branch's input pad.  If linking or starting the branch fails
/// the request pad is given back; a pad that cannot be released leaves the
/// fixture inconsistent.
pub(crate) fn attach(
    engine: &dyn Engine,
    fixture: &Fixture,
    element: &Element,
    branch: BranchConfig,
    run_state: RunState,
) -> Result<PadId, SpliceError> {
    let tee = fixture.tee_node()?;
    let name = element.name();
    let sub = subbin::wrap(
        engine,
        &format!("{name}-branch"),
        &[
            (
                ElementSpec::Queue {
                    max_buffers: branch.max_buffers,
                    overflow: branch.overflow,
                },
                format!("{name}-queue"),
            ),
            (ElementSpec::Identity, format!("{name}-convert")),
        ],
        element,
        &[],
        false,
    )?;
    let bin = sub.bin.id();

    if let Err(e) = engine.add_child(fixture.container(), bin) {
        subbin::dismantle(engine, bin, element);
        return Err(e.into());
    }
    let tee_src = match engine.request_pad(tee) {
        Ok(pad) => pad,
        Err(e) => {
            subbin::dismantle(engine, bin, element);
            return Err(e.into());
        }
    };
    let linked = engine.link(tee_src, sub.sink);
    let was_linked = linked.is_ok();
    let started = linked.and_then(|()| engine.set_state(bin, run_state));
    if let Err(e) = started {
        log::warn!(
            "splice: attaching branch {name} to {} failed: {e}",
            fixture.name()
        );
        if was_linked {
            if let Err(e) = engine.unlink(tee_src, sub.sink) {
                log::debug!("splice: rollback unlink {tee_src} -> {}: {e}", sub.sink);
            }
        }
        let released = engine.release_request_pad(tee_src);
        subbin::dismantle(engine, bin, element);
        if let Err(release) = released {
            log::error!(
                "splice: could not release {tee_src} on {}: {release}",
                fixture.name()
            );
            fixture.mark_inconsistent();
            return Err(SpliceError::Inconsistent(fixture.name().to_string()));
        }
        return Err(e.into());
    }

    log::info!("splice: branch {name} attached to {}", fixture.name());
    Ok(sub.sink)
}

/// Find the branch sub-container holding `element` in this fixture.
pub(crate) fn locate(
    engine: &dyn Engine,
    fixture: &Fixture,
    element: &Element,
) -> Result<Attached, SpliceError> {
    fixture.tee_node()?;
    subbin::locate(engine, fixture.container(), element)
}

/// Cut the branch off the tee, give back its pad and destroy it.
///
/// `element` is detached and left free-standing for reuse.
pub(crate) fn detach(
    engine: &dyn Engine,
    fixture: &Fixture,
    element: &Element,
    attached: Attached,
) -> Result<(), SpliceError> {
    if let Some(tee_src) = engine.peer(attached.sink) {
        engine.unlink(tee_src, attached.sink)?;
        if let Err(e) = engine.release_request_pad(tee_src) {
            log::warn!(
                "splice: could not release {tee_src} on {}: {e}",
                fixture.name()
            );
        }
    }
    subbin::dismantle(engine, attached.bin, element);
    log::info!(
        "splice: branch {} detached from {}",
        element.name(),
        fixture.name()
    );
    Ok(())
}
