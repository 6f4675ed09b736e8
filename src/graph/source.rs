//! Dedicated streaming thread feeding a source element.
//!
//! [`SourceThread`] owns an OS thread that pushes a fixed-size buffer of
//! samples out of a source pad at a steady interval, the way a decoder
//! thread would.  The thread may park inside [`MemoryGraph::push`] while a
//! splice holds a pad block; that is the point of running it.
//!
//! Dropping the handle sets the stop flag and joins the thread.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::thread::JoinHandle;
use std::time::Duration;

use super::memory::{FlowError, MemoryGraph};
use super::{Buffer, PadId};

// ---------------------------------------------------------------------------
// SourceThread
// ---------------------------------------------------------------------------

/// Handle to a running source thread.
pub struct SourceThread {
    stop: Arc<AtomicBool>,
    pushed: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
    thread: Option<JoinHandle<()>>,
}

impl SourceThread {
    /// Start pushing `samples_per_buffer` samples out of `pad` every
    /// `interval`.
    ///
    /// Flow errors (nothing linked yet, downstream stopped) are retried on
    /// the next tick rather than ending the thread.
    pub fn start(
        graph: Arc<MemoryGraph>,
        pad: PadId,
        samples_per_buffer: usize,
        interval: Duration,
    ) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let pushed = Arc::new(AtomicU64::new(0));
        let failed = Arc::new(AtomicU64::new(0));
        let stop_clone = Arc::clone(&stop);
        let pushed_clone = Arc::clone(&pushed);
        let failed_clone = Arc::clone(&failed);

        let thread = std::thread::Builder::new()
            .name("source".into())
            .spawn(move || {
                let mut pts = 0u64;
                let mut last_error: Option<FlowError> = None;
                while !stop_clone.load(Ordering::Relaxed) {
                    let buffer = Buffer::new(pts, vec![0.25; samples_per_buffer]);
                    match graph.push(pad, buffer) {
                        Ok(()) => {
                            pts += samples_per_buffer as u64;
                            pushed_clone.fetch_add(1, Ordering::Relaxed);
                            last_error = None;
                        }
                        Err(e) => {
                            failed_clone.fetch_add(1, Ordering::Relaxed);
                            if last_error != Some(e) {
                                log::debug!("source: push failed: {e}");
                            }
                            last_error = Some(e);
                        }
                    }
                    std::thread::sleep(interval);
                }
            })?;

        Ok(Self {
            stop,
            pushed,
            failed,
            thread: Some(thread),
        })
    }

    /// Buffers successfully handed downstream so far.
    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    /// Pushes refused downstream so far (unlinked or flushing).
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Stop the thread and wait for it to exit.
    ///
    /// The thread must not be parked on a blocked pad or a paused node, or
    /// this waits until it is released.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("source: streaming thread panicked");
            }
        }
    }
}

impl Drop for SourceThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ElementSpec, Engine, RunState};

    #[test]
    fn source_thread_feeds_the_sink_until_stopped() {
        let graph = MemoryGraph::new();
        let source = graph.create_element(ElementSpec::Source, None).unwrap();
        let sink = graph.create_element(ElementSpec::Sink, None).unwrap();
        let src = graph.static_pad(source.id(), "src").unwrap();
        graph
            .link(src, graph.static_pad(sink.id(), "sink").unwrap())
            .unwrap();
        graph.set_state(sink.id(), RunState::Playing).unwrap();

        let thread =
            SourceThread::start(Arc::clone(&graph), src, 16, Duration::from_millis(1)).unwrap();
        let probe = graph.probe(sink.id()).unwrap();
        assert!(probe.wait_for_buffers(10, Duration::from_secs(5)));
        thread.stop();

        let settled = probe.buffers();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(probe.buffers(), settled);
        assert_eq!(probe.last_buffer().unwrap().samples.len(), 16);
    }

    #[test]
    fn unlinked_source_keeps_running() {
        let graph = MemoryGraph::new();
        let source = graph.create_element(ElementSpec::Source, None).unwrap();
        let src = graph.static_pad(source.id(), "src").unwrap();

        let thread =
            SourceThread::start(Arc::clone(&graph), src, 4, Duration::from_millis(1)).unwrap();
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(thread.pushed(), 0);
        assert!(thread.failed() > 0);
        drop(thread);
    }
}
