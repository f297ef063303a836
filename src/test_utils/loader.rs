use crate::cache::{LoadDescriptor, fingerprint_of};
use crate::runtime::Handle;
use crate::sync::ManualResetEvent;
use crate::task::Task;
use std::borrow::Cow;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A descriptor loading a fixed `u32` and counting how often `load` is
/// called. Clones share the count.
#[derive(Clone)]
pub(crate) struct CountingLoader {
    identity: String,
    fingerprint: u64,
    value: u32,
    calls: Arc<AtomicUsize>,

    /// Makes the load fail with this message instead.
    error: Option<&'static str>,

    /// Blocks the loader thread until set.
    gate: Option<Arc<ManualResetEvent>>,

    /// Moves the load onto the worker pool first.
    hop: Option<Handle>,
}

impl CountingLoader {
    pub(crate) fn new(identity: &str, value: u32) -> Self {
        Self {
            identity: identity.to_owned(),
            fingerprint: fingerprint_of(identity),
            value,
            calls: Arc::new(AtomicUsize::new(0)),
            error: None,
            gate: None,
            hop: None,
        }
    }

    pub(crate) fn gated(mut self, gate: Arc<ManualResetEvent>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub(crate) fn failing(mut self, error: &'static str) -> Self {
        self.error = Some(error);
        self
    }

    pub(crate) fn hop_to(mut self, handle: Handle) -> Self {
        self.hop = Some(handle);
        self
    }

    pub(crate) fn with_fingerprint(mut self, fingerprint: u64) -> Self {
        self.fingerprint = fingerprint;
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl LoadDescriptor for CountingLoader {
    type Output = u32;

    fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    fn identity(&self) -> Cow<'_, str> {
        Cow::Borrowed(&self.identity)
    }

    fn load(&self) -> Task<anyhow::Result<Arc<u32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let value = self.value;
        let error = self.error;
        let gate = self.gate.clone();
        let hop = self.hop.clone();
        Task::new(async move {
            if let Some(handle) = hop {
                handle.schedule().await;
            }
            if let Some(gate) = gate {
                gate.wait();
            }
            match error {
                Some(error) => Err(anyhow::anyhow!(error)),
                None => Ok(Arc::new(value)),
            }
        })
    }
}
