use tokio::sync::watch;

/// Why intake is halted. Both conditions can hold at once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GateState {
    /// The last checkpoint write failed; cleared by the next successful one.
    pub checkpoint_failed: bool,
    /// A finalized batch exhausted its sink retries; held until restart.
    pub sink_exhausted: bool,
}

impl GateState {
    pub fn is_open(&self) -> bool {
        !self.checkpoint_failed && !self.sink_exhausted
    }
}

/// Shared switch that stops the source from admitting new records while a
/// fatal condition is outstanding.
#[derive(Debug)]
pub struct IntakeGate {
    state: watch::Sender<GateState>,
}

impl Default for IntakeGate {
    fn default() -> Self {
        Self::new()
    }
}

impl IntakeGate {
    pub fn new() -> Self {
        let (state, _) = watch::channel(GateState::default());
        Self { state }
    }

    pub fn state(&self) -> GateState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state().is_open()
    }

    pub fn halt_for_checkpoint(&self) {
        self.state.send_modify(|s| s.checkpoint_failed = true);
    }

    pub fn clear_checkpoint(&self) {
        self.state.send_if_modified(|s| {
            let changed = s.checkpoint_failed;
            s.checkpoint_failed = false;
            changed
        });
    }

    pub fn halt_for_sink(&self) {
        self.state.send_modify(|s| s.sink_exhausted = true);
    }

    /// Resolve once intake is open again.
    pub async fn wait_open(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(GateState::is_open).await;
    }
}
