use crate::segment::{EventSegment, ReadoutChannel};
use crate::trigger_set::SharedAggregator;
use crate::Result;
use log::{debug, info, warn};
use std::cell::Cell;
use std::rc::Rc;

/// "Call read again before the next poll" signal shared with the host.
#[derive(Clone, Debug, Default)]
pub struct MoreData(Rc<Cell<bool>>);

impl MoreData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, more: bool) {
        self.0.set(more);
    }

    pub fn get(&self) -> bool {
        self.0.get()
    }

    /// Read and clear.
    pub fn take(&self) -> bool {
        self.0.replace(false)
    }
}

/// Presents every channel of an aggregator as one segment.
///
/// Lifecycle calls go to all channels. `read` serves one triggered channel per
/// call, most recently triggered first, and raises [`MoreData`] while others
/// are still waiting.
pub struct FanoutReadout {
    aggregator: SharedAggregator,
    more: MoreData,
    config_changed: bool,
    last_source: Option<u32>,
}

impl FanoutReadout {
    pub fn new(aggregator: SharedAggregator, more: MoreData) -> Self {
        Self {
            aggregator,
            more,
            config_changed: false,
            last_source: None,
        }
    }

    /// Switch to a freshly built aggregator. Hardware is reset on the next initialize.
    ///
    /// Modules of the outgoing aggregator are disabled first.
    pub fn rebind(&mut self, aggregator: SharedAggregator) {
        if let Err(e) = self.broadcast_down(|ch| ch.disable()) {
            warn!("Disabling outgoing modules failed: {}", e);
        }
        self.aggregator = aggregator;
        self.more.set(false);
        self.last_source = None;
        self.config_changed = true;
    }

    pub fn mark_config_changed(&mut self) {
        self.config_changed = true;
    }

    pub fn config_changed(&self) -> bool {
        self.config_changed
    }

    /// Source id of the channel served by the last non-empty `read`.
    pub fn last_source_id(&self) -> Option<u32> {
        self.last_source
    }

    pub fn aggregator(&self) -> &SharedAggregator {
        &self.aggregator
    }

    fn discard_worklist(&self) {
        self.aggregator.borrow_mut().worklist_mut().clear();
        self.more.set(false);
    }

    fn reset_all(&mut self) -> Result<()> {
        let mut agg = self.aggregator.borrow_mut();
        for ch in agg.channels_mut() {
            ch.reset_hardware()?;
        }
        Ok(())
    }

    /// Run `step` on every channel. On the first failure disable them all.
    fn bring_up(
        &mut self,
        what: &str,
        step: impl Fn(&mut dyn ReadoutChannel) -> Result<()>,
    ) -> Result<()> {
        let res = {
            let mut agg = self.aggregator.borrow_mut();
            let res = agg.channels_mut().try_for_each(|ch| step(ch));
            res
        };
        if let Err(e) = res {
            warn!("{} failed, disabling all modules: {}", what, e);
            if let Err(unwind) = self.broadcast_down(|ch| ch.disable()) {
                warn!("Disable after failed {} also failed: {}", what, unwind);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Run `step` on every channel even if some fail. Returns the first failure.
    fn broadcast_down(
        &mut self,
        step: impl Fn(&mut dyn ReadoutChannel) -> Result<()>,
    ) -> Result<()> {
        self.discard_worklist();
        let mut agg = self.aggregator.borrow_mut();
        let mut first_err = None;
        for ch in agg.channels_mut() {
            if let Err(e) = step(ch) {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl EventSegment for FanoutReadout {
    fn initialize(&mut self) -> Result<()> {
        if self.config_changed {
            info!("Configuration changed, resetting hardware");
            if let Err(e) = self.reset_all() {
                if let Err(unwind) = self.broadcast_down(|ch| ch.disable()) {
                    warn!("Disable after failed reset also failed: {}", unwind);
                }
                return Err(e);
            }
            self.config_changed = false;
        }
        self.bring_up("initialize", |ch| ch.initialize())?;
        info!("{} modules initialized", self.aggregator.borrow().len());
        Ok(())
    }

    fn disable(&mut self) -> Result<()> {
        self.broadcast_down(|ch| ch.disable())
    }

    fn on_pause(&mut self) -> Result<()> {
        self.broadcast_down(|ch| ch.on_pause())
    }

    fn on_resume(&mut self) -> Result<()> {
        self.bring_up("resume", |ch| ch.on_resume())
    }

    fn read(&mut self, dest: &mut [u8]) -> Result<usize> {
        let mut agg = self.aggregator.borrow_mut();
        let Some(ch) = agg.pop_triggered() else {
            self.more.set(false);
            return Ok(0);
        };
        let source = ch.identity().source_id;
        let res = ch.read(dest);
        let remaining = agg.worklist().len();
        self.more.set(remaining > 0);
        let written = res?;
        self.last_source = Some(source);
        debug!(
            "Served source {} ({} bytes), {} modules still pending",
            source, written, remaining
        );
        Ok(written)
    }
}
