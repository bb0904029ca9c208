use crate::Result;
use std::time::Duration;

/// Immutable description of one physical module.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleIdentity {
    /// Key used to look the module up in the configuration.
    pub name: String,
    pub source_id: u32,
    /// FELib connection URL, e.g. `dig2://caendgtz-usb-25380`.
    pub url: String,
}

impl ModuleIdentity {
    pub fn new(name: impl Into<String>, source_id: u32, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source_id,
            url: url.into(),
        }
    }
}

/// Run-state hooks and the per-call readout the host drives.
///
/// `read` writes at most `dest.len()` bytes and returns how many it wrote.
pub trait EventSegment {
    fn initialize(&mut self) -> Result<()>;

    fn disable(&mut self) -> Result<()>;

    /// Pausing is a full disable; hardware may be reconfigured while paused.
    fn on_pause(&mut self) -> Result<()> {
        self.disable()
    }

    fn on_resume(&mut self) -> Result<()> {
        self.initialize()
    }

    fn read(&mut self, dest: &mut [u8]) -> Result<usize>;
}

/// A segment backed by exactly one module.
pub trait ReadoutChannel: EventSegment {
    fn identity(&self) -> &ModuleIdentity;

    /// Whether a decoded hit is waiting; `false` on timeout.
    fn data_ready(&mut self, timeout: Duration) -> Result<bool>;

    /// Full hardware reset, independent of applying configuration.
    fn reset_hardware(&mut self) -> Result<()>;
}
