use crate::{DecodedHit, FELibReturn, ReadoutError};
use std::str::FromStr;
use std::time::Duration;

pub const CMD_ARM: &str = "/cmd/armacquisition";
pub const CMD_DISARM: &str = "/cmd/disarmacquisition";
pub const CMD_START: &str = "/cmd/swstartacquisition";
pub const CMD_STOP: &str = "/cmd/swstopacquisition";
pub const CMD_CLEAR: &str = "/cmd/cleardata";
pub const CMD_RESET: &str = "/cmd/reset";

/// Access to one dig2 family digitizer.
///
/// Parameter paths follow the FELib tree (`/par/NumCh`, `/ch/0..63/par/...`)
/// and values travel as strings. `hasdata` and `readdata` return the raw FELib
/// code so callers can tell a timeout or stop apart from a fault.
pub trait Digitizer {
    fn open(&mut self, url: &str) -> Result<(), FELibReturn>;

    fn close(&mut self) -> Result<(), FELibReturn>;

    fn is_connected(&self) -> bool;

    fn getvalue(&self, path: &str) -> Result<String, FELibReturn>;

    fn setvalue(&mut self, path: &str, value: &str) -> Result<(), FELibReturn>;

    fn sendcommand(&mut self, path: &str) -> Result<(), FELibReturn>;

    /// Select the active endpoint and set its read-data format (JSON).
    fn configure_endpoint(&mut self, format: &str) -> Result<(), FELibReturn>;

    fn hasdata(&mut self, timeout: Duration) -> FELibReturn;

    /// Decode the next hit straight into `hit`.
    fn readdata(&mut self, timeout: Duration, hit: &mut DecodedHit) -> FELibReturn;

    fn arm(&mut self) -> Result<(), FELibReturn> {
        self.sendcommand(CMD_ARM)
    }

    fn disarm(&mut self) -> Result<(), FELibReturn> {
        self.sendcommand(CMD_DISARM)
    }

    fn start(&mut self) -> Result<(), FELibReturn> {
        self.sendcommand(CMD_START)
    }

    fn stop(&mut self) -> Result<(), FELibReturn> {
        self.sendcommand(CMD_STOP)
    }

    fn clear(&mut self) -> Result<(), FELibReturn> {
        self.sendcommand(CMD_CLEAR)
    }

    fn reset(&mut self) -> Result<(), FELibReturn> {
        self.sendcommand(CMD_RESET)
    }
}

/// Path covering channels `0..num_ch` in one setvalue call.
pub fn all_channels(num_ch: usize, par: &str) -> String {
    format!("/ch/0..{}/par/{}", num_ch.saturating_sub(1), par)
}

pub fn channel_par(ch: usize, par: &str) -> String {
    format!("/ch/{}/par/{}", ch, par)
}

/// Read a parameter and parse it, reporting failures as device query errors.
pub fn query_value<T>(module: &str, dev: &dyn Digitizer, path: &str) -> crate::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = dev.getvalue(path).map_err(|code| ReadoutError::DeviceQuery {
        module: module.to_string(),
        path: path.to_string(),
        reason: code.to_string(),
    })?;
    raw.trim().parse().map_err(|e: T::Err| ReadoutError::DeviceQuery {
        module: module.to_string(),
        path: path.to_string(),
        reason: format!("unparsable value '{}': {}", raw.trim(), e),
    })
}
