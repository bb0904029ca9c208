use crate::config::ConfigStore;
use crate::dig2::{channel_par, query_value, Digitizer};
use crate::digitizer_params::log_identity;
use crate::encoder::encode_into;
use crate::segment::{EventSegment, ModuleIdentity, ReadoutChannel};
use crate::{
    read_data_format, DecodedHit, FELibReturn, FeatureEnableSet, ReadStatus, ReadoutError,
    Result,
};
use log::{debug, info, trace, warn};
use std::rc::Rc;
use std::time::Duration;

pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(10);

/// State that only exists while the module is armed.
#[derive(Debug, Clone)]
struct ArmedState {
    features: FeatureEnableSet,
    trace_lengths: Vec<usize>,
}

/// Readout of a single digitizer module.
///
/// The channel owns the device exclusively. A successful `initialize` leaves
/// it connected, configured and armed; any failure leaves it disconnected.
/// Dropping the channel tears the device down.
pub struct ModuleReadout<D: Digitizer> {
    identity: ModuleIdentity,
    device: D,
    store: Rc<dyn ConfigStore>,
    read_timeout: Duration,
    armed: Option<ArmedState>,
    hit: DecodedHit,
}

impl<D: Digitizer> ModuleReadout<D> {
    pub fn new(identity: ModuleIdentity, device: D, store: Rc<dyn ConfigStore>) -> Self {
        Self {
            identity,
            device,
            store,
            read_timeout: DEFAULT_READ_TIMEOUT,
            armed: None,
            hit: DecodedHit::default(),
        }
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    /// Feature set fixed at the last successful initialize.
    pub fn features(&self) -> Option<&FeatureEnableSet> {
        self.armed.as_ref().map(|a| &a.features)
    }

    /// Per-channel record lengths, empty while disarmed.
    pub fn trace_lengths(&self) -> &[usize] {
        self.armed.as_ref().map_or(&[], |a| &a.trace_lengths)
    }

    fn device_err(&self, operation: &'static str) -> impl Fn(FELibReturn) -> ReadoutError + '_ {
        move |code| ReadoutError::device(&self.identity.name, operation, code)
    }

    fn query_trace_lengths(&self) -> Result<Vec<usize>> {
        let name = &self.identity.name;
        let num_ch: usize = query_value(name, &self.device, "/par/NumCh")?;
        (0..num_ch)
            .map(|ch| query_value(name, &self.device, &channel_par(ch, "ChRecordLengthS")))
            .collect()
    }

    fn setup(&mut self) -> Result<()> {
        let store = Rc::clone(&self.store);
        let settings = store.lookup(&self.identity.name)?;

        self.device
            .open(&self.identity.url)
            .map_err(|code| ReadoutError::Connection {
                module: self.identity.name.clone(),
                url: self.identity.url.clone(),
                code,
            })?;
        log_identity(&self.identity.name, self.identity.source_id, &self.device);

        store.apply(settings, &mut self.device)?;
        let features = store.enabled_features(settings);
        let format = read_data_format(&features);
        let res = self.device.configure_endpoint(&format);
        res.map_err(self.device_err("configure_endpoint"))?;

        let trace_lengths = self.query_trace_lengths()?;

        let res = self.device.clear();
        res.map_err(self.device_err("clear"))?;
        let res = self.device.arm();
        res.map_err(self.device_err("arm"))?;
        if settings.software_start() {
            let res = self.device.start();
            res.map_err(self.device_err("start"))?;
        }

        info!(
            "Module {} armed: {} channels, features {:?}",
            self.identity.name,
            trace_lengths.len(),
            features
        );
        self.armed = Some(ArmedState {
            features,
            trace_lengths,
        });
        Ok(())
    }

    /// Stop, disarm and close, attempting every step. Returns the first failure.
    fn teardown(&mut self) -> Result<()> {
        self.armed = None;
        self.hit.clear();
        if !self.device.is_connected() {
            return Ok(());
        }
        let steps = [
            ("stop", self.device.stop()),
            ("disarm", self.device.disarm()),
            ("close", self.device.close()),
        ];
        let mut first = None;
        for (operation, res) in steps {
            if let Err(code) = res {
                warn!(
                    "Module {}: {} failed during teardown: {}",
                    self.identity.name, operation, code
                );
                first.get_or_insert(ReadoutError::device(&self.identity.name, operation, code));
            }
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<D: Digitizer> Drop for ModuleReadout<D> {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            warn!("Module {}: teardown on drop failed: {}", self.identity.name, e);
        }
    }
}

impl<D: Digitizer> EventSegment for ModuleReadout<D> {
    fn initialize(&mut self) -> Result<()> {
        if self.device.is_connected() {
            self.teardown()?;
        }
        if let Err(e) = self.setup() {
            if let Err(unwind) = self.teardown() {
                warn!("Module {}: unwind after {} also failed: {}", self.identity.name, e, unwind);
            }
            return Err(e);
        }
        Ok(())
    }

    fn disable(&mut self) -> Result<()> {
        if self.device.is_connected() {
            info!("Module {} disabled", self.identity.name);
        }
        self.teardown()
    }

    fn read(&mut self, dest: &mut [u8]) -> Result<usize> {
        let Some(armed) = self.armed.as_ref() else {
            return Err(ReadoutError::device(
                &self.identity.name,
                "readdata",
                FELibReturn::Disabled,
            ));
        };
        let name = &self.identity.name;

        let ret = self.device.readdata(self.read_timeout, &mut self.hit);
        match ReadStatus::from_return(ret) {
            Ok(ReadStatus::Hit) => {}
            Ok(ReadStatus::NoData) => {
                debug!("Module {}: triggered but no hit arrived", name);
                return Ok(0);
            }
            Ok(ReadStatus::Stopped) => {
                info!("Module {}: acquisition stopped", name);
                return Ok(0);
            }
            Err(code) => return Err(ReadoutError::device(name, "readdata", code)),
        }

        let ch = self.hit.channel as usize;
        let Some(&trace_len) = armed.trace_lengths.get(ch) else {
            return Err(ReadoutError::Device {
                module: name.clone(),
                operation: format!("readdata (channel {})", ch),
                code: FELibReturn::InvalidParam,
            });
        };
        let analog = self.hit.analog_probes.iter().zip(armed.features.analog_probes);
        let digital = self.hit.digital_probes.iter().zip(armed.features.digital_probes);
        let lengths = analog
            .filter_map(|(p, on)| p.as_ref().filter(|_| on).map(|p| p.samples.len()))
            .chain(digital.filter_map(|(p, on)| p.as_ref().filter(|_| on).map(|p| p.samples.len())));
        for len in lengths {
            if len != trace_len {
                warn!(
                    "Module {}: channel {} trace has {} samples, expected {}",
                    name, ch, len, trace_len
                );
            }
        }

        let written = encode_into(name, &self.hit, &armed.features, dest)?;
        trace!("Module {}: {} byte fragment from channel {}", name, written, ch);
        Ok(written)
    }
}

impl<D: Digitizer> ReadoutChannel for ModuleReadout<D> {
    fn identity(&self) -> &ModuleIdentity {
        &self.identity
    }

    fn data_ready(&mut self, timeout: Duration) -> Result<bool> {
        let ret = self.device.hasdata(timeout);
        ret.into_ready().map_err(self.device_err("hasdata"))
    }

    fn reset_hardware(&mut self) -> Result<()> {
        let opened_here = !self.device.is_connected();
        if opened_here {
            self.device
                .open(&self.identity.url)
                .map_err(|code| ReadoutError::Connection {
                    module: self.identity.name.clone(),
                    url: self.identity.url.clone(),
                    code,
                })?;
        }
        self.armed = None;
        let res = self.device.reset();
        info!("Module {}: hardware reset", self.identity.name);
        if opened_here {
            if let Err(code) = self.device.close() {
                warn!("Module {}: close after reset failed: {}", self.identity.name, code);
            }
        }
        res.map_err(self.device_err("reset"))
    }
}
