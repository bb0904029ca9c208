//! A software stand-in for a dig2 digitizer.
//!
//! `SimDigitizer` keeps a parameter tree in memory, honours the read-data
//! format set on its endpoint and produces hits either from a scripted queue
//! or at random with a seeded generator. A [`SimHandle`] shares the queue, an
//! operation log and fault injection with the caller after the device itself
//! has been moved into a readout channel.

use crate::config::{probe_type_tag, ANALOG_PROBE_TYPES, DIGITAL_PROBE_TYPES};
use crate::dig2::{
    channel_par, Digitizer, CMD_ARM, CMD_CLEAR, CMD_DISARM, CMD_RESET, CMD_START, CMD_STOP,
};
use crate::{
    AnalogProbe, DecodedHit, DigitalProbe, FELibReturn, FormatField, ANALOG_PROBES,
    DIGITAL_PROBES,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{
    cell::RefCell,
    collections::{HashMap, HashSet, VecDeque},
    rc::Rc,
    time::Duration,
};

const DEFAULT_RECORD_LEN: usize = 1024;
const DEFAULT_PRE_TRIGGER: usize = 128;
const BASELINE: i32 = 2048;

const READ_ONLY: &[&str] = &[
    "/par/NumCh",
    "/par/ModelName",
    "/par/SerialNum",
    "/par/ADC_Nbit",
    "/par/ADC_SamplRate",
    "/par/CupVer",
    "/par/FPGA_FwVer",
    "/par/FwType",
];

#[derive(Debug, Default)]
struct Shared {
    log: Vec<String>,
    pending: VecDeque<DecodedHit>,
    faults: HashMap<String, FELibReturn>,
}

/// Caller-side view of a simulated digitizer.
#[derive(Clone, Debug, Default)]
pub struct SimHandle(Rc<RefCell<Shared>>);

impl SimHandle {
    /// Queue a hit to be reported before any random ones.
    pub fn queue_hit(&self, hit: DecodedHit) {
        self.0.borrow_mut().pending.push_back(hit);
    }

    pub fn pending(&self) -> usize {
        self.0.borrow().pending.len()
    }

    /// Make an operation fail with `code` until cleared.
    ///
    /// Keys are `open`, `close`, `endpoint`, `hasdata`, `readdata`,
    /// `cmd:<path>`, `set:<path>` and `get:<path>`.
    pub fn fail_on(&self, key: &str, code: FELibReturn) {
        self.0.borrow_mut().faults.insert(key.to_string(), code);
    }

    pub fn clear_faults(&self) {
        self.0.borrow_mut().faults.clear();
    }

    /// Every operation performed so far, oldest first.
    pub fn ops(&self) -> Vec<String> {
        self.0.borrow().log.clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.0
            .borrow()
            .log
            .iter()
            .filter(|op| op.starts_with(prefix))
            .count()
    }

    pub fn clear_log(&self) {
        self.0.borrow_mut().log.clear();
    }
}

pub struct SimDigitizer {
    num_ch: usize,
    url: Option<String>,
    params: HashMap<String, String>,
    fields: HashSet<String>,
    armed: bool,
    hit_probability: f64,
    rng: StdRng,
    clock_ns: u64,
    shared: SimHandle,
}

impl SimDigitizer {
    pub fn new(num_ch: usize, seed: u64) -> Self {
        let mut sim = Self {
            num_ch,
            url: None,
            params: HashMap::new(),
            fields: HashSet::new(),
            armed: false,
            hit_probability: 0.0,
            rng: StdRng::seed_from_u64(seed),
            clock_ns: 0,
            shared: SimHandle::default(),
        };
        sim.load_defaults();
        sim
    }

    /// Chance that a `hasdata` poll on an armed module finds a random hit.
    pub fn with_hit_probability(mut self, p: f64) -> Self {
        self.hit_probability = p.clamp(0.0, 1.0);
        self
    }

    pub fn handle(&self) -> SimHandle {
        self.shared.clone()
    }

    fn load_defaults(&mut self) {
        self.params.clear();
        for ch in 0..self.num_ch {
            let defaults = [
                ("ChEnable", "true".to_string()),
                ("ChRecordLengthS", DEFAULT_RECORD_LEN.to_string()),
                ("ChPreTriggerS", DEFAULT_PRE_TRIGGER.to_string()),
                ("DCOffset", "50".to_string()),
                ("TriggerThr", "1000".to_string()),
                ("WaveAnalogProbe0", ANALOG_PROBE_TYPES[0].to_string()),
                ("WaveAnalogProbe1", ANALOG_PROBE_TYPES[1].to_string()),
            ];
            for (par, value) in defaults {
                self.params.insert(channel_par(ch, par), value);
            }
            for i in 0..DIGITAL_PROBES {
                self.params.insert(
                    channel_par(ch, &format!("WaveDigitalProbe{}", i)),
                    DIGITAL_PROBE_TYPES[i].to_string(),
                );
            }
        }
        self.params
            .insert("/par/AcqTriggerSource".to_string(), "SwTrg".to_string());
        self.params
            .insert("/par/StartSource".to_string(), "SWcmd".to_string());
    }

    fn log(&self, op: String) {
        self.shared.0.borrow_mut().log.push(op);
    }

    fn fault(&self, key: &str) -> Result<(), FELibReturn> {
        match self.shared.0.borrow().faults.get(key) {
            Some(&code) => Err(code),
            None => Ok(()),
        }
    }

    fn connected(&self) -> Result<(), FELibReturn> {
        if self.url.is_some() {
            Ok(())
        } else {
            Err(FELibReturn::InvalidHandle)
        }
    }

    fn builtin(&self, path: &str) -> Option<String> {
        let value = match path {
            "/par/NumCh" => self.num_ch.to_string(),
            "/par/ModelName" => "VX2745 (simulated)".to_string(),
            "/par/SerialNum" => "25380".to_string(),
            "/par/ADC_Nbit" => "16".to_string(),
            "/par/ADC_SamplRate" => "125".to_string(),
            "/par/CupVer" => "2024061800".to_string(),
            "/par/FPGA_FwVer" => "2024.6.0".to_string(),
            "/par/FwType" => "DPP_PHA".to_string(),
            _ => return None,
        };
        Some(value)
    }

    /// Expand `/ch/A..B/par/X` into one path per channel.
    fn expand(&self, path: &str) -> Result<Vec<String>, FELibReturn> {
        let Some(rest) = path.strip_prefix("/ch/") else {
            return Ok(vec![path.to_string()]);
        };
        let (chans, par) = rest.split_once("/par/").ok_or(FELibReturn::InvalidParam)?;
        let parse = |s: &str| s.parse::<usize>().map_err(|_| FELibReturn::InvalidParam);
        let (first, last) = match chans.split_once("..") {
            Some((a, b)) => (parse(a)?, parse(b)?),
            None => (parse(chans)?, parse(chans)?),
        };
        if first > last || last >= self.num_ch {
            return Err(FELibReturn::InvalidParam);
        }
        Ok((first..=last).map(|ch| channel_par(ch, par)).collect())
    }

    fn channel_value<T: std::str::FromStr>(&self, ch: usize, par: &str, default: T) -> T {
        self.params
            .get(&channel_par(ch, par))
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn probe_tag(&self, ch: usize, par: &str, names: &[&str]) -> u16 {
        self.params
            .get(&channel_par(ch, par))
            .and_then(|v| probe_type_tag(names, v))
            .unwrap_or(0)
    }

    fn generate(&mut self) -> DecodedHit {
        let enabled: Vec<usize> = (0..self.num_ch)
            .filter(|&ch| self.channel_value(ch, "ChEnable", true))
            .collect();
        let ch = if enabled.is_empty() {
            0
        } else {
            enabled[self.rng.random_range(0..enabled.len())]
        };
        let record_len = self.channel_value(ch, "ChRecordLengthS", DEFAULT_RECORD_LEN);
        let pre_trigger = self
            .channel_value(ch, "ChPreTriggerS", DEFAULT_PRE_TRIGGER)
            .min(record_len);

        self.clock_ns += self.rng.random_range(1_000..100_000);
        let energy: u16 = self.rng.random_range(10..4096);

        let mut hit = DecodedHit {
            channel: ch as u8,
            timestamp_ns: self.clock_ns,
            raw_timestamp: self.clock_ns / 8,
            fine_timestamp: self.rng.random_range(0..1024),
            energy,
            low_priority_flags: 0,
            high_priority_flags: 0,
            downsample: 1,
            ..Default::default()
        };
        for i in 0..ANALOG_PROBES {
            let kind = self.probe_tag(ch, &format!("WaveAnalogProbe{}", i), ANALOG_PROBE_TYPES);
            let samples = (0..record_len)
                .map(|s| {
                    let noise = self.rng.random_range(-4..=4);
                    let pulse = if s >= pre_trigger { energy as i32 } else { 0 };
                    BASELINE + pulse + noise
                })
                .collect();
            hit.analog_probes[i] = Some(AnalogProbe { kind, samples });
        }
        for i in 0..DIGITAL_PROBES {
            let kind = self.probe_tag(ch, &format!("WaveDigitalProbe{}", i), DIGITAL_PROBE_TYPES);
            let samples = (0..record_len).map(|s| (s >= pre_trigger) as u8).collect();
            hit.digital_probes[i] = Some(DigitalProbe { kind, samples });
        }
        hit
    }

    /// Copy the fields named in the read-data format from `src` into `dst`.
    fn fill(&self, src: &DecodedHit, dst: &mut DecodedHit) {
        let has = |name: &str| self.fields.contains(name);
        dst.clear();
        dst.channel = src.channel;
        if has("TIMESTAMP_NS") {
            dst.timestamp_ns = src.timestamp_ns;
        }
        if has("TIMESTAMP") {
            dst.raw_timestamp = src.raw_timestamp;
        }
        if has("FINE_TIMESTAMP") {
            dst.fine_timestamp = src.fine_timestamp;
        }
        if has("ENERGY") {
            dst.energy = src.energy;
        }
        if has("FLAGS_LOW_PRIORITY") {
            dst.low_priority_flags = src.low_priority_flags;
        }
        if has("FLAGS_HIGH_PRIORITY") {
            dst.high_priority_flags = src.high_priority_flags;
        }
        if has("DOWNSAMPLING") {
            dst.downsample = src.downsample;
        }
        if has("BOARD_FAIL") {
            dst.fail = src.fail;
        }
        for i in 0..ANALOG_PROBES {
            if !has(&format!("ANALOG_PROBE_{}", i + 1)) {
                continue;
            }
            match (&mut dst.analog_probes[i], &src.analog_probes[i]) {
                (Some(d), Some(s)) => {
                    d.kind = s.kind;
                    d.samples.extend_from_slice(&s.samples);
                }
                (d, s) => *d = s.clone(),
            }
        }
        for i in 0..DIGITAL_PROBES {
            if !has(&format!("DIGITAL_PROBE_{}", i + 1)) {
                continue;
            }
            match (&mut dst.digital_probes[i], &src.digital_probes[i]) {
                (Some(d), Some(s)) => {
                    d.kind = s.kind;
                    d.samples.extend_from_slice(&s.samples);
                }
                (d, s) => *d = s.clone(),
            }
        }
    }
}

impl Digitizer for SimDigitizer {
    fn open(&mut self, url: &str) -> Result<(), FELibReturn> {
        self.log(format!("open {}", url));
        self.fault("open")?;
        if self.url.is_some() {
            return Err(FELibReturn::DevAlreadyOpen);
        }
        self.url = Some(url.to_string());
        Ok(())
    }

    fn close(&mut self) -> Result<(), FELibReturn> {
        self.log("close".to_string());
        self.connected()?;
        self.fault("close")?;
        self.url = None;
        self.armed = false;
        self.fields.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.url.is_some()
    }

    fn getvalue(&self, path: &str) -> Result<String, FELibReturn> {
        self.connected()?;
        self.fault(&format!("get:{}", path))?;
        self.builtin(path)
            .or_else(|| self.params.get(path).cloned())
            .ok_or(FELibReturn::InvalidParam)
    }

    fn setvalue(&mut self, path: &str, value: &str) -> Result<(), FELibReturn> {
        self.log(format!("set {}={}", path, value));
        self.connected()?;
        self.fault(&format!("set:{}", path))?;
        if READ_ONLY.contains(&path) {
            return Err(FELibReturn::InvalidParam);
        }
        for p in self.expand(path)? {
            self.params.insert(p, value.to_string());
        }
        Ok(())
    }

    fn sendcommand(&mut self, path: &str) -> Result<(), FELibReturn> {
        self.log(format!("cmd {}", path));
        self.connected()?;
        self.fault(&format!("cmd:{}", path))?;
        match path {
            CMD_ARM => self.armed = true,
            CMD_DISARM => self.armed = false,
            CMD_CLEAR => self.shared.0.borrow_mut().pending.clear(),
            CMD_RESET => {
                self.armed = false;
                self.load_defaults();
            }
            CMD_START | CMD_STOP => {}
            _ => return Err(FELibReturn::NotImplemented),
        }
        Ok(())
    }

    fn configure_endpoint(&mut self, format: &str) -> Result<(), FELibReturn> {
        self.log("endpoint".to_string());
        self.connected()?;
        self.fault("endpoint")?;
        let fields: Vec<FormatField> =
            serde_json::from_str(format).map_err(|_| FELibReturn::InvalidParam)?;
        self.fields = fields.into_iter().map(|f| f.name).collect();
        Ok(())
    }

    fn hasdata(&mut self, _timeout: Duration) -> FELibReturn {
        self.log("hasdata".to_string());
        if self.url.is_none() {
            return FELibReturn::InvalidHandle;
        }
        if let Err(code) = self.fault("hasdata") {
            return code;
        }
        if self.shared.pending() > 0 {
            return FELibReturn::Success;
        }
        if self.armed && self.rng.random_bool(self.hit_probability) {
            let hit = self.generate();
            self.shared.queue_hit(hit);
            return FELibReturn::Success;
        }
        FELibReturn::Timeout
    }

    fn readdata(&mut self, _timeout: Duration, hit: &mut DecodedHit) -> FELibReturn {
        self.log("readdata".to_string());
        if self.url.is_none() {
            return FELibReturn::InvalidHandle;
        }
        if let Err(code) = self.fault("readdata") {
            return code;
        }
        let next = self.shared.0.borrow_mut().pending.pop_front();
        match next {
            Some(src) => {
                self.fill(&src, hit);
                FELibReturn::Success
            }
            None if self.armed => FELibReturn::Timeout,
            None => FELibReturn::Stop,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{read_data_format, FeatureEnableSet};

    #[test]
    fn channel_ranges_expand_and_bounds_are_checked() {
        let mut sim = SimDigitizer::new(4, 1);
        sim.open("dig2://sim").unwrap();
        sim.setvalue("/ch/0..3/par/ChRecordLengthS", "256").unwrap();
        sim.setvalue("/ch/2/par/ChRecordLengthS", "512").unwrap();
        assert_eq!(sim.getvalue("/ch/1/par/ChRecordLengthS").unwrap(), "256");
        assert_eq!(sim.getvalue("/ch/2/par/ChRecordLengthS").unwrap(), "512");
        assert_eq!(
            sim.setvalue("/ch/0..4/par/DCOffset", "10"),
            Err(FELibReturn::InvalidParam)
        );
        assert_eq!(sim.setvalue("/par/NumCh", "8"), Err(FELibReturn::InvalidParam));
    }

    #[test]
    fn parameters_need_a_connection() {
        let mut sim = SimDigitizer::new(4, 1);
        assert_eq!(sim.getvalue("/par/NumCh"), Err(FELibReturn::InvalidHandle));
        assert_eq!(sim.hasdata(Duration::ZERO), FELibReturn::InvalidHandle);
        assert_eq!(sim.close(), Err(FELibReturn::InvalidHandle));
    }

    #[test]
    fn readdata_honours_the_endpoint_format() {
        let mut sim = SimDigitizer::new(4, 1);
        let handle = sim.handle();
        sim.open("dig2://sim").unwrap();
        let features = FeatureEnableSet {
            energy: true,
            ..Default::default()
        };
        sim.configure_endpoint(&read_data_format(&features)).unwrap();
        sim.arm().unwrap();
        handle.queue_hit(DecodedHit {
            channel: 2,
            timestamp_ns: 55,
            energy: 900,
            ..Default::default()
        });

        assert_eq!(sim.hasdata(Duration::ZERO), FELibReturn::Success);
        let mut hit = DecodedHit::default();
        assert_eq!(sim.readdata(Duration::ZERO, &mut hit), FELibReturn::Success);
        assert_eq!(hit.channel, 2);
        assert_eq!(hit.energy, 900);
        assert_eq!(hit.timestamp_ns, 0);

        assert_eq!(sim.readdata(Duration::ZERO, &mut hit), FELibReturn::Timeout);
        sim.disarm().unwrap();
        assert_eq!(sim.readdata(Duration::ZERO, &mut hit), FELibReturn::Stop);
    }

    #[test]
    fn random_hits_follow_record_length() {
        let mut sim = SimDigitizer::new(2, 7).with_hit_probability(1.0);
        sim.open("dig2://sim").unwrap();
        sim.setvalue("/ch/0..1/par/ChRecordLengthS", "40").unwrap();
        sim.configure_endpoint(&read_data_format(&FeatureEnableSet::all()))
            .unwrap();
        sim.arm().unwrap();

        let mut hit = DecodedHit::default();
        for _ in 0..5 {
            assert_eq!(sim.hasdata(Duration::ZERO), FELibReturn::Success);
            assert_eq!(sim.readdata(Duration::ZERO, &mut hit), FELibReturn::Success);
            assert!(hit.channel < 2);
            for probe in hit.analog_probes.iter().flatten() {
                assert_eq!(probe.samples.len(), 40);
            }
            for probe in hit.digital_probes.iter().flatten() {
                assert_eq!(probe.samples.len(), 40);
            }
        }
    }

    #[test]
    fn injected_faults_surface_as_codes() {
        let mut sim = SimDigitizer::new(2, 1);
        let handle = sim.handle();
        handle.fail_on("open", FELibReturn::DevNotFound);
        assert_eq!(sim.open("dig2://nowhere"), Err(FELibReturn::DevNotFound));
        handle.clear_faults();
        sim.open("dig2://sim").unwrap();
        handle.fail_on("hasdata", FELibReturn::Comm);
        assert_eq!(sim.hasdata(Duration::ZERO), FELibReturn::Comm);
        assert_eq!(handle.count("open"), 2);
    }
}
