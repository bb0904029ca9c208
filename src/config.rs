use crate::dig2::{all_channels, channel_par, query_value, Digitizer};
use crate::{FeatureEnableSet, ReadoutError, Result, ANALOG_PROBES, DIGITAL_PROBES};
use confique::Config;
use serde::Deserialize;
use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::path::Path;

pub const RECORD_LEN_RANGE: RangeInclusive<usize> = 4..=65532;

pub const START_SOURCES: &[&str] = &["EncodedClkIn", "SINlevel", "SINedge", "SWcmd", "LVDS", "P0"];

pub const TRIGGER_SOURCES: &[&str] = &[
    "TRGIN",
    "P0",
    "SwTrg",
    "LVDS",
    "ITLA",
    "ITLB",
    "ITLA_AND_ITLB",
    "ITLA_OR_ITLB",
    "EncodedClkIn",
    "GPIO",
    "TestPulse",
    "UserTrg",
];

/// Analog probe names; the position is the type tag reported with a hit.
pub const ANALOG_PROBE_TYPES: &[&str] = &[
    "ADCInput",
    "TimeFilter",
    "EnergyFilter",
    "EnergyFilterBaseline",
    "EnergyFilterMinusBaseline",
];

/// Digital probe names; the position is the type tag reported with a hit.
pub const DIGITAL_PROBE_TYPES: &[&str] = &[
    "Trigger",
    "TimeFilterArmed",
    "ReTriggerGuard",
    "EnergyFilterBaselineFreeze",
    "EnergyFilterPeaking",
    "EnergyFilterPeakReady",
    "EnergyFilterPileUpGuard",
    "EventPileUp",
    "ADCSaturation",
    "ADCSaturationProtection",
    "PostSaturationEvent",
    "EnergyFilterSaturation",
    "AcquisitionInhibit",
];

#[derive(Config, Debug, Clone)]
pub struct Conf {
    #[config(nested)]
    pub run_settings: RunSettings,
    #[config(nested)]
    pub module_settings: ModuleSettings,
}

impl Conf {
    pub fn from_file(path: impl AsRef<Path>) -> std::result::Result<Self, confique::Error> {
        Conf::builder().file(path.as_ref()).load()
    }
}

#[derive(Config, Debug, Clone)]
pub struct RunSettings {
    /// Trigger cycles per run, 0 for no limit.
    #[config(default = 0)]
    pub cycles: u64,
    /// Run length in seconds, 0 for no limit.
    #[config(default = 10)]
    pub run_duration: u64,
    #[config(default = 1048576)]
    pub buffer_size: usize,
    #[config(default = 10)]
    pub read_timeout_ms: u64,
    #[config(default = 0.25)]
    pub sim_hit_probability: f64,
    /// Reload the configuration every this many cycles, 0 to never reload.
    #[config(default = 0)]
    pub reload_every: u64,
}

#[derive(Config, Debug, Clone)]
pub struct ModuleSettings {
    pub modules: Vec<PerModuleSettings>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct PerModuleSettings {
    pub name: String,
    pub url: String,
    pub source_id: u32,
    pub record_len: usize,
    #[serde(default)]
    pub pre_trig_len: usize,
    #[serde(default = "default_start_source")]
    pub start_source: String,
    #[serde(default = "default_trig_source")]
    pub trig_source: String,
    #[serde(default = "default_en_chans")]
    pub en_chans: ChannelConfig,
    #[serde(default)]
    pub dc_offset: Option<DCOffsetConfig>,
    #[serde(default)]
    pub trig_thr: Option<TriggerThr>,
    #[serde(default)]
    pub analog_probes: Vec<String>,
    #[serde(default)]
    pub digital_probes: Vec<String>,
    #[serde(default)]
    pub features: FeatureEnableSet,
}

fn default_start_source() -> String {
    "SWcmd".to_string()
}

fn default_trig_source() -> String {
    "SwTrg".to_string()
}

fn default_en_chans() -> ChannelConfig {
    ChannelConfig::All(true)
}

#[derive(Deserialize, Clone, Debug)]
#[serde(untagged)]
pub enum ChannelConfig {
    All(bool),
    List(Vec<usize>),
}

#[derive(Deserialize, Clone, Debug)]
#[serde(untagged)]
pub enum DCOffsetConfig {
    Global(f64),
    PerChannel(HashMap<String, f64>),
}

#[derive(Deserialize, Clone, Debug)]
#[serde(untagged)]
pub enum TriggerThr {
    Global(isize),
    PerChannel(HashMap<String, isize>),
}

fn tokens(source: &str) -> impl Iterator<Item = &str> {
    source.split('|').map(str::trim).filter(|t| !t.is_empty())
}

pub fn probe_type_tag(names: &[&str], name: &str) -> Option<u16> {
    names.iter().position(|n| *n == name).map(|p| p as u16)
}

impl PerModuleSettings {
    /// Settings with every optional field at its default.
    pub fn new(name: &str, url: &str, source_id: u32, record_len: usize) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            source_id,
            record_len,
            pre_trig_len: 0,
            start_source: default_start_source(),
            trig_source: default_trig_source(),
            en_chans: default_en_chans(),
            dc_offset: None,
            trig_thr: None,
            analog_probes: Vec::new(),
            digital_probes: Vec::new(),
            features: FeatureEnableSet::default(),
        }
    }

    /// True when the run is started by a software command.
    pub fn software_start(&self) -> bool {
        tokens(&self.start_source).any(|t| t == "SWcmd")
    }

    fn invalid(&self, parameter: &str, reason: impl Into<String>) -> ReadoutError {
        ReadoutError::validation(&self.name, parameter, reason)
    }

    fn check_channel(&self, parameter: &str, key: &str, num_ch: usize) -> Result<usize> {
        match key.trim().parse::<usize>() {
            Ok(ch) if ch < num_ch => Ok(ch),
            _ => Err(self.invalid(
                parameter,
                format!("channel '{}' is not in 0..{}", key, num_ch),
            )),
        }
    }

    fn check_tokens(&self, parameter: &str, value: &str, allowed: &[&str]) -> Result<()> {
        if tokens(value).next().is_none() {
            return Err(self.invalid(parameter, "empty source list"));
        }
        match tokens(value).find(|t| !allowed.contains(t)) {
            Some(bad) => Err(self.invalid(parameter, format!("unknown source '{}'", bad))),
            None => Ok(()),
        }
    }

    fn check_probes(
        &self,
        parameter: &str,
        probes: &[String],
        allowed: &[&str],
        max: usize,
    ) -> Result<()> {
        if probes.len() > max {
            return Err(self.invalid(
                parameter,
                format!("{} entries given, at most {} allowed", probes.len(), max),
            ));
        }
        match probes.iter().find(|p| !allowed.contains(&p.as_str())) {
            Some(bad) => Err(self.invalid(parameter, format!("unknown probe '{}'", bad))),
            None => Ok(()),
        }
    }

    /// Type, range and list checks against a module with `num_ch` channels.
    pub fn validate(&self, num_ch: usize) -> Result<()> {
        if !RECORD_LEN_RANGE.contains(&self.record_len) {
            return Err(self.invalid(
                "record_len",
                format!(
                    "{} is outside {}..={}",
                    self.record_len,
                    RECORD_LEN_RANGE.start(),
                    RECORD_LEN_RANGE.end()
                ),
            ));
        }
        if self.pre_trig_len >= self.record_len {
            return Err(self.invalid(
                "pre_trig_len",
                format!("{} is not shorter than the record", self.pre_trig_len),
            ));
        }
        if let ChannelConfig::List(ref channels) = self.en_chans {
            for ch in channels {
                self.check_channel("en_chans", &ch.to_string(), num_ch)?;
            }
        }
        match self.dc_offset {
            Some(DCOffsetConfig::Global(offset)) => self.check_offset(offset)?,
            Some(DCOffsetConfig::PerChannel(ref map)) => {
                for (chan, &offset) in map {
                    self.check_channel("dc_offset", chan, num_ch)?;
                    self.check_offset(offset)?;
                }
            }
            None => {}
        }
        if let Some(TriggerThr::PerChannel(ref map)) = self.trig_thr {
            for chan in map.keys() {
                self.check_channel("trig_thr", chan, num_ch)?;
            }
        }
        self.check_tokens("start_source", &self.start_source, START_SOURCES)?;
        self.check_tokens("trig_source", &self.trig_source, TRIGGER_SOURCES)?;
        self.check_probes(
            "analog_probes",
            &self.analog_probes,
            ANALOG_PROBE_TYPES,
            ANALOG_PROBES,
        )?;
        self.check_probes(
            "digital_probes",
            &self.digital_probes,
            DIGITAL_PROBE_TYPES,
            DIGITAL_PROBES,
        )?;
        Ok(())
    }

    fn check_offset(&self, offset: f64) -> Result<()> {
        if (0.0..=100.0).contains(&offset) {
            Ok(())
        } else {
            Err(self.invalid("dc_offset", format!("{} % is outside 0..=100", offset)))
        }
    }
}

/// Source of per-module configuration.
pub trait ConfigStore {
    fn lookup(&self, name: &str) -> Result<&PerModuleSettings>;

    /// Validate `settings` and write them to the device.
    fn apply(&self, settings: &PerModuleSettings, dev: &mut dyn Digitizer) -> Result<()>;

    fn enabled_features(&self, settings: &PerModuleSettings) -> FeatureEnableSet;
}

fn set(
    settings: &PerModuleSettings,
    dev: &mut dyn Digitizer,
    path: &str,
    value: &str,
) -> Result<()> {
    dev.setvalue(path, value).map_err(|code| {
        ReadoutError::validation(
            &settings.name,
            path,
            format!("device rejected '{}': {}", value, code),
        )
    })
}

impl ConfigStore for Conf {
    fn lookup(&self, name: &str) -> Result<&PerModuleSettings> {
        self.module_settings
            .modules
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| ReadoutError::ConfigNotFound(name.to_string()))
    }

    fn apply(&self, s: &PerModuleSettings, dev: &mut dyn Digitizer) -> Result<()> {
        let num_ch: usize = query_value(&s.name, dev, "/par/NumCh")?;
        s.validate(num_ch)?;

        match s.en_chans {
            ChannelConfig::All(enable) => {
                set(s, dev, &all_channels(num_ch, "ChEnable"), &enable.to_string())?;
            }
            ChannelConfig::List(ref channels) => {
                set(s, dev, &all_channels(num_ch, "ChEnable"), "false")?;
                for &ch in channels {
                    set(s, dev, &channel_par(ch, "ChEnable"), "true")?;
                }
            }
        }
        set(s, dev, &all_channels(num_ch, "ChRecordLengthS"), &s.record_len.to_string())?;
        set(s, dev, &all_channels(num_ch, "ChPreTriggerS"), &s.pre_trig_len.to_string())?;
        match s.dc_offset {
            Some(DCOffsetConfig::Global(offset)) => {
                set(s, dev, &all_channels(num_ch, "DCOffset"), &offset.to_string())?;
            }
            Some(DCOffsetConfig::PerChannel(ref map)) => {
                for (chan, offset) in map {
                    let path = format!("/ch/{}/par/DCOffset", chan.trim());
                    set(s, dev, &path, &offset.to_string())?;
                }
            }
            None => {}
        }
        match s.trig_thr {
            Some(TriggerThr::Global(thr)) => {
                set(s, dev, &all_channels(num_ch, "TriggerThr"), &thr.to_string())?;
            }
            Some(TriggerThr::PerChannel(ref map)) => {
                for (chan, thr) in map {
                    let path = format!("/ch/{}/par/TriggerThr", chan.trim());
                    set(s, dev, &path, &thr.to_string())?;
                }
            }
            None => {}
        }
        set(s, dev, "/par/AcqTriggerSource", &s.trig_source)?;
        set(s, dev, "/par/StartSource", &s.start_source)?;
        for (i, probe) in s.analog_probes.iter().enumerate() {
            set(s, dev, &all_channels(num_ch, &format!("WaveAnalogProbe{}", i)), probe)?;
        }
        // Each digital probe entry drives its own WaveDigitalProbeN parameter.
        for (i, probe) in s.digital_probes.iter().enumerate() {
            set(s, dev, &all_channels(num_ch, &format!("WaveDigitalProbe{}", i)), probe)?;
        }
        Ok(())
    }

    fn enabled_features(&self, settings: &PerModuleSettings) -> FeatureEnableSet {
        settings.features
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimDigitizer;
    use crate::FELibReturn;
    use std::io::Write;

    const TOML: &str = r#"
[run_settings]
cycles = 100
buffer_size = 4096

[module_settings]
modules = [
    { name = "adc1", url = "dig2://caendgtz-usb-25380", source_id = 1, record_len = 64, pre_trig_len = 8, digital_probes = ["Trigger", "EventPileUp"], features = { timestamp = true, energy = true } },
    { name = "adc2", url = "dig2://caendgtz-usb-25381", source_id = 2, record_len = 32, en_chans = [0, 3], dc_offset = { "1" = 20.0 }, trig_thr = 900 },
]
"#;

    fn load() -> Conf {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(TOML.as_bytes()).unwrap();
        Conf::from_file(file.path()).unwrap()
    }

    fn module(name: &str) -> PerModuleSettings {
        PerModuleSettings {
            pre_trig_len: 16,
            ..PerModuleSettings::new(name, "dig2://sim", 1, 128)
        }
    }

    #[test]
    fn loads_modules_and_run_defaults() {
        let conf = load();
        assert_eq!(conf.run_settings.cycles, 100);
        assert_eq!(conf.run_settings.read_timeout_ms, 10);
        assert_eq!(conf.module_settings.modules.len(), 2);

        let adc1 = conf.lookup("adc1").unwrap();
        assert_eq!(adc1.source_id, 1);
        assert!(adc1.software_start());
        let features = conf.enabled_features(adc1);
        assert!(features.timestamp && features.energy);
        assert!(!features.raw_timestamp);
        assert!(!features.any_probe());
    }

    #[test]
    fn unknown_module_is_config_not_found() {
        let conf = load();
        assert_eq!(
            conf.lookup("tdc9").unwrap_err(),
            ReadoutError::ConfigNotFound("tdc9".to_string())
        );
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut m = module("m");
        assert!(m.validate(16).is_ok());

        m.record_len = 2;
        assert!(matches!(
            m.validate(16),
            Err(ReadoutError::Validation { ref parameter, .. }) if parameter == "record_len"
        ));

        let mut m = module("m");
        m.pre_trig_len = m.record_len;
        assert!(m.validate(16).is_err());

        let mut m = module("m");
        m.en_chans = ChannelConfig::List(vec![1, 16]);
        assert!(m.validate(16).is_err());

        let mut m = module("m");
        m.dc_offset = Some(DCOffsetConfig::Global(120.0));
        assert!(m.validate(16).is_err());

        let mut m = module("m");
        m.trig_source = "SwTrg | Laser".to_string();
        assert!(m.validate(16).is_err());

        let mut m = module("m");
        m.analog_probes = vec!["ADCInput".into(), "TimeFilter".into(), "EnergyFilter".into()];
        assert!(m.validate(16).is_err());

        let mut m = module("m");
        m.digital_probes = vec!["NotAProbe".into()];
        assert!(m.validate(16).is_err());
    }

    #[test]
    fn apply_writes_each_digital_probe_to_its_own_parameter() {
        let conf = load();
        let mut sim = SimDigitizer::new(4, 1);
        sim.open("dig2://sim").unwrap();
        conf.apply(conf.lookup("adc1").unwrap(), &mut sim).unwrap();

        assert_eq!(sim.getvalue("/ch/3/par/ChRecordLengthS").unwrap(), "64");
        assert_eq!(sim.getvalue("/ch/0/par/WaveDigitalProbe0").unwrap(), "Trigger");
        assert_eq!(sim.getvalue("/ch/0/par/WaveDigitalProbe1").unwrap(), "EventPileUp");
    }

    #[test]
    fn apply_enables_listed_channels_only() {
        let conf = load();
        let mut sim = SimDigitizer::new(4, 1);
        sim.open("dig2://sim").unwrap();
        conf.apply(conf.lookup("adc2").unwrap(), &mut sim).unwrap();

        let enabled: Vec<String> = (0..4)
            .map(|ch| sim.getvalue(&channel_par(ch, "ChEnable")).unwrap())
            .collect();
        assert_eq!(enabled, ["true", "false", "false", "true"]);
        assert_eq!(sim.getvalue("/ch/1/par/DCOffset").unwrap(), "20");
        assert_eq!(sim.getvalue("/ch/2/par/TriggerThr").unwrap(), "900");
    }

    #[test]
    fn device_rejection_is_a_validation_error() {
        let conf = load();
        let mut sim = SimDigitizer::new(4, 1);
        sim.handle()
            .fail_on("set:/par/AcqTriggerSource", FELibReturn::InvalidParam);
        sim.open("dig2://sim").unwrap();
        let err = conf.apply(conf.lookup("adc1").unwrap(), &mut sim).unwrap_err();
        assert!(matches!(
            err,
            ReadoutError::Validation { ref parameter, .. } if parameter == "/par/AcqTriggerSource"
        ));
    }
}
