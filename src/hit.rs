use serde::{Deserialize, Serialize};

pub const ANALOG_PROBES: usize = 2;
pub const DIGITAL_PROBES: usize = 4;

/// One analog trace captured alongside a hit.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AnalogProbe {
    pub kind: u16,
    pub samples: Vec<i32>,
}

/// One digital trace, one byte per sample.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DigitalProbe {
    pub kind: u16,
    pub samples: Vec<u8>,
}

/// A single channel's event as decoded by the device layer.
///
/// Fields that the module was not asked to decode are left at zero / `None`.
/// The device refills the same value on every `readdata` call so the probe
/// vectors keep their allocation across hits.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DecodedHit {
    pub channel: u8,
    pub timestamp_ns: u64,
    pub raw_timestamp: u64,
    pub fine_timestamp: u16,
    pub energy: u16,
    pub low_priority_flags: u16,
    pub high_priority_flags: u16,
    pub downsample: u8,
    pub analog_probes: [Option<AnalogProbe>; ANALOG_PROBES],
    pub digital_probes: [Option<DigitalProbe>; DIGITAL_PROBES],
    pub fail: bool,
}

impl DecodedHit {
    /// Reset every field while keeping probe buffers allocated.
    pub fn clear(&mut self) {
        self.channel = 0;
        self.timestamp_ns = 0;
        self.raw_timestamp = 0;
        self.fine_timestamp = 0;
        self.energy = 0;
        self.low_priority_flags = 0;
        self.high_priority_flags = 0;
        self.downsample = 0;
        self.fail = false;
        for probe in self.analog_probes.iter_mut().flatten() {
            probe.kind = 0;
            probe.samples.clear();
        }
        for probe in self.digital_probes.iter_mut().flatten() {
            probe.kind = 0;
            probe.samples.clear();
        }
    }
}

/// Which optional hit fields a module decodes and encodes for the whole run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct FeatureEnableSet {
    pub timestamp: bool,
    pub raw_timestamp: bool,
    pub fine_timestamp: bool,
    pub energy: bool,
    pub low_priority_flags: bool,
    pub high_priority_flags: bool,
    pub downsample: bool,
    pub analog_probes: [bool; ANALOG_PROBES],
    pub digital_probes: [bool; DIGITAL_PROBES],
}

impl FeatureEnableSet {
    pub fn all() -> Self {
        Self {
            timestamp: true,
            raw_timestamp: true,
            fine_timestamp: true,
            energy: true,
            low_priority_flags: true,
            high_priority_flags: true,
            downsample: true,
            analog_probes: [true; ANALOG_PROBES],
            digital_probes: [true; DIGITAL_PROBES],
        }
    }

    /// Build a set from a bit mask, one bit per flag in record order.
    ///
    /// Bits 0..7 are the scalar fields, 7..9 the analog probes and 9..13 the
    /// digital probes. Useful for enumerating every combination.
    pub fn from_bits(bits: u16) -> Self {
        let bit = |n: u16| bits & (1 << n) != 0;
        Self {
            timestamp: bit(0),
            raw_timestamp: bit(1),
            fine_timestamp: bit(2),
            energy: bit(3),
            low_priority_flags: bit(4),
            high_priority_flags: bit(5),
            downsample: bit(6),
            analog_probes: [bit(7), bit(8)],
            digital_probes: [bit(9), bit(10), bit(11), bit(12)],
        }
    }

    pub fn any_probe(&self) -> bool {
        self.analog_probes.iter().chain(self.digital_probes.iter()).any(|&b| b)
    }
}

/// One entry of the endpoint read-data format.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatField {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dim: Option<u8>,
}

impl FormatField {
    fn new(name: &str, kind: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: kind.to_string(),
            dim: None,
        }
    }

    fn array(name: &str, kind: &str) -> Self {
        Self {
            dim: Some(1),
            ..Self::new(name, kind)
        }
    }
}

/// The list of fields the device should decode for this feature set.
pub fn format_fields(features: &FeatureEnableSet) -> Vec<FormatField> {
    let mut fields = vec![FormatField::new("CHANNEL", "U8")];
    if features.timestamp {
        fields.push(FormatField::new("TIMESTAMP_NS", "U64"));
    }
    if features.raw_timestamp {
        fields.push(FormatField::new("TIMESTAMP", "U64"));
    }
    if features.fine_timestamp {
        fields.push(FormatField::new("FINE_TIMESTAMP", "U16"));
    }
    if features.energy {
        fields.push(FormatField::new("ENERGY", "U16"));
    }
    if features.low_priority_flags {
        fields.push(FormatField::new("FLAGS_LOW_PRIORITY", "U16"));
    }
    if features.high_priority_flags {
        fields.push(FormatField::new("FLAGS_HIGH_PRIORITY", "U16"));
    }
    if features.downsample {
        fields.push(FormatField::new("DOWNSAMPLING", "U8"));
    }
    for i in (0..ANALOG_PROBES).filter(|&i| features.analog_probes[i]) {
        fields.push(FormatField::array(&format!("ANALOG_PROBE_{}", i + 1), "I32"));
        fields.push(FormatField::new(&format!("ANALOG_PROBE_{}_TYPE", i + 1), "U8"));
    }
    for i in (0..DIGITAL_PROBES).filter(|&i| features.digital_probes[i]) {
        fields.push(FormatField::array(&format!("DIGITAL_PROBE_{}", i + 1), "U8"));
        fields.push(FormatField::new(&format!("DIGITAL_PROBE_{}_TYPE", i + 1), "U8"));
    }
    if features.any_probe() {
        fields.push(FormatField::new("WAVEFORM_SIZE", "SIZE_T"));
    }
    fields.push(FormatField::new("BOARD_FAIL", "BOOL"));
    fields.push(FormatField::new("EVENT_SIZE", "SIZE_T"));
    fields
}

/// JSON read-data format handed to the device endpoint.
pub fn read_data_format(features: &FeatureEnableSet) -> String {
    serde_json::to_string(&format_fields(features)).expect("format fields serialize to JSON")
}
