pub mod channel;
pub mod config;
pub mod dig2;
pub mod digitizer_params;
pub mod encoder;
pub mod error;
pub mod fanout;
pub mod felib;
pub mod hit;
pub mod run;
pub mod segment;
pub mod sim;
pub mod stats;
pub mod trigger;
pub mod trigger_set;

pub use channel::{ModuleReadout, DEFAULT_READ_TIMEOUT};
pub use config::{Conf, ConfigStore, PerModuleSettings};
pub use dig2::Digitizer;
pub use encoder::{decode, encode, encode_into, encoded_len, Fragment};
pub use error::{ReadoutError, Result};
pub use fanout::{FanoutReadout, MoreData};
pub use felib::{FELibReturn, ReadStatus};
pub use hit::{
    format_fields, read_data_format, AnalogProbe, DecodedHit, DigitalProbe, FeatureEnableSet,
    FormatField, ANALOG_PROBES, DIGITAL_PROBES,
};
pub use run::RunControl;
pub use segment::{EventSegment, ModuleIdentity, ReadoutChannel};
pub use sim::{SimDigitizer, SimHandle};
pub use stats::Counter;
pub use trigger::{ChannelHandle, DataReadyPredicate, TriggerAggregator, TriggerPredicate};
pub use trigger_set::{SharedAggregator, Trigger, TriggerId, TriggerSet};
