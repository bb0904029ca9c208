use crate::dig2::Digitizer;
use log::info;

/// Board-level parameters logged when a module connects.
const IDENTITY_PARAMS: &[&str] = &[
    "ModelName",
    "SerialNum",
    "FwType",
    "CupVer",
    "FPGA_FwVer",
    "NumCh",
    "ADC_Nbit",
    "ADC_SamplRate",
];

/// Log what is on the other end of a fresh connection.
///
/// Parameters the firmware does not expose are skipped.
pub fn log_identity(module: &str, source_id: u32, dev: &dyn Digitizer) {
    let mut param_log = String::new();
    for &param in IDENTITY_PARAMS {
        let path = format!("/par/{}", param);
        if let Ok(value) = dev.getvalue(&path) {
            param_log.push_str(&format!("\n  {}: {}", param, value.trim()));
        }
    }
    info!(
        "Module {} (source id {}) connected:{}",
        module, source_id, param_log
    );
}
