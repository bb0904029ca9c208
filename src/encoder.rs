//! Binary fragment layout for a single hit.
//!
//! Every record carries the same sequence of fields regardless of which
//! features the module has enabled: a disabled scalar is written as zero and a
//! disabled probe as a zero type tag with a zero length. A reader therefore
//! never needs to know the module's feature set to walk a fragment.
//!
//! ```text
//! name\0[pad] | channel:u16 | ns:u64 | raw:u64 | fine:u16 | energy:u16
//!             | low:u16 | high:u16 | downsample:u16
//!             | 2 x (type:u16, len:u32, i32 x len)
//!             | 4 x (type:u16, len:u32, u8 x len) | [pad]
//! ```
//!
//! Integers are in host byte order.

use crate::{
    AnalogProbe, DecodedHit, DigitalProbe, FeatureEnableSet, ReadoutError, Result,
    ANALOG_PROBES, DIGITAL_PROBES,
};

/// channel, ns, raw, fine, energy, low flags, high flags, downsample
pub const HEADER_LEN: usize = 2 + 8 + 8 + 2 + 2 + 2 + 2 + 2;
/// type tag + sample count
pub const PROBE_HEADER_LEN: usize = 2 + 4;

const ANALOG_SAMPLE_LEN: usize = 4;
const DIGITAL_SAMPLE_LEN: usize = 1;

fn round_even(n: usize) -> usize {
    n + (n & 1)
}

/// Bytes taken by the NUL-terminated, even-padded module name.
pub fn name_segment_len(name: &str) -> usize {
    round_even(name.len() + 1)
}

fn analog_probe<'a>(
    hit: &'a DecodedHit,
    features: &FeatureEnableSet,
    i: usize,
) -> Option<&'a AnalogProbe> {
    if features.analog_probes[i] {
        hit.analog_probes[i].as_ref()
    } else {
        None
    }
}

fn digital_probe<'a>(
    hit: &'a DecodedHit,
    features: &FeatureEnableSet,
    i: usize,
) -> Option<&'a DigitalProbe> {
    if features.digital_probes[i] {
        hit.digital_probes[i].as_ref()
    } else {
        None
    }
}

/// Exact size of the record `encode_into` would produce.
pub fn encoded_len(name: &str, hit: &DecodedHit, features: &FeatureEnableSet) -> usize {
    let mut len = name_segment_len(name) + HEADER_LEN;
    for i in 0..ANALOG_PROBES {
        let samples = analog_probe(hit, features, i).map_or(0, |p| p.samples.len());
        len += PROBE_HEADER_LEN + samples * ANALOG_SAMPLE_LEN;
    }
    for i in 0..DIGITAL_PROBES {
        let samples = digital_probe(hit, features, i).map_or(0, |p| p.samples.len());
        len += PROBE_HEADER_LEN + samples * DIGITAL_SAMPLE_LEN;
    }
    round_even(len)
}

struct RecordWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> RecordWriter<'a> {
    fn put(&mut self, bytes: &[u8]) {
        let end = self.pos + bytes.len();
        self.buf[self.pos..end].copy_from_slice(bytes);
        self.pos = end;
    }

    fn put_u16(&mut self, v: u16) {
        self.put(&v.to_ne_bytes());
    }

    fn put_u32(&mut self, v: u32) {
        self.put(&v.to_ne_bytes());
    }

    fn put_u64(&mut self, v: u64) {
        self.put(&v.to_ne_bytes());
    }

    fn pad_even(&mut self) {
        if self.pos & 1 == 1 {
            self.put(&[0]);
        }
    }
}

/// Serialize one hit into `dest`, returning the number of bytes written.
///
/// When the record does not fit, `dest` is left untouched and
/// [`ReadoutError::BufferTooSmall`] is returned.
pub fn encode_into(
    name: &str,
    hit: &DecodedHit,
    features: &FeatureEnableSet,
    dest: &mut [u8],
) -> Result<usize> {
    let required = encoded_len(name, hit, features);
    if required > dest.len() {
        return Err(ReadoutError::BufferTooSmall {
            required,
            available: dest.len(),
        });
    }

    let mut w = RecordWriter { buf: dest, pos: 0 };
    w.put(name.as_bytes());
    w.put(&[0]);
    w.pad_even();

    let pick = |enabled: bool, v: u64| if enabled { v } else { 0 };
    w.put_u16(hit.channel as u16);
    w.put_u64(pick(features.timestamp, hit.timestamp_ns));
    w.put_u64(pick(features.raw_timestamp, hit.raw_timestamp));
    w.put_u16(pick(features.fine_timestamp, hit.fine_timestamp as u64) as u16);
    w.put_u16(pick(features.energy, hit.energy as u64) as u16);
    w.put_u16(pick(features.low_priority_flags, hit.low_priority_flags as u64) as u16);
    w.put_u16(pick(features.high_priority_flags, hit.high_priority_flags as u64) as u16);
    w.put_u16(pick(features.downsample, hit.downsample as u64) as u16);

    for i in 0..ANALOG_PROBES {
        match analog_probe(hit, features, i) {
            Some(probe) => {
                w.put_u16(probe.kind);
                w.put_u32(probe.samples.len() as u32);
                for s in &probe.samples {
                    w.put(&s.to_ne_bytes());
                }
            }
            None => {
                w.put_u16(0);
                w.put_u32(0);
            }
        }
    }
    for i in 0..DIGITAL_PROBES {
        match digital_probe(hit, features, i) {
            Some(probe) => {
                w.put_u16(probe.kind);
                w.put_u32(probe.samples.len() as u32);
                w.put(&probe.samples);
            }
            None => {
                w.put_u16(0);
                w.put_u32(0);
            }
        }
    }
    w.pad_even();

    debug_assert_eq!(w.pos, required);
    Ok(w.pos)
}

/// Convenience wrapper that allocates an exactly sized buffer.
pub fn encode(name: &str, hit: &DecodedHit, features: &FeatureEnableSet) -> Vec<u8> {
    let mut buf = vec![0u8; encoded_len(name, hit, features)];
    let written = encode_into(name, hit, features, &mut buf)
        .expect("buffer sized by encoded_len");
    buf.truncate(written);
    buf
}

/// A fragment parsed back from its bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fragment {
    pub name: String,
    pub hit: DecodedHit,
}

struct RecordReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> RecordReader<'a> {
    fn malformed(&self, reason: impl Into<String>) -> ReadoutError {
        ReadoutError::MalformedRecord {
            offset: self.pos,
            reason: reason.into(),
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| {
                self.malformed(format!(
                    "need {} bytes, {} left",
                    n,
                    self.buf.len() - self.pos
                ))
            })?;
        let buf = self.buf;
        let bytes = &buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_ne_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_ne_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_ne_bytes(self.array()?))
    }

    fn name(&mut self) -> Result<String> {
        let buf = self.buf;
        let rest = &buf[self.pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| self.malformed("unterminated name"))?;
        let name = std::str::from_utf8(&rest[..nul])
            .map_err(|e| self.malformed(format!("name is not utf-8: {}", e)))?
            .to_string();
        self.take(name_segment_len(&name))?;
        Ok(name)
    }
}

/// Parse a fragment produced by [`encode_into`].
///
/// Probes recorded with a zero type tag and no samples come back as `None`.
pub fn decode(bytes: &[u8]) -> Result<Fragment> {
    let mut r = RecordReader { buf: bytes, pos: 0 };
    let name = r.name()?;

    let mut hit = DecodedHit::default();
    let channel = r.u16()?;
    hit.channel = u8::try_from(channel)
        .map_err(|_| r.malformed(format!("channel {} out of range", channel)))?;
    hit.timestamp_ns = r.u64()?;
    hit.raw_timestamp = r.u64()?;
    hit.fine_timestamp = r.u16()?;
    hit.energy = r.u16()?;
    hit.low_priority_flags = r.u16()?;
    hit.high_priority_flags = r.u16()?;
    let downsample = r.u16()?;
    hit.downsample = u8::try_from(downsample)
        .map_err(|_| r.malformed(format!("downsample factor {} out of range", downsample)))?;

    for i in 0..ANALOG_PROBES {
        let kind = r.u16()?;
        let len = r.u32()? as usize;
        if kind != 0 || len > 0 {
            let samples = r
                .take(len.saturating_mul(ANALOG_SAMPLE_LEN))?
                .chunks_exact(ANALOG_SAMPLE_LEN)
                .map(|c| i32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            hit.analog_probes[i] = Some(AnalogProbe { kind, samples });
        }
    }
    for i in 0..DIGITAL_PROBES {
        let kind = r.u16()?;
        let len = r.u32()? as usize;
        if kind != 0 || len > 0 {
            let samples = r.take(len)?.to_vec();
            hit.digital_probes[i] = Some(DigitalProbe { kind, samples });
        }
    }

    match bytes.len() - r.pos {
        0 => {}
        1 if r.pos & 1 == 1 => {}
        n => return Err(r.malformed(format!("{} trailing bytes", n))),
    }

    Ok(Fragment { name, hit })
}
