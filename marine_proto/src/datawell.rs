//! Datawell HXV telemetry
//!
//! A receiver sends one text line per buoy transmission:
//!
//! ```text
//! 0618,B34D,8EE9,2DE4,2F4C\r
//! ```
//!
//! The first group is a receiver error count (one hex digit, 0 or 1 means
//! the line passed parity) followed by a 12 bit line counter. The remaining
//! groups are eight data bytes: one 16 bit cyclic data word, then the
//! vertical, north and west displacements (12 bits each, sign and
//! magnitude, centimetres) and the parity bits.
//!
//! Cyclic data words from consecutive good lines form 18 word cycles
//! starting with the sync word `0x7FFF`. Each cycle carries one system word
//! tagged with a 4 bit sequence number and four spectral bins. Sixteen
//! system words in sequence make up one system record.

use crate::error::ProtocolError;

pub const SYNC_WORD: u16 = 0x7FFF;
/// Cyclic words per cycle: sync, system word and four spectral blocks
pub const CYCLE_WORDS: usize = 18;
/// Cycle buffer size in words (40 bytes)
pub const CYCLE_CAPACITY: usize = 20;
pub const SYSTEM_WORDS: usize = 16;
/// Longest line accepted before it is dropped
pub const MAX_LINE_LEN: usize = 64;

const LINE_COUNTER_MASK: u16 = 0x0FFF;

/// Decode two hex characters into one byte
pub fn hexpair_to_u8(pair: &[u8]) -> Result<u8, ProtocolError> {
    fn nibble(c: u8) -> Option<u8> {
        match c {
            b'0'..=b'9' => Some(c - b'0'),
            b'a'..=b'f' => Some(c - b'a' + 10),
            b'A'..=b'F' => Some(c - b'A' + 10),
            _ => None,
        }
    }
    match pair {
        [hi, lo] => match (nibble(*hi), nibble(*lo)) {
            (Some(h), Some(l)) => Ok((h << 4) | l),
            _ => Err(ProtocolError::InvalidHex(String::from_utf8_lossy(pair).into_owned())),
        },
        _ => Err(ProtocolError::InvalidHex(String::from_utf8_lossy(pair).into_owned())),
    }
}

/// Encode one byte as two upper case hex characters
pub fn u8_to_hexpair(value: u8) -> [u8; 2] {
    const DIGITS: &[u8; 16] = b"0123456789ABCDEF";
    [DIGITS[(value >> 4) as usize], DIGITS[(value & 0x0F) as usize]]
}

/// One received HXV line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HxvLine {
    /// Receiver error count, 2 or more means the line failed parity
    pub status: u8,
    /// 12 bit transmission counter
    pub line_number: u16,
    pub data: [u8; 8],
}

impl HxvLine {
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim();
        let groups: Vec<&str> = line.split(',').collect();
        if groups.len() != 5 || groups.iter().any(|g| g.len() != 4) {
            return Err(ProtocolError::Malformed(format!("not an HXV line: {:?}", line)));
        }

        let header = groups[0].as_bytes();
        let status = hexpair_to_u8(&[b'0', header[0]])?;
        let line_number = ((hexpair_to_u8(&[b'0', header[1]])? as u16) << 8)
            | hexpair_to_u8(&header[2..4])? as u16;

        let mut data = [0u8; 8];
        for (i, group) in groups[1..].iter().enumerate() {
            let bytes = group.as_bytes();
            data[2 * i] = hexpair_to_u8(&bytes[0..2])?;
            data[2 * i + 1] = hexpair_to_u8(&bytes[2..4])?;
        }

        Ok(Self {
            status,
            line_number,
            data,
        })
    }

    /// Wire form without the trailing carriage return
    pub fn to_line(&self) -> String {
        let mut out = String::with_capacity(24);
        out.push_str(&format!("{:X}{:03X}", self.status & 0x0F, self.line_number & LINE_COUNTER_MASK));
        for pair in self.data.chunks(2) {
            out.push(',');
            for b in pair {
                let hex = u8_to_hexpair(*b);
                out.push(hex[0] as char);
                out.push(hex[1] as char);
            }
        }
        out
    }

    pub fn is_good(&self) -> bool {
        self.status < 2
    }

    pub fn cyclic_word(&self) -> u16 {
        ((self.data[0] as u16) << 8) | self.data[1] as u16
    }

    pub fn vertical_cm(&self) -> i16 {
        let d = &self.data;
        let v = (((d[2] & 0x7F) as i16) << 4) + ((d[3] & 0xF0) >> 4) as i16;
        if d[2] & 0x80 != 0 { -v } else { v }
    }

    pub fn north_cm(&self) -> i16 {
        let d = &self.data;
        let v = (((d[3] & 0x07) as i16) << 8) + d[4] as i16;
        if d[3] & 0x08 != 0 { -v } else { v }
    }

    pub fn west_cm(&self) -> i16 {
        let d = &self.data;
        let v = (((d[5] & 0x7F) as i16) << 4) + ((d[6] & 0xF0) >> 4) as i16;
        if d[5] & 0x80 != 0 { -v } else { v }
    }

    pub fn parity_word(&self) -> u16 {
        (((self.data[6] & 0x0F) as u16) << 8) | self.data[7] as u16
    }

    pub fn displacement(&self) -> Displacement {
        Displacement {
            north: self.north_cm() as f32 / 100.0,
            west: self.west_cm() as f32 / 100.0,
            vertical: self.vertical_cm() as f32 / 100.0,
        }
    }
}

/// Buoy displacement in metres
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Displacement {
    pub north: f32,
    pub west: f32,
    pub vertical: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SpectralBin {
    pub bin: u8,
    /// Hz
    pub frequency: f32,
    /// Degrees
    pub direction: f32,
    /// Degrees
    pub spread: f32,
    /// Relative power spectral density
    pub rpsd: f32,
    pub m2: f32,
    pub n2: f32,
    pub k: f32,
}

impl SpectralBin {
    /// Decode block `ix` (0..4) of a complete cycle
    fn from_cycle(cycle: &[u16], ix: usize) -> Self {
        let w0 = cycle[2 + 4 * ix];
        let w1 = cycle[3 + 4 * ix];
        let w2 = cycle[4 + 4 * ix];
        let w3 = cycle[5 + 4 * ix];

        let bin = ((w0 & 0x3F00) >> 8) as u8;
        let frequency = if bin < 16 {
            0.025 + bin as f32 * 0.005
        } else {
            0.11 + bin as f32 * 0.01
        };
        Self {
            bin,
            frequency,
            direction: (w0 & 0x00FF) as f32 * 360.0 / 256.0,
            spread: 0.4476 * (((w2 & 0xFF00) >> 8) as f32 + ((w0 & 0xC000) >> 14) as f32 / 4.0),
            rpsd: (-((w1 & 0x00FF) as f32) / 200.0).exp(),
            m2: ((w2 & 0x00FF) as f32 + ((w1 & 0xC000) >> 14) as f32 / 4.0 - 128.0) / 128.0,
            n2: (((w3 & 0xFF00) >> 8) as f32 + ((w1 & 0x3000) >> 12) as f32 / 4.0 - 128.0) / 128.0,
            k: (w3 & 0x00FF) as f32 / 100.0,
        }
    }
}

/// Decoded cycle
#[derive(Debug, Clone, PartialEq)]
pub struct Spectrum {
    pub system_sequence: u8,
    pub system_word: u16,
    pub bins: [SpectralBin; 4],
}

impl Spectrum {
    /// Decode an 18 word cycle starting with the sync word
    pub fn from_cycle(cycle: &[u16]) -> Result<Self, ProtocolError> {
        if cycle.len() < CYCLE_WORDS || cycle[0] != SYNC_WORD {
            return Err(ProtocolError::CycleIncomplete(format!(
                "{} words without leading sync",
                cycle.len()
            )));
        }
        Ok(Self {
            system_sequence: ((cycle[1] & 0xF000) >> 12) as u8,
            system_word: cycle[1] & 0x0FFF,
            bins: [
                SpectralBin::from_cycle(cycle, 0),
                SpectralBin::from_cycle(cycle, 1),
                SpectralBin::from_cycle(cycle, 2),
                SpectralBin::from_cycle(cycle, 3),
            ],
        })
    }
}

/// Buoy status assembled from sixteen system words
#[derive(Debug, Clone, PartialEq)]
pub struct SystemData {
    /// Transmission number, 1 to 8
    pub number: u8,
    pub gps_fix: bool,
    /// Significant wave height estimate, metres
    pub hrms: f32,
    /// Zero crossing frequency, Hz
    pub fzero: f32,
    pub psd: f32,
    /// Degrees Celsius
    pub reference_temperature: f32,
    /// Degrees Celsius
    pub water_temperature: f32,
    /// Remaining operational time, weeks
    pub operational_weeks: u8,
    pub battery_status: u8,
    pub accel_z_offset: f32,
    pub accel_x_offset: f32,
    pub accel_y_offset: f32,
    pub latitude: f64,
    pub longitude: f64,
    /// Degrees
    pub orientation: f32,
    /// Degrees
    pub inclination: f32,
}

impl SystemData {
    pub fn from_words(w: &[u16; SYSTEM_WORDS]) -> Self {
        fn signed_offset(word: u16) -> f32 {
            let magnitude = (word & 0x07FF) as f32 / 800.0;
            if word & 0x0800 != 0 { -magnitude } else { magnitude }
        }
        fn coordinate(hi: u16, lo: u16, range: f64) -> f64 {
            let sign = if hi & 0x0800 != 0 { -1.0 } else { 1.0 };
            let raw = ((lo & 0x0FFF) as u32 + (((hi & 0x07FF) as u32) << 12)) as f64;
            sign * range * raw / (1u32 << 23) as f64
        }

        Self {
            number: (w[0] & 0x0007) as u8 + 1,
            gps_fix: w[0] & 0x0010 != 0,
            hrms: (w[1] & 0x0FFF) as f32 / 400.0,
            fzero: (w[2] & 0x0FFF) as f32 / 400.0,
            psd: 5000.0 * (-((w[3] & 0x0FFF) as f32) / 200.0).exp(),
            reference_temperature: (w[4] & 0x01FF) as f32 / 20.0 - 5.0,
            water_temperature: (w[5] & 0x01FF) as f32 / 20.0 - 5.0,
            operational_weeks: ((w[6] & 0x0FF0) >> 4) as u8,
            battery_status: (w[6] & 0x0007) as u8,
            accel_z_offset: signed_offset(w[7]),
            accel_x_offset: signed_offset(w[8]),
            accel_y_offset: signed_offset(w[9]),
            latitude: coordinate(w[10], w[11], 90.0),
            longitude: coordinate(w[12], w[13], 180.0),
            orientation: (w[14] & 0x00FF) as f32 * 360.0 / 256.0,
            inclination: (90.0 / 128.0)
                * ((w[15] & 0x00FF) as f32 - 128.0 + ((w[15] & 0x0F00) >> 8) as f32 / 16.0),
        }
    }
}

/// Output of the HXV decoder
#[derive(Debug, Clone, PartialEq)]
pub enum HxvRecord {
    /// Receiver status for every parsed line, good or not
    Signal { status: u8, line_number: u16 },
    Displacement(Displacement),
    Spectrum(Spectrum),
    System(SystemData),
}

/// Stream decoder for HXV lines
pub struct HxvDecoder {
    line: Vec<u8>,
    /// Dropping the rest of an overlong line
    skipping: bool,
    last_line_number: Option<u16>,
    cycle: Vec<u16>,
    system_words: [u16; SYSTEM_WORDS],
    /// Number of system words collected in sequence so far
    system_count: usize,
}

impl HxvDecoder {
    pub fn new() -> Self {
        Self {
            line: Vec::with_capacity(MAX_LINE_LEN),
            skipping: false,
            last_line_number: None,
            cycle: Vec::with_capacity(CYCLE_CAPACITY),
            system_words: [0; SYSTEM_WORDS],
            system_count: 0,
        }
    }

    /// Push received bytes. Lines end with CR or LF.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Result<HxvRecord, ProtocolError>> {
        let mut out = Vec::new();
        for &b in data {
            if b == b'\r' || b == b'\n' {
                let line = std::mem::take(&mut self.line);
                if !self.skipping && !line.is_empty() {
                    match std::str::from_utf8(&line) {
                        Ok(text) => out.extend(self.push_line(text)),
                        Err(_) => out.push(Err(ProtocolError::Malformed(
                            "line is not ASCII".to_string(),
                        ))),
                    }
                }
                self.skipping = false;
                continue;
            }
            if self.skipping {
                continue;
            }
            self.line.push(b);
            if self.line.len() > MAX_LINE_LEN {
                self.line.clear();
                self.skipping = true;
                out.push(Err(ProtocolError::FrameTooLong {
                    limit: MAX_LINE_LEN,
                }));
            }
        }
        out
    }

    /// Decode one complete line
    pub fn push_line(&mut self, text: &str) -> Vec<Result<HxvRecord, ProtocolError>> {
        let mut out = Vec::new();
        let line = match HxvLine::parse(text) {
            Ok(line) => line,
            Err(e) => {
                out.push(Err(e));
                return out;
            }
        };

        out.push(Ok(HxvRecord::Signal {
            status: line.status,
            line_number: line.line_number,
        }));

        // Any line missing from the counter sequence breaks the cycle
        if let Some(prev) = self.last_line_number {
            let expected = (prev + 1) & LINE_COUNTER_MASK;
            if line.line_number != expected && !self.cycle.is_empty() {
                out.push(Err(ProtocolError::CycleIncomplete(format!(
                    "line counter jumped from {:#05x} to {:#05x}",
                    prev, line.line_number
                ))));
                self.cycle.clear();
            }
        }
        self.last_line_number = Some(line.line_number);

        if !line.is_good() {
            out.push(Err(ProtocolError::ParityError {
                status: line.status,
            }));
            if !self.cycle.is_empty() {
                out.push(Err(ProtocolError::CycleIncomplete(format!(
                    "line {:#05x} failed parity",
                    line.line_number
                ))));
                self.cycle.clear();
            }
            return out;
        }

        out.push(Ok(HxvRecord::Displacement(line.displacement())));
        out.extend(self.push_cyclic_word(line.cyclic_word()));
        out
    }

    fn push_cyclic_word(&mut self, word: u16) -> Vec<Result<HxvRecord, ProtocolError>> {
        let mut out = Vec::new();
        if word == SYNC_WORD {
            if !self.cycle.is_empty() {
                out.push(Err(ProtocolError::CycleIncomplete(format!(
                    "sync word after {} of {} words",
                    self.cycle.len(),
                    CYCLE_WORDS
                ))));
                self.cycle.clear();
            }
            self.cycle.push(word);
            return out;
        }
        if self.cycle.is_empty() {
            // Waiting for sync
            return out;
        }

        self.cycle.push(word);
        if self.cycle.len() < CYCLE_WORDS {
            return out;
        }

        let cycle = std::mem::take(&mut self.cycle);
        match Spectrum::from_cycle(&cycle) {
            Ok(spectrum) => {
                out.extend(self.push_system_word(spectrum.system_sequence, spectrum.system_word));
                out.insert(0, Ok(HxvRecord::Spectrum(spectrum)));
            }
            Err(e) => out.push(Err(e)),
        }
        out
    }

    fn push_system_word(&mut self, sequence: u8, word: u16) -> Vec<Result<HxvRecord, ProtocolError>> {
        let mut out = Vec::new();
        let sequence = sequence as usize;
        if sequence == 0 {
            if self.system_count > 0 {
                out.push(Err(ProtocolError::CycleIncomplete(format!(
                    "system data restarted after {} of {} words",
                    self.system_count, SYSTEM_WORDS
                ))));
            }
            self.system_count = 0;
        } else if sequence != self.system_count {
            if self.system_count > 0 {
                out.push(Err(ProtocolError::CycleIncomplete(format!(
                    "system sequence jumped from {} to {}",
                    self.system_count - 1,
                    sequence
                ))));
            }
            // Wait for the next sequence 0
            self.system_count = 0;
            return out;
        }

        self.system_words[sequence] = word;
        self.system_count = sequence + 1;
        if self.system_count == SYSTEM_WORDS {
            out.push(Ok(HxvRecord::System(SystemData::from_words(&self.system_words))));
            self.system_count = 0;
            self.system_words = [0; SYSTEM_WORDS];
        }
        out
    }
}

impl Default for HxvDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn line(counter: u16, word: u16) -> String {
        HxvLine {
            status: 0,
            line_number: counter,
            data: [(word >> 8) as u8, word as u8, 0x00, 0x10, 0x20, 0x00, 0x00, 0x00],
        }
        .to_line()
    }

    /// Cycle with a known system word and four identical spectral blocks
    fn cycle_words(sequence: u8, system_word: u16) -> Vec<u16> {
        let mut words = vec![SYNC_WORD, ((sequence as u16) << 12) | (system_word & 0x0FFF)];
        for _ in 0..4 {
            words.push((10 << 8) | 64);
            words.push(0);
            words.push((10 << 8) | 128);
            words.push((128 << 8) | 100);
        }
        words
    }

    fn feed_words(decoder: &mut HxvDecoder, start: u16, words: &[u16]) -> Vec<Result<HxvRecord, ProtocolError>> {
        let mut out = Vec::new();
        for (i, w) in words.iter().enumerate() {
            let text = format!("{}\r", line(start + i as u16, *w));
            out.extend(decoder.feed(text.as_bytes()));
        }
        out
    }

    #[test]
    fn test_hexpair_round_trip() {
        for b in 0..=255u8 {
            assert_eq!(hexpair_to_u8(&u8_to_hexpair(b)).unwrap(), b);
        }
        assert_eq!(hexpair_to_u8(b"ff").unwrap(), 0xFF);
        assert!(hexpair_to_u8(b"G0").is_err());
        assert!(hexpair_to_u8(b"0").is_err());
    }

    #[test]
    fn test_parse_sample_line() {
        let line = HxvLine::parse("0618,B34D,8EE9,2DE4,2F4C\r").unwrap();
        assert_eq!(line.status, 0);
        assert_eq!(line.line_number, 0x618);
        assert_eq!(line.cyclic_word(), 0xB34D);
        assert_eq!(line.vertical_cm(), -238);
        assert_eq!(line.north_cm(), -301);
        assert_eq!(line.west_cm(), -1602);
        assert_eq!(line.parity_word(), 0xF4C);
        let d = line.displacement();
        assert_relative_eq!(d.vertical, -2.38);
        assert_relative_eq!(d.north, -3.01);
        assert_relative_eq!(d.west, -16.02);
        assert_eq!(line.to_line(), "0618,B34D,8EE9,2DE4,2F4C");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(HxvLine::parse("0618,B34D,8EE9,2DE4").is_err());
        assert!(HxvLine::parse("0618,B34D,8EZ9,2DE4,2F4C").is_err());
        assert!(HxvLine::parse("").is_err());
    }

    #[test]
    fn test_sync_line_is_cycle_start() {
        let line = HxvLine::parse("001E,7FFF,80E0,0300,1689").unwrap();
        assert_eq!(line.cyclic_word(), SYNC_WORD);
        assert!(line.is_good());
    }

    #[test]
    fn test_spectral_block_scaling() {
        let spectrum = Spectrum::from_cycle(&cycle_words(3, 0x0ABC)).unwrap();
        assert_eq!(spectrum.system_sequence, 3);
        assert_eq!(spectrum.system_word, 0x0ABC);
        let bin = spectrum.bins[2];
        assert_eq!(bin.bin, 10);
        assert_relative_eq!(bin.frequency, 0.075, epsilon = 1e-6);
        assert_relative_eq!(bin.direction, 90.0);
        assert_relative_eq!(bin.spread, 4.476, epsilon = 1e-5);
        assert_relative_eq!(bin.rpsd, 1.0);
        assert_relative_eq!(bin.m2, 0.0);
        assert_relative_eq!(bin.n2, 0.0);
        assert_relative_eq!(bin.k, 1.0);
    }

    #[test]
    fn test_high_frequency_bins() {
        let mut words = cycle_words(0, 0);
        words[2] = 20 << 8;
        let spectrum = Spectrum::from_cycle(&words).unwrap();
        assert_relative_eq!(spectrum.bins[0].frequency, 0.31, epsilon = 1e-6);
    }

    #[test]
    fn test_system_scaling() {
        let mut w = [0u16; SYSTEM_WORDS];
        w[0] = 0x0012;
        w[1] = 400;
        w[2] = 200;
        w[4] = 300;
        w[5] = 400;
        w[6] = (52 << 4) | 5;
        w[7] = 0x0800 | 800;
        w[8] = 400;
        w[10] = 0x0400;
        w[12] = 0x0800 | 0x0400;
        w[14] = 64;
        w[15] = (8 << 8) | 128;
        let s = SystemData::from_words(&w);
        assert_eq!(s.number, 3);
        assert!(s.gps_fix);
        assert_relative_eq!(s.hrms, 1.0);
        assert_relative_eq!(s.fzero, 0.5);
        assert_relative_eq!(s.psd, 5000.0);
        assert_relative_eq!(s.reference_temperature, 10.0);
        assert_relative_eq!(s.water_temperature, 15.0);
        assert_eq!(s.operational_weeks, 52);
        assert_eq!(s.battery_status, 5);
        assert_relative_eq!(s.accel_z_offset, -1.0);
        assert_relative_eq!(s.accel_x_offset, 0.5);
        assert_relative_eq!(s.latitude, 45.0);
        assert_relative_eq!(s.longitude, -90.0);
        assert_relative_eq!(s.orientation, 90.0);
        assert_relative_eq!(s.inclination, 0.3515625);
    }

    #[test]
    fn test_complete_cycle() {
        let mut decoder = HxvDecoder::new();
        let results = feed_words(&mut decoder, 0x100, &cycle_words(0, 0x123));
        assert!(results.iter().all(|r| r.is_ok()));
        let spectra: Vec<_> = results
            .iter()
            .filter_map(|r| match r {
                Ok(HxvRecord::Spectrum(s)) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(spectra.len(), 1);
        assert_eq!(spectra[0].system_word, 0x123);
        let displacements = results
            .iter()
            .filter(|r| matches!(r, Ok(HxvRecord::Displacement(_))))
            .count();
        assert_eq!(displacements, CYCLE_WORDS);
    }

    #[test]
    fn test_words_before_sync_are_ignored() {
        let mut decoder = HxvDecoder::new();
        let mut words = vec![0x1234, 0x5678];
        words.extend(cycle_words(0, 0));
        let results = feed_words(&mut decoder, 0, &words);
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(
            results.iter().filter(|r| matches!(r, Ok(HxvRecord::Spectrum(_)))).count(),
            1
        );
    }

    #[test]
    fn test_line_counter_gap_discards_cycle() {
        let mut decoder = HxvDecoder::new();
        let words = cycle_words(0, 0);
        let mut results = feed_words(&mut decoder, 0x010, &words[..5]);
        // Line 0x015 lost in transit
        results.extend(feed_words(&mut decoder, 0x016, &words[5..]));
        assert!(results.iter().any(|r| matches!(r, Err(ProtocolError::CycleIncomplete(_)))));
        assert!(!results.iter().any(|r| matches!(r, Ok(HxvRecord::Spectrum(_)))));

        // Next full cycle decodes normally
        let results = feed_words(&mut decoder, 0x030, &words);
        assert!(results.iter().any(|r| matches!(r, Ok(HxvRecord::Spectrum(_)))));
    }

    #[test]
    fn test_line_counter_wraps() {
        let mut decoder = HxvDecoder::new();
        let words = cycle_words(0, 0);
        let mut results = feed_words(&mut decoder, 0xFFA, &words[..6]);
        results.extend(feed_words(&mut decoder, 0x000, &words[6..]));
        assert!(results.iter().all(|r| r.is_ok()));
        assert!(results.iter().any(|r| matches!(r, Ok(HxvRecord::Spectrum(_)))));
    }

    #[test]
    fn test_parity_failure_drops_line_only() {
        let mut decoder = HxvDecoder::new();
        let results = decoder.feed(b"2618,B34D,8EE9,2DE4,2F4C\r0619,B34D,8EE9,2DE4,2F4C\r");
        assert_eq!(
            results[0],
            Ok(HxvRecord::Signal {
                status: 2,
                line_number: 0x618
            })
        );
        assert_eq!(results[1], Err(ProtocolError::ParityError { status: 2 }));
        assert!(matches!(results[2], Ok(HxvRecord::Signal { status: 0, .. })));
        assert!(matches!(results[3], Ok(HxvRecord::Displacement(_))));
        assert_eq!(results.len(), 4);
    }

    #[test]
    fn test_early_sync_marks_cycle_incomplete() {
        let mut decoder = HxvDecoder::new();
        let words = cycle_words(0, 0);
        let mut stream = words[..7].to_vec();
        stream.extend(&words);
        let results = feed_words(&mut decoder, 0, &stream);
        assert_eq!(
            results.iter().filter(|r| matches!(r, Err(ProtocolError::CycleIncomplete(_)))).count(),
            1
        );
        assert_eq!(
            results.iter().filter(|r| matches!(r, Ok(HxvRecord::Spectrum(_)))).count(),
            1
        );
    }

    #[test]
    fn test_system_record_after_sixteen_cycles() {
        let mut decoder = HxvDecoder::new();
        let mut counter = 0u16;
        let mut results = Vec::new();
        for seq in 0..SYSTEM_WORDS as u8 {
            let words = cycle_words(seq, if seq == 1 { 400 } else { 0 });
            results.extend(feed_words(&mut decoder, counter, &words));
            counter += CYCLE_WORDS as u16;
        }
        let systems: Vec<_> = results
            .iter()
            .filter_map(|r| match r {
                Ok(HxvRecord::System(s)) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(systems.len(), 1);
        assert_relative_eq!(systems[0].hrms, 1.0);
    }

    #[test]
    fn test_system_sequence_gap() {
        let mut decoder = HxvDecoder::new();
        let mut counter = 0u16;
        let mut results = Vec::new();
        for seq in [0u8, 1, 3] {
            results.extend(feed_words(&mut decoder, counter, &cycle_words(seq, 0)));
            counter += CYCLE_WORDS as u16;
        }
        assert_eq!(
            results.iter().filter(|r| matches!(r, Err(ProtocolError::CycleIncomplete(_)))).count(),
            1
        );
    }

    #[test]
    fn test_overlong_line() {
        let mut decoder = HxvDecoder::new();
        let mut data = vec![b'0'; MAX_LINE_LEN + 10];
        data.push(b'\r');
        data.extend_from_slice(b"0618,B34D,8EE9,2DE4,2F4C\r");
        let results = decoder.feed(&data);
        assert_eq!(
            results[0],
            Err(ProtocolError::FrameTooLong {
                limit: MAX_LINE_LEN
            })
        );
        assert!(matches!(results[1], Ok(HxvRecord::Signal { .. })));
    }
}
