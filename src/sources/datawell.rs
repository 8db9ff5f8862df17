use std::time::{Duration, Instant};

use marine_proto::datawell::{HxvDecoder, HxvRecord, SpectralBin, Spectrum, SystemData};
use marine_proto::ids::channels;
use marine_proto::{ChannelId, Message, SourceId};
use tracing::{info, warn};

use crate::channel_map::ChannelInfo;
use crate::driver::standard_channels;
use crate::error::QueueError;
use crate::queue::QueueProducer;
use crate::sources::StreamHandler;

pub const CHANNEL_SIGNAL: ChannelId = 4;
pub const CHANNEL_NORTH: ChannelId = 5;
pub const CHANNEL_WEST: ChannelId = 6;
pub const CHANNEL_VERTICAL: ChannelId = 7;
pub const CHANNEL_LATITUDE: ChannelId = 8;
pub const CHANNEL_LONGITUDE: ChannelId = 9;
pub const CHANNEL_ORIENTATION: ChannelId = 10;
pub const CHANNEL_INCLINATION: ChannelId = 11;
pub const CHANNEL_GPS_FIX: ChannelId = 12;
pub const CHANNEL_HRMS: ChannelId = 13;
pub const CHANNEL_REF_TEMP: ChannelId = 14;
pub const CHANNEL_WATER_TEMP: ChannelId = 15;
pub const CHANNEL_WEEKS: ChannelId = 16;
pub const CHANNEL_SPEC_BIN: ChannelId = 17;
pub const CHANNEL_SPEC_DIRECTION: ChannelId = 18;
pub const CHANNEL_SPEC_SPREAD: ChannelId = 19;
pub const CHANNEL_SPEC_M2: ChannelId = 20;
pub const CHANNEL_SPEC_N2: ChannelId = 21;
pub const CHANNEL_SPEC_RPSD: ChannelId = 22;
pub const CHANNEL_SPEC_K: ChannelId = 23;
pub const CHANNEL_SPEC_FREQUENCY: ChannelId = 24;
pub const CHANNEL_BATTERY: ChannelId = 25;
pub const CHANNEL_ACCEL_Z: ChannelId = 26;
pub const CHANNEL_ACCEL_X: ChannelId = 27;
pub const CHANNEL_ACCEL_Y: ChannelId = 28;

/// Time without a good line before the buoy is reported silent
const SIGNAL_WARNING_AFTER: Duration = Duration::from_secs(300);

/// Turns Datawell HXV receiver output into messages
pub struct DatawellHandler {
    source: SourceId,
    tag: String,
    raw: bool,
    spectrum: bool,
    decoder: HxvDecoder,
    last_good: Instant,
    signal_warning_sent: bool,
    signal_warning_after: Duration,
    dropped: u64,
}

impl DatawellHandler {
    pub fn new(source: SourceId, tag: &str, raw: bool, spectrum: bool) -> Self {
        Self {
            source,
            tag: tag.to_string(),
            raw,
            spectrum,
            decoder: HxvDecoder::new(),
            last_good: Instant::now(),
            signal_warning_sent: false,
            signal_warning_after: SIGNAL_WARNING_AFTER,
            dropped: 0,
        }
    }

    #[cfg(test)]
    fn with_signal_warning_after(mut self, after: Duration) -> Self {
        self.signal_warning_after = after;
        self
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn float(&self, channel: ChannelId, value: f32) -> Message {
        Message::float(self.source, channel, value)
    }

    fn push_record(&mut self, record: HxvRecord, out: &QueueProducer) -> Result<(), QueueError> {
        match record {
            HxvRecord::Signal { status, .. } => {
                if status < 2 {
                    self.last_good = Instant::now();
                    if self.signal_warning_sent {
                        info!("[{}] Buoy signal recovered", self.tag);
                        self.signal_warning_sent = false;
                    }
                }
                out.push(self.float(CHANNEL_SIGNAL, status as f32))
            }
            HxvRecord::Displacement(d) => out.push_all([
                self.float(CHANNEL_NORTH, d.north),
                self.float(CHANNEL_WEST, d.west),
                self.float(CHANNEL_VERTICAL, d.vertical),
            ]),
            HxvRecord::Spectrum(spectrum) => {
                if self.spectrum {
                    out.push_all(self.spectrum_messages(&spectrum))?;
                }
                Ok(())
            }
            HxvRecord::System(system) => out.push_all(self.system_messages(&system)),
        }
    }

    fn spectrum_messages(&self, spectrum: &Spectrum) -> Vec<Message> {
        let column = |f: fn(&SpectralBin) -> f32| -> Vec<f32> {
            spectrum.bins.iter().map(f).collect()
        };
        vec![
            Message::float_array(self.source, CHANNEL_SPEC_BIN, column(|b| b.bin as f32)),
            Message::float_array(self.source, CHANNEL_SPEC_DIRECTION, column(|b| b.direction)),
            Message::float_array(self.source, CHANNEL_SPEC_SPREAD, column(|b| b.spread)),
            Message::float_array(self.source, CHANNEL_SPEC_M2, column(|b| b.m2)),
            Message::float_array(self.source, CHANNEL_SPEC_N2, column(|b| b.n2)),
            Message::float_array(self.source, CHANNEL_SPEC_RPSD, column(|b| b.rpsd)),
            Message::float_array(self.source, CHANNEL_SPEC_K, column(|b| b.k)),
            Message::float_array(self.source, CHANNEL_SPEC_FREQUENCY, column(|b| b.frequency)),
        ]
    }

    fn system_messages(&self, s: &SystemData) -> Vec<Message> {
        vec![
            self.float(CHANNEL_LATITUDE, s.latitude as f32),
            self.float(CHANNEL_LONGITUDE, s.longitude as f32),
            self.float(CHANNEL_ORIENTATION, s.orientation),
            self.float(CHANNEL_INCLINATION, s.inclination),
            self.float(CHANNEL_GPS_FIX, if s.gps_fix { 1.0 } else { 0.0 }),
            self.float(CHANNEL_HRMS, s.hrms),
            self.float(CHANNEL_REF_TEMP, s.reference_temperature),
            self.float(CHANNEL_WATER_TEMP, s.water_temperature),
            self.float(CHANNEL_WEEKS, s.operational_weeks as f32),
            self.float(CHANNEL_BATTERY, s.battery_status as f32),
            self.float(CHANNEL_ACCEL_Z, s.accel_z_offset),
            self.float(CHANNEL_ACCEL_X, s.accel_x_offset),
            self.float(CHANNEL_ACCEL_Y, s.accel_y_offset),
        ]
    }

    fn check_signal(&mut self, out: &QueueProducer) -> Result<(), QueueError> {
        if !self.signal_warning_sent && self.last_good.elapsed() >= self.signal_warning_after {
            self.signal_warning_sent = true;
            warn!("[{}] No valid data received from buoy", self.tag);
            out.push(Message::string(
                self.source,
                channels::WARNING,
                "No valid data received from buoy",
            ))?;
        }
        Ok(())
    }
}

impl StreamHandler for DatawellHandler {
    fn channels(&self) -> Vec<(ChannelId, ChannelInfo)> {
        let mut list = standard_channels(self.raw);
        list.extend([
            (CHANNEL_SIGNAL, ChannelInfo::new("Signal").with_description("Receiver error count")),
            (CHANNEL_NORTH, ChannelInfo::new("Displacement North").with_unit("m")),
            (CHANNEL_WEST, ChannelInfo::new("Displacement West").with_unit("m")),
            (CHANNEL_VERTICAL, ChannelInfo::new("Displacement Vertical").with_unit("m")),
            (CHANNEL_LATITUDE, ChannelInfo::new("Latitude").with_unit("deg")),
            (CHANNEL_LONGITUDE, ChannelInfo::new("Longitude").with_unit("deg")),
            (CHANNEL_ORIENTATION, ChannelInfo::new("Orientation").with_unit("deg")),
            (CHANNEL_INCLINATION, ChannelInfo::new("Inclination").with_unit("deg")),
            (CHANNEL_GPS_FIX, ChannelInfo::new("GPS Fix")),
            (CHANNEL_HRMS, ChannelInfo::new("Hrms").with_unit("m")),
            (CHANNEL_REF_TEMP, ChannelInfo::new("Reference Temperature").with_unit("degC")),
            (CHANNEL_WATER_TEMP, ChannelInfo::new("Water Temperature").with_unit("degC")),
            (CHANNEL_WEEKS, ChannelInfo::new("Weeks Remaining")),
        ]);
        if self.spectrum {
            list.extend([
                (CHANNEL_SPEC_BIN, ChannelInfo::new("Spectrum Bin")),
                (CHANNEL_SPEC_DIRECTION, ChannelInfo::new("Spectrum Direction").with_unit("deg")),
                (CHANNEL_SPEC_SPREAD, ChannelInfo::new("Spectrum Spread").with_unit("deg")),
                (CHANNEL_SPEC_M2, ChannelInfo::new("Spectrum M2")),
                (CHANNEL_SPEC_N2, ChannelInfo::new("Spectrum N2")),
                (CHANNEL_SPEC_RPSD, ChannelInfo::new("Spectrum RPSD")),
                (CHANNEL_SPEC_K, ChannelInfo::new("Spectrum K")),
                (CHANNEL_SPEC_FREQUENCY, ChannelInfo::new("Spectrum Frequency").with_unit("Hz")),
            ]);
        }
        list.extend([
            (CHANNEL_BATTERY, ChannelInfo::new("Battery Status")),
            (CHANNEL_ACCEL_Z, ChannelInfo::new("Accelerometer Offset Z").with_unit("m/s2")),
            (CHANNEL_ACCEL_X, ChannelInfo::new("Accelerometer Offset X").with_unit("m/s2")),
            (CHANNEL_ACCEL_Y, ChannelInfo::new("Accelerometer Offset Y").with_unit("m/s2")),
        ]);
        list
    }

    fn handle(&mut self, data: &[u8], out: &QueueProducer) -> Result<(), QueueError> {
        if self.raw {
            out.push(Message::bytes(self.source, channels::RAW, data.to_vec()))?;
        }
        for result in self.decoder.feed(data) {
            match result {
                Ok(record) => self.push_record(record, out)?,
                Err(e) => {
                    self.dropped += 1;
                    warn!("[{}] Dropped data: {}", self.tag, e);
                }
            }
        }
        self.check_signal(out)
    }

    fn reset(&mut self) {
        self.decoder = HxvDecoder::new();
    }

    fn idle(&mut self, out: &QueueProducer) -> Result<(), QueueError> {
        self.check_signal(out)
    }
}
