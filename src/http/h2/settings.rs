//! SETTINGS parameters (RFC 7540 Section 6.5)
//!
//! `Settings` keeps every field optional so the same type describes both a
//! SETTINGS frame, which only carries the parameters that change, and the
//! effective values of one side, which fall back to the protocol defaults.

use super::error::{Error, Result};
use super::{DEFAULT_HEADER_TABLE_SIZE, DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_FRAME_SIZE};
use bytes::{Buf, BufMut, BytesMut};

const HEADER_TABLE_SIZE: u16 = 0x1;
const ENABLE_PUSH: u16 = 0x2;
const MAX_CONCURRENT_STREAMS: u16 = 0x3;
const INITIAL_WINDOW_SIZE: u16 = 0x4;
const MAX_FRAME_SIZE: u16 = 0x5;
const MAX_HEADER_LIST_SIZE: u16 = 0x6;

const MAX_WINDOW: u32 = 0x7FFF_FFFF;
const FRAME_SIZE_RANGE: std::ops::RangeInclusive<u32> = 16_384..=16_777_215;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    pub header_table_size: Option<u32>,
    pub enable_push: Option<bool>,
    /// Absent means no limit
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: Option<u32>,
    pub max_frame_size: Option<u32>,
    /// Absent means no limit
    pub max_header_list_size: Option<u32>,
}

impl Settings {
    pub fn new() -> Self {
        Settings::default()
    }

    pub fn get_header_table_size(&self) -> u32 {
        self.header_table_size.unwrap_or(DEFAULT_HEADER_TABLE_SIZE)
    }

    pub fn get_enable_push(&self) -> bool {
        self.enable_push.unwrap_or(true)
    }

    pub fn get_max_concurrent_streams(&self) -> Option<u32> {
        self.max_concurrent_streams
    }

    pub fn get_initial_window_size(&self) -> u32 {
        self.initial_window_size.unwrap_or(DEFAULT_INITIAL_WINDOW_SIZE)
    }

    pub fn get_max_frame_size(&self) -> u32 {
        self.max_frame_size.unwrap_or(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn get_max_header_list_size(&self) -> Option<u32> {
        self.max_header_list_size
    }

    /// Store one parameter, rejecting values out of range with the error
    /// type RFC 7540 names for them. Unknown identifiers are ignored.
    fn apply(&mut self, id: u16, value: u32) -> Result<()> {
        match id {
            HEADER_TABLE_SIZE => self.header_table_size = Some(value),
            ENABLE_PUSH => {
                if value > 1 {
                    return Err(Error::Protocol(format!("ENABLE_PUSH value {}", value)));
                }
                self.enable_push = Some(value == 1);
            }
            MAX_CONCURRENT_STREAMS => self.max_concurrent_streams = Some(value),
            INITIAL_WINDOW_SIZE => {
                if value > MAX_WINDOW {
                    return Err(Error::FlowControl(format!("INITIAL_WINDOW_SIZE value {}", value)));
                }
                self.initial_window_size = Some(value);
            }
            MAX_FRAME_SIZE => {
                if !FRAME_SIZE_RANGE.contains(&value) {
                    return Err(Error::Protocol(format!("MAX_FRAME_SIZE value {}", value)));
                }
                self.max_frame_size = Some(value);
            }
            MAX_HEADER_LIST_SIZE => self.max_header_list_size = Some(value),
            _ => {}
        }
        Ok(())
    }

    /// Parameters that are set, in identifier order
    fn params(&self) -> impl Iterator<Item = (u16, u32)> {
        [
            (HEADER_TABLE_SIZE, self.header_table_size),
            (ENABLE_PUSH, self.enable_push.map(u32::from)),
            (MAX_CONCURRENT_STREAMS, self.max_concurrent_streams),
            (INITIAL_WINDOW_SIZE, self.initial_window_size),
            (MAX_FRAME_SIZE, self.max_frame_size),
            (MAX_HEADER_LIST_SIZE, self.max_header_list_size),
        ]
        .into_iter()
        .filter_map(|(id, value)| value.map(|v| (id, v)))
    }

    /// Check locally configured values before they are advertised
    pub fn validate(&self) -> Result<()> {
        let mut scratch = Settings::new();
        for (id, value) in self.params() {
            scratch
                .apply(id, value)
                .map_err(|e| Error::InvalidSettings(e.to_string()))?;
        }
        Ok(())
    }

    /// Decode a SETTINGS payload received from the peer
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut settings = Settings::new();
        let mut buf = payload;
        while buf.remaining() >= 6 {
            let id = buf.get_u16();
            settings.apply(id, buf.get_u32())?;
        }
        Ok(settings)
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        for (id, value) in self.params() {
            buf.put_u16(id);
            buf.put_u32(value);
        }
    }

    /// Overlay the parameters present in `update`
    pub fn merge(&mut self, update: &Settings) {
        self.header_table_size = update.header_table_size.or(self.header_table_size);
        self.enable_push = update.enable_push.or(self.enable_push);
        self.max_concurrent_streams = update.max_concurrent_streams.or(self.max_concurrent_streams);
        self.initial_window_size = update.initial_window_size.or(self.initial_window_size);
        self.max_frame_size = update.max_frame_size.or(self.max_frame_size);
        self.max_header_list_size = update.max_header_list_size.or(self.max_header_list_size);
    }
}

/// Validated construction of local settings
#[derive(Debug, Clone, Default)]
pub struct SettingsBuilder {
    settings: Settings,
}

impl SettingsBuilder {
    pub fn new() -> Self {
        SettingsBuilder::default()
    }

    pub fn header_table_size(mut self, size: u32) -> Self {
        self.settings.header_table_size = Some(size);
        self
    }

    pub fn enable_push(mut self, enable: bool) -> Self {
        self.settings.enable_push = Some(enable);
        self
    }

    pub fn max_concurrent_streams(mut self, max: u32) -> Self {
        self.settings.max_concurrent_streams = Some(max);
        self
    }

    pub fn initial_window_size(mut self, size: u32) -> Self {
        self.settings.initial_window_size = Some(size);
        self
    }

    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.settings.max_frame_size = Some(size);
        self
    }

    pub fn max_header_list_size(mut self, size: u32) -> Self {
        self.settings.max_header_list_size = Some(size);
        self
    }

    pub fn build(self) -> Result<Settings> {
        self.settings.validate()?;
        Ok(self.settings)
    }
}
