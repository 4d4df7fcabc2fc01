//! Window accounting (RFC 7540 Section 5.2)
//!
//! The connection and every open stream carry the same pair of windows: the
//! send window limits the DATA we emit, the receive window polices what the
//! peer sends and tells us when to emit WINDOW_UPDATE.

use super::error::{Error, Result};

/// Largest legal window (2^31 - 1)
pub const MAX_WINDOW_SIZE: i64 = 0x7FFF_FFFF;

fn within_bounds(size: i64) -> Result<i64> {
    if size > MAX_WINDOW_SIZE {
        return Err(Error::FlowControl(format!("window would grow to {}", size)));
    }
    Ok(size)
}

/// One direction of flow control
///
/// The size is signed: lowering SETTINGS_INITIAL_WINDOW_SIZE can push an
/// already consumed window below zero.
#[derive(Debug, Clone)]
pub struct FlowControlWindow {
    initial: u32,
    size: i64,
}

impl FlowControlWindow {
    pub fn with_initial_size(initial: u32) -> Self {
        FlowControlWindow { initial, size: i64::from(initial) }
    }

    pub fn size(&self) -> i64 {
        self.size
    }

    pub fn initial_size(&self) -> u32 {
        self.initial
    }

    /// Bytes that may be sent right now
    pub fn available(&self) -> usize {
        self.size.max(0) as usize
    }

    /// Take up to `amount`, returning what was granted
    pub fn consume(&mut self, amount: usize) -> usize {
        let granted = amount.min(self.available());
        self.size -= granted as i64;
        granted
    }

    /// Apply a WINDOW_UPDATE increment, returning the new size
    pub fn increase(&mut self, increment: u32) -> Result<i64> {
        if increment == 0 {
            return Err(Error::Protocol("WINDOW_UPDATE with zero increment".into()));
        }
        self.size = within_bounds(self.size + i64::from(increment))?;
        Ok(self.size)
    }

    /// Shift the window by the change in SETTINGS_INITIAL_WINDOW_SIZE
    /// (RFC 7540 Section 6.9.2)
    pub fn update_initial_size(&mut self, initial: u32) -> Result<()> {
        let delta = i64::from(initial) - i64::from(self.initial);
        self.size = within_bounds(self.size + delta)?;
        self.initial = initial;
        Ok(())
    }
}

/// Send and receive windows of the connection or of one stream
#[derive(Debug, Clone)]
pub struct FlowControl {
    send: FlowControlWindow,
    recv: FlowControlWindow,
}

impl FlowControl {
    pub fn new(send_size: u32, recv_size: u32) -> Self {
        FlowControl {
            send: FlowControlWindow::with_initial_size(send_size),
            recv: FlowControlWindow::with_initial_size(recv_size),
        }
    }

    pub fn recv_window(&self) -> &FlowControlWindow {
        &self.recv
    }

    /// Bytes of DATA that may be sent right now
    pub fn send_capacity(&self) -> usize {
        self.send.available()
    }

    pub fn consume_send_window(&mut self, amount: usize) -> usize {
        self.send.consume(amount)
    }

    pub fn increase_send_window(&mut self, increment: u32) -> Result<i64> {
        self.send.increase(increment)
    }

    /// Peer changed SETTINGS_INITIAL_WINDOW_SIZE
    pub fn update_send_initial_size(&mut self, size: u32) -> Result<()> {
        self.send.update_initial_size(size)
    }

    /// Account for inbound DATA
    pub fn consume_recv_window(&mut self, amount: usize) -> Result<()> {
        let left = self.recv.size;
        if amount as i64 > left {
            return Err(Error::FlowControl(format!(
                "peer sent {} bytes with {} left in window",
                amount, left
            )));
        }
        self.recv.size -= amount as i64;
        Ok(())
    }

    /// Increment to announce once the receive window fell below half of
    /// its initial size
    pub fn should_send_window_update(&self) -> Option<u32> {
        let initial = i64::from(self.recv.initial);
        (self.recv.size < initial / 2).then(|| (initial - self.recv.size) as u32)
    }

    /// Record a WINDOW_UPDATE we emitted
    pub fn send_window_update(&mut self, increment: u32) -> Result<i64> {
        self.recv.increase(increment)
    }
}
