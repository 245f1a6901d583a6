//! Two-register UART exposed over the MMIO bus.
//!
//! The register map matches the layout expected by the bare-metal test
//! programs:
//!
//! | offset | register | semantics                                          |
//! |--------|----------|----------------------------------------------------|
//! | `0x0`  | TX       | write: queue the low byte for transmission         |
//! | `0x4`  | RX       | read: next received byte, or bit 31 set when empty |
//!
//! The host side feeds received bytes in through [`Uart::push_rx`] and
//! attaches any `io::Write` sink for the transmit direction (a stdout lock, a
//! pty master, a capture buffer in tests).

use crate::bus::Peripheral;
use log::warn;
use std::collections::VecDeque;
use std::io::Write;

/// Conventional base address of the UART window.
pub const BASE_ADDRESS: u32 = 0x1000_0000;

const REG_TX: u32 = 0x0;
const REG_RX: u32 = 0x4;

/// Bit set in the RX register when the receive queue is empty.
pub const RX_EMPTY: u32 = 1 << 31;

pub struct Uart {
    tx: Box<dyn Write>,
    rx_queue: VecDeque<u8>,
    /// When `true`, the UART asserts its interrupt line while the receive
    /// queue is non-empty.
    rx_irq_enabled: bool,
}

impl std::fmt::Debug for Uart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Uart")
            .field("rx_queued", &self.rx_queue.len())
            .field("rx_irq_enabled", &self.rx_irq_enabled)
            .finish_non_exhaustive()
    }
}

impl Uart {
    pub fn new(tx: Box<dyn Write>) -> Self {
        Self {
            tx,
            rx_queue: VecDeque::new(),
            rx_irq_enabled: false,
        }
    }

    /// Enables interrupt assertion while received data is pending.
    pub fn with_rx_irq(mut self) -> Self {
        self.rx_irq_enabled = true;
        self
    }

    /// Host-side: queue bytes for the guest to receive.
    pub fn push_rx(&mut self, bytes: &[u8]) {
        self.rx_queue.extend(bytes);
    }

    /// Host-side: number of received bytes not yet read by the guest.
    pub fn rx_pending(&self) -> usize {
        self.rx_queue.len()
    }
}

impl Peripheral for Uart {
    fn read_word(&mut self, offset: u32) -> u32 {
        match offset {
            REG_RX => match self.rx_queue.pop_front() {
                Some(byte) => byte as u32,
                None => RX_EMPTY,
            },
            _ => 0,
        }
    }

    fn write_word(&mut self, offset: u32, value: u32) {
        if offset == REG_TX {
            if let Err(err) = self
                .tx
                .write_all(&[value as u8])
                .and_then(|()| self.tx.flush())
            {
                warn!("uart: dropping tx byte: {err}");
            }
        }
    }

    // The RX register pops on read, so a sub-word access must not go through
    // the default word-sized read-modify-write fan-out.
    fn read_byte(&mut self, offset: u32) -> u8 {
        match offset {
            REG_RX => self.read_word(REG_RX) as u8,
            _ => 0,
        }
    }

    fn write_byte(&mut self, offset: u32, value: u8) {
        if offset == REG_TX {
            self.write_word(REG_TX, value as u32);
        }
    }

    fn irq_pending(&self) -> bool {
        self.rx_irq_enabled && !self.rx_queue.is_empty()
    }
}
