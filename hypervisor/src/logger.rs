//! Serial-port logger for environments without stdout.
//!
//! Installs as the global `log` logger and tags every line with the APIC ID
//! of the CPU that produced it, which is what makes interleaved per-CPU
//! bring-up logs readable.

use {
    crate::intel::support::{inb, outb},
    core::{fmt, fmt::Write},
    spin::Mutex,
};

const UART_OFFSET_DATA: u16 = 0x0;
const UART_OFFSET_INTERRUPT_ENABLE: u16 = 0x1;
const UART_OFFSET_FIFO_CONTROL: u16 = 0x2;
const UART_OFFSET_LINE_CONTROL: u16 = 0x3;
const UART_OFFSET_MODEM_CONTROL: u16 = 0x4;
const UART_OFFSET_LINE_STATUS: u16 = 0x5;

static LOGGER: SerialLogger = SerialLogger { serial: Mutex::new(Serial { base: 0 }) };

/// Serial ports supported by the logger.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SerialPort {
    /// COM1 (0x3F8)
    COM1 = 0x3f8,
    /// COM2 (0x2F8)
    COM2 = 0x2f8,
}

/// Installs the serial logger and programs the UART once. Idempotent: a
/// second call reprograms the port and updates the level, so an earlier boot
/// phase and the hypervisor can both call it.
pub fn init(port: SerialPort, level: log::LevelFilter) {
    {
        let mut serial = LOGGER.serial.lock();
        serial.base = port as u16;
        serial.init();
    }
    // Another logger may already own the global slot; logging must never be
    // the thing that takes the hypervisor down.
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}

struct SerialLogger {
    serial: Mutex<Serial>,
}

impl log::Log for SerialLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record<'_>) {
        if self.enabled(record.metadata()) {
            let mut serial = self.serial.lock();
            let _ = writeln!(&mut *serial, "cpu-{} {}: {}", apic_id(), record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

struct Serial {
    base: u16,
}

impl Serial {
    fn init(&mut self) {
        outb(self.base + UART_OFFSET_INTERRUPT_ENABLE, 0x00);
        // DLAB on, divisor 3, then 8n1 with DLAB off.
        outb(self.base + UART_OFFSET_LINE_CONTROL, 0x80);
        outb(self.base + UART_OFFSET_DATA, 0x03);
        outb(self.base + UART_OFFSET_INTERRUPT_ENABLE, 0x00);
        outb(self.base + UART_OFFSET_LINE_CONTROL, 0x03);
        // FIFO on and cleared, 14-byte threshold.
        outb(self.base + UART_OFFSET_FIFO_CONTROL, 0xc7);
        outb(self.base + UART_OFFSET_MODEM_CONTROL, 0x0b);
    }

    fn write_byte(&mut self, byte: u8) {
        while (inb(self.base + UART_OFFSET_LINE_STATUS) & 0x20) == 0 {}
        outb(self.base + UART_OFFSET_DATA, byte);
    }
}

impl fmt::Write for Serial {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if self.base == 0 {
            return Ok(());
        }
        for byte in s.bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
        Ok(())
    }
}

fn apic_id() -> u32 {
    x86::cpuid::cpuid!(0x1).ebx >> 24
}
