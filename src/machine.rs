// The top-level driver: loads a cartridge, installs its controller, and runs
// the CPU tick loop.
use super::bus::Bus;
use super::cpu::{Cpu, CpuError};
use super::header::{Controller as HeaderController, Header, HeaderError};
use super::logging::Logger;
use super::mbc::{Controller, Mbc1};
use super::memory::Memory;

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("cartridge header error: {0}")]
    Header(#[from] HeaderError),
    #[error("unimplemented cartridge controller: {0:?} (only NONE and MBC1 are supported)")]
    UnimplementedController(HeaderController),
}

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Cpu(#[from] CpuError),
}

pub struct Machine {
    pub bus: Bus,
    pub cpu: Cpu,
    pub clock: u64,
}

impl Machine {
    pub fn power_up(rom: Vec<u8>, log: &Logger) -> Result<Machine, StartupError> {
        let header = Header::parse(&rom, log)?;
        log.info(&format!(
            "loaded \"{}\", controller {:?}, rom_bank_count={}, ram_bank_count={}",
            header.title, header.controller, header.rom_bank_count, header.ram_bank_count
        ));

        let controller = match header.controller {
            HeaderController::None => Controller::None,
            HeaderController::Mbc1 => Controller::Mbc1(Mbc1::power_up(header.rom_bank_count, header.ram_bank_count)),
            other => {
                log.critical(&format!("cartridge controller {:?} is recognized but not implemented", other));
                return Err(StartupError::UnimplementedController(other));
            }
        };

        let ram = vec![0u8; header.ram_bank_count * 0x2000];
        let bus = Bus::power_up(rom, ram, controller);
        let cpu = Cpu::power_up();
        Ok(Machine { bus, cpu, clock: 0 })
    }

    /// Run until the CPU reports a terminal error (an illegal opcode). This
    /// reduced core has no other natural halting condition.
    pub fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            self.tick()?;
        }
    }

    pub fn tick(&mut self) -> Result<(), RuntimeError> {
        self.clock += 1;
        self.cpu.tick(&mut self.bus)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rom_with_header(controller_byte: u8, rom_size: u8) -> Vec<u8> {
        let mut rom = vec![0u8; 0x8000];
        const NINTENDO_LOGO: [u8; 48] = [
            0xce, 0xed, 0x66, 0x66, 0xcc, 0x0d, 0x00, 0x0b, 0x03, 0x73, 0x00, 0x83, 0x00, 0x0c, 0x00, 0x0d, 0x00,
            0x08, 0x11, 0x1f, 0x88, 0x89, 0x00, 0x0e, 0xdc, 0xcc, 0x6e, 0xe6, 0xdd, 0xdd, 0xd9, 0x99, 0xbb, 0xbb,
            0x67, 0x63, 0x6e, 0x0e, 0xec, 0xcc, 0xdd, 0xdc, 0x99, 0x9f, 0xbb, 0xb9, 0x33, 0x3e,
        ];
        rom[0x0104..0x0104 + 48].copy_from_slice(&NINTENDO_LOGO);
        rom[0x0147] = controller_byte;
        rom[0x0148] = rom_size;
        rom[0x0100] = 0x00; // NOP at the entry point
        let mut v: u8 = 0;
        for &b in &rom[0x0134..0x014d] {
            v = v.wrapping_sub(b).wrapping_sub(1);
        }
        rom[0x014d] = v;
        rom
    }

    #[test]
    fn powers_up_a_rom_only_cartridge() {
        let log = Logger::silent();
        let rom = rom_with_header(0x00, 0x00);
        let m = Machine::power_up(rom, &log).unwrap();
        assert_eq!(m.clock, 0);
        assert_eq!(m.cpu.reg.pc, 0x0100);
    }

    #[test]
    fn refuses_to_start_on_unimplemented_controller() {
        let log = Logger::silent();
        let rom = rom_with_header(0x11, 0x00); // MBC3
        let err = Machine::power_up(rom, &log).unwrap_err();
        assert!(matches!(err, StartupError::UnimplementedController(_)));
    }

    #[test]
    fn tick_loop_stops_on_illegal_opcode() {
        let log = Logger::silent();
        let mut rom = rom_with_header(0x00, 0x00);
        rom[0x0100] = 0xd3; // illegal opcode
        let mut m = Machine::power_up(rom, &log).unwrap();
        let err = m.run().unwrap_err();
        assert!(matches!(err, RuntimeError::Cpu(_)));
    }

    #[test]
    fn clock_advances_once_per_tick_call() {
        let log = Logger::silent();
        let rom = rom_with_header(0x00, 0x00);
        let mut m = Machine::power_up(rom, &log).unwrap();
        m.tick().unwrap();
        m.tick().unwrap();
        assert_eq!(m.clock, 2);
    }
}
