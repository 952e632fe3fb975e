// Note: Game Boy(TM) is a registered trademark of Nintendo Co., LTD.
use std::fs::File;
use std::io::Read;
use std::process::ExitCode;

use dmgcore::logging::Logger;
use dmgcore::machine::{Machine, RuntimeError, StartupError};

fn main() -> ExitCode {
    let mut rom_path = String::new();
    let mut silent = false;
    {
        let mut ap = argparse::ArgumentParser::new();
        ap.set_description("Game Boy CPU/MBC core");
        ap.refer(&mut silent).add_option(&["-s", "--silent"], argparse::StoreTrue, "Suppress logging");
        ap.refer(&mut rom_path).add_argument("rom", argparse::Store, "Path to a cartridge ROM image");
        ap.parse_args_or_exit();
    }

    let log = Logger::new(silent);

    let rom = match read_rom(&rom_path) {
        Ok(rom) => rom,
        Err(e) => {
            log.critical(&format!("failed to read \"{}\": {}", rom_path, e));
            return ExitCode::FAILURE;
        }
    };

    let mut machine = match Machine::power_up(rom, &log) {
        Ok(m) => m,
        Err(StartupError::Header(e)) => {
            log.critical(&format!("startup failed: {}", e));
            return ExitCode::FAILURE;
        }
        Err(StartupError::UnimplementedController(kind)) => {
            log.critical(&format!("startup failed: unsupported controller {:?}", kind));
            return ExitCode::FAILURE;
        }
    };

    match machine.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(RuntimeError::Cpu(e)) => {
            log.critical(&format!("execution halted: {}", e));
            ExitCode::FAILURE
        }
    }
}

fn read_rom(path: &str) -> std::io::Result<Vec<u8>> {
    let mut f = File::open(path)?;
    let mut rom = Vec::new();
    f.read_to_end(&mut rom)?;
    Ok(rom)
}
