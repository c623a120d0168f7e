/*
Copyright 2025 The Microvisor Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! The terminal frontend: parses the command line, brings up the platform
//! backend and drives the state machine from a key-press menu.

use std::io::{self, BufRead, Lines, StdinLock, Write};
use std::sync::Arc;

use argh::FromArgs;
use log::warn;

use microvisor_host::hypervisor::emulator::FixedEmulator;
use microvisor_host::mem::DEFAULT_MEMORY_SIZE;
use microvisor_host::state::MenuOption;
use microvisor_host::{HypervisorStateMachine, Platform, Result, VmConfig};

/// A minimal user-mode hypervisor: creates a partition on the host
/// virtualization platform, runs guest code on one virtual processor and
/// exposes an interactive menu for lifecycle and register commands.
#[derive(FromArgs, Debug)]
struct Args {
    /// guest memory size in bytes, non-zero (default 4194304)
    #[argh(option, short = 'm', long = "memory", from_str_fn(parse_memory_size))]
    memory: Option<u64>,

    /// use the windowed frontend instead of the terminal menu
    #[argh(switch)]
    gui: bool,
}

fn parse_memory_size(value: &str) -> std::result::Result<u64, String> {
    let bytes =
        parse_u64(value).map_err(|_| format!("'{value}' is not a valid byte count"))?;
    if bytes == 0 {
        return Err("memory size must be non-zero".to_string());
    }
    Ok(bytes)
}

// Accepts decimal or 0x-prefixed hex.
fn parse_u64(value: &str) -> std::result::Result<u64, std::num::ParseIntError> {
    let value = value.trim();
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse(),
    }
}

#[cfg(target_os = "windows")]
fn create_platform() -> Result<Arc<dyn Platform>> {
    use microvisor_host::hypervisor::whp::{is_hypervisor_present, WhpPlatform};
    if !is_hypervisor_present() {
        return Err(microvisor_host::new_error!(
            "The Windows Hypervisor Platform is not enabled on this host"
        ));
    }
    Ok(Arc::new(WhpPlatform::new()))
}

#[cfg(not(target_os = "windows"))]
fn create_platform() -> Result<Arc<dyn Platform>> {
    Err(microvisor_host::new_error!(
        "No supported virtualization platform on this host"
    ))
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args: Args = argh::from_env();
    if let Err(e) = run(args) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let memory_size = args.memory.unwrap_or(DEFAULT_MEMORY_SIZE);
    if args.gui {
        warn!("The windowed frontend is not available in this build; using the terminal menu");
    }

    let platform = create_platform()?;
    let mut machine = HypervisorStateMachine::new(platform, Arc::new(FixedEmulator), memory_size)?;
    println!("Microvisor ready with {memory_size} bytes of guest memory");
    menu_loop(&mut machine)
}

const MENU: &str = "\n\
 1) Start            6) Dump registers\n\
 2) Stop             7) Set registers\n\
 3) Restart          8) Get registers\n\
 4) Save snapshot    9) Set memory size\n\
 5) Restore snapshot q) Quit\n\
 r) Read one register    w) Write one register\n\
 c) Configure VM         v) Show VM config\n\
> ";

fn prompt(lines: &mut Lines<StdinLock<'_>>, text: &str) -> Result<Option<String>> {
    print!("{text}");
    io::stdout().flush()?;
    match lines.next() {
        Some(line) => Ok(Some(line?)),
        None => Ok(None),
    }
}

fn menu_loop(machine: &mut HypervisorStateMachine) -> Result<()> {
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("{MENU}");
        io::stdout().flush()?;
        let Some(line) = lines.next() else {
            break;
        };
        let choice = line?;

        let option = match choice.trim() {
            "" => continue,
            "1" => MenuOption::Start,
            "2" => MenuOption::Stop,
            "3" => MenuOption::Restart,
            "4" => MenuOption::SaveSnapshot,
            "5" => MenuOption::RestoreSnapshot,
            "6" => MenuOption::DumpRegisters,
            "7" => MenuOption::SetRegisters,
            "8" => MenuOption::GetRegisters,
            "9" => {
                let Some(input) = prompt(&mut lines, "Memory size in bytes: ")? else {
                    break;
                };
                match parse_memory_size(&input) {
                    Ok(bytes) => MenuOption::SetMemorySize(bytes),
                    Err(e) => {
                        println!("{e}");
                        continue;
                    }
                }
            }
            "r" => {
                let Some(name) = prompt(&mut lines, "Register name: ")? else {
                    break;
                };
                MenuOption::GetSpecificRegister(name.trim().to_string())
            }
            "w" => {
                let Some(name) = prompt(&mut lines, "Register name: ")? else {
                    break;
                };
                let Some(value) = prompt(&mut lines, "Value: ")? else {
                    break;
                };
                match parse_u64(&value) {
                    Ok(value) => MenuOption::SetSpecificRegister(name.trim().to_string(), value),
                    Err(_) => {
                        println!("'{}' is not a valid register value", value.trim());
                        continue;
                    }
                }
            }
            "c" => {
                let Some(config) = read_vm_config(&mut lines)? else {
                    continue;
                };
                MenuOption::ConfigureVm(config)
            }
            "v" => MenuOption::GetVmConfig,
            "q" | "Q" => MenuOption::Quit,
            other => {
                println!("Unknown selection '{other}'");
                continue;
            }
        };

        let quitting = option == MenuOption::Quit;
        if let Err(e) = machine.handle_menu_option(option) {
            println!("Command failed: {e}");
        }
        let output = machine.drain_output()?;
        if !output.is_empty() {
            print!("{output}");
        }
        if quitting {
            break;
        }
    }
    machine.shutdown()
}

fn read_vm_config(lines: &mut Lines<StdinLock<'_>>) -> Result<Option<VmConfig>> {
    let Some(cpus) = prompt(lines, "CPU count: ")? else {
        return Ok(None);
    };
    let Some(memory) = prompt(lines, "Memory size in bytes: ")? else {
        return Ok(None);
    };
    let Some(devices) = prompt(lines, "I/O devices: ")? else {
        return Ok(None);
    };

    let cpu_count = match cpus.trim().parse::<u32>() {
        Ok(count) if count > 0 => count,
        _ => {
            println!("'{}' is not a valid CPU count", cpus.trim());
            return Ok(None);
        }
    };
    let memory_size = match parse_memory_size(&memory) {
        Ok(bytes) => bytes,
        Err(e) => {
            println!("{e}");
            return Ok(None);
        }
    };
    Ok(Some(VmConfig {
        cpu_count,
        memory_size,
        io_devices: devices.trim().to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_memory_size_is_rejected_at_parse_time() {
        let err = Args::from_args(&["microvisor"], &["-m", "0"]).unwrap_err();
        assert!(err.output.contains("non-zero"));
        assert_eq!(err.status, Err(()));
    }

    #[test]
    fn malformed_memory_size_is_rejected() {
        let err = Args::from_args(&["microvisor"], &["--memory", "lots"]).unwrap_err();
        assert!(err.output.contains("not a valid byte count"));
        assert_eq!(err.status, Err(()));
    }

    #[test]
    fn unknown_flags_fail_with_usage() {
        let err = Args::from_args(&["microvisor"], &["--frobnicate"]).unwrap_err();
        assert_eq!(err.status, Err(()));
    }

    #[test]
    fn help_exits_successfully() {
        let err = Args::from_args(&["microvisor"], &["--help"]).unwrap_err();
        assert_eq!(err.status, Ok(()));
    }

    #[test]
    fn memory_size_accepts_decimal_and_hex() {
        let args = Args::from_args(&["microvisor"], &["-m", "4194304"]).unwrap();
        assert_eq!(args.memory, Some(4_194_304));
        let args = Args::from_args(&["microvisor"], &["-m", "0x400000"]).unwrap();
        assert_eq!(args.memory, Some(0x40_0000));
    }

    #[test]
    fn memory_size_defaults_when_unset() {
        let args = Args::from_args(&["microvisor"], &[]).unwrap();
        assert_eq!(args.memory, None);
        assert_eq!(args.memory.unwrap_or(DEFAULT_MEMORY_SIZE), 0x40_0000);
    }
}
