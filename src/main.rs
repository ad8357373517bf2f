//! mcu-probe command-line interface.
//!
//! Every probe operation is exposed as a subcommand. Logs go to stderr;
//! stdout carries the probe console text or JSON results.

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use mcu_probe::probe::jlink::JLink;
use mcu_probe::probe::registry::{backend_names, create_backend};
use mcu_probe::probe::{EraseRange, ProbeBackend, ServerOptions};
use mcu_probe::process::CommandOutput;
use mcu_probe::session::{ProgramOutcome, ProgramRequest, SupervisorConfig};
use mcu_probe::target::{parse_address, TargetDescriptor};
use mcu_probe::{expand_path, Debugger};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "mcu-probe", version, about = "Program and control MCUs through debug probes")]
struct Cli {
    /// Probe backend
    #[arg(long, short, global = true, default_value = "jlink")]
    backend: String,
    /// J-Link installation directory (overrides discovery)
    #[arg(long, global = true)]
    jlink_dir: Option<PathBuf>,
    #[command(flatten)]
    target: TargetArgs,
    #[command(subcommand)]
    command: Command,
}

/// Board selection: a JSON descriptor plus per-field overrides.
#[derive(Args)]
struct TargetArgs {
    /// Target descriptor JSON file
    #[arg(long, global = true)]
    target: Option<String>,
    /// Board name
    #[arg(long, global = true)]
    board: Option<String>,
    /// Device name passed to the probe
    #[arg(long, global = true)]
    device: Option<String>,
    /// Debug interface (SWD or JTAG)
    #[arg(long, global = true)]
    interface: Option<String>,
    /// Probe serial id
    #[arg(long, global = true)]
    usbid: Option<String>,
    /// Debug-server port
    #[arg(long, global = true)]
    gdbport: Option<u16>,
    /// Flash start address (hex 0x... or decimal)
    #[arg(long, global = true)]
    start_address: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Write an image with the probe's own loader
    Flash {
        image: PathBuf,
        /// Load address for raw binaries
        #[arg(long)]
        addr: Option<String>,
    },
    /// Program an image through a debug server and gdb session
    Program(ProgramArgs),
    /// Erase the flash, fully or a range
    Erase {
        #[arg(long, requires = "end")]
        start: Option<String>,
        #[arg(long, requires = "start")]
        end: Option<String>,
    },
    /// Reset the board
    Reset,
    /// Unlock a secured device
    Unlock,
    /// Read a 32-bit word
    Read32 { addr: String },
    /// Write a 32-bit word
    Write32 { addr: String, value: String },
    /// List connected probes (JSON)
    List,
    /// Check that the probe reaches the core
    TestConn,
    /// Print the debug-server command line
    Gdbserver {
        #[arg(long)]
        speed: Option<String>,
        #[arg(long)]
        script: Option<PathBuf>,
        #[arg(long)]
        core: Option<u32>,
    },
    /// List registered backends
    Backends,
}

#[derive(Args)]
struct ProgramArgs {
    image: PathBuf,
    /// gdb executable (default: discovered arm-none-eabi-gdb)
    #[arg(long)]
    gdb: Option<PathBuf>,
    /// File with the gdb command template
    #[arg(long)]
    gdb_commands: Option<PathBuf>,
    /// Debug-server command line replacing the backend's
    #[arg(long)]
    server_cmd: Option<String>,
    /// Session deadline in seconds
    #[arg(long)]
    timeout: Option<u64>,
    /// Print the outcome as JSON instead of the console text
    #[arg(long)]
    json: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mcu_probe=info")))
        .init();

    let cli = Cli::parse();
    if let Command::Backends = cli.command {
        for name in backend_names() {
            println!("{}", name);
        }
        return Ok(());
    }

    let mut debugger = Debugger::new(open_backend(&cli)?);
    if let Some(target) = load_target(&cli.target)? {
        info!(board = %target, "Using target");
        debugger.set_target(target.into_handle());
    }

    let code = match cli.command {
        Command::Flash { image, addr } => {
            let addr = addr.as_deref().map(parse_address).transpose()?;
            report(debugger.flash(&image, addr)?)
        }
        Command::Program(args) => run_program(debugger, args)?,
        Command::Erase { start, end } => {
            let range = match (start, end) {
                (Some(start), Some(end)) => Some(EraseRange {
                    start: parse_address(&start)?,
                    end: parse_address(&end)?,
                }),
                _ => None,
            };
            report(debugger.erase(range)?)
        }
        Command::Reset => report(debugger.reset()?),
        Command::Unlock => report(debugger.unlock()?),
        Command::Read32 { addr } => {
            let addr = parse_address(&addr)?;
            let value = debugger.read32(addr)?;
            println!("{:#010x}", value);
            0
        }
        Command::Write32 { addr, value } => {
            let addr = parse_address(&addr)?;
            let value = parse_address(&value)?;
            let value = u32::try_from(value).context("value does not fit in 32 bits")?;
            debugger.write32(addr, value)?;
            0
        }
        Command::List => {
            let devices = debugger.list_connected_devices()?;
            println!("{}", serde_json::to_string_pretty(&devices)?);
            0
        }
        Command::TestConn => {
            let status = debugger.test_connection();
            println!("{}", status);
            if status.is_connected() {
                0
            } else {
                1
            }
        }
        Command::Gdbserver {
            speed,
            script,
            core,
        } => {
            let options = ServerOptions {
                speed,
                script,
                core,
                ..ServerOptions::default()
            };
            println!("{}", debugger.server_command(&options));
            0
        }
        Command::Backends => 0,
    };

    std::process::exit(code);
}

fn open_backend(cli: &Cli) -> anyhow::Result<Box<dyn ProbeBackend>> {
    match cli.jlink_dir.as_ref() {
        Some(dir) if cli.backend.eq_ignore_ascii_case("jlink") => Ok(Box::new(JLink::new(dir, None))),
        _ => create_backend(&cli.backend)
            .with_context(|| format!("cannot create the {} backend", cli.backend)),
    }
}

fn load_target(args: &TargetArgs) -> anyhow::Result<Option<TargetDescriptor>> {
    let overrides = args.board.is_some()
        || args.device.is_some()
        || args.interface.is_some()
        || args.usbid.is_some()
        || args.gdbport.is_some()
        || args.start_address.is_some();

    let mut target = match args.target.as_deref() {
        Some(path) => TargetDescriptor::from_json_file(&expand_path(path))?,
        None if overrides => TargetDescriptor::default(),
        None => return Ok(None),
    };

    if let Some(board) = &args.board {
        target.name = board.clone();
    }
    if let Some(device) = &args.device {
        target.devicename = device.clone();
    }
    if let Some(interface) = &args.interface {
        target.interface = interface.to_ascii_uppercase();
    }
    if let Some(usbid) = &args.usbid {
        target.usbid = Some(usbid.clone());
    }
    if let Some(port) = args.gdbport {
        target.gdbport = port;
    }
    if let Some(addr) = &args.start_address {
        target.start_address = Some(parse_address(addr)?);
    }
    Ok(Some(target))
}

fn run_program(debugger: Debugger, args: ProgramArgs) -> anyhow::Result<i32> {
    let gdb_commands = args
        .gdb_commands
        .as_deref()
        .map(|path| {
            std::fs::read_to_string(path)
                .with_context(|| format!("cannot read {}", path.display()))
        })
        .transpose()?;

    let mut debugger = debugger.with_supervisor(SupervisorConfig {
        gdb_path: args.gdb,
        ..SupervisorConfig::default()
    });
    let request = ProgramRequest {
        server_cmdline: args.server_cmd,
        gdb_commands,
        timeout: args.timeout.map(Duration::from_secs),
        ..ProgramRequest::default()
    };

    let outcome: ProgramOutcome = debugger.programming(&args.image, request)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        print!("{}", outcome.console);
    }
    Ok(outcome.exit_code)
}

fn report(output: CommandOutput) -> i32 {
    print!("{}", output.output);
    output.exit_code
}
