//! Administrative command surface: the interactive stdin console and the
//! local Unix-domain socket.
//!
//! Both inputs end up on the kernel channel; debug migrations additionally
//! take the placement mutex through [Controller::find_and_migrate] so they
//! cannot race the placement loop's candidates. Only BIND and UNBIND are
//! honored from the socket.

use std::{
    fs,
    io::{self, BufRead, Read, Write},
    os::unix::net::{UnixListener, UnixStream},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use byteorder::{ByteOrder, LittleEndian};
use log::{error, info, warn};

use crate::{
    channel::{OpCode, PlacementMode, MAX_N_SWITCH},
    config::ControllerConfiguration,
    controller::Controller,
    placement::{sleep_observing, ComponentToggles},
};

pub struct AdminContext {
    pub controller: Arc<Controller>,
    pub toggles: Arc<ComponentToggles>,
    pub exit: Arc<AtomicBool>,
    pub config: ControllerConfiguration,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ToggleTarget {
    Switch,
    Threshold,
    All,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum AdminCommand {
    Bind(i32),
    Unbind(i32),
    Send { n: usize, mode: PlacementMode },
    Switch(usize),
    Toggle(ToggleTarget),
    Clear,
    Exit,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ParseError {
    /// A known command with a missing or malformed argument.
    BadArgument(&'static str),
    /// Not a command; the caller prints the usage banner.
    Unknown,
}

fn parse_pid(token: Option<&str>, pid_max: i32) -> Option<i32> {
    let pid = token?.parse::<i64>().ok()?;
    if pid > 0 && pid < pid_max as i64 {
        Some(pid as i32)
    } else {
        None
    }
}

pub(crate) fn parse_command(line: &str, pid_max: i32) -> Result<AdminCommand, ParseError> {
    let mut tokens = line.split_whitespace();
    match tokens.next() {
        Some("bind") => parse_pid(tokens.next(), pid_max)
            .map(AdminCommand::Bind)
            .ok_or(ParseError::BadArgument("bind")),
        Some("unbind") => parse_pid(tokens.next(), pid_max)
            .map(AdminCommand::Unbind)
            .ok_or(ParseError::BadArgument("unbind")),
        Some("send") => {
            let n = tokens
                .next()
                .and_then(|t| t.parse::<usize>().ok())
                .ok_or(ParseError::BadArgument("send"))?;
            let mode = match tokens.next() {
                Some("dram") => PlacementMode::NvramPull,
                Some("nvram") => PlacementMode::DramPull,
                Some("dramwr") => PlacementMode::NvramWrite,
                _ => return Err(ParseError::BadArgument("send")),
            };
            Ok(AdminCommand::Send { n, mode })
        }
        Some("switch") => {
            let n = tokens
                .next()
                .and_then(|t| t.parse::<usize>().ok())
                .ok_or(ParseError::BadArgument("switch"))?;
            Ok(AdminCommand::Switch(n.min(MAX_N_SWITCH)))
        }
        Some("toggle") => match tokens.next() {
            Some("switch") => Ok(AdminCommand::Toggle(ToggleTarget::Switch)),
            Some("thresh") => Ok(AdminCommand::Toggle(ToggleTarget::Threshold)),
            Some("all") => Ok(AdminCommand::Toggle(ToggleTarget::All)),
            _ => Err(ParseError::BadArgument("toggle")),
        },
        Some("clear") | Some("clr") => Ok(AdminCommand::Clear),
        Some("exit") => Ok(AdminCommand::Exit),
        _ => Err(ParseError::Unknown),
    }
}

fn print_banner() {
    println!(
        "Available commands:\n\
         \tbind <pid>\n\
         \tunbind <pid>\n\
         \tDEBUG: send <n> {{dram|nvram|dramwr}}\n\
         \tDEBUG: switch <n>\n\
         \tDEBUG: toggle {{switch|thresh|all}}\n\
         \tDEBUG: clear\n\
         \texit"
    );
}

fn report_toggle(name: &str, on: bool) {
    println!(
        "{} component turned {}",
        name,
        if on { "ON" } else { "OFF" }
    );
}

fn execute(ctx: &AdminContext, command: AdminCommand) {
    match command {
        AdminCommand::Bind(pid) => match ctx.controller.bind(pid) {
            Ok(()) => println!("Bind request success (pid={}).", pid),
            Err(e) => eprintln!("Bind request failed (pid={}): {}", pid, e),
        },
        AdminCommand::Unbind(pid) => match ctx.controller.unbind(pid) {
            Ok(()) => println!("Unbind request success (pid={}).", pid),
            Err(e) => eprintln!("Unbind request failed (pid={}): {}", pid, e),
        },
        AdminCommand::Send { n, mode } => {
            let migrated = ctx.controller.find_and_migrate(n, mode);
            if migrated > 0 {
                println!("stdin: Migrated {} out of {} pages.", migrated, n);
            }
        }
        AdminCommand::Switch(n) => {
            let migrated = ctx.controller.find_and_migrate(n, PlacementMode::Switch);
            if migrated > 0 {
                println!("NVRAM<->DRAM: Switched {} out of {} pages.", migrated, n * 2);
            }
        }
        AdminCommand::Toggle(target) => match target {
            ToggleTarget::Switch => report_toggle("Switch", ctx.toggles.flip_switch()),
            ToggleTarget::Threshold => report_toggle("Threshold", ctx.toggles.flip_threshold()),
            ToggleTarget::All => {
                report_toggle("Switch", ctx.toggles.flip_switch());
                report_toggle("Threshold", ctx.toggles.flip_threshold());
            }
        },
        AdminCommand::Clear => {
            print!("\x1b[2J\x1b[1;1H");
            let _ = io::stdout().flush();
        }
        AdminCommand::Exit => unreachable!("handled by the caller"),
    }
}

/// Reads commands from stdin until `exit` or EOF, then raises the exit
/// signal for the other threads.
pub fn stdin_loop(ctx: &AdminContext) {
    print_banner();
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                error!("stdin read failed: {}", e);
                break;
            }
        };
        match parse_command(&line, ctx.config.pid_max) {
            Ok(AdminCommand::Exit) => break,
            Ok(command) => execute(ctx, command),
            Err(ParseError::BadArgument(name)) => {
                eprintln!("Invalid argument for {} command.", name)
            }
            Err(ParseError::Unknown) => print_banner(),
        }
    }
    ctx.exit.store(true, Ordering::Release);
}

const RECORD_SIZE: usize = 12;

fn decode_record(record: &[u8; RECORD_SIZE]) -> (i32, i32, i32) {
    (
        LittleEndian::read_i32(&record[0..]),
        LittleEndian::read_i32(&record[4..]),
        LittleEndian::read_i32(&record[8..]),
    )
}

fn handle_connection(ctx: &AdminContext, mut stream: UnixStream) {
    if let Err(e) = stream.set_read_timeout(Some(ctx.config.select_timeout)) {
        warn!("could not set admin socket read timeout: {}", e);
        return;
    }
    let mut record = [0u8; RECORD_SIZE];
    while !ctx.exit.load(Ordering::Acquire) {
        match stream.read_exact(&mut record) {
            Ok(()) => {
                let (op, pid, _mode) = decode_record(&record);
                match OpCode::from_wire(op) {
                    Some(OpCode::Bind) => match ctx.controller.bind(pid) {
                        Ok(()) => info!("bind request success (pid={})", pid),
                        Err(e) => warn!("bind request failed (pid={}): {}", pid, e),
                    },
                    Some(OpCode::Unbind) => match ctx.controller.unbind(pid) {
                        Ok(()) => info!("unbind request success (pid={})", pid),
                        Err(e) => warn!("unbind request failed (pid={}): {}", pid, e),
                    },
                    _ => warn!("ignoring opcode {} on the admin socket", op),
                }
            }
            // timeouts, disconnects and partial records all end the
            // connection
            Err(_) => break,
        }
    }
}

/// Accept loop of the admin socket. The socket file is unlinked on startup
/// and on shutdown; a nonblocking accept with a short sleep stands in for
/// the classic select timeout so the exit signal is observed promptly.
pub fn socket_loop(ctx: &AdminContext) {
    let path = &ctx.config.socket_path;
    let _ = fs::remove_file(path);
    let listener = match UnixListener::bind(path) {
        Ok(listener) => listener,
        Err(e) => {
            error!("could not bind admin socket at {:?}: {}", path, e);
            return;
        }
    };
    if let Err(e) = listener.set_nonblocking(true) {
        error!("could not configure admin socket: {}", e);
        return;
    }
    info!("admin socket listening at {:?}", path);

    while !ctx.exit.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, _)) => handle_connection(ctx, stream),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                sleep_observing(&ctx.exit, ctx.config.select_timeout)
            }
            Err(e) => {
                error!("admin socket accept failed: {}", e);
                break;
            }
        }
    }
    let _ = fs::remove_file(path);
}
