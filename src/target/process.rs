//! The traced OS process.
//!
//! Spawns the target under ptrace with ASLR disabled and its stdout/stderr
//! connected to a pty, so the child's libc stays line-buffered and output
//! is visible between steps; the master side is drained at each capture.
//! Because the child is stopped whenever the master is read, everything it
//! has printed so far is already in the pty buffer and the read is
//! deterministic. All ptrace calls happen on the stepping thread; the only
//! thing other threads may do to a [`TracedProcess`] is send its pid a
//! signal (see [`interrupt`](TracedProcess::interrupt)).

use std::fmt;
use std::fs::{self, File};
use std::io::{IoSliceMut, Read};
use std::os::fd::AsFd;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};

use nix::libc;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::pty::openpty;
use nix::sys::personality::{self, Persona};
use nix::sys::ptrace;
use nix::sys::signal::{self, Signal};
use nix::sys::termios::{self, OutputFlags, SetArg};
use nix::sys::uio::{process_vm_readv, RemoteIoVec};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, warn};

use super::breakpoint::{BreakpointSet, INT3};
use super::{MemoryReader, StopEvent};
use crate::error::{Result, TracerError};

/// Snapshot of the stopped target's general-purpose registers.
#[derive(Clone, Copy)]
pub struct Registers(libc::user_regs_struct);

impl Registers {
    pub fn pc(&self) -> u64 {
        self.0.rip
    }

    pub fn fp(&self) -> u64 {
        self.0.rbp
    }

    pub fn sp(&self) -> u64 {
        self.0.rsp
    }

    /// Value of a register by its DWARF number (x86_64 numbering).
    pub fn dwarf_register(&self, number: u16) -> Option<u64> {
        let r = &self.0;
        Some(match number {
            0 => r.rax,
            1 => r.rdx,
            2 => r.rcx,
            3 => r.rbx,
            4 => r.rsi,
            5 => r.rdi,
            6 => r.rbp,
            7 => r.rsp,
            8 => r.r8,
            9 => r.r9,
            10 => r.r10,
            11 => r.r11,
            12 => r.r12,
            13 => r.r13,
            14 => r.r14,
            15 => r.r15,
            16 => r.rip,
            _ => return None,
        })
    }
}

impl fmt::Debug for Registers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registers")
            .field("rip", &format_args!("{:#x}", self.0.rip))
            .field("rsp", &format_args!("{:#x}", self.0.rsp))
            .field("rbp", &format_args!("{:#x}", self.0.rbp))
            .finish()
    }
}

/// One spawned target process under ptrace control.
pub struct TracedProcess {
    pid: Pid,
    breakpoints: BreakpointSet,
    stdout_master: File,
    stdout_seen: Vec<u8>,
    pending: Option<StopEvent>,
    exited: bool,
}

impl TracedProcess {
    /// Spawn `binary` stopped at its first instruction, traced, with ASLR
    /// off and stdio redirected.
    pub fn spawn(binary: &Path, stdin: Option<&Path>) -> Result<Self> {
        // A pipe or regular file would make the child's libc fully buffer
        // stdout; the pty keeps it line-buffered. OPOST is cleared so the
        // captured bytes are exactly what the target wrote.
        let pty = openpty(None, None)?;
        let mut term = termios::tcgetattr(&pty.slave)?;
        term.output_flags.remove(OutputFlags::OPOST);
        termios::tcsetattr(&pty.slave, SetArg::TCSANOW, &term)?;
        let stdout_slave = pty.slave.try_clone()?;

        let mut command = Command::new(binary);
        command
            .stdout(Stdio::from(stdout_slave))
            .stderr(Stdio::from(pty.slave));
        match stdin {
            Some(path) => {
                command.stdin(Stdio::from(File::open(path)?));
            }
            None => {
                command.stdin(Stdio::null());
            }
        }

        unsafe {
            command.pre_exec(|| {
                ptrace::traceme().map_err(errno_to_io)?;
                let persona = personality::get().map_err(errno_to_io)?;
                personality::set(persona | Persona::ADDR_NO_RANDOMIZE).map_err(errno_to_io)?;
                Ok(())
            });
        }

        let child = command.spawn().map_err(|source| TracerError::BinaryRead {
            path: binary.display().to_string(),
            source,
        })?;
        let pid = Pid::from_raw(child.id() as i32);

        // The execve under TRACEME stops the child with SIGTRAP before it
        // runs any target code.
        match waitpid(pid, None)? {
            WaitStatus::Stopped(_, Signal::SIGTRAP) => {}
            status => {
                return Err(TracerError::Process(format!(
                    "unexpected initial stop: {status:?}"
                )))
            }
        }
        ptrace::setoptions(pid, ptrace::Options::PTRACE_O_EXITKILL)?;
        debug!(pid = pid.as_raw(), "target spawned and stopped at entry");

        Ok(TracedProcess {
            pid,
            breakpoints: BreakpointSet::new(),
            stdout_master: File::from(pty.master),
            stdout_seen: Vec::new(),
            pending: None,
            exited: false,
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Load bias of the main executable: zero for fixed-address binaries,
    /// the lowest mapping of the binary for PIE.
    pub fn load_bias(&self, binary: &Path, pie: bool) -> Result<u64> {
        if !pie {
            return Ok(0);
        }
        let maps = fs::read_to_string(format!("/proc/{}/maps", self.pid))?;
        let canonical = fs::canonicalize(binary).unwrap_or_else(|_| binary.to_path_buf());
        let canonical = canonical.to_string_lossy();
        let mut base: Option<u64> = None;
        for line in maps.lines() {
            if line.split_whitespace().last() != Some(canonical.as_ref()) {
                continue;
            }
            let Some((start, _)) = line.split_once('-') else {
                continue;
            };
            if let Ok(address) = u64::from_str_radix(start, 16) {
                base = Some(base.map_or(address, |b| b.min(address)));
            }
        }
        base.ok_or_else(|| {
            TracerError::Process(format!("no mapping of {canonical} in /proc/{}/maps", self.pid))
        })
    }

    pub fn registers(&self) -> Result<Registers> {
        Ok(Registers(ptrace::getregs(self.pid)?))
    }

    fn set_registers(&self, regs: Registers) -> Result<()> {
        ptrace::setregs(self.pid, regs.0)?;
        Ok(())
    }

    /// Patch an INT3 over the first byte of `address`.
    pub fn install_breakpoint(&mut self, address: u64) -> Result<()> {
        if self.breakpoints.contains(address) {
            return Ok(());
        }
        let word = self.read_word(address)? as u64;
        let saved_byte = (word & 0xff) as u8;
        self.write_word(address, ((word & !0xff) | INT3 as u64) as i64)?;
        self.breakpoints.insert(address, saved_byte);
        Ok(())
    }

    fn set_breakpoint_enabled(&mut self, address: u64, enabled: bool) -> Result<()> {
        let Some(bp) = self.breakpoints.get(address).copied() else {
            return Ok(());
        };
        if bp.enabled == enabled {
            return Ok(());
        }
        let word = self.read_word(address)? as u64;
        let patched = if enabled {
            (word & !0xff) | INT3 as u64
        } else {
            (word & !0xff) | bp.saved_byte as u64
        };
        self.write_word(address, patched as i64)?;
        self.breakpoints.set_enabled(address, enabled);
        Ok(())
    }

    /// Resume at full speed until the next breakpoint, signal, or exit.
    pub fn resume(&mut self) -> Result<()> {
        if self.exited || self.pending.is_some() {
            return Ok(());
        }
        match self.step_off_breakpoint()? {
            Some(StopEvent::Trap { .. }) => {
                ptrace::cont(self.pid, None)?;
            }
            Some(event) => self.pending = Some(event),
            None => ptrace::cont(self.pid, None)?,
        }
        Ok(())
    }

    /// Execute exactly one instruction.
    pub fn single_step(&mut self) -> Result<()> {
        if self.exited || self.pending.is_some() {
            return Ok(());
        }
        match self.step_off_breakpoint()? {
            // The step off the breakpoint already was this step.
            Some(event) => self.pending = Some(event),
            None => ptrace::step(self.pid, None)?,
        }
        Ok(())
    }

    /// Block until the target stops or exits.
    pub fn wait(&mut self) -> Result<StopEvent> {
        if let Some(event) = self.pending.take() {
            return Ok(event);
        }
        self.wait_raw()
    }

    /// Stop the target from any thread. Safe to call while the stepping
    /// thread is blocked in `wait`.
    pub fn interrupt(pid: Pid) {
        let _ = signal::kill(pid, Signal::SIGSTOP);
    }

    /// Cumulative stdout+stderr captured so far. Drains whatever the pty
    /// holds; the child being stopped guarantees nothing arrives late.
    pub fn stdout_so_far(&mut self) -> String {
        let mut buf = [0u8; 4096];
        loop {
            let mut fds = [PollFd::new(self.stdout_master.as_fd(), PollFlags::POLLIN)];
            let readable = matches!(poll(&mut fds, PollTimeout::ZERO), Ok(n) if n > 0)
                && fds[0]
                    .revents()
                    .is_some_and(|r| r.contains(PollFlags::POLLIN));
            if !readable {
                break;
            }
            match self.stdout_master.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => self.stdout_seen.extend_from_slice(&buf[..n]),
            }
        }
        String::from_utf8_lossy(&self.stdout_seen).into_owned()
    }

    /// If the pc rests on an enabled breakpoint, restore the original byte,
    /// step across it, and re-arm. `None` means the pc was not on a
    /// breakpoint and nothing was executed; otherwise exactly one
    /// instruction ran and the returned event is its stop.
    fn step_off_breakpoint(&mut self) -> Result<Option<StopEvent>> {
        let pc = self.registers()?.pc();
        if !self.breakpoints.is_enabled(pc) {
            return Ok(None);
        }
        self.set_breakpoint_enabled(pc, false)?;
        ptrace::step(self.pid, None)?;
        let event = self.wait_raw()?;
        if !self.exited {
            self.set_breakpoint_enabled(pc, true)?;
        }
        Ok(Some(event))
    }

    fn wait_raw(&mut self) -> Result<StopEvent> {
        let status = waitpid(self.pid, None)?;
        match status {
            WaitStatus::Exited(_, code) => {
                self.exited = true;
                Ok(StopEvent::Exited { code })
            }
            WaitStatus::Signaled(_, signal, _) => {
                self.exited = true;
                Ok(StopEvent::Fault { signal })
            }
            WaitStatus::Stopped(_, Signal::SIGTRAP) => {
                // A breakpoint trap leaves the pc one past the INT3; rewind
                // so the stop reports the patched instruction's address.
                let mut regs = self.registers()?;
                let breakpoint_pc = regs.0.rip.wrapping_sub(1);
                if self.breakpoints.is_enabled(breakpoint_pc) {
                    regs.0.rip = breakpoint_pc;
                    self.set_registers(regs)?;
                }
                Ok(StopEvent::Trap { pc: regs.0.rip })
            }
            WaitStatus::Stopped(_, Signal::SIGSTOP) => Ok(StopEvent::Interrupted),
            WaitStatus::Stopped(_, signal) => Ok(StopEvent::Fault { signal }),
            other => {
                warn!(?other, "unexpected wait status");
                Ok(StopEvent::Interrupted)
            }
        }
    }

    fn read_word(&self, address: u64) -> Result<i64> {
        Ok(ptrace::read(self.pid, address as ptrace::AddressType)?)
    }

    fn write_word(&self, address: u64, word: i64) -> Result<()> {
        ptrace::write(self.pid, address as ptrace::AddressType, word)?;
        Ok(())
    }
}

impl MemoryReader for TracedProcess {
    fn read_memory(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let length = buf.len();
        let mut local = [IoSliceMut::new(buf)];
        let remote = [RemoteIoVec {
            base: address as usize,
            len: length,
        }];
        let read = process_vm_readv(self.pid, &mut local, &remote)
            .map_err(|_| TracerError::MemoryRead { address, length })?;
        if read != length {
            return Err(TracerError::MemoryRead { address, length });
        }
        Ok(())
    }
}

impl Drop for TracedProcess {
    fn drop(&mut self) {
        if !self.exited {
            let _ = signal::kill(self.pid, Signal::SIGKILL);
            let _ = waitpid(self.pid, None);
        }
    }
}

fn errno_to_io(errno: nix::errno::Errno) -> std::io::Error {
    std::io::Error::from_raw_os_error(errno as i32)
}
