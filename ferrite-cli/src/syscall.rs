//! Newlib-style host syscall service, invoked on `ecall` while the guest has
//! no trap handler installed (and unconditionally for the debug-bridge call
//! numbers).
//!
//! Calling convention: syscall number in `a7`, arguments in `a0..a6`, return
//! value (or negated errno) written back to `a0`. Execution resumes at the
//! instruction after the `ecall`.

use crate::loader::Layout;
use ferrite_core::engine::{BridgeDisposition, Exception, HostBridge, DEBUG_BRIDGE_BASE};
use ferrite_core::Engine;
use log::{debug, warn};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};

// Syscall numbers, Newlib standard.
const SYS_CLOSE: u32 = 57;
const SYS_LSEEK: u32 = 62;
const SYS_READ: u32 = 63;
const SYS_WRITE: u32 = 64;
const SYS_FSTAT: u32 = 80;
const SYS_ISATTY: u32 = 89;
const SYS_EXIT: u32 = 93;
const SYS_KILL: u32 = 129;
const SYS_GETPID: u32 = 172;
const SYS_SBRK: u32 = 214;
const SYS_OPENAT: u32 = 1024;

// Debug-bridge calls, honored regardless of `mtvec`.
const DEBUG_EXIT: u32 = DEBUG_BRIDGE_BASE;
const DEBUG_PUTC: u32 = DEBUG_BRIDGE_BASE + 1;

// The errno values Newlib expects back, negated, in `a0`.
const EIO: u32 = 5;
const EBADF: u32 = 9;
const ENOMEM: u32 = 12;
const ENOSYS: u32 = 38;
const ENOTSUP: u32 = 95;

// Newlib's open(2) flag encoding (not the host's).
const O_WRONLY: u32 = 0x0001;
const O_RDWR: u32 = 0x0002;
const O_APPEND: u32 = 0x0008;
const O_CREAT: u32 = 0x0200;
const O_TRUNC: u32 = 0x0400;

/// `AT_FDCWD` as it arrives in `a0` of `_openat`.
const AT_FDCWD: i32 = -100;

const S_IFCHR: u32 = 0o020000;
const S_IFREG: u32 = 0o100000;

/// Registers by ABI name, for readability below.
const A0: u8 = 10;
const A1: u8 = 11;
const A2: u8 = 12;
const A3: u8 = 13;
const A7: u8 = 17;

pub struct NewlibBridge {
    /// Current program break; `None` when the image carries no heap symbols.
    heap_end: Option<u32>,
    stack_bottom: Option<u32>,
    fd_map: HashMap<u32, File>,
    next_fd: u32,
    trace: bool,
}

impl NewlibBridge {
    pub fn new(layout: &Layout, trace: bool) -> Self {
        Self {
            heap_end: layout.heap_start,
            stack_bottom: layout.stack_bottom,
            fd_map: HashMap::new(),
            next_fd: 3,
            trace,
        }
    }

    fn ecall(&mut self, engine: &mut Engine) -> BridgeDisposition {
        let nr = engine.registers().x(A7);
        if nr >= DEBUG_BRIDGE_BASE {
            return self.debug_call(engine, nr);
        }
        let result = match nr {
            SYS_EXIT => {
                let code = engine.registers().x(A0) as i32;
                if self.trace {
                    debug!("syscall _exit: code={code}");
                }
                engine.terminate(code);
                return BridgeDisposition::Handled;
            }
            SYS_WRITE => self.sys_write(engine),
            SYS_READ => self.sys_read(engine),
            SYS_SBRK => self.sys_sbrk(engine),
            SYS_OPENAT => self.sys_openat(engine),
            SYS_CLOSE => self.sys_close(engine),
            SYS_LSEEK => self.sys_lseek(engine),
            SYS_FSTAT => self.sys_fstat(engine),
            SYS_ISATTY => self.sys_isatty(engine),
            SYS_GETPID => 1,
            SYS_KILL => {
                warn!("syscall _kill is unimplemented");
                ENOSYS.wrapping_neg()
            }
            _ => {
                warn!("unknown syscall {nr}");
                return BridgeDisposition::Unhandled;
            }
        };
        engine.registers_mut().set_x(A0, result);
        BridgeDisposition::Handled
    }

    fn debug_call(&mut self, engine: &mut Engine, nr: u32) -> BridgeDisposition {
        match nr {
            DEBUG_EXIT => engine.terminate(engine.registers().x(A0) as i32),
            DEBUG_PUTC => {
                let byte = engine.registers().x(A0) as u8;
                let _ = std::io::stderr().write_all(&[byte]);
            }
            _ => {
                warn!("unknown debug-bridge call {nr:#010x}");
                engine.registers_mut().set_x(A0, ENOSYS.wrapping_neg());
            }
        }
        BridgeDisposition::Handled
    }

    fn sys_write(&mut self, engine: &mut Engine) -> u32 {
        let (fd, addr, count) = (
            engine.registers().x(A0),
            engine.registers().x(A1),
            engine.registers().x(A2),
        );
        if self.trace {
            debug!("syscall _write: fd={fd}, addr={addr:#010x}, count={count}");
        }
        let data = match engine.bus().ram().load_bytes(addr, count as usize) {
            Ok(data) => data.to_vec(),
            Err(_) => return EIO.wrapping_neg(),
        };
        let written = match fd {
            1 => std::io::stdout()
                .write_all(&data)
                .and_then(|()| std::io::stdout().flush())
                .map(|()| count),
            2 => std::io::stderr().write_all(&data).map(|()| count),
            _ => match self.fd_map.get_mut(&fd) {
                Some(file) => file.write(&data).map(|n| n as u32),
                None => return EBADF.wrapping_neg(),
            },
        };
        written.unwrap_or_else(|err| {
            warn!("syscall _write: fd={fd}: {err}");
            EIO.wrapping_neg()
        })
    }

    fn sys_read(&mut self, engine: &mut Engine) -> u32 {
        let (fd, addr, count) = (
            engine.registers().x(A0),
            engine.registers().x(A1),
            engine.registers().x(A2),
        );
        if self.trace {
            debug!("syscall _read: fd={fd}, addr={addr:#010x}, count={count}");
        }
        let mut data = vec![0; count as usize];
        let read = match fd {
            0 => {
                // Cooked stdin: one line per read, like a terminal.
                let mut line = String::new();
                match std::io::stdin().read_line(&mut line) {
                    Ok(_) => {
                        let bytes = line.as_bytes();
                        let n = bytes.len().min(count as usize);
                        data[..n].copy_from_slice(&bytes[..n]);
                        Ok(n)
                    }
                    Err(err) => Err(err),
                }
            }
            _ => match self.fd_map.get_mut(&fd) {
                Some(file) => file.read(&mut data),
                None => return EBADF.wrapping_neg(),
            },
        };
        match read {
            Ok(n) => {
                if engine.load_image(addr, &data[..n]).is_err() {
                    return EIO.wrapping_neg();
                }
                n as u32
            }
            Err(err) => {
                warn!("syscall _read: fd={fd}: {err}");
                EIO.wrapping_neg()
            }
        }
    }

    /// > sbrk: increase program data space. malloc and related functions
    /// > depend on this.
    ///
    /// The break starts at `__heap_start` and may grow up to
    /// `__stack_bottom`; without those linker symbols every call fails.
    fn sys_sbrk(&mut self, engine: &mut Engine) -> u32 {
        let increment = engine.registers().x(A0) as i32;
        let (Some(heap_end), Some(stack_bottom)) = (self.heap_end, self.stack_bottom) else {
            warn!("syscall _sbrk: image has no heap/stack symbols");
            return ENOMEM.wrapping_neg();
        };
        let new_end = heap_end.wrapping_add_signed(increment);
        if new_end >= stack_bottom {
            return u32::MAX; // -1: out of memory
        }
        if self.trace {
            debug!("syscall _sbrk: increment={increment}, break={new_end:#010x}");
        }
        self.heap_end = Some(new_end);
        heap_end
    }

    fn sys_openat(&mut self, engine: &mut Engine) -> u32 {
        let dirfd = engine.registers().x(A0) as i32;
        if dirfd != AT_FDCWD {
            warn!("syscall _openat: dirfd={dirfd} is not supported");
            return ENOTSUP.wrapping_neg();
        }
        let path_ptr = engine.registers().x(A1);
        let Some(path) = load_cstring(engine, path_ptr) else {
            return EIO.wrapping_neg();
        };
        let flags = engine.registers().x(A2);
        let _mode = engine.registers().x(A3);
        if self.trace {
            debug!("syscall _openat: path={path:?}, flags={flags:#x}");
        }
        let mut options = OpenOptions::new();
        options
            .read(flags & (O_WRONLY | O_RDWR) != O_WRONLY)
            .write(flags & (O_WRONLY | O_RDWR) != 0)
            .append(flags & O_APPEND != 0)
            .create(flags & O_CREAT != 0)
            .truncate(flags & O_TRUNC != 0);
        match options.open(&path) {
            Ok(file) => {
                let fd = self.next_fd;
                self.fd_map.insert(fd, file);
                self.next_fd += 1;
                fd
            }
            Err(err) => {
                warn!("syscall _openat: {path:?}: {err}");
                errno_of(&err).wrapping_neg()
            }
        }
    }

    fn sys_close(&mut self, engine: &mut Engine) -> u32 {
        let fd = engine.registers().x(A0);
        match self.fd_map.remove(&fd) {
            Some(file) => {
                drop(file);
                0
            }
            // Closing the stdio descriptors is a silent no-op.
            None if fd <= 2 => 0,
            None => EBADF.wrapping_neg(),
        }
    }

    fn sys_lseek(&mut self, engine: &mut Engine) -> u32 {
        let (fd, offset, whence) = (
            engine.registers().x(A0),
            engine.registers().x(A1) as i32,
            engine.registers().x(A2),
        );
        let Some(file) = self.fd_map.get_mut(&fd) else {
            return EBADF.wrapping_neg();
        };
        let pos = match whence {
            0 => SeekFrom::Start(offset as u64),
            1 => SeekFrom::Current(offset as i64),
            2 => SeekFrom::End(offset as i64),
            _ => return EIO.wrapping_neg(),
        };
        match file.seek(pos) {
            Ok(new_pos) => new_pos as u32,
            Err(err) => errno_of(&err).wrapping_neg(),
        }
    }

    fn sys_fstat(&mut self, engine: &mut Engine) -> u32 {
        let (fd, buf_ptr) = (engine.registers().x(A0), engine.registers().x(A1));
        let (mode, size) = match fd {
            0..=2 => (S_IFCHR | 0o666, 0),
            _ => match self.fd_map.get(&fd).and_then(|f| f.metadata().ok()) {
                Some(meta) => (S_IFREG | 0o644, meta.len()),
                None => return EBADF.wrapping_neg(),
            },
        };
        // Newlib's struct stat: st_mode at offset 4, st_size at offset 16.
        let mut stat = [0u8; 88];
        stat[4..8].copy_from_slice(&mode.to_le_bytes());
        stat[16..24].copy_from_slice(&size.to_le_bytes());
        match engine.load_image(buf_ptr, &stat) {
            Ok(()) => 0,
            Err(_) => EIO.wrapping_neg(),
        }
    }

    fn sys_isatty(&mut self, engine: &mut Engine) -> u32 {
        let fd = engine.registers().x(A0);
        match fd {
            0..=2 => 1,
            _ if self.fd_map.contains_key(&fd) => 0,
            _ => EBADF.wrapping_neg(),
        }
    }
}

impl HostBridge for NewlibBridge {
    fn handle(&mut self, engine: &mut Engine, exception: &Exception) -> BridgeDisposition {
        match exception {
            Exception::EnvironmentCall => self.ecall(engine),
            Exception::Breakpoint => {
                let nr = engine.registers().x(A7);
                if nr >= DEBUG_BRIDGE_BASE {
                    return self.debug_call(engine, nr);
                }
                // A bare ebreak stops execution with a register dump, the
                // closest thing to a debugger this runner offers.
                eprintln!("breakpoint at pc={:#010x}", engine.registers().pc());
                eprintln!("{}", engine.registers());
                engine.terminate(0);
                BridgeDisposition::Handled
            }
            _ => BridgeDisposition::Unhandled,
        }
    }
}

/// Reads a NUL-terminated guest string, capped at 1 KiB.
fn load_cstring(engine: &mut Engine, addr: u32) -> Option<String> {
    let mut bytes = Vec::new();
    for i in 0..1024 {
        match engine.load_u8(addr.wrapping_add(i)) {
            Ok(0) => return Some(String::from_utf8_lossy(&bytes).into_owned()),
            Ok(byte) => bytes.push(byte),
            Err(_) => return None,
        }
    }
    None
}

fn errno_of(err: &std::io::Error) -> u32 {
    err.raw_os_error().map(|e| e as u32).unwrap_or(EIO)
}
