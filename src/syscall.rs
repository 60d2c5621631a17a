// System-call boundary.
//
// The dispatcher validates every user-supplied pointer before touching it:
// a pointer must fall inside the user window, a string is walked byte by
// byte to its terminator, and a buffer must be covered by page descriptors
// (writable ones when the call will store into it). A violation terminates
// the task with exit status -1; every other failure just returns -1 (or 0
// for the boolean calls) in the result register.
//
// Buffers are validated and faulted in before the file-system lock is
// taken, and bytes are staged through a kernel buffer, so no page fault
// happens beneath the lock.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::file::File;
use crate::param::{pg_round_down, PATH_MAX, PGSIZE, USER_BASE, USER_TOP};
use crate::task::Task;
use crate::Kernel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum SysNo {
    Halt = 0,
    Exit = 1,
    Exec = 2,
    Wait = 3,
    Create = 4,
    Remove = 5,
    Open = 6,
    Filesize = 7,
    Read = 8,
    Write = 9,
    Seek = 10,
    Tell = 11,
    Close = 12,
    Mmap = 13,
    Munmap = 14,
}

impl SysNo {
    pub fn from_usize(n: usize) -> Option<SysNo> {
        Some(match n {
            0 => Self::Halt,
            1 => Self::Exit,
            2 => Self::Exec,
            3 => Self::Wait,
            4 => Self::Create,
            5 => Self::Remove,
            6 => Self::Open,
            7 => Self::Filesize,
            8 => Self::Read,
            9 => Self::Write,
            10 => Self::Seek,
            11 => Self::Tell,
            12 => Self::Close,
            13 => Self::Mmap,
            14 => Self::Munmap,
            _ => return None,
        })
    }
}

fn check_addr(addr: usize) -> Result<()> {
    if !(USER_BASE..USER_TOP).contains(&addr) {
        return Err(Error::Fault(addr));
    }
    Ok(())
}

// Copies a NUL-terminated string out of user memory, validating every byte
// address up to and including the terminator.
fn user_str(task: &Arc<Task>, addr: usize) -> Result<String> {
    let mut bytes = Vec::new();
    let mut addr = addr;
    loop {
        check_addr(addr)?;
        let mut b = [0u8];
        task.read_user(addr, &mut b)?;
        if b[0] == 0 {
            break;
        }
        bytes.push(b[0]);
        if bytes.len() > PATH_MAX {
            return Err(Error::InvalidPath);
        }
        addr += 1;
    }
    String::from_utf8(bytes).map_err(|_| Error::InvalidPath)
}

// Validates a user buffer: every byte inside the window, every overlapped
// page covered by a descriptor (a writable one when the kernel will store
// into the buffer), and faulted in so the copy loops run against resident
// pages.
fn check_buffer(task: &Arc<Task>, addr: usize, len: usize, will_write: bool) -> Result<()> {
    if len == 0 {
        return Ok(());
    }
    let end = addr.checked_add(len).ok_or(Error::Fault(addr))?;
    check_addr(addr)?;
    check_addr(end - 1)?;
    let mut va = pg_round_down(addr);
    while va < end {
        {
            let vm = task.vm.lock().unwrap();
            let vme = vm.find(va).ok_or(Error::Fault(va))?;
            if will_write && !vme.writable {
                return Err(Error::Fault(va));
            }
        }
        if !task.handle_fault(va) {
            return Err(Error::Fault(va));
        }
        va += PGSIZE;
    }
    Ok(())
}

/// Dispatches one system call for `task`. The return value lands in the
/// caller's result register.
pub fn syscall(kernel: &Kernel, task: &Arc<Task>, no: SysNo, args: [usize; 3]) -> isize {
    let res = dispatch(kernel, task, no, args);
    match res {
        Ok(v) => v,
        Err(Error::Fault(_)) => {
            task.exit(-1);
            -1
        }
        Err(_) => -1,
    }
}

fn dispatch(kernel: &Kernel, task: &Arc<Task>, no: SysNo, args: [usize; 3]) -> Result<isize> {
    let fs = &kernel.fs;
    match no {
        SysNo::Halt => {
            kernel.halt();
            Ok(0)
        }
        SysNo::Exit => {
            task.exit(args[0] as i32);
            Ok(args[0] as isize)
        }
        SysNo::Exec => {
            // No loader behind the boundary; the argument is still held to
            // the string rules.
            let _path = user_str(task, args[0])?;
            Ok(-1)
        }
        SysNo::Wait => Ok(-1),
        SysNo::Create => {
            let path = user_str(task, args[0])?;
            let created = task.with_cwd(|cwd| fs.create(cwd, &path, args[1] as u32));
            match created {
                Ok(()) => Ok(1),
                Err(Error::Fault(a)) => Err(Error::Fault(a)),
                Err(_) => Ok(0),
            }
        }
        SysNo::Remove => {
            let path = user_str(task, args[0])?;
            match task.with_cwd(|cwd| fs.remove(cwd, &path)) {
                Ok(()) => Ok(1),
                Err(_) => Ok(0),
            }
        }
        SysNo::Open => {
            // Null pointer gets the early out, before the lock.
            if args[0] == 0 {
                return Ok(-1);
            }
            let path = user_str(task, args[0])?;
            let _fs_lock = fs.lock.lock().unwrap();
            match task.with_cwd(|cwd| fs.open(cwd, &path)) {
                Ok(ip) => Ok(task.add_file(File::open(ip)) as isize),
                Err(_) => Ok(-1),
            }
        }
        SysNo::Filesize => match task.get_file(args[0]) {
            Ok(f) => Ok(f.length(fs) as isize),
            Err(_) => Ok(-1),
        },
        SysNo::Read => {
            let (fd, buf, len) = (args[0], args[1], args[2]);
            check_buffer(task, buf, len, true)?;
            if fd == 1 {
                return Ok(-1);
            }
            let mut tmp = vec![0u8; len];
            let n = if fd == 0 {
                kernel.console.read(&mut tmp)
            } else {
                let f = match task.get_file(fd) {
                    Ok(f) => f,
                    Err(_) => return Ok(-1),
                };
                let _fs_lock = fs.lock.lock().unwrap();
                f.read(fs, &mut tmp)
            };
            task.write_user(buf, &tmp[..n])?;
            Ok(n as isize)
        }
        SysNo::Write => {
            let (fd, buf, len) = (args[0], args[1], args[2]);
            check_buffer(task, buf, len, false)?;
            if fd == 0 {
                return Ok(-1);
            }
            let mut tmp = vec![0u8; len];
            task.read_user(buf, &mut tmp)?;
            let n = if fd == 1 {
                kernel.console.write(&tmp)
            } else {
                let f = match task.get_file(fd) {
                    Ok(f) => f,
                    Err(_) => return Ok(-1),
                };
                let _fs_lock = fs.lock.lock().unwrap();
                f.write(fs, &tmp)
            };
            Ok(n as isize)
        }
        SysNo::Seek => match task.get_file(args[0]) {
            Ok(f) => {
                f.seek(args[1] as u32);
                Ok(0)
            }
            Err(_) => Ok(-1),
        },
        SysNo::Tell => match task.get_file(args[0]) {
            Ok(f) => Ok(f.tell() as isize),
            Err(_) => Ok(-1),
        },
        SysNo::Close => match task.close_fd(args[0]) {
            Ok(()) => Ok(0),
            Err(_) => Ok(-1),
        },
        SysNo::Mmap => match task.mmap(args[0], args[1]) {
            Ok(mapid) => Ok(mapid as isize),
            Err(Error::Fault(a)) => Err(Error::Fault(a)),
            Err(_) => Ok(-1),
        },
        SysNo::Munmap => match task.munmap(args[0] as isize as i32) {
            Ok(()) => Ok(0),
            Err(_) => Ok(-1),
        },
    }
}
