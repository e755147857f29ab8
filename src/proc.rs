//! Processes, as far as the file system cares about them.
//!
//! A process owns a current working directory and a table of open
//! descriptors; exit closes everything it still holds. `exec` stands
//! in for the user-program loader: it resolves the executable through
//! the file system, write-protects it for the lifetime of the child,
//! and runs a registered program body on its own thread. `wait` joins
//! a direct child once and yields its exit status.
//!
//! The `Kernel` value ties the file system, the console, the program
//! registry, and the child table together; nothing is ambient.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::{debug, warn};

use crate::console::Console;
use crate::file::{FdObject, File};
use crate::fs::{FileSystem, Inode};
use crate::param::FD_BASE;

pub type Pid = i32;

type Program = Arc<dyn Fn(&Arc<Kernel>, &mut Proc) -> i32 + Send + Sync>;

struct Child {
    parent: Pid,
    handle: JoinHandle<i32>,
}

pub struct Kernel {
    pub fs: Arc<FileSystem>,
    pub console: Console,

    programs: Mutex<HashMap<String, Program>>,
    children: Mutex<HashMap<Pid, Child>>,
    next_pid: AtomicI32,
    halted: AtomicBool,
}

impl Kernel {
    pub fn new(fs: Arc<FileSystem>, console: Console) -> Arc<Self> {
        Arc::new(Self {
            fs,
            console,
            programs: Mutex::new(HashMap::new()),
            children: Mutex::new(HashMap::new()),
            next_pid: AtomicI32::new(1),
            halted: AtomicBool::new(false),
        })
    }

    /// Registers the program body `exec` runs for `path`. The file
    /// itself must still exist on the file system for `exec` to
    /// succeed.
    pub fn register_program<F>(&self, path: &str, body: F)
    where
        F: Fn(&Arc<Kernel>, &mut Proc) -> i32 + Send + Sync + 'static,
    {
        self.programs
            .lock()
            .unwrap()
            .insert(path.to_string(), Arc::new(body));
    }

    /// A fresh process rooted at `/`.
    pub fn new_proc(self: &Arc<Self>) -> Proc {
        Proc {
            pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
            cwd: Some(self.fs.root()),
            fds: Vec::new(),
            next_fd: FD_BASE,
            exit_status: None,
            executable: None,
        }
    }

    /// Spawns `path` as a child of `parent`. The executable is opened
    /// and write-denied until the child exits. Returns the child pid,
    /// or -1 when the path does not name a registered, existing
    /// regular file.
    pub(crate) fn exec(self: &Arc<Self>, parent: &Proc, path: &str) -> Pid {
        let body = match self.programs.lock().unwrap().get(path) {
            Some(body) => Arc::clone(body),
            None => return -1,
        };
        let ip = match self.fs.open_path(parent.cwd(), path) {
            Ok(ip) => ip,
            Err(_) => return -1,
        };
        if ip.is_dir() {
            self.fs.close_inode(ip);
            return -1;
        }
        let mut executable = File::new(ip);
        executable.deny_write();

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let mut child = Proc {
            pid,
            cwd: Some(self.fs.reopen(parent.cwd())),
            fds: Vec::new(),
            next_fd: FD_BASE,
            exit_status: None,
            executable: Some(executable),
        };

        let kernel = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("sectorfs-pid{}", pid))
            .spawn(move || {
                let status = body(&kernel, &mut child);
                // A body that already called exit keeps its first
                // status; otherwise the return value is the status.
                child.exit(&kernel, status);
                child.exit_status().unwrap_or(status)
            })
            .expect("proc: spawn child");

        self.children.lock().unwrap().insert(
            pid,
            Child {
                parent: parent.pid,
                handle,
            },
        );
        debug!("proc: pid {} spawned {}", pid, path);
        pid
    }

    /// Blocks until the direct child `pid` exits and returns its
    /// status. A pid that is not an unwaited child of the caller
    /// yields -1.
    pub(crate) fn wait(&self, caller: &Proc, pid: Pid) -> i32 {
        let child = {
            let mut children = self.children.lock().unwrap();
            match children.get(&pid) {
                Some(child) if child.parent == caller.pid => children.remove(&pid).unwrap(),
                _ => return -1,
            }
        };
        child.handle.join().unwrap_or(-1)
    }

    /// Flushes and shuts the file system down. Idempotent.
    pub fn halt(&self) {
        if !self.halted.swap(true, Ordering::SeqCst) {
            debug!("kernel: halting");
            self.fs.unmount();
        }
    }

    pub fn halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }
}

/// A descriptor table entry; ids never recycle within a process.
pub struct FdEntry {
    pub fd: i32,
    pub obj: FdObject,
}

pub struct Proc {
    pid: Pid,
    cwd: Option<Arc<Inode>>,
    fds: Vec<FdEntry>,
    next_fd: i32,
    exit_status: Option<i32>,
    executable: Option<File>,
}

impl Proc {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn exit_status(&self) -> Option<i32> {
        self.exit_status
    }

    pub(crate) fn cwd(&self) -> &Arc<Inode> {
        self.cwd.as_ref().expect("proc: already exited")
    }

    /// Swaps the working directory for `dir`, closing the old one.
    pub(crate) fn set_cwd(&mut self, kernel: &Kernel, dir: Arc<Inode>) {
        if let Some(old) = self.cwd.replace(dir) {
            kernel.fs.close_inode(old);
        }
    }

    pub(crate) fn alloc_fd(&mut self, obj: FdObject) -> i32 {
        let fd = self.next_fd;
        self.next_fd += 1;
        self.fds.push(FdEntry { fd, obj });
        fd
    }

    pub(crate) fn fd_object(&self, fd: i32) -> Option<&FdObject> {
        self.fds.iter().find(|e| e.fd == fd).map(|e| &e.obj)
    }

    pub(crate) fn fd_object_mut(&mut self, fd: i32) -> Option<&mut FdObject> {
        self.fds.iter_mut().find(|e| e.fd == fd).map(|e| &mut e.obj)
    }

    pub(crate) fn take_fd(&mut self, fd: i32) -> Option<FdObject> {
        let at = self.fds.iter().position(|e| e.fd == fd)?;
        Some(self.fds.remove(at).obj)
    }

    /// Terminates the process: every outstanding descriptor closes,
    /// the executable's write-deny lifts, and the working directory
    /// goes back. Later calls keep the first status.
    pub fn exit(&mut self, kernel: &Kernel, status: i32) {
        if self.exit_status.is_some() {
            return;
        }
        for entry in self.fds.drain(..) {
            entry.obj.close(&kernel.fs);
        }
        if let Some(executable) = self.executable.take() {
            executable.close(&kernel.fs);
        }
        if let Some(cwd) = self.cwd.take() {
            kernel.fs.close_inode(cwd);
        }
        self.exit_status = Some(status);
        debug!("proc: pid {} exited with {}", self.pid, status);
    }
}

impl Drop for Proc {
    fn drop(&mut self) {
        if self.exit_status.is_none() && (self.cwd.is_some() || !self.fds.is_empty()) {
            warn!("proc: pid {} dropped without exit", self.pid);
        }
    }
}
