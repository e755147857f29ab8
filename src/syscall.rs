//! File-oriented system calls.
//!
//! Argument marshalling and pointer validation live with the trap
//! dispatcher outside this crate; what arrives here is already safe to
//! touch. These methods fold every file-system error into the integer
//! conventions user programs see: -1 or `false` for failures, 0 from a
//! denied write, and a `Fault` (the caller has been terminated with
//! status -1) for arguments bad enough to kill over.
//!
//! Descriptor 0 reads the console a line at a time, descriptor 1
//! writes it, descriptor 2 is unused, and real files start at 3.

use std::sync::Arc;

use crate::error::Fault;
use crate::file::{DirFile, FdObject, File};
use crate::param::DIRSIZ;
use crate::proc::{Kernel, Pid, Proc};

impl Proc {
    /// Powers the machine off: flushes and unmounts the file system.
    pub fn sys_halt(&self, kernel: &Kernel) {
        kernel.halt();
    }

    /// Terminates the calling process with `status`.
    pub fn sys_exit(&mut self, kernel: &Kernel, status: i32) {
        self.exit(kernel, status);
    }

    /// Spawns the program at `path`; returns its pid or -1.
    pub fn sys_exec(&self, kernel: &Arc<Kernel>, path: &str) -> Pid {
        kernel.exec(self, path)
    }

    /// Waits for child `pid`; returns its exit status or -1.
    pub fn sys_wait(&self, kernel: &Kernel, pid: Pid) -> i32 {
        kernel.wait(self, pid)
    }

    /// Creates an empty regular file of `size` bytes.
    pub fn sys_create(&self, kernel: &Kernel, path: &str, size: u32) -> bool {
        kernel.fs.create_file(self.cwd(), path, size).is_ok()
    }

    /// Deletes a file or an empty directory.
    pub fn sys_remove(&self, kernel: &Kernel, path: &str) -> bool {
        kernel.fs.remove(self.cwd(), path).is_ok()
    }

    /// Opens `path`; returns a descriptor of 3 or above, or -1.
    pub fn sys_open(&mut self, kernel: &Kernel, path: &str) -> i32 {
        let ip = match kernel.fs.open_path(self.cwd(), path) {
            Ok(ip) => ip,
            Err(_) => return -1,
        };
        let obj = if ip.is_dir() {
            FdObject::Dir(DirFile::new(ip))
        } else {
            FdObject::File(File::new(ip))
        };
        self.alloc_fd(obj)
    }

    /// Byte length of the open file, or -1 for a bad descriptor.
    pub fn sys_filesize(&self, fd: i32) -> i32 {
        match self.fd_object(fd) {
            Some(FdObject::File(f)) => f.size() as i32,
            Some(FdObject::Dir(d)) => d.inode().len() as i32,
            None => -1,
        }
    }

    /// Reads up to `buf.len()` bytes. Returns the bytes read, 0 at end
    /// of file, and -1 for directories and bad descriptors.
    pub fn sys_read(&mut self, kernel: &Kernel, fd: i32, buf: &mut [u8]) -> i32 {
        match fd {
            0 => kernel.console.read(buf) as i32,
            1 | 2 => -1,
            _ => match self.fd_object_mut(fd) {
                Some(FdObject::File(f)) => f.read(&kernel.fs, buf) as i32,
                Some(FdObject::Dir(_)) | None => -1,
            },
        }
    }

    /// Writes `buf`. Returns the bytes written (0 while writes are
    /// denied), and -1 for directories, descriptor 0, and bad
    /// descriptors.
    pub fn sys_write(&mut self, kernel: &Kernel, fd: i32, buf: &[u8]) -> i32 {
        match fd {
            0 | 2 => -1,
            1 => kernel.console.write(buf) as i32,
            _ => match self.fd_object_mut(fd) {
                Some(FdObject::File(f)) => f.write(&kernel.fs, buf) as i32,
                Some(FdObject::Dir(_)) | None => -1,
            },
        }
    }

    /// Moves the byte cursor; silently ignores bad descriptors.
    pub fn sys_seek(&mut self, fd: i32, pos: u32) {
        if let Some(FdObject::File(f)) = self.fd_object_mut(fd) {
            f.seek(pos);
        }
    }

    /// Byte cursor position; 0 for bad descriptors.
    pub fn sys_tell(&self, fd: i32) -> u32 {
        match self.fd_object(fd) {
            Some(FdObject::File(f)) => f.tell(),
            _ => 0,
        }
    }

    /// Closes `fd`. Closing a descriptor the process does not own is
    /// fatal: the process is terminated with status -1.
    pub fn sys_close(&mut self, kernel: &Kernel, fd: i32) -> Result<(), Fault> {
        match self.take_fd(fd) {
            Some(obj) => {
                obj.close(&kernel.fs);
                Ok(())
            }
            None => {
                self.exit(kernel, -1);
                Err(Fault)
            }
        }
    }

    /// Changes the working directory; `path` must name a directory.
    pub fn sys_chdir(&mut self, kernel: &Kernel, path: &str) -> bool {
        let ip = match kernel.fs.open_path(self.cwd(), path) {
            Ok(ip) => ip,
            Err(_) => return false,
        };
        if !ip.is_dir() {
            kernel.fs.close_inode(ip);
            return false;
        }
        self.set_cwd(kernel, ip);
        true
    }

    /// Creates a directory.
    pub fn sys_mkdir(&self, kernel: &Kernel, path: &str) -> bool {
        kernel.fs.create_dir(self.cwd(), path).is_ok()
    }

    /// Copies the next entry name of the open directory into
    /// `name_out`, NUL-terminated, skipping `.` and `..`. Returns
    /// false at the end of the directory or for a bad descriptor.
    pub fn sys_readdir(
        &mut self,
        kernel: &Kernel,
        fd: i32,
        name_out: &mut [u8; DIRSIZ + 1],
    ) -> bool {
        let dir = match self.fd_object_mut(fd) {
            Some(FdObject::Dir(d)) => d,
            _ => return false,
        };
        match dir.read_next(&kernel.fs) {
            Some(name) => {
                let bytes = name.as_bytes();
                name_out[..bytes.len()].copy_from_slice(bytes);
                name_out[bytes.len()] = 0;
                true
            }
            None => false,
        }
    }

    /// Whether `fd` names an open directory.
    pub fn sys_isdir(&self, fd: i32) -> bool {
        self.fd_object(fd).map_or(false, |obj| obj.is_dir())
    }

    /// Home sector of the descriptor's inode, or -1.
    pub fn sys_inumber(&self, fd: i32) -> i32 {
        self.fd_object(fd).map_or(-1, |obj| obj.inumber() as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::Console;
    use crate::fs::tests::mem_fs;
    use crate::proc::tests::test_kernel;
    use std::io;
    use std::sync::Mutex;

    #[test]
    fn descriptors_start_at_three_and_never_recycle() {
        let k = test_kernel(2048);
        let mut p = k.new_proc();

        assert!(p.sys_create(&k, "/a", 0));
        assert!(p.sys_create(&k, "/b", 0));

        let fd_a = p.sys_open(&k, "/a");
        let fd_b = p.sys_open(&k, "/b");
        assert_eq!((fd_a, fd_b), (3, 4));

        p.sys_close(&k, fd_a).unwrap();
        // The freed id is not handed out again.
        assert_eq!(p.sys_open(&k, "/a"), 5);

        p.sys_exit(&k, 0);
    }

    #[test]
    fn hello_round_trip() {
        let k = test_kernel(2048);
        let mut p = k.new_proc();

        assert!(p.sys_create(&k, "/a", 0));
        let fd = p.sys_open(&k, "/a");
        assert_eq!(p.sys_write(&k, fd, b"hello"), 5);
        p.sys_close(&k, fd).unwrap();

        let fd = p.sys_open(&k, "/a");
        assert_eq!(p.sys_filesize(fd), 5);
        let mut buf = [0u8; 8];
        assert_eq!(p.sys_read(&k, fd, &mut buf), 5);
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(p.sys_read(&k, fd, &mut buf), 0);

        p.sys_exit(&k, 0);
    }

    #[test]
    fn seek_and_tell_move_the_cursor() {
        let k = test_kernel(2048);
        let mut p = k.new_proc();

        assert!(p.sys_create(&k, "/f", 0));
        let fd = p.sys_open(&k, "/f");
        p.sys_write(&k, fd, b"0123456789");
        assert_eq!(p.sys_tell(fd), 10);

        p.sys_seek(fd, 4);
        assert_eq!(p.sys_tell(fd), 4);
        let mut buf = [0u8; 3];
        assert_eq!(p.sys_read(&k, fd, &mut buf), 3);
        assert_eq!(&buf, b"456");

        // Cursor math on a bad descriptor is inert.
        p.sys_seek(99, 4);
        assert_eq!(p.sys_tell(99), 0);

        p.sys_exit(&k, 0);
    }

    #[test]
    fn directory_descriptors_refuse_io() {
        let k = test_kernel(2048);
        let mut p = k.new_proc();

        assert!(p.sys_mkdir(&k, "/d"));
        let fd = p.sys_open(&k, "/d");
        assert!(p.sys_isdir(fd));

        let mut buf = [0u8; 4];
        assert_eq!(p.sys_read(&k, fd, &mut buf), -1);
        assert_eq!(p.sys_write(&k, fd, b"no"), -1);

        p.sys_exit(&k, 0);
    }

    #[test]
    fn console_descriptors() {
        let _ = env_logger::builder().is_test(true).try_init();
        let out = std::sync::Arc::new(Mutex::new(Vec::<u8>::new()));
        struct Sink(std::sync::Arc<Mutex<Vec<u8>>>);
        impl io::Write for Sink {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let k = Kernel::new(
            mem_fs(2048),
            Console::new(
                Box::new(io::Cursor::new(b"typed input\n".to_vec())),
                Box::new(Sink(out.clone())),
            ),
        );
        let mut p = k.new_proc();

        assert_eq!(p.sys_write(&k, 1, b"printed"), 7);
        assert_eq!(&*out.lock().unwrap(), b"printed");

        let mut buf = [0u8; 32];
        let n = p.sys_read(&k, 0, &mut buf);
        assert_eq!(&buf[..n as usize], b"typed input\n");

        // The wrong direction on either console descriptor fails.
        assert_eq!(p.sys_read(&k, 1, &mut buf), -1);
        assert_eq!(p.sys_write(&k, 0, b"x"), -1);
        assert_eq!(p.sys_read(&k, 2, &mut buf), -1);
        assert_eq!(p.sys_write(&k, 2, b"x"), -1);

        p.sys_exit(&k, 0);
    }

    #[test]
    fn close_of_unknown_descriptor_kills() {
        let k = test_kernel(2048);
        let mut p = k.new_proc();

        assert!(p.sys_create(&k, "/f", 0));
        let fd = p.sys_open(&k, "/f");

        assert_eq!(p.sys_close(&k, 99), Err(Fault));
        assert_eq!(p.exit_status(), Some(-1));

        // The kill already closed the descriptor table.
        assert_eq!(p.sys_filesize(fd), -1);
    }

    #[test]
    fn chdir_and_relative_operations() {
        let k = test_kernel(2048);
        let mut p = k.new_proc();

        assert!(p.sys_mkdir(&k, "/d"));
        assert!(p.sys_create(&k, "/d/x", 0));
        assert!(p.sys_chdir(&k, "/d"));

        let fd = p.sys_open(&k, "x");
        assert!(fd >= 3);
        let via_abs = p.sys_open(&k, "/d/x");
        assert_eq!(p.sys_inumber(fd), p.sys_inumber(via_abs));

        // `..` climbs back out.
        assert!(p.sys_chdir(&k, ".."));
        assert!(p.sys_open(&k, "d/x") >= 3);

        // chdir to a file or a missing path fails and keeps the cwd.
        assert!(!p.sys_chdir(&k, "d/x"));
        assert!(!p.sys_chdir(&k, "/nope"));
        assert!(p.sys_open(&k, "d") >= 3);

        p.sys_exit(&k, 0);
    }

    #[test]
    fn mkdir_remove_cycle() {
        let k = test_kernel(2048);
        let mut p = k.new_proc();

        assert!(p.sys_mkdir(&k, "/d"));
        assert!(p.sys_create(&k, "/d/f", 0));
        assert!(!p.sys_remove(&k, "/d"));
        assert!(p.sys_remove(&k, "/d/f"));
        assert!(p.sys_remove(&k, "/d"));
        assert_eq!(p.sys_open(&k, "/d"), -1);

        p.sys_exit(&k, 0);
    }

    #[test]
    fn readdir_walks_live_entries() {
        let k = test_kernel(2048);
        let mut p = k.new_proc();

        assert!(p.sys_mkdir(&k, "/d"));
        for name in &["/d/one", "/d/two", "/d/three"] {
            assert!(p.sys_create(&k, name, 0));
        }
        assert!(p.sys_remove(&k, "/d/two"));

        let fd = p.sys_open(&k, "/d");
        let mut name = [0u8; DIRSIZ + 1];
        let mut seen = Vec::new();
        while p.sys_readdir(&k, fd, &mut name) {
            let len = name.iter().position(|b| *b == 0).unwrap();
            seen.push(String::from_utf8(name[..len].to_vec()).unwrap());
        }
        assert_eq!(seen, vec!["one", "three"]);

        // readdir on a regular file descriptor reports nothing.
        assert!(p.sys_create(&k, "/plain", 0));
        let plain = p.sys_open(&k, "/plain");
        assert!(!p.sys_readdir(&k, plain, &mut name));

        p.sys_exit(&k, 0);
    }

    #[test]
    fn isdir_and_inumber_on_bad_descriptors() {
        let k = test_kernel(2048);
        let mut p = k.new_proc();
        assert!(!p.sys_isdir(42));
        assert_eq!(p.sys_inumber(42), -1);
        assert_eq!(p.sys_filesize(42), -1);
        p.sys_exit(&k, 0);
    }

    #[test]
    fn inumber_matches_directory_entry() {
        let k = test_kernel(2048);
        let mut p = k.new_proc();

        assert!(p.sys_mkdir(&k, "/d"));
        assert!(p.sys_create(&k, "/d/x", 0));
        assert!(p.sys_chdir(&k, "/d"));

        let fd = p.sys_open(&k, "x");
        let sector = {
            let dir = k.fs.open_path(p.cwd(), ".").unwrap();
            let found = dir.dir_lookup(&k.fs, "x").unwrap();
            k.fs.close_inode(dir);
            found
        };
        assert_eq!(p.sys_inumber(fd), sector as i32);

        p.sys_exit(&k, 0);
    }
}
