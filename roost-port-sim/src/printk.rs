pub use core::fmt::{Error, Write};
use core::cell::UnsafeCell;

pub struct Printk {}

impl core::fmt::Write for Printk {
    fn write_str(&mut self, s: &str) -> Result<(), Error> {
        use std::io::Write;
        use std::os::unix::io::FromRawFd;
        let mut f = std::mem::ManuallyDrop::new(unsafe { std::fs::File::from_raw_fd(1) });
        f.write_all(s.as_bytes()).map_err(|_| Error)?;
        Ok(())
    }
}

pub struct PrintkCell(UnsafeCell<Printk>);

// Printk is stateless; interleaved output from concurrent writers is the
// worst that can happen.
unsafe impl Sync for PrintkCell {}

impl PrintkCell {
    pub fn get(&self) -> *mut Printk {
        self.0.get()
    }
}

#[macro_export]
macro_rules! printk {
    ($($arg:tt)*) => {{
        use ::core::fmt::Write;
        let _ = write!(unsafe { &mut *$crate::printk::PRINTK.get() }, $($arg)*);
    }};
}

#[macro_export]
macro_rules! printkln {
    () => ($crate::printk!("\r\n"));
    ($fmt:expr) => ({
        $crate::printk!(concat!($fmt, "\r\n"))
    });
    ($fmt:expr, $($arg:tt)*) => ({
        $crate::printk!(concat!($fmt, "\r\n"), $($arg)*)
    });
}

/// Fatal failure: print a diagnostic identifying the call site, then
/// terminate the process. Used for failing host calls and for invariant
/// violations; neither leaves the emulated machine in a trustworthy state,
/// so there is no recovery path.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        $crate::printkln!("fatal [{}:{}]: {}", file!(), line!(), format_args!($($arg)*));
        $crate::abort()
    }};
}

pub static PRINTK: PrintkCell = PrintkCell(UnsafeCell::new(Printk {}));
