//! Diagnostic console
//!
//! Line-oriented, append-only text output. Every component writes its
//! `[TAG] message` lines through [`Console`] so the firmware can send them to
//! the serial port and tests can record them.

use core::fmt;

/// Sink for diagnostic lines. Writes are fire-and-forget.
pub trait Console {
    /// Append one line (without the trailing newline)
    fn write_line(&mut self, line: fmt::Arguments<'_>);
}

impl<C: Console + ?Sized> Console for &mut C {
    fn write_line(&mut self, line: fmt::Arguments<'_>) {
        (**self).write_line(line)
    }
}

/// Write one formatted diagnostic line to a [`Console`].
///
/// ```ignore
/// diag!(self.console, "[ETH] IP address: {}", address);
/// ```
#[macro_export]
macro_rules! diag {
    ($console:expr, $($arg:tt)*) => {
        {
            #[allow(unused_imports)]
            use $crate::console::Console as _;
            $console.write_line(format_args!($($arg)*))
        }
    };
}

/// Console that prints to the ESP32 serial/JTAG port
#[cfg(feature = "firmware")]
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialConsole;

#[cfg(feature = "firmware")]
impl Console for SerialConsole {
    fn write_line(&mut self, line: fmt::Arguments<'_>) {
        esp_println::println!("{}", line);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::Console;
    use core::fmt;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Console that keeps every line for later assertions
    #[derive(Clone, Default)]
    pub struct RecordingConsole {
        lines: Rc<RefCell<Vec<String>>>,
    }

    impl RecordingConsole {
        pub fn lines(&self) -> Vec<String> {
            self.lines.borrow().clone()
        }

        pub fn count_containing(&self, needle: &str) -> usize {
            self.lines.borrow().iter().filter(|l| l.contains(needle)).count()
        }
    }

    impl Console for RecordingConsole {
        fn write_line(&mut self, line: fmt::Arguments<'_>) {
            self.lines.borrow_mut().push(line.to_string());
        }
    }
}
