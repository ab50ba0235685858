/// Prints interpreter events (one line per executed opcode family), enabled
/// by the `trace_interpreter` feature. Compiles to nothing otherwise.
macro_rules! trace_interpreter {
    ($($arg:tt)*) => ({
        #[cfg(feature = "trace_interpreter")]
        println!("[vm] {}", format_args!($($arg)*));
    });
}

/// Prints the full operand stack after each stack operation, enabled by the
/// `trace_interpreter_stack` feature. Very verbose.
macro_rules! trace_interpreter_stack {
    ($($arg:tt)*) => ({
        #[cfg(feature = "trace_interpreter_stack")]
        println!("[stack] {}", format_args!($($arg)*));
    });
}

pub(crate) use {trace_interpreter, trace_interpreter_stack};
