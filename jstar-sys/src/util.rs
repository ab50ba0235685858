/// Signed offset arithmetic on instruction pointers.
///
/// Jump offsets are relative to the IP *after* the jump instruction has been
/// decoded, so `Jump(-1)` is a no-op and `Jump(-2)` re-executes the jump.
pub trait OffsetAdd {
    fn add_offset(self, offset: i16) -> Self;
}

impl OffsetAdd for usize {
    fn add_offset(self, offset: i16) -> usize {
        (self as i64 + offset as i64) as usize
    }
}

/// Formats a number the way the language prints it: integral values print
/// without a fractional part, everything else uses the shortest decimal
/// representation that round-trips.
pub fn num_to_str(n: f64) -> String {
    if n.is_finite() && n == n.trunc() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

/// `true` if the double holds an exact integer, used by subscript index checks.
pub fn is_int(n: f64) -> bool {
    n.is_finite() && n.trunc() == n
}


#[cfg(test)]
mod test {
    use crate::util::{num_to_str, OffsetAdd};

    #[test] fn test_add_offset_forward() { assert_eq!(7, 4usize.add_offset(3)); }
    #[test] fn test_add_offset_backward() { assert_eq!(2, 4usize.add_offset(-2)); }
    #[test] fn test_num_to_str_integral() { assert_eq!("3", num_to_str(3.0)); }
    #[test] fn test_num_to_str_negative() { assert_eq!("-12", num_to_str(-12.0)); }
    #[test] fn test_num_to_str_zero() { assert_eq!("0", num_to_str(0.0)); }
    #[test] fn test_num_to_str_fractional() { assert_eq!("2.5", num_to_str(2.5)); }
}
