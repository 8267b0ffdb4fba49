use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error(core::ffi::c_int);

impl Error {
    #[inline]
    pub fn as_isize(self) -> isize {
        self.0 as isize
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(errno::error_info(self.as_isize()))
    }
}

pub type KResult<T = isize> = core::result::Result<T, Error>;

pub mod errno {
    macro_rules! declare_errno {
        ($($name:tt, $errno:literal, $desc:literal,)*) => {
            $(#[doc = $desc]
            pub const $name: super::Error = super::Error($errno);)*
            pub fn error_info(errno: isize) -> &'static str {
                match errno {
                    $($errno => ::core::concat!(stringify!($name), ", ", $desc),)*
                    _ => "Unknown error",
                }
            }
        };
    }

    #[rustfmt::skip]
    declare_errno!(
        EPERM,          -1,     "Operation not permitted.",
        EIO,            -5,     "I/O error.",
        ENXIO,          -6,     "No such device or address.",
        EAGAIN,         -11,    "Try again.",
        ENOMEM,         -12,    "Out of memory",
        EFAULT,         -14,    "Bad address.",
        EBUSY,          -16,    "Device or resource busy.",
        ENODEV,         -19,    "No such device.",
        EINVAL,         -22,    "Invalid argument.",
        ERANGE,         -34,    "Exceed range.",
    );
}

#[cfg(test)]
mod tests {
    use super::errno;

    #[test]
    fn error_info_names_the_errno() {
        assert_eq!(errno::EIO.as_isize(), -5);
        assert_eq!(errno::error_info(-5), "EIO, I/O error.");
        assert_eq!(errno::error_info(-19), "ENODEV, No such device.");
        assert_eq!(errno::error_info(42), "Unknown error");
    }

    #[test]
    fn display_uses_error_info() {
        assert_eq!(errno::ENOMEM.to_string(), "ENOMEM, Out of memory");
    }
}
