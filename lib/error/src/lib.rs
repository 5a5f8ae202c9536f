//! Unified kernel error codes.
//!
//! Every subsystem declares its errors with [`define_kernel_error!`], which
//! assigns the subsystem a class byte and each variant a code byte. The full
//! 16-bit code (`class << 8 | code`) is stable across builds and shows up in
//! log output, so a bare hex code in a crash report can be traced back to
//! the failing subsystem without symbols.

#![no_std]

/// Define a kernel error enum with a subsystem class code.
///
/// ```
/// use aos_error::define_kernel_error;
///
/// define_kernel_error! {
///     /// Example subsystem errors.
///     pub enum DemoError(0x7f) {
///         /// Something was exhausted
///         Exhausted = 0x01 => "resource exhausted",
///         /// Caller passed garbage
///         BadInput = 0x02 => "invalid input",
///     }
/// }
///
/// assert_eq!(DemoError::Exhausted.code(), 0x7f01);
/// assert_eq!(DemoError::BadInput.message(), "invalid input");
/// ```
#[macro_export]
macro_rules! define_kernel_error {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident($class:literal) {
            $(
                $(#[$vmeta:meta])*
                $variant:ident = $code:literal => $msg:literal
            ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u16)]
        $vis enum $name {
            $(
                $(#[$vmeta])*
                $variant = (($class as u16) << 8) | ($code as u16),
            )+
        }

        impl $name {
            /// Full 16-bit error code; subsystem class in the high byte.
            #[must_use]
            pub const fn code(self) -> u16 {
                self as u16
            }

            /// Subsystem class byte this error belongs to.
            #[must_use]
            pub const fn class(self) -> u8 {
                $class
            }

            /// Human-readable description.
            #[must_use]
            pub const fn message(self) -> &'static str {
                match self {
                    $(Self::$variant => $msg,)+
                }
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "[{:#06x}] {}", self.code(), self.message())
            }
        }
    };
}
