// Debug logging for the analysis passes.
//
// In debug builds the output goes to stderr, but only when RUSTY_BORROWCK_DEBUG
// is set in the environment. Release builds compile every call away.

#[cfg(debug_assertions)]
pub static DEBUG_ENABLED: once_cell::sync::Lazy<bool> = once_cell::sync::Lazy::new(|| {
    std::env::var_os("RUSTY_BORROWCK_DEBUG").is_some_and(|v| !v.is_empty() && v != "0")
});

#[macro_export]
#[cfg(debug_assertions)]
macro_rules! debug_println {
    ($($arg:tt)*) => {
        if *$crate::debug_macros::DEBUG_ENABLED {
            eprintln!($($arg)*);
        }
    };
}

#[macro_export]
#[cfg(not(debug_assertions))]
macro_rules! debug_println {
    ($($arg:tt)*) => {};
}
