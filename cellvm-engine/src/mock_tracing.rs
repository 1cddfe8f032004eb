// Stand-ins for the `tracing` macros used by this crate when the `tracing`
// feature is disabled. Every form expands to nothing.

#[allow(unused_macros)]
macro_rules! trace {
    ($($arg:tt)*) => {};
}

#[allow(unused_macros)]
macro_rules! debug {
    ($($arg:tt)*) => {};
}

#[allow(unused_macros)]
macro_rules! info {
    ($($arg:tt)*) => {};
}

#[allow(unused_macros)]
macro_rules! warn {
    ($($arg:tt)*) => {};
}
