//! # Invariant Macros
//!
//! Programming-error checks shared by the state machine core.

/// Assert a caller invariant.
///
/// Debug builds panic so the violation surfaces in tests. Release builds emit an
/// error trace and let the surrounding code take its no-op path.
///
/// ```rust
/// use ra_core::invariant;
///
/// fn consume(consumed: &mut bool) {
///     if !invariant!(!*consumed, "queue consumed twice") {
///         return;
///     }
///     *consumed = true;
/// }
///
/// let mut consumed = false;
/// consume(&mut consumed);
/// assert!(consumed);
/// ```
#[macro_export]
macro_rules! invariant {
    ($cond:expr, $($arg:tt)+) => {{
        let holds: bool = $cond;
        if !holds {
            $crate::macros::invariant_violated(::std::format_args!($($arg)+));
        }
        holds
    }};
}

#[doc(hidden)]
#[track_caller]
pub fn invariant_violated(message: std::fmt::Arguments<'_>) {
    let location = std::panic::Location::caller();
    if cfg!(debug_assertions) {
        panic!("invariant violated at {location}: {message}");
    }
    tracing::error!(
        location = %location,
        message = %message,
        "🚨 INVARIANT: violated, continuing with no-op"
    );
}
