//! Error reporting helpers.
//!
//! Errors in ferret are nested `thiserror` enums. The `Display` impl of each
//! level only describes that level, so logging has to walk the `source()`
//! chain to be useful.

use std::{
    error::Error,
    fmt::Display,
    panic::Location,
};

/// Displays an error followed by all its sources, separated by `; `.
pub struct DisplayErrorChain<'e, E: ?Sized>(&'e E);

impl<'e, E: Error> Display for DisplayErrorChain<'e, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut e: &dyn Error = &self.0;
        write!(f, "{e}")?;
        while let Some(source) = e.source() {
            e = source;
            write!(f, "; {e}")?;
        }
        Ok(())
    }
}

pub trait ErrorExt: std::error::Error {
    #[inline]
    fn display_chain(&self) -> DisplayErrorChain<Self> {
        DisplayErrorChain(self)
    }
}

impl<E: Error> ErrorExt for E {}

pub trait ResultExt {
    /// Logs the error chain at `ERROR` level, with the caller's location.
    fn log_error(self) -> Self;

    /// Like [`ResultExt::log_error`], but prefixes the message.
    fn log_error_with_message(self, message: &str) -> Self;

    /// Logs the error chain at `DEBUG` level. Used for errors that are part of
    /// normal operation, like peers hanging up.
    fn log_debug(self) -> Self;
}

impl<T, E: Error> ResultExt for Result<T, E> {
    #[inline]
    #[track_caller]
    fn log_error(self) -> Self {
        let location = Location::caller();
        if let Err(e) = &self {
            tracing::error!(
                file = make_relative(location.file()),
                line = location.line(),
                "{}",
                e.display_chain()
            );
        }
        self
    }

    #[inline]
    #[track_caller]
    fn log_error_with_message(self, message: &str) -> Self {
        let location = Location::caller();
        if let Err(e) = &self {
            tracing::error!(
                file = make_relative(location.file()),
                line = location.line(),
                "{message}: {}",
                e.display_chain()
            );
        }
        self
    }

    #[inline]
    #[track_caller]
    fn log_debug(self) -> Self {
        let location = Location::caller();
        if let Err(e) = &self {
            tracing::debug!(
                file = make_relative(location.file()),
                line = location.line(),
                "{}",
                e.display_chain()
            );
        }
        self
    }
}

fn make_relative(path: &str) -> &str {
    static DIR: Option<&'static str> = option_env!("CARGO_RUSTC_CURRENT_DIR");
    DIR.and_then(|dir| {
        path.strip_prefix(dir).map(|path| {
            path.strip_prefix(std::path::MAIN_SEPARATOR_STR)
                .unwrap_or(path)
        })
    })
    .unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::ErrorExt;

    #[derive(Debug, thiserror::Error)]
    enum Outer {
        #[error("outer failed")]
        Io(#[from] std::io::Error),
    }

    #[test]
    fn it_displays_the_whole_chain() {
        let error = Outer::from(std::io::Error::other("inner failed"));
        assert_eq!(
            error.display_chain().to_string(),
            "outer failed; inner failed"
        );
    }
}
