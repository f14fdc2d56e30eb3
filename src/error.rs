use std::{any::Any, error::Error as StdError, fmt};

/// A `Result` alias where the `Err` case is `promise_bridge::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// A boxed error type that can be used for dynamic error handling.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// The failure a promise or future settled with.
///
/// Domain failures created with [`Error::new`] keep the caller's error as their source, so it
/// survives a trip across the bridge and can be downcast back to its original type.
pub struct Error {
    inner: Box<Inner>,
}

struct Inner {
    kind: Kind,
    source: Option<BoxError>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    Failed,
    Disconnected,
    Panicked(String),
    Deadlock,
}

impl Error {
    pub(crate) fn with_kind<E>(kind: Kind, source: Option<E>) -> Error
    where
        E: Into<BoxError>,
    {
        Error {
            inner: Box::new(Inner {
                kind,
                source: source.map(Into::into),
            }),
        }
    }

    /// Wraps a domain failure.
    pub fn new<E: Into<BoxError>>(error: E) -> Error {
        Error::with_kind(Kind::Failed, Some(error))
    }

    pub(crate) fn disconnected(what: &'static str) -> Error {
        Error::with_kind(Kind::Disconnected, Some(what))
    }

    pub(crate) fn panicked(payload: Box<dyn Any + Send + 'static>) -> Error {
        let message = if let Some(message) = payload.downcast_ref::<&'static str>() {
            String::from(*message)
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            String::from("Box<dyn Any>")
        };

        Error::with_kind(Kind::Panicked(message), None::<Error>)
    }

    pub(crate) fn deadlock() -> Error {
        Error::with_kind(Kind::Deadlock, None::<Error>)
    }

    /// Returns true if this is a domain failure created with [`Error::new`].
    pub fn is_failed(&self) -> bool {
        matches!(self.inner.kind, Kind::Failed)
    }

    /// Returns true if the producing side went away without settling.
    pub fn is_disconnected(&self) -> bool {
        matches!(self.inner.kind, Kind::Disconnected)
    }

    /// Returns true if a future panicked while it was being polled.
    pub fn is_panic(&self) -> bool {
        matches!(self.inner.kind, Kind::Panicked(_))
    }

    /// Returns true if an event loop was asked to wait for a promise that can never settle.
    pub fn is_deadlock(&self) -> bool {
        matches!(self.inner.kind, Kind::Deadlock)
    }

    /// Borrows the wrapped domain error, if any.
    pub fn get_ref(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.inner.source.as_deref()
    }

    /// Consumes the error, returning the wrapped domain error, if any.
    pub fn into_inner(self) -> Option<BoxError> {
        self.inner.source
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("promise_bridge::Error");

        builder.field("kind", &self.inner.kind);

        if let Some(ref source) = self.inner.source {
            builder.field("source", source);
        }

        builder.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.kind {
            Kind::Failed => f.write_str("promise failed")?,
            Kind::Disconnected => f.write_str("promise disconnected")?,
            Kind::Panicked(ref message) => write!(f, "future panicked: {}", message)?,
            Kind::Deadlock => f.write_str("promise can never settle")?,
        }

        if let Some(ref source) = self.inner.source {
            write!(f, ": {}", source)?;
        }

        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.source.as_ref().map(|e| &**e as _)
    }
}
