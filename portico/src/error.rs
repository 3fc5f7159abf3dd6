use std::{error, fmt};

use crate::BoxError;

/// Errors that originate from configuring or running an endpoint.
pub struct Error {
    kind: Kind,
    source: Option<BoxError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    InvalidConfig,
    Bind,
    #[cfg(feature = "tls")]
    Tls,
    Runtime,
}

impl Error {
    pub(crate) fn new(kind: Kind) -> Self {
        Self { kind, source: None }
    }

    pub(crate) fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub(crate) fn invalid_config(message: &'static str) -> Self {
        Self::new(Kind::InvalidConfig).with_source(message)
    }

    pub(crate) fn bind(source: impl Into<BoxError>) -> Self {
        Self::new(Kind::Bind).with_source(source)
    }

    #[cfg(feature = "tls")]
    pub(crate) fn tls(source: impl Into<BoxError>) -> Self {
        Self::new(Kind::Tls).with_source(source)
    }

    pub(crate) fn runtime(source: impl Into<BoxError>) -> Self {
        Self::new(Kind::Runtime).with_source(source)
    }

    fn description(&self) -> &'static str {
        match self.kind {
            Kind::InvalidConfig => "invalid endpoint configuration",
            Kind::Bind => "error binding listening socket",
            #[cfg(feature = "tls")]
            Kind::Tls => "error configuring TLS",
            Kind::Runtime => "endpoint runtime error",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("portico::Error").field(&self.kind).finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|source| &**source as &(dyn error::Error + 'static))
    }
}
