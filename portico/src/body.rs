//! HTTP body utilities.

use bytes::Bytes;
use http_body::Body as HttpBody;
use http_body_util::BodyExt;

/// A type erased, boxed HTTP body used by the request pipeline.
pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, crate::BoxError>;

/// Convert an HTTP body into a [`BoxBody`].
pub fn boxed<B>(body: B) -> BoxBody
where
    B: HttpBody<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<crate::BoxError>,
{
    body.map_err(Into::into).boxed()
}

/// Create an empty [`BoxBody`].
pub fn empty() -> BoxBody {
    http_body_util::Empty::new()
        .map_err(|err| match err {})
        .boxed()
}

/// Create a [`BoxBody`] holding a single chunk of data.
pub fn full(data: impl Into<Bytes>) -> BoxBody {
    http_body_util::Full::new(data.into())
        .map_err(|err| match err {})
        .boxed()
}
