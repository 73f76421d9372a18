//! The three handler kinds (spec §4.6–§4.9), sharing a common boxed body
//! type and the header/status/transform machinery via composition rather
//! than a handler base class (spec §9 "Dynamic dispatch on endpoint kind").

pub mod container;
pub mod mock;
pub mod proxy;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Body as HttpBody;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn boxed<B>(body: B) -> BoxBody
where
    B: HttpBody<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    body.map_err(|e| {
        let err: Box<dyn std::error::Error + Send + Sync> = e.into();
        hyper::Error::new(hyper::error::Kind::BodyWrite, err)
    })
    .boxed()
}

pub fn full_body(bytes: Bytes) -> BoxBody {
    boxed(Full::new(bytes))
}

pub fn empty_body() -> BoxBody {
    boxed(Empty::new())
}
