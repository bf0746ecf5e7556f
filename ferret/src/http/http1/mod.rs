//! HTTP/1.x: parsing, body framing and the layer that proxies requests.

pub mod assemble;
pub mod layer;
pub mod parse;
pub mod reader;

pub use self::layer::{
    Http1Layer,
    Http1Mode,
};
