//! Device transport
//!
//! The [`Transport`] trait is the only place requests leave the process.
//! [`HttpTransport`] is the production implementation; tests use the
//! scripted transport in `mock`.

pub mod http;
#[cfg(test)]
pub mod mock;
pub mod traits;

pub use http::HttpTransport;
pub use traits::{Method, RequestTimeouts, Transport};

/// Percent-encode a value used as a single URL path segment
pub fn encode_segment(segment: &str) -> String {
    urlencoding::encode(segment).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_segment() {
        assert_eq!(encode_segment("Default//Mixer/0"), "Default%2F%2FMixer%2F0");
        assert_eq!(encode_segment("Camera Node"), "Camera%20Node");
        assert_eq!(encode_segment("plain"), "plain");
    }
}
