use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("not an encoded message")]
    NotEncoded,

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("malformed fragment: {0}")]
    MalformedFragment(String),

    #[error("max message size {0} leaves no room for fragment payload")]
    FragmentSizeTooSmall(usize),

    #[error("message needs {0} fragments (max 65535)")]
    TooManyFragments(usize),

    #[error("unknown policy: {0}")]
    UnknownPolicy(String),
}
