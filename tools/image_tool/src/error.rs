use std::fmt::{self, Display, Formatter};

pub enum File {
    Input,
    Output,
    Key,
    Recipient,
}

impl Display for File {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        use File::*;
        match self {
            Input => write!(f, "input"),
            Output => write!(f, "output"),
            Key => write!(f, "signing key"),
            Recipient => write!(f, "recipient key"),
        }
    }
}

pub enum Error {
    FileReadFailed(File),
    FileWriteFailed(File),
    KeyParseFailed(File),
    BadArgument(&'static str, String),
    RandomnessUnavailable,
    Build(swapstone_lib::error::Error),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        use Error::*;
        match self {
            FileReadFailed(file) => write!(f, "Failed to read {} file.", file),
            FileWriteFailed(file) => write!(f, "Failed to write {} file.", file),
            KeyParseFailed(file) => write!(f, "Failed to parse the {}.", file),
            BadArgument(name, value) => write!(f, "Invalid {}: '{}'.", name, value),
            RandomnessUnavailable => write!(f, "No source of randomness for the image key."),
            Build(e) => write!(f, "Failed to build the image ({}).", e),
        }
    }
}
