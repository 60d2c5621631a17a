use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no free sectors left on the file-system device")]
    DiskFull,
    #[error("swap device is full")]
    SwapFull,
    #[error("no such file or directory")]
    NotFound,
    #[error("path component is not a directory")]
    NotDir,
    #[error("directory not empty")]
    NotEmpty,
    #[error("name already exists")]
    Exists,
    #[error("file name too long")]
    NameTooLong,
    #[error("invalid path")]
    InvalidPath,
    #[error("bad file descriptor")]
    BadFd,
    #[error("bad mapping request")]
    BadMap,
    #[error("user address fault at {0:#x}")]
    Fault(usize),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
