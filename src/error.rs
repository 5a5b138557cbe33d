use thiserror::Error;

#[derive(Error, Debug)]
pub enum AllocError {
    #[error("address space reservation failed after retry")]
    OutOfAddressSpace,

    #[error("pointer {0:#x} does not belong to any pool")]
    BadPointer(usize),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("all {0} arena slots are occupied")]
    ArenaLimit(usize),

    #[error("no such arena: {0}")]
    UnknownArena(u32),

    #[error("internal metadata arena exhausted")]
    MetadataExhaustion,
}

pub type Result<T> = std::result::Result<T, AllocError>;
