pub mod error;
pub mod lockfile;
pub mod progress;

pub use error::{LockError, UtilError};
pub use lockfile::Lockfile;
pub use progress::Progress;

pub type Result<T> = std::result::Result<T, UtilError>;
