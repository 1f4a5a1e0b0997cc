/// Error kinds for the host-kernel integration core.
///
/// `Kernel` and `NotFound` are recoverable per-mutation failures that a
/// caller may log and continue past; `Invalid` marks a dropped malformed
/// event; `Fatal` means the process cannot make progress and should exit.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("netlink error: {0}")]
    Netlink(#[from] rtnetlink::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    Invalid(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

/// Kernel errno for "no such file or directory", returned by the kernel
/// when a delete races a link removal that already purged the object.
const ENOENT: i32 = 2;
/// Kernel errno for "no such device", used by some rule/route deletes.
const ENODEV: i32 = 19;

impl Error {
    /// True for a delete-time "not found" condition, which callers downgrade
    /// to a warning rather than treating as sweep-aborting.
    pub fn is_not_found(&self) -> bool {
        if matches!(self, Error::NotFound(_)) {
            return true;
        }
        let Error::Netlink(rtnetlink::Error::NetlinkError(msg)) = self else {
            return false;
        };
        matches!(msg.code, Some(code) if code.get() == -ENOENT || code.get() == -ENODEV)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
