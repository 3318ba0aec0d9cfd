use crate::command::CommandError;

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("list links: {0}")]
    ListLinks(nix::Error),

    #[error("bring {link} up: {source}")]
    LinkUp {
        link: String,
        source: std::io::Error,
    },

    #[error("no link with broadcast and multicast capability")]
    NoSuitableLink,

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("no lease obtained on {0}")]
    NoLease(String),

    #[error("invalid lease: {0}")]
    InvalidLease(String),

    #[error("update resolv.conf: {0}")]
    ResolvConf(std::io::Error),

    #[error("locate own executable for the dhcp hook: {0}")]
    HookPath(std::io::Error),
}

pub type Result<T> = std::result::Result<T, NetworkError>;
