use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Dbus connection error")]
    DbusError(#[from] zbus::Error),
    #[error("Multiple hosts are not supported")]
    HostExists,
    #[error("item did not reply to the property fetch in time")]
    FetchTimeout,
}

pub type Result<T> = std::result::Result<T, Error>;
