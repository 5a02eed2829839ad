use clap::Parser;

/// Struct that gets generated from `RawOpt`.
#[derive(Debug, PartialEq)]
pub struct Opt {
    pub log_debug: bool,
    pub action: Action,
}

#[derive(Parser, Debug, PartialEq)]
#[command(name = "trayward", version, about)]
struct RawOpt {
    /// Write out debug logs.
    #[arg(long = "debug", global = true)]
    log_debug: bool,

    #[command(subcommand)]
    action: Action,
}

#[derive(clap::Subcommand, Debug, PartialEq)]
pub enum Action {
    /// Run the watcher daemon.
    #[command(name = "daemon", alias = "d")]
    Daemon,

    /// List the items registered with the running watcher.
    #[command(name = "items", alias = "ls")]
    Items,
}

impl Opt {
    pub fn from_env() -> Self {
        RawOpt::parse().into()
    }
}

impl From<RawOpt> for Opt {
    fn from(RawOpt { log_debug, action }: RawOpt) -> Self {
        Opt { log_debug, action }
    }
}
