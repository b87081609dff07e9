//! Process configuration: listen port, admin password, and data directory,
//! each overridable by an environment variable for container deployments.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "imcsd", about = "Internet Mind Control Server: a matchmaking broker for turn-based games")]
pub struct Cli {
    /// TCP port to listen on.
    #[arg(long, env = "IMCS_PORT", default_value_t = 3589)]
    pub port: u16,

    /// Password for the built-in `admin` account, provisioned on boot.
    #[arg(long, env = "IMCS_ADMIN_PASSWORD")]
    pub admin_password: String,

    /// Directory holding the versioned on-disk store (VERSION, private/, log/).
    #[arg(long, env = "IMCS_DATA_DIR", default_value = "imcs-data")]
    pub data_dir: PathBuf,
}
