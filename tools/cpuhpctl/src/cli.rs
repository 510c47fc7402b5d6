// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use cpuhp::admin::ADMIN_SOCKET_PATH;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[arg(short, long, default_value = ADMIN_SOCKET_PATH, help = "cpuhpd administrative socket")]
    pub socket: PathBuf,
    #[arg(long, help = "Print raw JSON responses")]
    pub json: bool,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(about = "Show engine state and cpumasks")]
    Status,
    #[command(about = "List registered clients and their requested masks")]
    Clients,
    #[command(about = "Start arbitrating")]
    Enable,
    #[command(about = "Stop arbitrating, bringing every cpu online first")]
    Disable,
    #[command(about = "Set the cpumask a client wants online")]
    Request {
        #[arg(help = "Client name, e.g. SYSFS")]
        name: String,
        #[arg(help = "Hex cpumask (0xff, ff, all, none)")]
        mask: String,
    },
    #[command(about = "Register a new client")]
    Register {
        name: String,
        #[arg(default_value = "all")]
        mask: String,
    },
    #[command(about = "Unregister a client (accepted, has no effect)")]
    Unregister { name: String },
    #[command(about = "Defer reconciliation until resume")]
    Suspend,
    #[command(about = "Resume and apply deferred requests")]
    Resume,
    #[command(about = "Limit the online cpus to the first N")]
    QosMax { count: usize },
    #[command(about = "Minimum online cpu count (accepted, has no effect)")]
    QosMin { count: usize },
}
