//  Zmirror: ZFS snapshot replication with bookmark-aware planning
//  Copyright (C) 2026  The zmirror authors

//  This program is free software: you can redistribute it and/or modify
//  it under the terms of the GNU General Public License as published by
//  the Free Software Foundation, either version 3 of the License, or
//  (at your option) any later version.

//  This program is distributed in the hope that it will be useful,
//  but WITHOUT ANY WARRANTY; without even the implied warranty of
//  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
//  GNU General Public License for more details.

//  You should have received a copy of the GNU General Public License
//  along with this program.  If not, see <https://www.gnu.org/licenses/>.

use clap::Parser;
use log::{debug, error};
use std::process::exit;
use zmirror::repl::{Context, args::Args, sched};

/// RUST_LOG wins over the flags, as usual with env_logger.
fn default_filter(args: &Args) -> &'static str {
    if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}

fn main() {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter(&args)))
        .format_timestamp(None)
        .format_target(false)
        .init();

    let ctx = match Context::new(args) {
        Ok(ctx) => ctx,
        Err(e) => {
            error!("{e}");
            exit(e.exit_code());
        }
    };

    let code = sched::run(&ctx);
    debug!("exiting with status {code}");
    exit(code);
}
