// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

use clap::Parser;
use figment::{
    Figment,
    providers::{Format, Serialized, Yaml},
};
use mudgate_game::args::Args;
use mudgate_game::{EchoDispatcher, LinkServer, run_dispatcher};
use tokio::net::TcpListener;
use tokio::select;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), eyre::Error> {
    color_eyre::install()?;
    let cli_args = Args::parse();
    let config_file = cli_args.config_file.clone();
    let mut args_figment = Figment::new().merge(Serialized::defaults(cli_args));
    if let Some(config_file) = config_file {
        args_figment = args_figment.merge(Yaml::file(config_file));
    }
    let args = match args_figment.extract::<Args>() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("Invalid configuration: {e}");
            std::process::exit(2);
        }
    };

    link_common::tracing::init_tracing(args.debug).unwrap_or_else(|e| {
        eprintln!("Unable to configure logging: {e}");
        std::process::exit(1);
    });

    let mut hup_signal = match signal(SignalKind::hangup()) {
        Ok(signal) => signal,
        Err(e) => {
            error!("Unable to register HUP signal handler: {}", e);
            std::process::exit(1);
        }
    };
    let mut stop_signal = match signal(SignalKind::interrupt()) {
        Ok(signal) => signal,
        Err(e) => {
            error!("Unable to register STOP signal handler: {}", e);
            std::process::exit(1);
        }
    };

    let listener = match TcpListener::bind(&args.link_address).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(address = %args.link_address, "Unable to bind link listener: {}", e);
            std::process::exit(1);
        }
    };

    let (link, incoming) = LinkServer::new(args.server_config());
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let serve_link = link.clone();
    let server_task = tokio::spawn(async move { serve_link.serve(listener, shutdown_rx).await });
    let dispatcher_task = tokio::spawn(run_dispatcher(
        link.clone(),
        incoming,
        EchoDispatcher::new(),
    ));

    select! {
        _ = hup_signal.recv() => {
            info!("HUP received, stopping...");
        },
        _ = stop_signal.recv() => {
            info!("STOP received, stopping...");
        },
    }
    let _ = shutdown_tx.send(true);
    match server_task.await {
        Ok(Err(e)) => error!("Link server exited with error: {}", e),
        Err(e) => error!("Link server task failed: {}", e),
        Ok(Ok(())) => {}
    }
    dispatcher_task.abort();
    info!("Done.");

    Ok(())
}
