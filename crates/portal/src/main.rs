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
use link_common::CloseReason;
use mudgate_portal::config::Args;
use mudgate_portal::{
    LinkClient, Listeners, PortalContext, SessionRegistry, TransportSecrets, ssh, tls,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};

const SWEEP_PERIOD: Duration = Duration::from_secs(1);
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

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
    let settings = match args.settings() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Invalid configuration: {e}");
            std::process::exit(2);
        }
    };

    link_common::tracing::init_tracing(args.debug).unwrap_or_else(|e| {
        eprintln!("Unable to configure logging: {e}");
        std::process::exit(1);
    });

    let mut secrets = TransportSecrets::default();
    if let (Some(cert), Some(key)) = (&settings.tls_cert, &settings.tls_key) {
        secrets.tls = match tls::load_acceptor(cert, key) {
            Ok(acceptor) => Some(acceptor),
            Err(e) => {
                error!("Unable to load TLS certificate: {:#}", e);
                std::process::exit(2);
            }
        };
    }
    if let Some(host_key) = &settings.ssh_host_key {
        secrets.ssh = match ssh::load_config(host_key) {
            Ok(config) => Some(config),
            Err(e) => {
                error!("Unable to load SSH host key: {:#}", e);
                std::process::exit(2);
            }
        };
    }

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
    let mut term_signal = match signal(SignalKind::terminate()) {
        Ok(signal) => signal,
        Err(e) => {
            error!("Unable to register TERM signal handler: {}", e);
            std::process::exit(1);
        }
    };

    let registry = Arc::new(SessionRegistry::new(settings.registry.clone()));
    let link = LinkClient::new(settings.link.clone(), registry);
    let ctx = PortalContext::new(
        link.clone(),
        settings.adapter.clone(),
        settings.trusted_proxies.clone(),
    );
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let link_runner = link.clone();
    let link_shutdown = shutdown_rx.clone();
    let mut link_task = tokio::spawn(async move { link_runner.run(link_shutdown).await });

    let sweeper = link.clone();
    let sweeper_shutdown = shutdown_rx.clone();
    let sweeper_task =
        tokio::spawn(async move { sweeper.run_sweeper(SWEEP_PERIOD, sweeper_shutdown).await });

    let (mut listeners_server, listeners_channel, listeners) = Listeners::new(ctx, secrets);
    let listeners_shutdown = shutdown_rx.clone();
    let listeners_task = tokio::spawn(async move {
        listeners_server
            .run(listeners_channel, listeners_shutdown)
            .await;
    });

    let mut bound = 0;
    for (transport, addr) in &settings.listeners {
        match listeners.add_listener(*transport, *addr).await {
            Ok(_) => bound += 1,
            Err(e) => error!("Unable to start {} listener: {}", transport, e),
        }
    }
    if bound == 0 {
        error!("No client listeners could be started");
        std::process::exit(1);
    }

    let mut exit_code = 0;
    select! {
        _ = hup_signal.recv() => {
            info!("HUP received, stopping...");
        },
        _ = stop_signal.recv() => {
            info!("STOP received, stopping...");
        },
        _ = term_signal.recv() => {
            info!("TERM received, stopping...");
        },
        result = &mut link_task => {
            match result {
                Ok(Err(e)) => error!("Link to game abandoned: {}", e),
                Err(e) => error!("Link task failed: {}", e),
                Ok(Ok(())) => {}
            }
            exit_code = 1;
        }
    }

    // Stop accepting before telling the game every session is going away.
    if let Ok(active) = listeners.get_listeners().await {
        for (_, addr) in active {
            let _ = listeners.remove_listener(addr).await;
        }
    }
    let closing = link.close_all(CloseReason::Shutdown);
    if closing > 0 && !link_task.is_finished() {
        info!(sessions = closing, "Waiting for the game to release sessions");
        if !link.wait_drained(SHUTDOWN_DRAIN).await {
            warn!("Game did not release every session before shutdown");
        }
    }
    let _ = shutdown_tx.send(true);
    let _ = listeners_task.await;
    let _ = sweeper_task.await;
    if !link_task.is_finished() {
        let _ = link_task.await;
    }
    info!("Done.");

    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}
