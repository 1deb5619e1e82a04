// This file is part of slotd, an application to share the DMA slots of an FPGA accelerator between cooperating processes.
//
// Copyright 2025 Canonical Ltd.
//
// SPDX-License-Identifier: GPL-3.0-only
//
// slotd is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License version 3, as published by the Free Software Foundation.
//
// slotd is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranties of MERCHANTABILITY, SATISFACTORY QUALITY, or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with this program.  If not, see http://www.gnu.org/licenses/.

//! slotd - System service sharing the DMA slots of FPGA accelerators.
//!
//! At startup the daemon:
//! 1. Loads `/etc/slotd/config.toml` (falling back to defaults)
//! 2. Attaches every configured device and starts its interrupt dispatcher
//! 3. Connects to the system DBus and advertises the service
//! 4. Closes the sessions of every client that leaves the bus
//! 5. On SIGTERM or Ctrl-C, closes every session and detaches every device
//!
//! # DBus Service
//!
//! - **Service Name**: `com.canonical.slotd`
//! - **Status Interface**: `/com/canonical/slotd/status` - Devices, attributes and configuration
//! - **Control Interface**: `/com/canonical/slotd/control` - Sessions, slots, events and mappings
//!
//! # Environment Variables
//!
//! - `RUST_LOG` - Controls logging level (`trace`, `debug`, `info`, `warn`, `error`
//!   or `off`). Defaults to `info`

use futures_util::StreamExt;
use log::{error, info, warn};
use slotd::comm::dbus::control_interface::ControlInterface;
use slotd::comm::dbus::status_interface::StatusInterface;
use slotd::comm::dbus::{CONTROL_PATH, SERVICE_NAME, STATUS_PATH};
use slotd::config::{slotd_config, DeviceConfig, DeviceSource};
use slotd::device::DeviceContext;
use slotd::error::SlotdError;
use slotd::hardware::dma::HostDmaAllocator;
use slotd::hardware::vfio::{pci_address, pci_device_dir, VfioContainer, VfioDevice};
use slotd::interrupts::{spawn_dispatcher, spawn_eventfd_listener, spawn_uio_listener};
use slotd::registry::{DeviceHandle, DeviceRegistry};
use slotd::session::ControlService;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use zbus::{connection, fdo, Connection};

/// How long shutdown waits for interrupt listeners blocked in a read.
const LISTENER_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(500);

/// A registered device and the tasks and handles that keep its interrupts flowing.
struct AttachedDevice {
    name: String,
    handle: DeviceHandle,
    dispatcher: JoinHandle<()>,
    /// Closing the VFIO device disables its interrupts, so it outlives the DMA pool.
    vfio: Option<VfioDevice>,
}

/// The allocator for `config`, and the VFIO device when its buffers go through an IOMMU.
fn allocator_for(
    config: &DeviceConfig,
) -> Result<(HostDmaAllocator, Option<VfioDevice>), SlotdError> {
    match &config.source {
        DeviceSource::Resource(resource) => {
            let device_dir = pci_device_dir(resource)?;
            let container = VfioContainer::open(device_dir)?;
            let vfio = container.device(&pci_address(device_dir)?)?;
            info!(
                "{}: DMA through IOMMU group {}",
                config.name,
                container.group_id()
            );
            Ok((HostDmaAllocator::with_iommu(container), Some(vfio)))
        }
        DeviceSource::Simulated => Ok((HostDmaAllocator::new(), None)),
    }
}

fn attach_device(
    registry: &DeviceRegistry,
    config: &DeviceConfig,
) -> Result<AttachedDevice, SlotdError> {
    let settings = slotd_config();
    let (allocator, vfio) = allocator_for(config)?;
    let device = Arc::new(DeviceContext::attach_configured(
        config,
        settings.geometry,
        &allocator,
    )?);
    let (line, dispatcher) = spawn_dispatcher(device.clone());
    if let Some(uio) = &config.uio {
        if let Err(e) = spawn_uio_listener(uio, line) {
            error!("{}: no interrupts will be delivered: {e}", config.name);
        }
    } else if let Some(vfio) = &vfio {
        match vfio.msi_eventfd() {
            Ok(eventfd) => {
                spawn_eventfd_listener(eventfd, config.name.clone(), line);
            }
            Err(e) => error!("{}: no interrupts will be delivered: {e}", config.name),
        }
    } else {
        warn!(
            "{}: no interrupt source configured, completions must be signalled by clients",
            config.name
        );
    }
    let handle = match registry.insert(device) {
        Ok(handle) => handle,
        Err(e) => {
            dispatcher.abort();
            return Err(e);
        }
    };
    info!("{} is device {handle}", config.name);
    Ok(AttachedDevice {
        name: config.name.clone(),
        handle,
        dispatcher,
        vfio,
    })
}

/// Attach every configured device. Devices that fail to attach are logged and skipped.
fn attach_devices(registry: &DeviceRegistry) -> Vec<AttachedDevice> {
    slotd_config()
        .devices
        .iter()
        .filter_map(|config| match attach_device(registry, config) {
            Ok(attached) => Some(attached),
            Err(e) => {
                error!("Cannot attach {}: {e}", config.name);
                None
            }
        })
        .collect()
}

/// Unregister every device, close the remaining sessions and release the DMA pools.
async fn detach_devices(
    registry: &DeviceRegistry,
    service: &ControlService,
    attached: Vec<AttachedDevice>,
) {
    let mut removed = Vec::new();
    for device in &attached {
        match registry.remove(device.handle) {
            Ok(context) => removed.push(context),
            Err(e) => error!("Cannot unregister {}: {e}", device.name),
        }
    }
    if let Err(e) = service.close_all_sessions() {
        error!("Not every session closed cleanly: {e}");
    }
    let mut vfio_devices = Vec::new();
    for device in attached {
        vfio_devices.extend(device.vfio);
        device.dispatcher.abort();
        if let Err(e) = device.dispatcher.await {
            if !e.is_cancelled() {
                error!("Interrupt dispatcher of {} failed: {e}", device.name);
            }
        }
    }
    for context in removed {
        match Arc::try_unwrap(context) {
            Ok(context) => context.detach(),
            Err(context) => warn!(
                "{} is still in use, leaving its DMA pool to the kernel",
                context.config_name()
            ),
        }
    }
    drop(vfio_devices);
}

/// Close the sessions of clients that disconnect from the bus.
async fn watch_departed_clients(
    conn: &Connection,
    service: Arc<ControlService>,
) -> Result<(), Box<dyn Error>> {
    let dbus = fdo::DBusProxy::new(conn).await?;
    let mut changes = dbus.receive_name_owner_changed().await?;
    while let Some(signal) = changes.next().await {
        let args = match signal.args() {
            Ok(args) => args,
            Err(e) => {
                warn!("Ignoring malformed NameOwnerChanged signal: {e}");
                continue;
            }
        };
        if args.new_owner().is_none() {
            if let Err(e) = service.close_sessions_of(args.name().as_str()) {
                error!("Cannot close the sessions of {}: {e}", args.name());
            }
        }
    }
    Ok(())
}

/// Resolve on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Cannot listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };
    let sigterm = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = ctrl_c => {},
        _ = sigterm => {},
    }
}

async fn serve() -> Result<(), Box<dyn Error>> {
    let registry = Arc::new(DeviceRegistry::new());
    let attached = attach_devices(&registry);
    let service = Arc::new(ControlService::new(registry.clone()));

    let status_interface = StatusInterface {
        registry: registry.clone(),
        config: slotd_config(),
    };
    let control_interface = ControlInterface {
        service: service.clone(),
    };

    let conn = connection::Builder::system()?
        .name(SERVICE_NAME)?
        .serve_at(STATUS_PATH, status_interface)?
        .serve_at(CONTROL_PATH, control_interface)?
        .build()
        .await?;

    info!("Started {SERVICE_NAME} dbus service");
    tokio::select! {
        result = watch_departed_clients(&conn, service.clone()) => {
            result?;
            shutdown_signal().await;
        }
        _ = shutdown_signal() => {},
    }

    info!("Shutting down");
    if let Err(e) = conn.release_name(SERVICE_NAME).await {
        warn!("Cannot release {SERVICE_NAME}: {e}");
    }
    detach_devices(&registry, &service, attached).await;
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(serve());
    // Interrupt listeners stay blocked in read until the next interrupt.
    runtime.shutdown_timeout(LISTENER_SHUTDOWN_TIMEOUT);
    result
}
