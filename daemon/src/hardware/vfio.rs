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

//! VFIO plumbing for cards bound to `vfio-pci`.
//!
//! A [`VfioContainer`] holds a type 1 IOMMU container with the card's IOMMU group attached. It is
//! the [`IommuMapping`] DMA buffers are mapped through, so the bus addresses the pool publishes
//! are IOVAs the card can reach. A [`VfioDevice`] routes the card's MSI onto an eventfd.
//!
//! The register BAR is still mapped from the sysfs `resourceN` file, which stays usable while the
//! card is bound to `vfio-pci`.

use crate::error::SlotdError;
use crate::hardware::dma::IommuMapping;
use crate::system_io::{fs_open_rw, fs_read_link};
use log::{debug, info};
use rustix::event::{EventfdFlags, eventfd};
use std::ffi::CString;
use std::fs::File;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const VFIO_CONTAINER_PATH: &str = "/dev/vfio/vfio";

/// `_IO(';', 100 + n)` request numbers and flag values from `linux/vfio.h`.
mod ioctls {
    use std::os::raw::c_ulong;

    const fn io(nr: u8) -> c_ulong {
        ((b';' as c_ulong) << 8) | (100 + nr as c_ulong)
    }

    pub const VFIO_GET_API_VERSION: c_ulong = io(0);
    pub const VFIO_CHECK_EXTENSION: c_ulong = io(1);
    pub const VFIO_SET_IOMMU: c_ulong = io(2);
    pub const VFIO_GROUP_GET_STATUS: c_ulong = io(3);
    pub const VFIO_GROUP_SET_CONTAINER: c_ulong = io(4);
    pub const VFIO_GROUP_GET_DEVICE_FD: c_ulong = io(6);
    pub const VFIO_DEVICE_SET_IRQS: c_ulong = io(10);
    pub const VFIO_IOMMU_MAP_DMA: c_ulong = io(13);
    pub const VFIO_IOMMU_UNMAP_DMA: c_ulong = io(14);

    pub const VFIO_API_VERSION: i32 = 0;
    pub const VFIO_TYPE1V2_IOMMU: u32 = 3;
    pub const VFIO_GROUP_FLAGS_VIABLE: u32 = 1 << 0;
    pub const VFIO_DMA_MAP_FLAG_READ: u32 = 1 << 0;
    pub const VFIO_DMA_MAP_FLAG_WRITE: u32 = 1 << 1;
    pub const VFIO_IRQ_SET_DATA_EVENTFD: u32 = 1 << 2;
    pub const VFIO_IRQ_SET_ACTION_TRIGGER: u32 = 1 << 5;
    pub const VFIO_PCI_MSI_IRQ_INDEX: u32 = 1;
}

#[repr(C)]
#[derive(Debug, Default)]
struct VfioGroupStatus {
    argsz: u32,
    flags: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
struct VfioDmaMap {
    argsz: u32,
    flags: u32,
    vaddr: u64,
    iova: u64,
    size: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
struct VfioDmaUnmap {
    argsz: u32,
    flags: u32,
    iova: u64,
    size: u64,
}

/// `struct vfio_irq_set` carrying a single eventfd.
#[repr(C)]
#[derive(Debug, Default)]
struct VfioIrqSetEventfd {
    argsz: u32,
    flags: u32,
    index: u32,
    start: u32,
    count: u32,
    fd: i32,
}

fn argsz<T>() -> u32 {
    std::mem::size_of::<T>() as u32
}

fn last_os_error(what: impl Into<String>) -> SlotdError {
    SlotdError::Vfio {
        what: what.into(),
        e: std::io::Error::last_os_error(),
    }
}

/// The PCI device directory a sysfs `resourceN` file lives in.
pub fn pci_device_dir(resource: &Path) -> Result<&Path, SlotdError> {
    resource
        .parent()
        .filter(|dir| dir.file_name().is_some())
        .ok_or_else(|| {
            SlotdError::InvalidArgument(format!("{resource:?} is not inside a PCI device directory"))
        })
}

/// The PCI address of a device directory, e.g. `0000:3b:00.0`.
pub fn pci_address(device_dir: &Path) -> Result<String, SlotdError> {
    device_dir
        .file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| SlotdError::InvalidArgument(format!("{device_dir:?} has no PCI address")))
}

/// The number of the IOMMU group a PCI device belongs to.
pub fn iommu_group(device_dir: &Path) -> Result<u32, SlotdError> {
    let link = fs_read_link(&device_dir.join("iommu_group"))?;
    link.file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.parse::<u32>().ok())
        .ok_or_else(|| {
            SlotdError::InvalidArgument(format!(
                "{device_dir:?} has a malformed iommu_group link {link:?}"
            ))
        })
}

/// A type 1 IOMMU container with one group attached.
#[derive(Debug)]
pub struct VfioContainer {
    container: File,
    group: File,
    group_id: u32,
}

impl VfioContainer {
    /// Attach the IOMMU group of the PCI device in `device_dir` to a new container.
    ///
    /// # Returns: `Result<Arc<VfioContainer>, SlotdError>`
    /// * `Err(SlotdError::IORead)` - no IOMMU group, or the VFIO nodes cannot be opened
    /// * `Err(SlotdError::Unsupported)` - the kernel lacks the type 1 v2 IOMMU
    /// * `Err(SlotdError::Vfio)` - the group is not viable or could not be attached
    pub fn open(device_dir: &Path) -> Result<Arc<VfioContainer>, SlotdError> {
        let group_id = iommu_group(device_dir)?;
        let container = fs_open_rw(Path::new(VFIO_CONTAINER_PATH))?;

        // SAFETY: _IO request without an argument on the container fd opened above.
        let version =
            unsafe { libc::ioctl(container.as_raw_fd(), ioctls::VFIO_GET_API_VERSION as _) };
        if version != ioctls::VFIO_API_VERSION {
            return Err(SlotdError::Unsupported(format!(
                "VFIO API version {version}"
            )));
        }
        // SAFETY: the argument is an extension id passed by value.
        let has_type1 = unsafe {
            libc::ioctl(
                container.as_raw_fd(),
                ioctls::VFIO_CHECK_EXTENSION as _,
                ioctls::VFIO_TYPE1V2_IOMMU,
            )
        };
        if has_type1 != 1 {
            return Err(SlotdError::Unsupported(
                "the kernel has no VFIO type 1 v2 IOMMU".to_string(),
            ));
        }

        let group_path = PathBuf::from(format!("/dev/vfio/{group_id}"));
        let group = fs_open_rw(&group_path)?;
        let mut status = VfioGroupStatus {
            argsz: argsz::<VfioGroupStatus>(),
            flags: 0,
        };
        // SAFETY: the kernel fills `status`, which has the layout of struct vfio_group_status.
        let ret = unsafe {
            libc::ioctl(
                group.as_raw_fd(),
                ioctls::VFIO_GROUP_GET_STATUS as _,
                &raw mut status,
            )
        };
        if ret < 0 {
            return Err(last_os_error(format!("status of IOMMU group {group_id}")));
        }
        if status.flags & ioctls::VFIO_GROUP_FLAGS_VIABLE == 0 {
            return Err(SlotdError::Vfio {
                what: format!("IOMMU group {group_id}"),
                e: std::io::Error::other("not viable, bind every device in it to vfio-pci"),
            });
        }

        let container_fd = container.as_raw_fd();
        // SAFETY: the argument points at the container fd, which outlives the call.
        let ret = unsafe {
            libc::ioctl(
                group.as_raw_fd(),
                ioctls::VFIO_GROUP_SET_CONTAINER as _,
                &raw const container_fd,
            )
        };
        if ret < 0 {
            return Err(last_os_error(format!("attaching IOMMU group {group_id}")));
        }
        // SAFETY: the argument is the IOMMU type passed by value.
        let ret = unsafe {
            libc::ioctl(
                container.as_raw_fd(),
                ioctls::VFIO_SET_IOMMU as _,
                ioctls::VFIO_TYPE1V2_IOMMU,
            )
        };
        if ret < 0 {
            return Err(last_os_error("selecting the type 1 v2 IOMMU"));
        }

        info!("IOMMU group {group_id} of {device_dir:?} attached to a VFIO container");
        Ok(Arc::new(VfioContainer {
            container,
            group,
            group_id,
        }))
    }

    pub fn group_id(&self) -> u32 {
        self.group_id
    }

    /// Open the VFIO device for the PCI device at `pci_address`.
    pub fn device(&self, pci_address: &str) -> Result<VfioDevice, SlotdError> {
        let name = CString::new(pci_address).map_err(|_| {
            SlotdError::InvalidArgument(format!("{pci_address:?} is not a PCI address"))
        })?;
        // SAFETY: the argument is a NUL terminated string that outlives the call.
        let fd = unsafe {
            libc::ioctl(
                self.group.as_raw_fd(),
                ioctls::VFIO_GROUP_GET_DEVICE_FD as _,
                name.as_ptr(),
            )
        };
        if fd < 0 {
            return Err(last_os_error(format!("opening VFIO device {pci_address}")));
        }
        // SAFETY: the kernel returned a new fd that nothing else owns.
        let file = unsafe { File::from_raw_fd(fd) };
        Ok(VfioDevice {
            file,
            pci_address: pci_address.to_string(),
        })
    }
}

impl IommuMapping for VfioContainer {
    fn map(&self, vaddr: u64, iova: u64, len: u64) -> Result<(), SlotdError> {
        let map = VfioDmaMap {
            argsz: argsz::<VfioDmaMap>(),
            flags: ioctls::VFIO_DMA_MAP_FLAG_READ | ioctls::VFIO_DMA_MAP_FLAG_WRITE,
            vaddr,
            iova,
            size: len,
        };
        // SAFETY: `map` has the layout of struct vfio_iommu_type1_dma_map and describes memory
        // this process has mapped for at least `len` bytes.
        let ret = unsafe {
            libc::ioctl(
                self.container.as_raw_fd(),
                ioctls::VFIO_IOMMU_MAP_DMA as _,
                &raw const map,
            )
        };
        if ret < 0 {
            return Err(last_os_error(format!("mapping {len:#x} bytes at IOVA {iova:#x}")));
        }
        debug!("Mapped {len:#x} bytes at IOVA {iova:#x} in group {}", self.group_id);
        Ok(())
    }

    fn unmap(&self, iova: u64, len: u64) -> Result<(), SlotdError> {
        let unmap = VfioDmaUnmap {
            argsz: argsz::<VfioDmaUnmap>(),
            flags: 0,
            iova,
            size: len,
        };
        // SAFETY: `unmap` has the layout of struct vfio_iommu_type1_dma_unmap.
        let ret = unsafe {
            libc::ioctl(
                self.container.as_raw_fd(),
                ioctls::VFIO_IOMMU_UNMAP_DMA as _,
                &raw const unmap,
            )
        };
        if ret < 0 {
            return Err(last_os_error(format!("unmapping IOVA {iova:#x}")));
        }
        Ok(())
    }
}

/// An open VFIO device.
#[derive(Debug)]
pub struct VfioDevice {
    file: File,
    pci_address: String,
}

impl VfioDevice {
    /// Route MSI vector 0 to a new eventfd.
    ///
    /// Each read of the eventfd returns the number of interrupts since the previous read.
    pub fn msi_eventfd(&self) -> Result<OwnedFd, SlotdError> {
        let event = eventfd(0, EventfdFlags::CLOEXEC).map_err(|e| SlotdError::Vfio {
            what: "creating an interrupt eventfd".to_string(),
            e: e.into(),
        })?;
        let irq_set = VfioIrqSetEventfd {
            argsz: argsz::<VfioIrqSetEventfd>(),
            flags: ioctls::VFIO_IRQ_SET_DATA_EVENTFD | ioctls::VFIO_IRQ_SET_ACTION_TRIGGER,
            index: ioctls::VFIO_PCI_MSI_IRQ_INDEX,
            start: 0,
            count: 1,
            fd: event.as_raw_fd(),
        };
        // SAFETY: `irq_set` is a struct vfio_irq_set followed by exactly `count` eventfds.
        let ret = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                ioctls::VFIO_DEVICE_SET_IRQS as _,
                &raw const irq_set,
            )
        };
        if ret < 0 {
            return Err(last_os_error(format!("enabling MSI on {}", self.pci_address)));
        }
        info!("MSI of {} routed to an eventfd", self.pci_address);
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use googletest::prelude::*;
    use rstest::*;

    #[gtest]
    #[rstest]
    #[case::get_api_version(ioctls::VFIO_GET_API_VERSION, 0x3b64)]
    #[case::set_iommu(ioctls::VFIO_SET_IOMMU, 0x3b66)]
    #[case::set_irqs(ioctls::VFIO_DEVICE_SET_IRQS, 0x3b6e)]
    #[case::map_dma(ioctls::VFIO_IOMMU_MAP_DMA, 0x3b71)]
    #[case::unmap_dma(ioctls::VFIO_IOMMU_UNMAP_DMA, 0x3b72)]
    fn request_numbers(#[case] request: std::os::raw::c_ulong, #[case] expected: u64) {
        expect_that!(request as u64, eq(expected));
    }

    #[gtest]
    fn argument_layouts_match_the_kernel() {
        expect_that!(argsz::<VfioGroupStatus>(), eq(8));
        expect_that!(argsz::<VfioDmaMap>(), eq(32));
        expect_that!(argsz::<VfioDmaUnmap>(), eq(24));
        expect_that!(argsz::<VfioIrqSetEventfd>(), eq(24));
    }

    #[gtest]
    fn device_paths_come_from_the_resource_file() {
        let resource = Path::new("/sys/bus/pci/devices/0000:3b:00.0/resource0");
        let dir = pci_device_dir(resource).expect("device dir");
        expect_that!(dir, eq(Path::new("/sys/bus/pci/devices/0000:3b:00.0")));
        expect_that!(pci_address(dir), ok(eq("0000:3b:00.0")));
        expect_that!(
            pci_device_dir(Path::new("/resource0")).map(|_| ()),
            err(displays_as(contains_substring("SlotdError::InvalidArgument")))
        );
    }

    #[gtest]
    fn iommu_group_is_read_from_the_sysfs_link() {
        let dir = std::env::temp_dir().join(format!("slotd-{}-pci", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).expect("scratch dir");
        expect_that!(
            iommu_group(&dir),
            err(displays_as(contains_substring("SlotdError::IORead")))
        );
        std::os::unix::fs::symlink("../../../kernel/iommu_groups/17", dir.join("iommu_group"))
            .expect("link");
        expect_that!(iommu_group(&dir), ok(eq(&17)));
        let _ = std::fs::remove_dir_all(dir);
    }
}
