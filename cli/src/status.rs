use crate::proxies::status_proxy::StatusProxy;
use zbus::Connection;

async fn status_proxy() -> Result<StatusProxy<'static>, zbus::Error> {
    let connection = Connection::system().await?;
    StatusProxy::new(&connection).await
}

/// Resolves `--device` to a handle, defaulting to the first attached device
pub async fn resolve_device(device: &Option<String>) -> Result<u64, zbus::Error> {
    let proxy = status_proxy().await?;
    match device {
        Some(name) => proxy.find_device(name).await,
        None => proxy
            .list_devices()
            .await?
            .first()
            .map(|(handle, _, _)| *handle)
            .ok_or(zbus::Error::Failure(
                "slotd has no attached devices".to_string(),
            )),
    }
}

/// One row per device with its slot usage
pub(crate) fn format_devices(rows: &[(String, String, u32, u32, u32)]) -> String {
    let mut ret_string = String::from(
        "---- DEVICES ----\n\
        | name | endpoint | slots | free | bytes per slot |\n",
    );
    for (name, endpoint, slots, free, bytes) in rows {
        ret_string += format!("| {name} | {endpoint} | {slots} | {free} | {bytes:#x} |\n").as_str();
    }
    ret_string
}

pub(crate) fn format_attributes(attributes: &[(String, String)]) -> String {
    attributes
        .iter()
        .map(|(name, value)| format!("{name}: {value}\n"))
        .collect()
}

pub(crate) fn format_version(version: (u16, u16, u16, u16)) -> String {
    let (product_major, product_minor, build_major, build_minor) = version;
    format!("slotd {product_major}.{product_minor} (build {build_major}.{build_minor})")
}

pub async fn devices_handler() -> Result<String, zbus::Error> {
    let proxy = status_proxy().await?;
    let mut rows = Vec::new();
    for (handle, name, endpoint) in proxy.list_devices().await? {
        let (bytes, slots, free) = proxy.get_slot_geometry(handle).await?;
        rows.push((name, endpoint, slots, free, bytes));
    }
    let mut ret_string = format_devices(&rows);
    for (handle, name, _) in proxy.list_devices().await? {
        let owners = proxy.get_slot_owners(handle).await?;
        if owners.is_empty() {
            continue;
        }
        ret_string += format!("\n---- {name} RESERVED SLOTS ----\n| slot | pid |\n").as_str();
        for (slot, pid) in owners {
            ret_string += format!("| {slot} | {pid} |\n").as_str();
        }
    }
    Ok(ret_string)
}

pub async fn config_handler() -> Result<String, zbus::Error> {
    status_proxy().await?.get_config().await
}

pub async fn version_handler() -> Result<String, zbus::Error> {
    let version = status_proxy().await?.get_driver_version().await?;
    Ok(format_version(version))
}

/// Prints one attribute, or all of them when `name` is `None`
pub async fn attributes_handler(
    device: &Option<String>,
    name: &Option<String>,
) -> Result<String, zbus::Error> {
    let handle = resolve_device(device).await?;
    let proxy = status_proxy().await?;
    match name {
        Some(name) => proxy.get_attribute(handle, name).await,
        None => Ok(format_attributes(&proxy.get_attributes(handle).await?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use googletest::prelude::*;

    #[gtest]
    fn devices_table() {
        let rows = vec![(
            "fpga0".to_string(),
            "42:0:0".to_string(),
            64,
            60,
            0x100000,
        )];
        expect_that!(
            format_devices(&rows),
            eq("---- DEVICES ----\n\
                | name | endpoint | slots | free | bytes per slot |\n\
                | fpga0 | 42:0:0 | 64 | 60 | 0x100000 |\n")
        );
    }

    #[gtest]
    fn attributes_one_per_line() {
        let attributes = vec![
            ("shell_id".to_string(), "0x00ca7a".to_string()),
            ("temperature".to_string(), "45 C".to_string()),
        ];
        expect_that!(
            format_attributes(&attributes),
            eq("shell_id: 0x00ca7a\ntemperature: 45 C\n")
        );
    }

    #[gtest]
    fn version_line() {
        expect_that!(format_version((1, 0, 0, 1)), eq("slotd 1.0 (build 0.1)"));
    }
}
