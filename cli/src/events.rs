use crate::EventSubcommand;
use crate::proxies::control_proxy::ControlProxy;
use crate::status::resolve_device;
use log::{debug, warn};
use zbus::Connection;

/// Runs `op` inside a short-lived session on the device
async fn with_session<F, Fut>(device: &Option<String>, op: F) -> Result<String, zbus::Error>
where
    F: FnOnce(ControlProxy<'static>, u64) -> Fut,
    Fut: Future<Output = Result<String, zbus::Error>>,
{
    let handle = resolve_device(device).await?;
    let connection = Connection::system().await?;
    let proxy = ControlProxy::new(&connection).await?;
    let session = proxy.open_session(handle).await?;
    debug!("opened session {session} on device {handle:#x}");
    let result = op(proxy.clone(), session).await;
    match proxy.close_session(session).await {
        Ok(released) if !released.is_empty() => warn!("session held slots {released:?}"),
        Ok(_) => {}
        Err(e) => warn!("failed to close session {session}: {e}"),
    }
    result
}

/// Argument parser for the slot event commands
pub async fn event_handler(
    device: &Option<String>,
    sub_command: &EventSubcommand,
) -> Result<String, zbus::Error> {
    match *sub_command {
        EventSubcommand::Complete { slot } => {
            with_session(device, |proxy, session| async move {
                proxy.complete_slot_event(session, slot).await?;
                Ok(format!("slot {slot} signalled"))
            })
            .await
        }
        EventSubcommand::Reset { slot } => {
            with_session(device, |proxy, session| async move {
                proxy.reset_slot_event(session, slot).await?;
                Ok(format!("slot {slot} reset"))
            })
            .await
        }
        EventSubcommand::Wait {
            slot,
            timeout_ms,
            poll,
        } => {
            with_session(device, |proxy, session| async move {
                proxy
                    .wait_slot_event(session, slot, timeout_ms, !poll)
                    .await?;
                Ok(format!("slot {slot} is signalled"))
            })
            .await
        }
    }
}
